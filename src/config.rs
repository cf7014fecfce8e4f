//! Process configuration: CLI flags with environment-variable fallbacks,
//! producing the `Environment` surface described in the external-interfaces
//! section of the design.

use std::collections::HashMap;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "fanout-relay-server", about = "Real-time push-notification fan-out server")]
pub struct Config {
    /// Port the HTTP/WebSocket listener binds to.
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// Seconds between keepalive Ping frames on each connection.
    #[arg(long, env = "KEEPALIVE_INTERVAL", default_value_t = 25)]
    pub keepalive_interval: u64,

    /// Reconnect-retry value (seconds) advertised to clients in `connected`.
    #[arg(long, env = "RETRY_TIME", default_value_t = 5)]
    pub retry_time: u64,

    /// Seconds between status-log heartbeats.
    #[arg(long, env = "STATUS_INTERVAL", default_value_t = 60)]
    pub status_interval: u64,

    /// Grace period (ms) shutdown waits for in-flight work before exiting.
    #[arg(long, env = "SHUTDOWN_DELAY_MS", default_value_t = 2000)]
    pub shutdown_delay_ms: u64,

    /// Base URL of the identity service.
    #[arg(long, env = "API_URL")]
    pub api_url: String,

    /// Extra headers sent on every identity-service request, `name=value`
    /// pairs separated by commas.
    #[arg(long, env = "API_REQUEST_HEADERS", value_parser = parse_headers, default_value = "")]
    pub api_request_headers: HashMap<String, String>,

    /// API version advertised to the identity service.
    #[arg(long, env = "API_VERSION", default_value_t = 1)]
    pub api_version: i32,

    /// External topic/queue name the Ingest Source polls.
    #[arg(long, env = "INGEST_TOPIC")]
    pub ingest_topic: String,

    /// Hostname used in logs and (optionally) TLS certificate lookup.
    #[arg(long, env = "HOSTNAME", default_value = "localhost")]
    pub hostname: String,

    /// Serve over TLS.
    #[arg(long, env = "HTTPS", default_value_t = false)]
    pub https: bool,

    /// Path to the TLS certificate bundle, required when `https` is set.
    #[arg(long, env = "CERT_PATH")]
    pub cert_path: Option<String>,

    /// Trust the PROXY protocol header on incoming connections.
    #[arg(long, env = "PROXY_PROTOCOL", default_value_t = false)]
    pub proxy_protocol: bool,

    /// Relaxes error-message redaction and lowers default log verbosity.
    #[arg(long, env = "DEV", default_value_t = false)]
    pub dev: bool,
}

fn parse_headers(raw: &str) -> Result<HashMap<String, String>, String> {
    let mut headers = HashMap::new();
    for pair in raw.split(',').filter(|p| !p.is_empty()) {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("malformed header pair: {pair}"))?;
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}
