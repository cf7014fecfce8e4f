use clap::Parser;
use fanout_relay::{Config, Supervisor};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // axum-server's rustls TLS path panics at first handshake without a
    // process-wide crypto provider installed; do it once, up front.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = Config::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if config.dev { "debug" } else { "info" })
    });
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.dev {
        subscriber.pretty().init();
    } else {
        subscriber.json().init();
    }

    Supervisor::new(config).run().await
}
