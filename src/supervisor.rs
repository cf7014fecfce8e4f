//! Process lifecycle: boot order, signal handling, shutdown sequencing.
//!
//! Shutdown coordination runs through one shared `CancellationToken`
//! observed by the transport acceptor, the ingest loop, and the status
//! timer; `run()` returns only once all three have wound down or the grace
//! period elapses, whichever comes first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::identity_resolver::{HttpIdentityResolver, IdentityResolver};
use crate::ingest::{HttpIngestSource, IngestSource};
use crate::ingest_dispatcher::IngestDispatcher;
use crate::metrics::{LoggingMetricsHandler, SubscriptionMetricsHandler};
use crate::subscription_registry::SubscriptionRegistry;
use crate::transport::{self, AppState};

pub struct Supervisor {
    config: Config,
    registry: Arc<SubscriptionRegistry>,
    resolver: Arc<dyn IdentityResolver>,
    ingest_source: Arc<dyn IngestSource>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        let metrics: Arc<dyn SubscriptionMetricsHandler> = Arc::new(LoggingMetricsHandler::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            Duration::from_secs(config.keepalive_interval),
            Some(metrics),
        ));
        let resolver = Arc::new(HttpIdentityResolver::new(
            config.api_url.clone(),
            config.api_request_headers.clone(),
            config.api_version,
        ));
        let poll_url = format!("{}/poll/{}", config.api_url, config.ingest_topic);
        let delete_url_base = format!("{}/ack/{}", config.api_url, config.ingest_topic);
        let ingest_source = Arc::new(HttpIngestSource::new(poll_url, delete_url_base));
        Self { config, registry, resolver, ingest_source }
    }

    /// Boots the system (ingest source implicitly ready, transport
    /// listening, status timer armed, ingest loop entered) and blocks until
    /// shutdown completes.
    pub async fn run(self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();

        let state = Arc::new(AppState {
            registry: self.registry.clone(),
            resolver: self.resolver.clone(),
            retry_time_secs: self.config.retry_time,
            dev: self.config.dev,
        });
        let app = transport::router(state);
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let server_shutdown = shutdown.clone();

        let server_task = if self.config.https {
            let cert_path = self
                .config
                .cert_path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("cert_path is required when https is enabled"))?;
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&cert_path, &cert_path).await?;
            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                server_shutdown.cancelled().await;
                shutdown_handle.graceful_shutdown(Some(Duration::from_secs(1)));
            });
            tracing::info!(%addr, "listening (tls)");
            tokio::spawn(async move {
                axum_server::bind_rustls(addr, tls_config)
                    .handle(handle)
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            })
        } else {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(%addr, "listening");
            tokio::spawn(async move {
                axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                    .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                    .await
            })
        };

        let dispatcher = IngestDispatcher::new(self.ingest_source.clone(), self.registry.clone());
        let dispatcher_shutdown = shutdown.clone();
        let dispatcher_task = tokio::spawn(async move { dispatcher.run(dispatcher_shutdown).await });

        let status_registry = self.registry.clone();
        let status_interval = Duration::from_secs(self.config.status_interval);
        let status_shutdown = shutdown.clone();
        let status_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(status_interval);
            loop {
                tokio::select! {
                    _ = status_shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::info!(
                            live_connections = status_registry.live_connection_count(),
                            live_subscriptions = status_registry.live_subscription_count(),
                            "status"
                        );
                    }
                }
            }
        });

        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutdown signal received");
            signal_shutdown.cancel();
        });

        shutdown.cancelled().await;
        let grace = Duration::from_millis(self.config.shutdown_delay_ms);
        let _ = tokio::time::timeout(grace, async {
            let _ = server_task.await;
            let _ = dispatcher_task.await;
            let _ = status_task.await;
        })
        .await;

        self.registry.deregister_all();
        Ok(())
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
