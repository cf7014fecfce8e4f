//! Real-time push-notification fan-out server.
//!
//! The subscription registry is the core: it owns the three mutually
//! consistent indexes (by connection, by topic, by key) and is the sole
//! mutator of live Subscriptions. Everything else - transport, protocol
//! handling, the ingest dispatcher, the supervisor - exists to get client
//! commands and ingest events to the registry, and registry output back out
//! to clients.

pub mod config;
pub mod connection;
pub mod error;
pub mod identity_resolver;
pub mod ingest;
pub mod ingest_dispatcher;
pub mod metrics;
pub mod protocol;
pub mod protocol_handler;
pub mod subscription;
pub mod subscription_registry;
pub mod supervisor;
pub mod topic;
pub mod transport;

pub use config::Config;
pub use error::Error;
pub use subscription_registry::SubscriptionRegistry;
pub use supervisor::Supervisor;
