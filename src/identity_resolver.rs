//! Resolves an API key to its accessible topic set and answers
//! public-topic-accessibility queries.
//!
//! The reference adapter is an HTTP JSON client bounded by a process-wide
//! semaphore and a per-call timeout, following the same
//! client-plus-bounded-concurrency-plus-timeout shape used for the upstream
//! federation client this was adapted from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::error::Error;

/// Maximum number of concurrent outbound calls to the identity service,
/// shared across every resolver method.
pub const MAX_CONCURRENT_RESOLVES: usize = 10;
/// Default per-call timeout before a call is converted into `Error::Upstream`.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_topics(&self, api_key: &str) -> Result<Vec<String>, Error>;
    async fn is_public_topic(&self, topic: &str) -> Result<bool, Error>;
}

#[derive(Debug, Deserialize)]
struct ResolveTopicsResponse {
    topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PublicAccessResponse {
    public: bool,
}

/// HTTP JSON client hitting `apiURL` with the configured headers and API
/// version (§6 Environment).
pub struct HttpIdentityResolver {
    client: reqwest::Client,
    base_url: String,
    headers: HashMap<String, String>,
    api_version: i32,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl HttpIdentityResolver {
    pub fn new(base_url: impl Into<String>, headers: HashMap<String, String>, api_version: i32) -> Self {
        Self::with_timeout(base_url, headers, api_version, DEFAULT_RESOLVE_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        headers: HashMap<String, String>,
        api_version: i32,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            headers,
            api_version,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_RESOLVES)),
            timeout,
        }
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url).query(&[("apiVersion", self.api_version)]);
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        req
    }

    async fn call<T: for<'de> Deserialize<'de>>(&self, url: String) -> Result<T, Error> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| Error::fatal("identity resolver semaphore closed"))?;

        let response = tokio::time::timeout(self.timeout, self.request(url).send())
            .await
            .map_err(|_| Error::upstream("identity service request timed out"))?
            .map_err(|e| Error::upstream(e.to_string()))?;

        match response.status().as_u16() {
            401 | 403 => Err(Error::authorization("api key unknown or revoked")),
            200..=299 => response
                .json::<T>()
                .await
                .map_err(|e| Error::upstream(format!("malformed identity service response: {e}"))),
            status => Err(Error::upstream(format!("identity service returned status {status}"))),
        }
    }
}

#[async_trait]
impl IdentityResolver for HttpIdentityResolver {
    async fn resolve_topics(&self, api_key: &str) -> Result<Vec<String>, Error> {
        let url = format!("{}/keys/{}/topics", self.base_url, api_key);
        let body: ResolveTopicsResponse = self.call(url).await?;
        Ok(body.topics)
    }

    async fn is_public_topic(&self, topic: &str) -> Result<bool, Error> {
        let url = format!("{}/public-topics?topic={}", self.base_url, topic);
        let body: PublicAccessResponse = self.call(url).await?;
        Ok(body.public)
    }
}

/// A fixed-table resolver for tests: no I/O, deterministic answers, and an
/// optional artificial delay to exercise the timeout path.
#[derive(Default)]
pub struct StubIdentityResolver {
    topics_by_key: HashMap<String, Vec<String>>,
    public_topics: std::collections::HashSet<String>,
    fail_keys: std::collections::HashSet<String>,
    stall_keys: std::collections::HashSet<String>,
}

impl StubIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_topics(mut self, api_key: impl Into<String>, topics: Vec<String>) -> Self {
        self.topics_by_key.insert(api_key.into(), topics);
        self
    }

    pub fn with_public_topic(mut self, topic: impl Into<String>) -> Self {
        self.public_topics.insert(topic.into());
        self
    }

    /// Causes `resolve_topics` for this key to return `Error::Authorization`.
    pub fn with_failing_key(mut self, api_key: impl Into<String>) -> Self {
        self.fail_keys.insert(api_key.into());
        self
    }

    /// Causes `resolve_topics` for this key to never return, simulating a
    /// stalled upstream call for timeout-path tests. Callers should wrap
    /// the call in `tokio::time::timeout` themselves.
    pub fn with_stalling_key(mut self, api_key: impl Into<String>) -> Self {
        self.stall_keys.insert(api_key.into());
        self
    }
}

#[async_trait]
impl IdentityResolver for StubIdentityResolver {
    async fn resolve_topics(&self, api_key: &str) -> Result<Vec<String>, Error> {
        if self.stall_keys.contains(api_key) {
            std::future::pending::<()>().await;
        }
        if self.fail_keys.contains(api_key) {
            return Err(Error::authorization("api key unknown or revoked"));
        }
        Ok(self.topics_by_key.get(api_key).cloned().unwrap_or_default())
    }

    async fn is_public_topic(&self, topic: &str) -> Result<bool, Error> {
        Ok(self.public_topics.contains(topic))
    }
}
