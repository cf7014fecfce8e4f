//! The Ingest Source adapter: produces batches of raw notification envelopes
//! from an external bus, and acknowledges them once processed.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Error;
use crate::protocol::IngestEnvelope;

pub const MAX_BATCH_SIZE: usize = 10;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);

#[async_trait]
pub trait IngestSource: Send + Sync {
    /// Pull up to `MAX_BATCH_SIZE` envelopes, waiting as long as the poll
    /// timeout for at least one. An empty batch is a normal, non-error
    /// outcome (nothing arrived within the window).
    async fn receive_batch(&self) -> Result<Vec<IngestEnvelope>, Error>;

    /// Acknowledge (delete) one envelope by its receipt handle.
    async fn ack(&self, receipt_handle: &str) -> Result<(), Error>;
}

/// HTTP long-poll client: `GET` the polling endpoint with a long timeout,
/// `DELETE` by receipt handle to acknowledge.
pub struct HttpIngestSource {
    client: reqwest::Client,
    poll_url: String,
    delete_url_base: String,
    poll_timeout: Duration,
}

impl HttpIngestSource {
    pub fn new(poll_url: impl Into<String>, delete_url_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            poll_url: poll_url.into(),
            delete_url_base: delete_url_base.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

#[async_trait]
impl IngestSource for HttpIngestSource {
    async fn receive_batch(&self) -> Result<Vec<IngestEnvelope>, Error> {
        let response = tokio::time::timeout(
            self.poll_timeout,
            self.client
                .get(&self.poll_url)
                .query(&[("maxMessages", MAX_BATCH_SIZE)])
                .send(),
        )
        .await
        .map_err(|_| Error::upstream("ingest poll timed out"))?
        .map_err(|e| Error::upstream(e.to_string()))?;

        response
            .json::<Vec<IngestEnvelope>>()
            .await
            .map_err(|e| Error::upstream(format!("malformed ingest batch: {e}")))
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), Error> {
        let url = format!("{}/{}", self.delete_url_base, receipt_handle);
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| Error::upstream(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::upstream(format!("ack failed with status {}", response.status())))
        }
    }
}

/// Channel-backed source for tests: envelopes are injected directly, no I/O.
pub struct InMemoryIngestSource {
    receiver: flume::Receiver<IngestEnvelope>,
}

impl InMemoryIngestSource {
    /// Returns the source plus the sender callers use to inject envelopes.
    pub fn new() -> (flume::Sender<IngestEnvelope>, Self) {
        let (tx, rx) = flume::unbounded();
        (tx, Self { receiver: rx })
    }
}

#[async_trait]
impl IngestSource for InMemoryIngestSource {
    async fn receive_batch(&self) -> Result<Vec<IngestEnvelope>, Error> {
        let mut batch = Vec::new();
        // Block for the first envelope so the dispatcher loop doesn't spin;
        // then drain whatever else is already queued, up to the batch cap.
        match self.receiver.recv_async().await {
            Ok(first) => batch.push(first),
            Err(_) => return Ok(batch),
        }
        while batch.len() < MAX_BATCH_SIZE {
            match self.receiver.try_recv() {
                Ok(env) => batch.push(env),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    async fn ack(&self, _receipt_handle: &str) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(id: &str) -> IngestEnvelope {
        IngestEnvelope {
            message_id: id.to_string(),
            receipt_handle: format!("rh-{id}"),
            body: r#"{"Message":"{\"event\":\"topicDeleted\",\"topic\":\"/a\"}"}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn in_memory_source_delivers_injected_envelopes() {
        let (tx, source) = InMemoryIngestSource::new();
        tx.send(envelope("1")).unwrap();
        tx.send(envelope("2")).unwrap();
        let batch = source.receive_batch().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].message_id, "1");
    }

    #[tokio::test]
    async fn in_memory_source_caps_batch_at_max_size() {
        let (tx, source) = InMemoryIngestSource::new();
        for i in 0..15 {
            tx.send(envelope(&i.to_string())).unwrap();
        }
        let batch = source.receive_batch().await.unwrap();
        assert_eq!(batch.len(), MAX_BATCH_SIZE);
    }

    #[tokio::test]
    async fn ack_on_in_memory_source_always_succeeds() {
        let (_tx, source) = InMemoryIngestSource::new();
        assert!(source.ack("whatever").await.is_ok());
    }
}
