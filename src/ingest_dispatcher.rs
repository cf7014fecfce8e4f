//! Turns raw ingest envelopes into Registry mutations.
//!
//! A malformed payload inside an otherwise-healthy batch must not block its
//! siblings, and must not cause the batch to be redelivered forever - it is
//! logged and the envelope is still acknowledged.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::ingest::IngestSource;
use crate::protocol::{unwrap_envelope_body, IngestEnvelope, IngestEvent};
use crate::subscription_registry::SubscriptionRegistry;

pub struct IngestDispatcher {
    source: Arc<dyn IngestSource>,
    registry: Arc<SubscriptionRegistry>,
}

impl IngestDispatcher {
    pub fn new(source: Arc<dyn IngestSource>, registry: Arc<SubscriptionRegistry>) -> Self {
        Self { source, registry }
    }

    /// Runs the pull-decode-dispatch-ack loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                result = self.source.receive_batch() => result,
            };

            let envelopes = match batch {
                Ok(envelopes) => envelopes,
                Err(err) => {
                    tracing::warn!(error = %err, "ingest batch receive failed");
                    continue;
                }
            };

            for envelope in &envelopes {
                self.process_envelope(envelope);
            }

            for envelope in &envelopes {
                if let Err(err) = self.source.ack(&envelope.receipt_handle).await {
                    tracing::warn!(
                        message_id = %envelope.message_id,
                        error = %err,
                        "failed to acknowledge ingest envelope"
                    );
                }
            }
        }
    }

    fn process_envelope(&self, envelope: &IngestEnvelope) {
        let inner = match unwrap_envelope_body(&envelope.body) {
            Ok(inner) => inner,
            Err(err) => {
                tracing::warn!(message_id = %envelope.message_id, error = %err, "malformed ingest envelope body");
                return;
            }
        };

        let event: IngestEvent = match serde_json::from_str(&inner) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(message_id = %envelope.message_id, error = %err, "malformed ingest event payload");
                return;
            }
        };

        match event {
            IngestEvent::TopicUpdated { topic, version } => {
                self.registry.on_topic_updated(&topic, version);
            }
            IngestEvent::TopicAdded { api_key, topic } => {
                self.registry.on_topic_added(&api_key, &topic);
            }
            IngestEvent::TopicRemoved { api_key, topic } => {
                self.registry.on_topic_removed(&api_key, &topic);
            }
            IngestEvent::TopicDeleted { topic } => {
                self.registry.on_topic_deleted(&topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionAttributes;
    use crate::ingest::InMemoryIngestSource;
    use std::time::Duration;

    fn envelope(id: &str, message: &str) -> IngestEnvelope {
        let body = serde_json::json!({ "Message": message }).to_string();
        IngestEnvelope { message_id: id.to_string(), receipt_handle: format!("rh-{id}"), body }
    }

    #[tokio::test]
    async fn well_formed_event_reaches_the_registry() {
        let registry = Arc::new(SubscriptionRegistry::new(Duration::from_secs(30), None));
        let (tx, _rx) = flume::bounded(8);
        let conn = registry.register_connection(
            tx,
            ConnectionAttributes { single_key: false, remote_addr: "127.0.0.1:1".to_string() },
        );
        registry.add_subscription(&conn.id, "K1", "/a");

        let (ingest_tx, ingest_source) = InMemoryIngestSource::new();
        let dispatcher = IngestDispatcher::new(Arc::new(ingest_source), registry.clone());
        let msg = serde_json::json!({"event":"topicUpdated","topic":"/a","version":3}).to_string();
        ingest_tx.send(envelope("1", &msg)).unwrap();

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_clone).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        let _ = handle.await;

        assert_eq!(registry.live_subscription_count(), 1);
    }

    #[tokio::test]
    async fn a_malformed_payload_does_not_block_its_siblings() {
        let registry = Arc::new(SubscriptionRegistry::new(Duration::from_secs(30), None));
        let (tx, _rx) = flume::bounded(8);
        let conn = registry.register_connection(
            tx,
            ConnectionAttributes { single_key: false, remote_addr: "127.0.0.1:1".to_string() },
        );
        registry.add_subscription(&conn.id, "K1", "/a");
        registry.add_subscription(&conn.id, "K2", "/b");

        let (ingest_tx, ingest_source) = InMemoryIngestSource::new();
        let dispatcher = IngestDispatcher::new(Arc::new(ingest_source), registry.clone());

        let good_a = serde_json::json!({"event":"topicDeleted","topic":"/a"}).to_string();
        let bad = "not even a Message envelope";
        let good_b = serde_json::json!({"event":"topicDeleted","topic":"/b"}).to_string();
        ingest_tx.send(envelope("1", &good_a)).unwrap();
        ingest_tx
            .send(IngestEnvelope {
                message_id: "2".to_string(),
                receipt_handle: "rh-2".to_string(),
                body: bad.to_string(),
            })
            .unwrap();
        ingest_tx.send(envelope("3", &good_b)).unwrap();

        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();
        let handle = tokio::spawn(async move { dispatcher.run(shutdown_clone).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        let _ = handle.await;

        assert_eq!(registry.live_subscription_count(), 0, "both well-formed deletions should apply");
    }
}
