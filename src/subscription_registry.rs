//! The subscription registry: the single source of truth for which
//! connections are listening to which topics under which API key.
//!
//! Three `DashMap`-backed indexes are kept mutually consistent on every
//! mutation (by-connection lives inside each `ConnectionEntry`, by-topic and
//! by-key are maintained here), following the sharded-map-plus-per-entry-lock
//! shape the registry this is adapted from uses for its connection/filter
//! bookkeeping.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::connection::{generate_connection_id, Connection, ConnectionAttributes, OutboundSink, SinkMessage};
use crate::metrics::SubscriptionMetricsHandler;
use crate::protocol::OutboundEvent;
use crate::subscription::Subscription;
use crate::topic::PUBLIC_KEY;

/// Per-connection state the registry owns. `Connection` itself (see
/// `connection.rs`) is just the id/attributes pair callers hold on to; this
/// is the heavier bookkeeping that lives only inside the registry.
struct ConnectionEntry {
    connection: Connection,
    sink: OutboundSink,
    subscriptions: RwLock<HashSet<(String, String)>>,
    access_tracked: RwLock<HashSet<String>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ConnectionEntry {
    fn drop(&mut self) {
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
    }
}

pub struct SubscriptionRegistry {
    connections: DashMap<String, Arc<ConnectionEntry>>,
    topic_index: DashMap<String, DashSet<(String, String)>>,
    key_index: DashMap<String, DashSet<(String, String)>>,
    live_subscriptions: AtomicUsize,
    keepalive_interval: Duration,
    metrics: Option<Arc<dyn SubscriptionMetricsHandler>>,
}

impl SubscriptionRegistry {
    pub fn new(keepalive_interval: Duration, metrics: Option<Arc<dyn SubscriptionMetricsHandler>>) -> Self {
        Self {
            connections: DashMap::new(),
            topic_index: DashMap::new(),
            key_index: DashMap::new(),
            live_subscriptions: AtomicUsize::new(0),
            keepalive_interval,
            metrics,
        }
    }

    pub fn live_connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn live_subscription_count(&self) -> usize {
        self.live_subscriptions.load(Ordering::Relaxed)
    }

    pub fn get_connection(&self, conn_id: &str) -> Option<Connection> {
        self.connections.get(conn_id).map(|e| e.connection.clone())
    }

    /// Register a freshly accepted connection, spawning its keepalive ping
    /// loop. Retries id generation on the (astronomically unlikely) collision.
    pub fn register_connection(&self, sink: OutboundSink, attributes: ConnectionAttributes) -> Connection {
        let id = loop {
            let candidate = generate_connection_id(attributes.single_key);
            if !self.connections.contains_key(&candidate) {
                break candidate;
            }
        };

        let keepalive_sink = sink.clone();
        let interval = self.keepalive_interval;
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if keepalive_sink.try_send(SinkMessage::Ping).is_err() {
                    break;
                }
            }
        });

        let connection = Connection { id: id.clone(), attributes };
        let entry = Arc::new(ConnectionEntry {
            connection: connection.clone(),
            sink,
            subscriptions: RwLock::new(HashSet::new()),
            access_tracked: RwLock::new(HashSet::new()),
            keepalive: Mutex::new(Some(keepalive)),
        });
        self.connections.insert(id, entry);
        if let Some(m) = &self.metrics {
            m.set_active_connections(self.connections.len());
        }
        connection
    }

    /// Remove a connection and every subscription it owns. Idempotent: a
    /// second call for an already-gone id is a no-op.
    pub fn deregister_connection(&self, conn_id: &str) {
        let Some((_, entry)) = self.connections.remove(conn_id) else {
            return;
        };
        let snapshot: Vec<(String, String)> = entry.subscriptions.read().iter().cloned().collect();
        for (api_key, topic) in &snapshot {
            if let Some(set) = self.topic_index.get(topic) {
                set.remove(&(conn_id.to_string(), api_key.clone()));
            }
            if let Some(set) = self.key_index.get(api_key) {
                set.remove(&(conn_id.to_string(), topic.clone()));
            }
        }
        if !snapshot.is_empty() {
            self.live_subscriptions.fetch_sub(snapshot.len(), Ordering::Relaxed);
            if let Some(m) = &self.metrics {
                m.decrement_active_subscriptions(snapshot.len());
            }
        }
        if let Some(m) = &self.metrics {
            m.set_active_connections(self.connections.len());
        }
    }

    /// Deregister every live connection. Used during shutdown to close all
    /// sinks before the process exits.
    pub fn deregister_all(&self) {
        let ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.deregister_connection(&id);
        }
    }

    /// Add `(apiKey, topic)` to a connection. A no-op, returning `false`, if
    /// the triple already exists or the connection is gone.
    pub fn add_subscription(&self, conn_id: &str, api_key: &str, topic: &str) -> bool {
        let Some(entry) = self.connections.get(conn_id) else {
            return false;
        };
        {
            let mut subs = entry.subscriptions.write();
            if !subs.insert((api_key.to_string(), topic.to_string())) {
                return false;
            }
        }
        self.topic_index
            .entry(topic.to_string())
            .or_insert_with(DashSet::new)
            .insert((conn_id.to_string(), api_key.to_string()));
        self.key_index
            .entry(api_key.to_string())
            .or_insert_with(DashSet::new)
            .insert((conn_id.to_string(), topic.to_string()));
        self.live_subscriptions.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.increment_active_subscriptions();
        }
        true
    }

    /// Remove exactly one `(connection, apiKey, topic)` triple. Disables
    /// access tracking for the pair regardless of whether the triple itself
    /// existed, mirroring the unconditional reset on subscription removal.
    pub fn remove_subscription(&self, sub: &Subscription) -> bool {
        self.remove_subscription_internal(&sub.conn_id, &sub.api_key, &sub.topic)
    }

    fn remove_subscription_internal(&self, conn_id: &str, api_key: &str, topic: &str) -> bool {
        let Some(entry) = self.connections.get(conn_id) else {
            return false;
        };
        entry.access_tracked.write().remove(api_key);
        let removed = entry.subscriptions.write().remove(&(api_key.to_string(), topic.to_string()));
        if !removed {
            return false;
        }
        if let Some(set) = self.topic_index.get(topic) {
            set.remove(&(conn_id.to_string(), api_key.to_string()));
        }
        if let Some(set) = self.key_index.get(api_key) {
            set.remove(&(conn_id.to_string(), topic.to_string()));
        }
        self.live_subscriptions.fetch_sub(1, Ordering::Relaxed);
        if let Some(m) = &self.metrics {
            m.decrement_active_subscriptions(1);
        }
        true
    }

    /// Remove every subscription on `conn_id` under `api_key`, optionally
    /// narrowed to one `topic`. Returns the count actually removed.
    pub fn remove_connection_subscriptions_by_key_and_topic(
        &self,
        conn_id: &str,
        api_key: &str,
        topic: Option<&str>,
    ) -> usize {
        let Some(entry) = self.connections.get(conn_id) else {
            return 0;
        };
        let matching: Vec<String> = {
            let subs = entry.subscriptions.read();
            subs.iter()
                .filter(|(k, t)| k == api_key && topic.map(|want| want == t).unwrap_or(true))
                .map(|(_, t)| t.clone())
                .collect()
        };
        matching
            .into_iter()
            .filter(|t| self.remove_subscription_internal(conn_id, api_key, t))
            .count()
    }

    /// All topics `conn_id` is subscribed to under `api_key`.
    pub fn topics_for_connection_and_key(&self, conn_id: &str, api_key: &str) -> Vec<String> {
        match self.connections.get(conn_id) {
            Some(entry) => entry
                .subscriptions
                .read()
                .iter()
                .filter(|(k, _)| k == api_key)
                .map(|(_, t)| t.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Access tracking is implicitly always-on for single-key connections
    /// (there is only one key, so there is nothing to distinguish); for
    /// multi-key connections it follows the explicit per-key flag.
    pub fn is_access_tracked(&self, conn_id: &str, api_key: &str) -> bool {
        match self.connections.get(conn_id) {
            Some(entry) => entry.connection.attributes.single_key || entry.access_tracked.read().contains(api_key),
            None => false,
        }
    }

    pub fn enable_access_tracking(&self, conn_id: &str, api_key: &str) {
        if let Some(entry) = self.connections.get(conn_id) {
            entry.access_tracked.write().insert(api_key.to_string());
        }
    }

    pub fn disable_access_tracking(&self, conn_id: &str, api_key: &str) {
        if let Some(entry) = self.connections.get(conn_id) {
            entry.access_tracked.write().remove(api_key);
        }
    }

    /// Fan out a `topicUpdated` event to every connection subscribed to
    /// `topic`, regardless of API key.
    pub fn on_topic_updated(&self, topic: &str, version: i64) {
        let Some(set) = self.topic_index.get(topic) else {
            return;
        };
        let conn_ids: Vec<String> = set.iter().map(|item| item.0.clone()).collect();
        drop(set);
        for conn_id in conn_ids {
            self.write_to(&conn_id, OutboundEvent::TopicUpdated { topic: topic.to_string(), version });
        }
    }

    /// A new topic became reachable under `apiKey`. Every access-tracked
    /// connection already holding that key is auto-subscribed and notified.
    /// The notify write precedes the index mutation, not the reverse.
    pub fn on_topic_added(&self, api_key: &str, topic: &str) {
        let mut conn_ids: HashSet<String> = HashSet::new();
        if let Some(set) = self.key_index.get(api_key) {
            for item in set.iter() {
                conn_ids.insert(item.0.clone());
            }
        }
        for conn_id in conn_ids {
            if !self.is_access_tracked(&conn_id, api_key) {
                continue;
            }
            let single_key = self
                .connections
                .get(&conn_id)
                .map(|e| e.connection.attributes.single_key)
                .unwrap_or(false);
            self.write_to(
                &conn_id,
                OutboundEvent::TopicAdded {
                    topic: topic.to_string(),
                    api_key: if single_key { None } else { Some(api_key.to_string()) },
                },
            );
            self.add_subscription(&conn_id, api_key, topic);
        }
    }

    /// A topic stopped being reachable under `apiKey`. Every subscription on
    /// that exact pair is removed, then notified.
    pub fn on_topic_removed(&self, api_key: &str, topic: &str) {
        let mut subs = Vec::new();
        if let Some(set) = self.topic_index.get(topic) {
            for item in set.iter() {
                if item.1 == api_key {
                    subs.push(Subscription::new(item.0.clone(), api_key.to_string(), topic.to_string()));
                }
            }
        }
        self.delete_and_notify(subs);
    }

    /// A topic (and everything nested under it) was permanently deleted.
    pub fn on_topic_deleted(&self, prefix: &str) {
        let mut subs = Vec::new();
        for entry in self.topic_index.iter() {
            let topic = entry.key();
            if crate::topic::topic_has_prefix(topic, prefix) {
                for item in entry.value().iter() {
                    subs.push(Subscription::new(item.0.clone(), item.1.clone(), topic.clone()));
                }
            }
        }
        self.delete_and_notify(subs);
    }

    /// Remove each subscription, then (only if it was actually removed) write
    /// a `topicRemoved` event. Order matters: a connection must never see a
    /// `topicRemoved` for a subscription the registry still holds.
    fn delete_and_notify(&self, subs: Vec<Subscription>) {
        for sub in subs {
            if !self.remove_subscription(&sub) {
                continue;
            }
            let single_key = self
                .connections
                .get(&sub.conn_id)
                .map(|e| e.connection.attributes.single_key)
                .unwrap_or(false);
            let include_key = !single_key && sub.api_key != PUBLIC_KEY;
            self.write_to(
                &sub.conn_id,
                OutboundEvent::TopicRemoved {
                    topic: sub.topic,
                    api_key: if include_key { Some(sub.api_key) } else { None },
                },
            );
        }
    }

    /// Best-effort, non-blocking write. A full or closed sink deregisters the
    /// connection outright rather than leaving a half-dead entry behind.
    fn write_to(&self, conn_id: &str, event: OutboundEvent) {
        let dead = match self.connections.get(conn_id) {
            Some(entry) => entry.sink.try_send(SinkMessage::Event(event)).is_err(),
            None => false,
        };
        if dead {
            tracing::debug!(conn_id, "outbound sink closed, deregistering connection");
            self.deregister_connection(conn_id);
        }
    }
}
