//! The Client Protocol Handler: handshake plus inbound command handling.
//!
//! Every Identity Resolver lookup a command needs happens before the first
//! Registry mutation for that command, so a resolver failure midway through
//! leaves the Registry exactly as it found it.

use crate::connection::{Connection, ConnectionAttributes, OutboundSink, SinkMessage};
use crate::error::Error;
use crate::identity_resolver::IdentityResolver;
use crate::protocol::{
    ClientCommand, CreateSubscriptionEntry, CreatedSubscriptionReport, DeleteSubscriptionEntry, OutboundEvent,
    SubscriptionError,
};
use crate::subscription_registry::SubscriptionRegistry;
use crate::topic::{is_valid_topic, PUBLIC_KEY};

/// Resolved handshake key: the query parameter wins over the header when
/// both are present.
pub fn select_handshake_key(query_key: Option<String>, header_key: Option<String>) -> Option<String> {
    query_key.or(header_key)
}

/// Performs the handshake: resolves the key (if any), registers the
/// Connection, writes the `connected` event, then seeds its subscriptions.
/// `connected` must reach the sink before any subscription exists, so no
/// concurrently dispatched ingest event can beat it through the channel.
/// Returns before registering anything if key resolution fails.
pub async fn handshake(
    registry: &SubscriptionRegistry,
    resolver: &dyn IdentityResolver,
    sink: OutboundSink,
    remote_addr: String,
    api_key: Option<String>,
    retry_time_secs: u64,
) -> Result<Connection, Error> {
    let retry_ms = retry_time_secs * 1000;
    match api_key {
        Some(key) => {
            let topics = resolver.resolve_topics(&key).await?;
            let attrs = ConnectionAttributes { single_key: true, remote_addr };
            let conn = registry.register_connection(sink.clone(), attrs);
            let _ = sink.try_send(SinkMessage::Event(OutboundEvent::Connected {
                retry: retry_ms,
                connection_id: None,
                topics: Some(topics.clone()),
            }));
            for topic in &topics {
                registry.add_subscription(&conn.id, &key, topic);
            }
            Ok(conn)
        }
        None => {
            let attrs = ConnectionAttributes { single_key: false, remote_addr };
            let conn = registry.register_connection(sink.clone(), attrs);
            let _ = sink.try_send(SinkMessage::Event(OutboundEvent::Connected {
                retry: retry_ms,
                connection_id: Some(conn.id.clone()),
                topics: None,
            }));
            Ok(conn)
        }
    }
}

/// Dispatches one already-parsed inbound command for an established
/// multi-key Connection.
pub async fn handle_command(
    registry: &SubscriptionRegistry,
    resolver: &dyn IdentityResolver,
    conn: &Connection,
    command: ClientCommand,
) -> Result<OutboundEvent, Error> {
    if conn.attributes.single_key {
        return Err(Error::client_protocol("single-key connection cannot be modified"));
    }
    match command {
        ClientCommand::CreateSubscriptions { subscriptions } => {
            handle_create_subscriptions(registry, resolver, conn, subscriptions).await
        }
        ClientCommand::DeleteSubscriptions { subscriptions } => {
            handle_delete_subscriptions(registry, conn, subscriptions)
        }
    }
}

/// An entry's resolution outcome, computed before any Registry mutation.
enum Plan {
    /// `topics` absent or empty: the whole resolved set for `apiKey`.
    KeyWide { api_key: String, topics: Vec<String> },
    /// `topics` present: per-topic accept/reject decisions already made.
    Explicit { api_key: Option<String>, accepted: Vec<String>, errors: Vec<SubscriptionError> },
}

async fn handle_create_subscriptions(
    registry: &SubscriptionRegistry,
    resolver: &dyn IdentityResolver,
    conn: &Connection,
    entries: Vec<CreateSubscriptionEntry>,
) -> Result<OutboundEvent, Error> {
    if entries.is_empty() {
        return Err(Error::client_protocol("subscriptions must not be empty"));
    }

    // Phase 1: resolve everything needed by every entry. No Registry
    // mutation happens in this loop, so a resolver error here leaves the
    // Registry untouched.
    let mut plans = Vec::with_capacity(entries.len());
    for entry in entries {
        let topics_absent = entry.topics.as_ref().map(|t| t.is_empty()).unwrap_or(true);
        if topics_absent {
            let api_key = entry
                .api_key
                .ok_or_else(|| Error::client_protocol("apiKey required when topics is absent"))?;
            let topics = resolver.resolve_topics(&api_key).await?;
            plans.push(Plan::KeyWide { api_key, topics });
            continue;
        }

        let topics = entry.topics.expect("checked non-empty above");
        for topic in &topics {
            if !is_valid_topic(topic) {
                return Err(Error::client_protocol(format!("invalid topic: {topic}")));
            }
        }

        let mut accepted = Vec::new();
        let mut errors = Vec::new();
        match &entry.api_key {
            Some(api_key) => {
                let allowed = resolver.resolve_topics(api_key).await?;
                for topic in topics {
                    if allowed.contains(&topic) {
                        accepted.push(topic);
                    } else {
                        errors.push(SubscriptionError {
                            api_key: Some(api_key.clone()),
                            topic,
                            error: "Topic is not valid for provided API key".to_string(),
                        });
                    }
                }
            }
            None => {
                for topic in topics {
                    if resolver.is_public_topic(&topic).await? {
                        accepted.push(topic);
                    } else {
                        errors.push(SubscriptionError {
                            api_key: None,
                            topic,
                            error: "Topic is not accessible without an API key".to_string(),
                        });
                    }
                }
            }
        }
        plans.push(Plan::Explicit { api_key: entry.api_key, accepted, errors });
    }

    // Phase 2: every resolver call succeeded, apply the mutations.
    let mut reports = Vec::new();
    let mut all_errors = Vec::new();
    for plan in plans {
        match plan {
            Plan::KeyWide { api_key, topics } => {
                registry.enable_access_tracking(&conn.id, &api_key);
                for topic in &topics {
                    registry.add_subscription(&conn.id, &api_key, topic);
                }
                let full = registry.topics_for_connection_and_key(&conn.id, &api_key);
                reports.push(CreatedSubscriptionReport { api_key: Some(api_key), topics: full });
            }
            Plan::Explicit { api_key, accepted, errors } => {
                if !accepted.is_empty() {
                    let storage_key = api_key.clone().unwrap_or_else(|| PUBLIC_KEY.to_string());
                    for topic in &accepted {
                        registry.add_subscription(&conn.id, &storage_key, topic);
                    }
                    let full = registry.topics_for_connection_and_key(&conn.id, &storage_key);
                    reports.push(CreatedSubscriptionReport { api_key, topics: full });
                }
                all_errors.extend(errors);
            }
        }
    }

    Ok(OutboundEvent::SubscriptionsCreated { subscriptions: reports, errors: all_errors })
}

fn handle_delete_subscriptions(
    registry: &SubscriptionRegistry,
    conn: &Connection,
    entries: Vec<DeleteSubscriptionEntry>,
) -> Result<OutboundEvent, Error> {
    if entries.is_empty() {
        return Err(Error::client_protocol("subscriptions must not be empty"));
    }
    let mut total_removed = 0;
    for entry in entries {
        total_removed +=
            registry.remove_connection_subscriptions_by_key_and_topic(&conn.id, &entry.api_key, entry.topic.as_deref());
    }
    if total_removed == 0 {
        return Err(Error::client_protocol("no matching subscription"));
    }
    Ok(OutboundEvent::SubscriptionsDeleted {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SinkMessage;
    use crate::identity_resolver::StubIdentityResolver;
    use std::time::Duration;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Duration::from_secs(30), None)
    }

    #[tokio::test]
    async fn single_key_handshake_seeds_subscriptions_and_sends_connected_first() {
        let reg = registry();
        let resolver =
            StubIdentityResolver::new().with_key_topics("K24", vec!["/users/123456".to_string(), "/groups/234567".to_string()]);
        let (tx, rx) = flume::bounded(8);
        let conn = handshake(&reg, &resolver, tx, "127.0.0.1:1".to_string(), Some("K24".to_string()), 5)
            .await
            .unwrap();

        assert!(conn.attributes.single_key);
        match rx.try_recv().unwrap() {
            SinkMessage::Event(OutboundEvent::Connected { retry, connection_id, topics }) => {
                assert_eq!(retry, 5000);
                assert!(connection_id.is_none());
                assert_eq!(topics.unwrap().len(), 2);
            }
            other => panic!("unexpected first message: {other:?}"),
        }
        assert_eq!(reg.topics_for_connection_and_key(&conn.id, "K24").len(), 2);
    }

    #[tokio::test]
    async fn multi_key_handshake_sends_connection_id_with_no_topics() {
        let reg = registry();
        let resolver = StubIdentityResolver::new();
        let (tx, rx) = flume::bounded(8);
        let conn = handshake(&reg, &resolver, tx, "127.0.0.1:1".to_string(), None, 5).await.unwrap();

        assert!(!conn.attributes.single_key);
        match rx.try_recv().unwrap() {
            SinkMessage::Event(OutboundEvent::Connected { connection_id, topics, .. }) => {
                assert_eq!(connection_id.unwrap().len(), 12);
                assert!(topics.is_none());
            }
            other => panic!("unexpected first message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_subscriptions_key_wide_reports_full_topic_list() {
        let reg = registry();
        let resolver =
            StubIdentityResolver::new().with_key_topics("K1", vec!["/users/123456".to_string(), "/groups/234567".to_string()]);
        let (tx, _rx) = flume::bounded(8);
        let conn = handshake(&reg, &resolver, tx, "127.0.0.1:1".to_string(), None, 5).await.unwrap();

        let cmd = ClientCommand::CreateSubscriptions {
            subscriptions: vec![CreateSubscriptionEntry {
                api_key: Some("K1".to_string()),
                topics: None,
            }],
        };
        let result = handle_command(&reg, &resolver, &conn, cmd).await.unwrap();
        match result {
            OutboundEvent::SubscriptionsCreated { subscriptions, errors } => {
                assert_eq!(subscriptions.len(), 1);
                assert_eq!(subscriptions[0].topics.len(), 2);
                assert!(errors.is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(reg.is_access_tracked(&conn.id, "K1"));
    }

    #[tokio::test]
    async fn mixed_accessibility_reports_partial_acceptance_and_errors() {
        let reg = registry();
        let resolver = StubIdentityResolver::new().with_key_topics("K1", vec!["/groups/234567".to_string()]);
        let (tx, _rx) = flume::bounded(8);
        let conn = handshake(&reg, &resolver, tx, "127.0.0.1:1".to_string(), None, 5).await.unwrap();

        let cmd = ClientCommand::CreateSubscriptions {
            subscriptions: vec![
                CreateSubscriptionEntry {
                    api_key: Some("K1".to_string()),
                    topics: Some(vec!["/groups/234567".to_string(), "/groups/345678".to_string()]),
                },
                CreateSubscriptionEntry { api_key: None, topics: Some(vec!["/groups/456789".to_string()]) },
            ],
        };
        let result = handle_command(&reg, &resolver, &conn, cmd).await.unwrap();
        match result {
            OutboundEvent::SubscriptionsCreated { subscriptions, errors } => {
                assert_eq!(subscriptions.len(), 1);
                assert_eq!(subscriptions[0].topics, vec!["/groups/234567".to_string()]);
                assert_eq!(errors.len(), 2);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolver_failure_leaves_registry_untouched() {
        let reg = registry();
        let resolver = StubIdentityResolver::new().with_failing_key("bad-key");
        let (tx, _rx) = flume::bounded(8);
        let conn = handshake(&reg, &resolver, tx, "127.0.0.1:1".to_string(), None, 5).await.unwrap();
        reg.add_subscription(&conn.id, "K1", "/pre-existing");
        let before = reg.topics_for_connection_and_key(&conn.id, "K1");

        let cmd = ClientCommand::CreateSubscriptions {
            subscriptions: vec![CreateSubscriptionEntry { api_key: Some("bad-key".to_string()), topics: None }],
        };
        let err = handle_command(&reg, &resolver, &conn, cmd).await.unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
        assert_eq!(reg.topics_for_connection_and_key(&conn.id, "K1"), before);
        assert_eq!(reg.live_subscription_count(), 1);
    }

    #[tokio::test]
    async fn single_key_connections_reject_every_command() {
        let reg = registry();
        let resolver = StubIdentityResolver::new().with_key_topics("K1", vec!["/a".to_string()]);
        let (tx, _rx) = flume::bounded(8);
        let conn = handshake(&reg, &resolver, tx, "127.0.0.1:1".to_string(), Some("K1".to_string()), 5)
            .await
            .unwrap();

        let cmd = ClientCommand::DeleteSubscriptions {
            subscriptions: vec![DeleteSubscriptionEntry { api_key: "K1".to_string(), topic: None }],
        };
        let err = handle_command(&reg, &resolver, &conn, cmd).await.unwrap_err();
        assert!(matches!(err, Error::ClientProtocol(_)));
        assert_eq!(reg.topics_for_connection_and_key(&conn.id, "K1").len(), 1);
    }

    #[tokio::test]
    async fn delete_subscriptions_fails_when_nothing_matched() {
        let reg = registry();
        let resolver = StubIdentityResolver::new();
        let (tx, _rx) = flume::bounded(8);
        let conn = handshake(&reg, &resolver, tx, "127.0.0.1:1".to_string(), None, 5).await.unwrap();

        let cmd = ClientCommand::DeleteSubscriptions {
            subscriptions: vec![DeleteSubscriptionEntry { api_key: "K1".to_string(), topic: None }],
        };
        let err = handle_command(&reg, &resolver, &conn, cmd).await.unwrap_err();
        assert!(matches!(err, Error::ClientProtocol(_)));
    }
}
