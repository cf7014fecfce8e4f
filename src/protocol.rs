//! Wire types for the client-facing protocol: inbound commands and outbound
//! events, plus the ingest-bus envelope types consumed by the dispatcher.

use serde::{Deserialize, Serialize};

/// An inbound client message, tagged on `action`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action")]
pub enum ClientCommand {
    #[serde(rename = "createSubscriptions")]
    CreateSubscriptions { subscriptions: Vec<CreateSubscriptionEntry> },
    #[serde(rename = "deleteSubscriptions")]
    DeleteSubscriptions { subscriptions: Vec<DeleteSubscriptionEntry> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionEntry {
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    pub topics: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteSubscriptionEntry {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub topic: Option<String>,
}

/// An outbound event written to a Connection's sink, one JSON text frame
/// each. Field presence follows §6 exactly (`apiKey`/`topics`/`connectionID`
/// are omitted, not null, when absent).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum OutboundEvent {
    #[serde(rename = "connected")]
    Connected {
        retry: u64,
        #[serde(rename = "connectionID", skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        topics: Option<Vec<String>>,
    },
    #[serde(rename = "topicUpdated")]
    TopicUpdated { topic: String, version: i64 },
    #[serde(rename = "topicAdded")]
    TopicAdded {
        topic: String,
        #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
    #[serde(rename = "topicRemoved")]
    TopicRemoved {
        topic: String,
        #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
    #[serde(rename = "subscriptionsCreated")]
    SubscriptionsCreated {
        subscriptions: Vec<CreatedSubscriptionReport>,
        errors: Vec<SubscriptionError>,
    },
    #[serde(rename = "subscriptionsDeleted")]
    SubscriptionsDeleted {},
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedSubscriptionReport {
    #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionError {
    #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub topic: String,
    pub error: String,
}

/// The outer ingest envelope: a generic pub-sub-over-queue bridge shape.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestEnvelope {
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "ReceiptHandle")]
    pub receipt_handle: String,
    #[serde(rename = "Body")]
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
struct IngestBody {
    #[serde(rename = "Message")]
    message: String,
}

/// Parse the doubly-nested `Body` string into the inner JSON string.
pub fn unwrap_envelope_body(body: &str) -> Result<String, serde_json::Error> {
    let parsed: IngestBody = serde_json::from_str(body)?;
    Ok(parsed.message)
}

/// The inner ingest payload, tagged on `event`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event")]
pub enum IngestEvent {
    #[serde(rename = "topicUpdated")]
    TopicUpdated { topic: String, version: i64 },
    #[serde(rename = "topicAdded")]
    TopicAdded {
        #[serde(rename = "apiKey")]
        api_key: String,
        topic: String,
    },
    #[serde(rename = "topicRemoved")]
    TopicRemoved {
        #[serde(rename = "apiKey")]
        api_key: String,
        topic: String,
    },
    #[serde(rename = "topicDeleted")]
    TopicDeleted { topic: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_single_key_omits_connection_id() {
        let event = OutboundEvent::Connected {
            retry: 5000,
            connection_id: None,
            topics: Some(vec!["/users/123456".to_string()]),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("connectionID"));
        assert!(json.contains("topics"));
    }

    #[test]
    fn connected_multi_key_omits_topics() {
        let event = OutboundEvent::Connected {
            retry: 5000,
            connection_id: Some("abcdef123456".to_string()),
            topics: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("connectionID"));
        assert!(!json.contains("\"topics\""));
    }

    #[test]
    fn topic_removed_omits_api_key_when_none() {
        let event = OutboundEvent::TopicRemoved {
            topic: "/groups/1".to_string(),
            api_key: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("apiKey"));
    }

    #[test]
    fn parse_create_subscriptions_command() {
        let raw = r#"{"action":"createSubscriptions","subscriptions":[{"apiKey":"K1","topics":["/a"]}]}"#;
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            ClientCommand::CreateSubscriptions { subscriptions } => {
                assert_eq!(subscriptions.len(), 1);
                assert_eq!(subscriptions[0].api_key.as_deref(), Some("K1"));
            }
            _ => panic!("expected CreateSubscriptions"),
        }
    }

    #[test]
    fn parse_delete_subscriptions_command() {
        let raw = r#"{"action":"deleteSubscriptions","subscriptions":[{"apiKey":"K1","topic":"/a"}]}"#;
        let cmd: ClientCommand = serde_json::from_str(raw).unwrap();
        match cmd {
            ClientCommand::DeleteSubscriptions { subscriptions } => {
                assert_eq!(subscriptions.len(), 1);
                assert_eq!(subscriptions[0].topic.as_deref(), Some("/a"));
            }
            _ => panic!("expected DeleteSubscriptions"),
        }
    }

    #[test]
    fn unwrap_envelope_body_extracts_message() {
        let body = r#"{"Message":"{\"event\":\"topicUpdated\",\"topic\":\"/a\",\"version\":1}"}"#;
        let inner = unwrap_envelope_body(body).unwrap();
        let event: IngestEvent = serde_json::from_str(&inner).unwrap();
        match event {
            IngestEvent::TopicUpdated { topic, version } => {
                assert_eq!(topic, "/a");
                assert_eq!(version, 1);
            }
            _ => panic!("expected TopicUpdated"),
        }
    }

    #[test]
    fn unknown_ingest_event_tag_fails_to_parse() {
        let raw = r#"{"event":"somethingElse","topic":"/a"}"#;
        let result: Result<IngestEvent, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }
}
