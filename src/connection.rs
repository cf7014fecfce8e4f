//! Connection identity, attributes, and the outbound sink wire type.
//!
//! The heavier per-connection bookkeeping (subscription lists, access
//! tracking, the keepalive task handle) lives inside the registry's
//! `ConnectionEntry` (see `subscription_registry`); `Connection` itself is
//! the lightweight, cloneable handle callers outside the registry hold on to.

use crate::protocol::OutboundEvent;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of a single-key connection identifier.
pub const SINGLE_KEY_ID_LEN: usize = 6;
/// Length of a multi-key connection identifier.
pub const MULTI_KEY_ID_LEN: usize = 12;

/// Per-connection attributes fixed at handshake time.
#[derive(Debug, Clone)]
pub struct ConnectionAttributes {
    pub single_key: bool,
    pub remote_addr: String,
}

/// Everything written to a Connection's outbound sink: either a protocol
/// event or a transport-level keepalive ping. Keeping both on one channel
/// preserves the total ordering guarantee from §5 - a ping and a `topicAdded`
/// dispatched around the same time still arrive in send order.
#[derive(Debug, Clone)]
pub enum SinkMessage {
    Event(OutboundEvent),
    Ping,
}

/// One-way channel from the registry (and the connection's own keepalive
/// task) to the transport writer loop for a single connection.
pub type OutboundSink = flume::Sender<SinkMessage>;

/// A lightweight, cloneable handle to a registered connection.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub attributes: ConnectionAttributes,
}

/// Draw a random alphanumeric identifier of the given length.
pub fn generate_connection_id(single_key: bool) -> String {
    let len = if single_key { SINGLE_KEY_ID_LEN } else { MULTI_KEY_ID_LEN };
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_key_ids_are_six_chars() {
        let id = generate_connection_id(true);
        assert_eq!(id.len(), SINGLE_KEY_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn multi_key_ids_are_twelve_chars() {
        let id = generate_connection_id(false);
        assert_eq!(id.len(), MULTI_KEY_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn ids_are_not_trivially_repeated() {
        let a = generate_connection_id(false);
        let b = generate_connection_id(false);
        assert_ne!(a, b, "two draws colliding is astronomically unlikely");
    }
}
