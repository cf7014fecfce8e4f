//! The Subscription triple.
//!
//! A Subscription has no identity beyond `(connection, apiKey, topic)` - it
//! is modeled as a value type, never an owning back-pointer, matching the
//! "cyclic references become value triples" design note.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub conn_id: String,
    pub api_key: String,
    pub topic: String,
}

impl Subscription {
    pub fn new(conn_id: impl Into<String>, api_key: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            api_key: api_key.into(),
            topic: topic.into(),
        }
    }
}
