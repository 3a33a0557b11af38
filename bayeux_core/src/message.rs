//! Bayeux message records.
//!
//! A [`Message`] is a single JSON object exchanged between client and server.
//! Messages travel in batches (`Vec<Message>`) and are immutable once handed
//! to a codec for transmission.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known meta channels.
pub mod channel {
    /// Session establishment.
    pub const META_HANDSHAKE: &str = "/meta/handshake";
    /// Long-poll connect; the message that gets suspended.
    pub const META_CONNECT: &str = "/meta/connect";
    /// Session teardown.
    pub const META_DISCONNECT: &str = "/meta/disconnect";
    /// Channel subscription.
    pub const META_SUBSCRIBE: &str = "/meta/subscribe";
    /// Channel unsubscription.
    pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";
    /// Prefix shared by every meta channel.
    pub const META_PREFIX: &str = "/meta/";
}

/// A client identifier assigned by the engine during handshake.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random 128-bit identifier, hex encoded.
    #[must_use]
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::random();
        let mut buf = String::with_capacity(32);
        for byte in bytes {
            use core::fmt::Write;
            let _ = write!(buf, "{byte:02x}");
        }
        Self(buf)
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the client should do after receiving a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    /// Reconnect with another `/meta/connect`.
    Retry,
    /// Start over with a new `/meta/handshake`.
    Handshake,
    /// Do not reconnect.
    None,
}

/// Server advice attached to replies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    /// Reconnect policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,

    /// Delay before the next connect, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,

    /// How long the server holds a connect, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Set when the same browser already holds a suspended connect.
    #[serde(
        default,
        rename = "multiple-clients",
        skip_serializing_if = "Option::is_none"
    )]
    pub multiple_clients: Option<bool>,

    /// Any other advice fields.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// A single Bayeux message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// The channel this message is addressed to.
    pub channel: String,

    /// Correlates a reply with its request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The session this message belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,

    /// Application payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Whether a meta request succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,

    /// Error description on unsuccessful replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Server advice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,

    /// Extension data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,

    /// Protocol version (handshake only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Minimum protocol version (handshake only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,

    /// Connection types offered or supported (handshake only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,

    /// Connection type in use (connect only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,

    /// Target channel of a subscribe/unsubscribe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,

    /// ISO 8601 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Any field not covered above.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl Message {
    /// Create a message addressed to `channel`.
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Self::default()
        }
    }

    /// Start a reply to this message: same channel, id and client.
    #[must_use]
    pub fn reply(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            ..Self::default()
        }
    }

    /// Set the message id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the client id.
    #[must_use]
    pub fn with_client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Set the subscription target.
    #[must_use]
    pub fn with_subscription(mut self, channel: impl Into<String>) -> Self {
        self.subscription = Some(channel.into());
        self
    }

    /// Set the connection type.
    #[must_use]
    pub fn with_connection_type(mut self, connection_type: impl Into<String>) -> Self {
        self.connection_type = Some(connection_type.into());
        self
    }

    /// Whether this message is addressed to a `/meta/*` channel.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.channel.starts_with(channel::META_PREFIX)
    }

    /// Whether this is a `/meta/handshake`.
    #[must_use]
    pub fn is_handshake(&self) -> bool {
        self.channel == channel::META_HANDSHAKE
    }

    /// Whether this is a `/meta/connect`.
    #[must_use]
    pub fn is_connect(&self) -> bool {
        self.channel == channel::META_CONNECT
    }

    /// Whether this reply reports success.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    /// Get the advice, creating an empty one if absent.
    pub fn advice_mut(&mut self) -> &mut Advice {
        self.advice.get_or_insert_with(Advice::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_keeps_correlation_fields() {
        let msg = Message::new(channel::META_CONNECT)
            .with_id("7")
            .with_client_id(ClientId::new("abc"))
            .with_connection_type("long-polling");

        let reply = msg.reply();
        assert_eq!(reply.channel, channel::META_CONNECT);
        assert_eq!(reply.id.as_deref(), Some("7"));
        assert_eq!(reply.client_id, Some(ClientId::new("abc")));
        assert!(reply.connection_type.is_none());
    }

    #[test]
    fn serializes_camel_case_and_skips_absent_fields() {
        let msg = Message::new(channel::META_CONNECT)
            .with_client_id(ClientId::new("abc"))
            .with_connection_type("long-polling");

        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "channel": "/meta/connect",
                "clientId": "abc",
                "connectionType": "long-polling",
            })
        );
    }

    #[test]
    fn advice_uses_hyphenated_multiple_clients() {
        let advice = Advice {
            reconnect: Some(Reconnect::Retry),
            interval: Some(2000),
            multiple_clients: Some(true),
            ..Advice::default()
        };

        let json = serde_json::to_value(&advice).expect("serialize");
        assert_eq!(json["multiple-clients"], Value::Bool(true));
        assert_eq!(json["reconnect"], Value::String("retry".into()));
    }

    #[test]
    fn unknown_fields_are_kept() {
        let json = r#"{"channel":"/chat","custom":{"a":1}}"#;
        let msg: Message = serde_json::from_str(json).expect("deserialize");
        assert_eq!(msg.other.get("custom"), Some(&serde_json::json!({"a": 1})));
    }

    #[test]
    fn client_id_random_is_hex() {
        let id = ClientId::random();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn meta_predicates() {
        assert!(Message::new(channel::META_HANDSHAKE).is_handshake());
        assert!(Message::new(channel::META_CONNECT).is_connect());
        assert!(Message::new(channel::META_SUBSCRIBE).is_meta());
        assert!(!Message::new("/chat/demo").is_meta());
    }
}
