//! Client transport contract.

use core::time::Duration;
use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

use crate::{
    codec::{Codec, CodecOption},
    error::{ConfigError, MalformedMessage},
    message::Message,
    options::OptionLookup,
};

/// Option keys understood by [`ClientOptions::from_options`].
pub mod keys {
    /// How long the server is expected to hold a connect, in milliseconds.
    pub const TIMEOUT: &str = "timeout";
    /// Pause between polls, in milliseconds.
    pub const INTERVAL: &str = "interval";
    /// Allowance for network latency on every request, in milliseconds.
    pub const MAX_NETWORK_DELAY: &str = "maxNetworkDelay";
    /// Registry name of the codec.
    pub const CODEC: &str = "jsonContext";
}

/// Why an exchange did not produce messages.
#[derive(Debug, Error)]
pub enum TransportFailure {
    /// The exchange was cancelled by [`ClientTransport::abort`].
    #[error("exchange aborted")]
    Aborted,

    /// The transport was terminated before or during the exchange.
    #[error("transport terminated")]
    Terminated,

    /// The request could not be completed.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The server answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// The server's reply did not decode.
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),
}

/// Receives the outcome of [`ClientTransport::send`].
///
/// For each `send`, exactly one of [`on_messages`](Self::on_messages) or
/// [`on_failure`](Self::on_failure) is called.
pub trait TransportListener: Send + Sync {
    /// The batch is about to be written.
    fn on_sending(&self, _messages: &[Message]) {}

    /// The server replied with `messages`.
    fn on_messages(&self, messages: Vec<Message>);

    /// The exchange failed; `messages` is the batch that was sent.
    fn on_failure(&self, failure: TransportFailure, messages: Vec<Message>);
}

/// Client transport settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// How long the server is expected to hold a connect.
    pub timeout: Duration,
    /// Pause between polls.
    pub interval: Duration,
    /// Allowance for network latency on every request.
    pub max_network_delay: Duration,
    /// Codec to use.
    pub codec: CodecOption,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            interval: Duration::ZERO,
            max_network_delay: Duration::from_millis(10_000),
            codec: CodecOption::Default,
        }
    }
}

impl ClientOptions {
    /// Read options from a flat string map. Absent keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] if a value does not parse.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let lookup = OptionLookup::new(options, "");
        let mut out = Self::default();

        if let Some(ms) = lookup.millis(keys::TIMEOUT)? {
            out.timeout = ms;
        }
        if let Some(ms) = lookup.millis(keys::INTERVAL)? {
            out.interval = ms;
        }
        if let Some(ms) = lookup.millis(keys::MAX_NETWORK_DELAY)? {
            out.max_network_delay = ms;
        }
        if let Some((_, name)) = lookup.get(keys::CODEC) {
            out.codec = CodecOption::Named(name.to_owned());
        }

        Ok(out)
    }

    /// Total time allowed for an exchange carrying `messages`.
    ///
    /// A batch with a `/meta/connect` may be held by the server for
    /// [`timeout`](Self::timeout) on top of the network allowance.
    #[must_use]
    pub fn request_timeout(&self, messages: &[Message]) -> Duration {
        if messages.iter().any(Message::is_connect) {
            self.max_network_delay.saturating_add(self.timeout)
        } else {
            self.max_network_delay
        }
    }
}

/// A client-side transport.
pub trait ClientTransport: Send + Sync {
    /// Connection type name.
    fn name(&self) -> &str;

    /// The codec chosen at construction.
    fn codec(&self) -> &Arc<dyn Codec>;

    /// Whether this transport speaks Bayeux `version`.
    fn accept(&self, version: &str) -> bool;

    /// Start an exchange and return immediately.
    ///
    /// The outcome is reported to `listener` exactly once.
    fn send(&self, listener: Arc<dyn TransportListener>, messages: Vec<Message>);

    /// Fail every pending exchange with [`TransportFailure::Aborted`].
    ///
    /// Safe to call repeatedly and concurrently.
    fn abort(&self);

    /// Release resources. Later sends fail with [`TransportFailure::Terminated`].
    fn terminate(&self) {}

    /// Decode a reply body with this transport's codec.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedMessage`] if `content` does not decode.
    fn parse_messages(&self, content: &str) -> Result<Vec<Message>, MalformedMessage> {
        self.codec().decode(content)
    }

    /// Encode a batch with this transport's codec.
    fn generate(&self, messages: &[Message]) -> String {
        self.codec().encode(messages)
    }
}
