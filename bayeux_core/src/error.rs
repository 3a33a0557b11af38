//! Error types shared by Bayeux transports.

use thiserror::Error;

use crate::browser::BrowserId;

/// A message batch could not be decoded.
#[derive(Debug, Error)]
#[error("malformed message batch: {source}")]
pub struct MalformedMessage {
    /// The raw content that failed to parse.
    pub content: String,

    /// Underlying decoder error.
    #[source]
    pub source: serde_json::Error,
}

/// Invalid transport configuration.
///
/// These are fatal at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The named codec is not registered.
    #[error("unknown codec: {0}")]
    UnknownCodec(String),

    /// An option value could not be parsed.
    #[error("invalid value {value:?} for option {key}")]
    InvalidOption {
        /// Fully-qualified option key.
        key: String,
        /// The rejected value.
        value: String,
    },
}

/// A release was attempted on a browser whose admission count is already zero.
///
/// This is a pairing fault in the caller. The counter is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("admission counter underflow for browser {browser}")]
pub struct CounterUnderflow {
    /// The browser whose counter would have gone negative.
    pub browser: BrowserId,
}

/// Problem writing to the HTTP session attached to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionAttributeError {
    /// No HTTP session is attached to the request.
    #[error("no HTTP session attached to request")]
    NoSession,
}
