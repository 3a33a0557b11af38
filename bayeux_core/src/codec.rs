//! Message batch (de)serialization.
//!
//! Transports never touch JSON directly; they go through a [`Codec`] chosen
//! once at construction time. Codecs are immutable and shared behind an
//! [`Arc`], so a single instance serves every concurrent request.

use core::fmt;
use std::sync::Arc;

use crate::{
    error::{ConfigError, MalformedMessage},
    message::Message,
};

/// Encodes and decodes message batches.
pub trait Codec: fmt::Debug + Send + Sync {
    /// Registry name of this codec.
    fn name(&self) -> &'static str;

    /// Decode a batch.
    ///
    /// A bare JSON object is accepted as a batch of one.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedMessage`] if `content` is not a message or an array
    /// of messages.
    fn decode(&self, content: &str) -> Result<Vec<Message>, MalformedMessage>;

    /// Encode a batch as a JSON array.
    fn encode(&self, messages: &[Message]) -> String;
}

/// Compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

/// Indented JSON, handy when reading traffic in logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrettyJsonCodec;

fn decode_json(content: &str) -> Result<Vec<Message>, MalformedMessage> {
    let decoded = if content.trim_start().starts_with('{') {
        serde_json::from_str::<Message>(content).map(|message| vec![message])
    } else {
        serde_json::from_str::<Vec<Message>>(content)
    };

    decoded.map_err(|source| MalformedMessage {
        content: content.to_owned(),
        source,
    })
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        CodecRegistry::JSON
    }

    fn decode(&self, content: &str) -> Result<Vec<Message>, MalformedMessage> {
        decode_json(content)
    }

    fn encode(&self, messages: &[Message]) -> String {
        serde_json::to_string(messages).unwrap_or_else(|_| String::from("[]"))
    }
}

impl Codec for PrettyJsonCodec {
    fn name(&self) -> &'static str {
        CodecRegistry::JSON_PRETTY
    }

    fn decode(&self, content: &str) -> Result<Vec<Message>, MalformedMessage> {
        decode_json(content)
    }

    fn encode(&self, messages: &[Message]) -> String {
        serde_json::to_string_pretty(messages).unwrap_or_else(|_| String::from("[]"))
    }
}

/// How a transport should obtain its codec.
#[derive(Debug, Clone, Default)]
pub enum CodecOption {
    /// The registry default ([`JsonCodec`]).
    #[default]
    Default,

    /// Look up a codec by registry name.
    Named(String),

    /// Use this instance as-is.
    Instance(Arc<dyn Codec>),
}

impl CodecOption {
    /// Resolve against the registry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownCodec`] if a named codec is not registered.
    pub fn resolve(&self) -> Result<Arc<dyn Codec>, ConfigError> {
        match self {
            CodecOption::Default => Ok(CodecRegistry::default_codec()),
            CodecOption::Named(name) => CodecRegistry::lookup(name),
            CodecOption::Instance(codec) => Ok(Arc::clone(codec)),
        }
    }
}

impl From<Arc<dyn Codec>> for CodecOption {
    fn from(codec: Arc<dyn Codec>) -> Self {
        CodecOption::Instance(codec)
    }
}

/// The static set of built-in codecs.
#[derive(Debug, Clone, Copy)]
pub struct CodecRegistry;

impl CodecRegistry {
    /// Name of [`JsonCodec`].
    pub const JSON: &'static str = "json";

    /// Name of [`PrettyJsonCodec`].
    pub const JSON_PRETTY: &'static str = "json-pretty";

    /// Every registered name.
    pub const NAMES: [&'static str; 2] = [Self::JSON, Self::JSON_PRETTY];

    /// The codec used when none is configured.
    #[must_use]
    pub fn default_codec() -> Arc<dyn Codec> {
        Arc::new(JsonCodec)
    }

    /// Look up a codec by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownCodec`] for unregistered names.
    pub fn lookup(name: &str) -> Result<Arc<dyn Codec>, ConfigError> {
        match name {
            Self::JSON => Ok(Arc::new(JsonCodec)),
            Self::JSON_PRETTY => Ok(Arc::new(PrettyJsonCodec)),
            other => Err(ConfigError::UnknownCodec(other.to_owned())),
        }
    }
}
