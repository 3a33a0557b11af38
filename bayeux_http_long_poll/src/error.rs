//! Error types for the HTTP transports.

use bayeux_core::error::ConfigError;
use thiserror::Error;

/// Problem while building a client transport.
#[derive(Debug, Error)]
pub enum ClientBuildError {
    /// Invalid transport configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The underlying HTTP client could not be created.
    #[cfg(feature = "client")]
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server URL is not an absolute `http` or `https` URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

/// Problem while building or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid transport configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Binding or serving failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
