//! # Bayeux HTTP Long Poll
//!
//! HTTP transports for the Bayeux protocol.
//!
//! The server side holds each `/meta/connect` open until the session has
//! messages to deliver or the poll timeout expires, while limiting how many
//! connects a single browser may hold at once. The client side posts message
//! batches and reports each exchange to a listener.
//!
//! ## Features
//!
//! - `client`: HTTP client using [`reqwest`]
//! - `server`: HTTP server using [`axum`]
//! - `metrics`: admission, sweep and request counters

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;

#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Default path the Bayeux endpoint is served on.
pub const DEFAULT_PATH: &str = "/cometd";

/// Name of the POST-based transport.
pub const LONG_POLLING: &str = "long-polling";

/// Name of the JSONP transport.
pub const CALLBACK_POLLING: &str = "callback-polling";

/// Option prefix of the POST-based transport.
pub const LONG_POLLING_PREFIX: &str = "long-polling";

/// Option prefix of the JSONP transport.
pub const CALLBACK_POLLING_PREFIX: &str = "long-polling.jsonp";

/// `Content-Type` of JSON message batches.
pub const JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

/// Body sent when no transport accepts a request.
pub const UNKNOWN_TRANSPORT: &str = "Unknown Bayeux Transport";
