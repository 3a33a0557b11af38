//! # Bayeux Core
//!
//! Transport-independent building blocks for serving and consuming the Bayeux
//! publish/subscribe protocol over long-held HTTP requests.
//!
//! - [`browser`]: per-browser identity carried in a cookie
//! - [`admission`]: lock-free bound on concurrently suspended connections
//!   per browser, with a lazy sweep of idle bookkeeping
//! - [`context`]: read-only view of the inbound request
//! - [`codec`]: pluggable message (de)serialization
//! - [`engine`]: the routing collaborator the transports dispatch to
//! - [`transport`]: server and client transport contracts
//!
//! ## Features
//!
//! - `metrics`: record admission and sweep counters via [`metrics`](https://docs.rs/metrics)

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod admission;
pub mod browser;
pub mod codec;
pub mod context;
pub mod engine;
pub mod error;
pub mod message;
pub mod options;
pub mod timestamp;
pub mod transport;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

/// Bayeux protocol version spoken by this implementation.
pub const BAYEUX_VERSION: &str = "1.0";

/// Default name of the browser identity cookie.
pub const DEFAULT_BROWSER_COOKIE: &str = "BAYEUX_BROWSER";

/// Name of the query parameter carrying messages for GET-based transports.
pub const MESSAGE_PARAM: &str = "message";

/// Name of the query parameter carrying the JSONP callback function.
pub const CALLBACK_PARAM: &str = "jsonp";
