//! Transport contracts.
//!
//! - [`server::ServerTransport`] handles inbound HTTP requests carrying
//!   message batches, possibly suspending them until the session has
//!   something to deliver
//! - [`client::ClientTransport`] sends batches to a server and reports the
//!   outcome to a [`client::TransportListener`]

pub mod client;
pub mod server;

pub use client::{ClientOptions, ClientTransport, TransportFailure, TransportListener};
pub use server::{Outcome, ServerTransport, SuspendedConnection, TransportResponse};
