//! Server transport contract.

use core::time::Duration;

use futures::future::BoxFuture;

use crate::{
    browser::{BrowserId, Cookie},
    context::BayeuxContext,
    engine::ServerSession,
    message::ClientId,
    timestamp::TimestampMillis,
};

/// A connect being held open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendedConnection {
    /// The session the connect belongs to.
    pub client_id: ClientId,
    /// The browser the connect was admitted for, if known.
    pub browser: Option<BrowserId>,
    /// When the connect was suspended.
    pub since: TimestampMillis,
    /// How long it may be held.
    pub timeout: Duration,
}

/// How a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Replies (and any queued messages) were produced normally.
    Delivered,

    /// A connect was refused suspension by the per-browser limit.
    Rejected,

    /// The request body did not decode. Nothing was dispatched.
    Malformed,
}

impl Outcome {
    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Outcome::Delivered => "delivered",
            Outcome::Rejected => "rejected",
            Outcome::Malformed => "malformed",
        }
    }
}

/// What to write back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// How the request was resolved.
    pub outcome: Outcome,
    /// `Content-Type` of `body`.
    pub content_type: &'static str,
    /// Encoded reply batch. Empty for malformed requests.
    pub body: String,
    /// Cookies to set.
    pub cookies: Vec<Cookie>,
}

impl TransportResponse {
    /// A response for an undecodable request.
    #[must_use]
    pub fn malformed(cookies: Vec<Cookie>) -> Self {
        Self {
            outcome: Outcome::Malformed,
            content_type: "text/plain; charset=utf-8",
            body: String::new(),
            cookies,
        }
    }
}

/// A server-side transport.
///
/// Implementations are shared across all requests, so every method takes
/// `&self`.
pub trait ServerTransport: Send + Sync {
    /// Connection type name, as advertised during handshake.
    fn name(&self) -> &str;

    /// Whether this transport handles the request. Must not have side effects.
    fn accept(&self, ctx: &dyn BayeuxContext) -> bool;

    /// Process one request.
    fn handle<'a>(
        &'a self,
        ctx: &'a dyn BayeuxContext,
        body: String,
    ) -> BoxFuture<'a, TransportResponse>;

    /// Called right before a connect is suspended.
    fn on_suspend(&self, _conn: &SuspendedConnection, _session: &dyn ServerSession) {}

    /// Called once a suspended connect resumes, on every exit path.
    fn on_resume(&self, _conn: &SuspendedConnection, _session: &dyn ServerSession) {}

    /// Reclaim idle bookkeeping. Returns the number of entries evicted.
    fn sweep(&self, _now: TimestampMillis) -> usize {
        0
    }
}
