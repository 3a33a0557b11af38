//! The routing engine the transports dispatch to.
//!
//! Transports decode requests, enforce admission and suspend connections;
//! everything about channels, subscriptions and sessions belongs to an
//! [`Engine`]. [`MemoryEngine`] is a small in-process implementation that is
//! enough to run the transports end to end.

pub mod memory;

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{
    context::BayeuxContext,
    message::{ClientId, Message},
};

pub use memory::{MemoryEngine, MemorySession};

/// Server-side state of one Bayeux client.
pub trait ServerSession: Send + Sync {
    /// The session id.
    fn id(&self) -> &ClientId;

    /// Whether a `/meta/connect` has completed and no disconnect followed.
    fn is_connected(&self) -> bool;

    /// Whether no messages are waiting for delivery.
    fn is_queue_empty(&self) -> BoxFuture<'_, bool>;

    /// Remove and return every queued message.
    fn take_queue(&self) -> BoxFuture<'_, Vec<Message>>;

    /// Resolve once there is something to deliver or the session disconnects.
    ///
    /// Resolves immediately if either is already the case.
    fn activity(&self) -> BoxFuture<'_, ()>;

    /// Defer wake-ups until the matching [`end_batch`](Self::end_batch).
    fn start_batch(&self);

    /// Close a batch; wakes a waiting connection if messages were queued.
    fn end_batch(&self);
}

/// Routes messages and owns sessions.
pub trait Engine: Send + Sync {
    /// Process one inbound message and produce its reply.
    fn handle<'a>(&'a self, ctx: &'a dyn BayeuxContext, message: Message) -> BoxFuture<'a, Message>;

    /// Look up a live session.
    fn session(&self, client_id: &ClientId) -> Option<Arc<dyn ServerSession>>;
}

impl<E: Engine + ?Sized> Engine for Arc<E> {
    fn handle<'a>(&'a self, ctx: &'a dyn BayeuxContext, message: Message) -> BoxFuture<'a, Message> {
        (**self).handle(ctx, message)
    }

    fn session(&self, client_id: &ClientId) -> Option<Arc<dyn ServerSession>> {
        (**self).session(client_id)
    }
}
