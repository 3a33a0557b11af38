//! In-memory [`Engine`].
//!
//! Supports handshake, connect, disconnect, subscribe, unsubscribe and
//! publish on exact channel names. There are no wildcards, no authorization
//! and no session expiry.

use core::pin::pin;
use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_lock::Mutex;
use dashmap::DashMap;
use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;
use tokio::sync::Notify;

use super::{Engine, ServerSession};
use crate::{
    BAYEUX_VERSION,
    context::BayeuxContext,
    message::{Advice, ClientId, Message, Reconnect, channel},
};

/// Connection types advertised during handshake.
pub const SUPPORTED_CONNECTION_TYPES: [&str; 2] = ["long-polling", "callback-polling"];

/// A session held by [`MemoryEngine`].
#[derive(Debug)]
pub struct MemorySession {
    id: ClientId,
    queue: Mutex<Vec<Message>>,
    connected: AtomicBool,
    disconnected: AtomicBool,
    batch_depth: AtomicUsize,
    notify: Notify,
}

impl MemorySession {
    fn new(id: ClientId) -> Self {
        Self {
            id,
            queue: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            batch_depth: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Queue a message for delivery.
    pub async fn deliver(&self, message: Message) {
        self.queue.lock().await.push(message);
        if self.batch_depth.load(Ordering::Acquire) == 0 {
            self.notify.notify_waiters();
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.disconnected.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn ready(&self) -> bool {
        self.disconnected.load(Ordering::Acquire) || !self.queue.lock().await.is_empty()
    }
}

impl ServerSession for MemorySession {
    fn id(&self) -> &ClientId {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn is_queue_empty(&self) -> BoxFuture<'_, bool> {
        async move { self.queue.lock().await.is_empty() }.boxed()
    }

    fn take_queue(&self) -> BoxFuture<'_, Vec<Message>> {
        async move { core::mem::take(&mut *self.queue.lock().await) }.boxed()
    }

    fn activity(&self) -> BoxFuture<'_, ()> {
        async move {
            loop {
                let mut notified = pin!(self.notify.notified());
                notified.as_mut().enable();

                if self.ready().await {
                    return;
                }

                notified.await;

                if self.ready().await {
                    return;
                }
            }
        }
        .boxed()
    }

    fn start_batch(&self) {
        self.batch_depth.fetch_add(1, Ordering::AcqRel);
    }

    fn end_batch(&self) {
        let previous = self
            .batch_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.notify.notify_waiters();
        }
    }
}

/// Sessions and subscriptions kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    sessions: DashMap<ClientId, Arc<MemorySession>>,
    subscriptions: DashMap<String, HashSet<ClientId>>,
}

impl MemoryEngine {
    /// An engine with no sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Deliver `data` to every subscriber of `channel`.
    ///
    /// Returns the number of sessions the message was queued for.
    pub async fn publish(&self, channel: &str, data: Value) -> usize {
        let message = Message::new(channel).with_data(data);
        self.broadcast(message).await
    }

    async fn broadcast(&self, message: Message) -> usize {
        let targets: Vec<Arc<MemorySession>> = self
            .subscriptions
            .get(&message.channel)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter_map(|id| self.sessions.get(id).map(|s| Arc::clone(s.value())))
                    .collect()
            })
            .unwrap_or_default();

        for session in &targets {
            session.deliver(message.clone()).await;
        }

        tracing::trace!(channel = %message.channel, subscribers = targets.len(), "published");
        targets.len()
    }

    fn live_session(&self, message: &Message) -> Option<Arc<MemorySession>> {
        let id = message.client_id.as_ref()?;
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    fn handshake(&self, message: &Message) -> Message {
        let id = ClientId::random();
        self.sessions
            .insert(id.clone(), Arc::new(MemorySession::new(id.clone())));

        let mut reply = message.reply();
        reply.client_id = Some(id.clone());
        reply.successful = Some(true);
        reply.version = Some(BAYEUX_VERSION.to_owned());
        reply.supported_connection_types =
            Some(SUPPORTED_CONNECTION_TYPES.iter().map(|s| (*s).to_owned()).collect());
        reply.advice = Some(Advice {
            reconnect: Some(Reconnect::Retry),
            interval: Some(0),
            ..Advice::default()
        });

        tracing::debug!(client = %id, "handshake");
        reply
    }

    fn connect(&self, message: &Message) -> Message {
        let mut reply = message.reply();
        if let Some(session) = self.live_session(message) {
            session.connected.store(true, Ordering::Release);
            reply.successful = Some(true);
        } else {
            unknown_client(&mut reply);
        }
        reply
    }

    fn disconnect(&self, message: &Message) -> Message {
        let mut reply = message.reply();
        let removed = message
            .client_id
            .as_ref()
            .and_then(|id| self.sessions.remove(id));

        if let Some((id, session)) = removed {
            session.disconnect();
            for mut subscribers in self.subscriptions.iter_mut() {
                subscribers.remove(&id);
            }
            self.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
            tracing::debug!(client = %id, "disconnect");
            reply.successful = Some(true);
        } else {
            unknown_client(&mut reply);
        }
        reply
    }

    fn subscription(&self, message: &Message, subscribe: bool) -> Message {
        let mut reply = message.reply();
        reply.subscription.clone_from(&message.subscription);

        let Some(session) = self.live_session(message) else {
            unknown_client(&mut reply);
            return reply;
        };
        let Some(target) = message.subscription.as_ref().filter(|s| s.starts_with('/')) else {
            reply.successful = Some(false);
            reply.error = Some(String::from("403::invalid subscription"));
            return reply;
        };

        if subscribe {
            self.subscriptions
                .entry(target.clone())
                .or_default()
                .insert(session.id.clone());
        } else if let Some(mut subscribers) = self.subscriptions.get_mut(target) {
            subscribers.remove(&session.id);
        }

        reply.successful = Some(true);
        reply
    }
}

fn unknown_client(reply: &mut Message) {
    reply.successful = Some(false);
    reply.error = Some(String::from("402::Unknown client"));
    reply.advice = Some(Advice {
        reconnect: Some(Reconnect::Handshake),
        interval: Some(0),
        ..Advice::default()
    });
}

impl Engine for MemoryEngine {
    fn handle<'a>(&'a self, _ctx: &'a dyn BayeuxContext, message: Message) -> BoxFuture<'a, Message> {
        async move {
            match message.channel.as_str() {
                channel::META_HANDSHAKE => self.handshake(&message),
                channel::META_CONNECT => self.connect(&message),
                channel::META_DISCONNECT => self.disconnect(&message),
                channel::META_SUBSCRIBE => self.subscription(&message, true),
                channel::META_UNSUBSCRIBE => self.subscription(&message, false),
                _ if message.is_meta() => {
                    let mut reply = message.reply();
                    reply.successful = Some(false);
                    reply.error = Some(format!("400::unknown channel {}", message.channel));
                    reply
                }
                _ => {
                    let mut reply = message.reply();
                    if self.live_session(&message).is_none() {
                        unknown_client(&mut reply);
                        return reply;
                    }

                    let mut published = Message::new(message.channel.clone());
                    published.id.clone_from(&message.id);
                    published.data.clone_from(&message.data);
                    published.ext.clone_from(&message.ext);
                    self.broadcast(published).await;

                    reply.successful = Some(true);
                    reply
                }
            }
        }
        .boxed()
    }

    fn session(&self, client_id: &ClientId) -> Option<Arc<dyn ServerSession>> {
        self.sessions
            .get(client_id)
            .map(|s| Arc::clone(s.value()) as Arc<dyn ServerSession>)
    }
}
