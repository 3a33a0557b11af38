//! Long-poll logic shared by the HTTP transports.
//!
//! A request carries a batch of messages. Each is dispatched to the engine;
//! if the batch contains a `/meta/connect` for an already-connected session
//! with nothing queued, the request is held until the session has something
//! to deliver or the poll timeout expires. Holding is subject to the
//! per-browser [`BrowserAdmission`] limit, so that one browser's tabs cannot
//! use up all of its connections to the server.

use std::sync::Arc;

use bayeux_core::{
    admission::{AdmissionPermit, BrowserAdmission},
    browser::{BrowserId, BrowserIdentity, Cookie},
    codec::{Codec, CodecOption},
    context::BayeuxContext,
    engine::{Engine, ServerSession},
    error::{ConfigError, MalformedMessage},
    message::{Message, Reconnect},
    options::TransportOptions,
    timestamp::TimestampMillis,
    transport::{Outcome, ServerTransport, SuspendedConnection},
};
use tracing::{debug, trace, warn};

/// Result of processing one request, before encoding.
#[derive(Debug)]
pub struct Exchange {
    /// How the request was resolved.
    pub outcome: Outcome,
    /// Queued session messages followed by the replies.
    pub messages: Vec<Message>,
    /// Cookies to set.
    pub cookies: Vec<Cookie>,
}

/// State and behavior common to the long-poll transports.
#[derive(Debug)]
pub struct HttpTransport<E> {
    name: &'static str,
    engine: E,
    options: TransportOptions,
    identity: BrowserIdentity,
    admission: Arc<BrowserAdmission>,
    codec: Arc<dyn Codec>,
}

/// Why a connect may be held.
enum Hold {
    /// Counted against the browser's limit.
    Counted(AdmissionPermit),
    /// No browser identity, but holding was allowed anyway.
    Uncounted,
}

/// Calls `on_resume` and releases the admission on every exit path.
struct Resume<'a> {
    hooks: &'a dyn ServerTransport,
    conn: SuspendedConnection,
    session: &'a dyn ServerSession,
    _hold: Hold,
}

impl Drop for Resume<'_> {
    fn drop(&mut self) {
        self.hooks.on_resume(&self.conn, self.session);
        #[cfg(feature = "metrics")]
        bayeux_core::metrics::connection_resumed();
        trace!(client = %self.conn.client_id, "resumed");
    }
}

/// Ends the session batch when dropped, including when the request future is.
struct Batch(Arc<dyn ServerSession>);

impl Batch {
    fn start(session: Arc<dyn ServerSession>) -> Self {
        session.start_batch();
        Self(session)
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.0.end_batch();
    }
}

impl<E: Engine> HttpTransport<E> {
    /// Build the shared state.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownCodec`] if `codec` names an unregistered codec.
    pub fn new(
        name: &'static str,
        engine: E,
        options: TransportOptions,
        codec: &CodecOption,
    ) -> Result<Self, ConfigError> {
        let codec = codec.resolve()?;
        let admission = Arc::new(BrowserAdmission::new(
            options.max_sessions_per_browser,
            options.max_interval,
        ));

        Ok(Self {
            name,
            engine,
            identity: options.browser_identity(),
            options,
            admission,
            codec,
        })
    }

    /// Transport name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The configuration in effect.
    #[must_use]
    pub const fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// The per-browser admission table.
    #[must_use]
    pub const fn admission(&self) -> &Arc<BrowserAdmission> {
        &self.admission
    }

    /// The codec used for bodies.
    #[must_use]
    pub const fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// The routing engine.
    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    /// Decode a request body, logging what could not be parsed.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedMessage`] if `content` does not decode.
    pub fn parse(&self, content: &str) -> Result<Vec<Message>, MalformedMessage> {
        if self.options.json_debug {
            debug!(transport = self.name, %content, "request content");
        }

        self.codec.decode(content).inspect_err(|e| {
            warn!(transport = self.name, content = %e.content, error = %e.source, "could not parse messages");
            #[cfg(feature = "metrics")]
            bayeux_core::metrics::malformed_batch();
        })
    }

    /// Evict idle browsers from the admission table.
    pub fn sweep(&self, now: TimestampMillis) -> usize {
        self.admission.sweep_at(now)
    }

    /// Dispatch a decoded batch, holding it if it is an eligible connect.
    ///
    /// `hooks` receives the suspend and resume callbacks.
    pub async fn process(
        &self,
        hooks: &dyn ServerTransport,
        ctx: &dyn BayeuxContext,
        messages: Vec<Message>,
    ) -> Exchange {
        let mut cookies = Vec::new();
        let browser = match self.identity.resolve(ctx) {
            Some(browser) => Some(browser),
            None => {
                // Only trust the id once the client sends it back.
                self.identity.assign(ctx, &mut cookies);
                None
            }
        };

        let batch = if self.options.auto_batch {
            messages
                .first()
                .and_then(|m| m.client_id.as_ref())
                .and_then(|id| self.engine.session(id))
                .map(Batch::start)
        } else {
            None
        };

        let mut replies = Vec::with_capacity(messages.len());
        let mut connect: Option<(usize, bool)> = None;

        for message in messages {
            let is_connect = message.is_connect();
            let was_connected = is_connect
                && message
                    .client_id
                    .as_ref()
                    .and_then(|id| self.engine.session(id))
                    .is_some_and(|s| s.is_connected());

            let mut reply = self.engine.handle(ctx, message).await;
            if is_connect {
                self.add_connect_advice(&mut reply);
                connect = Some((replies.len(), was_connected));
            }
            replies.push(reply);
        }

        drop(batch);

        let mut outcome = Outcome::Delivered;
        let mut queued = Vec::new();

        if let Some((index, was_connected)) = connect
            && let Some(reply) = replies.get_mut(index)
            && let Some(session) = reply.client_id.as_ref().and_then(|id| self.engine.session(id))
        {
            let eligible = reply.is_successful()
                && was_connected
                && session.is_connected()
                && !self.options.timeout.is_zero()
                && session.is_queue_empty().await;

            if eligible {
                match self.hold(ctx, browser.as_ref()) {
                    Some(hold) => {
                        self.suspend(hooks, session.as_ref(), browser, hold).await;
                    }
                    None => {
                        self.reject(reply, browser.as_ref());
                        outcome = Outcome::Rejected;
                    }
                }
            }

            queued = session.take_queue().await;
        }

        queued.extend(replies);

        #[cfg(feature = "metrics")]
        bayeux_core::metrics::request_handled(self.name, outcome.as_str());

        Exchange {
            outcome,
            messages: queued,
            cookies,
        }
    }

    fn hold(&self, ctx: &dyn BayeuxContext, browser: Option<&BrowserId>) -> Option<Hold> {
        match browser {
            Some(browser) => self.admission.admit(browser).map(Hold::Counted),
            None => {
                let cross_origin = ctx.header("Origin").is_some();
                (self.options.allow_multi_sessions_no_browser || cross_origin)
                    .then_some(Hold::Uncounted)
            }
        }
    }

    async fn suspend(
        &self,
        hooks: &dyn ServerTransport,
        session: &dyn ServerSession,
        browser: Option<BrowserId>,
        hold: Hold,
    ) {
        let conn = SuspendedConnection {
            client_id: session.id().clone(),
            browser,
            since: TimestampMillis::now(),
            timeout: self.options.timeout,
        };

        hooks.on_suspend(&conn, session);
        #[cfg(feature = "metrics")]
        bayeux_core::metrics::connection_suspended();
        debug!(transport = self.name, client = %conn.client_id, browser = ?conn.browser, "suspended");

        let _resume = Resume {
            hooks,
            conn,
            session,
            _hold: hold,
        };

        if tokio::time::timeout(self.options.timeout, session.activity())
            .await
            .is_err()
        {
            trace!(client = %session.id(), "poll timeout");
        }
    }

    fn reject(&self, reply: &mut Message, browser: Option<&BrowserId>) {
        let interval = self.options.multi_session_interval;
        let advice = reply.advice_mut();

        if browser.is_some() {
            advice.multiple_clients = Some(true);
        }

        if interval.is_zero() {
            advice.reconnect = Some(Reconnect::None);
            reply.successful = Some(false);
        } else {
            advice.reconnect = Some(Reconnect::Retry);
            advice.interval = Some(millis(interval));
        }

        debug!(transport = self.name, browser = ?browser, "connect not held: too many sessions");
    }

    fn add_connect_advice(&self, reply: &mut Message) {
        if !reply.is_successful() {
            return;
        }
        let timeout = millis(self.options.timeout);
        let interval = millis(self.options.interval);
        let advice = reply.advice_mut();
        advice.reconnect.get_or_insert(Reconnect::Retry);
        advice.timeout.get_or_insert(timeout);
        advice.interval.get_or_insert(interval);
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn millis(d: core::time::Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use axum::http::{Request, request::Parts};
    use bayeux_core::{
        admission::SessionLimit,
        engine::MemoryEngine,
        message::{ClientId, channel},
        transport::TransportResponse,
    };
    use futures::{FutureExt, future::BoxFuture};
    use serde_json::Value;

    use super::*;
    use crate::server::context::HttpContext;

    struct Hooks {
        suspended: std::sync::atomic::AtomicUsize,
        resumed: std::sync::atomic::AtomicUsize,
    }

    impl ServerTransport for Hooks {
        fn name(&self) -> &str {
            "hooks"
        }

        fn accept(&self, _ctx: &dyn BayeuxContext) -> bool {
            true
        }

        fn handle<'a>(&'a self, _ctx: &'a dyn BayeuxContext, _body: String) -> BoxFuture<'a, TransportResponse> {
            async { TransportResponse::malformed(Vec::new()) }.boxed()
        }

        fn on_suspend(&self, _conn: &SuspendedConnection, _session: &dyn ServerSession) {
            self.suspended.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }

        fn on_resume(&self, _conn: &SuspendedConnection, _session: &dyn ServerSession) {
            self.resumed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn hooks() -> Hooks {
        Hooks {
            suspended: 0.into(),
            resumed: 0.into(),
        }
    }

    fn transport(options: TransportOptions) -> HttpTransport<Arc<MemoryEngine>> {
        HttpTransport::new("long-polling", Arc::new(MemoryEngine::new()), options, &CodecOption::Default)
            .expect("transport")
    }

    fn head(cookie: Option<&str>, origin: Option<&str>) -> Parts {
        let mut builder = Request::post("/cometd");
        if let Some(cookie) = cookie {
            builder = builder.header("Cookie", format!("BAYEUX_BROWSER={cookie}"));
        }
        if let Some(origin) = origin {
            builder = builder.header("Origin", origin);
        }
        builder.body(()).expect("request").into_parts().0
    }

    async fn connected_client<E: Engine>(t: &HttpTransport<E>, hooks: &Hooks, parts: &Parts) -> ClientId {
        let ctx = HttpContext::new(parts);
        let exchange = t
            .process(hooks, &ctx, vec![Message::new(channel::META_HANDSHAKE)])
            .await;
        let id = exchange
            .messages
            .first()
            .and_then(|m| m.client_id.clone())
            .expect("client id");

        let exchange = t
            .process(hooks, &ctx, vec![Message::new(channel::META_CONNECT).with_client_id(id.clone())])
            .await;
        assert_eq!(exchange.outcome, Outcome::Delivered);
        id
    }

    fn connect(id: &ClientId) -> Vec<Message> {
        vec![Message::new(channel::META_CONNECT).with_client_id(id.clone())]
    }

    #[tokio::test]
    async fn missing_cookie_assigns_one() {
        let t = transport(TransportOptions::default());
        let parts = head(None, None);
        let ctx = HttpContext::new(&parts);

        let exchange = t
            .process(&hooks(), &ctx, vec![Message::new(channel::META_HANDSHAKE)])
            .await;

        assert_eq!(exchange.cookies.len(), 1);
        assert!(exchange.cookies.first().is_some_and(|c| c.name == "BAYEUX_BROWSER"));
    }

    #[tokio::test]
    async fn first_connect_returns_immediately_with_advice() {
        let t = transport(TransportOptions::default());
        let hooks = hooks();
        let parts = head(Some("b1"), None);
        let ctx = HttpContext::new(&parts);

        let exchange = t
            .process(&hooks, &ctx, vec![Message::new(channel::META_HANDSHAKE)])
            .await;
        let id = exchange.messages.first().and_then(|m| m.client_id.clone()).expect("id");

        let exchange = t.process(&hooks, &ctx, connect(&id)).await;
        let advice = exchange.messages.first().and_then(|m| m.advice.clone()).expect("advice");
        assert_eq!(advice.timeout, Some(30_000));
        assert_eq!(advice.reconnect, Some(Reconnect::Retry));
        assert_eq!(hooks.suspended.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn held_connect_times_out_and_releases() {
        let t = transport(TransportOptions::default().with_timeout(Duration::from_millis(50)));
        let hooks = hooks();
        let parts = head(Some("b1"), None);
        let id = connected_client(&t, &hooks, &parts).await;

        let ctx = HttpContext::new(&parts);
        let exchange = t.process(&hooks, &ctx, connect(&id)).await;

        assert_eq!(exchange.outcome, Outcome::Delivered);
        assert_eq!(hooks.suspended.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(hooks.resumed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(t.admission().count(&BrowserId::new("b1")), Some(0));
    }

    #[tokio::test]
    async fn second_connect_from_same_browser_is_rejected() {
        let t = Arc::new(transport(TransportOptions::default().with_timeout(Duration::from_secs(5))));
        let hooks = Arc::new(hooks());
        let parts = head(Some("b1"), None);
        let first = connected_client(&t, &hooks, &parts).await;
        let second = connected_client(&t, &hooks, &parts).await;

        let held = {
            let t = Arc::clone(&t);
            let hooks = Arc::clone(&hooks);
            let parts = parts.clone();
            tokio::spawn(async move {
                let ctx = HttpContext::new(&parts);
                t.process(hooks.as_ref(), &ctx, connect(&first)).await
            })
        };

        while t.admission().count(&BrowserId::new("b1")) != Some(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let ctx = HttpContext::new(&parts);
        let exchange = t.process(hooks.as_ref(), &ctx, connect(&second)).await;
        assert_eq!(exchange.outcome, Outcome::Rejected);

        let reply = exchange.messages.first().expect("reply");
        let advice = reply.advice.clone().expect("advice");
        assert_eq!(advice.multiple_clients, Some(true));
        assert_eq!(advice.reconnect, Some(Reconnect::Retry));
        assert_eq!(advice.interval, Some(2_000));
        assert!(reply.is_successful());

        held.abort();
        let _ = held.await;
        assert_eq!(t.admission().count(&BrowserId::new("b1")), Some(0));
        assert_eq!(hooks.resumed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_interval_rejection_is_unsuccessful() {
        let t = transport(
            TransportOptions::default()
                .with_max_sessions_per_browser(SessionLimit::Deny)
                .with_multi_session_interval(Duration::ZERO),
        );
        let hooks = hooks();
        let parts = head(Some("b1"), None);
        let id = connected_client(&t, &hooks, &parts).await;

        let ctx = HttpContext::new(&parts);
        let exchange = t.process(&hooks, &ctx, connect(&id)).await;

        assert_eq!(exchange.outcome, Outcome::Rejected);
        let reply = exchange.messages.first().expect("reply");
        assert!(!reply.is_successful());
        assert_eq!(reply.advice.as_ref().and_then(|a| a.reconnect), Some(Reconnect::None));
        assert_eq!(hooks.suspended.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_browser_without_origin_is_rejected_without_multiple_clients() {
        let t = transport(TransportOptions::default());
        let hooks = hooks();
        let parts = head(None, None);
        let id = connected_client(&t, &hooks, &parts).await;

        let ctx = HttpContext::new(&parts);
        let exchange = t.process(&hooks, &ctx, connect(&id)).await;

        assert_eq!(exchange.outcome, Outcome::Rejected);
        let advice = exchange.messages.first().and_then(|m| m.advice.clone()).expect("advice");
        assert_eq!(advice.multiple_clients, None);
    }

    #[tokio::test]
    async fn no_browser_with_origin_is_held() {
        let t = transport(TransportOptions::default().with_timeout(Duration::from_millis(20)));
        let hooks = hooks();
        let parts = head(None, Some("http://other.example"));
        let id = connected_client(&t, &hooks, &parts).await;

        let ctx = HttpContext::new(&parts);
        let exchange = t.process(&hooks, &ctx, connect(&id)).await;

        assert_eq!(exchange.outcome, Outcome::Delivered);
        assert_eq!(hooks.suspended.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(t.admission().is_empty());
    }

    #[tokio::test]
    async fn publish_wakes_held_connect_and_is_delivered_first() {
        let t = Arc::new(transport(TransportOptions::default().with_timeout(Duration::from_secs(5))));
        let hooks = Arc::new(hooks());
        let parts = head(Some("b1"), None);
        let id = connected_client(&t, &hooks, &parts).await;

        let ctx = HttpContext::new(&parts);
        t.process(
            hooks.as_ref(),
            &ctx,
            vec![Message::new(channel::META_SUBSCRIBE)
                .with_client_id(id.clone())
                .with_subscription("/chat")],
        )
        .await;

        let held = {
            let t = Arc::clone(&t);
            let hooks = Arc::clone(&hooks);
            let parts = parts.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let ctx = HttpContext::new(&parts);
                t.process(hooks.as_ref(), &ctx, connect(&id)).await
            })
        };

        while t.admission().count(&BrowserId::new("b1")) != Some(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        t.engine().publish("/chat", Value::from("hello")).await;

        let exchange = tokio::time::timeout(Duration::from_secs(1), held)
            .await
            .expect("woken before timeout")
            .expect("task");

        assert_eq!(exchange.messages.len(), 2);
        assert_eq!(exchange.messages.first().map(|m| m.channel.as_str()), Some("/chat"));
        assert!(exchange.messages.get(1).is_some_and(Message::is_connect));
    }

    /// Never answers messages on `/stall`.
    struct Stalling(Arc<MemoryEngine>);

    impl Engine for Stalling {
        fn handle<'a>(&'a self, ctx: &'a dyn BayeuxContext, message: Message) -> BoxFuture<'a, Message> {
            if message.channel == "/stall" {
                futures::future::pending().boxed()
            } else {
                self.0.handle(ctx, message)
            }
        }

        fn session(&self, client_id: &ClientId) -> Option<Arc<dyn ServerSession>> {
            self.0.session(client_id)
        }
    }

    #[tokio::test]
    async fn dropped_request_still_ends_batch() {
        let engine = Arc::new(MemoryEngine::new());
        let t = Arc::new(
            HttpTransport::new(
                "long-polling",
                Stalling(Arc::clone(&engine)),
                TransportOptions::default().with_timeout(Duration::from_secs(5)),
                &CodecOption::Default,
            )
            .expect("transport"),
        );
        let hooks = Arc::new(hooks());
        let parts = head(Some("b1"), None);
        let id = connected_client(t.as_ref(), &hooks, &parts).await;

        let ctx = HttpContext::new(&parts);
        t.process(
            hooks.as_ref(),
            &ctx,
            vec![Message::new(channel::META_SUBSCRIBE)
                .with_client_id(id.clone())
                .with_subscription("/chat")],
        )
        .await;

        let stalled = {
            let t = Arc::clone(&t);
            let hooks = Arc::clone(&hooks);
            let parts = parts.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let ctx = HttpContext::new(&parts);
                t.process(hooks.as_ref(), &ctx, vec![Message::new("/stall").with_client_id(id)])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        stalled.abort();
        let _ = stalled.await;

        let held = {
            let t = Arc::clone(&t);
            let hooks = Arc::clone(&hooks);
            let parts = parts.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let ctx = HttpContext::new(&parts);
                t.process(hooks.as_ref(), &ctx, connect(&id)).await
            })
        };
        while t.admission().count(&BrowserId::new("b1")) != Some(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        engine.publish("/chat", Value::from("hello")).await;

        let exchange = tokio::time::timeout(Duration::from_secs(1), held)
            .await
            .expect("woken before timeout")
            .expect("task");
        assert_eq!(exchange.messages.first().map(|m| m.channel.as_str()), Some("/chat"));
    }

    #[test]
    fn unknown_codec_fails_construction() {
        let err = HttpTransport::new(
            "long-polling",
            Arc::new(MemoryEngine::new()),
            TransportOptions::default(),
            &CodecOption::Named("bson".into()),
        )
        .expect_err("unknown codec");
        assert_eq!(err, ConfigError::UnknownCodec("bson".into()));
    }
}
