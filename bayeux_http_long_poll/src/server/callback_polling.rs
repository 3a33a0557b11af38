//! The `callback-polling` transport: JSONP over GET.
//!
//! Messages arrive in one or more `message` query parameters and the reply
//! batch is wrapped in a call to the function named by the `jsonp` parameter.

use bayeux_core::{
    CALLBACK_PARAM, MESSAGE_PARAM,
    codec::CodecOption,
    context::BayeuxContext,
    engine::Engine,
    error::ConfigError,
    options::TransportOptions,
    timestamp::TimestampMillis,
    transport::{ServerTransport, TransportResponse},
};
use futures::{FutureExt, future::BoxFuture};
use tracing::warn;

use super::http_transport::HttpTransport;
use crate::CALLBACK_POLLING;

/// `Content-Type` of callback-polling replies.
pub const CONTENT_TYPE: &str = "text/javascript;charset=UTF-8";

/// Accepts GET requests carrying a JSONP callback name.
#[derive(Debug)]
pub struct CallbackPollingTransport<E> {
    inner: HttpTransport<E>,
}

impl<E: Engine> CallbackPollingTransport<E> {
    /// Build the transport.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the codec cannot be resolved.
    pub fn new(engine: E, options: TransportOptions, codec: &CodecOption) -> Result<Self, ConfigError> {
        Ok(Self {
            inner: HttpTransport::new(CALLBACK_POLLING, engine, options, codec)?,
        })
    }

    /// The shared long-poll state.
    #[must_use]
    pub const fn inner(&self) -> &HttpTransport<E> {
        &self.inner
    }
}

/// Whether `name` is safe to emit as a JavaScript function reference.
fn is_valid_callback(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '$' | '.'))
}

impl<E: Engine> ServerTransport for CallbackPollingTransport<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn accept(&self, ctx: &dyn BayeuxContext) -> bool {
        ctx.method() == "GET" && ctx.parameter(CALLBACK_PARAM).is_some()
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a dyn BayeuxContext,
        _body: String,
    ) -> BoxFuture<'a, TransportResponse> {
        async move {
            let callback = ctx.parameter(CALLBACK_PARAM).unwrap_or_default();
            if !is_valid_callback(&callback) {
                warn!(%callback, "rejecting invalid JSONP callback name");
                return TransportResponse::malformed(Vec::new());
            }

            let mut messages = Vec::new();
            for content in ctx.parameter_values(MESSAGE_PARAM) {
                match self.inner.parse(&content) {
                    Ok(batch) => messages.extend(batch),
                    Err(_) => return TransportResponse::malformed(Vec::new()),
                }
            }

            let exchange = self.inner.process(self, ctx, messages).await;
            let json = self.inner.codec().encode(&exchange.messages);

            TransportResponse {
                outcome: exchange.outcome,
                content_type: CONTENT_TYPE,
                body: format!("{callback}({json})"),
                cookies: exchange.cookies,
            }
        }
        .boxed()
    }

    fn sweep(&self, now: TimestampMillis) -> usize {
        self.inner.sweep(now)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::Request;
    use bayeux_core::{engine::MemoryEngine, transport::Outcome};

    use super::*;
    use crate::server::context::HttpContext;

    fn transport() -> CallbackPollingTransport<Arc<MemoryEngine>> {
        CallbackPollingTransport::new(
            Arc::new(MemoryEngine::new()),
            TransportOptions::default(),
            &CodecOption::Default,
        )
        .expect("transport")
    }

    #[test]
    fn accepts_get_with_callback_only() {
        let t = transport();
        let with = Request::get("/cometd?jsonp=cb").body(()).expect("request").into_parts().0;
        let without = Request::get("/cometd").body(()).expect("request").into_parts().0;
        let post = Request::post("/cometd?jsonp=cb").body(()).expect("request").into_parts().0;

        assert!(t.accept(&HttpContext::new(&with)));
        assert!(!t.accept(&HttpContext::new(&without)));
        assert!(!t.accept(&HttpContext::new(&post)));
    }

    #[test]
    fn callback_name_validation() {
        assert!(is_valid_callback("jQuery123_456"));
        assert!(is_valid_callback("ns.callbacks.$1"));
        assert!(!is_valid_callback(""));
        assert!(!is_valid_callback("alert(1)//"));
    }

    #[tokio::test]
    async fn wraps_reply_in_callback() {
        let t = transport();
        let uri = "/cometd?jsonp=cb&message=%5B%7B%22channel%22%3A%22%2Fmeta%2Fhandshake%22%7D%5D";
        let parts = Request::get(uri).body(()).expect("request").into_parts().0;
        let ctx = HttpContext::new(&parts);

        let resp = t.handle(&ctx, String::new()).await;

        assert_eq!(resp.outcome, Outcome::Delivered);
        assert_eq!(resp.content_type, CONTENT_TYPE);
        assert!(resp.body.starts_with("cb(["));
        assert!(resp.body.ends_with("])"));
        assert!(resp.body.contains("/meta/handshake"));
    }

    #[tokio::test]
    async fn malformed_message_param() {
        let t = transport();
        let parts = Request::get("/cometd?jsonp=cb&message=nope")
            .body(())
            .expect("request")
            .into_parts()
            .0;
        let ctx = HttpContext::new(&parts);

        assert_eq!(t.handle(&ctx, String::new()).await.outcome, Outcome::Malformed);
    }
}
