//! The `long-polling` transport: message batches in POST bodies.

use bayeux_core::{
    codec::CodecOption,
    context::BayeuxContext,
    engine::Engine,
    error::ConfigError,
    options::TransportOptions,
    timestamp::TimestampMillis,
    transport::{ServerTransport, TransportResponse},
};
use futures::{FutureExt, future::BoxFuture};

use super::http_transport::HttpTransport;
use crate::LONG_POLLING;

/// `Content-Type` of long-polling replies.
pub const CONTENT_TYPE: &str = crate::JSON_CONTENT_TYPE;

/// Accepts POST requests whose body is a JSON message batch.
#[derive(Debug)]
pub struct LongPollingTransport<E> {
    inner: HttpTransport<E>,
}

impl<E: Engine> LongPollingTransport<E> {
    /// Build the transport.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the codec cannot be resolved.
    pub fn new(engine: E, options: TransportOptions, codec: &CodecOption) -> Result<Self, ConfigError> {
        Ok(Self {
            inner: HttpTransport::new(LONG_POLLING, engine, options, codec)?,
        })
    }

    /// The shared long-poll state.
    #[must_use]
    pub const fn inner(&self) -> &HttpTransport<E> {
        &self.inner
    }
}

impl<E: Engine> ServerTransport for LongPollingTransport<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn accept(&self, ctx: &dyn BayeuxContext) -> bool {
        ctx.method() == "POST"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a dyn BayeuxContext,
        body: String,
    ) -> BoxFuture<'a, TransportResponse> {
        async move {
            let Ok(messages) = self.inner.parse(&body) else {
                return TransportResponse::malformed(Vec::new());
            };

            let exchange = self.inner.process(self, ctx, messages).await;
            TransportResponse {
                outcome: exchange.outcome,
                content_type: CONTENT_TYPE,
                body: self.inner.codec().encode(&exchange.messages),
                cookies: exchange.cookies,
            }
        }
        .boxed()
    }

    fn sweep(&self, now: TimestampMillis) -> usize {
        self.inner.sweep(now)
    }
}
