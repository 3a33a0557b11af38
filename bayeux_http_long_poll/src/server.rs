//! HTTP long-polling server implementation.
//!
//! Provides an Axum router that dispatches each request to the first
//! transport that accepts it.

pub mod callback_polling;
pub mod context;
mod handlers;
pub mod http_transport;
pub mod long_polling;
mod sweeper;

pub use callback_polling::CallbackPollingTransport;
pub use context::{HttpContext, HttpSession, LocalAddr};
pub use handlers::router;
pub use http_transport::{Exchange, HttpTransport};
pub use long_polling::LongPollingTransport;
pub use sweeper::{MIN_SWEEP_PERIOD, spawn_sweeper};

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::Extension;
use bayeux_core::{
    codec::CodecOption, context::ServerContext, engine::Engine, error::ConfigError,
    options::TransportOptions, timestamp::TimestampMillis, transport::ServerTransport,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{CALLBACK_POLLING_PREFIX, DEFAULT_PATH, LONG_POLLING_PREFIX, error::ServerError};

/// A set of transports served on one path.
pub struct BayeuxServer {
    path: String,
    transports: Vec<Arc<dyn ServerTransport>>,
    context: Arc<ServerContext>,
}

impl core::fmt::Debug for BayeuxServer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BayeuxServer")
            .field("path", &self.path)
            .field(
                "transports",
                &self.transports.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl BayeuxServer {
    /// Start configuring a server around `engine`.
    pub fn builder<E: Engine + Clone + 'static>(engine: E) -> BayeuxServerBuilder<E> {
        BayeuxServerBuilder::new(engine)
    }

    /// Serve exactly these transports, in priority order.
    #[must_use]
    pub fn from_transports(path: impl Into<String>, transports: Vec<Arc<dyn ServerTransport>>) -> Self {
        Self {
            path: path.into(),
            transports,
            context: Arc::default(),
        }
    }

    /// Replace the endpoint-wide context handed to every request.
    #[must_use]
    pub fn with_context(mut self, context: ServerContext) -> Self {
        self.context = Arc::new(context);
        self
    }

    /// Attributes and init parameters shared by every request.
    #[must_use]
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// The path the endpoint is served on.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Transports in priority order.
    #[must_use]
    pub fn transports(&self) -> &[Arc<dyn ServerTransport>] {
        &self.transports
    }

    /// Sweep every transport. Returns the total number of evictions.
    pub fn sweep(&self, now: TimestampMillis) -> usize {
        self.transports.iter().map(|t| t.sweep(now)).sum()
    }

    /// Bind `addr` and serve until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if binding or serving fails.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr, token: CancellationToken) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener, token).await
    }

    /// Serve on an already bound listener until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if serving fails.
    pub async fn serve_listener(
        self: Arc<Self>,
        listener: TcpListener,
        token: CancellationToken,
    ) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, path = %self.path, "Bayeux server listening");

        let app = router(self).layer(Extension(LocalAddr(local)));
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

        Ok(())
    }
}

/// Builder for [`BayeuxServer`].
#[derive(Debug)]
pub struct BayeuxServerBuilder<E> {
    engine: E,
    path: String,
    codec: CodecOption,
    long_polling: TransportOptions,
    callback_polling: Option<TransportOptions>,
    context: ServerContext,
}

impl<E: Engine + Clone + 'static> BayeuxServerBuilder<E> {
    /// Defaults: both transports, default options, served on [`DEFAULT_PATH`].
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            path: String::from(DEFAULT_PATH),
            codec: CodecOption::Default,
            long_polling: TransportOptions::default(),
            callback_polling: Some(TransportOptions::default()),
            context: ServerContext::default(),
        }
    }

    /// Set the endpoint-wide context.
    #[must_use]
    pub fn context(mut self, context: ServerContext) -> Self {
        self.context = context;
        self
    }

    /// Set the path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Set the codec.
    #[must_use]
    pub fn codec(mut self, codec: CodecOption) -> Self {
        self.codec = codec;
        self
    }

    /// Use `options` for every transport.
    #[must_use]
    pub fn options(mut self, options: TransportOptions) -> Self {
        if self.callback_polling.is_some() {
            self.callback_polling = Some(options.clone());
        }
        self.long_polling = options;
        self
    }

    /// Read each transport's options from a flat map using its prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] if a value does not parse.
    pub fn option_map(mut self, map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        self.long_polling = TransportOptions::from_options(map, LONG_POLLING_PREFIX)?;
        if self.callback_polling.is_some() {
            self.callback_polling = Some(TransportOptions::from_options(map, CALLBACK_POLLING_PREFIX)?);
        }
        Ok(self)
    }

    /// Disable the JSONP transport.
    #[must_use]
    pub fn without_callback_polling(mut self) -> Self {
        self.callback_polling = None;
        self
    }

    /// Build the server.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the codec cannot be resolved.
    pub fn build(self) -> Result<Arc<BayeuxServer>, ConfigError> {
        let mut transports: Vec<Arc<dyn ServerTransport>> = vec![Arc::new(LongPollingTransport::new(
            self.engine.clone(),
            self.long_polling,
            &self.codec,
        )?)];

        if let Some(options) = self.callback_polling {
            transports.push(Arc::new(CallbackPollingTransport::new(
                self.engine,
                options,
                &self.codec,
            )?));
        }

        Ok(Arc::new(
            BayeuxServer::from_transports(self.path, transports).with_context(self.context),
        ))
    }
}
