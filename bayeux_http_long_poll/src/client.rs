//! HTTP long-polling client transport.
//!
//! [`LongPollingClient`] posts each batch to the server in its own request
//! and reports the reply to the batch's listener. A cookie store keeps the
//! browser identity cookie across requests, as a browser would.

use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicU64, Ordering},
};

use bayeux_core::{
    BAYEUX_VERSION,
    codec::Codec,
    message::Message,
    transport::{ClientOptions, ClientTransport, TransportFailure, TransportListener},
};
use dashmap::DashMap;
use reqwest::{Client, header::CONTENT_TYPE};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::{JSON_CONTENT_TYPE, LONG_POLLING, error::ClientBuildError};

struct PendingExchange {
    listener: Arc<dyn TransportListener>,
    messages: Vec<Message>,
    cancel: CancellationToken,
}

/// Client side of the `long-polling` transport.
pub struct LongPollingClient {
    url: Url,
    options: ClientOptions,
    codec: Arc<dyn Codec>,
    http: RwLock<Option<Client>>,
    next_exchange: AtomicU64,
    pending: Arc<DashMap<u64, PendingExchange>>,
}

impl core::fmt::Debug for LongPollingClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LongPollingClient")
            .field("url", &self.url.as_str())
            .field("codec", &self.codec.name())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl LongPollingClient {
    /// Create a client for the Bayeux endpoint at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientBuildError`] if the URL is not `http(s)`, the codec
    /// is unknown, or the HTTP client cannot be built.
    pub fn new(url: Url, options: ClientOptions) -> Result<Self, ClientBuildError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientBuildError::InvalidUrl(url.to_string()));
        }

        let codec = options.codec.resolve()?;
        let http = Client::builder().cookie_store(true).build()?;

        Ok(Self {
            url,
            options,
            codec,
            http: RwLock::new(Some(http)),
            next_exchange: AtomicU64::new(0),
            pending: Arc::new(DashMap::new()),
        })
    }

    /// The endpoint URL.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// The options in effect.
    #[must_use]
    pub const fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Number of exchanges still waiting for a reply.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Send `messages` and wait for the outcome.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportFailure`] reported for the exchange.
    pub async fn exchange(&self, messages: Vec<Message>) -> Result<Vec<Message>, TransportFailure> {
        let (tx, rx) = oneshot::channel();
        self.send(Arc::new(OneshotListener(Mutex::new(Some(tx)))), messages);
        rx.await.unwrap_or(Err(TransportFailure::Aborted))
    }

    fn http(&self) -> Option<Client> {
        self.http.read().ok().and_then(|guard| guard.clone())
    }

    fn fail(&self, id: u64, failure: TransportFailure) {
        if let Some((_, exchange)) = self.pending.remove(&id) {
            exchange.cancel.cancel();
            exchange.listener.on_failure(failure, exchange.messages);
        }
    }
}

async fn post(
    http: Client,
    url: Url,
    body: String,
    timeout: core::time::Duration,
    codec: Arc<dyn Codec>,
) -> Result<Vec<Message>, TransportFailure> {
    let response = http
        .post(url)
        .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
        .timeout(timeout)
        .body(body)
        .send()
        .await
        .map_err(|e| TransportFailure::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransportFailure::Status(status.as_u16()));
    }

    let content = response
        .text()
        .await
        .map_err(|e| TransportFailure::Http(e.to_string()))?;

    Ok(codec.decode(&content)?)
}

impl ClientTransport for LongPollingClient {
    fn name(&self) -> &str {
        LONG_POLLING
    }

    fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    fn accept(&self, version: &str) -> bool {
        let major = |v: &str| v.split('.').next().map(str::to_owned);
        major(version).is_some_and(|m| Some(m) == major(BAYEUX_VERSION))
    }

    fn send(&self, listener: Arc<dyn TransportListener>, messages: Vec<Message>) {
        let Some(http) = self.http() else {
            listener.on_failure(TransportFailure::Terminated, messages);
            return;
        };

        let id = self.next_exchange.fetch_add(1, Ordering::Relaxed);
        let body = self.generate(&messages);
        let timeout = self.options.request_timeout(&messages);
        let cancel = CancellationToken::new();

        listener.on_sending(&messages);
        self.pending.insert(
            id,
            PendingExchange {
                listener,
                messages,
                cancel: cancel.clone(),
            },
        );

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.fail(id, TransportFailure::Http(String::from("no async runtime")));
            return;
        };

        let pending = Arc::clone(&self.pending);
        let url = self.url.clone();
        let codec = Arc::clone(&self.codec);
        trace!(exchange = id, %url, "sending batch");

        runtime.spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = post(http, url, body, timeout, codec) => result,
            };

            // Whoever removes the entry reports the outcome.
            if let Some((_, exchange)) = pending.remove(&id) {
                match result {
                    Ok(replies) => exchange.listener.on_messages(replies),
                    Err(failure) => {
                        debug!(exchange = id, error = %failure, "exchange failed");
                        exchange.listener.on_failure(failure, exchange.messages);
                    }
                }
            }
        });
    }

    fn abort(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            debug!(count = ids.len(), "aborting pending exchanges");
        }
        for id in ids {
            self.fail(id, TransportFailure::Aborted);
        }
    }

    fn terminate(&self) {
        if let Ok(mut http) = self.http.write() {
            http.take();
        }
        self.abort();
    }
}

/// Bridges a listener callback to a oneshot receiver.
struct OneshotListener(Mutex<Option<oneshot::Sender<Result<Vec<Message>, TransportFailure>>>>);

impl OneshotListener {
    fn complete(&self, result: Result<Vec<Message>, TransportFailure>) {
        let sender = self.0.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

impl TransportListener for OneshotListener {
    fn on_messages(&self, messages: Vec<Message>) {
        self.complete(Ok(messages));
    }

    fn on_failure(&self, failure: TransportFailure, _messages: Vec<Message>) {
        self.complete(Err(failure));
    }
}
