//! Integration tests for the HTTP transports.
//!
//! Runs a real server on a loopback port and drives it with the
//! long-polling client and with raw HTTP requests.

#![allow(
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::unwrap_used,
    missing_docs,
    unreachable_pub
)]

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, OnceLock},
    time::{Duration, Instant},
};

use bayeux_core::{
    engine::MemoryEngine,
    message::{ClientId, Message, Reconnect, channel},
    options::TransportOptions,
    transport::{ClientOptions, ClientTransport, TransportFailure, TransportListener},
};
use bayeux_http_long_poll::{
    UNKNOWN_TRANSPORT, client::LongPollingClient, server::BayeuxServer,
};
use reqwest::{StatusCode, header};
use serde_json::json;
use testresult::TestResult;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

fn init_tracing() {
    static ONCE: OnceLock<()> = OnceLock::new();
    ONCE.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .init();
    });
}

// ─── Test Server Harness ─────────────────────────────────────────────────────

struct TestServer {
    engine: Arc<MemoryEngine>,
    address: SocketAddr,
    token: CancellationToken,
}

impl TestServer {
    async fn start() -> Self {
        init_tracing();

        let engine = Arc::new(MemoryEngine::new());
        let server = BayeuxServer::builder(Arc::clone(&engine))
            .options(TransportOptions {
                timeout: POLL_TIMEOUT,
                ..TransportOptions::default()
            })
            .build()
            .expect("server");

        let tcp = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = tcp.local_addr().expect("local_addr");
        let token = CancellationToken::new();

        let serve_token = token.clone();
        tokio::spawn(async move {
            server
                .serve_listener(tcp, serve_token)
                .await
                .expect("serve");
        });

        Self {
            engine,
            address,
            token,
        }
    }

    fn url(&self) -> Url {
        Url::parse(&format!("http://{}/cometd", self.address)).expect("url")
    }

    fn client(&self) -> Arc<LongPollingClient> {
        Arc::new(LongPollingClient::new(self.url(), ClientOptions::default()).expect("client"))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn handshake(client: &LongPollingClient) -> TestResult<ClientId> {
    let replies = client
        .exchange(vec![Message::new(channel::META_HANDSHAKE).with_id("1")])
        .await?;
    let reply = replies
        .into_iter()
        .find(Message::is_handshake)
        .ok_or("no handshake reply")?;
    assert!(reply.is_successful());
    Ok(reply.client_id.ok_or("no client id")?)
}

fn connect(client_id: &ClientId) -> Message {
    Message::new(channel::META_CONNECT)
        .with_client_id(client_id.clone())
        .with_connection_type("long-polling")
}

fn connect_reply(replies: &[Message]) -> TestResult<&Message> {
    Ok(replies.iter().find(|m| m.is_connect()).ok_or("no connect reply")?)
}

// ─── Raw HTTP ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_assigns_browser_cookie() -> TestResult {
    let server = TestServer::start().await;

    let resp = reqwest::Client::new()
        .post(server.url())
        .header(header::CONTENT_TYPE, "application/json")
        .body(r#"[{"channel":"/meta/handshake","version":"1.0"}]"#)
        .send()
        .await?;

    assert_eq!(resp.status(), StatusCode::OK);
    let has_cookie = resp
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.starts_with("BAYEUX_BROWSER=") && v.contains("Path=/"));
    assert!(has_cookie, "missing browser cookie");

    let replies: Vec<Message> = serde_json::from_str(&resp.text().await?)?;
    assert!(replies.iter().any(|m| m.is_handshake() && m.is_successful()));
    assert_eq!(server.engine.session_count(), 1);
    Ok(())
}

#[tokio::test]
async fn malformed_body_is_bad_request() -> TestResult {
    let server = TestServer::start().await;

    let resp = reqwest::Client::new()
        .post(server.url())
        .body("[{\"channel\":")
        .send()
        .await?;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(server.engine.session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn unmatched_request_names_unknown_transport() -> TestResult {
    let server = TestServer::start().await;

    let resp = reqwest::Client::new().get(server.url()).send().await?;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.text().await?, UNKNOWN_TRANSPORT);
    Ok(())
}

#[tokio::test]
async fn callback_polling_wraps_reply() -> TestResult {
    let server = TestServer::start().await;

    let mut url = server.url();
    url.query_pairs_mut()
        .append_pair("jsonp", "handle")
        .append_pair("message", r#"[{"channel":"/meta/handshake","version":"1.0"}]"#);

    let resp = reqwest::Client::new().get(url).send().await?;
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    assert!(content_type.starts_with("text/javascript"), "{content_type}");

    let body = resp.text().await?;
    let json = body
        .strip_prefix("handle(")
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or("reply is not wrapped in the callback")?;
    let replies: Vec<Message> = serde_json::from_str(json)?;
    assert!(replies.iter().any(|m| m.is_handshake() && m.is_successful()));
    Ok(())
}

// ─── Long Poll ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_connect_returns_immediately_then_polls() -> TestResult {
    let server = TestServer::start().await;
    let client = server.client();
    let id = handshake(&client).await?;

    let start = Instant::now();
    let replies = client.exchange(vec![connect(&id)]).await?;
    assert!(start.elapsed() < POLL_TIMEOUT);

    let reply = connect_reply(&replies)?;
    assert!(reply.is_successful());
    let advice = reply.advice.as_ref().ok_or("no advice")?;
    assert_eq!(advice.timeout, Some(1_000));
    assert_eq!(advice.reconnect, Some(Reconnect::Retry));

    let start = Instant::now();
    let replies = client.exchange(vec![connect(&id)]).await?;
    let held = start.elapsed();
    assert!(held >= POLL_TIMEOUT - Duration::from_millis(100), "held only {held:?}");
    assert!(connect_reply(&replies)?.is_successful());
    Ok(())
}

#[tokio::test]
async fn publish_wakes_held_connect() -> TestResult {
    let server = TestServer::start().await;
    let client = server.client();
    let id = handshake(&client).await?;

    let subscribe = Message::new(channel::META_SUBSCRIBE)
        .with_client_id(id.clone())
        .with_subscription("/chat");
    client.exchange(vec![subscribe, connect(&id)]).await?;

    let poll = {
        let client = Arc::clone(&client);
        let id = id.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            let replies = client.exchange(vec![connect(&id)]).await;
            (start.elapsed(), replies)
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.engine.publish("/chat", json!({"text": "hello"})).await, 1);

    let (elapsed, replies) = poll.await?;
    let replies = replies?;
    assert!(elapsed < POLL_TIMEOUT, "woken after {elapsed:?}");

    let delivered = replies
        .iter()
        .find(|m| m.channel == "/chat")
        .ok_or("publish not delivered")?;
    assert_eq!(delivered.data, Some(json!({"text": "hello"})));
    assert!(connect_reply(&replies)?.is_successful());
    Ok(())
}

#[tokio::test]
async fn second_tab_is_told_about_multiple_clients() -> TestResult {
    let server = TestServer::start().await;
    // One cookie jar: both sessions come from the same browser.
    let client = server.client();

    let first = handshake(&client).await?;
    client.exchange(vec![connect(&first)]).await?;
    let held = {
        let client = Arc::clone(&client);
        let first = first.clone();
        tokio::spawn(async move { client.exchange(vec![connect(&first)]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = handshake(&client).await?;
    client.exchange(vec![connect(&second)]).await?;

    let start = Instant::now();
    let replies = client.exchange(vec![connect(&second)]).await?;
    assert!(start.elapsed() < POLL_TIMEOUT);

    let reply = connect_reply(&replies)?;
    let advice = reply.advice.as_ref().ok_or("no advice")?;
    assert_eq!(advice.multiple_clients, Some(true));
    assert_eq!(advice.reconnect, Some(Reconnect::Retry));
    assert_eq!(advice.interval, Some(2_000));

    let first_replies = held.await??;
    assert!(connect_reply(&first_replies)?.is_successful());
    Ok(())
}

#[tokio::test]
async fn browser_slot_is_reusable_after_poll() -> TestResult {
    let server = TestServer::start().await;
    let client = server.client();
    let id = handshake(&client).await?;
    client.exchange(vec![connect(&id)]).await?;

    for _ in 0..2 {
        let replies = client.exchange(vec![connect(&id)]).await?;
        let reply = connect_reply(&replies)?;
        assert!(reply.is_successful());
        assert_eq!(reply.advice.as_ref().and_then(|a| a.multiple_clients), None);
    }
    Ok(())
}

#[tokio::test]
async fn disconnect_ends_session() -> TestResult {
    let server = TestServer::start().await;
    let client = server.client();
    let id = handshake(&client).await?;

    let replies = client
        .exchange(vec![Message::new(channel::META_DISCONNECT).with_client_id(id.clone())])
        .await?;
    assert!(replies.iter().all(Message::is_successful));
    assert_eq!(server.engine.session_count(), 0);

    let replies = client.exchange(vec![connect(&id)]).await?;
    let reply = connect_reply(&replies)?;
    assert!(!reply.is_successful());
    assert_eq!(reply.advice.as_ref().and_then(|a| a.reconnect), Some(Reconnect::Handshake));
    Ok(())
}

// ─── Client Lifecycle ────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorder {
    outcomes: Mutex<Vec<String>>,
}

impl TransportListener for Recorder {
    fn on_messages(&self, _messages: Vec<Message>) {
        self.outcomes.lock().unwrap().push(String::from("messages"));
    }

    fn on_failure(&self, failure: TransportFailure, messages: Vec<Message>) {
        assert_eq!(messages.len(), 1);
        self.outcomes.lock().unwrap().push(failure.to_string());
    }
}

#[tokio::test]
async fn abort_fails_pending_exchange_once() -> TestResult {
    init_tracing();

    // Accepts connections and never answers.
    let silent = TcpListener::bind("127.0.0.1:0").await?;
    let address = silent.local_addr()?;
    let sink = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let client = LongPollingClient::new(
        Url::parse(&format!("http://{address}/cometd"))?,
        ClientOptions::default(),
    )?;
    let recorder = Arc::new(Recorder::default());
    client.send(
        Arc::clone(&recorder) as Arc<dyn TransportListener>,
        vec![Message::new(channel::META_HANDSHAKE)],
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.pending(), 1);

    client.abort();
    client.abort();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*recorder.outcomes.lock().unwrap(), vec![String::from("exchange aborted")]);
    assert_eq!(client.pending(), 0);

    sink.abort();
    Ok(())
}

#[tokio::test]
async fn terminated_client_refuses_to_send() -> TestResult {
    let server = TestServer::start().await;
    let client = server.client();
    handshake(&client).await?;

    client.terminate();
    let err = client
        .exchange(vec![Message::new(channel::META_HANDSHAKE)])
        .await
        .expect_err("terminated");
    assert!(matches!(err, TransportFailure::Terminated));
    Ok(())
}
