//! Bayeux long-polling client.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use bayeux_core::{
    BAYEUX_VERSION,
    message::{Advice, ClientId, Message, Reconnect, channel},
    transport::{ClientOptions, ClientTransport},
};
use bayeux_http_long_poll::client::LongPollingClient;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Pause before retrying after a failed request.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Arguments for the connect command.
#[derive(Debug, clap::Parser)]
pub(crate) struct ClientArgs {
    /// Bayeux endpoint URL
    #[arg(short, long, default_value = "http://127.0.0.1:8080/cometd")]
    pub(crate) server: String,

    /// Channel to subscribe to, repeatable
    #[arg(short = 'c', long = "subscribe", value_name = "CHANNEL")]
    pub(crate) channels: Vec<String>,

    /// Channel to publish `--data` to once connected
    #[arg(long, value_name = "CHANNEL")]
    pub(crate) publish: Option<String>,

    /// JSON payload for `--publish`
    #[arg(long, default_value = "{}")]
    pub(crate) data: String,

    /// Allowance for network latency, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub(crate) max_network_delay: u64,
}

/// Run the client until `token` is cancelled or the server refuses it.
pub(crate) async fn run(args: ClientArgs, token: CancellationToken) -> Result<()> {
    let url = Url::parse(&args.server)?;
    let data: Value = serde_json::from_str(&args.data).context("--data is not valid JSON")?;
    let options = ClientOptions {
        max_network_delay: Duration::from_millis(args.max_network_delay),
        ..ClientOptions::default()
    };
    let client = LongPollingClient::new(url, options)?;

    tracing::info!("Connecting to Bayeux server at {}", client.url());
    let mut client_id = establish(&client, &args.channels).await?;

    if let Some(target) = &args.publish {
        let publish = Message::new(target.clone())
            .with_client_id(client_id.clone())
            .with_data(data);
        client.exchange(vec![publish]).await?;
        tracing::info!(channel = %target, "published");
    }

    loop {
        let result = tokio::select! {
            result = client.exchange(vec![connect(&client, &client_id)]) => result,
            () = token.cancelled() => break,
        };

        let pause = match result {
            Ok(replies) => match print_and_advise(replies) {
                Some(Advice { reconnect: Some(Reconnect::None), .. }) => {
                    client.terminate();
                    bail!("server asked the client not to reconnect");
                }
                Some(Advice { reconnect: Some(Reconnect::Handshake), .. }) => {
                    tracing::info!("session expired, handshaking again");
                    client_id = establish(&client, &args.channels).await?;
                    Duration::ZERO
                }
                Some(advice) => Duration::from_millis(advice.interval.unwrap_or_default()),
                None => Duration::ZERO,
            },
            Err(e) => {
                tracing::warn!("connect failed: {}", e);
                RETRY_BACKOFF
            }
        };

        if !pause.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                () = token.cancelled() => break,
            }
        }
    }

    tracing::info!("Shutting down client...");
    client.abort();
    let disconnect = Message::new(channel::META_DISCONNECT).with_client_id(client_id);
    if let Err(e) = client.exchange(vec![disconnect]).await {
        tracing::debug!("disconnect failed: {}", e);
    }
    client.terminate();

    Ok(())
}

/// Handshake, subscribe to `channels`, and send the first connect.
async fn establish(client: &LongPollingClient, channels: &[String]) -> Result<ClientId> {
    let mut handshake = Message::new(channel::META_HANDSHAKE);
    handshake.version = Some(BAYEUX_VERSION.to_owned());
    handshake.supported_connection_types = Some(vec![client.name().to_owned()]);

    let reply = client
        .exchange(vec![handshake])
        .await?
        .into_iter()
        .find(Message::is_handshake)
        .context("no handshake reply")?;
    if !reply.is_successful() {
        bail!("handshake refused: {}", reply.error.unwrap_or_default());
    }
    let client_id = reply.client_id.context("handshake reply has no clientId")?;
    tracing::info!(client = %client_id, "handshake complete");

    let mut batch: Vec<Message> = channels
        .iter()
        .map(|c| {
            Message::new(channel::META_SUBSCRIBE)
                .with_client_id(client_id.clone())
                .with_subscription(c.clone())
        })
        .collect();
    batch.push(connect(client, &client_id));

    for reply in client.exchange(batch).await? {
        if reply.channel == channel::META_SUBSCRIBE {
            let target = reply.subscription.as_deref().unwrap_or_default();
            if reply.is_successful() {
                tracing::info!(channel = %target, "subscribed");
            } else {
                tracing::warn!(channel = %target, error = ?reply.error, "subscription refused");
            }
        }
    }

    Ok(client_id)
}

fn connect(client: &LongPollingClient, client_id: &ClientId) -> Message {
    Message::new(channel::META_CONNECT)
        .with_client_id(client_id.clone())
        .with_connection_type(client.name())
}

/// Print published messages and return the connect reply's advice.
fn print_and_advise(replies: Vec<Message>) -> Option<Advice> {
    let mut advice = None;
    for message in replies {
        if message.is_connect() {
            if message
                .advice
                .as_ref()
                .is_some_and(|a| a.multiple_clients == Some(true))
            {
                tracing::warn!("another tab of this browser is already polling");
            }
            advice = message.advice;
        } else if !message.is_meta() {
            let data = message.data.unwrap_or(Value::Null);
            println!("{} {}", message.channel, data);
        }
    }
    advice
}
