//! Bayeux long-polling server.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bayeux_core::{
    codec::CodecOption,
    context::ServerContext,
    engine::MemoryEngine,
    options::{TransportOptions, keys},
};
use bayeux_http_long_poll::{DEFAULT_PATH, LONG_POLLING_PREFIX, server::{BayeuxServer, spawn_sweeper}};
use tokio_util::sync::CancellationToken;

use crate::metrics;

/// Arguments for the server command.
#[derive(Debug, clap::Parser)]
pub(crate) struct ServerArgs {
    /// Socket address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub(crate) socket: String,

    /// Path the endpoint is served on
    #[arg(long, default_value = DEFAULT_PATH)]
    pub(crate) path: String,

    /// How long a connect is held, in milliseconds
    #[arg(short, long, default_value_t = 30_000)]
    pub(crate) timeout: u64,

    /// Suspended connects allowed per browser (negative for unlimited)
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    pub(crate) max_sessions_per_browser: i64,

    /// Reconnect interval advised to rejected connects, in milliseconds
    #[arg(long, default_value_t = 2_000)]
    pub(crate) multi_session_interval: u64,

    /// Hold connects from clients without a browser cookie
    #[arg(long, default_value_t = false)]
    pub(crate) allow_multi_sessions_no_browser: bool,

    /// Codec name (`json` or `json-pretty`)
    #[arg(long)]
    pub(crate) codec: Option<String>,

    /// Disable the JSONP transport
    #[arg(long, default_value_t = false)]
    pub(crate) no_callback_polling: bool,

    /// Extra transport option, repeatable. Keys may carry a transport prefix,
    /// as in `long-polling.jsonp.timeout=10000`.
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub(crate) options: Vec<(String, String)>,

    /// Metrics server port (Prometheus endpoint)
    #[arg(long, default_value = "9090")]
    pub(crate) metrics_port: u16,

    /// Enable the Prometheus metrics server
    #[arg(long, default_value_t = false)]
    pub(crate) metrics: bool,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

impl ServerArgs {
    /// Flatten the arguments into a transport option map. `--option`
    /// entries override the named flags.
    fn option_map(&self) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = [
            (keys::TIMEOUT, self.timeout.to_string()),
            (keys::MAX_SESSIONS_PER_BROWSER, self.max_sessions_per_browser.to_string()),
            (keys::MULTI_SESSION_INTERVAL, self.multi_session_interval.to_string()),
            (
                keys::ALLOW_MULTI_SESSIONS_NO_BROWSER,
                self.allow_multi_sessions_no_browser.to_string(),
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect();

        map.extend(self.options.iter().cloned());
        map
    }
}

/// Sweep period used when `maxInterval` is zero.
const FALLBACK_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Sweep once per `max_interval`, or every [`FALLBACK_SWEEP_PERIOD`] if it is zero.
fn sweep_period(max_interval: Duration) -> Duration {
    if max_interval.is_zero() {
        FALLBACK_SWEEP_PERIOD
    } else {
        max_interval
    }
}

/// Run the server until `token` is cancelled.
pub(crate) async fn run(args: ServerArgs, token: CancellationToken) -> Result<()> {
    let addr: SocketAddr = args.socket.parse()?;

    if args.metrics {
        let metrics_handle = metrics::init_metrics()?;
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], args.metrics_port).into();
        metrics::start_metrics_server(metrics_addr, metrics_handle, token.clone()).await?;
    }

    let map = args.option_map();
    let sweep_period = sweep_period(TransportOptions::from_options(&map, LONG_POLLING_PREFIX)?.max_interval);

    let engine = Arc::new(MemoryEngine::new());
    let mut builder = BayeuxServer::builder(engine)
        .path(args.path.clone())
        .codec(args.codec.clone().map_or(CodecOption::Default, CodecOption::Named))
        .context(ServerContext::new().with_init_parameters(map.clone()));
    if args.no_callback_polling {
        builder = builder.without_callback_polling();
    }
    let server = builder
        .option_map(&map)
        .context("invalid transport options")?
        .build()?;

    tracing::info!(?server, "starting Bayeux server");
    let sweeper = spawn_sweeper(Arc::clone(&server), sweep_period, token.clone());

    server.serve(addr, token).await?;
    sweeper.await?;
    tracing::info!("Shutting down server...");

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn flags_become_options() {
        let args = ServerArgs::try_parse_from([
            "start",
            "--timeout",
            "5000",
            "--max-sessions-per-browser",
            "-1",
            "-o",
            "long-polling.jsonp.timeout=1000",
        ])
        .expect("args");

        let map = args.option_map();
        assert_eq!(map.get("timeout").map(String::as_str), Some("5000"));
        assert_eq!(map.get("maxSessionsPerBrowser").map(String::as_str), Some("-1"));
        assert_eq!(
            map.get("long-polling.jsonp.timeout").map(String::as_str),
            Some("1000")
        );
    }

    #[test]
    fn option_flag_overrides_named_flag() {
        let args = ServerArgs::try_parse_from(["start", "-o", "timeout=7"]).expect("args");
        assert_eq!(args.option_map().get("timeout").map(String::as_str), Some("7"));
    }

    #[test]
    fn zero_max_interval_still_sweeps() {
        assert_eq!(sweep_period(Duration::ZERO), FALLBACK_SWEEP_PERIOD);
        assert_eq!(sweep_period(Duration::from_secs(10)), Duration::from_secs(10));
    }

    #[test]
    fn rejects_option_without_value() {
        assert!(parse_key_value("timeout").is_err());
        assert!(parse_key_value("=3").is_err());
        assert_eq!(
            parse_key_value(" interval = 10 "),
            Ok((String::from("interval"), String::from("10")))
        );
    }
}
