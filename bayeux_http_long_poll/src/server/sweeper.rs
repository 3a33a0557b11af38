//! Periodic sweep of idle browser bookkeeping.

use core::time::Duration;
use std::sync::Arc;

use bayeux_core::timestamp::TimestampMillis;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::BayeuxServer;

/// Shortest period between sweeps.
pub const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Sweep every transport of `server` each `period` until `token` is cancelled.
///
/// Periods shorter than [`MIN_SWEEP_PERIOD`] are raised to it.
pub fn spawn_sweeper(
    server: Arc<BayeuxServer>,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(MIN_SWEEP_PERIOD));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = server.sweep(TimestampMillis::now());
                    if evicted > 0 {
                        tracing::debug!(evicted, "swept idle browsers");
                    }
                }
                () = token.cancelled() => {
                    tracing::debug!("Stopping sweeper task");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bayeux_core::{
        context::BayeuxContext,
        transport::{ServerTransport, TransportResponse},
    };
    use futures::{FutureExt, future::BoxFuture};

    use super::*;

    #[derive(Default)]
    struct Counting {
        sweeps: AtomicUsize,
    }

    impl ServerTransport for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn accept(&self, _ctx: &dyn BayeuxContext) -> bool {
            false
        }

        fn handle<'a>(&'a self, _ctx: &'a dyn BayeuxContext, _body: String) -> BoxFuture<'a, TransportResponse> {
            async { TransportResponse::malformed(Vec::new()) }.boxed()
        }

        fn sweep(&self, _now: TimestampMillis) -> usize {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    #[tokio::test]
    async fn sweeps_until_cancelled() {
        let counting = Arc::new(Counting::default());
        let server = Arc::new(BayeuxServer::from_transports(
            "/cometd",
            vec![Arc::clone(&counting) as Arc<dyn ServerTransport>],
        ));
        let token = CancellationToken::new();

        let handle = spawn_sweeper(server, Duration::from_millis(10), token.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        handle.await.expect("sweeper task");

        let sweeps = counting.sweeps.load(Ordering::SeqCst);
        assert!(sweeps >= 2, "expected several sweeps, got {sweeps}");
    }

    #[tokio::test]
    async fn zero_period_is_raised_to_minimum() {
        let counting = Arc::new(Counting::default());
        let server = Arc::new(BayeuxServer::from_transports(
            "/cometd",
            vec![Arc::clone(&counting) as Arc<dyn ServerTransport>],
        ));
        let token = CancellationToken::new();

        let handle = spawn_sweeper(server, Duration::ZERO, token.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let joined = handle.await;
        assert!(joined.is_ok(), "sweeper task failed: {joined:?}");
        assert!(counting.sweeps.load(Ordering::SeqCst) >= 1);
    }
}
