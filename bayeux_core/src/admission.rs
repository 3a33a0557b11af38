//! Per-browser admission control for suspended connections.
//!
//! Browsers cap the number of concurrent connections per host. If several
//! tabs of one browser each hold a long poll open, the browser runs out of
//! connections and the page stalls. [`BrowserAdmission`] counts the
//! suspended connections of each browser and refuses to suspend past the
//! configured [`SessionLimit`].
//!
//! Counters that drop to zero are not deleted immediately, since the same
//! browser usually reconnects within one poll interval. Instead they enter a
//! sweep registry, and [`BrowserAdmission::sweep`] evicts those that stay idle
//! for longer than twice the maximum client interval.
//!
//! # Concurrency
//!
//! Both maps are [`DashMap`]s of shared atomics. No global lock is taken:
//!
//! - counters are incremented while holding the counter map's shard guard,
//!   so an increment can never land on an entry the sweep has just removed
//! - the sweep takes its map first and the counter map second; admission
//!   paths release the counter guard before touching the sweep map, so the
//!   two never wait on each other in opposite order
//! - sweep entries are removed only if they are still the same allocation
//!   that was observed, so a fresh entry inserted by a concurrent release is
//!   never lost

use core::time::Duration;
use std::sync::{
    Arc,
    atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{browser::BrowserId, error::CounterUnderflow, timestamp::TimestampMillis};

/// Maximum number of suspended connections per browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum SessionLimit {
    /// Never reject. No bookkeeping is done.
    Unlimited,

    /// Always reject. No bookkeeping is done.
    Deny,

    /// Admit at most this many (always at least 1).
    AtMost(usize),
}

impl From<i64> for SessionLimit {
    fn from(value: i64) -> Self {
        match usize::try_from(value) {
            Err(_) => SessionLimit::Unlimited,
            Ok(0) => SessionLimit::Deny,
            Ok(n) => SessionLimit::AtMost(n),
        }
    }
}

impl From<SessionLimit> for i64 {
    fn from(limit: SessionLimit) -> Self {
        match limit {
            SessionLimit::Unlimited => -1,
            SessionLimit::Deny => 0,
            SessionLimit::AtMost(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }
}

impl Default for SessionLimit {
    fn default() -> Self {
        SessionLimit::AtMost(1)
    }
}

/// Counts suspended connections per browser.
#[derive(Debug)]
pub struct BrowserAdmission {
    limit: SessionLimit,
    max_interval: Duration,
    counts: DashMap<BrowserId, Arc<AtomicUsize>>,
    sweeping: DashMap<BrowserId, Arc<AtomicU32>>,

    /// Millis of the previous sweep; zero until the first one.
    last_sweep: AtomicU64,
}

impl BrowserAdmission {
    /// Create an empty table.
    ///
    /// `max_interval` is the longest a well-behaved client waits between
    /// polls; it scales how many sweeps an idle browser survives.
    #[must_use]
    pub fn new(limit: SessionLimit, max_interval: Duration) -> Self {
        Self {
            limit,
            max_interval,
            counts: DashMap::new(),
            sweeping: DashMap::new(),
            last_sweep: AtomicU64::new(0),
        }
    }

    /// The configured limit.
    #[must_use]
    pub const fn limit(&self) -> SessionLimit {
        self.limit
    }

    /// Try to count one more suspended connection for `browser`.
    ///
    /// Returns `false` (and leaves the count unchanged) if that would exceed
    /// the limit. Every `true` must be paired with exactly one
    /// [`release`](Self::release); prefer [`admit`](Self::admit), which
    /// enforces the pairing.
    pub fn try_admit(&self, browser: &BrowserId) -> bool {
        let max = match self.limit {
            SessionLimit::Unlimited => return true,
            SessionLimit::Deny => return false,
            SessionLimit::AtMost(max) => max,
        };

        let sessions = {
            let counter = self
                .counts
                .entry(browser.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
            counter.fetch_add(1, Ordering::AcqRel) + 1
        };

        if sessions == 1 {
            self.sweeping.remove(browser);
        }

        if sessions > max {
            // We hold one of the increments above, so this cannot underflow.
            let previous = self
                .counts
                .get(browser)
                .map(|counter| counter.fetch_sub(1, Ordering::AcqRel));
            if previous == Some(1) {
                // A concurrent release left us holding the last increment.
                self.sweeping
                    .insert(browser.clone(), Arc::new(AtomicU32::new(0)));
            }
            tracing::debug!(%browser, sessions, max, "admission rejected");
            #[cfg(feature = "metrics")]
            crate::metrics::admission_rejected();
            return false;
        }

        tracing::trace!(%browser, sessions, "admission granted");
        #[cfg(feature = "metrics")]
        crate::metrics::admission_granted();
        true
    }

    /// Undo one successful [`try_admit`](Self::try_admit).
    ///
    /// Unknown browsers are ignored. When the count reaches zero the browser
    /// enters the sweep registry with a clean strike count.
    ///
    /// # Errors
    ///
    /// Returns [`CounterUnderflow`] if the count is already zero. The counter
    /// is left at zero.
    pub fn release(&self, browser: &BrowserId) -> Result<(), CounterUnderflow> {
        let previous = {
            let Some(counter) = self.counts.get(browser) else {
                return Ok(());
            };
            counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        };

        match previous {
            Ok(1) => {
                self.sweeping
                    .insert(browser.clone(), Arc::new(AtomicU32::new(0)));
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::error!(%browser, "release without matching admission");
                #[cfg(feature = "metrics")]
                crate::metrics::counter_underflow();
                Err(CounterUnderflow {
                    browser: browser.clone(),
                })
            }
        }
    }

    /// Admit `browser` and return a permit that releases on drop.
    #[must_use]
    pub fn admit(self: &Arc<Self>, browser: &BrowserId) -> Option<AdmissionPermit> {
        self.try_admit(browser).then(|| AdmissionPermit {
            admission: Arc::clone(self),
            browser: Some(browser.clone()),
        })
    }

    /// Current count for `browser`, or `None` if there is no entry.
    #[must_use]
    pub fn count(&self, browser: &BrowserId) -> Option<usize> {
        self.counts
            .get(browser)
            .map(|counter| counter.load(Ordering::Acquire))
    }

    /// Whether `browser` is waiting in the sweep registry.
    #[must_use]
    pub fn is_sweeping(&self, browser: &BrowserId) -> bool {
        self.sweeping.contains_key(browser)
    }

    /// Number of browsers with a counter entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether no browser has a counter entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sweep using the current wall clock.
    pub fn sweep(&self) -> usize {
        self.sweep_at(TimestampMillis::now())
    }

    /// Strike every idle browser once and evict those idle for too long.
    ///
    /// A browser may stay idle for `2 * max_interval / elapsed` sweeps, where
    /// `elapsed` is the time since the previous sweep. The first sweep, and
    /// any sweep where the clock has not advanced, only records the time.
    ///
    /// Returns the number of browsers evicted.
    pub fn sweep_at(&self, now: TimestampMillis) -> usize {
        let last = self.last_sweep.swap(now.as_millis(), Ordering::AcqRel);
        let elapsed = now.signed_diff(TimestampMillis::new(last));

        if last == 0 || elapsed <= 0 {
            return 0;
        }

        #[allow(clippy::cast_sign_loss)]
        let elapsed = elapsed as u64;
        let max_interval = u64::try_from(self.max_interval.as_millis()).unwrap_or(u64::MAX);
        let max_strikes = max_interval.saturating_mul(2) / elapsed;

        let snapshot: Vec<(BrowserId, Arc<AtomicU32>)> = self
            .sweeping
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut evicted = 0;
        for (browser, strikes) in snapshot {
            let struck = strikes.fetch_add(1, Ordering::AcqRel).saturating_add(1);
            if u64::from(struck) <= max_strikes {
                continue;
            }

            let removed = self
                .sweeping
                .remove_if(&browser, |_, current| Arc::ptr_eq(current, &strikes))
                .is_some();

            if removed
                && self
                    .counts
                    .remove_if(&browser, |_, count| count.load(Ordering::Acquire) == 0)
                    .is_some()
            {
                tracing::debug!(%browser, "swept idle browser");
                evicted += 1;
            }
        }

        #[cfg(feature = "metrics")]
        crate::metrics::sweep_completed(evicted);

        evicted
    }
}

/// One admitted suspended connection.
///
/// Dropping the permit releases it, so the count is restored on every exit
/// path, including a client that disconnects while suspended.
#[derive(Debug)]
#[must_use = "dropping the permit releases the admission immediately"]
pub struct AdmissionPermit {
    admission: Arc<BrowserAdmission>,
    browser: Option<BrowserId>,
}

impl AdmissionPermit {
    /// The browser this permit was issued to.
    #[must_use]
    pub fn browser(&self) -> Option<&BrowserId> {
        self.browser.as_ref()
    }

    /// Release now and report the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`CounterUnderflow`] if the counter was already zero.
    pub fn release(mut self) -> Result<(), CounterUnderflow> {
        match self.browser.take() {
            Some(browser) => self.admission.release(&browser),
            None => Ok(()),
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(browser) = self.browser.take() {
            // Already logged by `release`.
            let _ = self.admission.release(&browser);
        }
    }
}
