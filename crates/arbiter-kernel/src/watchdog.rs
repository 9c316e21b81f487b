//! [`Watchdog`] – remote-link liveness monitor and failsafe trigger.
//!
//! The remote operator's commands double as a heartbeat.  Call
//! [`Watchdog::tick`] on a fixed period; each tick measures how long it has
//! been since the last manual command and, once that exceeds the timeout (or
//! the emergency latch is already set), forces autonomous authority and sets
//! the latch.
//!
//! The link state is derived on every tick and never stored, so there is no
//! path back to [`LinkHealth::Live`] once the latch is set.  Recovery is a
//! process restart.

use std::time::{Duration, Instant};

use tracing::{trace, warn};

use crate::aggregator::Aggregator;

/// Default staleness threshold for the remote heartbeat.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default watchdog tick period.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(10);

/// Link state reported by a single watchdog evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    /// The remote heartbeat is fresh and no emergency is latched.
    Live,
    /// Authority has been forced to autonomous and the emergency latch is
    /// set.  The caller must emit the emergency-stop signal.
    Failsafe,
}

/// Detects a stale remote heartbeat.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use arbiter_kernel::{Aggregator, LinkHealth, Watchdog};
/// use arbiter_types::AuthorityMode;
///
/// let start = Instant::now();
/// let mut agg = Aggregator::new(start);
/// let wd = Watchdog::new(Duration::from_secs(1));
///
/// assert_eq!(wd.tick(&mut agg, start + Duration::from_millis(500)), LinkHealth::Live);
/// assert_eq!(wd.tick(&mut agg, start + Duration::from_millis(1100)), LinkHealth::Failsafe);
/// assert_eq!(agg.mode(), AuthorityMode::Autonomous);
/// assert!(agg.emergency());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    timeout: Duration,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evaluate the link without changing anything.
    ///
    /// Elapsed time is strictly greater than the timeout to count as stale.
    pub fn health(&self, aggregator: &Aggregator, now: Instant) -> LinkHealth {
        let elapsed = now.saturating_duration_since(aggregator.heartbeat().last_seen);
        if elapsed > self.timeout || aggregator.emergency() {
            LinkHealth::Failsafe
        } else {
            LinkHealth::Live
        }
    }

    /// Evaluate the link and apply the failsafe when it is stale.
    ///
    /// Returns [`LinkHealth::Failsafe`] on every tick after the latch is set,
    /// so the emergency-stop signal is re-emitted each period.
    pub fn tick(&self, aggregator: &mut Aggregator, now: Instant) -> LinkHealth {
        let health = self.health(aggregator, now);
        let elapsed = now.saturating_duration_since(aggregator.heartbeat().last_seen);
        trace!(
            mode = %aggregator.mode(),
            emergency = aggregator.emergency(),
            elapsed_ms = elapsed.as_millis() as u64,
            "watchdog tick"
        );

        if health == LinkHealth::Failsafe {
            if !aggregator.emergency() {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "remote heartbeat stale; failing over to autonomous"
                );
            }
            aggregator.latch_failsafe();
        }
        health
    }
}
