//! [`SelectorService`] – the single owner of the arbitration state.
//!
//! One Tokio task owns the [`Aggregator`] (command record, authority mode,
//! heartbeat) and the [`Watchdog`].  Everything that reads or writes that
//! state goes through the task's `select!` loop:
//!
//! 1. **Shutdown** – a `watch` flag; checked first.
//! 2. **Watchdog tick** – a fixed-period interval.  Biased ahead of ingress
//!    so a flood of commands can never starve the failsafe.
//! 3. **Ingress** – a bounded `mpsc` queue fed by every inbound path.  Each
//!    sender's messages are applied in the order they were sent.
//!
//! Because only this task touches the aggregate, no lock is needed and two
//! writers can never interleave inside one update.  Emissions are handed to
//! the [`CommandGateway`] in the order updates are applied, so `sequence`
//! is strictly increasing on the wire.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use arbiter_middleware::{BusGateway, EventBus};
//! use arbiter_runtime::{SelectorConfig, SelectorService};
//!
//! # async fn run() -> Result<(), arbiter_types::ArbiterError> {
//! let bus = Arc::new(EventBus::default());
//! let handle = SelectorService::spawn(SelectorConfig::default(), Arc::new(BusGateway::new(bus)));
//! let ingress = handle.ingress();
//! # drop(ingress);
//! handle.shutdown();
//! handle.join().await
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use arbiter_kernel::{
    Aggregator, LinkHealth, Watchdog, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_TICK_PERIOD,
};
use arbiter_middleware::CommandGateway;
use arbiter_types::{ArbiterError, AuthorityMode, CommandState, Inbound};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Start-up parameters.  Fixed for the lifetime of the service.
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Watchdog evaluation period.
    pub tick_period: Duration,
    /// Remote heartbeat staleness threshold.
    pub heartbeat_timeout: Duration,
    /// Capacity of the inbound queue shared by all ingress paths.
    pub queue_capacity: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            tick_period: DEFAULT_TICK_PERIOD,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            queue_capacity: 256,
        }
    }
}

/// Observable state published after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorStatus {
    pub mode: AuthorityMode,
    pub link: LinkHealth,
    pub state: CommandState,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Caller-side handle to a running [`SelectorService`].
///
/// Cheap to clone; every clone controls the same task.  The service stops
/// once [`shutdown`][Self::shutdown] is called or the last clone is dropped.
#[derive(Clone)]
pub struct SelectorHandle {
    ingress: mpsc::Sender<Inbound>,
    status: watch::Receiver<SelectorStatus>,
    shutdown: Arc<watch::Sender<bool>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SelectorHandle {
    /// A sender for one ingress path.  Clone it once per path.
    pub fn ingress(&self) -> mpsc::Sender<Inbound> {
        self.ingress.clone()
    }

    /// Queue one inbound command, waiting for space if the queue is full.
    ///
    /// # Errors
    ///
    /// [`ArbiterError::Channel`] once the service has stopped.
    pub async fn submit(&self, inbound: Inbound) -> Result<(), ArbiterError> {
        self.ingress
            .send(inbound)
            .await
            .map_err(|_| ArbiterError::Channel("selector queue closed".to_string()))
    }

    /// Subscribe to [`SelectorStatus`] changes.
    pub fn status(&self) -> watch::Receiver<SelectorStatus> {
        self.status.clone()
    }

    /// Ask the service to stop.  Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for the service task to finish.  Only returns after
    /// [`shutdown`][Self::shutdown]; a second join from another clone
    /// returns `Ok(())` at once.
    ///
    /// # Errors
    ///
    /// [`ArbiterError::Channel`] if the task panicked.
    pub async fn join(&self) -> Result<(), ArbiterError> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };
        task.await
            .map_err(|e| ArbiterError::Channel(format!("selector task failed: {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

/// The selector actor.  Construct and start it with [`SelectorService::spawn`].
pub struct SelectorService {
    aggregator: Aggregator,
    watchdog: Watchdog,
    gateway: Arc<dyn CommandGateway>,
    inbound: mpsc::Receiver<Inbound>,
    status: watch::Sender<SelectorStatus>,
    link: LinkHealth,
    tick_period: Duration,
}

impl SelectorService {
    /// Spawn the service on the current Tokio runtime.
    ///
    /// The heartbeat is seeded with the spawn time and the watchdog starts
    /// ticking immediately.
    pub fn spawn(config: SelectorConfig, gateway: Arc<dyn CommandGateway>) -> SelectorHandle {
        let (ingress, inbound) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let aggregator = Aggregator::new(Instant::now().into_std());
        let (status, status_rx) = watch::channel(SelectorStatus {
            mode: aggregator.mode(),
            link: LinkHealth::Live,
            state: aggregator.state().clone(),
        });

        let service = Self {
            aggregator,
            watchdog: Watchdog::new(config.heartbeat_timeout),
            gateway,
            inbound,
            status,
            link: LinkHealth::Live,
            tick_period: config.tick_period,
        };
        let task = tokio::spawn(service.run(shutdown));

        SelectorHandle {
            ingress,
            status: status_rx,
            shutdown: Arc::new(shutdown_tx),
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ingress_open = true;

        info!(
            tick_ms = self.tick_period.as_millis() as u64,
            timeout_ms = self.watchdog.timeout().as_millis() as u64,
            "selector started"
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.on_tick(Instant::now()),
                inbound = self.inbound.recv(), if ingress_open => match inbound {
                    Some(inbound) => self.on_inbound(inbound, Instant::now()),
                    None => {
                        // Silence must still fail over.
                        warn!("all ingress paths closed; watchdog keeps running");
                        ingress_open = false;
                    }
                },
            }
        }

        info!(sequence = self.aggregator.state().sequence, "selector stopped");
    }

    fn on_tick(&mut self, now: Instant) {
        let link = self.watchdog.tick(&mut self.aggregator, now.into_std());
        if link == LinkHealth::Failsafe {
            if let Err(e) = self.gateway.emit_emergency_stop(true) {
                error!(error = %e, "failed to emit emergency stop");
            }
        }
        if link != self.link {
            self.link = link;
            self.publish_status();
        }
    }

    fn on_inbound(&mut self, inbound: Inbound, now: Instant) {
        let emitted = match &inbound {
            Inbound::Manual(cmd) => self.aggregator.apply_manual_update(cmd, now.into_std()),
            Inbound::Autonomous(update) => self.aggregator.apply_autonomous_update(update),
        };
        if let Some(state) = emitted {
            if let Err(e) = self.gateway.emit_command(&state) {
                error!(sequence = state.sequence, error = %e, "failed to emit select_cmd");
            }
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let next = SelectorStatus {
            mode: self.aggregator.mode(),
            link: self.link,
            state: self.aggregator.state().clone(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
