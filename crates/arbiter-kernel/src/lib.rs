//! `arbiter-kernel` – command arbitration core.
//!
//! Pure, synchronous decision logic.  Nothing in this crate spawns tasks,
//! reads the clock or performs I/O: every time-dependent call takes `now`
//! explicitly, and every emission is returned to the caller.
//!
//! # Modules
//!
//! - [`arbitrator`] – [`Arbitrator`][arbitrator::Arbitrator]: owns the
//!   [`AuthorityMode`][arbiter_types::AuthorityMode] and the rules for
//!   changing it.
//! - [`aggregator`] – [`Aggregator`][aggregator::Aggregator]: merges manual
//!   commands and autonomous sub-source updates into the single
//!   [`CommandState`][arbiter_types::CommandState].
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: detects a stale remote
//!   heartbeat and latches the emergency failsafe.

pub mod aggregator;
pub mod arbitrator;
pub mod watchdog;

pub use aggregator::{Aggregator, RemoteHeartbeat};
pub use arbitrator::Arbitrator;
pub use watchdog::{LinkHealth, Watchdog, DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_TICK_PERIOD};
