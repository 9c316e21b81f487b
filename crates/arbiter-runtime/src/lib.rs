//! `arbiter-runtime` – the running command selector.
//!
//! # Modules
//!
//! - [`selector`] – [`SelectorService`]: the single Tokio task that owns the
//!   arbitration state, drives the watchdog on a fixed tick, applies inbound
//!   commands in arrival order and hands every emission to a
//!   [`CommandGateway`][arbiter_middleware::CommandGateway].
//! - [`telemetry`] – [`init_tracing`]: console logging plus optional OTLP
//!   span export.

pub mod selector;
pub mod telemetry;

pub use selector::{SelectorConfig, SelectorHandle, SelectorService, SelectorStatus};
pub use telemetry::{init_tracing, TracerProviderGuard};
