//! Outbound sink for the selector core.
//!
//! The selector never publishes anything itself: it hands each merged
//! [`CommandState`] and each emergency-stop signal to a [`CommandGateway`].
//! [`BusGateway`] is the production implementation and forwards onto the
//! [`EventBus`], where the bridge and any other consumer pick it up.

use std::sync::Arc;

use arbiter_types::{ArbiterError, CommandState, Event, EventPayload};
use tracing::debug;

use crate::bus::{EventBus, Topic};

/// Source tag stamped on every event the gateway publishes.
pub const GATEWAY_SOURCE: &str = "arbiter-middleware::gateway";

/// Destination for everything the selector emits.
///
/// # Contract
///
/// * Both methods are called from the selector's single owner task and must
///   return promptly; they must never block on I/O.
/// * An `Err` is logged by the caller and does not roll back the in-memory
///   state.  The next update or tick re-emits naturally; there is no retry
///   queue.
/// * `emit_emergency_stop(true)` is called on every watchdog tick while the
///   failsafe is latched, so implementations must tolerate duplicates.
pub trait CommandGateway: Send + Sync {
    fn emit_command(&self, state: &CommandState) -> Result<(), ArbiterError>;

    fn emit_emergency_stop(&self, engaged: bool) -> Result<(), ArbiterError>;
}

/// [`CommandGateway`] backed by the in-process [`EventBus`].
#[derive(Clone)]
pub struct BusGateway {
    bus: Arc<EventBus>,
}

impl BusGateway {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl CommandGateway for BusGateway {
    fn emit_command(&self, state: &CommandState) -> Result<(), ArbiterError> {
        let receivers = self.bus.publish_to(
            Topic::SelectCmd,
            Event::new(GATEWAY_SOURCE, EventPayload::SelectCmd(state.clone())),
        );
        debug!(sequence = state.sequence, receivers, "select_cmd published");
        Ok(())
    }

    fn emit_emergency_stop(&self, engaged: bool) -> Result<(), ArbiterError> {
        self.bus.publish_to(
            Topic::EmergencyStop,
            Event::new(GATEWAY_SOURCE, EventPayload::EmergencyStop(engaged)),
        );
        Ok(())
    }
}
