//! [`Arbitrator`] – owner of the authority mode.
//!
//! Only two things may change the mode:
//!
//! 1. The mode code carried by a manual command, via
//!    [`Arbitrator::set_mode_from_manual`].
//! 2. The watchdog's failsafe, via `force_autonomous`.  That method is
//!    crate-private so nothing outside the kernel can take authority away
//!    from the operator.

use arbiter_types::AuthorityMode;
use tracing::{info, warn};

/// Holds the current [`AuthorityMode`].
///
/// # Example
///
/// ```
/// use arbiter_kernel::Arbitrator;
/// use arbiter_types::{AuthorityMode, AUTONOMOUS_MODE_CODE, MANUAL_MODE_CODE};
///
/// let mut arb = Arbitrator::new();
/// assert_eq!(arb.current_mode(), AuthorityMode::Manual);
///
/// arb.set_mode_from_manual(AUTONOMOUS_MODE_CODE);
/// assert_eq!(arb.current_mode(), AuthorityMode::Autonomous);
///
/// arb.set_mode_from_manual(MANUAL_MODE_CODE);
/// assert_eq!(arb.current_mode(), AuthorityMode::Manual);
/// ```
#[derive(Debug, Default)]
pub struct Arbitrator {
    mode: AuthorityMode,
}

impl Arbitrator {
    /// Start in [`AuthorityMode::Manual`].
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_mode(&self) -> AuthorityMode {
        self.mode
    }

    /// Apply the mode code from a manual command.
    ///
    /// `MANUAL_MODE_CODE` selects [`AuthorityMode::Manual`]; every other code,
    /// recognised or not, selects [`AuthorityMode::Autonomous`].  Unrecognised
    /// codes are logged.
    pub fn set_mode_from_manual(&mut self, code: i32) -> AuthorityMode {
        let next = AuthorityMode::from_mode_code(code).unwrap_or_else(|| {
            warn!(mode_code = code, "unrecognised mode code; selecting autonomous");
            AuthorityMode::Autonomous
        });
        self.transition(next, "manual");
        next
    }

    /// Unconditionally hand authority to the autonomous side.
    pub(crate) fn force_autonomous(&mut self) {
        self.transition(AuthorityMode::Autonomous, "watchdog");
    }

    fn transition(&mut self, next: AuthorityMode, cause: &'static str) {
        if self.mode != next {
            info!(from = %self.mode, to = %next, cause, "authority mode changed");
            self.mode = next;
        }
    }
}
