//! [`Aggregator`] – merges manual and autonomous updates into the single
//! output [`CommandState`].
//!
//! The aggregator owns the whole shared aggregate: the command record, the
//! [`Arbitrator`] and the [`RemoteHeartbeat`].  It is a plain `&mut self`
//! state machine with no interior locking; the runtime gives it exactly one
//! owner and feeds every update through that owner in arrival order.
//!
//! Each `apply_*` call returns the snapshot that must be handed to the
//! gateway, or `None` when the update was discarded.  Returning the snapshot
//! instead of publishing it keeps emission order identical to application
//! order.
//!
//! # Field ownership
//!
//! | Source | Fields written |
//! |---|---|
//! | manual (in [`AuthorityMode::Manual`]) | `accel`, `brake`, `steer`, `gear`, `mode`, `emergency` |
//! | `Twist` | `twist` |
//! | `Mode` | `mode` (plus a full reset on a neutral code) |
//! | `Gear` | `gear` |
//! | `Accel` / `Steer` / `Brake` | `accel` / `steer` / `brake` |
//! | `Ctrl` | `linear_velocity`, `steering_angle` |
//!
//! Every applied update also rewrites provenance and bumps `sequence`.

use std::time::Instant;

use arbiter_types::{
    is_neutral_mode_code, AuthorityMode, AutonomousPayload, AutonomousUpdate, CommandState,
    ManualCommand, Twist2D,
};
use tracing::{debug, warn};

use crate::arbitrator::Arbitrator;

/// Time of the most recent manual command.
#[derive(Debug, Clone, Copy)]
pub struct RemoteHeartbeat {
    pub last_seen: Instant,
}

/// Owner of the command record, the authority mode and the heartbeat.
#[derive(Debug)]
pub struct Aggregator {
    state: CommandState,
    arbitrator: Arbitrator,
    heartbeat: RemoteHeartbeat,
}

impl Aggregator {
    /// Start in manual mode with default fields.  `now` seeds the heartbeat,
    /// so silence is measured from start-up.
    pub fn new(now: Instant) -> Self {
        Self {
            state: CommandState::default(),
            arbitrator: Arbitrator::new(),
            heartbeat: RemoteHeartbeat { last_seen: now },
        }
    }

    pub fn state(&self) -> &CommandState {
        &self.state
    }

    pub fn mode(&self) -> AuthorityMode {
        self.arbitrator.current_mode()
    }

    pub fn heartbeat(&self) -> RemoteHeartbeat {
        self.heartbeat
    }

    pub fn emergency(&self) -> bool {
        self.state.emergency
    }

    /// Apply a command from the remote operator.
    ///
    /// The heartbeat and the emergency flag are always recorded.  A set
    /// emergency flag is OR-ed into the latch and never clears it.  While the
    /// latch was already set, the command's mode request is ignored so the
    /// operator cannot take authority back from the failsafe.
    ///
    /// Motion fields are only copied when the resulting mode is
    /// [`AuthorityMode::Manual`]; otherwise the command only refreshes
    /// liveness and `None` is returned.
    pub fn apply_manual_update(&mut self, cmd: &ManualCommand, now: Instant) -> Option<CommandState> {
        self.heartbeat.last_seen = now;

        let was_latched = self.state.emergency;
        if cmd.emergency && !was_latched {
            warn!(frame_id = %cmd.frame_id, "emergency requested by remote operator");
        }
        self.state.emergency |= cmd.emergency;

        let mode = if was_latched {
            debug!(mode_code = cmd.mode_code, "emergency latched; mode request ignored");
            self.arbitrator.current_mode()
        } else {
            self.arbitrator.set_mode_from_manual(cmd.mode_code)
        };

        if mode != AuthorityMode::Manual {
            debug!(frame_id = %cmd.frame_id, "manual command discarded in autonomous mode");
            return None;
        }

        let state = &mut self.state;
        state.stamp(&cmd.frame_id, cmd.timestamp);
        state.accel = cmd.accel;
        state.brake = cmd.brake;
        state.steer = cmd.steer;
        state.gear = cmd.gear;
        state.mode = cmd.mode_code;
        Some(state.clone())
    }

    /// Apply a partial update from one autonomous sub-source.
    ///
    /// A no-op returning `None` unless the current mode is
    /// [`AuthorityMode::Autonomous`].  Each payload variant touches only the
    /// fields its sub-source owns.
    pub fn apply_autonomous_update(&mut self, update: &AutonomousUpdate) -> Option<CommandState> {
        if self.arbitrator.current_mode() != AuthorityMode::Autonomous {
            debug!(kind = ?update.kind(), "autonomous update discarded in manual mode");
            return None;
        }

        let state = &mut self.state;
        match update.payload {
            AutonomousPayload::Twist {
                linear_x,
                angular_z,
            } => {
                state.twist = Twist2D {
                    linear_x,
                    angular_z,
                };
            }
            AutonomousPayload::Mode { mode } => {
                if is_neutral_mode_code(mode) {
                    state.reset_commands();
                }
                state.mode = mode;
            }
            AutonomousPayload::Gear { gear } => state.gear = gear,
            AutonomousPayload::Accel { accel } => state.accel = accel,
            AutonomousPayload::Steer { steer } => state.steer = steer,
            AutonomousPayload::Brake { brake } => state.brake = brake,
            AutonomousPayload::Ctrl {
                linear_velocity,
                steering_angle,
            } => {
                state.linear_velocity = linear_velocity;
                state.steering_angle = steering_angle;
            }
        }
        state.stamp(&update.frame_id, update.timestamp);
        Some(state.clone())
    }

    /// Force autonomous authority and set the emergency latch.
    pub(crate) fn latch_failsafe(&mut self) {
        self.arbitrator.force_autonomous();
        self.state.emergency = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_types::{AUTONOMOUS_MODE_CODE, LINEAR_VELOCITY_UNSET, MANUAL_MODE_CODE};
    use chrono::Utc;

    fn manual(mode_code: i32, accel: f64) -> ManualCommand {
        ManualCommand {
            frame_id: "remote".to_string(),
            timestamp: Utc::now(),
            mode_code,
            accel,
            brake: 0.2,
            steer: -0.1,
            gear: 1,
            emergency: false,
        }
    }

    fn auto(payload: AutonomousPayload) -> AutonomousUpdate {
        AutonomousUpdate {
            frame_id: "base_link".to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    fn autonomous_aggregator() -> Aggregator {
        let now = Instant::now();
        let mut agg = Aggregator::new(now);
        assert!(agg.apply_manual_update(&manual(AUTONOMOUS_MODE_CODE, 0.0), now).is_none());
        agg
    }

    #[test]
    fn initial_state() {
        let agg = Aggregator::new(Instant::now());
        assert_eq!(agg.mode(), AuthorityMode::Manual);
        assert!(!agg.emergency());
        assert!((agg.state().linear_velocity - LINEAR_VELOCITY_UNSET).abs() < f64::EPSILON);
    }

    #[test]
    fn manual_update_in_manual_mode_is_applied() {
        let mut agg = Aggregator::new(Instant::now());
        let out = agg
            .apply_manual_update(&manual(MANUAL_MODE_CODE, 0.5), Instant::now())
            .expect("manual command must be emitted");
        assert_eq!(out.sequence, 1);
        assert!((out.accel - 0.5).abs() < f64::EPSILON);
        assert!((out.brake - 0.2).abs() < f64::EPSILON);
        assert!((out.steer + 0.1).abs() < f64::EPSILON);
        assert_eq!(out.gear, 1);
        assert_eq!(out.mode, MANUAL_MODE_CODE);
        assert_eq!(out.frame_id, "remote");
    }

    #[test]
    fn manual_request_takes_authority_back_from_autonomous() {
        let mut agg = autonomous_aggregator();
        let s = agg
            .apply_autonomous_update(&auto(AutonomousPayload::Accel { accel: 0.9 }))
            .unwrap();
        assert_eq!(s.sequence, 1);

        let out = agg
            .apply_manual_update(&manual(MANUAL_MODE_CODE, 0.4), Instant::now())
            .expect("manual request is applied");
        assert_eq!(agg.mode(), AuthorityMode::Manual);
        assert_eq!(out.sequence, 2);
        assert!((out.accel - 0.4).abs() < f64::EPSILON);
        assert!((out.brake - 0.2).abs() < f64::EPSILON);
        assert!((out.steer + 0.1).abs() < f64::EPSILON);
        assert_eq!(out.gear, 1);
        assert_eq!(out.mode, MANUAL_MODE_CODE);
        assert_eq!(out.frame_id, "remote");

        // Autonomous sub-sources are shut out again.
        assert!(agg
            .apply_autonomous_update(&auto(AutonomousPayload::Accel { accel: 0.9 }))
            .is_none());
        assert_eq!(agg.state().sequence, 2);
    }

    #[test]
    fn manual_update_refreshes_heartbeat_even_when_discarded() {
        let start = Instant::now();
        let mut agg = Aggregator::new(start);
        let later = start + std::time::Duration::from_millis(500);
        assert!(agg.apply_manual_update(&manual(AUTONOMOUS_MODE_CODE, 0.9), later).is_none());
        assert_eq!(agg.heartbeat().last_seen, later);
        assert_eq!(agg.mode(), AuthorityMode::Autonomous);
        assert_eq!(agg.state().sequence, 0);
        assert!(agg.state().accel.abs() < f64::EPSILON);
    }

    #[test]
    fn autonomous_update_ignored_in_manual_mode() {
        let mut agg = Aggregator::new(Instant::now());
        let before = agg.state().clone();
        for payload in [
            AutonomousPayload::Twist { linear_x: 1.0, angular_z: 0.1 },
            AutonomousPayload::Accel { accel: 0.7 },
            AutonomousPayload::Mode { mode: 0 },
            AutonomousPayload::Ctrl { linear_velocity: 3.0, steering_angle: 0.2 },
        ] {
            assert!(agg.apply_autonomous_update(&auto(payload)).is_none());
        }
        assert_eq!(agg.state(), &before);
    }

    #[test]
    fn accel_update_touches_only_accel() {
        let mut agg = autonomous_aggregator();
        let before = agg.state().clone();
        let out = agg
            .apply_autonomous_update(&auto(AutonomousPayload::Accel { accel: 0.3 }))
            .unwrap();
        let mut expected = before;
        expected.accel = 0.3;
        expected.sequence += 1;
        expected.frame_id = out.frame_id.clone();
        expected.timestamp = out.timestamp;
        assert_eq!(out, expected);
    }

    #[test]
    fn each_sub_source_is_isolated() {
        let mut agg = autonomous_aggregator();
        let s = agg
            .apply_autonomous_update(&auto(AutonomousPayload::Steer { steer: 0.4 }))
            .unwrap();
        assert!((s.steer - 0.4).abs() < f64::EPSILON);
        assert!(s.brake.abs() < f64::EPSILON);

        let s = agg
            .apply_autonomous_update(&auto(AutonomousPayload::Brake { brake: 0.8 }))
            .unwrap();
        assert!((s.brake - 0.8).abs() < f64::EPSILON);
        assert!((s.steer - 0.4).abs() < f64::EPSILON);

        let s = agg
            .apply_autonomous_update(&auto(AutonomousPayload::Gear { gear: 4 }))
            .unwrap();
        assert_eq!(s.gear, 4);
        assert!((s.brake - 0.8).abs() < f64::EPSILON);

        let s = agg
            .apply_autonomous_update(&auto(AutonomousPayload::Twist {
                linear_x: 2.0,
                angular_z: -0.5,
            }))
            .unwrap();
        assert!((s.twist.linear_x - 2.0).abs() < f64::EPSILON);
        assert!((s.twist.angular_z + 0.5).abs() < f64::EPSILON);
        assert!((s.linear_velocity - LINEAR_VELOCITY_UNSET).abs() < f64::EPSILON);

        let s = agg
            .apply_autonomous_update(&auto(AutonomousPayload::Ctrl {
                linear_velocity: 5.0,
                steering_angle: 0.25,
            }))
            .unwrap();
        assert!((s.linear_velocity - 5.0).abs() < f64::EPSILON);
        assert!((s.steering_angle - 0.25).abs() < f64::EPSILON);
        assert!((s.twist.linear_x - 2.0).abs() < f64::EPSILON);
        assert_eq!(s.gear, 4);
        assert_eq!(s.sequence, 5);
    }

    #[test]
    fn neutral_mode_resets_all_command_fields() {
        let mut agg = autonomous_aggregator();
        agg.apply_autonomous_update(&auto(AutonomousPayload::Accel { accel: 0.6 }));
        agg.apply_autonomous_update(&auto(AutonomousPayload::Ctrl {
            linear_velocity: 4.0,
            steering_angle: 0.3,
        }));
        agg.apply_autonomous_update(&auto(AutonomousPayload::Gear { gear: 2 }));

        let out = agg
            .apply_autonomous_update(&auto(AutonomousPayload::Mode { mode: -1 }))
            .unwrap();
        assert_eq!(out.mode, -1);
        assert_eq!(out.gear, 0);
        assert!(out.accel.abs() < f64::EPSILON);
        assert!(out.steering_angle.abs() < f64::EPSILON);
        assert!((out.linear_velocity - LINEAR_VELOCITY_UNSET).abs() < f64::EPSILON);
        assert_eq!(out.sequence, 4);
    }

    #[test]
    fn non_neutral_mode_keeps_fields() {
        let mut agg = autonomous_aggregator();
        agg.apply_autonomous_update(&auto(AutonomousPayload::Accel { accel: 0.6 }));
        let out = agg
            .apply_autonomous_update(&auto(AutonomousPayload::Mode { mode: 3 }))
            .unwrap();
        assert_eq!(out.mode, 3);
        assert!((out.accel - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn manual_emergency_flag_latches() {
        let mut agg = Aggregator::new(Instant::now());
        let mut cmd = manual(MANUAL_MODE_CODE, 0.1);
        cmd.emergency = true;
        let out = agg.apply_manual_update(&cmd, Instant::now()).unwrap();
        assert!(out.emergency);

        cmd.emergency = false;
        let out = agg.apply_manual_update(&cmd, Instant::now()).unwrap();
        assert!(out.emergency, "a later manual command must not clear the latch");
    }

    #[test]
    fn latched_failsafe_keeps_authority_autonomous() {
        let mut agg = Aggregator::new(Instant::now());
        agg.latch_failsafe();
        assert!(agg.apply_manual_update(&manual(MANUAL_MODE_CODE, 0.9), Instant::now()).is_none());
        assert_eq!(agg.mode(), AuthorityMode::Autonomous);
        assert!(agg.state().accel.abs() < f64::EPSILON);
    }

    #[test]
    fn sequence_has_no_gaps_across_sources() {
        let now = Instant::now();
        let mut agg = Aggregator::new(now);
        let mut emitted = Vec::new();
        emitted.extend(agg.apply_manual_update(&manual(MANUAL_MODE_CODE, 0.1), now));
        emitted.extend(agg.apply_autonomous_update(&auto(AutonomousPayload::Accel { accel: 0.2 })));
        emitted.extend(agg.apply_manual_update(&manual(MANUAL_MODE_CODE, 0.3), now));
        emitted.extend(agg.apply_manual_update(&manual(AUTONOMOUS_MODE_CODE, 0.3), now));
        emitted.extend(agg.apply_autonomous_update(&auto(AutonomousPayload::Gear { gear: 1 })));
        emitted.extend(agg.apply_autonomous_update(&auto(AutonomousPayload::Brake { brake: 0.5 })));

        let seqs: Vec<u64> = emitted.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }
}
