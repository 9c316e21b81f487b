//! `arbiter-types` – shared data model for the command selector.
//!
//! Every other crate in the workspace speaks in terms of these types:
//!
//! - [`CommandState`] – the single merged output record (`/select_cmd`).
//! - [`AuthorityMode`] – which command source currently owns the output.
//! - [`Inbound`] – one inbound event, either a [`ManualCommand`] from the
//!   remote operator or an [`AutonomousUpdate`] from one sub-source.
//! - [`Event`] / [`EventPayload`] – outbound records carried by the bus.
//! - [`ArbiterError`] – the error type for every fallible boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Mode code that selects the autonomous controller.
pub const AUTONOMOUS_MODE_CODE: i32 = 1;

/// Mode code that selects the remote (manual) controller.
pub const MANUAL_MODE_CODE: i32 = 2;

/// Sentinel stored in [`CommandState::linear_velocity`] while the trajectory
/// controller has not produced a command.
pub const LINEAR_VELOCITY_UNSET: f64 = -1.0;

/// Return `true` for the MODE sub-source codes that mean "neutral / unset".
///
/// Receiving one of these resets every command field before the new mode
/// code is stored.
pub fn is_neutral_mode_code(code: i32) -> bool {
    code == 0 || code == -1
}

// ────────────────────────────────────────────────────────────────────────────
// Authority
// ────────────────────────────────────────────────────────────────────────────

/// Which command source currently controls the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityMode {
    /// The remote operator's commands are forwarded.
    #[default]
    Manual,
    /// The autonomous sub-sources' commands are forwarded.
    Autonomous,
}

impl AuthorityMode {
    /// Map a raw mode code onto an authority mode.
    ///
    /// Returns `None` for codes outside the recognised set; the caller decides
    /// how to treat them.
    pub fn from_mode_code(code: i32) -> Option<Self> {
        match code {
            MANUAL_MODE_CODE => Some(Self::Manual),
            AUTONOMOUS_MODE_CODE => Some(Self::Autonomous),
            _ => None,
        }
    }

    /// The wire code for this mode.
    pub fn mode_code(self) -> i32 {
        match self {
            Self::Manual => MANUAL_MODE_CODE,
            Self::Autonomous => AUTONOMOUS_MODE_CODE,
        }
    }
}

impl std::fmt::Display for AuthorityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorityMode::Manual => write!(f, "manual"),
            AuthorityMode::Autonomous => write!(f, "autonomous"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output record
// ────────────────────────────────────────────────────────────────────────────

/// Planar motion command: forward speed and yaw rate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Twist2D {
    pub linear_x: f64,
    pub angular_z: f64,
}

/// The currently selected output command.
///
/// There is exactly one of these per process.  It is owned by the kernel's
/// `Aggregator` and only ever leaves it as a cloned snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandState {
    /// Incremented on every emitted update; never reset.
    pub sequence: u64,
    /// Frame of the most recent contributing update.
    pub frame_id: String,
    /// Stamp of the most recent contributing update.
    pub timestamp: DateTime<Utc>,
    pub twist: Twist2D,
    /// Raw mode code from whichever source is authoritative.
    pub mode: i32,
    pub gear: i32,
    pub accel: f64,
    pub brake: f64,
    pub steer: f64,
    /// Trajectory-controller speed; [`LINEAR_VELOCITY_UNSET`] until set.
    pub linear_velocity: f64,
    /// Trajectory-controller steering angle.
    pub steering_angle: f64,
    /// Emergency-stop latch.  Once `true` it stays `true` for the life of the
    /// process.
    pub emergency: bool,
}

impl Default for CommandState {
    fn default() -> Self {
        Self {
            sequence: 0,
            frame_id: String::new(),
            timestamp: DateTime::<Utc>::default(),
            twist: Twist2D::default(),
            mode: 0,
            gear: 0,
            accel: 0.0,
            brake: 0.0,
            steer: 0.0,
            linear_velocity: LINEAR_VELOCITY_UNSET,
            steering_angle: 0.0,
            emergency: false,
        }
    }
}

impl CommandState {
    /// Zero every command field and restore the velocity sentinel.
    ///
    /// Provenance, `sequence` and the emergency latch are left untouched.
    pub fn reset_commands(&mut self) {
        self.twist = Twist2D::default();
        self.mode = 0;
        self.gear = 0;
        self.accel = 0.0;
        self.brake = 0.0;
        self.steer = 0.0;
        self.linear_velocity = LINEAR_VELOCITY_UNSET;
        self.steering_angle = 0.0;
    }

    /// Overwrite provenance and advance `sequence` by one.
    pub fn stamp(&mut self, frame_id: &str, timestamp: DateTime<Utc>) {
        self.frame_id.clear();
        self.frame_id.push_str(frame_id);
        self.timestamp = timestamp;
        self.sequence += 1;
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inbound events
// ────────────────────────────────────────────────────────────────────────────

/// Topic the remote operator's commands arrive on.
pub const REMOTE_CMD_TOPIC: &str = "/remote_cmd";

/// A command from the remote operator.  Doubles as the liveness heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualCommand {
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    pub mode_code: i32,
    pub accel: f64,
    pub brake: f64,
    pub steer: f64,
    pub gear: i32,
    pub emergency: bool,
}

/// The fixed inventory of autonomous input channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubSourceKind {
    Twist,
    Mode,
    Gear,
    Accel,
    Steer,
    Brake,
    /// Trajectory control (speed + steering angle).
    Ctrl,
}

impl SubSourceKind {
    pub const ALL: [SubSourceKind; 7] = [
        SubSourceKind::Twist,
        SubSourceKind::Mode,
        SubSourceKind::Gear,
        SubSourceKind::Accel,
        SubSourceKind::Steer,
        SubSourceKind::Brake,
        SubSourceKind::Ctrl,
    ];

    /// Topic this sub-source is received on.
    pub fn topic(self) -> &'static str {
        match self {
            SubSourceKind::Twist => "/twist_cmd",
            SubSourceKind::Mode => "/mode_cmd",
            SubSourceKind::Gear => "/gear_cmd",
            SubSourceKind::Accel => "/accel_cmd",
            SubSourceKind::Steer => "/steer_cmd",
            SubSourceKind::Brake => "/brake_cmd",
            SubSourceKind::Ctrl => "/ctrl_cmd",
        }
    }

    /// Inverse of [`topic`][Self::topic].
    pub fn from_topic(topic: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.topic() == topic)
    }
}

/// Field payload of an [`AutonomousUpdate`].  The variant *is* the
/// sub-source, so a payload can never be applied to the wrong fields.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AutonomousPayload {
    Twist { linear_x: f64, angular_z: f64 },
    Mode { mode: i32 },
    Gear { gear: i32 },
    Accel { accel: f64 },
    Steer { steer: f64 },
    Brake { brake: f64 },
    Ctrl { linear_velocity: f64, steering_angle: f64 },
}

impl AutonomousPayload {
    pub fn kind(&self) -> SubSourceKind {
        match self {
            AutonomousPayload::Twist { .. } => SubSourceKind::Twist,
            AutonomousPayload::Mode { .. } => SubSourceKind::Mode,
            AutonomousPayload::Gear { .. } => SubSourceKind::Gear,
            AutonomousPayload::Accel { .. } => SubSourceKind::Accel,
            AutonomousPayload::Steer { .. } => SubSourceKind::Steer,
            AutonomousPayload::Brake { .. } => SubSourceKind::Brake,
            AutonomousPayload::Ctrl { .. } => SubSourceKind::Ctrl,
        }
    }
}

/// A partial update from one autonomous sub-source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutonomousUpdate {
    pub frame_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: AutonomousPayload,
}

impl AutonomousUpdate {
    pub fn kind(&self) -> SubSourceKind {
        self.payload.kind()
    }
}

/// Everything the selector can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Inbound {
    Manual(ManualCommand),
    Autonomous(AutonomousUpdate),
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound events
// ────────────────────────────────────────────────────────────────────────────

/// Outbound record routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "arbiter-middleware::gateway"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// A freshly merged output command.
    SelectCmd(CommandState),
    /// The emergency-stop signal.  Repeated `true` values are expected.
    EmergencyStop(bool),
}

/// Error type for the bus, gateway, bridge and configuration layers.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ArbiterError {
    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Parse Error: {0}")]
    Parsing(String),

    #[error("Gateway Error on {sink}: {details}")]
    Gateway { sink: String, details: String },

    #[error("Configuration Error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_unset() {
        let state = CommandState::default();
        assert_eq!(state.sequence, 0);
        assert!(!state.emergency);
        assert!((state.linear_velocity - LINEAR_VELOCITY_UNSET).abs() < f64::EPSILON);
        assert_eq!(AuthorityMode::default(), AuthorityMode::Manual);
    }

    #[test]
    fn reset_commands_keeps_provenance_and_latch() {
        let mut state = CommandState::default();
        state.stamp("base_link", Utc::now());
        state.accel = 0.4;
        state.gear = 3;
        state.linear_velocity = 2.5;
        state.emergency = true;

        state.reset_commands();

        assert_eq!(state.sequence, 1);
        assert_eq!(state.frame_id, "base_link");
        assert!(state.emergency);
        assert_eq!(state.gear, 0);
        assert!(state.accel.abs() < f64::EPSILON);
        assert!((state.linear_velocity + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn mode_code_mapping() {
        assert_eq!(AuthorityMode::from_mode_code(2), Some(AuthorityMode::Manual));
        assert_eq!(AuthorityMode::from_mode_code(1), Some(AuthorityMode::Autonomous));
        assert_eq!(AuthorityMode::from_mode_code(7), None);
        assert_eq!(AuthorityMode::Manual.mode_code(), MANUAL_MODE_CODE);
        assert!(is_neutral_mode_code(0));
        assert!(is_neutral_mode_code(-1));
        assert!(!is_neutral_mode_code(AUTONOMOUS_MODE_CODE));
    }

    #[test]
    fn payload_kind_matches_variant() {
        let update = AutonomousUpdate {
            frame_id: "map".into(),
            timestamp: Utc::now(),
            payload: AutonomousPayload::Ctrl {
                linear_velocity: 1.0,
                steering_angle: 0.1,
            },
        };
        assert_eq!(update.kind(), SubSourceKind::Ctrl);
        assert_eq!(update.kind().topic(), "/ctrl_cmd");
    }

    #[test]
    fn every_sub_source_topic_round_trips() {
        for kind in SubSourceKind::ALL {
            assert_eq!(SubSourceKind::from_topic(kind.topic()), Some(kind));
        }
        assert_eq!(SubSourceKind::from_topic(REMOTE_CMD_TOPIC), None);
    }

    #[test]
    fn autonomous_payload_is_internally_tagged() {
        let json = serde_json::to_string(&AutonomousPayload::Gear { gear: 2 }).unwrap();
        assert_eq!(json, r#"{"kind":"gear","gear":2}"#);
    }

    #[test]
    fn arbiter_error_display() {
        let err = ArbiterError::Gateway {
            sink: "/select_cmd".to_string(),
            details: "closed".to_string(),
        };
        assert!(err.to_string().contains("/select_cmd"));
        assert!(ArbiterError::Config("bad".into()).to_string().contains("Configuration"));
    }
}
