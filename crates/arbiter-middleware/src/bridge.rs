//! rosbridge-style WebSocket bridge.
//!
//! [`CommandBridge`] is the concrete transport around the selector:
//!
//! 1. **Ingests** rosbridge v2 `publish` frames for `/remote_cmd` and the
//!    seven autonomous sub-source topics, decodes them into [`Inbound`]
//!    values and forwards them to the selector queue in arrival order.
//!
//! 2. **Streams** every `/select_cmd` and `/emergency_stop` event from the
//!    [`EventBus`] to every connected client.  A new client first receives
//!    the latched value of both topics.
//!
//! Frames are JSON objects of the form
//! `{"op":"publish","topic":"/accel_cmd","msg":{...}}`, where `msg` follows
//! the field layout of the corresponding ROS message.  Malformed frames are
//! logged and dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arbiter_types::{
    ArbiterError, AutonomousPayload, AutonomousUpdate, CommandState, Event, EventPayload, Inbound,
    ManualCommand, SubSourceKind, REMOTE_CMD_TOPIC,
};
use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Pause after the first failed `accept`.  Doubles per consecutive failure.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
/// Upper bound on the pause between failed `accept` calls.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before retrying after `failures` consecutive `accept` errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1u32 << failures.min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

// ────────────────────────────────────────────────────────────────────────────
// Wire messages
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
struct Stamp {
    #[serde(default)]
    secs: i64,
    #[serde(default)]
    nsecs: u32,
}

impl Stamp {
    fn to_datetime(self) -> Result<DateTime<Utc>, ArbiterError> {
        DateTime::from_timestamp(self.secs, self.nsecs).ok_or_else(|| {
            ArbiterError::Parsing(format!(
                "stamp {}.{:09} is out of range",
                self.secs, self.nsecs
            ))
        })
    }

    fn from_datetime(t: DateTime<Utc>) -> Self {
        Self {
            secs: t.timestamp(),
            nsecs: t.timestamp_subsec_nanos(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Header {
    #[serde(default)]
    seq: u64,
    #[serde(default)]
    stamp: Stamp,
    #[serde(default)]
    frame_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct Vector3 {
    #[serde(default)]
    x: f64,
    #[serde(default)]
    z: f64,
}

#[derive(Debug, Deserialize)]
struct Twist {
    #[serde(default)]
    linear: Vector3,
    #[serde(default)]
    angular: Vector3,
}

#[derive(Debug, Deserialize)]
struct ControlCommand {
    linear_velocity: f64,
    steering_angle: f64,
}

/// `/remote_cmd`.  `emergency` is an integer flag on the wire.
#[derive(Debug, Deserialize)]
struct RemoteCmdMsg {
    #[serde(default)]
    header: Header,
    mode: i32,
    accel: f64,
    brake: f64,
    steer: f64,
    gear: i32,
    #[serde(default)]
    emergency: i32,
}

#[derive(Debug, Deserialize)]
struct TwistStampedMsg {
    #[serde(default)]
    header: Header,
    twist: Twist,
}

#[derive(Debug, Deserialize)]
struct ModeCmdMsg {
    #[serde(default)]
    header: Header,
    mode: i32,
}

#[derive(Debug, Deserialize)]
struct GearCmdMsg {
    #[serde(default)]
    header: Header,
    gear: i32,
}

#[derive(Debug, Deserialize)]
struct AccelCmdMsg {
    #[serde(default)]
    header: Header,
    accel: f64,
}

#[derive(Debug, Deserialize)]
struct SteerCmdMsg {
    #[serde(default)]
    header: Header,
    steer: f64,
}

#[derive(Debug, Deserialize)]
struct BrakeCmdMsg {
    #[serde(default)]
    header: Header,
    brake: f64,
}

#[derive(Debug, Deserialize)]
struct ControlCommandStampedMsg {
    #[serde(default)]
    header: Header,
    cmd: ControlCommand,
}

/// `/select_cmd`.
#[derive(Debug, Serialize)]
struct SelectCmdMsg {
    header: Header,
    linear_x: f64,
    angular_z: f64,
    mode: i32,
    gear: i32,
    accel: f64,
    brake: f64,
    steer: f64,
    linear_velocity: f64,
    steering_angle: f64,
    emergency: i32,
}

impl From<&CommandState> for SelectCmdMsg {
    fn from(state: &CommandState) -> Self {
        Self {
            header: Header {
                seq: state.sequence,
                stamp: Stamp::from_datetime(state.timestamp),
                frame_id: state.frame_id.clone(),
            },
            linear_x: state.twist.linear_x,
            angular_z: state.twist.angular_z,
            mode: state.mode,
            gear: state.gear,
            accel: state.accel,
            brake: state.brake,
            steer: state.steer,
            linear_velocity: state.linear_velocity,
            steering_angle: state.steering_angle,
            emergency: i32::from(state.emergency),
        }
    }
}

/// `/emergency_stop` (`std_msgs/Bool`).
#[derive(Debug, Serialize)]
struct BoolMsg {
    data: bool,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    op: String,
    topic: String,
    #[serde(default)]
    msg: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct OutboundFrame<'a, T> {
    op: &'static str,
    topic: &'a str,
    msg: T,
}

// ────────────────────────────────────────────────────────────────────────────
// Codec
// ────────────────────────────────────────────────────────────────────────────

fn msg<T: DeserializeOwned>(topic: &str, value: serde_json::Value) -> Result<T, ArbiterError> {
    serde_json::from_value(value)
        .map_err(|e| ArbiterError::Parsing(format!("invalid {topic} message: {e}")))
}

fn autonomous(header: Header, payload: AutonomousPayload) -> Result<Inbound, ArbiterError> {
    Ok(Inbound::Autonomous(AutonomousUpdate {
        timestamp: header.stamp.to_datetime()?,
        frame_id: header.frame_id,
        payload,
    }))
}

/// Decode one rosbridge frame.
///
/// Returns `Ok(None)` for well-formed frames the selector does not consume
/// (other ops, other topics).
///
/// # Errors
///
/// [`ArbiterError::Parsing`] when the frame is not valid JSON, or when a
/// known topic carries a message with missing or mistyped fields.
pub fn decode_frame(text: &str) -> Result<Option<Inbound>, ArbiterError> {
    let frame: InboundFrame = serde_json::from_str(text)
        .map_err(|e| ArbiterError::Parsing(format!("invalid frame: {e}")))?;
    if frame.op != "publish" {
        return Ok(None);
    }
    let topic = frame.topic.as_str();

    if topic == REMOTE_CMD_TOPIC {
        let m: RemoteCmdMsg = msg(topic, frame.msg)?;
        return Ok(Some(Inbound::Manual(ManualCommand {
            timestamp: m.header.stamp.to_datetime()?,
            frame_id: m.header.frame_id,
            mode_code: m.mode,
            accel: m.accel,
            brake: m.brake,
            steer: m.steer,
            gear: m.gear,
            emergency: m.emergency != 0,
        })));
    }

    let Some(kind) = SubSourceKind::from_topic(topic) else {
        return Ok(None);
    };
    let inbound = match kind {
        SubSourceKind::Twist => {
            let m: TwistStampedMsg = msg(topic, frame.msg)?;
            let payload = AutonomousPayload::Twist {
                linear_x: m.twist.linear.x,
                angular_z: m.twist.angular.z,
            };
            autonomous(m.header, payload)?
        }
        SubSourceKind::Mode => {
            let m: ModeCmdMsg = msg(topic, frame.msg)?;
            autonomous(m.header, AutonomousPayload::Mode { mode: m.mode })?
        }
        SubSourceKind::Gear => {
            let m: GearCmdMsg = msg(topic, frame.msg)?;
            autonomous(m.header, AutonomousPayload::Gear { gear: m.gear })?
        }
        SubSourceKind::Accel => {
            let m: AccelCmdMsg = msg(topic, frame.msg)?;
            autonomous(m.header, AutonomousPayload::Accel { accel: m.accel })?
        }
        SubSourceKind::Steer => {
            let m: SteerCmdMsg = msg(topic, frame.msg)?;
            autonomous(m.header, AutonomousPayload::Steer { steer: m.steer })?
        }
        SubSourceKind::Brake => {
            let m: BrakeCmdMsg = msg(topic, frame.msg)?;
            autonomous(m.header, AutonomousPayload::Brake { brake: m.brake })?
        }
        SubSourceKind::Ctrl => {
            let m: ControlCommandStampedMsg = msg(topic, frame.msg)?;
            let payload = AutonomousPayload::Ctrl {
                linear_velocity: m.cmd.linear_velocity,
                steering_angle: m.cmd.steering_angle,
            };
            autonomous(m.header, payload)?
        }
    };
    Ok(Some(inbound))
}

/// Encode a bus event as a rosbridge `publish` frame.
pub fn encode_event(event: &Event) -> Result<String, ArbiterError> {
    let json = match &event.payload {
        EventPayload::SelectCmd(state) => serde_json::to_string(&OutboundFrame {
            op: "publish",
            topic: Topic::SelectCmd.name(),
            msg: SelectCmdMsg::from(state),
        }),
        EventPayload::EmergencyStop(data) => serde_json::to_string(&OutboundFrame {
            op: "publish",
            topic: Topic::EmergencyStop.name(),
            msg: BoolMsg { data: *data },
        }),
    };
    json.map_err(|e| ArbiterError::Serialization(e.to_string()))
}

// ────────────────────────────────────────────────────────────────────────────
// Server
// ────────────────────────────────────────────────────────────────────────────

/// Bridge between WebSocket clients, the selector queue and the
/// [`EventBus`].
#[derive(Clone)]
pub struct CommandBridge {
    bus: Arc<EventBus>,
    ingress: mpsc::Sender<Inbound>,
}

impl CommandBridge {
    /// Create a bridge that reads outbound traffic from `bus` and forwards
    /// decoded inbound commands to `ingress`.
    pub fn new(bus: Arc<EventBus>, ingress: mpsc::Sender<Inbound>) -> Self {
        Self { bus, ingress }
    }

    /// Bind `addr` and serve clients until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ArbiterError::Channel`] if the TCP listener cannot be bound.
    pub async fn run_ws_server(self, addr: SocketAddr) -> Result<(), ArbiterError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ArbiterError::Channel(format!("ws bind error on {addr}: {e}")))?;
        info!(%addr, "command bridge listening");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept clients from an already-bound listener forever.
    pub async fn serve(self, listener: TcpListener) {
        let mut failures = 0u32;
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    failures = 0;
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_ws_client(stream, peer).await {
                            error!(peer = %peer, error = %e, "ws client error");
                        }
                    });
                }
                Err(e) => {
                    let backoff = accept_backoff(failures);
                    failures = failures.saturating_add(1);
                    error!(error = %e, backoff_ms = backoff.as_millis() as u64, "ws accept error");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn handle_ws_client(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ArbiterError> {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| ArbiterError::Channel(format!("ws handshake from {peer}: {e}")))?;
        debug!(%peer, "ws client connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let mut select_rx = self.bus.subscribe_to(Topic::SelectCmd);
        let mut estop_rx = self.bus.subscribe_to(Topic::EmergencyStop);

        for topic in [Topic::SelectCmd, Topic::EmergencyStop] {
            if let Some(event) = self.bus.latest(topic) {
                if !Self::send_event(&mut ws_tx, &event).await? {
                    return Ok(());
                }
            }
        }

        loop {
            let keep_going = tokio::select! {
                result = select_rx.recv() => Self::forward(&mut ws_tx, result, peer).await?,
                result = estop_rx.recv() => Self::forward(&mut ws_tx, result, peer).await?,
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_incoming_ws_message(text.as_str()).await;
                        true
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => false,
                    Some(Ok(_)) => true,
                },
            };
            if !keep_going {
                break;
            }
        }

        debug!(%peer, "ws client disconnected");
        Ok(())
    }

    async fn forward(
        ws_tx: &mut WsSink,
        result: Result<Event, broadcast::error::RecvError>,
        peer: SocketAddr,
    ) -> Result<bool, ArbiterError> {
        match result {
            Ok(event) => Self::send_event(ws_tx, &event).await,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(peer = %peer, lagged_by = n, "ws client lagged");
                Ok(true)
            }
            Err(broadcast::error::RecvError::Closed) => Ok(false),
        }
    }

    /// Returns `Ok(false)` once the client has gone away.
    async fn send_event(ws_tx: &mut WsSink, event: &Event) -> Result<bool, ArbiterError> {
        let json = encode_event(event)?;
        Ok(ws_tx.send(Message::Text(json.into())).await.is_ok())
    }

    /// Decode one text frame and forward it to the selector queue.
    ///
    /// Awaiting the queue applies backpressure to this client only and keeps
    /// its frames in arrival order.
    async fn handle_incoming_ws_message(&self, text: &str) {
        match decode_frame(text) {
            Ok(Some(inbound)) => {
                if self.ingress.send(inbound).await.is_err() {
                    warn!("selector queue closed; dropping inbound command");
                }
            }
            Ok(None) => debug!("ignoring frame for unhandled op or topic"),
            Err(e) => warn!(error = %e, "dropping malformed frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_types::MANUAL_MODE_CODE;
    use tokio_tungstenite::connect_async;

    #[test]
    fn accept_backoff_doubles_up_to_cap() {
        assert_eq!(accept_backoff(0), Duration::from_millis(10));
        assert_eq!(accept_backoff(1), Duration::from_millis(20));
        assert_eq!(accept_backoff(3), Duration::from_millis(80));
        assert_eq!(accept_backoff(7), ACCEPT_BACKOFF_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_BACKOFF_MAX);
        for n in 0..20 {
            assert!(accept_backoff(n) <= accept_backoff(n + 1));
        }
    }

    fn make_bridge() -> (Arc<EventBus>, mpsc::Receiver<Inbound>, CommandBridge) {
        let bus = Arc::new(EventBus::default());
        let (tx, rx) = mpsc::channel(16);
        let bridge = CommandBridge::new(Arc::clone(&bus), tx);
        (bus, rx, bridge)
    }

    #[test]
    fn decode_remote_cmd() {
        let frame = r#"{"op":"publish","topic":"/remote_cmd","msg":{
            "header":{"seq":9,"stamp":{"secs":100,"nsecs":5},"frame_id":"remote"},
            "mode":2,"accel":0.5,"brake":0.0,"steer":0.1,"gear":1,"emergency":0}}"#;
        match decode_frame(frame).unwrap() {
            Some(Inbound::Manual(cmd)) => {
                assert_eq!(cmd.mode_code, MANUAL_MODE_CODE);
                assert_eq!(cmd.frame_id, "remote");
                assert_eq!(cmd.timestamp.timestamp(), 100);
                assert!((cmd.accel - 0.5).abs() < f64::EPSILON);
                assert!(!cmd.emergency);
            }
            other => panic!("expected manual command, got {other:?}"),
        }
    }

    #[test]
    fn decode_remote_cmd_emergency_flag() {
        let frame = r#"{"op":"publish","topic":"/remote_cmd","msg":{
            "mode":2,"accel":0,"brake":1,"steer":0,"gear":0,"emergency":1}}"#;
        let Some(Inbound::Manual(cmd)) = decode_frame(frame).unwrap() else {
            panic!("expected manual command");
        };
        assert!(cmd.emergency);
    }

    #[test]
    fn decode_twist_cmd() {
        let frame = r#"{"op":"publish","topic":"/twist_cmd","msg":{
            "header":{"frame_id":"base_link"},
            "twist":{"linear":{"x":2.0,"y":0,"z":0},"angular":{"x":0,"y":0,"z":-0.3}}}}"#;
        let Some(Inbound::Autonomous(update)) = decode_frame(frame).unwrap() else {
            panic!("expected autonomous update");
        };
        assert_eq!(update.frame_id, "base_link");
        assert_eq!(
            update.payload,
            AutonomousPayload::Twist {
                linear_x: 2.0,
                angular_z: -0.3
            }
        );
    }

    #[test]
    fn decode_every_sub_source_topic() {
        let cases = [
            (r#"{"mode":0}"#, SubSourceKind::Mode),
            (r#"{"gear":3}"#, SubSourceKind::Gear),
            (r#"{"accel":0.2}"#, SubSourceKind::Accel),
            (r#"{"steer":0.1}"#, SubSourceKind::Steer),
            (r#"{"brake":0.9}"#, SubSourceKind::Brake),
            (
                r#"{"cmd":{"linear_velocity":4.0,"steering_angle":0.05}}"#,
                SubSourceKind::Ctrl,
            ),
        ];
        for (body, kind) in cases {
            let frame = format!(
                r#"{{"op":"publish","topic":"{}","msg":{}}}"#,
                kind.topic(),
                body
            );
            let Some(Inbound::Autonomous(update)) = decode_frame(&frame).unwrap() else {
                panic!("expected autonomous update for {kind:?}");
            };
            assert_eq!(update.kind(), kind);
        }
    }

    #[test]
    fn decode_ignores_other_ops_and_topics() {
        assert!(decode_frame(r#"{"op":"subscribe","topic":"/select_cmd"}"#)
            .unwrap()
            .is_none());
        assert!(decode_frame(r#"{"op":"publish","topic":"/unknown","msg":{}}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        assert!(matches!(decode_frame("not json"), Err(ArbiterError::Parsing(_))));
        let missing_field = r#"{"op":"publish","topic":"/accel_cmd","msg":{"header":{}}}"#;
        assert!(matches!(decode_frame(missing_field), Err(ArbiterError::Parsing(_))));
    }

    #[test]
    fn encode_select_cmd_frame() {
        let state = CommandState {
            sequence: 3,
            frame_id: "remote".into(),
            accel: 0.5,
            emergency: true,
            ..CommandState::default()
        };
        let json = encode_event(&Event::new("test", EventPayload::SelectCmd(state))).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["op"], "publish");
        assert_eq!(value["topic"], "/select_cmd");
        assert_eq!(value["msg"]["header"]["seq"], 3);
        assert_eq!(value["msg"]["header"]["frame_id"], "remote");
        assert_eq!(value["msg"]["accel"], 0.5);
        assert_eq!(value["msg"]["linear_velocity"], -1.0);
        assert_eq!(value["msg"]["emergency"], 1);
    }

    #[test]
    fn encode_emergency_stop_frame() {
        let json = encode_event(&Event::new("test", EventPayload::EmergencyStop(true))).unwrap();
        assert_eq!(
            json,
            r#"{"op":"publish","topic":"/emergency_stop","msg":{"data":true}}"#
        );
    }

    #[tokio::test]
    async fn incoming_message_is_forwarded_to_queue() {
        let (_bus, mut rx, bridge) = make_bridge();
        bridge
            .handle_incoming_ws_message(
                r#"{"op":"publish","topic":"/brake_cmd","msg":{"brake":0.4}}"#,
            )
            .await;
        let Some(Inbound::Autonomous(update)) = rx.recv().await else {
            panic!("expected forwarded update");
        };
        assert_eq!(update.payload, AutonomousPayload::Brake { brake: 0.4 });
    }

    #[tokio::test]
    async fn malformed_message_is_dropped() {
        let (_bus, mut rx, bridge) = make_bridge();
        bridge.handle_incoming_ws_message("{").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ws_client_gets_latched_state_and_can_publish() {
        let (bus, mut rx, bridge) = make_bridge();
        bus.publish_to(
            Topic::EmergencyStop,
            Event::new("test", EventPayload::EmergencyStop(true)),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(bridge.serve(listener));

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        let first = client.next().await.unwrap().unwrap();
        assert!(first.to_text().unwrap().contains("/emergency_stop"));

        client
            .send(Message::Text(
                String::from(r#"{"op":"publish","topic":"/steer_cmd","msg":{"steer":0.25}}"#).into(),
            ))
            .await
            .unwrap();

        let forwarded = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        let Some(Inbound::Autonomous(update)) = forwarded else {
            panic!("expected forwarded update");
        };
        assert_eq!(update.payload, AutonomousPayload::Steer { steer: 0.25 });
    }
}
