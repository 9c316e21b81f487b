//! `arbiter-middleware` – transport plumbing around the selector core.
//!
//! Routes data between the selector and the outside world without caring
//! about what it means.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe bus with latched lanes,
//!   built on Tokio broadcast and watch channels.
//! - [`gateway`] – the [`CommandGateway`] sink the selector emits into, and
//!   [`BusGateway`], which forwards onto the bus.
//! - [`bridge`] – rosbridge-style WebSocket server that feeds inbound
//!   commands to the selector and streams its output to clients.

pub mod bridge;
pub mod bus;
pub mod gateway;

pub use bridge::{decode_frame, encode_event, CommandBridge};
pub use bus::{EventBus, Topic, TopicReceiver};
pub use gateway::{BusGateway, CommandGateway, GATEWAY_SOURCE};
