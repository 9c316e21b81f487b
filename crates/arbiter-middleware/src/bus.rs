//! Typed, topic-based publish/subscribe bus for selector output.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the publisher.  Each lane also keeps its most recent event in a
//! [`tokio::sync::watch`] slot, so a consumer that connects late can start
//! from the current command and e-stop state instead of waiting for the next
//! emission.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::SelectCmd`] | Every merged [`CommandState`][arbiter_types::CommandState] snapshot |
//! | [`Topic::EmergencyStop`] | The emergency-stop signal, repeated every watchdog tick while latched |

use std::sync::Arc;

use arbiter_types::Event;
use tokio::sync::{broadcast, watch};

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Outbound routing lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// The selected command stream.
    SelectCmd,
    /// The emergency-stop signal.
    EmergencyStop,
}

impl Topic {
    /// External topic name used by the bridge.
    pub fn name(self) -> &'static str {
        match self {
            Topic::SelectCmd => "/select_cmd",
            Topic::EmergencyStop => "/emergency_stop",
        }
    }
}

#[derive(Debug, Clone)]
struct Lane {
    live: broadcast::Sender<Event>,
    latched: Arc<watch::Sender<Option<Event>>>,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity);
        let (latched, _) = watch::channel(None);
        Self {
            live,
            latched: Arc::new(latched),
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    select_cmd: Lane,
    emergency_stop: Lane,
}

impl EventBus {
    /// Create a new bus with the given channel capacity per topic.
    pub fn new(capacity: usize) -> Self {
        Self {
            select_cmd: Lane::new(capacity),
            emergency_stop: Lane::new(capacity),
        }
    }

    /// Publish `event` to the given [`Topic`] and latch it as the topic's
    /// latest value.
    ///
    /// Returns the number of live receivers that were handed the event.
    /// Zero receivers is a normal condition: the event is still latched.
    pub fn publish_to(&self, topic: Topic, event: Event) -> usize {
        let lane = self.lane(topic);
        lane.latched.send_replace(Some(event.clone()));
        lane.live.send(event).unwrap_or(0)
    }

    /// Subscribe to future events on a [`Topic`].
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.lane(topic).live.subscribe(),
        }
    }

    /// The most recent event published to `topic`, if any.
    pub fn latest(&self, topic: Topic) -> Option<Event> {
        self.lane(topic).latched.borrow().clone()
    }

    fn lane(&self, topic: Topic) -> &Lane {
        match topic {
            Topic::SelectCmd => &self.select_cmd,
            Topic::EmergencyStop => &self.emergency_stop,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`recv`][Self::recv].
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
