//! Headless, topic-based publish/subscribe bus for operational events.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives
//! every message and no subscriber can block a publisher.
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Link`] | Connection state transitions |
//! | [`Topic::SystemAlerts`] | Watchdog trips and alerts, actuation faults |
//! | [`Topic::Decisions`] | Issued commands and decision faults |

use carlink_types::{Event, LinkError};
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Link,
    SystemAlerts,
    Decisions,
}

/// Shared event bus.  Clones share the same underlying channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    link: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
    decisions: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus whose topic channels each buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (link, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        let (decisions, _) = broadcast::channel(capacity);
        Self {
            link,
            system_alerts,
            decisions,
        }
    }

    /// Publish `event` on `topic`.
    ///
    /// Returns the number of receivers that were handed the event.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Transport`] when nobody is subscribed to the
    /// topic.  Publishers treat this as best-effort and usually ignore it.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, LinkError> {
        self.sender(topic)
            .send(event)
            .map_err(|_| LinkError::Transport(format!("no subscribers for topic {topic:?}")))
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.sender(topic).subscribe(),
        }
    }

    fn sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Link => &self.link,
            Topic::SystemAlerts => &self.system_alerts,
            Topic::Decisions => &self.decisions,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// `Lagged(n)` means the subscriber fell behind and `n` events were
    /// dropped; `Closed` means the bus is gone.
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
