//! Typed events fanned out over the in-process bus.
//!
//! Delivery is at-least-once per live subscription and a slow subscriber can miss
//! messages (it is told how many), so handlers must be idempotent and treat every
//! snapshot as a full replacement of what they held.

use std::sync::Arc;

use reef_bus::{Bus, LocalBus, Subscription};
use tracing::trace;

use crate::error::ConnectivityError;
use crate::heartbeat::HeartbeatSample;
use crate::service::{SessionId, ViewportId};
use crate::session::SessionSnapshot;
use crate::viewport::ViewportSnapshot;

pub const VIEWPORT_TOPIC: &str = "reef.viewport";
pub const SESSION_TOPIC: &str = "reef.session";
pub const HEARTBEAT_TOPIC: &str = "reef.heartbeat";
pub const REGISTRY_TOPIC: &str = "reef.registry";

#[derive(Debug, Clone)]
pub enum ViewportEvent {
    Refreshed(ViewportSnapshot),
    /// The last good window is still held; nothing retries on its own.
    RefreshFailed {
        viewport_id: ViewportId,
        error: String,
    },
    Released {
        viewport_id: ViewportId,
    },
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    MetadataChanged(SessionSnapshot),
    Closed { session_id: SessionId },
}

#[derive(Debug, Clone)]
pub enum HeartbeatEvent {
    Tick(HeartbeatSample),
    Failed { error: Arc<ConnectivityError> },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Opened { session_id: SessionId, active: usize },
    Closed { session_id: SessionId, active: usize },
    /// The last session closed and the heartbeat was stopped.
    Idle,
}

#[derive(Debug, Clone)]
pub enum ReefEvent {
    Viewport(ViewportEvent),
    Session(SessionEvent),
    Heartbeat(HeartbeatEvent),
    Registry(RegistryEvent),
}

impl ReefEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            ReefEvent::Viewport(_) => VIEWPORT_TOPIC,
            ReefEvent::Session(_) => SESSION_TOPIC,
            ReefEvent::Heartbeat(_) => HEARTBEAT_TOPIC,
            ReefEvent::Registry(_) => REGISTRY_TOPIC,
        }
    }
}

impl From<ViewportEvent> for ReefEvent {
    fn from(event: ViewportEvent) -> Self {
        ReefEvent::Viewport(event)
    }
}

impl From<SessionEvent> for ReefEvent {
    fn from(event: SessionEvent) -> Self {
        ReefEvent::Session(event)
    }
}

impl From<HeartbeatEvent> for ReefEvent {
    fn from(event: HeartbeatEvent) -> Self {
        ReefEvent::Heartbeat(event)
    }
}

impl From<RegistryEvent> for ReefEvent {
    fn from(event: RegistryEvent) -> Self {
        ReefEvent::Registry(event)
    }
}

/// Cheap, cloneable handle onto the process bus.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    bus: Arc<LocalBus<ReefEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bus: Arc::new(LocalBus::with_capacity(capacity)),
        }
    }

    pub fn publish(&self, event: impl Into<ReefEvent>) {
        let event = event.into();
        let topic = event.topic();
        match self.bus.publish(topic, event) {
            Ok(delivered) => {
                trace!(target: "reef::events", topic, delivered, "event published");
            }
            Err(err) => {
                trace!(target: "reef::events", topic, error = %err, "event dropped");
            }
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription<ReefEvent> {
        self.bus.subscribe(topic)
    }
}
