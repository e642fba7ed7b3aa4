//! Typed, topic-keyed publish/subscribe for in-process fan-out.
//!
//! Each topic is backed by a bounded tokio `broadcast` channel. Subscribers that
//! fall behind are told how many messages they missed instead of blocking the
//! publisher, so handlers must tolerate gaps and duplicate delivery.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

pub const DEFAULT_TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage<M> {
    pub topic: String,
    pub payload: M,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("subscriber lagged behind; {0} messages dropped")]
    Lagged(u64),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus<M>: Send + Sync {
    fn subscribe(&self, topic: &str) -> Subscription<M>;

    /// Publishes to every live subscriber of `topic` and returns how many received it.
    /// A topic nobody listens to is not an error.
    fn publish(&self, topic: &str, payload: M) -> BusResult<usize>;
}

pub struct Subscription<M> {
    topic: String,
    rx: broadcast::Receiver<BusMessage<M>>,
}

impl<M: Clone> Subscription<M> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> BusResult<BusMessage<M>> {
        match self.rx.recv().await {
            Ok(msg) => Ok(msg),
            Err(RecvError::Closed) => Err(BusError::Closed),
            Err(RecvError::Lagged(missed)) => Err(BusError::Lagged(missed)),
        }
    }

    /// Non-blocking receive; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<BusResult<BusMessage<M>>> {
        match self.rx.try_recv() {
            Ok(msg) => Some(Ok(msg)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(BusError::Closed)),
            Err(TryRecvError::Lagged(missed)) => Some(Err(BusError::Lagged(missed))),
        }
    }
}

/// In-memory bus shared by every component of one process.
#[derive(Debug)]
pub struct LocalBus<M> {
    capacity: usize,
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage<M>>>>,
}

impl<M: Clone + Send + 'static> LocalBus<M> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage<M>> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl<M: Clone + Send + 'static> Default for LocalBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Clone + Send + Sync + 'static> Bus<M> for LocalBus<M> {
    fn subscribe(&self, topic: &str) -> Subscription<M> {
        Subscription {
            topic: topic.to_string(),
            rx: self.sender_for(topic).subscribe(),
        }
    }

    fn publish(&self, topic: &str, payload: M) -> BusResult<usize> {
        let sender = self.sender_for(topic);
        // broadcast::send only fails when there are no receivers.
        Ok(sender
            .send(BusMessage {
                topic: topic.to_string(),
                payload,
            })
            .unwrap_or(0))
    }
}
