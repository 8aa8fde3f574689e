//! In-process publish/subscribe fan-out for job status updates.
//!
//! Topic-keyed, the shape of `kernel/stream_hub.rs`: a `HashMap` behind an
//! async lock, subscribed-to on demand, cleaned up when empty. Unlike
//! `stream_hub.rs`, this hands each subscriber its own bounded
//! `tokio::sync::mpsc` channel rather than a shared `broadcast` channel — a
//! `broadcast` lagging reader forces every other reader to skip forward,
//! which violates "slow subscribers are dropped, never block publishers"
//! for the *other* subscribers on the same topic. A full `mpsc` queue means
//! exactly that one subscriber is gone; everyone else is unaffected.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::model::JobStatus;

const SUBSCRIBER_QUEUE_CAPACITY: usize = 100;

/// `{type: "job.updated", job_id, status, result?, error?}`, addressed to a
/// `chat:<user_id>` channel. Ephemeral — never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "job.updated")]
    JobUpdated {
        job_id: Uuid,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl Event {
    /// The SSE `event:` field name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::JobUpdated { .. } => "job.updated",
            Event::Ping => "ping",
        }
    }

    pub fn channel(user_id: &str) -> String {
        format!("chat:{user_id}")
    }
}

/// A live subscription to one channel. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

/// In-process pub/sub hub, keyed by channel (`chat:<user_id>`). Cloneable,
/// thread-safe.
#[derive(Clone)]
pub struct EventBus {
    channels: Arc<RwLock<HashMap<String, Vec<mpsc::Sender<Event>>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to a channel, creating it if it doesn't exist.
    pub async fn subscribe(&self, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut channels = self.channels.write().await;
        channels.entry(channel.to_string()).or_default().push(tx);
        Subscription { rx }
    }

    /// Publish an event to a channel. Never blocks: a subscriber whose
    /// queue is full is dropped rather than waited on. No-op if the channel
    /// has no subscribers.
    pub async fn publish(&self, channel: &str, event: Event) {
        let mut channels = self.channels.write().await;
        let Some(senders) = channels.get_mut(channel) else {
            return;
        };
        senders.retain(|tx| tx.try_send(event.clone()).is_ok());
        if senders.is_empty() {
            channels.remove(channel);
        }
    }

    /// Remove channels with no remaining subscribers (housekeeping; also
    /// happens inline on every publish, but a subscriber that disconnects
    /// without another publish ever landing on its channel would otherwise
    /// linger).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, senders| !senders.iter().all(|tx| tx.is_closed()));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
