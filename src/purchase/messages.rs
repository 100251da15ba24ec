//! Message types flowing out of the engine.
//!
//! The classifier reduces a raw storefront response to an [`Outcome`];
//! every state transition is published as a [`PurchaseEvent`] on the
//! [`EventBus`] for whoever wants timing/outcome samples.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use super::types::{AttemptId, AttemptState, BatchId, ItemRef};
use crate::error::ErrorKind;

// ─────────────────────────────────────────────────────────
// Classifier output (Storefront response → engine)
// ─────────────────────────────────────────────────────────

/// Closed set of outcome tags for one remote purchase call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// 5xx-class or throttling response; worth retrying.
    TransientFailure(String),
    /// Definitive refusal (out of stock, payment declined).
    PermanentFailure(String),
}

// ─────────────────────────────────────────────────────────
// Observability events (engine → subscribers)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum PurchaseEvent {
    /// Session Manager finished a login.
    SessionAcquired {
        latency: Duration,
        /// Login page fetch and token scrape.
        preparation: Duration,
        /// Credential post.
        authentication: Duration,
        refresh_count: u32,
    },
    /// All members of a batch were moved Pending → Scheduled in one step.
    BatchReleased {
        batch_id: BatchId,
        fire_at: DateTime<Utc>,
        released_at: DateTime<Utc>,
        /// released_at − fire_at, zero or positive.
        skew: Duration,
        size: usize,
    },
    /// One attempt changed state (or re-entered InFlight for a retry).
    AttemptTransition {
        batch_id: BatchId,
        attempt_id: AttemptId,
        item: ItemRef,
        from: AttemptState,
        to: AttemptState,
        attempt_count: u32,
        latency: Option<Duration>,
        error: Option<ErrorKind>,
        at: DateTime<Utc>,
    },
    /// Every member reached a terminal state.
    BatchCompleted {
        batch_id: BatchId,
        succeeded: usize,
        total: usize,
    },
}

/// Fire-and-forget broadcast of [`PurchaseEvent`]s.
///
/// Publishing never blocks; with no subscribers events are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PurchaseEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: PurchaseEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PurchaseEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
