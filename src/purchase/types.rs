use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind};

// ─────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BatchId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| EngineError::NotFound(s.to_string()))
    }
}

/// Storefront item reference (the lot number on the target site).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemRef(pub String);

impl ItemRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for ItemRef {
    fn from(lot: u64) -> Self {
        Self(lot.to_string())
    }
}

// ─────────────────────────────────────────────────────────
// Attempt lifecycle
// ─────────────────────────────────────────────────────────

/// Attempt state machine.
///
/// ```text
/// Pending ──► Scheduled ──► InFlight ──► Succeeded | Failed | TimedOut
///    │            │            │
///    └────────────┴────────────┴──► Cancelled | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Scheduled,
    InFlight,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Scheduled => "scheduled",
            AttemptState::InFlight => "in_flight",
            AttemptState::Succeeded => "succeeded",
            AttemptState::Failed => "failed",
            AttemptState::TimedOut => "timed_out",
            AttemptState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded
                | AttemptState::Failed
                | AttemptState::TimedOut
                | AttemptState::Cancelled
        )
    }

    /// InFlight → InFlight is allowed: every retry re-enters the remote call.
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;
        match (self, next) {
            (Pending, Scheduled | Cancelled | Failed) => true,
            (Scheduled, InFlight | Cancelled | Failed) => true,
            (InFlight, InFlight | Succeeded | Failed | TimedOut | Cancelled) => true,
            _ => false,
        }
    }
}

/// A single purchase request for one item within a batch.
#[derive(Debug, Clone)]
pub struct PurchaseAttempt {
    pub id: AttemptId,
    pub item: ItemRef,
    /// Position among the identical attempts created for the same item.
    pub copy: u32,
    pub fire_at: DateTime<Utc>,
    pub state: AttemptState,
    /// Number of remote purchase calls issued, including the first.
    pub attempt_count: u32,
    pub last_error: Option<EngineError>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Round-trip latency of the most recent remote call.
    pub latency: Option<Duration>,
}

impl PurchaseAttempt {
    pub fn new(item: ItemRef, copy: u32, fire_at: DateTime<Utc>) -> Self {
        Self {
            id: AttemptId::new(),
            item,
            copy,
            fire_at,
            state: AttemptState::Pending,
            attempt_count: 0,
            last_error: None,
            started_at: None,
            ended_at: None,
            latency: None,
        }
    }

    pub fn status(&self) -> AttemptStatus {
        AttemptStatus {
            id: self.id,
            item: self.item.clone(),
            copy: self.copy,
            state: self.state,
            attempt_count: self.attempt_count,
            error_kind: self.last_error.as_ref().map(EngineError::kind),
            last_error: self.last_error.as_ref().map(ToString::to_string),
            started_at: self.started_at,
            ended_at: self.ended_at,
            latency_ms: self.latency.map(|d| d.as_secs_f64() * 1000.0),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Status records (read views)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AttemptStatus {
    pub id: AttemptId,
    pub item: ItemRef,
    pub copy: u32,
    pub state: AttemptState,
    pub attempt_count: u32,
    pub error_kind: Option<ErrorKind>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// At least one member has not been released yet.
    Pending,
    /// All members released, none started.
    Scheduled,
    Running,
    /// Every member is terminal.
    Completed,
}

impl BatchState {
    pub fn derive<I>(states: I) -> Self
    where
        I: IntoIterator<Item = AttemptState>,
    {
        let counts = StateCounts::tally(states);
        if counts.total() == counts.terminal() {
            BatchState::Completed
        } else if counts.pending > 0 {
            BatchState::Pending
        } else if counts.scheduled == counts.total() {
            BatchState::Scheduled
        } else {
            BatchState::Running
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub scheduled: usize,
    pub in_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
}

impl StateCounts {
    pub fn tally<I>(states: I) -> Self
    where
        I: IntoIterator<Item = AttemptState>,
    {
        let mut c = Self::default();
        for s in states {
            match s {
                AttemptState::Pending => c.pending += 1,
                AttemptState::Scheduled => c.scheduled += 1,
                AttemptState::InFlight => c.in_flight += 1,
                AttemptState::Succeeded => c.succeeded += 1,
                AttemptState::Failed => c.failed += 1,
                AttemptState::TimedOut => c.timed_out += 1,
                AttemptState::Cancelled => c.cancelled += 1,
            }
        }
        c
    }

    pub fn terminal(&self) -> usize {
        self.succeeded + self.failed + self.timed_out + self.cancelled
    }

    pub fn total(&self) -> usize {
        self.pending + self.scheduled + self.in_flight + self.terminal()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch_id: BatchId,
    pub state: BatchState,
    pub fire_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counts: StateCounts,
    pub attempts: Vec<AttemptStatus>,
}

/// What a registry lookup resolves to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusRecord {
    Batch(BatchStatus),
    Attempt(AttemptStatus),
}
