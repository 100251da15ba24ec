//! Status Registry: in-memory table of batches and their attempts.
//!
//! Each attempt lives behind its own lock, so unrelated attempts never
//! contend. A per-batch gate is held for write by batch-wide transitions
//! (release, cancel, abort) and for read by snapshots, which keeps a
//! half-released batch invisible to readers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use super::messages::{EventBus, PurchaseEvent};
use super::stats::EngineStats;
use super::types::{
    AttemptId, AttemptState, BatchId, BatchState, BatchStatus, ItemRef, PurchaseAttempt,
    StateCounts, StatusRecord,
};
use crate::error::{EngineError, Result};

// ─────────────────────────────────────────────────────────
// Batch entry
// ─────────────────────────────────────────────────────────

pub struct BatchEntry {
    id: BatchId,
    fire_at: DateTime<Utc>,
    submitted_at: DateTime<Utc>,
    released_at: RwLock<Option<DateTime<Utc>>>,
    completed_at: RwLock<Option<DateTime<Utc>>>,
    gate: RwLock<()>,
    attempts: Vec<RwLock<PurchaseAttempt>>,
}

impl BatchEntry {
    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn fire_at(&self) -> DateTime<Utc> {
        self.fire_at
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn attempt(&self, idx: usize) -> PurchaseAttempt {
        self.attempts[idx].read().clone()
    }

    pub fn item(&self, idx: usize) -> ItemRef {
        self.attempts[idx].read().item.clone()
    }

    pub fn state(&self, idx: usize) -> AttemptState {
        self.attempts[idx].read().state
    }

    pub fn released_at(&self) -> Option<DateTime<Utc>> {
        *self.released_at.read()
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.read()
    }

    pub fn snapshot(&self) -> BatchStatus {
        let _gate = self.gate.read();
        let attempts: Vec<_> = self.attempts.iter().map(|a| a.read().status()).collect();
        let states = attempts.iter().map(|a| a.state);
        BatchStatus {
            batch_id: self.id,
            state: BatchState::derive(states.clone()),
            fire_at: self.fire_at,
            submitted_at: self.submitted_at,
            released_at: self.released_at(),
            completed_at: self.completed_at(),
            counts: StateCounts::tally(states),
            attempts,
        }
    }

    fn all_terminal(&self) -> bool {
        self.attempts.iter().all(|a| a.read().state.is_terminal())
    }
}

// ─────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────

pub struct StatusRegistry {
    batches: RwLock<HashMap<BatchId, Arc<BatchEntry>>>,
    attempt_index: RwLock<HashMap<AttemptId, (BatchId, usize)>>,
    events: EventBus,
    stats: Arc<EngineStats>,
}

impl StatusRegistry {
    pub fn new(events: EventBus, stats: Arc<EngineStats>) -> Self {
        Self {
            batches: RwLock::new(HashMap::new()),
            attempt_index: RwLock::new(HashMap::new()),
            events,
            stats,
        }
    }

    /// Register a freshly validated batch. Every attempt must be Pending.
    pub fn insert(&self, fire_at: DateTime<Utc>, attempts: Vec<PurchaseAttempt>) -> Arc<BatchEntry> {
        let id = BatchId::new();
        {
            let mut index = self.attempt_index.write();
            for (i, a) in attempts.iter().enumerate() {
                debug_assert_eq!(a.state, AttemptState::Pending);
                index.insert(a.id, (id, i));
            }
        }
        let entry = Arc::new(BatchEntry {
            id,
            fire_at,
            submitted_at: Utc::now(),
            released_at: RwLock::new(None),
            completed_at: RwLock::new(None),
            gate: RwLock::new(()),
            attempts: attempts.into_iter().map(RwLock::new).collect(),
        });
        self.batches.write().insert(id, Arc::clone(&entry));
        entry
    }

    pub fn entry(&self, id: BatchId) -> Option<Arc<BatchEntry>> {
        self.batches.read().get(&id).cloned()
    }

    pub fn batch(&self, id: BatchId) -> Result<BatchStatus> {
        self.entry(id)
            .map(|e| e.snapshot())
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Look up a batch or attempt identifier.
    pub fn get(&self, id: &str) -> Result<StatusRecord> {
        let uuid = uuid::Uuid::parse_str(id.trim())
            .map_err(|_| EngineError::NotFound(id.to_string()))?;

        if let Some(entry) = self.entry(BatchId(uuid)) {
            return Ok(StatusRecord::Batch(entry.snapshot()));
        }
        let located = self.attempt_index.read().get(&AttemptId(uuid)).copied();
        if let Some((batch_id, idx)) = located {
            if let Some(entry) = self.entry(batch_id) {
                return Ok(StatusRecord::Attempt(entry.attempt(idx).status()));
            }
        }
        Err(EngineError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.batches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.read().is_empty()
    }

    // ─────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────

    /// Move one attempt to `to`, letting `f` fill in the side fields.
    /// Returns false (and changes nothing) if the edge is not allowed.
    pub fn update<F>(&self, entry: &BatchEntry, idx: usize, to: AttemptState, f: F) -> bool
    where
        F: FnOnce(&mut PurchaseAttempt),
    {
        let event = {
            let _gate = entry.gate.read();
            let mut attempt = entry.attempts[idx].write();
            let from = attempt.state;
            if !from.can_transition_to(to) {
                debug!(
                    batch = %entry.id, attempt = %attempt.id,
                    "ignored transition {} -> {}", from.as_str(), to.as_str()
                );
                return false;
            }
            attempt.state = to;
            f(&mut attempt);
            if to.is_terminal() && attempt.ended_at.is_none() {
                attempt.ended_at = Some(Utc::now());
            }
            Self::transition_event(entry.id, &attempt, from)
        };
        self.after_transitions(entry, vec![event]);
        true
    }

    /// Release every Pending member as one step. Returns the release time
    /// and how many attempts moved.
    pub fn release(&self, entry: &BatchEntry) -> (DateTime<Utc>, usize) {
        let (released_at, events) = {
            let _gate = entry.gate.write();
            let now = Utc::now();
            let mut events = Vec::with_capacity(entry.len());
            for slot in &entry.attempts {
                let mut attempt = slot.write();
                if attempt.state == AttemptState::Pending {
                    attempt.state = AttemptState::Scheduled;
                    events.push(Self::transition_event(entry.id, &attempt, AttemptState::Pending));
                }
            }
            *entry.released_at.write() = Some(now);
            (now, events)
        };
        let moved = events.len();
        self.after_transitions(entry, events);
        (released_at, moved)
    }

    /// Move every non-terminal member to `to` (Cancelled or Failed) as one step.
    pub fn settle_all(&self, entry: &BatchEntry, to: AttemptState, error: Option<EngineError>) -> usize {
        let events = {
            let _gate = entry.gate.write();
            let now = Utc::now();
            let mut events = Vec::new();
            for slot in &entry.attempts {
                let mut attempt = slot.write();
                let from = attempt.state;
                if !from.can_transition_to(to) || from == to {
                    continue;
                }
                attempt.state = to;
                if let Some(e) = &error {
                    attempt.last_error = Some(e.clone());
                }
                if to.is_terminal() {
                    attempt.ended_at = Some(now);
                }
                events.push(Self::transition_event(entry.id, &attempt, from));
            }
            events
        };
        let moved = events.len();
        self.after_transitions(entry, events);
        moved
    }

    fn transition_event(batch_id: BatchId, attempt: &PurchaseAttempt, from: AttemptState) -> PurchaseEvent {
        PurchaseEvent::AttemptTransition {
            batch_id,
            attempt_id: attempt.id,
            item: attempt.item.clone(),
            from,
            to: attempt.state,
            attempt_count: attempt.attempt_count,
            latency: attempt.latency,
            error: attempt.last_error.as_ref().map(EngineError::kind),
            at: Utc::now(),
        }
    }

    fn after_transitions(&self, entry: &BatchEntry, events: Vec<PurchaseEvent>) {
        let mut any_terminal = false;
        for event in events {
            if let PurchaseEvent::AttemptTransition { attempt_id, item, from, to, attempt_count, latency, error, .. } = &event {
                debug!(
                    batch = %entry.id, attempt = %attempt_id, item = %item,
                    from = from.as_str(), to = to.as_str(), calls = attempt_count,
                    latency_ms = latency.map(|d| d.as_millis() as u64),
                    error = ?error,
                    "attempt transition"
                );
                if to.is_terminal() {
                    any_terminal = true;
                    self.stats.record_terminal(*to);
                }
            }
            self.events.publish(event);
        }

        if any_terminal && entry.all_terminal() {
            let mut completed = entry.completed_at.write();
            if completed.is_none() {
                *completed = Some(Utc::now());
                drop(completed);
                let status = entry.snapshot();
                info!(
                    batch = %entry.id,
                    "🏁 Batch completed | ok={} failed={} timed_out={} cancelled={}",
                    status.counts.succeeded, status.counts.failed,
                    status.counts.timed_out, status.counts.cancelled,
                );
                self.events.publish(PurchaseEvent::BatchCompleted {
                    batch_id: entry.id,
                    succeeded: status.counts.succeeded,
                    total: status.counts.total(),
                });
            }
        }
    }

    // ─────────────────────────────────────────────────
    // Retention
    // ─────────────────────────────────────────────────

    /// Drop batches that completed before `cutoff`. Live batches are never evicted.
    pub fn evict_completed(&self, cutoff: DateTime<Utc>) -> usize {
        let expired: Vec<Arc<BatchEntry>> = {
            let mut batches = self.batches.write();
            let ids: Vec<BatchId> = batches
                .values()
                .filter(|e| e.completed_at().is_some_and(|t| t < cutoff))
                .map(|e| e.id)
                .collect();
            ids.iter().filter_map(|id| batches.remove(id)).collect()
        };
        if expired.is_empty() {
            return 0;
        }
        let mut index = self.attempt_index.write();
        for entry in &expired {
            for slot in &entry.attempts {
                index.remove(&slot.read().id);
            }
        }
        info!("🧹 Evicted {} completed batch(es)", expired.len());
        expired.len()
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purchase::types::ItemRef;

    fn registry() -> StatusRegistry {
        StatusRegistry::new(EventBus::default(), Arc::new(EngineStats::new()))
    }

    fn attempts(n: usize) -> Vec<PurchaseAttempt> {
        (0..n)
            .map(|i| PurchaseAttempt::new(ItemRef::from(i as u64), 0, Utc::now()))
            .collect()
    }

    #[test]
    fn test_new_batch_is_pending() {
        let r = registry();
        let e = r.insert(Utc::now(), attempts(3));
        let s = r.batch(e.id()).unwrap();
        assert_eq!(s.state, BatchState::Pending);
        assert_eq!(s.counts.pending, 3);
        assert!(s.released_at.is_none());
    }

    #[test]
    fn test_release_moves_every_member() {
        let r = registry();
        let e = r.insert(Utc::now(), attempts(4));
        let (_, moved) = r.release(&e);
        assert_eq!(moved, 4);
        let s = r.batch(e.id()).unwrap();
        assert_eq!(s.state, BatchState::Scheduled);
        assert!(s.released_at.is_some());
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let r = registry();
        let e = r.insert(Utc::now(), attempts(1));
        assert!(!r.update(&e, 0, AttemptState::Succeeded, |_| {}));
        assert_eq!(e.state(0), AttemptState::Pending);
    }

    #[test]
    fn test_terminal_record_is_immutable() {
        let r = registry();
        let e = r.insert(Utc::now(), attempts(1));
        r.release(&e);
        assert!(r.update(&e, 0, AttemptState::InFlight, |a| a.attempt_count = 1));
        assert!(r.update(&e, 0, AttemptState::Succeeded, |_| {}));
        assert!(!r.update(&e, 0, AttemptState::Failed, |a| a.attempt_count = 9));
        assert_eq!(r.settle_all(&e, AttemptState::Cancelled, None), 0);

        let a = e.attempt(0);
        assert_eq!(a.state, AttemptState::Succeeded);
        assert_eq!(a.attempt_count, 1);
        assert!(a.ended_at.is_some());
    }

    #[test]
    fn test_completion_is_recorded_once_all_terminal() {
        let r = registry();
        let mut rx = r.events.subscribe();
        let e = r.insert(Utc::now(), attempts(2));
        r.release(&e);
        r.update(&e, 0, AttemptState::InFlight, |_| {});
        r.update(&e, 0, AttemptState::Succeeded, |_| {});
        assert!(e.completed_at().is_none());
        assert_eq!(r.batch(e.id()).unwrap().state, BatchState::Running);

        r.settle_all(&e, AttemptState::Cancelled, None);
        let s = r.batch(e.id()).unwrap();
        assert_eq!(s.state, BatchState::Completed);
        assert!(s.completed_at.is_some());
        assert_eq!(s.counts.terminal(), 2);

        let mut completed = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, PurchaseEvent::BatchCompleted { .. }) {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
    }

    #[test]
    fn test_settle_all_records_error() {
        let r = registry();
        let e = r.insert(Utc::now(), attempts(2));
        r.release(&e);
        let n = r.settle_all(&e, AttemptState::Failed, Some(EngineError::Authentication("nope".into())));
        assert_eq!(n, 2);
        assert!(matches!(e.attempt(1).last_error, Some(EngineError::Authentication(_))));
    }

    #[test]
    fn test_get_resolves_batches_and_attempts() {
        let r = registry();
        let e = r.insert(Utc::now(), attempts(2));
        let attempt_id = e.attempt(1).id;

        assert!(matches!(r.get(&e.id().to_string()), Ok(StatusRecord::Batch(_))));
        match r.get(&attempt_id.to_string()) {
            Ok(StatusRecord::Attempt(a)) => assert_eq!(a.id, attempt_id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(r.get("unknown-id"), Err(EngineError::NotFound(_))));
        assert!(matches!(r.get(&uuid::Uuid::new_v4().to_string()), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_eviction_skips_live_batches() {
        let r = registry();
        let done = r.insert(Utc::now(), attempts(1));
        let live = r.insert(Utc::now(), attempts(1));
        r.settle_all(&done, AttemptState::Cancelled, None);
        let done_attempt = done.attempt(0).id;

        let evicted = r.evict_completed(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(evicted, 1);
        assert!(r.batch(done.id()).is_err());
        assert!(r.get(&done_attempt.to_string()).is_err());
        assert!(r.batch(live.id()).is_ok());
    }
}
