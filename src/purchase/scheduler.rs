//! Scheduler: holds a batch until its fire time, then releases every
//! member in one registry step.
//!
//! The wait is two-phase: a timer sleep up to `spin_window` before the
//! deadline, then a cooperative fine wait (`yield_now`) for the remainder.
//! Other batches keep running throughout. Wall-clock fire times are mapped
//! onto the monotonic clock once, when the wait starts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::messages::{EventBus, PurchaseEvent};
use super::registry::{BatchEntry, StatusRegistry};
use super::types::AttemptState;

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Length of the fine-wait phase right before the deadline.
    pub spin_window: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            spin_window: Duration::from_millis(20),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = std::env::var("SPIN_WINDOW_MS") { if let Ok(n) = v.parse() { c.spin_window = Duration::from_millis(n); } }
        c
    }
}

/// How an armed batch left the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Released {
        released_at: DateTime<Utc>,
        /// How late the release was relative to the fire time.
        skew: Duration,
    },
    Cancelled,
}

// ─────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────

pub struct Scheduler {
    cfg: SchedulerConfig,
    registry: Arc<StatusRegistry>,
    events: EventBus,
}

impl Scheduler {
    pub fn new(cfg: SchedulerConfig, registry: Arc<StatusRegistry>, events: EventBus) -> Self {
        Self { cfg, registry, events }
    }

    /// Wait until `target` or until `cancel` fires. Returns false if cancelled.
    /// A target in the past returns immediately.
    pub async fn wait_until(&self, target: DateTime<Utc>, cancel: &CancellationToken) -> bool {
        let deadline = monotonic_deadline(target);

        if let Some(coarse) = deadline.checked_sub(self.cfg.spin_window) {
            if coarse > Instant::now() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep_until(coarse) => {}
                }
            }
        }

        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if Instant::now() >= deadline {
                return true;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Hold `batch` until its fire time, then move every member
    /// Pending → Scheduled at once. On cancellation every non-terminal
    /// member becomes Cancelled and nothing is released.
    pub async fn arm(&self, batch: &BatchEntry, cancel: &CancellationToken) -> Release {
        let fire_at = batch.fire_at();

        if !self.wait_until(fire_at, cancel).await {
            let n = self.registry.settle_all(batch, AttemptState::Cancelled, None);
            info!(batch = %batch.id(), "🛑 Batch cancelled before release ({} attempts)", n);
            return Release::Cancelled;
        }

        let (released_at, moved) = self.registry.release(batch);
        let skew = (released_at - fire_at).to_std().unwrap_or_default();

        self.events.publish(PurchaseEvent::BatchReleased {
            batch_id: batch.id(),
            fire_at,
            released_at,
            skew,
            size: moved,
        });
        info!(
            batch = %batch.id(),
            skew_ms = skew.as_secs_f64() * 1000.0,
            "🚀 Released {} attempt(s)", moved
        );
        Release::Released { released_at, skew }
    }
}

fn monotonic_deadline(target: DateTime<Utc>) -> Instant {
    let now = Instant::now();
    match (target - Utc::now()).to_std() {
        Ok(ahead) => now + ahead,
        Err(_) => now,
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::purchase::stats::EngineStats;
    use crate::purchase::types::{BatchState, ItemRef, PurchaseAttempt};

    fn setup(fire_at: DateTime<Utc>, n: usize) -> (Arc<StatusRegistry>, Scheduler, Arc<BatchEntry>) {
        let events = EventBus::default();
        let registry = Arc::new(StatusRegistry::new(events.clone(), Arc::new(EngineStats::new())));
        let attempts = (0..n)
            .map(|i| PurchaseAttempt::new(ItemRef::from(i as u64), 0, fire_at))
            .collect();
        let entry = registry.insert(fire_at, attempts);
        let scheduler = Scheduler::new(SchedulerConfig::default(), Arc::clone(&registry), events);
        (registry, scheduler, entry)
    }

    #[tokio::test]
    async fn test_past_due_batch_releases_immediately() {
        let fire_at = Utc::now() - chrono::Duration::seconds(30);
        let (registry, scheduler, entry) = setup(fire_at, 3);

        let started = std::time::Instant::now();
        let release = scheduler.arm(&entry, &CancellationToken::new()).await;
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(matches!(release, Release::Released { .. }));
        assert_eq!(registry.batch(entry.id()).unwrap().state, BatchState::Scheduled);
    }

    #[tokio::test]
    async fn test_release_lands_on_fire_time() {
        let fire_at = Utc::now() + chrono::Duration::milliseconds(150);
        let (_registry, scheduler, entry) = setup(fire_at, 5);

        match scheduler.arm(&entry, &CancellationToken::new()).await {
            Release::Released { released_at, skew } => {
                assert!(released_at >= fire_at);
                assert!(skew < Duration::from_millis(100), "skew {:?}", skew);
            }
            Release::Cancelled => panic!("not cancelled"),
        }
    }

    #[tokio::test]
    async fn test_cancel_before_fire_cancels_all_members() {
        let fire_at = Utc::now() + chrono::Duration::seconds(10);
        let (registry, scheduler, entry) = setup(fire_at, 3);
        let cancel = CancellationToken::new();

        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.cancel();
        });

        let started = std::time::Instant::now();
        assert_eq!(scheduler.arm(&entry, &cancel).await, Release::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));

        let s = registry.batch(entry.id()).unwrap();
        assert_eq!(s.counts.cancelled, 3);
        assert_eq!(s.state, BatchState::Completed);
        assert!(s.released_at.is_none());
    }

    #[tokio::test]
    async fn test_wait_does_not_block_other_tasks() {
        let fire_at = Utc::now() + chrono::Duration::milliseconds(100);
        let (_registry, scheduler, _entry) = setup(fire_at, 1);

        let ticker = tokio::spawn(async {
            let mut ticks = 0u32;
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                ticks += 1;
            }
            ticks
        });
        assert!(scheduler.wait_until(fire_at, &CancellationToken::new()).await);
        assert_eq!(ticker.await.unwrap(), 5);
    }
}
