//! Execution Coordinator: fires the released attempts of a batch.
//!
//! All Scheduled attempts of a batch are driven concurrently as futures of
//! the batch task. A semaphore shared across batches caps remote calls in
//! flight; an attempt waiting for a permit simply stays queued.
//!
//! Per attempt:
//!   permit → session → InFlight (calls += 1) → purchase under deadline
//!     ├─ deadline exceeded        → TimedOut (no retry)
//!     ├─ transport / transient    → backoff, retry until the bound, then Failed
//!     ├─ permanent refusal        → Failed(RemoteRejection)
//!     └─ success                  → Succeeded
//!
//! If the session cannot be acquired, the whole batch is aborted: every
//! attempt still live ends Failed with an authentication error.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::messages::Outcome;
use super::registry::{BatchEntry, StatusRegistry};
use super::session::SessionManager;
use super::stats::EngineStats;
use super::traits::{ResponseClassifier, Storefront};
use super::types::{AttemptState, StateCounts};
use crate::error::EngineError;

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Deadline for a single remote purchase call.
    pub request_timeout: Duration,
    /// Retries after the first call on transient failure.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Upper bound of the random delay added to each backoff.
    pub backoff_jitter: Duration,
    /// Remote calls allowed in flight across all batches.
    pub max_in_flight: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(1500),
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(2),
            backoff_jitter: Duration::from_millis(25),
            max_in_flight: 20,
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT_MS") { if let Ok(n) = v.parse() { c.request_timeout = Duration::from_millis(n); } }
        if let Ok(v) = std::env::var("MAX_RETRIES")        { if let Ok(n) = v.parse() { c.max_retries = n; } }
        if let Ok(v) = std::env::var("BACKOFF_BASE_MS")    { if let Ok(n) = v.parse() { c.backoff_base = Duration::from_millis(n); } }
        if let Ok(v) = std::env::var("BACKOFF_MAX_MS")     { if let Ok(n) = v.parse() { c.backoff_max = Duration::from_millis(n); } }
        if let Ok(v) = std::env::var("BACKOFF_JITTER_MS")  { if let Ok(n) = v.parse() { c.backoff_jitter = Duration::from_millis(n); } }
        if let Ok(v) = std::env::var("MAX_IN_FLIGHT")      { if let Ok(n) = v.parse::<usize>() { c.max_in_flight = n.max(1); } }
        c
    }

    /// Delay before retry number `retry` (1-based): base·2^(retry−1), capped, plus jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let delay = self
            .backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max);
        let jitter_ms = self.backoff_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            delay
        } else {
            delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        }
    }
}

// ─────────────────────────────────────────────────────────
// Batch abort signal
// ─────────────────────────────────────────────────────────

/// Raised once per batch when the session becomes unobtainable.
struct BatchAbort {
    token: CancellationToken,
    reason: OnceLock<EngineError>,
}

impl BatchAbort {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    fn trigger(&self, cause: EngineError) {
        let reason = match cause {
            e @ EngineError::Authentication(_) => e,
            other => EngineError::Authentication(format!("session unavailable: {}", other)),
        };
        if self.reason.set(reason).is_ok() {
            warn!("🔒 Session lost mid-batch, aborting remaining attempts");
        }
        self.token.cancel();
    }

    fn reason(&self) -> EngineError {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| EngineError::Authentication("batch aborted".into()))
    }
}

enum Interrupt {
    Cancelled,
    Aborted,
}

// ─────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────

pub struct ExecutionCoordinator {
    cfg: ExecutorConfig,
    storefront: Arc<dyn Storefront>,
    classifier: Arc<dyn ResponseClassifier>,
    sessions: Arc<SessionManager>,
    registry: Arc<StatusRegistry>,
    admission: Arc<Semaphore>,
    stats: Arc<EngineStats>,
}

impl ExecutionCoordinator {
    pub fn new(
        cfg: ExecutorConfig,
        storefront: Arc<dyn Storefront>,
        classifier: Arc<dyn ResponseClassifier>,
        sessions: Arc<SessionManager>,
        registry: Arc<StatusRegistry>,
        stats: Arc<EngineStats>,
    ) -> Self {
        let admission = Arc::new(Semaphore::new(cfg.max_in_flight.max(1)));
        Self {
            cfg,
            storefront,
            classifier,
            sessions,
            registry,
            admission,
            stats,
        }
    }

    /// Run every Scheduled attempt of a released batch to a terminal state.
    pub async fn dispatch(&self, batch: &BatchEntry, cancel: &CancellationToken) -> StateCounts {
        let abort = BatchAbort::new();
        let started = Instant::now();

        let runs = (0..batch.len())
            .filter(|&i| batch.state(i) == AttemptState::Scheduled)
            .map(|i| self.run_attempt(batch, i, cancel, &abort));
        let finals = join_all(runs).await;

        if abort.token.is_cancelled() {
            self.registry
                .settle_all(batch, AttemptState::Failed, Some(abort.reason()));
        }

        let counts = StateCounts::tally(finals);
        info!(
            batch = %batch.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "⚡ Dispatch done | ok={} failed={} timed_out={} cancelled={}",
            counts.succeeded, counts.failed, counts.timed_out, counts.cancelled,
        );
        counts
    }

    async fn run_attempt(
        &self,
        batch: &BatchEntry,
        idx: usize,
        cancel: &CancellationToken,
        abort: &BatchAbort,
    ) -> AttemptState {
        let item = batch.item(idx);
        let mut calls = 0u32;

        loop {
            // Queue for admission; the attempt keeps its current state meanwhile.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.interrupted(batch, idx, Interrupt::Cancelled, abort),
                _ = abort.token.cancelled() => return self.interrupted(batch, idx, Interrupt::Aborted, abort),
                p = self.admission.acquire() => match p {
                    Ok(p) => p,
                    Err(_) => return self.interrupted(batch, idx, Interrupt::Cancelled, abort),
                },
            };

            let session = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.interrupted(batch, idx, Interrupt::Cancelled, abort),
                _ = abort.token.cancelled() => return self.interrupted(batch, idx, Interrupt::Aborted, abort),
                s = self.sessions.acquire() => match s {
                    Ok(s) => s,
                    Err(e) => {
                        abort.trigger(e);
                        return self.interrupted(batch, idx, Interrupt::Aborted, abort);
                    }
                },
            };

            calls += 1;
            let entered = self.registry.update(batch, idx, AttemptState::InFlight, |a| {
                a.attempt_count = calls;
                if a.started_at.is_none() {
                    a.started_at = Some(Utc::now());
                }
            });
            if !entered {
                return batch.state(idx);
            }

            self.stats.call_started();
            let sent = Instant::now();
            let call = tokio::time::timeout(
                self.cfg.request_timeout,
                self.storefront.purchase(&session, &item),
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.stats.call_finished(None);
                    return self.interrupted(batch, idx, Interrupt::Cancelled, abort);
                }
                _ = abort.token.cancelled() => {
                    self.stats.call_finished(None);
                    return self.interrupted(batch, idx, Interrupt::Aborted, abort);
                }
                r = call => r,
            };
            let rtt = sent.elapsed();
            self.stats.call_finished(Some(rtt));
            drop(permit);

            let failure = match result {
                Err(_) => {
                    warn!(batch = %batch.id(), item = %item, "⏱️ Purchase exceeded {:?}", self.cfg.request_timeout);
                    return self.finish(batch, idx, AttemptState::TimedOut, rtt,
                        Some(EngineError::Timeout(self.cfg.request_timeout)));
                }
                Ok(Err(e @ EngineError::Authentication(_))) => {
                    self.sessions.invalidate();
                    abort.trigger(e);
                    return self.interrupted(batch, idx, Interrupt::Aborted, abort);
                }
                Ok(Err(e)) if e.is_transient() => e,
                Ok(Err(e)) => return self.finish(batch, idx, AttemptState::Failed, rtt, Some(e)),
                Ok(Ok(response)) => match self.classifier.classify(&response) {
                    Outcome::Success => {
                        info!(
                            batch = %batch.id(), item = %item, calls,
                            rtt_ms = rtt.as_secs_f64() * 1000.0,
                            "✅ Purchase succeeded"
                        );
                        return self.finish(batch, idx, AttemptState::Succeeded, rtt, None);
                    }
                    Outcome::PermanentFailure(reason) => {
                        info!(batch = %batch.id(), item = %item, "❌ Purchase refused: {}", reason);
                        return self.finish(batch, idx, AttemptState::Failed, rtt,
                            Some(EngineError::RemoteRejection(reason)));
                    }
                    Outcome::TransientFailure(reason) => {
                        EngineError::Connectivity(format!("transient remote failure: {}", reason))
                    }
                },
            };

            if calls > self.cfg.max_retries {
                warn!(batch = %batch.id(), item = %item, calls, "❌ Retry budget exhausted: {}", failure);
                return self.finish(batch, idx, AttemptState::Failed, rtt, Some(failure));
            }

            let delay = self.cfg.backoff(calls);
            warn!(
                batch = %batch.id(), item = %item, calls,
                "🔁 Transient failure, retrying in {:?}: {}", delay, failure
            );
            self.registry.update(batch, idx, AttemptState::InFlight, |a| {
                a.last_error = Some(failure);
                a.latency = Some(rtt);
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.interrupted(batch, idx, Interrupt::Cancelled, abort),
                _ = abort.token.cancelled() => return self.interrupted(batch, idx, Interrupt::Aborted, abort),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish(
        &self,
        batch: &BatchEntry,
        idx: usize,
        to: AttemptState,
        rtt: Duration,
        error: Option<EngineError>,
    ) -> AttemptState {
        self.registry.update(batch, idx, to, |a| {
            a.latency = Some(rtt);
            a.last_error = error;
        });
        batch.state(idx)
    }

    fn interrupted(&self, batch: &BatchEntry, idx: usize, why: Interrupt, abort: &BatchAbort) -> AttemptState {
        match why {
            Interrupt::Cancelled => {
                self.registry.update(batch, idx, AttemptState::Cancelled, |_| {});
            }
            Interrupt::Aborted => {
                let reason = abort.reason();
                self.registry.update(batch, idx, AttemptState::Failed, |a| a.last_error = Some(reason));
            }
        }
        batch.state(idx)
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
