//! Purchase engine: the surface the request layer talks to.
//!
//! `submit` validates and registers a batch, then spawns one driver task
//! per batch:
//!
//!   Scheduler::arm → Coordinator::dispatch
//!   (beside it) wait(fire_at − prewarm) → session pre-warm
//!
//! Every batch carries its own cancellation token (child of the engine's
//! shutdown token); callers observe results only through `status`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::executor::{ExecutionCoordinator, ExecutorConfig};
use super::messages::{EventBus, PurchaseEvent};
use super::registry::{BatchEntry, StatusRegistry};
use super::scheduler::{Release, Scheduler, SchedulerConfig};
use super::session::{SessionConfig, SessionManager};
use super::stats::{EngineStats, StatsSnapshot};
use super::traits::{ResponseClassifier, Storefront};
use super::types::{BatchId, BatchStatus, ItemRef, PurchaseAttempt, StatusRecord};
use crate::error::{EngineError, Result};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    /// Log in this long before the fire time so the release pays no login.
    pub session_prewarm: Duration,
    /// Identical attempts created per submitted item.
    pub fanout: u32,
    /// Completed batches older than this are evicted from the registry.
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            session_prewarm: Duration::from_secs(5),
            fanout: 1,
            retention: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut c = Self {
            session: SessionConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            executor: ExecutorConfig::from_env(),
            ..Self::default()
        };
        if let Ok(v) = std::env::var("SESSION_PREWARM_SECS") { if let Ok(n) = v.parse() { c.session_prewarm = Duration::from_secs(n); } }
        if let Ok(v) = std::env::var("PURCHASE_FANOUT")      { if let Ok(n) = v.parse::<u32>() { c.fanout = n.max(1); } }
        if let Ok(v) = std::env::var("RETENTION_SECS")       { if let Ok(n) = v.parse() { c.retention = Duration::from_secs(n); } }
        if let Ok(v) = std::env::var("SWEEP_INTERVAL_SECS")  { if let Ok(n) = v.parse::<u64>() { c.sweep_interval = Duration::from_secs(n.max(1)); } }
        c
    }
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

pub struct PurchaseEngine {
    cfg: EngineConfig,
    registry: Arc<StatusRegistry>,
    sessions: Arc<SessionManager>,
    scheduler: Scheduler,
    coordinator: ExecutionCoordinator,
    events: EventBus,
    stats: Arc<EngineStats>,
    live: Mutex<HashMap<BatchId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl PurchaseEngine {
    pub fn new(
        cfg: EngineConfig,
        storefront: Arc<dyn Storefront>,
        classifier: Arc<dyn ResponseClassifier>,
    ) -> Arc<Self> {
        let events = EventBus::new(cfg.event_capacity);
        let stats = Arc::new(EngineStats::new());
        let registry = Arc::new(StatusRegistry::new(events.clone(), Arc::clone(&stats)));
        let sessions = Arc::new(SessionManager::new(
            cfg.session.clone(),
            Arc::clone(&storefront),
            Arc::clone(&stats),
            events.clone(),
        ));
        let scheduler = Scheduler::new(cfg.scheduler.clone(), Arc::clone(&registry), events.clone());
        let coordinator = ExecutionCoordinator::new(
            cfg.executor.clone(),
            storefront,
            classifier,
            Arc::clone(&sessions),
            Arc::clone(&registry),
            Arc::clone(&stats),
        );

        info!(
            "🧭 Engine ready | timeout={:?} retries={} in_flight={} spin={:?} prewarm={:?} fanout={}",
            cfg.executor.request_timeout, cfg.executor.max_retries, cfg.executor.max_in_flight,
            cfg.scheduler.spin_window, cfg.session_prewarm, cfg.fanout,
        );

        Arc::new(Self {
            cfg,
            registry,
            sessions,
            scheduler,
            coordinator,
            events,
            stats,
            live: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Schedule `items` to fire at `fire_at` (RFC 3339 or naive local time).
    pub fn submit(self: &Arc<Self>, items: Vec<ItemRef>, fire_at: &str) -> Result<BatchId> {
        let fire_at = parse_fire_time(fire_at)?;
        self.submit_at(items, fire_at)
    }

    pub fn submit_at(self: &Arc<Self>, items: Vec<ItemRef>, fire_at: DateTime<Utc>) -> Result<BatchId> {
        if items.is_empty() {
            return Err(EngineError::Validation("no items submitted".into()));
        }
        if let Some(pos) = items.iter().position(|i| i.as_str().trim().is_empty()) {
            return Err(EngineError::Validation(format!("item #{} is blank", pos)));
        }
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Validation("engine is shutting down".into()));
        }

        let fanout = self.cfg.fanout.max(1);
        let attempts: Vec<PurchaseAttempt> = items
            .into_iter()
            .flat_map(|item| {
                (0..fanout).map(move |copy| PurchaseAttempt::new(item.clone(), copy, fire_at))
            })
            .collect();
        let size = attempts.len();

        let entry = self.registry.insert(fire_at, attempts);
        let id = entry.id();
        let token = self.shutdown.child_token();
        self.live.lock().insert(id, token.clone());

        info!(batch = %id, %fire_at, "📥 Batch submitted ({} attempts)", size);
        tokio::spawn(Arc::clone(self).run_batch(entry, token));
        Ok(id)
    }

    pub fn status(&self, id: BatchId) -> Result<BatchStatus> {
        self.registry.batch(id)
    }

    /// Resolve a batch or attempt identifier.
    pub fn lookup(&self, id: &str) -> Result<StatusRecord> {
        self.registry.get(id)
    }

    /// Cancel a batch. Already-finished batches are returned unchanged.
    pub fn cancel(&self, id: BatchId) -> Result<BatchStatus> {
        let token = self.live.lock().get(&id).cloned();
        if let Some(t) = token {
            info!(batch = %id, "🛑 Cancel requested");
            t.cancel();
        }
        // Unknown ids surface as NotFound here.
        self.registry.batch(id)
    }

    /// Cancel every live batch and stop the retention sweeper.
    pub fn shutdown(&self) {
        info!("🛑 Engine shutdown ({} live batches)", self.live.lock().len());
        self.shutdown.cancel();
    }

    pub fn events(&self) -> broadcast::Receiver<PurchaseEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn live_batches(&self) -> usize {
        self.live.lock().len()
    }

    /// Evict completed batches older than the retention window.
    pub fn evict_expired(&self) -> usize {
        let retention = chrono::Duration::from_std(self.cfg.retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        match Utc::now().checked_sub_signed(retention) {
            Some(cutoff) => self.registry.evict_completed(cutoff),
            None => 0,
        }
    }

    pub fn spawn_retention_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(engine.cfg.sweep_interval);
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        engine.evict_expired();
                    }
                }
            }
        })
    }

    async fn run_batch(self: Arc<Self>, entry: Arc<BatchEntry>, cancel: CancellationToken) {
        let id = entry.id();
        let prewarm = chrono::Duration::from_std(self.cfg.session_prewarm).unwrap_or_default();
        let prewarm_at = entry.fire_at() - prewarm;

        // Runs beside the release wait: a slow login never delays `arm`, and
        // dispatch queues on the session gate if the login is still going.
        tokio::spawn(Arc::clone(&self).prewarm_session(id, prewarm_at, cancel.clone()));

        match self.scheduler.arm(&entry, &cancel).await {
            Release::Released { .. } => {
                self.coordinator.dispatch(&entry, &cancel).await;
            }
            Release::Cancelled => {}
        }

        self.live.lock().remove(&id);
    }

    async fn prewarm_session(self: Arc<Self>, id: BatchId, at: DateTime<Utc>, cancel: CancellationToken) {
        if !self.scheduler.wait_until(at, &cancel).await {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            res = self.sessions.acquire() => {
                if let Err(e) = res {
                    warn!(batch = %id, "session pre-warm failed, retrying at fire time: {}", e);
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Fire time parsing
// ─────────────────────────────────────────────────────────

const NAIVE_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse an RFC 3339 timestamp, or a naive ISO-8601 one taken as local time.
pub fn parse_fire_time(raw: &str) -> Result<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(EngineError::Validation("fire time is empty".into()));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            if let Some(local) = Local.from_local_datetime(&naive).earliest() {
                return Ok(local.with_timezone(&Utc));
            }
        }
    }
    Err(EngineError::Validation(format!("unparseable fire time: {:?}", raw)))
}
