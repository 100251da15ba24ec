#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use lot_sniper::error::{EngineError, Result};
use lot_sniper::purchase::executor::ExecutorConfig;
use lot_sniper::purchase::scheduler::SchedulerConfig;
use lot_sniper::purchase::session::{Session, SessionConfig};
use lot_sniper::purchase::{
    BatchId, BatchState, BatchStatus, Credentials, EngineConfig, ItemRef, PurchaseEngine,
    RemoteResponse, Storefront,
};
use lot_sniper::storefront::StorefrontClassifier;

/// One scripted storefront reply.
#[derive(Clone, Debug)]
pub enum Step {
    Reply(u16, &'static str),
    Drop,
    Hang(Duration),
}

pub const OK: Step = Step::Reply(200, r#"{"success": true}"#);
pub const UNAVAILABLE: Step = Step::Reply(503, "Service Unavailable");
pub const OUT_OF_STOCK: Step = Step::Reply(200, r#"{"success": false, "message": "lot épuisé"}"#);

/// In-memory storefront. Each item replays its script; the last step repeats.
#[derive(Default)]
pub struct ScriptedStore {
    pub reject_login: bool,
    /// Login fails as if the site were down.
    pub unreachable_login: bool,
    pub login_delay: Duration,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, u32>>,
    call_times: Mutex<Vec<DateTime<Utc>>>,
    logins: AtomicU32,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_login() -> Self {
        Self { reject_login: true, ..Self::default() }
    }

    pub fn unreachable() -> Self {
        Self { unreachable_login: true, ..Self::default() }
    }

    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    pub fn script(self, item: &str, steps: Vec<Step>) -> Self {
        self.scripts.lock().insert(item.to_string(), steps.into());
        self
    }

    pub fn calls(&self, item: &str) -> u32 {
        self.calls.lock().get(item).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    pub fn logins(&self) -> u32 {
        self.logins.load(Ordering::SeqCst)
    }

    /// Wall-clock time of every purchase call, in arrival order.
    pub fn call_times(&self) -> Vec<DateTime<Utc>> {
        self.call_times.lock().clone()
    }
}

#[async_trait]
impl Storefront for ScriptedStore {
    async fn login(&self) -> Result<Credentials> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if !self.login_delay.is_zero() {
            tokio::time::sleep(self.login_delay).await;
        }
        if self.unreachable_login {
            return Err(EngineError::Connectivity("login page unreachable".into()));
        }
        if self.reject_login {
            return Err(EngineError::Authentication("identifiants invalides".into()));
        }
        Ok(Credentials::new("csrf-123"))
    }

    async fn purchase(&self, _session: &Session, item: &ItemRef) -> Result<RemoteResponse> {
        self.call_times.lock().push(Utc::now());
        *self.calls.lock().entry(item.as_str().to_string()).or_default() += 1;
        let step = {
            let mut scripts = self.scripts.lock();
            let queue = scripts.entry(item.as_str().to_string()).or_default();
            if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() }
        };
        match step.unwrap_or(OK) {
            Step::Reply(status, body) => Ok(RemoteResponse { status, body: body.into() }),
            Step::Drop => Err(EngineError::Connectivity("connection reset by peer".into())),
            Step::Hang(d) => {
                tokio::time::sleep(d).await;
                Ok(RemoteResponse { status: 200, body: r#"{"success": true}"#.into() })
            }
        }
    }
}

/// Engine config with short delays so tests settle quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        session: SessionConfig {
            ttl: Duration::from_secs(60),
            login_retries: 0,
            login_retry_delay: Duration::from_millis(5),
        },
        scheduler: SchedulerConfig { spin_window: Duration::from_millis(20) },
        executor: ExecutorConfig {
            request_timeout: Duration::from_millis(300),
            max_retries: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(40),
            backoff_jitter: Duration::ZERO,
            max_in_flight: 20,
        },
        session_prewarm: Duration::from_millis(500),
        ..EngineConfig::default()
    }
}

pub fn engine(store: Arc<ScriptedStore>, cfg: EngineConfig) -> Arc<PurchaseEngine> {
    PurchaseEngine::new(cfg, store, Arc::new(StorefrontClassifier))
}

pub fn items(refs: &[&str]) -> Vec<ItemRef> {
    refs.iter().map(|r| ItemRef::from(*r)).collect()
}

/// Poll until the batch is Completed or `limit` elapses.
pub async fn wait_completed(engine: &PurchaseEngine, id: BatchId, limit: Duration) -> BatchStatus {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let status = engine.status(id).unwrap();
        if status.state == BatchState::Completed || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
