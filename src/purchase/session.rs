//! Session Manager: owns the authenticated storefront context.
//!
//! Attempts share one `Arc<Session>` read-only. Only this manager logs in,
//! and logins are single-flight: concurrent callers queue on the refresh
//! gate and re-check the held session before hitting the remote.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::messages::{EventBus, PurchaseEvent};
use super::stats::EngineStats;
use super::traits::{Credentials, LoginTimings, Storefront};
use crate::error::{EngineError, Result};

// ─────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long a login stays usable before a refresh is forced.
    pub ttl: Duration,
    /// Extra login tries on connectivity failure (not on rejection).
    pub login_retries: u32,
    pub login_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(20 * 60),
            login_retries: 2,
            login_retry_delay: Duration::from_millis(250),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Ok(v) = std::env::var("SESSION_TTL_SECS") { if let Ok(n) = v.parse() { c.ttl = Duration::from_secs(n); } }
        if let Ok(v) = std::env::var("LOGIN_RETRIES") { if let Ok(n) = v.parse() { c.login_retries = n; } }
        if let Ok(v) = std::env::var("LOGIN_RETRY_DELAY_MS") { if let Ok(n) = v.parse() { c.login_retry_delay = Duration::from_millis(n); } }
        c
    }
}

// ─────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Session {
    credentials: Credentials,
    acquired_at: Instant,
    valid_until: Instant,
    refresh_count: u32,
}

impl Session {
    pub fn new(credentials: Credentials, ttl: Duration, refresh_count: u32) -> Self {
        let acquired_at = Instant::now();
        Self {
            credentials,
            acquired_at,
            valid_until: acquired_at + ttl,
            refresh_count,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.valid_until
    }

    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Number of logins the manager had performed when this session was issued.
    pub fn refresh_count(&self) -> u32 {
        self.refresh_count
    }
}

// ─────────────────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────────────────

pub struct SessionManager {
    cfg: SessionConfig,
    storefront: Arc<dyn Storefront>,
    current: RwLock<Option<Arc<Session>>>,
    refresh_gate: Mutex<()>,
    refreshes: AtomicU32,
    stats: Arc<EngineStats>,
    events: EventBus,
}

impl SessionManager {
    pub fn new(
        cfg: SessionConfig,
        storefront: Arc<dyn Storefront>,
        stats: Arc<EngineStats>,
        events: EventBus,
    ) -> Self {
        Self {
            cfg,
            storefront,
            current: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            refreshes: AtomicU32::new(0),
            stats,
            events,
        }
    }

    /// Return a valid session, logging in if the held one is absent or expired.
    pub async fn acquire(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.current() {
            return Ok(session);
        }

        let _gate = self.refresh_gate.lock().await;
        // Another caller may have refreshed while we queued on the gate.
        if let Some(session) = self.current() {
            debug!("session refreshed by a concurrent caller");
            return Ok(session);
        }

        let started = Instant::now();
        let credentials = match self.login_with_retry().await {
            Ok(c) => c,
            Err(e) => {
                self.stats.record_login_failure();
                warn!("🔒 Login failed after {:?}: {}", started.elapsed(), e);
                return Err(e);
            }
        };
        let latency = started.elapsed();

        let refresh_count = self.refreshes.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Arc::new(Session::new(credentials, self.cfg.ttl, refresh_count));
        *self.current.write() = Some(Arc::clone(&session));

        let timings = session.credentials().timings;
        self.stats.record_login(latency, timings);
        self.events.publish(PurchaseEvent::SessionAcquired {
            latency,
            preparation: timings.preparation,
            authentication: timings.authentication,
            refresh_count,
        });
        info!(
            latency_ms = latency.as_millis() as u64,
            preparation_ms = timings.preparation.as_millis() as u64,
            authentication_ms = timings.authentication.as_millis() as u64,
            refresh_count, "🔑 Session acquired"
        );
        Ok(session)
    }

    /// The held session if it is still within its validity window.
    pub fn current(&self) -> Option<Arc<Session>> {
        let guard = self.current.read();
        guard
            .as_ref()
            .filter(|s| s.is_valid_at(Instant::now()))
            .map(Arc::clone)
    }

    /// Drop the held session so the next `acquire` logs in again.
    pub fn invalidate(&self) {
        if self.current.write().take().is_some() {
            debug!("session invalidated");
        }
    }

    pub fn refresh_count(&self) -> u32 {
        self.refreshes.load(Ordering::Acquire)
    }

    async fn login_with_retry(&self) -> Result<Credentials> {
        let mut tries = 0u32;
        loop {
            match self.storefront.login().await {
                Ok(credentials) => return Ok(credentials),
                Err(e @ EngineError::Connectivity(_)) if tries < self.cfg.login_retries => {
                    tries += 1;
                    warn!(
                        "login unreachable (try {}/{}): {}",
                        tries,
                        self.cfg.login_retries + 1,
                        e
                    );
                    tokio::time::sleep(self.cfg.login_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────
