// Live timing and counter aggregation for sessions and remote calls.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::traits::LoginTimings;
use super::types::AttemptState;

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub logins: u64,
    pub login_failures: u64,
    pub last_login_ms: f64,
    pub last_login_preparation_ms: f64,
    pub last_login_authentication_ms: f64,
    pub remote_calls: u64,
    pub in_flight: u32,
    pub peak_in_flight: u32,
    pub avg_round_trip_ms: f64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default)]
pub struct EngineStats {
    logins: AtomicU64,
    login_failures: AtomicU64,
    last_login_us: AtomicU64,
    last_login_preparation_us: AtomicU64,
    last_login_authentication_us: AtomicU64,
    remote_calls: AtomicU64,
    round_trip_us_total: AtomicU64,
    round_trips: AtomicU64,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_login(&self, latency: Duration, phases: LoginTimings) {
        self.logins.fetch_add(1, Ordering::Relaxed);
        self.last_login_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
        self.last_login_preparation_us
            .store(phases.preparation.as_micros() as u64, Ordering::Relaxed);
        self.last_login_authentication_us
            .store(phases.authentication.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_login_failure(&self) {
        self.login_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a remote call as started. Pair with [`Self::call_finished`].
    pub fn call_started(&self) {
        self.remote_calls.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    pub fn call_finished(&self, round_trip: Option<Duration>) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Some(rt) = round_trip {
            self.round_trip_us_total
                .fetch_add(rt.as_micros() as u64, Ordering::Relaxed);
            self.round_trips.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_terminal(&self, state: AttemptState) {
        let counter = match state {
            AttemptState::Succeeded => &self.succeeded,
            AttemptState::Failed => &self.failed,
            AttemptState::TimedOut => &self.timed_out,
            AttemptState::Cancelled => &self.cancelled,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn logins(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    pub fn remote_calls(&self) -> u64 {
        self.remote_calls.load(Ordering::Relaxed)
    }

    pub fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let round_trips = self.round_trips.load(Ordering::Relaxed);
        let avg_round_trip_ms = if round_trips == 0 {
            0.0
        } else {
            self.round_trip_us_total.load(Ordering::Relaxed) as f64 / round_trips as f64 / 1000.0
        };
        StatsSnapshot {
            logins: self.logins(),
            login_failures: self.login_failures.load(Ordering::Relaxed),
            last_login_ms: self.last_login_us.load(Ordering::Relaxed) as f64 / 1000.0,
            last_login_preparation_ms: self.last_login_preparation_us.load(Ordering::Relaxed) as f64 / 1000.0,
            last_login_authentication_ms: self.last_login_authentication_us.load(Ordering::Relaxed) as f64 / 1000.0,
            remote_calls: self.remote_calls(),
            in_flight: self.in_flight.load(Ordering::Acquire),
            peak_in_flight: self.peak_in_flight(),
            avg_round_trip_ms,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_in_flight_tracks_high_water_mark() {
        let s = EngineStats::new();
        s.call_started();
        s.call_started();
        s.call_finished(Some(Duration::from_millis(4)));
        s.call_started();
        s.call_finished(Some(Duration::from_millis(2)));
        s.call_finished(None);

        let snap = s.snapshot();
        assert_eq!(snap.remote_calls, 3);
        assert_eq!(snap.peak_in_flight, 2);
        assert_eq!(snap.in_flight, 0);
        assert!((snap.avg_round_trip_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_terminal_counters_ignore_live_states() {
        let s = EngineStats::new();
        s.record_terminal(AttemptState::Succeeded);
        s.record_terminal(AttemptState::InFlight);
        s.record_terminal(AttemptState::Cancelled);
        let snap = s.snapshot();
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.cancelled, 1);
        assert_eq!(snap.failed, 0);
    }
}
