//! Backend runtime state: health state machine, session accounting and
//! rolling statistics.

use crate::balancing::BackendHandle;
use crate::config::BackendSpec;
use crate::metrics::{BACKEND_CONNECT_FAILURES, BACKEND_STATE_CHANGES};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Health of a backend as seen by its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Health {
    Healthy,
    Broken,
}

/// Static per-backend parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendParams {
    pub weight: u32,
    pub max_fails: u32,
    pub break_time: Duration,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_sessions: Option<usize>,
}

impl BackendParams {
    pub fn from_spec(spec: &BackendSpec) -> Self {
        Self {
            weight: spec.weight.max(1),
            max_fails: spec.max_fails.max(1),
            break_time: Duration::from_millis(spec.break_time_ms),
            connect_timeout: spec.connect_timeout_ms.map(Duration::from_millis),
            read_timeout: spec.read_timeout_ms.map(Duration::from_millis),
            write_timeout: spec.write_timeout_ms.map(Duration::from_millis),
            max_sessions: spec.max_sessions,
        }
    }
}

impl Default for BackendParams {
    fn default() -> Self {
        Self {
            weight: 1,
            max_fails: 1,
            break_time: Duration::from_millis(crate::config::DEFAULT_BREAK_TIME_MS),
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            max_sessions: None,
        }
    }
}

#[derive(Debug)]
struct HealthState {
    health: Health,
    consecutive_failures: u32,
    broken_at: Option<Instant>,
}

/// Cumulative counters. Averages are exponentially weighted (alpha = 1/8).
#[derive(Debug, Default)]
struct BackendStats {
    active_sessions: AtomicUsize,
    total_connections: AtomicU64,
    total_failures: AtomicU64,
    avg_connect_time_ns: AtomicU64,
    avg_exchange_time_ns: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

fn record_average(avg: &AtomicU64, sample: Duration) {
    let sample_ns = sample.as_nanos().min(u128::from(u64::MAX)) as u64;
    let _ = avg.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(if current == 0 {
            sample_ns
        } else {
            (current / 8) * 7 + sample_ns / 8
        })
    });
}

/// One proxied destination server.
#[derive(Debug)]
pub struct Backend {
    addr: SocketAddr,
    params: BackendParams,
    state: Mutex<HealthState>,
    stats: BackendStats,
}

impl Backend {
    pub fn new(addr: SocketAddr, params: BackendParams) -> Self {
        Self {
            addr,
            params,
            state: Mutex::new(HealthState {
                health: Health::Healthy,
                consecutive_failures: 0,
                broken_at: None,
            }),
            stats: BackendStats::default(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn params(&self) -> &BackendParams {
        &self.params
    }

    pub fn health(&self) -> Health {
        self.state.lock().health
    }

    pub fn is_healthy(&self) -> bool {
        self.health() == Health::Healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn active_sessions(&self) -> usize {
        self.stats.active_sessions.load(Ordering::Acquire)
    }

    /// Record a failed connect attempt.
    ///
    /// Returns `true` when this failure moved the backend to `Broken`; the
    /// caller owns scheduling the recovery. Failures reported while the
    /// backend is already broken are counted but change nothing.
    pub fn record_connect_failure(&self) -> bool {
        self.stats.total_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(BACKEND_CONNECT_FAILURES, 1, "backend" => self.addr.to_string());

        let mut state = self.state.lock();
        if state.health == Health::Broken {
            return false;
        }
        state.consecutive_failures += 1;
        if state.consecutive_failures < self.params.max_fails {
            debug!(
                backend = %self.addr,
                failures = state.consecutive_failures,
                max_fails = self.params.max_fails,
                "Backend connect failed"
            );
            return false;
        }

        state.health = Health::Broken;
        state.consecutive_failures = 0;
        state.broken_at = Some(Instant::now());
        drop(state);

        metrics::counter!(BACKEND_STATE_CHANGES, 1,
            "backend" => self.addr.to_string(),
            "state" => "broken"
        );
        warn!(
            backend = %self.addr,
            break_time_ms = self.params.break_time.as_millis() as u64,
            "Backend marked broken"
        );
        true
    }

    /// Return a broken backend to service. Only the pool's recovery timer
    /// calls this.
    pub(crate) fn mark_healthy(&self) -> bool {
        let mut state = self.state.lock();
        if state.health == Health::Healthy {
            return false;
        }
        let broken_for = state.broken_at.take().map(|at| at.elapsed());
        state.health = Health::Healthy;
        drop(state);

        metrics::counter!(BACKEND_STATE_CHANGES, 1,
            "backend" => self.addr.to_string(),
            "state" => "healthy"
        );
        info!(
            backend = %self.addr,
            broken_for_ms = broken_for.map(|d| d.as_millis() as u64).unwrap_or_default(),
            "Backend recovered"
        );
        true
    }

    /// Reserve a session slot, honouring `max_sessions`.
    ///
    /// The slot is released when the returned guard drops.
    pub fn reserve_session(self: &Arc<Self>) -> Option<SessionGuard> {
        let limit = self.params.max_sessions.unwrap_or(usize::MAX);
        self.stats
            .active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .ok()?;
        Some(SessionGuard {
            backend: Arc::clone(self),
            started: Instant::now(),
            established: false,
            bytes_sent: 0,
            bytes_received: 0,
        })
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        let state = self.state.lock();
        BackendSnapshot {
            address: self.addr,
            weight: self.params.weight,
            health: state.health,
            consecutive_failures: state.consecutive_failures,
            active_sessions: self.stats.active_sessions.load(Ordering::Acquire),
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            total_failures: self.stats.total_failures.load(Ordering::Relaxed),
            avg_connect_time: Duration::from_nanos(
                self.stats.avg_connect_time_ns.load(Ordering::Relaxed),
            ),
            avg_exchange_time: Duration::from_nanos(
                self.stats.avg_exchange_time_ns.load(Ordering::Relaxed),
            ),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl BackendHandle for Backend {
    fn weight(&self) -> u32 {
        self.params.weight
    }

    fn current_sessions(&self) -> usize {
        self.active_sessions()
    }
}

/// Point-in-time view of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub address: SocketAddr,
    pub weight: u32,
    pub health: Health,
    pub consecutive_failures: u32,
    pub active_sessions: usize,
    pub total_connections: u64,
    pub total_failures: u64,
    pub avg_connect_time: Duration,
    pub avg_exchange_time: Duration,
    /// Bytes forwarded towards the backend.
    pub bytes_sent: u64,
    /// Bytes forwarded from the backend.
    pub bytes_received: u64,
}

/// One occupied session slot on a backend.
///
/// Dropping the guard releases the slot exactly once, whichever way the
/// session ended.
#[derive(Debug)]
pub struct SessionGuard {
    backend: Arc<Backend>,
    started: Instant,
    established: bool,
    bytes_sent: u64,
    bytes_received: u64,
}

impl SessionGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Mark the transport connection as established.
    pub fn established(&mut self, connect_time: Duration) {
        if self.established {
            return;
        }
        self.established = true;
        self.started = Instant::now();
        let stats = &self.backend.stats;
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        record_average(&stats.avg_connect_time_ns, connect_time);
    }

    /// Add forwarded byte counts to this session.
    pub fn add_bytes(&mut self, sent: u64, received: u64) {
        self.bytes_sent += sent;
        self.bytes_received += received;
        let stats = &self.backend.stats;
        stats.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        stats.bytes_received.fetch_add(received, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> (u64, u64) {
        (self.bytes_sent, self.bytes_received)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let stats = &self.backend.stats;
        if self.established {
            record_average(&stats.avg_exchange_time_ns, self.started.elapsed());
        }
        stats.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(max_fails: u32) -> Arc<Backend> {
        Arc::new(Backend::new(
            "127.0.0.1:8080".parse().unwrap(),
            BackendParams {
                max_fails,
                break_time: Duration::from_millis(50),
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_breaks_after_max_fails_and_resets_counter() {
        let backend = backend(3);
        assert!(!backend.record_connect_failure());
        assert!(!backend.record_connect_failure());
        assert_eq!(backend.consecutive_failures(), 2);
        assert!(backend.record_connect_failure());
        assert_eq!(backend.health(), Health::Broken);
        assert_eq!(backend.consecutive_failures(), 0);

        // further failures while broken do not re-trigger
        assert!(!backend.record_connect_failure());
        assert_eq!(backend.consecutive_failures(), 0);
        assert_eq!(backend.snapshot().total_failures, 4);
    }

    #[test]
    fn test_success_does_not_reset_failures() {
        let backend = backend(3);
        backend.record_connect_failure();
        let mut guard = backend.reserve_session().unwrap();
        guard.established(Duration::from_millis(1));
        drop(guard);
        assert_eq!(backend.consecutive_failures(), 1);
    }

    #[test]
    fn test_mark_healthy_only_from_broken() {
        let backend = backend(1);
        assert!(!backend.mark_healthy());
        assert!(backend.record_connect_failure());
        assert!(backend.mark_healthy());
        assert!(backend.is_healthy());
    }

    #[test]
    fn test_session_guard_releases_exactly_once() {
        let backend = backend(1);
        let first = backend.reserve_session().unwrap();
        let mut second = backend.reserve_session().unwrap();
        assert_eq!(backend.active_sessions(), 2);

        second.established(Duration::from_millis(2));
        second.add_bytes(10, 20);
        drop(second);
        assert_eq!(backend.active_sessions(), 1);
        drop(first);
        assert_eq!(backend.active_sessions(), 0);

        let snapshot = backend.snapshot();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.bytes_sent, 10);
        assert_eq!(snapshot.bytes_received, 20);
        assert_eq!(snapshot.avg_connect_time, Duration::from_millis(2));
    }

    #[test]
    fn test_max_sessions_cap() {
        let backend = Arc::new(Backend::new(
            "127.0.0.1:8081".parse().unwrap(),
            BackendParams {
                max_sessions: Some(1),
                ..Default::default()
            },
        ));
        let held = backend.reserve_session().unwrap();
        assert!(backend.reserve_session().is_none());
        drop(held);
        assert!(backend.reserve_session().is_some());
    }

    #[test]
    fn test_unestablished_session_does_not_count_as_served() {
        let backend = backend(1);
        drop(backend.reserve_session().unwrap());
        let snapshot = backend.snapshot();
        assert_eq!(snapshot.total_connections, 0);
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.avg_exchange_time, Duration::ZERO);
    }
}
