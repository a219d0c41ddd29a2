//! Connection forwarding shared by all listener types.
//!
//! Every accepted connection walks `Accepted -> Admitted -> BackendAcquired
//! -> Exchanging -> Closed`. Admission (listener capacity plus accept/deny
//! lists), pool acquisition and session teardown live here; the protocol
//! modules only supply the accept loop and the exchange itself.

use crate::backend::{BackendParams, SessionGuard};
use crate::buffers::stream_buffer;
use crate::config::{ListenerSpec, Overflow, Protocol};
use crate::error::{ErrorCategory, LogLevel};
use crate::metrics::{
    CONNECTIONS_ACCEPTED, CONNECTIONS_ERRORED, CONNECTIONS_EXHAUSTED, CONNECTIONS_REJECTED,
    SESSION_DURATION,
};
use crate::pool::{Dialer, Lease};
use crate::routing::RoutingTable;
use crate::{Error, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle stage of one forwarded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Accepted,
    Admitted,
    BackendAcquired,
    Exchanging,
    Closed,
}

/// Timeouts applied to one leg of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionLimits {
    /// Upper bound on the whole session.
    pub deadline: Option<Duration>,
    /// Longest wait for a single read.
    pub read_timeout: Option<Duration>,
    /// Longest wait for a single write.
    pub write_timeout: Option<Duration>,
}

impl SessionLimits {
    pub fn from_listener(spec: &ListenerSpec) -> Self {
        Self {
            deadline: spec.deadline_ms.map(Duration::from_millis),
            read_timeout: spec.read_timeout_ms.map(Duration::from_millis),
            write_timeout: spec.write_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn from_backend(params: &BackendParams) -> Self {
        Self {
            deadline: None,
            read_timeout: params.read_timeout,
            write_timeout: params.write_timeout,
        }
    }
}

/// Routing state of a listener for one configuration generation.
#[derive(Debug)]
pub struct Generation<R> {
    pub routes: R,
    pub limits: SessionLimits,
    pub destination_port: Option<u16>,
}

impl<R> Generation<R> {
    pub fn new(routes: R, spec: &ListenerSpec) -> Self {
        Self {
            routes,
            limits: SessionLimits::from_listener(spec),
            destination_port: spec.destination_port,
        }
    }
}

/// Per-listener outcome counters.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub exhausted: AtomicU64,
    pub errored: AtomicU64,
    pub active: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerSnapshot {
    pub name: String,
    pub protocol: Protocol,
    pub accepted: u64,
    pub rejected: u64,
    pub exhausted: u64,
    pub errored: u64,
    pub active: u64,
}

/// Holds one of the listener's `max_connections` slots.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Listener-wide concurrency limit.
#[derive(Debug)]
pub struct Admission {
    limit: Option<Arc<Semaphore>>,
    overflow: Overflow,
}

impl Admission {
    pub fn new(max_connections: Option<usize>, overflow: Overflow) -> Self {
        Self {
            limit: max_connections.map(|max| Arc::new(Semaphore::new(max))),
            overflow,
        }
    }

    /// Take a slot, waiting or refusing per the overflow policy.
    pub async fn admit(&self) -> Option<AdmissionPermit> {
        let Some(limit) = &self.limit else {
            return Some(AdmissionPermit { _permit: None });
        };
        let permit = match self.overflow {
            Overflow::Reject => Arc::clone(limit).try_acquire_owned().ok()?,
            Overflow::Wait => Arc::clone(limit).acquire_owned().await.ok()?,
        };
        Some(AdmissionPermit {
            _permit: Some(permit),
        })
    }
}

/// Shared state of one running listener.
#[derive(Debug)]
pub struct ListenerContext<R> {
    name: String,
    protocol: Protocol,
    stats: Arc<ListenerStats>,
    admission: Admission,
    generation: ArcSwap<Generation<R>>,
}

/// An established session: backend connection, slot guards and limits.
#[derive(Debug)]
pub struct Session<C> {
    pub conn: C,
    pub guard: SessionGuard,
    pub client_limits: SessionLimits,
    pub backend_limits: SessionLimits,
    _permit: AdmissionPermit,
}

impl<C> Session<C> {
    pub fn new(lease: Lease<C>, permit: AdmissionPermit, client_limits: SessionLimits) -> Self {
        let Lease { conn, session } = lease;
        let backend_limits = SessionLimits::from_backend(session.backend().params());
        Self {
            conn,
            guard: session,
            client_limits,
            backend_limits,
            _permit: permit,
        }
    }

    pub fn backend_addr(&self) -> SocketAddr {
        self.guard.backend().addr()
    }

    pub fn map_conn<T>(self, f: impl FnOnce(C) -> T) -> Session<T> {
        Session {
            conn: f(self.conn),
            guard: self.guard,
            client_limits: self.client_limits,
            backend_limits: self.backend_limits,
            _permit: self._permit,
        }
    }
}

/// Bytes moved by one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    /// Client to backend.
    pub sent: u64,
    /// Backend to client.
    pub received: u64,
}

impl<R> ListenerContext<R> {
    pub fn new(spec: &ListenerSpec, routes: R) -> Arc<Self> {
        Arc::new(Self {
            name: spec.name.clone(),
            protocol: spec.protocol,
            stats: Arc::default(),
            admission: Admission::new(spec.max_connections, spec.overflow),
            generation: ArcSwap::from_pointee(Generation::new(routes, spec)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Routing state in effect right now.
    pub fn generation(&self) -> Arc<Generation<R>> {
        self.generation.load_full()
    }

    /// Swap in a new generation. Sessions already running keep the old one.
    pub fn replace(&self, generation: Generation<R>) {
        self.generation.store(Arc::new(generation));
    }

    /// Count a new client and take an admission slot.
    pub async fn admit(&self, client: SocketAddr) -> Result<AdmissionPermit> {
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(CONNECTIONS_ACCEPTED, 1, "listener" => self.name.clone());
        trace!(listener = %self.name, client = %client, phase = ?SessionPhase::Accepted);

        self.admission.admit().await.ok_or_else(|| {
            debug!(listener = %self.name, client = %client, "Listener at capacity");
            Error::access_denied(client)
        })
    }

    /// Count and log a failed connection.
    pub fn fail(&self, client: SocketAddr, err: &Error) {
        let (counter, metric) = match err.category() {
            ErrorCategory::Admission => (&self.stats.rejected, CONNECTIONS_REJECTED),
            ErrorCategory::Capacity => (&self.stats.exhausted, CONNECTIONS_EXHAUSTED),
            _ => (&self.stats.errored, CONNECTIONS_ERRORED),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(metric, 1, "listener" => self.name.clone());
        log_error(&self.name, client, err);
    }

    /// Record a finished session and release its backend slot.
    pub fn finish(&self, client: SocketAddr, mut guard: SessionGuard, transfer: Transfer, result: Result<()>) {
        guard.add_bytes(transfer.sent, transfer.received);
        let elapsed = guard.elapsed();
        metrics::histogram!(SESSION_DURATION, elapsed.as_secs_f64(), "listener" => self.name.clone());

        match &result {
            Ok(()) => debug!(
                listener = %self.name,
                client = %client,
                backend = %guard.backend().addr(),
                sent = transfer.sent,
                received = transfer.received,
                duration_ms = elapsed.as_millis() as u64,
                "Session closed"
            ),
            Err(err) => self.fail(client, err),
        }
        drop(guard);
        trace!(listener = %self.name, client = %client, phase = ?SessionPhase::Closed);
    }

    /// Mark a session as running for the `active` gauge.
    pub fn session_started(&self) -> ActiveSession {
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        ActiveSession {
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn snapshot(&self) -> ListenerSnapshot {
        ListenerSnapshot {
            name: self.name.clone(),
            protocol: self.protocol,
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
            errored: self.stats.errored.load(Ordering::Relaxed),
            active: self.stats.active.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the listener's active count on drop.
#[derive(Debug)]
pub struct ActiveSession {
    stats: Arc<ListenerStats>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ListenerContext<RoutingTable> {
    /// Admit `client`, route it and connect to a backend.
    ///
    /// `dialer` receives the listener's destination port override.
    pub async fn open<D, F>(&self, client: SocketAddr, dialer: F) -> Result<Session<D::Conn>>
    where
        D: Dialer,
        F: FnOnce(Option<u16>) -> D,
    {
        let permit = self.admit(client).await?;
        let generation = self.generation();
        let pool = generation.routes.resolve(client.ip())?;
        trace!(listener = %self.name, client = %client, pool = pool.name(), phase = ?SessionPhase::Admitted);

        let dialer = dialer(generation.destination_port);
        let lease = pool.acquire(&client.ip().to_string(), &dialer).await?;
        trace!(
            listener = %self.name,
            client = %client,
            backend = %lease.backend_addr(),
            phase = ?SessionPhase::BackendAcquired
        );
        Ok(Session::new(lease, permit, generation.limits))
    }
}

/// Emit `err` at the level the error asks for.
pub fn log_error(listener: &str, client: SocketAddr, err: &Error) {
    match err.log_level() {
        LogLevel::Error => error!(listener, client = %client, error = %err, "Connection failed"),
        LogLevel::Warn => warn!(listener, client = %client, error = %err, "Connection failed"),
        LogLevel::Info => info!(listener, client = %client, error = %err, "Connection failed"),
        LogLevel::Debug => debug!(listener, client = %client, error = %err, "Connection failed"),
    }
}

/// Run `fut` under an optional timeout, mapping expiry to `TimedOut`.
pub async fn within<F, T>(limit: Option<Duration>, what: &str, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out")))),
        None => fut.await,
    }
}

/// Last time either direction of a session moved bytes.
#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_ms
            .fetch_max(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Read once, failing only after `idle` without traffic in either direction.
async fn read_idle<R>(
    reader: &mut R,
    buffer: &mut [u8],
    idle: Option<Duration>,
    activity: &Activity,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let Some(idle) = idle else {
        return reader.read(buffer).await;
    };
    let read = reader.read(buffer);
    tokio::pin!(read);
    loop {
        let wait = idle.saturating_sub(activity.idle_for());
        if wait.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        // the other direction may have moved meanwhile
        if let Ok(result) = tokio::time::timeout(wait, &mut read).await {
            return result;
        }
    }
}

/// One copy direction of a session.
struct Half<'a> {
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    counter: &'a AtomicU64,
    activity: &'a Activity,
    first_error: &'a Mutex<Option<io::Error>>,
}

impl Half<'_> {
    async fn copy<R, W>(self, mut reader: R, mut writer: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buffer = stream_buffer();
        let result = loop {
            let n = match read_idle(&mut reader, &mut buffer, self.read_timeout, self.activity).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e),
            };
            self.activity.touch();
            if let Err(e) = within(self.write_timeout, "write", writer.write_all(&buffer[..n])).await {
                break Err(e);
            }
            self.activity.touch();
            self.counter.fetch_add(n as u64, Ordering::Relaxed);
        };
        // propagate the half-close; the peer may already be gone
        let _ = within(self.write_timeout, "shutdown", writer.shutdown()).await;
        if let Err(e) = result {
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = Some(e);
            }
        }
    }
}

/// Copy bytes both ways until both directions have finished.
///
/// Each direction ends on its own: end-of-stream, an I/O error, a write
/// timeout, or `read_timeout` elapsing with no traffic either way. The
/// client deadline bounds the whole session. Byte counts are reported even
/// when the session failed; the error is the first one either direction hit.
pub async fn pump<C, B>(
    client: C,
    backend: B,
    client_limits: SessionLimits,
    backend_limits: SessionLimits,
) -> (Transfer, Result<()>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let sent = AtomicU64::new(0);
    let received = AtomicU64::new(0);
    let activity = Activity::new();
    let first_error = Mutex::new(None);
    let (client_rd, client_wr) = tokio::io::split(client);
    let (backend_rd, backend_wr) = tokio::io::split(backend);

    let upstream = Half {
        read_timeout: client_limits.read_timeout,
        write_timeout: backend_limits.write_timeout,
        counter: &sent,
        activity: &activity,
        first_error: &first_error,
    };
    let downstream = Half {
        read_timeout: backend_limits.read_timeout,
        write_timeout: client_limits.write_timeout,
        counter: &received,
        activity: &activity,
        first_error: &first_error,
    };
    let both = async {
        tokio::join!(
            upstream.copy(client_rd, backend_wr),
            downstream.copy(backend_rd, client_wr)
        );
        match first_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    };
    let result = within(client_limits.deadline, "session", both).await;

    let transfer = Transfer {
        sent: sent.load(Ordering::Relaxed),
        received: received.load(Ordering::Relaxed),
    };
    (transfer, result.map_err(|e| Error::exchange(e.to_string())))
}
