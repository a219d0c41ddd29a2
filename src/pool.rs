//! Server pools: backend selection, connect-with-retry and recovery timers.
//!
//! A pool keeps its backends split into an active and a broken subset
//! behind one `RwLock`. Selection takes the read lock; every health
//! transition and the strategy rebalance that follows it happen together
//! under the write lock, so a concurrent `acquire` never observes a broken
//! backend in the active subset.

use crate::backend::{Backend, BackendParams, BackendSnapshot, SessionGuard};
use crate::balancing::{BalancingMethod, Strategy};
use crate::config::PoolSpec;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Opens a transport connection to a backend.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Conn: Send;

    async fn dial(&self, backend: SocketAddr) -> io::Result<Self::Conn>;
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for &D {
    type Conn = D::Conn;

    async fn dial(&self, backend: SocketAddr) -> io::Result<Self::Conn> {
        (**self).dial(backend).await
    }
}

fn with_port(addr: SocketAddr, port: Option<u16>) -> SocketAddr {
    match port {
        Some(port) => SocketAddr::new(addr.ip(), port),
        None => addr,
    }
}

/// TCP dialer, optionally replacing every backend's port.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer {
    pub destination_port: Option<u16>,
}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self, backend: SocketAddr) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(with_port(backend, self.destination_port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// UDP "dialer": an ephemeral socket connected to the backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpDialer {
    pub destination_port: Option<u16>,
}

#[async_trait]
impl Dialer for UdpDialer {
    type Conn = UdpSocket;

    async fn dial(&self, backend: SocketAddr) -> io::Result<UdpSocket> {
        let target = with_port(backend, self.destination_port);
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(socket)
    }
}

/// A connected backend together with its occupied session slot.
#[derive(Debug)]
pub struct Lease<C> {
    pub conn: C,
    pub session: SessionGuard,
}

impl<C> Lease<C> {
    pub fn backend_addr(&self) -> SocketAddr {
        self.session.backend().addr()
    }
}

/// Reserve a slot on `active[start]` or, if that one is full, on the next
/// backend after it that has room.
fn reserve_from(active: &[Arc<Backend>], start: usize) -> Option<(Arc<Backend>, SessionGuard)> {
    let len = active.len();
    (0..len)
        .map(|offset| &active[(start + offset) % len])
        .find_map(|backend| {
            let session = backend.reserve_session()?;
            Some((Arc::clone(backend), session))
        })
}

#[derive(Debug)]
struct PoolState {
    active: Vec<Arc<Backend>>,
    broken: Vec<Arc<Backend>>,
    strategy: Strategy,
}

/// A named set of backends sharing one balancing strategy.
#[derive(Debug)]
pub struct ServerPool {
    name: String,
    spec: Option<PoolSpec>,
    backends: Vec<Arc<Backend>>,
    state: RwLock<PoolState>,
    this: Weak<ServerPool>,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub name: String,
    pub balancing: BalancingMethod,
    pub active: usize,
    pub broken: usize,
    pub backends: Vec<BackendSnapshot>,
}

impl ServerPool {
    pub fn new(
        name: impl Into<String>,
        method: BalancingMethod,
        backends: Vec<Arc<Backend>>,
    ) -> Arc<Self> {
        Self::build(name.into(), None, method, backends)
    }

    /// Build a pool from configuration, expanding backend address templates.
    pub fn from_spec(spec: &PoolSpec) -> Result<Arc<Self>> {
        let mut backends = Vec::new();
        for backend in &spec.backends {
            let params = BackendParams::from_spec(backend);
            for addr in backend.socket_addrs()? {
                backends.push(Arc::new(Backend::new(addr, params.clone())));
            }
        }
        Ok(Self::build(
            spec.name.clone(),
            Some(spec.clone()),
            spec.balancing,
            backends,
        ))
    }

    fn build(
        name: String,
        spec: Option<PoolSpec>,
        method: BalancingMethod,
        backends: Vec<Arc<Backend>>,
    ) -> Arc<Self> {
        let mut active = backends.clone();
        let mut strategy = Strategy::new(method);
        strategy.rebalance(&mut active);
        Arc::new_cyclic(|this| Self {
            name,
            spec,
            backends,
            state: RwLock::new(PoolState {
                active,
                broken: Vec::new(),
                strategy,
            }),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self) -> BalancingMethod {
        self.state.read().strategy.method()
    }

    /// Whether this pool was built from exactly `spec`.
    pub fn matches_spec(&self, spec: &PoolSpec) -> bool {
        self.spec.as_ref() == Some(spec)
    }

    /// All backends in configuration order.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn active_count(&self) -> usize {
        self.state.read().active.len()
    }

    pub fn broken_count(&self) -> usize {
        self.state.read().broken.len()
    }

    /// Connect to a backend chosen for `client_key`.
    ///
    /// Tries at most `sum(max_fails)` over the backends active on entry.
    /// When the strategy picks a backend at its session cap, the next active
    /// backend with a free slot is used instead and no failure is recorded.
    /// If every active backend is full the pool is exhausted right away.
    pub async fn acquire<D: Dialer>(&self, client_key: &str, dialer: &D) -> Result<Lease<D::Conn>> {
        let budget: usize = {
            let state = self.state.read();
            state
                .active
                .iter()
                .map(|backend| backend.params().max_fails as usize)
                .sum()
        };

        let mut attempts = 0;
        while attempts < budget {
            let reserved = {
                let state = self.state.read();
                match state.strategy.select(client_key, &state.active) {
                    Ok(idx) => reserve_from(&state.active, idx),
                    Err(_) => break,
                }
            };
            let Some((backend, mut session)) = reserved else {
                debug!(pool = %self.name, "Every active backend at session limit");
                break;
            };
            attempts += 1;

            let started = Instant::now();
            match self.dial(dialer, &backend).await {
                Ok(conn) => {
                    session.established(started.elapsed());
                    debug!(
                        pool = %self.name,
                        backend = %backend.addr(),
                        client = client_key,
                        "Backend acquired"
                    );
                    return Ok(Lease { conn, session });
                }
                Err(err) => {
                    drop(session);
                    debug!(pool = %self.name, error = %err, "Connect attempt failed");
                    self.record_failure(&backend);
                }
            }
        }

        warn!(pool = %self.name, attempts, client = client_key, "Pool exhausted");
        Err(Error::Exhausted {
            pool: self.name.clone(),
            attempts,
        })
    }

    async fn dial<D: Dialer>(&self, dialer: &D, backend: &Backend) -> Result<D::Conn> {
        let addr = backend.addr();
        let connect = dialer.dial(addr);
        let outcome = match backend.params().connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, connect).await {
                Ok(outcome) => outcome,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            },
            None => connect.await,
        };
        outcome.map_err(|err| Error::ConnectFailure {
            backend: addr,
            reason: err.to_string(),
        })
    }

    fn record_failure(&self, backend: &Arc<Backend>) {
        let mut state = self.state.write();
        if !backend.record_connect_failure() {
            return;
        }
        self.repartition(&mut state);
        drop(state);
        self.schedule_recovery(Arc::clone(backend));
    }

    /// Re-derive active/broken from backend health, in configuration order.
    fn repartition(&self, state: &mut PoolState) {
        let (active, broken): (Vec<_>, Vec<_>) = self
            .backends
            .iter()
            .cloned()
            .partition(|backend| backend.is_healthy());
        state.active = active;
        state.broken = broken;
        let PoolState {
            active, strategy, ..
        } = state;
        strategy.rebalance(active);
    }

    fn schedule_recovery(&self, backend: Arc<Backend>) {
        let pool = self.this.clone();
        let delay = backend.params().break_time;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // the pool may have been replaced by a reload meanwhile
            if let Some(pool) = pool.upgrade() {
                pool.restore(&backend);
            }
        });
    }

    fn restore(&self, backend: &Backend) {
        let mut state = self.state.write();
        if backend.mark_healthy() {
            self.repartition(&mut state);
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.read();
        PoolSnapshot {
            name: self.name.clone(),
            balancing: state.strategy.method(),
            active: state.active.len(),
            broken: state.broken.len(),
            backends: self.backends.iter().map(|b| b.snapshot()).collect(),
        }
    }
}
