//! UDP listener with per-client sessions.
//!
//! The first datagram from a client source address admits it, routes it
//! and binds an ephemeral socket connected to the chosen backend. Replies
//! are relayed back through the listening socket. A session ends after
//! `read_timeout_ms` of silence in both directions (30 s by default), when
//! its deadline passes, or on an I/O error; its backend slot is released
//! exactly once when the relay task exits.

use super::forward::{within, ListenerContext, Session, SessionPhase, Transfer};
use super::{bind_error, Proxy, ShutdownSignal};
use crate::buffers::datagram_buffer;
use crate::config::{Protocol, DEFAULT_UDP_IDLE_TIMEOUT_MS};
use crate::pool::UdpDialer;
use crate::routing::RoutingTable;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace};

#[derive(Debug)]
struct Upstream {
    socket: Arc<UdpSocket>,
    write_timeout: Option<Duration>,
}

/// Client-side view of a session, looked up per datagram.
#[derive(Debug)]
struct UdpSession {
    /// Set once the backend socket is connected.
    upstream: OnceLock<Upstream>,
    last_activity: Mutex<Instant>,
    bytes_sent: AtomicU64,
    /// Signalled when forwarding towards the backend fails.
    failed: Notify,
}

impl UdpSession {
    fn new() -> Self {
        Self {
            upstream: OnceLock::new(),
            last_activity: Mutex::new(Instant::now()),
            bytes_sent: AtomicU64::new(0),
            failed: Notify::new(),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

type Sessions = Arc<DashMap<SocketAddr, Arc<UdpSession>>>;

pub struct UdpProxy {
    ctx: Arc<ListenerContext<RoutingTable>>,
    socket: Arc<UdpSocket>,
    sessions: Sessions,
    local_addr: SocketAddr,
}

impl UdpProxy {
    pub async fn bind(addr: SocketAddr, ctx: Arc<ListenerContext<RoutingTable>>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| bind_error(addr, e))?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            ctx,
            socket: Arc::new(socket),
            sessions: Arc::new(DashMap::new()),
            local_addr,
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    async fn handle_client_packet(
        &self,
        data: &[u8],
        client_addr: SocketAddr,
        shutdown: &ShutdownSignal,
    ) {
        let session = match self.sessions.entry(client_addr) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let session = Arc::new(UdpSession::new());
                entry.insert(Arc::clone(&session));
                tokio::spawn(Self::run_session(
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.sessions),
                    Arc::clone(&self.socket),
                    client_addr,
                    session,
                    Bytes::copy_from_slice(data),
                    shutdown.resubscribe(),
                ));
                return;
            }
        };

        let Some(upstream) = session.upstream.get() else {
            trace!(client = %client_addr, "Dropping datagram for session still connecting");
            return;
        };
        session.touch();
        match within(upstream.write_timeout, "write", upstream.socket.send(data)).await {
            Ok(n) => {
                session.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!(client = %client_addr, error = %e, "Forwarding datagram failed");
                session.failed.notify_one();
            }
        }
    }

    /// Connect the session, forward its first datagram and relay replies
    /// until the session ends.
    async fn run_session(
        ctx: Arc<ListenerContext<RoutingTable>>,
        sessions: Sessions,
        socket: Arc<UdpSocket>,
        client_addr: SocketAddr,
        state: Arc<UdpSession>,
        first: Bytes,
        mut shutdown: ShutdownSignal,
    ) {
        let session = match ctx
            .open(client_addr, |port| UdpDialer {
                destination_port: port,
            })
            .await
        {
            Ok(session) => session.map_conn(Arc::new),
            Err(e) => {
                sessions.remove(&client_addr);
                ctx.fail(client_addr, &e);
                return;
            }
        };

        let _active = ctx.session_started();
        let upstream = Arc::clone(&session.conn);
        let _ = state.upstream.set(Upstream {
            socket: Arc::clone(&upstream),
            write_timeout: session.backend_limits.write_timeout,
        });
        trace!(
            listener = ctx.name(),
            client = %client_addr,
            backend = %session.backend_addr(),
            phase = ?SessionPhase::Exchanging
        );

        let result = match within(session.backend_limits.write_timeout, "write", upstream.send(&first)).await {
            Ok(n) => {
                state.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Self::relay(&socket, client_addr, &session, &state, &mut shutdown).await
            }
            Err(e) => (0, Err(Error::exchange(e.to_string()))),
        };

        sessions.remove(&client_addr);
        let (received, result) = result;
        let transfer = Transfer {
            sent: state.bytes_sent.load(Ordering::Relaxed),
            received,
        };
        ctx.finish(client_addr, session.guard, transfer, result);
    }

    async fn relay(
        socket: &UdpSocket,
        client_addr: SocketAddr,
        session: &Session<Arc<UdpSocket>>,
        state: &UdpSession,
        shutdown: &mut ShutdownSignal,
    ) -> (u64, Result<()>) {
        let idle = session
            .client_limits
            .read_timeout
            .unwrap_or(Duration::from_millis(DEFAULT_UDP_IDLE_TIMEOUT_MS));
        let deadline = session.client_limits.deadline.map(|d| Instant::now() + d);
        let mut buffer = datagram_buffer();
        let mut received = 0u64;

        loop {
            let mut wait = idle.saturating_sub(state.idle_for());
            if wait.is_zero() {
                debug!(client = %client_addr, "UDP session idle, closing");
                return (received, Ok(()));
            }
            if let Some(deadline) = deadline {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return (received, Err(Error::exchange("session deadline elapsed")));
                }
                wait = wait.min(left);
            }

            tokio::select! {
                result = tokio::time::timeout(wait, session.conn.recv(&mut buffer)) => {
                    match result {
                        // re-check idle time and deadline
                        Err(_) => continue,
                        Ok(Ok(n)) => {
                            state.touch();
                            let reply = within(
                                session.client_limits.write_timeout,
                                "write",
                                socket.send_to(&buffer[..n], client_addr),
                            );
                            if let Err(e) = reply.await {
                                return (received, Err(Error::exchange(e.to_string())));
                            }
                            received += n as u64;
                        }
                        Ok(Err(e)) => return (received, Err(Error::exchange(e.to_string()))),
                    }
                }
                _ = state.failed.notified() => {
                    return (received, Err(Error::exchange("forwarding to backend failed")));
                }
                _ = shutdown.recv() => return (received, Ok(())),
            }
        }
    }
}

#[async_trait]
impl Proxy for UdpProxy {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn run(self: Box<Self>, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(listener = self.ctx.name(), addr = %self.local_addr, "UDP listener started");
        let mut buffer = datagram_buffer();

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((n, client_addr)) => {
                            self.handle_client_packet(&buffer[..n], client_addr, &shutdown).await;
                        }
                        Err(e) => {
                            // ICMP errors from earlier sends surface here on some platforms
                            error!(listener = self.ctx.name(), error = %e, "Failed to receive UDP packet");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(listener = self.ctx.name(), "UDP listener received shutdown signal");
                    break;
                }
            }
        }

        info!(
            listener = self.ctx.name(),
            sessions = self.session_count(),
            "UDP listener shut down"
        );
        Ok(())
    }
}
