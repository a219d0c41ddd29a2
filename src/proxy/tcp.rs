//! TCP listener: one task per accepted connection, raw byte pump to the
//! chosen backend.

use super::forward::{pump, ListenerContext, SessionPhase};
use super::{bind_error, Proxy, ShutdownSignal};
use crate::config::Protocol;
use crate::pool::TcpDialer;
use crate::routing::RoutingTable;
use crate::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace};

pub struct TcpProxy {
    ctx: Arc<ListenerContext<RoutingTable>>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpProxy {
    pub async fn bind(addr: SocketAddr, ctx: Arc<ListenerContext<RoutingTable>>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| bind_error(addr, e))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            ctx,
            listener,
            local_addr,
        })
    }

    async fn handle_connection(
        ctx: Arc<ListenerContext<RoutingTable>>,
        client_stream: TcpStream,
        client_addr: SocketAddr,
    ) {
        let session = match ctx
            .open(client_addr, |port| TcpDialer {
                destination_port: port,
            })
            .await
        {
            Ok(session) => session,
            Err(e) => {
                // dropping the stream closes the client without any data
                ctx.fail(client_addr, &e);
                return;
            }
        };

        let _active = ctx.session_started();
        let _ = client_stream.set_nodelay(true);
        trace!(
            listener = ctx.name(),
            client = %client_addr,
            backend = %session.backend_addr(),
            phase = ?SessionPhase::Exchanging
        );

        let (transfer, result) = pump(
            client_stream,
            session.conn,
            session.client_limits,
            session.backend_limits,
        )
        .await;
        ctx.finish(client_addr, session.guard, transfer, result);
    }
}

#[async_trait]
impl Proxy for TcpProxy {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn run(self: Box<Self>, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(listener = self.ctx.name(), addr = %self.local_addr, "TCP listener started");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((client_stream, client_addr)) => {
                            debug!(listener = self.ctx.name(), client = %client_addr, "Accepted connection");
                            tokio::spawn(Self::handle_connection(
                                Arc::clone(&self.ctx),
                                client_stream,
                                client_addr,
                            ));
                        }
                        Err(e) => {
                            error!(listener = self.ctx.name(), error = %e, "Failed to accept TCP connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(listener = self.ctx.name(), "TCP listener received shutdown signal");
                    break;
                }
            }
        }

        info!(listener = self.ctx.name(), "TCP listener shut down");
        Ok(())
    }
}
