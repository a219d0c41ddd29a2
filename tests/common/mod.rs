//! Shared helpers for the end-to-end tests: echo backends, HTTP backends and
//! config builders.

#![allow(dead_code)]

use harbr_balancer::config::{BackendSpec, HostSpec, PathSpec};
use harbr_balancer::{BalancingMethod, ListenerSpec, PoolSpec, Protocol, RoutingSpec};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::timeout;

pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_on("127.0.0.1:0".parse().unwrap()).await
    }

    pub async fn spawn_on(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => {
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn udp_echo_backend() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

/// HTTP backend answering `"<marker> <path>"`.
pub async fn http_backend(marker: &'static str) -> SocketAddr {
    let make_svc = make_service_fn(move |_| async move {
        Ok::<_, Infallible>(service_fn(move |req: Request<Body>| async move {
            let body = format!("{marker} {}", req.uri().path());
            Ok::<_, Infallible>(Response::new(Body::from(body)))
        }))
    });
    let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

/// A local port with nothing listening on it.
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Send `payload` through `addr` and return what comes back, or why nothing did.
pub async fn try_roundtrip(addr: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, &'static str> {
    let result = timeout(Duration::from_millis(1000), async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        let mut buf = vec![0u8; 64];
        let n = stream.read(&mut buf).await?;
        Ok::<_, io::Error>(buf[..n].to_vec())
    })
    .await;

    match result {
        Ok(Ok(data)) if !data.is_empty() => Ok(data),
        Ok(Ok(_)) => Err("connection closed"),
        Ok(Err(_)) => Err("io error"),
        Err(_) => Err("timeout"),
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn pool(name: &str, backends: Vec<BackendSpec>, balancing: BalancingMethod) -> PoolSpec {
    PoolSpec {
        name: name.to_string(),
        backends,
        balancing,
    }
}

pub fn backend(addr: SocketAddr) -> BackendSpec {
    BackendSpec::new(addr.to_string())
}

pub fn tcp_listener(name: &str, routing: RoutingSpec) -> ListenerSpec {
    let mut spec = ListenerSpec::new(name, Protocol::Tcp, "127.0.0.1:0");
    spec.routing = Some(routing);
    spec
}

pub fn vhost(host: &str, routes: &[(&str, &str)]) -> HostSpec {
    HostSpec {
        host: host.to_string(),
        paths: routes
            .iter()
            .map(|(path, pool)| PathSpec {
                path: path.to_string(),
                routing: RoutingSpec::to_pool(*pool),
            })
            .collect(),
    }
}
