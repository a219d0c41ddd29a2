//! HTTP and HTTPS listeners.
//!
//! Requests are matched by virtual host (regex against the `Host` header)
//! and then by path (regex against the request path). The matching path
//! route carries its own [`RoutingTable`], so the rest of the pipeline is
//! the same admission/pool/backend machinery the stream listeners use. Each
//! proxied request gets its own backend connection.
//!
//! The listener's read timeout bounds request headers, the TLS handshake and
//! every request body chunk; its write timeout bounds every response chunk.
//! The backend's timeouts cover the other leg the same way.

use super::forward::{within, ActiveSession, ListenerContext, SessionLimits, SessionPhase, Transfer};
use super::{bind_error, Proxy, ShutdownSignal};
use crate::config::{compile_pattern, HostSpec, Protocol};
use crate::pool::{Lease, TcpDialer};
use crate::routing::{PoolRegistry, RoutingTable};
use crate::{Error, Result};
use async_trait::async_trait;
use hyper::body::{HttpBody, Sender};
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode, Uri};
use regex::Regex;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace};

#[derive(Debug)]
struct PathRoute {
    pattern: Regex,
    table: RoutingTable,
}

#[derive(Debug)]
struct HostRoute {
    pattern: Regex,
    paths: Vec<PathRoute>,
}

/// Virtual host and path routing for one HTTP listener.
#[derive(Debug, Default)]
pub struct HttpRoutes {
    hosts: Vec<HostRoute>,
}

impl HttpRoutes {
    pub fn from_specs(hosts: &[HostSpec], registry: &PoolRegistry) -> Result<Self> {
        let mut routes = HttpRoutes::default();
        for host in hosts {
            let mut paths = Vec::with_capacity(host.paths.len());
            for path in &host.paths {
                paths.push(PathRoute {
                    pattern: compile_pattern(&path.path)?,
                    table: RoutingTable::from_spec(&path.routing, registry)?,
                });
            }
            routes.hosts.push(HostRoute {
                pattern: compile_pattern(&host.host)?,
                paths,
            });
        }
        Ok(routes)
    }

    /// Table for the first matching host, then the first matching path.
    pub fn lookup(&self, host: &str, path: &str) -> Option<&RoutingTable> {
        let host = self.hosts.iter().find(|h| h.pattern.is_match(host))?;
        host.paths
            .iter()
            .find(|p| p.pattern.is_match(path))
            .map(|p| &p.table)
    }
}

/// Drop the `:port` suffix of a `Host` header value.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

fn request_host(req: &Request<Body>) -> &str {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())
        .map(strip_port)
        .unwrap_or("")
}

fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|at| at.saturating_duration_since(Instant::now()))
}

fn body_error(err: hyper::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Move `body` into `tx` chunk by chunk, bounding every read and write.
///
/// On failure the receiving side sees an aborted body rather than a
/// silently truncated one.
async fn copy_body(
    mut body: Body,
    mut tx: Sender,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    counter: Arc<AtomicU64>,
) -> io::Result<()> {
    loop {
        let next = within(read_timeout, "body read", async {
            body.data().await.transpose().map_err(body_error)
        })
        .await;
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Ok(()),
            Err(e) => {
                tx.abort();
                return Err(e);
            }
        };
        let len = chunk.len() as u64;
        let written = within(write_timeout, "body write", async {
            tx.send_data(chunk).await.map_err(body_error)
        })
        .await;
        if let Err(e) = written {
            tx.abort();
            return Err(e);
        }
        counter.fetch_add(len, Ordering::Relaxed);
    }
}

fn create_error_response(status: u16) -> Response<Body> {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(status.canonical_reason().unwrap_or("Error")));
    *response.status_mut() = status;
    response
}

type HttpContext = Arc<ListenerContext<HttpRoutes>>;

pub struct HttpProxy {
    ctx: HttpContext,
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl HttpProxy {
    /// Bind a listener; `tls` makes it an HTTPS listener.
    pub async fn bind(
        addr: SocketAddr,
        ctx: HttpContext,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| bind_error(addr, e))?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            ctx,
            listener,
            local_addr,
            tls: tls.map(TlsAcceptor::from),
        })
    }

    async fn handle_connection(
        ctx: HttpContext,
        tls: Option<TlsAcceptor>,
        stream: TcpStream,
        client_addr: SocketAddr,
    ) {
        let _permit = match ctx.admit(client_addr).await {
            Ok(permit) => permit,
            Err(e) => {
                ctx.fail(client_addr, &e);
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let handshake_timeout = ctx.generation().limits.read_timeout;
        match tls {
            Some(acceptor) => match within(handshake_timeout, "TLS handshake", acceptor.accept(stream)).await {
                Ok(stream) => Self::serve(ctx, stream, client_addr).await,
                Err(e) => debug!(listener = ctx.name(), client = %client_addr, error = %e, "TLS handshake failed"),
            },
            None => Self::serve(ctx, stream, client_addr).await,
        }
    }

    async fn serve<I>(ctx: HttpContext, io: I, client_addr: SocketAddr)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service_ctx = Arc::clone(&ctx);
        let service = service_fn(move |req| {
            let ctx = Arc::clone(&service_ctx);
            async move { Ok::<_, Infallible>(Self::handle_request(ctx, client_addr, req).await) }
        });

        let mut http = Http::new();
        if let Some(limit) = ctx.generation().limits.read_timeout {
            http.http1_header_read_timeout(limit);
        }
        if let Err(e) = http.serve_connection(io, service).await {
            debug!(listener = ctx.name(), client = %client_addr, error = %e, "HTTP connection ended with error");
        }
    }

    async fn handle_request(ctx: HttpContext, client_addr: SocketAddr, req: Request<Body>) -> Response<Body> {
        let active = ctx.session_started();
        let generation = ctx.generation();
        let host = request_host(&req).to_string();
        let path = req.uri().path().to_string();

        let lease = async {
            let table = generation
                .routes
                .lookup(&host, &path)
                .ok_or_else(|| Error::access_denied(client_addr))?;
            let pool = table.resolve(client_addr.ip())?;
            trace!(listener = ctx.name(), client = %client_addr, host = %host, path = %path, pool = pool.name(), phase = ?SessionPhase::Admitted);
            let dialer = TcpDialer {
                destination_port: generation.destination_port,
            };
            pool.acquire(&client_addr.ip().to_string(), &dialer).await
        }
        .await;

        let lease = match lease {
            Ok(lease) => lease,
            Err(e) => {
                ctx.fail(client_addr, &e);
                return create_error_response(e.http_status_code());
            }
        };

        match Self::forward(&ctx, client_addr, lease, generation.limits, active, req).await {
            Ok(response) => response,
            Err(e) => {
                ctx.fail(client_addr, &e);
                create_error_response(e.http_status_code())
            }
        }
    }

    /// Send one request over a fresh backend connection.
    ///
    /// The backend slot stays occupied until the response body has been
    /// streamed to the client, or the relay failed.
    async fn forward(
        ctx: &HttpContext,
        client_addr: SocketAddr,
        lease: Lease<TcpStream>,
        client_limits: SessionLimits,
        active: ActiveSession,
        req: Request<Body>,
    ) -> Result<Response<Body>> {
        let Lease { conn, session } = lease;
        let backend_limits = SessionLimits::from_backend(session.backend().params());
        let backend_addr = session.backend().addr();
        let deadline = client_limits.deadline.map(|limit| Instant::now() + limit);

        let (mut sender, connection) = hyper::client::conn::handshake(conn)
            .await
            .map_err(|e| Error::exchange(format!("handshake with {backend_addr} failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(backend = %backend_addr, error = %e, "Backend connection ended with error");
            }
        });

        let sent = Arc::new(AtomicU64::new(0));
        let (mut parts, body) = req.into_parts();
        let body = if body.is_end_stream() {
            body
        } else {
            let (tx, upstream) = Body::channel();
            let relay = copy_body(
                body,
                tx,
                client_limits.read_timeout,
                backend_limits.write_timeout,
                Arc::clone(&sent),
            );
            tokio::spawn(async move {
                if let Err(e) = relay.await {
                    debug!(client = %client_addr, backend = %backend_addr, error = %e, "Request body relay failed");
                }
            });
            upstream
        };

        parts.uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse::<Uri>()
            .map_err(|e| Error::exchange(format!("invalid request target: {e}")))?;
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            parts.headers.append("x-forwarded-for", value);
        }
        let req = Request::from_parts(parts, body);

        trace!(listener = ctx.name(), client = %client_addr, backend = %backend_addr, phase = ?SessionPhase::Exchanging);
        let exchange = within(backend_limits.read_timeout, "response", async {
            sender
                .send_request(req)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        });
        let response = within(remaining(deadline), "request", exchange)
            .await
            .map_err(|e| Error::exchange(format!("request to {backend_addr} failed: {e}")))?;

        let (parts, body) = response.into_parts();
        let (tx, downstream) = Body::channel();
        let received = Arc::new(AtomicU64::new(0));
        let relay = copy_body(
            body,
            tx,
            backend_limits.read_timeout,
            client_limits.write_timeout,
            Arc::clone(&received),
        );
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            let _active = active;
            let result = within(remaining(deadline), "session", relay)
                .await
                .map_err(|e| Error::exchange(format!("response from {backend_addr} failed: {e}")));
            let transfer = Transfer {
                sent: sent.load(Ordering::Relaxed),
                received: received.load(Ordering::Relaxed),
            };
            ctx.finish(client_addr, session, transfer, result);
        });
        Ok(Response::from_parts(parts, downstream))
    }
}

#[async_trait]
impl Proxy for HttpProxy {
    fn protocol(&self) -> Protocol {
        if self.tls.is_some() {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn run(self: Box<Self>, mut shutdown: ShutdownSignal) -> Result<()> {
        info!(
            listener = self.ctx.name(),
            addr = %self.local_addr,
            tls = self.tls.is_some(),
            "HTTP listener started"
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            tokio::spawn(Self::handle_connection(
                                Arc::clone(&self.ctx),
                                self.tls.clone(),
                                stream,
                                client_addr,
                            ));
                        }
                        Err(e) => {
                            error!(listener = self.ctx.name(), error = %e, "Failed to accept HTTP connection");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(listener = self.ctx.name(), "HTTP listener received shutdown signal");
                    break;
                }
            }
        }

        info!(listener = self.ctx.name(), "HTTP listener shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancing::BalancingMethod;
    use crate::config::{BackendSpec, ListenerSpec, PathSpec, PoolSpec, RoutingSpec};
    use hyper::service::make_service_fn;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn http_backend(marker: &'static str) -> SocketAddr {
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

    fn pool_spec(name: &str, addr: SocketAddr) -> PoolSpec {
        PoolSpec {
            name: name.to_string(),
            backends: vec![BackendSpec::new(addr.to_string())],
            balancing: BalancingMethod::RoundRobin,
        }
    }

    fn hosts() -> Vec<HostSpec> {
        vec![HostSpec {
            host: "(www\\.)?example\\.com".to_string(),
            paths: vec![
                PathSpec {
                    path: "/api/.*".to_string(),
                    routing: RoutingSpec::to_pool("api"),
                },
                PathSpec {
                    path: ".*".to_string(),
                    routing: RoutingSpec::to_pool("web"),
                },
            ],
        }]
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:443"), "[::1]");
    }

    #[test]
    fn test_lookup_by_host_then_path() {
        let registry = PoolRegistry::build(
            &[
                pool_spec("api", "127.0.0.1:1".parse().unwrap()),
                pool_spec("web", "127.0.0.1:2".parse().unwrap()),
            ],
            None,
        )
        .unwrap();
        let routes = HttpRoutes::from_specs(&hosts(), &registry).unwrap();

        let api = routes.lookup("www.example.com", "/api/users").unwrap();
        assert_eq!(api.default_pool().name(), "api");
        let web = routes.lookup("example.com", "/index.html").unwrap();
        assert_eq!(web.default_pool().name(), "web");
        assert!(routes.lookup("other.org", "/").is_none());
    }

    #[tokio::test]
    async fn test_proxies_by_virtual_host_and_path() {
        let api = http_backend("api").await;
        let web = http_backend("web").await;
        let registry =
            PoolRegistry::build(&[pool_spec("api", api), pool_spec("web", web)], None).unwrap();

        let spec = ListenerSpec::new("http-test", Protocol::Http, "127.0.0.1:0");
        let ctx = ListenerContext::new(&spec, HttpRoutes::from_specs(&hosts(), &registry).unwrap());
        let proxy = HttpProxy::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&ctx), None)
            .await
            .unwrap();
        let addr = proxy.local_addr();
        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        tokio::spawn(Box::new(proxy).run(rx));

        let client = hyper::Client::new();
        let fetch = |host: &'static str, path: &'static str| {
            let req = Request::builder()
                .uri(format!("http://{addr}{path}"))
                .header(HOST, host)
                .body(Body::empty())
                .unwrap();
            let client = client.clone();
            async move {
                let response = client.request(req).await.unwrap();
                let status = response.status();
                let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
                (status, String::from_utf8(body.to_vec()).unwrap())
            }
        };

        assert_eq!(
            fetch("example.com", "/api/v1").await,
            (StatusCode::OK, "api /api/v1".to_string())
        );
        assert_eq!(
            fetch("www.example.com:8080", "/home").await,
            (StatusCode::OK, "web /home".to_string())
        );
        let (status, _) = fetch("unknown.org", "/").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ctx.snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_stalled_client_is_dropped_and_frees_its_slot() {
        let web = http_backend("web").await;
        let registry =
            PoolRegistry::build(&[pool_spec("api", web), pool_spec("web", web)], None).unwrap();

        let mut spec = ListenerSpec::new("http-slow", Protocol::Http, "127.0.0.1:0");
        spec.read_timeout_ms = Some(100);
        spec.max_connections = Some(1);
        let ctx = ListenerContext::new(&spec, HttpRoutes::from_specs(&hosts(), &registry).unwrap());
        let proxy = HttpProxy::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&ctx), None)
            .await
            .unwrap();
        let addr = proxy.local_addr();
        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        tokio::spawn(Box::new(proxy).run(rx));

        // headers never complete
        let mut slow = TcpStream::connect(addr).await.unwrap();
        slow.write_all(b"GET / HTTP/1.1\r\nHost: exam").await.unwrap();
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(2), slow.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "stalled client was never dropped");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let req = Request::builder()
            .uri(format!("http://{addr}/home"))
            .header(HOST, "example.com")
            .body(Body::empty())
            .unwrap();
        let response = hyper::Client::new().request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"web /home");
        assert_eq!(ctx.snapshot().rejected, 0);
    }

    /// Reads the whole upload, then answers in two chunks 200ms apart.
    async fn slow_backend() -> SocketAddr {
        let make_svc = make_service_fn(|_| async {
            Ok::<_, Infallible>(service_fn(|req: Request<Body>| async move {
                let upload = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
                let (mut tx, body) = Body::channel();
                tokio::spawn(async move {
                    let _ = tx.send_data(format!("got {} ", upload.len()).into()).await;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let _ = tx.send_data("done".into()).await;
                });
                Ok::<_, Infallible>(Response::new(body))
            }))
        });
        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    #[tokio::test]
    async fn test_request_counts_as_active_until_body_is_relayed() {
        let web = slow_backend().await;
        let registry =
            PoolRegistry::build(&[pool_spec("api", web), pool_spec("web", web)], None).unwrap();
        let spec = ListenerSpec::new("http-active", Protocol::Http, "127.0.0.1:0");
        let ctx = ListenerContext::new(&spec, HttpRoutes::from_specs(&hosts(), &registry).unwrap());
        let proxy = HttpProxy::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&ctx), None)
            .await
            .unwrap();
        let addr = proxy.local_addr();
        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        tokio::spawn(Box::new(proxy).run(rx));

        let req = Request::builder()
            .method("POST")
            .uri(format!("http://{addr}/upload"))
            .header(HOST, "example.com")
            .body(Body::from("twelve bytes"))
            .unwrap();
        let response = hyper::Client::new().request(req).await.unwrap();
        // the second chunk is still on its way
        assert_eq!(ctx.snapshot().active, 1);
        let pool = registry.require("web").unwrap();
        assert_eq!(pool.backends()[0].active_sessions(), 1);

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"got 12 done");

        let mut settled = false;
        for _ in 0..50 {
            if ctx.snapshot().active == 0 && pool.backends()[0].active_sessions() == 0 {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(settled);
        let backend = pool.backends()[0].snapshot();
        assert_eq!(backend.bytes_sent, 12);
        assert_eq!(backend.bytes_received, 11);
        assert_eq!(ctx.snapshot().errored, 0);
    }
}
