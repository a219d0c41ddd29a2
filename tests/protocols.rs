mod common;

use common::{backend, http_backend, pool, udp_echo_backend, vhost};
use harbr_balancer::config::TlsFiles;
use harbr_balancer::{BalancingMethod, Engine, ListenerSpec, Protocol, ProxyConfig, RoutingSpec};
use hyper::header::HOST;
use hyper::{Body, Request, StatusCode};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

#[tokio::test]
async fn udp_datagrams_round_trip() {
    let echo = udp_echo_backend().await;
    let mut listener = ListenerSpec::new("dns", Protocol::Udp, "127.0.0.1:0");
    listener.routing = Some(RoutingSpec::to_pool("resolvers"));
    let engine = Engine::start(ProxyConfig {
        listeners: vec![listener],
        pools: vec![pool("resolvers", vec![backend(echo)], BalancingMethod::HashIp)],
    })
    .await
    .unwrap();
    let front = engine.local_addr("dns").unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 64];
    for payload in [&b"query-1"[..], &b"query-2"[..]] {
        client.send_to(payload, front).await.unwrap();
        let (n, from) = timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, front);
        assert_eq!(&buf[..n], payload);
        // later datagrams only flow once the session is connected
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let resolvers = engine.pool("resolvers").unwrap();
    assert_eq!(resolvers.backends()[0].snapshot().total_connections, 1);
    engine.shutdown().await;
}

async fn http_config() -> ProxyConfig {
    let api = http_backend("api").await;
    let web = http_backend("web").await;
    let mut listener = ListenerSpec::new("site", Protocol::Http, "127.0.0.1:0");
    listener.hosts = vec![
        vhost("api\\.example\\.com", &[(".*", "api")]),
        vhost("example\\.com", &[("/static/.*", "api"), (".*", "web")]),
    ];
    ProxyConfig {
        listeners: vec![listener],
        pools: vec![
            pool("api", vec![backend(api)], BalancingMethod::RoundRobin),
            pool("web", vec![backend(web)], BalancingMethod::RoundRobin),
        ],
    }
}

async fn get(addr: SocketAddr, host: &str, path: &str) -> (StatusCode, String) {
    let req = Request::builder()
        .uri(format!("http://{addr}{path}"))
        .header(HOST, host)
        .body(Body::empty())
        .unwrap();
    let response = hyper::Client::new().request(req).await.unwrap();
    let status = response.status();
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn http_routes_by_host_and_path() {
    let engine = Engine::start(http_config().await).await.unwrap();
    let site = engine.local_addr("site").unwrap();

    assert_eq!(
        get(site, "api.example.com", "/users").await,
        (StatusCode::OK, "api /users".to_string())
    );
    assert_eq!(
        get(site, "example.com", "/static/app.js").await,
        (StatusCode::OK, "api /static/app.js".to_string())
    );
    assert_eq!(
        get(site, "example.com:80", "/").await,
        (StatusCode::OK, "web /".to_string())
    );
    assert_eq!(
        get(site, "elsewhere.net", "/").await.0,
        StatusCode::INTERNAL_SERVER_ERROR
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn http_backend_down_is_service_unavailable() {
    let mut config = http_config().await;
    let dead = format!("127.0.0.1:{}", common::dead_port().await);
    config.pools[1].backends[0] = backend(dead.parse().unwrap());
    let engine = Engine::start(config).await.unwrap();
    let site = engine.local_addr("site").unwrap();

    assert_eq!(
        get(site, "example.com", "/").await.0,
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(
        get(site, "api.example.com", "/still-up").await.0,
        StatusCode::OK
    );
    assert_eq!(engine.snapshot().listeners[0].exhausted, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn https_terminates_tls_before_routing() {
    let certified = rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
    let mut cert_file = tempfile::NamedTempFile::new().unwrap();
    cert_file.write_all(certified.cert.pem().as_bytes()).unwrap();
    let mut key_file = tempfile::NamedTempFile::new().unwrap();
    key_file
        .write_all(certified.key_pair.serialize_pem().as_bytes())
        .unwrap();

    let mut config = http_config().await;
    let listener = &mut config.listeners[0];
    listener.protocol = Protocol::Https;
    listener.tls = Some(TlsFiles {
        cert_path: cert_file.path().display().to_string(),
        key_path: key_file.path().display().to_string(),
    });
    let engine = Engine::start(config).await.unwrap();
    let site = engine.local_addr("site").unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();
    let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));

    let tcp = TcpStream::connect(site).await.unwrap();
    let tls = connector
        .connect(ServerName::try_from("example.com").unwrap(), tcp)
        .await
        .unwrap();
    let (mut sender, conn) = hyper::client::conn::handshake(tls).await.unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri("/secure")
        .header(HOST, "example.com")
        .body(Body::empty())
        .unwrap();
    let response = sender.send_request(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(&body[..], b"web /secure");
    engine.shutdown().await;
}
