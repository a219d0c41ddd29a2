//! Configuration data model.
//!
//! Everything here is plain data. The engine receives a validated
//! [`ProxyConfig`]; [`load_config`] is a convenience for the binary.

use crate::address::{expand_template, AddressSet};
use crate::balancing::BalancingMethod;
use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls;

pub const DEFAULT_BREAK_TIME_MS: u64 = 120_000;
pub const DEFAULT_UDP_IDLE_TIMEOUT_MS: u64 = 30_000;

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    1
}

fn default_break_time_ms() -> u64 {
    DEFAULT_BREAK_TIME_MS
}

fn default_path() -> String {
    ".*".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendSpec {
    /// Address or address template, with or without a port.
    pub address: String,
    /// Port for addresses given without one.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,
    #[serde(default = "default_break_time_ms")]
    pub break_time_ms: u64,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

impl BackendSpec {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: None,
            weight: default_weight(),
            max_fails: default_max_fails(),
            break_time_ms: default_break_time_ms(),
            connect_timeout_ms: None,
            read_timeout_ms: None,
            write_timeout_ms: None,
            max_sessions: None,
        }
    }

    /// Concrete socket addresses this spec expands to.
    ///
    /// Addresses without any port get port 0; the listener's
    /// `destination_port` has to supply one.
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        let expanded = if self.address.parse::<SocketAddr>().is_ok()
            || self.address.parse::<IpAddr>().is_ok()
        {
            vec![self.address.clone()]
        } else {
            expand_template(&self.address)?
        };

        expanded
            .into_iter()
            .map(|text| {
                if let Ok(addr) = text.parse::<SocketAddr>() {
                    return Ok(match self.port {
                        Some(port) => SocketAddr::new(addr.ip(), port),
                        None => addr,
                    });
                }
                text.parse::<IpAddr>()
                    .map(|ip| SocketAddr::new(ip, self.port.unwrap_or(0)))
                    .map_err(|_| Error::parse(&text, "invalid backend address"))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: String,
    pub backends: Vec<BackendSpec>,
    #[serde(default)]
    pub balancing: BalancingMethod,
}

/// Sources matching `sources` go to `pool`.
///
/// Entries in `sources`, `accept` and `deny` are addresses, CIDR networks or
/// range templates. A bare span that starts on a network boundary and ends
/// at 32 or less (`10.0.0.0-16`) is refused as ambiguous with `10.0.0.0/16`;
/// write such ranges bracketed, as `10.0.0.[0-16]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSpec {
    pub sources: Vec<String>,
    pub pool: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingSpec {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub accept: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    pub default_pool: String,
}

impl RoutingSpec {
    /// Routing that sends every client to one pool.
    pub fn to_pool(pool: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            accept: Vec::new(),
            deny: Vec::new(),
            default_pool: pool.into(),
        }
    }

    fn pool_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.default_pool.as_str()).chain(self.rules.iter().map(|r| r.pool.as_str()))
    }

    fn validate(&self) -> Result<()> {
        AddressSet::build(&self.accept)?;
        AddressSet::build(&self.deny)?;
        for rule in &self.rules {
            AddressSet::build(&rule.sources)?;
        }
        Ok(())
    }
}

/// HTTP path route within a virtual host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathSpec {
    /// Regular expression matched against the request path.
    #[serde(default = "default_path")]
    pub path: String,
    pub routing: RoutingSpec,
}

/// HTTP virtual host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSpec {
    /// Regular expression matched against the `Host` header, port stripped.
    pub host: String,
    pub paths: Vec<PathSpec>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
    Https,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Http => "http",
            Protocol::Https => "https",
        })
    }
}

/// What to do with a client once a listener is at `max_connections`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Overflow {
    #[default]
    Reject,
    Wait,
}

/// PEM files for an HTTPS listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert_path: String,
    pub key_path: String,
}

impl TlsFiles {
    pub fn load(&self) -> Result<Arc<rustls::ServerConfig>> {
        let open = |path: &str| {
            fs::File::open(path)
                .map(BufReader::new)
                .map_err(|e| Error::config(format!("Cannot open '{path}': {e}")))
        };

        let certs = rustls_pemfile::certs(&mut open(&self.cert_path)?)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::config(format!("Invalid certificate '{}': {e}", self.cert_path)))?;
        if certs.is_empty() {
            return Err(Error::config(format!(
                "No certificates found in '{}'",
                self.cert_path
            )));
        }
        let key = rustls_pemfile::private_key(&mut open(&self.key_path)?)
            .map_err(|e| Error::config(format!("Invalid key '{}': {e}", self.key_path)))?
            .ok_or_else(|| Error::config(format!("No private key found in '{}'", self.key_path)))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .and_then(|builder| builder.with_no_client_auth().with_single_cert(certs, key))
            .map_err(|e| Error::config(format!("TLS setup failed: {e}")))?;
        Ok(Arc::new(config))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub name: String,
    pub protocol: Protocol,
    pub listen_addr: String,
    /// Replaces every backend's port when set.
    #[serde(default)]
    pub destination_port: Option<u16>,
    /// Source routing for tcp and udp listeners.
    #[serde(default)]
    pub routing: Option<RoutingSpec>,
    /// Virtual hosts for http and https listeners.
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    /// Upper bound on a whole session.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Client-side idle read timeout. For udp this is the session idle timeout.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub write_timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub overflow: Overflow,
    #[serde(default)]
    pub tls: Option<TlsFiles>,
    /// Ready TLS configuration supplied by the embedding program; wins over `tls`.
    #[serde(skip)]
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
}

impl ListenerSpec {
    pub fn new(name: impl Into<String>, protocol: Protocol, listen_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol,
            listen_addr: listen_addr.into(),
            destination_port: None,
            routing: None,
            hosts: Vec::new(),
            deadline_ms: None,
            read_timeout_ms: None,
            write_timeout_ms: None,
            max_connections: None,
            overflow: Overflow::Reject,
            tls: None,
            tls_config: None,
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr.parse().map_err(|_| {
            Error::config(format!(
                "Listener '{}' has invalid listen_addr '{}'",
                self.name, self.listen_addr
            ))
        })
    }

    /// TLS configuration for an https listener.
    pub fn server_tls(&self) -> Result<Arc<rustls::ServerConfig>> {
        if let Some(config) = &self.tls_config {
            return Ok(Arc::clone(config));
        }
        match &self.tls {
            Some(files) => files.load(),
            None => Err(Error::config(format!(
                "Listener '{}' is https but has no TLS configuration",
                self.name
            ))),
        }
    }

    /// Identity used to decide whether a reload changes the listener set.
    pub fn identity(&self) -> (String, Protocol, String) {
        (self.name.clone(), self.protocol, self.listen_addr.clone())
    }

    fn routings(&self) -> Vec<&RoutingSpec> {
        match self.protocol {
            Protocol::Tcp | Protocol::Udp => self.routing.iter().collect(),
            Protocol::Http | Protocol::Https => self
                .hosts
                .iter()
                .flat_map(|host| host.paths.iter().map(|path| &path.routing))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listeners: Vec<ListenerSpec>,
    pub pools: Vec<PoolSpec>,
}

impl ProxyConfig {
    pub fn pool(&self, name: &str) -> Option<&PoolSpec> {
        self.pools.iter().find(|pool| pool.name == name)
    }

    /// Check everything that can be checked without binding sockets.
    pub fn validate(&self) -> Result<()> {
        let mut pools = HashMap::new();
        for pool in &self.pools {
            if pool.name.is_empty() {
                return Err(Error::config("Pool name cannot be empty"));
            }
            let mut portless = false;
            for backend in &pool.backends {
                if backend.weight == 0 {
                    return Err(Error::config(format!(
                        "Backend '{}' in pool '{}' must have weight >= 1",
                        backend.address, pool.name
                    )));
                }
                if backend.max_fails == 0 {
                    return Err(Error::config(format!(
                        "Backend '{}' in pool '{}' must have max_fails >= 1",
                        backend.address, pool.name
                    )));
                }
                portless |= backend.socket_addrs()?.iter().any(|addr| addr.port() == 0);
            }
            if pools.insert(pool.name.as_str(), portless).is_some() {
                return Err(Error::config(format!("Duplicate pool name: {}", pool.name)));
            }
        }

        let mut names = HashSet::new();
        let mut binds = HashSet::new();
        for listener in &self.listeners {
            if !names.insert(listener.name.as_str()) {
                return Err(Error::config(format!(
                    "Duplicate listener name: {}",
                    listener.name
                )));
            }
            if listener.max_connections == Some(0) {
                return Err(Error::config(format!(
                    "Listener '{}' must allow at least one connection",
                    listener.name
                )));
            }
            let addr = listener.socket_addr()?;
            let udp = listener.protocol == Protocol::Udp;
            if !binds.insert((addr, udp)) {
                return Err(Error::config(format!(
                    "Duplicate listen address: {}",
                    listener.listen_addr
                )));
            }

            match listener.protocol {
                Protocol::Tcp | Protocol::Udp if listener.routing.is_none() => {
                    return Err(Error::config(format!(
                        "Listener '{}' needs a routing section",
                        listener.name
                    )));
                }
                Protocol::Http | Protocol::Https if listener.hosts.is_empty() => {
                    return Err(Error::config(format!(
                        "Listener '{}' needs at least one host",
                        listener.name
                    )));
                }
                Protocol::Https if listener.tls_config.is_none() && listener.tls.is_none() => {
                    return Err(Error::config(format!(
                        "Listener '{}' is https but has no TLS configuration",
                        listener.name
                    )));
                }
                _ => {}
            }

            for host in &listener.hosts {
                compile_pattern(&host.host)?;
                for path in &host.paths {
                    compile_pattern(&path.path)?;
                }
            }

            for routing in listener.routings() {
                routing.validate()?;
                for name in routing.pool_names() {
                    let portless = pools.get(name).ok_or_else(|| {
                        Error::config(format!(
                            "Listener '{}' references unknown pool '{name}'",
                            listener.name
                        ))
                    })?;
                    if *portless && listener.destination_port.is_none() {
                        return Err(Error::config(format!(
                            "Listener '{}' needs destination_port for pool '{name}'",
                            listener.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Compile a routing regex, anchored at both ends.
pub fn compile_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| Error::config(format!("Invalid pattern '{pattern}': {e}")))
}

/// Read and validate a YAML configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<ProxyConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("Cannot read '{}': {e}", path.display())))?;
    let config: ProxyConfig = serde_yaml::from_str(&content)
        .map_err(|e| Error::config(format!("Invalid YAML in '{}': {e}", path.display())))?;
    Ok(config)
}
