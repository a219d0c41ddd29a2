// src/lib.rs
//! Multi-protocol load balancer.
//!
//! Listeners (TCP, UDP, HTTP, HTTPS) route each client by its source
//! address or by virtual host and path to a pool of backends. Pools pick a
//! backend with a balancing strategy, retry across backends on connect
//! failure and take repeatedly failing backends out of rotation for a
//! configured break time.

pub mod address;
pub mod backend;
pub mod balancing;
pub mod buffers;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod routing;

pub use address::{expand_template, AddressSet, Network};
pub use backend::{Backend, BackendParams, BackendSnapshot, Health, SessionGuard};
pub use balancing::{BalancingMethod, Strategy};
pub use config::{load_config, ListenerSpec, PoolSpec, Protocol, ProxyConfig, RoutingSpec};
pub use engine::{Engine, EngineSnapshot};
pub use error::{Error, ErrorCategory, Result};
pub use pool::{Dialer, Lease, PoolSnapshot, ServerPool, TcpDialer, UdpDialer};
pub use routing::{PoolRegistry, RoutingTable};
