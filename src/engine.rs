//! Listener supervision, configuration reload and runtime snapshots.
//!
//! The engine binds every configured listener at start and owns the pool
//! registry of the current configuration generation. A reload builds the
//! complete next generation first and only then swaps it into each
//! listener, so a rejected configuration leaves everything untouched.

use crate::config::{ListenerSpec, Protocol, ProxyConfig};
use crate::pool::PoolSnapshot;
use crate::proxy::forward::Generation;
use crate::proxy::http::{HttpProxy, HttpRoutes};
use crate::proxy::tcp::TcpProxy;
use crate::proxy::udp::UdpProxy;
use crate::proxy::{ListenerContext, ListenerSnapshot, Proxy};
use crate::routing::{PoolRegistry, RoutingTable};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone)]
enum ListenerRoutes {
    Source(Arc<ListenerContext<RoutingTable>>),
    Http(Arc<ListenerContext<HttpRoutes>>),
}

enum PendingGeneration {
    Source(Generation<RoutingTable>),
    Http(Generation<HttpRoutes>),
}

#[derive(Debug)]
struct ListenerHandle {
    identity: (String, Protocol, String),
    local_addr: SocketAddr,
    routes: ListenerRoutes,
}

impl ListenerHandle {
    fn snapshot(&self) -> ListenerSnapshot {
        match &self.routes {
            ListenerRoutes::Source(ctx) => ctx.snapshot(),
            ListenerRoutes::Http(ctx) => ctx.snapshot(),
        }
    }
}

/// Everything observable about a running engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub pools: Vec<PoolSnapshot>,
    pub listeners: Vec<ListenerSnapshot>,
}

#[derive(Debug)]
struct EngineState {
    config: ProxyConfig,
    registry: PoolRegistry,
}

/// A running set of listeners.
#[derive(Debug)]
pub struct Engine {
    state: Mutex<EngineState>,
    listeners: Vec<ListenerHandle>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
}

fn source_routes(spec: &ListenerSpec, registry: &PoolRegistry) -> Result<RoutingTable> {
    let routing = spec.routing.as_ref().ok_or_else(|| {
        Error::config(format!("Listener '{}' needs a routing section", spec.name))
    })?;
    RoutingTable::from_spec(routing, registry)
}

fn build_generation(spec: &ListenerSpec, registry: &PoolRegistry) -> Result<PendingGeneration> {
    Ok(match spec.protocol {
        Protocol::Tcp | Protocol::Udp => {
            PendingGeneration::Source(Generation::new(source_routes(spec, registry)?, spec))
        }
        Protocol::Http | Protocol::Https => PendingGeneration::Http(Generation::new(
            HttpRoutes::from_specs(&spec.hosts, registry)?,
            spec,
        )),
    })
}

async fn bind_listener(
    spec: &ListenerSpec,
    registry: &PoolRegistry,
) -> Result<(Box<dyn Proxy>, ListenerRoutes)> {
    let addr = spec.socket_addr()?;
    Ok(match spec.protocol {
        Protocol::Tcp => {
            let ctx = ListenerContext::new(spec, source_routes(spec, registry)?);
            let proxy = TcpProxy::bind(addr, Arc::clone(&ctx)).await?;
            (Box::new(proxy), ListenerRoutes::Source(ctx))
        }
        Protocol::Udp => {
            let ctx = ListenerContext::new(spec, source_routes(spec, registry)?);
            let proxy = UdpProxy::bind(addr, Arc::clone(&ctx)).await?;
            (Box::new(proxy), ListenerRoutes::Source(ctx))
        }
        Protocol::Http | Protocol::Https => {
            let tls = match spec.protocol {
                Protocol::Https => Some(spec.server_tls()?),
                _ => None,
            };
            let ctx = ListenerContext::new(spec, HttpRoutes::from_specs(&spec.hosts, registry)?);
            let proxy = HttpProxy::bind(addr, Arc::clone(&ctx), tls).await?;
            (Box::new(proxy), ListenerRoutes::Http(ctx))
        }
    })
}

impl Engine {
    /// Validate `config`, bind every listener and start serving.
    ///
    /// Either all listeners start or none do.
    pub async fn start(config: ProxyConfig) -> Result<Self> {
        config.validate()?;
        let registry = PoolRegistry::build(&config.pools, None)?;

        let mut bound = Vec::with_capacity(config.listeners.len());
        for spec in &config.listeners {
            let (proxy, routes) = bind_listener(spec, &registry).await?;
            bound.push((spec.identity(), proxy, routes));
        }

        let (shutdown, _) = broadcast::channel(1);
        let mut listeners = Vec::with_capacity(bound.len());
        let mut tasks = Vec::with_capacity(bound.len());
        for (identity, proxy, routes) in bound {
            let local_addr = proxy.local_addr();
            info!(
                listener = %identity.0,
                protocol = %identity.1,
                addr = %local_addr,
                "Listener bound"
            );
            tasks.push(tokio::spawn(proxy.run(shutdown.subscribe())));
            listeners.push(ListenerHandle {
                identity,
                local_addr,
                routes,
            });
        }

        info!(
            listeners = listeners.len(),
            pools = registry.len(),
            "Balancer started"
        );
        Ok(Self {
            state: Mutex::new(EngineState { config, registry }),
            listeners,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Bound address of the listener called `name`.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.identity.0 == name)
            .map(|l| l.local_addr)
    }

    /// Pool of the current generation, by name.
    pub fn pool(&self, name: &str) -> Option<Arc<crate::pool::ServerPool>> {
        self.state.lock().registry.get(name)
    }

    /// Swap in a new routing/pool graph.
    ///
    /// Pools whose spec did not change are carried over with their health
    /// and session state. In-flight sessions keep the generation they
    /// started with. The set of listeners cannot change.
    pub fn reload(&self, config: ProxyConfig) -> Result<()> {
        config.validate()?;
        let mut state = self.state.lock();

        let current: HashMap<_, _> = state
            .config
            .listeners
            .iter()
            .map(|l| (l.name.clone(), l.identity()))
            .collect();
        let unchanged = config.listeners.len() == current.len()
            && config
                .listeners
                .iter()
                .all(|l| current.get(&l.name) == Some(&l.identity()));
        if !unchanged {
            return Err(Error::config(
                "Reload cannot add, remove or rebind listeners; restart instead",
            ));
        }

        let registry = PoolRegistry::build(&config.pools, Some(&state.registry))?;
        let mut pending = Vec::with_capacity(self.listeners.len());
        for handle in &self.listeners {
            let spec = config
                .listeners
                .iter()
                .find(|l| l.name == handle.identity.0)
                .ok_or_else(|| Error::config(format!("Listener '{}' missing", handle.identity.0)))?;
            pending.push(build_generation(spec, &registry)?);
        }

        for (handle, generation) in self.listeners.iter().zip(pending) {
            match (&handle.routes, generation) {
                (ListenerRoutes::Source(ctx), PendingGeneration::Source(generation)) => {
                    ctx.replace(generation)
                }
                (ListenerRoutes::Http(ctx), PendingGeneration::Http(generation)) => {
                    ctx.replace(generation)
                }
                _ => error!(listener = %handle.identity.0, "Protocol mismatch on reload"),
            }
        }

        let reused = config
            .pools
            .iter()
            .filter(|spec| {
                match (state.registry.get(&spec.name), registry.get(&spec.name)) {
                    (Some(old), Some(new)) => Arc::ptr_eq(&old, &new),
                    _ => false,
                }
            })
            .count();
        info!(
            pools = registry.len(),
            reused,
            listeners = self.listeners.len(),
            "Configuration reloaded"
        );
        *state = EngineState { config, registry };
        Ok(())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let pools = self.state.lock().registry.snapshot();
        EngineSnapshot {
            pools,
            listeners: self.listeners.iter().map(ListenerHandle::snapshot).collect(),
        }
    }

    /// Stop accepting and wait for the listener loops to exit.
    ///
    /// Sessions already forwarding run to completion on their own.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Listener exited with error"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
        info!("Balancer stopped");
    }
}
