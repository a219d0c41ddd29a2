//! Source-address routing.
//!
//! A [`RoutingTable`] admits or rejects a client by its accept/deny lists
//! and then maps it to a pool: first matching rule wins, otherwise the
//! default pool. Pools live in a [`PoolRegistry`] that is rebuilt per
//! configuration generation and shared by all tables of that generation.

use crate::address::AddressSet;
use crate::config::{PoolSpec, RoutingSpec};
use crate::pool::{PoolSnapshot, ServerPool};
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// Named pools of one configuration generation.
#[derive(Debug, Clone, Default)]
pub struct PoolRegistry {
    pools: HashMap<String, Arc<ServerPool>>,
}

impl PoolRegistry {
    /// Build pools for `specs`, reusing pools from `previous` whose spec is
    /// unchanged so their health and session state carries over.
    pub fn build(specs: &[PoolSpec], previous: Option<&PoolRegistry>) -> Result<Self> {
        let mut pools = HashMap::with_capacity(specs.len());
        for spec in specs {
            let reused = previous
                .and_then(|prev| prev.pools.get(&spec.name))
                .filter(|pool| pool.matches_spec(spec))
                .cloned();
            let pool = match reused {
                Some(pool) => {
                    debug!(pool = %spec.name, "Reusing unchanged pool");
                    pool
                }
                None => ServerPool::from_spec(spec)?,
            };
            if pools.insert(spec.name.clone(), pool).is_some() {
                return Err(Error::config(format!("Duplicate pool name: {}", spec.name)));
            }
        }
        Ok(Self { pools })
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerPool>> {
        self.pools.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<ServerPool>> {
        self.get(name)
            .ok_or_else(|| Error::config(format!("Unknown pool '{name}'")))
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Snapshots of every pool, sorted by name.
    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        let mut out: Vec<_> = self.pools.values().map(|pool| pool.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[derive(Debug, Clone)]
struct Rule {
    sources: Arc<AddressSet>,
    pool: Arc<ServerPool>,
}

/// Ordered source rules plus accept/deny lists and a default pool.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    accept: Arc<AddressSet>,
    deny: Arc<AddressSet>,
    rules: Vec<Rule>,
    default_pool: Arc<ServerPool>,
}

impl RoutingTable {
    pub fn new(default_pool: Arc<ServerPool>) -> Self {
        Self {
            accept: Arc::default(),
            deny: Arc::default(),
            rules: Vec::new(),
            default_pool,
        }
    }

    pub fn with_accept(mut self, accept: Arc<AddressSet>) -> Self {
        self.accept = accept;
        self
    }

    pub fn with_deny(mut self, deny: Arc<AddressSet>) -> Self {
        self.deny = deny;
        self
    }

    /// Append a rule; rules are evaluated in insertion order.
    pub fn with_rule(mut self, sources: Arc<AddressSet>, pool: Arc<ServerPool>) -> Self {
        self.rules.push(Rule { sources, pool });
        self
    }

    pub fn from_spec(spec: &RoutingSpec, registry: &PoolRegistry) -> Result<Self> {
        let mut table = RoutingTable::new(registry.require(&spec.default_pool)?)
            .with_accept(Arc::new(AddressSet::build(&spec.accept)?))
            .with_deny(Arc::new(AddressSet::build(&spec.deny)?));
        for rule in &spec.rules {
            table = table.with_rule(
                Arc::new(AddressSet::build(&rule.sources)?),
                registry.require(&rule.pool)?,
            );
        }
        Ok(table)
    }

    /// Whether the accept/deny lists let `client` through.
    ///
    /// A non-empty accept list makes the deny list irrelevant.
    pub fn admits(&self, client: IpAddr) -> bool {
        if !self.accept.is_empty() {
            return self.accept.contains(client);
        }
        !self.deny.contains(client)
    }

    /// Pool serving `client`, or `AccessDenied`.
    pub fn resolve(&self, client: IpAddr) -> Result<Arc<ServerPool>> {
        if !self.admits(client) {
            return Err(Error::access_denied(client));
        }
        let pool = self
            .rules
            .iter()
            .find(|rule| rule.sources.contains(client))
            .map(|rule| &rule.pool)
            .unwrap_or(&self.default_pool);
        Ok(Arc::clone(pool))
    }

    /// [`resolve`](Self::resolve) for textual `ip` or `ip:port` input.
    pub fn resolve_str(&self, client: &str) -> Result<Arc<ServerPool>> {
        let ip = client
            .parse::<IpAddr>()
            .or_else(|_| client.parse::<SocketAddr>().map(|addr| addr.ip()))
            .map_err(|_| Error::access_denied(client))?;
        self.resolve(ip)
    }

    pub fn default_pool(&self) -> &Arc<ServerPool> {
        &self.default_pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancing::BalancingMethod;
    use crate::config::{BackendSpec, RuleSpec};

    fn pool(name: &str) -> Arc<ServerPool> {
        ServerPool::new(name, BalancingMethod::RoundRobin, Vec::new())
    }

    fn set(entries: &[&str]) -> Arc<AddressSet> {
        Arc::new(AddressSet::build(entries).unwrap())
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_accept_list_takes_precedence_over_deny() {
        let table = RoutingTable::new(pool("default"))
            .with_accept(set(&["10.0.0.0/24"]))
            .with_deny(set(&["10.0.0.5", "172.16.0.1"]));

        // deny list is ignored once an accept list exists
        assert!(table.resolve(ip("10.0.0.5")).is_ok());
        assert!(matches!(
            table.resolve(ip("172.16.0.2")),
            Err(Error::AccessDenied { .. })
        ));
        assert!(table.resolve(ip("172.16.0.1")).is_err());
    }

    #[test]
    fn test_deny_list_alone() {
        let table = RoutingTable::new(pool("default")).with_deny(set(&["192.168.[1-2].0/24"]));
        assert!(matches!(
            table.resolve(ip("192.168.1.7")),
            Err(Error::AccessDenied { .. })
        ));
        assert!(table.resolve(ip("192.168.3.7")).is_ok());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let table = RoutingTable::new(pool("default"))
            .with_rule(set(&["10.0.0.0/8"]), pool("wide"))
            .with_rule(set(&["10.1.0.0/16"]), pool("narrow"));

        assert_eq!(table.resolve(ip("10.1.2.3")).unwrap().name(), "wide");
        assert_eq!(table.resolve(ip("11.0.0.1")).unwrap().name(), "default");
        assert_eq!(table.resolve_str("10.9.9.9:4242").unwrap().name(), "wide");
    }

    #[test]
    fn test_unparsable_client_is_denied() {
        let table = RoutingTable::new(pool("default"));
        assert!(matches!(
            table.resolve_str("nonsense"),
            Err(Error::AccessDenied { .. })
        ));
    }

    fn spec(name: &str, address: &str) -> PoolSpec {
        PoolSpec {
            name: name.to_string(),
            backends: vec![BackendSpec::new(address)],
            balancing: BalancingMethod::RoundRobin,
        }
    }

    #[test]
    fn test_registry_reuses_unchanged_pools() {
        let first = PoolRegistry::build(
            &[spec("a", "127.0.0.1:1"), spec("b", "127.0.0.1:2")],
            None,
        )
        .unwrap();
        let second = PoolRegistry::build(
            &[spec("a", "127.0.0.1:1"), spec("b", "127.0.0.1:3")],
            Some(&first),
        )
        .unwrap();

        assert!(Arc::ptr_eq(
            &first.get("a").unwrap(),
            &second.get("a").unwrap()
        ));
        assert!(!Arc::ptr_eq(
            &first.get("b").unwrap(),
            &second.get("b").unwrap()
        ));
        assert_eq!(second.snapshot()[1].backends[0].address.port(), 3);
    }

    #[test]
    fn test_table_from_spec() {
        let registry =
            PoolRegistry::build(&[spec("a", "127.0.0.1:1"), spec("b", "127.0.0.1:2")], None)
                .unwrap();
        let routing = RoutingSpec {
            rules: vec![RuleSpec {
                sources: vec!["10.0.0.[1-4]".to_string()],
                pool: "b".to_string(),
            }],
            accept: Vec::new(),
            deny: vec!["10.0.0.9".to_string()],
            default_pool: "a".to_string(),
        };
        let table = RoutingTable::from_spec(&routing, &registry).unwrap();
        assert_eq!(table.resolve(ip("10.0.0.3")).unwrap().name(), "b");
        assert_eq!(table.resolve(ip("10.0.0.5")).unwrap().name(), "a");
        assert!(table.resolve(ip("10.0.0.9")).is_err());

        let broken = RoutingSpec::to_pool("missing");
        assert!(RoutingTable::from_spec(&broken, &registry).is_err());
    }
}
