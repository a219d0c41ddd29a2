//! Backend selection strategies.
//!
//! A [`Strategy`] picks one index out of an ordered candidate slice. It only
//! ever looks at [`BackendHandle::weight`] and
//! [`BackendHandle::current_sessions`]; health is the pool's business.
//!
//! `select` runs under the pool's read lock and must therefore work from a
//! shared reference. Strategies with a moving cursor keep it behind their own
//! small mutex. `rebalance` runs under the pool's write lock whenever the
//! candidate membership or a weight changes.

use crate::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The view of a backend a strategy is allowed to see.
pub trait BackendHandle {
    fn weight(&self) -> u32;
    fn current_sessions(&self) -> usize;
}

impl<T: BackendHandle + ?Sized> BackendHandle for Arc<T> {
    fn weight(&self) -> u32 {
        (**self).weight()
    }

    fn current_sessions(&self) -> usize {
        (**self).current_sessions()
    }
}

/// Configured balancing method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalancingMethod {
    #[default]
    #[serde(alias = "round_robin")]
    RoundRobin,
    Random,
    #[serde(alias = "hash_ip")]
    HashIp,
    #[serde(alias = "least_connections")]
    LeastConnections,
    /// Always the highest-weight candidate.
    #[serde(alias = "priority")]
    None,
}

impl std::fmt::Display for BalancingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BalancingMethod::RoundRobin => "roundrobin",
            BalancingMethod::Random => "random",
            BalancingMethod::HashIp => "haship",
            BalancingMethod::LeastConnections => "leastconnections",
            BalancingMethod::None => "none",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct Cursor {
    position: usize,
    remaining: u32,
}

/// Weighted round robin: each backend is returned `weight` times in a row.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Mutex<Cursor>,
}

impl RoundRobin {
    fn select<H: BackendHandle>(&self, candidates: &[H]) -> usize {
        let mut cursor = self.cursor.lock();
        let idx = cursor.position % candidates.len();
        if cursor.remaining == 0 {
            cursor.remaining = candidates[idx].weight().max(1);
        }
        cursor.remaining -= 1;
        cursor.position = if cursor.remaining == 0 {
            (idx + 1) % candidates.len()
        } else {
            idx
        };
        idx
    }

    fn rebalance<H: BackendHandle>(&mut self, candidates: &[H]) {
        let cursor = self.cursor.get_mut();
        if candidates.is_empty() {
            *cursor = Cursor::default();
            return;
        }
        if cursor.position >= candidates.len() {
            cursor.position %= candidates.len();
            cursor.remaining = 0;
        }
        let weight = candidates[cursor.position].weight().max(1);
        if cursor.remaining > weight {
            cursor.remaining = weight;
        }
    }
}

/// Dense slot array where candidate `i` owns `weight(i)` consecutive slots.
#[derive(Debug, Default, Clone)]
pub struct WeightedSlots {
    slots: Vec<usize>,
}

impl WeightedSlots {
    fn rebuild<H: BackendHandle>(&mut self, candidates: &[H]) {
        self.slots.clear();
        for (idx, candidate) in candidates.iter().enumerate() {
            let weight = candidate.weight().max(1) as usize;
            self.slots.extend(std::iter::repeat(idx).take(weight));
        }
    }

    /// Owner of `slot`, tolerating a slot array that lags the candidates.
    fn owner(&self, slot: usize, len: usize) -> usize {
        if self.slots.is_empty() {
            return slot % len;
        }
        self.slots[slot % self.slots.len()] % len
    }

    fn slot_count(&self, len: usize) -> usize {
        if self.slots.is_empty() {
            len
        } else {
            self.slots.len()
        }
    }
}

/// 32-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// A balancing strategy instance bound to one pool.
#[derive(Debug)]
pub enum Strategy {
    RoundRobin(RoundRobin),
    Random(WeightedSlots),
    HashIp(WeightedSlots),
    LeastConnections,
    Priority,
}

impl Strategy {
    pub fn new(method: BalancingMethod) -> Self {
        match method {
            BalancingMethod::RoundRobin => Strategy::RoundRobin(RoundRobin::default()),
            BalancingMethod::Random => Strategy::Random(WeightedSlots::default()),
            BalancingMethod::HashIp => Strategy::HashIp(WeightedSlots::default()),
            BalancingMethod::LeastConnections => Strategy::LeastConnections,
            BalancingMethod::None => Strategy::Priority,
        }
    }

    pub fn method(&self) -> BalancingMethod {
        match self {
            Strategy::RoundRobin(_) => BalancingMethod::RoundRobin,
            Strategy::Random(_) => BalancingMethod::Random,
            Strategy::HashIp(_) => BalancingMethod::HashIp,
            Strategy::LeastConnections => BalancingMethod::LeastConnections,
            Strategy::Priority => BalancingMethod::None,
        }
    }

    /// Pick the index of one candidate.
    pub fn select<H: BackendHandle>(&self, client_key: &str, candidates: &[H]) -> Result<usize> {
        if candidates.is_empty() {
            return Err(Error::NoCandidate);
        }
        let len = candidates.len();
        let idx = match self {
            Strategy::RoundRobin(rr) => rr.select(candidates),
            Strategy::Random(slots) => {
                let slot = rand::thread_rng().gen_range(0..slots.slot_count(len));
                slots.owner(slot, len)
            }
            Strategy::HashIp(slots) => {
                let hash = fnv1a(client_key.as_bytes()) as usize;
                slots.owner(hash % slots.slot_count(len), len)
            }
            Strategy::LeastConnections => least_loaded(candidates),
            Strategy::Priority => 0,
        };
        Ok(idx)
    }

    /// Recompute derived state after the candidate list changed.
    ///
    /// May reorder `candidates` (the priority strategy moves its pick to
    /// the front).
    pub fn rebalance<H: BackendHandle>(&mut self, candidates: &mut [H]) {
        match self {
            Strategy::RoundRobin(rr) => rr.rebalance(candidates),
            Strategy::Random(slots) | Strategy::HashIp(slots) => slots.rebuild(candidates),
            Strategy::LeastConnections => {}
            Strategy::Priority => {
                let mut best = 0;
                for (idx, candidate) in candidates.iter().enumerate() {
                    if candidates[best].weight() < candidate.weight() {
                        best = idx;
                    }
                }
                candidates.swap(0, best);
            }
        }
    }
}

/// `argmin(sessions / max(1, weight))`, first candidate wins ties.
fn least_loaded<H: BackendHandle>(candidates: &[H]) -> usize {
    let load = |h: &H| (h.current_sessions() as u64, u64::from(h.weight().max(1)));
    let mut best = 0;
    let (mut best_sessions, mut best_weight) = load(&candidates[0]);
    for (idx, candidate) in candidates.iter().enumerate().skip(1) {
        let (sessions, weight) = load(candidate);
        // sessions/weight < best_sessions/best_weight without division
        if sessions * best_weight < best_sessions * weight {
            best = idx;
            best_sessions = sessions;
            best_weight = weight;
        }
    }
    best
}
