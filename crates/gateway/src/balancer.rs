//! Endpoint health tracking and load balancing.
//!
//! The [`EndpointPool`] holds a copy-on-write snapshot of an API's endpoints
//! and their health state. The external health-checker flips states through
//! [`EndpointPool::set_state`]; balancers only read, and always see a
//! consistent snapshot even while the checker is mutating concurrently.
//!
//! Only endpoints in state `Up` participate in selection. `Down` and
//! `Unknown` are excluded, and an empty UP subset yields `None` rather than
//! a silent fallback to an unhealthy endpoint.

use arc_swap::ArcSwap;
use portcullis_common::{EndpointName, HealthState, LbAlgorithm};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::definition::Endpoint;

/// An endpoint together with its current health state
#[derive(Debug, Clone)]
pub struct EndpointStatus {
    pub endpoint: Endpoint,
    pub state: HealthState,
}

/// Endpoint chosen by a balancer for one upstream attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedEndpoint {
    pub name: EndpointName,
    pub target: String,
    pub weight: u32,
}

impl From<&Endpoint> for SelectedEndpoint {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            name: endpoint.name.clone(),
            target: endpoint.target.clone(),
            weight: endpoint.weight,
        }
    }
}

/// Copy-on-write endpoint table shared by all requests of an API
pub struct EndpointPool {
    snapshot: ArcSwap<Vec<EndpointStatus>>,
}

impl EndpointPool {
    /// Build a pool from an API's endpoint list.
    ///
    /// Endpoints start `Up`: they are assumed healthy until the external
    /// health-checker reports otherwise.
    pub fn new(endpoints: &[Endpoint]) -> Self {
        let statuses = endpoints
            .iter()
            .map(|endpoint| EndpointStatus {
                endpoint: endpoint.clone(),
                state: HealthState::Up,
            })
            .collect();
        Self {
            snapshot: ArcSwap::from_pointee(statuses),
        }
    }

    /// Health-checker mutation point.
    ///
    /// Swaps in a fresh snapshot so selections in flight keep the endpoints
    /// they already read.
    pub fn set_state(&self, name: &EndpointName, state: HealthState) {
        let current = self.snapshot.load();
        if !current.iter().any(|s| &s.endpoint.name == name) {
            warn!(endpoint = %name, "Health report for unknown endpoint ignored");
            return;
        }

        let updated: Vec<EndpointStatus> = current
            .iter()
            .map(|s| {
                if &s.endpoint.name == name {
                    EndpointStatus {
                        endpoint: s.endpoint.clone(),
                        state,
                    }
                } else {
                    s.clone()
                }
            })
            .collect();

        debug!(endpoint = %name, state = %state, "Endpoint health state changed");
        self.snapshot.store(Arc::new(updated));
    }

    /// Consistent snapshot of the UP subset, in declaration order
    pub fn up_endpoints(&self) -> Vec<Endpoint> {
        self.snapshot
            .load()
            .iter()
            .filter(|s| s.state.is_up())
            .map(|s| s.endpoint.clone())
            .collect()
    }

    /// Full snapshot including unhealthy endpoints
    pub fn endpoints(&self) -> Arc<Vec<EndpointStatus>> {
        self.snapshot.load_full()
    }
}

/// Stateless-per-call selection over the pool's UP subset
pub trait LoadBalancer: Send + Sync {
    /// Select the next endpoint, or `None` when no UP endpoint exists
    fn next(&self) -> Option<SelectedEndpoint>;
}

/// Build the balancer configured for an API
pub fn create_balancer(algorithm: LbAlgorithm, pool: Arc<EndpointPool>) -> Arc<dyn LoadBalancer> {
    match algorithm {
        LbAlgorithm::RoundRobin => Arc::new(RoundRobinBalancer::new(pool)),
        LbAlgorithm::Random => Arc::new(RandomBalancer { pool }),
        LbAlgorithm::WeightedRoundRobin => Arc::new(WeightedRoundRobinBalancer::new(pool)),
        LbAlgorithm::WeightedRandom => Arc::new(WeightedRandomBalancer { pool }),
    }
}

/// Cyclic cursor over the UP subset with wraparound
pub struct RoundRobinBalancer {
    pool: Arc<EndpointPool>,
    cursor: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new(pool: Arc<EndpointPool>) -> Self {
        Self {
            pool,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn next(&self) -> Option<SelectedEndpoint> {
        let up = self.pool.up_endpoints();
        if up.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % up.len();
        Some((&up[index]).into())
    }
}

/// Uniform pick over the UP subset
struct RandomBalancer {
    pool: Arc<EndpointPool>,
}

impl LoadBalancer for RandomBalancer {
    fn next(&self) -> Option<SelectedEndpoint> {
        let up = self.pool.up_endpoints();
        if up.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..up.len());
        Some((&up[index]).into())
    }
}

/// Weighted round-robin: each endpoint is visited `weight` times per cycle
pub struct WeightedRoundRobinBalancer {
    pool: Arc<EndpointPool>,
    cursor: AtomicUsize,
}

impl WeightedRoundRobinBalancer {
    pub fn new(pool: Arc<EndpointPool>) -> Self {
        Self {
            pool,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn next(&self) -> Option<SelectedEndpoint> {
        let up = self.pool.up_endpoints();
        if up.is_empty() {
            return None;
        }

        let total_weight: usize = up.iter().map(|e| e.weight.max(1) as usize).sum();
        let mut position = self.cursor.fetch_add(1, Ordering::Relaxed) % total_weight;

        for endpoint in &up {
            let weight = endpoint.weight.max(1) as usize;
            if position < weight {
                return Some(endpoint.into());
            }
            position -= weight;
        }
        // Unreachable with a consistent snapshot; kept as a safe fallback
        Some((&up[0]).into())
    }
}

/// Weighted random: selection probability proportional to weight
struct WeightedRandomBalancer {
    pool: Arc<EndpointPool>,
}

impl LoadBalancer for WeightedRandomBalancer {
    fn next(&self) -> Option<SelectedEndpoint> {
        let up = self.pool.up_endpoints();
        if up.is_empty() {
            return None;
        }

        let total_weight: u64 = up.iter().map(|e| e.weight.max(1) as u64).sum();
        let mut pick = rand::thread_rng().gen_range(0..total_weight);

        for endpoint in &up {
            let weight = endpoint.weight.max(1) as u64;
            if pick < weight {
                return Some(endpoint.into());
            }
            pick -= weight;
        }
        Some((&up[0]).into())
    }
}
