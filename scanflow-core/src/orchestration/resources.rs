//! Shared, bounded resource pools consumed by admitted orchestrations.

use std::collections::{BTreeMap, HashMap};
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::config::ResourceCapacityConfig;
use crate::error::Result;
use crate::types::ids::OrchestrationId;

/// Resource kinds tracked by the pool manager.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    Network,
    Storage,
    DbConnections,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::Network,
        ResourceType::Storage,
        ResourceType::DbConnections,
    ];
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cpu => write!(f, "cpu"),
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::Network => write!(f, "network"),
            ResourceType::Storage => write!(f, "storage"),
            ResourceType::DbConnections => write!(f, "db_connections"),
        }
    }
}

/// Amount per resource kind. Kinds that are absent count as zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRequirements(BTreeMap<ResourceType, u64>);

impl ResourceRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ResourceType, amount: u64) -> Self {
        self.insert(kind, amount);
        self
    }

    pub fn insert(&mut self, kind: ResourceType, amount: u64) {
        if amount == 0 {
            self.0.remove(&kind);
        } else {
            self.0.insert(kind, amount);
        }
    }

    pub fn get(&self, kind: ResourceType) -> u64 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, u64)> + '_ {
        self.0.iter().map(|(kind, amount)| (*kind, *amount))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|amount| *amount == 0)
    }

    /// Sum across kinds; only meaningful as a "fully released" check.
    pub fn total(&self) -> u64 {
        self.0.values().fold(0u64, |acc, v| acc.saturating_add(*v))
    }

    pub fn scaled(&self, factor: u64) -> Self {
        self.iter()
            .map(|(kind, amount)| (kind, amount.saturating_mul(factor)))
            .collect()
    }

    /// First kind whose requested amount exceeds the configured total capacity.
    pub fn first_exceeding(&self, capacity: &ResourceCapacityConfig) -> Option<(ResourceType, u64, u64)> {
        self.iter()
            .find(|(kind, amount)| *amount > capacity.capacity(*kind))
            .map(|(kind, amount)| (kind, amount, capacity.capacity(kind)))
    }
}

impl FromIterator<(ResourceType, u64)> for ResourceRequirements {
    fn from_iter<I: IntoIterator<Item = (ResourceType, u64)>>(iter: I) -> Self {
        let mut out = Self::default();
        for (kind, amount) in iter {
            let current = out.get(kind);
            out.insert(kind, current.saturating_add(amount));
        }
        out
    }
}

/// Counters for a single resource kind.
///
/// Invariant: `allocated + reserved <= total_capacity`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub resource_type: ResourceType,
    pub total_capacity: u64,
    pub allocated: u64,
    pub reserved: u64,
}

impl ResourcePool {
    pub fn new(resource_type: ResourceType, total_capacity: u64) -> Self {
        Self {
            resource_type,
            total_capacity,
            allocated: 0,
            reserved: 0,
        }
    }

    pub fn available(&self) -> u64 {
        self.total_capacity
            .saturating_sub(self.allocated)
            .saturating_sub(self.reserved)
    }

    pub fn in_use(&self) -> u64 {
        self.allocated.saturating_add(self.reserved)
    }

    pub fn utilization(&self) -> f64 {
        if self.total_capacity == 0 {
            return 0.0;
        }
        self.in_use() as f64 / self.total_capacity as f64
    }
}

/// Handle for a granted reservation. Exactly one release per handle is
/// expected; the manager tolerates duplicates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReservation {
    pub id: Uuid,
    pub owner: OrchestrationId,
    pub amounts: ResourceRequirements,
    pub granted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DenialReason {
    InsufficientCapacity,
    UtilizationThreshold { utilization: f64, threshold: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReservationDenial {
    pub resource: ResourceType,
    pub requested: u64,
    pub available: u64,
    pub reason: DenialReason,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReservationOutcome {
    Granted(ResourceReservation),
    Denied(ReservationDenial),
}

impl ReservationOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, ReservationOutcome::Granted(_))
    }
}

/// Point-in-time copy of every pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub pools: BTreeMap<ResourceType, ResourcePool>,
    pub active_reservations: usize,
    pub utilization_threshold: f64,
}

impl PoolSnapshot {
    pub fn utilization(&self, kind: ResourceType) -> f64 {
        self.pools.get(&kind).map(ResourcePool::utilization).unwrap_or(0.0)
    }

    pub fn max_utilization(&self) -> f64 {
        self.pools
            .values()
            .map(ResourcePool::utilization)
            .fold(0.0, f64::max)
    }

    pub fn pool(&self, kind: ResourceType) -> Option<&ResourcePool> {
        self.pools.get(&kind)
    }
}

/// Manages capacity accounting for the orchestrator.
#[async_trait]
pub trait ResourcePoolManager: Send + Sync {
    /// All-or-nothing reservation across every kind in `request`. A denial
    /// leaves every counter untouched.
    async fn reserve(
        &self,
        owner: OrchestrationId,
        request: &ResourceRequirements,
    ) -> Result<ReservationOutcome>;

    /// Moves a reservation from `reserved` to `allocated` once work starts.
    async fn commit(&self, reservation: &ResourceReservation) -> Result<()>;

    /// Returns the amounts actually released (zero for an unknown or
    /// already-released handle).
    async fn release(&self, reservation: &ResourceReservation) -> Result<ResourceRequirements>;

    async fn snapshot(&self) -> Result<PoolSnapshot>;

    async fn utilization(&self, kind: ResourceType) -> Result<f64>;

    async fn utilization_threshold(&self) -> f64;

    async fn set_utilization_threshold(&self, threshold: f64) -> Result<()>;

    fn total_capacity(&self, kind: ResourceType) -> u64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HeldState {
    Reserved,
    Allocated,
}

#[derive(Debug)]
struct HeldReservation {
    amounts: ResourceRequirements,
    state: HeldState,
}

#[derive(Debug)]
struct PoolState {
    pools: BTreeMap<ResourceType, ResourcePool>,
    held: HashMap<Uuid, HeldReservation>,
    threshold: f64,
}

impl PoolState {
    fn pool_mut(&mut self, kind: ResourceType) -> Option<&mut ResourcePool> {
        self.pools.get_mut(&kind)
    }
}

/// Default in-memory implementation of [`ResourcePoolManager`]. A single
/// critical section covers every pool so multi-kind reservations stay atomic.
pub struct InMemoryResourcePools {
    capacity: ResourceCapacityConfig,
    state: Arc<Mutex<PoolState>>,
}

impl fmt::Debug for InMemoryResourcePools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryResourcePools");
        debug.field("capacity", &self.capacity);

        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("pools", &state.pools)
                    .field("held", &state.held.len())
                    .field("threshold", &state.threshold);
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }

        debug.finish()
    }
}

impl InMemoryResourcePools {
    pub fn new(capacity: ResourceCapacityConfig, utilization_threshold: f64) -> Self {
        let pools = ResourceType::ALL
            .iter()
            .map(|kind| (*kind, ResourcePool::new(*kind, capacity.capacity(*kind))))
            .collect();
        Self {
            capacity,
            state: Arc::new(Mutex::new(PoolState {
                pools,
                held: HashMap::new(),
                threshold: utilization_threshold.clamp(0.0, 1.0),
            })),
        }
    }
}

#[async_trait]
impl ResourcePoolManager for InMemoryResourcePools {
    async fn reserve(
        &self,
        owner: OrchestrationId,
        request: &ResourceRequirements,
    ) -> Result<ReservationOutcome> {
        let mut state = self.state.lock().await;
        let threshold = state.threshold;

        // Check every kind before touching any counter.
        for (kind, amount) in request.iter() {
            let Some(pool) = state.pools.get(&kind) else {
                return Ok(ReservationOutcome::Denied(ReservationDenial {
                    resource: kind,
                    requested: amount,
                    available: 0,
                    reason: DenialReason::InsufficientCapacity,
                }));
            };
            let utilization = pool.utilization();
            if pool.in_use() > 0 && utilization >= threshold {
                return Ok(ReservationOutcome::Denied(ReservationDenial {
                    resource: kind,
                    requested: amount,
                    available: pool.available(),
                    reason: DenialReason::UtilizationThreshold {
                        utilization,
                        threshold,
                    },
                }));
            }
            if amount > pool.available() {
                return Ok(ReservationOutcome::Denied(ReservationDenial {
                    resource: kind,
                    requested: amount,
                    available: pool.available(),
                    reason: DenialReason::InsufficientCapacity,
                }));
            }
        }

        for (kind, amount) in request.iter() {
            if let Some(pool) = state.pool_mut(kind) {
                pool.reserved += amount;
            }
        }

        let reservation = ResourceReservation {
            id: Uuid::now_v7(),
            owner,
            amounts: request.clone(),
            granted_at: Utc::now(),
        };
        state.held.insert(
            reservation.id,
            HeldReservation {
                amounts: request.clone(),
                state: HeldState::Reserved,
            },
        );
        debug!(
            target: "scanflow::resources",
            reservation = %reservation.id,
            orchestration = %owner,
            "reservation granted"
        );
        Ok(ReservationOutcome::Granted(reservation))
    }

    async fn commit(&self, reservation: &ResourceReservation) -> Result<()> {
        let mut state = self.state.lock().await;
        let amounts = match state.held.get_mut(&reservation.id) {
            Some(held) if held.state == HeldState::Reserved => {
                held.state = HeldState::Allocated;
                held.amounts.clone()
            }
            _ => return Ok(()),
        };
        for (kind, amount) in amounts.iter() {
            if let Some(pool) = state.pool_mut(kind) {
                pool.reserved = pool.reserved.saturating_sub(amount);
                pool.allocated += amount;
            }
        }
        Ok(())
    }

    async fn release(&self, reservation: &ResourceReservation) -> Result<ResourceRequirements> {
        let mut state = self.state.lock().await;
        let Some(held) = state.held.remove(&reservation.id) else {
            warn!(
                target: "scanflow::resources",
                reservation = %reservation.id,
                orchestration = %reservation.owner,
                "release for unknown or already released reservation ignored"
            );
            return Ok(ResourceRequirements::new());
        };
        for (kind, amount) in held.amounts.iter() {
            if let Some(pool) = state.pool_mut(kind) {
                match held.state {
                    HeldState::Reserved => pool.reserved = pool.reserved.saturating_sub(amount),
                    HeldState::Allocated => {
                        pool.allocated = pool.allocated.saturating_sub(amount)
                    }
                }
            }
        }
        debug!(
            target: "scanflow::resources",
            reservation = %reservation.id,
            orchestration = %reservation.owner,
            "reservation released"
        );
        Ok(held.amounts)
    }

    async fn snapshot(&self) -> Result<PoolSnapshot> {
        let state = self.state.lock().await;
        Ok(PoolSnapshot {
            sampled_at: Utc::now(),
            pools: state.pools.clone(),
            active_reservations: state.held.len(),
            utilization_threshold: state.threshold,
        })
    }

    async fn utilization(&self, kind: ResourceType) -> Result<f64> {
        let state = self.state.lock().await;
        Ok(state.pools.get(&kind).map(ResourcePool::utilization).unwrap_or(0.0))
    }

    async fn utilization_threshold(&self) -> f64 {
        self.state.lock().await.threshold
    }

    async fn set_utilization_threshold(&self, threshold: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.threshold = threshold.clamp(0.0, 1.0);
        Ok(())
    }

    fn total_capacity(&self, kind: ResourceType) -> u64 {
        self.capacity.capacity(kind)
    }
}
