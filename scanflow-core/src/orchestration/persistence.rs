use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::master::OrchestrationMaster;
use super::resources::PoolSnapshot;
use super::stage::StageExecution;
use crate::error::Result;
use crate::types::ids::{OrchestrationId, StageExecutionId};

/// Durable history of orchestrations. The coordinator's in-memory registry is
/// authoritative for live work; this is authoritative for history.
#[async_trait]
pub trait OrchestrationRepository: Send + Sync {
    async fn upsert_master(&self, master: &OrchestrationMaster) -> Result<()>;

    async fn load_master(&self, id: OrchestrationId) -> Result<Option<OrchestrationMaster>>;

    async fn upsert_stage_execution(&self, execution: &StageExecution) -> Result<()>;

    async fn stage_executions(&self, id: OrchestrationId) -> Result<Vec<StageExecution>>;

    async fn record_pool_snapshot(&self, snapshot: &PoolSnapshot) -> Result<()>;

    async fn recent_pool_snapshots(&self, limit: usize) -> Result<Vec<PoolSnapshot>>;
}

#[derive(Default)]
struct RepositoryState {
    masters: HashMap<OrchestrationId, OrchestrationMaster>,
    stages: HashMap<OrchestrationId, BTreeMap<StageExecutionId, StageExecution>>,
    snapshots: Vec<PoolSnapshot>,
}

/// Process-local repository. Snapshots are capped at `snapshot_capacity`.
#[derive(Clone)]
pub struct InMemoryOrchestrationRepository {
    state: Arc<RwLock<RepositoryState>>,
    snapshot_capacity: usize,
}

impl fmt::Debug for InMemoryOrchestrationRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryOrchestrationRepository");
        debug.field("snapshot_capacity", &self.snapshot_capacity);
        match self.state.try_read() {
            Ok(state) => {
                debug
                    .field("masters", &state.masters.len())
                    .field("snapshots", &state.snapshots.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl Default for InMemoryOrchestrationRepository {
    fn default() -> Self {
        Self::new(1_024)
    }
}

impl InMemoryOrchestrationRepository {
    pub fn new(snapshot_capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(RepositoryState::default())),
            snapshot_capacity: snapshot_capacity.max(1),
        }
    }

    pub async fn master_count(&self) -> usize {
        self.state.read().await.masters.len()
    }
}

#[async_trait]
impl OrchestrationRepository for InMemoryOrchestrationRepository {
    async fn upsert_master(&self, master: &OrchestrationMaster) -> Result<()> {
        let mut state = self.state.write().await;
        state.masters.insert(master.id, master.clone());
        let stages = state.stages.entry(master.id).or_default();
        for execution in &master.stages {
            stages.insert(execution.id, execution.clone());
        }
        Ok(())
    }

    async fn load_master(&self, id: OrchestrationId) -> Result<Option<OrchestrationMaster>> {
        Ok(self.state.read().await.masters.get(&id).cloned())
    }

    async fn upsert_stage_execution(&self, execution: &StageExecution) -> Result<()> {
        self.state
            .write()
            .await
            .stages
            .entry(execution.orchestration_id)
            .or_default()
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn stage_executions(&self, id: OrchestrationId) -> Result<Vec<StageExecution>> {
        Ok(self
            .state
            .read()
            .await
            .stages
            .get(&id)
            .map(|stages| stages.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn record_pool_snapshot(&self, snapshot: &PoolSnapshot) -> Result<()> {
        let mut state = self.state.write().await;
        state.snapshots.push(snapshot.clone());
        let overflow = state.snapshots.len().saturating_sub(self.snapshot_capacity);
        if overflow > 0 {
            state.snapshots.drain(..overflow);
        }
        Ok(())
    }

    async fn recent_pool_snapshots(&self, limit: usize) -> Result<Vec<PoolSnapshot>> {
        let state = self.state.read().await;
        let start = state.snapshots.len().saturating_sub(limit);
        Ok(state.snapshots[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot() -> PoolSnapshot {
        PoolSnapshot {
            sampled_at: Utc::now(),
            pools: BTreeMap::new(),
            active_reservations: 0,
            utilization_threshold: 0.9,
        }
    }

    #[tokio::test]
    async fn snapshot_history_is_bounded() {
        let repo = InMemoryOrchestrationRepository::new(3);
        for _ in 0..5 {
            repo.record_pool_snapshot(&snapshot()).await.unwrap();
        }
        assert_eq!(repo.recent_pool_snapshots(10).await.unwrap().len(), 3);
        assert_eq!(repo.recent_pool_snapshots(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_master_is_none() {
        let repo = InMemoryOrchestrationRepository::default();
        assert!(repo.load_master(OrchestrationId::new()).await.unwrap().is_none());
        assert!(repo.stage_executions(OrchestrationId::new()).await.unwrap().is_empty());
    }
}
