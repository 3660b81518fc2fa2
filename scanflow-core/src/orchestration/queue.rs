use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use super::planner::ExecutionPlan;
use super::request::{OrchestrationRequest, Priority};
use super::resources::ResourceRequirements;
use crate::types::ids::OrchestrationId;

/// Why an entry is still in the queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "waiting_on")]
pub enum WaitReason {
    /// Capacity or the concurrency bound denied admission.
    Resources,
    /// Prerequisite orchestrations have not reached a terminal state.
    Prerequisites(Vec<OrchestrationId>),
}

/// A validated request that has not been admitted yet. Never holds a
/// reservation.
#[derive(Clone, Debug)]
pub struct PendingQueueEntry {
    pub request: Arc<OrchestrationRequest>,
    pub plan: Arc<ExecutionPlan>,
    pub footprint: ResourceRequirements,
    /// Effective priority; starts at the request's and rises with aging.
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub last_promoted_at: Option<DateTime<Utc>>,
    pub wait: WaitReason,
}

impl PendingQueueEntry {
    pub fn new(
        request: Arc<OrchestrationRequest>,
        plan: Arc<ExecutionPlan>,
        footprint: ResourceRequirements,
        wait: WaitReason,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            priority: request.priority,
            request,
            plan,
            footprint,
            enqueued_at: now,
            last_promoted_at: None,
            wait,
        }
    }

    pub fn id(&self) -> OrchestrationId {
        self.request.id
    }

    pub fn waiting_for_resources(&self) -> bool {
        matches!(self.wait, WaitReason::Resources)
    }
}

type QueueKey = (u8, u64);

/// Priority-then-arrival ordered queue of pending orchestrations.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: BTreeMap<QueueKey, PendingQueueEntry>,
    keys: HashMap<OrchestrationId, QueueKey>,
    next_seq: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &OrchestrationId) -> bool {
        self.keys.contains_key(id)
    }

    /// Inserts and returns the 1-based position.
    pub fn push(&mut self, entry: PendingQueueEntry) -> usize {
        let id = entry.id();
        if let Some(old) = self.keys.remove(&id) {
            self.entries.remove(&old);
        }
        let key = (entry.priority.rank(), self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, entry);
        self.keys.insert(id, key);
        self.position(&id).unwrap_or(self.entries.len())
    }

    pub fn remove(&mut self, id: &OrchestrationId) -> Option<PendingQueueEntry> {
        let key = self.keys.remove(id)?;
        self.entries.remove(&key)
    }

    pub fn get(&self, id: &OrchestrationId) -> Option<&PendingQueueEntry> {
        self.keys.get(id).and_then(|key| self.entries.get(key))
    }

    pub fn get_mut(&mut self, id: &OrchestrationId) -> Option<&mut PendingQueueEntry> {
        let key = self.keys.get(id)?;
        self.entries.get_mut(key)
    }

    /// 1-based position in admission order.
    pub fn position(&self, id: &OrchestrationId) -> Option<usize> {
        let key = self.keys.get(id)?;
        Some(self.entries.range(..key).count() + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingQueueEntry> {
        self.entries.values()
    }

    pub fn ids_in_order(&self) -> Vec<OrchestrationId> {
        self.entries.values().map(PendingQueueEntry::id).collect()
    }

    /// True when an entry of equal or higher priority is already waiting on
    /// resources, so a newcomer of `priority` must not overtake it.
    pub fn has_resource_waiter_at_or_above(&self, priority: Priority) -> bool {
        self.entries
            .range(..=(priority.rank(), u64::MAX))
            .any(|(_, entry)| entry.waiting_for_resources())
    }

    /// Prerequisite edges of entries that are still parked on them.
    pub fn waiting_prerequisites(&self) -> HashMap<OrchestrationId, Vec<OrchestrationId>> {
        self.entries
            .values()
            .filter_map(|entry| match &entry.wait {
                WaitReason::Prerequisites(ids) => Some((entry.id(), ids.clone())),
                WaitReason::Resources => None,
            })
            .collect()
    }

    /// Promotes entries that have waited longer than `max_wait` since they
    /// were queued or last promoted. Arrival order within a band is kept.
    pub fn promote_aged(
        &mut self,
        now: DateTime<Utc>,
        max_wait: ChronoDuration,
    ) -> Vec<(OrchestrationId, Priority)> {
        let due: Vec<QueueKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.priority != Priority::Critical
                    && now - entry.last_promoted_at.unwrap_or(entry.enqueued_at) >= max_wait
            })
            .map(|(key, _)| *key)
            .collect();

        let mut promoted = Vec::with_capacity(due.len());
        for key in due {
            let Some(mut entry) = self.entries.remove(&key) else {
                continue;
            };
            entry.priority = entry.priority.promoted();
            entry.last_promoted_at = Some(now);
            let new_key = (entry.priority.rank(), key.1);
            promoted.push((entry.id(), entry.priority));
            self.keys.insert(entry.id(), new_key);
            self.entries.insert(new_key, entry);
        }
        promoted
    }

    /// Promotes a single entry one band, returning its new priority.
    pub fn promote(&mut self, id: &OrchestrationId, now: DateTime<Utc>) -> Option<Priority> {
        let key = *self.keys.get(id)?;
        let mut entry = self.entries.remove(&key)?;
        entry.priority = entry.priority.promoted();
        entry.last_promoted_at = Some(now);
        let new_key = (entry.priority.rank(), key.1);
        let priority = entry.priority;
        self.keys.insert(*id, new_key);
        self.entries.insert(new_key, entry);
        Some(priority)
    }

    /// Oldest entry waiting on resources, with its age.
    pub fn longest_waiting(&self, now: DateTime<Utc>) -> Option<(OrchestrationId, ChronoDuration)> {
        self.entries
            .values()
            .filter(|entry| entry.waiting_for_resources())
            .map(|entry| (entry.id(), now - entry.enqueued_at))
            .max_by_key(|(_, age)| *age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::planner::DependencyPlanner;
    use crate::orchestration::stage::{StageDefinition, StageType};

    fn entry(priority: Priority, now: DateTime<Utc>) -> PendingQueueEntry {
        let request = OrchestrationRequest::new("queued")
            .with_priority(priority)
            .with_stage(StageDefinition::new("scan", StageType::DataSourceScan));
        let plan = DependencyPlanner::new().plan(&request).unwrap();
        PendingQueueEntry::new(
            Arc::new(request),
            Arc::new(plan),
            ResourceRequirements::new(),
            WaitReason::Resources,
            now,
        )
    }

    #[test]
    fn orders_by_priority_then_arrival() {
        let now = Utc::now();
        let mut queue = PendingQueue::new();
        let low = entry(Priority::Low, now);
        let first_high = entry(Priority::High, now);
        let second_high = entry(Priority::High, now);

        assert_eq!(queue.push(low.clone()), 1);
        assert_eq!(queue.push(first_high.clone()), 1);
        assert_eq!(queue.push(second_high.clone()), 2);
        assert_eq!(
            queue.ids_in_order(),
            vec![first_high.id(), second_high.id(), low.id()]
        );
        assert_eq!(queue.position(&low.id()), Some(3));

        queue.remove(&first_high.id());
        assert_eq!(queue.position(&low.id()), Some(2));
        assert!(!queue.contains(&first_high.id()));
    }

    #[test]
    fn aged_entries_move_up_one_band() {
        let start = Utc::now();
        let mut queue = PendingQueue::new();
        let old_low = entry(Priority::Low, start);
        queue.push(old_low.clone());
        let fresh_medium = entry(Priority::Medium, start + ChronoDuration::seconds(250));
        queue.push(fresh_medium.clone());

        let promoted = queue.promote_aged(
            start + ChronoDuration::seconds(300),
            ChronoDuration::seconds(300),
        );
        assert_eq!(promoted, vec![(old_low.id(), Priority::Medium)]);
        // Same band now; the earlier arrival goes first.
        assert_eq!(queue.ids_in_order(), vec![old_low.id(), fresh_medium.id()]);

        // Promotion restarts the aging clock.
        let again = queue.promote_aged(
            start + ChronoDuration::seconds(310),
            ChronoDuration::seconds(300),
        );
        assert!(again.is_empty());
    }

    #[test]
    fn fair_admission_only_counts_resource_waiters() {
        let now = Utc::now();
        let mut queue = PendingQueue::new();
        let mut parked = entry(Priority::High, now);
        parked.wait = WaitReason::Prerequisites(vec![OrchestrationId::new()]);
        queue.push(parked.clone());
        assert!(!queue.has_resource_waiter_at_or_above(Priority::Medium));

        queue.push(entry(Priority::Medium, now));
        assert!(queue.has_resource_waiter_at_or_above(Priority::Medium));
        assert!(queue.has_resource_waiter_at_or_above(Priority::Low));
        assert!(!queue.has_resource_waiter_at_or_above(Priority::High));
        assert_eq!(queue.waiting_prerequisites().len(), 1);
    }
}
