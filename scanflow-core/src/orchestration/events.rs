use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::master::OrchestrationStatus;
use super::monitor::Recommendation;
use super::request::Priority;
use super::resources::ResourceRequirements;
use super::stage::StageType;
use crate::error::{Result, ValidationError};
use crate::types::ids::{OrchestrationId, SessionId};

/// Metadata envelope attached to every orchestration event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: Uuid,
    pub emitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestration_id: Option<OrchestrationId>,
}

impl EventMeta {
    pub fn new(correlation_id: Option<Uuid>, orchestration_id: Option<OrchestrationId>) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            emitted_at: Utc::now(),
            orchestration_id,
        }
    }
}

/// Lifecycle transitions published by the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OrchestrationEventPayload {
    Submitted {
        orchestration_id: OrchestrationId,
        priority: Priority,
        stages: usize,
    },
    Rejected {
        orchestration_id: OrchestrationId,
        reason: ValidationError,
    },
    Queued {
        orchestration_id: OrchestrationId,
        position: usize,
    },
    Admitted {
        orchestration_id: OrchestrationId,
        session_id: SessionId,
        resources: ResourceRequirements,
    },
    Planned {
        orchestration_id: OrchestrationId,
        order: Vec<String>,
        critical_path_secs: u64,
    },
    StageStarted {
        orchestration_id: OrchestrationId,
        stage_id: String,
        stage_type: StageType,
        attempt: u32,
    },
    StageCompleted {
        orchestration_id: OrchestrationId,
        stage_id: String,
        duration_ms: u64,
    },
    StageFailed {
        orchestration_id: OrchestrationId,
        stage_id: String,
        critical: bool,
        errors: Vec<String>,
    },
    StageSkipped {
        orchestration_id: OrchestrationId,
        stage_id: String,
        reason: String,
    },
    Terminal {
        orchestration_id: OrchestrationId,
        status: OrchestrationStatus,
        success_rate: Option<f64>,
        resources_released: ResourceRequirements,
    },
    OptimizationProposed {
        recommendations: Vec<Recommendation>,
        applied: bool,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub meta: EventMeta,
    pub payload: OrchestrationEventPayload,
}

impl OrchestrationEvent {
    pub fn new(
        correlation_id: Option<Uuid>,
        orchestration_id: Option<OrchestrationId>,
        payload: OrchestrationEventPayload,
    ) -> Self {
        Self {
            meta: EventMeta::new(correlation_id, orchestration_id),
            payload,
        }
    }
}

#[async_trait]
pub trait OrchestrationEventPublisher: Send + Sync {
    async fn publish(&self, event: OrchestrationEvent) -> Result<()>;
}
