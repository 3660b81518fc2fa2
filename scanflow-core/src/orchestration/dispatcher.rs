use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::stage::{StageDefinition, StageOutcome, StageType};
use crate::error::Result;
use crate::types::ids::OrchestrationId;

/// Everything a handler receives for one attempt.
#[derive(Clone, Debug)]
pub struct StageInvocation {
    pub orchestration_id: OrchestrationId,
    pub stage: StageDefinition,
    pub data_source_ids: Vec<String>,
    pub rule_ids: Vec<String>,
    /// 1-based.
    pub attempt: u32,
    /// Fires on cancellation or timeout; long-running handlers should poll it.
    pub cancel: CancellationToken,
}

/// Performs the domain work behind one stage type.
///
/// An `Err` is treated like a failed [`StageOutcome`] carrying the error text.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage_type(&self) -> StageType;

    async fn execute(&self, invocation: StageInvocation) -> Result<StageOutcome>;
}

/// Maps stage types to their handlers.
#[derive(Clone, Default)]
pub struct StageHandlerRegistry {
    handlers: HashMap<StageType, Arc<dyn StageHandler>>,
}

impl fmt::Debug for StageHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().collect();
        kinds.sort();
        f.debug_struct("StageHandlerRegistry")
            .field("stage_types", &kinds)
            .finish()
    }
}

impl StageHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers under the handler's own stage type, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn StageHandler>) -> &mut Self {
        self.handlers.insert(handler.stage_type(), handler);
        self
    }

    /// Registers one handler for several stage types.
    pub fn register_for(&mut self, stage_type: StageType, handler: Arc<dyn StageHandler>) -> &mut Self {
        self.handlers.insert(stage_type, handler);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, stage_type: StageType) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage_type).cloned()
    }

    pub fn supports(&self, stage_type: StageType) -> bool {
        self.handlers.contains_key(&stage_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
