use async_trait::async_trait;
use std::fmt;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::orchestration::events::{OrchestrationEvent, OrchestrationEventPublisher};

/// In-process fan-out of orchestration events. Slow subscribers lag and lose
/// the oldest events rather than blocking the coordinator.
pub struct InProcEventBus {
    sender: broadcast::Sender<OrchestrationEvent>,
    channel_capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("channel_capacity", &self.channel_capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            channel_capacity: capacity,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl OrchestrationEventPublisher for InProcEventBus {
    async fn publish(&self, event: OrchestrationEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Lets generic hosts subscribe without naming the concrete bus.
pub trait OrchestrationEventStream {
    fn subscribe_events(&self) -> broadcast::Receiver<OrchestrationEvent>;
}

impl OrchestrationEventStream for InProcEventBus {
    fn subscribe_events(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.subscribe()
    }
}
