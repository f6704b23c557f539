// Event system for chain execution

//! # Event System
//!
//! The orchestrator publishes a [`ChainEvent`] at every execution and step
//! boundary. Hosts subscribe to drive progress displays, audit logs or
//! follow-up automation. Publishing never fails: with no subscribers the event
//! is simply dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::models::{AgentKind, ExecutionStatus};

/// Lifecycle events of a chain execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChainEvent {
    ExecutionStarted {
        execution_id: Uuid,
        chain_id: String,
        total_steps: usize,
        at: DateTime<Utc>,
    },
    StepStarted {
        execution_id: Uuid,
        step_number: u32,
        agent_kind: AgentKind,
        attempt: u32,
    },
    StepCompleted {
        execution_id: Uuid,
        step_number: u32,
        agent_kind: AgentKind,
        execution_time_ms: u64,
        cost: f64,
    },
    StepSkipped {
        execution_id: Uuid,
        step_number: u32,
        reason: String,
    },
    StepFailed {
        execution_id: Uuid,
        step_number: u32,
        agent_kind: AgentKind,
        error: String,
        recoverable: bool,
    },
    HandoffCreated {
        execution_id: Uuid,
        handoff_id: Uuid,
        from_step: u32,
        to_step: u32,
        payload_bytes: usize,
    },
    ExecutionFinished {
        execution_id: Uuid,
        status: ExecutionStatus,
        success: bool,
        total_time_ms: u64,
        at: DateTime<Utc>,
    },
}

impl ChainEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            ChainEvent::ExecutionStarted { execution_id, .. }
            | ChainEvent::StepStarted { execution_id, .. }
            | ChainEvent::StepCompleted { execution_id, .. }
            | ChainEvent::StepSkipped { execution_id, .. }
            | ChainEvent::StepFailed { execution_id, .. }
            | ChainEvent::HandoffCreated { execution_id, .. }
            | ChainEvent::ExecutionFinished { execution_id, .. } => *execution_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::ExecutionStarted { .. } => "execution_started",
            ChainEvent::StepStarted { .. } => "step_started",
            ChainEvent::StepCompleted { .. } => "step_completed",
            ChainEvent::StepSkipped { .. } => "step_skipped",
            ChainEvent::StepFailed { .. } => "step_failed",
            ChainEvent::HandoffCreated { .. } => "handoff_created",
            ChainEvent::ExecutionFinished { .. } => "execution_finished",
        }
    }
}

/// Event bus for publishing and subscribing to chain events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChainEvent>,
}

impl EventBus {
    /// Create a new event bus buffering up to 1000 events per slow subscriber
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: ChainEvent) {
        trace!(event = event.name(), execution_id = %event.execution_id(), "chain event");
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChainEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(ChainEvent::StepSkipped {
            execution_id: Uuid::new_v4(),
            step_number: 1,
            reason: "condition false".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish(ChainEvent::ExecutionStarted {
            execution_id: id,
            chain_id: "c".to_string(),
            total_steps: 1,
            at: Utc::now(),
        });
        bus.publish(ChainEvent::ExecutionFinished {
            execution_id: id,
            status: ExecutionStatus::Completed,
            success: true,
            total_time_ms: 5,
            at: Utc::now(),
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name(), "execution_started");
        assert_eq!(first.execution_id(), id);
        assert!(matches!(rx.recv().await.unwrap(), ChainEvent::ExecutionFinished { success: true, .. }));
    }
}
