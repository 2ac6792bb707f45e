//! Events - broadcast-based engine event stream
//!
//! Publishes run and operation lifecycle events so editor overlays, debug
//! panels, and internal subscribers can follow execution in real time.

use crate::run::{RunFailure, RunSource};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted while the engine executes runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A run began executing.
    RunStarted {
        /// Run identifier
        run_id: Uuid,
        /// Origin of the run
        source: RunSource,
    },
    /// An operation began executing.
    OperationStarted {
        /// Run identifier
        run_id: Uuid,
        /// Operation id within the timeline
        operation_id: Uuid,
    },
    /// An operation settled successfully.
    OperationCompleted {
        /// Run identifier
        run_id: Uuid,
        /// Operation id within the timeline
        operation_id: Uuid,
    },
    /// An operation failed.
    OperationFailed {
        /// Run identifier
        run_id: Uuid,
        /// Operation id within the timeline
        operation_id: Uuid,
        /// Error description
        error: String,
    },
    /// An offset branch was armed relative to its timed operation.
    BranchScheduled {
        /// Run identifier
        run_id: Uuid,
        /// Offset branch id
        branch_id: Uuid,
        /// Seconds after the parent operation began
        offset_secs: f64,
    },
    /// The run settled successfully.
    RunCompleted {
        /// Run identifier
        run_id: Uuid,
    },
    /// The run settled with a failure.
    RunFailed {
        /// Run identifier
        run_id: Uuid,
        /// The operation failure that sank the run
        failure: RunFailure,
    },
    /// The run was cancelled.
    RunCancelled {
        /// Run identifier
        run_id: Uuid,
    },
}

impl EngineEvent {
    /// Get the run id from any event variant.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::OperationStarted { run_id, .. }
            | Self::OperationCompleted { run_id, .. }
            | Self::OperationFailed { run_id, .. }
            | Self::BranchScheduled { run_id, .. }
            | Self::RunCompleted { run_id }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id } => *run_id,
        }
    }
}

/// Broadcast-based event bus for engine events.
///
/// Uses `tokio::broadcast` so multiple subscribers receive the same
/// events. Slow subscribers miss events (lagged) rather than blocking the
/// engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new EventBus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events. Returns a receiver that will get all future
    /// events; each subscriber gets an independent copy.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all active subscribers.
    ///
    /// Returns the number of subscribers that received the event. With no
    /// subscribers the event is silently dropped.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Current number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
