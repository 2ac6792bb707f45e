//! Cuedeck Core - Automation Engine
//!
//! This crate provides the execution side of Cuedeck's timeline
//! automations, including:
//! - Registry: handler registration under `(namespace, kind)` keys
//! - Executor: runs timeline trees with offset branches and flows
//! - Queue: named FIFO run queues with pause, resume, and history
//! - Dispatch: the single entry point triggers and APIs start runs through
//! - Events: broadcast stream of run and operation lifecycle events
//! - Import: legacy flat operation list conversion
//!
//! The document model itself lives in `cuedeck-model`; this crate only
//! executes it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod import;
pub mod queue;
pub mod registry;
pub mod run;
pub mod template;

pub use dispatch::{Dispatcher, StartOptions};
pub use error::{Error, Result};
pub use events::{EngineEvent, EventBus};
pub use executor::TimelineExecutor;
pub use import::{import_legacy, ImportOptions, LegacyEntry};
pub use queue::{
    PendingSnapshot, QueueConfig, QueueManager, QueueSnapshot, RunQueue, RunningSnapshot,
};
pub use registry::{
    DurationHint, FlowBranch, FlowHandler, HandlerEntry, OperationHandler, OperationRegistry,
};
pub use run::{
    ContextView, FailureKind, Run, RunContext, RunFailure, RunHandle, RunOutcome, RunRecord,
    RunSource,
};
pub use template::{MustacheLiteResolver, PassthroughResolver, TemplateError, TemplateResolver};
