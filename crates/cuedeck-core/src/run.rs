//! Run - identity, shared context, outcome, and control handle of one
//! timeline execution
//!
//! A run is created by the dispatcher, optionally parked in a queue, then
//! driven by the executor. The [`RunHandle`] returned at dispatch time is
//! the caller's only control surface: cancel (idempotent, valid before the
//! run ever starts) and wait for the terminal outcome.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Who or what started a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunSource {
    /// Started by hand from the editor or control surface.
    Manual,
    /// Started by a trigger rule.
    Trigger {
        /// Name of the trigger that fired.
        name: String,
    },
    /// Started through the external API.
    Api {
        /// Identifier of the API client.
        client: String,
    },
    /// Started as an editor test run.
    Test,
}

/// One execution of a timeline.
#[derive(Debug, Clone)]
pub struct Run {
    /// Unique id, fresh per dispatch.
    pub id: Uuid,

    /// Origin of the run.
    pub source: RunSource,

    /// Seed values for the shared run context.
    pub context: HashMap<String, Value>,
}

impl Run {
    /// Create a run with a fresh id and an empty context.
    #[must_use]
    pub fn new(source: RunSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            context: HashMap::new(),
        }
    }

    /// Seed the run context.
    #[must_use]
    pub fn with_context(mut self, context: HashMap<String, Value>) -> Self {
        self.context = context;
        self
    }
}

/// Mutable state shared by every operation of a run.
///
/// Handlers read a [`ContextView`] snapshot taken at invoke time; declared
/// result mappings merge handler results back in. Concurrent writers are
/// last-writer-wins, key by key.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    values: Arc<RwLock<HashMap<String, Value>>>,
}

impl RunContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context pre-populated with seed values.
    #[must_use]
    pub fn seeded(seed: HashMap<String, Value>) -> Self {
        Self {
            values: Arc::new(RwLock::new(seed)),
        }
    }

    /// Snapshot the current state.
    pub async fn view(&self) -> ContextView {
        ContextView {
            values: self.values.read().await.clone(),
        }
    }

    /// Set a single key.
    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.values.write().await.insert(key.into(), value);
    }

    /// Merge a batch of entries under one write lock.
    pub async fn merge<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut values = self.values.write().await;
        for (key, value) in entries {
            values.insert(key, value);
        }
    }
}

/// Immutable snapshot of a run context, handed to handlers and the
/// template resolver.
#[derive(Debug, Clone, Default)]
pub struct ContextView {
    values: HashMap<String, Value>,
}

impl ContextView {
    /// Value of a top-level key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Value at a dotted path, descending through objects by key and
    /// arrays by numeric index: `viewer.badges.0`.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.values.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl From<HashMap<String, Value>> for ContextView {
    fn from(values: HashMap<String, Value>) -> Self {
        Self { values }
    }
}

/// Why an operation failed, for history and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Template resolution or handler lookup failed before invocation.
    Config,
    /// The handler itself returned an error.
    Handler,
}

impl FailureKind {
    /// String label of the failure kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Handler => "handler",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Details of the operation that failed a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Id of the failing operation.
    pub operation: Uuid,

    /// Handler namespace of the failing operation.
    pub namespace: String,

    /// Handler name of the failing operation.
    pub kind: String,

    /// Which phase failed.
    pub failure: FailureKind,

    /// Human-readable error description.
    pub message: String,
}

impl RunFailure {
    /// A pre-invocation configuration failure.
    #[must_use]
    pub fn config(
        operation: Uuid,
        namespace: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            namespace: namespace.into(),
            kind: kind.into(),
            failure: FailureKind::Config,
            message: message.into(),
        }
    }

    /// A handler execution failure.
    #[must_use]
    pub fn handler(
        operation: Uuid,
        namespace: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            namespace: namespace.into(),
            kind: kind.into(),
            failure: FailureKind::Handler,
            message: message.into(),
        }
    }
}

/// Terminal state of a run.
///
/// Cancellation is a state, not an error: a cancelled run is never
/// reported as failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every operation completed.
    Completed,
    /// An operation failed and the failure propagated to the run.
    Failed(RunFailure),
    /// The run's cancellation token fired before completion.
    Cancelled,
}

impl RunOutcome {
    /// String label of the outcome.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// History entry for a settled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run id.
    pub run_id: Uuid,

    /// Origin of the run.
    pub source: RunSource,

    /// Terminal outcome.
    pub outcome: RunOutcome,

    /// When the run entered its queue.
    pub queued_at: chrono::DateTime<chrono::Utc>,

    /// When execution began. `None` when the run was cancelled while
    /// still pending.
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,

    /// When the run settled.
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

/// Clonable control surface for one run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl RunHandle {
    /// Create a handle and its executor-side ticket.
    pub(crate) fn channel(run_id: Uuid) -> (Self, RunTicket) {
        let cancel = CancellationToken::new();
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = Self {
            run_id,
            cancel: cancel.clone(),
            outcome: outcome_rx,
        };
        let ticket = RunTicket {
            cancel,
            outcome: outcome_tx,
        };
        (handle, ticket)
    }

    /// Id of the run this handle controls.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation. Idempotent; firing before the run starts
    /// prevents it from ever starting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The terminal outcome, if the run has already settled.
    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the run to settle. Multiple waiters are fine.
    ///
    /// Resolves `Cancelled` if the engine is dropped before the run
    /// settles.
    pub async fn wait(&self) -> RunOutcome {
        let mut rx = self.outcome.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return RunOutcome::Cancelled;
            }
        }
    }
}

/// Executor-side counterpart of a [`RunHandle`]: the cancellation token
/// the run observes plus the slot its outcome is published into.
#[derive(Debug)]
pub(crate) struct RunTicket {
    pub(crate) cancel: CancellationToken,
    outcome: watch::Sender<Option<RunOutcome>>,
}

impl RunTicket {
    /// Whether the paired handle requested cancellation.
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish the terminal outcome to every waiting handle.
    pub(crate) fn resolve(self, outcome: RunOutcome) {
        let _ = self.outcome.send(Some(outcome));
    }
}
