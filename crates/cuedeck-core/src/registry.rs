//! Registry - operation handler registration and lookup
//!
//! Concrete operation implementations live in plugins outside this crate;
//! the engine sees them only through this registry. A handler is keyed by
//! `(namespace, kind)` — typically plugin name plus operation name.
//!
//! The registry is built once at start-up and passed by `Arc`; there is no
//! ambient global.

use crate::error::{Error, Result};
use crate::run::ContextView;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// How long an operation occupies its timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DurationHint {
    /// No time span; the timeline advances as soon as the handler settles.
    Instant,
    /// A definite span in seconds. The operation settles no earlier than
    /// this, even when the handler returns sooner.
    Fixed(f64),
    /// Spans time, but only the handler knows how much; the timeline
    /// advances when the handler settles, with no separate timer.
    Indefinite,
}

/// A regular operation implementation.
#[async_trait::async_trait]
pub trait OperationHandler: Send + Sync {
    /// Execute the operation.
    ///
    /// `config` arrives fully resolved. `abort` fires when the run is
    /// cancelled; handlers that take time are expected to observe it.
    async fn invoke(
        &self,
        config: Value,
        ctx: &ContextView,
        abort: CancellationToken,
    ) -> anyhow::Result<Value>;

    /// How long the operation will occupy the timeline for `config`.
    async fn duration(&self, _config: &Value) -> anyhow::Result<DurationHint> {
        Ok(DurationHint::Instant)
    }
}

/// Metadata of one selectable sub-timeline, handed to a flow handler with
/// its config already resolved.
#[derive(Debug, Clone)]
pub struct FlowBranch {
    /// Sub-timeline id, the value to return from [`FlowHandler::select`].
    pub id: Uuid,

    /// Editor-facing label, if set.
    pub name: Option<String>,

    /// Resolved branch configuration.
    pub config: Value,
}

/// A flow operation implementation: picks which sub-timelines run.
#[async_trait::async_trait]
pub trait FlowHandler: Send + Sync {
    /// Choose the sub-timelines to execute, by id.
    ///
    /// Any subset of `branches` is valid, including none. The executor
    /// runs the selected sub-timelines concurrently and advances when all
    /// of them settle.
    async fn select(
        &self,
        config: Value,
        branches: &[FlowBranch],
        ctx: &ContextView,
        abort: CancellationToken,
    ) -> anyhow::Result<Vec<Uuid>>;
}

/// A registered handler, regular or flow.
#[derive(Clone)]
pub enum HandlerEntry {
    /// Regular operation handler.
    Operation(Arc<dyn OperationHandler>),
    /// Flow operation handler.
    Flow(Arc<dyn FlowHandler>),
}

/// Registry mapping `(namespace, kind)` to handlers.
#[derive(Default)]
pub struct OperationRegistry {
    handlers: HashMap<String, HashMap<String, HandlerEntry>>,
}

impl OperationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a regular operation handler.
    ///
    /// Errors if `(namespace, kind)` is already taken.
    pub fn register(
        &mut self,
        namespace: impl Into<String>,
        kind: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> Result<()> {
        self.insert(namespace.into(), kind.into(), HandlerEntry::Operation(handler))
    }

    /// Register a flow operation handler.
    ///
    /// Errors if `(namespace, kind)` is already taken.
    pub fn register_flow(
        &mut self,
        namespace: impl Into<String>,
        kind: impl Into<String>,
        handler: Arc<dyn FlowHandler>,
    ) -> Result<()> {
        self.insert(namespace.into(), kind.into(), HandlerEntry::Flow(handler))
    }

    fn insert(&mut self, namespace: String, kind: String, entry: HandlerEntry) -> Result<()> {
        let kinds = self.handlers.entry(namespace.clone()).or_default();
        if kinds.contains_key(&kind) {
            return Err(Error::DuplicateHandler { namespace, kind });
        }
        debug!(namespace = %namespace, kind = %kind, "Registering operation handler");
        kinds.insert(kind, entry);
        Ok(())
    }

    /// Look up the handler registered under `(namespace, kind)`.
    #[must_use]
    pub fn resolve(&self, namespace: &str, kind: &str) -> Option<HandlerEntry> {
        self.handlers.get(namespace)?.get(kind).cloned()
    }

    /// Whether `(namespace, kind)` is registered.
    #[must_use]
    pub fn contains(&self, namespace: &str, kind: &str) -> bool {
        self.handlers
            .get(namespace)
            .is_some_and(|kinds| kinds.contains_key(kind))
    }

    /// All registered `(namespace, kind)` pairs.
    #[must_use]
    pub fn names(&self) -> Vec<(&str, &str)> {
        self.handlers
            .iter()
            .flat_map(|(namespace, kinds)| {
                kinds.keys().map(move |kind| (namespace.as_str(), kind.as_str()))
            })
            .collect()
    }
}
