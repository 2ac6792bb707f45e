//! Executor - drives one timeline to its terminal outcome
//!
//! Walks the operation tree in document order as a tokio task:
//! - Instant operations and stack members settle as soon as their handler
//!   returns
//! - Timed operations hold the main sequence for their declared span and
//!   arm offset branches that run concurrently with it
//! - Flow operations ask their handler which sub-timelines to run, then
//!   run the selected ones concurrently
//!
//! Configuration and handler errors fail the operation and propagate to
//! fail the whole run; offset branches are the sole exception, their
//! failures are logged and swallowed. The run's cancellation token is
//! observed between operations and at every suspension point.

use crate::events::{EngineEvent, EventBus};
use crate::registry::{DurationHint, FlowBranch, HandlerEntry, OperationHandler, OperationRegistry};
use crate::run::{ContextView, Run, RunContext, RunFailure, RunHandle, RunOutcome, RunTicket};
use crate::template::TemplateResolver;
use cuedeck_model::{FlowOp, InstantOp, Operation, OperationStack, SubTimeline, TimedOp, Timeline};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Runs timelines. Cheap to clone per run via the shared `Arc`s inside.
pub struct TimelineExecutor {
    registry: Arc<OperationRegistry>,
    resolver: Arc<dyn TemplateResolver>,
    events: EventBus,
}

impl TimelineExecutor {
    /// Create an executor over a handler registry and template resolver.
    #[must_use]
    pub fn new(
        registry: Arc<OperationRegistry>,
        resolver: Arc<dyn TemplateResolver>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            resolver,
            events,
        }
    }

    /// The event bus runs publish their lifecycle events on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start a run as a detached tokio task and return its control handle.
    pub fn start(&self, timeline: Timeline, run: Run) -> RunHandle {
        let (handle, ticket) = RunHandle::channel(run.id);
        self.start_with_ticket(timeline, run, ticket);
        handle
    }

    /// Start a run whose handle was created earlier (queued runs hand out
    /// their handle at enqueue time).
    pub(crate) fn start_with_ticket(&self, timeline: Timeline, run: Run, ticket: RunTicket) {
        let registry = Arc::clone(&self.registry);
        let resolver = Arc::clone(&self.resolver);
        let events = self.events.clone();
        tokio::spawn(async move {
            drive(timeline, run, ticket, registry, resolver, events).await;
        });
    }
}

/// Everything a run's tasks share: handler lookup, template resolution,
/// the mutable context, the cancellation token, and the branch tasks the
/// run must wait out before settling.
struct RunScope {
    run_id: Uuid,
    registry: Arc<OperationRegistry>,
    resolver: Arc<dyn TemplateResolver>,
    events: EventBus,
    context: RunContext,
    cancel: CancellationToken,
    branches: Mutex<Vec<JoinHandle<()>>>,
}

/// Why a walk stopped before reaching the end of its operation list.
enum Interrupt {
    Failed(RunFailure),
    Cancelled,
}

/// Top-level task body for one run.
async fn drive(
    timeline: Timeline,
    run: Run,
    ticket: RunTicket,
    registry: Arc<OperationRegistry>,
    resolver: Arc<dyn TemplateResolver>,
    events: EventBus,
) {
    let Run {
        id: run_id,
        source,
        context,
    } = run;

    // A handle cancelled while the run was still pending wins outright:
    // the run never starts.
    if ticket.is_cancelled() {
        debug!(run_id = %run_id, "Run cancelled before start");
        events.publish(EngineEvent::RunCancelled { run_id });
        ticket.resolve(RunOutcome::Cancelled);
        return;
    }

    let scope = Arc::new(RunScope {
        run_id,
        registry,
        resolver,
        events,
        context: RunContext::seeded(context),
        cancel: ticket.cancel.clone(),
        branches: Mutex::new(Vec::new()),
    });

    debug!(run_id = %run_id, source = ?source, "Run started");
    scope
        .events
        .publish(EngineEvent::RunStarted { run_id, source });

    let outcome = match run_operations(&scope, &timeline.operations).await {
        Ok(()) => RunOutcome::Completed,
        Err(Interrupt::Failed(failure)) => RunOutcome::Failed(failure),
        Err(Interrupt::Cancelled) => RunOutcome::Cancelled,
    };

    // The run settles only after every offset branch it armed has settled,
    // whatever the main sequence's outcome was.
    drain_branches(&scope).await;

    match &outcome {
        RunOutcome::Completed => {
            debug!(run_id = %run_id, "Run completed");
            scope.events.publish(EngineEvent::RunCompleted { run_id });
        }
        RunOutcome::Failed(failure) => {
            warn!(
                run_id = %run_id,
                operation = %failure.operation,
                error = %failure.message,
                "Run failed"
            );
            scope.events.publish(EngineEvent::RunFailed {
                run_id,
                failure: failure.clone(),
            });
        }
        RunOutcome::Cancelled => {
            debug!(run_id = %run_id, "Run cancelled");
            scope.events.publish(EngineEvent::RunCancelled { run_id });
        }
    }

    ticket.resolve(outcome);
}

/// Wait out every armed branch task, including branches armed by branches
/// while we were waiting.
async fn drain_branches(scope: &RunScope) {
    loop {
        let batch = std::mem::take(&mut *scope.branches.lock().await);
        if batch.is_empty() {
            break;
        }
        for result in join_all(batch).await {
            if let Err(error) = result {
                warn!(run_id = %scope.run_id, %error, "Offset branch task panicked");
            }
        }
    }
}

/// Run an operation list in document order. Boxed so branches and
/// sub-timelines can recurse.
fn run_operations<'a>(
    scope: &'a Arc<RunScope>,
    operations: &'a [Operation],
) -> BoxFuture<'a, Result<(), Interrupt>> {
    async move {
        for operation in operations {
            if scope.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            match operation {
                Operation::Instant(op) => run_leaf(scope, Leaf::from(op)).await?,
                Operation::Stack(stack) => run_stack(scope, stack).await?,
                Operation::Timed(op) => run_timed(scope, op).await?,
                Operation::Flow(op) => run_flow(scope, op).await?,
            }
        }
        Ok(())
    }
    .boxed()
}

/// Borrowed view of an executable leaf, shared by the instant, timed, and
/// stack-member paths.
struct Leaf<'a> {
    id: Uuid,
    namespace: &'a str,
    kind: &'a str,
    config: &'a Value,
    result_mapping: Option<&'a HashMap<String, String>>,
}

impl<'a> From<&'a InstantOp> for Leaf<'a> {
    fn from(op: &'a InstantOp) -> Self {
        Self {
            id: op.id,
            namespace: &op.namespace,
            kind: &op.kind,
            config: &op.config,
            result_mapping: op.result_mapping.as_ref(),
        }
    }
}

impl<'a> From<&'a TimedOp> for Leaf<'a> {
    fn from(op: &'a TimedOp) -> Self {
        Self {
            id: op.id,
            namespace: &op.namespace,
            kind: &op.kind,
            config: &op.config,
            result_mapping: op.result_mapping.as_ref(),
        }
    }
}

/// Log an operation failure, publish it, and wrap it for propagation.
fn operation_failed(scope: &RunScope, failure: RunFailure) -> Interrupt {
    warn!(
        run_id = %scope.run_id,
        operation = %failure.operation,
        namespace = %failure.namespace,
        kind = %failure.kind,
        phase = %failure.failure,
        error = %failure.message,
        "Operation failed"
    );
    scope.events.publish(EngineEvent::OperationFailed {
        run_id: scope.run_id,
        operation_id: failure.operation,
        error: failure.message.clone(),
    });
    Interrupt::Failed(failure)
}

/// Snapshot the context, resolve the authored config against it, and look
/// up the operation handler. Failures here are configuration errors.
async fn prepare(
    scope: &RunScope,
    leaf: &Leaf<'_>,
) -> Result<(Value, Arc<dyn OperationHandler>, ContextView), Interrupt> {
    let view = scope.context.view().await;

    let config = scope
        .resolver
        .resolve(leaf.config, &view)
        .await
        .map_err(|error| {
            operation_failed(
                scope,
                RunFailure::config(leaf.id, leaf.namespace, leaf.kind, error.to_string()),
            )
        })?;

    let handler = match scope.registry.resolve(leaf.namespace, leaf.kind) {
        Some(HandlerEntry::Operation(handler)) => handler,
        Some(HandlerEntry::Flow(_)) => {
            return Err(operation_failed(
                scope,
                RunFailure::config(
                    leaf.id,
                    leaf.namespace,
                    leaf.kind,
                    "registered as a flow handler, not an operation",
                ),
            ));
        }
        None => {
            return Err(operation_failed(
                scope,
                RunFailure::config(leaf.id, leaf.namespace, leaf.kind, "no handler registered"),
            ));
        }
    };

    Ok((config, handler, view))
}

/// Invoke the handler, raced against the run token. A handler error fails
/// the operation.
async fn invoke_leaf(
    scope: &RunScope,
    leaf: &Leaf<'_>,
    handler: &Arc<dyn OperationHandler>,
    config: Value,
    view: &ContextView,
) -> Result<Value, Interrupt> {
    let result = tokio::select! {
        result = handler.invoke(config, view, scope.cancel.child_token()) => result,
        _ = scope.cancel.cancelled() => return Err(Interrupt::Cancelled),
    };

    result.map_err(|error| {
        operation_failed(
            scope,
            RunFailure::handler(leaf.id, leaf.namespace, leaf.kind, format!("{error:#}")),
        )
    })
}

/// Merge declared result fields into the run context. Only object results
/// carry mappable fields; anything else is ignored.
async fn apply_result_mapping(scope: &RunScope, leaf: &Leaf<'_>, result: &Value) {
    let Some(mapping) = leaf.result_mapping else {
        return;
    };
    let Value::Object(fields) = result else {
        return;
    };

    let entries: Vec<(String, Value)> = mapping
        .iter()
        .filter_map(|(field, context_key)| {
            fields
                .get(field)
                .map(|value| (context_key.clone(), value.clone()))
        })
        .collect();
    if !entries.is_empty() {
        scope.context.merge(entries).await;
    }
}

/// Run one instant operation or stack member start to finish.
async fn run_leaf(scope: &Arc<RunScope>, leaf: Leaf<'_>) -> Result<(), Interrupt> {
    debug!(
        run_id = %scope.run_id,
        operation = %leaf.id,
        namespace = leaf.namespace,
        kind = leaf.kind,
        "Operation started"
    );
    scope.events.publish(EngineEvent::OperationStarted {
        run_id: scope.run_id,
        operation_id: leaf.id,
    });

    let (config, handler, view) = prepare(scope, &leaf).await?;
    let result = invoke_leaf(scope, &leaf, &handler, config, &view).await?;
    apply_result_mapping(scope, &leaf, &result).await;

    scope.events.publish(EngineEvent::OperationCompleted {
        run_id: scope.run_id,
        operation_id: leaf.id,
    });
    Ok(())
}

/// Run stack members back-to-back; the first failure stops the stack.
async fn run_stack(scope: &Arc<RunScope>, stack: &OperationStack) -> Result<(), Interrupt> {
    for member in &stack.stack {
        if scope.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        run_leaf(scope, Leaf::from(member)).await?;
    }
    Ok(())
}

/// Run a timed operation: arm its offset branches, invoke its handler, and
/// hold the main sequence for the declared span.
async fn run_timed(scope: &Arc<RunScope>, op: &TimedOp) -> Result<(), Interrupt> {
    let leaf = Leaf::from(op);
    debug!(
        run_id = %scope.run_id,
        operation = %leaf.id,
        namespace = leaf.namespace,
        kind = leaf.kind,
        "Operation started"
    );
    scope.events.publish(EngineEvent::OperationStarted {
        run_id: scope.run_id,
        operation_id: leaf.id,
    });

    let (config, handler, view) = prepare(scope, &leaf).await?;

    // Duration problems are reported, never fatal.
    let hint = match handler.duration(&config).await {
        Ok(hint) => hint,
        Err(error) => {
            warn!(
                run_id = %scope.run_id,
                operation = %leaf.id,
                %error,
                "Duration hint failed, treating operation as indefinite"
            );
            DurationHint::Indefinite
        }
    };

    // Branch delays and the pad timer both measure from here.
    let started = tokio::time::Instant::now();
    arm_offset_branches(scope, op).await;

    let result = invoke_leaf(scope, &leaf, &handler, config, &view).await?;
    apply_result_mapping(scope, &leaf, &result).await;

    // With a definite span the operation settles no earlier than its
    // duration; an early handler return waits out the remainder.
    if let DurationHint::Fixed(seconds) = hint {
        match Duration::try_from_secs_f64(seconds) {
            Ok(span) if !span.is_zero() => {
                if let Some(remaining) = span.checked_sub(started.elapsed()) {
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = scope.cancel.cancelled() => return Err(Interrupt::Cancelled),
                    }
                }
            }
            Ok(_) => {}
            Err(_) => warn!(
                run_id = %scope.run_id,
                operation = %leaf.id,
                seconds,
                "Declared duration outside timer range, settling with the handler"
            ),
        }
    }

    scope.events.publish(EngineEvent::OperationCompleted {
        run_id: scope.run_id,
        operation_id: leaf.id,
    });
    Ok(())
}

/// Arm every offset branch of a timed operation. Branches share the run's
/// context and token; their failures never propagate to the parent, and an
/// offset beyond the timer range is reported and skipped.
async fn arm_offset_branches(scope: &Arc<RunScope>, op: &TimedOp) {
    if op.offsets.is_empty() {
        return;
    }

    let mut branches = scope.branches.lock().await;
    for branch in &op.offsets {
        let offset = branch.offset.max(0.0);
        // Branch tasks are joined before the run settles; a delay the
        // timer cannot represent is dropped rather than parked forever.
        let delay = match Duration::try_from_secs_f64(offset) {
            Ok(delay) => delay,
            Err(_) => {
                warn!(
                    run_id = %scope.run_id,
                    branch = %branch.id,
                    offset_secs = offset,
                    "Branch offset outside timer range, branch skipped"
                );
                continue;
            }
        };
        debug!(
            run_id = %scope.run_id,
            branch = %branch.id,
            offset_secs = offset,
            "Offset branch armed"
        );
        scope.events.publish(EngineEvent::BranchScheduled {
            run_id: scope.run_id,
            branch_id: branch.id,
            offset_secs: offset,
        });

        let task_scope = Arc::clone(scope);
        let branch_id = branch.id;
        let operations = branch.operations.clone();
        branches.push(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = task_scope.cancel.cancelled() => return,
            }
            match run_operations(&task_scope, &operations).await {
                Ok(()) | Err(Interrupt::Cancelled) => {}
                Err(Interrupt::Failed(failure)) => {
                    warn!(
                        run_id = %task_scope.run_id,
                        branch = %branch_id,
                        operation = %failure.operation,
                        error = %failure.message,
                        "Offset branch failed"
                    );
                }
            }
        }));
    }
}

/// Run a flow operation: let its handler pick sub-timelines, then run the
/// selected ones concurrently and wait for all of them.
async fn run_flow(scope: &Arc<RunScope>, op: &FlowOp) -> Result<(), Interrupt> {
    debug!(
        run_id = %scope.run_id,
        operation = %op.id,
        namespace = %op.namespace,
        kind = %op.kind,
        "Operation started"
    );
    scope.events.publish(EngineEvent::OperationStarted {
        run_id: scope.run_id,
        operation_id: op.id,
    });

    let view = scope.context.view().await;

    let config = scope
        .resolver
        .resolve(&op.config, &view)
        .await
        .map_err(|error| {
            operation_failed(
                scope,
                RunFailure::config(op.id, &op.namespace, &op.kind, error.to_string()),
            )
        })?;

    let mut candidates = Vec::with_capacity(op.sub_flows.len());
    for sub_flow in &op.sub_flows {
        let branch_config = scope
            .resolver
            .resolve(&sub_flow.config, &view)
            .await
            .map_err(|error| {
                operation_failed(
                    scope,
                    RunFailure::config(
                        op.id,
                        &op.namespace,
                        &op.kind,
                        format!("sub-timeline {}: {error}", sub_flow.id),
                    ),
                )
            })?;
        candidates.push(FlowBranch {
            id: sub_flow.id,
            name: sub_flow.name.clone(),
            config: branch_config,
        });
    }

    let handler = match scope.registry.resolve(&op.namespace, &op.kind) {
        Some(HandlerEntry::Flow(handler)) => handler,
        Some(HandlerEntry::Operation(_)) => {
            return Err(operation_failed(
                scope,
                RunFailure::config(
                    op.id,
                    &op.namespace,
                    &op.kind,
                    "registered as an operation handler, not a flow",
                ),
            ));
        }
        None => {
            return Err(operation_failed(
                scope,
                RunFailure::config(op.id, &op.namespace, &op.kind, "no handler registered"),
            ));
        }
    };

    let selection = tokio::select! {
        result = handler.select(config, &candidates, &view, scope.cancel.child_token()) => result,
        _ = scope.cancel.cancelled() => return Err(Interrupt::Cancelled),
    };
    let selected = selection.map_err(|error| {
        operation_failed(
            scope,
            RunFailure::handler(op.id, &op.namespace, &op.kind, format!("{error:#}")),
        )
    })?;

    // Unknown ids in the selection are skipped, not fatal.
    let mut targets: Vec<&SubTimeline> = Vec::with_capacity(selected.len());
    for id in &selected {
        match op.sub_flows.iter().find(|sub_flow| sub_flow.id == *id) {
            Some(sub_flow) => targets.push(sub_flow),
            None => warn!(
                run_id = %scope.run_id,
                operation = %op.id,
                sub_flow = %id,
                "Flow handler selected an unknown sub-timeline"
            ),
        }
    }

    let joined = join_all(
        targets
            .iter()
            .map(|sub_flow| run_operations(scope, &sub_flow.operations)),
    );
    let results = tokio::select! {
        results = joined => results,
        _ = scope.cancel.cancelled() => return Err(Interrupt::Cancelled),
    };
    for result in results {
        result?;
    }

    scope.events.publish(EngineEvent::OperationCompleted {
        run_id: scope.run_id,
        operation_id: op.id,
    });
    Ok(())
}
