//! Run queue - named FIFO lanes with pause, cancellation, and history
//!
//! A queue runs at most one run at a time and promotes strictly in FIFO
//! order. Settled runs move to a bounded history, most recent first.
//! Pausing withholds promotion without touching the active run.

use crate::error::{Error, Result};
use crate::executor::TimelineExecutor;
use crate::run::{Run, RunHandle, RunOutcome, RunRecord, RunSource, RunTicket};
use chrono::{DateTime, Utc};
use cuedeck_model::Timeline;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Configuration of one run queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name, unique within a manager.
    pub name: String,

    /// Start in the paused state.
    #[serde(default)]
    pub paused: bool,

    /// How many settled runs the history keeps.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    64
}

impl QueueConfig {
    /// Create a configuration with default history and pause settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            paused: false,
            history_limit: default_history_limit(),
        }
    }

    /// Start the queue paused.
    #[must_use]
    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Set the history bound.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

/// A run waiting for its turn.
struct PendingRun {
    timeline: Timeline,
    run: Run,
    ticket: RunTicket,
    handle: RunHandle,
    queued_at: DateTime<Utc>,
}

/// The run a queue currently has in flight.
struct ActiveRun {
    run_id: Uuid,
    source: RunSource,
    handle: RunHandle,
    queued_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
}

/// Everything that changes together, under one lock.
struct QueueState {
    paused: bool,
    running: Option<ActiveRun>,
    pending: VecDeque<PendingRun>,
    history: VecDeque<RunRecord>,
}

/// Point-in-time view of a queue, for UIs and persistence.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    /// Queue name.
    pub name: String,
    /// Whether promotion is withheld.
    pub paused: bool,
    /// The run in flight, if any.
    pub running: Option<RunningSnapshot>,
    /// Pending runs in promotion order. Serialized as `queue`.
    #[serde(rename = "queue")]
    pub pending: Vec<PendingSnapshot>,
    /// Settled runs, most recent first.
    pub history: Vec<RunRecord>,
}

/// Snapshot of the active run.
#[derive(Debug, Clone, Serialize)]
pub struct RunningSnapshot {
    /// Run id.
    pub run_id: Uuid,
    /// Origin of the run.
    pub source: RunSource,
    /// When the run entered the queue.
    pub queued_at: DateTime<Utc>,
    /// When execution began.
    pub started_at: DateTime<Utc>,
}

/// Snapshot of one pending run.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSnapshot {
    /// Run id.
    pub run_id: Uuid,
    /// Origin of the run.
    pub source: RunSource,
    /// When the run entered the queue.
    pub queued_at: DateTime<Utc>,
}

/// A named FIFO lane over the executor.
pub struct RunQueue {
    name: String,
    history_limit: usize,
    executor: Arc<TimelineExecutor>,
    state: Mutex<QueueState>,
}

impl RunQueue {
    pub(crate) fn new(config: QueueConfig, executor: Arc<TimelineExecutor>) -> Arc<Self> {
        Arc::new(Self {
            name: config.name,
            history_limit: config.history_limit,
            executor,
            state: Mutex::new(QueueState {
                paused: config.paused,
                running: None,
                pending: VecDeque::new(),
                history: VecDeque::new(),
            }),
        })
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Park a run at the tail; an idle unpaused queue starts it
    /// immediately.
    pub async fn enqueue(self: &Arc<Self>, timeline: Timeline, run: Run) -> RunHandle {
        let (handle, ticket) = RunHandle::channel(run.id);
        let pending = PendingRun {
            timeline,
            run,
            ticket,
            handle: handle.clone(),
            queued_at: Utc::now(),
        };

        let mut state = self.state.lock().await;
        debug!(
            queue = %self.name,
            run_id = %handle.id(),
            position = state.pending.len(),
            "Run enqueued"
        );
        state.pending.push_back(pending);
        if !state.paused && state.running.is_none() {
            self.promote(&mut state);
        }
        handle
    }

    /// Withhold promotion. The active run, if any, keeps going.
    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        state.paused = true;
        debug!(queue = %self.name, "Queue paused");
    }

    /// Resume promotion; an idle queue with pending runs starts the next
    /// one immediately.
    pub async fn resume(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        state.paused = false;
        debug!(queue = %self.name, "Queue resumed");
        if state.running.is_none() {
            self.promote(&mut state);
        }
    }

    /// Cancel the active run, if any. The run still settles into history
    /// and promotion continues as usual.
    pub async fn cancel_current(&self) -> bool {
        let state = self.state.lock().await;
        match &state.running {
            Some(active) => {
                debug!(queue = %self.name, run_id = %active.run_id, "Cancelling active run");
                active.handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Point-in-time view of the queue.
    pub async fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock().await;
        QueueSnapshot {
            name: self.name.clone(),
            paused: state.paused,
            running: state.running.as_ref().map(|active| RunningSnapshot {
                run_id: active.run_id,
                source: active.source.clone(),
                queued_at: active.queued_at,
                started_at: active.started_at,
            }),
            pending: state
                .pending
                .iter()
                .map(|pending| PendingSnapshot {
                    run_id: pending.run.id,
                    source: pending.run.source.clone(),
                    queued_at: pending.queued_at,
                })
                .collect(),
            history: state.history.iter().cloned().collect(),
        }
    }

    /// Cancel the active run and discard every pending run, resolving
    /// their handles as cancelled.
    pub(crate) async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(active) = &state.running {
            active.handle.cancel();
        }
        for pending in state.pending.drain(..) {
            pending.ticket.resolve(RunOutcome::Cancelled);
        }
    }

    /// Start the first pending run whose handle is still live. Caller
    /// holds the state lock.
    fn promote(self: &Arc<Self>, state: &mut QueueState) {
        while let Some(next) = state.pending.pop_front() {
            // A handle cancelled while pending goes straight to history;
            // the run never starts.
            if next.ticket.is_cancelled() {
                debug!(
                    queue = %self.name,
                    run_id = %next.run.id,
                    "Pending run cancelled before start"
                );
                push_history(
                    state,
                    self.history_limit,
                    RunRecord {
                        run_id: next.run.id,
                        source: next.run.source.clone(),
                        outcome: RunOutcome::Cancelled,
                        queued_at: next.queued_at,
                        started_at: None,
                        finished_at: Utc::now(),
                    },
                );
                next.ticket.resolve(RunOutcome::Cancelled);
                continue;
            }

            let active = ActiveRun {
                run_id: next.run.id,
                source: next.run.source.clone(),
                handle: next.handle.clone(),
                queued_at: next.queued_at,
                started_at: Utc::now(),
            };
            debug!(queue = %self.name, run_id = %active.run_id, "Run promoted");
            self.executor
                .start_with_ticket(next.timeline, next.run, next.ticket);

            let queue = Arc::clone(self);
            let watcher = active.handle.clone();
            state.running = Some(active);
            tokio::spawn(async move {
                let outcome = watcher.wait().await;
                queue.run_finished(watcher.id(), outcome).await;
            });
            return;
        }
    }

    /// Move the settled run to history, then promote the next unless
    /// paused. Promotion proceeds whatever the outcome was.
    async fn run_finished(self: &Arc<Self>, run_id: Uuid, outcome: RunOutcome) {
        let mut state = self.state.lock().await;

        let finished = match state.running.take() {
            Some(active) if active.run_id == run_id => active,
            other => {
                // Stale watcher callback after a delete or replacement.
                state.running = other;
                return;
            }
        };

        debug!(queue = %self.name, run_id = %run_id, outcome = %outcome, "Run settled");
        push_history(
            &mut state,
            self.history_limit,
            RunRecord {
                run_id,
                source: finished.source,
                outcome,
                queued_at: finished.queued_at,
                started_at: Some(finished.started_at),
                finished_at: Utc::now(),
            },
        );

        if !state.paused {
            self.promote(&mut state);
        }
    }
}

/// Insert at the head (most recent first) and evict beyond the limit.
fn push_history(state: &mut QueueState, limit: usize, record: RunRecord) {
    state.history.push_front(record);
    state.history.truncate(limit);
}

/// Named queues over one executor.
pub struct QueueManager {
    executor: Arc<TimelineExecutor>,
    queues: DashMap<String, Arc<RunQueue>>,
}

impl QueueManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(executor: Arc<TimelineExecutor>) -> Self {
        Self {
            executor,
            queues: DashMap::new(),
        }
    }

    /// Create a queue. Errors if the name is taken.
    pub fn create(&self, config: QueueConfig) -> Result<Arc<RunQueue>> {
        let name = config.name.clone();
        match self.queues.entry(name.clone()) {
            Entry::Occupied(_) => Err(Error::QueueExists(name)),
            Entry::Vacant(slot) => {
                debug!(queue = %name, "Queue created");
                let queue = RunQueue::new(config, Arc::clone(&self.executor));
                slot.insert(Arc::clone(&queue));
                Ok(queue)
            }
        }
    }

    /// Look up a queue by name.
    pub fn get(&self, name: &str) -> Result<Arc<RunQueue>> {
        self.queues
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))
    }

    /// Delete a queue: its active run is cancelled and its pending runs
    /// settle as cancelled.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let (_, queue) = self
            .queues
            .remove(name)
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))?;
        queue.shutdown().await;
        debug!(queue = %name, "Queue deleted");
        Ok(())
    }

    /// Names of every queue, in no particular order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Enqueue a run on the named queue.
    pub async fn enqueue(&self, name: &str, timeline: Timeline, run: Run) -> Result<RunHandle> {
        Ok(self.get(name)?.enqueue(timeline, run).await)
    }

    /// Pause the named queue.
    pub async fn pause(&self, name: &str) -> Result<()> {
        self.get(name)?.pause().await;
        Ok(())
    }

    /// Resume the named queue.
    pub async fn resume(&self, name: &str) -> Result<()> {
        self.get(name)?.resume().await;
        Ok(())
    }

    /// Cancel the named queue's active run.
    pub async fn cancel_current(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.cancel_current().await)
    }

    /// Snapshot the named queue.
    pub async fn snapshot(&self, name: &str) -> Result<QueueSnapshot> {
        Ok(self.get(name)?.snapshot().await)
    }
}
