//! Dispatch - the front door trigger logic and control surfaces start
//! runs through
//!
//! The dispatcher does no scheduling of its own: unqueued runs go
//! straight to the executor and run concurrently with everything else;
//! queued runs are parked on a named run queue. It also retains handles
//! of unqueued runs so embedders can stop ad-hoc runs by id.

use crate::error::Result;
use crate::executor::TimelineExecutor;
use crate::queue::QueueManager;
use crate::run::{Run, RunHandle, RunSource};
use cuedeck_model::Timeline;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// How a run should be started.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Queue to park the run on; `None` starts it immediately.
    pub queue: Option<String>,

    /// Origin recorded on the run.
    pub source: RunSource,

    /// Seed values for the run context.
    pub context: HashMap<String, Value>,
}

impl StartOptions {
    /// Unqueued start with an empty context seed.
    #[must_use]
    pub fn new(source: RunSource) -> Self {
        Self {
            queue: None,
            source,
            context: HashMap::new(),
        }
    }

    /// Park the run on the named queue.
    #[must_use]
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Seed the run context.
    #[must_use]
    pub fn with_context(mut self, context: HashMap<String, Value>) -> Self {
        self.context = context;
        self
    }
}

/// The engine's sole entry point for starting runs.
pub struct Dispatcher {
    executor: Arc<TimelineExecutor>,
    queues: Arc<QueueManager>,
    active: Arc<DashMap<Uuid, RunHandle>>,
}

impl Dispatcher {
    /// Create a dispatcher over an executor and its queues.
    #[must_use]
    pub fn new(executor: Arc<TimelineExecutor>, queues: Arc<QueueManager>) -> Self {
        Self {
            executor,
            queues,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Start a run of `timeline`. Returns its control handle; for queued
    /// runs the handle is live from the moment of enqueueing, before the
    /// run ever starts.
    pub async fn start(&self, timeline: Timeline, options: StartOptions) -> Result<RunHandle> {
        let run = Run::new(options.source).with_context(options.context);
        let run_id = run.id;

        match options.queue {
            Some(name) => {
                debug!(run_id = %run_id, queue = %name, "Run dispatched to queue");
                self.queues.enqueue(&name, timeline, run).await
            }
            None => {
                debug!(run_id = %run_id, "Run dispatched");
                let handle = self.executor.start(timeline, run);
                self.track(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Cancel an unqueued run by id. Returns whether the id was live.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.active.get(&run_id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    /// Handle of a live unqueued run.
    #[must_use]
    pub fn handle(&self, run_id: Uuid) -> Option<RunHandle> {
        self.active.get(&run_id).map(|entry| entry.value().clone())
    }

    /// Ids of unqueued runs still in flight.
    #[must_use]
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.active.iter().map(|entry| *entry.key()).collect()
    }

    /// The queue manager runs are parked on.
    #[must_use]
    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    /// Retain the handle until the run settles.
    fn track(&self, handle: RunHandle) {
        let active = Arc::clone(&self.active);
        let waiter = handle.clone();
        self.active.insert(handle.id(), handle);
        tokio::spawn(async move {
            waiter.wait().await;
            active.remove(&waiter.id());
        });
    }
}
