//! Per-device queues of eager nodes for asynchronous execution.
//!
//! Nodes run in submission order on the queue's thread. When a node fails the queue is
//! poisoned: nodes still waiting are aborted with the same error, and so is every node enqueued
//! afterwards, until [`ExecutionQueue::clear_error`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crate::status::{catch_panic, Status, StatusResult};

/// Orders queue failures across every queue in the process.
static NEXT_FAILURE: AtomicU64 = AtomicU64::new(1);

/// A unit of deferred eager work.
pub trait EagerNode: Send {
    fn name(&self) -> &str;

    fn run(&mut self) -> StatusResult<()>;

    /// Settles the node's outputs with `status` without running it.
    fn abort(&mut self, status: &Status);
}

#[derive(Default)]
struct QueueState {
    nodes: VecDeque<Box<dyn EagerNode>>,
    /// Enqueued nodes that have not finished running or aborting.
    unfinished: usize,
    error: Option<Status>,
    /// Process-wide sequence number of the failure that poisoned the queue.
    failed_at: u64,
    shutdown: bool,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    work_ready: Condvar,
    idle: Condvar,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, count: usize) {
        let mut state = self.lock();
        state.unfinished -= count;
        if state.unfinished == 0 {
            self.idle.notify_all();
        }
    }

    fn run_worker(self: Arc<Self>) {
        loop {
            let (mut node, error) = {
                let mut state = self.lock();
                while state.nodes.is_empty() && !state.shutdown {
                    state = self
                        .work_ready
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                let Some(node) = state.nodes.pop_front() else {
                    return;
                };
                (node, state.error.clone())
            };

            if let Some(error) = error {
                node.abort(&error);
                self.finish(1);
                continue;
            }

            let result = catch_panic(|| node.run()).unwrap_or_else(|reason| {
                Err(Status::internal(format!("eager node {} panicked: {reason}", node.name())))
            });
            if let Err(error) = result {
                tracing::debug!(queue = %self.name, node = node.name(), error = %error, "eager node failed");
                node.abort(&error);
                let drained: Vec<_> = {
                    let mut state = self.lock();
                    if state.error.is_none() {
                        state.error = Some(error.clone());
                        state.failed_at = NEXT_FAILURE.fetch_add(1, Ordering::Relaxed);
                    }
                    state.nodes.drain(..).collect()
                };
                let count = drained.len();
                for mut pending in drained {
                    pending.abort(&error);
                }
                self.finish(count + 1);
                continue;
            }
            self.finish(1);
        }
    }
}

pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

impl ExecutionQueue {
    pub fn new(name: impl Into<String>) -> StatusResult<Self> {
        let inner = Arc::new(QueueInner {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name(format!("eager-{}", inner.name))
            .spawn(move || worker_inner.run_worker())
            .map_err(|err| Status::resource_exhausted(format!("failed to spawn executor: {err}")))?;
        let worker_id = Some(worker.thread().id());
        Ok(ExecutionQueue {
            inner,
            worker: Some(worker),
            worker_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Appends `node`. A poisoned queue aborts the node immediately and returns the queue error.
    pub fn enqueue(&self, mut node: Box<dyn EagerNode>) -> StatusResult<()> {
        let error = {
            let mut state = self.inner.lock();
            match &state.error {
                Some(error) => error.clone(),
                None => {
                    state.unfinished += 1;
                    state.nodes.push_back(node);
                    self.inner.work_ready.notify_one();
                    return Ok(());
                }
            }
        };
        node.abort(&error);
        Err(error)
    }

    /// Blocks until every enqueued node has finished and returns the queue error, if any.
    pub fn wait(&self) -> StatusResult<()> {
        match self.wait_for_failure() {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }

    /// Like [`ExecutionQueue::wait`], but also reports when the error happened relative to
    /// failures on other queues. Smaller sequence numbers failed earlier.
    pub fn wait_for_failure(&self) -> Option<(u64, Status)> {
        let mut state = self.inner.lock();
        while state.unfinished > 0 {
            state = self
                .inner
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let failed_at = state.failed_at;
        state.error.clone().map(|error| (failed_at, error))
    }

    pub fn status(&self) -> StatusResult<()> {
        match &self.inner.lock().error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Lets the queue accept work again once in-flight aborts have settled.
    pub fn clear_error(&self) {
        let mut state = self.inner.lock();
        while state.unfinished > 0 {
            state = self
                .inner
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.error = None;
        state.failed_at = 0;
    }
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        {
            let mut state = self.inner.lock();
            state.shutdown = true;
            self.inner.work_ready.notify_all();
        }
        if self.worker_id == Some(thread::current().id()) {
            return;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
