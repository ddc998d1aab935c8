//! Ordered command streams and completion events.
//!
//! A [`Stream`] executes enqueued closures in FIFO order on a dedicated thread. Once a command
//! fails the stream is in an error state: later commands are dropped without running and the
//! first error is reported by [`Stream::block_host_until_done`] and by events recorded on it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use crate::status::{catch_panic, ret_check, Status, StatusResult};

pub type StreamTask = Box<dyn FnOnce() -> StatusResult<()> + Send + 'static>;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct StreamState {
    queue: VecDeque<(u64, StreamTask)>,
    enqueued: u64,
    completed: u64,
    error: Option<Status>,
    shutdown: bool,
}

pub(crate) struct StreamInner {
    id: u64,
    name: String,
    state: Mutex<StreamState>,
    work_ready: Condvar,
    progress: Condvar,
}

impl StreamInner {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_worker(self: Arc<Self>) {
        loop {
            let (seq, task, skip) = {
                let mut state = self.lock();
                while state.queue.is_empty() && !state.shutdown {
                    state = self
                        .work_ready
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                let Some((seq, task)) = state.queue.pop_front() else {
                    return;
                };
                (seq, task, state.error.is_some())
            };

            let result = if skip {
                Ok(())
            } else {
                catch_panic(task).unwrap_or_else(|reason| {
                    Err(Status::internal(format!(
                        "command {seq} on stream {} panicked: {reason}",
                        self.name
                    )))
                })
            };

            let mut state = self.lock();
            if let Err(err) = result {
                tracing::debug!(stream = %self.name, error = %err, "stream entered error state");
                state.error.get_or_insert(err);
            }
            state.completed = seq;
            self.progress.notify_all();
        }
    }

    fn wait_until(&self, seq: u64) -> StatusResult<()> {
        let mut state = self.lock();
        while state.completed < seq {
            state = self
                .progress
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &state.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// Completion marker for everything enqueued on a stream before the event was recorded.
#[derive(Clone)]
pub struct Event {
    stream: Arc<StreamInner>,
    seq: u64,
}

impl Event {
    pub fn stream_id(&self) -> u64 {
        self.stream.id
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn is_complete(&self) -> bool {
        self.stream.lock().completed >= self.seq
    }

    /// Blocks until the event has been reached; reports the stream's error if it has one.
    pub fn wait(&self) -> StatusResult<()> {
        self.stream.wait_until(self.seq)
    }

    /// Orders events recorded on the same stream; events on different streams are unordered.
    pub fn is_later_than(&self, other: &Event) -> Option<bool> {
        (self.stream.id == other.stream.id).then_some(self.seq > other.seq)
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("stream", &self.stream.name)
            .field("seq", &self.seq)
            .finish()
    }
}

/// The event after which a buffer's contents are valid.
///
/// An empty slot means the contents are valid now. Once set the slot only moves forward: a new
/// event must be strictly later on the same stream as the current one.
#[derive(Debug, Default)]
pub struct DefinitionEvent {
    event: Mutex<Option<Event>>,
}

impl DefinitionEvent {
    pub fn get(&self) -> Option<Event> {
        self.event
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self, event: Event) -> StatusResult<()> {
        let mut slot = self.event.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = slot.as_ref() {
            ret_check!(
                event.is_later_than(current) == Some(true),
                "definition event may only move to a strictly later event on the same stream \
                 (current {}#{}, new {}#{})",
                current.stream.name,
                current.seq,
                event.stream.name,
                event.seq
            );
        }
        *slot = Some(event);
        Ok(())
    }

    /// Blocks until the defining event, if any, has completed.
    pub fn wait(&self) -> StatusResult<()> {
        match self.get() {
            Some(event) => event.wait(),
            None => Ok(()),
        }
    }
}

pub struct Stream {
    inner: Arc<StreamInner>,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

impl Stream {
    pub fn new(name: impl Into<String>) -> StatusResult<Self> {
        let inner = Arc::new(StreamInner {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            state: Mutex::new(StreamState::default()),
            work_ready: Condvar::new(),
            progress: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name(format!("stream-{}", inner.name))
            .spawn(move || worker_inner.run_worker())
            .map_err(|err| Status::resource_exhausted(format!("failed to spawn stream: {err}")))?;
        let worker_id = Some(worker.thread().id());
        Ok(Stream {
            inner,
            worker: Some(worker),
            worker_id,
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// False once any command on this stream has failed.
    pub fn ok(&self) -> bool {
        self.inner.lock().error.is_none()
    }

    pub fn error(&self) -> Option<Status> {
        self.inner.lock().error.clone()
    }

    /// Appends a command and returns its sequence number.
    pub fn enqueue(&self, task: StreamTask) -> u64 {
        let mut state = self.inner.lock();
        state.enqueued += 1;
        let seq = state.enqueued;
        state.queue.push_back((seq, task));
        self.inner.work_ready.notify_one();
        seq
    }

    pub fn enqueue_fn<F>(&self, task: F) -> u64
    where
        F: FnOnce() -> StatusResult<()> + Send + 'static,
    {
        self.enqueue(Box::new(task))
    }

    /// Records an event covering every command enqueued so far.
    pub fn record_event(&self) -> Event {
        Event {
            stream: Arc::clone(&self.inner),
            seq: self.inner.lock().enqueued,
        }
    }

    /// Makes later commands on this stream wait for `event`.
    pub fn wait_for_event(&self, event: &Event) {
        if event.stream.id == self.inner.id {
            return;
        }
        let event = event.clone();
        self.enqueue_fn(move || event.wait());
    }

    /// Makes later commands on this stream wait for everything currently enqueued on `other`.
    pub fn wait_for(&self, other: &Stream) {
        self.wait_for_event(&other.record_event());
    }

    pub fn block_host_until_done(&self) -> StatusResult<()> {
        let target = self.inner.lock().enqueued;
        self.inner.wait_until(target)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Drop for Stream {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn definition_event_only_moves_strictly_forward() {
        let stream = Stream::new("defs").unwrap();
        let other = Stream::new("defs-other").unwrap();
        stream.enqueue_fn(|| Ok(()));
        let earlier = stream.record_event();
        stream.enqueue_fn(|| Ok(()));
        let later = stream.record_event();

        let slot = DefinitionEvent::default();
        slot.reset(later.clone()).unwrap();
        assert_eq!(slot.reset(earlier).unwrap_err().code(), Code::Internal);
        assert_eq!(slot.reset(later.clone()).unwrap_err().code(), Code::Internal);
        other.enqueue_fn(|| Ok(()));
        assert_eq!(slot.reset(other.record_event()).unwrap_err().code(), Code::Internal);
        assert_eq!(slot.get().map(|event| event.sequence()), Some(later.sequence()));

        stream.enqueue_fn(|| Ok(()));
        let latest = stream.record_event();
        slot.reset(latest.clone()).unwrap();
        assert_eq!(slot.get().map(|event| event.sequence()), Some(latest.sequence()));
        slot.wait().unwrap();
    }

    #[test]
    fn panicking_command_fails_the_stream() {
        let stream = Stream::new("panics").unwrap();
        stream.enqueue_fn(|| panic!("attempt to multiply with overflow"));
        let event = stream.record_event();
        let ran_after = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran_after);
        stream.enqueue_fn(move || {
            *flag.lock().unwrap() = true;
            Ok(())
        });

        let err = event.wait().unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.message().contains("attempt to multiply with overflow"), "{err}");
        assert_eq!(stream.block_host_until_done().unwrap_err(), err);
        assert!(!*ran_after.lock().unwrap());
        assert!(!stream.ok());
    }
}
