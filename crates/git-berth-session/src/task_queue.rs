//! Serialized execution of repository operations.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Whether an operation only reads the repository or may mutate it.
///
/// Both kinds run on the same serialized worker. The split is metadata for
/// logging and for callers that treat mutations specially; the backend's
/// tolerance for concurrent readers is unknown, so full serialization is
/// the safe choice and the only one offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// The operation only reads repository state.
    Read,
    /// The operation may mutate repository state.
    Mutate,
}

impl OpKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Mutate => "mutate",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission was refused because the queue is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Task queue is shut down")]
pub struct QueueClosed;

enum Job {
    /// A submitted operation, counted in the pending total.
    Task {
        kind: OpKind,
        op: Box<dyn FnOnce() + Send>,
    },
    /// A foreground call whose caller is blocked on the result; not counted
    /// as pending background work.
    Call(Box<dyn FnOnce() + Send>),
    /// Drain marker for [`TaskQueue::wait`].
    Drain(Sender<()>),
    /// Worker teardown, sent by `Drop` behind all queued work.
    Exit,
}

struct Shared {
    pending: AtomicUsize,
    busy: watch::Sender<bool>,
}

impl Shared {
    fn begin(&self) -> usize {
        let previous = self.pending.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            self.busy.send_replace(true);
        }
        previous + 1
    }

    fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.busy.send_replace(false);
        }
    }
}

/// Single serialization point for operations against a shared repository
/// backend.
///
/// One dedicated worker thread runs submitted operations strictly in
/// submission order. An operation that needs the queue again while running
/// (for example a mutation that re-reads state through the same entry
/// points) is executed in place instead of enqueued, which would deadlock
/// the worker against itself.
///
/// The pending count increments when an operation starts and decrements
/// when it finishes, however it exits; `busy` is exactly `pending > 0` and
/// its transitions are published through a [`watch`] channel that any
/// thread may observe.
pub struct TaskQueue {
    label: String,
    jobs: Sender<Job>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
    shared: Arc<Shared>,
    shut_down: AtomicBool,
}

impl TaskQueue {
    /// Starts the worker thread for a new, empty queue.
    ///
    /// # Errors
    /// Returns an error if the worker thread cannot be spawned.
    pub fn new(label: impl Into<String>) -> std::io::Result<Self> {
        let label = label.into();
        let (jobs, inbox) = mpsc::channel();
        let (busy, _initial_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            busy,
        });
        let worker_shared = Arc::clone(&shared);
        let worker_label = label.clone();
        let worker = thread::Builder::new()
            .name(format!("berth-queue-{label}"))
            .spawn(move || worker_loop(&inbox, &worker_shared, &worker_label))?;
        let worker_id = worker.thread().id();
        Ok(Self {
            label,
            jobs,
            worker: Some(worker),
            worker_id,
            shared,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Label this queue was created with.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Submits `op` for asynchronous execution on the worker, in submission
    /// order relative to every other submission.
    ///
    /// When called from inside a running operation, `op` executes
    /// synchronously in place instead: the enclosing operation is already
    /// counted as pending, so the count does not move, and shutdown does
    /// not apply (the enclosing operation was accepted and is allowed to
    /// finish whatever it started).
    ///
    /// # Errors
    /// Returns [`QueueClosed`] when the queue has been shut down.
    pub fn submit<F>(&self, kind: OpKind, op: F) -> Result<(), QueueClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.on_worker_thread() {
            debug!(queue = %self.label, %kind, "reentrant submit; executing inline");
            op();
            return Ok(());
        }
        if self.is_shut_down() {
            debug!(queue = %self.label, %kind, "submit refused; queue is shut down");
            return Err(QueueClosed);
        }
        let job = Job::Task {
            kind,
            op: Box::new(op),
        };
        self.jobs.send(job).map_err(|_| QueueClosed)
    }

    /// Runs `op` on the worker and blocks the caller until it returns,
    /// yielding its value. Runs in place when already on the worker.
    ///
    /// A foreground call, not background work: the pending count and the
    /// busy flag do not move.
    ///
    /// # Errors
    /// Returns [`QueueClosed`] when the queue has been shut down or the
    /// worker is gone.
    ///
    /// # Panics
    /// A panic inside `op` is re-raised on the calling thread, as it would
    /// be for a direct call.
    pub fn run_sync<T, F>(&self, op: F) -> Result<T, QueueClosed>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.on_worker_thread() {
            return Ok(op());
        }
        if self.is_shut_down() {
            return Err(QueueClosed);
        }
        let (result_tx, result_rx) = mpsc::channel();
        let call = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(op));
            let _ = result_tx.send(outcome);
        });
        self.jobs.send(Job::Call(call)).map_err(|_| QueueClosed)?;
        match result_rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(QueueClosed),
        }
    }

    /// Blocks until every operation submitted so far has completed.
    ///
    /// Intended for deterministic teardown. Calling it from inside a queued
    /// operation would deadlock the worker against itself, so that case is
    /// logged and ignored instead.
    pub fn wait(&self) {
        if self.on_worker_thread() {
            warn!(queue = %self.label, "wait() called from a queued operation; ignoring");
            return;
        }
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.jobs.send(Job::Drain(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Stops accepting new submissions. Idempotent; operations already
    /// queued or running finish normally.
    pub fn shut_down(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            debug!(queue = %self.label, "queue shut down");
        }
    }

    /// Whether [`shut_down`](Self::shut_down) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Number of operations accepted and not yet finished.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Whether any operation is pending.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.pending_count() > 0
    }

    /// Subscribes to busy-flag transitions. The receiver sees the current
    /// value immediately and every `false`/`true` edge afterwards; safe to
    /// poll from any thread.
    #[must_use]
    pub fn busy_watch(&self) -> watch::Receiver<bool> {
        self.shared.busy.subscribe()
    }

    fn on_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.shut_down();
        // Exit lines up behind already-queued jobs, so accepted operations
        // still run before the worker stops.
        let _ = self.jobs.send(Job::Exit);
        if let Some(worker) = self.worker.take() {
            if thread::current().id() != self.worker_id {
                let _ = worker.join();
            }
        }
    }
}

fn worker_loop(inbox: &Receiver<Job>, shared: &Shared, label: &str) {
    while let Ok(job) = inbox.recv() {
        match job {
            Job::Task { kind, op } => {
                let pending = shared.begin();
                debug!(queue = label, %kind, pending, "executing operation");
                if panic::catch_unwind(AssertUnwindSafe(op)).is_err() {
                    error!(queue = label, %kind, "operation panicked");
                }
                shared.finish();
            }
            Job::Call(op) => op(),
            Job::Drain(ack) => {
                let _ = ack.send(());
            }
            Job::Exit => break,
        }
    }
    debug!(queue = label, "worker stopped");
}
