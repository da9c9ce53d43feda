//! Single-threaded executor for snapshot store operations.
//!
//! Every state-mutating store operation is submitted to the store's actor and
//! runs on its one worker thread, in submission order. Callers get an
//! [`ActorFuture`] back: await it from async code or [`ActorFuture::join`] it
//! from a blocking context.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{JoinHandle, ThreadId};

use snapstore_core::{Result, SnapshotError};
use tokio::sync::oneshot;
use tracing::error;

type Task = Box<dyn FnOnce() + Send>;

/// Actor metrics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct ActorStats {
    /// Number of tasks waiting in the queue.
    pub queue_depth: usize,
    /// Whether a task is currently executing.
    pub busy: bool,
    /// Total number of tasks completed since the actor was spawned.
    pub tasks_completed: u64,
}

struct ActorInner {
    queue: Mutex<VecDeque<Task>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    queue_depth: AtomicUsize,
    busy: AtomicBool,
    tasks_completed: AtomicU64,
}

/// A named worker thread draining a FIFO task queue.
pub struct SnapshotActor {
    inner: Arc<ActorInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl SnapshotActor {
    /// Spawn the actor's worker thread.
    ///
    /// The thread is named `snapstore-<name>`.
    pub fn spawn(name: &str) -> Result<Self> {
        let inner = Arc::new(ActorInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            queue_depth: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
            tasks_completed: AtomicU64::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("snapstore-{}", name))
            .spawn(move || worker_loop(&worker_inner))?;

        Ok(SnapshotActor {
            inner,
            worker_id: handle.thread().id(),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// True when called from the actor's own worker thread
    pub fn is_actor_thread(&self) -> bool {
        std::thread::current().id() == self.worker_id
    }

    /// Submit work to run on the actor.
    ///
    /// The returned future resolves with the work's result, or with
    /// [`SnapshotError::Closed`] if the actor has been shut down.
    pub fn submit<T, F>(&self, work: F) -> ActorFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: Task = Box::new(move || {
            let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(work)) {
                Ok(result) => result,
                Err(e) => {
                    let message = e
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| e.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "(non-string panic)".to_string());
                    error!(target: "snapstore::actor", panic = %message, "Actor task panicked");
                    Err(SnapshotError::illegal_state(format!(
                        "actor task panicked: {}",
                        message
                    )))
                }
            };
            // the caller may have dropped the future
            let _ = tx.send(result);
        });

        {
            // checked under the queue lock: the worker only exits on an
            // empty queue after observing shutdown
            let mut queue = self.inner.queue.lock();
            if self.inner.shutdown.load(Ordering::Acquire) {
                return ActorFuture::ready(Err(SnapshotError::Closed));
            }
            queue.push_back(task);
            self.inner.queue_depth.fetch_add(1, Ordering::Release);
        }
        self.inner.work_ready.notify_one();

        ActorFuture { rx }
    }

    /// Stop accepting work, run what is queued, and join the worker.
    ///
    /// Idempotent. When called from the worker itself the thread exits after
    /// the current task instead of being joined.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        // Lock before notifying so a worker between its shutdown check and
        // wait() cannot miss the wakeup.
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }

        if self.is_actor_thread() {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Return a snapshot of actor metrics.
    pub fn stats(&self) -> ActorStats {
        ActorStats {
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            busy: self.inner.busy.load(Ordering::Relaxed),
            tasks_completed: self.inner.tasks_completed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for SnapshotActor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears `busy` and counts the task once it has run.
struct BusyGuard<'a> {
    inner: &'a ActorInner,
}

impl<'a> Drop for BusyGuard<'a> {
    fn drop(&mut self) {
        self.inner.busy.store(false, Ordering::Release);
        self.inner.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }
}

fn worker_loop(inner: &ActorInner) {
    loop {
        let task = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    inner.queue_depth.fetch_sub(1, Ordering::Release);
                    inner.busy.store(true, Ordering::Release);
                    break task;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let _guard = BusyGuard { inner };
        task();
    }
}

/// Completion of an operation submitted to a [`SnapshotActor`].
#[must_use = "store operations do nothing observable unless their result is awaited or joined"]
pub struct ActorFuture<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> ActorFuture<T> {
    /// A future that is already resolved
    pub fn ready(result: Result<T>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        ActorFuture { rx }
    }

    /// Block the current thread until the operation completes.
    ///
    /// Must not be called from the actor thread or from within an async
    /// runtime; `.await` the future there instead.
    pub fn join(self) -> Result<T> {
        self.rx.blocking_recv().unwrap_or(Err(SnapshotError::Closed))
    }
}

impl<T> Future for ActorFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SnapshotError::Closed)))
    }
}
