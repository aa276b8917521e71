// src/pool.rs
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{EtudeError, EtudeResult};

struct State<T> {
    tasks: VecDeque<T>,
    shutdown: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    available: Condvar,
    max_tasks: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed set of worker threads fed from one bounded FIFO queue.
///
/// The producer (the dispatcher) never waits for queue space: [`append`]
/// fails immediately when the queue is at its maximum depth.
///
/// [`append`]: WorkerPool::append
pub struct WorkerPool<T> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `threads` workers, each running `handler` on the tasks it
    /// dequeues. With `pin` set, worker `i` is pinned to core `i % cores`.
    pub fn new<F>(threads: usize, max_tasks: usize, pin: bool, handler: F) -> EtudeResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if threads == 0 || max_tasks == 0 {
            return Err(EtudeError::Pool(format!(
                "need at least one thread and one queue slot (threads={threads}, max_tasks={max_tasks})"
            )));
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                tasks: VecDeque::with_capacity(max_tasks.min(1024)),
                shutdown: false,
            }),
            available: Condvar::new(),
            max_tasks,
        });
        let handler = Arc::new(handler);
        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(threads),
        };

        for i in 0..threads {
            let shared = Arc::clone(&pool.shared);
            let handler = Arc::clone(&handler);
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);

            let spawned = thread::Builder::new()
                .name(format!("etude-worker-{i}"))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, core = id.id, "worker pinned");
                        } else {
                            warn!(worker = i, core = id.id, "failed to pin worker");
                        }
                    }
                    run_worker(i, &shared, &*handler);
                });

            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    // Dropping `pool` stops the workers already running.
                    return Err(EtudeError::Pool(format!("spawning worker {i}: {e}")));
                }
            }
        }

        Ok(pool)
    }

    /// Queue a task and wake one idle worker. Fails with
    /// [`EtudeError::QueueFull`] (dropping the task) at capacity.
    pub fn append(&self, task: T) -> EtudeResult<()> {
        let mut state = self.shared.lock();
        if state.shutdown || state.tasks.len() >= self.shared.max_tasks {
            return Err(EtudeError::QueueFull);
        }
        state.tasks.push_back(task);
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }
}

impl<T> WorkerPool<T> {
    /// Tasks waiting for a worker.
    pub fn len(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting work, wake every worker and join them. Tasks still
    /// queued are dropped.
    pub fn shutdown(&mut self) {
        self.shutdown_with(|| {});
    }

    /// Like [`shutdown`](WorkerPool::shutdown), but keeps calling `pump`
    /// until every worker has exited. A worker blocked writing to a channel
    /// only the caller reads can then finish its task.
    pub fn shutdown_with(&mut self, mut pump: impl FnMut()) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.tasks.clear();
        }
        self.shared.available.notify_all();

        while self.workers.iter().any(|handle| !handle.is_finished()) {
            pump();
            thread::sleep(Duration::from_millis(1));
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T>(id: usize, shared: &Shared<T>, handler: &(dyn Fn(T) + Send + Sync)) {
    loop {
        let task = {
            let mut state = shared.lock();
            loop {
                if state.shutdown {
                    debug!(worker = id, "worker exiting");
                    return;
                }
                if let Some(task) = state.tasks.pop_front() {
                    break task;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| handler(task))).is_err() {
            error!(worker = id, "task panicked");
        }
    }
}
