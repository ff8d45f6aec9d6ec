//! The worker pool draining ready tasks.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crossbeam_queue::SegQueue;
use tracing::{debug, trace, trace_span};

use crate::error::Error;
use crate::pool::{Handle, MemoryPool};
use crate::sync::Semaphore;

use super::{AdjacencySlot, Future, Task, TaskCallable, TaskGraph, TaskHandle};

/// Capacity of the task pool backing an executor.
pub const TASK_POOL_CAPACITY: usize = 1024;

/// One worker thread is left to the OS / the calling thread.
const RESERVED_THREADS: usize = 1;

thread_local! {
    /// Scheduler context of the task currently running on this thread.
    /// Initialised when a worker (or `call`/`join`) first runs a task,
    /// dropped with the thread.
    static CURRENT: RefCell<Option<(Weak<ExecutorShared>, TaskHandle)>> = const { RefCell::new(None) };
}

/// The executor state shared by workers, [`ExecutorHandle`]s and the
/// owning [`Executor`].
struct ExecutorShared {
    pool: MemoryPool<Task, TASK_POOL_CAPACITY>,
    ready: SegQueue<TaskHandle>,
    deletion: SegQueue<TaskHandle>,
    signal: Semaphore,
    stop: AtomicBool,
    /// Panics captured from task invocations, re-raised on executor drop.
    panics: Mutex<Vec<Box<dyn std::any::Any + Send>>>,
}

impl ExecutorShared {
    /// Enqueues a ready task (latch == 1) and wakes a worker unless the
    /// task is a continuation.
    fn submit_one(self: &Arc<Self>, handle: TaskHandle) {
        let is_continuation = match self.pool.get(handle) {
            Some(task) => {
                debug_assert_eq!(task.state().latch.load(Ordering::Relaxed), 1);
                task.state().is_continuation()
            }
            None => return,
        };
        self.ready.push(handle);
        if !is_continuation {
            self.signal.release(1);
        }
    }

    /// Invokes the task, schedules its dependents, and retires it.
    fn run_task(self: &Arc<Self>, handle: TaskHandle) {
        let Some(task) = self.pool.get(handle) else { return };

        let previous = CURRENT.with(|tls| {
            tls.borrow_mut()
                .replace((Arc::downgrade(self), handle))
        });

        // The dequeueing thread has exclusive invocation rights.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| unsafe { task.invoke() }));

        CURRENT.with(|tls| *tls.borrow_mut() = previous);

        if let Err(payload) = outcome {
            self.panics.lock().unwrap().push(payload);
        }

        self.schedule_adjacent(task);

        // Drop the self count; at zero the task is destructible.
        if task.state().latch.fetch_sub(1, Ordering::AcqRel) - 1 == 0 {
            self.deletion.push(handle);
        }
    }

    /// Walks the dependent list, decrementing latches; a dependent whose
    /// latch drops to 1 has no outstanding dependencies left and is
    /// claimed by this thread.
    fn schedule_adjacent(self: &Arc<Self>, task: &Task) {
        let deps = task.state().deps.read();
        for slot in deps.adjacencies.iter() {
            let adjacent = slot.load();
            if adjacent.is_null() {
                // Another thread already claimed it.
                continue;
            }
            let Some(adjacent_task) = self.pool.get(adjacent) else { continue };
            if adjacent_task.state().latch.fetch_sub(1, Ordering::AcqRel) - 1 == 1 {
                self.submit_one(adjacent);
                slot.clear();
            }
        }
    }

    /// Destructs tasks whose latch reached zero and frees their slots.
    fn purge_deletion_queue(&self) {
        while let Some(handle) = self.deletion.pop() {
            if let Some(task) = self.pool.get(handle) {
                debug_assert!(task.state().is_complete());
                self.pool.free(handle);
            }
        }
    }

    /// Runs ready tasks until the queue is empty.
    fn process_ready_queue(self: &Arc<Self>) {
        while let Some(handle) = self.ready.pop() {
            self.run_task(handle);
            self.purge_deletion_queue();
        }
    }

    /// Runs at most one ready task. Returns whether one was run.
    fn run_one(self: &Arc<Self>) -> bool {
        match self.ready.pop() {
            Some(handle) => {
                self.run_task(handle);
                self.purge_deletion_queue();
                true
            }
            None => false,
        }
    }

    fn worker_main(self: Arc<Self>, index: usize) {
        let _span = trace_span!("worker", index).entered();
        while !self.stop.load(Ordering::Acquire) {
            self.process_ready_queue();
            self.signal.acquire();
        }
        trace!(index, "worker stopping");
    }

    fn create_task<F, A>(self: &Arc<Self>, f: F, args: A) -> Result<(TaskHandle, Future<F::Output>), Error>
    where
        F: TaskCallable<A>,
        A: Send + 'static,
    {
        let task = Task::new(f, args);
        let future = Future::new(task.state().clone());
        let handle = self.pool.allocate(task);
        if handle.is_null() {
            return Err(Error::PoolExhausted);
        }
        Ok((handle, future))
    }

    fn add_dependency(&self, a: TaskHandle, b: TaskHandle, is_continuation: bool) {
        let (Some(task_a), Some(task_b)) = (self.pool.get(a), self.pool.get(b)) else {
            return;
        };
        // One more outstanding dependency for b.
        task_b.state().latch.fetch_add(1, Ordering::Relaxed);
        if is_continuation {
            task_b.state().deps.write().is_continuation = true;
        }
        task_a.state().deps.write().adjacencies.push(AdjacencySlot::new(b));
    }

    fn submit_tasks(self: &Arc<Self>, handles: &[TaskHandle]) {
        for &handle in handles {
            if let Some(task) = self.pool.get(handle) {
                if task.state().latch.load(Ordering::Acquire) == 1 {
                    self.submit_one(handle);
                }
            }
        }
    }

    fn submit_graph(self: &Arc<Self>, graph: TaskGraph) -> Result<(), Error> {
        let nodes = graph.finalize()?;
        if nodes.is_empty() {
            return Ok(());
        }

        let _span = trace_span!("submit_graph", tasks = nodes.len()).entered();

        let mut handles = Vec::with_capacity(nodes.len());
        let mut meta = Vec::with_capacity(nodes.len());
        for node in nodes {
            node.task
                .state()
                .latch
                .store(node.in_degree as u32 + 1, Ordering::Relaxed);
            meta.push((node.state, node.adjacencies, node.in_degree));
            let handle = self.pool.allocate(node.task);
            if handle.is_null() {
                // Roll back: nothing from this graph may remain scheduled.
                for handle in handles {
                    self.pool.free(handle);
                }
                return Err(Error::PoolExhausted);
            }
            handles.push(handle);
        }

        for (state, adjacencies, _) in &meta {
            if adjacencies.is_empty() {
                continue;
            }
            state.deps.write().adjacencies = adjacencies
                .iter()
                .map(|&target| AdjacencySlot::new(handles[target]))
                .collect();
        }

        // Seed on the static in-degree: a worker may already be running
        // an earlier seed and have decremented a dependent's latch to 1,
        // and that dependent must not be enqueued twice. Continuations
        // are enqueued without waking a worker.
        for (i, (_, _, in_degree)) in meta.iter().enumerate() {
            if *in_degree == 0 {
                self.submit_one(handles[i]);
            }
        }
        Ok(())
    }
}

/// A pool of worker threads consuming DAGs of short-lived tasks.
///
/// Dropping the executor sets the stop flag, wakes every worker and
/// detaches it (in-flight tasks run to completion in the background),
/// drops still-queued tasks, and re-raises the first panic captured
/// from a task invocation.
pub struct Executor {
    shared: Arc<ExecutorShared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Executor {
    /// An executor with `hardware_concurrency - 1` workers (at least one).
    pub fn new() -> Executor {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .saturating_sub(RESERVED_THREADS)
            .max(1);
        Executor::with_threads(threads)
    }

    pub fn with_threads(thread_count: usize) -> Executor {
        assert!(thread_count > 0, "thread count must be nonzero");
        let shared = Arc::new(ExecutorShared {
            pool: MemoryPool::new(),
            ready: SegQueue::new(),
            deletion: SegQueue::new(),
            signal: Semaphore::new(thread_count, thread_count),
            stop: AtomicBool::new(false),
            panics: Mutex::new(Vec::new()),
        });
        let threads = (0..thread_count)
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("scoria-worker-{index}"))
                    .spawn(move || shared.worker_main(index))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        debug!(thread_count, "executor started");
        Executor { shared, threads }
    }

    /// A cheap handle usable from inside tasks (or other threads) to
    /// create tasks and dependencies.
    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Allocates a standalone task in the pool. The task is not
    /// scheduled until [`submit_tasks`](Executor::submit_tasks) (or a
    /// dependency chain) makes it ready.
    pub fn create_task<F, A>(&self, f: F, args: A) -> Result<(TaskHandle, Future<F::Output>), Error>
    where
        F: TaskCallable<A>,
        A: Send + 'static,
    {
        self.shared.create_task(f, args)
    }

    /// Records that `a` must complete before `b`. Must happen before `a`
    /// is submitted, or from inside `a`'s own callable (the continuation
    /// pattern).
    pub fn add_dependency(&self, a: TaskHandle, b: TaskHandle, is_continuation: bool) {
        self.shared.add_dependency(a, b, is_continuation);
    }

    /// Finalises the graph and schedules its roots. On error nothing is
    /// scheduled.
    pub fn submit(&self, graph: TaskGraph) -> Result<(), Error> {
        self.shared.submit_graph(graph)
    }

    /// Enqueues pool tasks that are ready (latch == 1).
    pub fn submit_tasks(&self, handles: &[TaskHandle]) {
        self.shared.submit_tasks(handles);
    }

    /// Runs a task synchronously on the calling thread, scheduling its
    /// dependents as usual. The task must not also have been submitted.
    pub fn call(&self, handle: TaskHandle) {
        self.shared.run_task(handle);
        self.shared.purge_deletion_queue();
    }

    /// Waits for `future`, helping to drain the ready queue while it is
    /// not yet done. Blocks on the future's latch once the queue runs
    /// dry.
    pub fn join<R: 'static>(&self, future: Future<R>) -> R {
        while !future.is_ready() {
            if !self.shared.run_one() {
                break;
            }
        }
        future.get()
    }

    /// Runs at most one ready task on the calling thread.
    pub fn join_one(&self) -> bool {
        self.shared.run_one()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Executor::new()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.signal.release(self.threads.len());
        // Workers are detached, not joined: drop returns promptly while
        // in-flight tasks run to completion in the background (they
        // keep the shared state alive through their own `Arc`).
        self.threads.clear();

        // Whatever is still queued is dropped without running.
        while let Some(handle) = self.shared.ready.pop() {
            self.shared.pool.free(handle);
        }
        self.shared.purge_deletion_queue();

        let mut panics = self.shared.panics.lock().unwrap();
        let payload = panics.drain(..).next();
        drop(panics);
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }
}

/// A clonable reference to an executor's scheduling state, independent
/// of the owning [`Executor`]'s lifetime management.
#[derive(Clone)]
pub struct ExecutorHandle {
    shared: Arc<ExecutorShared>,
}

impl ExecutorHandle {
    pub fn create_task<F, A>(&self, f: F, args: A) -> Result<(TaskHandle, Future<F::Output>), Error>
    where
        F: TaskCallable<A>,
        A: Send + 'static,
    {
        self.shared.create_task(f, args)
    }

    pub fn add_dependency(&self, a: TaskHandle, b: TaskHandle, is_continuation: bool) {
        self.shared.add_dependency(a, b, is_continuation);
    }

    pub fn submit_tasks(&self, handles: &[TaskHandle]) {
        self.shared.submit_tasks(handles);
    }
}

/// The executor running the current task, if the calling thread is
/// inside a task invocation.
pub fn current_executor() -> Option<ExecutorHandle> {
    CURRENT.with(|tls| {
        tls.borrow()
            .as_ref()
            .and_then(|(weak, _)| weak.upgrade())
            .map(|shared| ExecutorHandle { shared })
    })
}

/// The handle of the task currently running on this thread.
pub fn current_task() -> Option<TaskHandle> {
    CURRENT.with(|tls| tls.borrow().as_ref().map(|&(_, handle)| handle))
}
