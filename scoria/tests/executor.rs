//! End-to-end scenarios for the task system: graphs, continuations,
//! cooperative joins and shutdown.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use scoria::task::TASK_POOL_CAPACITY;
use scoria::{current_executor, current_task, Error, Executor, TaskGraph};

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::yield_now();
    }
    condition()
}

#[test]
fn empty_graph_is_a_noop() {
    let executor = Executor::with_threads(2);
    executor.submit(TaskGraph::new()).unwrap();
}

#[test]
fn single_task_runs_exactly_once() {
    let executor = Executor::with_threads(2);
    let counter = Arc::new(AtomicU32::new(0));

    let mut graph = TaskGraph::new();
    let (_, future) = graph.create_task(
        |counter: Arc<AtomicU32>| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        (counter.clone(),),
    );
    executor.submit(graph).unwrap();
    executor.join(future);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn every_submitted_task_runs_exactly_once() {
    let executor = Executor::with_threads(4);
    let counters: Arc<Vec<AtomicU32>> = Arc::new((0..100).map(|_| AtomicU32::new(0)).collect());

    let mut graph = TaskGraph::new();
    for i in 0..100 {
        let counters = counters.clone();
        graph.create_task(
            move || {
                counters[i].fetch_add(1, Ordering::SeqCst);
            },
            (),
        );
    }
    executor.submit(graph).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        counters.iter().all(|c| c.load(Ordering::SeqCst) == 1)
    }));
}

/// Diamond: A -> B, A -> C, B -> D, C -> D. B and C race on a shared
/// cell; D must observe one of their writes and both must have run.
#[test]
fn diamond_dependencies_order_execution() {
    let executor = Executor::with_threads(4);
    let cell = Arc::new(AtomicU32::new(0));
    let b_done = Arc::new(AtomicBool::new(false));
    let c_done = Arc::new(AtomicBool::new(false));

    let mut graph = TaskGraph::new();
    let (a, _) = graph.create_task(|| {}, ());
    let (b, _) = graph.create_task(
        {
            let cell = cell.clone();
            let b_done = b_done.clone();
            move || {
                cell.store(1, Ordering::SeqCst);
                b_done.store(true, Ordering::SeqCst);
            }
        },
        (),
    );
    let (c, _) = graph.create_task(
        {
            let cell = cell.clone();
            let c_done = c_done.clone();
            move || {
                cell.store(2, Ordering::SeqCst);
                c_done.store(true, Ordering::SeqCst);
            }
        },
        (),
    );
    let (d, d_future) = graph.create_task(
        {
            let cell = cell.clone();
            let b_done = b_done.clone();
            let c_done = c_done.clone();
            move || {
                assert!(b_done.load(Ordering::SeqCst));
                assert!(c_done.load(Ordering::SeqCst));
                cell.load(Ordering::SeqCst)
            }
        },
        (),
    );
    graph.add_dependency(a, b, false);
    graph.add_dependency(a, c, false);
    graph.add_dependency(b, d, false);
    graph.add_dependency(c, d, false);

    executor.submit(graph).unwrap();
    let observed = executor.join(d_future);
    assert!(observed == 1 || observed == 2);
}

/// Edges are happens-before: effects of a predecessor are visible when
/// the dependent starts.
#[test]
fn chain_preserves_order_and_visibility() {
    let executor = Executor::with_threads(4);
    let log = Arc::new(Mutex::new(Vec::new()));

    let mut graph = TaskGraph::new();
    let mut previous = None;
    let mut tail = None;
    for step in 0..8usize {
        let log = log.clone();
        let (id, future) = graph.create_task(
            move || {
                log.lock().unwrap().push(step);
            },
            (),
        );
        if let Some(prev) = previous {
            graph.add_dependency(prev, id, false);
        }
        previous = Some(id);
        tail = Some(future);
    }
    executor.submit(graph).unwrap();
    executor.join(tail.unwrap());

    assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
}

#[test]
fn future_is_ready_iff_task_returned() {
    let executor = Executor::with_threads(2);
    let gate = Arc::new(AtomicBool::new(false));
    let returned = Arc::new(AtomicBool::new(false));

    let mut graph = TaskGraph::new();
    let (_, future) = graph.create_task(
        {
            let gate = gate.clone();
            let returned = returned.clone();
            move || {
                while !gate.load(Ordering::SeqCst) {
                    std::thread::yield_now();
                }
                returned.store(true, Ordering::SeqCst);
            }
        },
        (),
    );
    executor.submit(graph).unwrap();

    std::thread::sleep(Duration::from_millis(20));
    assert!(!future.is_ready());

    gate.store(true, Ordering::SeqCst);
    future.wait();
    assert!(returned.load(Ordering::SeqCst));
}

#[test]
fn join_returns_the_task_value() {
    let executor = Executor::with_threads(2);
    let mut graph = TaskGraph::new();
    let (_, future) = graph.create_task(|a: u64, b: u64| a * b, (6u64, 7u64));
    executor.submit(graph).unwrap();
    assert_eq!(executor.join(future), 42);
}

/// S5: a cyclic graph is rejected whole and the executor stays usable.
#[test]
fn cycle_is_rejected_without_scheduling() {
    let executor = Executor::with_threads(2);
    let ran = Arc::new(AtomicBool::new(false));

    let mut graph = TaskGraph::new();
    let (a, _) = graph.create_task(
        {
            let ran = ran.clone();
            move || ran.store(true, Ordering::SeqCst)
        },
        (),
    );
    let (b, _) = graph.create_task(
        {
            let ran = ran.clone();
            move || ran.store(true, Ordering::SeqCst)
        },
        (),
    );
    graph.add_dependency(a, b, false);
    graph.add_dependency(b, a, false);

    assert!(matches!(executor.submit(graph), Err(Error::GraphNotDag)));
    std::thread::sleep(Duration::from_millis(20));
    assert!(!ran.load(Ordering::SeqCst));

    // Executor state is unchanged: a fresh graph still runs.
    let mut graph = TaskGraph::new();
    let (_, future) = graph.create_task(|| 5u32, ());
    executor.submit(graph).unwrap();
    assert_eq!(executor.join(future), 5);
}

/// S2: a task spawns its own continuation; both run, the continuation
/// after its parent, and the executor goes quiescent.
#[test]
fn continuation_created_inside_a_task() {
    let executor = Executor::with_threads(2);
    let order = Arc::new(Mutex::new(Vec::new()));

    let (a, a_future) = executor
        .create_task(
            {
                let order = order.clone();
                move || {
                    order.lock().unwrap().push("a");
                    let handle = current_executor().expect("inside a task");
                    let me = current_task().expect("inside a task");
                    let (b, b_future) = handle
                        .create_task(
                            {
                                let order = order.clone();
                                move || order.lock().unwrap().push("b")
                            },
                            (),
                        )
                        .unwrap();
                    handle.add_dependency(me, b, true);
                    b_future
                }
            },
            (),
        )
        .unwrap();

    executor.submit_tasks(&[a]);
    let b_future = executor.join(a_future);
    b_future.wait();
    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
}

#[test]
fn call_runs_synchronously_on_this_thread() {
    let executor = Executor::with_threads(1);
    let caller = std::thread::current().id();
    let observed = Arc::new(Mutex::new(None));

    let (handle, future) = executor
        .create_task(
            {
                let observed = observed.clone();
                move || {
                    *observed.lock().unwrap() = Some(std::thread::current().id());
                }
            },
            (),
        )
        .unwrap();
    executor.call(handle);
    assert!(future.is_ready());
    assert_eq!(observed.lock().unwrap().unwrap(), caller);
}

/// Overflowing the task pool fails the overflowing `create_task`;
/// previously created tasks are unaffected.
#[test]
fn pool_exhaustion_fails_the_overflowing_task() {
    let executor = Executor::with_threads(2);
    let counter = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..TASK_POOL_CAPACITY {
        let counter = counter.clone();
        let (handle, _future) = executor
            .create_task(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                (),
            )
            .unwrap();
        handles.push(handle);
    }
    assert!(matches!(
        executor.create_task(|| (), ()),
        Err(Error::PoolExhausted)
    ));

    executor.submit_tasks(&handles);
    assert!(wait_until(Duration::from_secs(10), || {
        counter.load(Ordering::SeqCst) == TASK_POOL_CAPACITY
    }));
}

#[test]
fn shutdown_lets_in_flight_tasks_finish() {
    let finished = Arc::new(AtomicBool::new(false));
    {
        let executor = Executor::with_threads(1);
        let mut graph = TaskGraph::new();
        let (_, future) = graph.create_task(
            {
                let finished = finished.clone();
                move || {
                    std::thread::sleep(Duration::from_millis(30));
                    finished.store(true, Ordering::SeqCst);
                }
            },
            (),
        );
        executor.submit(graph).unwrap();
        // Make sure the worker picked it up before shutdown begins.
        future.wait();
    }
    assert!(finished.load(Ordering::SeqCst));
}

/// Shutdown detaches workers: drop returns while a worker is still
/// blocked inside a long-running task, and the task still finishes.
#[test]
fn drop_detaches_workers_blocked_in_tasks() {
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let executor = Executor::with_threads(1);
    let mut graph = TaskGraph::new();
    graph.create_task(
        {
            let started = started.clone();
            let release = release.clone();
            let finished = finished.clone();
            move || {
                started.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    std::thread::yield_now();
                }
                finished.store(true, Ordering::SeqCst);
            }
        },
        (),
    );
    executor.submit(graph).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        started.load(Ordering::SeqCst)
    }));

    // The worker is pinned inside the task; drop must not wait for it.
    drop(executor);
    assert!(!finished.load(Ordering::SeqCst));

    // The detached worker drains the in-flight task to completion.
    release.store(true, Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(5), || {
        finished.load(Ordering::SeqCst)
    }));
}

#[test]
fn task_panic_resurfaces_on_executor_drop() {
    let executor = Executor::with_threads(1);
    let mut graph = TaskGraph::new();
    let (_, future) = graph.create_task(|| panic!("task exploded"), ());
    executor.submit(graph).unwrap();
    future.wait();

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || drop(executor)));
    assert!(outcome.is_err());
}
