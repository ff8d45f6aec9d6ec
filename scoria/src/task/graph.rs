//! Task graphs: DAG construction and finalisation.

use std::sync::Arc;

use tracing::trace_span;

use crate::error::Error;

use super::{Future, Task, TaskCallable, TaskState};

/// Index of a node inside a (not yet finalised) task graph.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TaskNodeId(pub(crate) usize);

pub(crate) struct TaskNode {
    pub(crate) task: Task,
    /// Graph-local indices of the dependents.
    pub(crate) adjacencies: Vec<usize>,
    pub(crate) in_degree: usize,
}

/// A container of tasks plus explicit happens-before edges.
///
/// Build with [`create_task`](TaskGraph::create_task) and
/// [`add_dependency`](TaskGraph::add_dependency), then hand the graph to
/// [`Executor::submit`](super::Executor::submit), which finalises it:
/// a depth-first search orders the nodes so that dependencies precede
/// dependents in memory and rejects cycles before anything is scheduled.
#[derive(Default)]
pub struct TaskGraph {
    pub(crate) nodes: Vec<TaskNode>,
}

impl TaskGraph {
    pub fn new() -> TaskGraph {
        TaskGraph { nodes: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Adds a node built from `f` and its bound arguments. Returns the
    /// node id and a future for the callable's return value.
    pub fn create_task<F, A>(&mut self, f: F, args: A) -> (TaskNodeId, Future<F::Output>)
    where
        F: TaskCallable<A>,
        A: Send + 'static,
    {
        let task = Task::new(f, args);
        let future = Future::new(task.state().clone());
        self.nodes.push(TaskNode {
            task,
            adjacencies: Vec::new(),
            in_degree: 0,
        });
        (TaskNodeId(self.nodes.len() - 1), future)
    }

    /// Records that `a` must complete before `b` may run.
    ///
    /// A continuation edge additionally marks `b` as not independently
    /// runnable: when it becomes ready it is enqueued without waking an
    /// idle worker, so it tends to run on the thread that finished `a`.
    pub fn add_dependency(&mut self, a: TaskNodeId, b: TaskNodeId, is_continuation: bool) {
        assert!(a != b, "a task cannot depend on itself");
        self.nodes[a.0].adjacencies.push(b.0);
        self.nodes[b.0].in_degree += 1;
        if is_continuation {
            self.nodes[b.0].task.state().deps.write().is_continuation = true;
        }
    }

    fn depth_first_search(
        &self,
        v: usize,
        visited: &mut [bool],
        departure: &mut [usize],
        order: &mut Vec<usize>,
        time: &mut usize,
    ) {
        visited[v] = true;
        for &u in &self.nodes[v].adjacencies {
            if !visited[u] {
                self.depth_first_search(u, visited, departure, order, time);
            }
        }
        departure[v] = *time;
        *time += 1;
        order.push(v);
    }

    /// Imposes a topological order on the node storage (dependencies
    /// first) and checks the DAG property. On error the graph is
    /// dropped whole; nothing was scheduled.
    pub(crate) fn finalize(mut self) -> Result<Vec<FinalizedNode>, Error> {
        let _span = trace_span!("task_graph_finalize", nodes = self.nodes.len()).entered();

        let n = self.nodes.len();
        let mut visited = vec![false; n];
        let mut departure = vec![0usize; n];
        let mut order = Vec::with_capacity(n);
        let mut time = 0usize;

        for v in 0..n {
            if !visited[v] {
                self.depth_first_search(v, &mut visited, &mut departure, &mut order, &mut time);
            }
        }

        for u in 0..n {
            for &v in &self.nodes[u].adjacencies {
                if departure[u] <= departure[v] {
                    return Err(Error::GraphNotDag);
                }
            }
        }

        // Reverse departure order puts every dependency before its
        // dependents in memory.
        let mut new_index = vec![0usize; n];
        for (new, &old) in order.iter().rev().enumerate() {
            new_index[old] = new;
        }

        let mut slots: Vec<Option<TaskNode>> = self.nodes.drain(..).map(Some).collect();
        let mut finalized: Vec<Option<FinalizedNode>> = (0..n).map(|_| None).collect();
        for (old, slot) in slots.iter_mut().enumerate() {
            let node = slot.take().unwrap();
            finalized[new_index[old]] = Some(FinalizedNode {
                state: node.task.state().clone(),
                task: node.task,
                adjacencies: node.adjacencies.iter().map(|&v| new_index[v]).collect(),
                in_degree: node.in_degree,
            });
        }

        Ok(finalized.into_iter().map(Option::unwrap).collect())
    }
}

/// A node after finalisation: topologically placed, adjacency expressed
/// in final positions.
pub(crate) struct FinalizedNode {
    pub(crate) task: Task,
    pub(crate) state: Arc<TaskState>,
    pub(crate) adjacencies: Vec<usize>,
    pub(crate) in_degree: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_graph(edges: &[(usize, usize)], n: usize) -> TaskGraph {
        let mut graph = TaskGraph::new();
        let ids: Vec<_> = (0..n).map(|_| graph.create_task(|| (), ()).0).collect();
        for &(a, b) in edges {
            graph.add_dependency(ids[a], ids[b], false);
        }
        graph
    }

    #[test]
    fn finalize_orders_dependencies_first() {
        // c -> b -> a, inserted backwards.
        let mut graph = TaskGraph::new();
        let (a, _) = graph.create_task(|| (), ());
        let (b, _) = graph.create_task(|| (), ());
        let (c, _) = graph.create_task(|| (), ());
        graph.add_dependency(c, b, false);
        graph.add_dependency(b, a, false);

        let nodes = graph.finalize().unwrap();
        // Position of a node must be greater than every dependency's.
        for (i, node) in nodes.iter().enumerate() {
            for &dep in &node.adjacencies {
                assert!(dep > i, "dependent {} placed before its dependency {}", dep, i);
            }
        }
        assert_eq!(nodes[0].in_degree, 0);
    }

    #[test]
    fn finalize_rejects_cycles() {
        let graph = noop_graph(&[(0, 1), (1, 0)], 2);
        assert!(matches!(graph.finalize(), Err(Error::GraphNotDag)));

        let graph = noop_graph(&[(0, 1), (1, 2), (2, 0)], 3);
        assert!(matches!(graph.finalize(), Err(Error::GraphNotDag)));
    }

    #[test]
    fn finalize_single_node_is_one_ready_task() {
        let graph = noop_graph(&[], 1);
        let nodes = graph.finalize().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].in_degree, 0);
    }

    #[test]
    fn diamond_keeps_join_last() {
        // a -> b, a -> c, b -> d, c -> d
        let graph = noop_graph(&[(0, 1), (0, 2), (1, 3), (2, 3)], 4);
        let nodes = graph.finalize().unwrap();
        let join = nodes.iter().position(|n| n.in_degree == 2).unwrap();
        assert_eq!(join, 3);
        let root = nodes.iter().position(|n| n.adjacencies.len() == 2).unwrap();
        assert_eq!(root, 0);
    }
}
