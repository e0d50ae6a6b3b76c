//! Task-set runner for the frame graph.
//!
//! A task set is `count` parallel invocations of `body(task_id, count)`.
//! Sets name their dependencies at creation; since dependencies must be
//! handles created earlier, the graph is acyclic by construction and
//! handle order is already a topological order. `wait_for_set` runs the
//! target set and its incomplete transitive predecessors in that order;
//! each set fans out as an indexed parallel iteration on the worker pool.
//!
//! The pool is an explicit object passed to the pipeline (no global task
//! manager); a pool with one worker is the single-threaded dispatch shape.

use rayon::prelude::*;

/// Sentinel for "no task set".
pub const INVALID_TASK_SET: TaskSetHandle = TaskSetHandle(u32::MAX);

/// Opaque handle to a task set within one frame's graph.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TaskSetHandle(u32);

impl TaskSetHandle {
    #[inline]
    pub fn is_valid(self) -> bool {
        self != INVALID_TASK_SET
    }
}

/// Worker pool shared by all frames.
pub struct TaskPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl TaskPool {
    /// Pool with an explicit worker count (at least one).
    pub fn new(workers: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("softcull-worker-{i}"))
            .build()?;
        Ok(Self { pool, workers })
    }

    /// Hardware thread count minus one: the caller thread participates by
    /// driving `wait_for_set`.
    pub fn default_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1))
            .unwrap_or(1)
            .max(1)
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers
    }
}

struct TaskSet<'frame> {
    name: &'static str,
    count: usize,
    deps: Vec<TaskSetHandle>,
    body: Option<Box<dyn Fn(usize, usize) + Send + Sync + 'frame>>,
    complete: bool,
}

/// Frame-scoped dependency graph of task sets.
pub struct TaskGraph<'frame> {
    pool: &'frame TaskPool,
    sets: Vec<TaskSet<'frame>>,
}

impl<'frame> TaskGraph<'frame> {
    pub fn new(pool: &'frame TaskPool) -> Self {
        Self {
            pool,
            sets: Vec::new(),
        }
    }

    /// Register a set of `count` tasks. Every dependency must be a handle
    /// returned by an earlier call on this graph.
    pub fn create_task_set(
        &mut self,
        name: &'static str,
        count: usize,
        deps: &[TaskSetHandle],
        body: impl Fn(usize, usize) + Send + Sync + 'frame,
    ) -> TaskSetHandle {
        for dep in deps {
            assert!(
                dep.is_valid() && (dep.0 as usize) < self.sets.len(),
                "task set '{name}' depends on an unknown handle"
            );
        }
        let handle = TaskSetHandle(self.sets.len() as u32);
        self.sets.push(TaskSet {
            name,
            count,
            deps: deps.to_vec(),
            body: Some(Box::new(body)),
            complete: false,
        });
        handle
    }

    /// Run `handle` and everything it transitively depends on. Returns once
    /// all of them have completed.
    pub fn wait_for_set(&mut self, handle: TaskSetHandle) {
        assert!(
            handle.is_valid() && (handle.0 as usize) < self.sets.len(),
            "waiting on an unknown task set handle"
        );

        let mut needed = vec![false; self.sets.len()];
        let mut stack = vec![handle.0 as usize];
        while let Some(i) = stack.pop() {
            if needed[i] || self.sets[i].complete {
                continue;
            }
            needed[i] = true;
            for dep in &self.sets[i].deps {
                stack.push(dep.0 as usize);
            }
        }

        // Handle order is topological: dependencies always precede.
        for i in 0..self.sets.len() {
            if needed[i] && !self.sets[i].complete {
                self.run_set(i);
            }
        }
    }

    /// Drop a set's closure once the caller is done with it.
    pub fn release_handle(&mut self, handle: TaskSetHandle) {
        if !handle.is_valid() {
            return;
        }
        let set = &mut self.sets[handle.0 as usize];
        debug_assert!(set.complete, "releasing task set '{}' before completion", set.name);
        set.body = None;
    }

    fn run_set(&mut self, index: usize) {
        {
            let set = &self.sets[index];
            let count = set.count;
            let body = set
                .body
                .as_ref()
                .unwrap_or_else(|| panic!("task set '{}' was released before running", set.name));
            match count {
                0 => {}
                1 => body(0, 1),
                _ => self.pool.pool.install(|| {
                    (0..count)
                        .into_par_iter()
                        .for_each(|task_id| body(task_id, count));
                }),
            }
        }
        self.sets[index].complete = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn invalid_handle_sentinel() {
        assert!(!INVALID_TASK_SET.is_valid());
    }

    #[test]
    fn every_task_runs_exactly_once() {
        let pool = TaskPool::new(4).unwrap();
        let ran = AtomicU64::new(0);
        let mut graph = TaskGraph::new(&pool);

        let set = graph.create_task_set("count", 64, &[], |task_id, count| {
            assert_eq!(count, 64);
            // Each task id sets its own bit; double execution would be
            // caught by the final popcount.
            let prev = ran.fetch_or(1 << task_id, Ordering::Relaxed);
            assert_eq!(prev & (1 << task_id), 0, "task {task_id} ran twice");
        });
        graph.wait_for_set(set);
        graph.release_handle(set);

        assert_eq!(ran.load(Ordering::Relaxed), u64::MAX);
    }

    #[test]
    fn dependencies_run_before_dependents() {
        let pool = TaskPool::new(4).unwrap();
        let order = Mutex::new(Vec::new());
        let mut graph = TaskGraph::new(&pool);

        let a = graph.create_task_set("a", 4, &[], |_, _| {
            order.lock().unwrap().push('a');
        });
        let b = graph.create_task_set("b", 4, &[], |_, _| {
            order.lock().unwrap().push('b');
        });
        let c = graph.create_task_set("c", 4, &[a, b], |_, _| {
            order.lock().unwrap().push('c');
        });
        let d = graph.create_task_set("d", 4, &[c], |_, _| {
            order.lock().unwrap().push('d');
        });

        graph.wait_for_set(d);
        drop(graph);

        let order = order.into_inner().unwrap();
        let last_a = order.iter().rposition(|&x| x == 'a').unwrap();
        let last_b = order.iter().rposition(|&x| x == 'b').unwrap();
        let first_c = order.iter().position(|&x| x == 'c').unwrap();
        let last_c = order.iter().rposition(|&x| x == 'c').unwrap();
        let first_d = order.iter().position(|&x| x == 'd').unwrap();
        assert!(last_a < first_c && last_b < first_c, "c must start after a and b");
        assert!(last_c < first_d, "d must start after c");
        assert_eq!(order.len(), 16);
    }

    #[test]
    fn waiting_on_a_middle_node_skips_unrelated_sets() {
        let pool = TaskPool::new(2).unwrap();
        let a_ran = AtomicUsize::new(0);
        let unrelated_ran = AtomicUsize::new(0);
        let mut graph = TaskGraph::new(&pool);

        let a = graph.create_task_set("a", 3, &[], |_, _| {
            a_ran.fetch_add(1, Ordering::Relaxed);
        });
        let _unrelated = graph.create_task_set("unrelated", 3, &[], |_, _| {
            unrelated_ran.fetch_add(1, Ordering::Relaxed);
        });
        let b = graph.create_task_set("b", 1, &[a], |_, _| {});

        graph.wait_for_set(b);
        assert_eq!(a_ran.load(Ordering::Relaxed), 3);
        assert_eq!(unrelated_ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn waiting_twice_does_not_rerun_sets() {
        let pool = TaskPool::new(2).unwrap();
        let runs = AtomicUsize::new(0);
        let mut graph = TaskGraph::new(&pool);

        let a = graph.create_task_set("a", 8, &[], |_, _| {
            runs.fetch_add(1, Ordering::Relaxed);
        });
        graph.wait_for_set(a);
        graph.wait_for_set(a);
        assert_eq!(runs.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn single_worker_pool_still_completes_chains() {
        let pool = TaskPool::new(1).unwrap();
        let sum = AtomicUsize::new(0);
        let mut graph = TaskGraph::new(&pool);

        let a = graph.create_task_set("a", 16, &[], |task_id, _| {
            sum.fetch_add(task_id, Ordering::Relaxed);
        });
        let b = graph.create_task_set("b", 1, &[a], |_, _| {
            sum.fetch_add(1000, Ordering::Relaxed);
        });
        graph.wait_for_set(b);
        assert_eq!(sum.load(Ordering::Relaxed), 120 + 1000);
    }
}
