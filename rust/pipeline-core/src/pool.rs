// rust/pipeline-core/src/pool.rs

//! Fixed-size worker pools owned by a dataset.
//!
//! Each pipeline phase (load, merge, shuffle) runs on its own long-lived
//! pool so threads are reused across passes. Pools are plain values owned by
//! the dataset that created them; dropping a pool drains its queue and joins
//! its threads.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};

use crate::error::{PipelineError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed number of named threads pulling jobs from a shared queue.
pub struct WorkerPool {
    name: String,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` threads named `{name}-{i}`.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or a thread cannot be spawned.
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if size == 0 {
            return Err(PipelineError::config(format!(
                "worker pool '{name}' needs at least one thread"
            )));
        }

        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let jobs = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    for job in jobs.iter() {
                        job();
                    }
                })
                .map_err(|e| PipelineError::worker(&name, format!("failed to spawn thread: {e}")))?;
            workers.push(handle);
        }

        tracing::debug!(pool = %name, size, "worker pool started");
        Ok(Self {
            name,
            sender: Some(sender),
            workers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `task` and returns a handle to its result.
    ///
    /// A panic inside `task` is caught and reported through [`TaskHandle::join`].
    pub fn spawn<F, R>(&self, task: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = bounded(1);
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task)).map_err(panic_message);
            let _ = result_tx.send(outcome);
        });
        if let Some(sender) = &self.sender {
            // A send error drops the job, which the handle reports on join.
            let _ = sender.send(job);
        }
        TaskHandle {
            pool: self.name.clone(),
            result: result_rx,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.workers.len())
            .finish()
    }
}

/// Result of a task queued on a [`WorkerPool`].
#[must_use = "a task handle should be joined"]
pub struct TaskHandle<R> {
    pool: String,
    result: Receiver<std::result::Result<R, String>>,
}

impl<R> TaskHandle<R> {
    /// Blocks until the task finishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the task panicked or was dropped unrun.
    pub fn join(self) -> Result<R> {
        match self.result.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(PipelineError::worker(
                self.pool,
                format!("task panicked: {message}"),
            )),
            Err(_) => Err(PipelineError::worker(
                self.pool,
                "task was dropped before it ran",
            )),
        }
    }
}

/// Joins every handle, returning all task results or the first failure.
///
/// Every handle is joined even after a failure, so no task outlives the call.
pub fn join_all<R>(handles: Vec<TaskHandle<Result<R>>>) -> Result<Vec<R>> {
    let mut values = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        match handle.join().and_then(|r| r) {
            Ok(value) => values.push(value),
            Err(e) => {
                tracing::error!(error = %e, "pipeline task failed");
                first_error.get_or_insert(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The per-phase pools a dataset keeps between passes.
#[derive(Debug, Default)]
pub struct PipelinePools {
    load: Option<WorkerPool>,
    merge: Option<WorkerPool>,
    shuffle: Option<WorkerPool>,
}

impl PipelinePools {
    pub fn new() -> Self {
        Self::default()
    }

    /// The load pool, (re)created when `size` differs from the current one.
    pub fn load(&mut self, size: usize) -> Result<&WorkerPool> {
        ensure(&mut self.load, "load", size)
    }

    pub fn merge(&mut self, size: usize) -> Result<&WorkerPool> {
        ensure(&mut self.merge, "merge", size)
    }

    pub fn shuffle(&mut self, size: usize) -> Result<&WorkerPool> {
        ensure(&mut self.shuffle, "shuffle", size)
    }

    /// All three pools at once, for phases that run concurrently.
    pub fn all(
        &mut self,
        load: usize,
        merge: usize,
        shuffle: usize,
    ) -> Result<(&WorkerPool, &WorkerPool, &WorkerPool)> {
        ensure(&mut self.load, "load", load)?;
        ensure(&mut self.merge, "merge", merge)?;
        ensure(&mut self.shuffle, "shuffle", shuffle)?;
        match (&self.load, &self.merge, &self.shuffle) {
            (Some(l), Some(m), Some(s)) => Ok((l, m, s)),
            _ => Err(PipelineError::worker("pipeline", "worker pools were not initialised")),
        }
    }
}

fn ensure<'a>(slot: &'a mut Option<WorkerPool>, name: &str, size: usize) -> Result<&'a WorkerPool> {
    if slot.as_ref().map(WorkerPool::size) != Some(size) {
        *slot = None;
        *slot = Some(WorkerPool::new(name, size)?);
    }
    slot.as_ref()
        .ok_or_else(|| PipelineError::worker(name, "worker pool was not initialised"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_zero_size_rejected() {
        assert!(WorkerPool::new("empty", 0).is_err());
    }

    #[test]
    fn test_spawn_returns_results() {
        let pool = WorkerPool::new("calc", 3).unwrap();
        let handles: Vec<_> = (0..10).map(|i| pool.spawn(move || i * i)).collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, (0..10).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_panic_is_reported() {
        let pool = WorkerPool::new("boom", 1).unwrap();
        let handle = pool.spawn(|| -> usize { panic!("bad input") });
        let err = handle.join().unwrap_err();
        assert!(err.to_string().contains("bad input"));

        // The thread survives the panic
        assert_eq!(pool.spawn(|| 7).join().unwrap(), 7);
    }

    #[test]
    fn test_drop_runs_queued_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new("drain", 2).unwrap();
            for _ in 0..20 {
                let counter = Arc::clone(&counter);
                let _ = pool.spawn(move || counter.fetch_add(1, Ordering::SeqCst));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_join_all_reports_first_error() {
        let pool = WorkerPool::new("mixed", 2).unwrap();
        let handles = vec![
            pool.spawn(|| Ok(1)),
            pool.spawn(|| Err(PipelineError::shuffle("out of records"))),
            pool.spawn(|| Ok(3)),
        ];
        let err = join_all(handles).unwrap_err();
        assert!(matches!(err, PipelineError::Shuffle { .. }));
    }

    #[test]
    fn test_pipeline_pools_resize() {
        let mut pools = PipelinePools::new();
        assert_eq!(pools.load(2).unwrap().size(), 2);
        assert_eq!(pools.load(2).unwrap().size(), 2);
        assert_eq!(pools.load(5).unwrap().size(), 5);

        let (load, merge, shuffle) = pools.all(5, 1, 3).unwrap();
        assert_eq!((load.size(), merge.size(), shuffle.size()), (5, 1, 3));
    }
}
