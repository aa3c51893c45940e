//! Generic task pool: immediate and deferred job scheduling with cancellation.
//!
//! The connection runtime treats the pool as an external collaborator — it
//! never spawns a bare `tokio::task` itself, it asks a `Pool` to run a job
//! now or after a delay, and gets back a `JobHandle` it can try to cancel.
//! `TokioPool` is the one production implementation, backed by
//! `tokio::spawn` and `tokio::time::sleep`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Outcome of attempting to cancel a scheduled job: removed cleanly, already
/// running, or already finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The job was removed before it started running.
    Ok,
    /// The job is already running and cannot be stopped; it will run to
    /// completion.
    InProgress,
    /// The job already finished.
    Completed,
}

/// A handle to a job submitted to a [`Pool`].
pub struct JobHandle {
    join: JoinHandle<()>,
    started: Arc<AtomicBool>,
}

impl JobHandle {
    fn new(join: JoinHandle<()>, started: Arc<AtomicBool>) -> Self {
        Self { join, started }
    }

    /// Best-effort cancellation. If the job has not started, it is aborted
    /// and will never run. If it has already started, it runs to
    /// completion and the caller is told so.
    pub fn cancel(&self) -> CancelResult {
        if self.join.is_finished() {
            return CancelResult::Completed;
        }
        if self.started.load(Ordering::Acquire) {
            return CancelResult::InProgress;
        }
        self.join.abort();
        CancelResult::Ok
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// A shared worker pool offering immediate and deferred job scheduling.
pub trait Pool: Send + Sync {
    /// Run `job` as soon as a worker is free.
    fn spawn_now(&self, job: BoxFuture) -> JobHandle;

    /// Run `job` no sooner than `delay` from now.
    fn spawn_after(&self, delay: Duration, job: BoxFuture) -> JobHandle;
}

/// `Pool` backed by the tokio multi-thread runtime's own scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioPool;

impl TokioPool {
    pub fn new() -> Self {
        Self
    }
}

impl Pool for TokioPool {
    fn spawn_now(&self, job: BoxFuture) -> JobHandle {
        let started = Arc::new(AtomicBool::new(false));
        let started_marker = started.clone();
        let join = tokio::spawn(async move {
            started_marker.store(true, Ordering::Release);
            job.await;
        });
        JobHandle::new(join, started)
    }

    fn spawn_after(&self, delay: Duration, job: BoxFuture) -> JobHandle {
        let started = Arc::new(AtomicBool::new(false));
        let started_marker = started.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            started_marker.store(true, Ordering::Release);
            job.await;
        });
        JobHandle::new(join, started)
    }
}

/// Boxes a future for submission to a [`Pool`].
pub fn boxed<F>(fut: F) -> BoxFuture
where
    F: Future<Output = ()> + Send + 'static,
{
    Box::pin(fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn spawn_now_runs_the_job() {
        let pool = TokioPool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handle = pool.spawn_now(boxed(async move {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_delay_elapses_prevents_the_job_from_running() {
        let pool = TokioPool::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let handle = pool.spawn_after(
            Duration::from_secs(60),
            boxed(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(handle.cancel(), CancelResult::Ok);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
