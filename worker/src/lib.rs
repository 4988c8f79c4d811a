// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A task that runs blocking native jobs on behalf of runtime threads.
//!
//! Some natives (Wi-Fi setup, DNS, filesystem calls) block for a long time
//! and can't be split up with `select()`. They run on an [`AsyncWorker`]
//! instead:
//!
//! 1. The calling thread gets a [`Job`] with [`AsyncWorker::allocate_job`]
//!    and fills in its parameters.
//! 2. It hands the job to the worker with [`AsyncWorker::async_exec`] and
//!    suspends on the returned [`Suspended`].
//! 3. The worker task runs the action on the job's parameters, then resumes
//!    the caller with the job, results included.
//! 4. The caller reads the results and gives the job back with
//!    [`AsyncWorker::free_job`].
//!
//! There is a fixed number of jobs. When they're all taken,
//! `allocate_job` puts the caller on a bounded FIFO waiting list and hands
//! back a suspension instead; each `free_job` resumes the oldest waiter,
//! which then tries again.
//!
//! For fire-and-forget work, [`AsyncWorker::async_exec_no_wait`] makes the
//! worker free the job itself once the action has run.

#![warn(
    elided_lifetimes_in_paths,
    explicit_outlives_requirements,
    missing_debug_implementations,
    missing_docs,
    semicolon_in_expressions_from_macros,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_qualifications,
)]

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use llbsp::mutex::Mutex;
use llbsp::queue::Queue;
use llbsp::suspend::{suspension, Resumer, Suspended};
use llbsp::task::{Task, TaskConfig};
use llbsp::{OsalError, Timeout};
use llbsp_pool::{Handle, Pool, PoolError};
use thiserror::Error;

/// Reasons a worker operation can fail.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Zero jobs or zero waiting threads were requested.
    #[error("invalid worker configuration")]
    InvalidArgs,
    /// Every job is taken and the waiting list is full too.
    #[error("thread cannot be suspended, waiting list is full.")]
    WaitingListFull,
    /// The job doesn't belong to this worker, or was already freed.
    #[error("job does not belong to this worker")]
    UnknownJob,
    /// The worker has been shut down.
    #[error("worker is stopped")]
    Stopped,
    /// An OS primitive failed.
    #[error(transparent)]
    Osal(#[from] OsalError),
}

/// Creation parameters of an [`AsyncWorker`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerConfig {
    /// The worker task.
    pub task: TaskConfig,
    /// Number of jobs, i.e. how many requests can be in flight.
    pub job_count: usize,
    /// How many threads may wait for a job at once.
    pub waiting_threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            task: TaskConfig::new("AsyncWorker", 2 * 1024, 6),
            job_count: 4,
            waiting_threads: 16,
        }
    }
}

/// A unit of work: parameters in, results out.
///
/// Jobs are only obtained from [`AsyncWorker::allocate_job`] and must be
/// given back with [`AsyncWorker::free_job`].
#[derive(Debug)]
#[must_use = "a job must be executed or freed, or its slot is lost"]
pub struct Job<P> {
    handle: Handle,
    /// Parameters and results of the operation.
    pub params: P,
}

/// Result of [`AsyncWorker::allocate_job`].
#[derive(Debug)]
pub enum Allocation<P> {
    /// A job was free.
    Job(Job<P>),
    /// No job was free; wait on this, then try again.
    Wait(Suspended<()>),
}

type Action<P> = Box<dyn FnOnce(&mut P) + Send + 'static>;

enum Message<P> {
    Run {
        job: Job<P>,
        action: Action<P>,
        done: Option<Resumer<Job<P>>>,
    },
    Stop,
}

#[derive(Debug)]
struct Jobs {
    slots: Pool<()>,
    waiting: VecDeque<Resumer<()>>,
    waiting_limit: usize,
    stopped: bool,
}

struct Inner<P> {
    jobs: Mutex<Jobs>,
    queue: Queue<Message<P>>,
}

impl<P> fmt::Debug for Inner<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("jobs", &self.jobs)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl<P> Inner<P> {
    /// Returns a job slot and wakes the oldest thread still waiting for one.
    fn release(&self, handle: Handle) -> Result<(), WorkerError> {
        let mut waiter = self.jobs.perform(|j| {
            j.slots.free(handle).map_err(|e| match e {
                PoolError::ItemNotFoundInPool => WorkerError::UnknownJob,
                _ => WorkerError::InvalidArgs,
            })?;
            Ok::<_, WorkerError>(j.waiting.pop_front())
        })?;
        // A waiter that has given up doesn't count; try the next one.
        while let Some(w) = waiter.take() {
            if w.resume(()).is_ok() {
                break;
            }
            waiter = self.jobs.perform(|j| j.waiting.pop_front());
        }
        Ok(())
    }
}

/// A worker task and its jobs.
pub struct AsyncWorker<P: Send + 'static> {
    name: String,
    inner: Arc<Inner<P>>,
    task: Option<Task>,
}

impl<P: Send + 'static> fmt::Debug for AsyncWorker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncWorker")
            .field("name", &self.name)
            .field("inner", &self.inner)
            .field("running", &self.task.is_some())
            .finish()
    }
}

impl<P: Default + Send + 'static> AsyncWorker<P> {
    /// Creates the jobs and starts the worker task.
    pub fn initialize(config: WorkerConfig) -> Result<Self, WorkerError> {
        if config.job_count == 0 || config.waiting_threads == 0 {
            return Err(WorkerError::InvalidArgs);
        }
        let slots = Pool::new(config.job_count).map_err(|_| WorkerError::InvalidArgs)?;
        let inner = Arc::new(Inner {
            jobs: Mutex::new(Jobs {
                slots,
                waiting: VecDeque::with_capacity(config.waiting_threads),
                waiting_limit: config.waiting_threads,
                stopped: false,
            }),
            // One message per job, plus room for the stop request.
            queue: Queue::new(config.job_count + 1)?,
        });
        let task_inner = Arc::clone(&inner);
        let task = Task::spawn(&config.task, move || worker_task(&task_inner))?;
        log::info!(
            "worker {} started ({} jobs, {} waiting threads)",
            config.task.name,
            config.job_count,
            config.waiting_threads,
        );
        Ok(AsyncWorker {
            name: config.task.name.into_owned(),
            inner,
            task: Some(task),
        })
    }

    /// Takes a free job, or, if none is free, registers the caller on the
    /// waiting list.
    pub fn allocate_job(&self) -> Result<Allocation<P>, WorkerError> {
        self.inner.jobs.perform(|j| {
            if j.stopped {
                return Err(WorkerError::Stopped);
            }
            match j.slots.reserve(()) {
                Ok(handle) => Ok(Allocation::Job(Job {
                    handle,
                    params: P::default(),
                })),
                Err(PoolError::NoSpaceAvailable) => {
                    if j.waiting.len() >= j.waiting_limit {
                        log::warn!("worker {}: waiting list is full", self.name);
                        return Err(WorkerError::WaitingListFull);
                    }
                    let (resumer, suspended) = suspension();
                    j.waiting.push_back(resumer);
                    Ok(Allocation::Wait(suspended))
                }
                Err(_) => Err(WorkerError::InvalidArgs),
            }
        })
    }

    /// Like [`AsyncWorker::allocate_job`], but blocks the calling thread
    /// until a job is free.
    pub fn allocate_job_blocking(&self) -> Result<Job<P>, WorkerError> {
        loop {
            match self.allocate_job()? {
                Allocation::Job(job) => return Ok(job),
                Allocation::Wait(s) => {
                    s.wait().ok_or(WorkerError::Stopped)?;
                }
            }
        }
    }
}

impl<P: Send + 'static> AsyncWorker<P> {
    /// Gives a job back, resuming the oldest thread waiting for one.
    pub fn free_job(&self, job: Job<P>) -> Result<(), WorkerError> {
        self.inner.release(job.handle)
    }

    /// Runs `action` on the worker task. The returned suspension resumes with
    /// the job once the action has run.
    pub fn async_exec(
        &self,
        job: Job<P>,
        action: impl FnOnce(&mut P) + Send + 'static,
    ) -> Result<Suspended<Job<P>>, WorkerError> {
        let (resumer, suspended) = suspension();
        self.post(job, Box::new(action), Some(resumer))?;
        Ok(suspended)
    }

    /// Runs `action` on the worker task, which frees the job afterwards.
    pub fn async_exec_no_wait(
        &self,
        job: Job<P>,
        action: impl FnOnce(&mut P) + Send + 'static,
    ) -> Result<(), WorkerError> {
        self.post(job, Box::new(action), None)
    }

    fn post(&self, job: Job<P>, action: Action<P>, done: Option<Resumer<Job<P>>>) -> Result<(), WorkerError> {
        if self.task.is_none() {
            self.inner.release(job.handle)?;
            return Err(WorkerError::Stopped);
        }
        let handle = job.handle;
        if let Err(e) = self.inner.queue.post(Message::Run { job, action, done }) {
            log::error!("worker {}: cannot queue job: {}", self.name, e);
            self.inner.release(handle)?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Number of jobs currently handed out.
    pub fn jobs_in_use(&self) -> usize {
        self.inner.jobs.perform(|j| j.slots.used())
    }

    /// Number of threads waiting for a job.
    pub fn waiting_threads(&self) -> usize {
        self.inner.jobs.perform(|j| j.waiting.len())
    }

    /// Stops the worker task after the jobs already queued have run.
    ///
    /// Threads still on the waiting list are resumed empty-handed (their
    /// suspension yields `None`).
    pub fn shutdown(&mut self) -> Result<(), WorkerError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let abandoned = self.inner.jobs.perform(|j| {
            j.stopped = true;
            std::mem::take(&mut j.waiting)
        });
        drop(abandoned);
        self.inner.queue.post(Message::Stop)?;
        task.join()?;
        log::info!("worker {} stopped", self.name);
        Ok(())
    }
}

impl<P: Send + 'static> Drop for AsyncWorker<P> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("worker {}: shutdown failed: {}", self.name, e);
        }
    }
}

fn worker_task<P>(inner: &Inner<P>) {
    loop {
        let message = match inner.queue.fetch(Timeout::Forever) {
            Ok(m) => m,
            Err(e) => {
                log::error!("worker: job queue failed, stopping: {}", e);
                break;
            }
        };
        let (mut job, action, done) = match message {
            Message::Run { job, action, done } => (job, action, done),
            Message::Stop => break,
        };
        log::trace!("worker: running job {:?}", job.handle);
        if catch_unwind(AssertUnwindSafe(|| action(&mut job.params))).is_err() {
            log::error!("worker: job {:?} panicked", job.handle);
        }
        let orphan = match done {
            Some(resumer) => resumer.resume(job).err(),
            None => Some(job),
        };
        if let Some(job) = orphan {
            if let Err(e) = inner.release(job.handle) {
                log::error!("worker: cannot free job {:?}: {}", job.handle, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn worker(job_count: usize, waiting_threads: usize) -> AsyncWorker<u32> {
        AsyncWorker::initialize(WorkerConfig {
            job_count,
            waiting_threads,
            ..WorkerConfig::default()
        })
        .unwrap()
    }

    fn job(w: &AsyncWorker<u32>) -> Job<u32> {
        match w.allocate_job().unwrap() {
            Allocation::Job(j) => j,
            Allocation::Wait(_) => panic!("expected a free job"),
        }
    }

    #[test]
    fn test_bad_config() {
        for (jobs, waiting) in [(0, 1), (1, 0)] {
            let r = AsyncWorker::<u32>::initialize(WorkerConfig {
                job_count: jobs,
                waiting_threads: waiting,
                ..WorkerConfig::default()
            });
            assert!(matches!(r, Err(WorkerError::InvalidArgs)));
        }
    }

    #[test]
    fn test_exec_round_trip() {
        let w = worker(2, 2);
        let mut j = job(&w);
        j.params = 20;
        let done = w.async_exec(j, |p| *p += 1).unwrap().wait().unwrap();
        assert_eq!(done.params, 21);
        assert_eq!(w.jobs_in_use(), 1);
        w.free_job(done).unwrap();
        assert_eq!(w.jobs_in_use(), 0);
    }

    #[test]
    fn test_no_wait_frees_itself() {
        let w = worker(1, 1);
        let ran = Arc::new(AtomicUsize::new(0));
        let r2 = Arc::clone(&ran);
        w.async_exec_no_wait(job(&w), move |_| {
            r2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        // The only job comes back once the worker is done with it.
        let again = w.allocate_job_blocking().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        w.free_job(again).unwrap();
    }

    #[test]
    fn test_waiter_resumed_by_free() {
        let w = worker(1, 1);
        let held = job(&w);
        let mut wait = match w.allocate_job().unwrap() {
            Allocation::Wait(s) => s,
            Allocation::Job(_) => panic!("pool should be exhausted"),
        };
        assert_eq!(w.waiting_threads(), 1);
        assert!(wait.wait_timeout(Duration::from_millis(10)).is_err());

        // The waiting list is full now.
        assert!(matches!(w.allocate_job(), Err(WorkerError::WaitingListFull)));

        w.free_job(held).unwrap();
        assert_eq!(wait.wait_timeout(Duration::from_secs(2)).unwrap(), Some(()));
        assert_eq!(w.waiting_threads(), 0);
        let j = job(&w);
        w.free_job(j).unwrap();
    }

    #[test]
    fn test_double_free_and_foreign_jobs() {
        let a = worker(1, 1);
        let b = worker(1, 1);
        let ja = job(&a);
        assert!(matches!(b.free_job(Job { handle: ja.handle, params: 0 }), Err(WorkerError::UnknownJob)));
        let h = ja.handle;
        a.free_job(ja).unwrap();
        assert!(matches!(a.free_job(Job { handle: h, params: 0 }), Err(WorkerError::UnknownJob)));
    }

    #[test]
    fn test_panicking_action_returns_job() {
        let w = worker(1, 1);
        let done = w.async_exec(job(&w), |_| panic!("boom")).unwrap().wait().unwrap();
        w.free_job(done).unwrap();
        assert_eq!(w.jobs_in_use(), 0);
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let mut w = worker(1, 2);
        let held = job(&w);
        let wait = match w.allocate_job().unwrap() {
            Allocation::Wait(s) => s,
            Allocation::Job(_) => panic!("pool should be exhausted"),
        };
        w.shutdown().unwrap();
        assert_eq!(wait.wait(), None);
        assert!(matches!(w.allocate_job(), Err(WorkerError::Stopped)));
        assert!(matches!(w.async_exec_no_wait(held, |_| ()), Err(WorkerError::Stopped)));
        assert_eq!(w.jobs_in_use(), 0);
    }
}
