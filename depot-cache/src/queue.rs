//! Bounded work queue with admission control.
//!
//! A fixed pool of tokio tasks drains a FIFO of [`Transaction`]s. Admission
//! is decided synchronously in [`WorkQueue::enqueue`]:
//!
//! - a non-priority job is refused when `max_queued` jobs are already
//!   waiting (load shedding);
//! - a priority job is always admitted.
//!
//! A refused job is cancelled before `enqueue` returns and is never retried.
//! A job admitted with a tag can be withdrawn again until a worker takes it.
//!
//! # Shutdown
//!
//! [`WorkQueue::shutdown`] closes the queue, cancels everything still
//! waiting and joins the workers. Jobs already running are allowed to
//! finish.

use depot_core::{DepotResult, QueueConfig, QueueError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How a serviced job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// The work ran.
    Completed,
    /// The job found nothing left to do and returned without working.
    Skipped,
}

/// Future returned by [`Transaction::service`].
pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceOutcome> + Send + 'static>>;

/// Identifies the queued jobs [`WorkQueue::withdraw`] removes.
pub type JobTag = usize;

/// A unit of work owned by the queue until it is serviced or cancelled.
///
/// Exactly one of the two methods is called, exactly once.
pub trait Transaction: Send + 'static {
    /// Do the work.
    fn service(self: Box<Self>) -> ServiceFuture;

    /// The job will never be serviced (refused, expired, or shut down).
    fn cancel(self: Box<Self>);
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
struct QueueMetrics {
    accepted: AtomicU64,
    rejected: AtomicU64,
    serviced: AtomicU64,
    cancelled: AtomicU64,
    expired: AtomicU64,
    panicked: AtomicU64,
}

/// Snapshot of queue activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Jobs currently waiting for a worker.
    pub queued: usize,
    /// Jobs admitted since startup.
    pub accepted: u64,
    /// Jobs refused by admission control or after shutdown.
    pub rejected: u64,
    /// Jobs a worker ran to completion.
    pub serviced: u64,
    /// Admitted jobs cancelled by shutdown or withdrawal, or skipped by
    /// their worker.
    pub cancelled: u64,
    /// Admitted jobs cancelled for waiting longer than `max_queue_age`.
    pub expired: u64,
    /// Jobs whose service panicked.
    pub panicked: u64,
    pub workers: usize,
}

// ============================================================================
// QUEUE
// ============================================================================

struct Queued {
    job: Box<dyn Transaction>,
    enqueued_at: Instant,
    tag: Option<JobTag>,
}

#[derive(Default)]
struct Backlog {
    jobs: VecDeque<Queued>,
    closed: bool,
}

struct QueueShared {
    backlog: Mutex<Backlog>,
    ready: Notify,
    max_queued: usize,
    max_queue_age: Option<Duration>,
    metrics: QueueMetrics,
}

impl QueueShared {
    fn next_job(&self) -> Option<Queued> {
        self.backlog.lock().jobs.pop_front()
    }
}

/// A bounded FIFO drained by a fixed pool of workers.
pub struct WorkQueue {
    shared: Arc<QueueShared>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WorkQueue {
    /// Validate `config` and spawn its workers on the current tokio runtime.
    pub fn start(config: &QueueConfig) -> DepotResult<Self> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| QueueError::NoRuntime)?;

        let shared = Arc::new(QueueShared {
            backlog: Mutex::new(Backlog::default()),
            ready: Notify::new(),
            max_queued: config.max_queued,
            max_queue_age: config.max_queue_age,
            metrics: QueueMetrics::default(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = (0..config.workers)
            .map(|id| handle.spawn(worker_loop(id, Arc::clone(&shared), shutdown_rx.clone())))
            .collect();

        info!(
            workers = config.workers,
            max_queued = config.max_queued,
            max_queue_age_ms = config.max_queue_age.map(|d| d.as_millis() as u64),
            "Work queue started"
        );

        Ok(Self {
            shared,
            shutdown_tx,
            workers: Mutex::new(workers),
            worker_count: config.workers,
        })
    }

    /// Offer a job. On `Err` the job has already been cancelled.
    pub fn enqueue(&self, job: Box<dyn Transaction>, priority: bool) -> Result<(), QueueError> {
        self.admit(job, priority, None)
    }

    /// Like [`WorkQueue::enqueue`], tagging the job so that it can be
    /// withdrawn while it waits.
    pub fn enqueue_tagged(
        &self,
        job: Box<dyn Transaction>,
        priority: bool,
        tag: JobTag,
    ) -> Result<(), QueueError> {
        self.admit(job, priority, Some(tag))
    }

    fn admit(
        &self,
        job: Box<dyn Transaction>,
        priority: bool,
        tag: Option<JobTag>,
    ) -> Result<(), QueueError> {
        let refusal = {
            let mut backlog = self.shared.backlog.lock();
            if backlog.closed {
                QueueError::ShutDown
            } else if !priority && backlog.jobs.len() >= self.shared.max_queued {
                QueueError::Full {
                    capacity: self.shared.max_queued,
                }
            } else {
                backlog.jobs.push_back(Queued {
                    job,
                    enqueued_at: Instant::now(),
                    tag,
                });
                drop(backlog);
                return self.admitted(priority);
            }
        };

        self.shared.metrics.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(error = %refusal, priority, "Work queue refused job");
        job.cancel();
        Err(refusal)
    }

    fn admitted(&self, priority: bool) -> Result<(), QueueError> {
        self.shared.metrics.accepted.fetch_add(1, Ordering::Relaxed);
        self.shared.ready.notify_one();
        debug!(priority, "Work queue accepted job");
        Ok(())
    }

    /// Cancel every waiting job tagged `tag`. Jobs already taken by a
    /// worker are not affected. Returns the number withdrawn.
    pub fn withdraw(&self, tag: JobTag) -> usize {
        let withdrawn: Vec<Queued> = {
            let mut backlog = self.shared.backlog.lock();
            let (matching, kept): (VecDeque<Queued>, VecDeque<Queued>) = backlog
                .jobs
                .drain(..)
                .partition(|queued| queued.tag == Some(tag));
            backlog.jobs = kept;
            matching.into()
        };
        let count = withdrawn.len();
        for queued in withdrawn {
            self.shared.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
            queued.job.cancel();
        }
        if count > 0 {
            debug!(count, "Withdrew queued jobs");
        }
        count
    }

    pub fn stats(&self) -> QueueStats {
        let metrics = &self.shared.metrics;
        QueueStats {
            queued: self.shared.backlog.lock().jobs.len(),
            accepted: metrics.accepted.load(Ordering::Relaxed),
            rejected: metrics.rejected.load(Ordering::Relaxed),
            serviced: metrics.serviced.load(Ordering::Relaxed),
            cancelled: metrics.cancelled.load(Ordering::Relaxed),
            expired: metrics.expired.load(Ordering::Relaxed),
            panicked: metrics.panicked.load(Ordering::Relaxed),
            workers: self.worker_count,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.backlog.lock().closed
    }

    /// Refuse new work, cancel queued work and wait for the workers to exit.
    pub async fn shutdown(&self) {
        self.close();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Work queue worker ended abnormally");
            }
        }
        info!("Work queue stopped");
    }

    fn close(&self) {
        let drained: Vec<Queued> = {
            let mut backlog = self.shared.backlog.lock();
            if backlog.closed {
                return;
            }
            backlog.closed = true;
            backlog.jobs.drain(..).collect()
        };
        let _ = self.shutdown_tx.send(true);

        if !drained.is_empty() {
            debug!(count = drained.len(), "Cancelling queued jobs on shutdown");
        }
        for queued in drained {
            self.shared.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
            queued.job.cancel();
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

async fn worker_loop(id: usize, shared: Arc<QueueShared>, mut shutdown_rx: watch::Receiver<bool>) {
    debug!(worker = id, "Worker started");
    loop {
        let queued = loop {
            if *shutdown_rx.borrow() {
                debug!(worker = id, "Worker stopping");
                return;
            }
            // Register interest before looking, so a push between the
            // check and the await is not missed.
            let notified = shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(queued) = shared.next_job() {
                break queued;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = &mut notified => {}
            }
        };

        let waited = queued.enqueued_at.elapsed();
        if shared.max_queue_age.is_some_and(|age| waited > age) {
            shared.metrics.expired.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = id,
                waited_ms = waited.as_millis() as u64,
                "Cancelling job that waited too long"
            );
            queued.job.cancel();
            continue;
        }

        // Run on its own task so a panic is caught at the join handle.
        match tokio::spawn(queued.job.service()).await {
            Ok(ServiceOutcome::Completed) => {
                shared.metrics.serviced.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ServiceOutcome::Skipped) => {
                shared.metrics.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(worker = id, "Job skipped service");
            }
            Err(e) if e.is_panic() => {
                shared.metrics.panicked.fetch_add(1, Ordering::Relaxed);
                error!(worker = id, "Job panicked during service");
            }
            Err(e) => {
                error!(worker = id, error = %e, "Job task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Tally {
        serviced: AtomicUsize,
        cancelled: AtomicUsize,
    }

    struct Job {
        tally: Arc<Tally>,
        gate: Option<oneshot::Receiver<()>>,
        started: Option<oneshot::Sender<()>>,
        panics: bool,
    }

    impl Job {
        fn boxed(tally: &Arc<Tally>) -> Box<dyn Transaction> {
            Box::new(Self {
                tally: Arc::clone(tally),
                gate: None,
                started: None,
                panics: false,
            })
        }

        fn gated(
            tally: &Arc<Tally>,
        ) -> (Box<dyn Transaction>, oneshot::Sender<()>, oneshot::Receiver<()>) {
            let (open, gate) = oneshot::channel();
            let (started, started_rx) = oneshot::channel();
            let job = Box::new(Self {
                tally: Arc::clone(tally),
                gate: Some(gate),
                started: Some(started),
                panics: false,
            });
            (job, open, started_rx)
        }
    }

    impl Transaction for Job {
        fn service(self: Box<Self>) -> ServiceFuture {
            Box::pin(async move {
                let Job { tally, gate, started, panics } = *self;
                if let Some(started) = started {
                    let _ = started.send(());
                }
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                if panics {
                    panic!("job panicked on purpose");
                }
                tally.serviced.fetch_add(1, Ordering::SeqCst);
                ServiceOutcome::Completed
            })
        }

        fn cancel(self: Box<Self>) {
            self.tally.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(workers: usize, max_queued: usize) -> QueueConfig {
        QueueConfig::new()
            .with_workers(workers)
            .with_max_queued(max_queued)
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let err = WorkQueue::start(&QueueConfig::default()).unwrap_err();
        assert!(matches!(err, depot_core::DepotError::Queue(QueueError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_start_rejects_zero_workers() {
        let err = WorkQueue::start(&config(0, 1)).unwrap_err();
        assert!(matches!(err, depot_core::DepotError::Config(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_jobs_are_serviced() {
        let queue = WorkQueue::start(&config(2, 16)).expect("queue starts");
        let tally = Arc::new(Tally::default());
        for _ in 0..5 {
            queue.enqueue(Job::boxed(&tally), false).expect("admitted");
        }
        queue.shutdown().await;
        // Shutdown may cancel jobs the workers had not reached yet.
        let done = tally.serviced.load(Ordering::SeqCst) + tally.cancelled.load(Ordering::SeqCst);
        assert_eq!(done, 5);
        assert_eq!(queue.stats().accepted, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_sheds_non_priority() {
        let queue = WorkQueue::start(&config(1, 1)).expect("queue starts");
        let tally = Arc::new(Tally::default());

        let (busy, open, started) = Job::gated(&tally);
        queue.enqueue(busy, false).expect("first job admitted");
        started.await.expect("worker picked up first job");

        queue.enqueue(Job::boxed(&tally), false).expect("one job may wait");
        let refused = queue.enqueue(Job::boxed(&tally), false);
        assert_eq!(refused, Err(QueueError::Full { capacity: 1 }));
        assert_eq!(tally.cancelled.load(Ordering::SeqCst), 1);

        queue.enqueue(Job::boxed(&tally), true).expect("priority bypasses capacity");
        let stats = queue.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.accepted, 3);

        let _ = open.send(());
        queue.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_cancels_waiting_jobs() {
        let queue = WorkQueue::start(&config(1, 8)).expect("queue starts");
        let tally = Arc::new(Tally::default());

        let (busy, open, started) = Job::gated(&tally);
        queue.enqueue(busy, false).expect("admitted");
        started.await.expect("worker picked up job");
        queue.enqueue(Job::boxed(&tally), false).expect("admitted");
        queue.enqueue(Job::boxed(&tally), false).expect("admitted");

        let _ = open.send(());
        queue.shutdown().await;

        assert!(queue.is_shut_down());
        assert_eq!(queue.enqueue(Job::boxed(&tally), true), Err(QueueError::ShutDown));
        let stats = queue.stats();
        assert_eq!(stats.serviced + stats.cancelled, 3);
        assert_eq!(tally.cancelled.load(Ordering::SeqCst) as u64, stats.cancelled + 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_jobs_expire() {
        let queue = WorkQueue::start(
            &config(1, 8).with_max_queue_age(Duration::from_millis(20)),
        )
        .expect("queue starts");
        let tally = Arc::new(Tally::default());

        let (busy, open, started) = Job::gated(&tally);
        queue.enqueue(busy, false).expect("admitted");
        started.await.expect("worker picked up job");
        queue.enqueue(Job::boxed(&tally), false).expect("admitted");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = open.send(());

        for _ in 0..100 {
            if queue.stats().expired == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(queue.stats().expired, 1);
        assert_eq!(tally.cancelled.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_job_does_not_kill_worker() {
        let queue = WorkQueue::start(&config(1, 8)).expect("queue starts");
        let tally = Arc::new(Tally::default());

        queue
            .enqueue(
                Box::new(Job {
                    tally: Arc::clone(&tally),
                    gate: None,
                    started: None,
                    panics: true,
                }),
                false,
            )
            .expect("admitted");
        let (after, open, started) = Job::gated(&tally);
        queue.enqueue(after, false).expect("admitted");
        let _ = open.send(());
        started.await.expect("worker survived the panic");

        for _ in 0..100 {
            if queue.stats().serviced == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = queue.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.serviced, 1);
        queue.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_withdraw_frees_queue_slot() {
        let queue = WorkQueue::start(&config(1, 1)).expect("queue starts");
        let tally = Arc::new(Tally::default());

        let (busy, open, started) = Job::gated(&tally);
        queue.enqueue(busy, false).expect("admitted");
        started.await.expect("worker picked up job");
        queue
            .enqueue_tagged(Job::boxed(&tally), false, 7)
            .expect("one job may wait");

        assert_eq!(queue.withdraw(8), 0);
        assert_eq!(queue.withdraw(7), 1);
        assert_eq!(tally.cancelled.load(Ordering::SeqCst), 1);
        let stats = queue.stats();
        assert_eq!((stats.queued, stats.cancelled), (0, 1));

        queue
            .enqueue(Job::boxed(&tally), false)
            .expect("withdrawn job no longer counts against capacity");
        let _ = open.send(());
        queue.shutdown().await;
    }
}
