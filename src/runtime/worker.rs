/// Bounded-concurrency worker pools
///
/// One pool per named queue. A pool holds `concurrency` semaphore permits;
/// a permit is taken before claiming a job and released when the job's
/// processing task ends, so at most `concurrency` jobs of that queue run at
/// once in this process.
///
/// Claimed jobs are leased for `stalled_after` and a heartbeat renews the
/// lease while the agent runs. Each pool also sweeps its queue every
/// `stalled_after / 2` for leases that ran out, which is how jobs held by a
/// crashed worker (here or in another process) get back on the queue.

use crate::backend::{JobRecord, SqliteBackend};
use crate::config::WorkerConfig;
use crate::runtime::engine::ExecutionEngine;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

/// Polling and recovery knobs shared by every pool
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Job lease length; an active job not renewed for this long is stalled
    pub stalled_after: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            stalled_after: Duration::from_secs(30),
        }
    }
}

impl WorkerOptions {
    fn heartbeat_interval(&self) -> Duration {
        (self.stalled_after / 3).max(Duration::from_millis(10))
    }

    fn sweep_interval(&self) -> Duration {
        (self.stalled_after / 2).max(self.poll_interval)
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            stalled_after: Duration::from_secs(config.stalled_after_secs.max(1)),
        }
    }
}

/// Handle to a running pool; dropping it also stops the pool
pub struct WorkerHandle {
    queue: String,
    concurrency: usize,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Stop claiming new jobs and wait for in-flight jobs to finish
    pub async fn close(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await?;
        tracing::info!(queue = %self.queue, "⏹️ Worker pool stopped");
        Ok(())
    }
}

/// Start a worker pool draining `queue` with up to `concurrency` parallel jobs
pub fn run_worker(
    engine: Arc<ExecutionEngine>,
    queue: impl Into<String>,
    concurrency: usize,
    options: WorkerOptions,
) -> WorkerHandle {
    let queue = queue.into();
    let concurrency = concurrency.max(1);
    let (shutdown, shutdown_rx) = watch::channel(false);

    tracing::info!(queue = %queue, concurrency, "👷 Starting worker pool");
    let task = tokio::spawn(worker_loop(
        engine,
        queue.clone(),
        concurrency,
        options,
        shutdown_rx,
    ));

    WorkerHandle {
        queue,
        concurrency,
        shutdown,
        task,
    }
}

/// One pool per configured queue
pub fn run_pools(engine: Arc<ExecutionEngine>, config: &WorkerConfig) -> Vec<WorkerHandle> {
    let options = WorkerOptions::from(config);
    let mut queues: Vec<(&String, &usize)> = config.concurrency.iter().collect();
    queues.sort();
    queues
        .into_iter()
        .map(|(queue, concurrency)| run_worker(Arc::clone(&engine), queue.clone(), *concurrency, options))
        .collect()
}

async fn worker_loop(
    engine: Arc<ExecutionEngine>,
    queue: String,
    concurrency: usize,
    options: WorkerOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let sweeper = tokio::spawn(sweep_stalled(
        engine.backend().clone(),
        queue.clone(),
        options.sweep_interval(),
        shutdown.clone(),
    ));

    let permits = Arc::new(Semaphore::new(concurrency));

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        match engine
            .backend()
            .claim_next_with_lease(&queue, options.stalled_after)
            .await
        {
            Ok(Some(job)) => {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let _permit = permit;
                    let job_id = job.id.clone();
                    let heartbeat = tokio::spawn(keep_lease(
                        engine.backend().clone(),
                        job.clone(),
                        options.stalled_after,
                        options.heartbeat_interval(),
                    ));
                    let result = engine.process(job).await;
                    heartbeat.abort();
                    if let Err(e) = result {
                        tracing::error!(job_id = %job_id, "❌ Failed to record job outcome: {}", e);
                    }
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(options.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            Err(e) => {
                drop(permit);
                tracing::error!(queue = %queue, "❌ Failed to claim job: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(options.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }

    // every permit back means every in-flight job has finished
    let _ = permits.acquire_many(concurrency as u32).await;
    sweeper.abort();
}

/// Renew a running attempt's lease until the attempt loses ownership
async fn keep_lease(backend: SqliteBackend, job: JobRecord, lease: Duration, every: Duration) {
    loop {
        tokio::time::sleep(every).await;
        match backend.renew_lease(&job, lease).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = %job.id, "⚠️ Job lease lost; outcome of this attempt will be dropped");
                return;
            }
            Err(e) => tracing::warn!(job_id = %job.id, "⚠️ Failed to renew job lease: {}", e),
        }
    }
}

/// Periodically reclaim jobs whose lease ran out
async fn sweep_stalled(
    backend: SqliteBackend,
    queue: String,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        match backend.recover_stalled(&queue).await {
            Ok(recovery) if recovery.total() == 0 => {}
            Ok(recovery) => tracing::warn!(
                queue = %queue,
                requeued = recovery.requeued,
                failed = recovery.failed,
                "♻️ Recovered stalled job(s)"
            ),
            Err(e) => tracing::error!(queue = %queue, "❌ Stalled job recovery failed: {}", e),
        }
    }
}
