//! The poll loop.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use relayq_core::{RetryPolicy, Task, WorkerId};
use relayq_store::{ClaimRequest, StoreError, TaskStore};

use crate::handler::{TaskHandler, TaskOutcome};

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity used for every claim and ownership check.
    pub worker_id: WorkerId,
    /// How long to sleep when a poll finds nothing (also the pause after a
    /// store failure).
    pub poll_interval: Duration,
    /// Lease granted per claim; size it above the expected handler runtime
    /// or configure a heartbeat.
    pub lease_seconds: u32,
    /// Tasks claimed per poll.
    pub batch_size: usize,
    /// Restrict this worker to one task type; `None` takes anything.
    pub task_type: Option<String>,
    /// Renew the lease this often while a handler runs.
    pub heartbeat: Option<Duration>,
    /// Backoff curve applied when a handler asks for a retry.
    pub retry_policy: RetryPolicy,
}

impl WorkerConfig {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            poll_interval: Duration::from_millis(500),
            lease_seconds: 60,
            batch_size: 1,
            task_type: None,
            heartbeat: None,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease_seconds(mut self, lease_seconds: u32) -> Self {
        self.lease_seconds = lease_seconds;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = Some(interval);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    /// Terminal calls that lost to a concurrent lease reclaim.
    pub conflicts: u64,
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the loop to finish its
    /// current task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        let _ = self.join.await;
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }
}

/// Polling worker: claims tasks, runs registered handlers, reports outcomes.
pub struct Worker<S: TaskStore> {
    store: Arc<S>,
    config: WorkerConfig,
    handlers: HashMap<String, TaskHandler>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S: TaskStore + 'static> Worker<S> {
    pub fn new(store: Arc<S>, config: WorkerConfig) -> Self {
        Self {
            store,
            config,
            handlers: HashMap::new(),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Register a handler for a task type.
    pub fn register_handler<F, Fut>(&mut self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = TaskOutcome> + Send + 'static,
    {
        self.handlers
            .insert(task_type.into(), Box::new(move |task| Box::pin(handler(task))));
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap().clone()
    }

    /// One poll cycle: claim a batch and process it sequentially. Returns
    /// how many tasks were processed. Exposed for tests and synchronous
    /// embedding; [`Worker::spawn`] drives it forever.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let mut request =
            ClaimRequest::new(self.config.worker_id.clone(), self.config.lease_seconds)
                .with_limit(self.config.batch_size);
        if let Some(task_type) = &self.config.task_type {
            request = request.with_task_type(task_type.clone());
        }

        let batch = self.store.claim(request).await?;
        let claimed = batch.len();
        for task in batch {
            self.process(task).await?;
        }
        Ok(claimed)
    }

    /// Spawn the loop onto the runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let stats = Arc::clone(&self.stats);
        let worker_id = self.config.worker_id.clone();

        let join = tokio::spawn(async move {
            info!(worker = %worker_id, "worker started");
            loop {
                // Shutdown is only honored between poll cycles, so a task
                // mid-handler always gets its outcome reported.
                let idle = match self.run_once().await {
                    Ok(0) => true,
                    Ok(_) => false,
                    Err(e) if e.is_transient() => {
                        // The store itself hiccupped; pause and retry the
                        // poll. Orthogonal to task-level retry.
                        warn!(worker = %worker_id, error = %e, "store unavailable, pausing");
                        true
                    }
                    Err(e) => {
                        error!(worker = %worker_id, error = %e, "poll cycle failed");
                        true
                    }
                };

                let wait = if idle {
                    self.config.poll_interval
                } else {
                    Duration::ZERO
                };
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            info!(worker = %worker_id, "worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn process(&self, task: Task) -> Result<(), StoreError> {
        let task_id = task.id;
        let worker = &self.config.worker_id;

        let Some(handler) = self.handlers.get(&task.task_type) else {
            warn!(task_id = %task_id, task_type = %task.task_type, "no handler for task type");
            let applied = self
                .store
                .fail_retry(
                    task_id,
                    worker,
                    &format!("no handler registered for task type {}", task.task_type),
                    &self.config.retry_policy,
                )
                .await?;
            self.record(|s| {
                s.processed += 1;
                if applied {
                    s.retried += 1;
                } else {
                    s.conflicts += 1;
                }
            });
            return Ok(());
        };

        debug!(task_id = %task_id, task_type = %task.task_type, attempt = task.attempts, "processing task");
        let outcome = self.run_handler(handler, task).await;

        let applied = match &outcome {
            TaskOutcome::Complete(result_ref) => {
                self.store
                    .ack(task_id, worker, result_ref.clone())
                    .await?
            }
            TaskOutcome::Retry(error) => {
                self.store
                    .fail_retry(task_id, worker, error, &self.config.retry_policy)
                    .await?
            }
            TaskOutcome::RetryWithoutPenalty {
                reason,
                jitter_seconds,
            } => {
                self.store
                    .requeue_without_penalty(task_id, worker, reason, *jitter_seconds)
                    .await?
            }
            TaskOutcome::Fatal(error) => self.store.mark_dead(task_id, worker, error).await?,
        };

        if !applied {
            // Another worker reclaimed the lease mid-flight; our side effect
            // may or may not have "won" and the reclaimer owns the retry.
            warn!(task_id = %task_id, "lost ownership before reporting outcome");
        }

        self.record(|s| {
            s.processed += 1;
            if !applied {
                s.conflicts += 1;
                return;
            }
            match outcome {
                TaskOutcome::Complete(_) => s.succeeded += 1,
                TaskOutcome::Retry(_) => s.retried += 1,
                TaskOutcome::RetryWithoutPenalty { .. } => s.requeued += 1,
                TaskOutcome::Fatal(_) => s.dead_lettered += 1,
            }
        });
        Ok(())
    }

    /// Drive the handler, renewing the lease on the heartbeat interval if
    /// one is configured.
    async fn run_handler(&self, handler: &TaskHandler, task: Task) -> TaskOutcome {
        let task_id = task.id;
        let mut fut = pin!(handler(task));

        let Some(heartbeat) = self.config.heartbeat else {
            return fut.await;
        };

        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate
        loop {
            tokio::select! {
                outcome = &mut fut => return outcome,
                _ = ticker.tick() => {
                    match self
                        .store
                        .renew(task_id, &self.config.worker_id, self.config.lease_seconds)
                        .await
                    {
                        Ok(true) => debug!(task_id = %task_id, "lease renewed"),
                        Ok(false) => {
                            // Lease already reclaimed; the terminal call will
                            // report the conflict, keep the handler running.
                            warn!(task_id = %task_id, "heartbeat lost ownership");
                        }
                        Err(e) => warn!(task_id = %task_id, error = %e, "heartbeat renew failed"),
                    }
                }
            }
        }
    }

    fn record(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap());
    }
}
