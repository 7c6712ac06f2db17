//! Asynchronous job surface over the orchestrator. Jobs are durable rows;
//! this process claims them under a lease, runs the pipeline, and writes
//! progress snapshots a caller can poll. Workers that die mid-job are
//! tolerated: the lease expires and the job re-runs from scratch, which
//! converges because uploads are idempotent by path and piece inserts are
//! deduplicated by `(batch_id, piece_index)`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use chrono::Utc;
use log::{error, info, warn};
use serde_derive::Serialize;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::data_structures::{BatchConfig, BatchResult, BatchState, ProgressUpdate};
use crate::errors::EngineError;
use crate::orchestrator::{validate_config, Orchestrator};
use crate::persistence::{JobRecord, Persistence};

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: BatchState,
    pub progress_pct: u8,
    pub stage: Option<String>,
    pub error: Option<String>,
}

pub struct JobManager {
    orchestrator: Arc<Orchestrator>,
    db: Persistence,
    lease: Duration,
    max_concurrent: usize,
    max_pending: usize,
    poll_interval: Duration,
    sync_cap: Duration,
    running: Arc<AtomicUsize>,
    cancel_handles: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl JobManager {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        lease: Duration,
        total_worker_budget: usize,
        per_batch_workers: usize,
        poll_interval: Duration,
        sync_cap: Duration,
    ) -> Self {
        // The product of concurrent batches and per-batch workers stays
        // within the configured budget; the queue takes up the slack.
        let max_concurrent = (total_worker_budget / per_batch_workers.max(1)).max(1);
        let db = orchestrator.db().clone();
        JobManager {
            orchestrator,
            db,
            lease,
            max_concurrent,
            max_pending: max_concurrent * 4,
            poll_interval,
            sync_cap,
            running: Arc::new(AtomicUsize::new(0)),
            cancel_handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Enqueue a batch for background execution. Structural config errors
    /// and unknown avatars are rejected here, before a row is written.
    pub async fn submit(
        &self,
        avatar_id: &str,
        config: BatchConfig,
    ) -> Result<String, EngineError> {
        validate_config(&config)?;
        if self.db.get_avatar(avatar_id).await?.is_none() {
            return Err(EngineError::AvatarNotFound(avatar_id.to_string()));
        }
        if self.db.count_running_jobs().await? >= self.max_pending {
            return Err(EngineError::SubmissionRefused);
        }

        let now = Utc::now();
        let job = JobRecord {
            id: Uuid::new_v4().to_string(),
            avatar_id: avatar_id.to_string(),
            config,
            state: BatchState::Queued,
            progress_pct: 0,
            stage: None,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_job(&job).await?;
        info!("Job {} queued for avatar {}", job.id, avatar_id);
        Ok(job.id)
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus, EngineError> {
        let job = self
            .db
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        Ok(JobStatus {
            job_id: job.id,
            state: job.state,
            progress_pct: job.progress_pct,
            stage: job.stage,
            error: job.error,
        })
    }

    /// Defined only once the job reached a terminal state.
    pub async fn result(&self, job_id: &str) -> Result<BatchResult, EngineError> {
        let job = self
            .db
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        if !job.state.is_terminal() {
            return Err(EngineError::Validation(format!(
                "job {} is still {}",
                job_id,
                job.state.as_str()
            )));
        }
        job.result.ok_or_else(|| {
            EngineError::Persistence(format!("job {} has no stored result", job_id))
        })
    }

    /// Request cancellation of a job. Queued jobs finish immediately;
    /// running jobs observe the token at their next suspension point.
    pub async fn cancel(&self, job_id: &str) -> Result<(), EngineError> {
        if let Some(token) = self.cancel_handles.lock().unwrap().get(job_id) {
            token.cancel();
            return Ok(());
        }
        let job = self
            .db
            .get_job(job_id)
            .await?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        if job.state == BatchState::Queued {
            self.db
                .finish_job(job_id, BatchState::Cancelled, Some("cancelled"), None)
                .await?;
        }
        Ok(())
    }

    /// Synchronous invocation: bypasses the queue and blocks the caller,
    /// under a hard cap. Past the cap the batch is cancelled and the caller
    /// is pointed at the asynchronous surface.
    pub async fn submit_sync(
        &self,
        avatar_id: &str,
        config: BatchConfig,
    ) -> Result<BatchResult, EngineError> {
        let cancel = CancellationToken::new();
        let run = self.orchestrator.run_batch(avatar_id, config, cancel.clone(), None);
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = sleep(self.sync_cap) => {
                warn!("Synchronous batch for {} hit the {}s cap", avatar_id, self.sync_cap.as_secs());
                cancel.cancel();
                // Let the pipeline observe the token and unwind cleanly.
                let _ = run.await;
                Err(EngineError::Validation(format!(
                    "synchronous batches are capped at {}s; use the asynchronous surface",
                    self.sync_cap.as_secs()
                )))
            }
        }
    }

    /// Long-running worker: reclaim stale leases, claim queued jobs up to
    /// the concurrency cap, execute them. Returns when `shutdown` fires.
    pub async fn run_worker_loop(self: Arc<Self>, shutdown: CancellationToken) {
        if let Err(e) = self.db.reclaim_stale_jobs().await {
            error!("Lease reclaim failed: {}", e);
        }
        let mut ticks: u64 = 0;
        loop {
            if shutdown.is_cancelled() {
                info!("Job worker loop stopping");
                break;
            }
            // Periodic reclaim so another process's abandoned jobs get
            // picked up even in a long-lived daemon.
            ticks += 1;
            if ticks % 60 == 0 {
                if let Err(e) = self.db.reclaim_stale_jobs().await {
                    error!("Lease reclaim failed: {}", e);
                }
            }
            Self::spawn_claimable(&self).await;
            sleep(self.poll_interval).await;
        }
    }

    /// Drain mode: execute queued jobs one after another until the queue is
    /// empty. Used by `--once` runs and tests.
    pub async fn drain_once(&self) {
        if let Err(e) = self.db.reclaim_stale_jobs().await {
            error!("Lease reclaim failed: {}", e);
        }
        loop {
            match self.db.claim_next_queued_job(self.lease).await {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => break,
                Err(e) => {
                    error!("Claiming job failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn spawn_claimable(this: &Arc<Self>) {
        while this.running.load(Ordering::SeqCst) < this.max_concurrent {
            let job = match this.db.claim_next_queued_job(this.lease).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!("Claiming job failed: {}", e);
                    break;
                }
            };
            let manager = this.clone();
            this.running.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                manager.execute(job).await;
                manager.running.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn execute(&self, job: JobRecord) {
        info!("Executing job {} for avatar {}", job.id, job.avatar_id);
        let cancel = CancellationToken::new();
        self.cancel_handles
            .lock()
            .unwrap()
            .insert(job.id.clone(), cancel.clone());

        // Single consumer turns worker progress records into the observable
        // job row.
        let (tx, mut rx) = unbounded_channel::<ProgressUpdate>();
        let db = self.db.clone();
        let job_id = job.id.clone();
        let consumer = tokio::spawn(async move {
            let mut last_pct = 0u8;
            while let Some(update) = rx.recv().await {
                let pct = update.percent();
                if pct > last_pct {
                    last_pct = pct;
                    if let Err(e) = db
                        .update_job_progress(&job_id, pct, update.stage.as_str())
                        .await
                    {
                        warn!("Progress write failed for job {}: {}", job_id, e);
                    }
                }
            }
        });

        let outcome = self
            .orchestrator
            .run_batch(&job.avatar_id, job.config.clone(), cancel, Some(tx))
            .await;
        // Sender side is gone; let the consumer flush its queue.
        let _ = consumer.await;
        self.cancel_handles.lock().unwrap().remove(&job.id);

        let write = match &outcome {
            Ok(result) => {
                self.db
                    .finish_job(&job.id, result.state, result.error.as_deref(), Some(result))
                    .await
            }
            Err(e) => {
                self.db
                    .finish_job(
                        &job.id,
                        BatchState::Failed,
                        Some(&format!("{}: {}", e.code(), e)),
                        None,
                    )
                    .await
            }
        };
        if let Err(e) = write {
            error!("Could not record terminal state for job {}: {}", job.id, e);
        }
    }
}
