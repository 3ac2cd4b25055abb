//! # Worker Loop
//!
//! Claim the oldest queued job, run the pipeline, finish the job, repeat.
//! Runs inside a dedicated worker process; the only shared state with the
//! node is the SQLite database, so everything here goes through the store's
//! conditional updates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::pipeline::{Pipeline, StageSink};
use crate::store::{Job, JobStore};
use crate::types::{JobId, JobStatus};

/// Sleep between claim attempts when the queue is empty.
const IDLE_BACKOFF: Duration = Duration::from_secs(1);

/// Persists pipeline progress into the job's row.
struct StoreSink {
    store: JobStore,
    id: JobId,
}

#[async_trait]
impl StageSink for StoreSink {
    async fn stage(&self, stage: &str, progress: f64, detail: &str) -> anyhow::Result<()> {
        self.store.update_stage(&self.id, stage, progress, detail).await?;
        Ok(())
    }
}

pub struct WorkerRunner {
    store: JobStore,
    pipeline: Arc<dyn Pipeline>,
    label: String,
}

impl WorkerRunner {
    pub fn new(store: JobStore, pipeline: Arc<dyn Pipeline>, label: impl Into<String>) -> Self {
        Self {
            store,
            pipeline,
            label: label.into(),
        }
    }

    /// Run until the process is terminated. Claim failures are logged and
    /// retried; they usually mean transient database contention.
    pub async fn run(&self) {
        info!(worker = %self.label, "worker loop started");
        loop {
            match self.store.claim_next().await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => tokio::time::sleep(IDLE_BACKOFF).await,
                Err(err) => {
                    warn!(worker = %self.label, error = %err, "claim failed");
                    tokio::time::sleep(IDLE_BACKOFF).await;
                }
            }
        }
    }

    /// Execute one claimed job and move it to a terminal state exactly once.
    pub async fn process(&self, job: Job) {
        let id = job.id.clone();
        info!(worker = %self.label, job_id = %id, mode = %job.mode, "job started");
        if let Err(err) = self.store.append_event(&id, "started", &self.label).await {
            warn!(job_id = %id, error = %err, "could not record start event");
        }

        let sink = StoreSink {
            store: self.store.clone(),
            id: id.clone(),
        };

        let finish = match self.pipeline.run(&job, &sink).await {
            Ok(output) => {
                self.store
                    .finish(
                        &id,
                        JobStatus::Completed,
                        None,
                        Some(&output.result),
                        output.artifacts.as_ref(),
                    )
                    .await
            }
            Err(err) => {
                error!(worker = %self.label, job_id = %id, error = %err, "pipeline failed");
                self.store
                    .finish(&id, JobStatus::Failed, Some(&err.to_string()), None, None)
                    .await
            }
        };

        match finish {
            Ok(true) => info!(worker = %self.label, job_id = %id, "job finished"),
            // The watchdog requeued it out from under us after the timeout.
            Ok(false) => warn!(worker = %self.label, job_id = %id, "job was no longer ours"),
            Err(err) => error!(worker = %self.label, job_id = %id, error = %err, "finish failed"),
        }
    }
}
