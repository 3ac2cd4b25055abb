//! # Job Store
//!
//! Per-node embedded job queue backed by SQLite. Each node owns exactly the
//! jobs in its own database file; ownership across the cluster is resolved by
//! id prefix, never by querying peers.
//!
//! All multi-worker coordination happens through single conditional SQL
//! statements. The claim path in particular is one `UPDATE .. RETURNING`, so
//! two workers can never both take the same job regardless of scheduling.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info};

use crate::types::{JobId, JobInput, JobMode, JobStatus, OrchestratorError, OrchestratorResult};

/// Maximum entries kept in a job's event trail. Older entries are dropped
/// from the front.
pub const EVENT_TRAIL_CAP: usize = 400;

/// A job as stored and served by this node.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub mode: JobMode,
    #[serde(flatten)]
    pub input: JobInput,
    pub settings: serde_json::Value,
    /// Current pipeline stage, mirrored into the event trail.
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_detail: Option<String>,
    /// Fraction complete, in `[0, 1]`.
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<serde_json::Value>,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub mode: JobMode,
    pub input: JobInput,
    pub settings: serde_json::Value,
}

/// Handle to the node-local SQLite store. Cheap to clone.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Fixed-width UTC timestamp. Lexicographic order matches time order, which
/// the staleness sweep relies on.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(raw: &str) -> OrchestratorResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OrchestratorError::Validation(format!("bad timestamp {raw:?}: {e}")))
}

impl JobStore {
    /// Open (creating if necessary) the database at `path` and run the
    /// schema migration.
    pub async fn open(path: &str, busy_timeout_ms: u64) -> OrchestratorResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(OrchestratorError::Store)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                mode TEXT NOT NULL,
                input_kind TEXT NOT NULL,
                input TEXT NOT NULL,
                settings TEXT NOT NULL DEFAULT '{}',
                stage TEXT NOT NULL DEFAULT 'queued',
                stage_detail TEXT,
                progress REAL NOT NULL DEFAULT 0,
                error TEXT,
                result_json TEXT,
                artifacts_json TEXT,
                events TEXT NOT NULL DEFAULT '[]',
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs (status, created_at)",
        )
        .execute(&pool)
        .await?;

        info!(path, "job store opened");
        Ok(Self { pool })
    }

    /// Insert a new queued job owned by `node` and return it.
    pub async fn create(&self, node: &str, new: NewJob) -> OrchestratorResult<Job> {
        let id = JobId::new(node);
        let ts = encode_ts(now());
        let settings = serde_json::to_string(&new.settings)?;
        let first_event = serde_json::to_string(&vec![format!("{ts} created: job accepted")])?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, status, mode, input_kind, input, settings,
                              stage, events, created_at, updated_at)
            VALUES (?, 'queued', ?, ?, ?, ?, 'queued', ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(new.mode.as_str())
        .bind(new.input.kind())
        .bind(new.input.value())
        .bind(&settings)
        .bind(&first_event)
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await?;

        debug!(job_id = %id, mode = %new.mode, kind = new.input.kind(), "job created");
        self.get(&id).await?.ok_or(OrchestratorError::JobNotFound(id))
    }

    /// Atomically claim the oldest queued job, if any.
    ///
    /// This is a single conditional UPDATE, never a read followed by a
    /// write, so concurrent workers cannot claim the same row.
    pub async fn claim_next(&self) -> OrchestratorResult<Option<Job>> {
        let ts = encode_ts(now());
        let row = sqlx::query(
            r#"
            UPDATE jobs
               SET status = 'processing', stage = 'processing',
                   stage_detail = NULL, updated_at = ?
             WHERE id = (
                     SELECT id FROM jobs
                      WHERE status = 'queued'
                      ORDER BY created_at, id
                      LIMIT 1
                   )
               AND status = 'queued'
            RETURNING id
            "#,
        )
        .bind(&ts)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let id = JobId::from(row.get::<String, _>("id"));
                debug!(job_id = %id, "job claimed");
                self.get(&id).await
            }
            None => Ok(None),
        }
    }

    /// Record progress on a processing job and append a stage event.
    ///
    /// Silently skipped once the job left `processing`: a worker that lost
    /// its claim to the stale watchdog must not touch the row again.
    pub async fn update_stage(
        &self,
        id: &JobId,
        stage: &str,
        progress: f64,
        detail: &str,
    ) -> OrchestratorResult<()> {
        let ts = encode_ts(now());
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
               SET stage = ?, stage_detail = ?, progress = ?, updated_at = ?
             WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(stage)
        .bind(detail)
        .bind(progress.clamp(0.0, 1.0))
        .bind(&ts)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 1 {
            self.append_event(id, stage, detail).await?;
        }
        Ok(())
    }

    /// Append `<timestamp> <stage>: <detail>` to the job's event trail,
    /// dropping the oldest entries beyond the cap.
    pub async fn append_event(&self, id: &JobId, stage: &str, detail: &str) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT events FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(OrchestratorError::JobNotFound(id.clone()));
        };

        let mut events: Vec<String> = serde_json::from_str(&row.get::<String, _>("events"))?;
        events.push(format!("{} {stage}: {detail}", encode_ts(now())));
        if events.len() > EVENT_TRAIL_CAP {
            let overflow = events.len() - EVENT_TRAIL_CAP;
            events.drain(..overflow);
        }

        sqlx::query("UPDATE jobs SET events = ? WHERE id = ?")
            .bind(serde_json::to_string(&events)?)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Move a job to a terminal state. Idempotent: only applies if the job
    /// is still queued or processing, so a second finish (e.g. after a stale
    /// requeue raced a slow worker) is a no-op.
    pub async fn finish(
        &self,
        id: &JobId,
        status: JobStatus,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
        artifacts: Option<&serde_json::Value>,
    ) -> OrchestratorResult<bool> {
        debug_assert!(status.is_terminal());
        let ts = encode_ts(now());
        let result_json = result.map(serde_json::to_string).transpose()?;
        let artifacts_json = artifacts.map(serde_json::to_string).transpose()?;
        // Completion pins progress at 1.0; a failure keeps the last reported
        // value.
        let progress = if status == JobStatus::Completed { 1.0 } else { -1.0 };

        let outcome = sqlx::query(
            r#"
            UPDATE jobs
               SET status = ?, stage = ?, stage_detail = ?, updated_at = ?,
                   error = ?, result_json = ?, artifacts_json = ?,
                   progress = CASE WHEN ? >= 0 THEN ? ELSE progress END
             WHERE id = ? AND status IN ('queued', 'processing')
            "#,
        )
        .bind(status.as_str())
        .bind(status.as_str())
        .bind(error.unwrap_or("done"))
        .bind(&ts)
        .bind(error)
        .bind(&result_json)
        .bind(&artifacts_json)
        .bind(progress)
        .bind(progress)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        let applied = outcome.rows_affected() == 1;
        if applied {
            self.append_event(id, status.as_str(), error.unwrap_or("done"))
                .await?;
        }
        Ok(applied)
    }

    pub async fn get(&self, id: &JobId) -> OrchestratorResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(job_from_row).transpose()
    }

    /// Event trail for a job, oldest first.
    pub async fn events(&self, id: &JobId) -> OrchestratorResult<Option<Vec<String>>> {
        let row = sqlx::query("SELECT events FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.get::<String, _>("events"))?)),
            None => Ok(None),
        }
    }

    /// Most recently created jobs, newest first.
    pub async fn list_recent(&self, limit: i64) -> OrchestratorResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(job_from_row).collect()
    }

    /// Delete a single job. Returns whether a row was removed.
    pub async fn delete(&self, id: &JobId) -> OrchestratorResult<bool> {
        let outcome = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(outcome.rows_affected() == 1)
    }

    /// Delete a batch of jobs, returning how many existed.
    pub async fn delete_many(&self, ids: &[JobId]) -> OrchestratorResult<u64> {
        let mut deleted = 0;
        for id in ids {
            if self.delete(id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Job counts per status, for /metrics.
    pub async fn counts_by_status(&self) -> OrchestratorResult<HashMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
            .collect())
    }

    /// Requeue every `processing` job. Called once at node startup: no
    /// worker can hold a claim across a node restart, so every processing
    /// row is an orphan.
    pub async fn recover_on_startup(&self) -> OrchestratorResult<u64> {
        let ts = encode_ts(now());
        let outcome = sqlx::query(
            r#"
            UPDATE jobs
               SET status = 'queued', stage = 'queued', stage_detail = 'recovered',
                   updated_at = ?, attempts = attempts + 1
             WHERE status = 'processing'
            "#,
        )
        .bind(&ts)
        .execute(&self.pool)
        .await?;
        let recovered = outcome.rows_affected();
        if recovered > 0 {
            info!(recovered, "requeued orphaned processing jobs at startup");
        }
        Ok(recovered)
    }

    /// Requeue processing jobs whose last update is older than `timeout`.
    /// Run periodically by the watchdog to recover from workers that died
    /// mid-job.
    pub async fn requeue_stale(&self, timeout: Duration) -> OrchestratorResult<u64> {
        let cutoff = encode_ts(now() - chrono::Duration::from_std(timeout).unwrap_or_default());
        let rows = sqlx::query("SELECT id FROM jobs WHERE status = 'processing' AND updated_at < ?")
            .bind(&cutoff)
            .fetch_all(&self.pool)
            .await?;

        let mut recovered = 0;
        for row in rows {
            let id = JobId::from(row.get::<String, _>("id"));
            let ts = encode_ts(now());
            let outcome = sqlx::query(
                r#"
                UPDATE jobs
                   SET status = 'queued', stage = 'queued', stage_detail = 'recovered',
                       updated_at = ?, attempts = attempts + 1
                 WHERE id = ? AND status = 'processing' AND updated_at < ?
                "#,
            )
            .bind(&ts)
            .bind(id.as_str())
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
            if outcome.rows_affected() == 1 {
                self.append_event(&id, "recovered", "requeued after stale timeout")
                    .await?;
                info!(job_id = %id, "requeued stale job");
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

/// Background watchdog: periodically requeue processing jobs whose worker
/// stopped updating them. Runs until the process exits. A zero timeout
/// disables the watchdog entirely.
pub async fn run_stale_watchdog(store: JobStore, timeout: Duration, interval: Duration) {
    if timeout.is_zero() {
        info!("stale watchdog disabled");
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match store.requeue_stale(timeout).await {
            Ok(0) => {}
            Ok(recovered) => info!(recovered, "stale watchdog requeued jobs"),
            Err(err) => tracing::warn!(error = %err, "stale sweep failed"),
        }
    }
}

fn job_from_row(row: sqlx::sqlite::SqliteRow) -> OrchestratorResult<Job> {
    let status: String = row.get("status");
    let mode: String = row.get("mode");
    let input_kind: String = row.get("input_kind");
    let input_value: String = row.get("input");
    let settings: String = row.get("settings");
    let result_json: Option<String> = row.get("result_json");
    let artifacts_json: Option<String> = row.get("artifacts_json");

    Ok(Job {
        id: JobId::from(row.get::<String, _>("id")),
        status: status.parse()?,
        mode: mode.parse()?,
        input: JobInput::from_parts(&input_kind, input_value)?,
        settings: serde_json::from_str(&settings)?,
        stage: row.get("stage"),
        stage_detail: row.get("stage_detail"),
        progress: row.get("progress"),
        error: row.get("error"),
        result: result_json.map(|s| serde_json::from_str(&s)).transpose()?,
        artifacts: artifacts_json.map(|s| serde_json::from_str(&s)).transpose()?,
        attempts: row.get("attempts"),
        created_at: decode_ts(&row.get::<String, _>("created_at"))?,
        updated_at: decode_ts(&row.get::<String, _>("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store() -> (JobStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let store = JobStore::open(path.to_str().unwrap(), 5000).await.unwrap();
        (store, dir)
    }

    fn sample_job() -> NewJob {
        NewJob {
            mode: JobMode::Pipeline,
            input: JobInput::Url("https://example.com/spot.mp4".to_string()),
            settings: json!({"frames": 16}),
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let (store, _dir) = test_store().await;
        let job = store.create("node-a", sample_job()).await.unwrap();
        assert!(job.id.is_owned_by("node-a"));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0.0);

        let fetched = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.input, job.input);
        assert_eq!(fetched.settings, json!({"frames": 16}));
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let (store, _dir) = test_store().await;
        let first = store.create("node-a", sample_job()).await.unwrap();
        let second = store.create("node-a", sample_job()).await.unwrap();

        let claimed = store.claim_next().await.unwrap().unwrap();
        // Same-timestamp rows tie-break on id.
        let expected = if first.created_at == second.created_at {
            std::cmp::min(first.id.as_str(), second.id.as_str()).to_string()
        } else {
            first.id.as_str().to_string()
        };
        assert_eq!(claimed.id.as_str(), expected);
        assert_eq!(claimed.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn concurrent_claims_take_distinct_jobs() {
        let (store, _dir) = test_store().await;
        store.create("node-a", sample_job()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_next().await.unwrap() }));
        }
        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn finish_is_idempotent() {
        let (store, _dir) = test_store().await;
        let job = store.create("node-a", sample_job()).await.unwrap();
        store.claim_next().await.unwrap().unwrap();

        let result = json!({"label": "automotive", "confidence": 0.93});
        let applied = store
            .finish(&job.id, JobStatus::Completed, None, Some(&result), None)
            .await
            .unwrap();
        assert!(applied);

        // Second finish loses.
        let applied = store
            .finish(&job.id, JobStatus::Failed, Some("late failure"), None, None)
            .await
            .unwrap();
        assert!(!applied);

        let job = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.stage, "completed");
        assert_eq!(job.result, Some(result));
        assert!(job.error.is_none());
    }

    #[tokio::test]
    async fn stage_fields_follow_the_lifecycle() {
        let (store, _dir) = test_store().await;
        let job = store.create("node-a", sample_job()).await.unwrap();
        assert_eq!(job.stage, "queued");
        assert!(job.stage_detail.is_none());

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.stage, "processing");

        store
            .update_stage(&job.id, "classify", 0.4, "frame batch 2/5")
            .await
            .unwrap();
        let job = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.stage, "classify");
        assert_eq!(job.stage_detail.as_deref(), Some("frame batch 2/5"));
        assert_eq!(job.progress, 0.4);

        // The fields are part of the serialized job document.
        let as_json = serde_json::to_value(&job).unwrap();
        assert_eq!(as_json["stage"], "classify");
        assert_eq!(as_json["stage_detail"], "frame batch 2/5");

        store
            .finish(&job.id, JobStatus::Failed, Some("bad frame"), None, None)
            .await
            .unwrap();
        let job = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.stage, "failed");
        assert_eq!(job.stage_detail.as_deref(), Some("bad frame"));
        // Failure keeps the last reported progress.
        assert_eq!(job.progress, 0.4);
    }

    #[tokio::test]
    async fn recovery_resets_stage_fields() {
        let (store, _dir) = test_store().await;
        let job = store.create("node-a", sample_job()).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        store.recover_on_startup().await.unwrap();

        let job = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.stage, "queued");
        assert_eq!(job.stage_detail.as_deref(), Some("recovered"));
    }

    #[tokio::test]
    async fn event_trail_is_capped() {
        let (store, _dir) = test_store().await;
        let job = store.create("node-a", sample_job()).await.unwrap();

        for i in 0..(EVENT_TRAIL_CAP + 25) {
            store
                .append_event(&job.id, "stage", &format!("step {i}"))
                .await
                .unwrap();
        }
        let events = store.events(&job.id).await.unwrap().unwrap();
        assert_eq!(events.len(), EVENT_TRAIL_CAP);
        // The newest entry survived, the oldest were dropped.
        assert!(events.last().unwrap().contains("step 424"));
        assert!(!events.iter().any(|e| e.contains("created:")));
    }

    #[tokio::test]
    async fn startup_recovery_requeues_processing_jobs() {
        let (store, _dir) = test_store().await;
        let job = store.create("node-a", sample_job()).await.unwrap();
        store.claim_next().await.unwrap().unwrap();

        let recovered = store.recover_on_startup().await.unwrap();
        assert_eq!(recovered, 1);

        let job = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn stale_sweep_skips_fresh_jobs() {
        let (store, _dir) = test_store().await;
        store.create("node-a", sample_job()).await.unwrap();
        store.claim_next().await.unwrap().unwrap();

        // Freshly updated: a 10-minute cutoff leaves it alone.
        let recovered = store.requeue_stale(Duration::from_secs(600)).await.unwrap();
        assert_eq!(recovered, 0);

        // Zero timeout makes everything stale.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let recovered = store.requeue_stale(Duration::from_secs(0)).await.unwrap();
        assert_eq!(recovered, 1);
    }

    #[tokio::test]
    async fn counts_and_deletes() {
        let (store, _dir) = test_store().await;
        let a = store.create("node-a", sample_job()).await.unwrap();
        let b = store.create("node-a", sample_job()).await.unwrap();
        store.create("node-a", sample_job()).await.unwrap();
        store.claim_next().await.unwrap().unwrap();

        let counts = store.counts_by_status().await.unwrap();
        assert_eq!(counts.get("processing"), Some(&1));
        assert_eq!(counts.get("queued"), Some(&2));

        let deleted = store.delete_many(&[a.id.clone(), b.id.clone(), JobId::from("node-a-nope")])
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_recent_is_newest_first() {
        let (store, _dir) = test_store().await;
        for _ in 0..3 {
            store.create("node-a", sample_job()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let jobs = store.list_recent(2).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].created_at >= jobs[1].created_at);
    }
}
