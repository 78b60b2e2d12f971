use anyhow::Result;
use common::db::AsyncDb;
use std::time::Instant;

/// Records a job run in `job_status`: `running` on start, then `idle` or `failed`.
pub struct JobTracker {
    db: AsyncDb,
    job_name: String,
    start_time: Instant,
}

impl JobTracker {
    pub async fn start(db: &AsyncDb, job_name: &str) -> Result<Self> {
        let name = job_name.to_string();
        db.call_named("job_tracker.start", move |conn| {
            conn.execute(
                "INSERT INTO job_status (job_name, status, last_run_at, updated_at)
                 VALUES (?1, 'running',
                         strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),
                         strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
                 ON CONFLICT(job_name) DO UPDATE SET
                    status = 'running',
                    last_run_at = excluded.last_run_at,
                    updated_at = excluded.updated_at,
                    last_error = NULL,
                    duration_ms = NULL",
                rusqlite::params![name],
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            db: db.clone(),
            job_name: job_name.to_string(),
            start_time: Instant::now(),
        })
    }

    fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    pub async fn success(self, metadata: Option<serde_json::Value>) -> Result<()> {
        let duration_ms = self.elapsed_ms();
        let name = self.job_name;
        let meta_str = metadata.map(|v| v.to_string());

        self.db
            .call_named("job_tracker.success", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = 'idle',
                        duration_ms = ?2,
                        metadata = ?3,
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE job_name = ?1",
                    rusqlite::params![name, duration_ms, meta_str],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn fail(self, error: &anyhow::Error) -> Result<()> {
        let duration_ms = self.elapsed_ms();
        let name = self.job_name;
        let error_msg = format!("{error:#}");

        self.db
            .call_named("job_tracker.fail", move |conn| {
                conn.execute(
                    "UPDATE job_status SET
                        status = 'failed',
                        duration_ms = ?2,
                        last_error = ?3,
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE job_name = ?1",
                    rusqlite::params![name, duration_ms, error_msg],
                )?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn status_row(db: &AsyncDb) -> (String, Option<i64>, Option<String>, Option<String>) {
        db.call(|conn| {
            Ok(conn.query_row(
                "SELECT status, duration_ms, last_error, metadata FROM job_status
                 WHERE job_name = 'test_job'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_then_success_marks_idle_with_metadata() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tracker = JobTracker::start(&db, "test_job").await.unwrap();
        assert_eq!(status_row(&db).await.0, "running");

        tracker
            .success(Some(serde_json::json!({"checked": 3, "changed": 1})))
            .await
            .unwrap();

        let (status, duration_ms, last_error, metadata) = status_row(&db).await;
        assert_eq!(status, "idle");
        assert!(duration_ms.is_some());
        assert!(last_error.is_none());
        let meta: serde_json::Value = serde_json::from_str(&metadata.unwrap()).unwrap();
        assert_eq!(meta["changed"], 1);
    }

    #[tokio::test]
    async fn test_fail_records_error_and_restart_clears_it() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let tracker = JobTracker::start(&db, "test_job").await.unwrap();
        tracker
            .fail(&anyhow::anyhow!("disk full").context("recheck failed"))
            .await
            .unwrap();

        let (status, _, last_error, _) = status_row(&db).await;
        assert_eq!(status, "failed");
        assert_eq!(last_error.as_deref(), Some("recheck failed: disk full"));

        let _tracker = JobTracker::start(&db, "test_job").await.unwrap();
        let (status, duration_ms, last_error, _) = status_row(&db).await;
        assert_eq!(status, "running");
        assert!(duration_ms.is_none());
        assert!(last_error.is_none());
    }
}
