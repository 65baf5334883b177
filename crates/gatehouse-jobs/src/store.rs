//! Job Store
//!
//! Relational storage for delayed jobs. Each topic owns two tables derived
//! deterministically from its name:
//!
//! - **due table** `job_<topic>`: `(job_id BIGINT PK, payload BLOB,
//!   ctime BIGINT, due_time BIGINT)` - jobs waiting to fire
//! - **history table** `job_<topic>_archive`: the due columns plus
//!   `(etime BIGINT, actor_id VARCHAR)` - jobs that fired
//!
//! Timestamps are epoch seconds. A job leaves the due table the instant a
//! handler claims it (`DELETE ... WHERE job_id = ?`); `affected_rows == 0`
//! means another actor won the race and the claim is dropped silently.
//!
//! ## Backend
//!
//! `SqliteJobStore` runs on a SQLx connection pool; tables are created on
//! demand the first time a topic's executor starts. Tests use the in-memory
//! constructor.

use crate::error::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// One delayed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobItem {
    pub job_id: i64,
    pub payload: Vec<u8>,
    /// Creation time, epoch seconds
    pub ctime: i64,
    /// When the job becomes due, epoch seconds
    pub due_time: i64,
}

impl std::fmt::Display for JobItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job[{}] ctime={} due={} {}B",
            self.job_id,
            self.ctime,
            self.due_time,
            self.payload.len()
        )
    }
}

/// Allocate a process-unique job id: epoch microseconds plus a counter.
pub fn next_job_id() -> i64 {
    static NEXT: OnceLock<AtomicI64> = OnceLock::new();
    let next = NEXT.get_or_init(|| {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_micros() as i64;
        AtomicI64::new(micros)
    });
    next.fetch_add(1, Ordering::Relaxed)
}

/// Due-table name for a topic.
pub fn job_table(topic: &str) -> String {
    format!("job_{}", sanitize(topic))
}

/// History-table name for a topic.
pub fn history_table(topic: &str) -> String {
    format!("job_{}_archive", sanitize(topic))
}

fn sanitize(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Relational storage the job executor runs against
#[async_trait]
pub trait JobStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    /// Create the due and history tables for a topic if missing.
    async fn setup_topic(&self, topic: &str) -> Result<()>;

    /// Schedule a job.
    async fn add(&self, topic: &str, item: &JobItem) -> Result<()>;

    /// All jobs with `due_time <= now`.
    async fn fetch_due(&self, topic: &str, now: i64) -> Result<Vec<JobItem>>;

    /// Claim a job. Returns affected rows; 0 means the claim was lost.
    async fn delete(&self, topic: &str, job_id: i64) -> Result<u64>;

    /// Record a fired job in the history table.
    async fn archive(&self, topic: &str, item: &JobItem, etime: i64, actor_id: &str)
        -> Result<()>;

    /// Put a job back in the due table with its original timestamps.
    async fn reinject(&self, topic: &str, item: &JobItem) -> Result<()>;
}

/// SQLite-backed job store
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// In-memory database, for tests.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Ok(Self { pool })
    }

    /// Fired jobs for a topic, oldest first.
    pub async fn archived(&self, topic: &str) -> Result<Vec<JobItem>> {
        let sql = format!(
            "SELECT job_id, payload, ctime, due_time FROM {} ORDER BY etime, job_id",
            history_table(topic)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_item).collect()
    }
}

fn row_to_item(row: &sqlx::sqlite::SqliteRow) -> Result<JobItem> {
    Ok(JobItem {
        job_id: row.try_get("job_id")?,
        payload: row.try_get("payload")?,
        ctime: row.try_get("ctime")?,
        due_time: row.try_get("due_time")?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {
        self.pool.close().await;
    }

    async fn setup_topic(&self, topic: &str) -> Result<()> {
        let due = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                job_id   BIGINT PRIMARY KEY,
                payload  BLOB,
                ctime    BIGINT,
                due_time BIGINT
            )",
            job_table(topic)
        );
        let history = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                job_id   BIGINT,
                payload  BLOB,
                ctime    BIGINT,
                due_time BIGINT,
                etime    BIGINT,
                actor_id VARCHAR
            )",
            history_table(topic)
        );
        sqlx::query(&due).execute(&self.pool).await?;
        sqlx::query(&history).execute(&self.pool).await?;
        Ok(())
    }

    async fn add(&self, topic: &str, item: &JobItem) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}(job_id, payload, ctime, due_time) VALUES(?, ?, ?, ?)",
            job_table(topic)
        );
        sqlx::query(&sql)
            .bind(item.job_id)
            .bind(&item.payload)
            .bind(item.ctime)
            .bind(item.due_time)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_due(&self, topic: &str, now: i64) -> Result<Vec<JobItem>> {
        let sql = format!(
            "SELECT job_id, payload, ctime, due_time FROM {} WHERE due_time <= ?",
            job_table(topic)
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn delete(&self, topic: &str, job_id: i64) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE job_id = ?", job_table(topic));
        let result = sqlx::query(&sql).bind(job_id).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn archive(
        &self,
        topic: &str,
        item: &JobItem,
        etime: i64,
        actor_id: &str,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO {}(job_id, payload, ctime, due_time, etime, actor_id) VALUES(?, ?, ?, ?, ?, ?)",
            history_table(topic)
        );
        sqlx::query(&sql)
            .bind(item.job_id)
            .bind(&item.payload)
            .bind(item.ctime)
            .bind(item.due_time)
            .bind(etime)
            .bind(actor_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reinject(&self, topic: &str, item: &JobItem) -> Result<()> {
        self.add(topic, item).await
    }
}

/// No-op variant for gateways that run without delayed jobs
pub struct DummyJobStore;

#[async_trait]
impl JobStore for DummyJobStore {
    fn name(&self) -> &'static str {
        "dummy"
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn setup_topic(&self, _topic: &str) -> Result<()> {
        Ok(())
    }

    async fn add(&self, topic: &str, _item: &JobItem) -> Result<()> {
        Err(crate::error::JobError::UnknownTopic(topic.to_string()))
    }

    async fn fetch_due(&self, _topic: &str, _now: i64) -> Result<Vec<JobItem>> {
        Ok(Vec::new())
    }

    async fn delete(&self, _topic: &str, _job_id: i64) -> Result<u64> {
        Ok(0)
    }

    async fn archive(
        &self,
        _topic: &str,
        _item: &JobItem,
        _etime: i64,
        _actor_id: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn reinject(&self, _topic: &str, _item: &JobItem) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_are_deterministic() {
        assert_eq!(job_table("orders"), "job_orders");
        assert_eq!(history_table("orders"), "job_orders_archive");
        assert_eq!(job_table("web.click-stream"), "job_web_click_stream");
    }

    #[test]
    fn test_job_ids_are_unique() {
        let a = next_job_id();
        let b = next_job_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_add_fetch_delete() {
        let store = SqliteJobStore::new_in_memory().await.unwrap();
        store.setup_topic("orders").await.unwrap();

        let item = JobItem {
            job_id: 7,
            payload: b"pay".to_vec(),
            ctime: 100,
            due_time: 200,
        };
        store.add("orders", &item).await.unwrap();

        assert!(store.fetch_due("orders", 199).await.unwrap().is_empty());
        let due = store.fetch_due("orders", 200).await.unwrap();
        assert_eq!(due, vec![item.clone()]);

        assert_eq!(store.delete("orders", 7).await.unwrap(), 1);
        assert_eq!(store.delete("orders", 7).await.unwrap(), 0, "second claim loses");
        assert!(store.fetch_due("orders", 200).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_and_reinject() {
        let store = SqliteJobStore::new_in_memory().await.unwrap();
        store.setup_topic("t").await.unwrap();

        let item = JobItem {
            job_id: 1,
            payload: b"x".to_vec(),
            ctime: 10,
            due_time: 20,
        };
        store.archive("t", &item, 30, "actor-1").await.unwrap();
        assert_eq!(store.archived("t").await.unwrap(), vec![item.clone()]);

        // reinject preserves the original timestamps
        store.reinject("t", &item).await.unwrap();
        let due = store.fetch_due("t", 20).await.unwrap();
        assert_eq!(due[0].ctime, 10);
        assert_eq!(due[0].due_time, 20);
    }

    #[tokio::test]
    async fn test_setup_topic_is_idempotent() {
        let store = SqliteJobStore::new_in_memory().await.unwrap();
        store.setup_topic("t").await.unwrap();
        store.setup_topic("t").await.unwrap();
    }
}
