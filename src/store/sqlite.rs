//! Store persistente em SQLite construído sobre sqlx.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use super::{CoordinationStore, JobQuery, JobRecord, JobStore};
use crate::error::{RelaunchError, Result};
use crate::job::{JobId, JobStatus};

const DEFAULT_POOL_SIZE: u32 = 8;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const CREATE_JOBS: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type   TEXT NOT NULL,
    label      TEXT NOT NULL DEFAULT '',
    queue      TEXT NOT NULL DEFAULT '',
    claim_id   TEXT NOT NULL DEFAULT '',
    worker_id  TEXT NOT NULL DEFAULT '',
    status     TEXT NOT NULL,
    payload    TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

const CREATE_JOBS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_jobs_claimable ON jobs (status, queue, claim_id)";

const CREATE_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS coordination (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    expires_at INTEGER
)
"#;

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    job_type: String,
    label: String,
    queue: String,
    claim_id: String,
    worker_id: String,
    status: String,
    payload: String,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = RelaunchError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(JobRecord {
            id: row.id,
            job_type: row.job_type,
            label: row.label,
            queue: row.queue,
            claim_id: row.claim_id,
            worker_id: row.worker_id,
            status: JobStatus::from_str(&row.status).map_err(RelaunchError::Store)?,
            payload: row.payload,
        })
    }
}

/// Registros de jobs e de coordenação em um único banco SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Abre (criando se preciso) o banco em `database_url`, por exemplo
    /// `sqlite:relaunch.db?mode=rwc`, e cria as tabelas.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(DEFAULT_BUSY_TIMEOUT)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_POOL_SIZE)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in [CREATE_JOBS, CREATE_JOBS_INDEX, CREATE_ENTRIES] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("SQLite schema ready");
        Ok(())
    }
}

/// Acrescenta a cláusula WHERE de `query` (sem ORDER BY nem LIMIT).
fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &JobQuery) {
    builder.push(" WHERE 1 = 1");
    if !query.job_types.is_empty() {
        builder.push(" AND job_type IN (");
        let mut list = builder.separated(", ");
        for job_type in &query.job_types {
            list.push_bind(job_type.clone());
        }
        list.push_unseparated(")");
    }
    if !query.statuses.is_empty() {
        builder.push(" AND status IN (");
        let mut list = builder.separated(", ");
        for status in &query.statuses {
            list.push_bind(status.as_str());
        }
        list.push_unseparated(")");
    }
    if let Some(queue) = &query.queue {
        builder.push(" AND queue = ").push_bind(queue.clone());
    }
    if query.unclaimed_only {
        builder.push(" AND claim_id = '' AND worker_id = ''");
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create(&self, record: &JobRecord) -> Result<JobId> {
        let now = Utc::now().to_rfc3339();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (job_type, label, queue, claim_id, worker_id, status, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&record.job_type)
        .bind(&record.label)
        .bind(&record.queue)
        .bind(&record.claim_id)
        .bind(&record.worker_id)
        .bind(record.status.as_str())
        .bind(&record.payload)
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update(&self, record: &JobRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET label = ?, queue = ?, claim_id = ?, worker_id = ?, status = ?, payload = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.label)
        .bind(&record.queue)
        .bind(&record.claim_id)
        .bind(&record.worker_id)
        .bind(record.status.as_str())
        .bind(&record.payload)
        .bind(&now)
        .bind(record.id)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(RelaunchError::Store(format!("job #{} does not exist", record.id)));
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(JobRecord::try_from)
            .transpose()
    }

    async fn query(&self, query: &JobQuery) -> Result<Vec<JobRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs");
        push_filters(&mut builder, query);
        builder.push(" ORDER BY id");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build_query_as::<JobRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn claim(&self, query: &JobQuery, claim_id: &str, worker_id: &str) -> Result<Option<JobRecord>> {
        // One statement: the sub-select and the conditional update happen under
        // the same write lock, so two claimers can never both match a row.
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE jobs SET claim_id = ");
        builder
            .push_bind(claim_id.to_string())
            .push(", worker_id = ")
            .push_bind(worker_id.to_string())
            .push(", status = ")
            .push_bind(JobStatus::InProgress.as_str())
            .push(", updated_at = ")
            .push_bind(Utc::now().to_rfc3339())
            .push(" WHERE id = (SELECT id FROM jobs");
        push_filters(&mut builder, query);
        builder.push(" ORDER BY id LIMIT 1) AND claim_id = '' AND worker_id = '' RETURNING *");

        let row = builder
            .build_query_as::<JobRow>()
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn release_claims(&self, worker_id: &str, keep: Option<&str>) -> Result<u64> {
        let run_prefix = format!("{worker_id}:");
        let done = sqlx::query(
            r#"
            UPDATE jobs SET claim_id = '', worker_id = '', updated_at = ?
            WHERE (worker_id = ? OR substr(worker_id, 1, ?) = ?) AND worker_id != ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(worker_id)
        .bind(run_prefix.chars().count() as i64)
        .bind(&run_prefix)
        .bind(keep.unwrap_or(""))
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let done = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn queue_names(&self, active_only: bool) -> Result<Vec<String>> {
        let names = if active_only {
            sqlx::query_scalar::<_, String>(
                "SELECT DISTINCT queue FROM jobs WHERE queue != '' AND status NOT IN (?, ?) ORDER BY queue",
            )
            .bind(JobStatus::Done.as_str())
            .bind(JobStatus::Abandoned.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_scalar::<_, String>("SELECT DISTINCT queue FROM jobs WHERE queue != '' ORDER BY queue")
                .fetch_all(&self.pool)
                .await?
        };
        Ok(names)
    }
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM coordination WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Utc::now().timestamp_millis() + ttl.as_millis() as i64);
        sqlx::query(
            r#"
            INSERT INTO coordination (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<String> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM coordination WHERE key = ? AND expires_at IS NOT NULL AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO coordination (key, value, expires_at) VALUES (?, ?, NULL) ON CONFLICT(key) DO NOTHING")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        let stored = sqlx::query_scalar::<_, String>("SELECT value FROM coordination WHERE key = ?")
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: Option<&str>) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        // Cada ramo é um único comando condicional, atômico sob o lock de escrita.
        let done = match (expected, value) {
            (None, Some(value)) => {
                sqlx::query(
                    r#"
                    INSERT INTO coordination (key, value, expires_at) VALUES (?, ?, NULL)
                    ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = NULL
                    WHERE coordination.expires_at IS NOT NULL AND coordination.expires_at <= ?
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            (Some(expected), Some(value)) => {
                sqlx::query(
                    r#"
                    UPDATE coordination SET value = ?, expires_at = NULL
                    WHERE key = ? AND value = ? AND (expires_at IS NULL OR expires_at > ?)
                    "#,
                )
                .bind(value)
                .bind(key)
                .bind(expected)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            (Some(expected), None) => {
                sqlx::query(
                    "DELETE FROM coordination WHERE key = ? AND value = ? AND (expires_at IS NULL OR expires_at > ?)",
                )
                .bind(key)
                .bind(expected)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            (None, None) => return Ok(CoordinationStore::get(self, key).await?.is_none()),
        };
        Ok(done.rows_affected() > 0)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM coordination WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("jobs.db").to_string_lossy().replace('\\', "/")
        );
        let store = SqliteStore::connect(&url).await.unwrap();
        (dir, store)
    }

    fn queued(queue: &str) -> JobRecord {
        JobRecord {
            id: 0,
            job_type: "sleep".into(),
            label: "nap".into(),
            queue: queue.into(),
            claim_id: String::new(),
            worker_id: String::new(),
            status: JobStatus::Queued,
            payload: r#"{"dataset":2}"#.into(),
        }
    }

    #[tokio::test]
    async fn create_update_get() {
        let (_dir, store) = open().await;
        let id = store.create(&queued("default")).await.unwrap();

        let mut record = JobStore::get(&store, id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.payload, r#"{"dataset":2}"#);

        record.status = JobStatus::Done;
        store.update(&record).await.unwrap();
        let reloaded = JobStore::get(&store, id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Done);

        record.id = 999;
        assert!(store.update(&record).await.is_err());
    }

    #[tokio::test]
    async fn claim_marks_row_and_skips_claimed() {
        let (_dir, store) = open().await;
        store.create(&queued("default")).await.unwrap();
        store.create(&queued("emails")).await.unwrap();

        let q = JobQuery::claimable(vec!["sleep".into()], Some("emails".into()));
        let claimed = store.claim(&q, "c1", "worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.queue, "emails");
        assert_eq!(claimed.status, JobStatus::InProgress);
        assert_eq!(claimed.claim_id, "c1");
        assert!(store.claim(&q, "c2", "worker-2").await.unwrap().is_none());

        let other_type = JobQuery::claimable(vec!["resize".into()], None);
        assert!(store.claim(&other_type, "c3", "worker-3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_job() {
        let (_dir, store) = open().await;
        let store = Arc::new(store);
        for _ in 0..20 {
            store.create(&queued("default")).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let q = JobQuery::claimable(vec![], None);
                let mut mine = Vec::new();
                while let Some(r) = store.claim(&q, &format!("c{w}"), &format!("worker-{w}")).await.unwrap() {
                    mine.push(r.id);
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        assert_eq!(all, (1..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn release_and_delete() {
        let (_dir, store) = open().await;
        let id = store.create(&queued("default")).await.unwrap();
        let q = JobQuery::claimable(vec![], None);
        store.claim(&q, "c1", "worker-1").await.unwrap();

        assert_eq!(store.release_claims("worker-1", None).await.unwrap(), 1);
        assert!(store.claim(&q, "c2", "worker-2").await.unwrap().is_some());

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
    }

    #[tokio::test]
    async fn release_claims_matches_runs_of_the_slot_only() {
        let (_dir, store) = open().await;
        for _ in 0..3 {
            store.create(&queued("default")).await.unwrap();
        }
        let q = JobQuery::claimable(vec![], None);
        store.claim(&q, "c1", "worker-1:old").await.unwrap();
        store.claim(&q, "c2", "worker-1:live").await.unwrap();
        store.claim(&q, "c3", "worker-10:other").await.unwrap();

        assert_eq!(store.release_claims("worker-1", Some("worker-1:live")).await.unwrap(), 1);
        assert!(JobStore::get(&store, 1).await.unwrap().unwrap().worker_id.is_empty());
        assert_eq!(JobStore::get(&store, 2).await.unwrap().unwrap().worker_id, "worker-1:live");
        assert_eq!(JobStore::get(&store, 3).await.unwrap().unwrap().worker_id, "worker-10:other");
    }

    #[tokio::test]
    async fn queue_names_filter_terminal_jobs() {
        let (_dir, store) = open().await;
        store.create(&queued("emails")).await.unwrap();
        let mut done = queued("reports");
        done.status = JobStatus::Abandoned;
        store.create(&done).await.unwrap();

        assert_eq!(store.queue_names(false).await.unwrap(), vec!["emails", "reports"]);
        assert_eq!(store.queue_names(true).await.unwrap(), vec!["emails"]);
    }

    #[tokio::test]
    async fn coordination_entries() {
        let (_dir, store) = open().await;
        store.put("worker:worker-1:stop", "1", None).await.unwrap();
        assert_eq!(
            CoordinationStore::get(&store, "worker:worker-1:stop").await.unwrap().as_deref(),
            Some("1")
        );

        store.put("short", "v", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(CoordinationStore::get(&store, "short").await.unwrap().is_none());
        assert_eq!(store.put_if_absent("short", "fresh").await.unwrap(), "fresh");
        assert_eq!(store.put_if_absent("short", "late").await.unwrap(), "fresh");

        assert!(store.remove("worker:worker-1:stop").await.unwrap());
    }

    #[tokio::test]
    async fn compare_and_swap_is_conditional() {
        let (_dir, store) = open().await;
        assert!(store.compare_and_swap("hb", None, Some("a")).await.unwrap());
        assert!(!store.compare_and_swap("hb", None, Some("b")).await.unwrap());
        assert!(!store.compare_and_swap("hb", Some("x"), Some("b")).await.unwrap());
        assert!(store.compare_and_swap("hb", Some("a"), Some("b")).await.unwrap());
        assert!(!store.compare_and_swap("hb", Some("a"), None).await.unwrap());
        assert!(store.compare_and_swap("hb", Some("b"), None).await.unwrap());
        assert!(CoordinationStore::get(&store, "hb").await.unwrap().is_none());

        store.put("short", "old", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.compare_and_swap("short", None, Some("new")).await.unwrap());
        assert_eq!(CoordinationStore::get(&store, "short").await.unwrap().as_deref(), Some("new"));
    }
}
