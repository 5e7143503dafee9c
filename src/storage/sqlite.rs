use super::{is_wildcard, OrchestratorStore, Result, StorageError, CLAIM_TIMEOUT};
use crate::core::{
    ClaimedWorkflow, Error as CoreError, SignalWait, StepRecord, StepSnapshot, StepStatus,
    Workflow, WorkflowStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Default pool size for the SQLite connection pool.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Configuration for the SQLite connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool.
    pub max_size: u32,
    /// Minimum number of idle connections to maintain.
    pub min_idle: Option<u32>,
    /// Maximum time to wait for a connection from the pool.
    pub connection_timeout: Duration,
    /// Maximum lifetime of a connection.
    pub max_lifetime: Option<Duration>,
    /// Idle timeout for connections.
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_SIZE,
            min_idle: Some(2),
            connection_timeout: Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS),
            max_lifetime: None,
            idle_timeout: Some(Duration::from_secs(600)), // 10 minutes
        }
    }
}

/// SQLite-backed orchestrator store.
///
/// Uses sqlx connection pooling; all methods are natively async. Single-row
/// guarded mutations re-check `claimed_by` in their `WHERE` clause, which
/// makes them atomic without an explicit transaction; operations that move
/// two tables together (step creation, sleep scheduling, signal delivery)
/// run inside one transaction.
pub struct SqliteStore {
    pool: SqlitePool,
    claim_timeout: Duration,
    /// Notify handle for waking workers when claimable work appears.
    work_notify: Arc<Notify>,
}

impl SqliteStore {
    /// Opens (creating if missing) a store at the given database path with
    /// the default pool configuration.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(db_path, PoolConfig::default()).await
    }

    /// Opens a store with a custom pool configuration.
    pub async fn with_config(db_path: impl AsRef<Path>, config: PoolConfig) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            db_path.as_ref().to_string_lossy()
        ))
        .map_err(|e| StorageError::Connection(e.to_string()))?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .create_if_missing(true);

        let pool = Self::build_pool(connect_options, &config).await?;
        let store = Self {
            pool,
            claim_timeout: CLAIM_TIMEOUT,
            work_notify: Arc::new(Notify::new()),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Creates an in-memory store.
    ///
    /// In-memory SQLite databases are private to their connection, so the
    /// pool is forced down to a single connection to keep one shared
    /// database.
    pub async fn in_memory() -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .busy_timeout(Duration::from_secs(5));

        let config = PoolConfig {
            max_size: 1,
            min_idle: None,
            ..PoolConfig::default()
        };
        let pool = Self::build_pool(connect_options, &config).await?;
        let store = Self {
            pool,
            claim_timeout: CLAIM_TIMEOUT,
            work_notify: Arc::new(Notify::new()),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Overrides the lease duration. Short leases make failover paths
    /// testable without waiting out the production timeout.
    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    async fn build_pool(
        connect_options: SqliteConnectOptions,
        config: &PoolConfig,
    ) -> Result<Pool<Sqlite>> {
        let mut builder = SqlitePoolOptions::new()
            .max_connections(config.max_size)
            .acquire_timeout(config.connection_timeout);

        if let Some(min_idle) = config.min_idle {
            builder = builder.min_connections(min_idle);
        }
        if let Some(max_lifetime) = config.max_lifetime {
            builder = builder.max_lifetime(max_lifetime);
        }
        if let Some(idle_timeout) = config.idle_timeout {
            builder = builder.idle_timeout(idle_timeout);
        }

        builder
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Initialize the database schema.
    ///
    /// The claim selector's liveness depends on the per-status indexes over
    /// `lease_expires_at` and `sleep_until`; without them the tier scans
    /// degrade to row-count and sleepers starve under load.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workflows (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                status TEXT CHECK( status IN ('PENDING','RUNNING','SLEEPING','WAITING','COMPLETED','FAILED') ) NOT NULL,
                input TEXT NOT NULL,
                output TEXT,
                error TEXT,
                claimed_by TEXT,
                claimed_at INTEGER,
                lease_expires_at INTEGER,
                sleep_until INTEGER,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        for index in [
            "CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status)",
            "CREATE INDEX IF NOT EXISTS idx_workflows_status_lease ON workflows(status, lease_expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_workflows_status_sleep ON workflows(status, sleep_until)",
            "CREATE INDEX IF NOT EXISTS idx_workflows_name_status ON workflows(name, status)",
            "CREATE INDEX IF NOT EXISTS idx_workflows_name_status_lease ON workflows(name, status, lease_expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_workflows_name_status_sleep ON workflows(name, status, sleep_until)",
        ] {
            sqlx::query(index).execute(&self.pool).await?;
        }

        // UNIQUE(workflow_id, name) is the durable step-name mapping: two
        // concurrent replays of the same name resolve to one step row.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS steps (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT CHECK( status IN ('PENDING','RUNNING','COMPLETED','FAILED') ) NOT NULL,
                output TEXT,
                error TEXT,
                sleep_until INTEGER,
                awaiting_signal TEXT,
                attempts INTEGER NOT NULL DEFAULT 1,
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                UNIQUE (workflow_id, name)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_steps_workflow ON steps(workflow_id)")
            .execute(&self.pool)
            .await?;

        // Signals that arrived before the matching wait.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS workflow_signals (
                workflow_id TEXT NOT NULL,
                signal_name TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (workflow_id, signal_name)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn parse_uuid(s: &str) -> Result<Uuid> {
        Uuid::parse_str(s).map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn parse_json(s: &str) -> Result<Value> {
        serde_json::from_str(s)
            .map_err(CoreError::Deserialization)
            .map_err(StorageError::from)
    }

    fn millis(t: DateTime<Utc>) -> i64 {
        t.timestamp_millis()
    }

    fn from_millis(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }

    fn row_to_workflow(row: &sqlx::sqlite::SqliteRow) -> Result<Workflow> {
        let id_str: String = row.try_get("id")?;
        let seq: i64 = row.try_get("seq")?;
        let name: String = row.try_get("name")?;
        let status_str: String = row.try_get("status")?;
        let input_str: String = row.try_get("input")?;
        let output_str: Option<String> = row.try_get("output")?;
        let error: Option<String> = row.try_get("error")?;
        let claimed_by: Option<String> = row.try_get("claimed_by")?;
        let claimed_at: Option<i64> = row.try_get("claimed_at")?;
        let lease_expires_at: Option<i64> = row.try_get("lease_expires_at")?;
        let sleep_until: Option<i64> = row.try_get("sleep_until")?;
        let created_at: i64 = row.try_get("created_at")?;

        Ok(Workflow {
            id: Self::parse_uuid(&id_str)?,
            seq: seq as u64,
            created_at: Self::from_millis(created_at),
            name,
            status: WorkflowStatus::from_str(&status_str).map_err(StorageError::Core)?,
            input: Self::parse_json(&input_str)?,
            output: output_str.as_deref().map(Self::parse_json).transpose()?,
            error,
            claimed_by,
            claimed_at: claimed_at.map(Self::from_millis),
            lease_expires_at: lease_expires_at.map(Self::from_millis),
            sleep_until: sleep_until.map(Self::from_millis),
            step_ids_by_name: HashMap::new(),
            pending_signals: HashMap::new(),
        })
    }

    fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> Result<StepRecord> {
        let id_str: String = row.try_get("id")?;
        let workflow_id_str: String = row.try_get("workflow_id")?;
        let name: String = row.try_get("name")?;
        let status_str: String = row.try_get("status")?;
        let output_str: Option<String> = row.try_get("output")?;
        let error: Option<String> = row.try_get("error")?;
        let sleep_until: Option<i64> = row.try_get("sleep_until")?;
        let awaiting_signal: Option<String> = row.try_get("awaiting_signal")?;
        let attempts: i32 = row.try_get("attempts")?;
        let started_at: i64 = row.try_get("started_at")?;
        let completed_at: Option<i64> = row.try_get("completed_at")?;

        Ok(StepRecord {
            id: Self::parse_uuid(&id_str)?,
            workflow_id: Self::parse_uuid(&workflow_id_str)?,
            name,
            status: StepStatus::from_str(&status_str).map_err(StorageError::Core)?,
            output: output_str.as_deref().map(Self::parse_json).transpose()?,
            error,
            sleep_until: sleep_until.map(Self::from_millis),
            awaiting_signal,
            attempts,
            started_at: Self::from_millis(started_at),
            completed_at: completed_at.map(Self::from_millis),
        })
    }

    /// Reads the workflow's (status, claimed_by) pair for ownership checks
    /// inside transactions.
    async fn read_claim_state(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        workflow_id: Uuid,
    ) -> Result<Option<(WorkflowStatus, Option<String>)>> {
        let row = sqlx::query("SELECT status, claimed_by FROM workflows WHERE id = ?")
            .bind(workflow_id.to_string())
            .fetch_optional(&mut **tx)
            .await?;
        match row {
            Some(row) => {
                let status_str: String = row.try_get("status")?;
                let claimed_by: Option<String> = row.try_get("claimed_by")?;
                Ok(Some((
                    WorkflowStatus::from_str(&status_str).map_err(StorageError::Core)?,
                    claimed_by,
                )))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OrchestratorStore for SqliteStore {
    async fn start_workflow(&self, name: &str, input: Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO workflows (id, name, status, input, created_at)
             VALUES (?, ?, 'PENDING', ?, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(input.to_string())
        .bind(Self::millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        debug!("started workflow: id={}, name={}", id, name);
        self.work_notify.notify_one();
        Ok(id)
    }

    async fn claim(
        &self,
        workflow_names: &[String],
        worker_id: &str,
    ) -> Result<Option<ClaimedWorkflow>> {
        let now = Utc::now();
        let now_ms = Self::millis(now);
        let lease_ms = Self::millis(
            now + chrono::Duration::from_std(self.claim_timeout).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        let legacy_cutoff_ms = Self::millis(
            now - chrono::Duration::from_std(self.claim_timeout).unwrap_or_else(|_| chrono::Duration::zero()),
        );

        let wildcard = is_wildcard(workflow_names);
        let filter = if wildcard {
            String::new()
        } else {
            let marks = vec!["?"; workflow_names.len()].join(", ");
            format!(" AND name IN ({marks})")
        };

        // One atomic UPDATE claims the winner; each tier is pre-ranked in its
        // own subselect and the lowest tier wins. A single statement sees the
        // latest committed state, so no write can slip between selection and
        // claim.
        let sql = format!(
            "UPDATE workflows
             SET status = 'RUNNING', claimed_by = ?, claimed_at = ?, lease_expires_at = ?, sleep_until = NULL
             WHERE seq = (
                 SELECT seq FROM (
                     SELECT * FROM (
                         SELECT seq, 0 AS tier FROM workflows
                         WHERE status = 'PENDING'{filter}
                         ORDER BY seq ASC LIMIT 1)
                     UNION ALL
                     SELECT * FROM (
                         SELECT seq, 1 AS tier FROM workflows
                         WHERE status = 'SLEEPING' AND sleep_until <= ?{filter}
                         ORDER BY sleep_until ASC, seq ASC LIMIT 1)
                     UNION ALL
                     SELECT * FROM (
                         SELECT seq, 2 AS tier FROM workflows
                         WHERE status = 'RUNNING' AND lease_expires_at IS NOT NULL AND lease_expires_at < ?{filter}
                         ORDER BY seq ASC LIMIT 1)
                     UNION ALL
                     SELECT * FROM (
                         SELECT seq, 3 AS tier FROM workflows
                         WHERE status = 'RUNNING' AND lease_expires_at IS NULL
                           AND claimed_at IS NOT NULL AND claimed_at <= ?{filter}
                         ORDER BY seq ASC LIMIT 1)
                 ) ORDER BY tier ASC LIMIT 1
             )
             RETURNING id, name, input",
        );

        let mut query = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now_ms)
            .bind(lease_ms);
        if !wildcard {
            for name in workflow_names {
                query = query.bind(name);
            }
        }
        query = query.bind(now_ms);
        if !wildcard {
            for name in workflow_names {
                query = query.bind(name);
            }
        }
        query = query.bind(now_ms);
        if !wildcard {
            for name in workflow_names {
                query = query.bind(name);
            }
        }
        query = query.bind(legacy_cutoff_ms);
        if !wildcard {
            for name in workflow_names {
                query = query.bind(name);
            }
        }

        let Some(row) = query.fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let id_str: String = row.try_get("id")?;
        let name: String = row.try_get("name")?;
        let input_str: String = row.try_get("input")?;
        let workflow_id = Self::parse_uuid(&id_str)?;

        debug!(
            "claimed workflow: id={}, name={}, worker={}",
            workflow_id, name, worker_id
        );
        Ok(Some(ClaimedWorkflow {
            workflow_id,
            name,
            input: Self::parse_json(&input_str)?,
        }))
    }

    async fn heartbeat(&self, workflow_id: Uuid, worker_id: &str) -> Result<bool> {
        let now = Utc::now();
        let lease_ms = Self::millis(
            now + chrono::Duration::from_std(self.claim_timeout).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        let result = sqlx::query(
            "UPDATE workflows SET claimed_at = ?, lease_expires_at = ?
             WHERE id = ? AND claimed_by = ?",
        )
        .bind(Self::millis(now))
        .bind(lease_ms)
        .bind(workflow_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
        output: Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflows
             SET status = 'COMPLETED', output = ?, claimed_by = NULL, claimed_at = NULL,
                 lease_expires_at = NULL, sleep_until = NULL
             WHERE id = ? AND claimed_by = ? AND status = 'RUNNING'",
        )
        .bind(output.to_string())
        .bind(workflow_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            debug!("completed workflow: id={}", workflow_id);
        }
        Ok(result.rows_affected() > 0)
    }

    async fn fail_workflow(&self, workflow_id: Uuid, worker_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflows
             SET status = 'FAILED', error = ?, claimed_by = NULL, claimed_at = NULL,
                 lease_expires_at = NULL, sleep_until = NULL
             WHERE id = ? AND claimed_by = ? AND status = 'RUNNING'",
        )
        .bind(error)
        .bind(workflow_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            debug!("failed workflow: id={}, error={}", workflow_id, error);
        }
        Ok(result.rows_affected() > 0)
    }

    async fn sleep_workflow(
        &self,
        workflow_id: Uuid,
        worker_id: &str,
        sleep_until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE workflows
             SET status = 'SLEEPING', sleep_until = ?, claimed_by = NULL, claimed_at = NULL,
                 lease_expires_at = NULL
             WHERE id = ? AND claimed_by = ? AND status = 'RUNNING'",
        )
        .bind(Self::millis(sleep_until))
        .bind(workflow_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_or_create_step(
        &self,
        workflow_id: Uuid,
        step_name: &str,
        worker_id: &str,
    ) -> Result<StepSnapshot> {
        let mut tx = self.pool.begin().await?;

        match Self::read_claim_state(&mut tx, workflow_id).await? {
            None => return Err(StorageError::WorkflowNotFound(workflow_id)),
            Some((WorkflowStatus::Running, Some(owner))) if owner == worker_id => {}
            Some(_) => {
                return Err(StorageError::NotClaimOwner {
                    workflow_id,
                    worker_id: worker_id.to_string(),
                })
            }
        }

        let existing = sqlx::query(
            "SELECT id, status, output, error, sleep_until FROM steps
             WHERE workflow_id = ? AND name = ?",
        )
        .bind(workflow_id.to_string())
        .bind(step_name)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            let id_str: String = row.try_get("id")?;
            let status_str: String = row.try_get("status")?;
            let output_str: Option<String> = row.try_get("output")?;
            let error: Option<String> = row.try_get("error")?;
            let sleep_until: Option<i64> = row.try_get("sleep_until")?;
            tx.commit().await?;
            return Ok(StepSnapshot {
                step_id: Self::parse_uuid(&id_str)?,
                status: StepStatus::from_str(&status_str).map_err(StorageError::Core)?,
                output: output_str.as_deref().map(Self::parse_json).transpose()?,
                error,
                sleep_until: sleep_until.map(Self::from_millis),
                is_new: false,
            });
        }

        let step_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO steps (id, workflow_id, name, status, attempts, started_at)
             VALUES (?, ?, ?, 'RUNNING', 1, ?)
             ON CONFLICT(workflow_id, name) DO NOTHING",
        )
        .bind(step_id.to_string())
        .bind(workflow_id.to_string())
        .bind(step_name)
        .bind(Self::millis(Utc::now()))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(
            "created step: workflow={}, name={}, step={}",
            workflow_id, step_name, step_id
        );
        Ok(StepSnapshot {
            step_id,
            status: StepStatus::Running,
            output: None,
            error: None,
            sleep_until: None,
            is_new: true,
        })
    }

    async fn complete_step(&self, step_id: Uuid, worker_id: &str, output: Value) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE steps
             SET status = 'COMPLETED', output = ?, error = NULL, sleep_until = NULL, completed_at = ?
             WHERE id = ? AND status = 'RUNNING'
               AND EXISTS (SELECT 1 FROM workflows w
                           WHERE w.id = steps.workflow_id
                             AND w.claimed_by = ? AND w.status = 'RUNNING')",
        )
        .bind(output.to_string())
        .bind(Self::millis(Utc::now()))
        .bind(step_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_step(&self, step_id: Uuid, worker_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE steps
             SET status = 'FAILED', error = ?, sleep_until = NULL, completed_at = ?
             WHERE id = ? AND status = 'RUNNING'
               AND EXISTS (SELECT 1 FROM workflows w
                           WHERE w.id = steps.workflow_id
                             AND w.claimed_by = ? AND w.status = 'RUNNING')",
        )
        .bind(error)
        .bind(Self::millis(Utc::now()))
        .bind(step_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn schedule_sleep(
        &self,
        workflow_id: Uuid,
        step_id: Uuid,
        worker_id: &str,
        sleep_until: DateTime<Utc>,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        match Self::read_claim_state(&mut tx, workflow_id).await? {
            Some((WorkflowStatus::Running, Some(owner))) if owner == worker_id => {}
            _ => return Ok(false),
        }

        let step = sqlx::query(
            "SELECT workflow_id, status, sleep_until FROM steps WHERE id = ?",
        )
        .bind(step_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(step) = step else {
            return Ok(false);
        };
        let step_workflow: String = step.try_get("workflow_id")?;
        let step_status: String = step.try_get("status")?;
        let existing_wake: Option<i64> = step.try_get("sleep_until")?;
        if Self::parse_uuid(&step_workflow)? != workflow_id || step_status != "RUNNING" {
            return Ok(false);
        }

        // A marker's wake time is written once; replays observe the original.
        let wake_at = existing_wake
            .map(Self::from_millis)
            .unwrap_or(sleep_until);
        if wake_at <= now {
            return Ok(false);
        }
        let wake_ms = Self::millis(wake_at);

        sqlx::query("UPDATE steps SET sleep_until = ? WHERE id = ?")
            .bind(wake_ms)
            .bind(step_id.to_string())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(
            "UPDATE workflows
             SET status = 'SLEEPING', sleep_until = ?, claimed_by = NULL, claimed_at = NULL,
                 lease_expires_at = NULL
             WHERE id = ? AND claimed_by = ? AND status = 'RUNNING'",
        )
        .bind(wake_ms)
        .bind(workflow_id.to_string())
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        tx.commit().await?;

        debug!(
            "scheduled sleep: workflow={}, step={}, wake_at={}",
            workflow_id, step_id, wake_at
        );
        Ok(true)
    }

    async fn wait_for_signal(
        &self,
        workflow_id: Uuid,
        step_id: Uuid,
        worker_id: &str,
        signal_name: &str,
    ) -> Result<SignalWait> {
        let mut tx = self.pool.begin().await?;

        match Self::read_claim_state(&mut tx, workflow_id).await? {
            None => return Err(StorageError::WorkflowNotFound(workflow_id)),
            Some((WorkflowStatus::Running, Some(owner))) if owner == worker_id => {}
            Some(_) => {
                return Err(StorageError::NotClaimOwner {
                    workflow_id,
                    worker_id: worker_id.to_string(),
                })
            }
        }

        let queued = sqlx::query(
            "DELETE FROM workflow_signals WHERE workflow_id = ? AND signal_name = ?
             RETURNING payload",
        )
        .bind(workflow_id.to_string())
        .bind(signal_name)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(row) = queued {
            let payload_str: String = row.try_get("payload")?;
            tx.commit().await?;
            debug!(
                "consumed queued signal: workflow={}, signal={}",
                workflow_id, signal_name
            );
            return Ok(SignalWait::Signaled(Self::parse_json(&payload_str)?));
        }

        let marked = sqlx::query(
            "UPDATE steps SET awaiting_signal = ?
             WHERE id = ? AND workflow_id = ? AND status = 'RUNNING'",
        )
        .bind(signal_name)
        .bind(step_id.to_string())
        .bind(workflow_id.to_string())
        .execute(&mut *tx)
        .await?;
        if marked.rows_affected() == 0 {
            return Err(StorageError::StepNotFound(step_id));
        }
        sqlx::query(
            "UPDATE workflows
             SET status = 'WAITING', claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL
             WHERE id = ? AND claimed_by = ? AND status = 'RUNNING'",
        )
        .bind(workflow_id.to_string())
        .bind(worker_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(
            "workflow waiting for signal: workflow={}, signal={}",
            workflow_id, signal_name
        );
        Ok(SignalWait::Waiting)
    }

    async fn signal_workflow(
        &self,
        workflow_id: Uuid,
        signal_name: &str,
        payload: Value,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some((status, _)) = Self::read_claim_state(&mut tx, workflow_id).await? else {
            return Ok(false);
        };
        if status.is_terminal() {
            debug!(
                "dropping signal for terminal workflow: id={}, signal={}",
                workflow_id, signal_name
            );
            return Ok(false);
        }

        let waiter = if status == WorkflowStatus::Waiting {
            sqlx::query(
                "SELECT id FROM steps
                 WHERE workflow_id = ? AND awaiting_signal = ? AND status = 'RUNNING'
                 LIMIT 1",
            )
            .bind(workflow_id.to_string())
            .bind(signal_name)
            .fetch_optional(&mut *tx)
            .await?
        } else {
            None
        };

        let woke = match waiter {
            Some(row) => {
                let step_id: String = row.try_get("id")?;
                sqlx::query(
                    "UPDATE steps
                     SET status = 'COMPLETED', output = ?, awaiting_signal = NULL, completed_at = ?
                     WHERE id = ?",
                )
                .bind(payload.to_string())
                .bind(Self::millis(Utc::now()))
                .bind(&step_id)
                .execute(&mut *tx)
                .await?;
                // Back through PENDING so the claim loop picks a worker;
                // the signaller's transaction never has to choose one.
                sqlx::query(
                    "UPDATE workflows
                     SET status = 'PENDING', claimed_by = NULL, claimed_at = NULL,
                         lease_expires_at = NULL, sleep_until = NULL
                     WHERE id = ?",
                )
                .bind(workflow_id.to_string())
                .execute(&mut *tx)
                .await?;
                debug!(
                    "signal woke waiting workflow: id={}, signal={}",
                    workflow_id, signal_name
                );
                true
            }
            None => {
                sqlx::query(
                    "INSERT INTO workflow_signals (workflow_id, signal_name, payload, created_at)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(workflow_id, signal_name)
                     DO UPDATE SET payload = excluded.payload, created_at = excluded.created_at",
                )
                .bind(workflow_id.to_string())
                .bind(signal_name)
                .bind(payload.to_string())
                .bind(Self::millis(Utc::now()))
                .execute(&mut *tx)
                .await?;
                debug!(
                    "queued signal: workflow={}, signal={}",
                    workflow_id, signal_name
                );
                false
            }
        };
        tx.commit().await?;

        if woke {
            self.work_notify.notify_one();
        }
        Ok(true)
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(workflow_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut workflow = Self::row_to_workflow(&row)?;

        let steps = sqlx::query("SELECT id, name FROM steps WHERE workflow_id = ?")
            .bind(workflow_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        for row in steps {
            let id_str: String = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            workflow
                .step_ids_by_name
                .insert(name, Self::parse_uuid(&id_str)?);
        }

        let signals =
            sqlx::query("SELECT signal_name, payload FROM workflow_signals WHERE workflow_id = ?")
                .bind(workflow_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        for row in signals {
            let name: String = row.try_get("signal_name")?;
            let payload_str: String = row.try_get("payload")?;
            workflow
                .pending_signals
                .insert(name, Self::parse_json(&payload_str)?);
        }

        Ok(Some(workflow))
    }

    async fn list_workflows(
        &self,
        name: Option<&str>,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>> {
        let mut sql = String::from("SELECT * FROM workflows WHERE 1 = 1");
        if name.is_some() {
            sql.push_str(" AND name = ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY seq ASC");

        let mut query = sqlx::query(&sql);
        if let Some(name) = name {
            query = query.bind(name);
        }
        if let Some(status) = status {
            query = query.bind(status.as_str());
        }

        query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(Self::row_to_workflow)
            .collect()
    }

    async fn get_workflow_steps(&self, workflow_id: Uuid) -> Result<Vec<StepRecord>> {
        sqlx::query("SELECT * FROM steps WHERE workflow_id = ? ORDER BY started_at ASC, id ASC")
            .bind(workflow_id.to_string())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(Self::row_to_step)
            .collect()
    }

    async fn has_claimable(&self, workflow_names: &[String]) -> Result<bool> {
        let wildcard = is_wildcard(workflow_names);
        let filter = if wildcard {
            String::new()
        } else {
            let marks = vec!["?"; workflow_names.len()].join(", ");
            format!(" AND name IN ({marks})")
        };
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM workflows WHERE status = 'PENDING'{filter})
                 OR EXISTS(SELECT 1 FROM workflows
                           WHERE status = 'SLEEPING' AND sleep_until <= ?{filter})
             AS claimable",
        );

        let mut query = sqlx::query(&sql);
        if !wildcard {
            for name in workflow_names {
                query = query.bind(name);
            }
        }
        query = query.bind(Self::millis(Utc::now()));
        if !wildcard {
            for name in workflow_names {
                query = query.bind(name);
            }
        }

        let row = query.fetch_one(&self.pool).await?;
        let claimable: i64 = row.try_get("claimable")?;
        Ok(claimable != 0)
    }

    fn work_notify(&self) -> &Arc<Notify> {
        &self.work_notify
    }
}
