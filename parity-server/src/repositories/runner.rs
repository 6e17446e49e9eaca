use crate::repositories::sqlite::SqliteDb;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parity_server_models::runners;
use sqlx::{SqlitePool, prelude::FromRow};
use strum::{Display, EnumString};
use uuid::Uuid;

/// A worker node, keyed by its stable device identifier.
#[derive(FromRow, Clone, Debug, PartialEq)]
pub struct RunnerModel {
    pub device_id: String,
    pub wallet_address: String,
    pub webhook: String,
    pub status: RunnerStatus,
    pub task_id: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, sqlx::Type)]
pub enum RunnerStatus {
    #[default]
    Online,
    Offline,
    Busy,
}

impl From<RunnerStatus> for runners::RunnerStatus {
    fn from(status: RunnerStatus) -> Self {
        match status {
            RunnerStatus::Online => Self::Online,
            RunnerStatus::Offline => Self::Offline,
            RunnerStatus::Busy => Self::Busy,
        }
    }
}

impl From<runners::RunnerStatus> for RunnerStatus {
    fn from(status: runners::RunnerStatus) -> Self {
        match status {
            runners::RunnerStatus::Online => Self::Online,
            runners::RunnerStatus::Offline => Self::Offline,
            runners::RunnerStatus::Busy => Self::Busy,
        }
    }
}

impl From<RunnerModel> for runners::Runner {
    fn from(runner: RunnerModel) -> Self {
        let RunnerModel { device_id, wallet_address, webhook, status, task_id, last_heartbeat, created_at, updated_at } =
            runner;
        Self {
            device_id,
            wallet_address,
            webhook,
            status: status.into(),
            task_id,
            last_heartbeat,
            created_at,
            updated_at,
        }
    }
}

/// The merge payload for registrations and heartbeats. Empty webhook and
/// wallet values never erase a stored one.
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerUpsert {
    pub device_id: String,
    pub wallet_address: String,
    pub webhook: String,
    pub status: RunnerStatus,
    pub last_heartbeat: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunnerRepository: Send + Sync {
    /// Create a runner.
    async fn create(&self, runner: RunnerModel) -> Result<(), RunnerRepositoryError>;

    /// Find a runner by device id.
    async fn find(&self, device_id: &str) -> Result<RunnerModel, RunnerRepositoryError>;

    /// Insert or merge a runner record and return the stored row.
    async fn upsert(&self, runner: RunnerUpsert) -> Result<RunnerModel, RunnerRepositoryError>;

    /// Overwrite a runner row.
    async fn update(&self, runner: RunnerModel) -> Result<(), RunnerRepositoryError>;

    /// List runners in a given status.
    async fn list_by_status(&self, status: RunnerStatus) -> Result<Vec<RunnerModel>, RunnerRepositoryError>;

    /// Find the runner currently bound to a task, if any.
    async fn find_by_task(&self, task_id: Uuid) -> Result<Option<RunnerModel>, RunnerRepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerRepositoryError {
    #[error("runner not found")]
    RunnerNotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct SqliteRunnerRepository {
    pool: SqlitePool,
}

impl SqliteRunnerRepository {
    pub fn new(db: SqliteDb) -> Self {
        Self { pool: db.into() }
    }
}

#[async_trait]
impl RunnerRepository for SqliteRunnerRepository {
    async fn create(&self, runner: RunnerModel) -> Result<(), RunnerRepositoryError> {
        let query = r"
INSERT INTO runners (device_id, wallet_address, webhook, status, task_id, last_heartbeat, created_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
";
        let RunnerModel { device_id, wallet_address, webhook, status, task_id, last_heartbeat, created_at, updated_at } =
            runner;
        sqlx::query(query)
            .bind(device_id)
            .bind(wallet_address)
            .bind(webhook)
            .bind(status.to_string())
            .bind(task_id)
            .bind(last_heartbeat)
            .bind(created_at)
            .bind(updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find(&self, device_id: &str) -> Result<RunnerModel, RunnerRepositoryError> {
        let query = "SELECT * FROM runners WHERE device_id = ?";
        let runner: RunnerModel = sqlx::query_as(query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RunnerRepositoryError::RunnerNotFound)?;
        Ok(runner)
    }

    async fn upsert(&self, runner: RunnerUpsert) -> Result<RunnerModel, RunnerRepositoryError> {
        // A runner that still holds a task stays Busy no matter what the
        // incoming payload claims; Busy without a bound task must not exist.
        let query = r"
INSERT INTO runners (device_id, wallet_address, webhook, status, task_id, last_heartbeat, created_at, updated_at)
VALUES ($1, $2, $3, $4, NULL, $5, $6, $6)
ON CONFLICT (device_id) DO UPDATE SET
    status = CASE WHEN runners.task_id IS NOT NULL THEN 'Busy' ELSE excluded.status END,
    last_heartbeat = excluded.last_heartbeat,
    updated_at = excluded.updated_at,
    wallet_address = CASE WHEN excluded.wallet_address = '' THEN runners.wallet_address ELSE excluded.wallet_address END,
    webhook = CASE WHEN excluded.webhook = '' THEN runners.webhook ELSE excluded.webhook END
";
        let RunnerUpsert { device_id, wallet_address, webhook, status, last_heartbeat } = runner;
        sqlx::query(query)
            .bind(&device_id)
            .bind(wallet_address)
            .bind(webhook)
            .bind(status.to_string())
            .bind(last_heartbeat)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        self.find(&device_id).await
    }

    async fn update(&self, runner: RunnerModel) -> Result<(), RunnerRepositoryError> {
        let query = r"
UPDATE runners SET
    wallet_address = $2,
    webhook = $3,
    status = $4,
    task_id = $5,
    last_heartbeat = $6,
    updated_at = $7
WHERE device_id = $1
";
        let RunnerModel {
            device_id,
            wallet_address,
            webhook,
            status,
            task_id,
            last_heartbeat,
            created_at: _,
            updated_at,
        } = runner;
        let result = sqlx::query(query)
            .bind(device_id)
            .bind(wallet_address)
            .bind(webhook)
            .bind(status.to_string())
            .bind(task_id)
            .bind(last_heartbeat)
            .bind(updated_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RunnerRepositoryError::RunnerNotFound);
        }
        Ok(())
    }

    async fn list_by_status(&self, status: RunnerStatus) -> Result<Vec<RunnerModel>, RunnerRepositoryError> {
        let query = "SELECT * FROM runners WHERE status = ? ORDER BY created_at";
        let runners: Vec<RunnerModel> =
            sqlx::query_as(query).bind(status.to_string()).fetch_all(&self.pool).await?;
        Ok(runners)
    }

    async fn find_by_task(&self, task_id: Uuid) -> Result<Option<RunnerModel>, RunnerRepositoryError> {
        let query = "SELECT * FROM runners WHERE task_id = ?";
        let runner: Option<RunnerModel> =
            sqlx::query_as(query).bind(task_id).fetch_optional(&self.pool).await?;
        Ok(runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_repo() -> SqliteRunnerRepository {
        let db = SqliteDb::connect("sqlite://:memory:").await.expect("failed to create db");
        SqliteRunnerRepository::new(db)
    }

    fn make_upsert(device_id: &str) -> RunnerUpsert {
        RunnerUpsert {
            device_id: device_id.into(),
            wallet_address: "0xrunner".into(),
            webhook: "http://10.0.0.1:8080".into(),
            status: RunnerStatus::Online,
            last_heartbeat: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_inserts() {
        let repo = make_repo().await;
        let runner = repo.upsert(make_upsert("runner-1")).await.expect("failed to upsert");
        assert_eq!(runner.device_id, "runner-1");
        assert_eq!(runner.status, RunnerStatus::Online);
        assert_eq!(runner.task_id, None);
    }

    #[tokio::test]
    async fn heartbeat_preserves_webhook_and_wallet() {
        let repo = make_repo().await;
        repo.upsert(make_upsert("runner-1")).await.expect("failed to upsert");

        let heartbeat = RunnerUpsert {
            device_id: "runner-1".into(),
            wallet_address: String::new(),
            webhook: String::new(),
            status: RunnerStatus::Online,
            last_heartbeat: Utc::now(),
        };
        let runner = repo.upsert(heartbeat).await.expect("failed to upsert");
        assert_eq!(runner.webhook, "http://10.0.0.1:8080");
        assert_eq!(runner.wallet_address, "0xrunner");
    }

    #[tokio::test]
    async fn heartbeat_overwrites_non_empty_fields() {
        let repo = make_repo().await;
        repo.upsert(make_upsert("runner-1")).await.expect("failed to upsert");

        let heartbeat = RunnerUpsert {
            device_id: "runner-1".into(),
            wallet_address: "0xother".into(),
            webhook: "http://10.0.0.2:9090".into(),
            status: RunnerStatus::Online,
            last_heartbeat: Utc::now(),
        };
        let runner = repo.upsert(heartbeat).await.expect("failed to upsert");
        assert_eq!(runner.webhook, "http://10.0.0.2:9090");
        assert_eq!(runner.wallet_address, "0xother");
    }

    #[tokio::test]
    async fn heartbeat_keeps_busy_while_task_held() {
        let repo = make_repo().await;
        let mut runner = repo.upsert(make_upsert("runner-1")).await.expect("failed to upsert");
        runner.status = RunnerStatus::Busy;
        runner.task_id = Some(Uuid::new_v4());
        repo.update(runner.clone()).await.expect("failed to update");

        let mut heartbeat = make_upsert("runner-1");
        heartbeat.status = RunnerStatus::Online;
        let stored = repo.upsert(heartbeat).await.expect("failed to upsert");
        assert_eq!(stored.status, RunnerStatus::Busy);
        assert_eq!(stored.task_id, runner.task_id);
    }

    #[tokio::test]
    async fn status_filter_and_task_lookup() {
        let repo = make_repo().await;
        let online = repo.upsert(make_upsert("runner-1")).await.expect("failed to upsert");
        let mut busy = repo.upsert(make_upsert("runner-2")).await.expect("failed to upsert");
        busy.status = RunnerStatus::Busy;
        busy.task_id = Some(Uuid::new_v4());
        repo.update(busy.clone()).await.expect("failed to update");

        let found = repo.list_by_status(RunnerStatus::Online).await.expect("failed to list");
        assert_eq!(found.iter().map(|r| r.device_id.as_str()).collect::<Vec<_>>(), &["runner-1"]);
        assert_eq!(found[0], online);

        let found = repo.find_by_task(busy.task_id.unwrap()).await.expect("lookup failed").expect("no runner");
        assert_eq!(found.device_id, "runner-2");

        let found = repo.find_by_task(Uuid::new_v4()).await.expect("lookup failed");
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn missing_runner() {
        let repo = make_repo().await;
        let err = repo.find("nope").await.expect_err("lookup succeeded");
        assert!(matches!(err, RunnerRepositoryError::RunnerNotFound), "{err}");
    }
}
