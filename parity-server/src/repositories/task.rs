use crate::repositories::sqlite::SqliteDb;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parity_server_models::tasks::{self, TaskConfig, TaskEnvironment};
use serde_json::Value;
use sqlx::{SqlitePool, prelude::FromRow};
use strum::{Display, EnumString};
use uuid::Uuid;

/// A task row. `config` and `environment` are stored as JSON blobs with a
/// wire-stable schema.
#[derive(FromRow, Clone, Debug, PartialEq)]
pub struct TaskModel {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    #[sqlx(json)]
    pub config: TaskConfig,
    #[sqlx(json(nullable))]
    pub environment: Option<TaskEnvironment>,
    pub creator_device_id: String,
    pub creator_address: String,
    pub nonce: String,
    pub status: TaskStatus,
    pub reward: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskModel {
    /// The identity payments are drawn from: the wallet address when the
    /// creator supplied one, the device id otherwise.
    pub fn creator_identity(&self) -> &str {
        if self.creator_address.is_empty() { &self.creator_device_id } else { &self.creator_address }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, sqlx::Type)]
pub enum TaskType {
    Container,
    Command,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString, sqlx::Type)]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    NotVerified,
}

impl From<TaskType> for tasks::TaskType {
    fn from(task_type: TaskType) -> Self {
        match task_type {
            TaskType::Container => Self::Container,
            TaskType::Command => Self::Command,
        }
    }
}

impl From<tasks::TaskType> for TaskType {
    fn from(task_type: tasks::TaskType) -> Self {
        match task_type {
            tasks::TaskType::Container => Self::Container,
            tasks::TaskType::Command => Self::Command,
        }
    }
}

impl From<TaskStatus> for tasks::TaskStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => Self::Pending,
            TaskStatus::Running => Self::Running,
            TaskStatus::Completed => Self::Completed,
            TaskStatus::Failed => Self::Failed,
            TaskStatus::NotVerified => Self::NotVerified,
        }
    }
}

impl From<TaskModel> for tasks::Task {
    fn from(task: TaskModel) -> Self {
        let TaskModel {
            id,
            title,
            description,
            task_type,
            config,
            environment,
            creator_device_id,
            creator_address,
            nonce,
            status,
            reward,
            created_at,
            updated_at,
            completed_at,
        } = task;
        Self {
            id,
            title,
            description,
            task_type: task_type.into(),
            config,
            environment,
            creator_device_id,
            creator_address,
            nonce,
            status: status.into(),
            reward,
            created_at,
            updated_at,
            completed_at,
        }
    }
}

/// One execution attempt's outcome, keyed uniquely by task so re-submissions
/// are no-ops.
#[derive(FromRow, Clone, Debug, PartialEq)]
pub struct TaskResultModel {
    pub id: Uuid,
    pub task_id: Uuid,
    pub device_id: String,
    pub device_id_hash: String,
    pub creator_address: String,
    pub solver_address: String,
    pub output: String,
    pub error: String,
    pub exit_code: i64,
    pub execution_time_ms: i64,
    pub cpu_seconds: f64,
    pub estimated_cycles: i64,
    pub memory_gb_hours: f64,
    pub storage_gb: f64,
    pub network_data_gb: f64,
    pub reward: f64,
    #[sqlx(json(nullable))]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl From<TaskResultModel> for tasks::TaskResult {
    fn from(result: TaskResultModel) -> Self {
        let TaskResultModel {
            id,
            task_id,
            device_id,
            device_id_hash,
            creator_address,
            solver_address,
            output,
            error,
            exit_code,
            execution_time_ms,
            cpu_seconds,
            estimated_cycles,
            memory_gb_hours,
            storage_gb,
            network_data_gb,
            reward,
            metadata,
            created_at,
        } = result;
        Self {
            id,
            task_id,
            device_id,
            device_id_hash,
            creator_address,
            solver_address,
            output,
            error,
            exit_code,
            execution_time_ms,
            cpu_seconds,
            estimated_cycles,
            memory_gb_hours,
            storage_gb,
            network_data_gb,
            reward,
            metadata,
            created_at,
        }
    }
}

/// A guarded status change. The `from` status acts as the compare-and-swap
/// guard; reward and completion timestamp are only written when set.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskTransition {
    pub id: Uuid,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reward: Option<f64>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskTransition {
    pub fn new(id: Uuid, from: TaskStatus, to: TaskStatus) -> Self {
        Self { id, from, to, reward: None, completed_at: None }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Create a task.
    async fn create(&self, task: TaskModel) -> Result<(), TaskRepositoryError>;

    /// Find a task by id.
    async fn find(&self, id: Uuid) -> Result<TaskModel, TaskRepositoryError>;

    /// Overwrite a task row.
    async fn update(&self, task: TaskModel) -> Result<(), TaskRepositoryError>;

    /// List all tasks in insertion order.
    async fn list(&self) -> Result<Vec<TaskModel>, TaskRepositoryError>;

    /// List tasks in a given status, in insertion order.
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskModel>, TaskRepositoryError>;

    /// Apply a guarded status transition. Returns false when the guard did
    /// not match, i.e. another writer got there first.
    async fn transition(&self, transition: TaskTransition) -> Result<bool, TaskRepositoryError>;

    /// Persist a result. A result already stored for the same task is kept
    /// untouched.
    async fn save_result(&self, result: TaskResultModel) -> Result<(), TaskRepositoryError>;

    /// Find the result for a task, if any.
    async fn find_result(&self, task_id: Uuid) -> Result<Option<TaskResultModel>, TaskRepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TaskRepositoryError {
    #[error("task not found")]
    TaskNotFound,

    #[error("task already exists")]
    DuplicateTask,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(db: SqliteDb) -> Self {
        Self { pool: db.into() }
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: TaskModel) -> Result<(), TaskRepositoryError> {
        let query = r"
INSERT INTO tasks (
    id,
    title,
    description,
    task_type,
    config,
    environment,
    creator_device_id,
    creator_address,
    nonce,
    status,
    reward,
    created_at,
    updated_at,
    completed_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
";
        let TaskModel {
            id,
            title,
            description,
            task_type,
            config,
            environment,
            creator_device_id,
            creator_address,
            nonce,
            status,
            reward,
            created_at,
            updated_at,
            completed_at,
        } = task;
        let result = sqlx::query(query)
            .bind(id)
            .bind(title)
            .bind(description)
            .bind(task_type.to_string())
            .bind(sqlx::types::Json(config))
            .bind(environment.map(sqlx::types::Json))
            .bind(creator_device_id)
            .bind(creator_address)
            .bind(nonce)
            .bind(status.to_string())
            .bind(reward)
            .bind(created_at)
            .bind(updated_at)
            .bind(completed_at)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.as_database_error().is_some_and(|e| e.is_unique_violation()) => {
                Err(TaskRepositoryError::DuplicateTask)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, id: Uuid) -> Result<TaskModel, TaskRepositoryError> {
        let query = "SELECT * FROM tasks WHERE id = ?";
        let task: TaskModel = sqlx::query_as(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TaskRepositoryError::TaskNotFound)?;
        Ok(task)
    }

    async fn update(&self, task: TaskModel) -> Result<(), TaskRepositoryError> {
        let query = r"
UPDATE tasks SET
    title = $2,
    description = $3,
    task_type = $4,
    config = $5,
    environment = $6,
    creator_device_id = $7,
    creator_address = $8,
    nonce = $9,
    status = $10,
    reward = $11,
    updated_at = $12,
    completed_at = $13
WHERE id = $1
";
        let TaskModel {
            id,
            title,
            description,
            task_type,
            config,
            environment,
            creator_device_id,
            creator_address,
            nonce,
            status,
            reward,
            created_at: _,
            updated_at,
            completed_at,
        } = task;
        let result = sqlx::query(query)
            .bind(id)
            .bind(title)
            .bind(description)
            .bind(task_type.to_string())
            .bind(sqlx::types::Json(config))
            .bind(environment.map(sqlx::types::Json))
            .bind(creator_device_id)
            .bind(creator_address)
            .bind(nonce)
            .bind(status.to_string())
            .bind(reward)
            .bind(updated_at)
            .bind(completed_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TaskRepositoryError::TaskNotFound);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TaskModel>, TaskRepositoryError> {
        let query = "SELECT * FROM tasks ORDER BY created_at";
        let tasks: Vec<TaskModel> = sqlx::query_as(query).fetch_all(&self.pool).await?;
        Ok(tasks)
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskModel>, TaskRepositoryError> {
        let query = "SELECT * FROM tasks WHERE status = ? ORDER BY created_at";
        let tasks: Vec<TaskModel> =
            sqlx::query_as(query).bind(status.to_string()).fetch_all(&self.pool).await?;
        Ok(tasks)
    }

    async fn transition(&self, transition: TaskTransition) -> Result<bool, TaskRepositoryError> {
        let query = r"
UPDATE tasks SET
    status = $1,
    updated_at = $2,
    reward = COALESCE($3, reward),
    completed_at = COALESCE($4, completed_at)
WHERE id = $5 AND status = $6
";
        let TaskTransition { id, from, to, reward, completed_at } = transition;
        let result = sqlx::query(query)
            .bind(to.to_string())
            .bind(Utc::now())
            .bind(reward)
            .bind(completed_at)
            .bind(id)
            .bind(from.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn save_result(&self, result: TaskResultModel) -> Result<(), TaskRepositoryError> {
        let query = r"
INSERT INTO task_results (
    id,
    task_id,
    device_id,
    device_id_hash,
    creator_address,
    solver_address,
    output,
    error,
    exit_code,
    execution_time_ms,
    cpu_seconds,
    estimated_cycles,
    memory_gb_hours,
    storage_gb,
    network_data_gb,
    reward,
    metadata,
    created_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
ON CONFLICT (task_id) DO NOTHING
";
        let TaskResultModel {
            id,
            task_id,
            device_id,
            device_id_hash,
            creator_address,
            solver_address,
            output,
            error,
            exit_code,
            execution_time_ms,
            cpu_seconds,
            estimated_cycles,
            memory_gb_hours,
            storage_gb,
            network_data_gb,
            reward,
            metadata,
            created_at,
        } = result;
        sqlx::query(query)
            .bind(id)
            .bind(task_id)
            .bind(device_id)
            .bind(device_id_hash)
            .bind(creator_address)
            .bind(solver_address)
            .bind(output)
            .bind(error)
            .bind(exit_code)
            .bind(execution_time_ms)
            .bind(cpu_seconds)
            .bind(estimated_cycles)
            .bind(memory_gb_hours)
            .bind(storage_gb)
            .bind(network_data_gb)
            .bind(reward)
            .bind(metadata.map(sqlx::types::Json))
            .bind(created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_result(&self, task_id: Uuid) -> Result<Option<TaskResultModel>, TaskRepositoryError> {
        let query = "SELECT * FROM task_results WHERE task_id = ?";
        let result: Option<TaskResultModel> =
            sqlx::query_as(query).bind(task_id).fetch_optional(&self.pool).await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_repo() -> SqliteTaskRepository {
        let db = SqliteDb::connect("sqlite://:memory:").await.expect("failed to create db");
        SqliteTaskRepository::new(db)
    }

    fn make_task() -> TaskModel {
        let now = Utc::now();
        TaskModel {
            id: Uuid::new_v4(),
            title: "transcode".into(),
            description: "transcode a clip".into(),
            task_type: TaskType::Command,
            config: TaskConfig { command: vec!["echo".into(), "hi".into()], ..Default::default() },
            environment: None,
            creator_device_id: "creator-1".into(),
            creator_address: "0xabc".into(),
            nonce: "aa".repeat(32),
            status: TaskStatus::Pending,
            reward: Some(0.5),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn make_result(task_id: Uuid) -> TaskResultModel {
        TaskResultModel {
            id: Uuid::new_v4(),
            task_id,
            device_id: "runner-1".into(),
            device_id_hash: "beef".into(),
            creator_address: "0xabc".into(),
            solver_address: "runner-1".into(),
            output: "hi".into(),
            error: String::new(),
            exit_code: 0,
            execution_time_ms: 12,
            cpu_seconds: 1.0,
            estimated_cycles: 1000,
            memory_gb_hours: 0.01,
            storage_gb: 0.0,
            network_data_gb: 0.0,
            reward: 0.0001,
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn lookup() {
        let repo = make_repo().await;
        let task = make_task();
        repo.create(task.clone()).await.expect("failed to insert");

        let found = repo.find(task.id).await.expect("failed to find");
        assert_eq!(found.id, task.id);
        assert_eq!(found.config, task.config);
        assert_eq!(found.status, TaskStatus::Pending);

        let found = repo.list().await.expect("failed to list");
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_create() {
        let repo = make_repo().await;
        let task = make_task();
        repo.create(task.clone()).await.expect("failed to insert");
        let err = repo.create(task).await.expect_err("duplicate insert succeeded");
        assert!(matches!(err, TaskRepositoryError::DuplicateTask), "{err}");
    }

    #[tokio::test]
    async fn status_filter() {
        let repo = make_repo().await;
        let pending = make_task();
        let mut running = make_task();
        running.status = TaskStatus::Running;
        repo.create(pending.clone()).await.expect("failed to insert");
        repo.create(running.clone()).await.expect("failed to insert");

        let found = repo.list_by_status(TaskStatus::Pending).await.expect("failed to list");
        assert_eq!(found.iter().map(|t| t.id).collect::<Vec<_>>(), &[pending.id]);

        let found = repo.list_by_status(TaskStatus::Running).await.expect("failed to list");
        assert_eq!(found.iter().map(|t| t.id).collect::<Vec<_>>(), &[running.id]);
    }

    #[tokio::test]
    async fn guarded_transition() {
        let repo = make_repo().await;
        let task = make_task();
        repo.create(task.clone()).await.expect("failed to insert");

        let won = repo
            .transition(TaskTransition::new(task.id, TaskStatus::Pending, TaskStatus::Running))
            .await
            .expect("transition failed");
        assert!(won);

        // A second writer loses the race on the same guard.
        let won = repo
            .transition(TaskTransition::new(task.id, TaskStatus::Pending, TaskStatus::Running))
            .await
            .expect("transition failed");
        assert!(!won);

        let found = repo.find(task.id).await.expect("failed to find");
        assert_eq!(found.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn transition_sets_reward_and_completion() {
        let repo = make_repo().await;
        let task = make_task();
        repo.create(task.clone()).await.expect("failed to insert");
        repo.transition(TaskTransition::new(task.id, TaskStatus::Pending, TaskStatus::Running))
            .await
            .expect("transition failed");

        let completed_at = Utc::now();
        let transition = TaskTransition {
            id: task.id,
            from: TaskStatus::Running,
            to: TaskStatus::Completed,
            reward: Some(0.0001),
            completed_at: Some(completed_at),
        };
        assert!(repo.transition(transition).await.expect("transition failed"));

        let found = repo.find(task.id).await.expect("failed to find");
        assert_eq!(found.status, TaskStatus::Completed);
        assert_eq!(found.reward, Some(0.0001));
        assert!(found.completed_at.is_some());
    }

    #[tokio::test]
    async fn result_idempotence() {
        let repo = make_repo().await;
        let task = make_task();
        repo.create(task.clone()).await.expect("failed to insert");

        let first = make_result(task.id);
        repo.save_result(first.clone()).await.expect("failed to save");

        let mut second = make_result(task.id);
        second.output = "tampered".into();
        repo.save_result(second).await.expect("failed to save");

        let found = repo.find_result(task.id).await.expect("failed to find").expect("no result");
        assert_eq!(found.id, first.id);
        assert_eq!(found.output, "hi");
    }

    #[tokio::test]
    async fn missing_result() {
        let repo = make_repo().await;
        let found = repo.find_result(Uuid::new_v4()).await.expect("lookup failed");
        assert!(found.is_none());
    }
}
