use crate::{
    repositories::{
        runner::{RunnerRepository, RunnerRepositoryError, RunnerStatus},
        task::{
            TaskModel, TaskRepository, TaskRepositoryError, TaskResultModel, TaskStatus, TaskTransition, TaskType,
        },
    },
    services::{
        nonce,
        reward::{self, ResourceMetrics},
        settlement::SettlementClient,
    },
    workers::events::{EventBus, TaskEvent},
};
use async_trait::async_trait;
use chrono::Utc;
use parity_server_models::tasks::{self, CreateTaskRequest, SubmitResultRequest};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use strum::EnumDiscriminants;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A creation request together with the identity headers it arrived with.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub request: CreateTaskRequest,
    pub creator_device_id: String,
    pub creator_address: String,
}

/// A result submission together with the solver identity header.
#[derive(Clone, Debug)]
pub struct ResultSubmission {
    pub task_id: Uuid,
    pub device_id: String,
    pub request: SubmitResultRequest,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskService: Send + Sync {
    /// Create a task. The creator must hold a sufficient stake.
    async fn create(&self, new_task: NewTask) -> Result<TaskModel, TaskServiceError>;

    /// Find a task by id.
    async fn get(&self, id: Uuid) -> Result<TaskModel, TaskServiceError>;

    /// List all tasks.
    async fn list(&self) -> Result<Vec<TaskModel>, TaskServiceError>;

    /// List pending tasks with no runner bound.
    async fn list_available(&self) -> Result<Vec<TaskModel>, TaskServiceError>;

    /// Bind a pending task to an online runner. The Pending guard on the task
    /// row arbitrates concurrent attempts.
    async fn assign(&self, task_id: Uuid, device_id: &str) -> Result<(), TaskServiceError>;

    /// Move a task to Running. Idempotent when it is already running.
    async fn start(&self, task_id: Uuid, runner_id: Option<String>) -> Result<(), TaskServiceError>;

    /// Move a running task to Completed and free its runner. Idempotent when
    /// it is already completed; result ingestion is the authoritative path.
    async fn complete(&self, task_id: Uuid) -> Result<(), TaskServiceError>;

    /// Ingest an execution result: verify the nonce, classify the outcome,
    /// price the reward and settle it.
    async fn save_result(&self, submission: ResultSubmission) -> Result<TaskResultModel, TaskServiceError>;

    /// Find the stored result for a task, if any.
    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResultModel>, TaskServiceError>;

    /// Mark a running task failed because its runner could not be notified.
    /// Returns false when the task moved on in the meantime.
    async fn fail_delivery(&self, task_id: Uuid) -> Result<bool, TaskServiceError>;
}

#[derive(Debug, thiserror::Error, EnumDiscriminants)]
pub enum TaskServiceError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("task not found")]
    TaskNotFound,

    #[error("task unavailable")]
    TaskUnavailable,

    #[error("runner not found")]
    RunnerNotFound,

    #[error("runner unavailable")]
    RunnerUnavailable,

    #[error("task already completed")]
    AlreadyCompleted,

    #[error("nonce missing from task output")]
    NonceVerificationFailed,

    #[error("insufficient stake for {0}")]
    InsufficientStake(String),

    #[error("settlement unavailable: {0}")]
    SettlementUnavailable(String),

    #[error("store failure: {0}")]
    Store(String),
}

impl From<TaskRepositoryError> for TaskServiceError {
    fn from(e: TaskRepositoryError) -> Self {
        match e {
            TaskRepositoryError::TaskNotFound => Self::TaskNotFound,
            TaskRepositoryError::DuplicateTask | TaskRepositoryError::Database(_) => Self::Store(e.to_string()),
        }
    }
}

impl From<RunnerRepositoryError> for TaskServiceError {
    fn from(e: RunnerRepositoryError) -> Self {
        match e {
            RunnerRepositoryError::RunnerNotFound => Self::RunnerNotFound,
            RunnerRepositoryError::Database(_) => Self::Store(e.to_string()),
        }
    }
}

pub struct TaskServiceArgs {
    pub tasks: Arc<dyn TaskRepository>,
    pub runners: Arc<dyn RunnerRepository>,
    pub settlement: Arc<dyn SettlementClient>,
    pub events: EventBus,
    pub minimum_stake: f64,
}

pub struct DefaultTaskService {
    tasks: Arc<dyn TaskRepository>,
    runners: Arc<dyn RunnerRepository>,
    settlement: Arc<dyn SettlementClient>,
    events: EventBus,
    minimum_stake: f64,
}

impl DefaultTaskService {
    pub fn new(args: TaskServiceArgs) -> Self {
        let TaskServiceArgs { tasks, runners, settlement, events, minimum_stake } = args;
        Self { tasks, runners, settlement, events, minimum_stake }
    }

    fn validate(request: &CreateTaskRequest) -> Result<(), TaskServiceError> {
        if request.title.trim().is_empty() {
            return Err(TaskServiceError::InvalidTask("title must not be empty".into()));
        }
        match request.task_type {
            tasks::TaskType::Container => {
                let has_image = request.config.image_name.as_deref().is_some_and(|name| !name.is_empty())
                    || request.config.image_url.as_deref().is_some_and(|url| !url.is_empty());
                if !has_image {
                    return Err(TaskServiceError::InvalidTask("container tasks require an image".into()));
                }
                if !request.environment.as_ref().is_some_and(|e| e.env_type == "container") {
                    return Err(TaskServiceError::InvalidTask(
                        "container tasks require a container environment".into(),
                    ));
                }
            }
            tasks::TaskType::Command => {
                if request.config.command.iter().all(|part| part.is_empty()) {
                    return Err(TaskServiceError::InvalidTask("command tasks require a command".into()));
                }
            }
        }
        Ok(())
    }

    /// Free the runner bound to a task, if any, and announce it as assignable
    /// again.
    async fn detach_runner(&self, task_id: Uuid) {
        let runner = match self.runners.find_by_task(task_id).await {
            Ok(Some(runner)) => runner,
            Ok(None) => return,
            Err(e) => {
                error!("Failed to look up runner for task {task_id}: {e}");
                return;
            }
        };
        let device_id = runner.device_id.clone();
        let runner =
            crate::repositories::runner::RunnerModel { status: RunnerStatus::Online, task_id: None, updated_at: Utc::now(), ..runner };
        match self.runners.update(runner).await {
            Ok(()) => self.events.publish(TaskEvent::RunnerOnline(device_id)),
            Err(e) => error!("Failed to free runner {device_id} from task {task_id}: {e}"),
        }
    }

    async fn bind_runner(&self, task_id: Uuid, device_id: &str) {
        let mut runner = match self.runners.find(device_id).await {
            Ok(runner) => runner,
            Err(e) => {
                warn!("Cannot bind runner {device_id} to task {task_id}: {e}");
                return;
            }
        };
        runner.status = RunnerStatus::Busy;
        runner.task_id = Some(task_id);
        runner.updated_at = Utc::now();
        if let Err(e) = self.runners.update(runner).await {
            // The task stays Running; the heartbeat monitor releases it if no
            // runner ever picks it up.
            error!("Failed to bind runner {device_id} to task {task_id}: {e}");
        }
    }
}

#[async_trait]
impl TaskService for DefaultTaskService {
    async fn create(&self, new_task: NewTask) -> Result<TaskModel, TaskServiceError> {
        let NewTask { request, creator_device_id, creator_address } = new_task;
        Self::validate(&request)?;

        let identity = if creator_address.is_empty() { creator_device_id.as_str() } else { creator_address.as_str() };
        let stake = self
            .settlement
            .stake_info(identity)
            .await
            .map_err(|e| TaskServiceError::SettlementUnavailable(e.to_string()))?;
        if !stake.exists || stake.amount < self.minimum_stake {
            return Err(TaskServiceError::InsufficientStake(identity.into()));
        }

        let now = Utc::now();
        let task = TaskModel {
            id: Uuid::new_v4(),
            title: request.title,
            description: request.description,
            task_type: request.task_type.into(),
            config: request.config,
            environment: request.environment,
            creator_device_id,
            creator_address,
            nonce: nonce::generate(),
            status: TaskStatus::Pending,
            reward: request.reward,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.tasks.create(task.clone()).await?;
        info!("Created task {}", task.id);
        self.events.publish(TaskEvent::TaskCreated(task.id));
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<TaskModel, TaskServiceError> {
        Ok(self.tasks.find(id).await?)
    }

    async fn list(&self) -> Result<Vec<TaskModel>, TaskServiceError> {
        Ok(self.tasks.list().await?)
    }

    async fn list_available(&self) -> Result<Vec<TaskModel>, TaskServiceError> {
        let pending = self.tasks.list_by_status(TaskStatus::Pending).await?;
        let mut available = Vec::with_capacity(pending.len());
        for task in pending {
            if self.runners.find_by_task(task.id).await?.is_none() {
                available.push(task);
            }
        }
        Ok(available)
    }

    async fn assign(&self, task_id: Uuid, device_id: &str) -> Result<(), TaskServiceError> {
        let task = self.tasks.find(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(TaskServiceError::TaskUnavailable);
        }
        if task.task_type == TaskType::Container
            && !task.environment.as_ref().is_some_and(|e| e.env_type == "container")
        {
            return Err(TaskServiceError::TaskUnavailable);
        }
        let runner = self.runners.find(device_id).await?;
        if runner.status != RunnerStatus::Online {
            return Err(TaskServiceError::RunnerUnavailable);
        }

        // The task row update is the commit point.
        let won = self.tasks.transition(TaskTransition::new(task_id, TaskStatus::Pending, TaskStatus::Running)).await?;
        if !won {
            return Err(TaskServiceError::TaskUnavailable);
        }
        self.bind_runner(task_id, device_id).await;
        info!("Assigned task {task_id} to runner {device_id}");
        Ok(())
    }

    async fn start(&self, task_id: Uuid, runner_id: Option<String>) -> Result<(), TaskServiceError> {
        let task = self.tasks.find(task_id).await?;
        match task.status {
            TaskStatus::Running => Ok(()),
            TaskStatus::Completed => Err(TaskServiceError::AlreadyCompleted),
            TaskStatus::Failed | TaskStatus::NotVerified => Err(TaskServiceError::TaskUnavailable),
            TaskStatus::Pending => {
                let won = self
                    .tasks
                    .transition(TaskTransition::new(task_id, TaskStatus::Pending, TaskStatus::Running))
                    .await?;
                if !won {
                    return Err(TaskServiceError::TaskUnavailable);
                }
                if let Some(device_id) = runner_id {
                    self.bind_runner(task_id, &device_id).await;
                }
                info!("Started task {task_id}");
                Ok(())
            }
        }
    }

    async fn complete(&self, task_id: Uuid) -> Result<(), TaskServiceError> {
        let task = self.tasks.find(task_id).await?;
        match task.status {
            TaskStatus::Completed => return Ok(()),
            TaskStatus::Running => {}
            _ => return Err(TaskServiceError::TaskUnavailable),
        }
        let transition = TaskTransition {
            id: task_id,
            from: TaskStatus::Running,
            to: TaskStatus::Completed,
            reward: None,
            completed_at: Some(Utc::now()),
        };
        if !self.tasks.transition(transition).await? {
            // Raced with result ingestion; completed either way is a success.
            let task = self.tasks.find(task_id).await?;
            if task.status != TaskStatus::Completed {
                return Err(TaskServiceError::TaskUnavailable);
            }
        }
        self.detach_runner(task_id).await;
        info!("Completed task {task_id}");
        Ok(())
    }

    async fn save_result(&self, submission: ResultSubmission) -> Result<TaskResultModel, TaskServiceError> {
        let ResultSubmission { task_id, device_id, request } = submission;
        let task = self.tasks.find(task_id).await?;

        if task.status == TaskStatus::Completed {
            // Duplicate submission: keep the stored result, settle nothing.
            if let Some(existing) = self.tasks.find_result(task_id).await? {
                info!("Dropping duplicate result for task {task_id}");
                return Ok(existing);
            }
        }

        if !nonce::verify(&task.nonce, &request.output) {
            warn!("Nonce missing from output of task {task_id}, submitted by {device_id}");
            let rejected =
                self.tasks.transition(TaskTransition::new(task_id, TaskStatus::Running, TaskStatus::NotVerified)).await?;
            if rejected {
                self.detach_runner(task_id).await;
            }
            return Err(TaskServiceError::NonceVerificationFailed);
        }

        let verified = request.exit_code == 0;
        let metrics = ResourceMetrics {
            cpu_seconds: request.cpu_seconds,
            estimated_cycles: request.estimated_cycles,
            memory_gb_hours: request.memory_gb_hours,
            storage_gb: request.storage_gb,
            network_data_gb: request.network_data_gb,
        };
        let reward_amount = if verified { reward::calculate(&metrics) } else { 0.0 };

        let solver_address = match self.runners.find(&device_id).await {
            Ok(runner) if !runner.wallet_address.is_empty() => runner.wallet_address,
            _ => device_id.clone(),
        };
        let now = Utc::now();
        let result = TaskResultModel {
            id: Uuid::new_v4(),
            task_id,
            device_id: device_id.clone(),
            device_id_hash: hex::encode(Sha256::digest(device_id.as_bytes())),
            creator_address: task.creator_identity().to_string(),
            solver_address,
            output: request.output.trim().to_string(),
            error: request.error,
            exit_code: request.exit_code,
            execution_time_ms: request.execution_time_ms,
            cpu_seconds: request.cpu_seconds,
            estimated_cycles: request.estimated_cycles,
            memory_gb_hours: request.memory_gb_hours,
            storage_gb: request.storage_gb,
            network_data_gb: request.network_data_gb,
            reward: reward_amount,
            metadata: request.metadata,
            created_at: now,
        };

        // Task status commits first, then the result row.
        let transition = if verified {
            TaskTransition {
                id: task_id,
                from: TaskStatus::Running,
                to: TaskStatus::Completed,
                reward: Some(reward_amount),
                completed_at: Some(now),
            }
        } else {
            TaskTransition::new(task_id, TaskStatus::Running, TaskStatus::Failed)
        };
        if !self.tasks.transition(transition).await? {
            let current = self.tasks.find(task_id).await?;
            if current.status == TaskStatus::Completed {
                if let Some(existing) = self.tasks.find_result(task_id).await? {
                    return Ok(existing);
                }
            }
            return Err(TaskServiceError::TaskUnavailable);
        }
        self.tasks.save_result(result.clone()).await?;
        self.detach_runner(task_id).await;

        if verified && reward_amount > 0.0 {
            if let Err(e) =
                self.settlement.transfer_payment(&result.creator_address, &result.solver_address, reward_amount).await
            {
                // The verified result stands even when the payment does not go
                // through; settlement can be replayed out of band.
                error!("Failed to settle reward for task {task_id}: {e}");
            }
        }
        info!("Stored result for task {task_id}, exit code {}", result.exit_code);
        Ok(result)
    }

    async fn get_result(&self, task_id: Uuid) -> Result<Option<TaskResultModel>, TaskServiceError> {
        Ok(self.tasks.find_result(task_id).await?)
    }

    async fn fail_delivery(&self, task_id: Uuid) -> Result<bool, TaskServiceError> {
        let failed = self.tasks.transition(TaskTransition::new(task_id, TaskStatus::Running, TaskStatus::Failed)).await?;
        if failed {
            warn!("Marked task {task_id} failed after undeliverable notification");
            self.detach_runner(task_id).await;
        }
        Ok(failed)
    }
}
