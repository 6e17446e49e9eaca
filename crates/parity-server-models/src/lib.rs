use convert_case::{Case, Casing};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub mod tasks {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::Value;

    /// How a task is executed on the runner side.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TaskType {
        Container,
        Command,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TaskStatus {
        Pending,
        Running,
        Completed,
        Failed,
        NotVerified,
    }

    /// The execution configuration attached to a task. For container tasks
    /// `image_name` must be set; `image_url` points at a large image artifact
    /// when one was uploaded out of band.
    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, Validate)]
    pub struct TaskConfig {
        #[serde(default)]
        pub command: Vec<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub image_name: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub image_url: Option<String>,

        #[serde(default)]
        pub env_vars: HashMap<String, String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub resources: Option<ResourceHints>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct ResourceHints {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub cpu_cores: Option<u32>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub memory_mb: Option<u64>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub disk_gb: Option<u64>,
    }

    /// The environment a task runs in: a type tag plus an open settings map.
    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    pub struct TaskEnvironment {
        #[serde(rename = "type")]
        pub env_type: String,

        #[serde(default, flatten)]
        pub settings: HashMap<String, Value>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, Validate)]
    pub struct CreateTaskRequest {
        #[validate(length(min = 1, message = "title must not be empty"))]
        pub title: String,

        #[serde(default)]
        pub description: String,

        pub task_type: TaskType,

        #[validate(nested)]
        pub config: TaskConfig,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub environment: Option<TaskEnvironment>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub reward: Option<f64>,
    }

    /// A task as exposed over the wire, including the nonce the runner must
    /// echo back in its output.
    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct Task {
        pub id: Uuid,
        pub title: String,
        pub description: String,
        pub task_type: TaskType,
        pub config: TaskConfig,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub environment: Option<TaskEnvironment>,
        pub creator_device_id: String,
        pub creator_address: String,
        pub nonce: String,
        pub status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub reward: Option<f64>,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub completed_at: Option<DateTime<Utc>>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, Validate)]
    pub struct AssignTaskRequest {
        #[validate(length(min = 1, message = "runner_id must not be empty"))]
        pub runner_id: String,
    }

    /// A runner's report of one execution attempt.
    #[derive(Clone, Debug, Serialize, Deserialize, Validate)]
    pub struct SubmitResultRequest {
        #[serde(default)]
        pub output: String,

        #[serde(default)]
        pub error: String,

        pub exit_code: i64,

        #[serde(default)]
        pub execution_time_ms: i64,

        #[serde(default)]
        #[validate(range(min = 0.0))]
        pub cpu_seconds: f64,

        #[serde(default)]
        #[validate(range(min = 0))]
        pub estimated_cycles: i64,

        #[serde(default)]
        #[validate(range(min = 0.0))]
        pub memory_gb_hours: f64,

        #[serde(default)]
        #[validate(range(min = 0.0))]
        pub storage_gb: f64,

        #[serde(default)]
        #[validate(range(min = 0.0))]
        pub network_data_gb: f64,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub metadata: Option<Value>,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct TaskResult {
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
        #[serde(skip_serializing_if = "Option::is_none")]
        pub metadata: Option<Value>,
        pub created_at: DateTime<Utc>,
    }
}

pub mod runners {
    use super::*;
    use chrono::{DateTime, Utc};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum RunnerStatus {
        Online,
        Offline,
        Busy,
    }

    fn validate_webhook(value: &str) -> Result<(), ValidationError> {
        if value.is_empty() || value.starts_with("http://") || value.starts_with("https://") {
            Ok(())
        } else {
            Err(ValidationError::new("webhook must be an http(s) URL"))
        }
    }

    #[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
    pub struct RegisterRunnerRequest {
        #[serde(default)]
        pub wallet_address: String,

        #[serde(default)]
        #[validate(custom(function = "validate_webhook"))]
        pub webhook: String,
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct Runner {
        pub device_id: String,
        pub wallet_address: String,
        pub webhook: String,
        pub status: RunnerStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub task_id: Option<Uuid>,
        pub last_heartbeat: DateTime<Utc>,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    /// Periodic liveness report. The webhook carries the runner's public
    /// address and only replaces a stored value when non-empty.
    #[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
    pub struct HeartbeatRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub status: Option<RunnerStatus>,

        #[serde(default)]
        pub webhook: String,

        #[serde(default)]
        pub wallet_address: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub timestamp: Option<i64>,
    }

    #[derive(Clone, Debug, Serialize, Deserialize, Validate)]
    pub struct RegisterWebhookRequest {
        #[validate(length(min = 1), custom(function = "validate_webhook"))]
        pub url: String,

        #[serde(default)]
        pub wallet_address: String,
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct RegisterWebhookResponse {
        pub id: Uuid,
    }
}

pub mod webhooks {
    use super::*;
    use crate::tasks::Task;

    pub const AVAILABLE_TASKS: &str = "available_tasks";

    /// The payload pushed to runner webhook URLs.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct WebhookMessage {
        #[serde(rename = "type")]
        pub message_type: String,

        pub payload: Vec<Task>,
    }

    impl WebhookMessage {
        pub fn available_tasks(payload: Vec<Task>) -> Self {
            Self { message_type: AVAILABLE_TASKS.into(), payload }
        }
    }
}

pub mod errors {
    use super::*;

    /// An error when handling a request.
    #[derive(Clone, Debug, Serialize, Deserialize)]
    pub struct RequestHandlerError {
        /// A descriptive message about the error that was encountered.
        pub message: String,

        /// The error code.
        pub error_code: String,
    }

    impl RequestHandlerError {
        pub fn new(message: impl Into<String>, error_code: impl AsRef<str>) -> Self {
            let error_code = error_code.as_ref().to_case(Case::UpperSnake);
            Self { message: message.into(), error_code }
        }
    }
}
