use crate::{
    routes::{AppState, Json},
    services::task::TaskServiceError,
};
use axum::extract::{Path, State};
use parity_server_models::tasks::TaskResult;
use uuid::Uuid;

pub(crate) async fn handler(
    state: State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskResult>, TaskServiceError> {
    let result = state.services.task.get_result(task_id).await?.ok_or(TaskServiceError::TaskNotFound)?;
    Ok(Json(result.into()))
}
