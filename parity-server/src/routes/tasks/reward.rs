use crate::{
    routes::{AppState, Json},
    services::task::TaskServiceError,
};
use axum::extract::{Path, State};
use uuid::Uuid;

pub(crate) async fn handler(
    state: State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<f64>, TaskServiceError> {
    let result = state.services.task.get_result(task_id).await?.ok_or(TaskServiceError::TaskNotFound)?;
    Ok(Json(result.reward))
}
