use crate::{
    routes::{AppState, Json},
    services::task::TaskServiceError,
};
use axum::extract::{Path, State};
use parity_server_models::tasks::Task;
use uuid::Uuid;

pub(crate) async fn handler(
    state: State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Task>, TaskServiceError> {
    let task = state.services.task.get(task_id).await?;
    Ok(Json(task.into()))
}
