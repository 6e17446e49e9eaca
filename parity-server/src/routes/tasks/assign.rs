use crate::{
    routes::{AppState, Json},
    services::task::TaskServiceError,
};
use axum::extract::{Path, State};
use parity_server_models::tasks::AssignTaskRequest;
use uuid::Uuid;

pub(crate) async fn handler(
    state: State<AppState>,
    Path(task_id): Path<Uuid>,
    request: Json<AssignTaskRequest>,
) -> Result<Json<()>, TaskServiceError> {
    state.services.task.assign(task_id, &request.runner_id).await?;
    Ok(Json(()))
}
