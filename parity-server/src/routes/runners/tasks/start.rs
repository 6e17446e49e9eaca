use crate::{
    routes::{AppState, Json, RunnerId},
    services::task::TaskServiceError,
};
use axum::extract::{Path, State};
use uuid::Uuid;

pub(crate) async fn handler(
    state: State<AppState>,
    Path(task_id): Path<Uuid>,
    runner_id: RunnerId,
) -> Result<Json<()>, TaskServiceError> {
    state.services.task.start(task_id, Some(runner_id.0)).await?;
    Ok(Json(()))
}
