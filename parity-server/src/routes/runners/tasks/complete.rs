use crate::{
    routes::{AppState, Json},
    services::task::TaskServiceError,
};
use axum::extract::{Path, State};
use uuid::Uuid;

pub(crate) async fn handler(
    state: State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<()>, TaskServiceError> {
    state.services.task.complete(task_id).await?;
    Ok(Json(()))
}
