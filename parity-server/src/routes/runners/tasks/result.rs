use crate::{
    routes::{AppState, DeviceId, Json},
    services::task::{ResultSubmission, TaskServiceError},
};
use axum::extract::{Path, State};
use parity_server_models::tasks::{SubmitResultRequest, TaskResult};
use uuid::Uuid;

/// Result ingest. Derived fields (task reference, device hash, addresses,
/// reward) are filled server-side; the submitted body only carries what the
/// runner observed.
pub(crate) async fn handler(
    state: State<AppState>,
    Path(task_id): Path<Uuid>,
    device_id: DeviceId,
    request: Json<SubmitResultRequest>,
) -> Result<Json<TaskResult>, TaskServiceError> {
    let submission = ResultSubmission { task_id, device_id: device_id.0, request: request.0 };
    let result = state.services.task.save_result(submission).await?;
    Ok(Json(result.into()))
}
