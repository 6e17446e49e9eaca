use crate::{
    routes::{AppState, Json},
    services::task::TaskServiceError,
};
use axum::extract::State;
use parity_server_models::tasks::Task;

pub(crate) async fn handler(state: State<AppState>) -> Result<Json<Vec<Task>>, TaskServiceError> {
    let tasks = state.services.task.list_available().await?;
    Ok(Json(tasks.into_iter().map(Into::into).collect()))
}
