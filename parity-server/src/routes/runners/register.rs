use crate::{
    repositories::runner::{RunnerRepositoryError, RunnerStatus, RunnerUpsert},
    routes::{AppState, DeviceId, Json},
    workers::events::TaskEvent,
};
use axum::{extract::State, http::StatusCode};
use chrono::Utc;
use parity_server_models::runners::{RegisterRunnerRequest, Runner};

pub(crate) async fn handler(
    state: State<AppState>,
    device_id: DeviceId,
    request: Json<RegisterRunnerRequest>,
) -> Result<(StatusCode, Json<Runner>), RunnerRepositoryError> {
    let upsert = RunnerUpsert {
        device_id: device_id.0.clone(),
        wallet_address: request.wallet_address.clone(),
        webhook: request.webhook.clone(),
        status: RunnerStatus::Online,
        last_heartbeat: Utc::now(),
    };
    let runner = state.runners.upsert(upsert).await?;
    state.events.publish(TaskEvent::RunnerOnline(device_id.0));
    Ok((StatusCode::CREATED, Json(runner.into())))
}
