use crate::{
    repositories::runner::{RunnerRepositoryError, RunnerStatus, RunnerUpsert},
    routes::{AppState, DeviceId, Json},
    workers::events::TaskEvent,
};
use axum::extract::State;
use chrono::Utc;
use parity_server_models::runners::HeartbeatRequest;

/// Liveness report. Only status and last-seen are stamped unconditionally;
/// webhook and wallet survive empty payloads.
pub(crate) async fn handler(
    state: State<AppState>,
    device_id: DeviceId,
    request: Json<HeartbeatRequest>,
) -> Result<Json<()>, RunnerRepositoryError> {
    let status = request.status.map(Into::into).unwrap_or(RunnerStatus::Online);
    let upsert = RunnerUpsert {
        device_id: device_id.0.clone(),
        wallet_address: request.wallet_address.clone(),
        webhook: request.webhook.clone(),
        status,
        last_heartbeat: Utc::now(),
    };
    let runner = state.runners.upsert(upsert).await?;
    if runner.status == RunnerStatus::Online {
        state.events.publish(TaskEvent::RunnerOnline(device_id.0));
    }
    Ok(Json(()))
}
