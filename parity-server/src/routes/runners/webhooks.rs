use crate::{
    repositories::runner::{RunnerRepositoryError, RunnerStatus, RunnerUpsert},
    routes::{AppState, DeviceId, Json},
    workers::events::TaskEvent,
};
use axum::{extract::State, http::StatusCode};
use chrono::Utc;
use parity_server_models::runners::{RegisterWebhookRequest, RegisterWebhookResponse};
use tracing::{error, info};

pub(crate) async fn register_handler(
    state: State<AppState>,
    device_id: DeviceId,
    request: Json<RegisterWebhookRequest>,
) -> Result<(StatusCode, Json<RegisterWebhookResponse>), RunnerRepositoryError> {
    let id = state.registry.register(&device_id.0, &request.url, &request.wallet_address);
    // Keep the runner row in sync so per-assignment notifies reach the same
    // URL the fan-out does.
    let upsert = RunnerUpsert {
        device_id: device_id.0.clone(),
        wallet_address: request.wallet_address.clone(),
        webhook: request.url.clone(),
        status: RunnerStatus::Online,
        last_heartbeat: Utc::now(),
    };
    state.runners.upsert(upsert).await?;
    info!("Registered webhook {} for runner {}", request.url, device_id.0);
    state.events.publish(TaskEvent::RunnerOnline(device_id.0));
    Ok((StatusCode::CREATED, Json(RegisterWebhookResponse { id })))
}

pub(crate) async fn delete_handler(
    state: State<AppState>,
    device_id: DeviceId,
) -> Result<Json<()>, RunnerRepositoryError> {
    state.registry.remove(&device_id.0);
    match state.runners.find(&device_id.0).await {
        Ok(mut runner) => {
            runner.webhook = String::new();
            runner.status = RunnerStatus::Offline;
            runner.updated_at = Utc::now();
            state.runners.update(runner).await?;
            info!("Unregistered webhook for runner {}", device_id.0);
        }
        Err(RunnerRepositoryError::RunnerNotFound) => {}
        Err(e) => {
            error!("Failed to look up runner {}: {e}", device_id.0);
            return Err(e);
        }
    }
    Ok(Json(()))
}
