use crate::{
    clients::artifacts::ArtifactStoreError,
    routes::{AppState, CreatorAddress, DeviceId, Json},
    services::task::{NewTask, TaskServiceError},
};
use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use parity_server_models::{
    errors::RequestHandlerError,
    tasks::{CreateTaskRequest, Task},
};
use strum::EnumDiscriminants;
use tracing::error;
use uuid::Uuid;
use validator::Validate;

/// Accepts both a plain JSON body and a multipart variant carrying a
/// container image tarball next to the task payload. The tarball goes to
/// blob storage and the task config is rewritten to point at it.
pub(crate) async fn handler(
    state: State<AppState>,
    device_id: DeviceId,
    creator_address: CreatorAddress,
    request: Request,
) -> Result<(StatusCode, Json<Task>), HandlerError> {
    let content_type =
        request.headers().get(CONTENT_TYPE).and_then(|value| value.to_str().ok()).unwrap_or_default();
    let create = if content_type.starts_with("multipart/form-data") {
        let multipart =
            Multipart::from_request(request, &()).await.map_err(|e| HandlerError::Malformed(e.to_string()))?;
        parse_multipart(&state, multipart).await?
    } else {
        Json::<CreateTaskRequest>::from_request(request, &()).await.map_err(HandlerError::Rejection)?.0
    };
    create.validate().map_err(|e| HandlerError::Malformed(e.to_string()))?;

    let new_task =
        NewTask { request: create, creator_device_id: device_id.0, creator_address: creator_address.0 };
    let task = state.services.task.create(new_task).await?;
    Ok((StatusCode::CREATED, Json(task.into())))
}

async fn parse_multipart(state: &AppState, mut multipart: Multipart) -> Result<CreateTaskRequest, HandlerError> {
    let mut task: Option<CreateTaskRequest> = None;
    let mut image: Option<(String, Vec<u8>)> = None;
    while let Some(field) =
        multipart.next_field().await.map_err(|e| HandlerError::Malformed(e.to_string()))?
    {
        match field.name() {
            Some("task") => {
                let text = field.text().await.map_err(|e| HandlerError::Malformed(e.to_string()))?;
                let parsed = serde_json::from_str(&text)
                    .map_err(|e| HandlerError::Malformed(format!("invalid task payload: {e}")))?;
                task = Some(parsed);
            }
            Some("image") => {
                let name = field.file_name().unwrap_or("image.tar").to_string();
                let bytes = field.bytes().await.map_err(|e| HandlerError::Malformed(e.to_string()))?;
                image = Some((name, bytes.to_vec()));
            }
            _ => continue,
        }
    }
    let mut task = task.ok_or_else(|| HandlerError::Malformed("missing task field".into()))?;
    if let Some((name, bytes)) = image {
        let artifacts = state.artifacts.as_ref().ok_or(HandlerError::UploadsDisabled)?;
        let key = format!("{}-{name}", Uuid::new_v4());
        let url = artifacts.upload(&key, bytes).await?;
        task.config.image_url = Some(url);
    }
    Ok(task)
}

#[derive(Debug, thiserror::Error, EnumDiscriminants)]
pub(crate) enum HandlerError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("image uploads are not configured")]
    UploadsDisabled,

    #[error("failed to store image artifact")]
    Upload(#[from] ArtifactStoreError),

    #[error(transparent)]
    Service(#[from] TaskServiceError),

    #[error("malformed request")]
    Rejection((StatusCode, axum::Json<RequestHandlerError>)),
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let discriminant = HandlerErrorDiscriminants::from(&self);
        let (code, message) = match self {
            Self::Service(e) => return e.into_response(),
            Self::Rejection(rejection) => return rejection.into_response(),
            Self::Malformed(_) | Self::UploadsDisabled => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::Upload(ref e) => {
                error!("Failed to upload image artifact: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };
        let response = RequestHandlerError::new(message, format!("{discriminant:?}"));
        (code, Json(response)).into_response()
    }
}
