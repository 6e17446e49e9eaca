use crate::{
    clients::artifacts::ArtifactStore,
    repositories::runner::{RunnerRepository, RunnerRepositoryError},
    services::task::{TaskService, TaskServiceError, TaskServiceErrorDiscriminants},
    workers::{events::EventBus, webhook::WebhookRegistry},
};
use axum::{
    Router,
    extract::{FromRequest, FromRequestParts, Request, rejection::JsonRejection},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use parity_server_models::errors::RequestHandlerError;
use serde::Serialize;
use std::{ops::Deref, sync::Arc};
use tracing::error;
use validator::Validate;

pub(crate) mod runners;
pub(crate) mod tasks;

#[derive(Clone)]
pub struct Services {
    pub task: Arc<dyn TaskService>,
}

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub runners: Arc<dyn RunnerRepository>,
    pub registry: Arc<WebhookRegistry>,
    pub artifacts: Option<Arc<dyn ArtifactStore>>,
    pub events: EventBus,
}

pub fn build_router(state: AppState, endpoint_prefix: &str) -> Router {
    let api = Router::new()
        .route("/tasks", post(tasks::create::handler).get(tasks::list::handler))
        .route("/tasks/{task_id}", get(tasks::get::handler))
        .route("/tasks/{task_id}/assign", post(tasks::assign::handler))
        .route("/tasks/{task_id}/reward", get(tasks::reward::handler))
        .route("/tasks/{task_id}/result", get(tasks::result::handler))
        .route("/runners", post(runners::register::handler))
        .route("/runners/heartbeat", post(runners::heartbeat::handler))
        .route(
            "/runners/webhooks",
            post(runners::webhooks::register_handler).delete(runners::webhooks::delete_handler),
        )
        .route("/runners/tasks/available", get(runners::tasks::available::handler))
        .route("/runners/tasks/{task_id}/start", post(runners::tasks::start::handler))
        .route("/runners/tasks/{task_id}/complete", post(runners::tasks::complete::handler))
        .route("/runners/tasks/{task_id}/result", post(runners::tasks::result::handler))
        .with_state(state);
    let router = Router::new().route("/health", get(health));
    if endpoint_prefix.is_empty() { router.merge(api) } else { router.nest(endpoint_prefix, api) }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

type HeaderRejection = (StatusCode, axum::Json<RequestHandlerError>);

fn required_header(parts: &Parts, name: &'static str) -> Result<String, HeaderRejection> {
    match parts.headers.get(name).and_then(|value| value.to_str().ok()) {
        Some(value) if !value.is_empty() => Ok(value.into()),
        _ => {
            let payload = RequestHandlerError::new(format!("missing {name} header"), "MISSING_HEADER");
            Err((StatusCode::BAD_REQUEST, axum::Json(payload)))
        }
    }
}

/// The `X-Device-ID` header, mandatory on identity-bearing endpoints.
pub(crate) struct DeviceId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for DeviceId {
    type Rejection = HeaderRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        required_header(parts, "X-Device-ID").map(Self)
    }
}

/// The `X-Runner-ID` header.
pub(crate) struct RunnerId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for RunnerId {
    type Rejection = HeaderRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        required_header(parts, "X-Runner-ID").map(Self)
    }
}

/// The optional `X-Creator-Address` header; empty when absent.
pub(crate) struct CreatorAddress(pub String);

impl<S: Send + Sync> FromRequestParts<S> for CreatorAddress {
    type Rejection = HeaderRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get("X-Creator-Address")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(Self(value))
    }
}

/// A type that behaves like `axum::Json` but validates the payload and
/// provides JSON structured errors when parsing fails.
#[derive(Debug)]
pub struct Json<T>(pub T);

impl<S, T> FromRequest<S> for Json<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    T: Validate,
    S: Send + Sync,
{
    type Rejection = (StatusCode, axum::Json<RequestHandlerError>);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let inner = match axum::Json::<T>::from_request(req, state).await {
            Ok(value) => value.0,
            Err(rejection) => {
                let payload = RequestHandlerError::new(rejection.body_text(), "MALFORMED_REQUEST");
                return Err((rejection.status(), axum::Json(payload)));
            }
        };
        match inner.validate() {
            Ok(_) => Ok(Self(inner)),
            Err(e) => {
                let payload = RequestHandlerError::new(e.to_string(), "MALFORMED_REQUEST");
                Err((StatusCode::BAD_REQUEST, axum::Json(payload)))
            }
        }
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> IntoResponse for Json<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

impl IntoResponse for TaskServiceError {
    fn into_response(self) -> Response {
        let discriminant = TaskServiceErrorDiscriminants::from(&self);
        let (code, message) = match &self {
            Self::InvalidTask(_) | Self::NonceVerificationFailed | Self::InsufficientStake(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            Self::TaskNotFound | Self::RunnerNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            Self::TaskUnavailable | Self::RunnerUnavailable | Self::AlreadyCompleted => {
                (StatusCode::CONFLICT, self.to_string())
            }
            Self::SettlementUnavailable(e) => {
                error!("Settlement failure: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "settlement unavailable".into())
            }
            Self::Store(e) => {
                error!("Store failure: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        };
        let response = RequestHandlerError::new(message, format!("{discriminant:?}"));
        (code, Json(response)).into_response()
    }
}

impl IntoResponse for RunnerRepositoryError {
    fn into_response(self) -> Response {
        let (code, message, error_code) = match &self {
            Self::RunnerNotFound => (StatusCode::NOT_FOUND, self.to_string(), "RUNNER_NOT_FOUND"),
            Self::Database(e) => {
                error!("Store failure: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into(), "INTERNAL")
            }
        };
        let response = RequestHandlerError::new(message, error_code);
        (code, Json(response)).into_response()
    }
}
