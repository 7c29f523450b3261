//! HTTP surface of the key directory.
//!
//! | Method | Path                          | Success |
//! |--------|-------------------------------|---------|
//! | POST   | `/devices`                    | 201     |
//! | GET    | `/bundle/{user_id}`           | 200     |
//! | POST   | `/prekeys`                    | 200     |
//! | POST   | `/devices/{device_id}/revoke` | 200     |
//!
//! Every route requires an authenticated caller; the authentication layer in
//! front of this service forwards the caller's user id in
//! [`USER_ID_HEADER`]. Errors are returned as `{ "message": ... }`.
//!
//! Directory calls run on Tokio's blocking pool: a durable store commits
//! (and syncs) inside the call.

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State, rejection::JsonRejection},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tessera_proto::{
    DeviceReceipt, ErrorBody, PreKeyBundle, PublishDeviceRequest, RevokeReceipt, TopUpRequest,
};
use thiserror::Error;

use crate::{BundleError, KeyDirectory, storage::BundleStore};

/// Header carrying the authenticated caller's user id.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Build the directory router. Mount it under the service prefix.
pub fn router<S: BundleStore>(directory: KeyDirectory<S>) -> Router {
    Router::new()
        .route("/devices", post(register_device::<S>))
        .route("/devices/{device_id}/revoke", post(revoke_device::<S>))
        .route("/bundle/{user_id}", get(fetch_bundle::<S>))
        .route("/prekeys", post(top_up_pre_keys::<S>))
        .with_state(directory)
}

/// Caller identity established by the authentication layer.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub String);

impl<St: Send + Sync> FromRequestParts<St> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(ApiError::Unauthorized)?;

        Ok(Self(user_id.to_owned()))
    }
}

/// Error returned by a handler.
#[derive(Debug, Error)]
pub enum ApiError {
    /// No authenticated caller (401).
    #[error("unauthorized")]
    Unauthorized,

    /// Body could not be decoded (400).
    #[error("invalid request body: {0}")]
    BadRequest(String),

    /// Directory operation failed.
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// Directory call did not complete (500).
    #[error("directory task failed: {0}")]
    Task(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) | Self::Bundle(BundleError::InvalidArgument(_)) => {
                StatusCode::BAD_REQUEST
            },
            Self::Bundle(BundleError::Conflict { .. }) => StatusCode::CONFLICT,
            Self::Bundle(BundleError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Bundle(BundleError::Storage(_)) | Self::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            },
        };

        let message = match &self {
            Self::Bundle(BundleError::Storage(err)) => {
                tracing::error!(error = %err, "bundle store failure");
                "internal error".to_owned()
            },
            Self::Task(err) => {
                tracing::error!(error = %err, "directory task failure");
                "internal error".to_owned()
            },
            other => other.to_string(),
        };

        (status, Json(ErrorBody { message })).into_response()
    }
}

async fn register_device<S: BundleStore>(
    State(directory): State<KeyDirectory<S>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    payload: Result<Json<PublishDeviceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<DeviceReceipt>), ApiError> {
    let Json(request) = payload?;
    let receipt = blocking(directory, move |d| d.publish(&user_id, request)).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn fetch_bundle<S: BundleStore>(
    State(directory): State<KeyDirectory<S>>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Path(user_id): Path<String>,
) -> Result<Json<PreKeyBundle>, ApiError> {
    tracing::debug!(caller = %caller, user_id = %user_id, "bundle requested");
    Ok(Json(blocking(directory, move |d| d.consume_one(&user_id)).await?))
}

async fn top_up_pre_keys<S: BundleStore>(
    State(directory): State<KeyDirectory<S>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    payload: Result<Json<TopUpRequest>, JsonRejection>,
) -> Result<Json<DeviceReceipt>, ApiError> {
    let Json(request) = payload?;
    let device_id = request
        .device_id
        .ok_or_else(|| BundleError::InvalidArgument("deviceId is required".into()))?;
    let keys = request.one_time_pre_keys;
    Ok(Json(blocking(directory, move |d| d.top_up(&user_id, &device_id, keys)).await?))
}

async fn revoke_device<S: BundleStore>(
    State(directory): State<KeyDirectory<S>>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(device_id): Path<String>,
) -> Result<Json<RevokeReceipt>, ApiError> {
    Ok(Json(blocking(directory, move |d| d.revoke(&user_id, &device_id)).await?))
}

/// Run a directory call on the blocking pool.
async fn blocking<S, T, F>(directory: KeyDirectory<S>, call: F) -> Result<T, ApiError>
where
    S: BundleStore,
    T: Send + 'static,
    F: FnOnce(&KeyDirectory<S>) -> Result<T, BundleError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(move || call(&directory))
        .await
        .map_err(|err| ApiError::Task(err.to_string()))?;
    Ok(result?)
}
