use axum::{
    Json, Router,
    extract::{Extension, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::service::{ServiceError, StoreService, WriteOutcome};

#[derive(Clone)]
pub struct AppState {
    pub service: StoreService,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("unavailable", StatusCode::SERVICE_UNAVAILABLE, message)
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

impl From<ServiceError> for ApiError {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::HandoffTimeout { waited } => ApiError::unavailable(value.to_string())
                .with_detail("waited_ms", waited.as_millis() as u64),
            ServiceError::WorkerUnavailable => ApiError::unavailable(value.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S>,
    <axum::Json<T> as FromRequest<S>>::Rejection: std::fmt::Display,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| ApiError::invalid_request(e.to_string()))?;
        Ok(Self(value))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct NameBody {
    name: String,
}

pub fn build_router(service: StoreService) -> Router {
    let app_state = AppState { service };

    Router::new()
        .route("/health", get(health))
        .route("/data/name", get(get_name).put(put_name))
        .fallback(fallback_not_found)
        .layer(Extension(app_state))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn get_name(Extension(state): Extension<AppState>) -> Result<Json<NameBody>, ApiError> {
    let name = state.service.read_value().await?;
    Ok(Json(NameBody { name }))
}

async fn put_name(
    Extension(state): Extension<AppState>,
    ApiJson(body): ApiJson<NameBody>,
) -> Result<StatusCode, ApiError> {
    match state.service.write_value(body.name)? {
        WriteOutcome::Submitted | WriteOutcome::IgnoredBlank => Ok(StatusCode::NO_CONTENT),
    }
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}
