//! OSBAPI request handlers.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use crate::broker::models::{BindDetails, DeleteDetails, ProvisionDetails, UpdateDetails};
use crate::error::{find_broker_error, BrokerError};

const ORIGINATING_IDENTITY_HEADER: &str = "X-Broker-API-Originating-Identity";

// ─── Errors ─────────────────────────────────────────────────────────────────

pub fn error_body(code: Option<&str>, description: &str) -> Json<Value> {
    match code {
        Some(code) => Json(json!({ "error": code, "description": description })),
        None => Json(json!({ "description": description })),
    }
}

/// An operation failure rendered with the status of the [`BrokerError`] in its chain.
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(err)
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match find_broker_error(&self.0) {
            Some(e) => (e.http_status(), e.error_code().map(str::to_string)),
            None => (500, None),
        };
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let description = format!("{:#}", self.0);
        if status.is_server_error() {
            tracing::error!(error = %description, "request failed");
        } else {
            tracing::info!(status = status.as_u16(), error = %description, "request refused");
        }
        (status, error_body(code.as_deref(), &description)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ─── Query parameters ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct AsyncQuery {
    #[serde(default)]
    pub accepts_incomplete: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub accepts_incomplete: bool,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub plan_id: String,
}

impl DeleteQuery {
    fn details(&self) -> DeleteDetails {
        DeleteDetails {
            service_id: self.service_id.clone(),
            plan_id: self.plan_id.clone(),
        }
    }
}

/// Decode `<platform> <base64 json>` into `{"platform": .., "value": ..}`.
pub fn originating_identity(headers: &HeaderMap) -> Value {
    let Some(raw) = headers.get(ORIGINATING_IDENTITY_HEADER).and_then(|v| v.to_str().ok()) else {
        return Value::Null;
    };
    let Some((platform, encoded)) = raw.trim().split_once(' ') else {
        return Value::Null;
    };
    let value = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .unwrap_or(Value::Null);
    json!({ "platform": platform, "value": value })
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, BrokerError> {
    serde_json::from_slice(body).map_err(|e| BrokerError::Validation(format!("invalid request body: {e}")))
}

// ─── Catalog ────────────────────────────────────────────────────────────────

pub async fn catalog(State(state): State<AppState>) -> Response {
    Json(state.broker.catalog().to_osb()).into_response()
}

// ─── Instances ──────────────────────────────────────────────────────────────

/// Async accepts carry no operation key; pollers query by instance alone.
fn accepted_body() -> Json<Value> {
    Json(json!({}))
}

pub async fn provision(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(q): Query<AsyncQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Response> {
    let details: ProvisionDetails = parse_body(&body)?;
    state
        .broker
        .provision(&instance_id, details, q.accepts_incomplete, originating_identity(&headers))
        .await?;
    Ok((StatusCode::ACCEPTED, accepted_body()).into_response())
}

pub async fn update(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(q): Query<AsyncQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Response> {
    let details: UpdateDetails = parse_body(&body)?;
    state
        .broker
        .update(&instance_id, details, q.accepts_incomplete, originating_identity(&headers))
        .await?;
    Ok((StatusCode::ACCEPTED, accepted_body()).into_response())
}

pub async fn deprovision(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(q): Query<DeleteQuery>,
) -> ApiResult<Response> {
    state
        .broker
        .deprovision(&instance_id, q.details(), q.accepts_incomplete)
        .await?;
    Ok((StatusCode::ACCEPTED, accepted_body()).into_response())
}

pub async fn get_instance(State(state): State<AppState>, Path(instance_id): Path<String>) -> ApiResult<Response> {
    Ok(Json(state.broker.get_instance(&instance_id)?).into_response())
}

pub async fn last_operation(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.broker.last_operation(&instance_id)?).into_response())
}

// ─── Bindings ───────────────────────────────────────────────────────────────

pub async fn bind(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Response> {
    let details: BindDetails = parse_body(&body)?;
    let resp = state
        .broker
        .bind(&instance_id, &binding_id, details, originating_identity(&headers))
        .await?;
    Ok((StatusCode::CREATED, Json(resp)).into_response())
}

pub async fn unbind(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Query(q): Query<DeleteQuery>,
) -> ApiResult<Response> {
    state.broker.unbind(&instance_id, &binding_id, q.details()).await?;
    Ok((StatusCode::OK, Json(json!({}))).into_response())
}

pub async fn get_binding(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    Ok(Json(state.broker.get_binding(&instance_id, &binding_id)?).into_response())
}

pub async fn last_binding_operation(
    State(state): State<AppState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    Ok(Json(state.broker.last_binding_operation(&instance_id, &binding_id)?).into_response())
}
