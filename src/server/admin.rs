//! Administrative routes outside the OSBAPI contract.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::handlers::ApiError;
use super::state::AppState;
use crate::storage::migration;

#[derive(Debug, Serialize)]
pub struct ExampleEntry {
    pub name: String,
    pub description: String,
    pub service_name: String,
    pub service_id: String,
    pub plan_id: String,
    pub provision_params: Map<String, Value>,
    pub bind_params: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<Value>,
}

pub async fn info(State(state): State<AppState>) -> Response {
    let uptime = state.started.elapsed();
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": format_uptime(uptime.as_secs()),
    }))
    .into_response()
}

pub async fn examples(State(state): State<AppState>) -> Json<Vec<ExampleEntry>> {
    let entries = state
        .broker
        .catalog()
        .services()
        .iter()
        .flat_map(|svc| {
            let def = &svc.definition;
            def.examples.iter().map(move |ex| ExampleEntry {
                name: ex.name.clone(),
                description: ex.description.clone(),
                service_name: def.name.clone(),
                service_id: def.id.clone(),
                plan_id: ex.plan_id.clone(),
                provision_params: ex.provision_params.clone(),
                bind_params: ex.bind_params.clone(),
                expected_output: ex.expected_output.clone(),
            })
        })
        .collect();
    Json(entries)
}

pub async fn docs(State(state): State<AppState>) -> Response {
    let body = crate::brokerpak::docs::render(state.broker.catalog().services().iter().map(|s| &*s.definition));
    ([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], body).into_response()
}

pub async fn import_state(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    state.broker.import_state(&instance_id, &body)?;
    Ok(StatusCode::OK.into_response())
}

pub async fn migrate(State(state): State<AppState>) -> Result<Response, ApiError> {
    migration::run_migrations(state.broker.storage().database())?;
    Ok((StatusCode::OK, Json(json!({}))).into_response())
}

pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

fn format_uptime(secs: u64) -> String {
    let (h, rem) = (secs / 3600, secs % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_format() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(65), "1m5s");
        assert_eq!(format_uptime(3725), "1h2m5s");
    }
}
