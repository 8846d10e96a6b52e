//! # Operational HTTP surface.
//!
//! | Route | Effect |
//! |---|---|
//! | `GET /health` | node summary |
//! | `GET /instances/{id}` | current row |
//! | `GET /instances/{id}/logs?tail=N` | buffered log entries |
//! | `POST /instances/{id}/stop` | force-stop |
//! | `POST /instances/{id}/resync` | queue a resync |
//! | `POST /instances/{id}/restart` | replace with a fresh instance |
//! | `POST /instances/{id}/heartbeat` | liveness heartbeat |
//! | `PUT /definitions/{id}` | validate and upsert, then reconcile |
//! | `DELETE /definitions/{id}` | remove, stopping its instances |
//! | `GET /definitions/{id}/instances` | instances, oldest first |
//! | `POST /definitions/{id}/enable`, `/disable` | toggle |
//!
//! Errors map to status codes through [`ApiError`]: 404 unknown, 409 conflict (retry),
//! 422 invalid definition.

mod error;

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

pub use error::{ApiError, ErrorResponse};

use crate::core::{Health, Orchestrator};
use crate::error::{OrchestratorError, ValidationError};
use crate::logs::LogEntry;
use crate::model::{ActivationDefinition, ActivationInstance, DefinitionId, InstanceId};

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Router over `orchestrator`.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/instances/:id", get(get_instance))
        .route("/instances/:id/logs", get(instance_logs))
        .route("/instances/:id/stop", post(stop_instance))
        .route("/instances/:id/resync", post(resync_instance))
        .route("/instances/:id/restart", post(restart_instance))
        .route("/instances/:id/heartbeat", post(heartbeat))
        .route(
            "/definitions/:id",
            put(put_definition).delete(delete_definition),
        )
        .route("/definitions/:id/instances", get(definition_instances))
        .route("/definitions/:id/enable", post(enable_definition))
        .route("/definitions/:id/disable", post(disable_definition))
        .with_state(orchestrator)
}

async fn health(State(orch): State<Arc<Orchestrator>>) -> ApiResult<Health> {
    Ok(Json(orch.health().await?))
}

async fn get_instance(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<ActivationInstance> {
    Ok(Json(orch.instance(&InstanceId::new(id)).await?))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn instance_logs(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Vec<LogEntry>> {
    Ok(Json(
        orch.instance_logs(&InstanceId::new(id), query.tail).await?,
    ))
}

async fn stop_instance(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<ActivationInstance> {
    Ok(Json(orch.request_stop(&InstanceId::new(id)).await?))
}

async fn resync_instance(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<ActivationInstance> {
    Ok(Json(orch.request_resync(&InstanceId::new(id)).await?))
}

async fn restart_instance(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<ActivationInstance> {
    Ok(Json(orch.request_restart(&InstanceId::new(id)).await?))
}

async fn heartbeat(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<ActivationInstance> {
    Ok(Json(orch.record_heartbeat(&InstanceId::new(id)).await?))
}

/// The body is a definition document; `id` comes from the path and `name` defaults to it.
async fn put_definition(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
    Json(mut body): Json<serde_json::Value>,
) -> ApiResult<ActivationDefinition> {
    let invalid = |reason: String| {
        ApiError(OrchestratorError::Configuration(ValidationError {
            definition: id.clone(),
            field: "body",
            reason,
        }))
    };
    let Some(fields) = body.as_object_mut() else {
        return Err(invalid("expected a JSON object".to_string()));
    };
    fields.insert("id".into(), serde_json::Value::String(id.clone()));
    fields
        .entry("name")
        .or_insert_with(|| serde_json::Value::String(id.clone()));

    let def: ActivationDefinition =
        serde_json::from_value(body).map_err(|err| invalid(err.to_string()))?;
    Ok(Json(orch.put_definition(def).await?))
}

async fn delete_definition(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<ActivationDefinition> {
    Ok(Json(orch.remove_definition(&DefinitionId::new(id)).await?))
}

async fn definition_instances(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ActivationInstance>> {
    Ok(Json(orch.instances(&DefinitionId::new(id)).await?))
}

async fn enable_definition(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<ActivationDefinition> {
    Ok(Json(orch.set_enabled(&DefinitionId::new(id), true).await?))
}

async fn disable_definition(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<ActivationDefinition> {
    Ok(Json(orch.set_enabled(&DefinitionId::new(id), false).await?))
}
