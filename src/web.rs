//! HTTP 入口
//!
//! - POST /orchestrate：完整编排（运行中失败也返回 200，status = failed）
//! - POST /stage-test：单阶段测试
//! - GET  /traces/:id：只读 Trace 查询
//! - GET  /health

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::core::OrchestrationError;
use crate::orchestrator::{OrchestrateRequest, Orchestrator, RunResponse, StageTestRequest, StageTestResponse};
use crate::trace::Trace;

type ApiError = (StatusCode, Json<Value>);

fn api_error(error: OrchestrationError) -> ApiError {
    let status = match &error {
        OrchestrationError::Validation(_)
        | OrchestrationError::PolicyViolation(_)
        | OrchestrationError::Serialization(_) => StatusCode::BAD_REQUEST,
        OrchestrationError::TraceNotFound(_) => StatusCode::NOT_FOUND,
        OrchestrationError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": { "kind": error.kind(), "message": error.to_string() } })),
    )
}

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/orchestrate", post(orchestrate))
        .route("/stage-test", post(stage_test))
        .route("/traces/:id", get(trace))
        .route("/health", get(health))
        .with_state(orchestrator)
}

async fn orchestrate(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<OrchestrateRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    orchestrator
        .orchestrate(request)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn stage_test(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<StageTestRequest>,
) -> Result<Json<StageTestResponse>, ApiError> {
    orchestrator
        .stage_test(request)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn trace(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> Result<Json<Trace>, ApiError> {
    orchestrator.trace(&id).map(Json).map_err(api_error)
}

async fn health(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Value> {
    let tools = orchestrator
        .runner()
        .execute_stage()
        .executor()
        .registry()
        .tool_types();
    Json(json!({
        "status": "ok",
        "tools": tools,
        "traces": orchestrator.store().len(),
    }))
}
