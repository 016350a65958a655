//! API route handlers for the gateway.
//!
//! Every response body is JSON. Failures are `{"ok": false, "error": "..."}`
//! with a status code that tells validation, conflicts and backpressure apart.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use switchyard_core::completion;
use switchyard_scheduler::{EngineError, JobPatch, JobSpec};

use crate::server::AppState;

type ApiResponse = (StatusCode, Json<Value>);

fn ok(status: StatusCode, body: Value) -> ApiResponse {
    (status, Json(body))
}

fn fail(status: StatusCode, error: impl Into<String>) -> ApiResponse {
    (status, Json(json!({"ok": false, "error": error.into()})))
}

fn bad_json(rejection: JsonRejection) -> ApiResponse {
    fail(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", rejection.body_text()))
}

fn engine_failure(e: EngineError) -> ApiResponse {
    let status = match &e {
        EngineError::Validation { .. } => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Conflict(_) | EngineError::NotPaused(_) => StatusCode::CONFLICT,
        EngineError::Storage(_) => {
            tracing::error!("❌ Job storage failure: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    fail(status, e.to_string())
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "switchyard-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ---- Cron jobs ----

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResponse {
    let jobs = state.engine.list_jobs().await;
    ok(StatusCode::OK, json!({"ok": true, "jobs": jobs}))
}

pub async fn jobs_status(State(state): State<Arc<AppState>>) -> ApiResponse {
    let status = state.engine.status().await;
    ok(
        StatusCode::OK,
        json!({
            "ok": true,
            "total": status.total,
            "active": status.active,
            "paused": status.paused,
            "running": status.running,
        }),
    )
}

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    body: Result<Json<JobSpec>, JsonRejection>,
) -> ApiResponse {
    let Json(spec) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    match state.engine.add_job(spec).await {
        Ok(job) => ok(StatusCode::CREATED, json!({"ok": true, "job": job})),
        Err(e) => engine_failure(e),
    }
}

pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    match state.engine.get_job(&id).await {
        Some(job) => ok(StatusCode::OK, json!({"ok": true, "job": job})),
        None => engine_failure(EngineError::NotFound(id)),
    }
}

pub async fn delete_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    match state.engine.remove_job(&id).await {
        Ok(()) => ok(StatusCode::OK, json!({"ok": true})),
        Err(e) => engine_failure(e),
    }
}

/// `{"action": "pause" | "resume" | "update", ...fields}`
pub async fn patch_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> ApiResponse {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    let action = body.get("action").and_then(Value::as_str).unwrap_or_default();

    let result = match action {
        "pause" => state.engine.pause_job(&id).await,
        "resume" => state.engine.resume_job(&id).await,
        "update" => {
            let patch: JobPatch = match serde_json::from_value(body.clone()) {
                Ok(patch) => patch,
                Err(e) => return fail(StatusCode::BAD_REQUEST, format!("invalid JSON: {e}")),
            };
            state.engine.update_job(&id, patch).await
        }
        other => {
            return fail(
                StatusCode::BAD_REQUEST,
                format!("unknown action \"{other}\": expected pause, resume, or update"),
            );
        }
    };

    match result {
        Ok(job) => ok(
            StatusCode::OK,
            json!({"ok": true, "status": job.status(), "job": job}),
        ),
        Err(e) => engine_failure(e),
    }
}

pub async fn run_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    match state.engine.run_job(&id).await {
        Ok(run_id) => ok(StatusCode::OK, json!({"ok": true, "runId": run_id})),
        Err(e) => engine_failure(e),
    }
}

/// `?limit=N`, default 20, clamped to 100. An unparsable limit uses the default.
pub async fn job_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResponse {
    let limit = params.get("limit").and_then(|l| l.parse::<usize>().ok());
    match state.engine.get_run_history(&id, limit).await {
        Ok(runs) => ok(StatusCode::OK, json!({"ok": true, "runs": runs})),
        Err(e) => engine_failure(e),
    }
}

// ---- Webhook ingress ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

pub async fn hooks_wake(
    State(state): State<Arc<AppState>>,
    body: Result<Json<WakeRequest>, JsonRejection>,
) -> ApiResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_json(rejection),
    };
    if req.text.trim().is_empty() {
        return fail(StatusCode::BAD_REQUEST, "text: required non-empty string");
    }
    if let Some(agent) = &req.agent_id
        && !state.dispatcher.has_agent(agent)
    {
        return fail(
            StatusCode::BAD_REQUEST,
            format!("agentId: \"{agent}\" not found in agents list"),
        );
    }

    let (responder, done) = completion();
    match state
        .dispatcher
        .dispatch_webhook(req.text, req.agent_id, responder)
        .await
    {
        Ok(dispatched) => {
            let key = dispatched.session_key.clone();
            tokio::spawn(async move {
                match done.wait().await {
                    Some(reply) if reply.is_error() => {
                        tracing::warn!("⚠️ Webhook {key} failed: {}", reply.text())
                    }
                    Some(reply) => {
                        tracing::info!("📬 Webhook {key} answered ({} chars)", reply.text().len())
                    }
                    None => tracing::debug!("Webhook {key} dropped before it ran"),
                }
            });
            ok(
                StatusCode::ACCEPTED,
                json!({
                    "ok": true,
                    "sessionKey": dispatched.session_key,
                    "agentId": dispatched.agent_id,
                }),
            )
        }
        Err(e) => fail(StatusCode::TOO_MANY_REQUESTS, e.to_string()),
    }
}

// ---- Introspection ----

pub async fn queue_stats(State(state): State<Arc<AppState>>) -> ApiResponse {
    let stats = state.queue().stats().await;
    ok(StatusCode::OK, json!({"ok": true, "stats": stats}))
}

pub async fn pool_stats(State(state): State<Arc<AppState>>) -> ApiResponse {
    let stats = state.pool.stats().await;
    let workers = state.pool.workers().await;
    ok(
        StatusCode::OK,
        json!({"ok": true, "stats": stats, "workers": workers}),
    )
}
