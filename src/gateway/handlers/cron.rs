//! C7 — cron CRUD and manual-trigger surface.
//!
//! Thin validation layer over [`crate::store::Store`] (C1) and
//! [`crate::scheduler::SchedulerHandle`] (C6): every mutating handler
//! writes through the store first, then asks the scheduler to
//! re-register (or remove) the job's timer so the two never drift.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::super::AppState;
use crate::store::{CronJob, CronJobUpdate, ExecutionRecord, NewCronJob};

fn job_to_json(job: &CronJob) -> Value {
    json!({
        "name": job.name,
        "schedule": job.schedule,
        "prompt": job.prompt,
        "output": job.output,
        "enabled": job.enabled,
        "timezone": job.timezone,
        "max_turns": job.max_turns,
        "model": job.model,
        "execution_mode": job.execution_mode,
        "allowed_tools": job.allowed_tools,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
    })
}

fn execution_to_json(run: &ExecutionRecord) -> Value {
    json!({
        "id": run.id,
        "job_name": run.job_name,
        "started_at": run.started_at,
        "finished_at": run.finished_at,
        "exit_code": run.exit_code,
        "timed_out": run.timed_out,
        "output_destination": run.output_destination,
        "response_preview": run.response_preview,
        "error": run.error,
        "cost_usd": run.cost_usd,
    })
}

fn err(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    err_with_details(status, message, Value::Null)
}

fn err_with_details(
    status: StatusCode,
    message: impl Into<String>,
    details: impl Into<Value>,
) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"error": message.into(), "details": details.into()})),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateCronJobRequest {
    pub name: String,
    pub schedule: String,
    pub prompt: String,
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub max_turns: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: String,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
}

fn default_output() -> String {
    "telegram".to_string()
}
fn default_true() -> bool {
    true
}
fn default_timezone() -> String {
    "America/Chicago".to_string()
}
fn default_execution_mode() -> String {
    "cli".to_string()
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct UpdateCronJobRequest {
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub max_turns: Option<Option<i64>>,
    #[serde(default)]
    pub model: Option<Option<String>>,
    #[serde(default)]
    pub execution_mode: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Option<Vec<String>>>,
}

/// Reject empty name/schedule/prompt; anything else is the cron
/// engine's own problem to surface at registration time.
fn validate_create(req: &CreateCronJobRequest) -> Result<(), (StatusCode, Json<Value>)> {
    if req.name.trim().is_empty() {
        return Err(err_with_details(StatusCode::BAD_REQUEST, "name must not be empty", "name"));
    }
    if req.schedule.trim().is_empty() {
        return Err(err_with_details(StatusCode::BAD_REQUEST, "schedule must not be empty", "schedule"));
    }
    if req.prompt.trim().is_empty() {
        return Err(err_with_details(StatusCode::BAD_REQUEST, "prompt must not be empty", "prompt"));
    }
    if !matches!(req.execution_mode.as_str(), "cli" | "api") {
        return Err(err_with_details(
            StatusCode::BAD_REQUEST,
            "execution_mode must be 'cli' or 'api'",
            "execution_mode",
        ));
    }
    Ok(())
}

pub(crate) async fn api_cron_list(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_jobs() {
        Ok(jobs) => (
            StatusCode::OK,
            Json(json!({"jobs": jobs.iter().map(job_to_json).collect::<Vec<_>>()})),
        ),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub(crate) async fn api_cron_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.get_job(&name) {
        Ok(Some(job)) => (StatusCode::OK, Json(json!({"job": job_to_json(&job)}))),
        Ok(None) => err(StatusCode::NOT_FOUND, format!("no cron job named '{name}'")),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub(crate) async fn api_cron_create(
    State(state): State<AppState>,
    Json(req): Json<CreateCronJobRequest>,
) -> impl IntoResponse {
    if let Err(resp) = validate_create(&req) {
        return resp;
    }

    let new_job = NewCronJob {
        name: req.name,
        schedule: req.schedule,
        prompt: req.prompt,
        output: req.output,
        enabled: req.enabled,
        timezone: req.timezone,
        max_turns: req.max_turns,
        model: req.model,
        execution_mode: req.execution_mode,
        allowed_tools: req.allowed_tools,
    };

    match state.store.create_job(&new_job) {
        Ok(job) => {
            state.scheduler.add_job(&job).await;
            (StatusCode::CREATED, Json(job_to_json(&job)))
        }
        Err(e) => err(StatusCode::CONFLICT, e.to_string()),
    }
}

pub(crate) async fn api_cron_update(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<UpdateCronJobRequest>,
) -> impl IntoResponse {
    if let Some(ref mode) = req.execution_mode {
        if !matches!(mode.as_str(), "cli" | "api") {
            return err_with_details(
                StatusCode::BAD_REQUEST,
                "execution_mode must be 'cli' or 'api'",
                "execution_mode",
            );
        }
    }

    let update = CronJobUpdate {
        schedule: req.schedule,
        prompt: req.prompt,
        output: req.output,
        enabled: req.enabled,
        timezone: req.timezone,
        max_turns: req.max_turns,
        model: req.model,
        execution_mode: req.execution_mode,
        allowed_tools: req.allowed_tools,
    };

    match state.store.update_job(&name, &update) {
        Ok(Some(job)) => {
            state.scheduler.remove_job(&name).await;
            state.scheduler.add_job(&job).await;
            (StatusCode::OK, Json(job_to_json(&job)))
        }
        Ok(None) => err(StatusCode::NOT_FOUND, format!("no cron job named '{name}'")),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub(crate) async fn api_cron_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_job(&name) {
        Ok(true) => {
            state.scheduler.remove_job(&name).await;
            (StatusCode::OK, Json(json!({"success": true})))
        }
        Ok(false) => err(StatusCode::NOT_FOUND, format!("no cron job named '{name}'")),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub(crate) async fn api_cron_trigger(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.scheduler.trigger_job(&name).await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({"success": true, "message": format!("triggered '{name}'")})),
        ),
        Ok(false) => err(StatusCode::NOT_FOUND, format!("no cron job named '{name}'")),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

pub(crate) async fn api_cron_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> impl IntoResponse {
    match state.store.get_recent_executions(Some(&name), q.limit) {
        Ok(runs) => (
            StatusCode::OK,
            Json(json!({"executions": runs.iter().map(execution_to_json).collect::<Vec<_>>()})),
        ),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_create_rejects_empty_fields() {
        let req = CreateCronJobRequest {
            name: String::new(),
            schedule: "* * * * *".into(),
            prompt: "hi".into(),
            output: default_output(),
            enabled: true,
            timezone: default_timezone(),
            max_turns: None,
            model: None,
            execution_mode: default_execution_mode(),
            allowed_tools: None,
        };
        assert!(validate_create(&req).is_err());
    }

    #[test]
    fn validate_create_rejects_bad_execution_mode() {
        let req = CreateCronJobRequest {
            name: "x".into(),
            schedule: "* * * * *".into(),
            prompt: "hi".into(),
            output: default_output(),
            enabled: true,
            timezone: default_timezone(),
            max_turns: None,
            model: None,
            execution_mode: "bogus".into(),
            allowed_tools: None,
        };
        assert!(validate_create(&req).is_err());
    }

    #[test]
    fn validate_create_accepts_minimal_job() {
        let req = CreateCronJobRequest {
            name: "daily".into(),
            schedule: "0 9 * * *".into(),
            prompt: "good morning".into(),
            output: default_output(),
            enabled: true,
            timezone: default_timezone(),
            max_turns: None,
            model: None,
            execution_mode: default_execution_mode(),
            allowed_tools: None,
        };
        assert!(validate_create(&req).is_ok());
    }
}
