//! Scheduler (C6) — cron-driven job execution.
//!
//! Directly modeled on the teacher's `SchedulerHandle`/`register_job`/
//! `remove_job` idiom: `tokio_cron_scheduler::JobScheduler` plus
//! `cron`/`chrono_tz::Tz` for parsing under a per-job IANA timezone.
//! Registered jobs are owned by the `JobScheduler`'s internal task set,
//! not by a handle the caller must hold alive — satisfying the "timer
//! runs unrooted" requirement without extra plumbing.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::config::{ApiBackendConfig, Config};
use crate::dispatcher::{Backend, DispatcherHandle, Task, TaskSource};
use crate::history;
use crate::invoker::{self, InvocationRequest, OutputFormat};
use crate::store::{CronJob, ExecutionEntry, Store};

const CRON_ALLOWED_TOOLS: &[&str] = &["Read", "Glob", "Grep", "WebSearch", "WebFetch"];

/// A resolved `{model, provider}` pair, per §4.6's model-resolution rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub model: String,
    pub provider: String,
}

fn canonical_alias(alias: &str) -> Option<&'static str> {
    match alias.to_ascii_lowercase().as_str() {
        "opus" => Some("claude-opus-latest"),
        "sonnet" => Some("claude-sonnet-latest"),
        "haiku" => Some("claude-haiku-latest"),
        _ => None,
    }
}

/// Resolve a raw model string (from a job, chat sticky override, or the
/// global default) to a concrete model + provider pair. Pure function —
/// directly testable per scenario S6.
pub fn resolve_model(raw: Option<&str>) -> Option<ResolvedModel> {
    let raw = raw?;
    if let Some(rest) = raw
        .get(..7)
        .filter(|p| p.eq_ignore_ascii_case("ollama:"))
    {
        let _ = rest;
        let name = &raw[7..];
        return Some(ResolvedModel {
            model: name.to_string(),
            provider: "ollama".to_string(),
        });
    }
    if let Some(canonical) = canonical_alias(raw) {
        return Some(ResolvedModel {
            model: canonical.to_string(),
            provider: "claude".to_string(),
        });
    }
    Some(ResolvedModel {
        model: raw.to_string(),
        provider: "claude".to_string(),
    })
}

/// Precedence chain: job override → mode-specific default → global.
fn resolve_job_model(job: &CronJob, api_default: Option<&str>, global_model: &str) -> Option<ResolvedModel> {
    let raw = job
        .model
        .as_deref()
        .or_else(|| {
            if job.execution_mode == "api" {
                api_default
            } else {
                None
            }
        })
        .or(Some(global_model));
    resolve_model(raw)
}

/// Shared context every scheduled job's closure captures.
struct SchedulerContext {
    store: Arc<Store>,
    dispatcher: DispatcherHandle,
    vault_path: String,
    primary_channel: Option<String>,
    global_model: String,
    api: Option<ApiBackendConfig>,
    api_key: Option<String>,
    http_client: reqwest::Client,
    ollama_base_url: Option<String>,
}

/// Owns the live cron scheduler and the map from job name to its
/// registered timer uuid. Jobs themselves live in the store; this
/// handle only tracks which ones currently have an active timer.
pub struct SchedulerHandle {
    sched: JobScheduler,
    job_uuids: Arc<Mutex<HashMap<String, uuid::Uuid>>>,
    ctx: Arc<SchedulerContext>,
}

impl SchedulerHandle {
    pub async fn new(
        store: Arc<Store>,
        dispatcher: DispatcherHandle,
        config: &Config,
    ) -> anyhow::Result<SchedulerHandle> {
        let sched = JobScheduler::new()
            .await
            .context("failed to create cron scheduler")?;

        let api_key = match &config.api {
            Some(api) => match &api.api_key {
                Some(secret) => Some(
                    secret
                        .resolve(None)
                        .context("resolving api.api_key secret")?,
                ),
                None => None,
            },
            None => None,
        };

        let ctx = Arc::new(SchedulerContext {
            store,
            dispatcher,
            vault_path: config.vault_path.clone(),
            primary_channel: config.channels.primary_channel.clone(),
            global_model: config.global_model.clone(),
            api: config.api.clone(),
            api_key,
            http_client: reqwest::Client::new(),
            ollama_base_url: config.ollama.as_ref().map(|o| o.base_url.clone()),
        });

        sched
            .start()
            .await
            .context("failed to start cron scheduler")?;

        Ok(SchedulerHandle {
            sched,
            job_uuids: Arc::new(Mutex::new(HashMap::new())),
            ctx,
        })
    }

    /// Load every job from the store and register the enabled ones.
    pub async fn start(&self) -> anyhow::Result<()> {
        let jobs = self.ctx.store.list_jobs().context("listing jobs on scheduler start")?;
        for job in jobs {
            if job.enabled {
                self.add_job(&job).await;
            }
        }
        Ok(())
    }

    /// Register (or re-register) a timer for `job`. Idempotent:
    /// always removes any existing timer for the name first. No-ops
    /// (after removal) if the job is disabled or its schedule fails
    /// to parse — logged, never propagated as an error.
    pub async fn add_job(&self, job: &CronJob) {
        self.remove_job(&job.name).await;

        if !job.enabled {
            return;
        }

        let tz: Tz = match job.timezone.parse() {
            Ok(tz) => tz,
            Err(_) => {
                error!(job = %job.name, timezone = %job.timezone, "unparseable job timezone, skipping registration");
                return;
            }
        };

        let ctx = self.ctx.clone();
        let job_name = job.name.clone();
        let schedule_str = job.schedule.clone();

        let cron_job = match Job::new_async_tz(schedule_str.as_str(), tz, move |_uuid, _lock| {
            let ctx = ctx.clone();
            let job_name = job_name.clone();
            Box::pin(async move {
                info!(job = %job_name, "cron_triggered");
                let fresh = match ctx.store.get_job(&job_name) {
                    Ok(Some(j)) => j,
                    Ok(None) => {
                        warn!(job = %job_name, "cron fired for a job that no longer exists");
                        return;
                    }
                    Err(e) => {
                        error!(job = %job_name, error = %e, "failed to load job row on fire");
                        return;
                    }
                };
                execute_job(&ctx, &fresh).await;
            })
        }) {
            Ok(j) => j,
            Err(e) => {
                error!(job = %job.name, schedule = %job.schedule, error = %e, "failed to build cron job");
                return;
            }
        };

        match self.sched.add(cron_job).await {
            Ok(uuid) => {
                self.job_uuids.lock().await.insert(job.name.clone(), uuid);
                info!(job = %job.name, schedule = %job.schedule, "cron_scheduled");
            }
            Err(e) => {
                error!(job = %job.name, error = %e, "failed to register cron job with scheduler");
            }
        }
    }

    /// Stop and drop the timer for `name`, if one exists.
    pub async fn remove_job(&self, name: &str) {
        let uuid = self.job_uuids.lock().await.remove(name);
        if let Some(uuid) = uuid {
            if let Err(e) = self.sched.remove(&uuid).await {
                warn!(job = name, error = %e, "failed to remove cron timer");
            }
        }
    }

    /// Status snapshot: job names that currently have a registered
    /// timer (invariant #3 — disabled jobs have no entry).
    pub async fn status(&self) -> Vec<String> {
        self.job_uuids.lock().await.keys().cloned().collect()
    }

    /// Run `name` immediately, bypassing the scheduler's own timer.
    /// Returns `false` if no such job exists.
    pub async fn trigger_job(&self, name: &str) -> anyhow::Result<bool> {
        let fresh = self.ctx.store.get_job(name).context("loading job for manual trigger")?;
        let Some(fresh) = fresh else {
            return Ok(false);
        };
        execute_job(&self.ctx, &fresh).await;
        Ok(true)
    }

    /// Stop the cron scheduler entirely (service shutdown).
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.sched.shutdown().await.context("shutting down cron scheduler")
    }
}

fn enriched_prompt(job: &CronJob, vault_path: &str) -> String {
    let history_block = history::read_context(std::path::Path::new(vault_path), &job.name);
    format!("{}{}", job.prompt, history_block)
}

async fn execute_job(ctx: &SchedulerContext, job: &CronJob) {
    let started_at = chrono::Utc::now().to_rfc3339();
    let prompt = enriched_prompt(job, &ctx.vault_path);

    let execution_mode = if matches!(job.execution_mode.as_str(), "cli" | "api") {
        job.execution_mode.as_str()
    } else {
        warn!(job = %job.name, mode = %job.execution_mode, "unknown execution_mode, defaulting to cli");
        "cli"
    };

    let (response_text, exit_code, timed_out, cost_usd, success) = if execution_mode == "api" {
        run_api(ctx, job, &prompt).await
    } else {
        run_cli(ctx, job, &prompt).await
    };

    let finished_at = chrono::Utc::now().to_rfc3339();

    let entry = ExecutionEntry {
        job_name: job.name.clone(),
        started_at,
        finished_at: Some(finished_at),
        exit_code: Some(exit_code as i64),
        timed_out,
        output_destination: Some(job.output.clone()),
        response_preview: Some(response_text.chars().take(500).collect()),
        error: if success { None } else { Some(response_text.clone()) },
        cost_usd,
    };
    if let Err(e) = ctx.store.log_execution(&entry) {
        error!(job = %job.name, error = %e, "failed to persist execution record");
    }

    if success {
        if let Err(e) = history::append_entry(std::path::Path::new(&ctx.vault_path), &job.name, &response_text) {
            warn!(job = %job.name, error = %e, "failed to append history entry");
        }
    }

    route_output(ctx, job, &response_text, success).await;
}

async fn run_cli(ctx: &SchedulerContext, job: &CronJob, prompt: &str) -> (String, i32, bool, Option<f64>, bool) {
    let resolved = resolve_job_model(job, None, &ctx.global_model);

    let mut provider_env = HashMap::new();
    if let Some(ResolvedModel { provider, .. }) = &resolved {
        if provider == "ollama" {
            if let Some(base_url) = &ctx.ollama_base_url {
                provider_env.insert("OLLAMA_BASE_URL".to_string(), base_url.clone());
            }
        }
    }

    let request = InvocationRequest {
        prompt: prompt.to_string(),
        working_dir: Some(ctx.vault_path.clone()),
        session_persistence: false,
        allowed_tools: Some(CRON_ALLOWED_TOOLS.iter().map(|s| s.to_string()).collect()),
        output_format: OutputFormat::StreamJson,
        max_turns: job.max_turns,
        model: resolved.map(|r| r.model),
        provider_env,
        ..Default::default()
    };

    let task = Task {
        id: format!("cron:{}:{}", job.name, uuid::Uuid::new_v4()),
        source: TaskSource::Cron,
        request,
        backend: Backend::Process { binary: "claude".to_string() },
    };

    match ctx.dispatcher.enqueue(task).await {
        Ok(rx) => match rx.await {
            Ok(Ok(outcome)) => {
                let result = outcome.result;
                let text = invoker::extract_response_text(&result);
                (text, result.exit_code, result.timed_out, result.cost_usd, result.exit_code == 0 && !result.timed_out)
            }
            Ok(Err(e)) => (format!("dispatcher error: {e}"), -1, false, None, false),
            Err(_) => ("dispatcher worker dropped the task".to_string(), -1, false, None, false),
        },
        Err(e) => (format!("failed to enqueue cron task: {e}"), -1, false, None, false),
    }
}

async fn run_api(ctx: &SchedulerContext, job: &CronJob, prompt: &str) -> (String, i32, bool, Option<f64>, bool) {
    let api_default = ctx.api.as_ref().and_then(|a| a.default_model.as_deref());
    let resolved = resolve_job_model(job, api_default, &ctx.global_model);
    let base_url = ctx
        .api
        .as_ref()
        .and_then(|a| a.base_url.as_deref())
        .unwrap_or_default();

    let request = InvocationRequest {
        prompt: prompt.to_string(),
        max_turns: job.max_turns,
        model: resolved.map(|r| r.model),
        ..Default::default()
    };

    let result = invoker::api::invoke(
        &ctx.http_client,
        base_url,
        ctx.api_key.as_deref().unwrap_or_default(),
        &request,
        tokio_util::sync::CancellationToken::new(),
    )
    .await;

    let text = invoker::extract_response_text(&result);
    let success = result.exit_code == 0 && !result.timed_out;
    (text, result.exit_code, result.timed_out, result.cost_usd, success)
}

async fn route_output(ctx: &SchedulerContext, job: &CronJob, response_text: &str, success: bool) {
    match job.output.as_str() {
        "telegram" => {
            if let Some(channel) = &ctx.primary_channel {
                let message = format!("[{}]\n\n{}", job.name, response_text);
                if let Err(e) = crate::comm::send_reply(channel, &message).await {
                    error!(job = %job.name, error = %e, "failed to deliver cron output to chat sink");
                } else if success {
                    let chat_id: i64 = channel.parse().unwrap_or_default();
                    if chat_id != 0 {
                        let _ = ctx.store.save_message(chat_id, crate::store::Role::Assistant, response_text);
                    }
                }
            } else {
                warn!(job = %job.name, "output=telegram but no chat sink configured, falling back to log");
                info!(job = %job.name, output = %response_text, "cron_result");
            }
        }
        "log" => {
            info!(job = %job.name, output = %response_text, "cron_result");
        }
        "silent" => {}
        "webhook" => {
            debug!(job = %job.name, "webhook output destination is reserved, treating as log");
            info!(job = %job.name, output = %response_text, "cron_result");
        }
        other => {
            warn!(job = %job.name, output = other, "unknown output destination, treating as log");
            info!(job = %job.name, output = %response_text, "cron_result");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_model_alias_case_insensitive() {
        let resolved = resolve_model(Some("SONNET")).unwrap();
        assert_eq!(resolved.provider, "claude");
        assert_eq!(resolved.model, "claude-sonnet-latest");
    }

    #[test]
    fn resolve_model_ollama_prefix_strips_and_routes() {
        let resolved = resolve_model(Some("ollama:llama3")).unwrap();
        assert_eq!(resolved.provider, "ollama");
        assert_eq!(resolved.model, "llama3");
    }

    #[test]
    fn resolve_model_ollama_prefix_case_insensitive() {
        let resolved = resolve_model(Some("OLLAMA:llama3")).unwrap();
        assert_eq!(resolved.provider, "ollama");
        assert_eq!(resolved.model, "llama3");
    }

    #[test]
    fn resolve_model_unknown_passes_through_as_claude() {
        let resolved = resolve_model(Some("unknown-thing")).unwrap();
        assert_eq!(resolved.provider, "claude");
        assert_eq!(resolved.model, "unknown-thing");
    }

    #[test]
    fn resolve_model_none_is_none() {
        assert!(resolve_model(None).is_none());
    }
}
