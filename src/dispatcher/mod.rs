//! Dispatcher (C5) — serializes work from every producer through a
//! single FIFO worker.
//!
//! This is new code rather than a reuse of `Agent::init()`'s
//! concurrent per-message dispatch (that pattern spawns one task per
//! inbound message); the shape here — receive from a channel, process,
//! emit tracing telemetry at each transition, keep going — follows the
//! teacher's janitor/heartbeat background loops instead. Shutdown is
//! coordinated with a [`CancellationToken`], mirroring `main.rs`'s
//! drain-in-flight pattern.

use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::invoker::{self, InvocationRequest, InvocationResult};

/// Where a task originated, carried through to execution telemetry and
/// the eventual persisted execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    Telegram,
    Cron,
    Webhook,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Telegram => "telegram",
            TaskSource::Cron => "cron",
            TaskSource::Webhook => "webhook",
        }
    }
}

/// Which backend should carry out the invocation.
pub enum Backend {
    /// Spawn the agent CLI as a child process (C3).
    Process { binary: String },
    /// Call the agent HTTP API (C4).
    Api {
        client: reqwest::Client,
        base_url: String,
        api_key: String,
    },
}

/// A unit of work submitted to the dispatcher.
pub struct Task {
    pub id: String,
    pub source: TaskSource,
    pub request: InvocationRequest,
    pub backend: Backend,
}

/// Successful or failed outcome of a dispatched task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task_id: String,
    pub result: InvocationResult,
    pub duration_secs: f64,
}

/// Errors returned through the per-task completion channel. Distinct
/// from `InvocationResult`'s own failure fields (`exit_code=-1`,
/// `timed_out`) — this only covers dispatcher-level failures such as
/// the queue being closed.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is shutting down and is no longer accepting work")]
    ShuttingDown,
    #[error("dispatcher worker dropped the completion channel without a reply")]
    WorkerGone,
}

struct QueuedTask {
    task: Task,
    reply: oneshot::Sender<Result<TaskOutcome, DispatchError>>,
}

/// Handle used by producers (C6, C7, C8) to submit work. Cheap to
/// clone; all clones share the same bounded queue and worker.
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::Sender<QueuedTask>,
}

impl DispatcherHandle {
    /// Enqueue `task` and return immediately; await the returned
    /// receiver to learn the outcome once the worker reaches it.
    pub async fn enqueue(
        &self,
        task: Task,
    ) -> Result<oneshot::Receiver<Result<TaskOutcome, DispatchError>>, DispatchError> {
        let (reply, rx) = oneshot::channel();
        info!(task_id = %task.id, source = task.source.as_str(), prompt_preview = %preview(&task.request.prompt), "session_queued");
        self.sender
            .send(QueuedTask { task, reply })
            .await
            .map_err(|_| DispatchError::ShuttingDown)?;
        Ok(rx)
    }
}

fn preview(s: &str) -> String {
    s.chars().take(120).collect()
}

/// Spawn the dispatcher's single worker loop and return a handle plus
/// a join future the caller can await during shutdown.
pub fn spawn(capacity: usize, cancel: CancellationToken) -> (DispatcherHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let join = tokio::spawn(worker_loop(rx, cancel));
    (DispatcherHandle { sender: tx }, join)
}

async fn worker_loop(mut rx: mpsc::Receiver<QueuedTask>, cancel: CancellationToken) {
    info!("startup");
    loop {
        let queued = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("shutdown");
                break;
            }
            item = rx.recv() => item,
        };

        let Some(QueuedTask { task, reply }) = queued else {
            break;
        };

        let outcome = run_task(task, &cancel).await;
        if reply.send(outcome).is_err() {
            warn!("completion receiver dropped before task finished; result discarded");
        }
    }

    // Drain without executing: queued work is dropped, not run, on shutdown.
    while let Ok(QueuedTask { task, reply }) = rx.try_recv() {
        let _ = reply.send(Err(DispatchError::ShuttingDown));
        warn!(task_id = %task.id, "dropped queued task on shutdown");
    }
}

async fn run_task(task: Task, cancel: &CancellationToken) -> Result<TaskOutcome, DispatchError> {
    let Task { id, source, request, backend } = task;
    info!(task_id = %id, source = source.as_str(), prompt_preview = %preview(&request.prompt), "session_start");

    let started = Instant::now();
    let result = match backend {
        Backend::Process { binary } => invoker::process::invoke(&binary, &request).await,
        Backend::Api { client, base_url, api_key } => {
            invoker::api::invoke(&client, &base_url, &api_key, &request, cancel.clone()).await
        }
    };
    let duration_secs = started.elapsed().as_secs_f64();

    if result.timed_out {
        warn!(task_id = %id, duration_secs, "session_timeout");
    } else if result.exit_code != 0 {
        warn!(task_id = %id, duration_secs, exit_code = result.exit_code, "session_failed");
    } else {
        info!(
            task_id = %id,
            duration_secs,
            num_turns = ?result.num_turns,
            exit_code = result.exit_code,
            "session_complete"
        );
    }

    Ok(TaskOutcome {
        task_id: id,
        result,
        duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::OutputFormat;

    fn process_task(id: &str, prompt: &str) -> Task {
        Task {
            id: id.to_string(),
            source: TaskSource::Cron,
            request: InvocationRequest {
                prompt: prompt.to_string(),
                output_format: OutputFormat::Text,
                timeout_secs: 10,
                ..Default::default()
            },
            backend: Backend::Process { binary: "echo".to_string() },
        }
    }

    #[tokio::test]
    async fn tasks_complete_in_fifo_order() {
        let cancel = CancellationToken::new();
        let (handle, _join) = spawn(8, cancel.clone());

        let mut receivers = Vec::new();
        for i in 0..3 {
            let rx = handle.enqueue(process_task(&format!("t{i}"), &format!("prompt-{i}"))).await.unwrap();
            receivers.push(rx);
        }

        let mut completed_order = Vec::new();
        for rx in receivers {
            let outcome = rx.await.unwrap().unwrap();
            completed_order.push(outcome.task_id);
        }
        assert_eq!(completed_order, vec!["t0", "t1", "t2"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn queued_tasks_dropped_on_shutdown() {
        let cancel = CancellationToken::new();
        let (handle, join) = spawn(8, cancel.clone());

        // Queue a long-running task then cancel before it's picked up isn't
        // deterministic to arrange without a stub; instead verify that
        // cancelling promptly stops the worker loop.
        cancel.cancel();
        join.await.unwrap();

        let rx = handle.enqueue(process_task("late", "hi")).await;
        // The worker has exited; the channel send may still succeed since
        // the receiver end was only dropped after loop exit, but any
        // queued item left unprocessed resolves to ShuttingDown rather
        // than hanging forever.
        if let Ok(rx) = rx {
            let _ = rx.await;
        }
    }
}
