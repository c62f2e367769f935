//! Process backend (C3) — spawns the agent CLI as a child process.
//!
//! Grounded in the teacher's subprocess idiom: `tokio::process::Command`
//! with piped stdio and `.kill_on_drop(true)`, wrapped in
//! `tokio::time::timeout`. The one divergence from a blanket
//! `env_clear()` is that only `ANTHROPIC_API_KEY` is stripped — CLI
//! sessions authenticate via OAuth, so the key must not leak into the
//! child's environment; everything else is inherited.

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{InvocationRequest, InvocationResult, OutputFormat};

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Accumulated state threaded through the stream-json fold. Kept as a
/// pure data type so `fold` can be unit tested without a child process.
#[derive(Debug, Clone, Default)]
pub struct StreamFoldState {
    pub session_id: Option<String>,
    pub result_payload: Option<Value>,
    pub num_turns: Option<u64>,
}

/// One step of the stream-json state machine. Pure: given the current
/// state and one parsed event line, returns the next state. Side
/// effects (tracing events) are emitted by the caller, not here.
pub fn fold(mut state: StreamFoldState, event: &Value) -> StreamFoldState {
    if state.session_id.is_none() {
        if let Some(sid) = event.get("session_id").and_then(|v| v.as_str()) {
            if !sid.is_empty() {
                state.session_id = Some(sid.to_string());
            }
        }
    }

    if event.get("type").and_then(|v| v.as_str()) == Some("result") {
        state.num_turns = event.get("num_turns").and_then(|v| v.as_u64());
        state.result_payload = Some(event.clone());
    }

    state
}

/// Log a `tool_use`/`tool_result`/`assistant_text` tracing event for
/// one parsed stream-json line, matching the key-arg extraction order
/// from the wire contract (`file_path`/`pattern`/`command`/`query`/`url`/`description`).
fn emit_event_log(event: &Value) {
    let Some(assistant_content) = event
        .pointer("/message/content")
        .or_else(|| event.pointer("/assistant/message/content"))
        .and_then(|v| v.as_array())
    else {
        if event.get("type").and_then(|v| v.as_str()) == Some("user") {
            if let Some(content) = event.pointer("/message/content").and_then(|v| v.as_array()) {
                for item in content {
                    if item.get("type").and_then(|v| v.as_str()) == Some("tool_result") {
                        let text = item
                            .get("content")
                            .and_then(|c| c.as_str())
                            .unwrap_or_default();
                        debug!(len = text.len(), preview = %text.chars().take(120).collect::<String>(), "tool_result");
                    }
                }
            }
        }
        return;
    };

    for item in assistant_content {
        match item.get("type").and_then(|v| v.as_str()) {
            Some("tool_use") => {
                let key_arg = ["file_path", "pattern", "command", "query", "url", "description"]
                    .iter()
                    .find_map(|key| item.pointer(&format!("/input/{key}")).and_then(|v| v.as_str()));
                debug!(name = ?item.get("name"), arg = ?key_arg, "tool_use");
            }
            Some("text") => {
                let preview: String = item
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .chars()
                    .take(120)
                    .collect();
                debug!(preview = %preview, "assistant_text");
            }
            _ => {}
        }
    }
}

fn build_args(req: &InvocationRequest) -> Vec<String> {
    let mut args = vec!["-p".to_string(), req.prompt.clone()];

    if !req.session_persistence {
        args.push("--no-session-persistence".to_string());
    }
    args.push("--dangerously-skip-permissions".to_string());

    if let Some(tools) = &req.allowed_tools {
        if !tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }
    }
    if let Some(prompt) = &req.append_system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    if let Some(model) = &req.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(max_turns) = req.max_turns {
        args.push("--max-turns".to_string());
        args.push(max_turns.to_string());
    }

    let format_str = match req.output_format {
        OutputFormat::Text => "text",
        OutputFormat::Json => "json",
        OutputFormat::StreamJson => "stream-json",
    };
    args.push("--output-format".to_string());
    args.push(format_str.to_string());
    if req.output_format == OutputFormat::StreamJson {
        args.push("--verbose".to_string());
    }

    args
}

fn resolve_working_dir(requested: Option<&str>) -> String {
    match requested {
        Some(dir) if std::path::Path::new(dir).is_dir() => dir.to_string(),
        Some(dir) => {
            warn!(requested = dir, "working directory does not exist, falling back to current dir");
            ".".to_string()
        }
        None => ".".to_string(),
    }
}

async fn terminate(mut child: Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        tokio::select! {
            _ = child.wait() => return,
            _ = tokio::time::sleep(KILL_GRACE_PERIOD) => {}
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Spawn `binary` as a child process implementing the agent CLI
/// contract and return its result. Never returns an `Err` — spawn
/// failures are folded into the result as `exit_code=-1`.
pub async fn invoke(binary: &str, req: &InvocationRequest) -> InvocationResult {
    let args = build_args(req);
    invoke_with_args(binary, &args, req).await
}

/// Same as [`invoke`] but with an explicit argument vector, bypassing
/// the CLI-flag construction. Exposed for testing the spawn/timeout
/// machinery against stub binaries that don't understand those flags.
async fn invoke_with_args(
    binary: &str,
    args: &[String],
    req: &InvocationRequest,
) -> InvocationResult {
    let working_dir = resolve_working_dir(req.working_dir.as_deref());

    let mut command = Command::new(binary);
    command
        .args(args)
        .current_dir(&working_dir)
        .env_remove("ANTHROPIC_API_KEY")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &req.provider_env {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            return InvocationResult {
                exit_code: -1,
                stderr: format!("failed to spawn agent process: {e}"),
                ..Default::default()
            }
        }
    };

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let run = run_to_completion(&mut child, stdout, stderr, req.output_format);
    match tokio::time::timeout(Duration::from_secs(req.timeout_secs), run).await {
        Ok(mut result) => {
            result.exit_code = child
                .wait()
                .await
                .ok()
                .and_then(|status| status.code())
                .unwrap_or(result.exit_code);
            result
        }
        Err(_) => {
            terminate(child).await;
            InvocationResult {
                exit_code: -1,
                timed_out: true,
                ..Default::default()
            }
        }
    }
}

async fn run_to_completion(
    child: &mut Child,
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    format: OutputFormat,
) -> InvocationResult {
    let stderr_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = String::new();
        use tokio::io::AsyncReadExt;
        let _ = reader.read_to_string(&mut buf).await;
        buf
    });

    let mut result = InvocationResult::default();

    if format == OutputFormat::StreamJson {
        let mut lines = BufReader::new(stdout).lines();
        let mut state = StreamFoldState::default();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            let Ok(event) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            emit_event_log(&event);
            state = fold(state, &event);
        }
        result.session_id = state.session_id;
        result.num_turns = state.num_turns;
        if let Some(payload) = state.result_payload {
            let mut synthesized = serde_json::Map::new();
            for key in ["type", "result", "text", "subtype", "num_turns"] {
                if let Some(v) = payload.get(key) {
                    synthesized.insert(key.to_string(), v.clone());
                }
            }
            result.cost_usd = payload
                .get("total_cost_usd")
                .and_then(|v| v.as_f64());
            result.stdout = Value::Object(synthesized).to_string();
        }
    } else {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        let mut reader = BufReader::new(stdout);
        let _ = reader.read_to_string(&mut buf).await;
        result.stdout = buf;
    }

    result.stderr = stderr_task.await.unwrap_or_default();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fold_captures_first_session_id() {
        let state = StreamFoldState::default();
        let state = fold(state, &json!({"session_id": "abc"}));
        let state = fold(state, &json!({"session_id": "xyz"}));
        assert_eq!(state.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn fold_captures_result_event() {
        let state = StreamFoldState::default();
        let state = fold(state, &json!({"type": "result", "result": "hi", "num_turns": 3}));
        assert_eq!(state.num_turns, Some(3));
        assert!(state.result_payload.is_some());
    }

    #[test]
    fn build_args_includes_output_format_and_verbose_for_stream_json() {
        let req = InvocationRequest {
            prompt: "hi".into(),
            output_format: OutputFormat::StreamJson,
            ..Default::default()
        };
        let args = build_args(&req);
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn build_args_omits_verbose_for_text() {
        let req = InvocationRequest {
            prompt: "hi".into(),
            output_format: OutputFormat::Text,
            ..Default::default()
        };
        let args = build_args(&req);
        assert!(!args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn resolve_working_dir_falls_back_when_missing() {
        assert_eq!(resolve_working_dir(Some("/no/such/dir/at/all")), ".");
    }

    #[tokio::test]
    async fn invoke_spawn_failure_is_reported_not_panicked() {
        let req = InvocationRequest {
            prompt: "hi".into(),
            ..Default::default()
        };
        let result = invoke("/no/such/binary/at/all", &req).await;
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn invoke_text_mode_captures_stdout() {
        let req = InvocationRequest {
            timeout_secs: 10,
            ..Default::default()
        };
        let result = invoke_with_args(
            "sh",
            &["-c".to_string(), "echo ignored".to_string()],
            &req,
        )
        .await;
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("ignored"));
    }

    #[tokio::test]
    async fn invoke_times_out_and_kills_child() {
        let req = InvocationRequest {
            timeout_secs: 1,
            ..Default::default()
        };
        let result = invoke_with_args(
            "sh",
            &["-c".to_string(), "sleep 600".to_string()],
            &req,
        )
        .await;
        assert!(result.timed_out);
        assert_eq!(result.exit_code, -1);
    }
}
