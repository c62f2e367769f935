//! API backend (C4) — invokes the agent via an HTTP streaming endpoint
//! instead of a spawned child process.
//!
//! Grounded in the teacher's `ModelProvider`/`ProviderManager` pattern:
//! a `reqwest` client, retryable-vs-permanent error classification
//! matching `is_permanent_error` (401/403/404/422 short-circuit), and
//! `async-stream`/`futures-core::Stream` for the chunked response. The
//! event shape itself (`result`/`subtype`/`num_turns`/`total_cost_usd`)
//! mirrors C3's stream-json contract so downstream callers in C5/C6
//! don't need to distinguish which backend produced an
//! [`super::InvocationResult`].

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{InvocationRequest, InvocationResult};

/// Classify an HTTP status as a permanent (non-retryable) failure,
/// matching the short-circuit set used by `models::ProviderManager`.
fn is_permanent_status(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 401 | 403 | 404 | 422)
}

#[derive(Debug, Clone, Default)]
struct ApiFoldState {
    num_turns: Option<u64>,
    cost_usd: Option<f64>,
    session_id: Option<String>,
    success: bool,
    text: Option<String>,
    error_text: Option<String>,
}

fn fold(mut state: ApiFoldState, event: &Value) -> ApiFoldState {
    if state.session_id.is_none() {
        if let Some(sid) = event.get("session_id").and_then(|v| v.as_str()) {
            if !sid.is_empty() {
                state.session_id = Some(sid.to_string());
            }
        }
    }

    if event.get("type").and_then(|v| v.as_str()) == Some("result") {
        state.num_turns = event.get("num_turns").and_then(|v| v.as_u64());
        state.cost_usd = event.get("total_cost_usd").and_then(|v| v.as_f64());

        if event.get("subtype").and_then(|v| v.as_str()) == Some("success") {
            state.success = true;
            state.text = event
                .get("result")
                .and_then(|v| v.as_str())
                .map(str::to_string);
        } else {
            state.success = false;
            let subtype = event
                .get("subtype")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown_error");
            let mut text = subtype.to_string();
            if let Some(errors) = event.get("errors").and_then(|v| v.as_array()) {
                let joined: Vec<String> = errors
                    .iter()
                    .filter_map(|e| e.as_str().map(str::to_string))
                    .collect();
                if !joined.is_empty() {
                    text = joined.join("\n");
                }
            }
            state.error_text = Some(text);
        }
    }

    state
}

/// Call the agent API and await the full streamed response, honouring
/// both a hard timeout and an external cancellation signal. Never
/// returns an `Err` — network/parse failures are folded into the
/// result as `exit_code=-1`, matching the process backend's contract.
pub async fn invoke(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    req: &InvocationRequest,
    cancel: CancellationToken,
) -> InvocationResult {
    let body = serde_json::json!({
        "prompt": req.prompt,
        "model": req.model,
        "max_turns": req.max_turns,
        "allowed_tools": req.allowed_tools,
        "stream": true,
    });

    let send = client
        .post(format!("{}/v1/agent/messages", base_url.trim_end_matches('/')))
        .header("x-api-key", api_key)
        .json(&body)
        .send();

    let response = tokio::select! {
        res = tokio::time::timeout(Duration::from_secs(req.timeout_secs), send) => {
            match res {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    return InvocationResult {
                        exit_code: -1,
                        stderr: format!("agent API request failed: {e}"),
                        ..Default::default()
                    };
                }
                Err(_) => {
                    return InvocationResult {
                        exit_code: -1,
                        timed_out: true,
                        ..Default::default()
                    };
                }
            }
        }
        _ = cancel.cancelled() => {
            return InvocationResult {
                exit_code: -1,
                stderr: "agent API call cancelled".to_string(),
                ..Default::default()
            };
        }
    };

    let status = response.status();
    if !status.is_success() {
        let permanent = is_permanent_status(status);
        let text = response.text().await.unwrap_or_default();
        warn!(status = %status, permanent, "agent API returned error status");
        return InvocationResult {
            exit_code: -1,
            stderr: format!("agent API returned {status}: {text}"),
            ..Default::default()
        };
    }

    let mut stream = response.bytes_stream();
    let mut state = ApiFoldState::default();
    let mut buffer = String::new();

    let iterate = async {
        while let Some(chunk) = stream.next().await {
            let Ok(bytes) = chunk else { break };
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                let line = line.strip_prefix("data:").map(str::trim).unwrap_or(&line);
                if let Ok(event) = serde_json::from_str::<Value>(line) {
                    state = fold(std::mem::take(&mut state), &event);
                }
            }
        }
    };

    tokio::select! {
        _ = tokio::time::timeout(Duration::from_secs(req.timeout_secs), iterate) => {}
        _ = cancel.cancelled() => {
            return InvocationResult {
                exit_code: -1,
                stderr: "agent API call cancelled".to_string(),
                ..Default::default()
            };
        }
    }

    if state.success {
        InvocationResult {
            exit_code: 0,
            stdout: state.text.unwrap_or_default(),
            num_turns: state.num_turns,
            session_id: state.session_id,
            cost_usd: state.cost_usd,
            ..Default::default()
        }
    } else {
        InvocationResult {
            exit_code: -1,
            stderr: state.error_text.unwrap_or_else(|| "agent API stream ended without a result".to_string()),
            num_turns: state.num_turns,
            session_id: state.session_id,
            cost_usd: state.cost_usd,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fold_captures_success_result() {
        let state = ApiFoldState::default();
        let state = fold(
            state,
            &json!({"type": "result", "subtype": "success", "result": "hi", "num_turns": 2, "total_cost_usd": 0.01}),
        );
        assert!(state.success);
        assert_eq!(state.text.as_deref(), Some("hi"));
        assert_eq!(state.num_turns, Some(2));
        assert_eq!(state.cost_usd, Some(0.01));
    }

    #[test]
    fn fold_captures_error_subtype_and_joins_errors() {
        let state = ApiFoldState::default();
        let state = fold(
            state,
            &json!({"type": "result", "subtype": "invalid_request", "errors": ["bad prompt", "missing model"]}),
        );
        assert!(!state.success);
        assert_eq!(state.error_text.as_deref(), Some("bad prompt\nmissing model"));
    }

    #[test]
    fn is_permanent_status_matches_documented_codes() {
        for code in [401, 403, 404, 422] {
            assert!(is_permanent_status(reqwest::StatusCode::from_u16(code).unwrap()));
        }
        assert!(!is_permanent_status(reqwest::StatusCode::from_u16(500).unwrap()));
    }

    #[tokio::test]
    async fn invoke_against_unreachable_host_reports_failure_not_panic() {
        let client = reqwest::Client::new();
        let req = InvocationRequest {
            prompt: "hi".into(),
            timeout_secs: 2,
            ..Default::default()
        };
        let result = invoke(
            &client,
            "http://127.0.0.1:1",
            "test-key",
            &req,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn invoke_respects_pre_cancelled_token() {
        let client = reqwest::Client::new();
        let req = InvocationRequest {
            prompt: "hi".into(),
            timeout_secs: 5,
            ..Default::default()
        };
        let token = CancellationToken::new();
        token.cancel();
        let result = invoke(&client, "http://127.0.0.1:1", "test-key", &req, token).await;
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("cancelled"));
    }
}
