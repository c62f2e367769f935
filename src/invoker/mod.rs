//! Agent invoker — process (C3) and API (C4) backends.
//!
//! Both backends produce the same [`InvocationResult`] so the
//! dispatcher (C5) never has to know which one ran a task.

pub mod api;
pub mod process;

use std::collections::HashMap;

/// Output format requested from the process backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    StreamJson,
}

/// A single unit of work handed to either invoker backend.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    pub working_dir: Option<String>,
    pub timeout_secs: u64,
    pub output_format: OutputFormat,
    pub model: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub max_turns: Option<i64>,
    pub session_persistence: bool,
    pub provider_env: HashMap<String, String>,
    pub append_system_prompt: Option<String>,
}

impl Default for InvocationRequest {
    fn default() -> Self {
        InvocationRequest {
            prompt: String::new(),
            working_dir: None,
            timeout_secs: 300,
            output_format: OutputFormat::Text,
            model: None,
            allowed_tools: None,
            max_turns: None,
            session_persistence: true,
            provider_env: HashMap::new(),
            append_system_prompt: None,
        }
    }
}

/// The outcome of a single invocation, from either backend.
#[derive(Debug, Clone, Default)]
pub struct InvocationResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub num_turns: Option<u64>,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
}

/// Extract human-facing response text from a completed invocation.
/// Total: always returns a non-empty string.
pub fn extract_response_text(result: &InvocationResult) -> String {
    if result.timed_out {
        return "Claude Code timed out.".to_string();
    }
    if result.exit_code != 0 {
        let stderr_preview: String = result.stderr.chars().take(500).collect();
        return format!("Claude Code exited with code {}.\n\n{}", result.exit_code, stderr_preview);
    }

    match serde_json::from_str::<serde_json::Value>(&result.stdout) {
        Ok(value) => {
            if let Some(text) = value.get("result").and_then(|v| v.as_str()) {
                return text.to_string();
            }
            if let Some(text) = value.get("text").and_then(|v| v.as_str()) {
                return text.to_string();
            }
            if value.get("subtype").and_then(|v| v.as_str()) == Some("error_max_turns") {
                let turns = value.get("num_turns").and_then(|v| v.as_u64()).unwrap_or(0);
                return format!("Claude Code stopped after reaching the maximum of {turns} turns without a final response.");
            }
            if value.get("type").and_then(|v| v.as_str()) == Some("result") {
                let subtype = value
                    .get("subtype")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                return format!("Claude Code finished without a response ({subtype}).");
            }
            if result.stdout.trim().is_empty() {
                "(empty response)".to_string()
            } else {
                result.stdout.clone()
            }
        }
        Err(_) => {
            if result.stdout.trim().is_empty() {
                "(empty response)".to_string()
            } else {
                result.stdout.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> InvocationResult {
        InvocationResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: false,
            num_turns: None,
            session_id: None,
            cost_usd: None,
        }
    }

    #[test]
    fn extract_text_timeout() {
        let r = InvocationResult { timed_out: true, ..base() };
        assert_eq!(extract_response_text(&r), "Claude Code timed out.");
    }

    #[test]
    fn extract_text_nonzero_exit() {
        let r = InvocationResult {
            exit_code: 1,
            stderr: "boom".into(),
            ..base()
        };
        let text = extract_response_text(&r);
        assert!(text.starts_with("Claude Code exited with code 1."));
        assert!(text.contains("boom"));
    }

    #[test]
    fn extract_text_result_field() {
        let r = InvocationResult {
            stdout: r#"{"type":"result","result":"hi","num_turns":1}"#.into(),
            ..base()
        };
        assert_eq!(extract_response_text(&r), "hi");
    }

    #[test]
    fn extract_text_max_turns_error() {
        let r = InvocationResult {
            stdout: r#"{"type":"result","subtype":"error_max_turns","num_turns":5}"#.into(),
            ..base()
        };
        assert!(extract_response_text(&r).contains('5'));
    }

    #[test]
    fn extract_text_empty_stdout() {
        let r = base();
        assert_eq!(extract_response_text(&r), "(empty response)");
    }

    #[test]
    fn extract_text_raw_non_json_stdout() {
        let r = InvocationResult {
            stdout: "plain output".into(),
            ..base()
        };
        assert_eq!(extract_response_text(&r), "plain output");
    }
}
