//! Channel-agnostic slash command registry and dispatch.
//!
//! Provides a [`Registry`] that maps command names to async [`Handler`]s,
//! plus [`register_builtin_commands`] which wires up the chat producer's
//! two built-ins: `/clear` and `/model`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::store::Store;

// ── Types ────────────────────────────────────────────────────

/// Metadata describing a registered slash command.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub description: String,
    pub usage: String,
}

/// Parsed arguments supplied to a command handler.
#[derive(Debug, Clone)]
pub struct CommandArgs {
    /// Remaining text after the command name (trimmed).
    pub raw: String,
    /// Whitespace-split tokens from `raw`.
    pub args: Vec<String>,
}

/// Execution context provided to every handler invocation.
#[derive(Clone)]
pub struct Context {
    /// Chat/conversation identifier the command arrived on (C1's
    /// `chat_id`, shared with `Store::save_message`/`get_sticky_model`).
    pub chat_id: i64,
    /// Channel the command originated from (e.g. `"discord"`).
    pub channel: String,
    pub store: Arc<Store>,
    /// Configured global default model, reported when no sticky
    /// override is set.
    pub global_model: String,
}

/// Possible responses from a slash command handler.
#[derive(Debug, Clone)]
pub enum SlashResponse {
    /// Plain text reply to display to the user.
    Text(String),
    /// `/model <alias> <prompt>` — a one-shot override: the caller
    /// must enqueue `prompt` against `model` without touching the
    /// chat's sticky override.
    OneShotInvoke { model: String, prompt: String },
}

/// Errors during slash command dispatch or execution.
#[derive(Debug, Error)]
pub enum SlashError {
    #[error("unknown command: /{0}")]
    UnknownCommand(String),
    #[error("{0}")]
    Handler(String),
}

// ── Handler type alias ───────────────────────────────────────

/// A slash command handler: receives owned [`Context`] + [`CommandArgs`],
/// returns a boxed future producing a [`SlashResponse`] or [`SlashError`].
pub type Handler = Arc<
    dyn Fn(
            Context,
            CommandArgs,
        ) -> Pin<Box<dyn Future<Output = Result<SlashResponse, SlashError>> + Send>>
        + Send
        + Sync,
>;

// ── Registry ─────────────────────────────────────────────────

/// Thread-safe registry mapping command names to metadata + handlers.
pub struct Registry {
    commands: RwLock<HashMap<String, (Command, Handler)>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
        }
    }

    /// Register a command and its handler.
    pub fn register(&self, cmd: Command, handler: Handler) {
        let name = cmd.name.clone();
        let mut map = self.commands.write().expect("registry lock poisoned");
        map.insert(name, (cmd, handler));
    }

    /// Dispatch raw user input to the matching command handler.
    ///
    /// `raw` is the full slash-command string (e.g. `"/model opus"`).
    pub async fn dispatch(&self, raw: &str, ctx: &Context) -> Result<SlashResponse, SlashError> {
        let trimmed = raw.trim();
        let without_slash = trimmed.strip_prefix('/').unwrap_or(trimmed);
        let name = without_slash.split_whitespace().next().unwrap_or("");

        if name.is_empty() {
            return Err(SlashError::UnknownCommand(String::new()));
        }

        let args_str = without_slash.strip_prefix(name).unwrap_or("").trim();

        let cmd_args = CommandArgs {
            raw: args_str.to_string(),
            args: args_str.split_whitespace().map(String::from).collect(),
        };

        let handler = {
            let map = self.commands.read().expect("registry lock poisoned");
            let (_, handler) = map
                .get(name)
                .ok_or_else(|| SlashError::UnknownCommand(name.to_string()))?;
            Arc::clone(handler)
        };

        handler(ctx.clone(), cmd_args).await
    }

    /// Return metadata for all registered commands, sorted by name.
    pub fn list(&self) -> Vec<Command> {
        let map = self.commands.read().expect("registry lock poisoned");
        let mut cmds: Vec<Command> = map.values().map(|(cmd, _)| cmd.clone()).collect();
        cmds.sort_by(|a, b| a.name.cmp(&b.name));
        cmds
    }
}

// ── Built-in command registration ────────────────────────────

fn cmd(name: &str, description: &str, usage: &str) -> Command {
    Command {
        name: name.to_string(),
        description: description.to_string(),
        usage: usage.to_string(),
    }
}

/// Register `/clear` and `/model` into the given registry.
pub fn register_builtin_commands(registry: &Registry) {
    registry.register(
        cmd("clear", "Clear this chat's conversation history", "/clear"),
        Arc::new(|ctx, _args| {
            Box::pin(async move {
                ctx.store
                    .clear_conversation(ctx.chat_id)
                    .map_err(|e| SlashError::Handler(format!("clear_conversation failed: {e}")))?;
                debug!(chat_id = ctx.chat_id, "conversation cleared via /clear");
                Ok(SlashResponse::Text("conversation cleared".to_string()))
            })
        }),
    );

    registry.register(
        cmd(
            "model",
            "Show or change this chat's model override",
            "/model [alias|default|reset] [prompt...]",
        ),
        Arc::new(|ctx, args| {
            Box::pin(async move {
                let Some(first) = args.args.first() else {
                    let sticky = ctx
                        .store
                        .get_sticky_model(ctx.chat_id)
                        .map_err(|e| SlashError::Handler(format!("get_sticky_model failed: {e}")))?;
                    return Ok(SlashResponse::Text(match sticky {
                        Some(m) => format!("current model: {m} (sticky override)"),
                        None => format!("current model: {} (global default)", ctx.global_model),
                    }));
                };

                if matches!(first.as_str(), "default" | "reset") {
                    ctx.store
                        .set_sticky_model(ctx.chat_id, None)
                        .map_err(|e| SlashError::Handler(format!("set_sticky_model failed: {e}")))?;
                    return Ok(SlashResponse::Text(format!(
                        "sticky override cleared, using global default: {}",
                        ctx.global_model
                    )));
                }

                let trailing = args.raw.splitn(2, char::is_whitespace).nth(1).map(str::trim);
                match trailing.filter(|p| !p.is_empty()) {
                    Some(prompt) => Ok(SlashResponse::OneShotInvoke {
                        model: first.clone(),
                        prompt: prompt.to_string(),
                    }),
                    None => {
                        ctx.store
                            .set_sticky_model(ctx.chat_id, Some(first))
                            .map_err(|e| SlashError::Handler(format!("set_sticky_model failed: {e}")))?;
                        Ok(SlashResponse::Text(format!("sticky model set to: {first}")))
                    }
                }
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> Context {
        Context {
            chat_id: 1,
            channel: "discord".to_string(),
            store: Arc::new(Store::open_in_memory().unwrap()),
            global_model: "sonnet".to_string(),
        }
    }

    #[tokio::test]
    async fn clear_reports_success() {
        let registry = Registry::new();
        register_builtin_commands(&registry);
        let ctx = test_ctx();
        ctx.store.save_message(1, crate::store::Role::User, "hi").unwrap();
        let resp = registry.dispatch("/clear", &ctx).await.unwrap();
        assert!(matches!(resp, SlashResponse::Text(t) if t.contains("cleared")));
        assert!(ctx.store.get_recent_context(1, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_no_args_reports_global_default() {
        let registry = Registry::new();
        register_builtin_commands(&registry);
        let ctx = test_ctx();
        let resp = registry.dispatch("/model", &ctx).await.unwrap();
        assert!(matches!(resp, SlashResponse::Text(t) if t.contains("sonnet")));
    }

    #[tokio::test]
    async fn model_single_token_sets_sticky() {
        let registry = Registry::new();
        register_builtin_commands(&registry);
        let ctx = test_ctx();
        registry.dispatch("/model opus", &ctx).await.unwrap();
        assert_eq!(ctx.store.get_sticky_model(1).unwrap().as_deref(), Some("opus"));
    }

    #[tokio::test]
    async fn model_reset_clears_sticky() {
        let registry = Registry::new();
        register_builtin_commands(&registry);
        let ctx = test_ctx();
        ctx.store.set_sticky_model(1, Some("opus")).unwrap();
        let resp = registry.dispatch("/model reset", &ctx).await.unwrap();
        assert!(matches!(resp, SlashResponse::Text(t) if t.contains("global default")));
        assert!(ctx.store.get_sticky_model(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn model_with_trailing_prompt_is_one_shot() {
        let registry = Registry::new();
        register_builtin_commands(&registry);
        let ctx = test_ctx();
        let resp = registry.dispatch("/model haiku summarize this", &ctx).await.unwrap();
        match resp {
            SlashResponse::OneShotInvoke { model, prompt } => {
                assert_eq!(model, "haiku");
                assert_eq!(prompt, "summarize this");
            }
            _ => panic!("expected OneShotInvoke"),
        }
        // sticky must remain untouched by a one-shot override
        assert!(ctx.store.get_sticky_model(1).unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_command_errors() {
        let registry = Registry::new();
        register_builtin_commands(&registry);
        let ctx = test_ctx();
        let err = registry.dispatch("/nope", &ctx).await.unwrap_err();
        assert!(matches!(err, SlashError::UnknownCommand(c) if c == "nope"));
    }
}
