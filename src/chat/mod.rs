//! Chat producer adapter (C8).
//!
//! Grounded in the teacher's `discord::mod`: the same `serenity`
//! client/`EventHandler`/token-resolution/chunked-send shape, adapted
//! from a one-agent-per-channel model to the conductor's single
//! dispatcher plus per-chat conversation history (`Store`
//! `conversations`/`chat_sticky_models` tables). Registers into the
//! same `comm::ChannelConnector` bus the gateway (C7) publishes
//! through, so cron output (§4.6) and chat replies share one pipe.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Context as AnyhowContext};
use async_trait::async_trait;
use serenity::async_trait as serenity_async_trait;
use serenity::client::{Client, Context as SerenityContext, EventHandler};
use serenity::http::Http;
use serenity::model::channel::Message;
use serenity::model::gateway::GatewayIntents;
use tracing::{debug, error, info, warn};

use crate::comm::{self, ChannelConnector, RichMessage};
use crate::config::{Config, SecretRef};
use crate::dispatcher::{Backend, DispatcherHandle, Task, TaskSource};
use crate::invoker::{self, InvocationRequest, OutputFormat};
use crate::scheduler::resolve_model;
use crate::secrets;
use crate::slash::{self, SlashResponse};
use crate::store::{ConversationMessage, Role, Store};

/// Messages kept (beyond the just-saved one) when rendering
/// `<conversation_history>`.
const HISTORY_LIMIT: usize = 20;

static HTTP_CLIENT: OnceLock<Http> = OnceLock::new();

fn slash_registry() -> &'static slash::Registry {
    static REG: OnceLock<slash::Registry> = OnceLock::new();
    REG.get_or_init(|| {
        let r = slash::Registry::new();
        slash::register_builtin_commands(&r);
        r
    })
}

/// Everything a chat turn (normal message or `/model` one-shot) needs
/// to enqueue work and route the reply. Mirrors `scheduler::SchedulerContext`.
struct ChatContext {
    store: Arc<Store>,
    dispatcher: DispatcherHandle,
    vault_path: String,
    global_model: String,
    ollama_base_url: Option<String>,
    max_message_len: usize,
}

struct Handler {
    ctx: Arc<ChatContext>,
}

#[serenity_async_trait]
impl EventHandler for Handler {
    async fn message(&self, _serenity_ctx: SerenityContext, msg: Message) {
        if msg.author.bot {
            return;
        }

        let chat_id: i64 = msg.channel_id.to_string().parse().unwrap_or_default();
        let trimmed = msg.content.trim();

        debug!(author = %msg.author.name, chat_id, content_len = trimmed.len(), "chat message received");

        crate::gateway::publish_event_json(&serde_json::json!({
            "type": "chat_message",
            "author": msg.author.name,
            "chat_id": chat_id,
            "content": msg.content,
        }));

        if trimmed.starts_with('/') {
            self.handle_slash(chat_id, trimmed).await;
            return;
        }

        let reply_block = msg.referenced_message.as_ref().map(|r| {
            format!("<reply_to>{}</reply_to>\n", truncate_chars(&r.content, 2000))
        });
        let attachment_block = if msg.attachments.is_empty() {
            None
        } else {
            let urls = msg.attachments.iter().map(|a| a.url.clone()).collect::<Vec<_>>().join(", ");
            Some(format!("<attachments>{urls}</attachments>\n"))
        };

        handle_chat_turn(self.ctx.clone(), chat_id, trimmed, None, reply_block, attachment_block).await;
    }
}

impl Handler {
    async fn handle_slash(&self, chat_id: i64, raw: &str) {
        let slash_ctx = slash::Context {
            chat_id,
            channel: "discord".to_string(),
            store: self.ctx.store.clone(),
            global_model: self.ctx.global_model.clone(),
        };

        match slash_registry().dispatch(raw, &slash_ctx).await {
            Ok(SlashResponse::Text(text)) => {
                debug!(cmd = %raw, "slash command dispatched");
                if let Err(e) = send_channel_message(&chat_id.to_string(), &text).await {
                    warn!(error = %e, "failed to send slash reply");
                }
            }
            Ok(SlashResponse::OneShotInvoke { model, prompt }) => {
                handle_chat_turn(self.ctx.clone(), chat_id, &prompt, Some(model), None, None).await;
            }
            Err(e) => {
                warn!(error = %e, cmd = %raw, "slash command error");
                let _ = send_channel_message(&chat_id.to_string(), &format!("error: {e}")).await;
            }
        }
    }
}

/// Render the stored history (oldest first, the just-inserted row
/// already dropped) plus any reply-quote/attachment prefix into the
/// final prompt sent to the agent.
fn build_prompt(
    history: &[ConversationMessage],
    text: &str,
    reply_block: Option<&str>,
    attachment_block: Option<&str>,
) -> String {
    let mut prefix = String::new();
    if let Some(r) = reply_block {
        prefix.push_str(r);
    }
    if let Some(a) = attachment_block {
        prefix.push_str(a);
    }

    if history.is_empty() {
        return format!("{prefix}{text}");
    }

    let blocks = history
        .iter()
        .map(|m| match m.role {
            Role::User => format!("Human: {}", m.content),
            Role::Assistant => format!("Assistant: {}", m.content),
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!("{prefix}<conversation_history>\n{blocks}\n</conversation_history>\n\nHuman: {text}")
}

/// Step 1-4 of §4.8: persist the inbound message, build the
/// history-enriched prompt, enqueue, and route the reply.
async fn handle_chat_turn(
    ctx: Arc<ChatContext>,
    chat_id: i64,
    text: &str,
    model_override: Option<String>,
    reply_block: Option<String>,
    attachment_block: Option<String>,
) {
    if let Err(e) = ctx.store.save_message(chat_id, Role::User, text) {
        error!(chat_id, error = %e, "failed to persist inbound chat message");
        return;
    }

    let history = match ctx.store.get_recent_context(chat_id, HISTORY_LIMIT + 1) {
        Ok(rows) => {
            if rows.is_empty() {
                rows
            } else {
                rows[..rows.len() - 1].to_vec()
            }
        }
        Err(e) => {
            warn!(chat_id, error = %e, "failed to load conversation history, proceeding without it");
            Vec::new()
        }
    };

    let prompt = build_prompt(&history, text, reply_block.as_deref(), attachment_block.as_deref());

    let model_raw = model_override.or_else(|| {
        ctx.store
            .get_sticky_model(chat_id)
            .unwrap_or_else(|e| {
                warn!(chat_id, error = %e, "failed to load sticky model override");
                None
            })
    });
    let resolved = resolve_model(model_raw.as_deref().or(Some(ctx.global_model.as_str())));

    let mut provider_env = HashMap::new();
    if let Some(r) = &resolved {
        if r.provider == "ollama" {
            if let Some(base_url) = &ctx.ollama_base_url {
                provider_env.insert("OLLAMA_BASE_URL".to_string(), base_url.clone());
            }
        }
    }

    let request = InvocationRequest {
        prompt,
        working_dir: Some(ctx.vault_path.clone()),
        session_persistence: false,
        output_format: OutputFormat::StreamJson,
        model: resolved.map(|r| r.model),
        provider_env,
        ..Default::default()
    };

    let task = Task {
        id: format!("chat:{chat_id}:{}", uuid::Uuid::new_v4()),
        source: TaskSource::Telegram,
        request,
        backend: Backend::Process { binary: "claude".to_string() },
    };

    let outcome = match ctx.dispatcher.enqueue(task).await {
        Ok(rx) => rx.await,
        Err(e) => {
            warn!(chat_id, error = %e, "failed to enqueue chat task");
            let _ = send_channel_message(&chat_id.to_string(), &format!("failed to queue request: {e}")).await;
            return;
        }
    };

    let response_text = match outcome {
        Ok(Ok(outcome)) => invoker::extract_response_text(&outcome.result),
        Ok(Err(e)) => format!("dispatcher error: {e}"),
        Err(_) => "the agent worker dropped this task before replying.".to_string(),
    };

    if let Err(e) = ctx.store.save_message(chat_id, Role::Assistant, &response_text) {
        warn!(chat_id, error = %e, "failed to persist assistant reply");
    }

    for chunk in chunk_message(&response_text, ctx.max_message_len) {
        if let Err(e) = send_channel_message(&chat_id.to_string(), &chunk).await {
            warn!(chat_id, error = %e, "failed to deliver chat reply chunk");
            break;
        }
    }
}

/// Split `text` into chunks no longer than `limit` chars, preferring
/// line boundaries; a single line longer than `limit` is hard-split.
fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.split('\n') {
        let line_with_nl_len = line.chars().count() + 1;
        if !current.is_empty() && current.chars().count() + line_with_nl_len > limit {
            chunks.push(std::mem::take(&mut current));
        }

        if line.chars().count() > limit {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let mut rest = line;
            while rest.chars().count() > limit {
                let split_at = rest
                    .char_indices()
                    .nth(limit)
                    .map(|(i, _)| i)
                    .unwrap_or(rest.len());
                chunks.push(rest[..split_at].to_string());
                rest = &rest[split_at..];
            }
            if !rest.is_empty() {
                current.push_str(rest);
                current.push('\n');
            }
            continue;
        }

        current.push_str(line);
        current.push('\n');
    }

    if !current.trim_end_matches('\n').is_empty() {
        chunks.push(current.trim_end_matches('\n').to_string());
    }

    chunks
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

// ---------------------------------------------------------------------------
// ChannelConnector — delivers cron/scheduler/gateway replies back into chat
// ---------------------------------------------------------------------------

/// Channel connector that delivers replies via Discord. `channel` is
/// the numeric Discord channel id as a string, the same identifier
/// used as `chat_id` throughout the store.
pub struct DiscordConnector;

#[async_trait]
impl ChannelConnector for DiscordConnector {
    fn name(&self) -> &str {
        "discord"
    }

    fn matches(&self, channel: &str) -> bool {
        !channel.is_empty() && channel.chars().all(|c| c.is_ascii_digit())
    }

    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()> {
        send_channel_message(channel, text).await
    }

    async fn send_rich(&self, channel: &str, msg: RichMessage) -> anyhow::Result<()> {
        send_channel_message(channel, &msg.as_plain_text()).await
    }
}

pub(crate) async fn send_channel_message(channel: &str, text: &str) -> anyhow::Result<()> {
    let http = HTTP_CLIENT
        .get()
        .ok_or_else(|| anyhow!("discord http client not initialised"))?;

    let cid: u64 = channel
        .parse()
        .with_context(|| format!("invalid channel id: {channel}"))?;
    let ch = serenity::model::id::ChannelId::new(cid);
    ch.say(http, text)
        .await
        .map_err(|e| anyhow!("discord send error: {e:?}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Spawn the chat producer: connects to Discord, registers the
/// [`DiscordConnector`], and starts dispatching inbound messages.
/// No-ops (with a warning) if no bot token is configured.
pub fn init(cfg: &Config, store: Arc<Store>, dispatcher: DispatcherHandle) {
    let token = match resolve_token(cfg) {
        Some(t) => t,
        None => {
            warn!("no Discord bot token configured — chat producer disabled");
            return;
        }
    };

    HTTP_CLIENT.get_or_init(|| Http::new(&token));

    let max_message_len = cfg
        .channels
        .discord
        .as_ref()
        .map(|d| d.max_message_len)
        .unwrap_or(4096);

    let ctx = Arc::new(ChatContext {
        store,
        dispatcher,
        vault_path: cfg.vault_path.clone(),
        global_model: cfg.global_model.clone(),
        ollama_base_url: cfg.ollama.as_ref().map(|o| o.base_url.clone()),
        max_message_len,
    });

    tokio::spawn(async {
        comm::register_connector(Arc::new(DiscordConnector)).await;
    });

    tokio::spawn(async move {
        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;

        let mut client = match Client::builder(&token, intents)
            .event_handler(Handler { ctx: ctx.clone() })
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to build Discord client");
                return;
            }
        };

        info!("starting chat producer (Discord)");
        if let Err(e) = client.start().await {
            let s = e.to_string();
            if s.contains("Disallowed gateway intents") || s.contains("Disallowed intent") {
                warn!(error = %e, "disallowed gateway intents, retrying without MESSAGE_CONTENT");
                let reduced = GatewayIntents::GUILD_MESSAGES | GatewayIntents::DIRECT_MESSAGES;
                match Client::builder(&token, reduced).event_handler(Handler { ctx }).await {
                    Ok(mut rc) => {
                        if let Err(e2) = rc.start().await {
                            warn!(error = %e2, "Discord client error with reduced intents");
                        }
                    }
                    Err(e2) => warn!(error = %e2, "failed to build Discord client with reduced intents"),
                }
            } else {
                warn!(error = %e, "Discord client error");
            }
        }
    });

    debug!("chat producer loaded");
}

/// Resolve the configured Discord bot token: env var, file-backed
/// secrets, or OS keyring, in that precedence order.
fn resolve_token(cfg: &Config) -> Option<String> {
    if let Ok(tok) = std::env::var("DISCORD_TOKEN") {
        if !tok.is_empty() {
            return Some(tok);
        }
    }

    let discord_cfg = cfg.channels.discord.as_ref()?;
    match &discord_cfg.token {
        SecretRef::Plain(s) => {
            if let Some(var) = s.strip_prefix('$').filter(|v| !v.is_empty()) {
                return std::env::var(var).ok();
            }
            if let Some(key) = s.strip_prefix('@').filter(|v| !v.is_empty()) {
                let dir = cfg.secrets.as_ref().and_then(|sc| sc.path.as_deref()).map(Path::new);
                return secrets::get_secret_file(dir, key).ok().flatten().filter(|v| !v.is_empty());
            }
            (!s.is_empty()).then(|| s.clone())
        }
        SecretRef::Pointer { key, source } => match source.as_str() {
            "env" => std::env::var(key).ok(),
            "secrets" => {
                let dir = cfg.secrets.as_ref().and_then(|sc| sc.path.as_deref()).map(Path::new);
                secrets::get_secret_file(dir, key).ok().flatten().filter(|v| !v.is_empty())
            }
            "keyring" => {
                let entry = keyring::Entry::new("conductor", key).ok()?;
                entry.get_password().ok().filter(|v| !v.is_empty())
            }
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Role;

    fn msg(role: Role, content: &str) -> ConversationMessage {
        ConversationMessage {
            id: 0,
            chat_id: 1,
            role,
            content: content.to_string(),
            created_at: String::new(),
        }
    }

    #[test]
    fn build_prompt_no_history_uses_raw_text() {
        let prompt = build_prompt(&[], "hello", None, None);
        assert_eq!(prompt, "hello");
    }

    #[test]
    fn build_prompt_wraps_history_and_appends_final_turn() {
        let history = vec![msg(Role::User, "hi"), msg(Role::Assistant, "hello there")];
        let prompt = build_prompt(&history, "how are you", None, None);
        assert!(prompt.starts_with("<conversation_history>"));
        assert!(prompt.contains("Human: hi"));
        assert!(prompt.contains("Assistant: hello there"));
        assert!(prompt.ends_with("Human: how are you"));
    }

    #[test]
    fn build_prompt_prepends_reply_and_attachment_blocks() {
        let prompt = build_prompt(&[], "hi", Some("<reply_to>x</reply_to>\n"), Some("<attachments>a.png</attachments>\n"));
        assert!(prompt.starts_with("<reply_to>x</reply_to>\n<attachments>a.png</attachments>\nhi"));
    }

    #[test]
    fn chunk_message_under_limit_is_single_chunk() {
        let chunks = chunk_message("short message", 4096);
        assert_eq!(chunks, vec!["short message".to_string()]);
    }

    #[test]
    fn chunk_message_splits_at_line_boundaries() {
        let line = "a".repeat(50);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = chunk_message(&text, 110);
        assert_eq!(chunks.len(), 2);
        for c in &chunks {
            assert!(c.chars().count() <= 110);
        }
    }

    #[test]
    fn chunk_message_hard_splits_oversized_line() {
        let text = "x".repeat(250);
        let chunks = chunk_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn discord_connector_matches_numeric_channel_only() {
        let c = DiscordConnector;
        assert!(c.matches("123456"));
        assert!(!c.matches("dm:123"));
        assert!(!c.matches(""));
    }
}
