//! Configuration loading and validation.
//!
//! A single YAML file describes the vault, the store location, model
//! routing, and the chat channel.  Loaded once at startup; the CRUD
//! surface (C7) mutates the store directly and only re-exports to YAML
//! on an explicit `config export`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// A reference to a secret value.
///
/// Supports three YAML forms:
///   - Plain string:  `token: $DISCORD_TOKEN`
///   - At-prefixed:   `token: "@DISCORD_TOKEN"`
///   - Pointer object: `token: { key: "DISCORD_TOKEN", source: "secrets" }`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SecretRef {
    /// Plain string or env-var / at-prefixed reference.
    Plain(String),
    /// Structured pointer: key + source ("secrets", "env", "keyring").
    Pointer { key: String, source: String },
}

impl SecretRef {
    /// Resolve to the underlying value.
    ///
    /// `Plain("$FOO")` and `Plain("@FOO")` resolve from the environment;
    /// any other plain string is used verbatim. `Pointer{source:"env"}`
    /// reads an env var; `Pointer{source:"secrets"}` reads the file-backed
    /// secret store; `Pointer{source:"keyring"}` reads the OS keyring.
    pub fn resolve(&self, secrets_dir: Option<&Path>) -> anyhow::Result<String> {
        match self {
            SecretRef::Plain(s) => {
                if let Some(var) = s.strip_prefix('$').or_else(|| s.strip_prefix('@')) {
                    std::env::var(var)
                        .with_context(|| format!("env var '{var}' referenced by config is not set"))
                } else {
                    Ok(s.clone())
                }
            }
            SecretRef::Pointer { key, source } => match source.as_str() {
                "env" => std::env::var(key)
                    .with_context(|| format!("env var '{key}' referenced by config is not set")),
                "secrets" => crate::secrets::get_secret_file(secrets_dir, key)?
                    .with_context(|| format!("secret '{key}' not found in secrets store")),
                "keyring" => {
                    let entry = keyring::Entry::new("conductor", key)
                        .with_context(|| format!("keyring entry for '{key}'"))?;
                    entry
                        .get_password()
                        .with_context(|| format!("keyring secret '{key}' not found"))
                }
                other => anyhow::bail!("unknown secret source '{other}' for key '{key}'"),
            },
        }
    }
}

/// Global secrets-store configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SecretsConfig {
    /// Path to the file-backed secrets directory.
    #[serde(default)]
    pub path: Option<String>,
}

/// A configured LLM provider, used to resolve `model`/`fallback_models`
/// references on cron jobs and chat sticky-model overrides.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Unique identifier for this provider entry (e.g. "openai-default").
    pub id: String,
    /// Provider kind: "openai", "azure-openai", "openai-compat", "ollama", etc.
    pub provider: String,
    /// Model name to request (e.g. "gpt-4o").
    #[serde(default)]
    pub model: Option<String>,
    /// API key (plain text or env-var reference like `$OPENAI_API_KEY`).
    #[serde(default)]
    pub api_key: Option<String>,
    /// Endpoint URL, required for azure-openai / openai-compat.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub embedding_deployment: Option<String>,
}

/// Channel connector settings.
#[derive(Debug, Deserialize, Serialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ChannelsConfig {
    /// Chat connector configuration. Optional so the daemon can start
    /// without a chat producer attached.
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
    /// Channel id that `output: telegram` cron jobs route to and that
    /// conversation history is keyed under. Named generically because
    /// the underlying connector is pluggable.
    #[serde(default)]
    pub primary_channel: Option<String>,
}

/// Discord-specific channel config.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    /// Bot token – plain string, env-var ref, or secret pointer.
    pub token: SecretRef,
    /// Channel size limit for outbound chunking. Default 4096.
    #[serde(default = "default_chunk_size")]
    pub max_message_len: usize,
}

fn default_chunk_size() -> usize {
    4096
}

/// Optional HTTP agent-SDK (C4) configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ApiBackendConfig {
    /// Base URL of the HTTP agent API (e.g. `https://api.anthropic.com`).
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key reference, resolved at startup via [`SecretRef::resolve`].
    #[serde(default)]
    pub api_key: Option<SecretRef>,
    #[serde(default)]
    pub default_model: Option<String>,
}

/// Optional local-model (ollama) base URL.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct OllamaConfig {
    pub base_url: String,
}

/// A cron job seeded into the store on first run. After the store is
/// populated it is authoritative; this list only matters on an empty
/// database (first-run bootstrap).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CronJobConfig {
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

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Filesystem root the agent is invoked against; also the parent of
    /// the per-job history directory (`{vault_path}/agent-files/`).
    pub vault_path: String,
    /// Path to the SQLite store file. `:memory:` for ephemeral/testing.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Default model used when a job/chat has no explicit override.
    pub global_model: String,
    /// Optional HTTP agent-SDK configuration (used by execution_mode=api jobs).
    #[serde(default)]
    pub api: Option<ApiBackendConfig>,
    /// Optional local-model routing (the `ollama:` prefix).
    #[serde(default)]
    pub ollama: Option<OllamaConfig>,
    /// Model provider definitions, referenced by id from jobs/config.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    /// Channel (e.g. Discord) settings.
    #[serde(default)]
    pub channels: ChannelsConfig,
    /// Global secrets configuration.
    #[serde(default)]
    pub secrets: Option<SecretsConfig>,
    /// Cron jobs to seed into the store on first run (empty DB only).
    #[serde(default)]
    pub cron_jobs: Vec<CronJobConfig>,
    /// Default timeout (seconds) applied to every agent invocation.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Dispatcher queue capacity. Accepted but current semantics are
    /// exactly-one-in-flight serial execution regardless of this value
    /// (see SPEC_FULL.md §9 open questions).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_db_path() -> String {
    "conductor.db".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    1
}

impl Config {
    /// Read and parse a YAML configuration file.
    ///
    /// Resolution order when `path` does not exist: `{path}.bak`, then
    /// `{conductor_home}/config.yaml`, then `{conductor_home}/config.yaml.bak`.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut bak_name = path.as_os_str().to_os_string();
                bak_name.push(".bak");
                let bak_path = PathBuf::from(bak_name);
                match tokio::fs::read_to_string(&bak_path).await {
                    Ok(c) => {
                        tracing::warn!(
                            path = %path.display(),
                            bak = %bak_path.display(),
                            "config file not found, falling back to .bak"
                        );
                        c
                    }
                    Err(_) => {
                        let filename = path.file_name().and_then(|f| f.to_str());
                        let eligible = filename == Some("config.yaml") && path.is_relative();
                        if eligible {
                            let home = crate::conductor_home();
                            let home_path = home.join("config.yaml");
                            match tokio::fs::read_to_string(&home_path).await {
                                Ok(c) => {
                                    tracing::warn!(
                                        attempted = %path.display(),
                                        found = %home_path.display(),
                                        "config file not found, falling back to conductor home"
                                    );
                                    c
                                }
                                Err(_) => {
                                    return Err(e).with_context(|| {
                                        format!("failed to read config file: {}", path.display())
                                    });
                                }
                            }
                        } else {
                            return Err(e).with_context(|| {
                                format!("failed to read config file: {}", path.display())
                            });
                        }
                    }
                }
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };

        let mut config: Config =
            serde_yaml::from_str(&contents).context("failed to parse config YAML")?;
        config.validate()?;

        // Resolve a relative vault_path against conductor_home.
        let home = crate::conductor_home();
        let vp = std::path::Path::new(&config.vault_path);
        if vp.is_relative() {
            config.vault_path = home.join(vp).to_string_lossy().to_string();
        }

        tracing::debug!(
            vault_path = %config.vault_path,
            models = config.models.len(),
            cron_jobs = config.cron_jobs.len(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Validate semantic constraints that serde cannot enforce.
    fn validate(&self) -> anyhow::Result<()> {
        use std::collections::HashSet;

        let model_ids: HashSet<&str> = self.models.iter().map(|m| m.id.as_str()).collect();
        if model_ids.len() != self.models.len() {
            anyhow::bail!("config: duplicate model IDs detected");
        }

        let mut job_names = HashSet::new();
        for job in &self.cron_jobs {
            if !job_names.insert(job.name.as_str()) {
                anyhow::bail!("config: duplicate cron job name '{}'", job.name);
            }
            if job.schedule.trim().is_empty() {
                anyhow::bail!("config: cron job '{}' has empty schedule", job.name);
            }
            if let Some(ref model) = job.model {
                if !model.is_empty() && !model_ids.contains(model.as_str()) && !model.contains(':') {
                    // Bare model ids must reference a configured provider;
                    // `ollama:<name>` and short aliases pass through and
                    // are resolved at execution time instead.
                    tracing::debug!(job = %job.name, model = %model, "model not found in models[]; will attempt alias/passthrough resolution at run time");
                }
            }
            if !matches!(job.output.as_str(), "telegram" | "log" | "silent" | "webhook") {
                anyhow::bail!(
                    "config: cron job '{}' has unknown output '{}'",
                    job.name,
                    job.output
                );
            }
            if !matches!(job.execution_mode.as_str(), "cli" | "api") {
                anyhow::bail!(
                    "config: cron job '{}' has unknown execution_mode '{}'",
                    job.name,
                    job.execution_mode
                );
            }
        }

        if !(1..=10).contains(&self.max_concurrent) {
            anyhow::bail!("config: max_concurrent must be in range 1..10");
        }

        Ok(())
    }

    /// Serialize and write the configuration back to a YAML file.
    ///
    /// Non-atomic read-modify-write, matching the upstream behaviour
    /// (see SPEC_FULL.md §9 open questions).
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_yaml::to_string(self).context("serialize config YAML")?;
        tokio::fs::write(path, &contents)
            .await
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
vault_path: "/tmp/vault"
global_model: "sonnet"
cron_jobs:
  - name: "daily"
    schedule: "0 9 * * *"
    prompt: "summarize today"
"#
    }

    #[tokio::test]
    async fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(&path, minimal_yaml()).await.unwrap();
        let cfg = Config::load(&path).await.unwrap();
        assert_eq!(cfg.cron_jobs.len(), 1);
        assert_eq!(cfg.db_path, "conductor.db");
        assert_eq!(cfg.max_concurrent, 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_job_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = r#"
vault_path: "/tmp/vault"
global_model: "sonnet"
cron_jobs:
  - name: "daily"
    schedule: "0 9 * * *"
    prompt: "a"
  - name: "daily"
    schedule: "0 10 * * *"
    prompt: "b"
"#;
        tokio::fs::write(&path, yaml).await.unwrap();
        let err = Config::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("duplicate cron job name"));
    }

    #[tokio::test]
    async fn rejects_empty_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = r#"
vault_path: "/tmp/vault"
global_model: "sonnet"
cron_jobs:
  - name: "daily"
    schedule: ""
    prompt: "a"
"#;
        tokio::fs::write(&path, yaml).await.unwrap();
        let err = Config::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("empty schedule"));
    }

    #[test]
    fn secret_ref_plain_env() {
        std::env::set_var("CONDUCTOR_TEST_TOKEN", "abc123");
        let r = SecretRef::Plain("$CONDUCTOR_TEST_TOKEN".to_string());
        assert_eq!(r.resolve(None).unwrap(), "abc123");
        std::env::remove_var("CONDUCTOR_TEST_TOKEN");
    }

    #[test]
    fn secret_ref_plain_passthrough() {
        let r = SecretRef::Plain("literal-value".to_string());
        assert_eq!(r.resolve(None).unwrap(), "literal-value");
    }
}
