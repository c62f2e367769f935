use conductor::chat;
use conductor::cli::{self, CronAction as CliCronAction, ConfigAction as CliConfigAction};
use conductor::config;
use conductor::dispatcher;
use conductor::gateway;
use conductor::scheduler::SchedulerHandle;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Multi-source agent-task conductor")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon (scheduler, dispatcher, gateway, chat producer)
    Serve,
    /// Manage cron jobs without going through the HTTP gateway
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },
    /// Inspect or validate the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum CronAction {
    /// List configured jobs
    List,
    /// Create a new job
    Create {
        name: String,
        /// Cron schedule expression (5- or 6-field)
        #[arg(long)]
        schedule: String,
        /// Prompt text sent to the agent on each firing
        #[arg(long)]
        prompt: String,
        /// Output sink: telegram, log, silent, webhook
        #[arg(long, default_value = "log")]
        output: String,
        /// IANA timezone name
        #[arg(long, default_value = "America/Chicago")]
        timezone: String,
        /// Model id/alias override
        #[arg(long)]
        model: Option<String>,
    },
    /// Delete a job by name
    Delete { name: String },
    /// Fire a job immediately, bypassing its schedule
    Trigger { name: String },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the loaded configuration as YAML
    Show,
    /// Load and validate the configuration file, reporting errors
    Validate,
}

impl From<CronAction> for CliCronAction {
    fn from(a: CronAction) -> Self {
        match a {
            CronAction::List => CliCronAction::List,
            CronAction::Create { name, schedule, prompt, output, timezone, model } => {
                CliCronAction::Create { name, schedule, prompt, output, timezone, model }
            }
            CronAction::Delete { name } => CliCronAction::Delete { name },
            CronAction::Trigger { name } => CliCronAction::Trigger { name },
        }
    }
}

impl From<ConfigAction> for CliConfigAction {
    fn from(a: ConfigAction) -> Self {
        match a {
            ConfigAction::Show => CliConfigAction::Show,
            ConfigAction::Validate => CliConfigAction::Validate,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing with layered subscriber (fmt + log broadcast)
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let fmt_layer = tracing_subscriber::fmt::layer();

        let logs_tx = conductor::logs::init_broadcast();
        let broadcast_layer = conductor::logs::BroadcastLayer::new(logs_tx);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(broadcast_layer)
            .init();
    }

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| conductor::conductor_home().join("config.yaml"));

    match cli.command {
        Some(Command::Serve) | None => { /* fall through to daemon startup */ }
        Some(Command::Cron { action }) => {
            let cfg = config::Config::load(&config_path).await?;
            let store = cli::open_store(&cfg)?;
            return cli::run_cron_command(action.into(), &store).await;
        }
        Some(Command::Config { action }) => {
            return cli::run_config_command(action.into(), &config_path).await;
        }
    }

    // --- Normal server startup ---

    println!(
        r#"
  ┌──────────────────────────────────────┐
  │   conductor  v{:<24}│
  │   multi-source agent-task conductor   │
  └──────────────────────────────────────┘
"#,
        env!("CARGO_PKG_VERSION")
    );

    info!(path = %config_path.display(), "loading configuration");
    let cfg = config::Config::load(&config_path).await?;
    info!(
        models = cfg.models.len(),
        cron_jobs = cfg.cron_jobs.len(),
        "configuration loaded"
    );

    let store = Arc::new(cli::open_store(&cfg)?);
    cli::seed_cron_jobs_if_empty(&store, &cfg)?;

    let cancel = CancellationToken::new();

    let (dispatcher_handle, dispatcher_join) = dispatcher::spawn(cfg.max_concurrent.max(1), cancel.clone());

    let scheduler = SchedulerHandle::new(store.clone(), dispatcher_handle.clone(), &cfg)
        .await
        .context("initializing scheduler")?;
    scheduler.start().await.context("starting scheduler")?;
    let scheduler = Arc::new(scheduler);

    let _gateway = gateway::spawn_gateway_if_enabled(config_path.clone(), store.clone(), scheduler.clone())
        .await
        .map(|mut gw| {
            let commands_rx = std::mem::replace(&mut gw.commands_rx, tokio::sync::mpsc::channel(1).1);
            gateway::spawn_command_forwarder(commands_rx);
            gw
        });

    if cfg.channels.discord.is_some() {
        chat::init(&cfg, store.clone(), dispatcher_handle.clone());
        info!("chat producer enabled");
    } else {
        info!("chat producer disabled (no channels.discord configured)");
    }

    info!("conductor ready — all modules initialized");

    // ── Startup summary ─────────────────────────────────────────────
    {
        let api_token = std::env::var("CONDUCTOR_API_TOKEN").ok().filter(|s| !s.is_empty());
        let gw_url = _gateway.as_ref().map(|gw| format!("http://{}", gw.addr));
        let gw_status = gw_url.clone().unwrap_or_else(|| "disabled".to_string());

        let job_count = cfg.cron_jobs.len();
        let chat_status = if cfg.channels.discord.is_some() { "connecting" } else { "disabled" };

        println!("  ┌────────────────────────────────────────┐");
        println!("  │  ✅  Ready                               │");
        println!("  ├────────────────────────────────────────┤");
        println!("  │  Gateway:    {:<27}│", gw_status);
        println!("  │  Cron jobs:  {:<27}│", job_count);
        println!("  │  Models:     {:<27}│", cfg.models.len());
        println!("  │  Chat:       {:<27}│", chat_status);
        println!("  └────────────────────────────────────────┘");

        if let Some(ref url) = gw_url {
            if let Some(ref token) = api_token {
                println!("  🔗 {url}/?token={token}");
            } else {
                println!("  🔗 {url}/");
            }
        }
        println!();
    }

    // Wait for shutdown signal (Ctrl-C)
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, shutting down…");

    // 1. Stop accepting new work and let the dispatcher drain in-flight tasks.
    cancel.cancel();
    let _ = dispatcher_join.await;

    // 2. Stop the cron scheduler's timers.
    if let Ok(mut scheduler) = Arc::try_unwrap(scheduler) {
        let _ = scheduler.shutdown().await;
    }

    // 3. Broadcast shutdown event to WebSocket clients.
    gateway::publish_event_json(&serde_json::json!({
        "type": "shutdown",
        "message": "conductor daemon shutting down",
    }));

    // Give WebSocket clients a moment to receive the shutdown event
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;

    info!("shutdown complete");

    Ok(())
}

