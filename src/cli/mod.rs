//! CLI subcommand handlers extracted from `main.rs`.
//!
//! Keeps `main.rs` slim: clap parsing and daemon wiring stay there,
//! the `cron`/`config` subcommand bodies live here.

use crate::config::Config;
use crate::store::{NewCronJob, Store};

use anyhow::Context;
use std::path::Path;

/// `conductor cron list|create|delete|trigger` — scripting-friendly
/// wrappers over the same store operations the gateway's CRUD surface
/// (C7) exposes over HTTP.
pub enum CronAction {
    List,
    Create {
        name: String,
        schedule: String,
        prompt: String,
        output: String,
        timezone: String,
        model: Option<String>,
    },
    Delete {
        name: String,
    },
    Trigger {
        name: String,
    },
}

pub async fn run_cron_command(action: CronAction, store: &Store) -> anyhow::Result<()> {
    match action {
        CronAction::List => {
            let jobs = store.list_jobs()?;
            if jobs.is_empty() {
                println!("no cron jobs configured");
            }
            for job in jobs {
                println!(
                    "{:<20} {:<16} {:<8} enabled={} tz={}",
                    job.name, job.schedule, job.output, job.enabled, job.timezone
                );
            }
        }
        CronAction::Create { name, schedule, prompt, output, timezone, model } => {
            let job = store.create_job(&NewCronJob {
                name,
                schedule,
                prompt,
                output,
                enabled: true,
                timezone,
                max_turns: None,
                model,
                execution_mode: "cli".to_string(),
                allowed_tools: None,
            })?;
            println!("created job '{}'", job.name);
        }
        CronAction::Delete { name } => {
            if store.delete_job(&name)? {
                println!("deleted job '{name}'");
            } else {
                println!("no such job: '{name}'");
            }
        }
        CronAction::Trigger { name } => match store.get_job(&name)? {
            Some(_) => {
                println!(
                    "job '{name}' exists; start the daemon (`conductor serve`) to fire it \
                     through the running scheduler, or use the gateway's POST /api/trigger/{name}"
                );
            }
            None => println!("no such job: '{name}'"),
        },
    }
    Ok(())
}

/// `conductor config show|validate`.
pub enum ConfigAction {
    Show,
    Validate,
}

pub async fn run_config_command(action: ConfigAction, config_path: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let cfg = Config::load(config_path).await?;
            println!("{}", serde_yaml::to_string(&cfg)?);
        }
        ConfigAction::Validate => match Config::load(config_path).await {
            Ok(_) => println!("configuration is valid"),
            Err(e) => {
                eprintln!("configuration invalid: {e:#}");
                std::process::exit(1);
            }
        },
    }
    Ok(())
}

/// Open the store at `cfg.db_path`, or an in-memory store when set to
/// `:memory:` (used by tests and ephemeral runs).
pub fn open_store(cfg: &Config) -> anyhow::Result<Store> {
    if cfg.db_path == ":memory:" {
        Store::open_in_memory().context("opening in-memory store")
    } else {
        Store::open(Path::new(&cfg.db_path)).context("opening store")
    }
}

/// Seed `cfg.cron_jobs` into the store on an empty database only; once
/// any job exists the store is authoritative and the config list is
/// ignored on subsequent starts.
pub fn seed_cron_jobs_if_empty(store: &Store, cfg: &Config) -> anyhow::Result<()> {
    if !store.list_jobs()?.is_empty() {
        return Ok(());
    }
    for job in &cfg.cron_jobs {
        store.create_job(&NewCronJob {
            name: job.name.clone(),
            schedule: job.schedule.clone(),
            prompt: job.prompt.clone(),
            output: job.output.clone(),
            enabled: job.enabled,
            timezone: job.timezone.clone(),
            max_turns: job.max_turns,
            model: job.model.clone(),
            execution_mode: job.execution_mode.clone(),
            allowed_tools: job.allowed_tools.clone(),
        })?;
        tracing::info!(job = %job.name, "seeded cron job from configuration");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CronJobConfig;

    fn empty_config(db_path: &str) -> Config {
        let yaml = format!(
            "vault_path: /tmp/conductor-test-vault\ndb_path: \"{db_path}\"\nglobal_model: sonnet\n"
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn seed_cron_jobs_only_runs_on_empty_store() {
        let store = Store::open_in_memory().unwrap();
        let mut cfg = empty_config(":memory:");
        cfg.cron_jobs.push(CronJobConfig {
            name: "daily".to_string(),
            schedule: "0 9 * * *".to_string(),
            prompt: "good morning".to_string(),
            output: "log".to_string(),
            enabled: true,
            timezone: "America/Chicago".to_string(),
            max_turns: None,
            model: None,
            execution_mode: "cli".to_string(),
            allowed_tools: None,
        });

        seed_cron_jobs_if_empty(&store, &cfg).unwrap();
        assert_eq!(store.list_jobs().unwrap().len(), 1);

        // A second seed attempt is a no-op once the store is non-empty,
        // even if the config list changes.
        cfg.cron_jobs[0].name = "other".to_string();
        seed_cron_jobs_if_empty(&store, &cfg).unwrap();
        assert_eq!(store.list_jobs().unwrap().len(), 1);
    }
}
