//! End-to-end: a cron job is created, manually triggered, runs through
//! the real dispatcher against a fake `claude` binary on `PATH`, and
//! its result lands in the store and history file (S1 from the spec's
//! scenario table).

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use conductor::config::Config;
use conductor::dispatcher;
use conductor::scheduler::SchedulerHandle;
use conductor::store::{NewCronJob, Store};
use tokio_util::sync::CancellationToken;

/// Write a fake `claude` executable into `dir` that ignores its
/// arguments and prints a successful stream-json result line, then
/// prepend `dir` to `PATH` so `tokio::process::Command::new("claude")`
/// resolves to it.
fn install_fake_claude(dir: &std::path::Path) {
    let script_path = dir.join("claude");
    let mut f = std::fs::File::create(&script_path).unwrap();
    writeln!(
        f,
        "#!/bin/sh\necho '{{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"hi\",\"num_turns\":1}}'\nexit 0"
    )
    .unwrap();
    drop(f);
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();

    let old_path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{}", dir.display(), old_path));
}

fn minimal_config(vault_path: &str) -> Config {
    let yaml = format!(
        "vault_path: \"{vault_path}\"\ndb_path: \":memory:\"\nglobal_model: sonnet\n"
    );
    serde_yaml::from_str(&yaml).unwrap()
}

#[tokio::test]
async fn cron_job_trigger_persists_execution_and_history() {
    let tmp = tempfile::tempdir().unwrap();
    install_fake_claude(tmp.path());

    let vault = tmp.path().join("vault");
    std::fs::create_dir_all(&vault).unwrap();

    let store = Arc::new(Store::open_in_memory().unwrap());
    let cfg = minimal_config(vault.to_str().unwrap());

    let cancel = CancellationToken::new();
    let (dispatcher_handle, _join) = dispatcher::spawn(4, cancel.clone());

    let scheduler = SchedulerHandle::new(store.clone(), dispatcher_handle, &cfg)
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    store
        .create_job(&NewCronJob {
            name: "daily".to_string(),
            schedule: "* * * * *".to_string(),
            prompt: "hello".to_string(),
            output: "log".to_string(),
            enabled: true,
            timezone: "America/Chicago".to_string(),
            max_turns: None,
            model: None,
            execution_mode: "cli".to_string(),
            allowed_tools: None,
        })
        .unwrap();

    let fired = scheduler.trigger_job("daily").await.unwrap();
    assert!(fired);

    let executions = store.get_recent_executions(Some("daily"), 10).unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].exit_code, Some(0));
    assert_eq!(executions[0].response_preview.as_deref(), Some("hi"));
    assert!(!executions[0].timed_out);

    let history_path = vault.join("agent-files").join("daily-history.md");
    let history = std::fs::read_to_string(history_path).unwrap();
    assert!(history.contains("hi"));

    cancel.cancel();
}

#[tokio::test]
async fn trigger_unknown_job_returns_false() {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let cfg = minimal_config(tempfile::tempdir().unwrap().path().to_str().unwrap());

    let cancel = CancellationToken::new();
    let (dispatcher_handle, _join) = dispatcher::spawn(4, cancel.clone());

    let scheduler = SchedulerHandle::new(store, dispatcher_handle, &cfg).await.unwrap();
    scheduler.start().await.unwrap();

    let fired = scheduler.trigger_job("nonexistent").await.unwrap();
    assert!(!fired);

    cancel.cancel();
}
