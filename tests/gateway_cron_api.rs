//! Integration test for the gateway's cron CRUD/trigger HTTP surface
//! (C7) against a real store and scheduler, no mocked HTTP layer.

use std::sync::Arc;

use conductor::config::Config;
use conductor::dispatcher;
use conductor::gateway;
use conductor::scheduler::SchedulerHandle;
use conductor::store::Store;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn minimal_config() -> Config {
    let yaml = "vault_path: /tmp/conductor-gw-test\ndb_path: \":memory:\"\nglobal_model: sonnet\n";
    serde_yaml::from_str(yaml).unwrap()
}

async fn start_test_gateway() -> gateway::Gateway {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let cfg = minimal_config();
    let cancel = CancellationToken::new();
    let (dispatcher_handle, _join) = dispatcher::spawn(4, cancel);

    let scheduler = SchedulerHandle::new(store.clone(), dispatcher_handle, &cfg).await.unwrap();
    scheduler.start().await.unwrap();

    gateway::start_gateway(
        "127.0.0.1:0".parse().unwrap(),
        std::path::PathBuf::from("/tmp/conductor-gw-test/config.yaml"),
        store,
        Arc::new(scheduler),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn status_endpoint_reports_ok() {
    let gw = start_test_gateway().await;
    let resp = reqwest::get(format!("http://{}/api/status", gw.addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn cron_create_list_get_delete_round_trip() {
    let gw = start_test_gateway().await;
    let base = format!("http://{}/api", gw.addr);
    let client = reqwest::Client::new();

    let create_body = json!({
        "name": "nightly",
        "schedule": "0 0 * * *",
        "prompt": "summarize today",
        "output": "log",
    });
    let resp = client.post(format!("{base}/cron")).json(&create_body).send().await.unwrap();
    assert_eq!(resp.status(), 201);

    // Duplicate name is rejected as a conflict.
    let dup = client.post(format!("{base}/cron")).json(&create_body).send().await.unwrap();
    assert_eq!(dup.status(), 409);

    let list: Value = client.get(format!("{base}/cron")).send().await.unwrap().json().await.unwrap();
    let jobs = list["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0]["name"], "nightly");

    let got: Value = client.get(format!("{base}/cron/nightly")).send().await.unwrap().json().await.unwrap();
    assert_eq!(got["job"]["schedule"], "0 0 * * *");

    let missing = client.get(format!("{base}/cron/does-not-exist")).send().await.unwrap();
    assert_eq!(missing.status(), 404);

    let del = client.delete(format!("{base}/cron/nightly")).send().await.unwrap();
    assert_eq!(del.status(), 200);

    let list_after: Value = client.get(format!("{base}/cron")).send().await.unwrap().json().await.unwrap();
    assert!(list_after["jobs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn trigger_unknown_job_is_404() {
    let gw = start_test_gateway().await;
    let base = format!("http://{}/api", gw.addr);
    let client = reqwest::Client::new();

    let resp = client.post(format!("{base}/trigger/nope")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn cron_history_endpoint_returns_executions_key() {
    let gw = start_test_gateway().await;
    let base = format!("http://{}/api", gw.addr);
    let client = reqwest::Client::new();

    let create_body = json!({
        "name": "backup",
        "schedule": "0 1 * * *",
        "prompt": "back things up",
        "output": "log",
    });
    client.post(format!("{base}/cron")).json(&create_body).send().await.unwrap();

    let history: Value = client
        .get(format!("{base}/cron/backup/history"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(history["executions"].is_array());
    assert!(history["executions"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn cron_create_rejects_invalid_execution_mode_with_details() {
    let gw = start_test_gateway().await;
    let base = format!("http://{}/api", gw.addr);
    let client = reqwest::Client::new();

    let create_body = json!({
        "name": "bad-mode",
        "schedule": "0 1 * * *",
        "prompt": "hello",
        "execution_mode": "ssh",
    });
    let resp = client.post(format!("{base}/cron")).json(&create_body).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "execution_mode must be 'cli' or 'api'");
    assert_eq!(body["details"], "execution_mode");
}
