//! End-to-end flow tests: suspend on missing credentials, resume, payload
//! history, config-change invalidation and stale webview callbacks.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use quotaboard::config::{ConfigProvider, MemoryConfigStore, Source};
use quotaboard::engine::{CollectorEngine, RunOutcome};
use quotaboard::secrets::SecretsStore;
use quotaboard::state::{InteractionKind, RunStateStore, RunStatus};

struct Harness {
    engine: CollectorEngine,
    config: Arc<MemoryConfigStore>,
    secrets: Arc<SecretsStore>,
}

fn harness() -> Harness {
    let key = BASE64.encode([0u8; 32]);
    let secrets = Arc::new(SecretsStore::open(":memory:", &key).unwrap());
    let states = Arc::new(RunStateStore::open(":memory:").unwrap());
    let config = Arc::new(MemoryConfigStore::new());
    let engine = CollectorEngine::new(
        Arc::clone(&config) as Arc<dyn ConfigProvider>,
        Arc::clone(&secrets),
        states,
    );
    Harness {
        engine,
        config,
        secrets,
    }
}

fn source_with_flow(id: &str, flow: Value) -> Source {
    serde_json::from_value(json!({"id": id, "name": id, "flow": flow})).unwrap()
}

fn quota_flow(base_url: &str) -> Value {
    json!([
        {
            "id": "credentials",
            "use": "api_key",
            "args": {"secret_key": "api_key", "label": "Provider API key"},
            "outputs": {"value": "access_token"}
        },
        {
            "id": "fetch",
            "use": "http",
            "args": {
                "url": format!("{base_url}/quota"),
                "headers": {"Authorization": "Bearer {access_token}"}
            },
            "outputs": {"http_response": "http_response"}
        },
        {
            "id": "pick",
            "use": "extract",
            "args": {"source": "{http_response}", "expression": "$.data.used"}
        }
    ])
}

#[tokio::test]
async fn suspends_for_api_key_then_resumes_to_completion() {
    let mut server = mockito::Server::new_async().await;
    let quota_mock = server
        .mock("GET", "/quota")
        .match_header("authorization", "Bearer sk-test")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data": {"used": 42, "limit": 100}}"#)
        .create_async()
        .await;

    let h = harness();
    h.config
        .upsert_source(source_with_flow("acme", quota_flow(&server.url())));

    // First run suspends asking for the key; no network I/O happened.
    let outcome = h.engine.run("acme").await.unwrap();
    let state = match outcome {
        RunOutcome::Completed(state) => state,
        RunOutcome::Dropped => panic!("run was dropped"),
    };
    assert_eq!(state.status, RunStatus::Suspended);
    let interaction = state.pending_interaction.expect("pending interaction");
    assert_eq!(interaction.kind, InteractionKind::InputText);
    assert_eq!(interaction.fields[0].key, "api_key");
    assert_eq!(interaction.fields[0].input_type, "password");

    // Resume with the key: the flow re-executes the pending step and runs
    // through to the extract.
    let mut payload = Map::new();
    payload.insert("api_key".to_string(), json!("sk-test"));
    let outcome = h.engine.resume("acme", payload).await.unwrap();
    let state = match outcome {
        RunOutcome::Completed(state) => state,
        RunOutcome::Dropped => panic!("resume was dropped"),
    };
    quota_mock.assert_async().await;
    assert_eq!(state.status, RunStatus::Active);
    assert!(state.pending_interaction.is_none());
    assert_eq!(state.last_payload, Some(json!(42)));

    // Only the declared secret was persisted.
    assert_eq!(h.secrets.keys("acme").unwrap(), vec!["api_key"]);

    // The collected payload landed in history.
    let history = h.engine.history("acme", 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload, json!(42));
}

#[tokio::test]
async fn second_run_skips_interaction_once_secret_exists() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/quota")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data": {"used": 1}}"#)
        .expect(1)
        .create_async()
        .await;

    let h = harness();
    h.secrets.put("acme", "api_key", "sk-test").unwrap();
    h.config
        .upsert_source(source_with_flow("acme", quota_flow(&server.url())));

    let outcome = h.engine.run("acme").await.unwrap();
    match outcome {
        RunOutcome::Completed(state) => {
            assert_eq!(state.status, RunStatus::Active);
            assert_eq!(state.last_payload, Some(json!(1)));
        }
        RunOutcome::Dropped => panic!("run was dropped"),
    }
}

#[tokio::test]
async fn failed_run_keeps_previous_payload() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/quota")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data": {"used": 5}}"#)
        .create_async()
        .await;

    let h = harness();
    h.secrets.put("acme", "api_key", "sk-test").unwrap();
    h.config
        .upsert_source(source_with_flow("acme", quota_flow(&server.url())));
    h.engine.run("acme").await.unwrap();

    // Later-registered mocks take precedence: the provider goes down.
    server
        .mock("GET", "/quota")
        .with_status(503)
        .with_body("maintenance")
        .create_async()
        .await;

    match h.engine.run("acme").await.unwrap() {
        RunOutcome::Completed(state) => {
            assert_eq!(state.status, RunStatus::Error);
            assert!(state.message.is_some());
            // Last good data stays visible.
            assert_eq!(state.last_payload, Some(json!(5)));
        }
        RunOutcome::Dropped => panic!("run was dropped"),
    }
}

#[tokio::test]
async fn config_change_invalidates_pending_interaction() {
    let h = harness();
    h.config
        .upsert_source(source_with_flow("acme", quota_flow("http://unused.invalid")));

    // Suspend on the missing key.
    h.engine.run("acme").await.unwrap();
    assert_eq!(
        h.engine.run_state("acme").unwrap().unwrap().status,
        RunStatus::Suspended
    );

    h.engine.mark_config_changed("acme").unwrap();
    let state = h.engine.run_state("acme").unwrap().unwrap();
    assert_eq!(state.status, RunStatus::ConfigChanged);
    assert!(state.pending_interaction.is_none());

    // The snapshot is gone too: a resume has nothing to continue.
    let mut payload = Map::new();
    payload.insert("api_key".to_string(), json!("sk"));
    let outcome = h.engine.resume("acme", payload).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Dropped));
}

#[tokio::test]
async fn disabled_source_is_dropped() {
    let h = harness();
    let mut source = source_with_flow("acme", quota_flow("http://unused.invalid"));
    source.enabled = false;
    h.config.upsert_source(source);

    let outcome = h.engine.run("acme").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Dropped));
    assert!(h.engine.run_state("acme").unwrap().is_none());
}

#[tokio::test]
async fn empty_flow_is_a_config_error() {
    let h = harness();
    h.config.upsert_source(source_with_flow("acme", json!([])));

    match h.engine.run("acme").await.unwrap() {
        RunOutcome::Completed(state) => {
            assert_eq!(state.status, RunStatus::Error);
            assert!(state.message.unwrap().contains("invalid flow configuration"));
        }
        RunOutcome::Dropped => panic!("run was dropped"),
    }
}

fn webview_flow() -> Value {
    json!([
        {
            "id": "scrape",
            "use": "webview",
            "args": {
                "url": "https://portal.example.com/usage",
                "intercept_pattern": "/api/usage"
            },
            "outputs": {"payload": "raw"}
        },
        {
            "id": "pick",
            "use": "extract",
            "args": {"source": "{raw}", "expression": "$.used"}
        }
    ])
}

fn pending_run_id(engine: &CollectorEngine, source_id: &str) -> Uuid {
    let state = engine.run_state(source_id).unwrap().unwrap();
    let interaction = state.pending_interaction.unwrap();
    serde_json::from_value(interaction.data.get("run_id").cloned().unwrap()).unwrap()
}

#[tokio::test]
async fn webview_result_resumes_the_flow() {
    let h = harness();
    h.config.upsert_source(source_with_flow("portal", webview_flow()));

    h.engine.run("portal").await.unwrap();
    let run_id = pending_run_id(&h.engine, "portal");

    let outcome = h
        .engine
        .deliver_webview_result("portal", run_id, Ok(json!({"used": 9})))
        .await
        .unwrap();
    match outcome {
        RunOutcome::Completed(state) => {
            assert_eq!(state.status, RunStatus::Active);
            assert_eq!(state.last_payload, Some(json!(9)));
        }
        RunOutcome::Dropped => panic!("delivery was dropped"),
    }
}

#[tokio::test]
async fn stale_webview_callback_is_discarded() {
    let h = harness();
    h.config.upsert_source(source_with_flow("portal", webview_flow()));

    // First run suspends; a second run supersedes it with a new run id.
    h.engine.run("portal").await.unwrap();
    let old_run_id = pending_run_id(&h.engine, "portal");
    h.engine.run("portal").await.unwrap();
    let new_run_id = pending_run_id(&h.engine, "portal");
    assert_ne!(old_run_id, new_run_id);

    // The window from the first run finally delivers: discarded.
    let outcome = h
        .engine
        .deliver_webview_result("portal", old_run_id, Ok(json!({"used": 1})))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Dropped));
    assert_eq!(
        h.engine.run_state("portal").unwrap().unwrap().status,
        RunStatus::Suspended
    );

    // The current run's delivery still works.
    let outcome = h
        .engine
        .deliver_webview_result("portal", new_run_id, Ok(json!({"used": 2})))
        .await
        .unwrap();
    match outcome {
        RunOutcome::Completed(state) => assert_eq!(state.last_payload, Some(json!(2))),
        RunOutcome::Dropped => panic!("delivery was dropped"),
    }
}

#[tokio::test]
async fn webview_error_marks_the_run_failed() {
    let h = harness();
    h.config.upsert_source(source_with_flow("portal", webview_flow()));

    h.engine.run("portal").await.unwrap();
    let run_id = pending_run_id(&h.engine, "portal");

    let outcome = h
        .engine
        .deliver_webview_result("portal", run_id, Err("navigation timed out".to_string()))
        .await
        .unwrap();
    match outcome {
        RunOutcome::Completed(state) => {
            assert_eq!(state.status, RunStatus::Error);
            assert!(state.message.unwrap().contains("navigation timed out"));
        }
        RunOutcome::Dropped => panic!("delivery was dropped"),
    }
}

#[tokio::test]
async fn delete_source_removes_secrets_and_state() {
    let h = harness();
    h.config
        .upsert_source(source_with_flow("acme", quota_flow("http://unused.invalid")));
    h.secrets.put("acme", "api_key", "sk").unwrap();
    h.engine.run("acme").await.unwrap();

    h.engine.delete_source("acme").unwrap();
    assert!(h.secrets.keys("acme").unwrap().is_empty());
    assert!(h.engine.run_state("acme").unwrap().is_none());
    assert!(h.engine.history("acme", 10).unwrap().is_empty());
}
