//! End-to-end tests through [`Application`]: HTTP API, daemon, providers and ledger together.

use std::time::Duration;

use axum_test::TestServer;
use serde_json::{Value, json};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::Application;
use crate::auth::USER_ID_HEADER;
use crate::ledger::TransactionKind;
use crate::provider::{HttpProviderConfig, MockProvider, ProviderError, ProviderRegistry};
use crate::test_utils::{create_test_config, funded_user};
use crate::types::UserId;

/// Poll the status endpoint until the job is completed or failed and its refund has landed.
async fn poll_until_terminal(server: &TestServer, user: UserId, job_id: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let body: Value = server
                .get(&format!("/generate/status/{job_id}"))
                .add_header(USER_ID_HEADER, user.to_string())
                .await
                .json();
            let terminal = body["status"] == "completed" || body["status"] == "failed";
            if terminal && body["refundPending"] != true {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}

async fn submit(server: &TestServer, user: UserId, operation: &str, input: Value) -> String {
    let response = server
        .post(&format!("/generate/{operation}"))
        .add_header(USER_ID_HEADER, user.to_string())
        .json(&json!({ "input": input }))
        .await;
    response.assert_status(axum::http::StatusCode::ACCEPTED);
    response.json::<Value>()["jobId"].as_str().unwrap().to_string()
}

/// A vendor outage on the primary falls through to the backup within one attempt.
#[test_log::test(tokio::test)]
async fn test_e2e_image_generation_with_vendor_fallback() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/image"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(1)
        .mount(&primary)
        .await;

    let backup = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/image"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "output": {"url": "https://cdn.example/spring-sale.png", "width": 1024, "height": 1024}
        })))
        .expect(1)
        .mount(&backup)
        .await;

    let mut config = create_test_config();
    for (name, server) in [("primary", &primary), ("backup", &backup)] {
        config.providers.insert(
            name.to_string(),
            HttpProviderConfig {
                endpoint: server.uri(),
                api_key: Some("test-key".to_string()),
                timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(10),
            },
        );
    }
    config.chains.image = vec!["primary".to_string(), "backup".to_string()];

    let app = Application::new(config).await.expect("Failed to create application");
    let state = app.state().clone();
    let (server, bg_services) = app.into_test_server();

    let user = funded_user(state.ledger.as_ref(), 5).await;
    let job_id = submit(&server, user, "image", json!({"prompt": "Spring sale banner"})).await;

    let status = poll_until_terminal(&server, user, &job_id).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["progress"], 100);
    assert_eq!(status["provider"], "backup");
    assert_eq!(status["attempts"], 1);
    assert_eq!(status["result"]["url"], "https://cdn.example/spring-sale.png");

    let balance: Value = server
        .get("/credits/balance")
        .add_header(USER_ID_HEADER, user.to_string())
        .await
        .json();
    assert_eq!(balance["balance"], 4);

    let txs = state.ledger.list_transactions(user, 0, 10).await.unwrap();
    assert_eq!(txs.iter().filter(|tx| tx.kind == TransactionKind::Reserve).count(), 1);
    assert!(txs.iter().all(|tx| tx.kind != TransactionKind::Refund));

    bg_services.shutdown().await;
}

/// Exhausting every attempt fails the job once and returns the credits once.
#[test_log::test(tokio::test)]
async fn test_e2e_failed_job_refunds_credits() {
    let voice = MockProvider::new("voice");
    voice.always(Err(ProviderError::UpstreamUnavailable("503 Service Unavailable".into())));
    let mut registry = ProviderRegistry::new();
    registry.register(std::sync::Arc::new(voice.clone()));

    let mut config = create_test_config();
    config.chains.speech = vec!["voice".to_string()];

    let app = Application::with_registry(config, registry)
        .await
        .expect("Failed to create application");
    let state = app.state().clone();
    let (server, bg_services) = app.into_test_server();

    let user = funded_user(state.ledger.as_ref(), 2).await;
    let job_id = submit(&server, user, "speech", json!({"text": "Doors open at nine"})).await;

    let status = poll_until_terminal(&server, user, &job_id).await;
    assert_eq!(status["status"], "failed");
    assert_eq!(status["attempts"], 3);
    assert_eq!(
        status["error"],
        "voice: upstream unavailable: 503 Service Unavailable (credits refunded)"
    );
    assert!(status.get("result").is_none());
    assert_eq!(voice.call_count(), 3);
    assert_eq!(state.ledger.get_balance(user).await.unwrap(), 2);

    let page: Value = server
        .get("/credits/transactions")
        .add_header(USER_ID_HEADER, user.to_string())
        .await
        .json();
    let kinds: Vec<&str> = page["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tx| tx["kind"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["refund", "reserve", "bonus"]);

    bg_services.shutdown().await;
}

/// New callers start with the configured credits and can spend them straight away.
#[test_log::test(tokio::test)]
async fn test_e2e_first_request_opens_account() {
    let copywriter = MockProvider::new("copywriter");
    copywriter.always(Ok(json!({"variations": ["Fresh picks daily", "Farm to table, fast", "Taste the season"]})));
    let mut registry = ProviderRegistry::new();
    registry.register(std::sync::Arc::new(copywriter));

    let mut config = create_test_config();
    config.chains.text = vec!["copywriter".to_string()];
    config.credits.initial_credits = Some(10);

    let app = Application::with_registry(config, registry)
        .await
        .expect("Failed to create application");
    let state = app.state().clone();
    let (server, bg_services) = app.into_test_server();

    let user = Uuid::new_v4();
    let job_id = submit(&server, user, "text-variations", json!({"prompt": "Grocery delivery", "count": 3})).await;

    let status = poll_until_terminal(&server, user, &job_id).await;
    assert_eq!(status["status"], "completed");
    assert_eq!(status["result"]["variations"].as_array().unwrap().len(), 3);
    assert_eq!(state.ledger.get_balance(user).await.unwrap(), 8);

    bg_services.shutdown().await;
}
