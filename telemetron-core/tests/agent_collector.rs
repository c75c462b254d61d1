/*!
Agent-to-collector tests over a real socket.

The collector runs on an ephemeral port; the agent uses its stock HTTP
transport, so these cover the wire format end to end: gzip bodies, HMAC
signatures and the batch endpoint.
*/

use std::sync::Arc;
use std::time::Duration;
use telemetron_core::agent::sampler::POLL_COUNT;
use telemetron_core::{
    create_router, Agent, AgentConfig, AppState, Metric, MemoryStore, MetricStore, Signer,
    SIGNATURE_HEADER,
};
use tokio::net::TcpListener;

async fn spawn_collector(state: AppState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr.to_string()
}

async fn wait_for_poll_count(store: &MemoryStore) -> Option<Metric> {
    for _ in 0..300 {
        if let Some(metric) = store.get(POLL_COUNT).await.unwrap() {
            return Some(metric);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

#[tokio::test]
async fn test_agent_reports_to_collector() {
    let store = Arc::new(MemoryStore::new());
    let address = spawn_collector(AppState::new(store.clone())).await;

    let config = AgentConfig {
        address,
        poll_interval: Duration::from_millis(20),
        report_interval: Duration::from_millis(50),
        ..AgentConfig::default()
    };
    let handle = Agent::new(&config).unwrap().start();

    let poll_count = wait_for_poll_count(&store).await;
    handle.stop().await;

    let poll_count = poll_count.expect("collector never received PollCount");
    assert!(poll_count.as_counter().unwrap() >= 1);

    let all = store.all().await.unwrap();
    assert!(all.contains_key("RandomValue"));
    assert!(all.contains_key("TotalMemory"));
}

#[tokio::test]
async fn test_signed_agent_reports_to_signed_collector() {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(store.clone()).with_signer(Signer::new("shared-secret").unwrap());
    let address = spawn_collector(state).await;

    let config = AgentConfig {
        address,
        poll_interval: Duration::from_millis(20),
        report_interval: Duration::from_millis(50),
        secret_key: Some("shared-secret".to_string()),
        ..AgentConfig::default()
    };
    let handle = Agent::new(&config).unwrap().start();

    let poll_count = wait_for_poll_count(&store).await;
    handle.stop().await;
    assert!(poll_count.is_some());
}

#[tokio::test]
async fn test_collector_rejects_wrong_signature_over_http() {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(store.clone()).with_signer(Signer::new("shared-secret").unwrap());
    let address = spawn_collector(state).await;

    let body = r#"[{"id":"hits","type":"counter","delta":1}]"#;
    let wrong = Signer::new("other-secret").unwrap().sign(body.as_bytes());

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{address}/updates/"))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, wrong)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(store.get("hits").await.unwrap(), None);

    let right = Signer::new("shared-secret").unwrap().sign(body.as_bytes());
    let response = client
        .post(format!("http://{address}/updates/"))
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .header(SIGNATURE_HEADER, right)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(response.headers().contains_key(SIGNATURE_HEADER));
    assert_eq!(store.get("hits").await.unwrap(), Some(Metric::counter("hits", 1)));
}
