use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use devstack_secrets::error::PipelineError;
use devstack_secrets::materials::UnsealKeySet;
use devstack_secrets::unseal::{UnsealCoordinator, UnsealOutcome, UnsealPhase};
use devstack_secrets::utils::RetryPolicy;
use devstack_secrets::vault::VaultClient;
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;

const POLICY: RetryPolicy = RetryPolicy {
    attempts: 3,
    delay: Duration::from_millis(10),
};

const SHARES: [&str; 5] = ["share-1", "share-2", "share-3", "share-4", "share-5"];

fn key_set(count: usize) -> UnsealKeySet {
    UnsealKeySet::new(
        SHARES[..count].iter().map(ToString::to_string).collect(),
        3,
    )
}

async fn stub_seal_status(server: &MockServer, progress: u32) {
    Mock::given(method("GET"))
        .and(path("/v1/sys/seal-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sealed": true, "t": 3, "n": 5, "progress": progress
        })))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/seal-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sealed": false, "t": 3, "n": 5, "progress": 0
        })))
        .mount(server)
        .await;
}

async fn stub_unseal(server: &MockServer, share: &str, response: serde_json::Value, calls: u64) {
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .and(body_json(json!({ "key": share })))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .expect(calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn uninitialized_backend_awaits_initialization() {
    let server = MockServer::start().await;
    support::stub_health(&server, 501).await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = VaultClient::new(&server.uri(), Duration::from_secs(2)).expect("client");
    let loaded = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&loaded);
    let mut coordinator = UnsealCoordinator::new(&client, POLICY);
    let outcome = coordinator
        .run(|| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(key_set(5))
        })
        .await
        .expect("coordinator");

    assert_eq!(outcome, UnsealOutcome::AwaitingInitialization);
    assert_eq!(coordinator.phase(), UnsealPhase::AwaitingInitialization);
    assert!(!loaded.load(Ordering::SeqCst));
}

#[tokio::test]
async fn sealed_backend_gets_exactly_threshold_shares() {
    let server = MockServer::start().await;
    support::stub_health(&server, 503).await;
    stub_seal_status(&server, 0).await;
    stub_unseal(&server, "share-1", json!({ "sealed": true, "t": 3, "progress": 1 }), 1).await;
    stub_unseal(&server, "share-2", json!({ "sealed": true, "t": 3, "progress": 2 }), 1).await;
    stub_unseal(&server, "share-3", json!({ "sealed": false, "t": 3, "progress": 0 }), 1).await;
    stub_unseal(&server, "share-4", json!({ "sealed": false }), 0).await;
    stub_unseal(&server, "share-5", json!({ "sealed": false }), 0).await;

    let client = VaultClient::new(&server.uri(), Duration::from_secs(2)).expect("client");
    let mut coordinator = UnsealCoordinator::new(&client, POLICY);
    let outcome = coordinator
        .run(|| async { Ok(key_set(5)) })
        .await
        .expect("coordinator");

    assert_eq!(outcome, UnsealOutcome::Unsealed { submitted: 3 });
    assert_eq!(coordinator.phase(), UnsealPhase::UnsealedIdle);
}

#[tokio::test]
async fn unsealed_backend_submits_nothing() {
    let server = MockServer::start().await;
    support::stub_health(&server, 200).await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = VaultClient::new(&server.uri(), Duration::from_secs(2)).expect("client");
    let outcome = UnsealCoordinator::new(&client, POLICY)
        .run(|| async { Ok(key_set(5)) })
        .await
        .expect("coordinator");
    assert_eq!(outcome, UnsealOutcome::AlreadyUnsealed);
}

#[tokio::test]
async fn too_few_shares_fails_before_submitting() {
    let server = MockServer::start().await;
    support::stub_health(&server, 503).await;
    stub_seal_status(&server, 0).await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = VaultClient::new(&server.uri(), Duration::from_secs(2)).expect("client");
    let err = UnsealCoordinator::new(&client, POLICY)
        .run(|| async { Ok(key_set(2)) })
        .await
        .expect_err("two shares cannot meet threshold three");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn partial_progress_only_submits_remaining_shares() {
    let server = MockServer::start().await;
    support::stub_health(&server, 503).await;
    stub_seal_status(&server, 2).await;
    stub_unseal(&server, "share-1", json!({ "sealed": false, "progress": 0 }), 1).await;
    stub_unseal(&server, "share-2", json!({ "sealed": false }), 0).await;

    let client = VaultClient::new(&server.uri(), Duration::from_secs(2)).expect("client");
    let outcome = UnsealCoordinator::new(&client, POLICY)
        .run(|| async { Ok(key_set(1)) })
        .await
        .expect("one share completes the threshold");
    assert_eq!(outcome, UnsealOutcome::Unsealed { submitted: 1 });
}

#[tokio::test]
async fn unreachable_backend_exhausts_retry_budget() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = format!("http://{}", listener.local_addr().expect("addr"));
    drop(listener);

    let client = VaultClient::new(&addr, Duration::from_millis(200)).expect("client");
    let err = UnsealCoordinator::new(&client, POLICY)
        .run(|| async { Ok(key_set(5)) })
        .await
        .expect_err("nothing is listening");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Unreachable { attempts: 3, .. })
    ));
}
