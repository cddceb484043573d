mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    response::Response,
};
use common::{TestServer, ASSET, PAY_TO, PRICE};
use ethers::types::{H256, U256};
use paygate::{
    client::{Agent, Endpoint, PaymentClient},
    models::{
        decode_header, encode_header, LifecycleEvent, PaymentProof, PaymentRequired,
        SettleResult, AGENT_ID_HEADER, PAYMENT_REQUIRED_HEADER, PAYMENT_RESPONSE_HEADER,
        PAYMENT_SIGNATURE_HEADER,
    },
    services::{ledger::format_hash, MetricsCollector},
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn post(path: &str, text: &str, proof: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(AGENT_ID_HEADER, "agent-test");
    if let Some(proof) = proof {
        builder = builder.header(PAYMENT_SIGNATURE_HEADER, proof);
    }
    builder
        .body(Body::from(json!({ "text": text }).to_string()))
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn challenge_of(response: &Response) -> PaymentRequired {
    let header = response
        .headers()
        .get(PAYMENT_REQUIRED_HEADER)
        .expect("402 carries a challenge")
        .to_str()
        .unwrap();
    decode_header(header).unwrap()
}

async fn pay(server: &TestServer, amount: u64) -> H256 {
    let wallet = server.funded_wallet(1_000);
    server
        .ledger
        .submit_transfer(&wallet, ASSET, PAY_TO, U256::from(amount))
        .await
        .unwrap()
}

async fn proof_for(server: &TestServer, path: &str, hash: H256) -> String {
    let response = server.router().oneshot(post(path, "hi", None)).await.unwrap();
    let challenge = challenge_of(&response);
    let accepted = challenge.accepts[0].clone();
    encode_header(&PaymentProof::new(challenge.resource, accepted, format_hash(&hash))).unwrap()
}

#[tokio::test]
async fn test_unpaid_request_gets_challenge() {
    let server = TestServer::new();
    let response = server.router().oneshot(post("/api/echo", "hi", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let challenge = challenge_of(&response);
    assert_eq!(challenge.accepts.len(), 1);
    assert_eq!(challenge.accepts[0].amount, PRICE);
    assert_eq!(challenge.accepts[0].pay_to, PAY_TO);
    assert_eq!(challenge.resource.url, "/api/echo");
    assert!(challenge.error.is_none());

    let body = body_json(response).await;
    assert_eq!(body["errorCode"], "PAYMENT_REQUIRED");
    assert!(server.state.events.is_empty());
}

#[tokio::test]
async fn test_paid_request_is_served_and_settled() {
    let server = TestServer::new();
    let hash = pay(&server, 100).await;
    let proof = proof_for(&server, "/api/reverse", hash).await;

    let response = server
        .router()
        .oneshot(post("/api/reverse", "abc", Some(&proof)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let settlement: SettleResult = decode_header(
        response
            .headers()
            .get(PAYMENT_RESPONSE_HEADER)
            .unwrap()
            .to_str()
            .unwrap(),
    )
    .unwrap();
    assert!(settlement.success);
    assert_eq!(settlement.transaction_ref, format_hash(&hash));
    assert_eq!(settlement.network, "testnet");

    let body = body_json(response).await;
    assert_eq!(body["data"]["result"], "cba");

    let kinds: Vec<&str> = server
        .state
        .events
        .history()
        .iter()
        .map(|e| match e {
            LifecycleEvent::PaymentSubmitted { agent_id, .. } => {
                assert_eq!(agent_id, "agent-test");
                "submitted"
            }
            LifecycleEvent::PaymentConfirmed { .. } => "confirmed",
            LifecycleEvent::RequestServed { .. } => "served",
            _ => "other",
        })
        .collect();
    assert_eq!(kinds, vec!["submitted", "confirmed", "served"]);
}

#[tokio::test]
async fn test_proof_cannot_be_reused_on_another_route() {
    let server = TestServer::new();
    let hash = pay(&server, 100).await;
    let proof = proof_for(&server, "/api/echo", hash).await;

    let first = server.router().oneshot(post("/api/echo", "hi", Some(&proof))).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = server
        .router()
        .oneshot(post("/api/uppercase", "hi", Some(&proof)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(challenge_of(&second).error.as_deref(), Some("already_used"));
    let body = body_json(second).await;
    assert_eq!(body["reason"], "already_used");
}

#[tokio::test]
async fn test_underpayment_is_rejected_without_consuming() {
    let server = TestServer::new();
    let hash = pay(&server, 50).await;
    let proof = proof_for(&server, "/api/echo", hash).await;

    let response = server.router().oneshot(post("/api/echo", "hi", Some(&proof))).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["reason"], "amount_insufficient");

    let used = server
        .state
        .gate
        .facilitator()
        .replay()
        .contains(&format_hash(&hash))
        .await
        .unwrap();
    assert!(!used);
}

#[tokio::test]
async fn test_garbage_signature_is_a_verification_error() {
    let server = TestServer::new();
    let response = server
        .router()
        .oneshot(post("/api/echo", "hi", Some("not-base64!")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["reason"], "verification_error");
}

#[tokio::test]
async fn test_handler_failure_leaves_proof_unconsumed() {
    let server = TestServer::new();
    let hash = pay(&server, 100).await;
    let proof = proof_for(&server, "/api/echo", hash).await;

    let failed = server.router().oneshot(post("/api/echo", "", Some(&proof))).await.unwrap();
    assert_eq!(failed.status(), StatusCode::BAD_REQUEST);
    assert!(failed.headers().get(PAYMENT_RESPONSE_HEADER).is_none());
    assert!(server
        .state
        .events
        .history()
        .iter()
        .any(|e| matches!(e, LifecycleEvent::Error { .. })));

    let retried = server.router().oneshot(post("/api/echo", "hi", Some(&proof))).await.unwrap();
    assert_eq!(retried.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_free_routes_bypass_payment() {
    let server = TestServer::new();
    let response = server
        .router()
        .oneshot(
            Request::builder()
                .uri("/facilitator/supported")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["kinds"][0]["scheme"], "exact");
    assert_eq!(body["kinds"][0]["network"], "testnet");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_pays_over_http() {
    let server = TestServer::new();
    let (addr, _shutdown) = server.serve().await;
    let (metrics, _task) = MetricsCollector::spawn(100);

    let payments = PaymentClient::new(
        server.funded_wallet(1_000),
        server.ledger.clone(),
        Duration::from_secs(5),
    );
    let agent = Agent::new(
        "agent-1".to_string(),
        &format!("http://{}", addr),
        reqwest::Client::new(),
        payments,
        Arc::from(vec![Endpoint::post("/api/echo", 1.0)]),
        1.0,
        1,
        metrics,
    );

    let tx_hash = agent
        .request(&Endpoint::post("/api/uppercase", 1.0), &json!({ "text": "hi" }))
        .await
        .unwrap()
        .expect("paid endpoint returns a hash");
    assert_eq!(server.ledger.balance(ASSET, PAY_TO), U256::from(100u64));

    let result = agent.run_once().await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.endpoint, "/api/echo");
    assert_ne!(result.tx_hash.as_deref(), Some(tx_hash.as_str()));
    assert_eq!(server.ledger.balance(ASSET, PAY_TO), U256::from(200u64));
}
