//! Stamped request + activity polling against a mock custody API.

use std::sync::Arc;

use custodykit_core::stamper::{ApiKeyPair, ApiKeyStamper, API_KEY_STAMP_HEADER};
use custodykit_core::{
    ActivityStatus, ApiConfig, CustodyClient, CustodyKitError, PollerConfig,
};

fn client_for(server: &mockito::ServerGuard) -> CustodyClient {
    let config = ApiConfig::new(server.url(), "org-1").unwrap();
    let stamper = Arc::new(ApiKeyStamper::new(ApiKeyPair::generate()));
    CustodyClient::new(config, stamper)
}

fn activity_body(id: &str, status: &str, result: Option<serde_json::Value>) -> String {
    let mut activity = serde_json::json!({
        "id": id,
        "type": "ACTIVITY_TYPE_SIGN_RAW_PAYLOAD",
        "status": status,
    });
    if let Some(result) = result {
        activity["result"] = result;
    }
    serde_json::json!({ "activity": activity }).to_string()
}

#[tokio::test]
async fn submit_surfaces_consensus_needed_with_activity_id() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/public/v1/submit/sign_raw_payload")
        .match_header(API_KEY_STAMP_HEADER, mockito::Matcher::Regex(".+".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(activity_body("act-7", "CONSENSUS_NEEDED", None))
        .create_async()
        .await;

    let client = client_for(&server);
    let err = client
        .submit(
            "/public/v1/submit/sign_raw_payload",
            &serde_json::json!({"organizationId": "org-1", "payload": "deadbeef"}),
        )
        .await
        .unwrap_err();

    let (activity_id, status) = match err {
        CustodyKitError::ConsensusNeeded {
            activity_id,
            status,
        } => (activity_id, status),
        other => panic!("expected ConsensusNeeded, got {other:?}"),
    };
    assert_eq!(activity_id, "act-7");
    assert_eq!(status, ActivityStatus::ConsensusNeeded);
    mock.assert_async().await;
}

#[tokio::test]
async fn submit_returns_terminal_activity_directly() {
    let mut server = mockito::Server::new_async().await;
    let activity_id = uuid::Uuid::new_v4().to_string();
    server
        .mock("POST", "/public/v1/submit/sign_raw_payload")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(activity_body(
            &activity_id,
            "COMPLETED",
            Some(serde_json::json!({"signature": "3044..."})),
        ))
        .create_async()
        .await;

    let client = client_for(&server);
    let activity = client
        .submit(
            "/public/v1/submit/sign_raw_payload",
            &serde_json::json!({"organizationId": "org-1", "payload": "deadbeef"}),
        )
        .await
        .unwrap();

    assert_eq!(activity.id, activity_id);
    assert_eq!(activity.status, ActivityStatus::Completed);
    assert_eq!(activity.result.unwrap()["signature"], "3044...");
}

#[tokio::test]
async fn wait_for_activity_resolves_on_terminal_status() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/public/v1/query/get_activity")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "organizationId": "org-1",
            "activityId": "act-7",
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(activity_body(
            "act-7",
            "COMPLETED",
            Some(serde_json::json!({"signature": "3045..."})),
        ))
        .create_async()
        .await;

    let client = client_for(&server);
    let activity = client
        .wait_for_activity("act-7", PollerConfig::default())
        .await
        .unwrap();

    assert_eq!(activity.status, ActivityStatus::Completed);
    assert!(activity.result.is_some());
    mock.assert_async().await;
}

#[tokio::test]
async fn server_errors_carry_url_and_status() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/public/v1/query/get_activity")
        .with_status(404)
        .with_body("no such activity")
        .create_async()
        .await;

    let client = client_for(&server);
    let err = client.get_activity("act-404").await.unwrap_err();

    let (status, error) = match err {
        CustodyKitError::Network { status, error, .. } => (status, error),
        other => panic!("expected Network error, got {other:?}"),
    };
    assert_eq!(status, Some(404));
    assert!(error.contains("no such activity"));
}

#[tokio::test]
async fn rejected_activity_fails_polling() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/public/v1/query/get_activity")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(activity_body("act-9", "REJECTED", None))
        .create_async()
        .await;

    let client = client_for(&server);
    let err = client
        .wait_for_activity("act-9", PollerConfig::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CustodyKitError::ActivityFailed {
            status: ActivityStatus::Rejected,
            ..
        }
    ));
}
