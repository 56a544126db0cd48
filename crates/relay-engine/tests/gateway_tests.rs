//! HttpGateway Tests
//!
//! Tests for:
//! - Endpoint URL and headers per message type
//! - Request body shape
//! - HTTP status code propagation and error message extraction
//! - Undecodable responses and transport failures
//! - A bulk job end to end against a mocked gateway

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_common::{
    BackoffPolicy, DispatchJob, JobOutput, JobPayload, MessageContent, PollContent, SendOptions,
};
use relay_engine::{
    DispatchEngine, EngineConfig, Gateway, GatewayError, HttpGateway, HttpGatewayConfig,
    OutboundMessage,
};

const API_KEY: &str = "test-api-key";

fn gateway(base_url: &str) -> HttpGateway {
    HttpGateway::new(
        HttpGatewayConfig::new(base_url, API_KEY).with_timeout(Duration::from_secs(5)),
    )
    .unwrap()
}

fn text(number: &str, message: &str) -> OutboundMessage {
    OutboundMessage::build(number, &MessageContent::text(message))
}

#[tokio::test]
async fn test_text_is_posted_with_api_key() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/message/sendText/inst-1"))
        .and(header("apikey", API_KEY))
        .and(header("Content-Type", "application/json"))
        .and(header("Accept", "application/json"))
        .and(body_json(json!({
            "number": "5511987654321",
            "options": { "presence": "paused", "delay": 1200 },
            "text": "Hello"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "key": { "id": "BAE5F5A632EAE722" },
            "status": "PENDING"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = gateway(&mock_server.uri())
        .send("inst-1", &text("5511987654321", "Hello"))
        .await
        .unwrap();

    assert!(response.is_accepted());
    assert_eq!(response.0["key"]["id"], "BAE5F5A632EAE722");
}

#[tokio::test]
async fn test_base_url_path_is_kept() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/evolution/message/sendPoll/inst-1"))
        .and(body_partial_json(json!({
            "name": "Lunch?",
            "selectableCount": 1,
            "values": ["Yes", "No"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": true })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let poll = MessageContent::Poll(PollContent {
        name: "Lunch?".to_string(),
        selectable_count: Some(1),
        values: vec!["Yes".to_string(), "No".to_string()],
        options: SendOptions::default(),
    });

    let response = gateway(&format!("{}/evolution/", mock_server.uri()))
        .send("inst-1", &OutboundMessage::build("5511987654321", &poll))
        .await
        .unwrap();

    assert!(response.is_accepted());
}

#[tokio::test]
async fn test_status_code_and_message_propagate() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/message/sendText/inst-1"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "status": 404,
            "error": "Not Found",
            "response": { "message": ["The \"inst-1\" instance does not exist"] }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let err = gateway(&mock_server.uri())
        .send("inst-1", &text("5511987654321", "Hello"))
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 404);
    match err {
        GatewayError::Status { message, body, .. } => {
            assert_eq!(message, "Not Found");
            assert!(body.is_some());
        }
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_message_array_is_joined() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "message": ["number is required", "text is required"]
        })))
        .mount(&mock_server)
        .await;

    let err = gateway(&mock_server.uri())
        .send("inst-1", &text("5511987654321", "Hello"))
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 400);
    assert!(err
        .to_string()
        .contains("number is required; text is required"));
}

#[tokio::test]
async fn test_error_without_body_gets_generic_message() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .mount(&mock_server)
        .await;

    let err = gateway(&mock_server.uri())
        .send("inst-1", &text("5511987654321", "Hello"))
        .await
        .unwrap_err();

    match err {
        GatewayError::Status { status_code, message, body } => {
            assert_eq!(status_code, 503);
            assert_eq!(message, "gateway returned HTTP 503");
            assert!(body.is_none());
        }
        other => panic!("expected status error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_undecodable_success_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>ok</html>"))
        .mount(&mock_server)
        .await;

    let err = gateway(&mock_server.uri())
        .send("inst-1", &text("5511987654321", "Hello"))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Decode { status_code: 200, .. }));
}

#[tokio::test]
async fn test_transport_failure_reports_500() {
    // Nothing listens on the discard port
    let err = tokio_test::assert_err!(
        gateway("http://127.0.0.1:9")
            .send("inst-1", &text("5511987654321", "Hello"))
            .await
    );

    assert!(matches!(err, GatewayError::Transport(_)));
    assert_eq!(err.status_code(), 500);
}

#[test]
fn test_invalid_base_url_is_rejected() {
    assert!(HttpGateway::new(HttpGatewayConfig::new("not a url", API_KEY)).is_err());
    assert!(HttpGateway::new(HttpGatewayConfig::new("mailto:ops@example.com", API_KEY)).is_err());
}

#[tokio::test]
async fn test_bulk_job_against_http_gateway() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/message/sendText/inst-1"))
        .and(body_partial_json(json!({ "number": "5511987654321", "text": "Hi Ana" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "key": { "id": "MSG-ANA" }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/message/sendText/inst-1"))
        .and(body_partial_json(json!({ "number": "5521987654321", "text": "Hi Bruno" })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "message": "number does not exist"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = DispatchEngine::new(
        Arc::new(gateway(&mock_server.uri())),
        EngineConfig {
            api_call_delay: Duration::ZERO,
            ..Default::default()
        },
    );

    let payload: JobPayload = serde_json::from_value(json!({
        "mode": "bulk",
        "recipients": [
            { "phone": "11987654321", "variables": { "name": "Ana" } },
            { "phone": "21987654321", "variables": { "name": "Bruno" } }
        ],
        "content": { "type": "text", "message": "Hi {{name}}" }
    }))
    .unwrap();
    let job = DispatchJob {
        id: "job-http".to_string(),
        channel_instance: "inst-1".to_string(),
        payload,
        attempts_made: 1,
        max_attempts: 3,
        backoff: BackoffPolicy::default(),
        lease_token: "lease".to_string(),
    };

    let summary = match engine.execute(&job).await.unwrap() {
        JobOutput::Summary(summary) => summary,
        other => panic!("expected a summary, got {:?}", other),
    };

    assert_eq!(summary.successful_sends, 1);
    assert_eq!(summary.failed_sends, 1);
    assert_eq!(
        summary.results[0].provider_response,
        Some(json!({ "key": { "id": "MSG-ANA" } }))
    );
    assert!(summary.results[1]
        .error_message
        .as_deref()
        .unwrap()
        .contains("number does not exist"));
}
