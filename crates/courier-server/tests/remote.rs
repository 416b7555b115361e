use std::time::Duration;

use courier_contracts::{
    ActionKind, ActionRequest, Credential, EgressDescriptor, FatalSignal, RemoteOutcome,
    CONTRACT_VERSION,
};
use courier_server::remote::perform_with_timeout;
use courier_server::{HttpRemoteService, RemoteActionService};
use httpmock::prelude::*;
use serde_json::json;

fn send_request() -> ActionRequest {
    ActionRequest {
        v: CONTRACT_VERSION,
        action: ActionKind::Send,
        credential: Credential::new("sessionid=abc"),
        destination: "bob".to_string(),
        payload: json!({"text": "hello"}),
        egress: Some(EgressDescriptor {
            host: "10.0.0.1".to_string(),
            port: 8080,
            username: Some("u".to_string()),
            password: Some("p".to_string()),
        }),
    }
}

fn client(server: &MockServer, timeout_ms: u64) -> HttpRemoteService {
    HttpRemoteService::new(
        &format!("{}/act", server.base_url()),
        Duration::from_millis(timeout_ms),
    )
    .expect("http remote should build")
}

#[tokio::test]
async fn posts_action_and_parses_success() {
    let server = MockServer::start_async().await;
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/act")
            .body_includes("\"action\":\"send\"")
            .body_includes("\"credential\":\"sessionid=abc\"")
            .body_includes("\"host\":\"10.0.0.1\"");
        then.status(200)
            .json_body(json!({"outcome": "success", "detail": {"message_id": "m1"}}));
    });

    let outcome = client(&server, 2_000).perform(send_request()).await;
    mock.assert();
    assert_eq!(
        outcome,
        RemoteOutcome::Success {
            detail: json!({"message_id": "m1"})
        }
    );
}

#[tokio::test]
async fn fatal_response_carries_signal() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/act");
        then.status(200).json_body(json!({
            "outcome": "fatal_error",
            "detail": {"signal": "checkpoint_required", "message": "verify account"}
        }));
    });

    let outcome = client(&server, 2_000).perform(send_request()).await;
    assert_eq!(
        outcome,
        RemoteOutcome::FatalError {
            signal: FatalSignal::Banned,
            message: "verify account".to_string()
        }
    );
}

#[tokio::test]
async fn non_success_status_is_recoverable() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/act");
        then.status(503).body("maintenance");
    });

    match client(&server, 2_000).perform(send_request()).await {
        RemoteOutcome::RecoverableError { message } => {
            assert!(message.starts_with("remote_http_error"));
            assert!(message.contains("maintenance"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn malformed_body_is_contract_invalid() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/act");
        then.status(200).json_body(json!({"outcome": "maybe"}));
    });

    match client(&server, 2_000).perform(send_request()).await {
        RemoteOutcome::RecoverableError { message } => {
            assert!(message.starts_with("remote_contract_invalid"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn slow_remote_times_out_as_recoverable() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/act");
        then.status(200)
            .delay(Duration::from_millis(300))
            .json_body(json!({"outcome": "success"}));
    });

    let remote = client(&server, 5_000);
    let outcome = perform_with_timeout(&remote, send_request(), Duration::from_millis(50)).await;
    match outcome {
        RemoteOutcome::RecoverableError { message } => {
            assert!(message.starts_with("remote_timeout"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn client_timeout_is_reported_as_timeout() {
    let server = MockServer::start_async().await;
    server.mock(|when, then| {
        when.method(POST).path("/act");
        then.status(200)
            .delay(Duration::from_millis(300))
            .json_body(json!({"outcome": "success"}));
    });

    match client(&server, 50).perform(send_request()).await {
        RemoteOutcome::RecoverableError { message } => {
            assert!(message.starts_with("remote_timeout"));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}
