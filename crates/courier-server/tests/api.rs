use axum::body::Body;
use axum::http::{Request, StatusCode};
use courier_config::{Config, Dispatch, Import, Logging, Policy, Remote, Server, Store};
use courier_server::build_app;
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn test_config() -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
        },
        remote: Remote {
            mode: "dry_run".to_string(),
            endpoint: None,
            timeout_ms: 2_000,
        },
        policy: Policy::default(),
        dispatch: Dispatch {
            explicit_delay_ms: 0,
            pool_delay_ms: 0,
            ..Dispatch::default()
        },
        import: Import::default(),
        logging: Logging::default(),
    }
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn import_two(app: &axum::Router) -> Vec<String> {
    let (status, body) = send(
        app,
        "POST",
        "/v1/identities/import",
        Some(json!({
            "tenant_id": "tenant-a",
            "credentials": [
                {"label": "@alice", "credential": "sessionid=alice-secret"},
                {"label": "bob", "credential": "sessionid=bob-secret"},
                {"label": "ALICE", "credential": "sessionid=other"}
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["imported"], 2);
    assert_eq!(body["duplicates_artifact"], "ALICE");
    assert_eq!(body["validation"]["activated"], 2);
    body["identity_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn healthz_ok() {
    let app = build_app(test_config()).await.unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn identity_listing_never_returns_credentials() {
    let app = build_app(test_config()).await.unwrap();
    import_two(&app).await;

    let (status, body) = send(&app, "GET", "/v1/identities?tenant_id=tenant-a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);
    assert!(!body.to_string().contains("secret"));
    assert_eq!(body[0]["status"], "active");
    assert_eq!(body[0]["label"], "alice");
}

#[tokio::test]
async fn explicit_batch_returns_report_and_failure_csv() {
    let app = build_app(test_config()).await.unwrap();
    let ids = import_two(&app).await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/batches",
        Some(json!({
            "tenant_id": "tenant-a",
            "identity_ids": ids,
            "action": "send",
            "targets": {"mode": "explicit", "destinations": ["carol", "dave", "erin"]},
            "payload": {"text": "hi"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report"]["mode"], "explicit");
    assert_eq!(body["report"]["attempted"], 3);
    assert_eq!(body["report"]["succeeded"], 3);
    assert_eq!(body["report"]["items"][2]["identity_id"], ids[0].as_str());
    assert_eq!(body["failure_log_csv"], "destination,identity_id,error\r\n");
    assert_eq!(
        body["report"]["payload_sha256"].as_str().unwrap().len(),
        64
    );

    let (status, body) = send(&app, "GET", "/v1/identities/eligibility?tenant_id=tenant-a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["eligible"].as_array().unwrap().len(), 0);
    assert_eq!(body["excluded"][0]["reason"], "cooling_down");
}

#[tokio::test]
async fn batch_without_eligible_identities_is_conflict() {
    let app = build_app(test_config()).await.unwrap();
    let (status, body) = send(
        &app,
        "POST",
        "/v1/batches",
        Some(json!({
            "tenant_id": "tenant-a",
            "action": "send",
            "targets": {"mode": "explicit", "destinations": ["carol"]}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "admission.no_eligible_identities");
}

#[tokio::test]
async fn empty_destination_list_is_validation_error() {
    let app = build_app(test_config()).await.unwrap();
    import_two(&app).await;
    let (status, body) = send(
        &app,
        "POST",
        "/v1/batches",
        Some(json!({
            "tenant_id": "tenant-a",
            "action": "post",
            "targets": {"mode": "explicit", "destinations": []}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn pool_batch_marks_targets_used() {
    let app = build_app(test_config()).await.unwrap();
    import_two(&app).await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/targets",
        Some(json!({"tenant_id": "tenant-a", "labels": ["@zed", "Zed", "yan", ""]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"inserted": 2, "duplicates": 1, "invalid": 1}));

    let (status, body) = send(
        &app,
        "POST",
        "/v1/batches",
        Some(json!({
            "tenant_id": "tenant-a",
            "action": "send",
            "targets": {"mode": "pool"},
            "payload": {"text": "hi"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["report"]["succeeded"], 2);

    let (status, body) = send(&app, "GET", "/v1/targets?tenant_id=tenant-a&status=used", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, body) = send(&app, "GET", "/v1/targets?tenant_id=tenant-a&status=done", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");

    let (status, body) = send(
        &app,
        "POST",
        "/v1/targets/reset-problems",
        Some(json!({"tenant_id": "tenant-a"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reset"], 0);
}

#[tokio::test]
async fn egress_lease_flow_over_http() {
    let app = build_app(test_config()).await.unwrap();
    let ids = import_two(&app).await;

    let (status, body) = send(
        &app,
        "POST",
        "/v1/egress/import",
        Some(json!({
            "tenant_id": "tenant-a",
            "lines": ["u:hunter2@10.0.0.1:8080", "nonsense", "10.0.0.1:8080:u:hunter2"]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["admitted"], 1);
    assert_eq!(body["duplicates"], 1);
    assert_eq!(body["rejected_lines"][0]["line"], 2);

    let (_, listed) = send(&app, "GET", "/v1/egress?tenant_id=tenant-a", None).await;
    assert!(!listed.to_string().contains("hunter2"));
    assert_eq!(listed[0]["has_password"], true);
    let egress_id = listed[0]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        "POST",
        "/v1/egress/lease",
        Some(json!({"tenant_id": "tenant-a", "egress_id": egress_id, "identity_id": ids[0]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "leased");

    let (status, body) = send(
        &app,
        "POST",
        "/v1/egress/lease",
        Some(json!({"tenant_id": "tenant-a", "egress_id": egress_id, "identity_id": ids[1]})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "admission.already_leased");

    let (status, body) = send(
        &app,
        "POST",
        "/v1/egress/release",
        Some(json!({"tenant_id": "tenant-a", "egress_id": egress_id})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["released"], true);
}

#[tokio::test]
async fn cancelling_unknown_batch_is_not_found() {
    let app = build_app(test_config()).await.unwrap();
    let (status, body) = send(&app, "POST", "/v1/batches/bat_nope/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn unknown_request_fields_are_rejected() {
    let app = build_app(test_config()).await.unwrap();
    let (status, _) = send(
        &app,
        "POST",
        "/v1/batches",
        Some(json!({
            "tenant_id": "tenant-a",
            "action": "send",
            "targets": {"mode": "pool"},
            "priority": "high"
        })),
    )
    .await;
    assert!(status.is_client_error());
}
