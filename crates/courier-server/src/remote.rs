use std::time::Duration;

use async_trait::async_trait;
use courier_config::Remote;
use courier_contracts::{ActionKind, ActionRequest, ActionResponse, RemoteOutcome};
use courier_kernel::parse_action_response;
use reqwest::Client;
use serde_json::json;

pub const REMOTE_TIMEOUT: &str = "remote_timeout";
pub const REMOTE_TRANSPORT_ERROR: &str = "remote_transport_error";
pub const REMOTE_HTTP_ERROR: &str = "remote_http_error";
pub const REMOTE_CONTRACT_INVALID: &str = "remote_contract_invalid";
pub const EGRESS_UNAVAILABLE: &str = "egress_unavailable";

/// The opaque "perform this action for this identity" boundary.
#[async_trait]
pub trait RemoteActionService: Send + Sync {
    async fn perform(&self, request: ActionRequest) -> RemoteOutcome;
}

pub struct HttpRemoteService {
    endpoint: String,
    client: Client,
}

impl HttpRemoteService {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

#[async_trait]
impl RemoteActionService for HttpRemoteService {
    async fn perform(&self, request: ActionRequest) -> RemoteOutcome {
        let response = match self.client.post(&self.endpoint).json(&request).send().await {
            Ok(v) => v,
            Err(err) if err.is_timeout() => {
                return recoverable(REMOTE_TIMEOUT, &err.to_string());
            }
            Err(err) => return recoverable(REMOTE_TRANSPORT_ERROR, &err.to_string()),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return recoverable(REMOTE_HTTP_ERROR, &format!("status {status}: {body}"));
        }

        match response.json::<ActionResponse>().await {
            Ok(body) => parse_action_response(body),
            Err(err) => recoverable(REMOTE_CONTRACT_INVALID, &err.to_string()),
        }
    }
}

/// Accepts every action; used for local operation without a backend.
#[derive(Debug, Default)]
pub struct DryRunRemoteService;

#[async_trait]
impl RemoteActionService for DryRunRemoteService {
    async fn perform(&self, request: ActionRequest) -> RemoteOutcome {
        let detail = match request.action {
            ActionKind::Validate => json!({"dry_run": true, "display_name": request.destination}),
            _ => json!({"dry_run": true}),
        };
        RemoteOutcome::Success { detail }
    }
}

pub fn build_remote(cfg: &Remote) -> Result<Box<dyn RemoteActionService>, String> {
    match cfg.mode.as_str() {
        "http" => {
            let endpoint = cfg
                .endpoint
                .as_deref()
                .ok_or_else(|| "remote.endpoint is required for http remote".to_string())?;
            Ok(Box::new(HttpRemoteService::new(
                endpoint,
                Duration::from_millis(cfg.timeout_ms),
            )?))
        }
        _ => Ok(Box::new(DryRunRemoteService)),
    }
}

/// Expiry of `timeout` is reported as a recoverable outcome.
pub async fn perform_with_timeout(
    remote: &dyn RemoteActionService,
    request: ActionRequest,
    timeout: Duration,
) -> RemoteOutcome {
    match tokio::time::timeout(timeout, remote.perform(request)).await {
        Ok(outcome) => outcome,
        Err(_) => recoverable(
            REMOTE_TIMEOUT,
            &format!("no response within {}ms", timeout.as_millis()),
        ),
    }
}

pub fn recoverable(code: &str, message: &str) -> RemoteOutcome {
    RemoteOutcome::RecoverableError {
        message: format!("{code}: {message}"),
    }
}
