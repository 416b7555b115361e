use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use courier_config::Config;
use courier_contracts::{
    BatchReport, BatchRequest, EgressImportReport, EgressImportRequest, EgressView,
    EnqueueReport, EnqueueRequest, ErrorResponse, Exclusion, Identity, IdentityStatus,
    ImportReport, ImportRequest, LeaseRequest, ReleaseRequest, ResetProblemsRequest, Target,
    TargetStatus, ValidateRequest, ValidationItem, ValidationReport,
};
use courier_kernel::{partition_eligible, EligibilityPolicy};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub mod cancel;
pub mod dispatch;
pub mod egress;
pub mod error;
pub mod import;
pub mod ledger;
pub mod logging;
pub mod remote;
pub mod report;
pub mod store;
pub mod targets;

pub use cancel::CancellationToken;
pub use error::EngineError;
pub use remote::{DryRunRemoteService, HttpRemoteService, RemoteActionService};

use dispatch::Dispatcher;
use egress::EgressPool;
use import::CredentialValidator;
use ledger::IdentityLedger;
use report::{failure_log_csv, newline_artifact};
use store::StoreBackend;
use targets::TargetQueue;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let engine = Engine::new(cfg)?;
    let app = build_router(engine.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "courier listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(engine))
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

async fn shutdown_signal(engine: Engine) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable; graceful shutdown disabled");
        std::future::pending::<()>().await;
    }
    let cancelled = engine.cancel_all().await;
    info!(cancelled, "shutdown requested; active batches cancelled");
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    Ok(build_router(Engine::new(cfg)?))
}

pub fn build_router(engine: Engine) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/identities", get(list_identities))
        .route("/v1/identities/import", post(import_identities))
        .route("/v1/identities/validate", post(validate_identities))
        .route("/v1/identities/eligibility", get(eligibility))
        .route("/v1/egress", get(list_egress))
        .route("/v1/egress/import", post(import_egress))
        .route("/v1/egress/lease", post(lease_egress))
        .route("/v1/egress/release", post(release_egress))
        .route("/v1/targets", get(list_targets).post(enqueue_targets))
        .route("/v1/targets/reset-problems", post(reset_problems))
        .route("/v1/batches", post(run_batch))
        .route("/v1/batches/{batch_id}/cancel", post(cancel_batch))
        .with_state(engine)
}

#[derive(Default)]
struct ActiveBatches {
    tokens: HashMap<String, CancellationToken>,
    identities: HashSet<String>,
}

impl ActiveBatches {
    fn release(&mut self, batch_id: &str, identity_ids: &[String]) {
        self.tokens.remove(batch_id);
        for id in identity_ids {
            self.identities.remove(id);
        }
    }
}

type SharedActive = Arc<StdMutex<ActiveBatches>>;

fn lock_active(active: &SharedActive) -> MutexGuard<'_, ActiveBatches> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases a batch's claims when the batch task ends, panics included.
struct BatchClaim {
    active: SharedActive,
    batch_id: String,
    identity_ids: Vec<String>,
}

impl Drop for BatchClaim {
    fn drop(&mut self) {
        lock_active(&self.active).release(&self.batch_id, &self.identity_ids);
    }
}

#[derive(Debug, Serialize)]
pub struct EligibilityView {
    pub eligible: Vec<Identity>,
    pub excluded: Vec<Exclusion>,
    pub summary: String,
}

/// The bulk dispatch engine behind the HTTP surface.
#[derive(Clone)]
pub struct Engine {
    cfg: Arc<Config>,
    ledger: IdentityLedger,
    egress: EgressPool,
    targets: TargetQueue,
    validator: CredentialValidator,
    dispatcher: Dispatcher,
    policy: EligibilityPolicy,
    active: SharedActive,
}

impl Engine {
    pub fn new(cfg: Config) -> Result<Self, String> {
        let remote = remote::build_remote(&cfg.remote)?;
        Self::with_remote(cfg, Arc::from(remote))
    }

    pub fn with_remote(cfg: Config, remote: Arc<dyn RemoteActionService>) -> Result<Self, String> {
        let store = StoreBackend::open(&cfg.store.kind, cfg.store.sqlite_path.as_deref())?;
        let store = Arc::new(Mutex::new(store));
        let ledger = IdentityLedger::new(store.clone());
        let egress = EgressPool::new(store.clone());
        Ok(Self {
            validator: CredentialValidator::new(
                ledger.clone(),
                egress.clone(),
                remote.clone(),
                cfg.import.chunk_size,
                Duration::from_millis(cfg.remote.timeout_ms),
            ),
            dispatcher: Dispatcher::new(&cfg, store.clone(), remote),
            targets: TargetQueue::new(store, cfg.dispatch.target_page_size),
            policy: EligibilityPolicy::from_millis(cfg.policy.cooldown_ms, cfg.policy.daily_limit),
            ledger,
            egress,
            active: Arc::new(StdMutex::new(ActiveBatches::default())),
            cfg: Arc::new(cfg),
        })
    }

    pub fn ledger(&self) -> &IdentityLedger {
        &self.ledger
    }

    pub fn egress(&self) -> &EgressPool {
        &self.egress
    }

    pub fn targets(&self) -> &TargetQueue {
        &self.targets
    }

    /// Registers credentials as `pending`, then validates them unless disabled.
    pub async fn import_credentials(
        &self,
        request: ImportRequest,
    ) -> Result<ImportReport, EngineError> {
        let tenant_id = require_tenant(&request.tenant_id)?;
        if request.credentials.is_empty() {
            return Err(EngineError::Validation(
                "credentials must not be empty".to_string(),
            ));
        }
        let registration = self
            .ledger
            .register(tenant_id, &request.credentials, Utc::now())
            .await?;
        info!(
            tenant_id,
            imported = registration.identity_ids.len(),
            duplicates = registration.duplicates.len(),
            invalid = registration.invalid,
            "credentials registered"
        );

        let validate = request
            .validate
            .unwrap_or(self.cfg.import.validate_on_import);
        let validation = if validate && !registration.identity_ids.is_empty() {
            let identities = self
                .ledger
                .select(tenant_id, &registration.identity_ids)
                .await?;
            Some(self.validator.validate(tenant_id, &identities).await?)
        } else {
            None
        };

        Ok(ImportReport {
            imported: registration.identity_ids.len(),
            invalid: registration.invalid,
            duplicates: registration.duplicates,
            identity_ids: registration.identity_ids,
            validation,
        })
    }

    /// Suspended identities are only revalidated when named explicitly.
    pub async fn validate(&self, request: ValidateRequest) -> Result<ValidationReport, EngineError> {
        let tenant_id = require_tenant(&request.tenant_id)?;
        let explicit = !request.identity_ids.is_empty();
        let selected = self.ledger.select(tenant_id, &request.identity_ids).await?;
        let (probe, held): (Vec<Identity>, Vec<Identity>) = selected
            .into_iter()
            .partition(|i| explicit || i.status != IdentityStatus::Suspended);

        let mut report = self.validator.validate(tenant_id, &probe).await?;
        for identity in held {
            report.skipped += 1;
            report.items.push(ValidationItem {
                identity_id: identity.id,
                label: identity.label,
                status_before: identity.status,
                status_after: identity.status,
                error: Some("suspended; revalidate by naming the identity".to_string()),
            });
        }
        Ok(report)
    }

    pub async fn identities(&self, tenant_id: &str) -> Result<Vec<Identity>, EngineError> {
        self.ledger.list(require_tenant(tenant_id)?).await
    }

    pub async fn eligibility(&self, tenant_id: &str) -> Result<EligibilityView, EngineError> {
        let identities = self.ledger.list(require_tenant(tenant_id)?).await?;
        let split = partition_eligible(identities, Utc::now(), &self.policy);
        Ok(EligibilityView {
            summary: split.exclusion_summary(),
            eligible: split.eligible,
            excluded: split.excluded,
        })
    }

    pub async fn import_egress(
        &self,
        request: EgressImportRequest,
    ) -> Result<EgressImportReport, EngineError> {
        let tenant_id = require_tenant(&request.tenant_id)?;
        self.egress.import(tenant_id, &request.lines, Utc::now()).await
    }

    pub async fn lease_egress(&self, request: LeaseRequest) -> Result<EgressView, EngineError> {
        let tenant_id = require_tenant(&request.tenant_id)?;
        let egress = self
            .egress
            .lease(tenant_id, &request.egress_id, &request.identity_id)
            .await?;
        Ok(EgressView::from(&egress))
    }

    pub async fn release_egress(&self, request: ReleaseRequest) -> Result<bool, EngineError> {
        let tenant_id = require_tenant(&request.tenant_id)?;
        self.egress.release(tenant_id, &request.egress_id).await
    }

    pub async fn list_egress(&self, tenant_id: &str) -> Result<Vec<EgressView>, EngineError> {
        let egress = self.egress.list(require_tenant(tenant_id)?).await?;
        Ok(egress.iter().map(EgressView::from).collect())
    }

    pub async fn enqueue_targets(
        &self,
        request: EnqueueRequest,
    ) -> Result<EnqueueReport, EngineError> {
        let tenant_id = require_tenant(&request.tenant_id)?;
        self.targets
            .enqueue(tenant_id, &request.labels, Utc::now())
            .await
    }

    pub async fn reset_problems(&self, request: ResetProblemsRequest) -> Result<usize, EngineError> {
        let tenant_id = require_tenant(&request.tenant_id)?;
        self.targets
            .reset_problems(tenant_id, &request.target_ids)
            .await
    }

    pub async fn list_targets(
        &self,
        tenant_id: &str,
        status: Option<TargetStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Target>, EngineError> {
        self.targets
            .list(require_tenant(tenant_id)?, status, limit)
            .await
    }

    /// Admits the batch, then runs it on its own task so a dropped caller
    /// never interrupts a half-recorded pair.
    pub async fn run_batch(&self, request: BatchRequest) -> Result<BatchReport, EngineError> {
        let plan = self.dispatcher.plan(request, Utc::now()).await?;
        let batch_id = plan.header.batch_id.clone();
        let identity_ids = plan.identity_ids();
        let token = CancellationToken::new();

        let claim = {
            let mut active = lock_active(&self.active);
            if active.tokens.contains_key(&batch_id) {
                return Err(EngineError::Validation(format!(
                    "batch {batch_id} is already running"
                )));
            }
            let busy: Vec<String> = identity_ids
                .iter()
                .filter(|id| active.identities.contains(*id))
                .cloned()
                .collect();
            if !busy.is_empty() {
                return Err(EngineError::IdentityBusy(busy));
            }
            active.identities.extend(identity_ids.iter().cloned());
            active.tokens.insert(batch_id.clone(), token.clone());
            BatchClaim {
                active: self.active.clone(),
                batch_id,
                identity_ids,
            }
        };

        let dispatcher = self.dispatcher.clone();
        let task = tokio::spawn(async move {
            let _claim = claim;
            dispatcher.execute(plan, &token).await
        });
        task.await
            .map_err(|e| EngineError::Store(format!("batch task failed: {e}")))
    }

    pub async fn cancel_batch(&self, batch_id: &str) -> Result<(), EngineError> {
        let active = lock_active(&self.active);
        let token = active
            .tokens
            .get(batch_id)
            .ok_or_else(|| EngineError::NotFound(format!("active batch {batch_id}")))?;
        token.cancel();
        info!(batch_id, "batch cancellation requested");
        Ok(())
    }

    /// Returns how many batches were signalled.
    pub async fn cancel_all(&self) -> usize {
        let active = lock_active(&self.active);
        for token in active.tokens.values() {
            token.cancel();
        }
        active.tokens.len()
    }
}

fn require_tenant(tenant_id: &str) -> Result<&str, EngineError> {
    let trimmed = tenant_id.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation("tenant_id is required".to_string()));
    }
    Ok(trimmed)
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn respond<T>(result: Result<T, EngineError>) -> ApiResult<T> {
    result.map(Json).map_err(EngineError::into_response)
}

#[derive(Debug, Deserialize)]
struct TenantQuery {
    tenant_id: String,
}

#[derive(Debug, Deserialize)]
struct TargetQuery {
    tenant_id: String,
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    #[serde(flatten)]
    pub report: ImportReport,
    /// Duplicate labels, one per line.
    pub duplicates_artifact: String,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub report: BatchReport,
    pub failure_log_csv: String,
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn list_identities(
    State(engine): State<Engine>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Vec<Identity>> {
    respond(engine.identities(&query.tenant_id).await)
}

async fn import_identities(
    State(engine): State<Engine>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<ImportResponse> {
    respond(engine.import_credentials(request).await.map(|report| ImportResponse {
        duplicates_artifact: newline_artifact(&report.duplicates),
        report,
    }))
}

async fn validate_identities(
    State(engine): State<Engine>,
    Json(request): Json<ValidateRequest>,
) -> ApiResult<ValidationReport> {
    respond(engine.validate(request).await)
}

async fn eligibility(
    State(engine): State<Engine>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<EligibilityView> {
    respond(engine.eligibility(&query.tenant_id).await)
}

async fn list_egress(
    State(engine): State<Engine>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Vec<EgressView>> {
    respond(engine.list_egress(&query.tenant_id).await)
}

async fn import_egress(
    State(engine): State<Engine>,
    Json(request): Json<EgressImportRequest>,
) -> ApiResult<EgressImportReport> {
    respond(engine.import_egress(request).await)
}

async fn lease_egress(
    State(engine): State<Engine>,
    Json(request): Json<LeaseRequest>,
) -> ApiResult<EgressView> {
    respond(engine.lease_egress(request).await)
}

async fn release_egress(
    State(engine): State<Engine>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResult<serde_json::Value> {
    respond(
        engine
            .release_egress(request)
            .await
            .map(|released| serde_json::json!({ "released": released })),
    )
}

async fn list_targets(
    State(engine): State<Engine>,
    Query(query): Query<TargetQuery>,
) -> ApiResult<Vec<Target>> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match TargetStatus::parse(raw) {
            Some(v) => Some(v),
            None => {
                return Err(EngineError::Validation(format!(
                    "unknown target status {raw:?}; expected available, used or problem"
                ))
                .into_response())
            }
        },
    };
    respond(engine.list_targets(&query.tenant_id, status, query.limit).await)
}

async fn enqueue_targets(
    State(engine): State<Engine>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<EnqueueReport> {
    respond(engine.enqueue_targets(request).await)
}

async fn reset_problems(
    State(engine): State<Engine>,
    Json(request): Json<ResetProblemsRequest>,
) -> ApiResult<serde_json::Value> {
    respond(
        engine
            .reset_problems(request)
            .await
            .map(|reset| serde_json::json!({ "reset": reset })),
    )
}

async fn run_batch(
    State(engine): State<Engine>,
    Json(request): Json<BatchRequest>,
) -> ApiResult<BatchResponse> {
    respond(engine.run_batch(request).await.map(|report| BatchResponse {
        failure_log_csv: failure_log_csv(&report),
        report,
    }))
}

async fn cancel_batch(
    State(engine): State<Engine>,
    Path(batch_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    respond(
        engine
            .cancel_batch(&batch_id)
            .await
            .map(|()| serde_json::json!({ "batch_id": batch_id, "cancelled": true })),
    )
}
