use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_config::{Config, Dispatch};
use courier_contracts::{
    ActionKind, ActionRequest, BatchReport, BatchRequest, BatchTargets, Exclusion, Identity,
    IdentityStatus, RemoteOutcome, CONTRACT_VERSION,
};
use courier_kernel::{
    allocate_explicit, allocate_pool, classify, jcs_sha256_hex, partition_eligible, plan_effects,
    EligibilityPolicy, IdentityEffect, Pairing, TargetEffect,
};
use serde_json::Value;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::egress::{EgressPool, EgressRoute};
use crate::error::EngineError;
use crate::ledger::IdentityLedger;
use crate::remote::{perform_with_timeout, recoverable, RemoteActionService, EGRESS_UNAVAILABLE};
use crate::report::{ReportAggregator, ABORTED, CANCELLED};
use crate::store::SharedStore;
use crate::targets::TargetQueue;

/// What every pair of a batch shares.
#[derive(Debug, Clone)]
pub struct BatchHeader {
    pub batch_id: String,
    pub tenant_id: String,
    pub action: ActionKind,
    pub mode: &'static str,
    pub payload: Value,
    pub payload_sha256: String,
    pub started_at: DateTime<Utc>,
}

/// An admitted batch: allocation done, nothing dispatched yet.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub header: BatchHeader,
    pub pairs: Vec<Pairing>,
    pub surplus: Vec<Identity>,
    pub excluded: Vec<Exclusion>,
}

impl BatchPlan {
    /// Distinct identities that will act, in first-use order.
    pub fn identity_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.pairs
            .iter()
            .filter(|p| seen.insert(p.identity.id.as_str()))
            .map(|p| p.identity.id.clone())
            .collect()
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    ledger: IdentityLedger,
    egress: EgressPool,
    targets: TargetQueue,
    remote: Arc<dyn RemoteActionService>,
    policy: EligibilityPolicy,
    settings: Dispatch,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(cfg: &Config, store: SharedStore, remote: Arc<dyn RemoteActionService>) -> Self {
        Self {
            ledger: IdentityLedger::new(store.clone()),
            egress: EgressPool::new(store.clone()),
            targets: TargetQueue::new(store, cfg.dispatch.target_page_size),
            remote,
            policy: EligibilityPolicy::from_millis(cfg.policy.cooldown_ms, cfg.policy.daily_limit),
            settings: cfg.dispatch.clone(),
            timeout: Duration::from_millis(cfg.remote.timeout_ms),
        }
    }

    /// Validates the request, filters identities and allocates destinations.
    /// Everything that can reject a batch happens here, before any remote call.
    pub async fn plan(
        &self,
        request: BatchRequest,
        now: DateTime<Utc>,
    ) -> Result<BatchPlan, EngineError> {
        let tenant_id = request.tenant_id.trim().to_string();
        if tenant_id.is_empty() {
            return Err(EngineError::Validation("tenant_id is required".to_string()));
        }
        if request.action == ActionKind::Validate {
            return Err(EngineError::Validation(
                "batch action must be send or post".to_string(),
            ));
        }
        let destinations = match &request.targets {
            BatchTargets::Explicit { destinations } => {
                let cleaned: Vec<String> = destinations
                    .iter()
                    .map(|d| d.trim())
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
                    .collect();
                if cleaned.is_empty() {
                    return Err(EngineError::Validation(
                        "explicit mode requires at least one destination".to_string(),
                    ));
                }
                Some(cleaned)
            }
            BatchTargets::Pool => None,
        };
        let payload_sha256 = jcs_sha256_hex(&request.payload).map_err(EngineError::Validation)?;

        let selected = self.ledger.select(&tenant_id, &request.identity_ids).await?;
        let split = partition_eligible(selected, now, &self.policy);
        if split.eligible.is_empty() {
            return Err(EngineError::NoEligibleIdentities(split.exclusion_summary()));
        }
        let summary = split.exclusion_summary();

        let (pairs, surplus) = match destinations {
            Some(destinations) => (
                allocate_explicit(&split.eligible, &destinations)
                    .map_err(|e| EngineError::from_allocation(e, &tenant_id, summary.clone()))?,
                Vec::new(),
            ),
            None => {
                let targets = self
                    .targets
                    .list_available(&tenant_id, Some(split.eligible.len()))
                    .await?;
                let allocation = allocate_pool(&split.eligible, &targets)
                    .map_err(|e| EngineError::from_allocation(e, &tenant_id, summary.clone()))?;
                (allocation.pairs, allocation.surplus)
            }
        };

        let batch_id = request
            .batch_id
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| format!("bat_{}", Uuid::new_v4().simple()));

        Ok(BatchPlan {
            header: BatchHeader {
                batch_id,
                tenant_id,
                action: request.action,
                mode: request.targets.mode_name(),
                payload: request.payload,
                payload_sha256,
                started_at: now,
            },
            pairs,
            surplus,
            excluded: split.excluded,
        })
    }

    /// Dispatches pairs one at a time. Ledger and queue writes for a pair are
    /// durable before the next pair starts. A store error ends the batch early
    /// and the report carries it in `aborted`.
    pub async fn execute(&self, plan: BatchPlan, token: &CancellationToken) -> BatchReport {
        let header = plan.header;
        let pool_mode = matches!(header.mode, "pool");
        let delay = Duration::from_millis(if pool_mode {
            self.settings.pool_delay_ms
        } else {
            self.settings.explicit_delay_ms
        });

        let mut report = ReportAggregator::new(
            &header.batch_id,
            &header.tenant_id,
            header.mode,
            header.action,
            header.payload_sha256.clone(),
            self.settings.failure_log_limit,
            header.started_at,
        );
        info!(
            tenant_id = %header.tenant_id,
            batch_id = %header.batch_id,
            mode = header.mode,
            action = header.action.as_str(),
            pairs = plan.pairs.len(),
            surplus = plan.surplus.len(),
            excluded = plan.excluded.len(),
            "batch started"
        );
        report.exclude(plan.excluded);

        let total = plan.pairs.len();
        let mut acted = HashSet::new();
        let mut aborted = false;
        for (index, pair) in plan.pairs.into_iter().enumerate() {
            if aborted {
                report.skip(Some(&pair.identity.id), Some(pair.destination.label()), ABORTED);
                continue;
            }
            if token.is_cancelled() {
                report.mark_cancelled();
                report.skip(
                    Some(&pair.identity.id),
                    Some(pair.destination.label()),
                    CANCELLED,
                );
                continue;
            }

            let contacted = match self
                .dispatch_pair(&header, &pair, pool_mode, &mut acted, &mut report)
                .await
            {
                Ok(contacted) => contacted,
                Err(err) => {
                    error!(
                        tenant_id = %header.tenant_id,
                        batch_id = %header.batch_id,
                        identity_id = %pair.identity.id,
                        error = %err,
                        "batch aborted"
                    );
                    report.abort(err.to_string());
                    aborted = true;
                    continue;
                }
            };

            if contacted && index + 1 < total && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {}
                }
            }
        }
        for identity in &plan.surplus {
            report.skip(Some(&identity.id), None, "no_target");
        }

        let report = report.finish(Utc::now());
        info!(
            tenant_id = %report.tenant_id,
            batch_id = %report.batch_id,
            attempted = report.attempted,
            succeeded = report.succeeded,
            duplicates = report.duplicates,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            aborted = report.aborted.is_some(),
            "batch finished"
        );
        report
    }

    pub async fn run_batch(
        &self,
        request: BatchRequest,
        token: &CancellationToken,
    ) -> Result<BatchReport, EngineError> {
        let plan = self.plan(request, Utc::now()).await?;
        Ok(self.execute(plan, token).await)
    }

    /// Returns whether the remote service was called.
    async fn dispatch_pair(
        &self,
        header: &BatchHeader,
        pair: &Pairing,
        pool_mode: bool,
        acted: &mut HashSet<String>,
        report: &mut ReportAggregator,
    ) -> Result<bool, EngineError> {
        let tenant_id = header.tenant_id.as_str();
        let identity_id = pair.identity.id.as_str();
        let destination = pair.destination.label();

        // Earlier pairs of this batch may have used up the quota or revoked the identity.
        let Some(identity) = self.ledger.find(tenant_id, identity_id).await? else {
            report.skip(Some(identity_id), Some(destination), "identity_missing");
            return Ok(false);
        };
        if identity.status != IdentityStatus::Active {
            report.skip(Some(identity_id), Some(destination), "not_active");
            return Ok(false);
        }
        let now = Utc::now();
        if self.policy.quota_exhausted(&identity, now) {
            report.skip(Some(identity_id), Some(destination), "quota_exhausted");
            return Ok(false);
        }
        // Another batch may have acted with this identity since the plan was made.
        if !acted.contains(identity_id) {
            if let Some(last) = identity.last_action_at {
                if now < last + self.policy.cooldown {
                    report.skip(Some(identity_id), Some(destination), "cooling_down");
                    return Ok(false);
                }
            }
        }

        let (outcome, contacted) = match self.egress.route_for(&identity).await? {
            EgressRoute::Dangling(reason) => (recoverable(EGRESS_UNAVAILABLE, &reason), false),
            route => {
                let request = ActionRequest {
                    v: CONTRACT_VERSION,
                    action: header.action,
                    credential: identity.credential.clone(),
                    destination: destination.to_string(),
                    payload: header.payload.clone(),
                    egress: match route {
                        EgressRoute::Via(descriptor) => Some(descriptor),
                        _ => None,
                    },
                };
                acted.insert(identity_id.to_string());
                let outcome =
                    perform_with_timeout(self.remote.as_ref(), request, self.timeout).await;
                (outcome, true)
            }
        };
        self.record_outcome(header, pair, pool_mode, &outcome, report)
            .await?;
        Ok(contacted)
    }

    /// The pair enters the report before its effects are written, so a failed
    /// write still leaves the remote outcome visible.
    async fn record_outcome(
        &self,
        header: &BatchHeader,
        pair: &Pairing,
        pool_mode: bool,
        outcome: &RemoteOutcome,
        report: &mut ReportAggregator,
    ) -> Result<(), EngineError> {
        let tenant_id = header.tenant_id.as_str();
        let identity_id = pair.identity.id.as_str();
        let destination = pair.destination.label();
        let now = Utc::now();
        let classification = classify(outcome);
        debug!(
            tenant_id,
            batch_id = %header.batch_id,
            identity_id,
            destination,
            outcome = ?classification,
            "pair dispatched"
        );
        report.record(identity_id, destination, &classification);

        let effects = plan_effects(&classification, pool_mode);
        match effects.identity {
            IdentityEffect::None => {}
            IdentityEffect::RecordSuccess => {
                self.ledger.record_success(tenant_id, identity_id, now).await?;
            }
            IdentityEffect::Transition { event, error } => {
                self.ledger
                    .apply_event(tenant_id, identity_id, event, Some(error))
                    .await?;
            }
        }
        if let Some(target_id) = pair.destination.target_id() {
            match effects.target {
                TargetEffect::None => {}
                TargetEffect::MarkUsed => {
                    self.targets
                        .mark_used(tenant_id, target_id, identity_id, now)
                        .await?;
                }
                TargetEffect::MarkProblem(error) => {
                    self.targets
                        .mark_problem(tenant_id, target_id, Some(identity_id), &error, now)
                        .await?;
                }
            }
        }
        Ok(())
    }
}
