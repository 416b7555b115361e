use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_contracts::{
    ActionKind, ActionRequest, Identity, IdentityStatus, RemoteOutcome, ValidationItem,
    ValidationReport, CONTRACT_VERSION,
};
use courier_kernel::{display_name_from_detail, validation_event};
use futures::future::join_all;
use serde_json::Value;
use tracing::info;

use crate::egress::{EgressPool, EgressRoute};
use crate::error::EngineError;
use crate::ledger::IdentityLedger;
use crate::remote::{perform_with_timeout, RemoteActionService, EGRESS_UNAVAILABLE};

enum Probe {
    Answered(RemoteOutcome),
    NoRoute(String),
}

/// Checks credentials against the remote service in fixed-size concurrent groups.
#[derive(Clone)]
pub struct CredentialValidator {
    ledger: IdentityLedger,
    egress: EgressPool,
    remote: Arc<dyn RemoteActionService>,
    chunk_size: usize,
    timeout: Duration,
}

impl CredentialValidator {
    pub fn new(
        ledger: IdentityLedger,
        egress: EgressPool,
        remote: Arc<dyn RemoteActionService>,
        chunk_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            egress,
            remote,
            chunk_size: chunk_size.max(1),
            timeout,
        }
    }

    /// Each group is awaited in full before the next one starts.
    pub async fn validate(
        &self,
        tenant_id: &str,
        identities: &[Identity],
    ) -> Result<ValidationReport, EngineError> {
        let mut report = ValidationReport::default();

        for group in identities.chunks(self.chunk_size) {
            let probes = join_all(group.iter().map(|identity| self.probe(identity))).await;

            for (identity, probe) in group.iter().zip(probes) {
                let outcome = match probe? {
                    Probe::Answered(outcome) => outcome,
                    Probe::NoRoute(reason) => {
                        report.skipped += 1;
                        report.items.push(ValidationItem {
                            identity_id: identity.id.clone(),
                            label: identity.label.clone(),
                            status_before: identity.status,
                            status_after: identity.status,
                            error: Some(format!("{EGRESS_UNAVAILABLE}: {reason}")),
                        });
                        continue;
                    }
                };

                let (display_name, error) = match &outcome {
                    RemoteOutcome::Success { detail } | RemoteOutcome::Duplicate { detail } => {
                        (display_name_from_detail(detail), None)
                    }
                    RemoteOutcome::RecoverableError { message }
                    | RemoteOutcome::FatalError { message, .. } => (None, Some(message.clone())),
                };
                let (updated, before) = self
                    .ledger
                    .apply_validation(
                        tenant_id,
                        &identity.id,
                        validation_event(&outcome),
                        display_name,
                        error.clone(),
                        Utc::now(),
                    )
                    .await?;

                report.attempted += 1;
                match updated.status {
                    IdentityStatus::Active => report.activated += 1,
                    IdentityStatus::Expired => report.expired += 1,
                    IdentityStatus::Suspended => report.suspended += 1,
                    IdentityStatus::Pending => {}
                }
                report.items.push(ValidationItem {
                    identity_id: updated.id,
                    label: updated.label,
                    status_before: before,
                    status_after: updated.status,
                    error,
                });
            }
        }

        info!(
            tenant_id,
            attempted = report.attempted,
            activated = report.activated,
            expired = report.expired,
            suspended = report.suspended,
            skipped = report.skipped,
            "credential validation finished"
        );
        Ok(report)
    }

    async fn probe(&self, identity: &Identity) -> Result<Probe, EngineError> {
        let egress = match self.egress.route_for(identity).await? {
            EgressRoute::Direct => None,
            EgressRoute::Via(descriptor) => Some(descriptor),
            EgressRoute::Dangling(reason) => return Ok(Probe::NoRoute(reason)),
        };
        let request = ActionRequest {
            v: CONTRACT_VERSION,
            action: ActionKind::Validate,
            credential: identity.credential.clone(),
            destination: identity.label.clone(),
            payload: Value::Null,
            egress,
        };
        Ok(Probe::Answered(
            perform_with_timeout(self.remote.as_ref(), request, self.timeout).await,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreBackend};
    use async_trait::async_trait;
    use courier_contracts::{Credential, CredentialInput, FatalSignal};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Tracks how many calls overlap so grouping can be asserted.
    struct CountingRemote {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl RemoteActionService for CountingRemote {
        async fn perform(&self, request: ActionRequest) -> RemoteOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            match request.destination.as_str() {
                "banned" => RemoteOutcome::FatalError {
                    signal: FatalSignal::Banned,
                    message: "feedback_required".to_string(),
                },
                "stale" => RemoteOutcome::FatalError {
                    signal: FatalSignal::Unauthenticated,
                    message: "login_required".to_string(),
                },
                label => RemoteOutcome::Success {
                    detail: json!({"full_name": format!("{label} full")}),
                },
            }
        }
    }

    #[tokio::test]
    async fn validates_in_groups_and_maps_outcomes() {
        let store = Arc::new(Mutex::new(StoreBackend::Memory(MemoryStore::default())));
        let ledger = IdentityLedger::new(store.clone());
        let remote = Arc::new(CountingRemote {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let validator = CredentialValidator::new(
            ledger.clone(),
            EgressPool::new(store),
            remote.clone(),
            2,
            Duration::from_secs(5),
        );

        let inputs: Vec<CredentialInput> = ["a", "banned", "stale", "b", "c"]
            .iter()
            .map(|label| CredentialInput {
                label: label.to_string(),
                credential: Credential::new("s"),
            })
            .collect();
        let reg = ledger.register("t", &inputs, Utc::now()).await.unwrap();
        let identities = ledger.select("t", &reg.identity_ids).await.unwrap();

        let report = validator.validate("t", &identities).await.unwrap();
        assert_eq!(report.attempted, 5);
        assert_eq!(report.activated, 3);
        assert_eq!(report.suspended, 1);
        assert_eq!(report.expired, 1);
        assert!(remote.peak.load(Ordering::SeqCst) <= 2);

        let a = ledger.get("t", &reg.identity_ids[0]).await.unwrap();
        assert_eq!(a.display_name.as_deref(), Some("a full"));
        let stale = ledger.get("t", &reg.identity_ids[2]).await.unwrap();
        assert_eq!(stale.last_error.as_deref(), Some("login_required"));
    }
}
