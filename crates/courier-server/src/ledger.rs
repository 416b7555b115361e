use std::collections::HashSet;

use chrono::{DateTime, Utc};
use courier_contracts::{CredentialInput, Identity, IdentityStatus};
use courier_kernel::{
    apply_transition, normalize_label, record_success, stable_identity_id, LifecycleEvent,
};
use tracing::warn;

use crate::error::EngineError;
use crate::store::SharedStore;

/// Outcome of registering a credential list, before any validation.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub identity_ids: Vec<String>,
    pub duplicates: Vec<String>,
    pub invalid: usize,
}

#[derive(Clone)]
pub struct IdentityLedger {
    store: SharedStore,
}

impl IdentityLedger {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// New identities start `pending`. Labels already known to the tenant,
    /// compared case-insensitively, are returned as duplicates.
    pub async fn register(
        &self,
        tenant_id: &str,
        inputs: &[CredentialInput],
        now: DateTime<Utc>,
    ) -> Result<Registration, EngineError> {
        let mut registration = Registration::default();
        let mut seen = HashSet::new();
        let mut store = self.store.lock().await;

        for input in inputs {
            let Some(label) = normalize_label(&input.label) else {
                registration.invalid += 1;
                continue;
            };
            if input.credential.is_empty() {
                registration.invalid += 1;
                continue;
            }
            if !seen.insert(label.key.clone()) {
                registration.duplicates.push(label.display);
                continue;
            }

            let identity = Identity {
                id: stable_identity_id(tenant_id, &label.key),
                tenant_id: tenant_id.to_string(),
                label: label.display.clone(),
                credential: input.credential.clone(),
                status: IdentityStatus::Pending,
                bound_egress_id: None,
                daily_send_count: 0,
                daily_send_window_start: None,
                last_action_at: None,
                lifetime_sent_count: 0,
                display_name: None,
                last_error: None,
                last_validated_at: None,
                created_at: now,
            };
            if store.insert_identity(&identity)? {
                registration.identity_ids.push(identity.id);
            } else {
                registration.duplicates.push(label.display);
            }
        }
        Ok(registration)
    }

    pub async fn find(&self, tenant_id: &str, id: &str) -> Result<Option<Identity>, EngineError> {
        let store = self.store.lock().await;
        Ok(store.get_identity(tenant_id, id)?)
    }

    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<Identity, EngineError> {
        self.find(tenant_id, id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("identity {id}")))
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<Identity>, EngineError> {
        let store = self.store.lock().await;
        Ok(store.list_identities(tenant_id)?)
    }

    /// Request order when ids are given, creation order otherwise.
    pub async fn select(
        &self,
        tenant_id: &str,
        identity_ids: &[String],
    ) -> Result<Vec<Identity>, EngineError> {
        if identity_ids.is_empty() {
            return self.list(tenant_id).await;
        }
        let store = self.store.lock().await;
        let mut seen = HashSet::new();
        let mut selected = Vec::with_capacity(identity_ids.len());
        for id in identity_ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            let identity = store
                .get_identity(tenant_id, id)?
                .ok_or_else(|| EngineError::NotFound(format!("identity {id}")))?;
            selected.push(identity);
        }
        Ok(selected)
    }

    /// Bills one successful action against the identity's quota.
    pub async fn record_success(
        &self,
        tenant_id: &str,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Identity, EngineError> {
        let mut store = self.store.lock().await;
        let mut identity = store
            .get_identity(tenant_id, id)?
            .ok_or_else(|| EngineError::NotFound(format!("identity {id}")))?;
        record_success(&mut identity, now);
        store.save_identity(&identity)?;
        Ok(identity)
    }

    /// Applies a lifecycle event and returns `(before, after)`.
    pub async fn apply_event(
        &self,
        tenant_id: &str,
        id: &str,
        event: LifecycleEvent,
        error: Option<String>,
    ) -> Result<(IdentityStatus, IdentityStatus), EngineError> {
        let mut store = self.store.lock().await;
        let mut identity = store
            .get_identity(tenant_id, id)?
            .ok_or_else(|| EngineError::NotFound(format!("identity {id}")))?;
        let before = apply_transition(&mut identity, event, error);
        store.save_identity(&identity)?;
        log_transition(&identity, before);
        Ok((before, identity.status))
    }

    /// Records a validation attempt: status, display name and error in one write.
    pub async fn apply_validation(
        &self,
        tenant_id: &str,
        id: &str,
        event: LifecycleEvent,
        display_name: Option<String>,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Identity, IdentityStatus), EngineError> {
        let mut store = self.store.lock().await;
        let mut identity = store
            .get_identity(tenant_id, id)?
            .ok_or_else(|| EngineError::NotFound(format!("identity {id}")))?;
        let succeeded = event == LifecycleEvent::ValidationSucceeded;
        let before = apply_transition(&mut identity, event, error);
        if succeeded {
            identity.last_error = None;
            if display_name.is_some() {
                identity.display_name = display_name;
            }
        }
        identity.last_validated_at = Some(now);
        store.save_identity(&identity)?;
        log_transition(&identity, before);
        Ok((identity, before))
    }
}

fn log_transition(identity: &Identity, before: IdentityStatus) {
    if before == identity.status {
        return;
    }
    if matches!(
        identity.status,
        IdentityStatus::Expired | IdentityStatus::Suspended
    ) {
        warn!(
            tenant_id = %identity.tenant_id,
            identity_id = %identity.id,
            from = before.as_str(),
            to = identity.status.as_str(),
            error = identity.last_error.as_deref().unwrap_or(""),
            "identity lost active status"
        );
    } else {
        tracing::info!(
            tenant_id = %identity.tenant_id,
            identity_id = %identity.id,
            from = before.as_str(),
            to = identity.status.as_str(),
            "identity status changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreBackend};
    use courier_contracts::Credential;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn ledger() -> IdentityLedger {
        IdentityLedger::new(Arc::new(Mutex::new(StoreBackend::Memory(
            MemoryStore::default(),
        ))))
    }

    fn input(label: &str, credential: &str) -> CredentialInput {
        CredentialInput {
            label: label.to_string(),
            credential: Credential::new(credential),
        }
    }

    #[tokio::test]
    async fn register_reports_duplicates_and_invalid_inputs() {
        let ledger = ledger();
        let now = Utc::now();
        let first = ledger
            .register(
                "t",
                &[
                    input("@Alice", "s1"),
                    input("alice", "s2"),
                    input("bob", ""),
                    input("  ", "s3"),
                    input("carol", "s4"),
                ],
                now,
            )
            .await
            .unwrap();
        assert_eq!(first.identity_ids.len(), 2);
        assert_eq!(first.duplicates, vec!["alice".to_string()]);
        assert_eq!(first.invalid, 2);

        let second = ledger.register("t", &[input("CAROL", "s5")], now).await.unwrap();
        assert!(second.identity_ids.is_empty());
        assert_eq!(second.duplicates, vec!["CAROL".to_string()]);

        let all = ledger.list("t").await.unwrap();
        assert!(all.iter().all(|i| i.status == IdentityStatus::Pending));
    }

    #[tokio::test]
    async fn select_keeps_request_order_and_rejects_unknown_ids() {
        let ledger = ledger();
        let reg = ledger
            .register("t", &[input("a", "s"), input("b", "s")], Utc::now())
            .await
            .unwrap();
        let reversed: Vec<String> = reg.identity_ids.iter().rev().cloned().collect();
        let selected = ledger.select("t", &reversed).await.unwrap();
        assert_eq!(selected[0].label, "b");

        let err = ledger
            .select("t", &["idn_missing".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn validation_success_refreshes_display_name() {
        let ledger = ledger();
        let reg = ledger.register("t", &[input("a", "s")], Utc::now()).await.unwrap();
        let id = &reg.identity_ids[0];
        let (identity, before) = ledger
            .apply_validation(
                "t",
                id,
                LifecycleEvent::ValidationSucceeded,
                Some("Alice A.".to_string()),
                None,
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(before, IdentityStatus::Pending);
        assert_eq!(identity.status, IdentityStatus::Active);
        assert_eq!(identity.display_name.as_deref(), Some("Alice A."));
        assert!(identity.last_validated_at.is_some());
    }
}
