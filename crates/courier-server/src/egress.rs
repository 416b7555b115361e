use std::collections::HashSet;

use chrono::{DateTime, Utc};
use courier_contracts::{
    Egress, EgressDescriptor, EgressImportReport, EgressStatus, Identity, RejectedLine,
};
use courier_kernel::{parse_egress_line, stable_egress_id};
use tracing::info;

use crate::error::EngineError;
use crate::store::{LeaseResult, SharedStore};

/// How an identity reaches the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EgressRoute {
    Direct,
    Via(EgressDescriptor),
    /// The identity points at an egress that is gone or leased elsewhere.
    Dangling(String),
}

#[derive(Clone)]
pub struct EgressPool {
    store: SharedStore,
}

impl EgressPool {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Line-oriented admission. Blank lines are ignored; malformed ones are
    /// rejected with their 1-based line number.
    pub async fn import(
        &self,
        tenant_id: &str,
        lines: &[String],
        now: DateTime<Utc>,
    ) -> Result<EgressImportReport, EngineError> {
        let mut report = EgressImportReport::default();
        let mut seen = HashSet::new();
        let mut store = self.store.lock().await;

        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let descriptor = match parse_egress_line(line) {
                Ok(v) => v,
                Err(reason) => {
                    report.rejected += 1;
                    report.rejected_lines.push(RejectedLine {
                        line: idx + 1,
                        reason,
                    });
                    continue;
                }
            };
            let id = stable_egress_id(tenant_id, &descriptor);
            if !seen.insert(id.clone()) {
                report.duplicates += 1;
                continue;
            }
            let egress = Egress {
                id,
                tenant_id: tenant_id.to_string(),
                descriptor,
                status: EgressStatus::Available,
                leased_to: None,
                created_at: now,
            };
            if store.insert_egress(&egress)? {
                report.admitted += 1;
            } else {
                report.duplicates += 1;
            }
        }

        info!(
            tenant_id,
            admitted = report.admitted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "egress import finished"
        );
        Ok(report)
    }

    pub async fn lease(
        &self,
        tenant_id: &str,
        egress_id: &str,
        identity_id: &str,
    ) -> Result<Egress, EngineError> {
        let mut store = self.store.lock().await;
        match store.lease_egress(tenant_id, egress_id, identity_id)? {
            LeaseResult::Leased => {}
            LeaseResult::AlreadyLeased { .. } => {
                return Err(EngineError::AlreadyLeased {
                    egress_id: egress_id.to_string(),
                })
            }
            LeaseResult::IdentityAlreadyBound { egress_id: bound } => {
                return Err(EngineError::IdentityAlreadyBound {
                    identity_id: identity_id.to_string(),
                    egress_id: bound,
                })
            }
            LeaseResult::EgressNotFound => {
                return Err(EngineError::NotFound(format!("egress {egress_id}")))
            }
            LeaseResult::IdentityNotFound => {
                return Err(EngineError::NotFound(format!("identity {identity_id}")))
            }
        }
        info!(tenant_id, egress_id, identity_id, "egress leased");
        store
            .get_egress(tenant_id, egress_id)?
            .ok_or_else(|| EngineError::NotFound(format!("egress {egress_id}")))
    }

    /// Idempotent; returns whether a lease was actually cleared.
    pub async fn release(&self, tenant_id: &str, egress_id: &str) -> Result<bool, EngineError> {
        let mut store = self.store.lock().await;
        if store.get_egress(tenant_id, egress_id)?.is_none() {
            return Err(EngineError::NotFound(format!("egress {egress_id}")));
        }
        let released = store.release_egress(tenant_id, egress_id)?;
        if released {
            info!(tenant_id, egress_id, "egress released");
        }
        Ok(released)
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<Egress>, EngineError> {
        let store = self.store.lock().await;
        Ok(store.list_egress(tenant_id)?)
    }

    pub async fn route_for(&self, identity: &Identity) -> Result<EgressRoute, EngineError> {
        let Some(egress_id) = identity.bound_egress_id.as_deref() else {
            return Ok(EgressRoute::Direct);
        };
        let store = self.store.lock().await;
        Ok(match store.get_egress(&identity.tenant_id, egress_id)? {
            Some(egress)
                if egress.status == EgressStatus::Leased
                    && egress.leased_to.as_deref() == Some(identity.id.as_str()) =>
            {
                EgressRoute::Via(egress.descriptor)
            }
            Some(_) => EgressRoute::Dangling(format!("egress {egress_id} is not leased to identity")),
            None => EgressRoute::Dangling(format!("egress {egress_id} no longer exists")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreBackend};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn import_counts_admitted_duplicates_and_rejections() {
        let pool = EgressPool::new(Arc::new(Mutex::new(StoreBackend::Memory(
            MemoryStore::default(),
        ))));
        let report = pool
            .import(
                "t",
                &lines(&[
                    "10.0.0.1:8080",
                    "",
                    "10.0.0.1:8080",
                    "bad-line",
                    "proxy.local:3128:bob:pw",
                    "proxy.local:99999",
                ]),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(report.admitted, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.rejected, 2);
        let line_numbers: Vec<usize> = report.rejected_lines.iter().map(|r| r.line).collect();
        assert_eq!(line_numbers, vec![4, 6]);

        let again = pool
            .import("t", &lines(&["10.0.0.1:8080"]), Utc::now())
            .await
            .unwrap();
        assert_eq!(again.admitted, 0);
        assert_eq!(again.duplicates, 1);
    }

    #[tokio::test]
    async fn release_of_unknown_egress_is_not_found() {
        let pool = EgressPool::new(Arc::new(Mutex::new(StoreBackend::Memory(
            MemoryStore::default(),
        ))));
        let err = pool.release("t", "egr_missing").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}
