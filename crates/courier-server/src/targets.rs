use std::collections::HashSet;

use chrono::{DateTime, Utc};
use courier_contracts::{EnqueueReport, Target, TargetStatus};
use courier_kernel::{normalize_label, stable_target_id};
use tracing::info;

use crate::error::EngineError;
use crate::store::SharedStore;

#[derive(Clone)]
pub struct TargetQueue {
    store: SharedStore,
    page_size: usize,
}

impl TargetQueue {
    pub fn new(store: SharedStore, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub async fn enqueue(
        &self,
        tenant_id: &str,
        labels: &[String],
        now: DateTime<Utc>,
    ) -> Result<EnqueueReport, EngineError> {
        let mut report = EnqueueReport::default();
        let mut seen = HashSet::new();
        let mut store = self.store.lock().await;

        for raw in labels {
            let Some(label) = normalize_label(raw) else {
                report.invalid += 1;
                continue;
            };
            if !seen.insert(label.key.clone()) {
                report.duplicates += 1;
                continue;
            }
            let target = Target {
                id: stable_target_id(tenant_id, &label.key),
                tenant_id: tenant_id.to_string(),
                label: label.display,
                seq: 0,
                status: TargetStatus::Available,
                last_assigned_identity_id: None,
                last_error: None,
                last_attempt_at: None,
                created_at: now,
            };
            match store.insert_target(&target)? {
                Some(_) => report.inserted += 1,
                None => report.duplicates += 1,
            }
        }

        info!(
            tenant_id,
            inserted = report.inserted,
            duplicates = report.duplicates,
            invalid = report.invalid,
            "targets enqueued"
        );
        Ok(report)
    }

    pub async fn mark_used(
        &self,
        tenant_id: &str,
        target_id: &str,
        identity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.update(tenant_id, target_id, |target| {
            target.status = TargetStatus::Used;
            target.last_assigned_identity_id = Some(identity_id.to_string());
            target.last_attempt_at = Some(now);
        })
        .await
    }

    /// The error text is stored as reported by the remote service.
    pub async fn mark_problem(
        &self,
        tenant_id: &str,
        target_id: &str,
        identity_id: Option<&str>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.update(tenant_id, target_id, |target| {
            target.status = TargetStatus::Problem;
            if let Some(identity_id) = identity_id {
                target.last_assigned_identity_id = Some(identity_id.to_string());
            }
            target.last_error = Some(error.to_string());
            target.last_attempt_at = Some(now);
        })
        .await
    }

    pub async fn reset_problems(
        &self,
        tenant_id: &str,
        target_ids: &[String],
    ) -> Result<usize, EngineError> {
        let mut store = self.store.lock().await;
        let reset = store.reset_problem_targets(tenant_id, target_ids)?;
        info!(tenant_id, reset, "problem targets reset to available");
        Ok(reset)
    }

    /// Available targets in pool order, up to `limit`.
    pub async fn list_available(
        &self,
        tenant_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Target>, EngineError> {
        self.list(tenant_id, Some(TargetStatus::Available), limit)
            .await
    }

    /// Reads page by page so large pools are never cut at the page size.
    pub async fn list(
        &self,
        tenant_id: &str,
        status: Option<TargetStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Target>, EngineError> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        let mut after_seq = 0;
        let store = self.store.lock().await;
        while out.len() < limit {
            let want = self.page_size.min(limit - out.len());
            let page = store.list_targets_page(tenant_id, status, after_seq, want)?;
            let exhausted = page.len() < want;
            if let Some(last) = page.last() {
                after_seq = last.seq;
            }
            out.extend(page);
            if exhausted {
                break;
            }
        }
        Ok(out)
    }

    async fn update<F>(&self, tenant_id: &str, target_id: &str, apply: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Target),
    {
        let mut store = self.store.lock().await;
        let mut target = store
            .get_target(tenant_id, target_id)?
            .ok_or_else(|| EngineError::NotFound(format!("target {target_id}")))?;
        apply(&mut target);
        store.save_target(&target)?;
        Ok(())
    }
}
