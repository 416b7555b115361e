use chrono::{DateTime, Utc};
use courier_contracts::{
    ActionKind, BatchReport, Exclusion, FailureEntry, FatalSignal, ItemOutcome, ReportItem,
};
use courier_kernel::Classification;

pub const CANCELLED: &str = "cancelled";
pub const ABORTED: &str = "aborted";

/// Accumulates per-pair results into a [`BatchReport`].
pub struct ReportAggregator {
    report: BatchReport,
    failure_log_limit: usize,
}

impl ReportAggregator {
    pub fn new(
        batch_id: &str,
        tenant_id: &str,
        mode: &str,
        action: ActionKind,
        payload_sha256: String,
        failure_log_limit: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            report: BatchReport {
                batch_id: batch_id.to_string(),
                tenant_id: tenant_id.to_string(),
                mode: mode.to_string(),
                action,
                payload_sha256,
                attempted: 0,
                succeeded: 0,
                duplicates: 0,
                failed: 0,
                skipped: 0,
                cancelled: false,
                aborted: None,
                excluded: Vec::new(),
                items: Vec::new(),
                failures: Vec::new(),
                failure_log_overflow: 0,
                started_at,
                finished_at: started_at,
            },
            failure_log_limit,
        }
    }

    pub fn exclude(&mut self, excluded: Vec<Exclusion>) {
        self.report.excluded.extend(excluded);
    }

    pub fn record(&mut self, identity_id: &str, destination: &str, classification: &Classification) {
        self.report.attempted += 1;
        let (outcome, reason_code, error) = match classification {
            Classification::Success => {
                self.report.succeeded += 1;
                (ItemOutcome::Succeeded, None, None)
            }
            Classification::Duplicate => {
                self.report.duplicates += 1;
                (ItemOutcome::Duplicate, Some("duplicate"), None)
            }
            Classification::RecoverableFailure { error } => {
                self.report.failed += 1;
                (ItemOutcome::Failed, Some("recoverable_failure"), Some(error))
            }
            Classification::FatalFailure { signal, error } => {
                self.report.failed += 1;
                let code = match signal {
                    FatalSignal::Banned => "fatal_banned",
                    FatalSignal::Unauthenticated => "fatal_unauthenticated",
                };
                (ItemOutcome::Failed, Some(code), Some(error))
            }
        };

        if let Some(error) = error {
            if self.report.failures.len() < self.failure_log_limit {
                self.report.failures.push(FailureEntry {
                    destination: destination.to_string(),
                    identity_id: identity_id.to_string(),
                    error: error.clone(),
                });
            } else {
                self.report.failure_log_overflow += 1;
            }
        }

        self.report.items.push(ReportItem {
            identity_id: Some(identity_id.to_string()),
            destination: Some(destination.to_string()),
            outcome,
            reason_code: reason_code.map(str::to_string),
            error: error.cloned(),
        });
    }

    pub fn skip(&mut self, identity_id: Option<&str>, destination: Option<&str>, reason_code: &str) {
        self.report.skipped += 1;
        self.report.items.push(ReportItem {
            identity_id: identity_id.map(str::to_string),
            destination: destination.map(str::to_string),
            outcome: ItemOutcome::Skipped,
            reason_code: Some(reason_code.to_string()),
            error: None,
        });
    }

    pub fn mark_cancelled(&mut self) {
        self.report.cancelled = true;
    }

    pub fn abort(&mut self, error: String) {
        self.report.aborted = Some(error);
    }

    pub fn finish(mut self, finished_at: DateTime<Utc>) -> BatchReport {
        self.report.finished_at = finished_at;
        self.report
    }
}

/// `destination,identity_id,error` with RFC 4180 quoting.
pub fn failure_log_csv(report: &BatchReport) -> String {
    let mut out = String::from("destination,identity_id,error\r\n");
    for entry in &report.failures {
        out.push_str(&csv_field(&entry.destination));
        out.push(',');
        out.push_str(&csv_field(&entry.identity_id));
        out.push(',');
        out.push_str(&csv_field(&entry.error));
        out.push_str("\r\n");
    }
    out
}

/// Newline-delimited artifact, e.g. duplicate labels from an import.
pub fn newline_artifact(lines: &[String]) -> String {
    lines.join("\n")
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
