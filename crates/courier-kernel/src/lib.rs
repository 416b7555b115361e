use chrono::{DateTime, Duration, TimeZone, Utc};
use courier_contracts::{
    ActionResponse, EgressDescriptor, Exclusion, ExclusionReason, FatalSignal, Identity,
    IdentityStatus, RemoteOutcome, Target, WireOutcome,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

const SECONDS_PER_DAY: i64 = 86_400;
const LABEL_MARKER: char = '@';

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn stable_identity_id(tenant_id: &str, label_key: &str) -> String {
    hash_id("idn", &[tenant_id, label_key])
}

pub fn stable_target_id(tenant_id: &str, label_key: &str) -> String {
    hash_id("tgt", &[tenant_id, label_key])
}

pub fn stable_egress_id(tenant_id: &str, descriptor: &EgressDescriptor) -> String {
    let port = descriptor.port.to_string();
    hash_id(
        "egr",
        &[
            tenant_id,
            &descriptor.host.to_ascii_lowercase(),
            &port,
            descriptor.username.as_deref().unwrap_or(""),
        ],
    )
}

/// A handle as displayed and the case-folded key it is compared by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedLabel {
    pub display: String,
    pub key: String,
}

pub fn normalize_label(raw: &str) -> Option<NormalizedLabel> {
    let trimmed = raw.trim();
    let display = trimmed.strip_prefix(LABEL_MARKER).unwrap_or(trimmed).trim();
    if display.is_empty() {
        return None;
    }
    Some(NormalizedLabel {
        display: display.to_string(),
        key: display.to_lowercase(),
    })
}

/// Accepts `host:port`, `host:port:user:pass` and `user:pass@host:port`.
pub fn parse_egress_line(line: &str) -> Result<EgressDescriptor, String> {
    let line = line.trim();
    if line.is_empty() {
        return Err("empty line".to_string());
    }

    let (auth, endpoint) = match line.rsplit_once('@') {
        Some((auth, endpoint)) => (Some(auth), endpoint),
        None => (None, line),
    };

    let parts: Vec<&str> = endpoint.split(':').collect();
    let (host, port, mut username, mut password) = match parts.as_slice() {
        [host, port] => (*host, *port, None, None),
        [host, port, user, pass] if auth.is_none() => (*host, *port, Some(*user), Some(*pass)),
        _ => return Err("expected host:port or host:port:username:password".to_string()),
    };

    if let Some(auth) = auth {
        match auth.split_once(':') {
            Some((user, pass)) => {
                username = Some(user);
                password = Some(pass);
            }
            None => username = Some(auth),
        }
    }

    let host = host.trim();
    if host.is_empty() {
        return Err("host must not be empty".to_string());
    }
    let port: u16 = port
        .trim()
        .parse()
        .map_err(|_| format!("port {:?} is not numeric", port.trim()))?;
    if port == 0 {
        return Err("port must be between 1 and 65535".to_string());
    }

    Ok(EgressDescriptor {
        host: host.to_string(),
        port,
        username: username
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string),
        password: password.filter(|v| !v.is_empty()).map(str::to_string),
    })
}

pub fn day_bucket(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(SECONDS_PER_DAY)
}

pub fn next_day_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    let next = (day_bucket(ts) + 1) * SECONDS_PER_DAY;
    Utc.timestamp_opt(next, 0).single().unwrap_or(ts)
}

/// Sends counted against today's quota; zero once the window's day has passed.
pub fn effective_daily_count(identity: &Identity, now: DateTime<Utc>) -> u32 {
    match identity.daily_send_window_start {
        Some(start) if day_bucket(start) == day_bucket(now) => identity.daily_send_count,
        _ => 0,
    }
}

#[derive(Debug, Clone)]
pub struct EligibilityPolicy {
    pub cooldown: Duration,
    pub daily_limit: u32,
}

impl EligibilityPolicy {
    pub fn from_millis(cooldown_ms: u64, daily_limit: u32) -> Self {
        Self {
            cooldown: Duration::milliseconds(cooldown_ms.min(i64::MAX as u64) as i64),
            daily_limit,
        }
    }

    pub fn quota_exhausted(&self, identity: &Identity, now: DateTime<Utc>) -> bool {
        effective_daily_count(identity, now) >= self.daily_limit
    }
}

impl Default for EligibilityPolicy {
    fn default() -> Self {
        Self::from_millis(10 * 60 * 1000, 5)
    }
}

pub fn check_eligibility(
    identity: &Identity,
    now: DateTime<Utc>,
    policy: &EligibilityPolicy,
) -> Result<(), ExclusionReason> {
    if identity.status != IdentityStatus::Active {
        return Err(ExclusionReason::NotActive {
            status: identity.status,
        });
    }
    if let Some(last) = identity.last_action_at {
        let until = last + policy.cooldown;
        if now < until {
            return Err(ExclusionReason::CoolingDown { until });
        }
    }
    if policy.quota_exhausted(identity, now) {
        return Err(ExclusionReason::QuotaExhausted {
            resets_at: next_day_start(now),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct EligibilitySplit {
    pub eligible: Vec<Identity>,
    pub excluded: Vec<Exclusion>,
}

impl EligibilitySplit {
    /// Human-readable breakdown used when nothing is eligible.
    pub fn exclusion_summary(&self) -> String {
        let mut not_active = 0usize;
        let mut cooling = 0usize;
        let mut quota = 0usize;
        for exclusion in &self.excluded {
            match exclusion.reason {
                ExclusionReason::NotActive { .. } => not_active += 1,
                ExclusionReason::CoolingDown { .. } => cooling += 1,
                ExclusionReason::QuotaExhausted { .. } => quota += 1,
            }
        }
        if self.excluded.is_empty() {
            return "no identities selected".to_string();
        }
        format!("{cooling} cooling down, {quota} quota exhausted, {not_active} not active")
    }
}

/// Keeps input order for both halves.
pub fn partition_eligible(
    identities: Vec<Identity>,
    now: DateTime<Utc>,
    policy: &EligibilityPolicy,
) -> EligibilitySplit {
    let mut split = EligibilitySplit::default();
    for identity in identities {
        match check_eligibility(&identity, now, policy) {
            Ok(()) => split.eligible.push(identity),
            Err(reason) => split.excluded.push(Exclusion {
                identity_id: identity.id.clone(),
                reason,
            }),
        }
    }
    split
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    ValidationSucceeded,
    ValidationFailed,
    Unauthenticated,
    Banned,
}

pub fn next_status(current: IdentityStatus, event: LifecycleEvent) -> IdentityStatus {
    use IdentityStatus::*;
    match (current, event) {
        (_, LifecycleEvent::Banned) => Suspended,
        (_, LifecycleEvent::ValidationSucceeded) => Active,
        (Pending | Active, LifecycleEvent::ValidationFailed | LifecycleEvent::Unauthenticated) => {
            Expired
        }
        (status, _) => status,
    }
}

pub fn validation_event(outcome: &RemoteOutcome) -> LifecycleEvent {
    match outcome {
        RemoteOutcome::Success { .. } | RemoteOutcome::Duplicate { .. } => {
            LifecycleEvent::ValidationSucceeded
        }
        RemoteOutcome::FatalError {
            signal: FatalSignal::Banned,
            ..
        } => LifecycleEvent::Banned,
        _ => LifecycleEvent::ValidationFailed,
    }
}

pub fn display_name_from_detail(detail: &Value) -> Option<String> {
    ["display_name", "full_name", "username"]
        .iter()
        .find_map(|key| detail.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Validates a raw response body into the closed outcome set.
pub fn parse_action_response(response: ActionResponse) -> RemoteOutcome {
    match response.outcome {
        WireOutcome::Success => RemoteOutcome::Success {
            detail: response.detail,
        },
        WireOutcome::Duplicate => RemoteOutcome::Duplicate {
            detail: response.detail,
        },
        WireOutcome::RecoverableError => RemoteOutcome::RecoverableError {
            message: detail_message(&response.detail, "recoverable remote error"),
        },
        WireOutcome::FatalError => RemoteOutcome::FatalError {
            signal: fatal_signal(&response.detail),
            message: detail_message(&response.detail, "fatal remote error"),
        },
    }
}

fn fatal_signal(detail: &Value) -> FatalSignal {
    match detail.get("signal").and_then(Value::as_str) {
        Some(
            "banned" | "suspended" | "challenge_required" | "checkpoint_required"
            | "feedback_required",
        ) => FatalSignal::Banned,
        _ => FatalSignal::Unauthenticated,
    }
}

fn detail_message(detail: &Value, fallback: &str) -> String {
    match detail {
        Value::Null => fallback.to_string(),
        Value::String(s) => s.clone(),
        _ => ["message", "error"]
            .iter()
            .find_map(|key| detail.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| detail.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Explicit(String),
    Target { id: String, label: String },
}

impl Destination {
    pub fn label(&self) -> &str {
        match self {
            Self::Explicit(label) => label,
            Self::Target { label, .. } => label,
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::Explicit(_) => None,
            Self::Target { id, .. } => Some(id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pairing {
    pub identity: Identity,
    pub destination: Destination,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("no eligible identities")]
    NoEligibleIdentities,
    #[error("no available targets in pool")]
    NoAvailableTargets,
}

/// Round robin: destination `i` goes to identity `i mod n`.
pub fn allocate_explicit(
    identities: &[Identity],
    destinations: &[String],
) -> Result<Vec<Pairing>, AllocationError> {
    if identities.is_empty() {
        return Err(AllocationError::NoEligibleIdentities);
    }
    Ok(destinations
        .iter()
        .enumerate()
        .map(|(i, destination)| Pairing {
            identity: identities[i % identities.len()].clone(),
            destination: Destination::Explicit(destination.clone()),
        })
        .collect())
}

#[derive(Debug, Clone, Default)]
pub struct PoolAllocation {
    pub pairs: Vec<Pairing>,
    pub surplus: Vec<Identity>,
}

pub fn allocate_pool(
    identities: &[Identity],
    targets: &[Target],
) -> Result<PoolAllocation, AllocationError> {
    if identities.is_empty() {
        return Err(AllocationError::NoEligibleIdentities);
    }
    if targets.is_empty() {
        return Err(AllocationError::NoAvailableTargets);
    }
    let paired = identities.len().min(targets.len());
    Ok(PoolAllocation {
        pairs: identities
            .iter()
            .zip(targets.iter())
            .map(|(identity, target)| Pairing {
                identity: identity.clone(),
                destination: Destination::Target {
                    id: target.id.clone(),
                    label: target.label.clone(),
                },
            })
            .collect(),
        surplus: identities[paired..].to_vec(),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Success,
    Duplicate,
    RecoverableFailure { error: String },
    FatalFailure { signal: FatalSignal, error: String },
}

pub fn classify(outcome: &RemoteOutcome) -> Classification {
    match outcome {
        RemoteOutcome::Success { .. } => Classification::Success,
        RemoteOutcome::Duplicate { .. } => Classification::Duplicate,
        RemoteOutcome::RecoverableError { message } => Classification::RecoverableFailure {
            error: message.clone(),
        },
        RemoteOutcome::FatalError { signal, message } => Classification::FatalFailure {
            signal: *signal,
            error: message.clone(),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityEffect {
    None,
    RecordSuccess,
    Transition { event: LifecycleEvent, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEffect {
    None,
    MarkUsed,
    MarkProblem(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEffect {
    pub identity: IdentityEffect,
    pub target: TargetEffect,
}

/// Target effects only apply to pool-mode pairs.
pub fn plan_effects(classification: &Classification, pool_mode: bool) -> LedgerEffect {
    let target = |effect: TargetEffect| if pool_mode { effect } else { TargetEffect::None };
    match classification {
        Classification::Success => LedgerEffect {
            identity: IdentityEffect::RecordSuccess,
            target: target(TargetEffect::MarkUsed),
        },
        Classification::Duplicate => LedgerEffect {
            identity: IdentityEffect::None,
            target: target(TargetEffect::MarkUsed),
        },
        Classification::RecoverableFailure { error } => LedgerEffect {
            identity: IdentityEffect::None,
            target: target(TargetEffect::MarkProblem(error.clone())),
        },
        Classification::FatalFailure { signal, error } => LedgerEffect {
            identity: IdentityEffect::Transition {
                event: match signal {
                    FatalSignal::Banned => LifecycleEvent::Banned,
                    FatalSignal::Unauthenticated => LifecycleEvent::Unauthenticated,
                },
                error: error.clone(),
            },
            target: target(TargetEffect::MarkProblem(error.clone())),
        },
    }
}

pub fn record_success(identity: &mut Identity, now: DateTime<Utc>) {
    let today = effective_daily_count(identity, now);
    if today == 0 {
        identity.daily_send_window_start = Some(now);
    }
    identity.daily_send_count = today + 1;
    identity.lifetime_sent_count += 1;
    identity.last_action_at = Some(now);
    identity.last_error = None;
}

/// Returns the previous status.
pub fn apply_transition(
    identity: &mut Identity,
    event: LifecycleEvent,
    error: Option<String>,
) -> IdentityStatus {
    let before = identity.status;
    identity.status = next_status(before, event);
    if error.is_some() {
        identity.last_error = error;
    }
    before
}

fn hash_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("{prefix}_{short}")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
