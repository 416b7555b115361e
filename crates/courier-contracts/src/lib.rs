use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const CONTRACT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Pending,
    Active,
    Expired,
    Suspended,
}

impl IdentityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Suspended => "suspended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// Opaque session secret. `Debug` is redacted and it is never serialized.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Identity {
    pub id: String,
    pub tenant_id: String,
    pub label: String,
    #[serde(skip_serializing)]
    pub credential: Credential,
    pub status: IdentityStatus,
    pub bound_egress_id: Option<String>,
    pub daily_send_count: u32,
    pub daily_send_window_start: Option<DateTime<Utc>>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub lifetime_sent_count: u64,
    pub display_name: Option<String>,
    pub last_error: Option<String>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EgressStatus {
    Available,
    Leased,
}

impl EgressStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Leased => "leased",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(Self::Available),
            "leased" => Some(Self::Leased),
            _ => None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EgressDescriptor {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for EgressDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EgressDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Egress {
    pub id: String,
    pub tenant_id: String,
    pub descriptor: EgressDescriptor,
    pub status: EgressStatus,
    pub leased_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Egress as shown to operators; the proxy password stays in the store.
#[derive(Debug, Clone, Serialize)]
pub struct EgressView {
    pub id: String,
    pub tenant_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub has_password: bool,
    pub status: EgressStatus,
    pub leased_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&Egress> for EgressView {
    fn from(egress: &Egress) -> Self {
        Self {
            id: egress.id.clone(),
            tenant_id: egress.tenant_id.clone(),
            host: egress.descriptor.host.clone(),
            port: egress.descriptor.port,
            username: egress.descriptor.username.clone(),
            has_password: egress.descriptor.password.is_some(),
            status: egress.status,
            leased_to: egress.leased_to.clone(),
            created_at: egress.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Available,
    Used,
    Problem,
}

impl TargetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Used => "used",
            Self::Problem => "problem",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(Self::Available),
            "used" => Some(Self::Used),
            "problem" => Some(Self::Problem),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    pub id: String,
    pub tenant_id: String,
    pub label: String,
    /// Position in the pool; assigned by the store on insert.
    pub seq: i64,
    pub status: TargetStatus,
    pub last_assigned_identity_id: Option<String>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Validate,
    Send,
    Post,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Send => "send",
            Self::Post => "post",
        }
    }
}

/// Request sent across the remote action boundary.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    pub v: u32,
    pub action: ActionKind,
    #[serde(serialize_with = "serialize_credential")]
    pub credential: Credential,
    pub destination: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress: Option<EgressDescriptor>,
}

fn serialize_credential<S>(credential: &Credential, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(credential.expose())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WireOutcome {
    Success,
    Duplicate,
    RecoverableError,
    FatalError,
}

/// Raw response body of the remote action service, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub outcome: WireOutcome,
    #[serde(default)]
    pub detail: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FatalSignal {
    Banned,
    Unauthenticated,
}

/// Validated outcome of one remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Success { detail: Value },
    Duplicate { detail: Value },
    RecoverableError { message: String },
    FatalError { signal: FatalSignal, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BatchTargets {
    Explicit { destinations: Vec<String> },
    Pool,
}

impl BatchTargets {
    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Explicit { .. } => "explicit",
            Self::Pool => "pool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub identity_ids: Vec<String>,
    pub action: ActionKind,
    pub targets: BatchTargets,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    NotActive { status: IdentityStatus },
    CoolingDown { until: DateTime<Utc> },
    QuotaExhausted { resets_at: DateTime<Utc> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Exclusion {
    pub identity_id: String,
    #[serde(flatten)]
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Succeeded,
    Duplicate,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportItem {
    pub identity_id: Option<String>,
    pub destination: Option<String>,
    pub outcome: ItemOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureEntry {
    pub destination: String,
    pub identity_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub batch_id: String,
    pub tenant_id: String,
    pub mode: String,
    pub action: ActionKind,
    pub payload_sha256: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    /// Set when a store error ended the batch early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub excluded: Vec<Exclusion>,
    pub items: Vec<ReportItem>,
    pub failures: Vec<FailureEntry>,
    pub failure_log_overflow: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialInput {
    pub label: String,
    pub credential: Credential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImportRequest {
    pub tenant_id: String,
    pub credentials: Vec<CredentialInput>,
    #[serde(default)]
    pub validate: Option<bool>,
}

/// Empty `identity_ids` selects every identity of the tenant except suspended ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidateRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub identity_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EgressImportRequest {
    pub tenant_id: String,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaseRequest {
    pub tenant_id: String,
    pub egress_id: String,
    pub identity_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseRequest {
    pub tenant_id: String,
    pub egress_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnqueueRequest {
    pub tenant_id: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResetProblemsRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub target_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationItem {
    pub identity_id: String,
    pub label: String,
    pub status_before: IdentityStatus,
    pub status_after: IdentityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub attempted: usize,
    pub activated: usize,
    pub expired: usize,
    pub suspended: usize,
    pub skipped: usize,
    pub items: Vec<ValidationItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportReport {
    pub imported: usize,
    pub invalid: usize,
    pub duplicates: Vec<String>,
    pub identity_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnqueueReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectedLine {
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EgressImportReport {
    pub admitted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub rejected_lines: Vec<RejectedLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
