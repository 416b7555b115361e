use axum::http::StatusCode;
use axum::Json;
use courier_contracts::{ErrorBody, ErrorResponse};
use courier_kernel::AllocationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("no eligible identities: {0}")]
    NoEligibleIdentities(String),
    #[error("no available targets in pool for tenant {0}")]
    NoAvailableTargets(String),
    #[error("egress {egress_id} is already leased")]
    AlreadyLeased { egress_id: String },
    #[error("identity {identity_id} is already bound to egress {egress_id}")]
    IdentityAlreadyBound {
        identity_id: String,
        egress_id: String,
    },
    #[error("identities already in an active batch: {}", .0.join(", "))]
    IdentityBusy(Vec<String>),
    #[error("{0} not found")]
    NotFound(String),
    #[error("store operation failed: {0}")]
    Store(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NoEligibleIdentities(_) => "admission.no_eligible_identities",
            Self::NoAvailableTargets(_) => "admission.no_available_targets",
            Self::AlreadyLeased { .. } => "admission.already_leased",
            Self::IdentityAlreadyBound { .. } => "admission.identity_already_bound",
            Self::IdentityBusy(_) => "admission.identity_busy",
            Self::NotFound(_) => "not_found",
            Self::Store(_) => "store_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::CONFLICT,
        }
    }

    pub fn from_allocation(err: AllocationError, tenant_id: &str, summary: String) -> Self {
        match err {
            AllocationError::NoEligibleIdentities => Self::NoEligibleIdentities(summary),
            AllocationError::NoAvailableTargets => Self::NoAvailableTargets(tenant_id.to_string()),
        }
    }

    pub fn into_response(self) -> (StatusCode, Json<ErrorResponse>) {
        (
            self.status(),
            Json(ErrorResponse {
                error: ErrorBody {
                    code: self.code().to_string(),
                    message: self.to_string(),
                },
            }),
        )
    }
}

/// Store backends report failures as plain strings.
impl From<String> for EngineError {
    fn from(message: String) -> Self {
        Self::Store(message)
    }
}
