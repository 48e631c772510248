// =============================================================================
// ERROR MODULE
// =============================================================================
// Error taxonomy for bed allocation, the resource ledger and the admission
// flows, plus the mapping from each error to an HTTP response.
//
// Allocation and ledger operations return these as structured failures that
// name the kind and carry a human-readable message. The orchestrator decides
// whether a failure halts the workflow or is recorded as a warning.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{DepartmentAlternative, ErrorResponse};

#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // CAPACITY ERRORS
    // -------------------------------------------------------------------------
    /// Referenced department does not exist
    #[error("Department not found: {0}")]
    DepartmentNotFound(Uuid),

    /// Department has no beds of any status
    #[error("Department {department} has no beds configured. Add beds to the department before admitting patients")]
    NoBedsConfigured { department: String },

    /// Every bed in the department is occupied
    ///
    /// `suggestions` lists other departments with at least one free bed,
    /// least utilized first.
    #[error("Department {department} is at full capacity ({occupied}/{total} beds occupied)")]
    CapacityExceeded {
        department: String,
        occupied: i64,
        total: i64,
        suggestions: Vec<DepartmentAlternative>,
    },

    #[error("Bed not found: {0}")]
    BedNotFound(Uuid),

    /// Bed was claimed or moved between lookup and claim
    #[error("Bed {0} is no longer available")]
    BedUnavailable(String),

    #[error("Patient not found: {0}")]
    PatientNotFound(String),

    // -------------------------------------------------------------------------
    // LEDGER ERRORS
    // -------------------------------------------------------------------------
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Only idle units can be transferred or allocated
    #[error("Insufficient available units: available {available}, requested {requested}")]
    InsufficientAvailable { available: i32, requested: i32 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Billing or assessment service call failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code, also used as a metrics label
    pub fn code(&self) -> &'static str {
        match self {
            AppError::DepartmentNotFound(_) => "DEPARTMENT_NOT_FOUND",
            AppError::NoBedsConfigured { .. } => "NO_BEDS_CONFIGURED",
            AppError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            AppError::BedNotFound(_) => "BED_NOT_FOUND",
            AppError::BedUnavailable(_) => "BED_UNAVAILABLE",
            AppError::PatientNotFound(_) => "PATIENT_NOT_FOUND",
            AppError::ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            AppError::InsufficientAvailable { .. } => "INSUFFICIENT_AVAILABLE",
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Cache(_) => "CACHE_ERROR",
            AppError::Collaborator(_) => "COLLABORATOR_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::DepartmentNotFound(_)
            | AppError::BedNotFound(_)
            | AppError::PatientNotFound(_)
            | AppError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
            AppError::CapacityExceeded { .. }
            | AppError::BedUnavailable(_)
            | AppError::InsufficientAvailable { .. } => StatusCode::CONFLICT,
            AppError::NoBedsConfigured { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Collaborator(_) => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Cache(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        // Don't leak driver messages to clients
        let message = match &self {
            AppError::Database(_) => "A database error occurred".to_string(),
            AppError::Cache(_) => "A cache error occurred".to_string(),
            other => other.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error_code = code, error = %self, "Request failed");
        } else {
            tracing::warn!(error_code = code, message = %message, "Request rejected");
        }

        let mut body = ErrorResponse::new(code, message);
        if let AppError::CapacityExceeded { suggestions, .. } = self {
            body.suggestions = Some(suggestions);
        }

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Collaborator(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_exceeded_message_states_occupied_over_total() {
        let err = AppError::CapacityExceeded {
            department: "ICU".to_string(),
            occupied: 2,
            total: 2,
            suggestions: vec![],
        };
        assert_eq!(
            err.to_string(),
            "Department ICU is at full capacity (2/2 beds occupied)"
        );
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn no_beds_configured_is_unprocessable() {
        let err = AppError::NoBedsConfigured {
            department: "Radiology".into(),
        };
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.to_string().contains("Add beds"));
    }
}
