//! Error types for saga orchestration.

use thiserror::Error;
use uuid::Uuid;

use super::state::SagaState;

/// Typed failure kinds raised by participants and the failure injector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    InsufficientStock,
    PaymentFailure,
    NetworkTimeout,
    DatabaseFailure,
    ServiceUnavailable,
}

impl FailureKind {
    pub const ALL: [FailureKind; 5] = [
        FailureKind::InsufficientStock,
        FailureKind::PaymentFailure,
        FailureKind::NetworkTimeout,
        FailureKind::DatabaseFailure,
        FailureKind::ServiceUnavailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::InsufficientStock => "InsufficientStock",
            FailureKind::PaymentFailure => "PaymentFailure",
            FailureKind::NetworkTimeout => "NetworkTimeout",
            FailureKind::DatabaseFailure => "DatabaseFailure",
            FailureKind::ServiceUnavailable => "ServiceUnavailable",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "InsufficientStock" => Ok(FailureKind::InsufficientStock),
            "PaymentFailure" => Ok(FailureKind::PaymentFailure),
            "NetworkTimeout" => Ok(FailureKind::NetworkTimeout),
            "DatabaseFailure" => Ok(FailureKind::DatabaseFailure),
            "ServiceUnavailable" => Ok(FailureKind::ServiceUnavailable),
            _ => Err(()),
        }
    }
}

/// Error taxonomy for saga operations
#[derive(Error, Debug, Clone)]
pub enum SagaError {
    /// Malformed request; surfaced to the caller, no saga is created
    #[error("Validation failed: {field}: {message}")]
    Validation { field: String, message: String },

    /// Unknown saga identifier
    #[error("Saga {saga_id} not found")]
    NotFound { saga_id: Uuid },

    /// A saga with this identifier already exists
    #[error("Saga {saga_id} already exists")]
    AlreadyExists { saga_id: Uuid },

    /// Guard against invalid state edges; a bug signal
    #[error("Illegal transition from {from} to {to} for saga {saga_id}")]
    IllegalTransition {
        saga_id: Uuid,
        from: SagaState,
        to: SagaState,
    },

    /// Operation not permitted in the saga's current state
    #[error("Saga {saga_id} in state {state} does not permit {operation}")]
    IllegalState {
        saga_id: Uuid,
        state: SagaState,
        operation: String,
    },

    /// Participant-raised step failure; triggers compensation
    #[error("Step failed in {service}: {kind}: {message}")]
    StepFailure {
        kind: FailureKind,
        service: String,
        message: String,
    },

    /// A compensation attempt failed; recorded, never aborts remaining compensations
    #[error("Compensation failed for saga {saga_id}: {errors:?}")]
    CompensationFailure { saga_id: Uuid, errors: Vec<String> },

    /// Transient state-store failure; retried with backoff
    #[error("Transient store failure: {reason}")]
    StoreTransient { reason: String },

    /// Non-retryable state-store failure; the saga is marked Failed
    #[error("Fatal store failure: {reason}")]
    StoreFatal { reason: String },

    /// Event publication failed after retry
    #[error("Failed to publish to {topic}: {reason}")]
    EventPublish { topic: String, reason: String },

    /// Payload (de)serialization failure
    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    /// Concurrent saga limit reached
    #[error("Maximum concurrent sagas limit reached ({limit})")]
    CapacityExceeded { limit: usize },
}

impl SagaError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SagaError::StoreTransient { .. } | SagaError::EventPublish { .. }
        )
    }

    /// Error category for metrics and monitoring
    pub fn category(&self) -> &'static str {
        match self {
            SagaError::Validation { .. } => "validation",
            SagaError::NotFound { .. } => "not_found",
            SagaError::AlreadyExists { .. } => "already_exists",
            SagaError::IllegalTransition { .. } => "illegal_transition",
            SagaError::IllegalState { .. } => "illegal_state",
            SagaError::StepFailure { kind, .. } => kind.as_str(),
            SagaError::CompensationFailure { .. } => "compensation",
            SagaError::StoreTransient { .. } => "store_transient",
            SagaError::StoreFatal { .. } => "store_fatal",
            SagaError::EventPublish { .. } => "event_publish",
            SagaError::Serialization { .. } => "serialization",
            SagaError::CapacityExceeded { .. } => "capacity",
        }
    }

    /// The failure kind, when the error carries one
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            SagaError::StepFailure { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SagaError {
    fn from(err: serde_json::Error) -> Self {
        SagaError::Serialization {
            reason: err.to_string(),
        }
    }
}

#[cfg(feature = "database-persistence")]
impl From<sqlx::Error> for SagaError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() || db.is_check_violation() => {
                SagaError::StoreFatal {
                    reason: err.to_string(),
                }
            }
            sqlx::Error::RowNotFound => SagaError::StoreFatal {
                reason: err.to_string(),
            },
            _ => SagaError::StoreTransient {
                reason: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryability() {
        let transient = SagaError::StoreTransient {
            reason: "pool exhausted".to_string(),
        };
        assert!(transient.is_retryable());

        let validation = SagaError::Validation {
            field: "store_id".to_string(),
            message: "must not be empty".to_string(),
        };
        assert!(!validation.is_retryable());

        let step = SagaError::StepFailure {
            kind: FailureKind::PaymentFailure,
            service: "payment-service".to_string(),
            message: "card declined".to_string(),
        };
        assert!(!step.is_retryable());
    }

    #[test]
    fn test_error_categories() {
        let step = SagaError::StepFailure {
            kind: FailureKind::InsufficientStock,
            service: "product-service".to_string(),
            message: "only 1 left".to_string(),
        };
        assert_eq!(step.category(), "InsufficientStock");
        assert_eq!(step.failure_kind(), Some(FailureKind::InsufficientStock));

        let fatal = SagaError::StoreFatal {
            reason: "constraint violation".to_string(),
        };
        assert_eq!(fatal.category(), "store_fatal");
        assert_eq!(fatal.failure_kind(), None);
    }

    #[test]
    fn test_failure_kind_round_trip() {
        for kind in FailureKind::ALL {
            let parsed: FailureKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("Unknown".parse::<FailureKind>().is_err());
    }
}
