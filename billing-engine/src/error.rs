//! Error taxonomy for the billing engine.

use service_core::retry::{RetryError, Retryable};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed formula, missing unit amount, conflicting interest setup.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Formula parse or evaluation failure.
    #[error("Evaluation error: {0}")]
    EvaluationError(String),

    /// Lost a race for a row lock or an optimistic version check.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Retries exhausted for {operation} after {attempts} attempts")]
    RetryExhausted { operation: String, attempts: u32 },

    /// A monetary invariant would be broken. Always a defect.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration load error: {0}")]
    ConfigError(anyhow::Error),
}

impl BillingError {
    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::ConfigurationError(_) => "configuration",
            BillingError::EvaluationError(_) => "evaluation",
            BillingError::ConcurrencyConflict(_) => "concurrency_conflict",
            BillingError::RetryExhausted { .. } => "retry_exhausted",
            BillingError::InvariantViolation(_) => "invariant_violation",
            BillingError::NotFound(_) => "not_found",
            BillingError::BadRequest(_) => "bad_request",
            BillingError::DatabaseError(_) => "database",
            BillingError::ConfigError(_) => "config",
        }
    }

    /// Failures that only affect one unit or quota inside a batch.
    pub fn is_item_failure(&self) -> bool {
        matches!(
            self,
            BillingError::ConfigurationError(_) | BillingError::EvaluationError(_)
        )
    }
}

impl Retryable for BillingError {
    fn is_retryable(&self) -> bool {
        matches!(self, BillingError::ConcurrencyConflict(_))
    }
}

impl From<RetryError<BillingError>> for BillingError {
    fn from(err: RetryError<BillingError>) -> Self {
        match err {
            RetryError::Exhausted {
                operation,
                attempts,
                ..
            } => BillingError::RetryExhausted {
                operation,
                attempts,
            },
            RetryError::Permanent(e) => e,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db_err) => match db_err.code().as_deref() {
                // serialization_failure, deadlock_detected, lock_not_available
                Some("40001") | Some("40P01") | Some("55P03") => {
                    BillingError::ConcurrencyConflict(db_err.message().to_string())
                }
                _ => BillingError::DatabaseError(anyhow::Error::new(err)),
            },
            _ => BillingError::DatabaseError(anyhow::Error::new(err)),
        }
    }
}

impl From<config::ConfigError> for BillingError {
    fn from(err: config::ConfigError) -> Self {
        BillingError::ConfigError(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(BillingError::ConcurrencyConflict("busy".into()).is_retryable());
        assert!(!BillingError::InvariantViolation("sum".into()).is_retryable());
        assert!(!BillingError::NotFound(anyhow::anyhow!("gone")).is_retryable());
    }

    #[test]
    fn exhausted_retry_maps_to_retry_exhausted() {
        let err: BillingError = RetryError::Exhausted {
            operation: "allocate_payment".to_string(),
            attempts: 4,
            last: BillingError::ConcurrencyConflict("locked".into()),
        }
        .into();

        match err {
            BillingError::RetryExhausted {
                operation,
                attempts,
            } => {
                assert_eq!(operation, "allocate_payment");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn permanent_retry_error_is_unwrapped() {
        let err: BillingError =
            RetryError::Permanent(BillingError::BadRequest(anyhow::anyhow!("nope"))).into();
        assert_eq!(err.kind(), "bad_request");
    }
}
