//! Error handling - Hierarchical errors with a machine-parseable kind

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Chimera error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input or missing required fields; caller must fix the input
    #[error("Validation failed: {0}")]
    Structural(String),

    /// Well-formed but semantically invalid combination (leverage, OCO ordering, ...)
    #[error("Business logic validation failed: {0}")]
    BusinessRule(String),

    /// Risk limits refused the intent at routing time
    #[error("Gate rejected: {0}")]
    GateRejection(String),

    /// Exchange refused the order; terminal for the affected slice
    #[error("Exchange rejected: {0}")]
    ExchangeRejection(String),

    /// Exchange transport / adapter failure
    #[error("Exchange error: {0}")]
    Exchange(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Operation interrupted by cancel request or shutdown
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error taxonomy as reported to callers.
///
/// A gate failure during a decision is a SKIP, not an error; only an entry
/// refused at routing time travels as `GateRejection`. `ExecutionTimeout` and
/// `ConcurrencyConflict` never travel as an [`Error`]; they are listed so audit
/// records and logs share one vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    StructuralValidation,
    BusinessRuleViolation,
    GateRejection,
    ExecutionTimeout,
    ExchangeRejection,
    ConcurrencyConflict,
    Exchange,
    Config,
    InvalidState,
    Cancelled,
    Serialization,
}

/// Response body for a failed request: `{"kind": ..., "error": ..., "details": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub error: String,
    pub details: String,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Structural(_) => ErrorKind::StructuralValidation,
            Error::BusinessRule(_) => ErrorKind::BusinessRuleViolation,
            Error::GateRejection(_) => ErrorKind::GateRejection,
            Error::ExchangeRejection(_) => ErrorKind::ExchangeRejection,
            Error::Exchange(_) => ErrorKind::Exchange,
            Error::Config(_) => ErrorKind::Config,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Validation errors are never worth resubmitting unchanged.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Structural(_) | Error::BusinessRule(_))
    }

    pub fn to_body(&self) -> ErrorBody {
        let (error, details) = match self {
            Error::Structural(d) => ("Validation failed", d.clone()),
            Error::BusinessRule(d) => ("Business logic validation failed", d.clone()),
            Error::GateRejection(d) => ("Gate rejected", d.clone()),
            Error::ExchangeRejection(d) => ("Exchange rejected order", d.clone()),
            Error::Exchange(d) => ("Exchange error", d.clone()),
            Error::Config(d) => ("Configuration error", d.clone()),
            Error::InvalidState(d) => ("Invalid state", d.clone()),
            Error::Cancelled(d) => ("Cancelled", d.clone()),
            Error::Serialization(e) => ("Invalid JSON format", e.to_string()),
        };
        ErrorBody {
            kind: self.kind(),
            error: error.to_string(),
            details,
        }
    }
}
