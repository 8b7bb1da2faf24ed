//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// rule violations, missing aggregates). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A command payload failed structural checks before any state was consulted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A business rule computed from current aggregate state was violated.
    ///
    /// `kind` is the stable identity of the violated rule (e.g. `DUPLICATE_ISBN`).
    #[error("rejected ({kind}): {message}")]
    Rejected { kind: String, message: String },

    /// An identifier was invalid (e.g. empty or malformed).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The command targets an aggregate that does not exist yet.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stale version / optimistic concurrency conflict.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn rejected(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Rejected {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Rule identity for rejections, `None` for every other error class.
    pub fn rejection_kind(&self) -> Option<&str> {
        match self {
            Self::Rejected { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_kind_is_exposed_only_for_rejections() {
        let err = DomainError::rejected("DUPLICATE_ISBN", "isbn already present");
        assert_eq!(err.rejection_kind(), Some("DUPLICATE_ISBN"));
        assert_eq!(err.to_string(), "rejected (DUPLICATE_ISBN): isbn already present");

        assert_eq!(DomainError::validation("x").rejection_kind(), None);
        assert_eq!(DomainError::not_found("lib1").rejection_kind(), None);
    }
}
