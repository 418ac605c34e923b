//! Error taxonomy for the control surface
//!
//! Probes never raise; they collect failures into the sample. Everything the
//! outer transport calls goes through these kinds so it can map them to
//! status codes without string matching.

use thiserror::Error;

/// Core error kinds exposed to callers of engine operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Bad input: malformed range, out-of-bounds threshold, duplicate device.
    #[error("invalid input: {0}")]
    Invalid(String),

    /// Operation collides with in-flight state (scan already running,
    /// alert already acknowledged, monitoring already started).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Every probe to the device failed.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Store or I/O failure that is not the caller's fault.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        CoreError::Invalid(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn unreachable<S: Into<String>>(msg: S) -> Self {
        CoreError::Unreachable(msg.into())
    }

    /// Stable kind string for transport-level mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Invalid(_) => "invalid",
            CoreError::Conflict(_) => "conflict",
            CoreError::NotFound(_) => "not_found",
            CoreError::Unreachable(_) => "unreachable",
            CoreError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(CoreError::invalid("x").kind(), "invalid");
        assert_eq!(CoreError::conflict("x").kind(), "conflict");
        assert_eq!(CoreError::not_found("x").kind(), "not_found");
        assert_eq!(CoreError::unreachable("x").kind(), "unreachable");
        assert_eq!(
            CoreError::Internal(anyhow::anyhow!("boom")).kind(),
            "internal"
        );
    }

    #[test]
    fn test_display_carries_the_message() {
        let error = CoreError::conflict("a scan is already in progress");
        assert_eq!(error.to_string(), "conflict: a scan is already in progress");

        let wrapped = CoreError::Internal(anyhow::anyhow!("disk full"));
        assert_eq!(wrapped.to_string(), "disk full");
    }
}
