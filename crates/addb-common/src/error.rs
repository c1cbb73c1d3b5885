//! Error types for ADDB
//!
//! Posting never surfaces errors to the instrumented caller; these variants
//! are returned by configuration, registration, counter and repository
//! operations.

use thiserror::Error;

/// Common result type for ADDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for ADDB
#[derive(Debug, Error)]
pub enum Error {
    // Resource errors
    #[error("out of memory: cannot allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("capacity exceeded: requested {requested} pages, max {max}")]
    CapacityExceeded { requested: usize, max: usize },

    #[error("counter overflow")]
    Overflow,

    // Registration errors
    #[error("duplicate {kind} id: {id}")]
    DuplicateId { kind: &'static str, id: u32 },

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    // Configuration errors
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    // Repository errors
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    // Network errors
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timeout")]
    Timeout,
}

impl Error {
    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid descriptor error
    pub fn invalid_descriptor(msg: impl Into<String>) -> Self {
        Self::InvalidDescriptor(msg.into())
    }

    /// Create an invalid format error
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Check if the caller may retry after releasing resources
    /// (posting and resetting a counter, draining a store).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. } | Self::Overflow | Self::Transport(_) | Self::Timeout
        )
    }

    /// Check if this error indicates a programming mistake rather than a
    /// runtime condition
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateId { .. }
                | Self::InvalidDescriptor(_)
                | Self::InvalidState(_)
                | Self::InvalidArgument(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Overflow.is_retryable());
        assert!(Error::OutOfMemory { requested: 64 }.is_retryable());
        assert!(Error::transport("reset").is_retryable());
        assert!(!Error::invalid_format("bad header").is_retryable());
    }

    #[test]
    fn test_error_usage() {
        assert!(
            Error::DuplicateId {
                kind: "record type",
                id: 7
            }
            .is_usage_error()
        );
        assert!(Error::invalid_state("no sink").is_usage_error());
        assert!(!Error::Overflow.is_usage_error());
    }

    #[test]
    fn test_error_display() {
        let err = Error::CapacityExceeded {
            requested: 40,
            max: 36,
        };
        assert_eq!(
            err.to_string(),
            "capacity exceeded: requested 40 pages, max 36"
        );
    }
}
