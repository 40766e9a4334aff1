//! Error types for the cluster metadata server.
//!
//! Every fallible operation in the core returns [`MetaError`] through the
//! [`Result`] alias. The variants follow the failure classes the server has
//! to tell apart:
//!
//! - **Validation**: a malformed admin request, rejected before any directory call
//! - **Config**: missing or inconsistent configuration, including a missing
//!   metadata-store connection target
//! - **Directory / Store**: errors reported by the quorum layer or the
//!   metadata store; transient outside of startup
//! - **Conflict**: the optimistic WATCH/EXEC swap lost against a concurrent writer
//! - **VersionExhausted**: the snapshot version cannot advance any further
//! - **Serialization / Protocol / Io / Timeout**: plumbing failures

use std::io;
use thiserror::Error;

/// Main error type for cluster metadata operations.
#[derive(Error, Debug)]
pub enum MetaError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("instance directory error: {0}")]
    Directory(String),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("snapshot swap on {key} aborted by a concurrent writer")]
    Conflict { key: String },

    #[error("snapshot version {0} cannot be incremented")]
    VersionExhausted(u32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, MetaError>;

/// Response codes reported to HTTP callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    IllegalHttpMethod = 1,
    IllegalParam = 2,
    SysError = 3,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::IllegalHttpMethod => "illegal http method",
            ErrorCode::IllegalParam => "illegal parameter",
            ErrorCode::SysError => "system error",
        }
    }
}

impl MetaError {
    /// Whether the failure is expected to clear up on a later trigger
    /// (next event, next reconciliation pass) without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MetaError::Directory(_)
                | MetaError::Store(_)
                | MetaError::Conflict { .. }
                | MetaError::Io(_)
                | MetaError::Timeout(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, MetaError::Conflict { .. })
    }

    /// Code reported at the HTTP boundary.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MetaError::Validation(_) => ErrorCode::IllegalParam,
            _ => ErrorCode::SysError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MetaError::Conflict { key: "meta".into() }.is_transient());
        assert!(MetaError::Directory("down".into()).is_transient());
        assert!(MetaError::Timeout("hgetall".into()).is_transient());
        assert!(!MetaError::Validation("port".into()).is_transient());
        assert!(!MetaError::Config("no target".into()).is_transient());
        assert!(!MetaError::VersionExhausted(u32::MAX).is_transient());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(MetaError::Validation("x".into()).error_code(), ErrorCode::IllegalParam);
        assert_eq!(MetaError::Store("x".into()).error_code(), ErrorCode::SysError);
        assert_eq!(ErrorCode::Ok.as_u32(), 0);
        assert_eq!(ErrorCode::SysError.as_u32(), 3);
    }

    #[test]
    fn test_conflict_message_names_key() {
        let err = MetaError::Conflict { key: "cluster_meta".into() };
        assert!(err.to_string().contains("cluster_meta"));
        assert!(err.is_conflict());
    }
}
