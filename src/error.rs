//! Error types for SetuSLAM.
//!
//! # Error Recovery Strategies
//!
//! Different error kinds require different recovery approaches:
//!
//! ## Input validation (log and drop)
//!
//! - **`InvalidKey`**: A key literal could not be parsed. The offending
//!   message is dropped; the graph is unchanged.
//! - **`InsufficientOdometry`**: The odometry buffer has no bracketing
//!   samples around a requested stamp. The factor request is skipped and
//!   retried on the next estimate cycle.
//!
//! ## Constraint violations (reject, graph unchanged)
//!
//! - **`AlreadyInitialized`** / **`NotInitialized`**: Graph lifecycle misuse.
//! - **`ConstraintViolation`**: Duplicate prior, factor referencing an
//!   unknown key, non-monotonic odometry. The offending factor is rejected.
//! - **`OdomChainGap`**: A loop closure references keys not on the odometry
//!   spine. Non-fatal; the candidate is discarded.
//!
//! ## Numeric failures (retry once, then revert)
//!
//! - **`CovarianceNotPositiveDefinite`**: Compounded covariance degenerated.
//!   The candidate under test is rejected.
//! - **`SolverFailure`** / **`IcpFailure`**: Optimization or registration
//!   diverged after the damped retry. The caller keeps the pre-call snapshot.
//!
//! ## I/O failures (propagate to the invoking service call)
//!
//! - **`CorruptArchive`**: Version mismatch or missing keyed scan on load.
//!   Partial writes are rolled back by the temp-file + rename discipline.

use std::fmt;

use thiserror::Error;

use crate::core::types::Key;

/// Errors that can occur in the SLAM back-end.
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum SlamError {
    #[error("pose graph already initialized")]
    AlreadyInitialized,

    #[error("pose graph not initialized")]
    NotInitialized,

    #[error("key not found: {0}")]
    KeyNotFound(Key),

    #[error("no key within {threshold_us} us of stamp {stamp_us}")]
    NoKeyAtTime { stamp_us: u64, threshold_us: u64 },

    #[error("invalid key literal: {0}")]
    InvalidKey(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("odometry chain gap between {from} and {to}")]
    OdomChainGap { from: Key, to: Key },

    #[error("insufficient odometry around stamp {0} us")]
    InsufficientOdometry(u64),

    #[error("covariance not positive definite")]
    CovarianceNotPositiveDefinite,

    #[error("solver failure: {0}")]
    SolverFailure(String),

    #[error("ICP failure: {0}")]
    IcpFailure(String),

    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, SlamError>;

/// Process exit codes for the service surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    InitializationFailure = 1,
    SolverFailure = 2,
    CorruptArchive = 3,
}

impl SlamError {
    /// Map an error to the process exit code reported to operators.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            SlamError::AlreadyInitialized | SlamError::NotInitialized => {
                ExitCode::InitializationFailure
            }
            SlamError::SolverFailure(_) => ExitCode::SolverFailure,
            SlamError::CorruptArchive(_) | SlamError::Zip(_) => ExitCode::CorruptArchive,
            _ => ExitCode::InitializationFailure,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(
            SlamError::SolverFailure("diverged".into()).exit_code(),
            ExitCode::SolverFailure
        );
        assert_eq!(
            SlamError::CorruptArchive("bad version".into()).exit_code(),
            ExitCode::CorruptArchive
        );
        assert_eq!(
            SlamError::NotInitialized.exit_code(),
            ExitCode::InitializationFailure
        );
    }

    #[test]
    fn test_display_contains_context() {
        let err = SlamError::NoKeyAtTime {
            stamp_us: 1_000_000,
            threshold_us: 10_000,
        };
        let text = err.to_string();
        assert!(text.contains("1000000"));
        assert!(text.contains("10000"));
    }
}
