// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cax-core.
//!
//! Provides a unified error type shared by the store, the transfer tasks,
//! and the scheduler, with stable machine-readable error codes.

use std::fmt;

/// Result type using CaxError
pub type Result<T> = std::result::Result<T, CaxError>;

/// Errors that can occur while processing a run.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CaxError {
    /// Run document was not found in the store.
    RunNotFound {
        /// Detector the run belongs to.
        detector: String,
        /// The run name that was not found.
        name: String,
    },

    /// A host identifier has no entry in the host registry.
    UnknownHost {
        /// The unknown host identifier.
        host: String,
    },

    /// A destination is configured with a transfer method no backend implements.
    UnsupportedMethod {
        /// The destination host.
        host: String,
        /// The configured method string.
        method: String,
    },

    /// A transfer backend invocation failed.
    TransferFailed {
        /// The transfer method that failed.
        method: String,
        /// Failure details (captured stderr or exit status).
        details: String,
    },

    /// A computed checksum did not match the master checksum.
    ChecksumMismatch {
        /// The run name.
        name: String,
        /// The host holding the mismatched copy.
        host: String,
        /// The master checksum.
        expected: String,
        /// The checksum actually computed.
        actual: String,
    },

    /// A conditional store operation matched nothing it was expected to match.
    ///
    /// Another agent got there first; the safe response is to abandon this
    /// single operation, never to overwrite.
    RaceDetected {
        /// The run name.
        name: String,
        /// The host the operation targeted.
        host: String,
        /// The operation that lost the race.
        operation: String,
    },

    /// A run document or data location failed validation.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Store operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Filesystem operation failed (checksumming, purging).
    Io {
        /// The path involved.
        path: String,
        /// Error details.
        details: String,
    },
}

impl CaxError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::UnknownHost { .. } => "UNKNOWN_HOST",
            Self::UnsupportedMethod { .. } => "UNSUPPORTED_METHOD",
            Self::TransferFailed { .. } => "TRANSFER_FAILED",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::RaceDetected { .. } => "RACE_DETECTED",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::Io { .. } => "IO_ERROR",
        }
    }
}

impl fmt::Display for CaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { detector, name } => {
                write!(f, "Run '{}' not found for detector '{}'", name, detector)
            }
            Self::UnknownHost { host } => {
                write!(f, "Host '{}' is not in the host registry", host)
            }
            Self::UnsupportedMethod { host, method } => {
                write!(
                    f,
                    "Host '{}' is configured with unsupported transfer method '{}'",
                    host, method
                )
            }
            Self::TransferFailed { method, details } => {
                write!(f, "Transfer via '{}' failed: {}", method, details)
            }
            Self::ChecksumMismatch {
                name,
                host,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Checksum mismatch for run '{}' at '{}': expected {}, got {}",
                    name, host, expected, actual
                )
            }
            Self::RaceDetected {
                name,
                host,
                operation,
            } => {
                write!(
                    f,
                    "Race condition during '{}' for run '{}' at '{}': another agent won",
                    operation, name, host
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::Io { path, details } => {
                write!(f, "I/O error on '{}': {}", path, details)
            }
        }
    }
}

impl std::error::Error for CaxError {}

impl From<sqlx::Error> for CaxError {
    fn from(err: sqlx::Error) -> Self {
        CaxError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CaxError {
    fn from(err: serde_json::Error) -> Self {
        CaxError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(CaxError, &str)> = vec![
            (
                CaxError::RunNotFound {
                    detector: "tpc".to_string(),
                    name: "160315_1824".to_string(),
                },
                "RUN_NOT_FOUND",
            ),
            (
                CaxError::UnknownHost {
                    host: "nowhere".to_string(),
                },
                "UNKNOWN_HOST",
            ),
            (
                CaxError::UnsupportedMethod {
                    host: "siteB".to_string(),
                    method: "carrier-pigeon".to_string(),
                },
                "UNSUPPORTED_METHOD",
            ),
            (
                CaxError::TransferFailed {
                    method: "scp".to_string(),
                    details: "connection refused".to_string(),
                },
                "TRANSFER_FAILED",
            ),
            (
                CaxError::RaceDetected {
                    name: "160315_1824".to_string(),
                    host: "siteB".to_string(),
                    operation: "add_location".to_string(),
                },
                "RACE_DETECTED",
            ),
        ];

        for (error, expected_code) in cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_error_display() {
        let err = CaxError::ChecksumMismatch {
            name: "160315_1824".to_string(),
            host: "siteB".to_string(),
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Checksum mismatch for run '160315_1824' at 'siteB': expected abc, got def"
        );

        let err = CaxError::RaceDetected {
            name: "160315_1824".to_string(),
            host: "siteB".to_string(),
            operation: "add_location".to_string(),
        };
        assert!(err.to_string().contains("another agent won"));
    }
}
