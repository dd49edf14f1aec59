//! Crate-wide error type.
//!
//! The engine never lets a per-variant or per-cell numeric failure escape as
//! an `Err` — those are reported in-band as `NaN`/`null` (see
//! [`crate::paging`]). `Error` is reserved for the five kinds spec.md §7
//! names: a caller passed something the engine can't act on, the data it
//! found contradicts an invariant, a computation produced a degenerate
//! value in a context that forbids it, I/O to the genotype source or cache
//! failed, or the caller's cancel flag fired mid-traversal.

use std::fmt;

/// One of the five error kinds from spec.md §7.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("numeric degenerate: {0}")]
    NumericDegenerate(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("query cancelled")]
    Cancelled,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoFailure(e.to_string())
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::IoFailure(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Page-level error tag. Unlike [`Error`], this is what crosses the
/// programmatic query boundary (spec.md §7: "Exceptions are never exposed
/// across the boundary; all failure is a page-level tag").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    ConsistencyViolation,
    NumericDegenerate,
    IoFailure,
    Cancelled,
}

impl From<&Error> for ErrorKind {
    fn from(e: &Error) -> Self {
        match e {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::ConsistencyViolation(_) => ErrorKind::ConsistencyViolation,
            Error::NumericDegenerate(_) => ErrorKind::NumericDegenerate,
            Error::IoFailure(_) => ErrorKind::IoFailure,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::ConsistencyViolation => "consistency_violation",
            ErrorKind::NumericDegenerate => "numeric_degenerate",
            ErrorKind::IoFailure => "io_failure",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_from_error() {
        assert_eq!(
            ErrorKind::from(&Error::InvalidArgument("x".into())),
            ErrorKind::InvalidArgument
        );
        assert_eq!(ErrorKind::from(&Error::Cancelled), ErrorKind::Cancelled);
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorKind::IoFailure).unwrap();
        assert_eq!(s, "\"io_failure\"");
    }
}
