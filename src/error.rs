//! Unified error type.
//!
//! Application-level errors (404, 422, etc.) are expressed as HTTP
//! [`Response`](crate::Response) values, not as `Error`s. This type covers
//! the failure taxonomy of the engine itself: refused registrations, stage
//! failures, filter failures (including timeouts), and infrastructure
//! failures like binding to a port.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::filters::FilterKind;

/// The error type returned by plinth's fallible operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A filter or route registration was refused. Fail-soft: the registry
    /// logs this and keeps booting — one bad controller must not take the
    /// application down.
    #[error("registration refused: {0}")]
    Registration(String),

    /// A pipeline stage failed. Routed to the error chain.
    #[error("stage failed: {0}")]
    Stage(String),

    /// A filter callback failed.
    #[error("{kind} filter `{label}` for {owner}.{action} failed: {message}")]
    Filter {
        kind: FilterKind,
        owner: String,
        action: String,
        label: String,
        message: String,
    },

    /// A filter callback ran past its configured deadline. Kept distinct
    /// from [`Error::Filter`] so logs can tell "ran too long" apart from
    /// "misbehaved".
    #[error(
        "{kind} filter `{label}` for {owner}.{action} timed out after {elapsed:?} (threshold {threshold:?})"
    )]
    FilterTimeout {
        kind: FilterKind,
        owner: String,
        action: String,
        label: String,
        elapsed: Duration,
        threshold: Duration,
    },

    /// Infrastructure failure: binding to a port or accepting a connection.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for an [`Error::Stage`] with an arbitrary message.
    pub fn stage(message: impl Into<String>) -> Self {
        Self::Stage(message.into())
    }

    /// The wire code reported for this error in the JSON error payload.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Filter { .. } | Self::FilterTimeout { .. } => ErrorCode::FilterError,
            _ => ErrorCode::InternalError,
        }
    }
}

/// The fixed enumeration of machine-readable codes that may appear in the
/// JSON error payload sent to clients. Internal detail never rides along.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InternalError,
    FilterError,
}
