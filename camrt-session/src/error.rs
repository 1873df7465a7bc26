//! Error types for camrt-session
//!
//! Every variant corresponds to one of the result codes surfaced to the
//! session's caller; [`Error::code`] performs the mapping.

use serde::Serialize;
use thiserror::Error;

/// Main error type for camrt-session
#[derive(Error, Debug)]
pub enum Error {
    /// Operation not legal in the current session or pipeline state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Required handle (metadata, buffer) missing
    #[error("Invalid pointer: {0}")]
    InvalidPointer(String),

    /// Malformed request or parameter
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// Tracking structure exhausted
    #[error("Out of memory: {0}")]
    NoMemory(String),

    /// Generic failure reported by a collaborator
    #[error("Operation failed: {0}")]
    Failed(String),

    /// Bounded wait expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Request cancelled by flush or recovery
    #[error("Request cancelled: {0}")]
    CancelledRequest(String),

    /// Transient condition; retrying may succeed
    #[error("Try again: {0}")]
    TryAgain(String),

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors from the common crate
    #[error(transparent)]
    Common(#[from] camrt_common::Error),
}

/// Result codes surfaced to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResultCode {
    Success,
    InvalidState,
    InvalidPointer,
    InvalidArg,
    NoMemory,
    Failed,
    Timeout,
    CancelledRequest,
    TryAgain,
}

impl Error {
    /// Result code for this error
    pub fn code(&self) -> ResultCode {
        match self {
            Error::InvalidState(_) => ResultCode::InvalidState,
            Error::InvalidPointer(_) => ResultCode::InvalidPointer,
            Error::InvalidArg(_) => ResultCode::InvalidArg,
            Error::NoMemory(_) => ResultCode::NoMemory,
            Error::Failed(_) => ResultCode::Failed,
            Error::Timeout(_) => ResultCode::Timeout,
            Error::CancelledRequest(_) => ResultCode::CancelledRequest,
            Error::TryAgain(_) => ResultCode::TryAgain,
            Error::Config(_) => ResultCode::InvalidArg,
            Error::Common(_) => ResultCode::Failed,
        }
    }

    /// True for cancellations caused by flush or recovery
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::CancelledRequest(_))
    }
}

impl ResultCode {
    /// Map an operation outcome to its result code
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResultCode::Success => "Success",
            ResultCode::InvalidState => "InvalidState",
            ResultCode::InvalidPointer => "InvalidPointer",
            ResultCode::InvalidArg => "InvalidArg",
            ResultCode::NoMemory => "NoMemory",
            ResultCode::Failed => "Failed",
            ResultCode::Timeout => "Timeout",
            ResultCode::CancelledRequest => "CancelledRequest",
            ResultCode::TryAgain => "TryAgain",
        };
        write!(f, "{}", name)
    }
}

/// Convenience Result type using camrt-session Error
pub type Result<T> = std::result::Result<T, Error>;
