//! Error types for elohim-custodian

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CustodyError>;

#[derive(Error, Debug)]
pub enum CustodyError {
    /// The custodian context failed to load, or the liveness probe
    /// exhausted its single retry.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out after {0:?}")]
    TransportTimeout(Duration),

    /// Malformed frame, unexpected reply type, or unknown error code.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Operation failed: {0}")]
    Operation(#[from] OperationError),

    /// Wrong passphrase or corrupted backup blob.
    #[error("Decrypt error: {0}")]
    Decrypt(String),

    #[error("Client disconnected")]
    Disconnected,

    #[error("Invalid origin: {0}")]
    InvalidOrigin(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Another custodian holds the vault directory lock.
    #[error("Vault in use: {0}")]
    VaultBusy(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CustodyError {
    /// The operation error carried by this error, if any.
    pub fn operation(&self) -> Option<OperationError> {
        match self {
            CustodyError::Operation(op) => Some(*op),
            _ => None,
        }
    }
}

/// Typed failures returned by the custodian for an admitted request.
///
/// These travel on the wire as the `error` field of a reply, using the
/// variant name as a stable code.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationError {
    #[error("NoActiveKey")]
    NoActiveKey,
    #[error("NoLocalKey")]
    NoLocalKey,
    #[error("EmptyMessage")]
    EmptyMessage,
    #[error("MissingIdentifier")]
    MissingIdentifier,
    #[error("MissingPayload")]
    MissingPayload,
    #[error("SignFailed")]
    SignFailed,
    #[error("VerifyFailed")]
    VerifyFailed,
    #[error("GenerateFailed")]
    GenerateFailed,
    #[error("Internal")]
    Internal,
}

impl OperationError {
    pub const ALL: [OperationError; 9] = [
        OperationError::NoActiveKey,
        OperationError::NoLocalKey,
        OperationError::EmptyMessage,
        OperationError::MissingIdentifier,
        OperationError::MissingPayload,
        OperationError::SignFailed,
        OperationError::VerifyFailed,
        OperationError::GenerateFailed,
        OperationError::Internal,
    ];

    /// Wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            OperationError::NoActiveKey => "NoActiveKey",
            OperationError::NoLocalKey => "NoLocalKey",
            OperationError::EmptyMessage => "EmptyMessage",
            OperationError::MissingIdentifier => "MissingIdentifier",
            OperationError::MissingPayload => "MissingPayload",
            OperationError::SignFailed => "SignFailed",
            OperationError::VerifyFailed => "VerifyFailed",
            OperationError::GenerateFailed => "GenerateFailed",
            OperationError::Internal => "Internal",
        }
    }

    /// Parse a wire code back into an error. Unknown codes yield `None`.
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.code() == code)
    }
}
