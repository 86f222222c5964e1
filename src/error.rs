//! Error types for the data-protection service

use thiserror::Error;

/// Result type alias for data-protection operations
pub type Result<T> = std::result::Result<T, ProtectionError>;

/// Errors that can occur during data-protection operations
#[derive(Error, Debug)]
pub enum ProtectionError {
    /// Requested encrypted field (or other record) does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authentication tag verification failed; never retried
    #[error("Integrity failure: {0}")]
    Integrity(String),

    /// An encrypted field references a key that cannot be resolved
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Cryptographic primitive failed for a reason other than integrity
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid key state or unknown key purpose
    #[error("Invalid key state: {0}")]
    InvalidKeyState(String),

    /// Key rotation could not proceed
    #[error("Key rotation error: {0}")]
    KeyRotation(String),

    /// Request stream could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtectionError {
    /// Stable error code reported through the operation surface.
    pub fn code(&self) -> &'static str {
        match self {
            ProtectionError::NotFound(_) => "not_found",
            ProtectionError::Integrity(_) => "integrity_failure",
            ProtectionError::KeyNotFound(_) => "key_not_found",
            ProtectionError::InvalidKeyState(_) => "invalid_key_state",
            ProtectionError::KeyRotation(_) => "rotation_failed",
            ProtectionError::Crypto(_)
            | ProtectionError::Storage(_)
            | ProtectionError::Config(_)
            | ProtectionError::Serialization(_)
            | ProtectionError::Io(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for ProtectionError {
    fn from(err: serde_json::Error) -> Self {
        ProtectionError::Serialization(err.to_string())
    }
}
