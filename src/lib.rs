pub mod backup_codes;
pub mod config;
pub mod crypto;
pub mod error;
pub mod key_store;
pub mod purpose;
pub mod rotation;
pub mod service;
pub mod storage;
pub mod vault;

// PostgreSQL backend
pub mod postgres_storage;

pub use backup_codes::{
    normalize_code, Argon2Params, BackupCodeIssuer, BackupCodePolicy, BackupCodeVerifier, IssuedCodes,
    BACKUP_CODE_ALPHABET,
};
pub use config::ServiceConfig;
pub use crypto::{AesGcmCipher, EncryptedData, SecureKey, AES_256_KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{ProtectionError, Result};
pub use key_store::{EncryptionKey, KeyInfo, KeyStore};
pub use purpose::{KeyAlgorithm, KeyPurpose};
pub use rotation::{KeyRotator, MigrationFailure, RotationPhase, RotationReport};
pub use service::{DataProtectionService, Request, Response};
pub use storage::{
    BackupCode, BackupCodeStorage, EncryptedField, FieldLocator, FieldStorage, InMemoryStorage, KeyStorage,
    ProtectionStorage, StoredKey,
};
pub use vault::{EncryptOutcome, FieldVault, KeyUsage};

// PostgreSQL exports
pub use postgres_storage::PostgresStorage;

pub mod prelude {
    pub use crate::backup_codes::{BackupCodeIssuer, BackupCodePolicy, BackupCodeVerifier};
    pub use crate::config::ServiceConfig;
    pub use crate::error::{ProtectionError, Result};
    pub use crate::key_store::KeyStore;
    pub use crate::purpose::KeyPurpose;
    pub use crate::rotation::{KeyRotator, RotationReport};
    pub use crate::service::{DataProtectionService, Request, Response};
    pub use crate::storage::{FieldLocator, InMemoryStorage, ProtectionStorage};
    pub use crate::vault::FieldVault;
}
