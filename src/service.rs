//! Operation surface: structured requests in, structured responses out
//!
//! Wire shapes:
//! - `encrypt` → `{success: true, key_created}`
//! - `decrypt` → `{success: true, value}` | `{error: "not_found"}` | `{error: "integrity_failure"}`
//! - `rotate_key` → `{success: true, new_key_id, complete, migrated, failures}`
//! - `generate_backup_codes` → `{success: true, codes}`
//! - `verify_backup_code` → `{success: true, valid}`

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::backup_codes::{BackupCodeIssuer, BackupCodeVerifier};
use crate::config::ServiceConfig;
use crate::error::{ProtectionError, Result};
use crate::key_store::KeyStore;
use crate::purpose::KeyPurpose;
use crate::rotation::{KeyRotator, RotationReport};
use crate::storage::{FieldLocator, ProtectionStorage};
use crate::vault::FieldVault;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Encrypt {
        organization_id: String,
        table: String,
        field: String,
        record_id: String,
        value: String,
        #[serde(default)]
        purpose: Option<KeyPurpose>,
    },
    Decrypt {
        organization_id: String,
        table: String,
        field: String,
        record_id: String,
    },
    RotateKey {
        organization_id: String,
        #[serde(default)]
        purpose: Option<KeyPurpose>,
    },
    GenerateBackupCodes {
        user_id: String,
        organization_id: String,
    },
    VerifyBackupCode {
        user_id: String,
        organization_id: String,
        code: String,
    },
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Encrypt { .. } => "encrypt",
            Request::Decrypt { .. } => "decrypt",
            Request::RotateKey { .. } => "rotate_key",
            Request::GenerateBackupCodes { .. } => "generate_backup_codes",
            Request::VerifyBackupCode { .. } => "verify_backup_code",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Encrypted {
        success: bool,
        key_created: bool,
    },
    Decrypted {
        success: bool,
        value: String,
    },
    Rotated {
        success: bool,
        new_key_id: Uuid,
        complete: bool,
        migrated: usize,
        failures: Vec<String>,
    },
    BackupCodes {
        success: bool,
        codes: Vec<String>,
    },
    Verified {
        success: bool,
        valid: bool,
    },
    Error {
        error: String,
        message: String,
    },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            error: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Response::Error { .. })
    }
}

impl From<ProtectionError> for Response {
    fn from(err: ProtectionError) -> Self {
        Response::error(err.code(), err.to_string())
    }
}

impl From<RotationReport> for Response {
    fn from(report: RotationReport) -> Self {
        Response::Rotated {
            success: true,
            new_key_id: report.new_key_id,
            complete: report.complete,
            migrated: report.migrated,
            failures: report.failures.iter().map(|f| f.locator.to_string()).collect(),
        }
    }
}

/// FieldVault, KeyRotator and the backup-code pair over one storage backend
pub struct DataProtectionService<S: ProtectionStorage> {
    vault: FieldVault<S>,
    rotator: KeyRotator<S>,
    issuer: BackupCodeIssuer<S>,
    verifier: BackupCodeVerifier<S>,
}

impl<S: ProtectionStorage> DataProtectionService<S> {
    pub fn new(storage: Arc<S>, config: &ServiceConfig) -> Result<Self> {
        config.backup_codes.validate()?;

        let keys = match &config.master_key {
            Some(master) => KeyStore::with_master_key(Arc::clone(&storage), master.clone()),
            None => KeyStore::new(Arc::clone(&storage)),
        };
        let policy = Arc::new(config.backup_codes.clone());

        Ok(Self {
            vault: FieldVault::new(Arc::clone(&storage), keys.clone()),
            rotator: KeyRotator::new(Arc::clone(&storage), keys, config.rotation_sweep_passes),
            issuer: BackupCodeIssuer::new(Arc::clone(&storage), Arc::clone(&policy)),
            verifier: BackupCodeVerifier::new(storage, policy),
        })
    }

    pub fn vault(&self) -> &FieldVault<S> {
        &self.vault
    }

    pub fn rotator(&self) -> &KeyRotator<S> {
        &self.rotator
    }

    pub fn issuer(&self) -> &BackupCodeIssuer<S> {
        &self.issuer
    }

    pub fn verifier(&self) -> &BackupCodeVerifier<S> {
        &self.verifier
    }

    /// Execute one request. Failures become `Response::Error`; this never panics
    /// and never puts plaintext or key material into an error message.
    pub async fn handle(&self, request: Request) -> Response {
        let op = request.op();
        debug!(op, "handling request");

        match self.dispatch(request).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    ProtectionError::NotFound(_) => debug!(op, error = %err, "request failed"),
                    ProtectionError::Integrity(_) | ProtectionError::KeyNotFound(_) => {
                        error!(op, error = %err, "request failed")
                    }
                    _ => warn!(op, error = %err, "request failed"),
                }
                err.into()
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Response> {
        match request {
            Request::Encrypt {
                organization_id,
                table,
                field,
                record_id,
                value,
                purpose,
            } => {
                let locator = FieldLocator::new(organization_id, table, field, record_id);
                let outcome = self
                    .vault
                    .encrypt_field(&locator, value.as_bytes(), purpose.unwrap_or_default())
                    .await?;
                Ok(Response::Encrypted {
                    success: true,
                    key_created: outcome.key_created,
                })
            }
            Request::Decrypt {
                organization_id,
                table,
                field,
                record_id,
            } => {
                let locator = FieldLocator::new(organization_id, table, field, record_id);
                let plaintext = self.vault.decrypt_field(&locator).await?;
                let value = String::from_utf8(plaintext.to_vec()).map_err(|_| {
                    ProtectionError::Serialization(format!("field {} does not hold UTF-8 text", locator))
                })?;
                Ok(Response::Decrypted { success: true, value })
            }
            Request::RotateKey { organization_id, purpose } => {
                let report = self
                    .rotator
                    .rotate(&organization_id, purpose.unwrap_or_default())
                    .await?;
                Ok(report.into())
            }
            Request::GenerateBackupCodes { user_id, organization_id } => {
                let issued = self.issuer.issue(&organization_id, &user_id).await?;
                Ok(Response::BackupCodes {
                    success: true,
                    codes: issued.codes,
                })
            }
            Request::VerifyBackupCode {
                user_id,
                organization_id,
                code,
            } => {
                let valid = self.verifier.verify(&organization_id, &user_id, &code).await?;
                Ok(Response::Verified { success: true, valid })
            }
        }
    }
}
