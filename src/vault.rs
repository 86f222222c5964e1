//! Field-level encryption over the key store
//!
//! Each encrypted field row carries the id of the exact key that produced its
//! ciphertext. Reads resolve that key by id, active or not, so reads never
//! depend on which key is currently active.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::AesGcmCipher;
use crate::error::{ProtectionError, Result};
use crate::key_store::{EncryptionKey, KeyInfo, KeyStore};
use crate::purpose::KeyPurpose;
use crate::storage::{EncryptedField, FieldLocator, FieldStorage, KeyStorage};

/// Result of a successful `encrypt_field`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptOutcome {
    pub key_id: Uuid,
    pub key_version: u32,
    /// The purpose had no active key and one was created for this call
    pub key_created: bool,
}

/// Number of fields still encrypted under one key version
#[derive(Debug, Clone, Serialize)]
pub struct KeyUsage {
    pub key: KeyInfo,
    pub field_count: u64,
}

/// Encrypt `plaintext` for `locator` under `key`, bound to the locator
pub(crate) fn seal_field(locator: &FieldLocator, key: &EncryptionKey, plaintext: &[u8]) -> Result<String> {
    AesGcmCipher::seal(key.material(), plaintext, Some(&locator.associated_data()))
}

/// Decrypt a stored field with the key that produced it
pub(crate) fn open_field(field: &EncryptedField, key: &EncryptionKey) -> Result<Zeroizing<Vec<u8>>> {
    if field.key_id != key.id {
        return Err(ProtectionError::InvalidKeyState(format!(
            "field {} references key {}, not {}",
            field.locator, field.key_id, key.id
        )));
    }
    AesGcmCipher::open(key.material(), &field.ciphertext, Some(&field.locator.associated_data())).map(Zeroizing::new)
}

pub struct FieldVault<S: KeyStorage + FieldStorage> {
    keys: KeyStore<S>,
    storage: Arc<S>,
}

impl<S: KeyStorage + FieldStorage> FieldVault<S> {
    pub fn new(storage: Arc<S>, keys: KeyStore<S>) -> Self {
        Self { keys, storage }
    }

    pub fn key_store(&self) -> &KeyStore<S> {
        &self.keys
    }

    /// Encrypt and upsert one field.
    ///
    /// The first encrypt for a purpose without an active key creates one;
    /// `EncryptOutcome::key_created` reports when that happened.
    pub async fn encrypt_field(
        &self,
        locator: &FieldLocator,
        plaintext: &[u8],
        purpose: KeyPurpose,
    ) -> Result<EncryptOutcome> {
        let organization_id = locator.organization_id.as_str();

        let (key, key_created) = match self.keys.get_active_key(organization_id, purpose).await? {
            Some(key) => (key, false),
            None => {
                info!(organization_id, %purpose, "no active key for purpose, creating one on first use");
                (self.keys.create_key(organization_id, purpose).await?, true)
            }
        };

        let ciphertext = seal_field(locator, &key, plaintext)?;
        self.storage
            .upsert_field(EncryptedField {
                locator: locator.clone(),
                ciphertext,
                key_id: key.id,
                updated_at: Utc::now(),
            })
            .await?;

        debug!(field = %locator, key_id = %key.id, version = key.version, "encrypted field");

        Ok(EncryptOutcome {
            key_id: key.id,
            key_version: key.version,
            key_created,
        })
    }

    /// Decrypt one field with the key recorded on its row
    pub async fn decrypt_field(&self, locator: &FieldLocator) -> Result<Zeroizing<Vec<u8>>> {
        let field = self
            .storage
            .get_field(locator)
            .await?
            .ok_or_else(|| ProtectionError::NotFound(format!("encrypted field {}", locator)))?;

        let key = self.keys.resolve(&locator.organization_id, &field.key_id).await?;
        let plaintext = open_field(&field, &key)?;

        debug!(field = %locator, key_id = %key.id, version = key.version, "decrypted field");
        Ok(plaintext)
    }

    /// Remove an encrypted field. Returns whether it existed.
    pub async fn delete_field(&self, locator: &FieldLocator) -> Result<bool> {
        let removed = self.storage.delete_field(locator).await?;
        debug!(field = %locator, removed, "deleted encrypted field");
        Ok(removed)
    }

    /// Field counts per key version, newest version first
    pub async fn key_usage(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Vec<KeyUsage>> {
        let mut usage = Vec::new();
        for key in self.keys.list_keys(organization_id, purpose).await? {
            let field_count = self.storage.count_fields_by_key(organization_id, &key.id).await?;
            usage.push(KeyUsage { key, field_count });
        }
        Ok(usage)
    }
}
