//! Storage abstraction for keys, encrypted fields and backup codes
//!
//! The traits describe exactly the queries the service needs from its
//! datastore: atomic row upserts, conditional updates and organization-scoped
//! lookups. Every query is filtered by `organization_id`.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::purpose::KeyPurpose;

/// Identity of one encrypted application field
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldLocator {
    pub organization_id: String,
    pub table_name: String,
    pub field_name: String,
    pub record_id: String,
}

impl FieldLocator {
    pub fn new(
        organization_id: impl Into<String>,
        table_name: impl Into<String>,
        field_name: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            table_name: table_name.into(),
            field_name: field_name.into(),
            record_id: record_id.into(),
        }
    }

    /// Associated data binding a ciphertext to this exact field.
    ///
    /// Each component is length-prefixed so that no two locators share an
    /// encoding.
    pub fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(64);
        for part in [
            &self.organization_id,
            &self.table_name,
            &self.field_name,
            &self.record_id,
        ] {
            aad.extend_from_slice(&(part.len() as u32).to_be_bytes());
            aad.extend_from_slice(part.as_bytes());
        }
        aad
    }
}

impl fmt::Display for FieldLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.organization_id, self.table_name, self.field_name, self.record_id
        )
    }
}

/// Stored key entry. `material` is opaque text: plain base64, or base64 of
/// the material wrapped under the master key when `wrapped` is set.
#[derive(Debug, Clone)]
pub struct StoredKey {
    pub id: Uuid,
    pub organization_id: String,
    pub purpose: KeyPurpose,
    pub version: u32,
    pub material: String,
    pub wrapped: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Encrypted field row
#[derive(Debug, Clone)]
pub struct EncryptedField {
    pub locator: FieldLocator,
    /// base64 `nonce || ciphertext || tag`
    pub ciphertext: String,
    /// The exact key that produced `ciphertext`
    pub key_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// Hashed backup code row
#[derive(Debug, Clone)]
pub struct BackupCode {
    pub id: Uuid,
    pub organization_id: String,
    pub user_id: String,
    pub code_hash: String,
    pub used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl BackupCode {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.used_at.is_none() && self.expires_at > now
    }
}

/// Key rows
#[async_trait]
pub trait KeyStorage: Send + Sync {
    /// Insert a new key. Returns `false` if `(organization_id, purpose,
    /// version)` is already taken.
    async fn insert_key(&self, key: StoredKey) -> Result<bool>;

    /// Retrieve a key by id, active or not
    async fn get_key(&self, organization_id: &str, key_id: &Uuid) -> Result<Option<StoredKey>>;

    /// Highest-version active key for a purpose
    async fn get_active_key(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Option<StoredKey>>;

    /// All versions for a purpose, newest first
    async fn list_keys(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Vec<StoredKey>>;

    /// Highest version ever created for a purpose
    async fn max_version(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Option<u32>>;

    /// Set the active flag. Returns `false` if the key does not exist.
    async fn set_key_active(&self, organization_id: &str, key_id: &Uuid, active: bool) -> Result<bool>;
}

/// Encrypted field rows
#[async_trait]
pub trait FieldStorage: Send + Sync {
    /// Insert or replace the row identified by `field.locator`
    async fn upsert_field(&self, field: EncryptedField) -> Result<()>;

    async fn get_field(&self, locator: &FieldLocator) -> Result<Option<EncryptedField>>;

    /// Returns whether a row was removed
    async fn delete_field(&self, locator: &FieldLocator) -> Result<bool>;

    /// Every row of an organization encrypted under one of `key_ids`
    async fn fields_by_keys(&self, organization_id: &str, key_ids: &[Uuid]) -> Result<Vec<EncryptedField>>;

    /// Replace ciphertext and key reference only if the row still holds
    /// exactly `current`'s ciphertext and key. Returns whether the row was
    /// updated.
    async fn update_field_if_unchanged(
        &self,
        current: &EncryptedField,
        ciphertext: &str,
        new_key_id: &Uuid,
    ) -> Result<bool>;

    async fn count_fields_by_key(&self, organization_id: &str, key_id: &Uuid) -> Result<u64>;
}

/// Backup code rows
#[async_trait]
pub trait BackupCodeStorage: Send + Sync {
    /// Atomically delete every code of `(organization_id, user_id)` and insert `codes`
    async fn replace_backup_codes(
        &self,
        organization_id: &str,
        user_id: &str,
        codes: Vec<BackupCode>,
    ) -> Result<()>;

    /// Atomically mark a matching unused, unexpired code as used at `now`.
    /// Returns whether a code was consumed.
    async fn consume_backup_code(
        &self,
        organization_id: &str,
        user_id: &str,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn count_usable_backup_codes(
        &self,
        organization_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}

/// A backend providing every table the service uses
pub trait ProtectionStorage: KeyStorage + FieldStorage + BackupCodeStorage {}

impl<T: KeyStorage + FieldStorage + BackupCodeStorage> ProtectionStorage for T {}

/// In-memory implementation of the storage traits
///
/// Suitable for development, testing, and single-instance deployments.
/// Data is lost when the process terminates.
pub struct InMemoryStorage {
    keys: RwLock<HashMap<Uuid, StoredKey>>,
    fields: RwLock<HashMap<FieldLocator, EncryptedField>>,
    backup_codes: RwLock<HashMap<(String, String), Vec<BackupCode>>>,
}

impl InMemoryStorage {
    /// Create a new in-memory storage instance
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            fields: RwLock::new(HashMap::new()),
            backup_codes: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyStorage for InMemoryStorage {
    async fn insert_key(&self, key: StoredKey) -> Result<bool> {
        let mut keys = self.keys.write();
        let taken = keys.values().any(|k| {
            k.organization_id == key.organization_id && k.purpose == key.purpose && k.version == key.version
        });
        if taken || keys.contains_key(&key.id) {
            return Ok(false);
        }
        keys.insert(key.id, key);
        Ok(true)
    }

    async fn get_key(&self, organization_id: &str, key_id: &Uuid) -> Result<Option<StoredKey>> {
        let keys = self.keys.read();
        Ok(keys
            .get(key_id)
            .filter(|k| k.organization_id == organization_id)
            .cloned())
    }

    async fn get_active_key(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Option<StoredKey>> {
        let keys = self.keys.read();
        Ok(keys
            .values()
            .filter(|k| k.organization_id == organization_id && k.purpose == purpose && k.is_active)
            .max_by_key(|k| k.version)
            .cloned())
    }

    async fn list_keys(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Vec<StoredKey>> {
        let keys = self.keys.read();
        let mut filtered: Vec<_> = keys
            .values()
            .filter(|k| k.organization_id == organization_id && k.purpose == purpose)
            .cloned()
            .collect();
        filtered.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(filtered)
    }

    async fn max_version(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Option<u32>> {
        let keys = self.keys.read();
        Ok(keys
            .values()
            .filter(|k| k.organization_id == organization_id && k.purpose == purpose)
            .map(|k| k.version)
            .max())
    }

    async fn set_key_active(&self, organization_id: &str, key_id: &Uuid, active: bool) -> Result<bool> {
        let mut keys = self.keys.write();
        match keys.get_mut(key_id) {
            Some(key) if key.organization_id == organization_id => {
                key.is_active = active;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl FieldStorage for InMemoryStorage {
    async fn upsert_field(&self, field: EncryptedField) -> Result<()> {
        let mut fields = self.fields.write();
        fields.insert(field.locator.clone(), field);
        Ok(())
    }

    async fn get_field(&self, locator: &FieldLocator) -> Result<Option<EncryptedField>> {
        let fields = self.fields.read();
        Ok(fields.get(locator).cloned())
    }

    async fn delete_field(&self, locator: &FieldLocator) -> Result<bool> {
        let mut fields = self.fields.write();
        Ok(fields.remove(locator).is_some())
    }

    async fn fields_by_keys(&self, organization_id: &str, key_ids: &[Uuid]) -> Result<Vec<EncryptedField>> {
        let fields = self.fields.read();
        let mut filtered: Vec<_> = fields
            .values()
            .filter(|f| f.locator.organization_id == organization_id && key_ids.contains(&f.key_id))
            .cloned()
            .collect();
        filtered.sort_by(|a, b| a.locator.cmp(&b.locator));
        Ok(filtered)
    }

    async fn update_field_if_unchanged(
        &self,
        current: &EncryptedField,
        ciphertext: &str,
        new_key_id: &Uuid,
    ) -> Result<bool> {
        let mut fields = self.fields.write();
        match fields.get_mut(&current.locator) {
            Some(field) if field.key_id == current.key_id && field.ciphertext == current.ciphertext => {
                field.ciphertext = ciphertext.to_string();
                field.key_id = *new_key_id;
                field.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_fields_by_key(&self, organization_id: &str, key_id: &Uuid) -> Result<u64> {
        let fields = self.fields.read();
        Ok(fields
            .values()
            .filter(|f| f.locator.organization_id == organization_id && &f.key_id == key_id)
            .count() as u64)
    }
}

#[async_trait]
impl BackupCodeStorage for InMemoryStorage {
    async fn replace_backup_codes(
        &self,
        organization_id: &str,
        user_id: &str,
        codes: Vec<BackupCode>,
    ) -> Result<()> {
        let mut batches = self.backup_codes.write();
        batches.insert((organization_id.to_string(), user_id.to_string()), codes);
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        organization_id: &str,
        user_id: &str,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut batches = self.backup_codes.write();
        let Some(batch) = batches.get_mut(&(organization_id.to_string(), user_id.to_string())) else {
            return Ok(false);
        };

        match batch.iter_mut().find(|c| c.code_hash == code_hash && c.is_usable(now)) {
            Some(code) => {
                code.used_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_usable_backup_codes(
        &self,
        organization_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let batches = self.backup_codes.read();
        Ok(batches
            .get(&(organization_id.to_string(), user_id.to_string()))
            .map(|batch| batch.iter().filter(|c| c.is_usable(now)).count() as u64)
            .unwrap_or(0))
    }
}
