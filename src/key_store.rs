use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::{AesGcmCipher, SecureKey};
use crate::error::{ProtectionError, Result};
use crate::purpose::KeyPurpose;
use crate::storage::{KeyStorage, StoredKey};

/// Attempts at claiming the next version when concurrent creators collide
const CREATE_ATTEMPTS: usize = 3;

/// Public view of a key. Never carries material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub id: Uuid,
    pub organization_id: String,
    pub purpose: KeyPurpose,
    pub version: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A resolved key with its material unwrapped
#[derive(Debug, Clone)]
pub struct EncryptionKey {
    pub id: Uuid,
    pub organization_id: String,
    pub purpose: KeyPurpose,
    pub version: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    material: SecureKey,
}

impl EncryptionKey {
    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id,
            organization_id: self.organization_id.clone(),
            purpose: self.purpose,
            version: self.version,
            is_active: self.is_active,
            created_at: self.created_at,
        }
    }

    pub(crate) fn material(&self) -> &SecureKey {
        &self.material
    }
}

/// Versioned key series per (organization, purpose).
///
/// Creation and activation transitions are kept separate: `create_key` never
/// deactivates older versions, that is left to the rotator.
pub struct KeyStore<S: KeyStorage> {
    storage: Arc<S>,
    master_key: Option<SecureKey>,
}

impl<S: KeyStorage> Clone for KeyStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            master_key: self.master_key.clone(),
        }
    }
}

impl<S: KeyStorage> KeyStore<S> {
    /// Store key material as plain base64
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage, master_key: None }
    }

    /// Wrap key material under `master_key` before it reaches storage
    pub fn with_master_key(storage: Arc<S>, master_key: SecureKey) -> Self {
        Self { storage, master_key: Some(master_key) }
    }

    pub async fn get_active_key(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Option<EncryptionKey>> {
        match self.storage.get_active_key(organization_id, purpose).await? {
            Some(stored) => Ok(Some(self.unwrap_key(stored)?)),
            None => Ok(None),
        }
    }

    /// Create the next version for a purpose, active immediately
    pub async fn create_key(&self, organization_id: &str, purpose: KeyPurpose) -> Result<EncryptionKey> {
        for attempt in 1..=CREATE_ATTEMPTS {
            let version = self
                .storage
                .max_version(organization_id, purpose)
                .await?
                .map_or(1, |v| v + 1);

            let id = Uuid::new_v4();
            let material = SecureKey::generate_with_len(purpose.key_len());
            let (encoded, wrapped) = self.wrap_material(&id, &material)?;
            let created_at = Utc::now();

            let inserted = self
                .storage
                .insert_key(StoredKey {
                    id,
                    organization_id: organization_id.to_string(),
                    purpose,
                    version,
                    material: encoded,
                    wrapped,
                    is_active: true,
                    created_at,
                })
                .await?;

            if inserted {
                info!(organization_id, %purpose, %id, version, "created encryption key");
                return Ok(EncryptionKey {
                    id,
                    organization_id: organization_id.to_string(),
                    purpose,
                    version,
                    is_active: true,
                    created_at,
                    material,
                });
            }

            warn!(organization_id, %purpose, version, attempt, "key version already taken, retrying");
        }

        Err(ProtectionError::Storage(format!(
            "could not claim a key version for {}/{} after {} attempts",
            organization_id, purpose, CREATE_ATTEMPTS
        )))
    }

    /// Mark a key inactive. Idempotent; inactive keys stay resolvable.
    pub async fn deactivate(&self, organization_id: &str, key_id: &Uuid) -> Result<()> {
        if !self.storage.set_key_active(organization_id, key_id, false).await? {
            return Err(ProtectionError::KeyNotFound(key_id.to_string()));
        }
        debug!(organization_id, %key_id, "deactivated encryption key");
        Ok(())
    }

    /// Load a key by id regardless of its active flag
    pub async fn resolve(&self, organization_id: &str, key_id: &Uuid) -> Result<EncryptionKey> {
        let stored = self
            .storage
            .get_key(organization_id, key_id)
            .await?
            .ok_or_else(|| ProtectionError::KeyNotFound(key_id.to_string()))?;
        self.unwrap_key(stored)
    }

    /// Every version for a purpose, newest first
    pub async fn list_keys(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Vec<KeyInfo>> {
        Ok(self
            .storage
            .list_keys(organization_id, purpose)
            .await?
            .into_iter()
            .map(|k| KeyInfo {
                id: k.id,
                organization_id: k.organization_id,
                purpose: k.purpose,
                version: k.version,
                is_active: k.is_active,
                created_at: k.created_at,
            })
            .collect())
    }

    fn wrap_material(&self, key_id: &Uuid, material: &SecureKey) -> Result<(String, bool)> {
        match &self.master_key {
            Some(master) => Ok((AesGcmCipher::seal(master, material.as_bytes(), Some(key_id.as_bytes()))?, true)),
            None => Ok((material.to_base64(), false)),
        }
    }

    fn unwrap_key(&self, stored: StoredKey) -> Result<EncryptionKey> {
        let key_len = stored.purpose.key_len();
        let material = if stored.wrapped {
            let master = self.master_key.as_ref().ok_or_else(|| {
                ProtectionError::Config(format!("key {} is wrapped but no master key is configured", stored.id))
            })?;
            let bytes = AesGcmCipher::open(master, &stored.material, Some(stored.id.as_bytes()))?;
            if bytes.len() != key_len {
                return Err(ProtectionError::InvalidKeyState(format!(
                    "key {} has {} bytes of material, expected {}",
                    stored.id,
                    bytes.len(),
                    key_len
                )));
            }
            SecureKey::new(bytes)
        } else {
            SecureKey::from_base64(&stored.material, key_len)
                .map_err(|e| ProtectionError::InvalidKeyState(format!("key {}: {}", stored.id, e)))?
        };

        Ok(EncryptionKey {
            id: stored.id,
            organization_id: stored.organization_id,
            purpose: stored.purpose,
            version: stored.version,
            is_active: stored.is_active,
            created_at: stored.created_at,
            material,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn test_versions_increment_per_purpose() {
        let store = KeyStore::new(Arc::new(InMemoryStorage::new()));

        let v1 = store.create_key("org", KeyPurpose::General).await.unwrap();
        let v2 = store.create_key("org", KeyPurpose::General).await.unwrap();
        let other = store.create_key("org", KeyPurpose::Financial).await.unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(other.version, 1);

        // Creation never deactivates older versions
        let listed = store.list_keys("org", KeyPurpose::General).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|k| k.is_active));
        assert_eq!(listed[0].version, 2);
    }

    #[tokio::test]
    async fn test_active_key_is_highest_active_version() {
        let store = KeyStore::new(Arc::new(InMemoryStorage::new()));
        assert!(store.get_active_key("org", KeyPurpose::General).await.unwrap().is_none());

        let v1 = store.create_key("org", KeyPurpose::General).await.unwrap();
        let v2 = store.create_key("org", KeyPurpose::General).await.unwrap();
        assert_eq!(store.get_active_key("org", KeyPurpose::General).await.unwrap().unwrap().id, v2.id);

        store.deactivate("org", &v2.id).await.unwrap();
        assert_eq!(store.get_active_key("org", KeyPurpose::General).await.unwrap().unwrap().id, v1.id);
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent_and_keeps_key() {
        let store = KeyStore::new(Arc::new(InMemoryStorage::new()));
        let key = store.create_key("org", KeyPurpose::General).await.unwrap();

        store.deactivate("org", &key.id).await.unwrap();
        store.deactivate("org", &key.id).await.unwrap();

        let resolved = store.resolve("org", &key.id).await.unwrap();
        assert!(!resolved.is_active);
        assert_eq!(resolved.material().as_bytes(), key.material().as_bytes());

        assert!(matches!(
            store.deactivate("org", &Uuid::new_v4()).await,
            Err(ProtectionError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_wrapped_material_round_trip() {
        let storage = Arc::new(InMemoryStorage::new());
        let store = KeyStore::with_master_key(Arc::clone(&storage), SecureKey::generate());
        let key = store.create_key("org", KeyPurpose::Credentials).await.unwrap();

        let stored = storage.get_key("org", &key.id).await.unwrap().unwrap();
        assert!(stored.wrapped);
        assert_ne!(stored.material, key.material().to_base64());

        let resolved = store.resolve("org", &key.id).await.unwrap();
        assert_eq!(resolved.material().as_bytes(), key.material().as_bytes());

        // Another master key cannot unwrap it
        let wrong = KeyStore::with_master_key(storage, SecureKey::generate());
        assert!(matches!(
            wrong.resolve("org", &key.id).await,
            Err(ProtectionError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn test_key_debug_never_shows_material() {
        let store = KeyStore::new(Arc::new(InMemoryStorage::new()));
        let key = store.create_key("org", KeyPurpose::General).await.unwrap();
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&key.material().to_base64()));
    }
}
