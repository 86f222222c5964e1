//! Rotation against writers that land rows while a migration is running.
//!
//! `Interleaving` wraps the in-memory backend and replays one saved row at a
//! fixed point of the rotation, so each race is reproduced deterministically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use data_protection::{
    EncryptedField, FieldLocator, FieldStorage, FieldVault, InMemoryStorage, KeyPurpose, KeyRotator, KeyStorage,
    KeyStore, Result, StoredKey,
};
use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Clone, Copy)]
enum Trigger {
    /// Right after the n-th `fields_by_keys` call returns its rows
    AfterCall(usize),
    /// Before the first `fields_by_keys` call that only names inactive keys
    AfterRetirement,
}

struct Interleaving {
    inner: InMemoryStorage,
    calls: AtomicUsize,
    trigger: Mutex<Option<(Trigger, EncryptedField)>>,
}

impl Interleaving {
    fn new() -> Self {
        Self {
            inner: InMemoryStorage::new(),
            calls: AtomicUsize::new(0),
            trigger: Mutex::new(None),
        }
    }

    /// Write `row` once, at the point named by `trigger`
    fn arm(&self, trigger: Trigger, row: EncryptedField) {
        self.calls.store(0, Ordering::SeqCst);
        *self.trigger.lock() = Some((trigger, row));
    }

    fn take_if(&self, wanted: impl Fn(Trigger) -> bool) -> Option<EncryptedField> {
        let mut slot = self.trigger.lock();
        match slot.as_ref() {
            Some((trigger, _)) if wanted(*trigger) => slot.take().map(|(_, row)| row),
            _ => None,
        }
    }

    async fn all_inactive(&self, organization_id: &str, key_ids: &[Uuid]) -> Result<bool> {
        for key_id in key_ids {
            match self.inner.get_key(organization_id, key_id).await? {
                Some(key) if !key.is_active => {}
                _ => return Ok(false),
            }
        }
        Ok(!key_ids.is_empty())
    }
}

#[async_trait]
impl KeyStorage for Interleaving {
    async fn insert_key(&self, key: StoredKey) -> Result<bool> {
        self.inner.insert_key(key).await
    }

    async fn get_key(&self, organization_id: &str, key_id: &Uuid) -> Result<Option<StoredKey>> {
        self.inner.get_key(organization_id, key_id).await
    }

    async fn get_active_key(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Option<StoredKey>> {
        self.inner.get_active_key(organization_id, purpose).await
    }

    async fn list_keys(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Vec<StoredKey>> {
        self.inner.list_keys(organization_id, purpose).await
    }

    async fn max_version(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Option<u32>> {
        self.inner.max_version(organization_id, purpose).await
    }

    async fn set_key_active(&self, organization_id: &str, key_id: &Uuid, active: bool) -> Result<bool> {
        self.inner.set_key_active(organization_id, key_id, active).await
    }
}

#[async_trait]
impl FieldStorage for Interleaving {
    async fn upsert_field(&self, field: EncryptedField) -> Result<()> {
        self.inner.upsert_field(field).await
    }

    async fn get_field(&self, locator: &FieldLocator) -> Result<Option<EncryptedField>> {
        self.inner.get_field(locator).await
    }

    async fn delete_field(&self, locator: &FieldLocator) -> Result<bool> {
        self.inner.delete_field(locator).await
    }

    async fn fields_by_keys(&self, organization_id: &str, key_ids: &[Uuid]) -> Result<Vec<EncryptedField>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if self.all_inactive(organization_id, key_ids).await? {
            if let Some(row) = self.take_if(|t| matches!(t, Trigger::AfterRetirement)) {
                self.inner.upsert_field(row).await?;
            }
        }

        let rows = self.inner.fields_by_keys(organization_id, key_ids).await?;

        if let Some(row) = self.take_if(|t| matches!(t, Trigger::AfterCall(n) if n == call)) {
            self.inner.upsert_field(row).await?;
        }
        Ok(rows)
    }

    async fn update_field_if_unchanged(
        &self,
        current: &EncryptedField,
        ciphertext: &str,
        new_key_id: &Uuid,
    ) -> Result<bool> {
        self.inner.update_field_if_unchanged(current, ciphertext, new_key_id).await
    }

    async fn count_fields_by_key(&self, organization_id: &str, key_id: &Uuid) -> Result<u64> {
        self.inner.count_fields_by_key(organization_id, key_id).await
    }
}

fn setup() -> (FieldVault<Interleaving>, KeyRotator<Interleaving>, Arc<Interleaving>) {
    let storage = Arc::new(Interleaving::new());
    let keys = KeyStore::new(Arc::clone(&storage));
    let vault = FieldVault::new(Arc::clone(&storage), keys.clone());
    let rotator = KeyRotator::new(Arc::clone(&storage), keys, 3);
    (vault, rotator, storage)
}

async fn seed(vault: &FieldVault<Interleaving>, count: usize) -> Vec<FieldLocator> {
    let mut locators = Vec::new();
    for i in 0..count {
        let locator = FieldLocator::new("org", "patients", "notes", i.to_string());
        vault
            .encrypt_field(&locator, format!("note {}", i).as_bytes(), KeyPurpose::PersonalData)
            .await
            .unwrap();
        locators.push(locator);
    }
    locators
}

/// A row encrypted under the current key that is not in storage yet
async fn detached_row(
    vault: &FieldVault<Interleaving>,
    storage: &Interleaving,
    locator: &FieldLocator,
    value: &[u8],
) -> EncryptedField {
    vault.encrypt_field(locator, value, KeyPurpose::PersonalData).await.unwrap();
    let row = storage.get_field(locator).await.unwrap().unwrap();
    storage.delete_field(locator).await.unwrap();
    row
}

#[tokio::test]
async fn row_written_during_first_pass_is_picked_up_by_the_next() {
    let (vault, rotator, storage) = setup();
    let seeded = seed(&vault, 4).await;
    let newcomer = FieldLocator::new("org", "patients", "notes", "new");
    let row = detached_row(&vault, &storage, &newcomer, b"written mid-rotation").await;
    let old_key_id = row.key_id;

    storage.arm(Trigger::AfterCall(1), row);
    let report = rotator.rotate("org", KeyPurpose::PersonalData).await.unwrap();

    assert!(report.complete);
    assert_eq!(report.migrated, seeded.len() + 1);
    assert_eq!(report.superseded, 0);
    assert!(report.failures.is_empty());
    assert_eq!(report.retired_key_ids, vec![old_key_id]);

    let stored = storage.get_field(&newcomer).await.unwrap().unwrap();
    assert_eq!(stored.key_id, report.new_key_id);
    assert_eq!(&*vault.decrypt_field(&newcomer).await.unwrap(), b"written mid-rotation");
}

#[tokio::test]
async fn row_rewritten_after_snapshot_is_superseded_then_migrated() {
    let (vault, rotator, storage) = setup();
    let seeded = seed(&vault, 3).await;
    let contested = FieldLocator::new("org", "patients", "notes", "contested");

    // Both writes use the old key; the later one lands after the first scan
    vault
        .encrypt_field(&contested, b"late value", KeyPurpose::PersonalData)
        .await
        .unwrap();
    let late = storage.get_field(&contested).await.unwrap().unwrap();
    vault
        .encrypt_field(&contested, b"initial value", KeyPurpose::PersonalData)
        .await
        .unwrap();
    assert_ne!(storage.get_field(&contested).await.unwrap().unwrap().ciphertext, late.ciphertext);

    storage.arm(Trigger::AfterCall(1), late);
    let report = rotator.rotate("org", KeyPurpose::PersonalData).await.unwrap();

    assert!(report.complete);
    assert_eq!(report.superseded, 1);
    assert_eq!(report.migrated, seeded.len() + 1);
    assert!(report.failures.is_empty());

    let stored = storage.get_field(&contested).await.unwrap().unwrap();
    assert_eq!(stored.key_id, report.new_key_id);
    assert_eq!(&*vault.decrypt_field(&contested).await.unwrap(), b"late value");
}

#[tokio::test]
async fn row_landing_after_retirement_is_migrated_by_late_sweep() {
    let (vault, rotator, storage) = setup();
    let seeded = seed(&vault, 2).await;
    let straggler = FieldLocator::new("org", "patients", "notes", "straggler");
    let row = detached_row(&vault, &storage, &straggler, b"held an old key").await;
    let old_key_id = row.key_id;

    storage.arm(Trigger::AfterRetirement, row);
    let report = rotator.rotate("org", KeyPurpose::PersonalData).await.unwrap();

    assert!(report.complete);
    assert_eq!(report.retired_key_ids, vec![old_key_id]);
    assert_eq!(report.migrated, seeded.len() + 1);
    assert_eq!(report.superseded, 0);

    let stored = storage.get_field(&straggler).await.unwrap().unwrap();
    assert_eq!(stored.key_id, report.new_key_id);
    assert_eq!(storage.count_fields_by_key("org", &old_key_id).await.unwrap(), 0);
    assert_eq!(&*vault.decrypt_field(&straggler).await.unwrap(), b"held an old key");
}
