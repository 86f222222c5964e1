//! Key rotation with re-encryption of existing fields
//!
//! A rotation moves through `Idle -> KeyCreated -> Migrating -> Retiring ->
//! Idle`. Old versions are only deactivated once no field references them;
//! until then they stay active so every unmigrated row remains decryptable.
//! Keys are never deleted.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ProtectionError, Result};
use crate::key_store::{EncryptionKey, KeyStore};
use crate::purpose::KeyPurpose;
use crate::storage::{EncryptedField, FieldLocator, FieldStorage, KeyStorage};
use crate::vault::{open_field, seal_field};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    Idle,
    KeyCreated,
    Migrating,
    Retiring,
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RotationPhase::Idle => "idle",
            RotationPhase::KeyCreated => "key_created",
            RotationPhase::Migrating => "migrating",
            RotationPhase::Retiring => "retiring",
        };
        f.write_str(name)
    }
}

/// A field that could not be moved to the new key
#[derive(Debug, Clone, Serialize)]
pub struct MigrationFailure {
    pub locator: FieldLocator,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationReport {
    pub organization_id: String,
    pub purpose: KeyPurpose,
    pub new_key_id: Uuid,
    pub new_version: u32,
    /// Versions deactivated by this rotation; empty when retirement was withheld
    pub retired_key_ids: Vec<Uuid>,
    /// Fields re-encrypted under the new key
    pub migrated: usize,
    /// Fields rewritten by a concurrent writer before migration reached them
    pub superseded: usize,
    pub failures: Vec<MigrationFailure>,
    /// No field references a retired version and all old versions are retired
    pub complete: bool,
}

impl fmt::Display for RotationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} -> v{}, {} migrated, {} superseded, {} failed, {} retired{}",
            self.organization_id,
            self.purpose,
            self.new_version,
            self.migrated,
            self.superseded,
            self.failures.len(),
            self.retired_key_ids.len(),
            if self.complete { "" } else { " (incomplete)" }
        )
    }
}

enum Step {
    Migrated,
    Superseded,
}

/// Per-call migration state: resolved old keys and locators that failed
struct Migration {
    new_key: EncryptionKey,
    old_keys: HashMap<Uuid, EncryptionKey>,
    failed: HashSet<FieldLocator>,
}

pub struct KeyRotator<S: KeyStorage + FieldStorage> {
    keys: KeyStore<S>,
    storage: Arc<S>,
    sweep_passes: usize,
    locks: Mutex<HashMap<(String, KeyPurpose), Arc<AsyncMutex<()>>>>,
}

impl<S: KeyStorage + FieldStorage> KeyRotator<S> {
    pub fn new(storage: Arc<S>, keys: KeyStore<S>, sweep_passes: usize) -> Self {
        Self {
            keys,
            storage,
            sweep_passes,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Rotate the key of `(organization_id, purpose)` and migrate every field
    /// encrypted under an older version. Returns the report even when some
    /// fields could not be migrated; in that case no version is retired.
    pub async fn rotate(&self, organization_id: &str, purpose: KeyPurpose) -> Result<RotationReport> {
        let lock = self.lock_for(organization_id, purpose);
        let _guard = lock.lock().await;

        let mut phase = RotationPhase::Idle;
        enter(&mut phase, RotationPhase::KeyCreated, organization_id, purpose);
        let new_key = self.keys.create_key(organization_id, purpose).await?;

        let active = self.keys.get_active_key(organization_id, purpose).await?;
        if active.as_ref().map(|k| k.id) != Some(new_key.id) {
            return Err(ProtectionError::KeyRotation(format!(
                "key {} (v{}) is not the active key for {}/{} after creation; a concurrent rotation is running",
                new_key.id, new_key.version, organization_id, purpose
            )));
        }

        let old_ids: Vec<Uuid> = self
            .keys
            .list_keys(organization_id, purpose)
            .await?
            .into_iter()
            .filter(|k| k.id != new_key.id)
            .map(|k| k.id)
            .collect();

        let mut report = RotationReport {
            organization_id: organization_id.to_string(),
            purpose,
            new_key_id: new_key.id,
            new_version: new_key.version,
            retired_key_ids: Vec::new(),
            migrated: 0,
            superseded: 0,
            failures: Vec::new(),
            complete: false,
        };
        let mut migration = Migration {
            new_key,
            old_keys: HashMap::new(),
            failed: HashSet::new(),
        };

        enter(&mut phase, RotationPhase::Migrating, organization_id, purpose);
        for pass in 0..=self.sweep_passes {
            let pending = self.pending(organization_id, &old_ids, &migration).await?;
            if pending.is_empty() {
                break;
            }
            debug!(organization_id, %purpose, pass, count = pending.len(), "migrating fields");
            for field in pending {
                self.migrate(field, &mut migration, &mut report).await;
            }
        }

        for field in self.pending(organization_id, &old_ids, &migration).await? {
            report.failures.push(MigrationFailure {
                locator: field.locator,
                reason: format!("still on a retiring key after {} sweep passes", self.sweep_passes),
            });
        }

        if !report.failures.is_empty() {
            enter(&mut phase, RotationPhase::Idle, organization_id, purpose);
            warn!(
                organization_id,
                %purpose,
                failed = report.failures.len(),
                "rotation left fields unmigrated; old key versions stay active"
            );
            return Ok(report);
        }

        enter(&mut phase, RotationPhase::Retiring, organization_id, purpose);
        for key_id in &old_ids {
            self.keys.deactivate(organization_id, key_id).await?;
        }
        report.retired_key_ids = old_ids.clone();

        // Writers that fetched an old key just before deactivation may have
        // landed rows after the last sweep.
        let late = self.pending(organization_id, &old_ids, &migration).await?;
        if !late.is_empty() {
            debug!(organization_id, %purpose, count = late.len(), "migrating late writes after retirement");
        }
        for field in late {
            self.migrate(field, &mut migration, &mut report).await;
        }

        enter(&mut phase, RotationPhase::Idle, organization_id, purpose);
        report.complete = report.failures.is_empty();

        if report.complete {
            info!(organization_id, %purpose, "rotation complete: {}", report);
        } else {
            warn!(organization_id, %purpose, "rotation finished with late failures: {}", report);
        }
        Ok(report)
    }

    fn lock_for(&self, organization_id: &str, purpose: KeyPurpose) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry((organization_id.to_string(), purpose))
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    async fn pending(
        &self,
        organization_id: &str,
        old_ids: &[Uuid],
        migration: &Migration,
    ) -> Result<Vec<EncryptedField>> {
        if old_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut fields = self.storage.fields_by_keys(organization_id, old_ids).await?;
        fields.retain(|f| !migration.failed.contains(&f.locator));
        Ok(fields)
    }

    async fn migrate(&self, field: EncryptedField, migration: &mut Migration, report: &mut RotationReport) {
        let locator = field.locator.clone();
        match self.migrate_one(field, migration).await {
            Ok(Step::Migrated) => report.migrated += 1,
            Ok(Step::Superseded) => {
                debug!(field = %locator, "field rewritten concurrently, skipping");
                report.superseded += 1;
            }
            Err(e) => {
                warn!(field = %locator, error = %e, "field migration failed");
                migration.failed.insert(locator.clone());
                report.failures.push(MigrationFailure {
                    locator,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn migrate_one(&self, field: EncryptedField, migration: &mut Migration) -> Result<Step> {
        if !migration.old_keys.contains_key(&field.key_id) {
            let key = self
                .keys
                .resolve(&field.locator.organization_id, &field.key_id)
                .await?;
            migration.old_keys.insert(field.key_id, key);
        }
        let old_key = migration
            .old_keys
            .get(&field.key_id)
            .ok_or_else(|| ProtectionError::KeyNotFound(field.key_id.to_string()))?;

        let plaintext = open_field(&field, old_key)?;
        let ciphertext = seal_field(&field.locator, &migration.new_key, &plaintext)?;

        let updated = self
            .storage
            .update_field_if_unchanged(&field, &ciphertext, &migration.new_key.id)
            .await?;

        Ok(if updated { Step::Migrated } else { Step::Superseded })
    }
}

fn enter(phase: &mut RotationPhase, next: RotationPhase, organization_id: &str, purpose: KeyPurpose) {
    debug!(organization_id, %purpose, from = %phase, to = %next, "rotation phase");
    *phase = next;
}
