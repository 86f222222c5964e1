use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{ProtectionError, Result};
use crate::purpose::KeyPurpose;
use crate::storage::{
    BackupCode, BackupCodeStorage, EncryptedField, FieldLocator, FieldStorage, KeyStorage, StoredKey,
};

const SCHEMA: &str = include_str!("../migrations/001_init_schema.sql");

/// Production PostgreSQL storage implementation
///
/// - Key material is stored as opaque text (wrapped when a master key is set)
/// - `encrypted_fields.key_id` is a foreign key into `encryption_keys`
/// - Every query is scoped by `organization_id`
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| ProtectionError::Storage(format!("Failed to apply schema: {}", e)))?;
        Ok(())
    }
}

fn storage_err(context: &str) -> impl FnOnce(sqlx::Error) -> ProtectionError + '_ {
    move |e| ProtectionError::Storage(format!("{}: {}", context, e))
}

fn version_to_db(version: u32) -> Result<i32> {
    i32::try_from(version).map_err(|_| ProtectionError::InvalidKeyState(format!("key version {} out of range", version)))
}

fn version_from_db(version: i32) -> Result<u32> {
    u32::try_from(version).map_err(|_| ProtectionError::InvalidKeyState(format!("negative key version {}", version)))
}

fn row_to_key(row: &PgRow) -> Result<StoredKey> {
    const CONTEXT: &str = "Failed to decode key row";
    let purpose: String = row.try_get("purpose").map_err(storage_err(CONTEXT))?;
    let version: i32 = row.try_get("version").map_err(storage_err(CONTEXT))?;

    Ok(StoredKey {
        id: row.try_get("id").map_err(storage_err(CONTEXT))?,
        organization_id: row.try_get("organization_id").map_err(storage_err(CONTEXT))?,
        purpose: purpose.parse()?,
        version: version_from_db(version)?,
        material: row.try_get("material").map_err(storage_err(CONTEXT))?,
        wrapped: row.try_get("wrapped").map_err(storage_err(CONTEXT))?,
        is_active: row.try_get("is_active").map_err(storage_err(CONTEXT))?,
        created_at: row.try_get("created_at").map_err(storage_err(CONTEXT))?,
    })
}

fn row_to_field(row: &PgRow) -> Result<EncryptedField> {
    let get_text = |col: &str| -> Result<String> {
        row.try_get(col).map_err(storage_err("Failed to decode field row"))
    };

    Ok(EncryptedField {
        locator: FieldLocator {
            organization_id: get_text("organization_id")?,
            table_name: get_text("table_name")?,
            field_name: get_text("field_name")?,
            record_id: get_text("record_id")?,
        },
        ciphertext: get_text("ciphertext")?,
        key_id: row.try_get("key_id").map_err(storage_err("Failed to decode field row"))?,
        updated_at: row.try_get("updated_at").map_err(storage_err("Failed to decode field row"))?,
    })
}

const KEY_COLUMNS: &str = "id, organization_id, purpose, version, material, wrapped, is_active, created_at";
const FIELD_COLUMNS: &str = "organization_id, table_name, field_name, record_id, ciphertext, key_id, updated_at";

#[async_trait]
impl KeyStorage for PostgresStorage {
    async fn insert_key(&self, key: StoredKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO encryption_keys (id, organization_id, purpose, version, material, wrapped, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (organization_id, purpose, version) DO NOTHING
            "#,
        )
        .bind(key.id)
        .bind(&key.organization_id)
        .bind(key.purpose.as_str())
        .bind(version_to_db(key.version)?)
        .bind(&key.material)
        .bind(key.wrapped)
        .bind(key.is_active)
        .bind(key.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to store key"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_key(&self, organization_id: &str, key_id: &Uuid) -> Result<Option<StoredKey>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM encryption_keys WHERE organization_id = $1 AND id = $2",
            KEY_COLUMNS
        ))
        .bind(organization_id)
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("Failed to get key"))?;

        row.as_ref().map(row_to_key).transpose()
    }

    async fn get_active_key(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Option<StoredKey>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM encryption_keys
            WHERE organization_id = $1 AND purpose = $2 AND is_active = TRUE
            ORDER BY version DESC
            LIMIT 1
            "#,
            KEY_COLUMNS
        ))
        .bind(organization_id)
        .bind(purpose.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("Failed to get active key"))?;

        row.as_ref().map(row_to_key).transpose()
    }

    async fn list_keys(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Vec<StoredKey>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM encryption_keys
            WHERE organization_id = $1 AND purpose = $2
            ORDER BY version DESC
            "#,
            KEY_COLUMNS
        ))
        .bind(organization_id)
        .bind(purpose.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("Failed to list keys"))?;

        rows.iter().map(row_to_key).collect()
    }

    async fn max_version(&self, organization_id: &str, purpose: KeyPurpose) -> Result<Option<u32>> {
        let row = sqlx::query(
            r#"
            SELECT MAX(version) AS max_version
            FROM encryption_keys
            WHERE organization_id = $1 AND purpose = $2
            "#,
        )
        .bind(organization_id)
        .bind(purpose.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err("Failed to get max key version"))?;

        let max: Option<i32> = row
            .try_get("max_version")
            .map_err(storage_err("Failed to decode max key version"))?;
        max.map(version_from_db).transpose()
    }

    async fn set_key_active(&self, organization_id: &str, key_id: &Uuid, active: bool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE encryption_keys
            SET is_active = $3
            WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(organization_id)
        .bind(key_id)
        .bind(active)
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to update key state"))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl FieldStorage for PostgresStorage {
    async fn upsert_field(&self, field: EncryptedField) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO encrypted_fields (organization_id, table_name, field_name, record_id, ciphertext, key_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (organization_id, table_name, field_name, record_id)
            DO UPDATE SET ciphertext = EXCLUDED.ciphertext,
                          key_id = EXCLUDED.key_id,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&field.locator.organization_id)
        .bind(&field.locator.table_name)
        .bind(&field.locator.field_name)
        .bind(&field.locator.record_id)
        .bind(&field.ciphertext)
        .bind(field.key_id)
        .bind(field.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to upsert encrypted field"))?;

        Ok(())
    }

    async fn get_field(&self, locator: &FieldLocator) -> Result<Option<EncryptedField>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM encrypted_fields
            WHERE organization_id = $1 AND table_name = $2 AND field_name = $3 AND record_id = $4
            "#,
            FIELD_COLUMNS
        ))
        .bind(&locator.organization_id)
        .bind(&locator.table_name)
        .bind(&locator.field_name)
        .bind(&locator.record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err("Failed to get encrypted field"))?;

        row.as_ref().map(row_to_field).transpose()
    }

    async fn delete_field(&self, locator: &FieldLocator) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM encrypted_fields
            WHERE organization_id = $1 AND table_name = $2 AND field_name = $3 AND record_id = $4
            "#,
        )
        .bind(&locator.organization_id)
        .bind(&locator.table_name)
        .bind(&locator.field_name)
        .bind(&locator.record_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to delete encrypted field"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn fields_by_keys(&self, organization_id: &str, key_ids: &[Uuid]) -> Result<Vec<EncryptedField>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM encrypted_fields
            WHERE organization_id = $1 AND key_id = ANY($2)
            ORDER BY table_name, field_name, record_id
            "#,
            FIELD_COLUMNS
        ))
        .bind(organization_id)
        .bind(key_ids.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err("Failed to list encrypted fields by key"))?;

        rows.iter().map(row_to_field).collect()
    }

    async fn update_field_if_unchanged(
        &self,
        current: &EncryptedField,
        ciphertext: &str,
        new_key_id: &Uuid,
    ) -> Result<bool> {
        let locator = &current.locator;
        let result = sqlx::query(
            r#"
            UPDATE encrypted_fields
            SET ciphertext = $5, key_id = $6, updated_at = $7
            WHERE organization_id = $1 AND table_name = $2 AND field_name = $3 AND record_id = $4
              AND key_id = $8 AND ciphertext = $9
            "#,
        )
        .bind(&locator.organization_id)
        .bind(&locator.table_name)
        .bind(&locator.field_name)
        .bind(&locator.record_id)
        .bind(ciphertext)
        .bind(new_key_id)
        .bind(Utc::now())
        .bind(current.key_id)
        .bind(&current.ciphertext)
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to migrate encrypted field"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_fields_by_key(&self, organization_id: &str, key_id: &Uuid) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM encrypted_fields
            WHERE organization_id = $1 AND key_id = $2
            "#,
        )
        .bind(organization_id)
        .bind(key_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err("Failed to count encrypted fields"))?;

        let count: i64 = row.try_get("count").map_err(storage_err("Failed to decode field count"))?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl BackupCodeStorage for PostgresStorage {
    async fn replace_backup_codes(
        &self,
        organization_id: &str,
        user_id: &str,
        codes: Vec<BackupCode>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage_err("Failed to begin transaction"))?;

        sqlx::query("DELETE FROM backup_codes WHERE organization_id = $1 AND user_id = $2")
            .bind(organization_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_err("Failed to delete prior backup codes"))?;

        for code in &codes {
            sqlx::query(
                r#"
                INSERT INTO backup_codes (id, organization_id, user_id, code_hash, used_at, expires_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(code.id)
            .bind(&code.organization_id)
            .bind(&code.user_id)
            .bind(&code.code_hash)
            .bind(code.used_at)
            .bind(code.expires_at)
            .bind(code.created_at)
            .execute(&mut *tx)
            .await
            .map_err(storage_err("Failed to store backup code"))?;
        }

        tx.commit()
            .await
            .map_err(storage_err("Failed to commit backup codes"))?;
        Ok(())
    }

    async fn consume_backup_code(
        &self,
        organization_id: &str,
        user_id: &str,
        code_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE backup_codes
            SET used_at = $4
            WHERE organization_id = $1 AND user_id = $2 AND code_hash = $3
              AND used_at IS NULL AND expires_at > $4
            "#,
        )
        .bind(organization_id)
        .bind(user_id)
        .bind(code_hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_err("Failed to consume backup code"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn count_usable_backup_codes(
        &self,
        organization_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM backup_codes
            WHERE organization_id = $1 AND user_id = $2 AND used_at IS NULL AND expires_at > $3
            "#,
        )
        .bind(organization_id)
        .bind(user_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err("Failed to count backup codes"))?;

        let count: i64 = row.try_get("count").map_err(storage_err("Failed to decode code count"))?;
        Ok(count.max(0) as u64)
    }
}
