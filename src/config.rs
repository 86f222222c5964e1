//! Environment-driven service configuration

use std::str::FromStr;

use chrono::Duration;

use crate::backup_codes::{
    Argon2Params, BackupCodePolicy, DEFAULT_BACKUP_CODE_COUNT, DEFAULT_BACKUP_CODE_LENGTH,
    DEFAULT_BACKUP_CODE_TTL_DAYS,
};
use crate::crypto::{SecureKey, AES_256_KEY_SIZE};
use crate::error::{ProtectionError, Result};

pub const DEFAULT_ROTATION_SWEEP_PASSES: usize = 3;

const PEPPER_MIN_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Postgres connection string; `None` selects in-memory storage
    pub database_url: Option<String>,
    /// Wraps key material at rest when set
    pub master_key: Option<SecureKey>,
    pub backup_codes: BackupCodePolicy,
    /// Re-enumeration passes a rotation makes before giving up on stragglers
    pub rotation_sweep_passes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            master_key: None,
            backup_codes: BackupCodePolicy::default(),
            rotation_sweep_passes: DEFAULT_ROTATION_SWEEP_PASSES,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the process environment (and `.env`, if present)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let master_key = get("MASTER_KEY_BASE64")
            .map(|v| {
                SecureKey::from_base64(&v, AES_256_KEY_SIZE).map_err(|e| {
                    ProtectionError::Config(format!("MASTER_KEY_BASE64 must decode to exactly 32 bytes: {}", e))
                })
            })
            .transpose()?;

        let pepper = get("BACKUP_CODE_PEPPER_BASE64")
            .map(|v| decode_pepper(&v))
            .transpose()?;

        let ttl_days: i64 = parse_var(&get, "BACKUP_CODE_TTL_DAYS", DEFAULT_BACKUP_CODE_TTL_DAYS)?;

        let backup_codes = BackupCodePolicy {
            count: parse_var(&get, "BACKUP_CODE_COUNT", DEFAULT_BACKUP_CODE_COUNT)?,
            length: parse_var(&get, "BACKUP_CODE_LENGTH", DEFAULT_BACKUP_CODE_LENGTH)?,
            ttl: Duration::try_days(ttl_days).ok_or_else(|| {
                ProtectionError::Config(format!("invalid BACKUP_CODE_TTL_DAYS: {} is out of range", ttl_days))
            })?,
            argon2: Argon2Params {
                memory_kib: parse_var(&get, "ARGON2_MEMORY_KIB", Argon2Params::default().memory_kib)?,
                iterations: parse_var(&get, "ARGON2_ITERATIONS", Argon2Params::default().iterations)?,
                parallelism: parse_var(&get, "ARGON2_PARALLELISM", Argon2Params::default().parallelism)?,
            },
            pepper,
        };
        backup_codes.validate()?;

        Ok(Self {
            database_url: get("DATABASE_URL"),
            master_key,
            backup_codes,
            rotation_sweep_passes: parse_var(&get, "ROTATION_SWEEP_PASSES", DEFAULT_ROTATION_SWEEP_PASSES)?,
        })
    }
}

fn parse_var<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ProtectionError::Config(format!("invalid {}: {}", name, e))),
        None => Ok(default),
    }
}

fn decode_pepper(encoded: &str) -> Result<SecureKey> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| ProtectionError::Config(format!("invalid BACKUP_CODE_PEPPER_BASE64: {}", e)))?;
    if bytes.len() < PEPPER_MIN_LEN {
        return Err(ProtectionError::Config(format!(
            "BACKUP_CODE_PEPPER_BASE64 must decode to at least {} bytes, got {}",
            PEPPER_MIN_LEN,
            bytes.len()
        )));
    }
    Ok(SecureKey::new(bytes))
}
