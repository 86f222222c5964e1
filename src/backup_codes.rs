//! Single-use backup codes
//!
//! A batch of high-entropy recovery codes is issued per `(organization,
//! user)`. Only Argon2id hashes are persisted; the plaintext codes are
//! returned to the caller exactly once. Verification consumes a code with a
//! single conditional update, so a code can succeed at most once.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, Rng};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::SecureKey;
use crate::error::{ProtectionError, Result};
use crate::storage::{BackupCode, BackupCodeStorage};

/// Symbols codes are drawn from (36 symbols, ~5.17 bits each)
pub const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const DEFAULT_BACKUP_CODE_COUNT: usize = 10;
pub const DEFAULT_BACKUP_CODE_LENGTH: usize = 8;
pub const DEFAULT_BACKUP_CODE_TTL_DAYS: i64 = 365;
/// Longest accepted batch lifetime (ten years)
pub const MAX_BACKUP_CODE_TTL_DAYS: i64 = 3650;

const HASH_LEN: usize = 32;
const SALT_LEN: usize = 16;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// How batches are generated and hashed
#[derive(Debug, Clone)]
pub struct BackupCodePolicy {
    pub count: usize,
    pub length: usize,
    pub ttl: Duration,
    pub argon2: Argon2Params,
    /// Server-side secret fed to Argon2; never stored with the hashes
    pub pepper: Option<SecureKey>,
}

impl Default for BackupCodePolicy {
    fn default() -> Self {
        Self {
            count: DEFAULT_BACKUP_CODE_COUNT,
            length: DEFAULT_BACKUP_CODE_LENGTH,
            ttl: Duration::days(DEFAULT_BACKUP_CODE_TTL_DAYS),
            argon2: Argon2Params::default(),
            pepper: None,
        }
    }
}

impl BackupCodePolicy {
    /// Bits of entropy carried by one code
    pub fn entropy_bits(&self) -> f64 {
        self.length as f64 * (BACKUP_CODE_ALPHABET.len() as f64).log2()
    }

    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(ProtectionError::Config("backup code count must be positive".into()));
        }
        if self.length < 8 {
            return Err(ProtectionError::Config(format!(
                "backup code length must be at least 8, got {}",
                self.length
            )));
        }
        if self.ttl <= Duration::zero() {
            return Err(ProtectionError::Config("backup code TTL must be positive".into()));
        }
        if self.ttl > Duration::days(MAX_BACKUP_CODE_TTL_DAYS) {
            return Err(ProtectionError::Config(format!(
                "backup code TTL must be at most {} days, got {}",
                MAX_BACKUP_CODE_TTL_DAYS,
                self.ttl.num_days()
            )));
        }
        self.argon2_params().map(|_| ())
    }

    fn argon2_params(&self) -> Result<Params> {
        Params::new(
            self.argon2.memory_kib,
            self.argon2.iterations,
            self.argon2.parallelism,
            Some(HASH_LEN),
        )
        .map_err(|e| ProtectionError::Config(format!("invalid Argon2 parameters: {}", e)))
    }
}

/// Deterministic Argon2id hashing of codes.
///
/// The salt is derived from the owner so that the hash of a presented code
/// can be looked up directly, while each user's hashes still need a separate
/// brute-force.
#[derive(Clone)]
struct CodeHasher {
    policy: Arc<BackupCodePolicy>,
}

impl CodeHasher {
    fn hash(&self, organization_id: &str, user_id: &str, code: &str) -> Result<String> {
        let params = self.policy.argon2_params()?;
        let argon2 = match &self.policy.pepper {
            Some(pepper) => Argon2::new_with_secret(pepper.as_bytes(), Algorithm::Argon2id, Version::V0x13, params)
                .map_err(|e| ProtectionError::Crypto(format!("Argon2 init error: {}", e)))?,
            None => Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        };

        let salt = owner_salt(organization_id, user_id);
        let mut output = Zeroizing::new([0u8; HASH_LEN]);
        argon2
            .hash_password_into(code.as_bytes(), &salt, &mut output[..])
            .map_err(|e| ProtectionError::Crypto(format!("Argon2 hash error: {}", e)))?;

        Ok(STANDARD.encode(&output[..]))
    }

    /// Hash `codes` in order on the blocking pool
    async fn hash_all(
        &self,
        organization_id: &str,
        user_id: &str,
        codes: Zeroizing<Vec<String>>,
    ) -> Result<Vec<String>> {
        let hasher = self.clone();
        let organization_id = organization_id.to_string();
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || {
            codes
                .iter()
                .map(|code| hasher.hash(&organization_id, &user_id, code))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| ProtectionError::Crypto(format!("backup code hashing task failed: {}", e)))?
    }
}

fn owner_salt(organization_id: &str, user_id: &str) -> [u8; SALT_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(b"backup-code");
    for part in [organization_id, user_id] {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();

    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&digest[..SALT_LEN]);
    salt
}

/// Strip separators and whitespace, uppercase letters
pub fn normalize_code(presented: &str) -> String {
    presented
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

fn generate_code(length: usize) -> String {
    let mut rng = OsRng;
    (0..length)
        .map(|_| BACKUP_CODE_ALPHABET[rng.gen_range(0..BACKUP_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Plaintext codes of a freshly issued batch. Shown once, never stored.
pub struct IssuedCodes {
    pub codes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCodes")
            .field("codes", &format_args!("[{} REDACTED]", self.codes.len()))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Generates and stores backup code batches
pub struct BackupCodeIssuer<S: BackupCodeStorage> {
    storage: Arc<S>,
    hasher: CodeHasher,
}

impl<S: BackupCodeStorage> BackupCodeIssuer<S> {
    pub fn new(storage: Arc<S>, policy: Arc<BackupCodePolicy>) -> Self {
        Self {
            storage,
            hasher: CodeHasher { policy },
        }
    }

    /// Issue a new batch, replacing any prior batch for this user
    pub async fn issue(&self, organization_id: &str, user_id: &str) -> Result<IssuedCodes> {
        self.issue_at(organization_id, user_id, Utc::now()).await
    }

    pub async fn issue_at(&self, organization_id: &str, user_id: &str, now: DateTime<Utc>) -> Result<IssuedCodes> {
        self.issue_batch(organization_id, user_id, self.hasher.policy.count, now)
            .await
    }

    /// Issue a batch of `count` codes instead of the policy's count
    pub async fn issue_with_count(&self, organization_id: &str, user_id: &str, count: usize) -> Result<IssuedCodes> {
        self.issue_batch(organization_id, user_id, count, Utc::now()).await
    }

    async fn issue_batch(
        &self,
        organization_id: &str,
        user_id: &str,
        count: usize,
        now: DateTime<Utc>,
    ) -> Result<IssuedCodes> {
        let policy = &self.hasher.policy;
        if count == 0 {
            return Err(ProtectionError::Config("backup code count must be positive".into()));
        }
        let expires_at = now.checked_add_signed(policy.ttl).ok_or_else(|| {
            ProtectionError::Config(format!(
                "backup code TTL of {} days overflows the expiry timestamp",
                policy.ttl.num_days()
            ))
        })?;

        debug!(organization_id, user_id, count, "generating backup codes");
        let mut seen = HashSet::with_capacity(count);
        let mut codes = Vec::with_capacity(count);
        while codes.len() < count {
            let code = generate_code(policy.length);
            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }

        let hashes = self
            .hasher
            .hash_all(organization_id, user_id, Zeroizing::new(codes.clone()))
            .await?;
        let rows = hashes
            .into_iter()
            .map(|code_hash| BackupCode {
                id: Uuid::new_v4(),
                organization_id: organization_id.to_string(),
                user_id: user_id.to_string(),
                code_hash,
                used_at: None,
                expires_at,
                created_at: now,
            })
            .collect();

        self.storage
            .replace_backup_codes(organization_id, user_id, rows)
            .await?;

        info!(
            organization_id,
            user_id,
            count = codes.len(),
            %expires_at,
            "issued backup code batch; prior batch invalidated"
        );

        Ok(IssuedCodes { codes, expires_at })
    }
}

/// Checks and consumes presented backup codes
pub struct BackupCodeVerifier<S: BackupCodeStorage> {
    storage: Arc<S>,
    hasher: CodeHasher,
}

impl<S: BackupCodeStorage> BackupCodeVerifier<S> {
    pub fn new(storage: Arc<S>, policy: Arc<BackupCodePolicy>) -> Self {
        Self {
            storage,
            hasher: CodeHasher { policy },
        }
    }

    /// Returns `true` exactly once per valid, unexpired code.
    ///
    /// A wrong, used or expired code is `Ok(false)`; only infrastructure
    /// failures are errors.
    pub async fn verify(&self, organization_id: &str, user_id: &str, presented: &str) -> Result<bool> {
        self.verify_at(organization_id, user_id, presented, Utc::now()).await
    }

    pub async fn verify_at(
        &self,
        organization_id: &str,
        user_id: &str,
        presented: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let code = Zeroizing::new(normalize_code(presented));
        let well_formed = code.len() == self.hasher.policy.length
            && code.bytes().all(|b| BACKUP_CODE_ALPHABET.contains(&b));
        if !well_formed {
            debug!(organization_id, user_id, "rejected malformed backup code");
            return Ok(false);
        }

        let code_hash = self
            .hasher
            .hash_all(organization_id, user_id, Zeroizing::new(vec![(*code).clone()]))
            .await?
            .pop()
            .ok_or_else(|| ProtectionError::Crypto("backup code hashing returned no hash".into()))?;
        let consumed = self
            .storage
            .consume_backup_code(organization_id, user_id, &code_hash, now)
            .await?;

        if consumed {
            info!(organization_id, user_id, "backup code consumed");
        } else {
            debug!(organization_id, user_id, "backup code not accepted");
        }
        Ok(consumed)
    }

    /// Unused, unexpired codes left for a user
    pub async fn remaining(&self, organization_id: &str, user_id: &str) -> Result<u64> {
        self.storage
            .count_usable_backup_codes(organization_id, user_id, Utc::now())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn cheap_policy() -> Arc<BackupCodePolicy> {
        Arc::new(BackupCodePolicy {
            argon2: Argon2Params {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            },
            ..BackupCodePolicy::default()
        })
    }

    fn pair() -> (BackupCodeIssuer<InMemoryStorage>, BackupCodeVerifier<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let policy = cheap_policy();
        (
            BackupCodeIssuer::new(Arc::clone(&storage), Arc::clone(&policy)),
            BackupCodeVerifier::new(storage, policy),
        )
    }

    #[test]
    fn test_generated_codes_use_alphabet() {
        let code = generate_code(8);
        assert_eq!(code.len(), 8);
        assert!(code.bytes().all(|b| BACKUP_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_default_policy_entropy() {
        let policy = BackupCodePolicy::default();
        assert!(policy.entropy_bits() >= 41.0);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_policy_rejects_short_codes() {
        let policy = BackupCodePolicy { length: 6, ..BackupCodePolicy::default() };
        assert!(matches!(policy.validate(), Err(ProtectionError::Config(_))));
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(" abcd-ef12 "), "ABCDEF12");
        assert_eq!(normalize_code("AB CD EF 12"), "ABCDEF12");
    }

    #[test]
    fn test_hash_is_owner_bound_and_peppered() {
        let hasher = CodeHasher { policy: cheap_policy() };
        let a = hasher.hash("org", "u1", "ABCDEFGH").unwrap();
        assert_eq!(a, hasher.hash("org", "u1", "ABCDEFGH").unwrap());
        assert_ne!(a, hasher.hash("org", "u2", "ABCDEFGH").unwrap());

        let peppered = CodeHasher {
            policy: Arc::new(BackupCodePolicy {
                pepper: Some(SecureKey::generate()),
                ..(*cheap_policy()).clone()
            }),
        };
        assert_ne!(a, peppered.hash("org", "u1", "ABCDEFGH").unwrap());
    }

    #[tokio::test]
    async fn test_issue_then_verify_once() {
        let (issuer, verifier) = pair();
        let issued = issuer.issue("A", "u1").await.unwrap();
        assert_eq!(issued.codes.len(), DEFAULT_BACKUP_CODE_COUNT);

        let code = &issued.codes[3];
        assert!(verifier.verify("A", "u1", code).await.unwrap());
        assert!(!verifier.verify("A", "u1", code).await.unwrap());
        assert!(!verifier.verify("A", "u1", "ZZZZZZZZ").await.unwrap());
        assert_eq!(verifier.remaining("A", "u1").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_lowercase_and_dashed_input_accepted() {
        let (issuer, verifier) = pair();
        let issued = issuer.issue("A", "u1").await.unwrap();
        let code = issued.codes[0].to_lowercase();
        let dashed = format!("{}-{}", &code[..4], &code[4..]);
        assert!(verifier.verify("A", "u1", &dashed).await.unwrap());
    }

    #[tokio::test]
    async fn test_code_bound_to_user() {
        let (issuer, verifier) = pair();
        let issued = issuer.issue("A", "u1").await.unwrap();
        assert!(!verifier.verify("A", "u2", &issued.codes[0]).await.unwrap());
        assert!(!verifier.verify("B", "u1", &issued.codes[0]).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_code_rejected() {
        let (issuer, verifier) = pair();
        let issued_at = Utc::now() - Duration::days(DEFAULT_BACKUP_CODE_TTL_DAYS + 1);
        let issued = issuer.issue_at("A", "u1", issued_at).await.unwrap();
        assert!(!verifier.verify("A", "u1", &issued.codes[0]).await.unwrap());
    }

    #[test]
    fn test_policy_rejects_ttl_beyond_limit() {
        let policy = BackupCodePolicy {
            ttl: Duration::days(MAX_BACKUP_CODE_TTL_DAYS + 1),
            ..BackupCodePolicy::default()
        };
        assert!(matches!(policy.validate(), Err(ProtectionError::Config(_))));
    }

    #[tokio::test]
    async fn test_overflowing_expiry_is_error_not_panic() {
        let storage = Arc::new(InMemoryStorage::new());
        let policy = Arc::new(BackupCodePolicy {
            ttl: Duration::days(100_000_000),
            ..(*cheap_policy()).clone()
        });
        let issuer = BackupCodeIssuer::new(storage, policy);
        assert!(matches!(
            issuer.issue("A", "u1").await,
            Err(ProtectionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_issue_with_count() {
        let (issuer, verifier) = pair();
        let issued = issuer.issue_with_count("A", "u1", 4).await.unwrap();
        assert_eq!(issued.codes.len(), 4);
        assert_eq!(verifier.remaining("A", "u1").await.unwrap(), 4);

        assert!(matches!(
            issuer.issue_with_count("A", "u1", 0).await,
            Err(ProtectionError::Config(_))
        ));
        // A rejected call leaves the existing batch alone
        assert_eq!(verifier.remaining("A", "u1").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_issued_codes_debug_redacted() {
        let (issuer, _) = pair();
        let issued = issuer.issue("A", "u1").await.unwrap();
        let rendered = format!("{:?}", issued);
        assert!(!rendered.contains(&issued.codes[0]));
    }
}
