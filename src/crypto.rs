//! Cryptographic primitives for field-level envelope encryption
//!
//! This module provides the stateless AES-256-GCM cipher used for both field
//! values and wrapped key material. Every encryption draws a fresh 96-bit
//! nonce; blobs are stored as base64 `nonce || ciphertext || tag`.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtectionError, Result};

/// AES-256 key size in bytes (256 bits)
pub const AES_256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// A secure key wrapper that zeroizes memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: Vec<u8>,
}

impl SecureKey {
    /// Create a new SecureKey from raw bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Generate a new random AES-256 key
    pub fn generate() -> Self {
        Self::generate_with_len(AES_256_KEY_SIZE)
    }

    /// Generate random key material of an arbitrary length
    pub fn generate_with_len(len: usize) -> Self {
        Self { bytes: generate_random_bytes(len) }
    }

    /// Decode key material from base64, checking the expected length
    pub fn from_base64(encoded: &str, expected_len: usize) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProtectionError::Crypto(format!("Base64 decode error: {}", e)))?;

        if bytes.len() != expected_len {
            return Err(ProtectionError::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                expected_len,
                bytes.len()
            )));
        }

        Ok(Self { bytes })
    }

    /// Encode key material as base64 (storage boundary only)
    pub(crate) fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

/// Encrypted data container with nonce and ciphertext
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncryptedData {
    /// The nonce used for encryption (12 bytes for AES-GCM)
    pub nonce: Vec<u8>,
    /// The ciphertext including authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Create a new EncryptedData container
    pub fn new(nonce: Vec<u8>, ciphertext: Vec<u8>) -> Self {
        Self { nonce, ciphertext }
    }

    /// Encode `nonce || ciphertext || tag` to base64 for storage
    pub fn to_base64(&self) -> String {
        let combined = [self.nonce.as_slice(), self.ciphertext.as_slice()].concat();
        STANDARD.encode(combined)
    }

    /// Decode from base64.
    ///
    /// A blob that cannot be decoded or split is reported as an integrity
    /// failure: the stored value is not something this cipher produced.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|_| ProtectionError::Integrity("ciphertext is not valid base64".into()))?;

        if decoded.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ProtectionError::Integrity("ciphertext is truncated".into()));
        }

        let (nonce, ciphertext) = decoded.split_at(NONCE_SIZE);
        Ok(Self {
            nonce: nonce.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// AES-256-GCM cipher wrapper
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Encrypt plaintext using AES-256-GCM with a fresh random nonce
    ///
    /// # Arguments
    /// * `key` - The 256-bit encryption key
    /// * `plaintext` - The data to encrypt
    /// * `aad` - Additional authenticated data (optional context)
    pub fn encrypt(key: &SecureKey, plaintext: &[u8], aad: Option<&[u8]>) -> Result<EncryptedData> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        Self::encrypt_with_nonce(key, nonce_bytes, plaintext, aad)
    }

    /// Encrypt with a caller-supplied nonce.
    ///
    /// Only for known-answer checks of the blob framing. Reusing a nonce under
    /// the same key destroys AES-GCM confidentiality and integrity.
    pub fn encrypt_with_nonce(
        key: &SecureKey,
        nonce_bytes: [u8; NONCE_SIZE],
        plaintext: &[u8],
        aad: Option<&[u8]>,
    ) -> Result<EncryptedData> {
        let cipher = Self::cipher(key)?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: aad.unwrap_or_default() })
            .map_err(|e| ProtectionError::Crypto(format!("Encryption error: {}", e)))?;

        Ok(EncryptedData::new(nonce_bytes.to_vec(), ciphertext))
    }

    /// Decrypt ciphertext using AES-256-GCM
    ///
    /// Fails with [`ProtectionError::Integrity`] on a wrong key, tampered
    /// ciphertext, mismatched AAD or a malformed nonce. No partial plaintext
    /// is ever returned.
    pub fn decrypt(key: &SecureKey, encrypted: &EncryptedData, aad: Option<&[u8]>) -> Result<Vec<u8>> {
        if encrypted.nonce.len() != NONCE_SIZE {
            return Err(ProtectionError::Integrity(format!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                encrypted.nonce.len()
            )));
        }

        let cipher = Self::cipher(key)?;
        let nonce = Nonce::from_slice(&encrypted.nonce);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &encrypted.ciphertext,
                    aad: aad.unwrap_or_default(),
                },
            )
            .map_err(|_| ProtectionError::Integrity("Decryption failed: authentication error".into()))
    }

    /// Encrypt and encode to the storage text form
    pub fn seal(key: &SecureKey, plaintext: &[u8], aad: Option<&[u8]>) -> Result<String> {
        Ok(Self::encrypt(key, plaintext, aad)?.to_base64())
    }

    /// Decode the storage text form and decrypt
    pub fn open(key: &SecureKey, blob: &str, aad: Option<&[u8]>) -> Result<Vec<u8>> {
        let encrypted = EncryptedData::from_base64(blob)?;
        Self::decrypt(key, &encrypted, aad)
    }

    fn cipher(key: &SecureKey) -> Result<Aes256Gcm> {
        if key.len() != AES_256_KEY_SIZE {
            return Err(ProtectionError::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                AES_256_KEY_SIZE,
                key.len()
            )));
        }

        Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| ProtectionError::Crypto(format!("Cipher init error: {}", e)))
    }
}

/// Generate cryptographically secure random bytes
pub fn generate_random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = SecureKey::generate();
        let plaintext = b"Hello, Envelope Encryption!";

        let encrypted = AesGcmCipher::encrypt(&key, plaintext, None).unwrap();
        let decrypted = AesGcmCipher::decrypt(&key, &encrypted, None).unwrap();

        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn test_encrypt_decrypt_with_aad() {
        let key = SecureKey::generate();
        let plaintext = b"Secret data";
        let aad = b"additional context";

        let encrypted = AesGcmCipher::encrypt(&key, plaintext, Some(aad)).unwrap();
        let decrypted = AesGcmCipher::decrypt(&key, &encrypted, Some(aad)).unwrap();
        assert_eq!(plaintext.to_vec(), decrypted);

        let result = AesGcmCipher::decrypt(&key, &encrypted, Some(b"wrong aad"));
        assert!(matches!(result, Err(ProtectionError::Integrity(_))));
    }

    #[test]
    fn test_fixed_nonce_framing() {
        let key = SecureKey::new(vec![7u8; AES_256_KEY_SIZE]);
        let nonce = [9u8; NONCE_SIZE];
        let plaintext = b"framing";

        let a = AesGcmCipher::encrypt_with_nonce(&key, nonce, plaintext, None).unwrap();
        let b = AesGcmCipher::encrypt_with_nonce(&key, nonce, plaintext, None).unwrap();
        assert_eq!(a, b);

        let raw = STANDARD.decode(a.to_base64()).unwrap();
        assert_eq!(raw.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);
        assert_eq!(&raw[..NONCE_SIZE], &nonce);
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = SecureKey::generate();
        let a = AesGcmCipher::seal(&key, b"same", None).unwrap();
        let b = AesGcmCipher::seal(&key, b"same", None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_is_integrity_failure() {
        let blob = AesGcmCipher::seal(&SecureKey::generate(), b"data", None).unwrap();
        let result = AesGcmCipher::open(&SecureKey::generate(), &blob, None);
        assert!(matches!(result, Err(ProtectionError::Integrity(_))));
    }

    #[test]
    fn test_malformed_blobs_are_integrity_failures() {
        let key = SecureKey::generate();
        assert!(matches!(
            AesGcmCipher::open(&key, "not base64!!", None),
            Err(ProtectionError::Integrity(_))
        ));
        assert!(matches!(
            AesGcmCipher::open(&key, &STANDARD.encode([0u8; 10]), None),
            Err(ProtectionError::Integrity(_))
        ));

        let short_nonce = EncryptedData::new(vec![0u8; 8], vec![0u8; 32]);
        assert!(matches!(
            AesGcmCipher::decrypt(&key, &short_nonce, None),
            Err(ProtectionError::Integrity(_))
        ));
    }

    #[test]
    fn test_invalid_key_size() {
        let key = SecureKey::new(vec![1u8; 16]);
        assert!(matches!(
            AesGcmCipher::encrypt(&key, b"x", None),
            Err(ProtectionError::Crypto(_))
        ));
    }

    #[test]
    fn test_secure_key_base64() {
        let key = SecureKey::generate();
        let restored = SecureKey::from_base64(&key.to_base64(), AES_256_KEY_SIZE).unwrap();
        assert_eq!(key.as_bytes(), restored.as_bytes());
        assert!(SecureKey::from_base64(&key.to_base64(), 16).is_err());
        assert_eq!(format!("{:?}", key), "SecureKey([REDACTED])");
    }
}
