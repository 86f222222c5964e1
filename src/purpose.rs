//! Key purposes
//!
//! Every organization holds an independent, versioned key series per purpose.
//! The set of purposes is closed; each one fixes the algorithm and key length
//! its material must have.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crypto::AES_256_KEY_SIZE;
use crate::error::ProtectionError;

/// Category of data a key protects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    /// Catch-all for application fields without a dedicated purpose
    General,
    /// Personally identifying data (names, addresses, national ids)
    PersonalData,
    /// Bank accounts, card data, payroll figures
    Financial,
    /// Third-party API tokens and passwords held on behalf of the organization
    Credentials,
}

/// Symmetric algorithm a key is used with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Aes256Gcm,
}

impl KeyAlgorithm {
    /// Length of key material in bytes
    pub fn key_len(self) -> usize {
        match self {
            KeyAlgorithm::Aes256Gcm => AES_256_KEY_SIZE,
        }
    }
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 4] = [
        KeyPurpose::General,
        KeyPurpose::PersonalData,
        KeyPurpose::Financial,
        KeyPurpose::Credentials,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KeyPurpose::General => "general",
            KeyPurpose::PersonalData => "personal_data",
            KeyPurpose::Financial => "financial",
            KeyPurpose::Credentials => "credentials",
        }
    }

    pub fn algorithm(self) -> KeyAlgorithm {
        match self {
            KeyPurpose::General
            | KeyPurpose::PersonalData
            | KeyPurpose::Financial
            | KeyPurpose::Credentials => KeyAlgorithm::Aes256Gcm,
        }
    }

    pub fn key_len(self) -> usize {
        self.algorithm().key_len()
    }
}

impl Default for KeyPurpose {
    fn default() -> Self {
        KeyPurpose::General
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyPurpose {
    type Err = ProtectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyPurpose::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ProtectionError::InvalidKeyState(format!("unknown key purpose '{}'", s)))
    }
}
