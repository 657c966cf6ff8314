//! Key validation
//!
//! A vault key is raw bytes: 16 bytes selects AES-128-GCM, 32 bytes selects
//! AES-256-GCM. Nothing else is accepted, and the check happens before any
//! staging or stream I/O so a bad key fails without side effects.

use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit};

use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};

/// Key length selecting AES-128-GCM.
pub const AES128_KEY_LEN: usize = 16;

/// Key length selecting AES-256-GCM.
pub const AES256_KEY_LEN: usize = 32;

/// An AES-GCM instance bound to a validated key.
#[derive(Clone)]
pub enum AeadCipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

impl AeadCipher {
    /// Key size in bits, for diagnostics.
    pub fn key_bits(&self) -> usize {
        match self {
            AeadCipher::Aes128(_) => 128,
            AeadCipher::Aes256(_) => 256,
        }
    }
}

impl std::fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AeadCipher(AES-{}-GCM)", self.key_bits())
    }
}

/// Validate `key` and construct the matching AES-GCM cipher.
pub fn build_cipher(key: &[u8]) -> Result<AeadCipher> {
    let cipher = match key.len() {
        AES128_KEY_LEN => Aes128Gcm::new_from_slice(key).map(AeadCipher::Aes128),
        AES256_KEY_LEN => Aes256Gcm::new_from_slice(key).map(AeadCipher::Aes256),
        len => {
            return Err(VaultError::with_kind(
                ErrorCategory::User,
                ErrorKind::InvalidKeyLength,
                format!(
                    "invalid key length {len}; expected {AES128_KEY_LEN} or {AES256_KEY_LEN} bytes"
                ),
            ));
        }
    };
    cipher.map_err(|_| {
        VaultError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "AES-GCM rejected a key of valid length",
        )
    })
}
