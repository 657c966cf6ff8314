//! Passphrase key derivation
//!
//! The vault core only ever takes raw 16 or 32 byte keys. This module is the
//! one supported way to get such a key from a passphrase: scrypt over a
//! random per-vault salt, producing an AES-256 key.
//!
//! When a passphrase is used the salt has to travel with the vault, so the
//! vault stream is preceded by a small envelope:
//!
//! ```text
//! magic "arcvlt01" (8 bytes) || salt (16 bytes) || nonce || sealed segments
//! ```

use std::io::{self, Read, Write};

use rand::RngCore;
use rand::rngs::OsRng;
use scrypt::{Params, scrypt};
use zeroize::Zeroizing;

use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};
use crate::keys::AES256_KEY_LEN;

/// Envelope magic, including the format version.
pub const ENVELOPE_MAGIC: &[u8; 8] = b"arcvlt01";

/// Length of salt in bytes
pub const SALT_LEN: usize = 16;

/// Length of the envelope that precedes a passphrase-protected vault.
pub const ENVELOPE_LEN: usize = ENVELOPE_MAGIC.len() + SALT_LEN;

/// scrypt N parameter (CPU/memory cost)
const SCRYPT_N: u32 = 32768;

/// scrypt r parameter (block size)
const SCRYPT_R: u32 = 8;

/// scrypt p parameter (parallelization)
const SCRYPT_P: u32 = 1;

pub type Salt = [u8; SALT_LEN];

pub fn generate_salt() -> Salt {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 32-byte vault key from a passphrase and salt using scrypt.
pub fn derive_key(passphrase: &[u8], salt: &Salt) -> Result<Zeroizing<[u8; AES256_KEY_LEN]>> {
    let params = Params::new(
        SCRYPT_N.ilog2() as u8, // log_n
        SCRYPT_R,
        SCRYPT_P,
        AES256_KEY_LEN,
    )
    .map_err(|e| {
        VaultError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::KeyDerivation,
            format!("failed to create scrypt params: {e}"),
        )
    })?;

    let mut key = Zeroizing::new([0u8; AES256_KEY_LEN]);
    scrypt(passphrase, salt, &params, &mut key[..]).map_err(|e| {
        VaultError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::KeyDerivation,
            format!("scrypt key derivation failed: {e}"),
        )
    })?;

    Ok(key)
}

/// Write the envelope header for `salt`.
pub fn write_envelope<W: Write + ?Sized>(sink: &mut W, salt: &Salt) -> Result<()> {
    let mut header = [0u8; ENVELOPE_LEN];
    header[..ENVELOPE_MAGIC.len()].copy_from_slice(ENVELOPE_MAGIC);
    header[ENVELOPE_MAGIC.len()..].copy_from_slice(salt);
    sink.write_all(&header)
        .map_err(|e| VaultError::from_io(e, "failed to write passphrase envelope"))
}

/// Read and check the envelope header, returning the salt.
pub fn read_envelope<R: Read + ?Sized>(source: &mut R) -> Result<Salt> {
    let mut header = [0u8; ENVELOPE_LEN];
    source.read_exact(&mut header).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            VaultError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::TruncatedStream,
                "input likely truncated while reading passphrase envelope",
                e,
            )
        } else {
            VaultError::from_io(e, "failed to read passphrase envelope")
        }
    })?;

    let (magic, salt) = header.split_at(ENVELOPE_MAGIC.len());
    if magic != ENVELOPE_MAGIC {
        return Err(VaultError::with_kind(
            ErrorCategory::User,
            ErrorKind::FormatInvalid,
            "input is not a passphrase-protected arcvault vault",
        ));
    }

    let mut out = [0u8; SALT_LEN];
    out.copy_from_slice(salt);
    Ok(out)
}
