//! arcvault - pack files into a tar stream encrypted with AES-GCM STREAM
//!
//! The encrypting side is [`VaultContainer`]: it packs a list of paths into
//! an ephemeral staging file and serves the encrypted archive as a byte
//! stream. The decrypting side is [`open_for_decryption`], which turns
//! `nonce || sealed segments` back into archive entries, failing closed on
//! the first segment that does not authenticate.

#![forbid(unsafe_code)]

pub mod archive;
pub mod container;
pub mod decrypt;
pub mod error;
pub mod file_ops;
pub mod kdf;
pub mod keys;
pub mod passphrase;
pub mod staging;
pub mod stream;

pub use container::{SealOptions, VaultContainer};
pub use decrypt::{EntrySummary, VaultArchive, VaultEntries, VaultEntry, open_for_decryption};
pub use error::{ErrorCategory, ErrorKind, Result, VaultError};
pub use keys::build_cipher;
