//! The encrypting side of a vault
//!
//! A [`VaultContainer`] packs a file list into a staging file, draws a fresh
//! nonce, and then serves the encrypted view of the staged archive through
//! [`Read`] or [`VaultContainer::write_to`]. Framing is the caller's job:
//! whatever stores or sends the ciphertext must put [`VaultContainer::nonce`]
//! in front of it (see [`VaultContainer::write_framed_to`]).
//!
//! A container is single-owner, single-reader state: the staging file
//! position is shared by every read.

use std::env;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;
use rand::rngs::OsRng;
use tracing::debug;

use crate::archive;
use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};
use crate::keys;
use crate::staging::StagingFile;
use crate::stream::{EncryptingReader, NONCE_LEN, StreamNonce};

/// Knobs for building a container.
#[derive(Debug, Clone, Default)]
pub struct SealOptions {
    /// Directory the staging file is created in. Defaults to the system
    /// temporary directory.
    pub staging_dir: Option<PathBuf>,
}

impl SealOptions {
    fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(env::temp_dir)
    }
}

pub struct VaultContainer {
    stream: EncryptingReader<StagingFile>,
    entries: usize,
}

impl VaultContainer {
    /// Pack `paths` and prepare to stream them encrypted under `key`.
    pub fn new<P: AsRef<Path>>(paths: &[P], key: &[u8]) -> Result<Self> {
        Self::with_options(paths, key, &SealOptions::default())
    }

    pub fn with_options<P: AsRef<Path>>(
        paths: &[P],
        key: &[u8],
        options: &SealOptions,
    ) -> Result<Self> {
        let cipher = keys::build_cipher(key)?;

        // Dropping `staging` on any error below removes the file.
        let mut staging = StagingFile::create_in(&options.staging_dir())?;
        let entries = stage(paths, &mut staging)?;

        let nonce = generate_nonce();
        debug!(
            entries,
            key_bits = cipher.key_bits(),
            staging = %staging.path().display(),
            "vault container ready"
        );

        Ok(Self {
            stream: EncryptingReader::new(staging, cipher, nonce),
            entries,
        })
    }

    /// The nonce this container encrypts under. Not secret; it must be
    /// stored alongside the ciphertext.
    pub fn nonce(&self) -> &StreamNonce {
        self.stream.nonce()
    }

    /// Number of archive entries packed into the vault.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn staging_path(&self) -> &Path {
        self.stream.get_ref().path()
    }

    /// Start the encrypted stream over from the beginning.
    pub fn rewind(&mut self) -> Result<()> {
        self.stream
            .rewind()
            .map_err(|e| VaultError::from_io(e, "failed to rewind staging file"))
    }

    /// Push the remaining ciphertext into `sink`. Returns the byte count.
    pub fn write_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<u64> {
        io::copy(&mut self.stream, sink)
            .map_err(|e| VaultError::from_io(e, "failed to write encrypted vault"))
    }

    /// Write the nonce followed by the remaining ciphertext, which is the
    /// layout [`crate::decrypt::open_for_decryption`] expects.
    pub fn write_framed_to<W: Write + ?Sized>(&mut self, sink: &mut W) -> Result<u64> {
        let nonce = *self.nonce();
        sink.write_all(&nonce)
            .map_err(|e| VaultError::from_io(e, "failed to write vault nonce"))?;
        Ok(NONCE_LEN as u64 + self.write_to(sink)?)
    }

    /// Close and delete the staging file.
    ///
    /// An error means the staging file may still exist on disk; this
    /// includes closing a second time or after the file was removed by
    /// someone else.
    pub fn close(&mut self) -> Result<()> {
        self.stream.get_mut().close()
    }
}

impl Read for VaultContainer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

fn stage<P: AsRef<Path>>(paths: &[P], staging: &mut StagingFile) -> Result<usize> {
    // The staging file may sit below one of `paths` (the default staging
    // dir is the system temp dir), so keep it out of its own archive.
    let staging_path = staging.path().to_path_buf();
    let mut writer = BufWriter::new(&mut *staging);
    let entries = archive::pack_excluding(paths, &mut writer, &[staging_path.as_path()])?;
    writer.flush().map_err(|e| {
        VaultError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to flush staging file",
            e,
        )
    })?;
    drop(writer);

    staging
        .seek(SeekFrom::Start(0))
        .map_err(|e| VaultError::from_io(e, "failed to rewind staging file"))?;
    Ok(entries)
}

fn generate_nonce() -> StreamNonce {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
