//! Ephemeral staging file
//!
//! Holds the packed plaintext archive while it is being encrypted. The file
//! is created with a unique name, owned by exactly one [`StagingFile`], and
//! removed either by an explicit [`StagingFile::close`] (which reports
//! whether removal actually happened) or, failing that, when the value is
//! dropped.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};

const STAGING_PREFIX: &str = "arcvault-";
const STAGING_SUFFIX: &str = ".tar";

#[derive(Debug)]
pub struct StagingFile {
    // None once closed.
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl StagingFile {
    /// Create a new, empty, uniquely named staging file inside `dir`.
    pub fn create_in(dir: &Path) -> Result<Self> {
        let file = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(STAGING_SUFFIX)
            .tempfile_in(dir)
            .map_err(|e| {
                VaultError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::StagingCreateFailed,
                    format!("failed to create staging file in {}", dir.display()),
                    e,
                )
            })?;
        let path = file.path().to_path_buf();
        debug!(path = %path.display(), "created staging file");
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn handle(&mut self) -> io::Result<&mut NamedTempFile> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("staging file is closed"))
    }

    /// Release the handle and delete the file.
    ///
    /// Fails if the file was already closed, if it was removed behind our
    /// back, or if it is somehow still present afterwards. On failure the
    /// caller must assume the plaintext may still be on disk.
    pub fn close(&mut self) -> Result<()> {
        let file = self.file.take().ok_or_else(|| {
            VaultError::with_kind(
                ErrorCategory::User,
                ErrorKind::StagingDeleteFailed,
                format!("staging file {} already closed", self.path.display()),
            )
        })?;

        file.close().map_err(|e| {
            VaultError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::StagingDeleteFailed,
                format!("failed to remove staging file {}", self.path.display()),
                e,
            )
        })?;

        match self.path.try_exists() {
            Ok(false) => {
                debug!(path = %self.path.display(), "removed staging file");
                Ok(())
            }
            Ok(true) => Err(VaultError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::StagingDeleteFailed,
                format!("staging file {} still exists after removal", self.path.display()),
            )),
            Err(e) => Err(VaultError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::StagingDeleteFailed,
                format!("cannot confirm removal of {}", self.path.display()),
                e,
            )),
        }
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            match file.close() {
                Ok(()) => debug!(path = %self.path.display(), "removed unclosed staging file"),
                Err(e) => warn!(
                    path = %self.path.display(),
                    "failed to remove unclosed staging file: {e}"
                ),
            }
        }
    }
}

impl Read for StagingFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }
}

impl Write for StagingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }
}

impl Seek for StagingFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.handle()?.seek(pos)
    }
}
