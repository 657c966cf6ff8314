//! The decrypting side of a vault
//!
//! [`open_for_decryption`] takes a stream laid out as
//! `nonce || sealed segments` and hands back a [`VaultArchive`] whose
//! entries come out in the order they were packed. Nothing is verified up
//! front beyond the key and the nonce: authentication happens segment by
//! segment as entries are read, and the first bad segment ends the stream.
//!
//! tar stops reading at the first end-of-archive block, which can leave the
//! last sealed segment unread. Once the entries run out, the iterator drains
//! whatever is left of the stream so that segment is authenticated too.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};
use crate::keys;
use crate::stream::{DecryptingReader, NONCE_LEN, StreamNonce};

/// Validate `key`, read the nonce off the front of `source`, and wrap the
/// rest in an archive reader.
pub fn open_for_decryption<R: Read>(mut source: R, key: &[u8]) -> Result<VaultArchive<R>> {
    let cipher = keys::build_cipher(key)?;

    let mut nonce: StreamNonce = [0u8; NONCE_LEN];
    source.read_exact(&mut nonce).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            VaultError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::TruncatedStream,
                "input likely truncated while reading nonce",
                e,
            )
        } else {
            VaultError::from_io(e, "failed to read vault nonce")
        }
    })?;

    debug!(key_bits = cipher.key_bits(), "opened vault for decryption");
    let stream = Arc::new(Mutex::new(DecryptingReader::new(source, &cipher, &nonce)));
    Ok(VaultArchive {
        nonce,
        archive: tar::Archive::new(SharedStream(Arc::clone(&stream))),
        stream,
    })
}

/// The decrypted stream as seen by tar. The archive keeps a second handle
/// for draining the tail.
struct SharedStream<R>(Arc<Mutex<DecryptingReader<R>>>);

impl<R: Read> Read for SharedStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("vault stream lock poisoned"))?
            .read(buf)
    }
}

fn drain_tail<R: Read>(stream: &Mutex<DecryptingReader<R>>) -> Result<u64> {
    let mut stream = stream.lock().map_err(|_| {
        VaultError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "vault stream lock poisoned",
        )
    })?;
    io::copy(&mut *stream, &mut io::sink())
        .map_err(|e| VaultError::from_io(e, "failed to verify end of vault"))
}

/// Summary of one archive entry, as returned by [`VaultArchive::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
    pub path: PathBuf,
    pub size: u64,
    pub is_dir: bool,
}

pub struct VaultArchive<R: Read> {
    nonce: StreamNonce,
    archive: tar::Archive<SharedStream<R>>,
    stream: Arc<Mutex<DecryptingReader<R>>>,
}

impl<R: Read> VaultArchive<R> {
    pub fn nonce(&self) -> &StreamNonce {
        &self.nonce
    }

    /// Iterate over the entries. Can only be done once per archive, since
    /// the underlying stream is consumed as it goes.
    pub fn entries(&mut self) -> Result<VaultEntries<'_, R>> {
        let inner = self
            .archive
            .entries()
            .map_err(|e| VaultError::from_io(e, "failed to read vault entries"))?;
        Ok(VaultEntries {
            inner,
            stream: Arc::clone(&self.stream),
            finished: false,
        })
    }

    /// Read through every entry, returning their names and sizes.
    pub fn list(&mut self) -> Result<Vec<EntrySummary>> {
        let mut summaries = Vec::new();
        for entry in self.entries()? {
            let entry = entry?;
            summaries.push(EntrySummary {
                path: entry.path()?,
                size: entry.size(),
                is_dir: entry.is_dir(),
            });
        }
        Ok(summaries)
    }

    /// Extract every entry below `dst`. Entries whose names would escape
    /// `dst` are skipped.
    ///
    /// Entries are written as they are authenticated, so a failure part way
    /// through leaves the earlier (authentic) entries on disk.
    pub fn unpack(&mut self, dst: &Path) -> Result<usize> {
        let mut extracted = 0;
        for entry in self.entries()? {
            let mut entry = entry?;
            if entry.unpack_in(dst)? {
                extracted += 1;
            }
        }
        debug!(extracted, dst = %dst.display(), "unpacked vault");
        Ok(extracted)
    }
}

pub struct VaultEntries<'a, R: Read> {
    inner: tar::Entries<'a, SharedStream<R>>,
    stream: Arc<Mutex<DecryptingReader<R>>>,
    finished: bool,
}

impl<'a, R: Read> Iterator for VaultEntries<'a, R> {
    type Item = Result<VaultEntry<'a, R>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.inner.next() {
            Some(entry) => Some(
                entry
                    .map(|inner| VaultEntry { inner })
                    .map_err(|e| VaultError::from_io(e, "failed to read next vault entry")),
            ),
            None => {
                self.finished = true;
                drain_tail(&self.stream).err().map(Err)
            }
        }
    }
}

/// One entry of a vault; reading it yields the entry's content.
pub struct VaultEntry<'a, R: Read> {
    inner: tar::Entry<'a, SharedStream<R>>,
}

impl<'a, R: Read> VaultEntry<'a, R> {
    pub fn path(&self) -> Result<PathBuf> {
        self.inner
            .path()
            .map(|path| path.into_owned())
            .map_err(|e| VaultError::from_io(e, "vault entry has an unreadable name"))
    }

    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    pub fn is_dir(&self) -> bool {
        self.inner.header().entry_type().is_dir()
    }

    /// Extract this entry below `dst`. Returns false if it was skipped
    /// because its name would land outside `dst`.
    pub fn unpack_in(&mut self, dst: &Path) -> Result<bool> {
        self.inner.unpack_in(dst).map_err(|e| {
            VaultError::from_io(e, format!("failed to extract into {}", dst.display()))
        })
    }

    /// Read the whole entry into memory.
    pub fn read_contents(&mut self) -> Result<Vec<u8>> {
        let mut contents = Vec::new();
        self.inner
            .read_to_end(&mut contents)
            .map_err(|e| VaultError::from_io(e, "failed to read vault entry"))?;
        Ok(contents)
    }
}

impl<R: Read> Read for VaultEntry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{SealOptions, VaultContainer};
    use std::fs;
    use tempfile::TempDir;

    const KEY: &[u8] = b"0123456789ABCDEF0123456789ABCDEF";

    fn sealed_vault(dir: &Path, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut paths = Vec::new();
        for (name, body) in files {
            let path = dir.join(name);
            fs::write(&path, body).unwrap();
            paths.push(path);
        }
        let options = SealOptions {
            staging_dir: Some(dir.to_path_buf()),
        };
        let mut vault = VaultContainer::with_options(&paths, KEY, &options).unwrap();
        let mut framed = Vec::new();
        vault.write_framed_to(&mut framed).unwrap();
        vault.close().unwrap();
        framed
    }

    #[test]
    fn test_roundtrip_entries() {
        let dir = TempDir::new().unwrap();
        let big = vec![0xabu8; 40_000];
        let framed = sealed_vault(
            dir.path(),
            &[("small.txt", &b"tiny"[..]), ("big.bin", big.as_slice())],
        );

        let mut archive = open_for_decryption(&framed[..], KEY).unwrap();
        assert_eq!(archive.nonce(), &framed[..NONCE_LEN]);

        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().file_name().unwrap().to_owned();
            let contents = entry.read_contents().unwrap();
            assert_eq!(entry.size(), contents.len() as u64);
            seen.push((name, contents));
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "small.txt");
        assert_eq!(seen[0].1, b"tiny");
        assert_eq!(seen[1].0, "big.bin");
        assert_eq!(seen[1].1, big);
    }

    #[test]
    fn test_truncated_nonce() {
        let err = open_for_decryption(&[1u8, 2, 3][..], KEY).err().unwrap();
        assert_eq!(err.kind, Some(ErrorKind::TruncatedStream));
    }

    #[test]
    fn test_bad_key_length_checked_first() {
        // Too short for a nonce as well; the key error must win.
        let err = open_for_decryption(&[0u8; 0][..], b"short").err().unwrap();
        assert_eq!(err.kind, Some(ErrorKind::InvalidKeyLength));
    }

    #[test]
    fn test_wrong_key_fails_on_read() {
        let dir = TempDir::new().unwrap();
        let framed = sealed_vault(dir.path(), &[("a.txt", &b"alpha"[..])]);

        let wrong = b"FEDCBA9876543210FEDCBA9876543210";
        let mut archive = open_for_decryption(&framed[..], wrong).unwrap();
        let err = archive.list().unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
    }

    #[test]
    fn test_tampered_vault_fails() {
        let dir = TempDir::new().unwrap();
        let mut framed = sealed_vault(dir.path(), &[("a.txt", &b"alpha"[..])]);
        let last = framed.len() - 1;
        framed[last] ^= 0x80;

        let mut archive = open_for_decryption(&framed[..], KEY).unwrap();
        let err = archive.list().unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
    }

    #[test]
    fn test_unpack() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        let framed = sealed_vault(&src, &[("x.txt", &b"ex"[..]), ("y.txt", &b"why"[..])]);

        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        let mut archive = open_for_decryption(&framed[..], KEY).unwrap();
        assert_eq!(archive.unpack(&out).unwrap(), 2);

        let restored = out.join(crate::archive::archive_name(&src));
        assert_eq!(fs::read(restored.join("x.txt")).unwrap(), b"ex");
        assert_eq!(fs::read(restored.join("y.txt")).unwrap(), b"why");
    }
}
