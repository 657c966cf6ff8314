//! File-level vault operations
//!
//! These tie the vault core to the filesystem and to a key source: seal a
//! set of paths into a vault file, unpack a vault file into a directory, or
//! list what a vault file holds.
//!
//! A vault file is the framed vault stream, preceded by the passphrase
//! envelope when the key came from a passphrase.

use crate::container::{SealOptions, VaultContainer};
use crate::decrypt::{self, EntrySummary};
use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};
use crate::kdf;
use crate::passphrase::PassphraseReader;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Where the vault key comes from.
pub enum KeySource {
    /// Derive an AES-256 key from a passphrase with scrypt. Vaults sealed
    /// this way carry the passphrase envelope.
    Passphrase(Box<dyn PassphraseReader>),
    /// Use the raw contents of a file (16 or 32 bytes) as the key.
    KeyFile(PathBuf),
}

impl KeySource {
    /// Produce a key for a new vault. The salt is returned when the caller
    /// has to write a passphrase envelope in front of the vault.
    pub fn sealing_key(&mut self) -> Result<(Zeroizing<Vec<u8>>, Option<kdf::Salt>)> {
        match self {
            KeySource::Passphrase(reader) => {
                let passphrase = reader.read_passphrase()?;
                let salt = kdf::generate_salt();
                let key = kdf::derive_key(&passphrase, &salt)?;
                Ok((Zeroizing::new(key.to_vec()), Some(salt)))
            }
            KeySource::KeyFile(path) => Ok((read_key_file(path)?, None)),
        }
    }

    /// Produce the key for an existing vault, consuming the passphrase
    /// envelope from `source` if this is a passphrase source.
    pub fn opening_key<R: Read + ?Sized>(&mut self, source: &mut R) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            KeySource::Passphrase(reader) => {
                let salt = kdf::read_envelope(source)?;
                let passphrase = reader.read_passphrase()?;
                let key = kdf::derive_key(&passphrase, &salt)?;
                Ok(Zeroizing::new(key.to_vec()))
            }
            KeySource::KeyFile(path) => read_key_file(path),
        }
    }
}

/// Seal `paths` into a new vault file at `output`.
///
/// The vault is written to a temporary file next to `output` and renamed
/// into place only once complete, so `output` is never left half written.
/// On Unix the result has mode 0o600. Returns the number of archive
/// entries sealed.
pub fn seal_paths<P: AsRef<Path>>(
    paths: &[P],
    output: &Path,
    keys: &mut KeySource,
    options: &SealOptions,
) -> Result<usize> {
    let (key, salt) = keys.sealing_key()?;
    let mut vault = VaultContainer::with_options(paths, &key, options)
        .map_err(|e| e.with_context("failed to prepare vault"))?;

    let mut temp_file = create_sibling_tempfile(output)?;
    {
        let mut writer = BufWriter::new(temp_file.as_file_mut());
        if let Some(salt) = salt {
            kdf::write_envelope(&mut writer, &salt)?;
        }
        vault.write_framed_to(&mut writer)?;
        writer.flush().map_err(|e| {
            VaultError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "failed to flush tempfile",
                e,
            )
        })?;
    }

    // The vault is only good if its plaintext staging copy is really gone.
    vault.close()?;

    persist_secure(temp_file, output)?;
    let entries = vault.entry_count();
    info!(entries, output = %output.display(), "sealed vault");
    Ok(entries)
}

/// Decrypt the vault at `input` and extract it below `dest`, creating
/// `dest` if needed. Returns the number of entries extracted.
///
/// Entries are extracted as they are authenticated. If the vault turns out
/// to be damaged part way through, entries before the damage stay on disk
/// and the error is returned.
pub fn open_vault(input: &Path, dest: &Path, keys: &mut KeySource) -> Result<usize> {
    let mut source = open_input(input)?;
    let key = keys.opening_key(&mut source)?;
    let mut archive = decrypt::open_for_decryption(source, &key)
        .map_err(|e| e.with_context(format!("failed to open {}", input.display())))?;

    fs::create_dir_all(dest).map_err(|e| {
        VaultError::with_kind_and_source(
            ErrorCategory::User,
            ErrorKind::Io,
            format!("failed to create {}", dest.display()),
            e,
        )
    })?;

    let extracted = archive
        .unpack(dest)
        .map_err(|e| e.with_context(format!("failed to decrypt {}", input.display())))?;
    info!(extracted, dest = %dest.display(), "opened vault");
    Ok(extracted)
}

/// Decrypt the vault at `input` and return its entries without writing
/// anything to disk. Every segment is authenticated before this returns.
pub fn list_vault(input: &Path, keys: &mut KeySource) -> Result<Vec<EntrySummary>> {
    let mut source = open_input(input)?;
    let key = keys.opening_key(&mut source)?;
    let mut archive = decrypt::open_for_decryption(source, &key)
        .map_err(|e| e.with_context(format!("failed to open {}", input.display())))?;
    archive
        .list()
        .map_err(|e| e.with_context(format!("failed to decrypt {}", input.display())))
}

fn open_input(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| read_error(path, e))?;
    Ok(BufReader::new(file))
}

fn read_key_file(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let key = Zeroizing::new(fs::read(path).map_err(|e| read_error(path, e))?);
    debug!(path = %path.display(), "read key file");
    Ok(key)
}

fn create_sibling_tempfile(output: &Path) -> Result<NamedTempFile> {
    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tempfile::Builder::new()
        .prefix(".arcvault-")
        .tempfile_in(dir)
        .map_err(|e| {
            VaultError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::Io,
                format!("failed to create tempfile in {}", dir.display()),
                e,
            )
        })
}

/// fsync, restrict permissions, and rename `temp_file` over `target`.
fn persist_secure(temp_file: NamedTempFile, target: &Path) -> Result<()> {
    // Sync before the rename so that, if the rename succeeds, the target
    // always points at a complete file.
    temp_file.as_file().sync_all().map_err(|e| {
        VaultError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            "failed to sync file prior to rename",
            e,
        )
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp_file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| {
                VaultError::with_kind_and_source(
                    ErrorCategory::Internal,
                    ErrorKind::Io,
                    "failed to set tempfile permissions",
                    e,
                )
            })?;
    }

    temp_file.persist(target).map_err(|e| {
        VaultError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("failed to rename to target file {}", target.display()),
            e,
        )
    })?;
    Ok(())
}

fn read_error(path: &Path, err: io::Error) -> VaultError {
    let category = if err.kind() == io::ErrorKind::NotFound {
        ErrorCategory::User
    } else {
        ErrorCategory::Internal
    };
    VaultError::with_kind_and_source(
        category,
        ErrorKind::Io,
        format!("failed to read from {}", path.display()),
        err,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passphrase::ConstantPassphraseReader;
    use tempfile::TempDir;

    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    fn passphrase(p: &str) -> KeySource {
        KeySource::Passphrase(Box::new(ConstantPassphraseReader::new(p.as_bytes().to_vec())))
    }

    struct Fixture {
        dir: TempDir,
        sources: Vec<PathBuf>,
        options: SealOptions,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging");
        fs::create_dir(&staging).unwrap();
        let docs = dir.path().join("docs");
        fs::create_dir(&docs).unwrap();
        fs::write(docs.join("a.txt"), b"alpha").unwrap();
        fs::write(docs.join("b.txt"), b"bravo").unwrap();
        let loose = dir.path().join("loose.bin");
        fs::write(&loose, vec![7u8; 20_000]).unwrap();
        Fixture {
            sources: vec![docs, loose],
            options: SealOptions {
                staging_dir: Some(staging),
            },
            dir,
        }
    }

    #[test]
    fn test_passphrase_roundtrip() {
        let fx = fixture();
        let vault = fx.dir.path().join("out.vault");
        let entries =
            seal_paths(&fx.sources, &vault, &mut passphrase("hunter2"), &fx.options).unwrap();
        // docs/, docs/a.txt, docs/b.txt, loose.bin
        assert_eq!(entries, 4);

        let raw = fs::read(&vault).unwrap();
        assert!(raw.starts_with(kdf::ENVELOPE_MAGIC));

        let dest = fx.dir.path().join("restored");
        let extracted = open_vault(&vault, &dest, &mut passphrase("hunter2")).unwrap();
        assert_eq!(extracted, 4);

        for source in &fx.sources {
            let restored = dest.join(crate::archive::archive_name(source));
            if source.is_dir() {
                for name in ["a.txt", "b.txt"] {
                    assert_eq!(
                        fs::read(restored.join(name)).unwrap(),
                        fs::read(source.join(name)).unwrap()
                    );
                }
            } else {
                assert_eq!(fs::read(restored).unwrap(), fs::read(source).unwrap());
            }
        }
    }

    #[test]
    fn test_key_file_roundtrip() {
        let fx = fixture();
        let key_path = fx.dir.path().join("vault.key");
        fs::write(&key_path, b"0123456789ABCDEF").unwrap();
        let vault = fx.dir.path().join("out.vault");

        let mut keys = KeySource::KeyFile(key_path.clone());
        seal_paths(&fx.sources, &vault, &mut keys, &fx.options).unwrap();

        let mut keys = KeySource::KeyFile(key_path);
        let listed = list_vault(&vault, &mut keys).unwrap();
        let names: Vec<_> = listed
            .iter()
            .filter(|e| !e.is_dir)
            .map(|e| e.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.txt", "b.txt", "loose.bin"]);
        assert_eq!(listed.last().unwrap().size, 20_000);
    }

    #[test]
    fn test_wrong_passphrase_fails_authentication() {
        let fx = fixture();
        let vault = fx.dir.path().join("out.vault");
        seal_paths(&fx.sources, &vault, &mut passphrase("correct"), &fx.options).unwrap();

        let err = list_vault(&vault, &mut passphrase("wrong")).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
    }

    #[test]
    fn test_key_file_vault_opened_with_passphrase() {
        let fx = fixture();
        let key_path = fx.dir.path().join("vault.key");
        fs::write(&key_path, [9u8; 32]).unwrap();
        let vault = fx.dir.path().join("out.vault");
        seal_paths(&fx.sources, &vault, &mut KeySource::KeyFile(key_path), &fx.options).unwrap();

        let err = list_vault(&vault, &mut passphrase("anything")).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::FormatInvalid));
    }

    #[test]
    fn test_bad_key_file_length() {
        let fx = fixture();
        let key_path = fx.dir.path().join("vault.key");
        fs::write(&key_path, b"too short").unwrap();
        let vault = fx.dir.path().join("out.vault");

        let err =
            seal_paths(&fx.sources, &vault, &mut KeySource::KeyFile(key_path), &fx.options)
                .unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::InvalidKeyLength));
        assert!(!vault.exists());
    }

    #[test]
    fn test_failed_seal_leaves_nothing_behind() {
        let fx = fixture();
        let vault = fx.dir.path().join("out.vault");
        let mut sources = fx.sources.clone();
        sources.push(fx.dir.path().join("imaginary"));

        let err = seal_paths(&sources, &vault, &mut passphrase("p"), &fx.options).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::SourceUnavailable));
        assert!(!vault.exists());

        let staging = fx.options.staging_dir.as_ref().unwrap();
        assert_eq!(fs::read_dir(staging).unwrap().count(), 0);
        let stray: Vec<_> = fs::read_dir(fx.dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|n| n.to_string_lossy().starts_with(".arcvault-"))
            .collect();
        assert!(stray.is_empty(), "left temp files behind: {stray:?}");
    }

    #[test]
    fn test_truncated_vault_file() {
        let fx = fixture();
        let key_path = fx.dir.path().join("vault.key");
        fs::write(&key_path, b"0123456789ABCDEF").unwrap();
        let vault = fx.dir.path().join("out.vault");
        seal_paths(&fx.sources, &vault, &mut KeySource::KeyFile(key_path.clone()), &fx.options)
            .unwrap();

        let raw = fs::read(&vault).unwrap();
        fs::write(&vault, &raw[..raw.len() - 1]).unwrap();

        let err = list_vault(&vault, &mut KeySource::KeyFile(key_path)).unwrap_err();
        assert_eq!(err.kind, Some(ErrorKind::AuthenticationFailed));
    }

    #[test]
    fn test_open_missing_input() {
        let fx = fixture();
        let err = open_vault(
            &fx.dir.path().join("nope.vault"),
            &fx.dir.path().join("out"),
            &mut passphrase("p"),
        )
        .unwrap_err();
        assert_eq!(err.category, ErrorCategory::User);
        assert!(!fx.dir.path().join("out").exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_vault_file_permissions() {
        let fx = fixture();
        let vault = fx.dir.path().join("out.vault");
        seal_paths(&fx.sources, &vault, &mut passphrase("p"), &fx.options).unwrap();

        let mode = fs::metadata(&vault).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_seal_replaces_existing_output() {
        let fx = fixture();
        let vault = fx.dir.path().join("out.vault");
        fs::write(&vault, b"old contents").unwrap();

        seal_paths(&fx.sources, &vault, &mut passphrase("p"), &fx.options).unwrap();
        let listed = list_vault(&vault, &mut passphrase("p")).unwrap();
        assert_eq!(listed.len(), 4);
    }
}
