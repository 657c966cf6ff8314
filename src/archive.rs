//! Packing file lists into a tar stream
//!
//! Entries are written in the order the paths were given. A directory is
//! recorded as an entry of its own followed by everything below it, walked
//! in file-name order. File contents are streamed from disk, never buffered
//! whole. There is no compression.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};

/// Name under which `path` is stored in the archive.
///
/// Only the normal components are kept, so absolute paths become relative
/// and `.`/`..` are dropped; archive readers refuse anything else.
pub fn archive_name(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Every regular file below `root`, in file-name order.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Write a tar archive of `paths` to `sink`. Returns the number of entries.
pub fn pack<P: AsRef<Path>, W: Write>(paths: &[P], sink: W) -> Result<usize> {
    pack_excluding(paths, sink, &[])
}

/// Like [`pack`], but files in `exclude` are left out wherever they turn up,
/// whether named directly or found by a directory walk. Matching is by file
/// identity, so symlinks and other spellings of the same file are caught too.
///
/// The sink's own backing file belongs in `exclude` whenever it may sit
/// below one of `paths`; otherwise the archive would read itself while
/// growing.
pub fn pack_excluding<P: AsRef<Path>, W: Write>(
    paths: &[P],
    sink: W,
    exclude: &[&Path],
) -> Result<usize> {
    let excluded = Excluded::new(exclude);
    let mut builder = tar::Builder::new(sink);
    let mut entries = 0;

    for path in paths {
        let path = path.as_ref();
        let metadata = fs::metadata(path).map_err(|e| source_unavailable(path, e))?;
        let name = archive_name(path);

        if metadata.is_dir() {
            for entry in WalkDir::new(path).follow_links(true).sort_by_file_name() {
                let entry = entry.map_err(|e| walk_error(path, e))?;
                let relative = entry.path().strip_prefix(path).map_err(|e| {
                    VaultError::with_kind_and_source(
                        ErrorCategory::Internal,
                        ErrorKind::InternalInvariant,
                        format!("{} escaped {}", entry.path().display(), path.display()),
                        e,
                    )
                })?;
                let entry_name = if relative.as_os_str().is_empty() {
                    name.clone()
                } else {
                    name.join(relative)
                };
                if entry_name.as_os_str().is_empty() {
                    // Root of a walk over `.` or `/`: nothing to name it by.
                    continue;
                }
                if entry.file_type().is_dir() {
                    append_dir(&mut builder, entry.path(), &entry_name)?;
                } else if excluded.contains(entry.path()) {
                    debug!(path = %entry.path().display(), "skipped excluded file");
                    continue;
                } else {
                    append_file(&mut builder, entry.path(), &entry_name)?;
                }
                entries += 1;
            }
        } else if excluded.contains(path) {
            debug!(path = %path.display(), "skipped excluded file");
        } else {
            append_file(&mut builder, path, &name)?;
            entries += 1;
        }
    }

    let mut sink = builder
        .into_inner()
        .map_err(|e| VaultError::from_io(e, "failed to finish archive"))?;
    sink.flush()
        .map_err(|e| VaultError::from_io(e, "failed to flush archive"))?;

    debug!(entries, "packed archive");
    Ok(entries)
}

/// Files left out of an archive, matched by identity rather than by name.
struct Excluded {
    ids: Vec<FileId>,
}

#[cfg(unix)]
type FileId = (u64, u64);

#[cfg(not(unix))]
type FileId = PathBuf;

#[cfg(unix)]
fn file_id(path: &Path) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).ok().map(|m| (m.dev(), m.ino()))
}

#[cfg(not(unix))]
fn file_id(path: &Path) -> Option<FileId> {
    fs::canonicalize(path).ok()
}

impl Excluded {
    fn new(exclude: &[&Path]) -> Self {
        // A path that cannot be resolved does not exist, so nothing can match it.
        let ids = exclude.iter().filter_map(|path| file_id(path)).collect();
        Self { ids }
    }

    fn contains(&self, path: &Path) -> bool {
        !self.ids.is_empty() && file_id(path).is_some_and(|id| self.ids.contains(&id))
    }
}

fn append_file<W: Write>(builder: &mut tar::Builder<W>, src: &Path, name: &Path) -> Result<()> {
    let mut file = File::open(src).map_err(|e| source_unavailable(src, e))?;
    builder
        .append_file(name, &mut file)
        .map_err(|e| VaultError::from_io(e, format!("failed to archive {}", src.display())))
}

fn append_dir<W: Write>(builder: &mut tar::Builder<W>, src: &Path, name: &Path) -> Result<()> {
    builder
        .append_dir(name, src)
        .map_err(|e| VaultError::from_io(e, format!("failed to archive {}", src.display())))
}

fn source_unavailable(path: &Path, err: io::Error) -> VaultError {
    VaultError::with_kind_and_source(
        ErrorCategory::User,
        ErrorKind::SourceUnavailable,
        format!("cannot read {}", path.display()),
        err,
    )
}

fn walk_error(root: &Path, err: walkdir::Error) -> VaultError {
    let path = err.path().unwrap_or(root).display().to_string();
    VaultError::with_kind_and_source(
        ErrorCategory::User,
        ErrorKind::SourceUnavailable,
        format!("cannot read {path}"),
        err,
    )
}
