//! Filesystem abstraction used by the provisioning executor and the
//! integrity checker.
//!
//! All calls are blocking. Async callers run them on the blocking pool.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// What kind of entry lives at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Dir,
    Other,
}

/// An immediate child of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Measured size of an entry. Directories count themselves plus every
/// descendant in `items`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySize {
    pub items: u64,
    pub bytes: u64,
}

pub trait FileSystem: Send + Sync {
    /// `Ok(None)` when nothing exists at `path`. Symlinks are not followed.
    fn entry_kind(&self, path: &Path) -> io::Result<Option<EntryKind>>;

    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.entry_kind(path)?.is_some())
    }

    /// Create a single directory. The parent must exist.
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Create a new file; fails with `AlreadyExists` if anything is there.
    fn create_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Write a file, replacing any previous contents.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Move an entry. Both paths must be on the same volume.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Immediate entries of a directory, sorted by name.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    /// Count items and bytes under `path`. When `stop_after_items` is set the
    /// walk stops once the item count exceeds it, so the returned count is a
    /// lower bound that is already over the limit.
    fn measure(&self, path: &Path, stop_after_items: Option<u64>) -> io::Result<EntrySize>;
}

/// The local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

fn kind_of(file_type: fs::FileType) -> EntryKind {
    if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    }
}

impl FileSystem for LocalFs {
    fn entry_kind(&self, path: &Path) -> io::Result<Option<EntryKind>> {
        match fs::symlink_metadata(path) {
            Ok(meta) => Ok(Some(kind_of(meta.file_type()))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_dir(&self, path: &Path) -> io::Result<()> {
        fs::create_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn create_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        use std::io::Write as _;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(contents)?;
        file.sync_all()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        fs::write(path, contents)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: kind_of(entry.file_type()?),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn measure(&self, path: &Path, stop_after_items: Option<u64>) -> io::Result<EntrySize> {
        let mut size = EntrySize { items: 0, bytes: 0 };
        let mut pending = vec![path.to_path_buf()];

        while let Some(current) = pending.pop() {
            let meta = fs::symlink_metadata(&current)?;
            size.items += 1;
            if meta.is_file() {
                size.bytes += meta.len();
            } else if meta.is_dir() {
                for entry in fs::read_dir(&current)? {
                    pending.push(entry?.path());
                }
            }
            if stop_after_items.is_some_and(|limit| size.items > limit) {
                break;
            }
        }

        Ok(size)
    }
}
