//! File-backed durable store.

use crate::error::{StorageError, StorageResult};
use crate::store::DurableStore;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A durable store on top of a single append-only file.
///
/// `sync` maps to `File::sync_data`, which is what makes a coordinator phase
/// transition or a participant's precommit record survive power loss.
///
/// # Example
///
/// ```no_run
/// use triphase_storage::{DurableStore, FileStore};
/// use std::path::Path;
///
/// let mut store = FileStore::open(Path::new("coordinator.log")).unwrap();
/// store.append(b"record").unwrap();
/// store.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: Mutex<FileState>,
}

#[derive(Debug)]
struct FileState {
    file: File,
    len: u64,
}

impl FileStore {
    /// Opens or creates a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(FileState { file, len }),
        })
    }

    /// Opens or creates a store, creating parent directories first.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".rewrite");
        self.path.with_file_name(name)
    }

    /// Syncs the containing directory so a rename survives power loss.
    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        File::open(dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        Ok(())
    }
}

impl DurableStore for FileStore {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut state = self.inner.lock();
        let size = state.len;
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        state.file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        state.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut state = self.inner.lock();
        let offset = state.len;
        if data.is_empty() {
            return Ok(offset);
        }

        state.file.seek(SeekFrom::End(0))?;
        state.file.write_all(data)?;
        state.len += data.len() as u64;
        Ok(offset)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let mut state = self.inner.lock();
        state.file.flush()?;
        state.file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().len)
    }

    fn truncate(&mut self, new_len: u64) -> StorageResult<()> {
        let mut state = self.inner.lock();
        if new_len > state.len {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_len,
                size: state.len,
            });
        }

        state.file.set_len(new_len)?;
        state.file.sync_all()?;
        state.len = new_len;
        Ok(())
    }

    /// Writes `data` to a sibling file, syncs it, then renames it over the
    /// log.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let temp_path = self.temp_path();
        let mut state = self.inner.lock();

        let mut temp = File::create(&temp_path)?;
        temp.write_all(data)?;
        temp.sync_all()?;
        drop(temp);

        std::fs::rename(&temp_path, &self.path)?;
        self.sync_directory()?;

        state.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        state.len = data.len() as u64;
        Ok(())
    }
}
