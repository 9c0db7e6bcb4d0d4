//! Narrow object store interface backing the journal
//!
//! The metadata pool is consumed through three operations: whole-object
//! read, write-at-offset, and remove. Two implementations are provided:
//! an in-process [`MemoryStore`] used by tests and embedded setups, and a
//! [`FileStore`] that keeps one file per object under a directory, used by
//! the offline journal tool and single-node development clusters.
//!
//! Fencing is detected, not prevented: once a store is fenced every write
//! fails with [`Error::Fenced`] while reads continue to work, matching the
//! behavior of a revoked writer lease on the real backend.

use bytes::Bytes;
use coralfs_common::{Error, ObjectId, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Append-only friendly object store operations consumed by the journal
pub trait ObjectStore: Send + Sync {
    /// Read the whole object. `NotFound` if it does not exist.
    fn read(&self, oid: &ObjectId) -> Result<Bytes>;

    /// Write `data` at `offset`, creating or extending the object.
    fn write(&self, oid: &ObjectId, offset: u64, data: &[u8]) -> Result<()>;

    /// Remove the object. `NotFound` if it does not exist.
    fn remove(&self, oid: &ObjectId) -> Result<()>;
}

/// In-process object store
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectId, Vec<u8>>>,
    fenced: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            fenced: AtomicBool::new(false),
        }
    }

    /// Revoke the writer lease: all subsequent writes fail with `Fenced`.
    pub fn fence(&self) {
        self.fenced.store(true, Ordering::SeqCst);
    }

    /// Number of objects currently stored
    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Whether the object exists
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.objects.read().contains_key(oid)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryStore {
    fn read(&self, oid: &ObjectId) -> Result<Bytes> {
        let objects = self.objects.read();
        objects
            .get(oid)
            .map(|data| Bytes::copy_from_slice(data))
            .ok_or_else(|| Error::not_found(oid.to_string()))
    }

    fn write(&self, oid: &ObjectId, offset: u64, data: &[u8]) -> Result<()> {
        if self.fenced.load(Ordering::SeqCst) {
            return Err(Error::Fenced(format!("write to {} after fencing", oid)));
        }
        let mut objects = self.objects.write();
        let obj = objects.entry(*oid).or_default();
        let end = offset as usize + data.len();
        if obj.len() < end {
            obj.resize(end, 0);
        }
        obj[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn remove(&self, oid: &ObjectId) -> Result<()> {
        if self.fenced.load(Ordering::SeqCst) {
            return Err(Error::Fenced(format!("remove of {} after fencing", oid)));
        }
        let mut objects = self.objects.write();
        objects
            .remove(oid)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(oid.to_string()))
    }
}

/// One-file-per-object store rooted at a directory
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a file store under `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::storage(format!("failed to create store dir: {}", e)))?;
        Ok(Self { root })
    }

    fn object_path(&self, oid: &ObjectId) -> PathBuf {
        let name = if oid.is_header() {
            format!("{}_{:016x}_head", oid.pool, oid.ino)
        } else {
            format!("{}_{:016x}_{:016x}", oid.pool, oid.ino, oid.index)
        };
        self.root.join(name)
    }
}

impl ObjectStore for FileStore {
    fn read(&self, oid: &ObjectId) -> Result<Bytes> {
        let path = self.object_path(oid);
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(oid.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn write(&self, oid: &ObjectId, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.object_path(oid);
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    fn remove(&self, oid: &ObjectId) -> Result<()> {
        let path = self.object_path(oid);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(oid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_read_write_remove() {
        let store = MemoryStore::new();
        let oid = ObjectId::data(1, 0x200, 0);

        assert!(store.read(&oid).unwrap_err().is_not_found());

        store.write(&oid, 0, b"hello").unwrap();
        store.write(&oid, 5, b" world").unwrap();
        assert_eq!(store.read(&oid).unwrap().as_ref(), b"hello world");

        // sparse write zero-fills the gap
        store.write(&oid, 16, b"x").unwrap();
        assert_eq!(store.read(&oid).unwrap().len(), 17);

        store.remove(&oid).unwrap();
        assert!(store.remove(&oid).unwrap_err().is_not_found());
    }

    #[test]
    fn test_memory_store_fencing() {
        let store = MemoryStore::new();
        let oid = ObjectId::data(1, 0x200, 0);
        store.write(&oid, 0, b"before").unwrap();

        store.fence();
        assert!(store.write(&oid, 0, b"after").unwrap_err().is_fenced());
        // reads survive fencing
        assert_eq!(store.read(&oid).unwrap().as_ref(), b"before");
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let data_oid = ObjectId::data(1, 0x200, 7);
        let head_oid = ObjectId::header(1, 0x200);

        store.write(&data_oid, 0, b"payload").unwrap();
        store.write(&head_oid, 0, b"head").unwrap();

        assert_eq!(store.read(&data_oid).unwrap().as_ref(), b"payload");
        assert_eq!(store.read(&head_oid).unwrap().as_ref(), b"head");

        store.remove(&data_oid).unwrap();
        assert!(store.read(&data_oid).unwrap_err().is_not_found());
        // header object untouched
        assert!(store.read(&head_oid).is_ok());
    }
}
