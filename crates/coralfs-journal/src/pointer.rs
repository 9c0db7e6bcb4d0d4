//! Journal pointer
//!
//! A tiny durable record naming the inode of the live (front) journal and,
//! while a format rewrite is in flight, the inode of the new (back) journal
//! being filled. The pointer flip in the reformat engine is the atomic
//! commit point of the rewrite; recovery uses a non-zero back field to
//! detect and clean up a rewrite that crashed midway.
//!
//! Object layout:
//! ```text
//! +--------+---------+-------+-------+--------+
//! | Magic  | Version | Front | Back  | CRC32C |
//! | 8B     | 4B      | 8B    | 8B    | 4B     |
//! +--------+---------+-------+-------+--------+
//! ```

use crate::store::ObjectStore;
use coralfs_common::{pointer_ino, Error, Ino, NodeId, ObjectId, PoolId, Result};
use tracing::debug;

const POINTER_MAGIC: u64 = 0x434f_5241_4c4a_5054; // "CORALJPT"
const POINTER_VERSION: u32 = 1;
const POINTER_SIZE: usize = 32;

/// Durable front/back journal inode record for one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalPointer {
    /// Inode of the active journal
    pub front: Ino,
    /// Inode of the in-flight rewrite target; 0 when absent
    pub back: Ino,
}

impl JournalPointer {
    pub fn new(front: Ino) -> Self {
        Self { front, back: 0 }
    }

    /// Whether neither journal is named
    pub fn is_null(&self) -> bool {
        self.front == 0 && self.back == 0
    }

    /// The fixed object this node's pointer lives in
    pub fn object_id(pool: PoolId, node: NodeId) -> ObjectId {
        ObjectId::data(pool, pointer_ino(node), 0)
    }

    fn to_bytes(self) -> [u8; POINTER_SIZE] {
        let mut buf = [0u8; POINTER_SIZE];
        buf[0..8].copy_from_slice(&POINTER_MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&POINTER_VERSION.to_le_bytes());
        buf[12..20].copy_from_slice(&self.front.to_le_bytes());
        buf[20..28].copy_from_slice(&self.back.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < POINTER_SIZE {
            return Err(Error::storage("journal pointer object too small"));
        }
        let magic = u64::from_le_bytes(data[0..8].try_into().unwrap());
        if magic != POINTER_MAGIC {
            return Err(Error::storage("invalid journal pointer magic"));
        }
        let version = u32::from_le_bytes(data[8..12].try_into().unwrap());
        if version != POINTER_VERSION {
            return Err(Error::storage(format!(
                "unsupported journal pointer version: {}",
                version
            )));
        }
        let stored_crc = u32::from_le_bytes(data[28..32].try_into().unwrap());
        let computed = crc32c::crc32c(&data[..28]);
        if stored_crc != computed {
            return Err(Error::storage("journal pointer checksum mismatch"));
        }
        Ok(Self {
            front: u64::from_le_bytes(data[12..20].try_into().unwrap()),
            back: u64::from_le_bytes(data[20..28].try_into().unwrap()),
        })
    }

    /// Load the pointer for `node`. `NotFound` means a fresh node.
    pub fn load(store: &dyn ObjectStore, pool: PoolId, node: NodeId) -> Result<Self> {
        let oid = Self::object_id(pool, node);
        let data = store.read(&oid)?;
        let jp = Self::from_bytes(&data)?;
        debug!(front = jp.front, back = jp.back, "loaded journal pointer");
        Ok(jp)
    }

    /// Persist the pointer for `node`
    pub fn save(&self, store: &dyn ObjectStore, pool: PoolId, node: NodeId) -> Result<()> {
        let oid = Self::object_id(pool, node);
        store.write(&oid, 0, &self.to_bytes())?;
        debug!(front = self.front, back = self.back, "saved journal pointer");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_load_absent_is_not_found() {
        let store = MemoryStore::new();
        let err = JournalPointer::load(&store, 1, 0).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = MemoryStore::new();
        let jp = JournalPointer {
            front: 0x200,
            back: 0x300,
        };
        jp.save(&store, 1, 0).unwrap();
        let back = JournalPointer::load(&store, 1, 0).unwrap();
        assert_eq!(back, jp);
    }

    #[test]
    fn test_corrupt_pointer_rejected() {
        let store = MemoryStore::new();
        let jp = JournalPointer::new(0x200);
        jp.save(&store, 1, 0).unwrap();

        // flip one byte of the front field
        let oid = JournalPointer::object_id(1, 0);
        store.write(&oid, 12, &[0xff]).unwrap();
        let err = JournalPointer::load(&store, 1, 0).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_pointers_are_per_node() {
        let store = MemoryStore::new();
        JournalPointer::new(0x200).save(&store, 1, 0).unwrap();
        JournalPointer::new(0x201).save(&store, 1, 1).unwrap();
        assert_eq!(JournalPointer::load(&store, 1, 0).unwrap().front, 0x200);
        assert_eq!(JournalPointer::load(&store, 1, 1).unwrap().front, 0x201);
    }
}
