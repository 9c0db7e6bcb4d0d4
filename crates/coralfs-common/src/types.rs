//! Core identifier types for CoralFS
//!
//! Inode number ranges mirror the metadata server's reserved layout: each
//! node owns one primary journal inode, one backup journal inode (used only
//! while a format rewrite is in flight), and one pointer inode naming which
//! of the two is live.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata server node identifier (rank)
pub type NodeId = u64;

/// Storage pool identifier
pub type PoolId = u64;

/// Inode number
pub type Ino = u64;

/// First inode of the per-node primary journal range
pub const LOG_INO_BASE: Ino = 0x200;

/// First inode of the per-node backup journal range
pub const LOG_BACKUP_INO_BASE: Ino = 0x300;

/// First inode of the per-node journal pointer range
pub const POINTER_INO_BASE: Ino = 0x400;

/// Primary journal inode for a node
pub fn log_ino(node: NodeId) -> Ino {
    LOG_INO_BASE + node
}

/// Backup journal inode for a node
pub fn log_backup_ino(node: NodeId) -> Ino {
    LOG_BACKUP_INO_BASE + node
}

/// Journal pointer inode for a node
pub fn pointer_ino(node: NodeId) -> Ino {
    POINTER_INO_BASE + node
}

/// Address of one object in the metadata pool.
///
/// A journal stream is striped across objects `index = offset / object_size`;
/// the stream header lives in a distinguished header object per inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    /// Pool holding the object
    pub pool: PoolId,
    /// Owning inode
    pub ino: Ino,
    /// Stripe index within the inode, or `HEADER_INDEX`
    pub index: u64,
}

impl ObjectId {
    /// Distinguished index for per-inode header objects
    pub const HEADER_INDEX: u64 = u64::MAX;

    /// Data object at a stripe index
    pub fn data(pool: PoolId, ino: Ino, index: u64) -> Self {
        Self { pool, ino, index }
    }

    /// Header object for an inode
    pub fn header(pool: PoolId, ino: Ino) -> Self {
        Self {
            pool,
            ino,
            index: Self::HEADER_INDEX,
        }
    }

    /// Whether this addresses a header object
    pub fn is_header(&self) -> bool {
        self.index == Self::HEADER_INDEX
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_header() {
            write!(f, "{}:{:x}.head", self.pool, self.ino)
        } else {
            write!(f, "{}:{:x}.{:08x}", self.pool, self.ino, self.index)
        }
    }
}

/// I/O priority attached to expiry work.
///
/// Trim interpolates between `LOW` and `HIGH` as the expiring set fills,
/// so the oldest, most urgent expiries get the most backend priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IoPriority(pub u8);

impl IoPriority {
    /// Background priority
    pub const LOW: IoPriority = IoPriority(64);
    /// Urgent priority
    pub const HIGH: IoPriority = IoPriority(196);

    /// Linear interpolation from LOW to HIGH as `current` approaches `max`
    pub fn scaled(current: usize, max: usize) -> Self {
        if max == 0 {
            return Self::LOW;
        }
        let span = (Self::HIGH.0 - Self::LOW.0) as usize;
        let v = Self::LOW.0 as usize + span * current.min(max) / max;
        IoPriority(v as u8)
    }
}
