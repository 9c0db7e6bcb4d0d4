//! Interface to the metadata cache
//!
//! The journal consumes the cache through the [`MetadataSource`] trait:
//! events are produced by it, replayed into it, and segments expire by
//! asking it to flush the cache state they pin. The cache lock is the
//! coarse lock of the server: callers of the foreground journal API hold
//! it and pass `&mut S`; background engines acquire it themselves and drop
//! the guard across every backend wait.

use crate::event::LogEvent;
use crate::segment::LogSegment;
use coralfs_common::{IoPriority, NodeId, PoolId, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Completion for a whole engine run (open, replay)
pub type CompletionCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// What the embedding server must do about a fatal journal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalAction {
    /// Writer was fenced: exit and restart, re-running recovery
    Respawn,
    /// Unexpected backend failure: exit without restart
    Suicide,
}

struct GatherInner {
    remaining: AtomicUsize,
    activated: AtomicBool,
    finisher: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl GatherInner {
    fn try_finish(&self) {
        if !self.activated.load(Ordering::SeqCst) {
            return;
        }
        if self.remaining.load(Ordering::SeqCst) != 0 {
            return;
        }
        if let Some(finisher) = self.finisher.lock().take() {
            finisher();
        }
    }
}

/// One outstanding sub-operation of an expiry gather
pub struct GatherSub {
    inner: Arc<GatherInner>,
}

impl GatherSub {
    /// Mark this sub-operation complete; the finisher runs when the last
    /// sub completes
    pub fn complete(self) {
        self.inner.remaining.fetch_sub(1, Ordering::SeqCst);
        self.inner.try_finish();
    }
}

/// Collects the outstanding I/O a segment expiry depends on.
///
/// The metadata source registers one sub per flush it starts; if none are
/// registered the segment can expire immediately. `activate` arms the
/// finisher, which fires once when every sub has completed.
pub struct GatherBuilder {
    inner: Arc<GatherInner>,
    subs: usize,
}

impl GatherBuilder {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GatherInner {
                remaining: AtomicUsize::new(0),
                activated: AtomicBool::new(false),
                finisher: Mutex::new(None),
            }),
            subs: 0,
        }
    }

    /// Register one outstanding sub-operation
    pub fn new_sub(&mut self) -> GatherSub {
        self.inner.remaining.fetch_add(1, Ordering::SeqCst);
        self.subs += 1;
        GatherSub {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Whether any sub-operations were registered
    pub fn has_subs(&self) -> bool {
        self.subs > 0
    }

    /// Arm the finisher. Runs immediately if every sub already completed.
    pub fn activate(self, finisher: impl FnOnce() + Send + 'static) {
        *self.inner.finisher.lock() = Some(Box::new(finisher));
        self.inner.activated.store(true, Ordering::SeqCst);
        self.inner.try_finish();
    }
}

impl Default for GatherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The metadata cache, as seen by its journal
pub trait MetadataSource: Send + 'static {
    /// This server's rank
    fn node_id(&self) -> NodeId;

    /// Pool holding the metadata objects
    fn metadata_pool(&self) -> PoolId;

    /// Whether the server is resolving subtree authority (suppresses
    /// rotation on import-finish events)
    fn is_resolve(&self) -> bool {
        false
    }

    /// Produce a subtree map event describing the current subtree state
    fn create_subtree_map(&mut self) -> LogEvent;

    /// Rotate to the next stray directory (called per new segment)
    fn advance_stray(&mut self);

    /// Apply one replayed event to the in-memory state
    fn replay(&mut self, event: &LogEvent) -> Result<()>;

    /// Start flushing the cache state `segment` pins, registering one
    /// gather sub per outstanding flush
    fn try_to_expire(&mut self, segment: &LogSegment, gather: &mut GatherBuilder, prio: IoPriority);

    /// Drop cache entries no longer pinned by any segment (standby path)
    fn trim_cache(&mut self);
}
