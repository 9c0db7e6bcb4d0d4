//! CoralFS Metadata Journal
//!
//! This crate implements the metadata server's journal: a durable,
//! append-only log of metadata mutation events over the object store,
//! including:
//! - The submit path: events attach to log segments and append to a
//!   framed stream, with rotation at object boundaries
//! - Segment lifecycle: open, current, expiring, expired, trimmed
//! - Startup recovery: pointer resolution, crashed-rewrite cleanup, and
//!   transparent stream format migration
//! - Replay of committed events into the in-memory metadata state
//! - Standby tailing of an active writer's journal
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  MetadataSource  │  (the metadata cache; produces and replays events)
//! └────────┬─────────┘
//!          │ submit / replay / try_to_expire
//! ┌────────▼─────────┐
//! │   MetadataLog    │  segments, trim, recovery/reformat/replay engines
//! └────────┬─────────┘
//!          │ append / flush / read
//! ┌────────▼─────────┐
//! │  ObjectJournal   │  framed stream + durable header, JournalPointer
//! └────────┬─────────┘
//!          │ read / write / remove
//! ┌────────▼─────────┐
//! │   ObjectStore    │  metadata pool objects
//! └──────────────────┘
//! ```

pub mod event;
pub mod journaler;
pub mod log;
pub mod metrics;
pub mod pointer;
pub mod segment;
pub mod source;
pub mod store;

mod recovery;
mod reformat;
mod replay;

pub use event::{EventType, LogEvent};
pub use journaler::{
    FlushCallback, ObjectJournal, STREAM_FORMAT_LEGACY, STREAM_FORMAT_RESILIENT,
};
pub use log::MetadataLog;
pub use metrics::JournalMetrics;
pub use pointer::JournalPointer;
pub use segment::{CacheRef, CacheRefKind, LogSegment, SegmentIndex};
pub use source::{CompletionCallback, FatalAction, GatherBuilder, GatherSub, MetadataSource};
pub use store::{FileStore, MemoryStore, ObjectStore};
