//! Metadata log events
//!
//! Every metadata mutation is journaled as one event: a type tag, a stamp,
//! and an opaque payload whose semantics belong to the metadata cache. The
//! journal cares about the tag only to drive segment boundaries (subtree
//! maps open segments) and rotation suppression.
//!
//! Body format (the journaler adds its own stream framing around this):
//! ```text
//! +----------+-----------+---------+
//! | type tag | stamp     | payload |
//! | u32 LE   | u64 LE µs | var     |
//! +----------+-----------+---------+
//! ```

use crate::segment::CacheRef;
use bytes::Bytes;
use coralfs_common::{Error, Result};

/// Fixed part of the event body: type tag + stamp
pub const EVENT_BODY_HEADER_SIZE: usize = 12;

/// Event type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventType {
    /// Full subtree map; opens a new log segment on replay
    SubtreeMap = 1,
    /// Debug-only subtree map; never interpreted as a segment boundary
    SubtreeMapTest = 2,
    /// Import finished during subtree resolution
    ImportFinish = 3,
    /// Journal was reset; opens a new log segment on replay
    ResetJournal = 4,
    /// Any other metadata mutation; payload is opaque
    Update = 5,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SubtreeMap => "subtree_map",
            EventType::SubtreeMapTest => "subtree_map_test",
            EventType::ImportFinish => "import_finish",
            EventType::ResetJournal => "reset_journal",
            EventType::Update => "update",
        }
    }

    /// Whether replay treats this event as the start of a new segment
    pub fn opens_segment(&self) -> bool {
        matches!(self, EventType::SubtreeMap | EventType::ResetJournal)
    }
}

impl TryFrom<u32> for EventType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(EventType::SubtreeMap),
            2 => Ok(EventType::SubtreeMapTest),
            3 => Ok(EventType::ImportFinish),
            4 => Ok(EventType::ResetJournal),
            5 => Ok(EventType::Update),
            _ => Err(Error::storage(format!("invalid event type tag: {}", value))),
        }
    }
}

/// One journaled metadata mutation
#[derive(Debug, Clone)]
pub struct LogEvent {
    etype: EventType,
    payload: Bytes,
    /// Submit or replay stamp, microseconds since the epoch
    stamp_micros: u64,
    /// Stream offset where this event's entry begins; assigned by
    /// `start_entry` (or replay) and immutable afterwards
    start_off: u64,
    /// Offset of the owning segment, once attached
    segment: Option<u64>,
    /// Cache state this event dirtied; drained into the segment on submit
    dirty_refs: Vec<CacheRef>,
}

impl LogEvent {
    pub fn new(etype: EventType, payload: Bytes) -> Self {
        Self {
            etype,
            payload,
            stamp_micros: 0,
            start_off: 0,
            segment: None,
            dirty_refs: Vec::new(),
        }
    }

    /// Attach cache references that must be flushed before the owning
    /// segment can expire
    pub fn with_dirty_refs(mut self, refs: Vec<CacheRef>) -> Self {
        self.dirty_refs = refs;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.etype
    }

    /// Retag the event (used for the debug subtree map injection)
    pub fn set_event_type(&mut self, etype: EventType) {
        self.etype = etype;
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn stamp_micros(&self) -> u64 {
        self.stamp_micros
    }

    pub(crate) fn set_stamp_micros(&mut self, micros: u64) {
        self.stamp_micros = micros;
    }

    pub fn start_off(&self) -> u64 {
        self.start_off
    }

    pub(crate) fn set_start_off(&mut self, off: u64) {
        self.start_off = off;
    }

    /// Offset of the segment that owns this event
    pub fn segment(&self) -> Option<u64> {
        self.segment
    }

    pub(crate) fn set_segment(&mut self, offset: u64) {
        self.segment = Some(offset);
    }

    pub(crate) fn take_dirty_refs(&mut self) -> Vec<CacheRef> {
        std::mem::take(&mut self.dirty_refs)
    }

    /// Serialize the event body (stream framing is the journaler's job)
    pub fn encode_body(&self) -> Bytes {
        let mut buf = Vec::with_capacity(EVENT_BODY_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&(self.etype as u32).to_le_bytes());
        buf.extend_from_slice(&self.stamp_micros.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }

    /// Decode an event body read from stream offset `pos`
    pub fn decode_body(pos: u64, body: &[u8]) -> Result<Self> {
        if body.len() < EVENT_BODY_HEADER_SIZE {
            return Err(Error::corrupt(
                pos,
                format!("event body too short: {} bytes", body.len()),
            ));
        }
        let tag = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let etype = EventType::try_from(tag)
            .map_err(|_| Error::corrupt(pos, format!("unknown event type tag {}", tag)))?;
        let stamp_micros = u64::from_le_bytes(body[4..12].try_into().unwrap());

        Ok(Self {
            etype,
            payload: Bytes::copy_from_slice(&body[EVENT_BODY_HEADER_SIZE..]),
            stamp_micros,
            start_off: pos,
            segment: None,
            dirty_refs: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_roundtrip() {
        let mut ev = LogEvent::new(EventType::Update, Bytes::from_static(b"rename /a /b"));
        ev.set_stamp_micros(1_700_000_000_000_000);

        let body = ev.encode_body();
        let back = LogEvent::decode_body(4096, &body).unwrap();

        assert_eq!(back.event_type(), EventType::Update);
        assert_eq!(back.stamp_micros(), 1_700_000_000_000_000);
        assert_eq!(back.payload().as_ref(), b"rename /a /b");
        assert_eq!(back.start_off(), 4096);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let mut body = Vec::new();
        body.extend_from_slice(&999u32.to_le_bytes());
        body.extend_from_slice(&0u64.to_le_bytes());
        let err = LogEvent::decode_body(0, &body).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_decode_rejects_truncated_body() {
        let err = LogEvent::decode_body(128, &[1, 0, 0]).unwrap_err();
        assert!(err.is_corrupt());
    }

    #[test]
    fn test_segment_boundary_types() {
        assert!(EventType::SubtreeMap.opens_segment());
        assert!(EventType::ResetJournal.opens_segment());
        assert!(!EventType::SubtreeMapTest.opens_segment());
        assert!(!EventType::Update.opens_segment());
    }
}
