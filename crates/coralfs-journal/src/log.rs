//! The metadata log
//!
//! [`MetadataLog`] owns the journaler, the segment index and the expiry
//! machinery, and exposes the submit path used by the metadata cache.
//!
//! Foreground operations take `&mut S`: the caller holds the cache lock
//! and passes the cache in, so rotation can journal a fresh subtree map
//! without re-entering the lock. Background engines (recovery, reformat,
//! replay) run on their own threads and acquire the lock themselves.

use crate::event::{EventType, LogEvent};
use crate::journaler::{FlushCallback, ObjectJournal};
use crate::metrics::JournalMetrics;
use crate::pointer::JournalPointer;
use crate::segment::{ExpiryCompletion, LogSegment, SegmentIndex};
use crate::source::{CompletionCallback, FatalAction, GatherBuilder, MetadataSource};
use crate::store::ObjectStore;
use crate::{recovery, replay};
use coralfs_common::{log_ino, Error, IoPriority, JournalConfig, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

pub(crate) struct LogState {
    pub index: SegmentIndex,
    pub num_events: u64,
    pub capped: bool,
    pub entry_open: bool,
    pub unflushed: u64,
}

enum TrimStep {
    Done,
    Skip(u64),
    Expire(u64, IoPriority),
}

/// The metadata server's journal of mutation events
pub struct MetadataLog<S: MetadataSource> {
    pub(crate) cfg: JournalConfig,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) source: Arc<Mutex<S>>,
    pub(crate) metrics: Arc<JournalMetrics>,
    journaler: Mutex<Option<Arc<ObjectJournal>>>,
    pub(crate) state: Mutex<LogState>,
    expiry_completions: Arc<Mutex<Vec<ExpiryCompletion>>>,
    pub(crate) replay_waiters: Mutex<Vec<CompletionCallback>>,
    already_replayed: AtomicBool,
    on_fatal: Mutex<Option<Box<dyn FnMut(FatalAction) + Send>>>,
    /// Back-reference handed to background threads and error handlers
    self_ref: Mutex<Weak<Self>>,
}

impl<S: MetadataSource> MetadataLog<S> {
    pub fn new(cfg: JournalConfig, store: Arc<dyn ObjectStore>, source: Arc<Mutex<S>>) -> Arc<Self> {
        let log = Arc::new(Self {
            cfg,
            store,
            source,
            metrics: Arc::new(JournalMetrics::new()),
            journaler: Mutex::new(None),
            state: Mutex::new(LogState {
                index: SegmentIndex::new(),
                num_events: 0,
                capped: false,
                entry_open: false,
                unflushed: 0,
            }),
            expiry_completions: Arc::new(Mutex::new(Vec::new())),
            replay_waiters: Mutex::new(Vec::new()),
            already_replayed: AtomicBool::new(false),
            on_fatal: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
        });
        *log.self_ref.lock() = Arc::downgrade(&log);
        log
    }

    fn self_arc(&self) -> Arc<Self> {
        self.self_ref
            .lock()
            .upgrade()
            .expect("log still referenced")
    }

    pub fn config(&self) -> &JournalConfig {
        &self.cfg
    }

    pub fn metrics(&self) -> &Arc<JournalMetrics> {
        &self.metrics
    }

    /// The active journaler, once recovery or `create` installed one
    pub fn journaler(&self) -> Option<Arc<ObjectJournal>> {
        self.journaler.lock().clone()
    }

    /// Install the hook invoked on fatal journal errors. The embedding
    /// server maps `Respawn`/`Suicide` onto its process lifecycle.
    pub fn set_on_fatal(&self, hook: impl FnMut(FatalAction) + Send + 'static) {
        *self.on_fatal.lock() = Some(Box::new(hook));
    }

    pub(crate) fn install_journaler(&self, journaler: Arc<ObjectJournal>) {
        let weak = self.self_ref.lock().clone();
        journaler.set_write_error_handler(Box::new(move |e| {
            if let Some(log) = weak.upgrade() {
                log.handle_write_error(e);
            }
        }));
        *self.journaler.lock() = Some(journaler);
    }

    pub(crate) fn handle_write_error(&self, e: &Error) {
        if e.is_fenced() {
            warn!(error = %e, "we have been fenced, respawning");
            self.fatal(FatalAction::Respawn);
        } else {
            error!(error = %e, "unhandled journal write error, shutting down");
            self.fatal(FatalAction::Suicide);
        }
    }

    pub(crate) fn fatal(&self, action: FatalAction) {
        match self.on_fatal.lock().as_mut() {
            Some(hook) => hook(action),
            None => error!(?action, "fatal journal error with no handler installed"),
        }
    }

    pub fn read_pos(&self) -> u64 {
        self.journaler().map_or(0, |j| j.read_pos())
    }

    pub fn write_pos(&self) -> u64 {
        self.journaler().map_or(0, |j| j.write_pos())
    }

    pub fn safe_pos(&self) -> u64 {
        self.journaler().map_or(0, |j| j.safe_pos())
    }

    pub fn num_events(&self) -> u64 {
        self.state.lock().num_events
    }

    pub fn segment_count(&self) -> usize {
        self.state.lock().index.len()
    }

    pub fn segment_offsets(&self) -> Vec<u64> {
        self.state.lock().index.offsets().collect()
    }

    /// Snapshot of one segment, by offset
    pub fn segment(&self, offset: u64) -> Option<LogSegment> {
        self.state.lock().index.get(offset).cloned()
    }

    pub fn expiring_count(&self) -> usize {
        self.state.lock().index.expiring_count()
    }

    pub fn expired_count(&self) -> usize {
        self.state.lock().index.expired_count()
    }

    /// Sum of per-segment event counts; equals `num_events` at all times
    pub fn segment_event_total(&self) -> u64 {
        self.state.lock().index.event_total()
    }

    pub fn is_capped(&self) -> bool {
        self.state.lock().capped
    }

    /// Create a fresh, empty, writeable journal and persist its head
    pub fn create(&self) -> Result<()> {
        let (node, pool) = {
            let source = self.source.lock();
            (source.node_id(), source.metadata_pool())
        };
        info!(node, "creating empty metadata journal");
        let journaler = Arc::new(ObjectJournal::new(
            log_ino(node),
            pool,
            Arc::clone(&self.store),
            self.cfg.layout,
            self.cfg.stream_format,
            Arc::clone(&self.metrics),
        ));
        journaler.set_writeable();
        journaler.create(self.cfg.stream_format);
        journaler.write_head()?;

        self.metrics
            .expos
            .store(journaler.expire_pos(), Ordering::Relaxed);
        self.metrics
            .wrpos
            .store(journaler.write_pos(), Ordering::Relaxed);
        self.install_journaler(journaler);

        // the first segment is opened by the initial subtree map submit
        Ok(())
    }

    /// Resolve the journal pointer and open the front journal on a
    /// dedicated thread, migrating old stream formats along the way.
    /// Either `append` or `replay` follows.
    pub fn open(&self, completion: CompletionCallback) -> JoinHandle<()> {
        info!("open: discovering log bounds");
        recovery::spawn(self.self_arc(), completion)
    }

    /// Take the writer role: position read/expire at the write head and
    /// mark the journaler writeable
    pub fn append(&self) {
        let journaler = self.journaler().expect("journal not recovered");
        info!("append: positioning at end and marking writeable");
        journaler.set_read_pos(journaler.write_pos());
        journaler.set_expire_pos(journaler.write_pos());
        journaler.set_writeable();
        self.metrics
            .expos
            .store(journaler.write_pos(), Ordering::Relaxed);
    }

    /// Begin one log entry: stamps the event with its stream offset.
    /// At most one entry may be in flight; a second `start_entry` before
    /// `submit_entry` is a caller bug.
    pub fn start_entry(&self, event: &mut LogEvent) {
        {
            let mut st = self.state.lock();
            assert!(!st.entry_open, "log entry already in progress");
            st.entry_open = true;
        }
        if let Some(journaler) = self.journaler() {
            event.set_start_off(journaler.write_pos());
        }
    }

    /// Journal the entry begun by `start_entry`: attach it to the current
    /// segment, append it to the stream, and evaluate segment rotation.
    /// `on_safe` fires when the append is durable.
    pub fn submit_entry(&self, source: &mut S, event: LogEvent, on_safe: Option<FlushCallback>) {
        {
            let mut st = self.state.lock();
            assert!(st.entry_open, "submit_entry without start_entry");
            st.entry_open = false;
        }
        self.submit_internal(source, event, on_safe);
    }

    fn submit_internal(&self, source: &mut S, mut event: LogEvent, on_safe: Option<FlushCallback>) {
        if !self.cfg.journaling_enabled {
            if let Some(cb) = on_safe {
                cb(Ok(()));
            }
            return;
        }
        let journaler = self.journaler().expect("journal not open for writing");
        let etype = event.event_type();
        event.set_start_off(journaler.write_pos());
        event.set_stamp_micros(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_micros() as u64),
        );

        let last_seg;
        let new_write_pos;
        {
            let mut st = self.state.lock();
            assert!(!st.capped, "submit on a capped journal");

            if st.index.is_empty() {
                assert!(
                    etype.opens_segment(),
                    "first journaled event must open a segment"
                );
                st.index.insert(event.start_off());
                self.metrics.segadd.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .seg
                    .store(st.index.len() as u64, Ordering::Relaxed);
            }

            let seg_off = st.index.current_offset().expect("segment index not empty");
            event.set_segment(seg_off);
            let refs = event.take_dirty_refs();

            let body = event.encode_body();
            new_write_pos = journaler.append_entry(&body);
            debug!(
                pos = event.start_off(),
                len = body.len(),
                etype = etype.as_str(),
                "submit_entry"
            );

            let seg = st.index.get_mut(seg_off).expect("current segment exists");
            seg.num_events += 1;
            seg.dirty_refs.extend(refs);
            seg.end = new_write_pos;
            st.num_events += 1;
            st.unflushed += 1;

            self.metrics.evadd.fetch_add(1, Ordering::Relaxed);
            self.metrics.ev.store(st.num_events, Ordering::Relaxed);
            self.metrics.wrpos.store(new_write_pos, Ordering::Relaxed);

            last_seg = seg_off;
        }

        if let Some(cb) = on_safe {
            journaler.wait_for_flush(cb);
        }

        // Segment rotation. Subtree maps must not rotate (the new segment
        // would immediately journal another one), and neither must
        // import-finish events while resolving: the eventual subtree map
        // has to land after every import is disambiguated.
        let is_resolve = source.is_resolve();
        let period = journaler.layout_period();
        if etype == EventType::SubtreeMap || (etype == EventType::ImportFinish && is_resolve) {
            // rotation suppressed
        } else if new_write_pos / period != last_seg / period {
            debug!(
                last_seg,
                pos = new_write_pos,
                "submit_entry also starting new segment"
            );
            self.start_new_segment(source);
        } else if self.cfg.debug_subtree_map && etype != EventType::SubtreeMapTest {
            // journal a subtree map after every event to catch replay
            // bugs; the distinct tag keeps replay from treating it as a
            // segment boundary, and keeps this from recursing
            let mut sle = source.create_subtree_map();
            sle.set_event_type(EventType::SubtreeMapTest);
            self.submit_internal(source, sle, None);
        }
    }

    /// Register a completion that fires when every submit issued before
    /// this call is durable
    pub fn wait_for_safe(&self, cb: FlushCallback) {
        if !self.cfg.journaling_enabled {
            cb(Ok(()));
            return;
        }
        let journaler = self.journaler().expect("journal not open");
        journaler.wait_for_flush(cb);
    }

    /// Push pending appends to the backend. No-op when nothing was
    /// submitted since the last flush.
    pub fn flush(&self) {
        let unflushed = {
            let mut st = self.state.lock();
            std::mem::take(&mut st.unflushed)
        };
        if unflushed == 0 {
            return;
        }
        if let Some(journaler) = self.journaler() {
            // failures reach the write error handler
            let _ = journaler.flush();
        }
    }

    /// Close the log to further writes; the current segment becomes
    /// eligible for expiry
    pub fn cap(&self) {
        info!("cap");
        self.state.lock().capped = true;
    }

    /// Open a new segment at the write head and journal a fresh subtree
    /// map so the segment is independently replayable
    pub fn start_new_segment(&self, source: &mut S) {
        self.prepare_new_segment(source);
        self.journal_segment_subtree_map(source);
    }

    fn prepare_new_segment(&self, source: &mut S) {
        let journaler = self.journaler().expect("journal not open for writing");
        let offset = journaler.write_pos();
        debug!(offset, "preparing new log segment");
        {
            let mut st = self.state.lock();
            st.index.insert(offset);
            self.metrics.segadd.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .seg
                .store(st.index.len() as u64, Ordering::Relaxed);
        }
        debug!("advancing to next stray directory");
        source.advance_stray();
    }

    fn journal_segment_subtree_map(&self, source: &mut S) {
        let event = source.create_subtree_map();
        self.submit_internal(source, event, None);
    }

    /// Bound resident segment and event counts by expiring old segments
    /// and trimming the ones whose expiry completed.
    ///
    /// `limit` overrides the configured event bound for this pass.
    pub fn trim(&self, source: &mut S, limit: Option<i64>) {
        self.handle_expiry_completions(source);

        let Some(journaler) = self.journaler() else {
            return;
        };
        let max_events = limit.unwrap_or(self.cfg.max_events);
        let max_segments = self.cfg.max_segments;

        {
            let st = self.state.lock();
            debug!(
                segments = st.index.len(),
                max_segments,
                events = st.num_events,
                max_events,
                expiring = st.index.expiring_count(),
                expired = st.index.expired_count(),
                "trim"
            );
            if st.index.is_empty() {
                return;
            }
        }

        let stop = Instant::now() + Duration::from_millis(self.cfg.trim_time_budget_ms);
        let mut cursor: Option<u64> = None;
        loop {
            if Instant::now() >= stop {
                debug!("trim ran out of time budget");
                break;
            }
            let step = {
                let st = self.state.lock();
                let num_expiring = st.index.expiring_count();
                let over_events = max_events >= 0
                    && st
                        .num_events
                        .saturating_sub(st.index.expiring_events() + st.index.expired_events())
                        as i64
                        > max_events;
                let over_segments = st.index.live_count() > max_segments;
                if !over_events && !over_segments {
                    TrimStep::Done
                } else if num_expiring >= self.cfg.max_expiring {
                    debug!(num_expiring, "trim blocked on max_expiring");
                    TrimStep::Done
                } else {
                    let next = st
                        .index
                        .offsets()
                        .find(|&off| cursor.is_none_or(|c| off > c));
                    match next {
                        None => TrimStep::Done,
                        Some(off) => {
                            let seg = st.index.get(off).expect("offset from index");
                            if seg.end > journaler.safe_pos() {
                                debug!(
                                    offset = off,
                                    end = seg.end,
                                    safe = journaler.safe_pos(),
                                    "segment not fully flushed yet"
                                );
                                TrimStep::Done
                            } else if st.index.is_expiring(off) || st.index.is_expired(off) {
                                debug!(offset = off, "segment already expiring or expired");
                                TrimStep::Skip(off)
                            } else {
                                let prio =
                                    IoPriority::scaled(num_expiring, self.cfg.max_expiring);
                                TrimStep::Expire(off, prio)
                            }
                        }
                    }
                }
            };
            match step {
                TrimStep::Done => break,
                TrimStep::Skip(off) => cursor = Some(off),
                TrimStep::Expire(off, prio) => {
                    cursor = Some(off);
                    self.try_expire(source, off, prio);
                }
            }
        }

        self.trim_expired_segments(&journaler);
    }

    /// Re-run `try_expire` for segments whose expiry gathers completed.
    /// Called from `trim`, and directly by the replay engine's standby
    /// path.
    pub fn handle_expiry_completions(&self, source: &mut S) {
        loop {
            let batch: Vec<ExpiryCompletion> =
                std::mem::take(&mut *self.expiry_completions.lock());
            if batch.is_empty() {
                break;
            }
            for completion in batch {
                self.maybe_expired(source, completion.segment_offset, completion.prio);
            }
        }
    }

    fn try_expire(&self, source: &mut S, offset: u64, prio: IoPriority) {
        let Some(segment) = self.segment(offset) else {
            return;
        };
        let mut gather = GatherBuilder::new();
        source.try_to_expire(&segment, &mut gather, prio);
        if gather.has_subs() {
            {
                let mut st = self.state.lock();
                st.index.mark_expiring(offset);
            }
            debug!(offset, "try_expire waiting on cache flushes");
            let queue = Arc::clone(&self.expiry_completions);
            gather.activate(move || {
                queue.lock().push(ExpiryCompletion {
                    segment_offset: offset,
                    prio,
                });
            });
        } else {
            debug!(offset, "try_expire expired segment");
            self.mark_expired(offset);
        }

        let st = self.state.lock();
        self.metrics
            .segexg
            .store(st.index.expiring_count() as u64, Ordering::Relaxed);
        self.metrics
            .evexg
            .store(st.index.expiring_events(), Ordering::Relaxed);
    }

    fn maybe_expired(&self, source: &mut S, offset: u64, prio: IoPriority) {
        {
            let mut st = self.state.lock();
            if !st.index.is_expiring(offset) {
                return;
            }
            debug!(offset, "maybe_expired re-checking segment");
            st.index.unmark_expiring(offset);
        }
        self.try_expire(source, offset, prio);
    }

    fn mark_expired(&self, offset: u64) {
        let mut st = self.state.lock();
        let is_current = st.index.current_offset() == Some(offset);
        if !st.capped && is_current {
            debug!(offset, "not expiring the current segment of an uncapped log");
        } else {
            let events = st.index.get(offset).map_or(0, |s| s.num_events);
            st.index.mark_expired(offset);
            self.metrics.evex.fetch_add(events, Ordering::Relaxed);
            self.metrics.segex.fetch_add(1, Ordering::Relaxed);
        }

        self.metrics.ev.store(st.num_events, Ordering::Relaxed);
        self.metrics
            .evexd
            .store(st.index.expired_events(), Ordering::Relaxed);
        self.metrics
            .seg
            .store(st.index.len() as u64, Ordering::Relaxed);
        self.metrics
            .segexd
            .store(st.index.expired_count() as u64, Ordering::Relaxed);
    }

    fn trim_expired_segments(&self, journaler: &ObjectJournal) {
        let mut trimmed = false;
        {
            let mut st = self.state.lock();
            while let Some(oldest) = st.index.oldest_offset() {
                if !st.index.is_expired(oldest) {
                    debug!(offset = oldest, "waiting for oldest segment to expire");
                    break;
                }
                let seg = st.index.remove_oldest().expect("oldest segment exists");
                debug!(
                    offset = seg.offset,
                    events = seg.num_events,
                    "trimming expired segment"
                );
                st.num_events -= seg.num_events;
                // segments are contiguous: the removed segment's end is
                // the oldest surviving segment's offset
                journaler.set_expire_pos(seg.end);
                self.metrics
                    .expos
                    .store(journaler.expire_pos(), Ordering::Relaxed);
                self.metrics.segtrm.fetch_add(1, Ordering::Relaxed);
                self.metrics.evtrm.fetch_add(seg.num_events, Ordering::Relaxed);
                trimmed = true;
            }
            self.metrics.ev.store(st.num_events, Ordering::Relaxed);
            self.metrics
                .seg
                .store(st.index.len() as u64, Ordering::Relaxed);
            self.metrics
                .segexd
                .store(st.index.expired_count() as u64, Ordering::Relaxed);
            self.metrics
                .evexd
                .store(st.index.expired_events(), Ordering::Relaxed);
        }

        if trimmed {
            if let Err(e) = journaler.write_head() {
                warn!(error = %e, "failed to persist journal head after trim");
            }
        }
    }

    /// Standby path: drop segments the active writer has already expired,
    /// then let the cache shed the state they pinned
    pub fn standby_trim_segments(&self, source: &mut S) {
        let Some(journaler) = self.journaler() else {
            return;
        };
        let expire_pos = journaler.expire_pos();
        debug!(expire_pos, "standby_trim_segments");

        let mut removed = false;
        {
            let mut st = self.state.lock();
            while let Some(oldest) = st.index.oldest_offset() {
                let end = st.index.get(oldest).expect("offset from index").end;
                if end > expire_pos {
                    break;
                }
                debug!(offset = oldest, "removing segment behind the writer");
                let mut seg = st.index.remove_oldest().expect("oldest segment exists");
                seg.clear_dirty_refs();
                st.num_events -= seg.num_events;
                removed = true;
            }
            self.metrics.ev.store(st.num_events, Ordering::Relaxed);
            self.metrics
                .seg
                .store(st.index.len() as u64, Ordering::Relaxed);
        }

        if removed {
            source.trim_cache();
        } else {
            debug!("removed no segments");
        }
    }

    /// Replay committed events on a dedicated thread and dispatch them to
    /// the metadata cache. `completion` fires with the final status; a
    /// `Retry` error means the caller should restart replay.
    pub fn replay(&self, completion: CompletionCallback) -> Option<JoinHandle<()>> {
        let journaler = self.journaler().expect("journal not recovered");
        assert!(journaler.is_readonly(), "replay on a writeable journal");

        if journaler.read_pos() == journaler.write_pos() {
            debug!("replay: journal empty, done");
            completion(Ok(()));
            return None;
        }

        self.replay_waiters.lock().push(completion);
        info!(
            from = journaler.read_pos(),
            to = journaler.write_pos(),
            "replay start"
        );
        {
            let st = self.state.lock();
            assert!(
                st.num_events == 0 || self.already_replayed.load(Ordering::SeqCst),
                "replay over submitted events"
            );
        }
        self.already_replayed.store(true, Ordering::SeqCst);
        Some(replay::spawn(self.self_arc()))
    }

    pub(crate) fn finish_replay(&self, result: Result<()>) {
        let waiters: Vec<CompletionCallback> = std::mem::take(&mut *self.replay_waiters.lock());
        debug!(waiters = waiters.len(), "replay kicking waiters");
        for cb in waiters {
            cb(result.clone());
        }
    }

    /// Load this node's journal pointer (test and tooling hook)
    pub fn load_pointer(&self) -> Result<JournalPointer> {
        let (node, pool) = {
            let source = self.source.lock();
            (source.node_id(), source.metadata_pool())
        };
        JournalPointer::load(self.store.as_ref(), pool, node)
    }
}
