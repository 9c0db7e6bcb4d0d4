//! Append-only framed stream over the object store
//!
//! An [`ObjectJournal`] is one journal inode: a byte stream striped across
//! data objects (`index = offset / object_size`) plus a durable header
//! object recording the stream positions. Appends buffer in memory and
//! become durable on `flush`; `write_head` persists positions and trims
//! data objects that fell wholly below the expire position.
//!
//! Positions always satisfy `expire_pos <= read_pos <= safe_pos <=
//! write_pos`.
//!
//! Header object layout:
//! ```text
//! +--------+--------+---------+--------+--------+--------+--------+
//! | Magic  | Format | Trimmed | Expire | Read   | Write  | CRC32C |
//! | 8B     | 4B     | 8B      | 8B     | 8B     | 8B     | 4B     |
//! +--------+--------+---------+--------+--------+--------+--------+
//! ```
//!
//! Two stream framings exist. Format 0 (legacy) is a bare length prefix.
//! Format 1 (resilient) brackets each entry with a sentinel and a crc32c,
//! which lets recovery probe past the last durable header write and lets
//! readers detect torn or trimmed-over entries:
//! ```text
//! format 0:  [len u32][body]
//! format 1:  [sentinel u64][len u32][body][crc32c u32]
//! ```

use crate::metrics::JournalMetrics;
use crate::store::ObjectStore;
use bytes::Bytes;
use coralfs_common::{Error, Ino, JournalLayout, ObjectId, PoolId, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Legacy framing: bare length prefix
pub const STREAM_FORMAT_LEGACY: u32 = 0;
/// Resilient framing: sentinel + length + crc32c
pub const STREAM_FORMAT_RESILIENT: u32 = 1;

const HEADER_MAGIC: u64 = 0x434f_5241_4c4a_4e4c; // "CORALJNL"
const ENTRY_SENTINEL: u64 = 0x434f_5241_4c45_4e54; // "CORALENT"
const HEADER_SIZE: usize = 48;

/// Upper bound on a single entry; anything larger is framing corruption
const MAX_ENTRY_SIZE: u32 = 64 * 1024 * 1024;

/// Fires when an append becomes durable (or permanently fails)
pub type FlushCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Invoked once per failed backend write
pub type WriteErrorHandler = Box<dyn FnMut(&Error) + Send>;

#[derive(Debug, Clone, Copy)]
struct JournalHeader {
    format: u32,
    trimmed_pos: u64,
    expire_pos: u64,
    read_pos: u64,
    write_pos: u64,
}

impl JournalHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&self.format.to_le_bytes());
        buf[12..20].copy_from_slice(&self.trimmed_pos.to_le_bytes());
        buf[20..28].copy_from_slice(&self.expire_pos.to_le_bytes());
        buf[28..36].copy_from_slice(&self.read_pos.to_le_bytes());
        buf[36..44].copy_from_slice(&self.write_pos.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..44]);
        buf[44..48].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::storage("journal header too small"));
        }
        let magic = u64::from_le_bytes(data[0..8].try_into().unwrap());
        if magic != HEADER_MAGIC {
            return Err(Error::storage("invalid journal header magic"));
        }
        let stored_crc = u32::from_le_bytes(data[44..48].try_into().unwrap());
        if stored_crc != crc32c::crc32c(&data[..44]) {
            return Err(Error::storage("journal header checksum mismatch"));
        }
        Ok(Self {
            format: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            trimmed_pos: u64::from_le_bytes(data[12..20].try_into().unwrap()),
            expire_pos: u64::from_le_bytes(data[20..28].try_into().unwrap()),
            read_pos: u64::from_le_bytes(data[28..36].try_into().unwrap()),
            write_pos: u64::from_le_bytes(data[36..44].try_into().unwrap()),
        })
    }
}

struct StreamState {
    format: u32,
    trimmed_pos: u64,
    expire_pos: u64,
    read_pos: u64,
    safe_pos: u64,
    write_pos: u64,
    /// Framed but unflushed bytes; starts at stream offset `flush_base`
    pending: Vec<u8>,
    flush_base: u64,
    /// (target write position, callback), in registration order
    flush_waiters: Vec<(u64, FlushCallback)>,
}

impl std::fmt::Debug for ObjectJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectJournal")
            .field("ino", &self.ino)
            .field("pool", &self.pool)
            .field("writeable", &self.writeable)
            .finish_non_exhaustive()
    }
}

/// One journal inode: framed append-only stream plus durable header
pub struct ObjectJournal {
    ino: Ino,
    pool: PoolId,
    store: Arc<dyn ObjectStore>,
    layout: JournalLayout,
    state: Mutex<StreamState>,
    /// Serializes flush and head writes so safe_pos advances in order
    io: Mutex<()>,
    writeable: AtomicBool,
    error: Mutex<Option<Error>>,
    write_error_handler: Mutex<Option<WriteErrorHandler>>,
    metrics: Arc<JournalMetrics>,
}

impl ObjectJournal {
    /// Open a handle on journal inode `ino`. Read-only until
    /// `set_writeable`; positions are unknown until `create` or `recover`.
    pub fn new(
        ino: Ino,
        pool: PoolId,
        store: Arc<dyn ObjectStore>,
        layout: JournalLayout,
        default_format: u32,
        metrics: Arc<JournalMetrics>,
    ) -> Self {
        Self {
            ino,
            pool,
            store,
            layout,
            state: Mutex::new(StreamState {
                format: default_format,
                trimmed_pos: 0,
                expire_pos: 0,
                read_pos: 0,
                safe_pos: 0,
                write_pos: 0,
                pending: Vec::new(),
                flush_base: 0,
                flush_waiters: Vec::new(),
            }),
            io: Mutex::new(()),
            writeable: AtomicBool::new(false),
            error: Mutex::new(None),
            write_error_handler: Mutex::new(None),
            metrics,
        }
    }

    pub fn ino(&self) -> Ino {
        self.ino
    }

    pub fn layout(&self) -> JournalLayout {
        self.layout
    }

    pub fn layout_period(&self) -> u64 {
        self.layout.period()
    }

    pub fn stream_format(&self) -> u32 {
        self.state.lock().format
    }

    pub fn read_pos(&self) -> u64 {
        self.state.lock().read_pos
    }

    pub fn write_pos(&self) -> u64 {
        self.state.lock().write_pos
    }

    pub fn safe_pos(&self) -> u64 {
        self.state.lock().safe_pos
    }

    pub fn expire_pos(&self) -> u64 {
        self.state.lock().expire_pos
    }

    pub fn set_writeable(&self) {
        self.writeable.store(true, Ordering::SeqCst);
    }

    pub fn set_readonly(&self) {
        self.writeable.store(false, Ordering::SeqCst);
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable.load(Ordering::SeqCst)
    }

    pub fn is_readonly(&self) -> bool {
        !self.is_writeable()
    }

    /// Sticky error from the last failed backend operation
    pub fn error(&self) -> Option<Error> {
        self.error.lock().clone()
    }

    /// Clear the sticky error (replay does this after a head resync)
    pub fn clear_error(&self) {
        *self.error.lock() = None;
    }

    fn set_error(&self, e: &Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(e.clone());
        }
    }

    pub fn set_write_error_handler(&self, handler: WriteErrorHandler) {
        *self.write_error_handler.lock() = Some(handler);
    }

    fn dispatch_write_error(&self, e: &Error) {
        self.set_error(e);
        if let Some(handler) = self.write_error_handler.lock().as_mut() {
            handler(e);
        }
    }

    /// Whether an entry can be read right now
    pub fn is_readable(&self) -> bool {
        let st = self.state.lock();
        st.read_pos < st.write_pos && self.error.lock().is_none()
    }

    /// Register interest in readability. Prefetch is synchronous here, so
    /// the callback fires immediately with the current stream status.
    pub fn wait_for_readable(&self, cb: FlushCallback) {
        match self.error() {
            Some(e) => cb(Err(e)),
            None => cb(Ok(())),
        }
    }

    /// Initialize a fresh, empty stream at `format`. Writer only; the
    /// header is not durable until `write_head`.
    pub fn create(&self, format: u32) {
        assert!(self.is_writeable(), "create on read-only journal");
        let mut st = self.state.lock();
        st.format = format;
        st.trimmed_pos = 0;
        st.expire_pos = 0;
        st.read_pos = 0;
        st.safe_pos = 0;
        st.write_pos = 0;
        st.pending.clear();
        st.flush_base = 0;
        info!(ino = self.ino, format, "created empty journal");
    }

    /// Load the durable header and discover the stream bounds.
    ///
    /// An absent header means an empty journal. For resilient streams,
    /// recovery then probes forward from the recorded write position to
    /// pick up entries appended after the last head write.
    pub fn recover(&self) -> Result<()> {
        let header = match self.store.read(&ObjectId::header(self.pool, self.ino)) {
            Ok(data) => Some(JournalHeader::from_bytes(&data)?),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let mut st = self.state.lock();
        match header {
            Some(h) => {
                debug!(
                    header_read_pos = h.read_pos,
                    header_write_pos = h.write_pos,
                    "journal header loaded"
                );
                st.format = h.format;
                st.trimmed_pos = h.trimmed_pos;
                st.expire_pos = h.expire_pos;
                // replay starts from the oldest live segment; the
                // header's read position is diagnostic only
                st.read_pos = h.expire_pos;
                st.write_pos = h.write_pos;
            }
            None => {
                debug!(ino = self.ino, "no journal header, starting empty");
                st.trimmed_pos = 0;
                st.expire_pos = 0;
                st.read_pos = 0;
                st.write_pos = 0;
            }
        }

        if st.format >= STREAM_FORMAT_RESILIENT {
            let mut pos = st.write_pos;
            loop {
                match self.read_entry_at(&st, pos) {
                    Ok((_, total)) => pos += total,
                    Err(_) => break,
                }
            }
            if pos != st.write_pos {
                info!(
                    ino = self.ino,
                    from = st.write_pos,
                    to = pos,
                    "probe found entries past the durable write position"
                );
                st.write_pos = pos;
            }
        }

        st.safe_pos = st.write_pos;
        st.flush_base = st.write_pos;
        st.pending.clear();
        info!(
            ino = self.ino,
            format = st.format,
            expire = st.expire_pos,
            read = st.read_pos,
            write = st.write_pos,
            "journal recovered"
        );
        Ok(())
    }

    /// Reload the durable header in place, keeping the local read position.
    /// Used by readers tailing a journal another writer advances.
    pub fn reread_head(&self) -> Result<()> {
        let data = self.store.read(&ObjectId::header(self.pool, self.ino))?;
        let h = JournalHeader::from_bytes(&data)?;
        let mut st = self.state.lock();
        st.format = h.format;
        st.trimmed_pos = st.trimmed_pos.max(h.trimmed_pos);
        st.expire_pos = st.expire_pos.max(h.expire_pos);
        if h.write_pos > st.write_pos {
            st.write_pos = h.write_pos;
        }
        st.safe_pos = st.safe_pos.max(h.write_pos);
        debug!(
            ino = self.ino,
            expire = st.expire_pos,
            write = st.write_pos,
            "journal head reread"
        );
        Ok(())
    }

    /// Persist positions and trim data objects wholly below the expire
    /// position. The durable write position is the safe position: entries
    /// beyond it are recovered by the forward probe.
    pub fn write_head(&self) -> Result<()> {
        assert!(self.is_writeable(), "write_head on read-only journal");
        let _io = self.io.lock();

        let (header, trim_from, trim_to) = {
            let mut st = self.state.lock();
            let object_size = self.layout.object_size;
            let trim_from = st.trimmed_pos / object_size;
            let trim_to = st.expire_pos / object_size;
            st.trimmed_pos = trim_to * object_size;
            (
                JournalHeader {
                    format: st.format,
                    trimmed_pos: st.trimmed_pos,
                    expire_pos: st.expire_pos,
                    read_pos: st.read_pos.min(st.safe_pos),
                    write_pos: st.safe_pos,
                },
                trim_from,
                trim_to,
            )
        };

        for index in trim_from..trim_to {
            let oid = ObjectId::data(self.pool, self.ino, index);
            match self.store.remove(&oid) {
                Ok(()) => debug!(%oid, "trimmed journal object"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(%oid, error = %e, "failed to trim journal object");
                }
            }
        }

        let started = Instant::now();
        let result = self
            .store
            .write(&ObjectId::header(self.pool, self.ino), 0, &header.to_bytes());
        self.metrics
            .jlat
            .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        if let Err(e) = &result {
            self.dispatch_write_error(e);
        }
        result
    }

    /// Remove every data object and the header. Tolerates objects that
    /// were already trimmed away.
    pub fn erase(&self) -> Result<()> {
        let (first, write_pos) = {
            let st = self.state.lock();
            (st.trimmed_pos / self.layout.object_size, st.write_pos)
        };
        let last = if write_pos == 0 {
            first
        } else {
            (write_pos - 1) / self.layout.object_size + 1
        };
        for index in first..last {
            let oid = ObjectId::data(self.pool, self.ino, index);
            match self.store.remove(&oid) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        match self.store.remove(&ObjectId::header(self.pool, self.ino)) {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        info!(ino = self.ino, "journal erased");
        Ok(())
    }

    /// Frame `body` into the stream and return the new write position.
    /// Buffered only; durability comes from `flush`.
    pub fn append_entry(&self, body: &[u8]) -> u64 {
        assert!(self.is_writeable(), "append to read-only journal");
        let mut st = self.state.lock();
        match st.format {
            STREAM_FORMAT_LEGACY => {
                st.pending
                    .extend_from_slice(&(body.len() as u32).to_le_bytes());
                st.pending.extend_from_slice(body);
                st.write_pos += 4 + body.len() as u64;
            }
            _ => {
                let mut framed = Vec::with_capacity(16 + body.len());
                framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
                framed.extend_from_slice(body);
                let crc = crc32c::crc32c(&framed);
                st.pending.extend_from_slice(&ENTRY_SENTINEL.to_le_bytes());
                st.pending.extend_from_slice(&framed);
                st.pending.extend_from_slice(&crc.to_le_bytes());
                st.write_pos += 8 + 4 + body.len() as u64 + 4;
            }
        }
        st.write_pos
    }

    /// Register a callback that fires once everything appended so far is
    /// durable (or has permanently failed).
    pub fn wait_for_flush(&self, cb: FlushCallback) {
        if let Some(e) = self.error() {
            cb(Err(e));
            return;
        }
        let mut st = self.state.lock();
        if st.safe_pos >= st.write_pos {
            drop(st);
            cb(Ok(()));
        } else {
            let target = st.write_pos;
            st.flush_waiters.push((target, cb));
        }
    }

    /// Write pending appends to the store, advance the safe position and
    /// fire satisfied flush callbacks in registration order.
    pub fn flush(&self) -> Result<()> {
        let _io = self.io.lock();

        let (base, buf) = {
            let mut st = self.state.lock();
            let base = st.flush_base;
            let buf = std::mem::take(&mut st.pending);
            st.flush_base = st.write_pos;
            (base, buf)
        };

        let result = if buf.is_empty() {
            Ok(())
        } else {
            let started = Instant::now();
            let r = self.write_stream(base, &buf);
            self.metrics
                .jlat
                .store(started.elapsed().as_micros() as u64, Ordering::Relaxed);
            r
        };

        match result {
            Ok(()) => {
                let waiters = {
                    let mut st = self.state.lock();
                    st.safe_pos = st.safe_pos.max(base + buf.len() as u64);
                    let safe = st.safe_pos;
                    let keep_from = st
                        .flush_waiters
                        .iter()
                        .position(|(target, _)| *target > safe)
                        .unwrap_or(st.flush_waiters.len());
                    st.flush_waiters
                        .drain(..keep_from)
                        .collect::<Vec<_>>()
                };
                for (_, cb) in waiters {
                    cb(Ok(()));
                }
                Ok(())
            }
            Err(e) => {
                let waiters = {
                    let mut st = self.state.lock();
                    std::mem::take(&mut st.flush_waiters)
                };
                for (_, cb) in waiters {
                    cb(Err(e.clone()));
                }
                self.dispatch_write_error(&e);
                Err(e)
            }
        }
    }

    fn write_stream(&self, start: u64, data: &[u8]) -> Result<()> {
        let object_size = self.layout.object_size;
        let mut pos = start;
        let mut remaining = data;
        while !remaining.is_empty() {
            let index = pos / object_size;
            let offset = pos % object_size;
            let n = ((object_size - offset) as usize).min(remaining.len());
            let oid = ObjectId::data(self.pool, self.ino, index);
            self.store.write(&oid, offset, &remaining[..n])?;
            pos += n as u64;
            remaining = &remaining[n..];
        }
        Ok(())
    }

    fn read_stream(&self, start: u64, len: usize) -> Result<Vec<u8>> {
        let object_size = self.layout.object_size;
        let mut buf = Vec::with_capacity(len);
        let mut pos = start;
        while buf.len() < len {
            let index = pos / object_size;
            let offset = (pos % object_size) as usize;
            let want = (object_size as usize - offset).min(len - buf.len());
            let oid = ObjectId::data(self.pool, self.ino, index);
            let data = self.store.read(&oid)?;
            if data.len() < offset + want {
                return Err(Error::corrupt(
                    pos,
                    format!("object {} shorter than the stream requires", oid),
                ));
            }
            buf.extend_from_slice(&data[offset..offset + want]);
            pos += want as u64;
        }
        Ok(buf)
    }

    /// De-frame one entry starting at `pos`. Returns the body and the
    /// total framed length.
    fn read_entry_at(&self, st: &StreamState, pos: u64) -> Result<(Bytes, u64)> {
        if st.format >= STREAM_FORMAT_RESILIENT {
            let prologue = self.read_stream(pos, 12)?;
            let sentinel = u64::from_le_bytes(prologue[0..8].try_into().unwrap());
            if sentinel != ENTRY_SENTINEL {
                return Err(Error::corrupt(pos, "bad entry sentinel"));
            }
            let len = u32::from_le_bytes(prologue[8..12].try_into().unwrap());
            if len > MAX_ENTRY_SIZE {
                return Err(Error::corrupt(pos, format!("entry length {} too large", len)));
            }
            let rest = self.read_stream(pos + 12, len as usize + 4)?;
            let stored_crc =
                u32::from_le_bytes(rest[len as usize..len as usize + 4].try_into().unwrap());
            let mut crc_input = Vec::with_capacity(4 + len as usize);
            crc_input.extend_from_slice(&len.to_le_bytes());
            crc_input.extend_from_slice(&rest[..len as usize]);
            if stored_crc != crc32c::crc32c(&crc_input) {
                return Err(Error::corrupt(pos, "entry checksum mismatch"));
            }
            let body = Bytes::copy_from_slice(&rest[..len as usize]);
            Ok((body, 12 + len as u64 + 4))
        } else {
            let prologue = self.read_stream(pos, 4)?;
            let len = u32::from_le_bytes(prologue[0..4].try_into().unwrap());
            if len > MAX_ENTRY_SIZE {
                return Err(Error::corrupt(pos, format!("entry length {} too large", len)));
            }
            if pos + 4 + len as u64 > st.write_pos {
                return Err(Error::corrupt(pos, "entry extends past the write head"));
            }
            let body = Bytes::from(self.read_stream(pos + 4, len as usize)?);
            Ok((body, 4 + len as u64))
        }
    }

    /// Read one entry at the read position and advance it. `Ok(None)`
    /// at the write head. Errors stick until `clear_error`.
    pub fn try_read_entry(&self) -> Result<Option<Bytes>> {
        let mut st = self.state.lock();
        if st.read_pos >= st.write_pos {
            return Ok(None);
        }
        match self.read_entry_at(&st, st.read_pos) {
            Ok((body, total)) => {
                st.read_pos += total;
                Ok(Some(body))
            }
            Err(e) => {
                drop(st);
                self.set_error(&e);
                Err(e)
            }
        }
    }

    pub fn set_read_pos(&self, pos: u64) {
        let mut st = self.state.lock();
        st.read_pos = pos;
    }

    /// Advance the expire position (monotonic)
    pub fn set_expire_pos(&self, pos: u64) {
        let mut st = self.state.lock();
        st.expire_pos = st.expire_pos.max(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use parking_lot::Mutex as PlMutex;

    fn small_layout() -> JournalLayout {
        JournalLayout { object_size: 64 }
    }

    fn writer(store: &Arc<MemoryStore>, format: u32) -> ObjectJournal {
        let j = ObjectJournal::new(
            0x200,
            1,
            Arc::<MemoryStore>::clone(store) as Arc<dyn ObjectStore>,
            small_layout(),
            format,
            Arc::new(JournalMetrics::new()),
        );
        j.set_writeable();
        j.create(format);
        j
    }

    #[test]
    fn test_append_flush_read_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let j = writer(&store, STREAM_FORMAT_RESILIENT);

        let p1 = j.append_entry(b"first");
        let p2 = j.append_entry(b"second entry spanning multiple small objects");
        assert!(p1 < p2);
        assert_eq!(j.safe_pos(), 0);

        j.flush().unwrap();
        assert_eq!(j.safe_pos(), j.write_pos());

        assert_eq!(j.try_read_entry().unwrap().unwrap().as_ref(), b"first");
        assert_eq!(
            j.try_read_entry().unwrap().unwrap().as_ref(),
            b"second entry spanning multiple small objects"
        );
        assert!(j.try_read_entry().unwrap().is_none());
    }

    #[test]
    fn test_flush_callbacks_fire_in_order() {
        let store = Arc::new(MemoryStore::new());
        let j = writer(&store, STREAM_FORMAT_RESILIENT);
        let order = Arc::new(PlMutex::new(Vec::new()));

        j.append_entry(b"a");
        let o = Arc::clone(&order);
        j.wait_for_flush(Box::new(move |r| {
            r.unwrap();
            o.lock().push(1);
        }));
        j.append_entry(b"b");
        let o = Arc::clone(&order);
        j.wait_for_flush(Box::new(move |r| {
            r.unwrap();
            o.lock().push(2);
        }));

        j.flush().unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);

        // already-safe registration fires immediately
        let o = Arc::clone(&order);
        j.wait_for_flush(Box::new(move |r| {
            r.unwrap();
            o.lock().push(3);
        }));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_recover_from_header() {
        let store = Arc::new(MemoryStore::new());
        {
            let j = writer(&store, STREAM_FORMAT_RESILIENT);
            j.append_entry(b"one");
            j.append_entry(b"two");
            j.flush().unwrap();
            j.write_head().unwrap();
        }

        let j2 = ObjectJournal::new(
            0x200,
            1,
            Arc::<MemoryStore>::clone(&store) as Arc<dyn ObjectStore>,
            small_layout(),
            STREAM_FORMAT_RESILIENT,
            Arc::new(JournalMetrics::new()),
        );
        j2.recover().unwrap();
        assert!(j2.write_pos() > 0);
        assert_eq!(j2.safe_pos(), j2.write_pos());
        assert_eq!(j2.try_read_entry().unwrap().unwrap().as_ref(), b"one");
    }

    #[test]
    fn test_recover_probes_past_stale_header() {
        let store = Arc::new(MemoryStore::new());
        let durable_write;
        {
            let j = writer(&store, STREAM_FORMAT_RESILIENT);
            j.append_entry(b"one");
            j.flush().unwrap();
            j.write_head().unwrap();
            durable_write = j.write_pos();
            // appended and flushed, but the head was never rewritten
            j.append_entry(b"two");
            j.flush().unwrap();
        }

        let j2 = ObjectJournal::new(
            0x200,
            1,
            Arc::<MemoryStore>::clone(&store) as Arc<dyn ObjectStore>,
            small_layout(),
            STREAM_FORMAT_RESILIENT,
            Arc::new(JournalMetrics::new()),
        );
        j2.recover().unwrap();
        assert!(j2.write_pos() > durable_write);
        assert_eq!(j2.try_read_entry().unwrap().unwrap().as_ref(), b"one");
        assert_eq!(j2.try_read_entry().unwrap().unwrap().as_ref(), b"two");
    }

    #[test]
    fn test_legacy_format_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let j = writer(&store, STREAM_FORMAT_LEGACY);
        j.append_entry(b"plain");
        j.flush().unwrap();
        j.write_head().unwrap();
        assert_eq!(j.stream_format(), STREAM_FORMAT_LEGACY);
        assert_eq!(j.try_read_entry().unwrap().unwrap().as_ref(), b"plain");
    }

    #[test]
    fn test_corrupt_entry_detected() {
        let store = Arc::new(MemoryStore::new());
        let j = writer(&store, STREAM_FORMAT_RESILIENT);
        j.append_entry(b"will be damaged");
        j.flush().unwrap();

        // overwrite a byte of the body in object 0
        let oid = ObjectId::data(1, 0x200, 0);
        store.write(&oid, 14, &[0xff]).unwrap();

        let err = j.try_read_entry().unwrap_err();
        assert!(err.is_corrupt());
        assert!(j.error().is_some());
        j.clear_error();
        assert!(j.error().is_none());
    }

    #[test]
    fn test_fenced_flush_reports_error() {
        let store = Arc::new(MemoryStore::new());
        let j = writer(&store, STREAM_FORMAT_RESILIENT);
        let seen = Arc::new(PlMutex::new(None));
        let s = Arc::clone(&seen);
        j.set_write_error_handler(Box::new(move |e| {
            *s.lock() = Some(e.clone());
        }));

        j.append_entry(b"doomed");
        let cb_err = Arc::new(PlMutex::new(None));
        let c = Arc::clone(&cb_err);
        j.wait_for_flush(Box::new(move |r| {
            *c.lock() = Some(r);
        }));

        store.fence();
        assert!(j.flush().unwrap_err().is_fenced());
        assert!(seen.lock().as_ref().unwrap().is_fenced());
        assert!(cb_err.lock().as_ref().unwrap().as_ref().unwrap_err().is_fenced());
    }

    #[test]
    fn test_write_head_trims_expired_objects() {
        let store = Arc::new(MemoryStore::new());
        let j = writer(&store, STREAM_FORMAT_RESILIENT);
        // several objects worth of entries
        for i in 0..12 {
            j.append_entry(format!("entry number {:02}", i).as_bytes());
        }
        j.flush().unwrap();
        j.write_head().unwrap();

        let first_obj = ObjectId::data(1, 0x200, 0);
        assert!(store.contains(&first_obj));

        // expire past the first two objects
        j.set_expire_pos(2 * small_layout().object_size + 5);
        j.write_head().unwrap();
        assert!(!store.contains(&first_obj));
        assert!(!store.contains(&ObjectId::data(1, 0x200, 1)));
        assert!(store.contains(&ObjectId::data(1, 0x200, 2)));
    }

    #[test]
    fn test_erase_removes_everything() {
        let store = Arc::new(MemoryStore::new());
        let j = writer(&store, STREAM_FORMAT_RESILIENT);
        for _ in 0..8 {
            j.append_entry(b"some entry payload");
        }
        j.flush().unwrap();
        j.write_head().unwrap();
        assert!(store.object_count() > 0);

        j.erase().unwrap();
        assert_eq!(store.object_count(), 0);
        // idempotent
        j.erase().unwrap();
    }

    #[test]
    fn test_readability_tracks_positions_and_errors() {
        let store = Arc::new(MemoryStore::new());
        let j = writer(&store, STREAM_FORMAT_RESILIENT);
        assert!(!j.is_readable());

        j.append_entry(b"entry");
        j.flush().unwrap();
        assert!(j.is_readable());

        let status = Arc::new(PlMutex::new(None));
        let s = Arc::clone(&status);
        j.wait_for_readable(Box::new(move |r| {
            *s.lock() = Some(r);
        }));
        assert!(status.lock().as_ref().unwrap().is_ok());

        j.try_read_entry().unwrap();
        assert!(!j.is_readable());
    }

    #[test]
    fn test_expire_pos_monotonic() {
        let store = Arc::new(MemoryStore::new());
        let j = writer(&store, STREAM_FORMAT_RESILIENT);
        j.set_expire_pos(100);
        j.set_expire_pos(50);
        assert_eq!(j.expire_pos(), 100);
    }
}
