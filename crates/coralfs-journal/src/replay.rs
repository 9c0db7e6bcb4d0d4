//! Startup replay
//!
//! Reads committed events from the read position to the write position
//! and dispatches them to the metadata cache, rebuilding the segment
//! index as subtree maps go by. Runs on a dedicated thread; the cache
//! lock is taken per event and dropped between events so other work can
//! interleave.
//!
//! Error surface:
//! - an undecodable event aborts fatally unless `skip_corrupt_events` is
//!   configured, in which case it is skipped
//! - `NotFound` on a read-only journal means the active writer trimmed
//!   underneath us: the caller gets `Retry` and restarts
//! - a corrupt read below the expire position means the writer advanced
//!   past us: re-read the head, trim the segments we now know are dead,
//!   and retry, bounded by `max_resync_attempts`
//! - a corrupt read inside the live range is real corruption and aborts
//!   with the error

use crate::event::LogEvent;
use crate::log::MetadataLog;
use crate::source::{FatalAction, MetadataSource};
use coralfs_common::{Error, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub(crate) fn spawn<S: MetadataSource>(log: Arc<MetadataLog<S>>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("mdlog-replay".into())
        .spawn(move || {
            let result = run(&log);
            log.finish_replay(result);
        })
        .expect("failed to spawn replay thread")
}

fn run<S: MetadataSource>(log: &Arc<MetadataLog<S>>) -> Result<()> {
    let journaler = log.journaler().expect("journal not recovered");
    debug!("replay thread start");

    let mut resync_attempts = 0u32;
    loop {
        if let Some(e) = journaler.error() {
            match e {
                Error::NotFound(_) => {
                    // journal was trimmed by somebody else
                    assert!(journaler.is_readonly(), "writer lost its own objects");
                    warn!("journal trimmed underneath replay, returning retry");
                    return Err(Error::retry("journal trimmed by the active writer"));
                }
                Error::CorruptEvent { .. } if journaler.is_readonly() => {
                    if journaler.read_pos() >= journaler.expire_pos() {
                        // torn bytes inside the live range are real
                        // corruption, not a racing writer
                        error!(error = %e, "corrupt entry in the live range, aborting replay");
                        return Err(e);
                    }
                    // our read position fell behind the writer's expire
                    // position: the bytes under us were trimmed and
                    // recycled. Resync with the durable head and drop
                    // the segments that are now dead.
                    resync_attempts += 1;
                    if resync_attempts > log.cfg.max_resync_attempts {
                        warn!(resync_attempts, "giving up chasing the writer");
                        return Err(Error::retry("writer advancing faster than replay"));
                    }
                    // re-read the head; synchronous is fine here, we hold
                    // no locks and the server is only starting up
                    if let Err(head_err) = journaler.reread_head() {
                        error!(error = %head_err, "got error while re-reading head");
                        log.fatal(FatalAction::Suicide);
                        return Err(head_err);
                    }
                    {
                        let mut source = log.source.lock();
                        log.standby_trim_segments(&mut source);
                    }
                    if journaler.read_pos() < journaler.expire_pos() {
                        warn!("expire_pos is higher than read_pos, returning retry");
                        return Err(Error::retry("behind the writer's expire position"));
                    }
                    journaler.clear_error();
                    continue;
                }
                other => {
                    error!(error = %other, "replay got journal error, aborting");
                    return Err(other);
                }
            }
        }

        if journaler.read_pos() == journaler.write_pos() {
            break;
        }

        let pos = journaler.read_pos();
        let body = match journaler.try_read_entry() {
            Ok(Some(body)) => body,
            Ok(None) => continue,
            // the sticky error is classified at the top of the loop
            Err(_) => continue,
        };

        let event = match LogEvent::decode_body(pos, &body) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(
                    pos,
                    len = body.len(),
                    "unable to decode event, corrupt journal entry"
                );
                if log.cfg.skip_corrupt_events {
                    continue;
                }
                error!("aborting replay on corrupt log event");
                log.fatal(FatalAction::Suicide);
                return Err(e);
            }
        };

        // apply under the cache lock, dropped again before the next read
        {
            let mut source = log.source.lock();
            let mut st = log.state.lock();
            if event.event_type().opens_segment() {
                st.index.insert(pos);
                log.metrics
                    .seg
                    .store(st.index.len() as u64, Ordering::Relaxed);
            }
            if st.index.is_empty() {
                // no subtree map yet; nothing to anchor this event to
                debug!(pos, etype = event.event_type().as_str(), "replay skipping event before first subtree map");
            } else {
                let seg_off = st.index.current_offset().expect("segment index not empty");
                let mut event = event;
                event.set_segment(seg_off);
                let seg = st.index.get_mut(seg_off).expect("current segment exists");
                seg.num_events += 1;
                seg.end = journaler.read_pos();
                st.num_events += 1;
                let num_events = st.num_events;
                log.metrics.ev.store(num_events, Ordering::Relaxed);
                drop(st);

                debug!(pos, etype = event.event_type().as_str(), "replay event");
                if let Err(e) = source.replay(&event) {
                    error!(pos, error = %e, "metadata cache failed to replay event");
                    return Err(e);
                }
            }
        }

        log.metrics.rdpos.store(pos, Ordering::Relaxed);
    }

    assert_eq!(journaler.read_pos(), journaler.write_pos());
    info!(events = log.num_events(), "replay complete");
    log.metrics
        .expos
        .store(journaler.expire_pos(), Ordering::Relaxed);
    Ok(())
}
