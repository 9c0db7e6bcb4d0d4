//! Journal format migration
//!
//! Transcribes an old-format journal into a fresh journal at the other
//! per-node inode, then flips the pointer. The flip is the atomic commit
//! point: a crash anywhere before it leaves a non-zero back pointer that
//! the next recovery erases, with the front journal untouched; a crash
//! after it finds the new journal already live.
//!
//! Sequence:
//! 1. pick the back inode and persist `{front, back}`
//! 2. create the new journal at the back inode, old layout, new format
//! 3. transcribe entries one at a time, old read head to new write head
//! 4. flush the new journal to durability
//! 5. swap front and back in the pointer and persist (commit point)
//! 6. erase the old journal, clear back, persist
//! 7. install the new journal as active

use crate::journaler::ObjectJournal;
use crate::log::MetadataLog;
use crate::pointer::JournalPointer;
use crate::source::{CompletionCallback, MetadataSource};
use coralfs_common::{log_backup_ino, log_ino};
use std::sync::Arc;
use tracing::{debug, error, info};

pub(crate) fn run<S: MetadataSource>(
    log: &Arc<MetadataLog<S>>,
    mut pointer: JournalPointer,
    old_journal: &Arc<ObjectJournal>,
    completion: CompletionCallback,
) {
    assert!(!pointer.is_null(), "reformat without a resolved pointer");

    let (node, pool) = {
        let source = log.source.lock();
        (source.node_id(), source.metadata_pool())
    };

    // Persist the rewrite target first so a crash from here on is
    // recoverable by the back-journal cleanup in recovery
    let primary = log_ino(node);
    let secondary = log_backup_ino(node);
    pointer.back = if pointer.front == primary {
        secondary
    } else {
        primary
    };
    if let Err(e) = pointer.save(log.store.as_ref(), pool, node) {
        error!(error = %e, "failed to persist rewrite target");
        completion(Err(e));
        return;
    }

    info!(ino = pointer.back, "writing new journal header");
    let new_journal = Arc::new(ObjectJournal::new(
        pointer.back,
        pool,
        Arc::clone(&log.store),
        old_journal.layout(),
        log.cfg.stream_format,
        Arc::clone(&log.metrics),
    ));
    new_journal.set_writeable();
    new_journal.create(log.cfg.stream_format);
    if let Err(e) = new_journal.write_head() {
        error!(error = %e, "failed to write new journal header");
        completion(Err(e));
        return;
    }

    // Read the old journal and write every readable entry to the new one
    old_journal.set_read_pos(old_journal.expire_pos());
    let mut events_transcribed = 0u64;
    loop {
        if let Some(e) = old_journal.error() {
            error!(error = %e, "old journal got error during transcription, aborting");
            completion(Err(e));
            return;
        }
        match old_journal.try_read_entry() {
            Ok(Some(body)) => {
                new_journal.append_entry(&body);
                events_transcribed += 1;
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read entry during transcription");
                completion(Err(e));
                return;
            }
        }
    }

    info!(events_transcribed, "transcribed events, flushing new journal");
    if let Err(e) = new_journal.flush() {
        error!(error = %e, "failed to flush new journal");
        completion(Err(e));
        return;
    }
    if let Err(e) = new_journal.write_head() {
        error!(error = %e, "failed to persist new journal head");
        completion(Err(e));
        return;
    }

    // The new journal is safe; flipping the pointers commits the rewrite
    std::mem::swap(&mut pointer.front, &mut pointer.back);
    if let Err(e) = pointer.save(log.store.as_ref(), pool, node) {
        error!(error = %e, "failed to flip journal pointer");
        completion(Err(e));
        return;
    }

    info!("new journal flushed, erasing old journal");
    if let Err(e) = old_journal.erase() {
        error!(error = %e, "failed to erase old journal");
        completion(Err(e));
        return;
    }

    pointer.back = 0;
    if let Err(e) = pointer.save(log.store.as_ref(), pool, node) {
        error!(error = %e, "failed to clear back pointer");
        completion(Err(e));
        return;
    }

    debug!("journal rewrite complete, continuing with normal startup");
    new_journal.set_readonly();
    log.install_journaler(new_journal);
    completion(Ok(()));
}
