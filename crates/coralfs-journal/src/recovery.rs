//! Startup recovery
//!
//! Resolves the journal pointer to a journal inode and installs a
//! recovered journaler on the log. A non-zero back pointer means an
//! earlier format rewrite crashed midway: the partial back journal is
//! erased before the front journal is opened. If the front journal's
//! stream format is older than the configured one, the reformat engine
//! takes over and completes in its stead.
//!
//! Runs on a dedicated thread so the synchronous pointer and header I/O
//! never happens under the cache lock; the lock is taken only for the
//! brief source reads.

use crate::journaler::ObjectJournal;
use crate::log::MetadataLog;
use crate::pointer::JournalPointer;
use crate::reformat;
use crate::source::{CompletionCallback, MetadataSource};
use coralfs_common::log_ino;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

pub(crate) fn spawn<S: MetadataSource>(
    log: Arc<MetadataLog<S>>,
    completion: CompletionCallback,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("mdlog-recovery".into())
        .spawn(move || run(log, completion))
        .expect("failed to spawn recovery thread")
}

fn run<S: MetadataSource>(log: Arc<MetadataLog<S>>, completion: CompletionCallback) {
    assert!(log.journaler().is_none(), "recovery with a journal installed");

    let (node, pool) = {
        let source = log.source.lock();
        (source.node_id(), source.metadata_pool())
    };

    // Read the pointer object; a fresh node gets front = default inode
    let mut pointer = match JournalPointer::load(log.store.as_ref(), pool, node) {
        Ok(p) => p,
        Err(e) if e.is_not_found() => {
            let pointer = JournalPointer::new(log_ino(node));
            debug!(front = pointer.front, "initializing journal pointer");
            if let Err(e) = pointer.save(log.store.as_ref(), pool, node) {
                error!(error = %e, "failed to initialize journal pointer");
                completion(Err(e));
                return;
            }
            pointer
        }
        Err(e) => {
            error!(error = %e, "failed to read journal pointer");
            completion(Err(e));
            return;
        }
    };

    // A non-zero back pointer is a rewrite that crashed mid-flight;
    // erase the partial journal before going any further
    if pointer.back != 0 {
        info!(ino = pointer.back, "erasing orphaned back journal");
        let back = ObjectJournal::new(
            pointer.back,
            pool,
            Arc::clone(&log.store),
            log.cfg.layout,
            log.cfg.stream_format,
            Arc::clone(&log.metrics),
        );
        if let Err(e) = back.recover() {
            // recover succeeds on an absent journal; a failure here is
            // something worse, like a corrupt header we cannot handle
            error!(ino = pointer.back, error = %e, "failed to recover back journal");
            completion(Err(e));
            return;
        }
        match back.erase() {
            Ok(()) => {
                info!("erased back journal, updating journal pointer");
                pointer.back = 0;
                if let Err(e) = pointer.save(log.store.as_ref(), pool, node) {
                    error!(error = %e, "failed to clear back pointer");
                    completion(Err(e));
                    return;
                }
            }
            Err(e) => {
                error!(ino = pointer.back, error = %e, "failed to erase back journal");
            }
        }
    }

    // Read the header from the front journal
    let front = Arc::new(ObjectJournal::new(
        pointer.front,
        pool,
        Arc::clone(&log.store),
        log.cfg.layout,
        log.cfg.stream_format,
        Arc::clone(&log.metrics),
    ));
    debug!(ino = pointer.front, "waiting for journal to recover");
    if let Err(e) = front.recover() {
        error!(ino = pointer.front, error = %e, "error recovering journal");
        completion(Err(e));
        return;
    }
    debug!(ino = pointer.front, "journal recovered");

    if front.stream_format() >= log.cfg.stream_format {
        // current format, ready to go
        log.install_journaler(front);
        completion(Ok(()));
    } else {
        info!(
            ino = pointer.front,
            format = front.stream_format(),
            target = log.cfg.stream_format,
            "journal has old format, it will now be updated"
        );
        reformat::run(&log, pointer, &front, completion);
    }
}
