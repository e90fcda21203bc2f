//! The checkpoint protocol (§4.12) and the background thread that runs it
//! periodically.
//!
//! A checkpoint makes every write committed so far durable under a fresh
//! header, then lets the redo log preceding it be discarded. Everything that
//! must happen atomically with the epoch toggle — snapshotting which
//! transactions are still open and flipping which epoch new writes land in —
//! happens under the device's exclusive commit guard; the rest (flushing the
//! retiring epoch, building the master undo tree, writing the new header,
//! rotating the log) runs unguarded against new writers, which are already
//! landing in the new epoch and cannot observe half-finished checkpoint
//! state.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use fathom_common::Result;
use fathom_latch::ExclusiveGuard;

use crate::database::Database;

/// Starting and maximum per-attempt timeout for the checkpoint's exclusive
/// commit-latch acquisition (§4.12 step 1). Each failed attempt doubles the
/// timeout up to the cap rather than giving up, so the checkpoint is never
/// starved by a steady stream of short-lived writers but also never blocks
/// behind any single one of them indefinitely.
const COMMIT_LATCH_INITIAL_TIMEOUT: Duration = Duration::from_millis(1);
const COMMIT_LATCH_MAX_TIMEOUT: Duration = Duration::from_millis(256);

/// Acquire the device's exclusive commit latch via repeated timed trylocks,
/// backing off exponentially between attempts. The checkpointer is the only
/// caller that acquires this latch this way; every other path either blocks
/// (`exclusive_commit_guard`) or holds only the shared form.
fn acquire_commit_latch_with_backoff(db: &Database) -> ExclusiveGuard<'_, ()> {
    let mut timeout = COMMIT_LATCH_INITIAL_TIMEOUT;
    loop {
        if let Some(guard) = db.device.try_exclusive_commit_guard_timed(timeout) {
            return guard;
        }
        debug!(?timeout, "checkpoint: commit latch busy, backing off");
        timeout = (timeout * 2).min(COMMIT_LATCH_MAX_TIMEOUT);
    }
}

/// Run one checkpoint to completion.
pub(crate) fn run(db: &Arc<Database>) -> Result<()> {
    let (old_epoch, active_undo) = {
        let _excl = acquire_commit_latch_with_backoff(db);
        let old_epoch = db.epoch.load(Ordering::Acquire);
        let active_undo = collect_active_undo(db);
        db.epoch.store(1 - old_epoch, Ordering::Release);
        db.pager_manager.lock().checkpoint_start();
        (old_epoch, active_undo)
    };

    debug!(old_epoch, open_txns = active_undo.len(), "checkpoint: epoch toggled");

    let flushed = db.cache.flush_epoch(old_epoch)?;
    debug!(flushed, "checkpoint: retiring epoch flushed");

    let master_undo_id = crate::master_undo::build(
        db.device.clone(),
        db.cache.clone(),
        db.pager.clone(),
        db.epoch.clone(),
        &active_undo,
    )?;

    let retiring_file = db.redo.active_file_number();
    db.redo.open_new_file()?;

    db.commit_header(master_undo_id)?;
    db.pager_manager.lock().checkpoint_end();

    db.redo.delete_file(retiring_file)?;

    info!(master_undo_id, retiring_file, "checkpoint complete");
    Ok(())
}

fn collect_active_undo(db: &Database) -> Vec<(fathom_common::TxnId, Vec<fathom_common::UndoOp>)> {
    let mut active = db.active_txns.lock();
    active.retain(|_, weak| weak.strong_count() > 0);
    active
        .values()
        .filter_map(|weak| weak.upgrade())
        .filter_map(|txn| {
            let txn = txn.lock();
            let id = txn.id()?;
            let entries = txn.undo_entries();
            if entries.is_empty() {
                None
            } else {
                Some((id, entries.to_vec()))
            }
        })
        .collect()
}

/// Spawn the background thread that calls [`run`] every `interval`, until
/// `db.wake.stop` is set or the database is dropped.
pub(crate) fn spawn(db: Weak<Database>, interval: Duration) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        let wake = match db.upgrade() {
            Some(db) => db.wake.clone(),
            None => return,
        };

        let mut stop = wake.stop.lock();
        let timed_out = if *stop {
            false
        } else {
            wake.cv.wait_for(&mut stop, interval).timed_out()
        };
        if *stop {
            return;
        }
        drop(stop);

        if !timed_out {
            // Woken early without a stop request; nothing to do yet.
            continue;
        }

        let Some(db) = db.upgrade() else { return };
        if let Err(err) = run(&db) {
            warn!(?err, "background checkpoint failed");
        }
    })
}
