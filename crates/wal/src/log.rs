//! Multi-file redo log (§4.10, §6): sequentially numbered files in one
//! directory (`P.redo.N`), rotated on checkpoint, replayed in two passes —
//! a scanner pass that finds the highest committed transaction id, then an
//! applier pass that replays only committed-prefix operations.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use fathom_common::{DurabilityMode, IndexId, Lsn, RedoOp, RedoRecord, Result, TxnId};
use fathom_txn::RedoSink;

use crate::reader::RedoLogReader;
use crate::writer::RedoLogWriter;

fn file_name(base: &str, number: u64) -> String {
    format!("{base}.redo.{number}")
}

fn file_path(dir: &Path, base: &str, number: u64) -> PathBuf {
    dir.join(file_name(base, number))
}

/// Highest `P.redo.N` file number already present in `dir`, or `0` if none.
fn highest_existing_file(dir: &Path, base: &str) -> Result<u64> {
    let prefix = format!("{base}.redo.");
    let mut highest = 0u64;
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(suffix) = name.strip_prefix(&prefix) {
                if let Ok(n) = suffix.parse::<u64>() {
                    highest = highest.max(n);
                }
            }
        }
    }
    Ok(highest)
}

struct Inner {
    file_number: u64,
    writer: RedoLogWriter,
}

/// A redo log backed by a directory of sequentially numbered files. Only one
/// file is ever written to; older files are retained until the caller (the
/// checkpointer) confirms it is safe to delete them.
pub struct RedoLog {
    dir: PathBuf,
    base: String,
    inner: Mutex<Inner>,
    next_lsn: AtomicU64,
}

impl RedoLog {
    /// Open the log rooted at `dir`, continuing from the highest-numbered
    /// existing file (or starting file `1` if the directory is empty).
    pub fn open(dir: impl AsRef<Path>, base: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let mut file_number = highest_existing_file(&dir, base)?;
        if file_number == 0 {
            file_number = 1;
        }
        let path = file_path(&dir, base, file_number);
        let writer = RedoLogWriter::open(&path)?;
        debug!(?path, "opened redo log file");
        Ok(Self {
            dir,
            base: base.to_string(),
            inner: Mutex::new(Inner { file_number, writer }),
            next_lsn: AtomicU64::new(0),
        })
    }

    /// The file number currently being written to.
    pub fn active_file_number(&self) -> u64 {
        self.inner.lock().file_number
    }

    /// Restore the LSN counter after recovery so newly appended records
    /// continue the sequence rather than restarting at 1.
    pub fn set_next_lsn(&self, highest_seen: Lsn) {
        self.next_lsn.store(highest_seen, Ordering::SeqCst);
    }

    fn append_record(&self, op: RedoOp) -> Result<Lsn> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst) + 1;
        let mut inner = self.inner.lock();
        inner.writer.append(&RedoRecord { lsn, op })?;
        Ok(lsn)
    }

    /// Write an `EndFile` marker to the current file and start a new
    /// sequentially numbered one. The old file may only be deleted once the
    /// next checkpoint completes successfully (§4.12).
    pub fn open_new_file(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst) + 1;
        inner.writer.append(&RedoRecord { lsn, op: RedoOp::EndFile })?;
        inner.writer.sync()?;

        let next_number = inner.file_number + 1;
        let path = file_path(&self.dir, &self.base, next_number);
        inner.writer = RedoLogWriter::open(&path)?;
        inner.file_number = next_number;
        info!(file_number = next_number, "rotated redo log");
        Ok(next_number)
    }

    /// Delete a retired file by number. Called by the checkpointer only
    /// after the new header has been committed.
    pub fn delete_file(&self, number: u64) -> Result<()> {
        let path = file_path(&self.dir, &self.base, number);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Run the two-pass recovery protocol over every `base.redo.*` file
    /// found in `dir`, in file-number order, applying committed-prefix
    /// mutations through `visit`. Returns the highest LSN observed so the
    /// caller can resume the sequence via [`Self::set_next_lsn`].
    pub fn recover(dir: impl AsRef<Path>, base: &str, visit: &mut dyn RecoveryVisitor) -> Result<Lsn> {
        let dir = dir.as_ref();
        let highest_file = highest_existing_file(dir, base)?;
        if highest_file == 0 {
            return Ok(0);
        }

        let mut committed = HashSet::new();
        let mut highest_lsn = 0;
        for number in 1..=highest_file {
            let path = file_path(dir, base, number);
            if !path.exists() {
                continue;
            }
            let mut reader = RedoLogReader::open(&path)?;
            for record in reader.scan_all()? {
                highest_lsn = highest_lsn.max(record.lsn);
                if let RedoOp::TxnCommitFinal { txn_id } = record.op {
                    committed.insert(txn_id);
                }
            }
        }
        debug!(committed = committed.len(), highest_lsn, "redo scan pass complete");

        for number in 1..=highest_file {
            let path = file_path(dir, base, number);
            if !path.exists() {
                continue;
            }
            let mut reader = RedoLogReader::open(&path)?;
            for record in reader.scan_all()? {
                apply_if_committed(&record.op, &committed, visit)?;
            }
        }
        info!(highest_lsn, files = highest_file, "redo applier pass complete");
        Ok(highest_lsn)
    }
}

fn apply_if_committed(op: &RedoOp, committed: &HashSet<TxnId>, visit: &mut dyn RecoveryVisitor) -> Result<()> {
    match op {
        RedoOp::Store { index_id, key, value } => visit.store(*index_id, key, Some(value)),
        RedoOp::Clear { index_id, key } => visit.store(*index_id, key, None),
        RedoOp::TxnStore {
            txn_id,
            index_id,
            key,
            value,
        } => {
            if committed.contains(txn_id) {
                visit.store(*index_id, key, value.as_deref())
            } else {
                Ok(())
            }
        }
        RedoOp::Timestamp(_)
        | RedoOp::TxnEnter { .. }
        | RedoOp::TxnRollback { .. }
        | RedoOp::TxnCommit { .. }
        | RedoOp::TxnCommitFinal { .. }
        | RedoOp::TxnTrashFragmented { .. }
        | RedoOp::EndFile => Ok(()),
    }
}

impl RedoSink for RedoLog {
    fn append(&self, op: RedoOp) -> Result<Lsn> {
        self.append_record(op)
    }

    fn sync(&self, mode: DurabilityMode) -> Result<()> {
        match mode {
            DurabilityMode::Sync => self.inner.lock().writer.sync(),
            DurabilityMode::NoSync | DurabilityMode::NoFlush => self.inner.lock().writer.flush(),
            DurabilityMode::NoLog => Ok(()),
        }
    }
}

/// Applies recovered mutations to the live tree state. Implemented by the
/// database layer, which knows how to resolve an index id to a tree and
/// perform a plain (untransacted) cursor store — recovery runs single
/// threaded before any transaction can observe the database.
pub trait RecoveryVisitor {
    fn store(&mut self, index_id: IndexId, key: &[u8], value: Option<&[u8]>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct RecordingVisitor {
        applied: Vec<(IndexId, Vec<u8>, Option<Vec<u8>>)>,
    }

    impl RecoveryVisitor for RecordingVisitor {
        fn store(&mut self, index_id: IndexId, key: &[u8], value: Option<&[u8]>) -> Result<()> {
            self.applied.push((index_id, key.to_vec(), value.map(|v| v.to_vec())));
            Ok(())
        }
    }

    #[test]
    fn rotation_creates_new_sequential_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = RedoLog::open(dir.path(), "t").unwrap();
        assert_eq!(log.active_file_number(), 1);
        log.append(RedoOp::Store {
            index_id: 16,
            key: b"a".to_vec(),
            value: b"1".to_vec(),
        })
        .unwrap();
        log.open_new_file().unwrap();
        assert_eq!(log.active_file_number(), 2);
        assert!(dir.path().join("t.redo.1").exists());
        assert!(dir.path().join("t.redo.2").exists());
    }

    #[test]
    fn reopen_continues_from_highest_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = RedoLog::open(dir.path(), "t").unwrap();
            log.open_new_file().unwrap();
            log.open_new_file().unwrap();
        }
        let log = RedoLog::open(dir.path(), "t").unwrap();
        assert_eq!(log.active_file_number(), 3);
    }

    #[test]
    fn recovery_skips_uncommitted_transaction() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = RedoLog::open(dir.path(), "t").unwrap();
            log.append(RedoOp::TxnEnter { txn_id: 1 }).unwrap();
            log.append(RedoOp::TxnStore {
                txn_id: 1,
                index_id: 16,
                key: b"committed".to_vec(),
                value: Some(b"yes".to_vec()),
            })
            .unwrap();
            log.append(RedoOp::TxnCommit { txn_id: 1 }).unwrap();
            log.append(RedoOp::TxnCommitFinal { txn_id: 1 }).unwrap();

            log.append(RedoOp::TxnEnter { txn_id: 2 }).unwrap();
            log.append(RedoOp::TxnStore {
                txn_id: 2,
                index_id: 16,
                key: b"rolled_back".to_vec(),
                value: Some(b"no".to_vec()),
            })
            .unwrap();
            log.sync(DurabilityMode::Sync).unwrap();
        }

        let mut visitor = RecordingVisitor { applied: Vec::new() };
        RedoLog::recover(dir.path(), "t", &mut visitor).unwrap();

        assert_eq!(visitor.applied.len(), 1);
        assert_eq!(visitor.applied[0].1, b"committed".to_vec());
    }

    #[test]
    fn recovery_spans_rotated_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = RedoLog::open(dir.path(), "t").unwrap();
            log.append(RedoOp::Store {
                index_id: 16,
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            })
            .unwrap();
            log.open_new_file().unwrap();
            log.append(RedoOp::Store {
                index_id: 16,
                key: b"b".to_vec(),
                value: b"2".to_vec(),
            })
            .unwrap();
            log.sync(DurabilityMode::Sync).unwrap();
        }

        let mut visitor = RecordingVisitor { applied: Vec::new() };
        RedoLog::recover(dir.path(), "t", &mut visitor).unwrap();
        let keys: HashMap<_, _> = visitor
            .applied
            .into_iter()
            .map(|(_, k, v)| (k, v))
            .collect();
        assert_eq!(keys.get(&b"a".to_vec()), Some(&Some(b"1".to_vec())));
        assert_eq!(keys.get(&b"b".to_vec()), Some(&Some(b"2".to_vec())));
    }
}
