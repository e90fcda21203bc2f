use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use fathom_common::{Error, RedoRecord, Result};

use crate::record::encode_record;

/// Append-only writer for a single redo file. Each entry is a length-prefixed,
/// CRC32-checked frame; see [`crate::record`] for the wire format.
pub struct RedoLogWriter {
    writer: BufWriter<File>,
}

impl RedoLogWriter {
    /// Open (or create) a redo file for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Append a single redo record. Buffered — call [`Self::sync`] or
    /// [`Self::flush`] to make it durable.
    pub fn append(&mut self, record: &RedoRecord) -> Result<()> {
        let frame = encode_record(record).map_err(|e| Error::CorruptDatabase(e.to_string()))?;
        self.writer.write_all(&frame)?;
        Ok(())
    }

    /// Push buffered bytes down to the OS without fsyncing (`NoFlush`).
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Fsync the underlying file (`Sync`/`NoSync` durability modes differ
    /// only in whether this is called).
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_common::RedoOp;
    use tempfile::NamedTempFile;

    #[test]
    fn write_single_record() {
        let tmp = NamedTempFile::new().unwrap();
        let record = RedoRecord {
            lsn: 1,
            op: RedoOp::Store {
                index_id: 16,
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            },
        };

        let mut writer = RedoLogWriter::open(tmp.path()).unwrap();
        writer.append(&record).unwrap();
        writer.sync().unwrap();

        assert!(std::fs::metadata(tmp.path()).unwrap().len() > 0);
    }

    #[test]
    fn write_batch() {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = RedoLogWriter::open(tmp.path()).unwrap();
        for i in 1..=5u64 {
            writer
                .append(&RedoRecord {
                    lsn: i,
                    op: RedoOp::Clear {
                        index_id: 16,
                        key: i.to_be_bytes().to_vec(),
                    },
                })
                .unwrap();
        }
        writer.sync().unwrap();

        let mut reader = crate::reader::RedoLogReader::open(tmp.path()).unwrap();
        let entries = reader.scan_all().unwrap();
        assert_eq!(entries.len(), 5);
    }
}
