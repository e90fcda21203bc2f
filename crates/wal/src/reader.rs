use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use fathom_common::{RedoRecord, Result};

use crate::record::{compute_crc, decode_payload, FRAME_HEADER_LEN};

/// Reads and iterates over redo records on disk, one file at a time.
pub struct RedoLogReader {
    file: File,
}

/// Outcome of trying to read one record.
#[derive(Debug)]
pub enum ReadResult {
    Entry(RedoRecord),
    /// Clean end of file: nothing more to read.
    Eof,
    /// A length/CRC mismatch or truncated payload — treated the same as
    /// end of file during replay (the writer never got to finish this
    /// frame before crashing), but reported separately for diagnostics.
    Corrupted { file_offset: u64 },
}

impl RedoLogReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self { file })
    }

    pub fn seek_start(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Read one record starting at the file's current position.
    pub fn read_entry(&mut self) -> Result<ReadResult> {
        let file_offset = self.file.stream_position()?;

        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(ReadResult::Eof),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let expected_crc = u32::from_le_bytes(header[4..8].try_into().unwrap());

        let mut payload = vec![0u8; len];
        match self.file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(ReadResult::Eof),
            Err(e) => return Err(e.into()),
        }

        if compute_crc(&payload) != expected_crc {
            return Ok(ReadResult::Corrupted { file_offset });
        }

        match decode_payload(&payload) {
            Ok(record) => Ok(ReadResult::Entry(record)),
            Err(_) => Ok(ReadResult::Corrupted { file_offset }),
        }
    }

    /// Scan the whole file forward, stopping at the first corrupted or
    /// incomplete trailing record (the tail a crash can leave behind).
    pub fn scan_all(&mut self) -> Result<Vec<RedoRecord>> {
        self.seek_start()?;
        let mut entries = Vec::new();
        loop {
            match self.read_entry()? {
                ReadResult::Entry(record) => entries.push(record),
                ReadResult::Eof | ReadResult::Corrupted { .. } => break,
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::RedoLogWriter;
    use fathom_common::RedoOp;
    use tempfile::NamedTempFile;

    fn rec(lsn: u64) -> RedoRecord {
        RedoRecord {
            lsn,
            op: RedoOp::Store {
                index_id: 16,
                key: lsn.to_be_bytes().to_vec(),
                value: vec![lsn as u8],
            },
        }
    }

    #[test]
    fn roundtrip_single() {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = RedoLogWriter::open(tmp.path()).unwrap();
        writer.append(&rec(1)).unwrap();
        writer.sync().unwrap();
        drop(writer);

        let mut reader = RedoLogReader::open(tmp.path()).unwrap();
        let entries = reader.scan_all().unwrap();
        assert_eq!(entries, vec![rec(1)]);
    }

    #[test]
    fn roundtrip_many() {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = RedoLogWriter::open(tmp.path()).unwrap();
        for lsn in 1..=20u64 {
            writer.append(&rec(lsn)).unwrap();
        }
        writer.sync().unwrap();
        drop(writer);

        let mut reader = RedoLogReader::open(tmp.path()).unwrap();
        let entries = reader.scan_all().unwrap();
        assert_eq!(entries.len(), 20);
        assert_eq!(entries[19].lsn, 20);
    }

    #[test]
    fn truncated_trailing_record_is_dropped() {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = RedoLogWriter::open(tmp.path()).unwrap();
        writer.append(&rec(1)).unwrap();
        writer.append(&rec(2)).unwrap();
        writer.sync().unwrap();
        drop(writer);

        let full_len = std::fs::metadata(tmp.path()).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
        file.set_len(full_len - 2).unwrap();
        drop(file);

        let mut reader = RedoLogReader::open(tmp.path()).unwrap();
        let entries = reader.scan_all().unwrap();
        assert_eq!(entries, vec![rec(1)]);
    }

    #[test]
    fn corrupted_payload_is_detected_not_panicked_on() {
        let tmp = NamedTempFile::new().unwrap();
        let mut writer = RedoLogWriter::open(tmp.path()).unwrap();
        writer.append(&rec(1)).unwrap();
        writer.sync().unwrap();
        drop(writer);

        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
            file.seek(SeekFrom::Start(FRAME_HEADER_LEN as u64)).unwrap();
            file.write_all(b"x").unwrap();
        }

        let mut reader = RedoLogReader::open(tmp.path()).unwrap();
        match reader.read_entry().unwrap() {
            ReadResult::Corrupted { .. } => {}
            other => panic!("expected corruption, got {other:?}"),
        }
    }
}
