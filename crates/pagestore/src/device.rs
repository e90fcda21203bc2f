//! Fixed-size page I/O on a single data file, plus the two-phase commit of
//! the header pages (§4.1).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use std::time::Duration;

use crc32fast::Hasher;
use parking_lot::RwLock;

use fathom_common::{
    Error, Page, PageId, Result, ENCODING_VERSION, FIRST_ALLOCATABLE_PAGE, HEADER_PAGE_A,
    HEADER_PAGE_B,
};
use fathom_latch::{ExclusiveGuard, Latch, SharedGuard};

/// The decoded contents of a header page, plus the serialized page-manager
/// free-list state that rides alongside it in the same page (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub encoding_version: u32,
    pub root_page_id: PageId,
    pub master_undo_id: PageId,
    pub next_txn_id: u64,
    pub active_redo_log_id: u64,
    pub free_list_state: Vec<u8>,
}

const FIXED_HEADER_LEN: usize = 4 + 8 + 8 + 8 + 8; // up to active_redo_log_id
const SEQ_LEN: usize = 8;
const CRC_LEN: usize = 4;

impl DatabaseHeader {
    pub fn empty() -> Self {
        Self {
            encoding_version: ENCODING_VERSION,
            root_page_id: 0,
            master_undo_id: 0,
            next_txn_id: 1,
            active_redo_log_id: 1,
            free_list_state: Vec::new(),
        }
    }

    fn encode(&self, page_size: usize, sequence: u64) -> Page {
        let mut buf = vec![0u8; page_size];
        buf[0..4].copy_from_slice(&self.encoding_version.to_le_bytes());
        buf[4..12].copy_from_slice(&self.root_page_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.master_undo_id.to_le_bytes());
        buf[20..28].copy_from_slice(&self.next_txn_id.to_le_bytes());
        buf[28..36].copy_from_slice(&self.active_redo_log_id.to_le_bytes());

        let fl_len = self.free_list_state.len() as u32;
        let fl_start = FIXED_HEADER_LEN + 4;
        buf[FIXED_HEADER_LEN..fl_start].copy_from_slice(&fl_len.to_le_bytes());
        let fl_end = fl_start + self.free_list_state.len();
        buf[fl_start..fl_end].copy_from_slice(&self.free_list_state);

        let seq_start = page_size - SEQ_LEN - CRC_LEN;
        buf[seq_start..seq_start + SEQ_LEN].copy_from_slice(&sequence.to_le_bytes());

        let crc = {
            let mut hasher = Hasher::new();
            hasher.update(&buf[..seq_start + SEQ_LEN]);
            hasher.finalize()
        };
        buf[seq_start + SEQ_LEN..].copy_from_slice(&crc.to_le_bytes());

        buf.into_boxed_slice()
    }

    fn decode(buf: &[u8]) -> Result<(Self, u64)> {
        let page_size = buf.len();
        let seq_start = page_size - SEQ_LEN - CRC_LEN;
        let expected_crc = {
            let mut hasher = Hasher::new();
            hasher.update(&buf[..seq_start + SEQ_LEN]);
            hasher.finalize()
        };
        let stored_crc = u32::from_le_bytes(buf[seq_start + SEQ_LEN..].try_into().unwrap());
        if stored_crc != expected_crc {
            return Err(Error::CorruptDatabase("header checksum mismatch".into()));
        }

        let encoding_version = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if encoding_version != ENCODING_VERSION {
            return Err(Error::CorruptDatabase(format!(
                "unsupported encoding version {:#x}",
                encoding_version
            )));
        }
        let root_page_id = u64::from_le_bytes(buf[4..12].try_into().unwrap());
        let master_undo_id = u64::from_le_bytes(buf[12..20].try_into().unwrap());
        let next_txn_id = u64::from_le_bytes(buf[20..28].try_into().unwrap());
        let active_redo_log_id = u64::from_le_bytes(buf[28..36].try_into().unwrap());

        let fl_start = FIXED_HEADER_LEN + 4;
        let fl_len =
            u32::from_le_bytes(buf[FIXED_HEADER_LEN..fl_start].try_into().unwrap()) as usize;
        if fl_start + fl_len > seq_start {
            return Err(Error::CorruptDatabase("free-list state overruns header".into()));
        }
        let free_list_state = buf[fl_start..fl_start + fl_len].to_vec();
        let sequence = u64::from_le_bytes(buf[seq_start..seq_start + SEQ_LEN].try_into().unwrap());

        Ok((
            Self {
                encoding_version,
                root_page_id,
                master_undo_id,
                next_txn_id,
                active_redo_log_id,
                free_list_state,
            },
            sequence,
        ))
    }
}

/// Word-addressable page storage over a single file, with a two-slot header
/// region for atomic header commits (§4.1).
pub struct PageDevice {
    path: PathBuf,
    file: RwLock<File>,
    page_size: usize,
    /// Sequence number of the currently-active header slot; incremented on
    /// every successful commit.
    sequence: AtomicU64,
    active_slot: AtomicU64,
    /// Serializes commits against everything else; many concurrent page
    /// writes may proceed under a shared hold of this lock. A `Latch` rather
    /// than a bare `RwLock` so the checkpointer can back off with a timed
    /// trylock instead of blocking indefinitely behind a stream of writers.
    commit_lock: Latch<()>,
}

impl PageDevice {
    /// Open (creating if absent) a data file at `path` with the given page
    /// size, returning the device and the most recently committed header.
    pub fn open(path: &Path, page_size: usize) -> Result<(Self, DatabaseHeader)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut device = Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            page_size,
            sequence: AtomicU64::new(0),
            active_slot: AtomicU64::new(0),
            commit_lock: Latch::new(()),
        };

        let header = device.load_or_init_header()?;
        Ok((device, header))
    }

    fn file_len(&self) -> Result<u64> {
        Ok(self.file.read().metadata()?.len())
    }

    fn load_or_init_header(&mut self) -> Result<DatabaseHeader> {
        let needed = 2 * self.page_size as u64;
        if self.file_len()? < needed {
            self.file.write().set_len(needed)?;
            let header = DatabaseHeader::empty();
            self.write_header_slot(HEADER_PAGE_A, &header, 1)?;
            self.sequence.store(1, Ordering::SeqCst);
            self.active_slot.store(0, Ordering::SeqCst);
            return Ok(header);
        }

        let a = self.read_header_slot(HEADER_PAGE_A);
        let b = self.read_header_slot(HEADER_PAGE_B);
        match (a, b) {
            (Ok((ha, sa)), Ok((hb, sb))) => {
                if sa >= sb {
                    self.sequence.store(sa, Ordering::SeqCst);
                    self.active_slot.store(0, Ordering::SeqCst);
                    Ok(ha)
                } else {
                    self.sequence.store(sb, Ordering::SeqCst);
                    self.active_slot.store(1, Ordering::SeqCst);
                    Ok(hb)
                }
            }
            (Ok((ha, sa)), Err(_)) => {
                self.sequence.store(sa, Ordering::SeqCst);
                self.active_slot.store(0, Ordering::SeqCst);
                Ok(ha)
            }
            (Err(_), Ok((hb, sb))) => {
                self.sequence.store(sb, Ordering::SeqCst);
                self.active_slot.store(1, Ordering::SeqCst);
                Ok(hb)
            }
            (Err(e), Err(_)) => Err(e),
        }
    }

    fn read_header_slot(&self, slot_page: PageId) -> Result<(DatabaseHeader, u64)> {
        let mut buf = vec![0u8; self.page_size];
        {
            let mut file = self.file.write();
            file.seek(SeekFrom::Start(slot_page * self.page_size as u64))?;
            file.read_exact(&mut buf)?;
        }
        DatabaseHeader::decode(&buf)
    }

    fn write_header_slot(&self, slot_page: PageId, header: &DatabaseHeader, sequence: u64) -> Result<()> {
        let buf = header.encode(self.page_size, sequence);
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(slot_page * self.page_size as u64))?;
        file.write_all(&buf)?;
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the page at `id` into a freshly allocated buffer.
    pub fn read(&self, id: PageId) -> Result<Page> {
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(id * self.page_size as u64))?;
        file.read_exact(&mut buf)?;
        Ok(buf.into_boxed_slice())
    }

    /// Write a page. Lazily extends the file if `id` is beyond the current
    /// end of file.
    pub fn write(&self, id: PageId, page: &[u8]) -> Result<()> {
        debug_assert_eq!(page.len(), self.page_size);
        let mut file = self.file.write();
        let needed = (id + 1) * self.page_size as u64;
        if file.metadata()?.len() < needed {
            file.set_len(needed)?;
        }
        file.seek(SeekFrom::Start(id * self.page_size as u64))?;
        file.write_all(page)?;
        Ok(())
    }

    /// fsync all file contents written so far.
    pub fn sync_data(&self) -> Result<()> {
        self.file.read().sync_all()?;
        Ok(())
    }

    /// The next page id past the current end of file — used by the page
    /// manager to grow the device when the free list is empty.
    pub fn page_count(&self) -> Result<PageId> {
        Ok(self.file_len()? / self.page_size as u64)
    }

    /// Shared commit lock: many writers may hold this concurrently.
    pub fn shared_commit_guard(&self) -> SharedGuard<'_, ()> {
        self.commit_lock.acquire_shared()
    }

    /// Exclusive commit lock: serializes a commit against every writer.
    /// Blocks indefinitely; used internally by [`PageDevice::commit`], which
    /// only ever holds it for a single header swap.
    pub fn exclusive_commit_guard(&self) -> ExclusiveGuard<'_, ()> {
        self.commit_lock.acquire_exclusive()
    }

    /// Non-blocking, timed attempt at the exclusive commit lock. The
    /// checkpointer is the only caller of this form (§4.12 step 1): it backs
    /// off and retries with a growing timeout rather than blocking behind an
    /// unbounded stream of concurrent writers holding the shared guard.
    pub fn try_exclusive_commit_guard_timed(&self, timeout: Duration) -> Option<ExclusiveGuard<'_, ()>> {
        self.commit_lock.try_acquire_exclusive_timed(timeout)
    }

    /// Two-phase commit of a new header: fsync data pages, obtain the new
    /// header payload from `prepare`, write it into the inactive slot,
    /// fsync, then flip the active slot. A crash between the slot write and
    /// the flip leaves the previous slot — and therefore the previous
    /// committed state — intact.
    pub fn commit(&self, prepare: impl FnOnce() -> DatabaseHeader) -> Result<()> {
        let _guard = self.exclusive_commit_guard();

        self.sync_data()?;

        let header = prepare();
        let next_sequence = self.sequence.load(Ordering::SeqCst) + 1;
        let inactive_slot = 1 - self.active_slot.load(Ordering::SeqCst);
        let inactive_page = if inactive_slot == 0 { HEADER_PAGE_A } else { HEADER_PAGE_B };

        self.write_header_slot(inactive_page, &header, next_sequence)?;
        self.file.read().sync_all()?;

        self.active_slot.store(inactive_slot, Ordering::SeqCst);
        self.sequence.store(next_sequence, Ordering::SeqCst);
        Ok(())
    }

    pub fn first_allocatable_page(&self) -> PageId {
        FIRST_ALLOCATABLE_PAGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_and_reopens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let (device, header) = PageDevice::open(&path, 4096).unwrap();
        assert_eq!(header.root_page_id, 0);
        drop(device);

        let (_device2, header2) = PageDevice::open(&path, 4096).unwrap();
        assert_eq!(header2, header);
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let (device, _header) = PageDevice::open(&path, 4096).unwrap();

        let mut page = vec![0u8; 4096];
        page[0] = 0xAB;
        device.write(5, &page).unwrap();

        let read_back = device.read(5).unwrap();
        assert_eq!(read_back[0], 0xAB);
    }

    #[test]
    fn commit_survives_crash_between_slots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let (device, _header) = PageDevice::open(&path, 4096).unwrap();
            device
                .commit(|| {
                    let mut h = DatabaseHeader::empty();
                    h.root_page_id = 42;
                    h
                })
                .unwrap();
        }

        let (_device, header) = PageDevice::open(&path, 4096).unwrap();
        assert_eq!(header.root_page_id, 42);
    }

    #[test]
    fn second_commit_flips_slot_again() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let (device, _header) = PageDevice::open(&path, 4096).unwrap();

        device
            .commit(|| {
                let mut h = DatabaseHeader::empty();
                h.root_page_id = 1;
                h
            })
            .unwrap();
        device
            .commit(|| {
                let mut h = DatabaseHeader::empty();
                h.root_page_id = 2;
                h
            })
            .unwrap();

        drop(device);
        let (_device2, header) = PageDevice::open(&path, 4096).unwrap();
        assert_eq!(header.root_page_id, 2);
    }

    #[test]
    fn corrupt_header_is_rejected_when_both_slots_bad() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let (_device, _header) = PageDevice::open(&path, 4096).unwrap();
        }
        // Corrupt both header slots directly.
        {
            let mut file = OpenOptions::new().write(true).open(&path).unwrap();
            let garbage = vec![0xFFu8; 4096 * 2];
            file.write_all(&garbage).unwrap();
        }
        let result = PageDevice::open(&path, 4096);
        assert!(result.is_err());
    }
}
