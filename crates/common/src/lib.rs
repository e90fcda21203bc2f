use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Core identifiers
// ---------------------------------------------------------------------------

/// Logical page identifier. Zero is reserved (never a valid allocated page).
pub type PageId = u64;

/// Identifier of an index (tree). Low values are reserved for internal trees.
pub type IndexId = u64;

/// Transaction identifier, assigned lazily on a transaction's first write.
pub type TxnId = u64;

/// Redo log sequence number (1-based; 0 means "none written yet").
pub type Lsn = u64;

/// Registry index: maps index name -> (index id, root page id).
pub const REGISTRY_INDEX_ID: IndexId = 0;
/// Registry-key-map index: maps index id -> index name, the reverse of the registry.
pub const REGISTRY_KEY_MAP_INDEX_ID: IndexId = 1;
/// Fragmented-value trash: holds page chains of deleted large values pending
/// either checkpoint (final free) or rollback (resurrection).
pub const FRAGMENTED_TRASH_INDEX_ID: IndexId = 2;
/// Master undo log: the checkpoint-time snapshot of every still-open
/// transaction's undo entries, rebuilt fresh each checkpoint and referenced
/// only by the header's `master_undo_id` (never registered by name).
pub const MASTER_UNDO_INDEX_ID: IndexId = 3;
/// First id available for user-created indexes.
pub const FIRST_USER_INDEX_ID: IndexId = 16;

/// Header pages are the first two pages of the data file (A/B copies).
pub const HEADER_PAGE_A: PageId = 0;
pub const HEADER_PAGE_B: PageId = 1;
/// First page id available for tree nodes and free-list pages.
pub const FIRST_ALLOCATABLE_PAGE: PageId = 2;

/// Magic value stamped into every header payload; changes only on an
/// incompatible on-disk format revision.
pub const ENCODING_VERSION: u32 = 0x01333C6D;

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

/// Default page size. Configurable per `DatabaseConfig`, bounded by
/// `MIN_PAGE_SIZE`/`MAX_PAGE_SIZE`.
pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;
/// Size, in bytes, of each header copy within the 4 KiB header region.
pub const HEADER_REGION_SIZE: usize = 4096;

/// A page image. Heap-allocated since page size is a runtime parameter.
pub type Page = Box<[u8]>;

/// Return a zeroed page of the given size.
pub fn empty_page(size: usize) -> Page {
    vec![0u8; size].into_boxed_slice()
}

pub fn is_valid_page_size(size: usize) -> bool {
    size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size)
}

// ---------------------------------------------------------------------------
// Durability and lock modes (configuration enumerations, §6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// Commit fsyncs the redo log before returning. Default.
    Sync,
    /// Commit writes the redo log but skips fsync.
    NoSync,
    /// Commit buffers the redo log only.
    NoFlush,
    /// No redo is emitted at all. Reserved for the internal bogus/rollback txn.
    NoLog,
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Sync
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    ReadCommitted,
    RepeatableRead,
    UpgradableRead,
    Unsafe,
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::UpgradableRead
    }
}

/// A lock timeout. Negative is infinite, zero is try-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout(pub i64);

impl LockTimeout {
    pub const INFINITE: LockTimeout = LockTimeout(-1);
    pub const TRY_ONLY: LockTimeout = LockTimeout(0);

    pub fn is_infinite(self) -> bool {
        self.0 < 0
    }

    pub fn is_try_only(self) -> bool {
        self.0 == 0
    }

    pub fn as_duration(self) -> Option<std::time::Duration> {
        if self.0 < 0 {
            None
        } else {
            Some(std::time::Duration::from_nanos(self.0 as u64))
        }
    }
}

impl Default for LockTimeout {
    fn default() -> Self {
        LockTimeout(std::time::Duration::from_secs(1).as_nanos() as i64)
    }
}

/// Key identifying a row-level lock: an index plus a key within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub index_id: IndexId,
    pub key: Vec<u8>,
}

impl LockKey {
    pub fn new(index_id: IndexId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            index_id,
            key: key.into(),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "index={} key={}",
            self.index_id,
            hex_preview(&self.key)
        )
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    let take = bytes.len().min(16);
    let mut s = String::with_capacity(take * 2);
    for b in &bytes[..take] {
        s.push_str(&format!("{:02x}", b));
    }
    if bytes.len() > take {
        s.push('…');
    }
    s
}

// ---------------------------------------------------------------------------
// Redo records — the unit of change appended to the redo log (§3, §4.10)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RedoOp {
    /// Wall-clock marker, written periodically so replay can bound recovery time.
    Timestamp(u64),
    /// Untransacted store (bogus txn / internal trees).
    Store {
        index_id: IndexId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Untransacted delete.
    Clear { index_id: IndexId, key: Vec<u8> },
    /// First redo record of a transaction, recording its id.
    TxnEnter { txn_id: TxnId },
    /// A transacted store or delete (`value: None` means delete).
    TxnStore {
        txn_id: TxnId,
        index_id: IndexId,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    /// Transaction rolled back; undone entries follow from the undo log.
    TxnRollback { txn_id: TxnId },
    /// Transaction committed (not yet durable past this point).
    TxnCommit { txn_id: TxnId },
    /// Transaction's commit is now the final, durable word on its changes.
    TxnCommitFinal { txn_id: TxnId },
    /// A transacted delete of a large value moved its chain to the trash index.
    TxnTrashFragmented { txn_id: TxnId, trash_id: u64 },
    /// Marks the logical end of a redo log file (precedes rotation).
    EndFile,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedoRecord {
    pub lsn: Lsn,
    pub op: RedoOp,
}

// ---------------------------------------------------------------------------
// Undo records — per-transaction reverse actions (§3, §4.9)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum UndoOp {
    /// Reverse of an insert: delete the key.
    InsertedEntry { index_id: IndexId, key: Vec<u8> },
    /// Reverse of an update: restore the old value.
    UpdatedOldValue {
        index_id: IndexId,
        key: Vec<u8>,
        old_value: Vec<u8>,
    },
    /// Reverse of a large-value delete: resurrect the trashed page chain.
    DeletedFragmentedCopy {
        index_id: IndexId,
        key: Vec<u8>,
        trash_id: u64,
    },
    /// Delimits a nested scope (savepoint) within the undo log.
    ScopeMarker,
}

// ---------------------------------------------------------------------------
// Errors (§7)
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no node could be evicted under the cache's capacity")]
    CacheExhausted,

    #[error("lock acquisition timed out on {0}")]
    LockTimeout(LockKey),

    #[error("deadlock detected acquiring a lock on {0}")]
    Deadlock(LockKey),

    #[error("cursor operation requires a defined position")]
    InvalidPosition,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database corrupt: {0}")]
    CorruptDatabase(String),

    #[error("value of {len} bytes exceeds the maximum encodable length {max}")]
    LargeValue { len: usize, max: usize },

    #[error("database is closed: {cause}")]
    Closed { cause: String },
}

pub type Result<T> = std::result::Result<T, Error>;
