//! An embedded, transactional, ordered key/value storage engine: a
//! disk-resident B+Tree under a paged buffer cache, with a redo log and
//! per-transaction undo for crash recovery and rollback (§1 "Overview").
//!
//! ```no_run
//! use fathom::{Database, DatabaseConfig};
//!
//! let db = Database::open(DatabaseConfig::new("/tmp/example/data"))?;
//! let index = db.open_index("widgets")?;
//! let txn = db.new_transaction()?;
//! txn.insert(index.index_id, b"key", b"value")?;
//! txn.commit()?;
//! # Ok::<(), fathom_common::Error>(())
//! ```

mod checkpointer;
mod config;
mod database;
mod lock_file;
mod master_undo;
mod registry;
mod txn_handle;

pub use config::DatabaseConfig;
pub use database::Database;
pub use txn_handle::Txn;

pub use fathom_btree::Tree;
pub use fathom_common::{
    DurabilityMode, Error, IndexId, LockMode, LockTimeout, PageId, Result, TxnId,
};
