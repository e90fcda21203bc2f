//! Transactions, row-level locking, and undo logging (§4.8, §4.9, §4.11).
//!
//! This crate sits directly on top of `fathom-btree`: it knows how to turn
//! a `(index_id, key, value)` mutation into a locked, logged, rollback-able
//! operation, but nothing here understands the redo log file format or how
//! indexes are discovered — those belong to the database layer above.

pub mod lock;
pub mod transaction;
pub mod undo;

pub use lock::{LockManager, Mode as LockKind};
pub use transaction::{IdAllocator, RedoSink, Transaction, TxnIdAllocator};
pub use undo::{IndexResolver, UndoLog};
