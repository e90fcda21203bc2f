//! The redo log (§4.10): a directory of sequentially numbered files holding
//! variable-length logical records, a writer/reader pair for the on-disk
//! frame format, and the two-pass (scan-then-apply) recovery protocol.
//!
//! This crate knows nothing about transactions or locks — it implements
//! `fathom_txn::RedoSink` directly on [`RedoLog`] so `fathom-txn` can append
//! through the trait without depending on this crate's file format.

pub mod log;
pub mod reader;
pub mod record;
pub mod writer;

pub use log::{RecoveryVisitor, RedoLog};
pub use reader::{ReadResult, RedoLogReader};
pub use writer::RedoLogWriter;
