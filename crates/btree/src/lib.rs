//! The B+Tree node layout, fragmented value codec, and cursor (§4.5-§4.7).
//!
//! This crate is deliberately ignorant of transactions, locks, and redo —
//! it exposes a [`Tree`] that a single [`Cursor`] can traverse and mutate
//! under its own latching discipline. Everything above that (locking,
//! durability, rollback) lives in `fathom-txn`.

pub mod cursor;
pub mod frag;
pub mod free;
pub mod node;
pub mod tree;

pub use cursor::Cursor;
pub use free::Pager;
pub use tree::Tree;
