//! Page-level storage: fixed-size page I/O, the two-phase header commit,
//! the free-list allocator, and the in-memory node cache (§4.1-§4.3).
//!
//! This crate knows nothing about B+Tree node layout or keys — it stores
//! opaque, fixed-size byte pages and the identifiers that locate them.

pub mod device;
pub mod free_list;
pub mod node_cache;

pub use device::{DatabaseHeader, PageDevice};
pub use free_list::PageManager;
pub use node_cache::{CacheState, Node, NodeCache, NodeContent};
