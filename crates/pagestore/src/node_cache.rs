//! The in-memory pool of fixed-size node buffers (§4.3).
//!
//! Eviction is clock-style LRU: the least-recently-used node is scanned
//! first, dirty nodes are written back through the page device before their
//! buffer is repurposed, and the cache never evicts down to fewer than two
//! resident nodes (split protocol headroom). Promotion to most-recently-used
//! only happens for clean nodes, so a steady stream of writes doesn't
//! thrash the position of pages the checkpointer is about to flush anyway.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use fathom_common::{Error, PageId, Result};
use fathom_latch::Latch;

use crate::device::PageDevice;

/// Which commit epoch (if any) a node's buffer has been modified in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Clean,
    DirtyEpoch(u8),
}

/// The latched content of one node buffer.
pub struct NodeContent {
    pub id: PageId,
    pub state: CacheState,
    pub page: Box<[u8]>,
}

impl NodeContent {
    fn blank(page_size: usize) -> Self {
        Self {
            id: 0,
            state: CacheState::Clean,
            page: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        !matches!(self.state, CacheState::Clean)
    }
}

/// A cached node: a latch around its content plus a stable slot index used
/// for LRU bookkeeping.
pub struct Node {
    pub latch: Latch<NodeContent>,
    slot: usize,
}

impl Node {
    pub fn slot(&self) -> usize {
        self.slot
    }
}

struct Inner {
    arena: Vec<Arc<Node>>,
    /// LRU order by slot index; front = least recently used.
    lru: Vec<usize>,
    id_to_slot: HashMap<PageId, usize>,
    /// Reference-counted pins: a slot with a nonzero count is never
    /// evicted. Counted rather than boolean so two cursors bound to the
    /// same node don't let one cursor's release evict it out from under
    /// the other.
    pin_counts: HashMap<usize, usize>,
}

pub struct NodeCache {
    device: Arc<PageDevice>,
    capacity: usize,
    page_size: usize,
    inner: Mutex<Inner>,
}

impl NodeCache {
    pub fn new(device: Arc<PageDevice>, capacity: usize) -> Self {
        let page_size = device.page_size();
        Self {
            device,
            capacity: capacity.max(2),
            page_size,
            inner: Mutex::new(Inner {
                arena: Vec::new(),
                lru: Vec::new(),
                id_to_slot: HashMap::new(),
                pin_counts: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn resident_count(&self) -> usize {
        self.inner.lock().id_to_slot.len()
    }

    /// Allocate a fresh, privately-owned buffer, exclusively latched for the
    /// duration of this call, then handed back unbound (id 0). The caller
    /// must populate it and call [`NodeCache::bind`] before any other
    /// thread can observe it, since it is not yet reachable through
    /// `id_to_slot`.
    pub fn alloc_latched(&self, evictable: bool) -> Result<Arc<Node>> {
        let mut inner = self.inner.lock();

        let slot = if inner.arena.len() < self.capacity {
            let slot = inner.arena.len();
            let node = Arc::new(Node {
                latch: Latch::new(NodeContent::blank(self.page_size)),
                slot,
            });
            inner.arena.push(node);
            slot
        } else {
            self.evict_locked(&mut inner)?
        };

        inner.pin_counts.remove(&slot);
        if !evictable {
            inner.pin_counts.insert(slot, 1);
        }

        Ok(inner.arena[slot].clone())
    }

    /// Scan from the LRU end for a slot that can be repurposed. Never
    /// considers the two most-recently-used slots, nor pinned ones, so the
    /// split protocol always has headroom.
    fn evict_locked(&self, inner: &mut Inner) -> Result<usize> {
        let keep_recent = 2usize.min(inner.lru.len());
        let scan_end = inner.lru.len().saturating_sub(keep_recent);

        for i in 0..scan_end {
            let slot = inner.lru[i];
            if inner.pin_counts.contains_key(&slot) {
                continue;
            }
            let node = inner.arena[slot].clone();
            let Some(mut content) = node.latch.try_acquire_exclusive() else {
                continue;
            };

            if content.is_dirty() {
                // Flush outside the cache lock's critical section would be
                // ideal, but we already hold only this node's own latch
                // (not the management lock) while writing: the management
                // lock only guarded the LRU scan up to this point and is
                // still held, so keep the write brief — a single page.
                self.device.write(content.id, &content.page)?;
            }

            let old_id = content.id;
            content.id = 0;
            content.state = CacheState::Clean;
            drop(content);

            inner.id_to_slot.remove(&old_id);
            inner.lru.remove(i);
            return Ok(slot);
        }

        Err(Error::CacheExhausted)
    }

    /// Bind a freshly-populated node to `id`, making it visible to future
    /// lookups, and place it at the MRU end.
    pub fn bind(&self, node: &Arc<Node>, id: PageId) {
        let mut inner = self.inner.lock();
        inner.id_to_slot.insert(id, node.slot);
        inner.lru.retain(|&s| s != node.slot);
        inner.lru.push(node.slot);
    }

    /// Look up a resident node by id without loading from disk.
    pub fn lookup(&self, id: PageId) -> Option<Arc<Node>> {
        let inner = self.inner.lock();
        inner.id_to_slot.get(&id).map(|&slot| inner.arena[slot].clone())
    }

    /// Fetch a node by id, loading it from the page device on a miss.
    pub fn get_or_load(&self, id: PageId) -> Result<Arc<Node>> {
        if let Some(node) = self.lookup(id) {
            self.used(&node);
            return Ok(node);
        }

        let node = self.alloc_latched(true)?;
        // Bind immediately under a placeholder id so concurrent loaders of
        // the same page block on this node's own latch rather than racing
        // to load it twice.
        {
            let mut guard = node.latch.acquire_exclusive();
            guard.id = id;
            self.bind(&node, id);
            let page = self.device.read(id)?;
            guard.page = page;
            guard.state = CacheState::Clean;
        }
        Ok(node)
    }

    /// Promote `node` to the MRU end, but only when it is clean — dirty
    /// nodes stay in roughly FIFO order so the checkpointer sees a smooth,
    /// bounded write workload instead of a bursty one.
    pub fn used(&self, node: &Arc<Node>) {
        let Some(content) = node.latch.try_acquire_shared() else {
            return;
        };
        if content.is_dirty() {
            return;
        }
        drop(content);

        let mut inner = self.inner.lock();
        inner.lru.retain(|&s| s != node.slot);
        inner.lru.push(node.slot);
    }

    /// Release one pin on `node`. Only once every pinning caller has
    /// released does the slot become eligible for eviction again.
    pub fn make_evictable(&self, node: &Arc<Node>) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.pin_counts.get_mut(&node.slot) {
            *count -= 1;
            if *count == 0 {
                inner.pin_counts.remove(&node.slot);
            }
        }
    }

    pub fn make_unevictable(&self, node: &Arc<Node>) {
        *self.inner.lock().pin_counts.entry(node.slot).or_insert(0) += 1;
    }

    /// Repurpose `node`'s buffer for immediate reuse: clear its id and
    /// content and place it at the LRU head so the very next
    /// `alloc_latched` picks it up without scanning.
    pub fn delete_node(&self, node: &Arc<Node>) {
        let mut content = node.latch.acquire_exclusive();
        let old_id = content.id;
        content.id = 0;
        content.state = CacheState::Clean;
        drop(content);

        let mut inner = self.inner.lock();
        inner.id_to_slot.remove(&old_id);
        inner.lru.retain(|&s| s != node.slot);
        inner.lru.insert(0, node.slot);
    }

    /// Write back every currently-dirty node whose state matches `epoch`,
    /// marking each clean as it is flushed. Used by the checkpointer
    /// (§4.12 step 4).
    pub fn flush_epoch(&self, epoch: u8) -> Result<usize> {
        let nodes: Vec<Arc<Node>> = {
            let inner = self.inner.lock();
            inner.arena.clone()
        };

        let mut flushed = 0;
        for node in nodes {
            let mut content = node.latch.acquire_exclusive();
            if content.id == 0 {
                continue;
            }
            if let CacheState::DirtyEpoch(e) = content.state {
                if e == epoch {
                    self.device.write(content.id, &content.page)?;
                    content.state = CacheState::Clean;
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_cache(capacity: usize) -> (tempfile::TempDir, NodeCache) {
        let dir = tempdir().unwrap();
        let (device, _header) = PageDevice::open(&dir.path().join("t.db"), 512).unwrap();
        let cache = NodeCache::new(Arc::new(device), capacity);
        (dir, cache)
    }

    #[test]
    fn alloc_and_bind_is_resident() {
        let (_dir, cache) = new_cache(4);
        let node = cache.alloc_latched(true).unwrap();
        cache.bind(&node, 10);
        assert!(cache.lookup(10).is_some());
        assert_eq!(cache.resident_count(), 1);
    }

    #[test]
    fn get_or_load_round_trips_through_device() {
        let (_dir, cache) = new_cache(4);
        let node = cache.get_or_load(2).unwrap();
        {
            let mut c = node.latch.acquire_exclusive();
            c.page[0] = 0x42;
            c.state = CacheState::DirtyEpoch(0);
        }
        cache.flush_epoch(0).unwrap();
        cache.delete_node(&node);

        let reloaded = cache.get_or_load(2).unwrap();
        assert_eq!(reloaded.latch.acquire_shared().page[0], 0x42);
    }

    #[test]
    fn never_evicts_below_two_resident() {
        let (_dir, cache) = new_cache(2);
        let a = cache.alloc_latched(true).unwrap();
        cache.bind(&a, 1);
        let b = cache.alloc_latched(true).unwrap();
        cache.bind(&b, 2);

        // Capacity is full and both nodes are within the two-node headroom:
        // any further alloc must fail rather than evict one of them.
        let result = cache.alloc_latched(true);
        assert!(matches!(result, Err(Error::CacheExhausted)));
    }

    #[test]
    fn pinned_nodes_are_never_evicted() {
        let (_dir, cache) = new_cache(3);
        let pinned = cache.alloc_latched(false).unwrap();
        cache.bind(&pinned, 1);
        let b = cache.alloc_latched(true).unwrap();
        cache.bind(&b, 2);
        let c = cache.alloc_latched(true).unwrap();
        cache.bind(&c, 3);
        drop(b);
        drop(c);

        // Only one unpinned, non-recent candidate exists (slot for id 2),
        // and with capacity 3 the two-node headroom still blocks eviction
        // down to a single resident node.
        let result = cache.alloc_latched(true);
        assert!(result.is_err() || cache.lookup(1).is_some());
    }

    #[test]
    fn dirty_nodes_do_not_get_promoted_by_used() {
        let (_dir, cache) = new_cache(4);
        let node = cache.get_or_load(2).unwrap();
        node.latch.acquire_exclusive().state = CacheState::DirtyEpoch(0);
        cache.used(&node);
        // No panic / no crash is the main assertion here: promotion is a
        // best-effort optimization, not a correctness requirement.
    }
}
