//! Ties the page device, node cache, and page manager into one named index
//! (§3 "Index (tree)").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use fathom_common::{IndexId, PageId, Result};
use fathom_pagestore::{CacheState, NodeCache, PageDevice};

use crate::free::Pager;
use crate::node;

/// The live position of one cursor bound to a leaf, registered with the
/// tree so a concurrent `store` can fix up sibling cursors at the same node
/// (§4.6.2 step 3, §9 "cyclic cursor/node references").
pub struct CursorSlot {
    pub pos: Mutex<i64>,
    pub not_found_key: Mutex<Option<Vec<u8>>>,
}

impl CursorSlot {
    pub fn new(pos: i64, not_found_key: Option<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            pos: Mutex::new(pos),
            not_found_key: Mutex::new(not_found_key),
        })
    }
}

pub struct Tree {
    pub index_id: IndexId,
    pub device: Arc<PageDevice>,
    pub cache: Arc<NodeCache>,
    pub pager: Arc<Mutex<dyn Pager + Send>>,
    /// The database's current checkpoint epoch (§9 "global epoch toggle"),
    /// shared by every tree so the checkpointer can flip it once under the
    /// commit latch and have every subsequent write land in the new epoch.
    epoch: Arc<AtomicU8>,
    root: Mutex<PageId>,
    bound_leaves: Mutex<HashMap<PageId, Vec<Weak<CursorSlot>>>>,
}

impl Tree {
    pub fn new(
        index_id: IndexId,
        device: Arc<PageDevice>,
        cache: Arc<NodeCache>,
        pager: Arc<Mutex<dyn Pager + Send>>,
        epoch: Arc<AtomicU8>,
        root: PageId,
    ) -> Self {
        Self {
            index_id,
            device,
            cache,
            pager,
            epoch,
            root: Mutex::new(root),
            bound_leaves: Mutex::new(HashMap::new()),
        }
    }

    pub fn root_id(&self) -> PageId {
        *self.root.lock()
    }

    pub fn set_root_id(&self, id: PageId) {
        *self.root.lock() = id;
    }

    /// The epoch new writes to this tree should be stamped with.
    pub fn current_epoch(&self) -> u8 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Allocate and initialize an empty leaf root for a brand new index.
    pub fn create_empty(&self) -> Result<()> {
        let node = self.cache.alloc_latched(true)?;
        let id = self.pager.lock().alloc();
        {
            let mut content = node.latch.acquire_exclusive();
            node::init_leaf(&mut content.page);
            content.id = id;
            content.state = CacheState::DirtyEpoch(self.current_epoch());
        }
        self.cache.bind(&node, id);
        self.set_root_id(id);
        Ok(())
    }

    pub fn bind_leaf(&self, node_id: PageId, slot: &Arc<CursorSlot>) {
        self.bound_leaves
            .lock()
            .entry(node_id)
            .or_default()
            .push(Arc::downgrade(slot));
    }

    pub fn unbind_leaf(&self, node_id: PageId, slot: &Arc<CursorSlot>) {
        if let Some(slots) = self.bound_leaves.lock().get_mut(&node_id) {
            slots.retain(|w| !w.upgrade().is_some_or(|s| Arc::ptr_eq(&s, slot)));
        }
    }

    /// Apply the sibling fix-up rules from §4.6.2 step 3 to every other live
    /// cursor bound to `node_id`, after `inserted_index`'s key/value has
    /// just been placed at that leaf index.
    pub fn fixup_siblings_after_insert(
        &self,
        node_id: PageId,
        moving_slot: &Arc<CursorSlot>,
        inserted_index: usize,
        inserted_key: &[u8],
    ) {
        let mut bound = self.bound_leaves.lock();
        let Some(slots) = bound.get_mut(&node_id) else {
            return;
        };
        slots.retain(|w| w.upgrade().is_some());
        for weak in slots.iter() {
            let Some(slot) = weak.upgrade() else { continue };
            if Arc::ptr_eq(&slot, moving_slot) {
                continue;
            }
            let mut pos = slot.pos.lock();
            let inserted_pos = (inserted_index as i64) * 2;
            if *pos >= 0 {
                if *pos >= inserted_pos {
                    *pos += 2;
                }
                continue;
            }
            // Not-found cursor: flip to found if its pending key now matches,
            // otherwise shift the encoded insertion point if it fell at or
            // after the newly inserted slot.
            let mut nf = slot.not_found_key.lock();
            if let Some(key) = nf.as_ref() {
                if key.as_slice() == inserted_key {
                    *pos = inserted_pos;
                    *nf = None;
                    continue;
                }
            }
            drop(nf);
            let insertion_idx = node::pos_insertion_index(*pos) as i64;
            if insertion_idx >= inserted_index as i64 {
                *pos = !((insertion_idx + 1) * 2);
            }
        }
    }

    /// After a leaf splits `node_id` into itself (left half) and `sibling_id`
    /// (right half, the entries `>= mid`), move every other cursor bound to
    /// `node_id` whose position now falls in the right half across to
    /// `sibling_id`, adjusting its index relative to the new node. The
    /// acting cursor (`moving_slot`) is left untouched here; the caller
    /// relocates it itself once it knows where its own edit landed.
    pub fn migrate_across_split(&self, old_node_id: PageId, sibling_id: PageId, moving_slot: &Arc<CursorSlot>, mid: usize) {
        let mut bound = self.bound_leaves.lock();
        let Some(slots) = bound.remove(&old_node_id) else {
            return;
        };
        let mut stays = Vec::new();
        let mut migrated = Vec::new();
        for weak in slots {
            let Some(slot) = weak.upgrade() else { continue };
            if Arc::ptr_eq(&slot, moving_slot) {
                stays.push(Arc::downgrade(&slot));
                continue;
            }
            let mut pos = slot.pos.lock();
            if *pos >= 0 {
                let idx = node::pos_to_index(*pos) as i64;
                if idx >= mid as i64 {
                    *pos = (idx - mid as i64) * 2;
                    drop(pos);
                    migrated.push(Arc::downgrade(&slot));
                } else {
                    drop(pos);
                    stays.push(Arc::downgrade(&slot));
                }
            } else {
                let insertion_idx = node::pos_insertion_index(*pos) as i64;
                if insertion_idx >= mid as i64 {
                    *pos = !((insertion_idx - mid as i64) * 2);
                    drop(pos);
                    migrated.push(Arc::downgrade(&slot));
                } else {
                    drop(pos);
                    stays.push(Arc::downgrade(&slot));
                }
            }
        }
        if !stays.is_empty() {
            bound.insert(old_node_id, stays);
        }
        if !migrated.is_empty() {
            bound.entry(sibling_id).or_default().extend(migrated);
        }
    }

    pub fn fixup_siblings_after_remove(&self, node_id: PageId, moving_slot: &Arc<CursorSlot>, removed_index: usize) {
        let mut bound = self.bound_leaves.lock();
        let Some(slots) = bound.get_mut(&node_id) else {
            return;
        };
        slots.retain(|w| w.upgrade().is_some());
        for weak in slots.iter() {
            let Some(slot) = weak.upgrade() else { continue };
            if Arc::ptr_eq(&slot, moving_slot) {
                continue;
            }
            let mut pos = slot.pos.lock();
            if *pos >= 0 {
                let idx = node::pos_to_index(*pos) as i64;
                if idx > removed_index as i64 {
                    *pos -= 2;
                } else if idx == removed_index as i64 {
                    *pos = !((removed_index as i64) * 2);
                }
            }
        }
    }
}
