//! Positioned, lock-coupled traversal of a [`Tree`] (§4.6).
//!
//! A cursor's frame stack always has the leaf at the top and the root at
//! the bottom. Latches are acquired only for the duration of the micro-step
//! that needs them — between calls a cursor holds no latches at all, only
//! pins (via the node cache's ref-counted `make_unevictable`) that keep its
//! frame chain from being evicted out from under it.
//!
//! Splits are propagated synchronously within [`Cursor::store`] rather than
//! left as a pending descriptor for some later traversal to finish: because
//! the cursor already holds the full ancestor chain, it can walk straight
//! back up and insert the new separator there and then, and every other
//! cursor bound to the split leaf is relocated in the same call (see
//! `migrate_across_split` / `relocate_leaf_after_split` below). No stored
//! page is ever left mid-split across cursor calls, so there is no pending
//! per-node split descriptor to track or to hand to a concurrent reader.

use std::sync::Arc;

use fathom_common::{Error, PageId, Result};
use fathom_pagestore::{CacheState, Node};

use crate::frag;
use crate::node::{self, InsertOutcome};
use crate::tree::{CursorSlot, Tree};

struct Frame {
    node: Arc<Node>,
    /// Leaf position (possibly negative/not-found) or, for internal frames,
    /// the non-negative child index last descended through.
    pos: i64,
    /// Present only on the leaf (topmost) frame; registers this cursor's
    /// position with the tree so concurrent inserts/deletes can fix it up.
    slot: Option<Arc<CursorSlot>>,
}

enum Seek<'a> {
    First,
    Last,
    Key(&'a [u8]),
}

pub struct Cursor {
    tree: Arc<Tree>,
    frames: Vec<Frame>,
}

impl Cursor {
    pub fn new(tree: Arc<Tree>) -> Self {
        Self {
            tree,
            frames: Vec::new(),
        }
    }

    pub fn is_positioned(&self) -> bool {
        self.frames.last().is_some_and(|f| f.pos >= 0)
    }

    fn unpin_all(&mut self) {
        for frame in self.frames.drain(..) {
            if let Some(slot) = &frame.slot {
                self.tree.unbind_leaf(frame.node.id_unlatched(), slot);
            }
            self.tree.cache.make_evictable(&frame.node);
        }
    }

    pub fn reset(&mut self) {
        self.unpin_all();
    }

    fn current_node_id(node: &Arc<Node>) -> PageId {
        node.id_unlatched()
    }

    fn descend(&mut self, seek: Seek<'_>) -> Result<()> {
        self.unpin_all();
        let root = self.tree.cache.get_or_load(self.tree.root_id())?;
        self.tree.cache.make_unevictable(&root);
        let mut current = root;

        loop {
            let is_leaf = current.latch.acquire_shared().page[0] == node::NODE_TYPE_LEAF;
            if is_leaf {
                let (pos, not_found_key) = {
                    let content = current.latch.acquire_shared();
                    match &seek {
                        Seek::First => (if node::entry_count(&content.page) == 0 { !0i64 } else { 0 }, None),
                        Seek::Last => {
                            let n = node::entry_count(&content.page);
                            if n == 0 {
                                (!0i64, None)
                            } else {
                                (((n - 1) as i64) * 2, None)
                            }
                        }
                        Seek::Key(key) => {
                            let p = node::binary_search_leaf(&content.page, key);
                            if node::pos_is_found(p) {
                                (p, None)
                            } else {
                                (p, Some(key.to_vec()))
                            }
                        }
                    }
                };
                let slot = CursorSlot::new(pos, not_found_key);
                self.tree.bind_leaf(Self::current_node_id(&current), &slot);
                self.frames.push(Frame {
                    node: current,
                    pos,
                    slot: Some(slot),
                });
                return Ok(());
            }

            let child_index = {
                let content = current.latch.acquire_shared();
                match &seek {
                    Seek::First => 0,
                    Seek::Last => node::entry_count(&content.page),
                    Seek::Key(key) => node::child_index_for_key(&content.page, key),
                }
            };
            let child_id = {
                let content = current.latch.acquire_shared();
                node::child_id_at(&content.page, child_index)
            };
            let child = self.tree.cache.get_or_load(child_id)?;
            self.tree.cache.make_unevictable(&child);
            self.frames.push(Frame {
                node: current,
                pos: child_index as i64,
                slot: None,
            });
            current = child;
        }
    }

    pub fn first(&mut self) -> Result<()> {
        self.descend(Seek::First)
    }

    pub fn last(&mut self) -> Result<()> {
        self.descend(Seek::Last)
    }

    /// Returns true if `key` was found exactly.
    pub fn find(&mut self, key: &[u8]) -> Result<bool> {
        self.descend(Seek::Key(key))?;
        Ok(self.is_positioned())
    }

    pub fn find_ge(&mut self, key: &[u8]) -> Result<()> {
        if !self.find(key)? {
            if self.leaf_pos_valid() {
                // not-found already sits at the insertion point; advance to
                // it by converting the pending key position into "found at
                // the next higher entry", equivalent to one `next`.
                self.advance_from_not_found()?;
            }
        }
        Ok(())
    }

    pub fn find_gt(&mut self, key: &[u8]) -> Result<()> {
        let found = self.find(key)?;
        if found {
            self.next()?;
        } else if self.leaf_pos_valid() {
            self.advance_from_not_found()?;
        }
        Ok(())
    }

    pub fn find_le(&mut self, key: &[u8]) -> Result<()> {
        let found = self.find(key)?;
        if !found && self.leaf_pos_valid() {
            self.retreat_from_not_found()?;
        }
        Ok(())
    }

    pub fn find_lt(&mut self, key: &[u8]) -> Result<()> {
        let found = self.find(key)?;
        if found {
            self.previous()?;
        } else if self.leaf_pos_valid() {
            self.retreat_from_not_found()?;
        }
        Ok(())
    }

    fn leaf_pos_valid(&self) -> bool {
        self.frames.last().is_some()
    }

    fn advance_from_not_found(&mut self) -> Result<()> {
        // The not-found position already encodes the insertion point, which
        // is exactly the first entry greater than `key` — so this is just a
        // found-state flip onto that same index, no descent needed.
        let frame = self.frames.last_mut().unwrap();
        let idx = node::pos_insertion_index(frame.pos);
        let count = {
            let content = frame.node.latch.acquire_shared();
            node::entry_count(&content.page)
        };
        if idx >= count {
            self.next_leaf_subtree()?;
        } else {
            frame.pos = (idx as i64) * 2;
            *frame.slot.as_ref().unwrap().pos.lock() = frame.pos;
        }
        Ok(())
    }

    fn retreat_from_not_found(&mut self) -> Result<()> {
        let frame = self.frames.last_mut().unwrap();
        let idx = node::pos_insertion_index(frame.pos);
        if idx == 0 {
            self.previous_leaf_subtree()?;
        } else {
            frame.pos = ((idx - 1) as i64) * 2;
            *frame.slot.as_ref().unwrap().pos.lock() = frame.pos;
        }
        Ok(())
    }

    pub fn get_key(&self) -> Result<Vec<u8>> {
        let frame = self.frames.last().ok_or(Error::InvalidPosition)?;
        let content = frame.node.latch.acquire_shared();
        if node::pos_is_found(frame.pos) {
            Ok(node::retrieve_leaf_key(&content.page, frame.pos))
        } else if node::entry_count(&content.page) == 0 {
            Err(Error::InvalidPosition)
        } else {
            Ok(node::retrieve_leaf_key(&content.page, frame.pos))
        }
    }

    pub fn get_value(&self) -> Result<Vec<u8>> {
        let raw = self.get_raw_value()?;
        if frag::is_fragmented(&raw) {
            frag::decode_value(&self.tree.device, &raw)
        } else {
            Ok(raw[1..].to_vec())
        }
    }

    /// Read the current entry's value exactly as stored on the leaf page,
    /// tag byte included, without decoding a fragmented value's data pages.
    /// Used to move a value between trees (e.g. the fragmented-value trash
    /// index, §4.7) without touching the pages it references.
    pub fn get_raw_value(&self) -> Result<Vec<u8>> {
        let frame = self.frames.last().ok_or(Error::InvalidPosition)?;
        if !node::pos_is_found(frame.pos) {
            return Err(Error::InvalidPosition);
        }
        let content = frame.node.latch.acquire_shared();
        Ok(node::retrieve_leaf_value(&content.page, frame.pos))
    }

    pub fn get_entry(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        Ok((self.get_key()?, self.get_value()?))
    }

    /// Move forward one entry. Returns `false` (and leaves the position
    /// undefined) if already at the last entry.
    pub fn next(&mut self) -> Result<bool> {
        loop {
            let frame = self.frames.last().ok_or(Error::InvalidPosition)?;
            let (count, next_idx) = {
                let content = frame.node.latch.acquire_shared();
                let count = node::entry_count(&content.page);
                let idx = if node::pos_is_found(frame.pos) {
                    node::pos_to_index(frame.pos) + 1
                } else {
                    node::pos_insertion_index(frame.pos)
                };
                (count, idx)
            };
            if next_idx < count {
                let frame = self.frames.last_mut().unwrap();
                frame.pos = (next_idx as i64) * 2;
                *frame.slot.as_ref().unwrap().pos.lock() = frame.pos;
                return Ok(true);
            }
            if !self.next_leaf_subtree()? {
                return Ok(false);
            }
            return Ok(true);
        }
    }

    pub fn previous(&mut self) -> Result<bool> {
        loop {
            let frame = self.frames.last().ok_or(Error::InvalidPosition)?;
            let prev_idx = {
                let content = frame.node.latch.acquire_shared();
                if node::pos_is_found(frame.pos) {
                    node::pos_to_index(frame.pos) as i64 - 1
                } else {
                    node::pos_insertion_index(frame.pos) as i64 - 1
                }
            };
            if prev_idx >= 0 {
                let frame = self.frames.last_mut().unwrap();
                frame.pos = prev_idx * 2;
                *frame.slot.as_ref().unwrap().pos.lock() = frame.pos;
                return Ok(true);
            }
            if !self.previous_leaf_subtree()? {
                return Ok(false);
            }
            return Ok(true);
        }
    }

    /// Amortized `move(n)`: there is no shortcut around visiting every
    /// intervening entry once lock-coupling is in play, so this simply
    /// calls `next`/`previous` `n` times (§9, Open Question 1).
    pub fn move_by(&mut self, n: i64) -> Result<bool> {
        if n >= 0 {
            for _ in 0..n {
                if !self.next()? {
                    return Ok(false);
                }
            }
        } else {
            for _ in 0..(-n) {
                if !self.previous()? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Pop leaf and ancestor frames until one has a right sibling child,
    /// then descend to that subtree's first leaf.
    fn next_leaf_subtree(&mut self) -> Result<bool> {
        let leaf = self.frames.pop().unwrap();
        if let Some(slot) = &leaf.slot {
            self.tree.unbind_leaf(Self::current_node_id(&leaf.node), slot);
        }
        self.tree.cache.make_evictable(&leaf.node);

        while let Some(top) = self.frames.last() {
            let (count, next_child) = {
                let content = top.node.latch.acquire_shared();
                (node::entry_count(&content.page), top.pos + 1)
            };
            if next_child as usize <= count {
                let top = self.frames.last_mut().unwrap();
                top.pos = next_child;
                let parent = top.node.clone();
                let child_index = top.pos as usize;
                let child_id = {
                    let content = parent.latch.acquire_shared();
                    node::child_id_at(&content.page, child_index)
                };
                let child = self.tree.cache.get_or_load(child_id)?;
                self.tree.cache.make_unevictable(&child);
                self.descend_leftmost(child)?;
                return Ok(true);
            }
            let popped = self.frames.pop().unwrap();
            self.tree.cache.make_evictable(&popped.node);
        }
        Ok(false)
    }

    fn previous_leaf_subtree(&mut self) -> Result<bool> {
        let leaf = self.frames.pop().unwrap();
        if let Some(slot) = &leaf.slot {
            self.tree.unbind_leaf(Self::current_node_id(&leaf.node), slot);
        }
        self.tree.cache.make_evictable(&leaf.node);

        while let Some(top) = self.frames.last() {
            if top.pos > 0 {
                let top = self.frames.last_mut().unwrap();
                top.pos -= 1;
                let parent = top.node.clone();
                let child_index = top.pos as usize;
                let child_id = {
                    let content = parent.latch.acquire_shared();
                    node::child_id_at(&content.page, child_index)
                };
                let child = self.tree.cache.get_or_load(child_id)?;
                self.tree.cache.make_unevictable(&child);
                self.descend_rightmost(child)?;
                return Ok(true);
            }
            let popped = self.frames.pop().unwrap();
            self.tree.cache.make_evictable(&popped.node);
        }
        Ok(false)
    }

    fn descend_leftmost(&mut self, mut current: Arc<Node>) -> Result<()> {
        loop {
            let is_leaf = current.latch.acquire_shared().page[0] == node::NODE_TYPE_LEAF;
            if is_leaf {
                let pos = if { node::entry_count(&current.latch.acquire_shared().page) } == 0 {
                    !0i64
                } else {
                    0
                };
                let slot = CursorSlot::new(pos, None);
                self.tree.bind_leaf(Self::current_node_id(&current), &slot);
                self.frames.push(Frame { node: current, pos, slot: Some(slot) });
                return Ok(());
            }
            let child_id = { node::child_id_at(&current.latch.acquire_shared().page, 0) };
            self.frames.push(Frame { node: current.clone(), pos: 0, slot: None });
            let child = self.tree.cache.get_or_load(child_id)?;
            self.tree.cache.make_unevictable(&child);
            current = child;
        }
    }

    fn descend_rightmost(&mut self, mut current: Arc<Node>) -> Result<()> {
        loop {
            let is_leaf = current.latch.acquire_shared().page[0] == node::NODE_TYPE_LEAF;
            if is_leaf {
                let n = { node::entry_count(&current.latch.acquire_shared().page) };
                let pos = if n == 0 { !0i64 } else { ((n - 1) as i64) * 2 };
                let slot = CursorSlot::new(pos, None);
                self.tree.bind_leaf(Self::current_node_id(&current), &slot);
                self.frames.push(Frame { node: current, pos, slot: Some(slot) });
                return Ok(());
            }
            let last_index = { node::entry_count(&current.latch.acquire_shared().page) };
            let child_id = { node::child_id_at(&current.latch.acquire_shared().page, last_index) };
            self.frames.push(Frame { node: current.clone(), pos: last_index as i64, slot: None });
            let child = self.tree.cache.get_or_load(child_id)?;
            self.tree.cache.make_unevictable(&child);
            current = child;
        }
    }

    /// Insert, update, or (when `value` is `None`) delete at the cursor's
    /// current position (§4.6.2). Splits propagate synchronously up the
    /// held ancestor chain; a root split grows the tree by one level.
    pub fn store(&mut self, value: Option<&[u8]>) -> Result<()> {
        if self.frames.is_empty() {
            return Err(Error::InvalidPosition);
        }

        match value {
            None => self.delete_current(),
            Some(v) => self.upsert_current(v),
        }
    }

    /// Store already-encoded leaf-value bytes verbatim, bypassing
    /// [`frag::encode_value`]. Used to move a fragmented value's descriptor
    /// between trees (e.g. out of the trash index on rollback, §4.9)
    /// without re-fragmenting or touching its data pages.
    pub fn store_raw(&mut self, encoded_value: &[u8]) -> Result<()> {
        self.upsert_encoded(encoded_value, true).map(|_| ())
    }

    /// Like [`Cursor::store`] with `Some(value)`, but does not free an
    /// overwritten fragmented value's pages; instead returns its raw
    /// (still-encoded) bytes so the caller can stage them in the trash
    /// index, the same way a transactional delete does (§4.9, §4.11).
    pub fn store_without_freeing(&mut self, value: &[u8]) -> Result<Option<Vec<u8>>> {
        let encoded_value = {
            let mut pager = self.tree.pager.lock();
            frag::encode_value(&mut *pager, &self.tree.device, value)?
        };
        self.upsert_encoded(&encoded_value, false)
    }

    fn delete_current(&mut self) -> Result<()> {
        self.remove_entry(true).map(|_| ())
    }

    /// Remove the current entry but leave any fragment pages it references
    /// untouched, returning the raw (still-encoded) value so the caller can
    /// stage it elsewhere before the pages are actually freed (§4.7, §4.9).
    /// Errors if the cursor is not positioned on a found entry.
    pub fn remove_without_freeing(&mut self) -> Result<Vec<u8>> {
        self.remove_entry(false)?.ok_or(Error::InvalidPosition)
    }

    fn remove_entry(&mut self, free_fragments: bool) -> Result<Option<Vec<u8>>> {
        let leaf_idx = self.frames.len() - 1;
        let frame = &self.frames[leaf_idx];
        if !node::pos_is_found(frame.pos) {
            return Ok(None);
        }
        let node_id = Self::current_node_id(&frame.node);
        let removed_index = node::pos_to_index(frame.pos);

        let mut content = frame.node.latch.acquire_exclusive();
        let raw_value = node::retrieve_leaf_value(&content.page, frame.pos);
        if free_fragments && frag::is_fragmented(&raw_value) {
            let mut pager = self.tree.pager.lock();
            frag::free_fragment_pages(&mut *pager, &self.tree.device, &raw_value)?;
        }
        node::remove_leaf_entry(&mut content.page, frame.pos);
        mark_dirty(&mut content, self.tree.current_epoch());
        drop(content);

        let slot = self.frames[leaf_idx].slot.clone().unwrap();
        self.tree
            .fixup_siblings_after_remove(node_id, &slot, removed_index);

        self.frames[leaf_idx].pos = !((removed_index as i64) * 2);
        *slot.pos.lock() = self.frames[leaf_idx].pos;
        Ok(Some(raw_value))
    }

    fn upsert_current(&mut self, value: &[u8]) -> Result<()> {
        let encoded_value = {
            let mut pager = self.tree.pager.lock();
            frag::encode_value(&mut *pager, &self.tree.device, value)?
        };
        self.upsert_encoded(&encoded_value, true).map(|_| ())
    }

    /// Shared insert/update path for already-encoded leaf-value bytes.
    /// `free_old_fragment` controls whether an overwritten fragmented
    /// value's pages are freed immediately or left for the caller (the old
    /// raw bytes are returned either way when an entry was overwritten).
    fn upsert_encoded(&mut self, encoded_value: &[u8], free_old_fragment: bool) -> Result<Option<Vec<u8>>> {
        let leaf_idx = self.frames.len() - 1;
        let node_id = Self::current_node_id(&self.frames[leaf_idx].node);
        let pos = self.frames[leaf_idx].pos;

        let key = if node::pos_is_found(pos) {
            let content = self.frames[leaf_idx].node.latch.acquire_shared();
            node::retrieve_leaf_key(&content.page, pos)
        } else {
            self.frames[leaf_idx]
                .slot
                .as_ref()
                .unwrap()
                .not_found_key
                .lock()
                .clone()
                .ok_or(Error::InvalidPosition)?
        };

        let leaf_node = self.frames[leaf_idx].node.clone();
        let mut content = leaf_node.latch.acquire_exclusive();

        if node::pos_is_found(pos) {
            let old_value = node::retrieve_leaf_value(&content.page, pos);
            if free_old_fragment && frag::is_fragmented(&old_value) {
                let mut pager = self.tree.pager.lock();
                frag::free_fragment_pages(&mut *pager, &self.tree.device, &old_value)?;
            }
            match node::update_leaf_entry(&mut content.page, pos, &key, encoded_value) {
                InsertOutcome::Fit => {
                    mark_dirty(&mut content, self.tree.current_epoch());
                    drop(content);
                    return Ok(Some(old_value));
                }
                InsertOutcome::NeedsSplit => {
                    let idx = node::pos_to_index(pos);
                    let split = node::split_leaf_with_new_entry(&mut content.page, idx, &key, encoded_value);
                    let mid = node::entry_count(&content.page);
                    mark_dirty(&mut content, self.tree.current_epoch());
                    drop(content);
                    // `update_leaf_entry` removes the old entry before
                    // reinserting it, so the net entry count (and every
                    // other cursor's index into it) is unchanged by the
                    // update itself; only the cross-node migration below
                    // needs to run.
                    let (sibling_id, sibling_node) = self.propagate_split(leaf_idx, node_id, split)?;
                    // A root split prepends a new root frame, shifting every
                    // existing frame down by one; the leaf frame is always
                    // last regardless of how many ancestor splits happened.
                    let leaf_idx = self.frames.len() - 1;
                    let slot = self.frames[leaf_idx].slot.clone().unwrap();
                    self.tree.migrate_across_split(node_id, sibling_id, &slot, mid);
                    self.relocate_leaf_after_split(leaf_idx, node_id, sibling_id, sibling_node, &slot, idx, mid);
                    return Ok(Some(old_value));
                }
            }
        }

        let insertion_index = node::pos_insertion_index(pos);
        match node::insert_leaf_entry(&mut content.page, insertion_index, &key, encoded_value) {
            InsertOutcome::Fit => {
                mark_dirty(&mut content, self.tree.current_epoch());
                drop(content);
                let slot = self.frames[leaf_idx].slot.clone().unwrap();
                self.tree
                    .fixup_siblings_after_insert(node_id, &slot, insertion_index, &key);
                self.frames[leaf_idx].pos = (insertion_index as i64) * 2;
                *slot.pos.lock() = self.frames[leaf_idx].pos;
                Ok(None)
            }
            InsertOutcome::NeedsSplit => {
                let split = node::split_leaf_with_new_entry(&mut content.page, insertion_index, &key, encoded_value);
                let mid = node::entry_count(&content.page);
                mark_dirty(&mut content, self.tree.current_epoch());
                drop(content);
                let slot = self.frames[leaf_idx].slot.clone().unwrap();
                self.tree
                    .fixup_siblings_after_insert(node_id, &slot, insertion_index, &key);
                let (sibling_id, sibling_node) = self.propagate_split(leaf_idx, node_id, split)?;
                let leaf_idx = self.frames.len() - 1;
                self.tree.migrate_across_split(node_id, sibling_id, &slot, mid);
                self.relocate_leaf_after_split(leaf_idx, node_id, sibling_id, sibling_node, &slot, insertion_index, mid);
                Ok(None)
            }
        }
    }

    /// Insert the new sibling's separator into the parent, recursing
    /// upward through every ancestor frame that also splits; grows the
    /// tree height by one if the root itself splits.
    /// Returns the immediate (leaf-level, for the outermost call) sibling's
    /// id and pinned node, so the caller can reposition its own frame and
    /// fix up any other cursor bound to the node that just split.
    fn propagate_split(
        &mut self,
        child_frame_idx: usize,
        child_node_id: PageId,
        split: node::SplitResult,
    ) -> Result<(PageId, Arc<Node>)> {
        let sibling_node = self.tree.cache.alloc_latched(true)?;
        let sibling_id = self.tree.pager.lock().alloc();
        {
            let mut c = sibling_node.latch.acquire_exclusive();
            c.page.copy_from_slice(&split.sibling_page);
            c.id = sibling_id;
            c.state = CacheState::DirtyEpoch(self.tree.current_epoch());
        }
        self.tree.cache.bind(&sibling_node, sibling_id);

        if child_frame_idx == 0 {
            // The root split: allocate a new root with two children.
            let new_root = self.tree.cache.alloc_latched(false)?;
            let new_root_id = self.tree.pager.lock().alloc();
            {
                let mut c = new_root.latch.acquire_exclusive();
                node::init_internal(&mut c.page, child_node_id);
                node::insert_separator(&mut c.page, 0, &split.midpoint_key, sibling_id);
                c.id = new_root_id;
                c.state = CacheState::DirtyEpoch(self.tree.current_epoch());
            }
            self.tree.cache.bind(&new_root, new_root_id);
            self.tree.set_root_id(new_root_id);
            self.tree.cache.make_unevictable(&new_root);
            self.frames.insert(
                0,
                Frame {
                    node: new_root,
                    pos: 0,
                    slot: None,
                },
            );
            return Ok((sibling_id, sibling_node));
        }

        let parent_idx = child_frame_idx - 1;
        let parent_node = self.frames[parent_idx].node.clone();
        let mut content = parent_node.latch.acquire_exclusive();
        let separator_index = self.frames[parent_idx].pos as usize;
        match node::insert_separator(&mut content.page, separator_index, &split.midpoint_key, sibling_id) {
            InsertOutcome::Fit => {
                mark_dirty(&mut content, self.tree.current_epoch());
                drop(content);
            }
            InsertOutcome::NeedsSplit => {
                let parent_id = Self::current_node_id(&parent_node);
                let parent_split = node::split_internal_with_new_entry(
                    &mut content.page,
                    separator_index,
                    &split.midpoint_key,
                    sibling_id,
                );
                mark_dirty(&mut content, self.tree.current_epoch());
                drop(content);
                self.propagate_split(parent_idx, parent_id, parent_split)?;
            }
        }
        Ok((sibling_id, sibling_node))
    }

    /// After a leaf split completes, move the cursor's own leaf frame to
    /// wherever the entry it just acted on actually landed, and rebind its
    /// registered slot accordingly (§4.6.2 step 3, §4.6.3). Other cursors
    /// bound to the split leaf are handled by
    /// [`Tree::migrate_across_split`], called separately.
    fn relocate_leaf_after_split(
        &mut self,
        leaf_idx: usize,
        old_node_id: PageId,
        sibling_id: PageId,
        sibling_node: Arc<Node>,
        slot: &Arc<CursorSlot>,
        acted_index: usize,
        mid: usize,
    ) {
        if acted_index < mid {
            self.frames[leaf_idx].pos = (acted_index as i64) * 2;
        } else {
            self.tree.unbind_leaf(old_node_id, slot);
            self.tree.cache.make_evictable(&self.frames[leaf_idx].node);
            self.tree.cache.make_unevictable(&sibling_node);
            self.tree.bind_leaf(sibling_id, slot);
            self.frames[leaf_idx].node = sibling_node;
            self.frames[leaf_idx].pos = ((acted_index - mid) as i64) * 2;
        }
        *slot.pos.lock() = self.frames[leaf_idx].pos;
    }

    pub fn copy(&self) -> Cursor {
        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in &self.frames {
            self.tree.cache.make_unevictable(&frame.node);
            let slot = frame.slot.as_ref().map(|s| {
                let new_slot = CursorSlot::new(*s.pos.lock(), s.not_found_key.lock().clone());
                self.tree.bind_leaf(Self::current_node_id(&frame.node), &new_slot);
                new_slot
            });
            frames.push(Frame {
                node: frame.node.clone(),
                pos: frame.pos,
                slot,
            });
        }
        Cursor {
            tree: self.tree.clone(),
            frames,
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.unpin_all();
    }
}

fn mark_dirty(content: &mut fathom_pagestore::NodeContent, epoch: u8) {
    if matches!(content.state, CacheState::Clean) {
        content.state = CacheState::DirtyEpoch(epoch);
    }
}

/// A stable id read from a node's current content without needing a
/// standalone accessor on [`fathom_pagestore::Node`].
trait NodeIdExt {
    fn id_unlatched(&self) -> PageId;
}

impl NodeIdExt for Node {
    fn id_unlatched(&self) -> PageId {
        self.latch.acquire_shared().id
    }
}
