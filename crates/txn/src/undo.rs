//! Per-transaction undo log: an append-only list of reverse actions, with
//! scope markers delimiting nested savepoints (§4.9).

use std::sync::Arc;

use fathom_btree::Tree;
use fathom_common::{IndexId, Result, UndoOp};

/// Resolves an index id to the live [`Tree`] a rollback needs to mutate.
/// Implemented by the database layer, which owns the registry of open
/// trees; kept as a trait here so this crate does not need to know how
/// trees are looked up or cached.
pub trait IndexResolver: Send + Sync {
    fn tree(&self, index_id: IndexId) -> Option<Arc<Tree>>;
}

#[derive(Default)]
pub struct UndoLog {
    entries: Vec<UndoOp>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, op: UndoOp) {
        self.entries.push(op);
    }

    pub fn mark(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pop and apply entries back to (not including) `mark`, in reverse
    /// order, using `BOGUS` semantics: no redo is written and no locks are
    /// touched, since the caller already owns whatever locks guard these
    /// keys.
    pub fn rollback_to(&mut self, mark: usize, resolver: &dyn IndexResolver, trash: &Arc<Tree>) -> Result<()> {
        while self.entries.len() > mark {
            let op = self.entries.pop().unwrap();
            apply_undo(&op, resolver, trash)?;
        }
        Ok(())
    }

    /// Discard everything back to `mark` without applying it — used when a
    /// scope commits upward rather than rolling back.
    pub fn truncate_to(&mut self, mark: usize) {
        self.entries.truncate(mark);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The pending entries in push order, without consuming them. Used by
    /// the checkpointer to serialize a still-open transaction's undo into
    /// the master undo log (§4.9, §4.12 step 2).
    pub fn entries(&self) -> &[UndoOp] {
        &self.entries
    }
}

fn apply_undo(op: &UndoOp, resolver: &dyn IndexResolver, trash: &Arc<Tree>) -> Result<()> {
    match op {
        UndoOp::ScopeMarker => Ok(()),
        UndoOp::InsertedEntry { index_id, key } => {
            if let Some(tree) = resolver.tree(*index_id) {
                let mut cursor = fathom_btree::Cursor::new(tree);
                cursor.find(key)?;
                cursor.store(None)?;
            }
            Ok(())
        }
        UndoOp::UpdatedOldValue {
            index_id,
            key,
            old_value,
        } => {
            if let Some(tree) = resolver.tree(*index_id) {
                let mut cursor = fathom_btree::Cursor::new(tree);
                cursor.find(key)?;
                cursor.store(Some(old_value))?;
            }
            Ok(())
        }
        UndoOp::DeletedFragmentedCopy {
            index_id,
            key,
            trash_id,
        } => resurrect_fragmented(resolver, trash, *index_id, key, *trash_id),
    }
}

/// Reverse of staging a large-value delete in the trash index (§4.7,
/// §4.9): take the descriptor back out of the trash tree and reinsert it
/// verbatim into the original leaf, so no data page is ever re-read.
fn resurrect_fragmented(
    resolver: &dyn IndexResolver,
    trash: &Arc<Tree>,
    index_id: IndexId,
    key: &[u8],
    trash_id: u64,
) -> Result<()> {
    let trash_key = trash_id.to_be_bytes();
    let mut trash_cursor = fathom_btree::Cursor::new(trash.clone());
    if trash_cursor.find(&trash_key)? {
        let descriptor = trash_cursor.get_raw_value()?;
        trash_cursor.store(None)?;
        if let Some(tree) = resolver.tree(index_id) {
            let mut cursor = fathom_btree::Cursor::new(tree);
            // The key may currently hold a value this same (rolling-back)
            // transaction wrote after the delete/update being undone here;
            // that value never committed, so free its pages outright rather
            // than stage them in the trash a second time.
            if cursor.find(key)? {
                cursor.store(None)?;
            }
            cursor.find(key)?;
            cursor.store_raw(&descriptor)?;
        }
    }
    Ok(())
}
