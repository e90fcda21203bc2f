//! A thin trait over the page allocator so the tree and fragment codec
//! don't need to know how callers serialize access to [`PageManager`]
//! (a plain `&mut`, a mutex guard, or a test double).

use fathom_common::PageId;
use fathom_pagestore::PageManager;

pub trait Pager {
    fn alloc(&mut self) -> PageId;
    fn delete(&mut self, id: PageId);
}

impl Pager for PageManager {
    fn alloc(&mut self) -> PageId {
        PageManager::alloc(self)
    }

    fn delete(&mut self, id: PageId) {
        PageManager::delete(self, id)
    }
}

#[cfg(test)]
pub struct VecPager {
    next: PageId,
    deleted: Vec<PageId>,
}

#[cfg(test)]
impl VecPager {
    pub fn new() -> Self {
        Self {
            next: fathom_common::FIRST_ALLOCATABLE_PAGE,
            deleted: Vec::new(),
        }
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }
}

#[cfg(test)]
impl Pager for VecPager {
    fn alloc(&mut self) -> PageId {
        let id = self.next;
        self.next += 1;
        id
    }

    fn delete(&mut self, id: PageId) {
        self.deleted.push(id);
    }
}
