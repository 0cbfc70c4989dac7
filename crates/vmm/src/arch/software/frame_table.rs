//! An in-memory page registry.

use alloc::vec::Vec;

use crate::{MemoryAccounting, PAGE_SIZE, Page, PageRegistry, PageState, PhysicalAddress};

/// One [`Page`] per emulated physical frame, frame `n` living at `n * PAGE_SIZE`.
pub struct FrameTable {
    pages: Vec<Page>,
    free: spin::Mutex<Vec<usize>>,
    free_override: spin::Mutex<Option<usize>>,
}

impl FrameTable {
    pub fn new(frames: usize) -> Self {
        Self {
            pages: (0..frames).map(|_| Page::new()).collect(),
            // Popped from the back, so low frames go first.
            free: spin::Mutex::new((0..frames).rev().collect()),
            free_override: spin::Mutex::new(None),
        }
    }

    /// Takes a free frame.
    pub fn allocate_frame(&self) -> Option<PhysicalAddress> {
        self.free
            .lock()
            .pop()
            .map(PhysicalAddress::from_frame_index)
    }

    /// Returns an unmapped frame to the free pool.
    pub fn free_frame(&self, pa: PhysicalAddress) -> bool {
        let Some(page) = self.page(pa) else {
            return false;
        };
        if page.mapping_count() != 0 {
            return false;
        }
        page.store_state(PageState::Free);
        self.free.lock().push(pa.frame_index());
        true
    }

    /// The page at `pa`.
    pub fn page(&self, pa: PhysicalAddress) -> Option<&Page> {
        self.pages.get(pa.frame_index())
    }

    /// Overrides the free-page count reported to the daemon; `None` reports the real pool.
    pub fn set_free_pages(&self, pages: Option<usize>) {
        *self.free_override.lock() = pages;
    }

    /// Bytes of emulated physical memory.
    pub fn size(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }
}

impl PageRegistry for FrameTable {
    fn lookup_page(&self, pa: PhysicalAddress) -> Option<&Page> {
        self.page(pa)
    }
}

impl MemoryAccounting for FrameTable {
    fn free_pages(&self) -> usize {
        let forced = *self.free_override.lock();
        forced.unwrap_or_else(|| self.free.lock().len())
    }

    fn total_pages(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_low_frames_first_and_tracks_free_pages() {
        let table = FrameTable::new(4);
        assert_eq!(table.total_pages(), 4);
        assert_eq!(table.size(), 4 * PAGE_SIZE);
        assert_eq!(table.allocate_frame(), Some(PhysicalAddress::new(0)));
        assert_eq!(table.allocate_frame(), Some(PhysicalAddress::new(PAGE_SIZE)));
        assert_eq!(table.free_pages(), 2);

        table.set_free_pages(Some(0));
        assert_eq!(table.free_pages(), 0);
        table.set_free_pages(None);
        assert_eq!(table.free_pages(), 2);
    }

    #[test]
    fn mapped_frames_cannot_be_freed() {
        let table = FrameTable::new(2);
        let pa = table.allocate_frame().unwrap();
        let page = table.lookup_page(pa).unwrap();
        page.acquire_mapping();
        assert!(!table.free_frame(pa));
        page.release_mapping();
        assert!(table.free_frame(pa));
        assert_eq!(table.free_pages(), 2);
        assert!(table.lookup_page(PhysicalAddress::from_frame_index(9)).is_none());
    }
}
