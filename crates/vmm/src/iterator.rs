//! Cursors over the regions of an address space.
//!
//! Both iterators borrow the region layout, so they can only exist while the caller holds
//! the address space's read (or write) lock. They do no locking of their own.

use crate::{AreaLayout, Region, VirtualAddress};

/// Visits every region of an address space in ascending base order.
pub struct AreaIterator<'a> {
    layout: &'a dyn AreaLayout,
    next: Option<&'a Region>,
}

impl<'a> AreaIterator<'a> {
    pub(crate) fn new(layout: &'a dyn AreaLayout) -> Self {
        Self {
            layout,
            next: layout.first(),
        }
    }

    /// Returns true if [`next`](Iterator::next) will yield a region.
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Restarts the walk at the first region.
    pub fn rewind(&mut self) {
        self.next = self.layout.first();
    }
}

impl<'a> Iterator for AreaIterator<'a> {
    type Item = &'a Region;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.layout.next(current);
        Some(current)
    }
}

/// Visits the regions intersecting `[address, address + size - 1]` in ascending base order.
pub struct AreaRangeIterator<'a> {
    layout: &'a dyn AreaLayout,
    next: Option<&'a Region>,
    address: VirtualAddress,
    end: VirtualAddress,
}

impl<'a> AreaRangeIterator<'a> {
    pub(crate) fn new(layout: &'a dyn AreaLayout, address: VirtualAddress, size: usize) -> Self {
        let end = VirtualAddress::new(address.as_usize().saturating_add(size.saturating_sub(1)));
        let mut iter = Self {
            layout,
            next: None,
            address,
            end,
        };
        if size > 0 {
            iter.rewind();
        }
        iter
    }

    /// Returns true if [`next`](Iterator::next) will yield a region.
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Restarts the walk at the first region intersecting the range.
    ///
    /// The walk is seeded with the closest region at or below the start address; if that
    /// region ends before the range begins, the walk moves on to the following region.
    pub fn rewind(&mut self) {
        let seed = match self.layout.find_closest(self.address, true) {
            Some(region) if region.contains_address(self.address) => Some(region),
            Some(region) => self.layout.next(region),
            None => self.layout.first(),
        };
        self.next = seed.filter(|region| region.base() <= self.end);
    }
}

impl<'a> Iterator for AreaRangeIterator<'a> {
    type Item = &'a Region;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self
            .layout
            .next(current)
            .filter(|region| region.base() <= self.end);
        Some(current)
    }
}
