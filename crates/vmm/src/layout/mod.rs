//! Region indexing strategies.
//!
//! An address space never names its concrete region container; it holds a
//! `Box<dyn AreaLayout>` picked when the space is created. The kernel space uses the
//! simple [`AreaList`], team spaces use the [`AreaTree`]. Both keep regions ordered by base
//! address, which is what range iteration and the page scanner rely on.

mod list;
mod tree;

pub use list::AreaList;
pub use tree::AreaTree;

use crate::{Region, VirtualAddress, VmResult};

/// An ordered, non-overlapping collection of regions.
pub trait AreaLayout: Send + Sync {
    /// Short name of the strategy, for diagnostics.
    fn name(&self) -> &'static str;

    /// Number of regions stored.
    fn len(&self) -> usize;

    /// Returns true if no region is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The region with the lowest base address.
    fn first(&self) -> Option<&Region>;

    /// The region with the lowest base address strictly greater than `base`.
    fn next_after(&self, base: VirtualAddress) -> Option<&Region>;

    /// The region with the greatest base `<= address` when `less_or_equal`, otherwise the
    /// region with the least base `>= address`.
    fn find_closest(&self, address: VirtualAddress, less_or_equal: bool) -> Option<&Region>;

    /// The region whose base is exactly `base`.
    fn get(&self, base: VirtualAddress) -> Option<&Region>;

    /// Inserts `region`. Fails with [`VmError::WouldOverlap`](crate::VmError) if it
    /// intersects a stored region; the collection is unchanged on failure.
    fn insert(&mut self, region: Region) -> VmResult<()>;

    /// Removes and returns the region whose base is exactly `base`.
    fn remove(&mut self, base: VirtualAddress) -> Option<Region>;

    /// The region containing `address`.
    fn lookup(&self, address: VirtualAddress) -> Option<&Region> {
        self.find_closest(address, true)
            .filter(|region| region.contains_address(address))
    }

    /// Returns the region following `region` in base-address order.
    fn next(&self, region: &Region) -> Option<&Region> {
        self.next_after(region.base())
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::string::String;
    use alloc::vec::Vec;

    use super::*;
    use crate::{AreaId, BackingStore, PageFlags, VmError};

    fn region(base: usize, size: usize) -> Region {
        Region::mapped(
            AreaId(base as u32),
            String::from("r"),
            VirtualAddress::new(base),
            size,
            PageFlags::WRITABLE,
            BackingStore::new("anon"),
        )
    }

    fn layouts() -> Vec<Box<dyn AreaLayout>> {
        alloc::vec![Box::new(AreaList::new()), Box::new(AreaTree::new())]
    }

    fn bases(layout: &dyn AreaLayout) -> Vec<usize> {
        let mut out = Vec::new();
        let mut cursor = layout.first();
        while let Some(region) = cursor {
            out.push(region.base().as_usize());
            cursor = layout.next(region);
        }
        out
    }

    #[test]
    fn keeps_base_order_regardless_of_insert_order() {
        for mut layout in layouts() {
            for base in [0x5000, 0x1000, 0x9000, 0x3000] {
                layout.insert(region(base, 0x1000)).unwrap();
            }
            assert_eq!(bases(&*layout), [0x1000, 0x3000, 0x5000, 0x9000], "{}", layout.name());
            assert_eq!(layout.len(), 4);
        }
    }

    #[test]
    fn rejects_overlap_and_stays_unchanged() {
        for mut layout in layouts() {
            layout.insert(region(0x2000, 0x2000)).unwrap();
            assert_eq!(layout.insert(region(0x3000, 0x1000)), Err(VmError::WouldOverlap));
            assert_eq!(layout.insert(region(0x1000, 0x2000)), Err(VmError::WouldOverlap));
            assert_eq!(layout.insert(region(0x2000, 0x1000)), Err(VmError::WouldOverlap));
            assert_eq!(bases(&*layout), [0x2000], "{}", layout.name());
            layout.insert(region(0x1000, 0x1000)).unwrap();
            layout.insert(region(0x4000, 0x1000)).unwrap();
            assert_eq!(bases(&*layout), [0x1000, 0x2000, 0x4000]);
        }
    }

    #[test]
    fn find_closest_in_both_directions() {
        for mut layout in layouts() {
            layout.insert(region(0x2000, 0x1000)).unwrap();
            layout.insert(region(0x6000, 0x1000)).unwrap();

            let at = |address: usize, le: bool| {
                layout
                    .find_closest(VirtualAddress::new(address), le)
                    .map(|r| r.base().as_usize())
            };
            assert_eq!(at(0x1000, true), None);
            assert_eq!(at(0x1000, false), Some(0x2000));
            assert_eq!(at(0x2000, true), Some(0x2000));
            assert_eq!(at(0x2000, false), Some(0x2000));
            assert_eq!(at(0x4000, true), Some(0x2000));
            assert_eq!(at(0x4000, false), Some(0x6000));
            assert_eq!(at(0x8000, true), Some(0x6000));
            assert_eq!(at(0x8000, false), None);
        }
    }

    #[test]
    fn lookup_and_remove() {
        for mut layout in layouts() {
            layout.insert(region(0x2000, 0x2000)).unwrap();
            assert_eq!(
                layout.lookup(VirtualAddress::new(0x3fff)).map(|r| r.base().as_usize()),
                Some(0x2000)
            );
            assert!(layout.lookup(VirtualAddress::new(0x4000)).is_none());
            assert!(layout.get(VirtualAddress::new(0x3000)).is_none());
            assert!(layout.remove(VirtualAddress::new(0x3000)).is_none());
            let removed = layout.remove(VirtualAddress::new(0x2000)).unwrap();
            assert_eq!(removed.size(), 0x2000);
            assert!(layout.is_empty());
            assert!(layout.first().is_none());
        }
    }
}
