//! Sorted-vector region layout used by the kernel address space.

use alloc::vec::Vec;

use super::AreaLayout;
use crate::{Region, VirtualAddress, VmError, VmResult};

/// Regions kept in a vector sorted by base address.
///
/// The kernel space holds comparatively few, long-lived regions, so binary search over a
/// dense vector beats a tree on both lookups and memory overhead.
#[derive(Debug, Default)]
pub struct AreaList {
    regions: Vec<Region>,
}

impl AreaList {
    /// Creates an empty list.
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    /// Index of the first region whose base is `>= address`.
    fn lower_bound(&self, address: VirtualAddress) -> usize {
        self.regions.partition_point(|region| region.base() < address)
    }
}

impl AreaLayout for AreaList {
    fn name(&self) -> &'static str {
        "list"
    }

    fn len(&self) -> usize {
        self.regions.len()
    }

    fn first(&self) -> Option<&Region> {
        self.regions.first()
    }

    fn next_after(&self, base: VirtualAddress) -> Option<&Region> {
        let index = self.regions.partition_point(|region| region.base() <= base);
        self.regions.get(index)
    }

    fn find_closest(&self, address: VirtualAddress, less_or_equal: bool) -> Option<&Region> {
        if less_or_equal {
            let index = self.regions.partition_point(|region| region.base() <= address);
            index.checked_sub(1).map(|index| &self.regions[index])
        } else {
            self.regions.get(self.lower_bound(address))
        }
    }

    fn get(&self, base: VirtualAddress) -> Option<&Region> {
        self.regions
            .get(self.lower_bound(base))
            .filter(|region| region.base() == base)
    }

    fn insert(&mut self, region: Region) -> VmResult<()> {
        let index = self.lower_bound(region.base());
        if let Some(previous) = index.checked_sub(1).map(|index| &self.regions[index]) {
            if previous.end() >= region.base() {
                return Err(VmError::WouldOverlap);
            }
        }
        if let Some(next) = self.regions.get(index) {
            if next.base() <= region.end() {
                return Err(VmError::WouldOverlap);
            }
        }
        self.regions.insert(index, region);
        Ok(())
    }

    fn remove(&mut self, base: VirtualAddress) -> Option<Region> {
        let index = self.lower_bound(base);
        if self.regions.get(index)?.base() != base {
            return None;
        }
        Some(self.regions.remove(index))
    }
}
