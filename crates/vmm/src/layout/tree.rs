//! Ordered-tree region layout used by team address spaces.

use alloc::collections::BTreeMap;
use core::ops::Bound::{Excluded, Included, Unbounded};

use super::AreaLayout;
use crate::{Region, VirtualAddress, VmError, VmResult};

/// Regions kept in a B-tree keyed by base address.
///
/// Team spaces see frequent region churn (heap growth, mmap/munmap), so insertions and
/// removals must stay logarithmic.
#[derive(Debug, Default)]
pub struct AreaTree {
    regions: BTreeMap<VirtualAddress, Region>,
}

impl AreaTree {
    /// Creates an empty tree.
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }
}

impl AreaLayout for AreaTree {
    fn name(&self) -> &'static str {
        "tree"
    }

    fn len(&self) -> usize {
        self.regions.len()
    }

    fn first(&self) -> Option<&Region> {
        self.regions.values().next()
    }

    fn next_after(&self, base: VirtualAddress) -> Option<&Region> {
        self.regions
            .range((Excluded(base), Unbounded))
            .next()
            .map(|(_, region)| region)
    }

    fn find_closest(&self, address: VirtualAddress, less_or_equal: bool) -> Option<&Region> {
        let found = if less_or_equal {
            self.regions.range(..=address).next_back()
        } else {
            self.regions.range((Included(address), Unbounded)).next()
        };
        found.map(|(_, region)| region)
    }

    fn get(&self, base: VirtualAddress) -> Option<&Region> {
        self.regions.get(&base)
    }

    fn insert(&mut self, region: Region) -> VmResult<()> {
        let collides_below = self
            .find_closest(region.base(), true)
            .is_some_and(|previous| previous.end() >= region.base());
        let collides_above = self
            .find_closest(region.base(), false)
            .is_some_and(|next| next.base() <= region.end());
        if collides_below || collides_above {
            return Err(VmError::WouldOverlap);
        }
        self.regions.insert(region.base(), region);
        Ok(())
    }

    fn remove(&mut self, base: VirtualAddress) -> Option<Region> {
        self.regions.remove(&base)
    }
}
