//! Host emulation of the collaborators the virtual-memory core consumes.
//!
//! Physical pages, translation maps and kernel threads are modelled in ordinary host memory so
//! that address spaces, the page scanner and the page daemon can run in tests and in hosted
//! tools. The emulated MMU is driven explicitly: accesses are recorded through a
//! [`SoftwareMapHandle`] instead of happening as a side effect of loads and stores.

mod console;
mod frame_table;
mod threads;
mod translation_map;

use std::sync::Arc;
use std::vec::Vec;

pub use console::Console;
pub use frame_table::FrameTable;
pub use threads::HostThreads;
pub use translation_map::{SoftwareMapFactory, SoftwareMapHandle, SoftwareTranslationMap};

use crate::{
    AddressSpace, PAGE_SIZE, PhysicalAddress, TeamId, VirtualAddress, VmConfig, VmError,
    VmManager, VmResult, VmServices,
};

/// Base of the emulated kernel address space.
pub const HOST_KERNEL_BASE: VirtualAddress = VirtualAddress::new(0x8000_0000);

/// Size of the emulated kernel address space.
pub const HOST_KERNEL_SIZE: usize = 0x4000_0000;

/// A [`VmManager`] wired to emulated collaborators, with direct access to each of them.
pub struct HostVm {
    pub manager: Arc<VmManager>,
    pub frames: Arc<FrameTable>,
    pub maps: Arc<SoftwareMapFactory>,
    pub threads: Arc<HostThreads>,
}

impl HostVm {
    /// Brings up a manager over `frames` emulated physical pages.
    pub fn new(config: VmConfig, frames: usize) -> VmResult<Self> {
        Console::init();
        let frames = Arc::new(FrameTable::new(frames));
        let maps = Arc::new(SoftwareMapFactory::new());
        let threads = Arc::new(HostThreads::new());
        let services = VmServices {
            pages: frames.clone(),
            memory: frames.clone(),
            maps: maps.clone(),
            threads: threads.clone(),
        };
        let manager = VmManager::new(config, services, HOST_KERNEL_BASE, HOST_KERNEL_SIZE)?;
        Ok(Self {
            manager,
            frames,
            maps,
            threads,
        })
    }

    /// The MMU handle of the translation map of `team`.
    pub fn map_handle(&self, team: TeamId) -> Option<SoftwareMapHandle> {
        self.maps.handle(team)
    }

    /// Backs every page of the region starting at `base` with a fresh frame.
    ///
    /// Returns the frames in page order.
    pub fn populate(
        &self,
        space: &AddressSpace,
        base: VirtualAddress,
    ) -> VmResult<Vec<PhysicalAddress>> {
        let pages = {
            let areas = space.read_lock()?;
            let region = areas.region(base).ok_or(VmError::NotFound)?;
            if region.is_reserved() {
                return Err(VmError::BadAddress);
            }
            region.page_count()
        };

        let mut frames = Vec::with_capacity(pages);
        for index in 0..pages {
            let pa = self.frames.allocate_frame().ok_or(VmError::NoMemory)?;
            space.map_page(base + index * PAGE_SIZE, pa)?;
            frames.push(pa);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressRestrictions, BackingStore, PageFlags, PageState};

    #[test]
    fn populate_maps_every_page_of_a_region() {
        let vm = HostVm::new(VmConfig::default().with_randomization(false), 32).unwrap();
        let space = vm
            .manager
            .create_address_space(TeamId(7), VirtualAddress::new(0x1000), 0x10_0000, false)
            .unwrap();
        let base = space
            .write_lock()
            .unwrap()
            .insert_region(
                "data",
                3 * PAGE_SIZE,
                PageFlags::WRITABLE,
                BackingStore::new("anon"),
                AddressRestrictions::any(),
            )
            .unwrap();

        let frames = vm.populate(&space, base).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(space.mapped_size(), 3 * PAGE_SIZE);
        let handle = vm.map_handle(TeamId(7)).unwrap();
        assert_eq!(handle.mapped_pages(), 3);
        for pa in frames {
            let page = vm.frames.page(pa).unwrap();
            assert_eq!(page.state(), PageState::Active);
            assert_eq!(page.mapping_count(), 1);
        }
        assert!(vm.populate(&space, VirtualAddress::new(0x9000)).is_err());
    }
}
