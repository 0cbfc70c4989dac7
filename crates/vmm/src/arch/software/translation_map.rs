//! Translation maps emulated in memory.
//!
//! Each map is a sorted table of page entries. The "hardware" status bits are driven from the
//! outside through a [`SoftwareMapHandle`], which shares the table with the map owned by the
//! address space.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    PAGE_SIZE, PageFlags, PhysicalAddress, TeamId, TranslationMap, TranslationMapFactory,
    VirtualAddress, VmError, VmResult,
};

#[derive(Debug, Clone, Copy)]
struct Entry {
    pa: PhysicalAddress,
    flags: PageFlags,
}

#[derive(Debug, Default)]
struct Table {
    entries: BTreeMap<VirtualAddress, Entry>,
    failing: BTreeSet<VirtualAddress>,
    flushes: usize,
}

impl Table {
    fn present_pages(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.flags.is_present())
            .count()
    }
}

/// A translation map backed by an in-memory table.
///
/// Unmapping clears the present bit but keeps `ACCESSED` and `MODIFIED` until they are cleared
/// explicitly, like a page-table entry whose status bits are read back after a shootdown.
pub struct SoftwareTranslationMap {
    table: Arc<spin::Mutex<Table>>,
}

impl TranslationMap for SoftwareTranslationMap {
    fn query(&self, va: VirtualAddress) -> VmResult<(PhysicalAddress, PageFlags)> {
        let table = self.table.lock();
        let va = va.page_base();
        if table.failing.contains(&va) {
            return Err(VmError::BadAddress);
        }
        Ok(table
            .entries
            .get(&va)
            .map_or((PhysicalAddress::new(0), PageFlags::empty()), |entry| {
                (entry.pa, entry.flags)
            }))
    }

    fn map(&mut self, va: VirtualAddress, pa: PhysicalAddress, flags: PageFlags) -> VmResult<()> {
        let entry = Entry {
            pa,
            flags: (flags - PageFlags::HARDWARE_STATUS) | PageFlags::PRESENT,
        };
        self.table.lock().entries.insert(va.page_base(), entry);
        Ok(())
    }

    fn unmap(&mut self, start: VirtualAddress, end: VirtualAddress) {
        let mut table = self.table.lock();
        for entry in table.entries.range_mut(start..end).map(|(_, entry)| entry) {
            entry.flags.remove(PageFlags::PRESENT);
        }
    }

    fn flush(&mut self) {
        self.table.lock().flushes += 1;
    }

    fn clear_flags(&mut self, va: VirtualAddress, mask: PageFlags) {
        let mut table = self.table.lock();
        let va = va.page_base();
        if let Some(entry) = table.entries.get_mut(&va) {
            entry.flags.remove(mask);
            if !entry.flags.is_present() && !entry.flags.intersects(PageFlags::HARDWARE_STATUS) {
                table.entries.remove(&va);
            }
        }
    }

    fn mapped_size(&self) -> usize {
        self.table.lock().present_pages() * PAGE_SIZE
    }
}

/// Test-side view of a [`SoftwareTranslationMap`]: plays the MMU by setting status bits and
/// injects query failures.
#[derive(Clone)]
pub struct SoftwareMapHandle {
    table: Arc<spin::Mutex<Table>>,
}

impl SoftwareMapHandle {
    /// Records an access to `va`, as the MMU would. Returns false if nothing is mapped there.
    pub fn touch(&self, va: VirtualAddress, write: bool) -> bool {
        let mut table = self.table.lock();
        match table.entries.get_mut(&va.page_base()) {
            Some(entry) if entry.flags.is_present() => {
                entry.flags.insert(PageFlags::ACCESSED);
                if write {
                    entry.flags.insert(PageFlags::MODIFIED);
                }
                true
            }
            _ => false,
        }
    }

    /// Sets only the modified bit of `va`, leaving the accessed bit alone.
    pub fn dirty(&self, va: VirtualAddress) -> bool {
        let mut table = self.table.lock();
        match table.entries.get_mut(&va.page_base()) {
            Some(entry) if entry.flags.is_present() => {
                entry.flags.insert(PageFlags::MODIFIED);
                true
            }
            _ => false,
        }
    }

    /// The flags currently recorded for `va`.
    pub fn flags(&self, va: VirtualAddress) -> PageFlags {
        self.table
            .lock()
            .entries
            .get(&va.page_base())
            .map_or(PageFlags::empty(), |entry| entry.flags)
    }

    /// Makes every later query of `va` fail.
    pub fn fail_queries_at(&self, va: VirtualAddress) {
        self.table.lock().failing.insert(va.page_base());
    }

    pub fn flush_count(&self) -> usize {
        self.table.lock().flushes
    }

    pub fn mapped_pages(&self) -> usize {
        self.table.lock().present_pages()
    }
}

/// Creates [`SoftwareTranslationMap`]s and remembers a handle to each one.
#[derive(Default)]
pub struct SoftwareMapFactory {
    maps: spin::Mutex<BTreeMap<TeamId, SoftwareMapHandle>>,
    fail_next: AtomicBool,
}

impl SoftwareMapFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The handle of the most recent map created for `team`.
    pub fn handle(&self, team: TeamId) -> Option<SoftwareMapHandle> {
        self.maps.lock().get(&team).cloned()
    }

    /// Makes the next [`create_map`](TranslationMapFactory::create_map) fail.
    pub fn fail_next_creation(&self) {
        self.fail_next.store(true, Ordering::Release);
    }
}

impl TranslationMapFactory for SoftwareMapFactory {
    fn create_map(&self, team: TeamId, _kernel: bool) -> VmResult<Box<dyn TranslationMap>> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(VmError::NoMemory);
        }
        let table = Arc::new(spin::Mutex::new(Table::default()));
        self.maps.lock().insert(
            team,
            SoftwareMapHandle {
                table: table.clone(),
            },
        );
        Ok(Box::new(SoftwareTranslationMap { table }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(address: usize) -> VirtualAddress {
        VirtualAddress::new(address)
    }

    fn map() -> (Box<dyn TranslationMap>, SoftwareMapHandle) {
        let factory = SoftwareMapFactory::new();
        let map = factory.create_map(TeamId(2), false).unwrap();
        (map, factory.handle(TeamId(2)).unwrap())
    }

    #[test]
    fn unmap_keeps_status_bits_until_cleared() {
        let (mut map, handle) = map();
        let pa = PhysicalAddress::new(0x5000);
        map.map(va(0x1000), pa, PageFlags::WRITABLE).unwrap();
        assert_eq!(map.mapped_size(), PAGE_SIZE);
        assert!(handle.touch(va(0x1234), true));

        map.unmap(va(0x1000), va(0x2000));
        assert_eq!(map.mapped_size(), 0);
        let (queried, flags) = map.query(va(0x1000)).unwrap();
        assert_eq!(queried, pa);
        assert!(!flags.is_present());
        assert!(flags.contains(PageFlags::ACCESSED | PageFlags::MODIFIED));
        assert!(!handle.touch(va(0x1000), false));

        map.clear_flags(va(0x1000), PageFlags::HARDWARE_STATUS);
        assert_eq!(map.query(va(0x1000)).unwrap().1, PageFlags::empty());
        assert_eq!(handle.flags(va(0x1000)), PageFlags::empty());
    }

    #[test]
    fn mapping_starts_with_clear_status_bits() {
        let (mut map, handle) = map();
        map.map(va(0x3000), PhysicalAddress::new(0x1000), PageFlags::all())
            .unwrap();
        let flags = handle.flags(va(0x3000));
        assert!(flags.is_present());
        assert!(!flags.intersects(PageFlags::HARDWARE_STATUS));
        assert_eq!(handle.mapped_pages(), 1);
    }

    #[test]
    fn injected_failures_and_flushes() {
        let (mut map, handle) = map();
        handle.fail_queries_at(va(0x7000));
        assert_eq!(map.query(va(0x7010)), Err(VmError::BadAddress));
        map.flush();
        map.flush();
        assert_eq!(handle.flush_count(), 2);
    }

    #[test]
    fn factory_failure_is_one_shot() {
        let factory = SoftwareMapFactory::new();
        factory.fail_next_creation();
        assert!(factory.create_map(TeamId(3), false).is_err());
        assert!(factory.create_map(TeamId(3), false).is_ok());
        assert!(factory.handle(TeamId(3)).is_some());
    }
}
