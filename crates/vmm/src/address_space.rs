//! Address space management.
//!
//! An [`AddressSpace`] is the lockable container of the regions of one execution context, the
//! kernel or a team. It exclusively owns its translation map and is shared through
//! reference-counted [`AddressSpaceRef`] handles; dropping the last handle tears the space down.
//!
//! Locks are always taken in this order: reclaim state, region collection, backing store,
//! translation map.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use log::{debug, info};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::config::MAX_RANDOMIZE;
use crate::error::invariant_violation;
use crate::{
    AddressRestrictions, AddressSpaceRegistry, AddressSpec, AreaId, AreaIterator, AreaLayout,
    AreaList, AreaRangeIterator, AreaTree, BackingStore, DaemonConfig, HumanSize, PAGE_SIZE,
    PageFlags, PageRegistry, PageState, PhysicalAddress, Region, TranslationMap, VirtualAddress,
    VmError, VmResult, WorkingSet, WorkingSetChange, WorkingSetLimits, is_page_aligned,
};

/// Identifier of an address space; the id of the team owning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TeamId(pub u32);

impl TeamId {
    /// The kernel team.
    pub const KERNEL: Self = Self(1);
}

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether an address space belongs to the kernel or to a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    Team,
}

/// The region collection of an address space and the bookkeeping guarded with it.
///
/// Only reachable through [`AreaReader`] or [`AreaWriter`].
pub struct Areas {
    base: VirtualAddress,
    end: VirtualAddress,
    layout: Box<dyn AreaLayout>,
    free_space: usize,
    next_area_id: u32,
    randomizing: bool,
    rng: SmallRng,
}

impl Areas {
    pub fn first_region(&self) -> Option<&Region> {
        self.layout.first()
    }

    pub fn next_region(&self, region: &Region) -> Option<&Region> {
        self.layout.next(region)
    }

    /// The region with the greatest base `<= address` when `less_or_equal`, otherwise the one
    /// with the least base `>= address`.
    pub fn find_closest_region(
        &self,
        address: VirtualAddress,
        less_or_equal: bool,
    ) -> Option<&Region> {
        self.layout.find_closest(address, less_or_equal)
    }

    /// The region containing `address`.
    pub fn lookup_region(&self, address: VirtualAddress) -> Option<&Region> {
        self.layout.lookup(address)
    }

    /// The region starting exactly at `base`.
    pub fn region(&self, base: VirtualAddress) -> Option<&Region> {
        self.layout.get(base)
    }

    pub fn region_count(&self) -> usize {
        self.layout.len()
    }

    /// Bytes not covered by any region, reserved ones included.
    pub fn free_space(&self) -> usize {
        self.free_space
    }

    pub fn is_randomizing(&self) -> bool {
        self.randomizing
    }

    /// Name of the region indexing strategy.
    pub fn layout_name(&self) -> &'static str {
        self.layout.name()
    }

    /// Iterates over every region in base order.
    pub fn iter(&self) -> AreaIterator<'_> {
        AreaIterator::new(&*self.layout)
    }

    /// Iterates over the regions intersecting `[address, address + size - 1]`.
    pub fn range(&self, address: VirtualAddress, size: usize) -> AreaRangeIterator<'_> {
        AreaRangeIterator::new(&*self.layout, address, size)
    }

    /// Returns true if the region at `base` could be resized to `new_size` bytes.
    pub fn can_resize_region(&self, base: VirtualAddress, new_size: usize) -> bool {
        self.plan_resize(base, new_size).is_ok()
    }

    fn allocate_id(&mut self) -> AreaId {
        let id = AreaId(self.next_area_id);
        self.next_area_id = self.next_area_id.wrapping_add(1);
        id
    }

    /// Lowest `alignment`-aligned address at or after `from` where `size` bytes fit.
    fn first_fit(
        &self,
        from: VirtualAddress,
        size: usize,
        alignment: usize,
    ) -> Option<VirtualAddress> {
        let mut candidate = from.checked_align_up(alignment)?;
        let mut next = match self.layout.find_closest(candidate, true) {
            Some(region) if region.end() >= candidate => Some(region),
            Some(region) => self.layout.next(region),
            None => self.layout.first(),
        };
        loop {
            let last = candidate.checked_add(size - 1)?;
            if last > self.end {
                return None;
            }
            match next {
                Some(region) if region.end() < candidate => next = self.layout.next(region),
                Some(region) if region.base() <= last => {
                    candidate = region.end().checked_add(1)?.checked_align_up(alignment)?;
                    next = self.layout.next(region);
                }
                _ => return Some(candidate),
            }
        }
    }

    fn random_start(&mut self) -> VirtualAddress {
        let span = (self.end - self.base).min(MAX_RANDOMIZE);
        let offset = self.rng.random_range(0..=span / PAGE_SIZE) * PAGE_SIZE;
        self.base + offset
    }

    fn place(
        &mut self,
        size: usize,
        restrictions: &AddressRestrictions,
        carve_reservations: bool,
    ) -> VmResult<Placement> {
        let alignment = restrictions.alignment;
        if size == 0
            || !is_page_aligned(size)
            || !alignment.is_power_of_two()
            || alignment < PAGE_SIZE
        {
            return Err(VmError::InvalidArgument);
        }

        match restrictions.spec {
            AddressSpec::Exact => {
                let address = restrictions.address;
                if !address.is_aligned(alignment) {
                    return Err(VmError::BadAddress);
                }
                let last = address.checked_add(size - 1).ok_or(VmError::OutOfRange)?;
                if address < self.base || last > self.end {
                    return Err(VmError::OutOfRange);
                }
                let mut colliding = self.range(address, size);
                match (colliding.next(), colliding.next()) {
                    (None, _) => Ok(Placement::Free(address)),
                    (Some(region), None)
                        if carve_reservations
                            && region.is_reserved()
                            && region.base() <= address
                            && region.end() >= last =>
                    {
                        Ok(Placement::InReservation {
                            address,
                            reservation: region.base(),
                        })
                    }
                    _ => Err(VmError::WouldOverlap),
                }
            }
            AddressSpec::BaseHint => {
                let hint = restrictions.address.max(self.base);
                self.first_fit(hint, size, alignment)
                    .or_else(|| self.first_fit(self.base, size, alignment))
                    .map(Placement::Free)
                    .ok_or(VmError::NoMemory)
            }
            AddressSpec::Any => {
                let randomized = if self.randomizing {
                    let start = self.random_start();
                    self.first_fit(start, size, alignment)
                } else {
                    None
                };
                randomized
                    .or_else(|| self.first_fit(self.base, size, alignment))
                    .map(Placement::Free)
                    .ok_or(VmError::NoMemory)
            }
        }
    }

    fn mapped_region(&self, base: VirtualAddress) -> VmResult<&Region> {
        self.region(base)
            .filter(|region| !region.is_reserved())
            .ok_or(VmError::BadAddress)
    }

    fn plan_resize(&self, base: VirtualAddress, new_size: usize) -> VmResult<ResizePlan> {
        if new_size == 0 || !is_page_aligned(new_size) {
            return Err(VmError::InvalidArgument);
        }
        let region = self.mapped_region(base)?;
        if new_size <= region.size() {
            return Ok(ResizePlan::Shrink);
        }
        let new_last = base
            .checked_add(new_size - 1)
            .ok_or(VmError::OutOfRange)?;
        if new_last > self.end {
            return Err(VmError::OutOfRange);
        }
        match self.layout.next(region) {
            Some(next) if next.base() <= new_last => {
                if next.is_reserved() && next.end() >= new_last {
                    Ok(ResizePlan::GrowIntoReservation {
                        reservation: next.base(),
                    })
                } else {
                    Err(VmError::WouldOverlap)
                }
            }
            _ => Ok(ResizePlan::Grow),
        }
    }

    fn insert_vacated(&mut self, region: Region) {
        let base = region.base();
        if let Err(error) = self.layout.insert(region) {
            invariant_violation(format_args!(
                "insert at {base} into a vacated range failed: {error}"
            ));
        }
    }

    fn take(&mut self, base: VirtualAddress) -> Region {
        match self.layout.remove(base) {
            Some(region) => region,
            None => invariant_violation(format_args!("region at {base} vanished under the lock")),
        }
    }
}

enum Placement {
    Free(VirtualAddress),
    InReservation {
        address: VirtualAddress,
        reservation: VirtualAddress,
    },
}

enum ResizePlan {
    Shrink,
    Grow,
    GrowIntoReservation { reservation: VirtualAddress },
}

/// Shared access to the regions of an address space. Dropping the guard read-unlocks.
pub struct AreaReader<'a> {
    areas: spin::RwLockReadGuard<'a, Areas>,
}

impl Deref for AreaReader<'_> {
    type Target = Areas;

    fn deref(&self) -> &Areas {
        &self.areas
    }
}

/// Exclusive access to the regions of an address space. Dropping the guard write-unlocks.
///
/// Every structural mutator validates before it changes anything, so a failed call leaves the
/// space exactly as it was. Each successful call increments the space's change count.
pub struct AreaWriter<'a> {
    space: &'a AddressSpace,
    areas: spin::RwLockWriteGuard<'a, Areas>,
}

impl Deref for AreaWriter<'_> {
    type Target = Areas;

    fn deref(&self) -> &Areas {
        &self.areas
    }
}

impl AreaWriter<'_> {
    /// Creates a mapped region of `size` bytes backed by `store`, returning its base.
    ///
    /// An exact placement that falls entirely within one reserved range takes its space from
    /// the reservation, which is trimmed or split around the new region.
    pub fn insert_region(
        &mut self,
        name: &str,
        size: usize,
        protection: PageFlags,
        store: Arc<BackingStore>,
        restrictions: AddressRestrictions,
    ) -> VmResult<VirtualAddress> {
        let placement = self.areas.place(size, &restrictions, true)?;
        let areas = &mut *self.areas;
        let id = areas.allocate_id();
        let address = match placement {
            Placement::Free(address) => {
                areas.free_space -= size;
                address
            }
            Placement::InReservation {
                address,
                reservation,
            } => {
                let mut reserved = areas.take(reservation);
                let (reserved_base, reserved_end) = (reserved.base(), reserved.end());
                let last = address + (size - 1);
                if reserved_end > last {
                    let tail_id = areas.allocate_id();
                    areas.insert_vacated(Region::reserved(tail_id, last + 1, reserved_end - last));
                }
                if reserved_base < address {
                    reserved.set_range(reserved_base, address - reserved_base);
                    areas.insert_vacated(reserved);
                }
                address
            }
        };
        areas.insert_vacated(Region::mapped(
            id,
            String::from(name),
            address,
            size,
            protection,
            store,
        ));
        self.changed();
        debug!(
            "space {}: inserted region {} '{}' at {} ({})",
            self.space.id,
            id,
            name,
            address,
            HumanSize(size)
        );
        Ok(address)
    }

    /// Removes the mapped region starting at `base`, unmapping its pages.
    pub fn remove_region(&mut self, base: VirtualAddress) -> VmResult<()> {
        self.areas.mapped_region(base)?;
        let region = self.areas.take(base);
        let released = self.space.release_pages(region.base(), region.size());
        self.areas.free_space += region.size();
        self.changed();
        debug!(
            "space {}: removed region {} at {}, {} pages unmapped",
            self.space.id,
            region.id(),
            base,
            released
        );
        Ok(())
    }

    /// Grows or shrinks the region at `base` in place.
    ///
    /// Growth may consume the head of a directly following reserved range.
    pub fn resize_region(&mut self, base: VirtualAddress, new_size: usize) -> VmResult<()> {
        let plan = self.areas.plan_resize(base, new_size)?;
        let areas = &mut *self.areas;
        let old_size = areas.mapped_region(base)?.size();
        match plan {
            ResizePlan::Shrink => {
                if new_size < old_size {
                    self.space
                        .release_pages(base + new_size, old_size - new_size);
                }
                areas.free_space += old_size - new_size;
            }
            ResizePlan::Grow => areas.free_space -= new_size - old_size,
            ResizePlan::GrowIntoReservation { reservation } => {
                let mut reserved = areas.take(reservation);
                let new_end = base + new_size;
                let consumed = if reserved.end() >= new_end {
                    let remaining = reserved.end() - new_end + 1;
                    let consumed = reserved.size() - remaining;
                    reserved.set_range(new_end, remaining);
                    areas.insert_vacated(reserved);
                    consumed
                } else {
                    reserved.size()
                };
                areas.free_space -= (new_size - old_size) - consumed;
            }
        }
        let mut region = areas.take(base);
        region.set_range(base, new_size);
        areas.insert_vacated(region);
        self.changed();
        debug!(
            "space {}: resized region at {} from {} to {}",
            self.space.id,
            base,
            HumanSize(old_size),
            HumanSize(new_size)
        );
        Ok(())
    }

    /// Cuts the front of the region at `base` so that `new_size` bytes remain, returning the
    /// region's new base.
    pub fn shrink_region_head(
        &mut self,
        base: VirtualAddress,
        new_size: usize,
    ) -> VmResult<VirtualAddress> {
        let old_size = self.checked_shrink(base, new_size)?;
        let cut = old_size - new_size;
        self.space.release_pages(base, cut);
        let areas = &mut *self.areas;
        let mut region = areas.take(base);
        region.set_range(base + cut, new_size);
        areas.insert_vacated(region);
        areas.free_space += cut;
        self.changed();
        Ok(base + cut)
    }

    /// Cuts the end of the region at `base` so that `new_size` bytes remain.
    pub fn shrink_region_tail(&mut self, base: VirtualAddress, new_size: usize) -> VmResult<()> {
        let old_size = self.checked_shrink(base, new_size)?;
        let cut = old_size - new_size;
        self.space.release_pages(base + new_size, cut);
        let areas = &mut *self.areas;
        let mut region = areas.take(base);
        region.set_range(base, new_size);
        areas.insert_vacated(region);
        areas.free_space += cut;
        self.changed();
        Ok(())
    }

    /// Keeps `size` bytes free of regions, returning the base of the reserved range.
    pub fn reserve_address_range(
        &mut self,
        size: usize,
        restrictions: AddressRestrictions,
    ) -> VmResult<VirtualAddress> {
        let Placement::Free(address) = self.areas.place(size, &restrictions, false)? else {
            return Err(VmError::WouldOverlap);
        };
        let areas = &mut *self.areas;
        let id = areas.allocate_id();
        areas.insert_vacated(Region::reserved(id, address, size));
        areas.free_space -= size;
        self.changed();
        debug!(
            "space {}: reserved {} at {}",
            self.space.id,
            HumanSize(size),
            address
        );
        Ok(address)
    }

    /// Drops every reserved range lying entirely within `[address, address + size - 1]`.
    pub fn unreserve_address_range(
        &mut self,
        address: VirtualAddress,
        size: usize,
    ) -> VmResult<()> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }
        let last = address.checked_add(size - 1).ok_or(VmError::OutOfRange)?;
        if address < self.areas.base || last > self.areas.end {
            return Err(VmError::OutOfRange);
        }
        let reserved: Vec<VirtualAddress> = self
            .areas
            .range(address, size)
            .filter(|region| {
                region.is_reserved() && region.base() >= address && region.end() <= last
            })
            .map(Region::base)
            .collect();
        let areas = &mut *self.areas;
        for base in reserved {
            let region = areas.take(base);
            areas.free_space += region.size();
        }
        self.changed();
        Ok(())
    }

    fn checked_shrink(&self, base: VirtualAddress, new_size: usize) -> VmResult<usize> {
        let old_size = self.areas.mapped_region(base)?.size();
        if new_size == 0 || !is_page_aligned(new_size) || new_size > old_size {
            return Err(VmError::InvalidArgument);
        }
        Ok(old_size)
    }

    fn changed(&self) {
        self.space.change_count.fetch_add(1, Ordering::Release);
    }
}

/// Reclamation bookkeeping of an address space, owned by the page daemon.
pub(crate) struct ReclaimState {
    /// Next page the scanner examines.
    pub(crate) scan_cursor: VirtualAddress,
    pub(crate) working_set: WorkingSet,
}

pub(crate) struct SpaceSetup {
    pub(crate) id: TeamId,
    pub(crate) kind: SpaceKind,
    pub(crate) base: VirtualAddress,
    pub(crate) size: usize,
    pub(crate) translation_map: Box<dyn TranslationMap>,
    pub(crate) pages: Arc<dyn PageRegistry>,
    pub(crate) registry: Weak<AddressSpaceRegistry>,
    pub(crate) working_set: WorkingSetLimits,
    pub(crate) randomize: bool,
    pub(crate) now: Duration,
}

/// The virtual address space of the kernel or of one team.
pub struct AddressSpace {
    id: TeamId,
    kind: SpaceKind,
    base: VirtualAddress,
    /// Last address of the space (inclusive).
    end: VirtualAddress,
    areas: spin::RwLock<Areas>,
    /// Written only with the region lock held for writing; read without it.
    change_count: AtomicU64,
    fault_count: AtomicUsize,
    deleting: AtomicBool,
    translation_map: spin::Mutex<Box<dyn TranslationMap>>,
    pages: Arc<dyn PageRegistry>,
    registry: Weak<AddressSpaceRegistry>,
    reclaim: spin::Mutex<ReclaimState>,
}

impl AddressSpace {
    pub(crate) fn new(setup: SpaceSetup) -> Self {
        let layout: Box<dyn AreaLayout> = match setup.kind {
            SpaceKind::Kernel => Box::new(AreaList::new()),
            SpaceKind::Team => Box::new(AreaTree::new()),
        };
        let end = setup.base + (setup.size - 1);
        let seed = (u64::from(setup.id.0) << 32) ^ (setup.now.as_nanos() as u64);
        Self {
            id: setup.id,
            kind: setup.kind,
            base: setup.base,
            end,
            areas: spin::RwLock::new(Areas {
                base: setup.base,
                end,
                layout,
                free_space: setup.size,
                next_area_id: 1,
                randomizing: setup.randomize,
                rng: SmallRng::seed_from_u64(seed),
            }),
            change_count: AtomicU64::new(0),
            fault_count: AtomicUsize::new(0),
            deleting: AtomicBool::new(false),
            translation_map: spin::Mutex::new(setup.translation_map),
            pages: setup.pages,
            registry: setup.registry,
            reclaim: spin::Mutex::new(ReclaimState {
                scan_cursor: setup.base,
                working_set: WorkingSet::new(setup.working_set, setup.now),
            }),
        }
    }

    pub fn id(&self) -> TeamId {
        self.id
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == SpaceKind::Kernel
    }

    /// First address of the space.
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Last address of the space (inclusive).
    pub fn end(&self) -> VirtualAddress {
        self.end
    }

    /// Size of the space in bytes.
    pub fn size(&self) -> usize {
        self.end - self.base + 1
    }

    /// Number of structural edits so far. Readable without the lock; a reader that sees the
    /// value change knows the region collection was mutated in between.
    pub fn change_count(&self) -> u64 {
        self.change_count.load(Ordering::Acquire)
    }

    /// Page faults recorded since the last working-set adjustment.
    pub fn fault_count(&self) -> usize {
        self.fault_count.load(Ordering::Relaxed)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.deleting.load(Ordering::Acquire)
    }

    /// Locks the regions for reading. Fails with [`VmError::Busy`] once the space is being
    /// torn down.
    pub fn read_lock(&self) -> VmResult<AreaReader<'_>> {
        loop {
            if self.is_being_deleted() {
                return Err(VmError::Busy);
            }
            if let Some(areas) = self.areas.try_read() {
                if self.is_being_deleted() {
                    return Err(VmError::Busy);
                }
                return Ok(AreaReader { areas });
            }
            core::hint::spin_loop();
        }
    }

    /// Locks the regions for writing. Fails with [`VmError::Busy`] once the space is being
    /// torn down.
    pub fn write_lock(&self) -> VmResult<AreaWriter<'_>> {
        loop {
            if self.is_being_deleted() {
                return Err(VmError::Busy);
            }
            if let Some(areas) = self.areas.try_write() {
                if self.is_being_deleted() {
                    return Err(VmError::Busy);
                }
                return Ok(AreaWriter { space: self, areas });
            }
            core::hint::spin_loop();
        }
    }

    /// Bytes currently mapped by the translation map.
    pub fn mapped_size(&self) -> usize {
        self.translation_map.lock().mapped_size()
    }

    /// Maps the physical page `pa` at `va`, which must lie in a mapped region.
    ///
    /// The page gains a mapping and becomes active unless it is dirty or pinned.
    pub fn map_page(&self, va: VirtualAddress, pa: PhysicalAddress) -> VmResult<()> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(VmError::BadAddress);
        }
        let areas = self.read_lock()?;
        let region = areas
            .lookup_region(va)
            .filter(|region| !region.is_reserved())
            .ok_or(VmError::BadAddress)?;
        let page = self.pages.lookup_page(pa).ok_or(VmError::NotFound)?;

        let _store = region.store().map(|store| store.lock());
        let mut map = self.translation_map.lock();
        if map.query(va)?.1.is_present() {
            return Err(VmError::WouldOverlap);
        }
        map.map(va, pa, region.protection() | PageFlags::PRESENT)?;
        page.acquire_mapping();
        if matches!(page.state(), PageState::Free | PageState::Inactive) {
            self.pages.set_page_state(page, PageState::Active);
        }
        Ok(())
    }

    /// Unmaps the page at `va`.
    pub fn unmap_page(&self, va: VirtualAddress) -> VmResult<()> {
        if !va.is_page_aligned() {
            return Err(VmError::BadAddress);
        }
        let areas = self.read_lock()?;
        let region = areas
            .lookup_region(va)
            .filter(|region| !region.is_reserved())
            .ok_or(VmError::BadAddress)?;
        let _store = region.store().map(|store| store.lock());
        let mut map = self.translation_map.lock();
        match release_range(&mut **map, &*self.pages, va, PAGE_SIZE) {
            0 => Err(VmError::NotFound),
            _ => Ok(()),
        }
    }

    /// Counts one page fault against the working-set controller.
    pub fn record_fault(&self) {
        self.fault_count.fetch_add(1, Ordering::Relaxed);
    }

    /// A snapshot of the working-set controller.
    pub fn working_set(&self) -> WorkingSet {
        self.reclaim.lock().working_set
    }

    /// The next page the scanner will examine.
    pub fn scan_cursor(&self) -> VirtualAddress {
        self.reclaim.lock().scan_cursor
    }

    /// Runs the working-set controller if its interval has elapsed, consuming the fault
    /// counter.
    pub fn adjust_working_set(
        &self,
        now: Duration,
        mapped_pages: usize,
        config: &DaemonConfig,
    ) -> WorkingSetChange {
        let mut reclaim = self.reclaim.lock();
        if !reclaim.working_set.is_due(now, config) {
            return WorkingSetChange::NotDue;
        }
        let faults = self.fault_count.swap(0, Ordering::AcqRel);
        reclaim
            .working_set
            .adjust(now, faults, mapped_pages, config)
    }

    /// Verifies ordering, bounds and free-space accounting of the regions.
    ///
    /// # Panics
    ///
    /// Any inconsistency is an invariant violation.
    pub fn check_invariants(&self) {
        let areas = self.areas.read();
        let mut used = 0usize;
        let mut previous: Option<&Region> = None;
        for region in areas.iter() {
            if region.size() == 0
                || !is_page_aligned(region.size())
                || !region.base().is_page_aligned()
            {
                invariant_violation(format_args!(
                    "space {}: region {} at {} is not page aligned",
                    self.id,
                    region.id(),
                    region.base()
                ));
            }
            if region.base() < self.base || region.end() > self.end {
                invariant_violation(format_args!(
                    "space {}: region {} at {} lies outside the space",
                    self.id,
                    region.id(),
                    region.base()
                ));
            }
            if let Some(previous) = previous {
                if previous.end() >= region.base() {
                    invariant_violation(format_args!(
                        "space {}: regions at {} and {} overlap or are out of order",
                        self.id,
                        previous.base(),
                        region.base()
                    ));
                }
            }
            used += region.size();
            previous = Some(region);
        }
        if used + areas.free_space != self.size() {
            invariant_violation(format_args!(
                "space {}: {} bytes used and {} free do not add up to {}",
                self.id,
                used,
                areas.free_space,
                self.size()
            ));
        }
    }

    pub(crate) fn reclaim(&self) -> spin::MutexGuard<'_, ReclaimState> {
        self.reclaim.lock()
    }

    pub(crate) fn translation_map(&self) -> spin::MutexGuard<'_, Box<dyn TranslationMap>> {
        self.translation_map.lock()
    }

    pub(crate) fn pages(&self) -> &dyn PageRegistry {
        &*self.pages
    }

    fn release_pages(&self, start: VirtualAddress, size: usize) -> usize {
        let mut map = self.translation_map.lock();
        release_range(&mut **map, &*self.pages, start, size)
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("end", &self.end)
            .field("change_count", &self.change_count())
            .field("deleting", &self.is_being_deleted())
            .finish_non_exhaustive()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.deleting.store(true, Ordering::Release);
        let released = clear_regions(
            self.areas.get_mut(),
            &mut **self.translation_map.get_mut(),
            &*self.pages,
        );
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id, self as *const Self);
        }
        info!(
            "address space {} destroyed, {} pages released",
            self.id, released
        );
    }
}

/// A counted reference to an [`AddressSpace`].
///
/// Cloning is `acquire`, dropping is `release`. The space is torn down when the last
/// reference goes away.
#[derive(Clone)]
pub struct AddressSpaceRef(Arc<AddressSpace>);

impl AddressSpaceRef {
    pub(crate) fn new(space: AddressSpace) -> Self {
        Self(Arc::new(space))
    }

    pub(crate) fn from_arc(space: Arc<AddressSpace>) -> Self {
        Self(space)
    }

    pub(crate) fn downgrade(&self) -> Weak<AddressSpace> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn as_ptr(&self) -> *const AddressSpace {
        Arc::as_ptr(&self.0)
    }

    /// Takes another reference.
    pub fn acquire(&self) -> Self {
        self.clone()
    }

    /// Gives up this reference. Returns true if it was the last one, in which case the space
    /// has been torn down before this returns. Exactly one of any number of concurrent callers
    /// observes the last reference.
    pub fn release(self) -> bool {
        match Arc::into_inner(self.0) {
            Some(space) => {
                drop(space);
                true
            }
            None => false,
        }
    }

    /// Number of references currently held.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Returns true if both handles refer to the same space.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.0, &other.0)
    }

    /// Removes every region, marks the space as being deleted, unregisters it and releases
    /// this reference. Returns true if that was the last reference.
    pub fn remove_and_put(self) -> bool {
        {
            let mut areas = self.areas.write();
            self.deleting.store(true, Ordering::Release);
            let mut map = self.translation_map.lock();
            let released = clear_regions(&mut areas, &mut **map, &*self.pages);
            self.change_count.fetch_add(1, Ordering::Release);
            debug!(
                "space {}: removed all regions, {} pages released",
                self.id, released
            );
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id, self.as_ptr());
        }
        self.release()
    }
}

impl Deref for AddressSpaceRef {
    type Target = AddressSpace;

    fn deref(&self) -> &AddressSpace {
        &self.0
    }
}

impl fmt::Debug for AddressSpaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

fn clear_regions(
    areas: &mut Areas,
    map: &mut dyn TranslationMap,
    pages: &dyn PageRegistry,
) -> usize {
    let mut released = 0;
    while let Some(base) = areas.layout.first().map(Region::base) {
        let region = areas.take(base);
        if !region.is_reserved() {
            released += release_range(map, pages, region.base(), region.size());
        }
        areas.free_space += region.size();
    }
    released
}

/// Unmaps every present page in `[start, start + size)` and drops its mapping. A page losing
/// its last mapping turns inactive, a dirty one turns modified. Returns the pages unmapped.
fn release_range(
    map: &mut dyn TranslationMap,
    pages: &dyn PageRegistry,
    start: VirtualAddress,
    size: usize,
) -> usize {
    let mut released = 0;
    for index in 0..size / PAGE_SIZE {
        let va = start + index * PAGE_SIZE;
        let Ok((pa, flags)) = map.query(va) else {
            continue;
        };
        if !flags.is_present() {
            continue;
        }
        map.unmap(va, va + PAGE_SIZE);
        map.clear_flags(va, PageFlags::HARDWARE_STATUS);
        released += 1;
        let Some(page) = pages.lookup_page(pa) else {
            continue;
        };
        if page.release_mapping() == 1 && page.state() == PageState::Active {
            pages.set_page_state(page, PageState::Inactive);
        }
        if flags.contains(PageFlags::MODIFIED)
            && matches!(page.state(), PageState::Active | PageState::Inactive)
        {
            pages.set_page_state(page, PageState::Modified);
        }
    }
    if released > 0 {
        map.flush();
    }
    released
}
