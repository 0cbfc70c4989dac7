//! Regions: mapped or reserved sub-ranges of an address space.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use crate::{PAGE_SIZE, PageFlags, VirtualAddress};

/// Identifier of a region, unique within its address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AreaId(pub u32);

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a region represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Backed by a store and eligible for page scanning.
    Mapped,
    /// A placeholder keeping an address range free for later use; never scanned.
    Reserved,
}

/// Where a new region may be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpec {
    /// Exactly at the given address.
    Exact,
    /// At the first free range at or after the given address, otherwise anywhere.
    BaseHint,
    /// Anywhere in the space.
    Any,
}

/// Placement constraints for inserting a region or reserving a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRestrictions {
    /// The requested (or hinted) base address. Ignored for [`AddressSpec::Any`].
    pub address: VirtualAddress,
    /// How `address` is interpreted.
    pub spec: AddressSpec,
    /// Required alignment of the base address; a power of two, at least [`PAGE_SIZE`].
    pub alignment: usize,
}

impl AddressRestrictions {
    /// Place exactly at `address`.
    pub const fn exact(address: VirtualAddress) -> Self {
        Self {
            address,
            spec: AddressSpec::Exact,
            alignment: PAGE_SIZE,
        }
    }

    /// Place at or after `address`.
    pub const fn base_hint(address: VirtualAddress) -> Self {
        Self {
            address,
            spec: AddressSpec::BaseHint,
            alignment: PAGE_SIZE,
        }
    }

    /// Place anywhere.
    pub const fn any() -> Self {
        Self {
            address: VirtualAddress::new(0),
            spec: AddressSpec::Any,
            alignment: PAGE_SIZE,
        }
    }

    /// Replaces the alignment requirement.
    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }
}

/// State guarded by a backing store's lock.
#[derive(Debug, Default)]
pub struct StoreState {
    /// When set, the page scanner skips every region using this store (device memory and
    /// other pages that must never be stolen).
    pub scan_skip: bool,
}

/// The backing store ("cache") of a region.
///
/// Stores can be shared between regions (a mapped file, shared memory); sharing is expressed
/// by cloning the `Arc`. The store's own lock is taken by the page scanner for the duration of
/// one region's scan.
pub struct BackingStore {
    name: String,
    state: spin::Mutex<StoreState>,
}

impl BackingStore {
    /// Creates a scannable store.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: spin::Mutex::new(StoreState::default()),
        })
    }

    /// Creates a store whose pages the scanner must never touch.
    pub fn unscannable(name: impl Into<String>) -> Arc<Self> {
        let store = Self::new(name);
        store.lock().scan_skip = true;
        store
    }

    /// Returns the store's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Locks the store.
    pub fn lock(&self) -> spin::MutexGuard<'_, StoreState> {
        self.state.lock()
    }
}

impl fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackingStore")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A contiguous, page-aligned sub-range of an address space.
///
/// Regions are owned by the layout of their address space. Reserved regions have no
/// backing store.
#[derive(Debug, Clone)]
pub struct Region {
    id: AreaId,
    name: String,
    base: VirtualAddress,
    size: usize,
    kind: RegionKind,
    protection: PageFlags,
    store: Option<Arc<BackingStore>>,
}

impl Region {
    pub(crate) fn mapped(
        id: AreaId,
        name: String,
        base: VirtualAddress,
        size: usize,
        protection: PageFlags,
        store: Arc<BackingStore>,
    ) -> Self {
        Self {
            id,
            name,
            base,
            size,
            kind: RegionKind::Mapped,
            protection,
            store: Some(store),
        }
    }

    pub(crate) fn reserved(id: AreaId, base: VirtualAddress, size: usize) -> Self {
        Self {
            id,
            name: String::from("reserved"),
            base,
            size,
            kind: RegionKind::Reserved,
            protection: PageFlags::empty(),
            store: None,
        }
    }

    /// The region's identifier.
    pub fn id(&self) -> AreaId {
        self.id
    }

    /// The region's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The first address of the region.
    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    /// The size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The last address of the region (inclusive).
    pub fn end(&self) -> VirtualAddress {
        self.base + (self.size - 1)
    }

    /// Number of pages spanned by the region.
    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// Whether the region is mapped or a reservation.
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Returns true for reserved ranges.
    pub fn is_reserved(&self) -> bool {
        self.kind == RegionKind::Reserved
    }

    /// Protection applied to pages mapped into the region.
    pub fn protection(&self) -> PageFlags {
        self.protection
    }

    /// The backing store, if the region is mapped.
    pub fn store(&self) -> Option<&Arc<BackingStore>> {
        self.store.as_ref()
    }

    /// Returns true if `address` lies within the region.
    pub fn contains_address(&self, address: VirtualAddress) -> bool {
        address >= self.base && address <= self.end()
    }

    /// Returns true if the region intersects the inclusive range `[start, end]`.
    pub fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.base <= end && start <= self.end()
    }

    pub(crate) fn set_range(&mut self, base: VirtualAddress, size: usize) {
        self.base = base;
        self.size = size;
    }
}
