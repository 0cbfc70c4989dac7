//! Physical page metadata and the page-registry capability.
//!
//! The page registry owns one [`Page`] per physical frame. This crate only reads and
//! reclassifies pages; allocation and write-back belong to the registry's owner.

use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use crate::PhysicalAddress;
use crate::error::invariant_violation;

/// Classification of a physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageState {
    /// Not in use.
    Free = 0,
    /// Mapped and recently used.
    Active = 1,
    /// No longer mapped anywhere; a candidate for reuse.
    Inactive = 2,
    /// Dirty; must be written back before reuse.
    Modified = 3,
    /// Transiently owned by someone else (I/O in flight). Frozen against the scanner.
    Busy = 4,
    /// Pinned in memory. Frozen against the scanner.
    Wired = 5,
}

impl PageState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Active,
            2 => Self::Inactive,
            3 => Self::Modified,
            4 => Self::Busy,
            _ => Self::Wired,
        }
    }

    /// Returns true if the page scanner must leave a page in this state alone.
    #[inline]
    pub const fn is_frozen(self) -> bool {
        matches!(self, Self::Busy | Self::Wired)
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Modified => "modified",
            Self::Busy => "busy",
            Self::Wired => "wired",
        };
        f.write_str(name)
    }
}

/// Metadata for one physical page.
///
/// Both fields are atomics so any CPU can read them without the registry's locks; state
/// changes should go through [`PageRegistry::set_page_state`] so the registry can keep its
/// queues in step.
pub struct Page {
    state: AtomicU8,
    /// Number of translation-map entries currently pointing at this page.
    mapping_count: AtomicU32,
}

impl Page {
    /// Creates a free, unmapped page.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(PageState::Free as u8),
            mapping_count: AtomicU32::new(0),
        }
    }

    /// Returns the current classification.
    #[inline]
    pub fn state(&self) -> PageState {
        PageState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Stores a new classification. Registry implementations call this from
    /// [`PageRegistry::set_page_state`].
    #[inline]
    pub fn store_state(&self, state: PageState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns the number of mappings of this page.
    #[inline]
    pub fn mapping_count(&self) -> u32 {
        self.mapping_count.load(Ordering::Acquire)
    }

    /// Records one more mapping, returning the previous count.
    #[inline]
    pub fn acquire_mapping(&self) -> u32 {
        self.mapping_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Drops one mapping, returning the previous count.
    ///
    /// A previous count of `1` means the caller removed the last mapping.
    ///
    /// # Panics
    ///
    /// Releasing a page with no mappings is an invariant violation.
    pub fn release_mapping(&self) -> u32 {
        match self
            .mapping_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            }) {
            Ok(previous) => previous,
            Err(_) => invariant_violation(format_args!("released a page with no mappings")),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("state", &self.state())
            .field("mapping_count", &self.mapping_count())
            .finish()
    }
}

/// Lookup of page metadata by physical address.
pub trait PageRegistry: Send + Sync {
    /// Returns the page containing `pa`, or `None` if the address is not managed (or the page
    /// was freed concurrently).
    fn lookup_page(&self, pa: PhysicalAddress) -> Option<&Page>;

    /// Moves `page` to `state`.
    fn set_page_state(&self, page: &Page, state: PageState) {
        page.store_state(state);
    }
}

/// Free-memory accounting used by the reclamation daemon's watermarks.
pub trait MemoryAccounting: Send + Sync {
    /// Number of free physical pages.
    fn free_pages(&self) -> usize;

    /// Number of physical pages managed in total.
    fn total_pages(&self) -> usize;
}
