//! The translation-map capability.
//!
//! A translation map is the architecture-specific page table of one address space. This crate
//! never touches page-table memory itself; it consumes the narrow interface defined here and
//! owns exactly one map per address space.

use alloc::boxed::Box;

use bitflags::bitflags;

use crate::{PhysicalAddress, TeamId, VirtualAddress, VmResult};

bitflags! {
    /// Architecture-neutral page table entry flags.
    ///
    /// `ACCESSED` and `MODIFIED` are set by the hardware (or its emulation) and cleared by
    /// the page scanner.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u32 {
        /// The entry maps a physical page.
        const PRESENT = 1 << 0;
        /// The page may be written.
        const WRITABLE = 1 << 1;
        /// The page is reachable from user mode.
        const USER = 1 << 2;
        /// The page may be executed.
        const EXECUTE = 1 << 3;
        /// The page was read or written since the bit was last cleared.
        const ACCESSED = 1 << 4;
        /// The page was written since the bit was last cleared.
        const MODIFIED = 1 << 5;
    }
}

impl PageFlags {
    /// Flags maintained by the hardware rather than requested by the mapper.
    pub const HARDWARE_STATUS: Self = Self::ACCESSED.union(Self::MODIFIED);

    /// Returns whether the present bit is set.
    #[inline]
    pub const fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }
}

/// The page table of a single address space.
///
/// Implementations are not required to be internally synchronised: the owning address space
/// keeps its map behind a lock, and taking that lock is the map's `lock()`; dropping the guard
/// is its `unlock()`.
pub trait TranslationMap: Send {
    /// Returns the physical address and flags recorded for `va`.
    ///
    /// An unmapped address reports flags without [`PageFlags::PRESENT`]. After
    /// [`unmap`](Self::unmap) the hardware status bits stay visible until they are cleared
    /// with [`clear_flags`](Self::clear_flags).
    fn query(&self, va: VirtualAddress) -> VmResult<(PhysicalAddress, PageFlags)>;

    /// Maps the page at `va` to `pa` with `flags`.
    fn map(&mut self, va: VirtualAddress, pa: PhysicalAddress, flags: PageFlags) -> VmResult<()>;

    /// Unmaps every page in `[start, end)`.
    fn unmap(&mut self, start: VirtualAddress, end: VirtualAddress);

    /// Flushes stale translations from every CPU.
    fn flush(&mut self);

    /// Clears `mask` on the entry for `va`.
    fn clear_flags(&mut self, va: VirtualAddress, mask: PageFlags);

    /// Returns the number of bytes currently mapped.
    fn mapped_size(&self) -> usize;
}

/// Creates translation maps for new address spaces.
pub trait TranslationMapFactory: Send + Sync {
    /// Creates an empty map for `team`. Fails with [`VmError::NoMemory`](crate::VmError) if
    /// the page-table root cannot be allocated.
    fn create_map(&self, team: TeamId, kernel: bool) -> VmResult<Box<dyn TranslationMap>>;
}
