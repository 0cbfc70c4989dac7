#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The virtual-memory core of the Polaris kernel. It provides:
//!
//! - Per-team address spaces holding an ordered set of non-overlapping regions, with placement
//!   (exact, hinted, anywhere and randomised), resizing and address-range reservations.
//! - Reference-counted address-space handles and a registry keyed by team.
//! - A resumable page scanner and the page daemon that sizes working sets from fault rates and
//!   steals pages while free memory is short.
//! - Software emulation of every consumed collaborator for testing in non-kernel environments.
//!
//! Page tables, physical page metadata and kernel threads are provided by the embedding kernel
//! through the traits in [`translation_map`](TranslationMap), [`page`](PageRegistry) and
//! [`thread`](ThreadControl).

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod config;
mod daemon;
mod error;
mod human_size;
mod iterator;
mod layout;
mod manager;
mod page;
mod region;
mod registry;
mod scanner;
mod thread;
mod translation_map;
mod working_set;

#[cfg(test)]
mod tests_prop;

pub use address::{PAGE_SIZE, PhysicalAddress, VirtualAddress, is_page_aligned, pages_for};
pub use address_space::{
    AddressSpace, AddressSpaceRef, AreaReader, AreaWriter, Areas, SpaceKind, TeamId,
};
pub use config::{
    DaemonConfig, MAX_FAULTS_PER_SECOND, MAX_RANDOMIZE, MIN_FAULTS_PER_SECOND,
    PAGE_DAEMON_INTERVAL, PAGE_SCAN_QUANTUM, VmConfig, WORKING_SET_ADJUST_INTERVAL,
    WORKING_SET_DECREMENT, WORKING_SET_INCREMENT, WorkingSetLimits,
};
pub use daemon::{CycleReport, DaemonHandle, DaemonState, ReclamationDaemon};
pub use error::{VmError, VmResult, invariant_violation};
pub use human_size::HumanSize;
pub use iterator::{AreaIterator, AreaRangeIterator};
pub use layout::{AreaLayout, AreaList, AreaTree};
pub use manager::{TrimmingCycle, VmManager, VmServices};
pub use page::{MemoryAccounting, Page, PageRegistry, PageState};
pub use region::{
    AddressRestrictions, AddressSpec, AreaId, BackingStore, Region, RegionKind, StoreState,
};
pub use registry::{AddressSpaceRegistry, AddressSpaceWalk};
pub use scanner::{RegionScanner, ScanReport};
pub use thread::{ThreadControl, ThreadEntry, ThreadId, ThreadPriority};
pub use translation_map::{PageFlags, TranslationMap, TranslationMapFactory};
pub use working_set::{WorkingSet, WorkingSetChange};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::software;
