//! The resumable page scanner.
//!
//! Each call examines at most one quantum of pages, starting at the space's scan cursor and
//! wrapping around to the first region once the end of the space is reached. The cursor always
//! names the next page to examine, so consecutive calls round-robin through the whole space.

use log::{trace, warn};

use crate::{
    AddressSpace, PAGE_SIZE, PageFlags, PageRegistry, PageState, Region, TranslationMap,
    VirtualAddress,
};

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Pages that consumed quantum.
    pub examined: usize,
    /// Pages unmapped from the space.
    pub stolen: usize,
    /// Pages reclassified as modified.
    pub dirtied: usize,
    /// Reclamation target left over.
    pub remaining_target: usize,
}

/// Walks a bounded number of pages of an address space per call, stealing unreferenced active
/// pages while a reclamation target is pending and marking dirty pages as modified.
#[derive(Debug, Clone, Copy)]
pub struct RegionScanner {
    quantum: usize,
}

impl RegionScanner {
    /// Creates a scanner examining at most `quantum` pages per call.
    pub const fn new(quantum: usize) -> Self {
        Self { quantum }
    }

    pub const fn quantum(&self) -> usize {
        self.quantum
    }

    /// Scans one quantum of `space`, trying to free `free_target` pages.
    ///
    /// Never fails: spaces being torn down are left alone and pages that cannot be queried are
    /// skipped.
    pub fn scan(&self, space: &AddressSpace, free_target: usize) -> ScanReport {
        let mut scan = Scan {
            pages: space.pages(),
            space,
            quantum: self.quantum,
            report: ScanReport {
                remaining_target: free_target,
                ..ScanReport::default()
            },
        };
        if space.is_being_deleted() {
            trace!("space {}: being deleted, not scanned", space.id());
            return scan.report;
        }

        let mut reclaim = space.reclaim();
        let Ok(areas) = space.read_lock() else {
            return scan.report;
        };
        if areas.region_count() == 0 {
            reclaim.scan_cursor = space.base();
            return scan.report;
        }

        let lap_start = reclaim.scan_cursor;
        let tail_size = (space.end() - lap_start).saturating_add(1);
        for region in areas.range(lap_start, tail_size) {
            if let Some(stopped) = scan.region(region, lap_start, region.end()) {
                reclaim.scan_cursor = stopped;
                return scan.report;
            }
        }

        if lap_start > space.base() {
            let wrap_end = lap_start - 1;
            for region in areas.iter().take_while(|region| region.base() < lap_start) {
                let to = region.end().min(wrap_end);
                if let Some(stopped) = scan.region(region, region.base(), to) {
                    reclaim.scan_cursor = stopped;
                    return scan.report;
                }
            }
        }

        reclaim.scan_cursor = lap_start;
        scan.report
    }
}

struct Scan<'a> {
    space: &'a AddressSpace,
    pages: &'a dyn PageRegistry,
    quantum: usize,
    report: ScanReport,
}

impl Scan<'_> {
    /// Examines the pages of `region` within `[from, to]`. Returns the page to resume at if the
    /// quantum ran out first.
    fn region(
        &mut self,
        region: &Region,
        from: VirtualAddress,
        to: VirtualAddress,
    ) -> Option<VirtualAddress> {
        let store = region.store()?;
        let store = store.lock();
        if store.scan_skip {
            trace!(
                "space {}: skipping region {} '{}'",
                self.space.id(),
                region.id(),
                region.name()
            );
            return None;
        }

        let first = from.max(region.base()).page_base();
        let pages = (to - first) / PAGE_SIZE + 1;
        trace!(
            "space {}: scanning region {} from {} ({} pages)",
            self.space.id(),
            region.id(),
            first,
            pages
        );
        for index in 0..pages {
            let va = first + index * PAGE_SIZE;
            if self.quantum == 0 {
                return Some(va);
            }
            let space = self.space;
            let mut map = space.translation_map();
            if self.page(&mut **map, va) {
                self.quantum -= 1;
                self.report.examined += 1;
            }
        }
        None
    }

    /// Examines the page mapped at `va`. Returns false if it was skipped.
    fn page(&mut self, map: &mut dyn TranslationMap, va: VirtualAddress) -> bool {
        let pages = self.pages;
        let (pa, flags) = match map.query(va) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(
                    "space {}: query of {} failed ({}), page skipped",
                    self.space.id(),
                    va,
                    error
                );
                return false;
            }
        };
        if !flags.is_present() {
            return false;
        }
        let Some(page) = pages.lookup_page(pa) else {
            return false;
        };
        if page.state().is_frozen() {
            return false;
        }

        let mut modified = flags.contains(PageFlags::MODIFIED);
        if self.report.remaining_target > 0 && page.state() == PageState::Active {
            if flags.contains(PageFlags::ACCESSED) {
                // Second chance: a page still unreferenced next time round is stolen.
                map.clear_flags(va, PageFlags::ACCESSED);
            } else {
                map.unmap(va, va + PAGE_SIZE);
                map.flush();
                if let Ok((_, after)) = map.query(va) {
                    modified |= after.contains(PageFlags::MODIFIED);
                }
                map.clear_flags(va, PageFlags::HARDWARE_STATUS);
                self.report.stolen += 1;
                if page.release_mapping() == 1 {
                    pages.set_page_state(page, PageState::Inactive);
                    self.report.remaining_target -= 1;
                }
            }
        }

        if modified && matches!(page.state(), PageState::Active | PageState::Inactive) {
            pages.set_page_state(page, PageState::Modified);
            self.report.dirtied += 1;
        }
        true
    }
}
