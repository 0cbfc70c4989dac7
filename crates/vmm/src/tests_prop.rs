//! Property tests over the region layouts, the working-set controller, the trimming cycle and
//! the page scanner.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::time::Duration;

use proptest::prelude::*;

use crate::software::HostVm;
use crate::{
    AddressRestrictions, AddressSpaceRef, AreaId, AreaIterator, AreaLayout, AreaList,
    AreaRangeIterator, AreaTree, BackingStore, DaemonConfig, PAGE_SIZE, PageFlags, PageState,
    Region, RegionScanner, TeamId, TrimmingCycle, VirtualAddress, VmConfig, WorkingSet,
    WorkingSetLimits,
};

const TEAM: TeamId = TeamId(11);
const SPACE_BASE: usize = 0x10_0000;
const SPACE_PAGES: usize = 256;

#[derive(Debug, Clone)]
enum Op {
    Insert { pages: usize, at: Option<usize> },
    Remove { nth: usize },
    Resize { nth: usize, pages: usize },
    Reserve { pages: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1usize..16, proptest::option::of(0..SPACE_PAGES))
            .prop_map(|(pages, at)| Op::Insert { pages, at }),
        2 => (0usize..32).prop_map(|nth| Op::Remove { nth }),
        2 => (0usize..32, 1usize..24).prop_map(|(nth, pages)| Op::Resize { nth, pages }),
        1 => (1usize..8).prop_map(|pages| Op::Reserve { pages }),
    ]
}

/// Non-overlapping `(base page, page count)` pairs.
fn layout() -> impl Strategy<Value = Vec<(usize, usize)>> {
    proptest::collection::btree_map(0usize..128, 1usize..4, 0..12).prop_map(|candidates| {
        let mut next_free = 0;
        let mut layout = Vec::new();
        for (page, pages) in candidates {
            if page >= next_free {
                layout.push((page, pages));
                next_free = page + pages;
            }
        }
        layout
    })
}

fn team_space(vm: &HostVm) -> AddressSpaceRef {
    let base = VirtualAddress::new(SPACE_BASE);
    vm.manager
        .create_address_space(TEAM, base, SPACE_PAGES * PAGE_SIZE, false)
        .unwrap()
}

fn fill(layout: &mut dyn AreaLayout, regions: &[(usize, usize)]) {
    for (id, &(page, pages)) in regions.iter().enumerate() {
        layout
            .insert(Region::mapped(
                AreaId(id as u32 + 1),
                String::from("prop"),
                VirtualAddress::new(page * PAGE_SIZE),
                pages * PAGE_SIZE,
                PageFlags::WRITABLE,
                BackingStore::new("anon"),
            ))
            .unwrap();
    }
}

proptest! {
    #[test]
    fn regions_stay_ordered_and_disjoint(
        ops in proptest::collection::vec(op(), 1..48),
        randomize in any::<bool>(),
    ) {
        let vm = HostVm::new(VmConfig::default().with_randomization(randomize), 16).unwrap();
        let space = team_space(&vm);

        for op in ops {
            let mut areas = space.write_lock().unwrap();
            let bases: Vec<VirtualAddress> = areas
                .iter()
                .filter(|region| !region.is_reserved())
                .map(|region| region.base())
                .collect();
            let pick = |nth: usize| bases.get(nth % bases.len().max(1)).copied();
            // Failures are fine; only the resulting layout matters.
            let _ = match op {
                Op::Insert { pages, at } => {
                    let restrictions = match at {
                        Some(page) => AddressRestrictions::exact(
                            VirtualAddress::new(SPACE_BASE + page * PAGE_SIZE),
                        ),
                        None => AddressRestrictions::any(),
                    };
                    areas
                        .insert_region(
                            "prop",
                            pages * PAGE_SIZE,
                            PageFlags::WRITABLE,
                            BackingStore::new("anon"),
                            restrictions,
                        )
                        .map(|_| ())
                }
                Op::Remove { nth } => match pick(nth) {
                    Some(base) => areas.remove_region(base),
                    None => Ok(()),
                },
                Op::Resize { nth, pages } => match pick(nth) {
                    Some(base) => areas.resize_region(base, pages * PAGE_SIZE),
                    None => Ok(()),
                },
                Op::Reserve { pages } => areas
                    .reserve_address_range(pages * PAGE_SIZE, AddressRestrictions::any())
                    .map(|_| ()),
            };
            drop(areas);
            space.check_invariants();
        }

        let areas = space.read_lock().unwrap();
        let used: usize = areas.iter().map(|region| region.size()).sum();
        prop_assert_eq!(used + areas.free_space(), space.size());
    }

    #[test]
    fn working_set_never_leaves_its_limits(
        min in 1usize..64,
        span in 0usize..256,
        initial in 0usize..512,
        samples in proptest::collection::vec((0usize..200_000, 0usize..1024), 1..32),
    ) {
        let limits = WorkingSetLimits { initial, min, max: min + span };
        let config = DaemonConfig::default();
        let mut set = WorkingSet::new(limits, Duration::ZERO);
        let mut now = Duration::ZERO;
        prop_assert!(set.size() >= min && set.size() <= min + span);
        for (faults, mapped) in samples {
            now += config.working_set_adjust_interval + Duration::from_secs(1);
            set.adjust(now, faults, mapped, &config);
            prop_assert!(set.size() >= set.min());
            prop_assert!(set.size() <= set.max());
            prop_assert_eq!(set.last_adjust(), now);
        }
    }

    #[test]
    fn trimming_only_toggles_across_a_watermark(
        total in 8usize..100_000,
        samples in proptest::collection::vec(0.0f64..0.5, 1..64),
    ) {
        let trimming = TrimmingCycle::new();
        for fraction in samples {
            let free = (total as f64 * fraction) as usize;
            let before = trimming.is_active();
            let after = trimming.update(free, total);
            let expected = if free < TrimmingCycle::low_water(total) {
                true
            } else if free > TrimmingCycle::high_water(total) {
                false
            } else {
                before
            };
            prop_assert_eq!(after, expected);
            prop_assert_eq!(trimming.is_active(), after);
        }
    }

    #[test]
    fn scanner_visits_every_page_within_the_bound(
        regions in layout(),
        quantum in 1usize..16,
    ) {
        prop_assume!(!regions.is_empty());
        let vm = HostVm::new(VmConfig::default().with_randomization(false), 512).unwrap();
        let space = team_space(&vm);
        let mut frames = Vec::new();
        for &(page, pages) in &regions {
            let base = VirtualAddress::new(SPACE_BASE + page * PAGE_SIZE);
            space
                .write_lock()
                .unwrap()
                .insert_region(
                    "prop",
                    pages * PAGE_SIZE,
                    PageFlags::WRITABLE,
                    BackingStore::new("anon"),
                    AddressRestrictions::exact(base),
                )
                .unwrap();
            frames.extend(vm.populate(&space, base).unwrap());
        }
        let handle = vm.map_handle(TEAM).unwrap();
        for page in 0..SPACE_PAGES {
            handle.dirty(VirtualAddress::new(SPACE_BASE + page * PAGE_SIZE));
        }

        let total = frames.len();
        let scanner = RegionScanner::new(quantum);
        let mut examined = 0;
        for _ in 0..total.div_ceil(quantum) {
            let report = scanner.scan(&space, 0);
            prop_assert!(report.examined <= quantum);
            prop_assert_eq!(report.stolen, 0);
            examined += report.examined;
        }
        prop_assert!(examined >= total);
        for pa in frames {
            prop_assert_eq!(vm.frames.page(pa).unwrap().state(), PageState::Modified);
        }
    }

    #[test]
    fn rewinding_replays_the_same_regions(
        regions in layout(),
        start in 0usize..160,
        pages in 1usize..64,
        list in any::<bool>(),
    ) {
        let mut layout: Box<dyn AreaLayout> = if list {
            Box::new(AreaList::new())
        } else {
            Box::new(AreaTree::new())
        };
        fill(&mut *layout, &regions);

        let mut all = AreaIterator::new(&*layout);
        let first: Vec<_> = all.by_ref().map(|region| region.base()).collect();
        all.rewind();
        all.rewind();
        let second: Vec<_> = all.map(|region| region.base()).collect();
        prop_assert_eq!(&first, &second);
        prop_assert!(first.windows(2).all(|pair| pair[0] < pair[1]));

        let address = VirtualAddress::new(start * PAGE_SIZE);
        let size = pages * PAGE_SIZE;
        let mut range = AreaRangeIterator::new(&*layout, address, size);
        let first: Vec<_> = range.by_ref().map(|region| region.base()).collect();
        range.rewind();
        let second: Vec<_> = range.map(|region| region.base()).collect();
        prop_assert_eq!(&first, &second);

        let expected: Vec<_> = regions
            .iter()
            .filter(|&&(page, count)| page < start + pages && page + count > start)
            .map(|&(page, _)| VirtualAddress::new(page * PAGE_SIZE))
            .collect();
        prop_assert_eq!(first, expected);
    }
}
