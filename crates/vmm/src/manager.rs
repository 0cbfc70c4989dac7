//! Process-wide virtual-memory state.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use log::{info, warn};

use crate::address_space::SpaceSetup;
use crate::{
    AddressSpace, AddressSpaceRef, AddressSpaceRegistry, HumanSize, MemoryAccounting,
    PageRegistry, SpaceKind, TeamId, ThreadControl, TranslationMapFactory, VirtualAddress,
    VmConfig, VmError, VmResult, is_page_aligned,
};

/// The collaborators the virtual-memory core consumes.
#[derive(Clone)]
pub struct VmServices {
    pub pages: Arc<dyn PageRegistry>,
    pub memory: Arc<dyn MemoryAccounting>,
    pub maps: Arc<dyn TranslationMapFactory>,
    pub threads: Arc<dyn ThreadControl>,
}

/// Whether the page daemon is actively stealing pages.
///
/// Entered when free memory drops below an eighth of all pages and left once it rises above a
/// quarter, so a free-page count hovering around one watermark never toggles the flag. Only the
/// page daemon writes it; anyone may read it.
#[derive(Debug, Default)]
pub struct TrimmingCycle {
    active: AtomicBool,
}

impl TrimmingCycle {
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Free-page count below which trimming starts.
    pub const fn low_water(total_pages: usize) -> usize {
        total_pages / 8
    }

    /// Free-page count above which trimming stops.
    pub const fn high_water(total_pages: usize) -> usize {
        total_pages / 4
    }

    /// Applies the watermarks to the current free-page count and returns the new state.
    pub fn update(&self, free_pages: usize, total_pages: usize) -> bool {
        let active = self.is_active();
        if !active && free_pages < Self::low_water(total_pages) {
            self.active.store(true, Ordering::Relaxed);
            warn!(
                "free memory low ({} of {} pages), entering trimming cycle",
                free_pages, total_pages
            );
            true
        } else if active && free_pages > Self::high_water(total_pages) {
            self.active.store(false, Ordering::Relaxed);
            info!(
                "free memory recovered ({} of {} pages), leaving trimming cycle",
                free_pages, total_pages
            );
            false
        } else {
            active
        }
    }
}

/// The virtual-memory manager: configuration, collaborators, the address-space registry, the
/// kernel address space and the trimming-cycle flag.
///
/// Created once at VM bring-up and shared by reference with the page daemon.
pub struct VmManager {
    config: VmConfig,
    services: VmServices,
    registry: Arc<AddressSpaceRegistry>,
    trimming: TrimmingCycle,
    kernel: AddressSpaceRef,
}

impl VmManager {
    /// Brings up the manager and creates the kernel address space over
    /// `[kernel_base, kernel_base + kernel_size)`.
    pub fn new(
        config: VmConfig,
        services: VmServices,
        kernel_base: VirtualAddress,
        kernel_size: usize,
    ) -> VmResult<Arc<Self>> {
        config.validate()?;
        let registry = Arc::new(AddressSpaceRegistry::new());
        let kernel = build_space(
            &config,
            &services,
            &registry,
            TeamId::KERNEL,
            kernel_base,
            kernel_size,
            SpaceKind::Kernel,
        )?;
        Ok(Arc::new(Self {
            config,
            services,
            registry,
            trimming: TrimmingCycle::new(),
            kernel,
        }))
    }

    /// Creates and registers the address space of `team`.
    ///
    /// Fails with [`VmError::InvalidArgument`] if `team` already has a space, if a second
    /// kernel space is requested or if the range is empty, unaligned or wraps around, and with
    /// [`VmError::NoMemory`] if no translation map can be allocated.
    pub fn create_address_space(
        &self,
        team: TeamId,
        base: VirtualAddress,
        size: usize,
        kernel: bool,
    ) -> VmResult<AddressSpaceRef> {
        if kernel {
            return Err(VmError::InvalidArgument);
        }
        build_space(
            &self.config,
            &self.services,
            &self.registry,
            team,
            base,
            size,
            SpaceKind::Team,
        )
    }

    /// Returns a reference to the live address space of `team`.
    pub fn get_address_space(&self, team: TeamId) -> Option<AddressSpaceRef> {
        self.registry.get(team)
    }

    /// Returns a reference to the kernel address space.
    pub fn kernel_space(&self) -> AddressSpaceRef {
        self.kernel.acquire()
    }

    pub fn kernel_id(&self) -> TeamId {
        self.kernel.id()
    }

    pub fn registry(&self) -> &AddressSpaceRegistry {
        &self.registry
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn services(&self) -> &VmServices {
        &self.services
    }

    pub fn trimming(&self) -> &TrimmingCycle {
        &self.trimming
    }
}

fn build_space(
    config: &VmConfig,
    services: &VmServices,
    registry: &Arc<AddressSpaceRegistry>,
    team: TeamId,
    base: VirtualAddress,
    size: usize,
    kind: SpaceKind,
) -> VmResult<AddressSpaceRef> {
    if size == 0
        || !base.is_page_aligned()
        || !is_page_aligned(size)
        || base.checked_add(size).is_none()
    {
        return Err(VmError::InvalidArgument);
    }
    if registry.contains(team) {
        return Err(VmError::InvalidArgument);
    }

    let is_kernel = kind == SpaceKind::Kernel;
    let translation_map = services
        .maps
        .create_map(team, is_kernel)
        .map_err(|_| VmError::NoMemory)?;
    let (working_set, randomize) = if is_kernel {
        (config.kernel_working_set, false)
    } else {
        (config.team_working_set, config.randomize_team_spaces)
    };
    let space = AddressSpaceRef::new(AddressSpace::new(SpaceSetup {
        id: team,
        kind,
        base,
        size,
        translation_map,
        pages: services.pages.clone(),
        registry: Arc::downgrade(registry),
        working_set,
        randomize,
        now: services.threads.system_time(),
    }));
    registry.register(&space)?;
    info!(
        "created {} address space {} at {}-{} ({})",
        if is_kernel { "kernel" } else { "team" },
        team,
        space.base(),
        space.end(),
        HumanSize(size)
    );
    Ok(space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::HostVm;

    fn host() -> HostVm {
        HostVm::new(VmConfig::default(), 64).unwrap()
    }

    #[test]
    fn kernel_space_is_registered_at_bring_up() {
        let vm = host();
        let kernel = vm.manager.kernel_space();
        assert!(kernel.is_kernel());
        assert_eq!(kernel.id(), TeamId::KERNEL);
        assert_eq!(vm.manager.kernel_id(), TeamId::KERNEL);
        assert_eq!(kernel.read_lock().unwrap().layout_name(), "list");
        assert!(!kernel.read_lock().unwrap().is_randomizing());
        let found = vm.manager.get_address_space(TeamId::KERNEL).unwrap();
        assert!(AddressSpaceRef::ptr_eq(&kernel, &found));
    }

    #[test]
    fn create_validates_its_arguments() {
        let vm = host();
        let base = VirtualAddress::new(0x1000);
        let create = |team, base, size, kernel| {
            vm.manager
                .create_address_space(TeamId(team), base, size, kernel)
                .map(|_| ())
        };
        assert_eq!(create(2, base, 0x1000, true), Err(VmError::InvalidArgument));
        assert_eq!(create(2, base, 0, false), Err(VmError::InvalidArgument));
        assert_eq!(create(2, base, 0x1800, false), Err(VmError::InvalidArgument));
        assert_eq!(
            create(2, VirtualAddress::new(0x1010), 0x1000, false),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            create(2, VirtualAddress::new(usize::MAX & !0xfff), 0x2000, false),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(create(1, base, 0x1000, false), Err(VmError::InvalidArgument));
    }

    #[test]
    fn duplicate_team_is_rejected_until_the_first_is_gone() {
        let vm = host();
        let base = VirtualAddress::new(0x1000);
        let first = vm
            .manager
            .create_address_space(TeamId(2), base, 0x4000, false)
            .unwrap();
        assert_eq!(first.size(), 0x4000);
        assert_eq!(first.end(), VirtualAddress::new(0x4fff));
        assert!(matches!(
            vm.manager.create_address_space(TeamId(2), base, 0x4000, false),
            Err(VmError::InvalidArgument)
        ));
        drop(first);
        assert!(vm
            .manager
            .create_address_space(TeamId(2), base, 0x4000, false)
            .is_ok());
    }

    #[test]
    fn translation_map_failure_is_no_memory() {
        let vm = host();
        vm.maps.fail_next_creation();
        assert!(matches!(
            vm.manager
                .create_address_space(TeamId(3), VirtualAddress::new(0x1000), 0x4000, false),
            Err(VmError::NoMemory)
        ));
        assert!(vm.manager.get_address_space(TeamId(3)).is_none());
    }

    #[test]
    fn trimming_cycle_has_hysteresis() {
        let trimming = TrimmingCycle::new();
        let total = 800;
        assert!(!trimming.update(200, total));
        assert!(trimming.update(99, total));
        assert!(trimming.update(150, total));
        assert!(trimming.update(200, total));
        assert!(!trimming.update(201, total));
        assert!(!trimming.update(100, total));
        assert!(trimming.update(99, total));
    }
}
