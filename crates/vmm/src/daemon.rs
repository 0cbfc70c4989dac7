//! The page daemon.
//!
//! One kernel thread that wakes every [`DaemonConfig::interval`](crate::DaemonConfig), visits
//! every address space, resizes its working set from its fault rate and, while free memory is
//! short, scans it to steal the pages mapped beyond that working set.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use core::time::Duration;

use log::{debug, info};

use crate::{PAGE_SIZE, RegionScanner, ThreadId, VmManager, VmResult, WorkingSetChange};

/// What the daemon is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DaemonState {
    Sleeping = 0,
    AdjustingWorkingSet = 1,
    Scanning = 2,
    /// Terminal; entered on shutdown.
    Stopped = 3,
}

impl DaemonState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Sleeping,
            1 => Self::AdjustingWorkingSet,
            2 => Self::Scanning,
            _ => Self::Stopped,
        }
    }
}

/// Summary of one daemon cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub spaces: usize,
    pub examined: usize,
    pub stolen: usize,
    pub dirtied: usize,
    /// Whether the trimming cycle was active at the end of the cycle.
    pub trimming: bool,
}

pub struct ReclamationDaemon {
    manager: Arc<VmManager>,
    scanner: RegionScanner,
    state: AtomicU8,
    cycles: AtomicU64,
    stop: AtomicBool,
}

impl ReclamationDaemon {
    pub fn new(manager: Arc<VmManager>) -> Self {
        let scanner = RegionScanner::new(manager.config().daemon.scan_quantum);
        Self {
            manager,
            scanner,
            state: AtomicU8::new(DaemonState::Sleeping as u8),
            cycles: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        }
    }

    /// Starts the daemon on its own kernel thread.
    pub fn spawn(manager: Arc<VmManager>) -> VmResult<DaemonHandle> {
        let threads = manager.services().threads.clone();
        let priority = manager.config().daemon.priority;
        let daemon = Arc::new(Self::new(manager));
        let worker = daemon.clone();
        let thread = threads.spawn_kernel_thread("page daemon", Box::new(move || worker.run()))?;
        threads.set_priority(thread, priority)?;
        threads.resume(thread)?;
        info!("page daemon started as thread {}", thread);
        Ok(DaemonHandle { daemon, thread })
    }

    pub fn state(&self) -> DaemonState {
        DaemonState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Number of completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Acquire)
    }

    /// Runs one cycle at the current system time.
    pub fn run_cycle(&self) -> CycleReport {
        let now = self.manager.services().threads.system_time();
        self.run_cycle_at(now)
    }

    /// Runs one cycle as if the current time were `now`.
    pub fn run_cycle_at(&self, now: Duration) -> CycleReport {
        let config = self.manager.config().daemon;
        let memory = &self.manager.services().memory;
        let trimming = self.manager.trimming();
        let mut report = CycleReport::default();

        for space in self.manager.registry().walk() {
            self.set_state(DaemonState::AdjustingWorkingSet);
            let mapped_pages = space.mapped_size() / PAGE_SIZE;
            match space.adjust_working_set(now, mapped_pages, &config) {
                WorkingSetChange::Grown { from, to } => {
                    debug!("space {}: working set grown {} -> {} pages", space.id(), from, to)
                }
                WorkingSetChange::Shrunk { from, to } => {
                    debug!("space {}: working set shrunk {} -> {} pages", space.id(), from, to)
                }
                WorkingSetChange::Unchanged { .. } | WorkingSetChange::NotDue => {}
            }

            let target = if trimming.update(memory.free_pages(), memory.total_pages()) {
                mapped_pages.saturating_sub(space.working_set().size())
            } else {
                0
            };

            self.set_state(DaemonState::Scanning);
            let scan = self.scanner.scan(&space, target);
            report.spaces += 1;
            report.examined += scan.examined;
            report.stolen += scan.stolen;
            report.dirtied += scan.dirtied;
        }

        report.trimming = trimming.is_active();
        self.set_state(DaemonState::Sleeping);
        self.cycles.fetch_add(1, Ordering::AcqRel);
        debug!(
            "page daemon cycle: {} spaces, {} pages examined, {} stolen, {} dirtied",
            report.spaces, report.examined, report.stolen, report.dirtied
        );
        report
    }

    fn run(&self) {
        let threads = &self.manager.services().threads;
        let interval = self.manager.config().daemon.interval;
        while !self.stop.load(Ordering::Acquire) {
            self.run_cycle();
            threads.snooze(interval);
        }
        self.set_state(DaemonState::Stopped);
        info!("page daemon stopped after {} cycles", self.cycles());
    }

    fn set_state(&self, state: DaemonState) {
        if self.state() != DaemonState::Stopped {
            self.state.store(state as u8, Ordering::Release);
        }
    }
}

/// Handle to a running page daemon.
pub struct DaemonHandle {
    daemon: Arc<ReclamationDaemon>,
    thread: ThreadId,
}

impl DaemonHandle {
    pub fn daemon(&self) -> &ReclamationDaemon {
        &self.daemon
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Asks the daemon to stop after its current cycle.
    pub fn stop(&self) {
        self.daemon.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::software::HostVm;
    use crate::{
        AddressRestrictions, AddressSpaceRef, BackingStore, DaemonConfig, PageFlags, TeamId,
        ThreadPriority, VirtualAddress, VmConfig, WorkingSetLimits,
    };

    const TEAM: TeamId = TeamId(4);

    fn config() -> VmConfig {
        VmConfig::default()
            .with_randomization(false)
            .with_team_working_set(WorkingSetLimits {
                initial: 2,
                min: 2,
                max: 64,
            })
            .with_daemon(
                DaemonConfig::default()
                    .with_interval(Duration::from_millis(5))
                    .with_adjust_interval(Duration::from_secs(20))
                    .with_scan_quantum(64),
            )
    }

    fn populated_space(vm: &HostVm, pages: usize) -> AddressSpaceRef {
        let space = vm
            .manager
            .create_address_space(TEAM, VirtualAddress::new(0x1000), 0x10_0000, false)
            .unwrap();
        space
            .write_lock()
            .unwrap()
            .insert_region(
                "heap",
                pages * PAGE_SIZE,
                PageFlags::WRITABLE,
                BackingStore::new("anon"),
                AddressRestrictions::exact(VirtualAddress::new(0x1000)),
            )
            .unwrap();
        vm.populate(&space, VirtualAddress::new(0x1000)).unwrap();
        space
    }

    #[test]
    fn idle_cycle_steals_nothing() {
        let vm = HostVm::new(config(), 64).unwrap();
        let space = populated_space(&vm, 8);
        let daemon = ReclamationDaemon::new(vm.manager.clone());

        let report = daemon.run_cycle_at(Duration::from_secs(1));
        assert_eq!(report.spaces, 2);
        assert_eq!(report.stolen, 0);
        assert!(!report.trimming);
        assert_eq!(space.mapped_size(), 8 * PAGE_SIZE);
        assert_eq!(daemon.cycles(), 1);
        assert_eq!(daemon.state(), DaemonState::Sleeping);
    }

    #[test]
    fn memory_pressure_trims_down_to_the_working_set() {
        let vm = HostVm::new(config(), 64).unwrap();
        let space = populated_space(&vm, 8);
        let daemon = ReclamationDaemon::new(vm.manager.clone());

        vm.frames.set_free_pages(Some(4));
        let report = daemon.run_cycle_at(Duration::from_secs(1));
        assert!(report.trimming);
        assert_eq!(report.stolen, 6);
        assert_eq!(space.mapped_size(), 2 * PAGE_SIZE);

        // Still below the high watermark: trimming continues but there is nothing left above
        // the working set.
        vm.frames.set_free_pages(Some(12));
        let report = daemon.run_cycle_at(Duration::from_secs(2));
        assert!(report.trimming);
        assert_eq!(report.stolen, 0);

        vm.frames.set_free_pages(Some(17));
        assert!(!daemon.run_cycle_at(Duration::from_secs(3)).trimming);
    }

    #[test]
    fn high_fault_rate_grows_the_working_set() {
        let vm = HostVm::new(config(), 64).unwrap();
        let space = populated_space(&vm, 8);
        let daemon = ReclamationDaemon::new(vm.manager.clone());
        let start = space.working_set().last_adjust();
        for _ in 0..100_000 {
            space.record_fault();
        }

        daemon.run_cycle_at(start + Duration::from_secs(21));
        assert_eq!(space.working_set().size(), 2 + 16);
        assert_eq!(space.fault_count(), 0);
    }

    #[test]
    fn spawned_daemon_runs_until_stopped() {
        let vm = HostVm::new(config(), 64).unwrap();
        let handle = ReclamationDaemon::spawn(vm.manager.clone()).unwrap();
        assert_eq!(vm.threads.priority(handle.thread()), Some(ThreadPriority::LOW));
        assert_eq!(vm.threads.name(handle.thread()).as_deref(), Some("page daemon"));

        let deadline = Instant::now() + std::time::Duration::from_secs(10);
        while handle.daemon().cycles() < 2 {
            assert!(Instant::now() < deadline, "page daemon made no progress");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        handle.stop();
        assert!(vm.threads.join(handle.thread()));
        assert_eq!(handle.daemon().state(), DaemonState::Stopped);
    }
}
