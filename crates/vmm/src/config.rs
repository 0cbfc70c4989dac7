//! Tunables for address spaces and the reclamation daemon.
//!
//! The constants are the defaults used at VM bring-up; [`VmConfig`] lets the embedding kernel
//! (or a test) override them before the manager is created.

use core::time::Duration;

use crate::{ThreadPriority, VmError, VmResult};

/// Time the page daemon sleeps between cycles.
pub const PAGE_DAEMON_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum time between two working-set adjustments of the same address space.
pub const WORKING_SET_ADJUST_INTERVAL: Duration = Duration::from_secs(20);

/// Fault rate above which a working set is allowed to grow.
pub const MAX_FAULTS_PER_SECOND: u64 = 1000;

/// Fault rate below which a working set is allowed to shrink.
pub const MIN_FAULTS_PER_SECOND: u64 = 100;

/// Pages added to a working set per adjustment.
pub const WORKING_SET_INCREMENT: usize = 16;

/// Pages removed from a working set per adjustment.
pub const WORKING_SET_DECREMENT: usize = 16;

/// Pages examined per address space per daemon cycle.
pub const PAGE_SCAN_QUANTUM: usize = 512;

/// Upper bound of the random offset applied to randomised placements.
pub const MAX_RANDOMIZE: usize = 8 * 1024 * 1024;

/// Working-set bounds of one kind of address space, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingSetLimits {
    /// Size a new space starts with.
    pub initial: usize,
    /// The controller never shrinks below this.
    pub min: usize,
    /// The controller never grows above this.
    pub max: usize,
}

impl WorkingSetLimits {
    /// Defaults for team address spaces.
    pub const TEAM: Self = Self {
        initial: 32,
        min: 32,
        max: 4096,
    };

    /// Defaults for the kernel address space.
    pub const KERNEL: Self = Self {
        initial: 4096,
        min: 1024,
        max: 65536,
    };

    /// Checks `min <= initial <= max`.
    pub fn validate(&self) -> VmResult<()> {
        if self.min <= self.initial && self.initial <= self.max {
            Ok(())
        } else {
            Err(VmError::InvalidArgument)
        }
    }
}

/// Settings of the reclamation daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonConfig {
    pub interval: Duration,
    pub working_set_adjust_interval: Duration,
    pub max_faults_per_second: u64,
    pub min_faults_per_second: u64,
    /// Pages.
    pub working_set_increment: usize,
    /// Pages.
    pub working_set_decrement: usize,
    /// Pages examined per address space per cycle.
    pub scan_quantum: usize,
    pub priority: ThreadPriority,
}

impl DaemonConfig {
    /// Replaces the sleep interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Replaces the working-set adjustment interval.
    pub fn with_adjust_interval(mut self, interval: Duration) -> Self {
        self.working_set_adjust_interval = interval;
        self
    }

    /// Replaces the scan quantum.
    pub fn with_scan_quantum(mut self, pages: usize) -> Self {
        self.scan_quantum = pages;
        self
    }

    /// Replaces both fault-rate thresholds.
    pub fn with_fault_thresholds(mut self, min_per_second: u64, max_per_second: u64) -> Self {
        self.min_faults_per_second = min_per_second;
        self.max_faults_per_second = max_per_second;
        self
    }

    /// Replaces the working-set step sizes.
    pub fn with_working_set_steps(mut self, increment: usize, decrement: usize) -> Self {
        self.working_set_increment = increment;
        self.working_set_decrement = decrement;
        self
    }

    pub fn validate(&self) -> VmResult<()> {
        if self.scan_quantum == 0 || self.min_faults_per_second > self.max_faults_per_second {
            return Err(VmError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            interval: PAGE_DAEMON_INTERVAL,
            working_set_adjust_interval: WORKING_SET_ADJUST_INTERVAL,
            max_faults_per_second: MAX_FAULTS_PER_SECOND,
            min_faults_per_second: MIN_FAULTS_PER_SECOND,
            working_set_increment: WORKING_SET_INCREMENT,
            working_set_decrement: WORKING_SET_DECREMENT,
            scan_quantum: PAGE_SCAN_QUANTUM,
            priority: ThreadPriority::LOW,
        }
    }
}

/// Configuration of the whole virtual-memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub daemon: DaemonConfig,
    pub kernel_working_set: WorkingSetLimits,
    pub team_working_set: WorkingSetLimits,
    /// Randomise `Any` placements in team address spaces.
    pub randomize_team_spaces: bool,
}

impl VmConfig {
    /// Replaces the daemon settings.
    pub fn with_daemon(mut self, daemon: DaemonConfig) -> Self {
        self.daemon = daemon;
        self
    }

    /// Replaces the working-set bounds of team spaces.
    pub fn with_team_working_set(mut self, limits: WorkingSetLimits) -> Self {
        self.team_working_set = limits;
        self
    }

    /// Enables or disables placement randomisation for team spaces.
    pub fn with_randomization(mut self, enabled: bool) -> Self {
        self.randomize_team_spaces = enabled;
        self
    }

    /// Checks every nested setting.
    pub fn validate(&self) -> VmResult<()> {
        self.daemon.validate()?;
        self.kernel_working_set.validate()?;
        self.team_working_set.validate()
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            kernel_working_set: WorkingSetLimits::KERNEL,
            team_working_set: WorkingSetLimits::TEAM,
            randomize_team_spaces: true,
        }
    }
}
