//! Fault-rate driven working-set sizing.

use core::time::Duration;

use crate::{DaemonConfig, WorkingSetLimits};

/// Outcome of one adjustment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingSetChange {
    /// The adjustment interval has not elapsed yet.
    NotDue,
    /// The interval elapsed but neither guard condition held.
    Unchanged { faults_per_second: u64 },
    Grown { from: usize, to: usize },
    Shrunk { from: usize, to: usize },
}

/// The working-set target of one address space, in pages.
///
/// Growth needs a high fault rate *and* a space that actually maps at least its current
/// target; shrinking needs a low fault rate *and* a space mapping no more than its target.
/// A space that is neither over- nor under-committed therefore stays put, which keeps the
/// controller from oscillating. The size never leaves `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingSet {
    size: usize,
    min: usize,
    max: usize,
    last_adjust: Duration,
}

impl WorkingSet {
    /// Starts a working set at `limits.initial` (clamped into the limits).
    pub fn new(limits: WorkingSetLimits, now: Duration) -> Self {
        Self {
            size: limits.initial.clamp(limits.min, limits.max.max(limits.min)),
            min: limits.min,
            max: limits.max.max(limits.min),
            last_adjust: now,
        }
    }

    /// Current target in pages.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Time of the last adjustment.
    pub fn last_adjust(&self) -> Duration {
        self.last_adjust
    }

    /// Returns true once more than the adjustment interval has passed since the last one.
    pub fn is_due(&self, now: Duration, config: &DaemonConfig) -> bool {
        now.saturating_sub(self.last_adjust) > config.working_set_adjust_interval
    }

    /// Adjusts the target from `faults` observed since the last adjustment.
    ///
    /// The caller resets its fault counter only when this returns something other than
    /// [`WorkingSetChange::NotDue`].
    pub fn adjust(
        &mut self,
        now: Duration,
        faults: usize,
        mapped_pages: usize,
        config: &DaemonConfig,
    ) -> WorkingSetChange {
        if !self.is_due(now, config) {
            return WorkingSetChange::NotDue;
        }

        let elapsed_us = now.saturating_sub(self.last_adjust).as_micros().max(1);
        let faults_per_second = ((faults as u128) * 1_000_000 / elapsed_us) as u64;
        self.last_adjust = now;

        let from = self.size;
        if faults_per_second > config.max_faults_per_second
            && mapped_pages >= self.size
            && self.size < self.max
        {
            self.size = self
                .size
                .saturating_add(config.working_set_increment)
                .min(self.max);
            WorkingSetChange::Grown {
                from,
                to: self.size,
            }
        } else if faults_per_second < config.min_faults_per_second
            && mapped_pages <= self.size
            && self.size > self.min
        {
            self.size = self
                .size
                .saturating_sub(config.working_set_decrement)
                .max(self.min);
            WorkingSetChange::Shrunk {
                from,
                to: self.size,
            }
        } else {
            WorkingSetChange::Unchanged { faults_per_second }
        }
    }
}
