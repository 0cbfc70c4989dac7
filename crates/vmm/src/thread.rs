//! The thread-control capability consumed by the reclamation daemon.

use alloc::boxed::Box;
use core::fmt;
use core::time::Duration;

use crate::VmResult;

/// Identifier of a kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority of a kernel thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadPriority(pub u8);

impl ThreadPriority {
    /// Background work that should only run when nothing else wants the CPU.
    pub const LOW: Self = Self(5);
    /// Ordinary kernel threads.
    pub const NORMAL: Self = Self(10);
}

/// Body of a kernel thread.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Scheduler operations needed to run the page daemon.
pub trait ThreadControl: Send + Sync {
    /// Creates a kernel thread that runs `entry`. The thread starts suspended and runs once
    /// [`resume`](Self::resume) is called.
    fn spawn_kernel_thread(&self, name: &str, entry: ThreadEntry) -> VmResult<ThreadId>;

    /// Lets a suspended thread run.
    fn resume(&self, thread: ThreadId) -> VmResult<()>;

    fn set_priority(&self, thread: ThreadId, priority: ThreadPriority) -> VmResult<()>;

    /// Puts the calling thread to sleep for `duration`.
    fn snooze(&self, duration: Duration);

    /// Monotonic time since boot.
    fn system_time(&self) -> Duration;
}
