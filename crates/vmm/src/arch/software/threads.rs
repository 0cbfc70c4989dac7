//! Kernel threads emulated with host threads.

use std::collections::BTreeMap;
use std::string::{String, ToString};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::debug;

use crate::{ThreadControl, ThreadEntry, ThreadId, ThreadPriority, VmError, VmResult};

/// Blocks a freshly spawned thread until it is resumed.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Gate {
    fn open(&self) {
        *lock(&self.open) = true;
        self.opened.notify_all();
    }

    fn wait(&self) {
        let mut open = lock(&self.open);
        while !*open {
            open = self.opened.wait(open).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct HostThread {
    name: String,
    priority: ThreadPriority,
    gate: Arc<Gate>,
    handle: Option<JoinHandle<()>>,
}

/// [`ThreadControl`] on top of `std::thread`.
pub struct HostThreads {
    epoch: Instant,
    threads: Mutex<BTreeMap<ThreadId, HostThread>>,
    next_id: Mutex<u64>,
}

impl HostThreads {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            threads: Mutex::new(BTreeMap::new()),
            next_id: Mutex::new(1),
        }
    }

    pub fn priority(&self, thread: ThreadId) -> Option<ThreadPriority> {
        lock(&self.threads).get(&thread).map(|t| t.priority)
    }

    pub fn name(&self, thread: ThreadId) -> Option<String> {
        lock(&self.threads).get(&thread).map(|t| t.name.clone())
    }

    /// Waits for `thread` to finish. Returns false if it is unknown, already joined or
    /// panicked.
    pub fn join(&self, thread: ThreadId) -> bool {
        let handle = lock(&self.threads)
            .get_mut(&thread)
            .and_then(|t| t.handle.take());
        handle.is_some_and(|handle| handle.join().is_ok())
    }
}

impl Default for HostThreads {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadControl for HostThreads {
    fn spawn_kernel_thread(&self, name: &str, entry: ThreadEntry) -> VmResult<ThreadId> {
        let id = {
            let mut next = lock(&self.next_id);
            let id = ThreadId(*next);
            *next += 1;
            id
        };
        let gate = Arc::new(Gate::default());
        let waiter = gate.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                waiter.wait();
                entry();
            })
            .map_err(|_| VmError::NoMemory)?;
        lock(&self.threads).insert(
            id,
            HostThread {
                name: name.to_string(),
                priority: ThreadPriority::NORMAL,
                gate,
                handle: Some(handle),
            },
        );
        debug!("spawned host thread {} ({})", id, name);
        Ok(id)
    }

    fn resume(&self, thread: ThreadId) -> VmResult<()> {
        let gate = lock(&self.threads)
            .get(&thread)
            .map(|t| t.gate.clone())
            .ok_or(VmError::NotFound)?;
        gate.open();
        Ok(())
    }

    fn set_priority(&self, thread: ThreadId, priority: ThreadPriority) -> VmResult<()> {
        let mut threads = lock(&self.threads);
        let entry = threads.get_mut(&thread).ok_or(VmError::NotFound)?;
        entry.priority = priority;
        Ok(())
    }

    fn snooze(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn system_time(&self) -> Duration {
        self.epoch.elapsed()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn threads_stay_suspended_until_resumed() {
        let threads = HostThreads::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let id = threads
            .spawn_kernel_thread("worker", Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));

        threads.set_priority(id, ThreadPriority::LOW).unwrap();
        threads.resume(id).unwrap();
        assert!(threads.join(id));
        assert!(ran.load(Ordering::SeqCst));
        assert!(!threads.join(id));
        assert_eq!(threads.priority(id), Some(ThreadPriority::LOW));
        assert_eq!(threads.name(id).as_deref(), Some("worker"));
    }

    #[test]
    fn unknown_threads_are_not_found() {
        let threads = HostThreads::new();
        assert_eq!(threads.resume(ThreadId(42)), Err(VmError::NotFound));
        assert_eq!(
            threads.set_priority(ThreadId(42), ThreadPriority::LOW),
            Err(VmError::NotFound)
        );
        assert!(threads.system_time() < Duration::from_secs(60));
    }
}
