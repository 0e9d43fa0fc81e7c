//! Process memory counters
//!
//! Resident set size comes from `sysinfo`. Heap used and heap total come
//! from jemalloc's statistics and need the `jemalloc` feature, with the host
//! running jemalloc as its global allocator:
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;
//! ```
//!
//! Without it both heap counters report [`Error::CounterUnavailable`].

use crate::error::{Error, Result};
use std::sync::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Source of process memory counters, all in bytes
pub trait MemorySource: Send + Sync {
    /// Resident set size
    fn rss(&self) -> Result<u64>;

    /// Bytes currently allocated on the heap
    fn heap_used(&self) -> Result<u64>;

    /// Bytes the allocator holds resident for the heap
    fn heap_total(&self) -> Result<u64>;
}

#[cfg(all(unix, feature = "jemalloc"))]
mod jemalloc {
    use crate::error::{Error, Result};
    use tikv_jemalloc_ctl::{epoch, stats};

    fn unavailable(counter: &'static str, e: tikv_jemalloc_ctl::Error) -> Error {
        Error::CounterUnavailable {
            counter,
            reason: format!("jemalloc stats: {e}"),
        }
    }

    /// Stats are cached until the epoch advances
    fn refresh(counter: &'static str) -> Result<()> {
        epoch::advance().map_err(|e| unavailable(counter, e))?;
        Ok(())
    }

    pub fn allocated() -> Result<u64> {
        refresh("heap_used")?;
        stats::allocated::read()
            .map(|bytes| bytes as u64)
            .map_err(|e| unavailable("heap_used", e))
    }

    pub fn resident() -> Result<u64> {
        refresh("heap_total")?;
        stats::resident::read()
            .map(|bytes| bytes as u64)
            .map_err(|e| unavailable("heap_total", e))
    }
}

#[cfg(not(all(unix, feature = "jemalloc")))]
mod jemalloc {
    use crate::error::{Error, Result};

    fn disabled(counter: &'static str) -> Error {
        Error::CounterUnavailable {
            counter,
            reason: "built without the jemalloc feature".to_string(),
        }
    }

    pub fn allocated() -> Result<u64> {
        Err(disabled("heap_used"))
    }

    pub fn resident() -> Result<u64> {
        Err(disabled("heap_total"))
    }
}

/// Memory counters of the current process, read through `sysinfo`
pub struct ProcessMemory {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMemory {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to get current PID, memory counters disabled");
                None
            }
        };

        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }

    /// Refresh the current process and read one of its counters
    fn read_process<F>(&self, counter: &'static str, read: F) -> Result<u64>
    where
        F: Fn(&sysinfo::Process) -> u64,
    {
        let pid = self.pid.ok_or_else(|| Error::CounterUnavailable {
            counter,
            reason: "current pid is unknown".to_string(),
        })?;

        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);

        system
            .process(pid)
            .map(read)
            .ok_or_else(|| Error::CounterUnavailable {
                counter,
                reason: format!("process {pid} not found"),
            })
    }
}

impl MemorySource for ProcessMemory {
    fn rss(&self) -> Result<u64> {
        self.read_process("rss", |process| process.memory())
    }

    fn heap_used(&self) -> Result<u64> {
        jemalloc::allocated()
    }

    fn heap_total(&self) -> Result<u64> {
        jemalloc::resident()
    }
}
