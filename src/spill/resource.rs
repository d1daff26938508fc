//! System resource detection and memory probing for the spill controller.
//!
//! `SystemResources` snapshots RAM and CPU once; `TuningProfile` derives
//! thread counts from it. `MemoryProbe` is sampled repeatedly during
//! ingestion to measure pressure against the configured budget.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sysinfo::{MemoryRefreshKind, Pid, RefreshKind, System};

// ── Constants ───────────────────────────────────────────────────────

const GB: u64 = 1024 * 1024 * 1024;

/// Upper bound on parallel flush writers.
const MAX_FLUSH_THREADS: usize = 4;

// ── SystemResources ─────────────────────────────────────────────────

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total physical RAM in bytes.
    pub total_memory_bytes: u64,
    /// Available (re-usable) RAM in bytes.
    pub available_memory_bytes: u64,
    /// Logical CPU count.
    pub cpu_count: usize,
}

impl SystemResources {
    /// Probe the current system for RAM and CPU information.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }

    /// Memory pressure indicator (0.0 = no pressure, 1.0 = critical).
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

// ── TuningProfile ───────────────────────────────────────────────────

/// Thread counts derived from the host.
#[derive(Debug, Clone)]
pub struct TuningProfile {
    /// Threads encoding and writing leaves during a flush.
    pub flush_threads: usize,
    /// Workers for full-directory scans.
    pub scan_workers: usize,
    pub memory_pressure: f64,
}

impl TuningProfile {
    /// - `flush_threads`: RAM < 4 GB -> 1, else `clamp(cpu / 2, 1, 4)`.
    /// - `scan_workers`: `clamp(cpu, 1, 8)`.
    pub fn from_resources(res: &SystemResources) -> Self {
        let total_gb = res.total_memory_bytes as f64 / GB as f64;
        let flush_threads = if total_gb < 4.0 {
            1
        } else {
            (res.cpu_count / 2).clamp(1, MAX_FLUSH_THREADS)
        };
        Self {
            flush_threads,
            scan_workers: res.cpu_count.clamp(1, 8),
            memory_pressure: res.memory_pressure(),
        }
    }
}

impl Default for TuningProfile {
    fn default() -> Self {
        Self {
            flush_threads: 1,
            scan_workers: 1,
            memory_pressure: 0.0,
        }
    }
}

/// Stateless: each call re-probes the system.
pub struct ResourceManager;

impl ResourceManager {
    pub fn auto_tune() -> TuningProfile {
        TuningProfile::from_resources(&SystemResources::detect())
    }
}

// ── Memory probing ──────────────────────────────────────────────────

/// Memory in use measured against a budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryUsage {
    pub used_bytes: u64,
    pub limit_bytes: u64,
}

impl MemoryUsage {
    /// Used fraction of the budget; 1.0 or more means over budget.
    pub fn fraction(&self) -> f64 {
        if self.limit_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.limit_bytes as f64
    }
}

pub trait MemoryProbe: Send {
    fn sample(&mut self) -> MemoryUsage;
}

/// Samples the resident set of this process via sysinfo.
///
/// The budget is the configured limit, or total RAM when none is set.
/// When the process cannot be inspected, system-wide usage is used.
pub struct SystemMemoryProbe {
    sys: System,
    pid: Option<Pid>,
    limit_bytes: Option<u64>,
}

impl SystemMemoryProbe {
    pub fn new(limit_bytes: Option<u64>) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = e, "cannot resolve own pid; falling back to system memory usage");
                None
            }
        };
        Self {
            sys: System::new_with_specifics(
                RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
            ),
            pid,
            limit_bytes,
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn sample(&mut self) -> MemoryUsage {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let process_rss = self.pid.and_then(|pid| {
            self.sys.refresh_process(pid);
            self.sys.process(pid).map(|p| p.memory())
        });
        let used_bytes = process_rss.unwrap_or_else(|| total.saturating_sub(self.sys.available_memory()));
        MemoryUsage {
            used_bytes,
            limit_bytes: self.limit_bytes.unwrap_or(total),
        }
    }
}

/// Probe reporting whatever was last stored in it. Clones share state.
#[derive(Debug, Clone)]
pub struct ManualProbe {
    used: Arc<AtomicU64>,
    limit_bytes: u64,
}

impl ManualProbe {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            used: Arc::new(AtomicU64::new(0)),
            limit_bytes,
        }
    }

    pub fn set_used(&self, bytes: u64) {
        self.used.store(bytes, Ordering::Relaxed);
    }

    /// Set usage as a fraction of the limit.
    pub fn set_fraction(&self, fraction: f64) {
        self.set_used((self.limit_bytes as f64 * fraction) as u64);
    }
}

impl MemoryProbe for ManualProbe {
    fn sample(&mut self) -> MemoryUsage {
        MemoryUsage {
            used_bytes: self.used.load(Ordering::Relaxed),
            limit_bytes: self.limit_bytes,
        }
    }
}
