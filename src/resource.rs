//! System resource detection and tier sizing.
//!
//! Detects available RAM and CPU cores and derives tier capacities and the
//! bleed worker count from them. Stateless: each call re-probes the system.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

// ── Constants ───────────────────────────────────────────────────────

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

const FAST_FRACTION: f64 = 0.005;
const FAST_MIN: u64 = 4 * MIB;
const FAST_MAX: u64 = 256 * MIB;

const MEDIUM_FRACTION: f64 = 0.05;
const MEDIUM_MIN: u64 = 64 * MIB;
const MEDIUM_MAX: u64 = 4 * GIB;

/// Slow tier capacity as a multiple of the medium tier.
const SLOW_MULTIPLIER: u64 = 64;

// ── SystemResources ─────────────────────────────────────────────────

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub cpu_count: usize,
}

impl SystemResources {
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

    /// 0.0 = no pressure, 1.0 = critical.
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

// ── TierSizing ──────────────────────────────────────────────────────

/// Capacities derived from system resources.
#[derive(Debug, Clone, PartialEq)]
pub struct TierSizing {
    pub fast_bytes: u64,
    pub medium_bytes: u64,
    pub slow_bytes: u64,
    pub bleed_workers: usize,
    pub memory_pressure: f64,
}

impl TierSizing {
    /// - fast: `clamp(available × 0.5 %, 4 MiB, 256 MiB)`
    /// - medium: `clamp(available × 5 %, 64 MiB, 4 GiB)`
    /// - slow: `64 × medium`
    /// - bleed workers: `clamp(cpus / 2, 1, 4)`
    pub fn from_resources(res: &SystemResources) -> Self {
        let avail = res.available_memory_bytes as f64;
        let fast_bytes = ((avail * FAST_FRACTION) as u64).clamp(FAST_MIN, FAST_MAX);
        let medium_bytes = ((avail * MEDIUM_FRACTION) as u64).clamp(MEDIUM_MIN, MEDIUM_MAX);
        Self {
            fast_bytes,
            medium_bytes,
            slow_bytes: medium_bytes.saturating_mul(SLOW_MULTIPLIER),
            bleed_workers: (res.cpu_count / 2).clamp(1, 4),
            memory_pressure: res.memory_pressure(),
        }
    }
}

/// Probe the system and size the tiers.
pub fn auto_size() -> TierSizing {
    TierSizing::from_resources(&SystemResources::detect())
}
