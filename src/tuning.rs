// EMS TUNING
// LIVE TUNABLES THE CORE POLLS ON EVERY DECISION, PLUS FIXED CONSTANTS.
// ATOMICS ONLY: WRITERS (CLI, SIMULATION SCRIPT) NEVER BLOCK THE HOT PATH.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::config::FeatureConfig;
use crate::part::PartPolicy;
use crate::view::Features;

// SCHEDULER TICK, HZ=250
pub const TICK_NSEC: u64 = 4_000_000;

// GLOBAL BOOST HOLDS FOR THIS LONG AFTER BOOT
pub const BOOT_BOOST_NS: u64 = 40_000_000_000;

// ONTIME INSPECTS AT MOST THIS MANY QUEUED TASKS PER CPU
pub const ONTIME_MIGRATION_WINDOW: usize = 5;

pub const DEFAULT_TINY_TASK_LEVEL: u64 = 10;
pub const DEFAULT_COVERAGE_RATIO: u64 = 80;
// CGROUP SLOTS FOR PER-GROUP PERFORMANCE REQUESTS
pub const NR_CGROUPS: usize = 8;

pub struct Tunables {
    energy_aware: AtomicBool,
    util_est: AtomicBool,
    sync_hint: AtomicBool,
    eff_mode: AtomicBool,
    ontime: AtomicBool,
    part: AtomicBool,
    part_policy: AtomicU8,
    tiny_task_level: AtomicU64,
    tiny_task_cpu: AtomicUsize,
}

impl Tunables {
    pub fn new() -> Self {
        Self {
            energy_aware: AtomicBool::new(true),
            util_est: AtomicBool::new(true),
            sync_hint: AtomicBool::new(true),
            eff_mode: AtomicBool::new(false),
            ontime: AtomicBool::new(true),
            part: AtomicBool::new(false),
            part_policy: AtomicU8::new(PartPolicy::MaxRecentLast as u8),
            tiny_task_level: AtomicU64::new(DEFAULT_TINY_TASK_LEVEL),
            tiny_task_cpu: AtomicUsize::new(0),
        }
    }

    pub fn from_features(f: &FeatureConfig) -> Self {
        let t = Self::new();
        t.set_energy_aware(f.energy_aware);
        t.set_util_est(f.util_est);
        t.set_sync_hint(f.sync_hint);
        t.set_eff_mode(f.eff_mode);
        t.set_ontime(f.ontime);
        t.set_part(f.part);
        t.set_tiny_task_level(f.tiny_task_level);
        t.set_tiny_task_cpu(f.tiny_task_cpu);
        t
    }

    // ONE CONSISTENT-ENOUGH COPY FOR A DECISION PASS
    pub fn features(&self) -> Features {
        Features {
            energy_aware: self.energy_aware.load(Ordering::Relaxed),
            util_est: self.util_est.load(Ordering::Relaxed),
            sync_hint: self.sync_hint.load(Ordering::Relaxed),
            eff_mode: self.eff_mode.load(Ordering::Relaxed),
            ontime: self.ontime.load(Ordering::Relaxed),
            tiny_task_level: self.tiny_task_level.load(Ordering::Relaxed),
            tiny_task_cpu: self.tiny_task_cpu.load(Ordering::Relaxed),
        }
    }

    pub fn set_energy_aware(&self, v: bool) {
        self.energy_aware.store(v, Ordering::Relaxed);
    }

    pub fn set_util_est(&self, v: bool) {
        self.util_est.store(v, Ordering::Relaxed);
    }

    pub fn util_est(&self) -> bool {
        self.util_est.load(Ordering::Relaxed)
    }

    pub fn set_sync_hint(&self, v: bool) {
        self.sync_hint.store(v, Ordering::Relaxed);
    }

    pub fn set_eff_mode(&self, v: bool) {
        self.eff_mode.store(v, Ordering::Relaxed);
    }

    pub fn set_ontime(&self, v: bool) {
        self.ontime.store(v, Ordering::Relaxed);
    }

    pub fn ontime(&self) -> bool {
        self.ontime.load(Ordering::Relaxed)
    }

    pub fn set_part(&self, v: bool) {
        self.part.store(v, Ordering::Relaxed);
    }

    pub fn part(&self) -> bool {
        self.part.load(Ordering::Relaxed)
    }

    pub fn set_part_policy(&self, p: PartPolicy) {
        self.part_policy.store(p as u8, Ordering::Relaxed);
    }

    pub fn part_policy(&self) -> PartPolicy {
        PartPolicy::from_u8(self.part_policy.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn set_tiny_task_level(&self, v: u64) {
        self.tiny_task_level.store(v, Ordering::Relaxed);
    }

    pub fn set_tiny_task_cpu(&self, cpu: usize) {
        self.tiny_task_cpu.store(cpu, Ordering::Relaxed);
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let t = Tunables::new();
        let f = t.features();
        assert!(f.energy_aware);
        assert!(f.util_est);
        assert!(!f.eff_mode);
        assert_eq!(f.tiny_task_level, DEFAULT_TINY_TASK_LEVEL);
        assert_eq!(t.part_policy(), PartPolicy::MaxRecentLast);
    }

    #[test]
    fn config_seeds_switches() {
        let f = FeatureConfig { eff_mode: true, ontime: false, ..Default::default() };
        let t = Tunables::from_features(&f);
        assert!(t.features().eff_mode);
        assert!(!t.ontime());
    }

    #[test]
    fn live_updates_visible_in_next_snapshot() {
        let t = Tunables::new();
        t.set_eff_mode(true);
        t.set_energy_aware(false);
        t.set_part_policy(PartPolicy::Recent);
        let f = t.features();
        assert!(f.eff_mode);
        assert!(!f.energy_aware);
        assert_eq!(t.part_policy(), PartPolicy::Recent);
    }
}
