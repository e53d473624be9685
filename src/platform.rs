// EMS PLATFORM
// HARDWARE DESCRIPTION SHARED BY THE SCHEDULER AND THE DVFS DRIVERS: CPU
// TOPOLOGY, THE ENERGY/CAPACITY MODEL AND THE PER-CPU FREQUENCY SCALE THE
// LOAD TRACKER USES FOR FREQUENCY INVARIANCE.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;

use crate::config::PlatformConfig;
use crate::energy::EnergyModel;
use crate::multi_load::{SCHED_CAPACITY_SCALE, SCHED_CAPACITY_SHIFT};
use crate::topology::{CpuMask, Topology};

pub struct Platform {
    topology: Topology,
    energy: RwLock<EnergyModel>,
    // cur / max << 10, PUBLISHED ON EVERY FREQUENCY CHANGE
    freq_scale: Vec<AtomicU64>,
}

impl Platform {
    pub fn new(topology: Topology, energy: EnergyModel) -> Self {
        let freq_scale = (0..topology.nr_cpus())
            .map(|_| AtomicU64::new(SCHED_CAPACITY_SCALE))
            .collect();
        Self { topology, energy: RwLock::new(energy), freq_scale }
    }

    // ENERGY TABLES ARE EMPTY UNTIL THE DVFS DRIVER REGISTERS ITS DOMAINS
    pub fn from_config(cfg: &PlatformConfig) -> Result<Self> {
        Ok(Self::new(cfg.topology()?, EnergyModel::new(cfg.energy_data()?)))
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn energy(&self) -> RwLockReadGuard<'_, EnergyModel> {
        match self.energy.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn energy_mut(&self) -> RwLockWriteGuard<'_, EnergyModel> {
        match self.energy.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_freq_scale(&self, cpus: CpuMask, cur: u64, max: u64) {
        if max == 0 {
            return;
        }
        let scale = ((cur << SCHED_CAPACITY_SHIFT) / max).min(SCHED_CAPACITY_SCALE);
        for cpu in cpus.iter() {
            if let Some(s) = self.freq_scale.get(cpu) {
                s.store(scale, Ordering::Relaxed);
            }
        }
    }

    pub fn freq_scale(&self, cpu: usize) -> u64 {
        self.freq_scale.get(cpu)
            .map(|s| s.load(Ordering::Relaxed))
            .unwrap_or(SCHED_CAPACITY_SCALE)
    }
}
