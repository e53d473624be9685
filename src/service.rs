// EMS SERVICE POOLS
// A CGROUP DECLARING A SERVICE LEVEL GETS ITS TASKS PLACED INTO ONE OF
// THREE DISJOINT CPU POOLS BY ESTIMATED UTILIZATION:
//   util < light_threshold            -> light pool
//   util >= heavy_threshold           -> heavy pool
//   otherwise                         -> medium pool

use log::warn;

use crate::config::ServiceConfig;
use crate::placement::pick_idle_or_least;
use crate::topology::CpuMask;
use crate::view::{SystemView, TaskView};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceLevel {
    pub level: u32,
    pub light_threshold: u64,
    pub heavy_threshold: u64,
    pub light: CpuMask,
    pub medium: CpuMask,
    pub heavy: CpuMask,
}

impl ServiceLevel {
    pub fn pool(&self, util: u64) -> CpuMask {
        if util < self.light_threshold {
            self.light
        } else if util >= self.heavy_threshold {
            self.heavy
        } else {
            self.medium
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ServicePools {
    levels: Vec<ServiceLevel>,
}

impl ServicePools {
    // ENTRIES WERE VALIDATED WITH THE PLATFORM; A STRAY ONE IS SKIPPED
    pub fn from_config(services: &[ServiceConfig], nr_cpus: usize) -> Self {
        let possible = CpuMask::first_n(nr_cpus);
        let mut levels = Vec::new();
        for s in services {
            let masks = (CpuMask::parse(&s.light_cpus), CpuMask::parse(&s.medium_cpus),
                         CpuMask::parse(&s.heavy_cpus));
            match masks {
                (Ok(light), Ok(medium), Ok(heavy)) => levels.push(ServiceLevel {
                    level: s.level,
                    light_threshold: s.light_threshold,
                    heavy_threshold: s.heavy_threshold,
                    light: light.and(possible),
                    medium: medium.and(possible),
                    heavy: heavy.and(possible),
                }),
                _ => warn!("service level {}: bad cpu list, skipped", s.level),
            }
        }
        Self { levels }
    }

    pub fn level(&self, level: u32) -> Option<&ServiceLevel> {
        self.levels.iter().find(|l| l.level == level)
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn select(&self, view: &SystemView, task: &TaskView) -> Option<usize> {
        if task.group.service == 0 {
            return None;
        }
        let level = self.level(task.group.service)?;
        let pool = level.pool(view.task_util_est(task));
        pick_idle_or_least(view, task, view.candidates(task, pool))
    }
}
