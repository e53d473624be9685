// EMS SYSTEM VIEW
// READ-ONLY SNAPSHOT OF PER-CPU AND PER-TASK LOAD STATE.
// PLACEMENT, ENERGY AND ONTIME DECISIONS ARE PURE FUNCTIONS OVER THIS.

use serde::{Deserialize, Serialize};

use crate::energy::EnergyModel;
use crate::multi_load::{
    apply_margin, schedtune_margin, Lane, LaneVec, UtilEst, NR_LANES, SCHED_CAPACITY_SHIFT,
    UTIL_AVG_UNCHANGED,
};
use crate::topology::{CpuMask, Topology};

pub type Pid = u32;

// OVERUTILIZED WHEN util * 1280 > capacity * 1024 (80%)
pub const CAPACITY_MARGIN: u64 = 1280;

// PER-CGROUP ATTRIBUTES A TASK CARRIES
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupAttrs {
    // CGROUP INDEX, 0 = ROOT
    pub cgroup: usize,
    pub boost: i32,
    pub prefer_perf: bool,
    pub prefer_idle: bool,
    // SERVICE LEVEL, 0 = NONE
    pub service: u32,
    pub util_est: bool,
}

impl Default for GroupAttrs {
    fn default() -> Self {
        Self { cgroup: 0, boost: 0, prefer_perf: false, prefer_idle: false, service: 0, util_est: true }
    }
}

// SNAPSHOT OF THE LIVE FEATURE SWITCHES
#[derive(Clone, Copy, Debug)]
pub struct Features {
    pub energy_aware: bool,
    pub util_est: bool,
    pub sync_hint: bool,
    pub eff_mode: bool,
    pub ontime: bool,
    pub tiny_task_level: u64,
    pub tiny_task_cpu: usize,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            energy_aware: true,
            util_est: true,
            sync_hint: true,
            eff_mode: false,
            ontime: true,
            tiny_task_level: 10,
            tiny_task_cpu: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CpuView {
    pub cpu: usize,
    pub online: bool,
    pub active: bool,
    pub util_avg: LaneVec,
    pub util_est: LaneVec,
    pub nr_running: usize,
    // CSTATE DEPTH WHILE IDLE
    pub idle_state: Option<usize>,
    // MAX BOOST OF THE GROUPS WITH TASKS HERE
    pub boost: i32,
}

impl CpuView {
    pub fn idle(cpu: usize) -> Self {
        Self { cpu, online: true, active: true, idle_state: Some(0), ..Default::default() }
    }

    pub fn is_idle(&self) -> bool {
        self.nr_running == 0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TaskView {
    pub pid: Pid,
    pub tgid: Pid,
    pub cpu: usize,
    pub lane: Lane,
    pub allowed: CpuMask,
    pub util_avg: u64,
    pub runnable_avg: u64,
    pub util_est: UtilEst,
    // CONTRIBUTING TO task.cpu'S AGGREGATE
    pub attached: bool,
    // ON A RUNQUEUE OR RUNNING
    pub queued: bool,
    pub group: GroupAttrs,
    pub band: Option<Pid>,
    pub ontime_migrating: bool,
}

pub struct SystemView<'a> {
    pub topology: &'a Topology,
    pub energy: &'a EnergyModel,
    pub cpus: Vec<CpuView>,
    pub features: Features,
}

impl<'a> SystemView<'a> {
    pub fn new(topology: &'a Topology, energy: &'a EnergyModel,
               cpus: Vec<CpuView>, features: Features) -> Self {
        Self { topology, energy, cpus, features }
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, cpu: usize) -> &CpuView {
        &self.cpus[cpu]
    }

    pub fn active_mask(&self) -> CpuMask {
        CpuMask::from_cpus(self.cpus.iter().filter(|c| c.active).map(|c| c.cpu))
    }

    pub fn is_active(&self, cpu: usize) -> bool {
        self.cpus.get(cpu).map(|c| c.active).unwrap_or(false)
    }

    // --- CAPACITY ---

    pub fn capacity_orig(&self, cpu: usize) -> u64 {
        self.energy.capacity(cpu, Lane::Uss)
    }

    pub fn capacity_orig_lane(&self, cpu: usize, lane: Lane) -> u64 {
        self.energy.capacity(cpu, lane)
    }

    // SUM OF ALL LANES EXPRESSED IN `to`'S CAPACITY UNITS
    fn normalize(&self, cpu: usize, lanes: LaneVec, to: Lane) -> u64 {
        let mut util = 0;
        for from in Lane::ALL {
            let v = lanes[from.idx()];
            if from == to {
                util += v;
            } else {
                util += (self.energy.capacity_ratio(cpu, to, from) * v) >> SCHED_CAPACITY_SHIFT;
            }
        }
        util
    }

    // --- CPU UTILIZATION ---

    pub fn lane_util(&self, cpu: usize, lane: Lane) -> u64 {
        self.cpus[cpu].util_avg[lane.idx()]
    }

    fn cpu_util_est(&self, cpu: usize) -> u64 {
        self.normalize(cpu, self.cpus[cpu].util_est, Lane::Uss)
    }

    // COMBINED UTIL IN USS UNITS, util_est AWARE, CLAMPED TO CAPACITY
    pub fn cpu_util(&self, cpu: usize) -> u64 {
        let mut util = self.normalize(cpu, self.cpus[cpu].util_avg, Lane::Uss);
        if self.features.util_est {
            util = util.max(self.cpu_util_est(cpu));
        }
        util.min(self.capacity_orig(cpu))
    }

    // ONE LANE'S USAGE AGAINST THAT LANE'S CAPACITY, 1024 = FULL
    pub fn cpu_util_ratio(&self, cpu: usize, lane: Lane) -> u64 {
        let cap = self.capacity_orig_lane(cpu, lane).max(1);
        (self.lane_util(cpu, lane) << SCHED_CAPACITY_SHIFT) / cap
    }

    // CPU UTIL WITH THE WAKING TASK'S CONTRIBUTION REMOVED
    pub fn cpu_util_wake(&self, cpu: usize, task: &TaskView) -> u64 {
        if cpu != task.cpu || !task.attached {
            return self.cpu_util(cpu);
        }

        let mut lanes = self.cpus[cpu].util_avg;
        let l = task.lane.idx();
        lanes[l] -= lanes[l].min(task.util_avg);

        if self.features.util_est {
            let mut est = self.cpus[cpu].util_est;
            if task.queued {
                let own = self.task_util_est_raw(task) | UTIL_AVG_UNCHANGED;
                est[l] -= est[l].min(own);
            }
            for i in 0..NR_LANES {
                lanes[i] = lanes[i].max(est[i]);
            }
        }

        for lane in Lane::ALL {
            lanes[lane.idx()] = lanes[lane.idx()].min(self.capacity_orig_lane(cpu, lane));
        }
        self.normalize(cpu, lanes, Lane::Uss)
    }

    // CPU UTIL IF THE WAKING TASK LANDS HERE. AN ATTACHED TASK IS ALREADY
    // REFLECTED WHERE IT IS ACCOUNTED.
    pub fn task_attached_cpu_util(&self, cpu: usize, task: &TaskView) -> u64 {
        if task.attached {
            return self.cpu_util(cpu);
        }

        let mut lanes = self.cpus[cpu].util_avg;
        let l = task.lane.idx();
        if cpu != task.cpu {
            lanes[l] += task.util_avg;
        }

        if self.features.util_est {
            let mut est = self.cpus[cpu].util_est;
            est[l] += self.task_util_est(task);
            for i in 0..NR_LANES {
                lanes[i] = lanes[i].max(est[i]);
            }
        }
        self.normalize(cpu, lanes, Lane::Uss)
    }

    pub fn boosted_cpu_util(&self, cpu: usize) -> u64 {
        let util = self.cpu_util(cpu);
        let boost = self.cpus[cpu].boost;
        if boost == 0 {
            return util;
        }
        apply_margin(util, schedtune_margin(self.capacity_orig(cpu), util, boost))
    }

    // --- TASK UTILIZATION ---

    fn task_util_est_enabled(&self, task: &TaskView) -> bool {
        self.features.util_est && task.group.util_est
    }

    pub fn task_util_est_raw(&self, task: &TaskView) -> u64 {
        if self.task_util_est_enabled(task) {
            task.util_est.ewma.max(task.util_est.enqueued)
        } else {
            task.util_avg
        }
    }

    pub fn task_util_est(&self, task: &TaskView) -> u64 {
        if self.task_util_est_enabled(task) {
            task.util_avg.max(self.task_util_est_raw(task))
        } else {
            task.util_avg
        }
    }

    pub fn boosted_task_util(&self, task: &TaskView) -> u64 {
        if task.group.boost == 0 {
            return task.util_avg;
        }
        let cap = self.capacity_orig_lane(task.cpu, task.lane);
        apply_margin(task.util_avg, schedtune_margin(cap, task.util_avg, task.group.boost))
    }

    // THE MEASURE ONTIME BOUNDARIES ARE COMPARED AGAINST
    pub fn task_runnable(&self, task: &TaskView) -> u64 {
        if task.group.boost == 0 {
            return task.runnable_avg;
        }
        let cap = self.capacity_orig_lane(task.cpu, task.lane);
        apply_margin(task.runnable_avg, schedtune_margin(cap, task.runnable_avg, task.group.boost))
    }

    // --- DOMAIN QUERIES ---

    pub fn overutilized(&self, cpu: usize) -> bool {
        self.topology.coregroup_of(cpu).iter()
            .filter(|&c| self.is_active(c))
            .any(|c| self.cpu_util(c) * CAPACITY_MARGIN > self.capacity_orig(c) * 1024)
    }

    // COREGROUP INDICES, SLOWEST FIRST
    pub fn coregroups_by_capacity(&self) -> Vec<usize> {
        let mut groups: Vec<usize> = (0..self.topology.nr_coregroups()).collect();
        groups.sort_by_key(|&g| {
            let first = self.topology.coregroup(g).first().unwrap_or(0);
            (self.capacity_orig(first), g)
        });
        groups
    }

    // ALL CPUS IN COREGROUPS FASTER THAN `cpu`'S
    pub fn faster_cpus(&self, cpu: usize) -> CpuMask {
        let cap = self.capacity_orig(cpu);
        let mut mask = CpuMask::empty();
        for group in self.topology.coregroups() {
            if let Some(first) = group.first() {
                if self.capacity_orig(first) > cap {
                    mask = mask.or(*group);
                }
            }
        }
        mask
    }

    // ALLOWED AND ACTIVE
    pub fn candidates(&self, task: &TaskView, mask: CpuMask) -> CpuMask {
        mask.and(task.allowed).and(self.active_mask())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::tests::two_group_model;

    fn view<'a>(topo: &'a Topology, model: &'a EnergyModel) -> SystemView<'a> {
        let cpus = (0..topo.nr_cpus()).map(CpuView::idle).collect();
        SystemView::new(topo, model, cpus, Features::default())
    }

    #[test]
    fn cpu_util_clamped_to_capacity() {
        let (topo, model) = two_group_model();
        let mut v = view(&topo, &model);
        v.cpus[0].util_avg = [5000, 0];
        assert_eq!(v.cpu_util(0), v.capacity_orig(0));
    }

    #[test]
    fn util_est_raises_cpu_util() {
        let (topo, model) = two_group_model();
        let mut v = view(&topo, &model);
        v.cpus[2].util_avg = [100, 0];
        v.cpus[2].util_est = [301, 0];
        assert_eq!(v.cpu_util(2), 301);
        v.features.util_est = false;
        assert_eq!(v.cpu_util(2), 100);
    }

    #[test]
    fn wake_util_removes_own_contribution() {
        let (topo, model) = two_group_model();
        let mut v = view(&topo, &model);
        v.features.util_est = false;
        v.cpus[2].util_avg = [400, 0];
        let t = TaskView { cpu: 2, util_avg: 150, attached: true, allowed: topo.all_cpus(), ..Default::default() };
        assert_eq!(v.cpu_util_wake(2, &t), 250);
        // OTHER CPUS UNTOUCHED
        v.cpus[3].util_avg = [400, 0];
        assert_eq!(v.cpu_util_wake(3, &t), 400);
    }

    #[test]
    fn attached_util_adds_detached_task() {
        let (topo, model) = two_group_model();
        let mut v = view(&topo, &model);
        v.features.util_est = false;
        v.cpus[3].util_avg = [100, 0];
        let t = TaskView { cpu: 2, util_avg: 150, attached: false, ..Default::default() };
        assert_eq!(v.task_attached_cpu_util(3, &t), 250);
        let t = TaskView { attached: true, ..t };
        assert_eq!(v.task_attached_cpu_util(3, &t), 100);
    }

    #[test]
    fn groups_sorted_by_capacity() {
        let (topo, model) = two_group_model();
        let v = view(&topo, &model);
        assert_eq!(v.coregroups_by_capacity(), vec![0, 1]);
        assert_eq!(v.faster_cpus(0).to_string(), "2-3");
        assert!(v.faster_cpus(2).is_empty());
    }

    #[test]
    fn overutilized_at_eighty_percent() {
        let (topo, model) = two_group_model();
        let mut v = view(&topo, &model);
        v.features.util_est = false;
        let cap = v.capacity_orig(0);
        v.cpus[0].util_avg = [cap * 8 / 10, 0];
        assert!(!v.overutilized(1));
        v.cpus[0].util_avg = [cap * 8 / 10 + 2, 0];
        assert!(v.overutilized(1));
    }
}
