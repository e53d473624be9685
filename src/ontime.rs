// EMS ONTIME MIGRATION
// A TASK WHOSE RUNNABLE MEASURE REACHES ITS COREGROUP'S UPPER BOUNDARY IS
// HEAVY AND BELONGS ON A FASTER COREGROUP. BELOW THE LOWER BOUNDARY IT IS
// LIGHT ENOUGH TO LEAVE ALONE; IN BETWEEN IT STAYS IN ITS GROUP.
//
// THE PERIODIC SWEEP PICKS AT MOST ONE HEAVY TASK PER CPU AND RETURNS THE
// MOVES; THE SCHEDULER EXECUTES THEM ON THE SOURCE CPU'S STOPPER, WHICH
// RE-CHECKS EVERYTHING BEFORE MOVING. A BUSY SWEEP LOCK SKIPS THE CYCLE.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock, TryLockError};

use log::{debug, trace};

use crate::config::OntimeBoundary;
use crate::energy::{calculate_energy, EnergyModel};
use crate::multi_load::{Lane, LaneVec, NR_LANES, SCHED_CAPACITY_SHIFT};
use crate::topology::{CpuMask, Topology};
use crate::tuning::{DEFAULT_COVERAGE_RATIO, ONTIME_MIGRATION_WINDOW};
use crate::view::{Pid, SystemView, TaskView};

// ABSOLUTE UTILIZATION UNITS PER LANE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bounds {
    pub upper: LaneVec,
    pub lower: LaneVec,
    // PERCENT OF CAPACITY A BUSY DESTINATION MAY BE FILLED TO
    pub coverage_ratio: u64,
}

impl Bounds {
    pub fn absolute(upper: u64, lower: u64, coverage_ratio: u64) -> Self {
        Self { upper: [upper; NR_LANES], lower: [lower; NR_LANES], coverage_ratio }
    }

    // PERCENTAGES AGAINST EACH LANE'S ORIGINAL CAPACITY
    pub fn from_percent(b: &OntimeBoundary, capacity: LaneVec) -> Self {
        let pct = |p: u64, lane: Lane| capacity[lane.idx()] * p / 100;
        Self {
            upper: [pct(b.upper_boundary, Lane::Uss), pct(b.upper_boundary_s, Lane::Sse)],
            lower: [pct(b.lower_boundary, Lane::Uss), pct(b.lower_boundary_s, Lane::Sse)],
            coverage_ratio: b.coverage_ratio,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    // >= UPPER
    Heavy,
    // [LOWER, UPPER)
    Stay,
    // < LOWER
    Light,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Migration {
    pub pid: Pid,
    pub src: usize,
    pub dst: usize,
}

// WHAT THE SWEEP SEES OF ONE RUNQUEUE, QUEUE ORDER PRESERVED
#[derive(Clone, Debug, Default)]
pub struct RqSnapshot {
    pub cpu: usize,
    pub curr: Option<TaskView>,
    pub queued: Vec<TaskView>,
}

pub struct Ontime {
    // PER COREGROUP; NONE = ONTIME OFF FOR THAT GROUP
    bounds: RwLock<Vec<Option<Bounds>>>,
    active_balance: Vec<AtomicBool>,
    sweep: Mutex<()>,
}

impl Ontime {
    pub fn with_bounds(bounds: Vec<Option<Bounds>>, nr_cpus: usize) -> Self {
        Self {
            bounds: RwLock::new(bounds),
            active_balance: (0..nr_cpus).map(|_| AtomicBool::new(false)).collect(),
            sweep: Mutex::new(()),
        }
    }

    pub fn disabled(nr_cpus: usize, nr_groups: usize) -> Self {
        Self::with_bounds(vec![None; nr_groups], nr_cpus)
    }

    // CAPACITIES MUST BE KNOWN, SO THIS RUNS AFTER THE DVFS DRIVER REGISTERED
    // ITS ENERGY TABLES
    pub fn from_config(groups: &[Option<OntimeBoundary>], topology: &Topology,
                       energy: &EnergyModel) -> Self {
        let bounds = topology.coregroups().iter().enumerate().map(|(g, mask)| {
            let b = groups.get(g).copied().flatten()?;
            let first = mask.first()?;
            let cap = [energy.max_capacity(first, Lane::Uss), energy.max_capacity(first, Lane::Sse)];
            let abs = Bounds::from_percent(&b, cap);
            debug!("ontime: group {} ({}) upper={:?} lower={:?} coverage={}%",
                   g, mask, abs.upper, abs.lower, abs.coverage_ratio);
            Some(abs)
        }).collect();
        Self::with_bounds(bounds, topology.nr_cpus())
    }

    pub fn bounds(&self, group: usize) -> Option<Bounds> {
        match self.bounds.read() {
            Ok(b) => b.get(group).copied().flatten(),
            Err(poisoned) => poisoned.into_inner().get(group).copied().flatten(),
        }
    }

    // LIVE TUNABLE: NONE TURNS ONTIME OFF FOR THE GROUP
    pub fn set_bounds(&self, group: usize, bounds: Option<Bounds>) {
        let mut b = match self.bounds.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(slot) = b.get_mut(group) {
            *slot = bounds;
        }
    }

    // --- CLASSIFICATION ---

    pub fn classify(&self, view: &SystemView, task: &TaskView) -> Option<Class> {
        let b = self.bounds(view.topology.group_of(task.cpu))?;
        let l = task.lane.idx();
        let runnable = view.task_runnable(task);
        Some(if runnable >= b.upper[l] {
            Class::Heavy
        } else if runnable < b.lower[l] {
            Class::Light
        } else {
            Class::Stay
        })
    }

    // THE SWEEP AND WAKEUP PATHS ONLY ASK FOR Heavy. Stay ANSWERS CALLERS
    // THAT RE-PLACE A TASK INSIDE ITS OWN COREGROUP.
    pub fn fit_cpus(&self, view: &SystemView, task: &TaskView, class: Class) -> CpuMask {
        match class {
            Class::Heavy => view.faster_cpus(task.cpu),
            Class::Stay => view.topology.coregroup_of(task.cpu),
            Class::Light => CpuMask::empty(),
        }
    }

    fn coverage(&self, group: usize) -> u64 {
        self.bounds(group).map(|b| b.coverage_ratio).unwrap_or(DEFAULT_COVERAGE_RATIO)
    }

    // PER COREGROUP: SHALLOWEST IDLE CPU, ELSE THE BUSY CPU WITH THE MOST
    // SPARE CAPACITY UNDER THE COVERAGE CAP. ACROSS GROUPS: LEAST ENERGY.
    pub fn select_target_cpu(&self, view: &SystemView, task: &TaskView, fit: CpuMask) -> Option<usize> {
        let cands = view.candidates(task, fit);
        if cands.is_empty() {
            return None;
        }

        let mut picks = Vec::new();
        for g in view.coregroups_by_capacity() {
            let mask = view.topology.coregroup(g).and(cands);
            if mask.is_empty() {
                continue;
            }

            let idle = mask.iter()
                .filter(|&c| view.cpu(c).is_idle())
                .min_by_key(|&c| (view.cpu(c).idle_state.unwrap_or(0), c));
            if let Some(cpu) = idle {
                picks.push(cpu);
                continue;
            }

            let coverage = self.coverage(g);
            let busy = mask.iter()
                .filter_map(|c| {
                    let limit = view.capacity_orig(c) * coverage / 100;
                    let util = view.task_attached_cpu_util(c, task);
                    if util > limit {
                        None
                    } else {
                        Some((limit - util, c))
                    }
                })
                .max_by_key(|&(spare, c)| (spare, std::cmp::Reverse(c)));
            if let Some((_, cpu)) = busy {
                picks.push(cpu);
            }
        }

        match picks.len() {
            0 => None,
            1 => Some(picks[0]),
            _ => {
                let mut best: Option<(u64, usize)> = None;
                for cpu in picks {
                    let energy = calculate_energy(view, task, cpu);
                    if best.map(|(e, _)| energy < e).unwrap_or(true) {
                        best = Some((energy, cpu));
                    }
                }
                best.map(|(_, cpu)| cpu)
            }
        }
    }

    // WAKEUP PATH: ONLY THE PROMOTION CASE; REBALANCING INSIDE A GROUP IS
    // LEFT TO THE SWEEP
    pub fn task_wakeup(&self, view: &SystemView, task: &TaskView) -> Option<usize> {
        if !view.features.ontime || task.ontime_migrating {
            return None;
        }
        if self.classify(view, task)? != Class::Heavy {
            return None;
        }
        let fit = self.fit_cpus(view, task, Class::Heavy);
        self.select_target_cpu(view, task, fit)
    }

    // EDGE TRIGGER FROM THE LOAD TRACKER: A HEAVY TASK WITH SOMEWHERE TO GO
    pub fn need_migration_trigger(&self, view: &SystemView, task: &TaskView) -> bool {
        if !view.features.ontime || task.ontime_migrating {
            return false;
        }
        if self.classify(view, task) != Some(Class::Heavy) {
            return false;
        }
        !view.candidates(task, view.faster_cpus(task.cpu)).is_empty()
    }

    // --- SWEEP ---

    pub fn is_balancing(&self, cpu: usize) -> bool {
        self.active_balance.get(cpu).map(|b| b.load(Ordering::Acquire)).unwrap_or(false)
    }

    // THE STOP WORK FOR `cpu` FINISHED OR WAS ABANDONED
    pub fn finish(&self, cpu: usize) {
        if let Some(b) = self.active_balance.get(cpu) {
            b.store(false, Ordering::Release);
        }
    }

    // BOOSTED OR PREFER-PERF TASKS WIN OUTRIGHT, ELSE THE HIGHEST
    // UTIL / CAPACITY RATIO
    fn heaviest_task<'t>(&self, view: &SystemView, rq: &'t RqSnapshot) -> Option<&'t TaskView> {
        let mut best: Option<(&TaskView, u64)> = None;
        let window = rq.curr.iter().chain(rq.queued.iter().take(ONTIME_MIGRATION_WINDOW));
        for t in window {
            if t.ontime_migrating || self.classify(view, t) != Some(Class::Heavy) {
                continue;
            }
            if t.group.boost > 0 || t.group.prefer_perf {
                return Some(t);
            }
            let cap = view.energy.max_capacity(rq.cpu, t.lane).max(1);
            let ratio = (view.task_util_est(t) << SCHED_CAPACITY_SHIFT) / cap;
            if best.map(|(_, r)| ratio > r).unwrap_or(true) {
                best = Some((t, ratio));
            }
        }
        best.map(|(t, _)| t)
    }

    // MARKS EACH SOURCE CPU AS BALANCING; THE CALLER MUST finish() IT
    pub fn run_cycle(&self, view: &SystemView, rqs: &[RqSnapshot]) -> Vec<Migration> {
        let mut moves = Vec::new();
        if !view.features.ontime {
            return moves;
        }
        let _guard = match self.sweep.try_lock() {
            Ok(g) => g,
            Err(TryLockError::WouldBlock) => {
                trace!("ontime: sweep busy, skipping cycle");
                return moves;
            }
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        for rq in rqs {
            if !view.is_active(rq.cpu) || self.is_balancing(rq.cpu) {
                continue;
            }
            let task = match self.heaviest_task(view, rq) {
                Some(t) => t,
                None => continue,
            };
            let fit = self.fit_cpus(view, task, Class::Heavy);
            let dst = match self.select_target_cpu(view, task, fit) {
                Some(c) => c,
                None => continue,
            };
            if let Some(b) = self.active_balance.get(rq.cpu) {
                if b.swap(true, Ordering::AcqRel) {
                    continue;
                }
            }
            debug!("ontime: pid={} cpu{} -> cpu{} runnable={}",
                   task.pid, rq.cpu, dst, view.task_runnable(task));
            moves.push(Migration { pid: task.pid, src: rq.cpu, dst });
        }
        moves
    }

    // --- REVERSE CHECK ---

    // LOAD BALANCER VETO: NO MOVES OF A TASK ALREADY IN FLIGHT, AND NO
    // DEMOTION OF A TASK STILL ABOVE ITS LOWER BOUNDARY UNLESS THE SOURCE
    // IS OVERLOADED
    pub fn can_migrate(&self, view: &SystemView, task: &TaskView, dst: usize) -> bool {
        if task.ontime_migrating {
            return false;
        }
        let src = task.cpu;
        if view.capacity_orig(dst) >= view.capacity_orig(src) {
            return true;
        }
        match self.classify(view, task) {
            None | Some(Class::Light) => true,
            Some(_) => view.cpu(src).nr_running > 1 && view.overutilized(src),
        }
    }
}
