// EMS WAKEUP PLACEMENT
// ONE DECISION PER WAKEUP: STRATEGIES ARE TRIED IN PRIORITY ORDER AND THE
// FIRST ONE WITH AN OPINION WINS. EVERY STRATEGY IS A PURE FUNCTION OF THE
// VIEW; `None` MEANS "NO OPINION", NEVER AN ERROR. PROPER ALWAYS ANSWERS.
//
//   1 SERVICE      CGROUP SERVICE LEVEL POOLS
//   2 ONTIME       HEAVY TASK, FASTER COREGROUP NOW
//   3 PREFER_PERF  CGROUP FLAG OR KPP REQUEST, PERF CPUS ONLY
//   4 BAND         PLAYABLE CPUS OF THE TASK'S BAND
//   5 GLOBAL_BOOST SAME SEARCH AS 3, ANY CPU
//   6 EFFICIENCY   WEIGHTED ENERGY/CAPACITY, ONLY IN EFF MODE
//   7 PREFER_IDLE  CGROUP FLAG
//   8 ENERGY       ENERGY-AWARE BEST FIT WITH 1/64 HYSTERESIS
//   9 PROPER       LEAST UTILIZED FITTING CPU, SLOWEST GROUP FIRST

use log::trace;
use serde::Serialize;

use crate::band::Bands;
use crate::energy::{find_min_util_cpu, select_best_cpu, select_energy_cpu};
use crate::ontime::Ontime;
use crate::service::ServicePools;
use crate::topology::CpuMask;
use crate::view::{SystemView, TaskView};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Service,
    Ontime,
    PreferPerf,
    Band,
    GlobalBoost,
    Efficiency,
    PreferIdle,
    Energy,
    Proper,
}

impl Strategy {
    pub const ALL: [Strategy; 9] = [
        Strategy::Service,
        Strategy::Ontime,
        Strategy::PreferPerf,
        Strategy::Band,
        Strategy::GlobalBoost,
        Strategy::Efficiency,
        Strategy::PreferIdle,
        Strategy::Energy,
        Strategy::Proper,
    ];

    pub fn idx(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Strategy::Service => "service",
            Strategy::Ontime => "ontime",
            Strategy::PreferPerf => "prefer_perf",
            Strategy::Band => "band",
            Strategy::GlobalBoost => "global_boost",
            Strategy::Efficiency => "efficiency",
            Strategy::PreferIdle => "prefer_idle",
            Strategy::Energy => "energy",
            Strategy::Proper => "proper",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Wakeup {
    pub prev: usize,
    pub waker: usize,
    pub sync: bool,
}

// EVERYTHING BEYOND THE VIEW A DECISION READS
pub struct PlacementCtx<'a> {
    pub services: &'a ServicePools,
    pub ontime: &'a Ontime,
    pub bands: &'a Bands,
    pub perf_cpus: CpuMask,
    pub global_boost: bool,
    // PER-CGROUP KPP STATE
    pub kpp: &'a [bool],
}

// --- SEARCH HELPERS ---

// SHALLOWEST IDLE STATE AMONG EMPTY CPUS, ELSE THE LEAST UTILIZED
pub fn pick_idle_or_least(view: &SystemView, task: &TaskView, mask: CpuMask) -> Option<usize> {
    let idle = mask.iter()
        .filter(|&c| view.cpu(c).is_idle())
        .min_by_key(|&c| (view.cpu(c).idle_state.unwrap_or(0), view.cpu_util(c), c));
    if idle.is_some() {
        return idle;
    }
    mask.iter().min_by_key(|&c| (view.task_attached_cpu_util(c, task), c))
}

// BIGGEST IDLE CPU, ELSE THE ONE WITH THE MOST SPARE CAPACITY
pub fn select_perf_cpu(view: &SystemView, task: &TaskView, mask: CpuMask) -> Option<usize> {
    let cands = view.candidates(task, mask);
    let idle = cands.iter()
        .filter(|&c| view.cpu(c).is_idle())
        .max_by_key(|&c| (view.capacity_orig(c), std::cmp::Reverse(view.cpu(c).idle_state.unwrap_or(0)),
                          std::cmp::Reverse(c)));
    if idle.is_some() {
        return idle;
    }
    cands.iter().max_by_key(|&c| {
        let spare = view.capacity_orig(c).saturating_sub(view.task_attached_cpu_util(c, task));
        (spare, std::cmp::Reverse(c))
    })
}

pub fn select_idle_cpu(view: &SystemView, task: &TaskView, prev: usize) -> usize {
    let cands = view.candidates(task, view.topology.all_cpus());
    let idle = cands.iter()
        .filter(|&c| view.cpu(c).is_idle())
        .min_by_key(|&c| (view.cpu_util(c), c));
    if let Some(cpu) = idle {
        return cpu;
    }
    cands.iter().min_by_key(|&c| (view.cpu_util(c), c)).unwrap_or(prev)
}

// SLOWEST COREGROUP WITH ROOM FIRST; PREV ONLY WHEN NOTHING FITS
pub fn select_proper_cpu(view: &SystemView, task: &TaskView, prev: usize) -> usize {
    for g in view.coregroups_by_capacity() {
        let mask = view.topology.coregroup(g).and(task.allowed);
        if let Some(cpu) = find_min_util_cpu(view, mask, task) {
            return cpu;
        }
    }
    prev
}

// --- CHAIN ---

fn try_strategy(view: &SystemView, ctx: &PlacementCtx, task: &TaskView,
                wake: &Wakeup, s: Strategy) -> Option<usize> {
    match s {
        Strategy::Service => ctx.services.select(view, task),
        Strategy::Ontime => ctx.ontime.task_wakeup(view, task),
        Strategy::PreferPerf => {
            let kpp = ctx.kpp.get(task.group.cgroup).copied().unwrap_or(false);
            if task.group.prefer_perf || kpp {
                select_perf_cpu(view, task, ctx.perf_cpus)
            } else {
                None
            }
        }
        Strategy::Band => ctx.bands.play_cpu(view, task),
        Strategy::GlobalBoost => {
            if ctx.global_boost {
                select_perf_cpu(view, task, view.topology.all_cpus())
            } else {
                None
            }
        }
        Strategy::Efficiency => {
            if view.features.eff_mode {
                select_best_cpu(view, task, wake.prev, wake.waker, wake.sync)
            } else {
                None
            }
        }
        Strategy::PreferIdle => {
            if task.group.prefer_idle {
                Some(select_idle_cpu(view, task, wake.prev))
            } else {
                None
            }
        }
        Strategy::Energy => select_energy_cpu(view, task, wake.prev, wake.waker, wake.sync),
        Strategy::Proper => Some(select_proper_cpu(view, task, wake.prev)),
    }
}

pub fn select_task_rq(view: &SystemView, ctx: &PlacementCtx, task: &TaskView,
                      wake: &Wakeup) -> (usize, Strategy) {
    let usable = view.candidates(task, view.topology.all_cpus());
    for s in Strategy::ALL {
        if let Some(cpu) = try_strategy(view, ctx, task, wake, s) {
            // A STALE OPINION ABOUT AN UNUSABLE CPU FALLS THROUGH
            if !usable.is_empty() && !usable.test(cpu) {
                trace!("select: pid={} {} offered unusable cpu{}", task.pid, s.label(), cpu);
                continue;
            }
            trace!("select: pid={} prev={} -> cpu{} ({})", task.pid, wake.prev, cpu, s.label());
            return (cpu, s);
        }
    }
    // UNREACHABLE IN PRACTICE: PROPER ANSWERED WITH AN UNUSABLE PREV
    (usable.first().unwrap_or(wake.prev), Strategy::Proper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::tests::two_group_model;
    use crate::view::{CpuView, Features, GroupAttrs};

    struct Rig {
        services: ServicePools,
        ontime: Ontime,
        bands: Bands,
        kpp: Vec<bool>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                services: ServicePools::default(),
                ontime: Ontime::disabled(4, 2),
                bands: Bands::new(),
                kpp: vec![false; 2],
            }
        }

        fn ctx(&self, global_boost: bool) -> PlacementCtx<'_> {
            PlacementCtx {
                services: &self.services,
                ontime: &self.ontime,
                bands: &self.bands,
                perf_cpus: CpuMask::parse("2-3").unwrap(),
                global_boost,
                kpp: &self.kpp,
            }
        }
    }

    fn wake(prev: usize) -> Wakeup {
        Wakeup { prev, waker: prev, sync: false }
    }

    #[test]
    fn perf_search_prefers_biggest_idle() {
        let (topo, model) = two_group_model();
        let cpus = (0..4).map(CpuView::idle).collect();
        let mut v = SystemView::new(&topo, &model, cpus, Features { util_est: false, ..Default::default() });
        let t = TaskView { allowed: topo.all_cpus(), util_avg: 50, ..Default::default() };
        assert_eq!(select_perf_cpu(&v, &t, topo.all_cpus()), Some(2));
        v.cpus[2].nr_running = 1;
        v.cpus[2].util_avg = [100, 0];
        assert_eq!(select_perf_cpu(&v, &t, topo.all_cpus()), Some(3));
        v.cpus[3].nr_running = 1;
        v.cpus[3].util_avg = [700, 0];
        // ALL BUSY IN THE PERF MASK: MOST SPARE
        assert_eq!(select_perf_cpu(&v, &t, CpuMask::parse("2-3").unwrap()), Some(2));
    }

    #[test]
    fn prefer_idle_falls_back_to_least_loaded() {
        let (topo, model) = two_group_model();
        let mut cpus: Vec<CpuView> = (0..4).map(CpuView::idle).collect();
        for (i, c) in cpus.iter_mut().enumerate() {
            c.nr_running = 1;
            c.util_avg = [400 - 50 * i as u64, 0];
        }
        let v = SystemView::new(&topo, &model, cpus, Features { util_est: false, ..Default::default() });
        let t = TaskView { allowed: topo.all_cpus(), ..Default::default() };
        assert_eq!(select_idle_cpu(&v, &t, 0), 3);
    }

    #[test]
    fn proper_fills_slow_group_first() {
        let (topo, model) = two_group_model();
        let mut cpus: Vec<CpuView> = (0..4).map(CpuView::idle).collect();
        cpus[0].util_avg = [300, 0];
        cpus[1].util_avg = [200, 0];
        cpus[3].util_avg = [900, 0];
        let v = SystemView::new(&topo, &model, cpus, Features { util_est: false, ..Default::default() });
        let t = TaskView { cpu: 3, attached: false, util_avg: 100, allowed: topo.all_cpus(), ..Default::default() };
        assert_eq!(select_proper_cpu(&v, &t, 3), 1);
        // DOES NOT FIT ON LITTLE ANY MORE
        let t = TaskView { util_avg: 400, ..t };
        assert_eq!(select_proper_cpu(&v, &t, 3), 2);
        // FITS NOWHERE IT IS ALLOWED
        let t = TaskView { util_avg: 5000, allowed: CpuMask::parse("0-2").unwrap(), ..t };
        assert_eq!(select_proper_cpu(&v, &t, 3), 3);
    }

    #[test]
    fn service_beats_prefer_perf_and_band() {
        let (topo, model) = two_group_model();
        let cpus = (0..4).map(CpuView::idle).collect();
        let v = SystemView::new(&topo, &model, cpus, Features::default());
        let mut rig = Rig::new();
        rig.services = ServicePools::from_config(&[crate::config::ServiceConfig {
            level: 1,
            light_threshold: 1000,
            heavy_threshold: 1000,
            light_cpus: "1".into(),
            medium_cpus: "2".into(),
            heavy_cpus: "3".into(),
        }], 4);
        rig.bands.join(7, 7);
        rig.bands.update(7, 100, &v);
        let group = GroupAttrs { service: 1, prefer_perf: true, ..Default::default() };
        let t = TaskView { pid: 7, tgid: 7, band: Some(7), util_avg: 10, allowed: topo.all_cpus(), group,
                           ..Default::default() };
        let ctx = rig.ctx(true);
        assert_eq!(select_task_rq(&v, &ctx, &t, &wake(0)), (1, Strategy::Service));

        let t = TaskView { group: GroupAttrs { service: 0, ..group }, ..t };
        assert_eq!(select_task_rq(&v, &ctx, &t, &wake(0)), (2, Strategy::PreferPerf));

        let t = TaskView { group: GroupAttrs::default(), ..t };
        assert_eq!(select_task_rq(&v, &ctx, &t, &wake(0)), (0, Strategy::Band));

        let t = TaskView { band: None, ..t };
        assert_eq!(select_task_rq(&v, &ctx, &t, &wake(0)), (2, Strategy::GlobalBoost));
    }

    #[test]
    fn kpp_request_counts_as_prefer_perf() {
        let (topo, model) = two_group_model();
        let cpus = (0..4).map(CpuView::idle).collect();
        let v = SystemView::new(&topo, &model, cpus, Features::default());
        let mut rig = Rig::new();
        rig.kpp[1] = true;
        let t = TaskView { util_avg: 10, allowed: topo.all_cpus(),
                           group: GroupAttrs { cgroup: 1, ..Default::default() }, ..Default::default() };
        assert_eq!(select_task_rq(&v, &rig.ctx(false), &t, &wake(0)).1, Strategy::PreferPerf);
    }

    #[test]
    fn chain_ends_in_energy_or_proper() {
        let (topo, model) = two_group_model();
        let cpus = (0..4).map(CpuView::idle).collect();
        let mut v = SystemView::new(&topo, &model, cpus, Features { util_est: false, ..Default::default() });
        let rig = Rig::new();
        let t = TaskView { cpu: 2, util_avg: 100, attached: true, allowed: topo.all_cpus(), ..Default::default() };
        v.cpus[2].util_avg = [100, 0];
        assert_eq!(select_task_rq(&v, &rig.ctx(false), &t, &wake(2)), (0, Strategy::Energy));

        v.features.energy_aware = false;
        assert_eq!(select_task_rq(&v, &rig.ctx(false), &t, &wake(2)).1, Strategy::Proper);
    }

    #[test]
    fn eff_mode_precedes_prefer_idle() {
        let (topo, model) = two_group_model();
        let cpus = (0..4).map(CpuView::idle).collect();
        let mut v = SystemView::new(&topo, &model, cpus, Features { util_est: false, ..Default::default() });
        v.features.eff_mode = true;
        let rig = Rig::new();
        let t = TaskView { cpu: 3, util_avg: 5, attached: true, allowed: topo.all_cpus(),
                           group: GroupAttrs { prefer_idle: true, ..Default::default() }, ..Default::default() };
        assert_eq!(select_task_rq(&v, &rig.ctx(false), &t, &wake(3)).1, Strategy::Efficiency);
        v.features.eff_mode = false;
        assert_eq!(select_task_rq(&v, &rig.ctx(false), &t, &wake(3)).1, Strategy::PreferIdle);
    }

    #[test]
    fn offline_choice_falls_through() {
        let (topo, model) = two_group_model();
        let mut cpus: Vec<CpuView> = (0..4).map(CpuView::idle).collect();
        cpus[1].active = false;
        let v = SystemView::new(&topo, &model, cpus, Features::default());
        let mut rig = Rig::new();
        rig.services = ServicePools::from_config(&[crate::config::ServiceConfig {
            level: 1,
            light_threshold: 1000,
            heavy_threshold: 1000,
            light_cpus: "1".into(),
            medium_cpus: "1".into(),
            heavy_cpus: "1".into(),
        }], 4);
        let t = TaskView { util_avg: 10, allowed: topo.all_cpus(),
                           group: GroupAttrs { service: 1, ..Default::default() }, ..Default::default() };
        let (cpu, s) = select_task_rq(&v, &rig.ctx(false), &t, &wake(0));
        assert_ne!(s, Strategy::Service);
        assert_ne!(cpu, 1);
    }
}
