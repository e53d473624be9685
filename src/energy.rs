// EMS ENERGY MODEL
// PER-CPU ENERGY TABLES (FREQUENCY -> CAPACITY, POWER PER LANE), THE
// CAPACITY MODEL DERIVED FROM THEM, AND ENERGY-DRIVEN CPU SELECTION.
//
// CAPACITY = freq / max_mips_freq * mips / max_mips * 1024, NORMALIZED TO
// THE FASTEST REGISTERED CPU. POWER = coefficient * MHz * mV^2 / 10^9.

use anyhow::{bail, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::multi_load::{Lane, LaneVec, NR_LANES, SCHED_CAPACITY_SCALE, SCHED_CAPACITY_SHIFT};
use crate::topology::CpuMask;
use crate::view::{SystemView, TaskView};

// RETURNED WHEN NO TABLE IS USABLE YET
pub const ENERGY_UNKNOWN: u64 = u32::MAX as u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnergyState {
    pub frequency: u64,
    pub cap: LaneVec,
    pub power: LaneVec,
}

// STATIC PER-CPU INPUTS. SSE FIGURES DEFAULT TO THE USS ONES.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuEnergyData {
    pub mips: u64,
    pub coefficient: u64,
    #[serde(default)]
    pub mips_s: Option<u64>,
    #[serde(default)]
    pub coefficient_s: Option<u64>,
    #[serde(default = "default_weight")]
    pub capacity_weight: u64,
    #[serde(default = "default_weight")]
    pub energy_weight: u64,
}

fn default_weight() -> u64 {
    100
}

impl CpuEnergyData {
    pub fn new(mips: u64, coefficient: u64) -> Self {
        Self {
            mips,
            coefficient,
            mips_s: None,
            coefficient_s: None,
            capacity_weight: default_weight(),
            energy_weight: default_weight(),
        }
    }

    fn mips_of(&self, lane: Lane) -> u64 {
        match lane {
            Lane::Uss => self.mips,
            Lane::Sse => self.mips_s.unwrap_or(self.mips),
        }
    }

    fn coefficient_of(&self, lane: Lane) -> u64 {
        match lane {
            Lane::Uss => self.coefficient,
            Lane::Sse => self.coefficient_s.unwrap_or(self.coefficient),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct CpuCapacity {
    // TOP-STATE CAPACITY
    orig_scale: LaneVec,
    // SCALED BY policy.max / cpuinfo.max
    cpufreq: LaneVec,
    // SCALED BY THE PM QOS MAX
    qos: LaneVec,
    capacity: LaneVec,
    // ratio[to][from] = capacity[to] << 10 / capacity[from]
    ratio: [LaneVec; NR_LANES],
}

impl Default for CpuCapacity {
    fn default() -> Self {
        Self {
            orig_scale: [SCHED_CAPACITY_SCALE; NR_LANES],
            cpufreq: [SCHED_CAPACITY_SCALE; NR_LANES],
            qos: [SCHED_CAPACITY_SCALE; NR_LANES],
            capacity: [SCHED_CAPACITY_SCALE; NR_LANES],
            ratio: [[SCHED_CAPACITY_SCALE; NR_LANES]; NR_LANES],
        }
    }
}

impl CpuCapacity {
    fn refresh(&mut self) {
        for l in 0..NR_LANES {
            self.capacity[l] = self.cpufreq[l].min(self.qos[l]);
        }
        for to in 0..NR_LANES {
            for from in 0..NR_LANES {
                let denom = self.capacity[from].max(1);
                self.ratio[to][from] = (self.capacity[to] << SCHED_CAPACITY_SHIFT) / denom;
            }
        }
    }
}

fn calculate_scale(orig: u64, max_scale: u64) -> u64 {
    (orig * max_scale) >> SCHED_CAPACITY_SHIFT
}

pub struct EnergyModel {
    data: Vec<CpuEnergyData>,
    tables: Vec<Vec<EnergyState>>,
    caps: Vec<CpuCapacity>,
    initialized: bool,
}

impl EnergyModel {
    pub fn new(data: Vec<CpuEnergyData>) -> Self {
        let n = data.len();
        Self {
            data,
            tables: vec![Vec::new(); n],
            caps: vec![CpuCapacity::default(); n],
            initialized: false,
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.data.len()
    }

    // REGISTER ONE FREQUENCY DOMAIN. ROWS OUTSIDE [min_f, max_f] ARE
    // DROPPED. CAPACITY OF EVERY REGISTERED CPU IS RECOMPUTED SINCE THE
    // FASTEST CPU MAY HAVE CHANGED.
    pub fn register_domain(&mut self, cpus: CpuMask, freqs: &[u64], volts: &[u64],
                           max_f: u64, min_f: u64) -> Result<()> {
        let cpus = cpus.and(CpuMask::first_n(self.nr_cpus()));
        let first = match cpus.first() {
            Some(c) => c,
            None => bail!("energy domain has no possible cpu"),
        };
        if freqs.len() != volts.len() {
            bail!("frequency table has {} rows but voltage table has {}", freqs.len(), volts.len());
        }

        // ALL CPUS OF A DOMAIN SHARE ONE MIPS FIGURE
        let mips = self.data[first].mips;
        if let Some(cpu) = cpus.iter().find(|&c| self.data[c].mips != mips) {
            bail!("cpu{} has different capacity from cpu{}", cpu, first);
        }

        let mut rows: Vec<(u64, u64)> = freqs.iter().copied().zip(volts.iter().copied())
            .filter(|&(f, _)| f <= max_f && f >= min_f)
            .collect();
        if rows.is_empty() {
            bail!("no frequency within [{}, {}] for cpus {}", min_f, max_f, cpus);
        }
        rows.sort_by_key(|&(f, _)| f);

        for cpu in cpus.iter() {
            let d = self.data[cpu];
            self.tables[cpu] = rows.iter().map(|&(f, v)| {
                let mhz = f / 1000;
                let mv = v / 1000;
                let mut power = [0; NR_LANES];
                for lane in Lane::ALL {
                    power[lane.idx()] = d.coefficient_of(lane) * mhz * mv * mv / 1_000_000_000;
                }
                EnergyState { frequency: f, cap: [0; NR_LANES], power }
            }).collect();
        }

        self.fill_capacity();
        Ok(())
    }

    fn fill_capacity(&mut self) {
        // FASTEST REGISTERED CPU DEFINES 1024
        let mut max_mips = 0;
        let mut max_mips_freq = 0;
        for (cpu, table) in self.tables.iter().enumerate() {
            let last = match table.last() {
                Some(s) => s,
                None => continue,
            };
            let d = &self.data[cpu];
            let mips = d.mips_of(Lane::Uss).max(d.mips_of(Lane::Sse));
            if mips > max_mips {
                max_mips = mips;
                max_mips_freq = last.frequency;
            }
        }
        if max_mips == 0 || max_mips_freq == 0 {
            return;
        }

        for cpu in 0..self.tables.len() {
            if self.tables[cpu].is_empty() {
                continue;
            }
            let d = self.data[cpu];
            for state in self.tables[cpu].iter_mut() {
                for lane in Lane::ALL {
                    state.cap[lane.idx()] =
                        state.frequency * d.mips_of(lane) * 1024 / max_mips_freq / max_mips;
                }
            }

            let top = self.tables[cpu][self.tables[cpu].len() - 1];
            let cap = &mut self.caps[cpu];
            cap.orig_scale = top.cap;
            cap.cpufreq = top.cap;
            cap.qos = top.cap;
            cap.refresh();

            debug!("cpu{} energy table: {} states, capacity {}", cpu,
                   self.tables[cpu].len(), top.cap[0]);
        }
    }

    pub fn log_tables(&self) {
        for (cpu, table) in self.tables.iter().enumerate() {
            info!("[energy table: cpu{}]", cpu);
            for (i, s) in table.iter().enumerate() {
                info!("[{:2}] freq={:8} cap={:4} power={:4} | cap(S)={:4} power(S)={:4}",
                      i, s.frequency, s.cap[0], s.power[0], s.cap[1], s.power[1]);
            }
        }
    }

    // ALL DOMAINS REGISTERED: ENERGY ESTIMATES BECOME MEANINGFUL
    pub fn set_initialized(&mut self, status: bool) {
        self.initialized = status;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn table(&self, cpu: usize) -> &[EnergyState] {
        self.tables.get(cpu).map(|t| t.as_slice()).unwrap_or(&[])
    }

    pub fn data(&self, cpu: usize) -> Option<&CpuEnergyData> {
        self.data.get(cpu)
    }

    // CURRENT CAPACITY (min OF CPUFREQ AND QOS LIMITED)
    pub fn capacity(&self, cpu: usize, lane: Lane) -> u64 {
        self.caps.get(cpu).map(|c| c.capacity[lane.idx()]).unwrap_or(SCHED_CAPACITY_SCALE)
    }

    pub fn capacity_ratio(&self, cpu: usize, to: Lane, from: Lane) -> u64 {
        self.caps.get(cpu).map(|c| c.ratio[to.idx()][from.idx()]).unwrap_or(SCHED_CAPACITY_SCALE)
    }

    // TOP-STATE CAPACITY, 0 WITHOUT A TABLE
    pub fn max_capacity(&self, cpu: usize, lane: Lane) -> u64 {
        self.table(cpu).last().map(|s| s.cap[lane.idx()]).unwrap_or(0)
    }

    // CAPACITY OF THE LOWEST STATE RUNNING AT LEAST `freq`
    pub fn freq_cap(&self, cpu: usize, freq: u64, lane: Lane) -> u64 {
        self.table(cpu).iter()
            .find(|s| s.frequency >= freq)
            .map(|s| s.cap[lane.idx()])
            .unwrap_or(0)
    }

    // POLICY LIMITS CHANGED
    pub fn update_cpufreq_capacity(&mut self, cpus: CpuMask, policy_max: u64, cpuinfo_max: u64) {
        if cpuinfo_max == 0 {
            return;
        }
        let max_scale = (policy_max << SCHED_CAPACITY_SHIFT) / cpuinfo_max;
        for cpu in cpus.iter() {
            if let Some(cap) = self.caps.get_mut(cpu) {
                for l in 0..NR_LANES {
                    cap.cpufreq[l] = calculate_scale(cap.orig_scale[l], max_scale);
                }
                cap.refresh();
            }
        }
    }

    // PM QOS MAX CHANGED
    pub fn update_qos_capacity(&mut self, cpus: CpuMask, freq: u64, max: u64) {
        if max == 0 {
            return;
        }
        let max_scale = (freq << SCHED_CAPACITY_SHIFT) / max;
        for cpu in cpus.iter() {
            if let Some(cap) = self.caps.get_mut(cpu) {
                for l in 0..NR_LANES {
                    cap.qos[l] = calculate_scale(cap.orig_scale[l], max_scale);
                }
                cap.refresh();
            }
        }
    }

    pub fn set_energy_weight(&mut self, cpus: CpuMask, capacity_weight: u64, energy_weight: u64) {
        for cpu in cpus.iter() {
            if let Some(d) = self.data.get_mut(cpu) {
                d.capacity_weight = capacity_weight;
                d.energy_weight = energy_weight;
            }
        }
    }
}

// --- ENERGY ESTIMATE ---

// FIRST STATE WHOSE USS CAPACITY COVERS max_util, ELSE THE TOP STATE
fn state_for(table: &[EnergyState], max_util: u64) -> Option<(EnergyState, LaneVec)> {
    let last = *table.last()?;
    let fallback = (last, [SCHED_CAPACITY_SCALE; NR_LANES]);
    Some(table.iter()
        .find(|s| s.cap[Lane::Uss.idx()] >= max_util)
        .map(|s| (*s, s.cap))
        .unwrap_or(fallback))
}

// TOTAL ACTIVE ENERGY OF THE SYSTEM IF `task` RUNS ON `target`
pub fn calculate_energy(view: &SystemView, task: &TaskView, target: usize) -> u64 {
    if !view.energy.is_initialized() {
        return ENERGY_UNKNOWN;
    }

    let active = view.active_mask();
    let mut util = vec![0u64; view.nr_cpus()];
    for cpu in active.iter() {
        util[cpu] = if cpu == target {
            view.task_attached_cpu_util(cpu, task)
        } else {
            view.cpu_util_wake(cpu, task)
        };
    }

    let task_est = view.task_util_est(task);
    let l = task.lane.idx();
    let mut total = 0u64;

    for group in view.topology.coregroups() {
        let cpus = group.and(active);
        let first = match cpus.first() {
            Some(c) => c,
            None => continue,
        };

        // EVERY CPU OF THE GROUP RUNS AT THE CLOCK ITS BUSIEST CPU NEEDS
        let max_util = cpus.iter().map(|c| util[c]).max().unwrap_or(0);
        let (state, capacity) = match state_for(view.energy.table(first), max_util) {
            Some(s) => s,
            None => continue,
        };

        let mut util_sum = [0u64; NR_LANES];
        for i in cpus.iter() {
            let mut lanes = view.cpus[i].util_avg;
            if i == task.cpu {
                lanes[l] -= lanes[l].min(task_est);
            }
            if i == target {
                lanes[l] += task_est;
            }

            // SATURATED: CHARGE THE CPU'S OWN USAGE RATIO
            if util[i] >= capacity[Lane::Uss.idx()] {
                for lane in Lane::ALL {
                    util_sum[lane.idx()] += view.cpu_util_ratio(i, lane);
                }
                continue;
            }

            for lane in Lane::ALL {
                let cap = capacity[lane.idx()].max(1);
                util_sum[lane.idx()] += (lanes[lane.idx()] << SCHED_CAPACITY_SHIFT) / cap;
            }
        }

        for lane in Lane::ALL {
            total += util_sum[lane.idx()] * state.power[lane.idx()];
        }
    }

    total
}

// LEAST UTILIZED ACTIVE CPU IN `mask` THAT STILL HAS ROOM FOR `task`
pub fn find_min_util_cpu(view: &SystemView, mask: CpuMask, task: &TaskView) -> Option<usize> {
    let mut best: Option<(u64, usize)> = None;
    for cpu in mask.and(view.active_mask()).iter() {
        let util = view.task_attached_cpu_util(cpu, task);
        if util >= view.capacity_orig(cpu) {
            continue;
        }
        if best.map(|(u, _)| util < u).unwrap_or(true) {
            best = Some((util, cpu));
        }
    }
    best.map(|(_, cpu)| cpu)
}

// MOVING MUST SAVE MORE THAN 1/64 (~1.56%) OF THE STATUS QUO
pub fn energy_saving_worthwhile(prev_energy: u64, best_energy: u64) -> bool {
    prev_energy - (prev_energy >> 6) > best_energy
}

pub fn select_eco_cpu(view: &SystemView, task: &TaskView, prev: usize) -> Option<usize> {
    if view.energy.table(prev).is_empty() {
        return Some(prev);
    }

    let active = view.active_mask();
    let mut best: Option<(u64, usize)> = None;
    for group in view.topology.coregroups() {
        if !group.intersects(active) {
            continue;
        }
        let mut mask = group.and(task.allowed);
        // PREV IS COMPARED SEPARATELY BELOW
        mask.clear(prev);
        if mask.is_empty() {
            continue;
        }

        if let Some(cpu) = find_min_util_cpu(view, mask, task) {
            let energy = calculate_energy(view, task, cpu);
            if best.map(|(e, _)| energy < e).unwrap_or(true) {
                best = Some((energy, cpu));
            }
        }
    }

    let (best_energy, best_cpu) = best?;
    let prev_energy = calculate_energy(view, task, prev);
    let target = if energy_saving_worthwhile(prev_energy, best_energy) { best_cpu } else { prev };
    debug!("eco: pid={} prev={}({}) best={}({}) -> {}",
           task.pid, prev, prev_energy, best_cpu, best_energy, target);
    Some(target)
}

pub fn select_energy_cpu(view: &SystemView, task: &TaskView, prev: usize,
                         waker: usize, sync: bool) -> Option<usize> {
    if !view.features.energy_aware {
        return None;
    }
    // LITTLE TO GAIN ON AN OVERUTILIZED DOMAIN
    if view.overutilized(prev) {
        return None;
    }
    if task.util_avg == 0 {
        return None;
    }
    if view.features.sync_hint && sync && task.allowed.test(waker) {
        return Some(waker);
    }
    select_eco_cpu(view, task, prev)
}

// --- EFFICIENCY MODE ---

// ENERGY PER UNIT OF DELIVERED CAPACITY, WEIGHTED PER COREGROUP. LOWER IS
// BETTER.
pub fn calculate_efficiency(view: &SystemView, task: &TaskView, target: usize) -> u64 {
    if !view.energy.is_initialized() {
        return ENERGY_UNKNOWN;
    }

    let group = view.topology.coregroup_of(target).and(view.active_mask());
    let mut max_util = 0;
    let mut target_util = 0;
    for cpu in group.iter() {
        let u = if cpu == target {
            view.task_attached_cpu_util(cpu, task)
        } else {
            view.cpu_util_wake(cpu, task)
        };
        if cpu == target {
            target_util = u;
        }
        max_util = max_util.max(u);
    }

    let (state, capacity) = match state_for(view.energy.table(target), max_util) {
        Some(s) => s,
        None => return ENERGY_UNKNOWN,
    };

    let l = task.lane.idx();
    let lanes: LaneVec = if target_util >= capacity[Lane::Uss.idx()] {
        let mut r = [0; NR_LANES];
        for lane in Lane::ALL {
            r[lane.idx()] = view.cpu_util_ratio(target, lane);
        }
        r
    } else {
        let mut r = view.cpus[target].util_avg;
        if target != task.cpu {
            r[l] += task.util_avg;
        }
        if view.features.util_est {
            let est = view.cpus[target].util_est;
            if target != task.cpu {
                r[l] += view.task_util_est(task);
            }
            for i in 0..NR_LANES {
                r[i] = r[i].max(est[i]);
            }
        }
        r
    };

    let mut energy = 0;
    for lane in Lane::ALL {
        let ratio = (lanes[lane.idx()] << SCHED_CAPACITY_SHIFT) / capacity[lane.idx()].max(1);
        energy += ratio * state.power[lane.idx()];
    }

    let data = match view.energy.data(target) {
        Some(d) => d,
        None => return ENERGY_UNKNOWN,
    };
    let denom = capacity[l] * data.capacity_weight;
    if denom == 0 {
        return ENERGY_UNKNOWN;
    }
    ((energy * data.energy_weight) << SCHED_CAPACITY_SHIFT) / denom
}

pub fn select_eff_cpu(view: &SystemView, task: &TaskView, prev: usize) -> Option<usize> {
    let tiny_group = view.topology.coregroup_of(view.features.tiny_task_cpu).and(task.allowed);

    if view.energy.table(prev).is_empty() {
        return find_min_util_cpu(view, tiny_group, task);
    }
    // TINY TASKS GO STRAIGHT TO THE LOW-POWER GROUP
    if view.task_util_est(task) <= view.features.tiny_task_level {
        return find_min_util_cpu(view, tiny_group, task);
    }

    let mut best: Option<(u64, usize)> = None;
    for cpu in view.candidates(task, view.topology.all_cpus()).iter() {
        let eff = calculate_efficiency(view, task, cpu);
        if best.map(|(e, _)| eff < e).unwrap_or(true) {
            best = Some((eff, cpu));
        }
    }
    best.map(|(_, cpu)| cpu)
}

pub fn select_best_cpu(view: &SystemView, task: &TaskView, prev: usize,
                       waker: usize, sync: bool) -> Option<usize> {
    if !view.features.energy_aware {
        return None;
    }
    if view.features.sync_hint && sync && task.allowed.test(waker) {
        return Some(waker);
    }
    select_eff_cpu(view, task, prev)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::topology::Topology;
    use crate::view::{CpuView, Features};

    pub const FREQS: [u64; 4] = [2_000_000, 1_500_000, 1_000_000, 500_000];
    pub const LITTLE_VOLTS: [u64; 4] = [900_000, 800_000, 700_000, 600_000];
    pub const BIG_VOLTS: [u64; 4] = [1_100_000, 950_000, 800_000, 650_000];

    // CPUS 0-1: LITTLE (TOP CAPACITY 512), CPUS 2-3: BIG (1024)
    pub fn two_group_model() -> (Topology, EnergyModel) {
        let topo = Topology::new(4, vec![
            CpuMask::parse("0-1").unwrap(),
            CpuMask::parse("2-3").unwrap(),
        ]).unwrap();
        let mut data = vec![CpuEnergyData::new(1000, 40); 2];
        data.extend(vec![CpuEnergyData::new(2000, 100); 2]);
        let mut model = EnergyModel::new(data);
        model.register_domain(topo.coregroup(0), &FREQS, &LITTLE_VOLTS, 2_000_000, 500_000).unwrap();
        model.register_domain(topo.coregroup(1), &FREQS, &BIG_VOLTS, 2_000_000, 500_000).unwrap();
        model.set_initialized(true);
        (topo, model)
    }

    fn idle_view<'a>(topo: &'a Topology, model: &'a EnergyModel) -> SystemView<'a> {
        let cpus = (0..topo.nr_cpus()).map(CpuView::idle).collect();
        SystemView::new(topo, model, cpus, Features { util_est: false, ..Features::default() })
    }

    #[test]
    fn table_is_monotonic() {
        let (_, model) = two_group_model();
        for cpu in 0..4 {
            let t = model.table(cpu);
            assert_eq!(t.len(), 4);
            for w in t.windows(2) {
                assert!(w[0].frequency < w[1].frequency);
                assert!(w[0].cap[0] <= w[1].cap[0]);
                assert!(w[0].power[0] <= w[1].power[0]);
            }
        }
    }

    #[test]
    fn capacity_normalized_to_fastest() {
        let (_, model) = two_group_model();
        let caps: Vec<u64> = model.table(0).iter().map(|s| s.cap[0]).collect();
        assert_eq!(caps, vec![128, 256, 384, 512]);
        let powers: Vec<u64> = model.table(2).iter().map(|s| s.power[0]).collect();
        assert_eq!(powers, vec![21, 64, 135, 242]);
        assert_eq!(model.capacity(0, Lane::Uss), 512);
        assert_eq!(model.capacity(3, Lane::Uss), 1024);
        assert_eq!(model.max_capacity(1, Lane::Sse), 512);
        assert_eq!(model.freq_cap(2, 1_200_000, Lane::Uss), 768);
    }

    #[test]
    fn registering_faster_domain_rescales() {
        let topo_groups = [CpuMask::parse("0-1").unwrap(), CpuMask::parse("2-3").unwrap()];
        let mut data = vec![CpuEnergyData::new(1000, 40); 2];
        data.extend(vec![CpuEnergyData::new(2000, 100); 2]);
        let mut model = EnergyModel::new(data);
        model.register_domain(topo_groups[0], &FREQS, &LITTLE_VOLTS, 2_000_000, 500_000).unwrap();
        assert_eq!(model.capacity(0, Lane::Uss), 1024);
        model.register_domain(topo_groups[1], &FREQS, &BIG_VOLTS, 2_000_000, 500_000).unwrap();
        assert_eq!(model.capacity(0, Lane::Uss), 512);
    }

    #[test]
    fn register_rejects_mixed_mips_and_empty_range() {
        let mut data = vec![CpuEnergyData::new(1000, 40); 2];
        data[1].mips = 1200;
        let mut model = EnergyModel::new(data);
        assert!(model.register_domain(CpuMask::parse("0-1").unwrap(), &FREQS, &LITTLE_VOLTS, 2_000_000, 0).is_err());

        let mut model = EnergyModel::new(vec![CpuEnergyData::new(1000, 40)]);
        assert!(model.register_domain(CpuMask::single(0), &FREQS, &LITTLE_VOLTS, 400_000, 100_000).is_err());
        assert!(model.table(0).is_empty());
    }

    #[test]
    fn min_of_cpufreq_and_qos_capacity() {
        let (topo, mut model) = two_group_model();
        model.update_cpufreq_capacity(topo.coregroup(1), 1_000_000, 2_000_000);
        assert_eq!(model.capacity(2, Lane::Uss), 512);
        model.update_qos_capacity(topo.coregroup(1), 500_000, 2_000_000);
        assert_eq!(model.capacity(2, Lane::Uss), 256);
        model.update_cpufreq_capacity(topo.coregroup(1), 2_000_000, 2_000_000);
        assert_eq!(model.capacity(2, Lane::Uss), 256);
        model.update_qos_capacity(topo.coregroup(1), 2_000_000, 2_000_000);
        assert_eq!(model.capacity(2, Lane::Uss), 1024);
        // LITTLE UNTOUCHED
        assert_eq!(model.capacity(0, Lane::Uss), 512);
    }

    #[test]
    fn hysteresis_threshold() {
        assert!(!energy_saving_worthwhile(1000, 990));
        assert!(energy_saving_worthwhile(1000, 900));
        // EXACTLY 1/64 BELOW IS NOT ENOUGH
        assert!(!energy_saving_worthwhile(6400, 6300));
        assert!(energy_saving_worthwhile(6400, 6299));
    }

    #[test]
    fn unknown_energy_before_init() {
        let (topo, mut model) = two_group_model();
        model.set_initialized(false);
        let v = idle_view(&topo, &model);
        let t = TaskView { util_avg: 100, allowed: topo.all_cpus(), ..Default::default() };
        assert_eq!(calculate_energy(&v, &t, 1), ENERGY_UNKNOWN);
    }

    #[test]
    fn small_task_cheaper_on_little() {
        let (topo, model) = two_group_model();
        let mut v = idle_view(&topo, &model);
        let t = TaskView { cpu: 2, util_avg: 100, attached: true, allowed: topo.all_cpus(), ..Default::default() };
        v.cpus[2].util_avg = [100, 0];
        let on_little = calculate_energy(&v, &t, 0);
        let on_big = calculate_energy(&v, &t, 2);
        assert!(on_little < on_big, "little {} big {}", on_little, on_big);
        assert_eq!(select_eco_cpu(&v, &t, 2), Some(0));
    }

    #[test]
    fn energy_short_circuits() {
        let (topo, model) = two_group_model();
        let mut v = idle_view(&topo, &model);
        let t = TaskView { cpu: 2, util_avg: 0, attached: true, allowed: topo.all_cpus(), ..Default::default() };
        assert_eq!(select_energy_cpu(&v, &t, 2, 1, false), None);

        let t = TaskView { util_avg: 50, ..t };
        assert_eq!(select_energy_cpu(&v, &t, 2, 1, true), Some(1));

        v.features.energy_aware = false;
        assert_eq!(select_energy_cpu(&v, &t, 2, 1, false), None);
    }

    #[test]
    fn min_util_cpu_skips_full_cpus() {
        let (topo, model) = two_group_model();
        let mut v = idle_view(&topo, &model);
        v.cpus[0].util_avg = [512, 0];
        v.cpus[1].util_avg = [200, 0];
        let t = TaskView { cpu: 3, attached: true, allowed: topo.all_cpus(), ..Default::default() };
        assert_eq!(find_min_util_cpu(&v, topo.coregroup(0), &t), Some(1));
        v.cpus[1].util_avg = [600, 0];
        assert_eq!(find_min_util_cpu(&v, topo.coregroup(0), &t), None);
    }

    #[test]
    fn eff_mode_routes_tiny_tasks() {
        let (topo, model) = two_group_model();
        let mut v = idle_view(&topo, &model);
        v.features.tiny_task_cpu = 0;
        v.cpus[0].util_avg = [50, 0];
        let t = TaskView { cpu: 3, util_avg: 5, attached: true, allowed: topo.all_cpus(), ..Default::default() };
        assert_eq!(select_eff_cpu(&v, &t, 3), Some(1));
    }

    #[test]
    fn eff_mode_weights_shift_choice() {
        let (topo, mut model) = two_group_model();
        let t = TaskView { cpu: 3, util_avg: 200, attached: true, allowed: topo.all_cpus(), ..Default::default() };
        let pick = {
            let v = idle_view(&topo, &model);
            select_eff_cpu(&v, &t, 3)
        };
        assert!(pick.is_some());
        // MAKE THE LITTLE GROUP LOOK TERRIBLE
        model.set_energy_weight(topo.coregroup(0), 1, 1000);
        let v = idle_view(&topo, &model);
        let pick = select_eff_cpu(&v, &t, 3).unwrap();
        assert!(topo.coregroup(1).test(pick));
    }
}
