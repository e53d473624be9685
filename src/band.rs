// EMS TASK BANDS
// THREADS OF ONE PROCESS (KEYED BY TGID) THAT OPT IN ARE GROUPED INTO A BAND
// AND KEPT ON A SHARED SET OF PLAYABLE CPUS FOR CACHE AFFINITY. THE SET IS
// THE SLOWEST COREGROUP WHOSE ACTIVE CAPACITY COVERS THE BAND'S COMBINED
// UTILIZATION WITH THE OVERUTILIZATION MARGIN, ELSE THE FASTEST ONE.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;

use crate::multi_load::SCHED_CAPACITY_SCALE;
use crate::topology::CpuMask;
use crate::view::{Pid, SystemView, TaskView, CAPACITY_MARGIN};

#[derive(Clone, Debug, Default)]
pub struct Band {
    pub tgid: Pid,
    pub members: BTreeSet<Pid>,
    pub util: u64,
    pub playable: CpuMask,
}

#[derive(Default)]
struct BandTable {
    bands: HashMap<Pid, Band>,
    member_of: HashMap<Pid, Pid>,
}

#[derive(Default)]
pub struct Bands {
    inner: RwLock<BandTable>,
}

impl Bands {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BandTable> {
        match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BandTable> {
        match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // JOINING AGAIN MOVES THE THREAD TO THE NEW BAND
    pub fn join(&self, pid: Pid, tgid: Pid) {
        self.leave(pid);
        let mut t = self.write();
        t.bands.entry(tgid)
            .or_insert_with(|| Band { tgid, ..Default::default() })
            .members.insert(pid);
        t.member_of.insert(pid, tgid);
        debug!("band {}: pid {} joined", tgid, pid);
    }

    // THE LAST MEMBER LEAVING DISSOLVES THE BAND
    pub fn leave(&self, pid: Pid) -> Option<Pid> {
        let mut t = self.write();
        let tgid = t.member_of.remove(&pid)?;
        let empty = match t.bands.get_mut(&tgid) {
            Some(b) => {
                b.members.remove(&pid);
                b.members.is_empty()
            }
            None => false,
        };
        if empty {
            t.bands.remove(&tgid);
            debug!("band {}: dissolved", tgid);
        }
        Some(tgid)
    }

    pub fn band_of(&self, pid: Pid) -> Option<Pid> {
        self.read().member_of.get(&pid).copied()
    }

    pub fn members(&self, tgid: Pid) -> Vec<Pid> {
        self.read().bands.get(&tgid).map(|b| b.members.iter().copied().collect()).unwrap_or_default()
    }

    pub fn playable(&self, tgid: Pid) -> CpuMask {
        self.read().bands.get(&tgid).map(|b| b.playable).unwrap_or_else(CpuMask::empty)
    }

    pub fn get(&self, tgid: Pid) -> Option<Band> {
        self.read().bands.get(&tgid).cloned()
    }

    pub fn tgids(&self) -> Vec<Pid> {
        let mut v: Vec<Pid> = self.read().bands.keys().copied().collect();
        v.sort_unstable();
        v
    }

    // `util`: SUM OF THE MEMBERS' UTILIZATION
    pub fn update(&self, tgid: Pid, util: u64, view: &SystemView) {
        let playable = playable_cpus(view, util);
        let mut t = self.write();
        if let Some(b) = t.bands.get_mut(&tgid) {
            if b.playable != playable {
                debug!("band {}: util={} playable {} -> {}", tgid, util, b.playable, playable);
            }
            b.util = util;
            b.playable = playable;
        }
    }

    // ANY PLAYABLE CPU WITH NOTHING RUNNABLE WINS OUTRIGHT, ELSE THE LEAST
    // UTILIZED ONE
    pub fn play_cpu(&self, view: &SystemView, task: &TaskView) -> Option<usize> {
        let tgid = task.band?;
        let mask = view.candidates(task, self.playable(tgid));
        if mask.is_empty() {
            return None;
        }
        if let Some(cpu) = mask.iter().find(|&c| view.cpu(c).nr_running == 0) {
            return Some(cpu);
        }
        mask.iter().min_by_key(|&c| (view.cpu_util(c), c))
    }
}

pub fn playable_cpus(view: &SystemView, util: u64) -> CpuMask {
    if util == 0 {
        return CpuMask::empty();
    }
    let active = view.active_mask();
    let mut last = CpuMask::empty();
    for g in view.coregroups_by_capacity() {
        let cpus = view.topology.coregroup(g).and(active);
        if cpus.is_empty() {
            continue;
        }
        let capacity: u64 = cpus.iter().map(|c| view.capacity_orig(c)).sum();
        if util * CAPACITY_MARGIN <= capacity * SCHED_CAPACITY_SCALE {
            return cpus;
        }
        last = cpus;
    }
    last
}
