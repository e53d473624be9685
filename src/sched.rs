// EMS SCHEDULER STATE
// PER-CPU RUNQUEUES OWNING THEIR TASKS, THE LOAD TRACKING THAT RUNS ON THEM
// AND THE ENTRY POINTS THE SIMULATION DRIVES: FORK, WAKE, SLEEP, EXIT, TICK,
// MIGRATE, HOTPLUG. PLACEMENT AND ONTIME DECISIONS ARE TAKEN ON A SNAPSHOT
// (with_view) AND EXECUTED HERE UNDER THE RUNQUEUE LOCKS.
//
// LOCKING:
//   RQ LOCKS ARE TAKEN ONE AT A TIME, OR TWO IN CPU ORDER FOR A MIGRATION.
//   RQ -> PID INDEX, RQ -> BANDS. NEVER AN RQ LOCK WHILE HOLDING THE INDEX.
//   CPUFREQ HOOKS RUN AFTER EVERY RQ LOCK IS RELEASED; THEY CALL BACK INTO
//   THE UtilSource SIDE, WHICH TAKES RQ LOCKS ITSELF.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use serde::Serialize;

use crate::band::Bands;
use crate::boost::{GlobalBoost, Kpp};
use crate::config::PlatformConfig;
use crate::cpufreq::schedutil::{UpdateUtil, UtilSource, SCHED_CPUFREQ_IOWAIT};
use crate::multi_load::{CpuLoad, Lane, LaneVec, TaskLoad};
use crate::ontime::{Migration, Ontime, RqSnapshot};
use crate::part::{ActiveRatio, PartEvent, PartParams};
use crate::placement::{select_proper_cpu, select_task_rq, PlacementCtx, Strategy, Wakeup};
use crate::platform::Platform;
use crate::service::ServicePools;
use crate::stop::CpuStoppers;
use crate::topology::CpuMask;
use crate::tuning::{Tunables, NR_CGROUPS};
use crate::view::{CpuView, GroupAttrs, Pid, SystemView, TaskView};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Queued,
    Sleeping,
}

#[derive(Clone, Debug)]
pub struct NewTask {
    pub name: String,
    // NONE: LEADS ITS OWN THREAD GROUP
    pub tgid: Option<Pid>,
    pub lane: Lane,
    pub allowed: CpuMask,
    pub group: GroupAttrs,
    pub parent: Option<Pid>,
    pub iowait: bool,
}

#[derive(Clone, Debug)]
pub struct Task {
    pub pid: Pid,
    pub tgid: Pid,
    pub name: String,
    pub lane: Lane,
    pub allowed: CpuMask,
    pub group: GroupAttrs,
    pub load: TaskLoad,
    pub cpu: usize,
    pub state: TaskState,
    pub iowait: bool,
    pub ontime_migrating: bool,
    pub nr_migrations: u64,
    pub last_strategy: Option<Strategy>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateReason {
    // VETOED BY THE ONTIME REVERSE CHECK WHEN IT OBJECTS
    Balance,
    // AFFINITY OR HOTPLUG: NO VETO
    Forced,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SchedStats {
    pub forks: u64,
    pub wakeups: u64,
    pub wake_migrations: u64,
    pub migrations: u64,
    pub ontime_migrations: u64,
    pub ontime_aborts: u64,
    pub balance_pulls: u64,
    pub balance_vetoes: u64,
    pub placements: [u64; 9],
}

struct Rq {
    cpu: usize,
    online: bool,
    active: bool,
    load: CpuLoad,
    curr: Option<Pid>,
    queue: VecDeque<Pid>,
    tasks: BTreeMap<Pid, Task>,
    part: ActiveRatio,
}

impl Rq {
    fn nr_running(&self) -> usize {
        self.curr.is_some() as usize + self.queue.len()
    }

    fn runnable(&self) -> impl Iterator<Item = Pid> + '_ {
        self.curr.into_iter().chain(self.queue.iter().copied())
    }

    fn boost(&self) -> i32 {
        self.runnable()
            .filter_map(|p| self.tasks.get(&p))
            .map(|t| t.group.boost)
            .max()
            .unwrap_or(0)
            .max(0)
    }

    fn enqueue(&mut self, pid: Pid) {
        let state = if self.curr.is_none() {
            self.curr = Some(pid);
            TaskState::Running
        } else {
            self.queue.push_back(pid);
            TaskState::Queued
        };
        if let Some(t) = self.tasks.get_mut(&pid) {
            t.state = state;
        }
    }

    // TAKE `pid` OFF THE CPU OR THE QUEUE; THE NEXT QUEUED TASK RUNS
    fn dequeue(&mut self, pid: Pid) {
        if self.curr == Some(pid) {
            self.curr = None;
        } else {
            self.queue.retain(|&p| p != pid);
        }
        self.resched();
    }

    // AN EMPTY CPU WITH QUEUED WORK PICKS THE HEAD OF THE QUEUE
    fn resched(&mut self) {
        if self.curr.is_some() {
            return;
        }
        self.curr = self.queue.pop_front();
        if let Some(next) = self.curr {
            if let Some(t) = self.tasks.get_mut(&next) {
                t.state = TaskState::Running;
            }
        }
    }

    // PUT THE RUNNING TASK BACK AT THE HEAD OF THE QUEUE, CPU LEFT EMPTY.
    // THE CALLER MOVES IT AWAY OR CALLS resched().
    fn preempt(&mut self, pid: Pid) {
        if self.curr != Some(pid) {
            return;
        }
        self.curr = None;
        self.queue.push_front(pid);
        if let Some(t) = self.tasks.get_mut(&pid) {
            t.state = TaskState::Queued;
        }
    }

    fn cpu_view(&self) -> CpuView {
        let nr_running = self.nr_running();
        CpuView {
            cpu: self.cpu,
            online: self.online,
            active: self.active,
            util_avg: self.load.util_avg,
            util_est: self.load.util_est,
            nr_running,
            idle_state: if nr_running == 0 { Some(0) } else { None },
            boost: self.boost(),
        }
    }
}

pub struct SchedulerState {
    platform: Arc<Platform>,
    tunables: Arc<Tunables>,
    part_params: PartParams,
    // ORIGINAL CAPACITY PER CPU AND LANE
    caps: Vec<LaneVec>,
    rqs: Vec<Mutex<Rq>>,
    index: RwLock<HashMap<Pid, usize>>,
    hooks: RwLock<Vec<Option<Arc<dyn UpdateUtil>>>>,
    stoppers: CpuStoppers,
    perf_cpus: CpuMask,
    pub bands: Bands,
    pub services: ServicePools,
    pub ontime: Ontime,
    pub global_boost: GlobalBoost,
    pub kpp: Kpp,
    next_pid: AtomicU32,
    clock: AtomicU64,
    kick: AtomicBool,
    stats: Mutex<SchedStats>,
}

fn lock_rq(m: &Mutex<Rq>) -> MutexGuard<'_, Rq> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SchedulerState {
    // THE DVFS DRIVER MUST HAVE REGISTERED ITS ENERGY TABLES: CAPACITIES AND
    // ONTIME BOUNDARIES ARE RESOLVED HERE
    pub fn new(cfg: &PlatformConfig, platform: Arc<Platform>, tunables: Arc<Tunables>,
               now: u64) -> Result<Arc<Self>> {
        let topology = platform.topology().clone();
        let nr_cpus = topology.nr_cpus();
        let energy = platform.energy();

        let caps: Vec<LaneVec> = (0..nr_cpus)
            .map(|c| [energy.max_capacity(c, Lane::Uss), energy.max_capacity(c, Lane::Sse)])
            .collect();
        let ontime_cfg: Vec<_> = cfg.coregroups.iter().map(|g| g.ontime).collect();
        let ontime = Ontime::from_config(&ontime_cfg, &topology, &energy);
        drop(energy);

        let rqs = (0..nr_cpus).map(|cpu| {
            let g = cfg.coregroups.get(topology.group_of(cpu));
            let mut part = ActiveRatio::new(g.map(|g| g.part_limit).unwrap_or(1024),
                                            g.map(|g| g.part_boost).unwrap_or(0));
            part.start(now);
            Mutex::new(Rq {
                cpu,
                online: true,
                active: true,
                load: CpuLoad::new(now.max(1)),
                curr: None,
                queue: VecDeque::new(),
                tasks: BTreeMap::new(),
                part,
            })
        }).collect();

        let state = Self {
            caps,
            rqs,
            index: RwLock::new(HashMap::new()),
            hooks: RwLock::new(vec![None; nr_cpus]),
            stoppers: CpuStoppers::new(nr_cpus)?,
            perf_cpus: cfg.perf_mask()?,
            bands: Bands::new(),
            services: ServicePools::from_config(&cfg.services, nr_cpus),
            ontime,
            global_boost: GlobalBoost::new(now + cfg.boot_boost_ms * 1_000_000),
            kpp: Kpp::new(NR_CGROUPS),
            next_pid: AtomicU32::new(1),
            clock: AtomicU64::new(now),
            kick: AtomicBool::new(false),
            stats: Mutex::new(SchedStats::default()),
            part_params: cfg.part,
            platform,
            tunables,
        };
        info!("sched: {} cpus, {} coregroups, perf cpus {}",
              nr_cpus, topology.nr_coregroups(), state.perf_cpus);
        Ok(Arc::new(state))
    }

    pub fn nr_cpus(&self) -> usize {
        self.rqs.len()
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn tunables(&self) -> &Arc<Tunables> {
        &self.tunables
    }

    pub fn stats(&self) -> SchedStats {
        match self.stats.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn bump(&self, f: impl FnOnce(&mut SchedStats)) {
        match self.stats.lock() {
            Ok(mut s) => f(&mut s),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn rq(&self, cpu: usize) -> Result<MutexGuard<'_, Rq>> {
        self.rqs.get(cpu).map(lock_rq).ok_or_else(|| anyhow!("no cpu{}", cpu))
    }

    // BOTH IN CPU ORDER, RETURNED AS (a, b)
    fn rq_pair(&self, a: usize, b: usize) -> Result<(MutexGuard<'_, Rq>, MutexGuard<'_, Rq>)> {
        if a == b {
            bail!("double lock of cpu{}", a);
        }
        if a < b {
            let ga = self.rq(a)?;
            let gb = self.rq(b)?;
            Ok((ga, gb))
        } else {
            let gb = self.rq(b)?;
            let ga = self.rq(a)?;
            Ok((ga, gb))
        }
    }

    fn cpu_of(&self, pid: Pid) -> Result<usize> {
        let index = match self.index.read() {
            Ok(i) => i,
            Err(poisoned) => poisoned.into_inner(),
        };
        index.get(&pid).copied().ok_or_else(|| anyhow!("no task {}", pid))
    }

    fn set_cpu_of(&self, pid: Pid, cpu: Option<usize>) {
        let mut index = match self.index.write() {
            Ok(i) => i,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cpu {
            Some(c) => {
                index.insert(pid, c);
            }
            None => {
                index.remove(&pid);
            }
        }
    }

    fn tick_clock(&self, now: u64) {
        self.clock.fetch_max(now, Ordering::Relaxed);
    }

    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    // --- LOAD TRACKING ---

    // BRING THE CPU AND ITS RUNNABLE TASKS TO `now`. RETURNS THE TASKS THAT
    // CROSSED A PERIOD.
    fn update_rq(&self, rq: &mut Rq, now: u64) -> Vec<Pid> {
        let sf = self.platform.freq_scale(rq.cpu);
        let caps = self.caps[rq.cpu];
        let running = rq.curr.and_then(|p| rq.tasks.get(&p)).map(|t| t.lane);
        rq.load.update(now, sf, caps[running.unwrap_or(Lane::Uss).idx()], running);

        let mut crossed = Vec::new();
        let runnable: Vec<Pid> = rq.runnable().collect();
        let curr = rq.curr;
        for pid in runnable {
            if let Some(t) = rq.tasks.get_mut(&pid) {
                let cap = caps[t.lane.idx()];
                if t.load.update(now, sf, cap, true, curr == Some(pid)) {
                    crossed.push(pid);
                }
            }
        }

        if self.tunables.part() {
            let nr = rq.nr_running();
            let mut params = self.part_params;
            params.policy = self.tunables.part_policy();
            rq.part.update(&params, now, PartEvent::Update, nr);
        }
        crossed
    }

    // SLEEPING TASK: DECAY ITS BLOCKED SIGNAL TO `now`
    fn update_blocked(&self, t: &mut Task, now: u64) {
        let sf = self.platform.freq_scale(t.cpu);
        let cap = self.caps[t.cpu][t.lane.idx()];
        t.load.update(now, sf, cap, false, false);
    }

    fn util_est_on(&self, t: &Task) -> bool {
        self.tunables.util_est() && t.group.util_est
    }

    // ATTACH AT THE RUNQUEUE'S CLOCK SO BOTH DECAY IN STEP
    fn attach(&self, rq: &mut Rq, t: &mut Task) {
        t.load.last_update_time = rq.load.last_update_time.max(1);
        t.load.period_contrib = rq.load.period_contrib;
        rq.load.attach(t.lane, &t.load);
        t.cpu = rq.cpu;
    }

    fn enqueue_task(&self, rq: &mut Rq, t: Task, now: u64) {
        let pid = t.pid;
        let was = rq.nr_running();
        let raw = t.load.util_est_raw(true);
        rq.load.util_est_enqueue(t.lane, raw);
        rq.tasks.insert(pid, t);
        rq.enqueue(pid);
        if self.tunables.part() {
            let mut params = self.part_params;
            params.policy = self.tunables.part_policy();
            rq.part.update(&params, now, PartEvent::Enqueue, was);
        }
    }

    // RUNQUEUE SIDE OF A DEQUEUE; THE TASK STAYS IN rq.tasks
    fn dequeue_task(&self, rq: &mut Rq, pid: Pid, sleep: bool, now: u64) {
        let was = rq.nr_running();
        let (lane, raw) = match rq.tasks.get(&pid) {
            Some(t) => (t.lane, t.load.util_est_raw(true)),
            None => return,
        };
        rq.dequeue(pid);
        rq.load.util_est_dequeue(lane, raw, was.saturating_sub(1));

        let cap = self.caps[rq.cpu][lane.idx()];
        if let Some(t) = rq.tasks.get_mut(&pid) {
            let on = self.util_est_on(t);
            t.load.util_est_dequeue(sleep, on, cap);
            t.state = TaskState::Sleeping;
        }
        if self.tunables.part() {
            let mut params = self.part_params;
            params.policy = self.tunables.part_policy();
            rq.part.update(&params, now, PartEvent::Dequeue, was);
        }
    }

    // --- SNAPSHOTS ---

    fn task_view_locked(&self, t: &Task) -> TaskView {
        TaskView {
            pid: t.pid,
            tgid: t.tgid,
            cpu: t.cpu,
            lane: t.lane,
            allowed: t.allowed,
            util_avg: t.load.util_avg,
            runnable_avg: t.load.runnable_avg,
            util_est: t.load.util_est,
            attached: t.load.is_attached(),
            queued: t.state != TaskState::Sleeping,
            group: t.group,
            band: self.bands.band_of(t.pid),
            ontime_migrating: t.ontime_migrating,
        }
    }

    pub fn task_view(&self, pid: Pid) -> Option<TaskView> {
        let cpu = self.cpu_of(pid).ok()?;
        let rq = self.rq(cpu).ok()?;
        rq.tasks.get(&pid).map(|t| self.task_view_locked(t))
    }

    pub fn task(&self, pid: Pid) -> Option<Task> {
        let cpu = self.cpu_of(pid).ok()?;
        let rq = self.rq(cpu).ok()?;
        rq.tasks.get(&pid).cloned()
    }

    pub fn pids(&self) -> Vec<Pid> {
        let index = match self.index.read() {
            Ok(i) => i,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut v: Vec<Pid> = index.keys().copied().collect();
        v.sort_unstable();
        v
    }

    pub fn cpu_view(&self, cpu: usize) -> Option<CpuView> {
        self.rq(cpu).ok().map(|rq| rq.cpu_view())
    }

    pub fn nr_running(&self, cpu: usize) -> usize {
        self.rq(cpu).map(|rq| rq.nr_running()).unwrap_or(0)
    }

    pub fn is_idle_cpu(&self, cpu: usize) -> bool {
        self.nr_running(cpu) == 0
    }

    pub fn is_online(&self, cpu: usize) -> bool {
        self.rq(cpu).map(|rq| rq.online).unwrap_or(false)
    }

    pub fn runqueue(&self, cpu: usize) -> (Option<Pid>, Vec<Pid>) {
        match self.rq(cpu) {
            Ok(rq) => (rq.curr, rq.queue.iter().copied().collect()),
            Err(_) => (None, Vec::new()),
        }
    }

    // ONE CONSISTENT-PER-CPU SNAPSHOT FOR A DECISION
    pub fn with_view<R>(&self, f: impl FnOnce(&SystemView) -> R) -> R {
        let cpus: Vec<CpuView> = self.rqs.iter().map(|m| lock_rq(m).cpu_view()).collect();
        let energy = self.platform.energy();
        let view = SystemView::new(self.platform.topology(), &energy, cpus, self.tunables.features());
        f(&view)
    }

    fn select(&self, task: &TaskView, wake: &Wakeup) -> (usize, Strategy) {
        let kpp = self.kpp.active_groups();
        let global_boost = self.global_boost.active(self.now());
        self.with_view(|v| {
            let ctx = PlacementCtx {
                services: &self.services,
                ontime: &self.ontime,
                bands: &self.bands,
                perf_cpus: self.perf_cpus,
                global_boost,
                kpp: &kpp,
            };
            select_task_rq(v, &ctx, task, wake)
        })
    }

    // --- CPUFREQ HOOKS ---

    pub fn set_cpufreq_hook(&self, cpus: CpuMask, hook: Option<Arc<dyn UpdateUtil>>) {
        let mut hooks = match self.hooks.write() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        for cpu in cpus.iter() {
            if let Some(slot) = hooks.get_mut(cpu) {
                *slot = hook.clone();
            }
        }
    }

    // NO RQ LOCK MAY BE HELD HERE
    pub fn cpufreq_update(&self, cpu: usize, now: u64, flags: u32) {
        let hook = match self.hooks.read() {
            Ok(h) => h.get(cpu).cloned().flatten(),
            Err(poisoned) => poisoned.into_inner().get(cpu).cloned().flatten(),
        };
        if let Some(h) = hook {
            h.update_util(self, cpu, now, flags);
        }
    }

    // --- TASK LIFECYCLE ---

    pub fn fork(&self, spec: NewTask, now: u64) -> Result<Pid> {
        self.tick_clock(now);
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (parent_load, prev) = match spec.parent.and_then(|p| self.task(p)) {
            Some(p) => (Some(p.load), p.cpu),
            None => (None, spec.allowed.first().unwrap_or(0)),
        };
        let allowed = spec.allowed.and(self.platform.topology().all_cpus());
        if allowed.is_empty() {
            bail!("task {}: no possible cpu in {}", spec.name, spec.allowed);
        }

        let mut task = Task {
            pid,
            tgid: spec.tgid.unwrap_or(pid),
            name: spec.name,
            lane: spec.lane,
            allowed,
            group: spec.group,
            load: TaskLoad::forked(parent_load.as_ref()),
            cpu: prev,
            state: TaskState::Sleeping,
            iowait: spec.iowait,
            ontime_migrating: false,
            nr_migrations: 0,
            last_strategy: None,
        };

        let tv = self.task_view_locked(&task);
        let (cpu, s) = self.select(&tv, &Wakeup { prev, waker: prev, sync: false });
        let cpu = self.usable_cpu(&task, cpu);
        task.last_strategy = Some(s);
        {
            let mut rq = self.rq(cpu)?;
            self.update_rq(&mut rq, now);
            let util = rq.load.util_avg[task.lane.idx()];
            task.load.post_init(util, rq.nr_running(), self.caps[cpu][task.lane.idx()]);
            self.attach(&mut rq, &mut task);
            self.set_cpu_of(pid, Some(cpu));
            self.enqueue_task(&mut rq, task, now);
        }
        self.bump(|st| {
            st.forks += 1;
            st.placements[s.idx()] += 1;
        });
        debug!("fork: pid={} -> cpu{} ({})", pid, cpu, s.label());
        self.cpufreq_update(cpu, now, 0);
        Ok(pid)
    }

    // AN OPINION ABOUT AN INACTIVE OR DISALLOWED CPU IS OVERRIDDEN
    fn usable_cpu(&self, task: &Task, cpu: usize) -> usize {
        let active: Vec<bool> = self.rqs.iter().map(|m| lock_rq(m).active).collect();
        let ok = |c: usize| task.allowed.test(c) && active.get(c).copied().unwrap_or(false);
        if ok(cpu) {
            return cpu;
        }
        task.allowed.iter().find(|&c| ok(c))
            .or_else(|| (0..active.len()).find(|&c| active[c]))
            .unwrap_or(cpu)
    }

    // A QUEUED TASK ON A NOW-DISALLOWED CPU IS MOVED RIGHT AWAY; A SLEEPING
    // ONE MOVES ON ITS NEXT WAKEUP
    pub fn set_affinity(&self, pid: Pid, allowed: CpuMask, now: u64) -> Result<()> {
        let allowed = allowed.and(self.platform.topology().all_cpus());
        if allowed.is_empty() {
            bail!("pid {}: empty affinity", pid);
        }
        let cpu = self.cpu_of(pid)?;
        let state = {
            let mut rq = self.rq(cpu)?;
            let t = rq.tasks.get_mut(&pid).ok_or_else(|| anyhow!("task {} not on cpu{}", pid, cpu))?;
            t.allowed = allowed;
            t.state
        };
        if allowed.test(cpu) || state == TaskState::Sleeping {
            return Ok(());
        }
        let (dst, snapshot) = match self.task(pid) {
            Some(t) => (self.usable_cpu(&t, allowed.first().unwrap_or(cpu)), t),
            None => return Ok(()),
        };
        let moved = {
            let (mut src, mut d) = self.rq_pair(cpu, dst)?;
            src.preempt(pid);
            let moved = self.move_task_locked(&mut src, &mut d, pid, now);
            src.resched();
            moved
        };
        if moved {
            self.bump(|st| st.migrations += 1);
            self.cpufreq_update(cpu, now, 0);
            self.cpufreq_update(dst, now, 0);
        } else {
            warn!("pid {} ({}): could not leave cpu{}", pid, snapshot.name, cpu);
        }
        Ok(())
    }

    pub fn band_join(&self, pid: Pid) -> Result<()> {
        let t = self.task(pid).ok_or_else(|| anyhow!("no task {}", pid))?;
        self.bands.join(pid, t.tgid);
        Ok(())
    }

    // REFRESH EVERY BAND'S COMBINED UTILIZATION AND PLAYABLE CPUS
    pub fn update_bands(&self) {
        for tgid in self.bands.tgids() {
            let util: u64 = self.bands.members(tgid).into_iter()
                .filter_map(|p| self.task_view(p))
                .map(|t| t.util_avg)
                .sum();
            self.with_view(|v| self.bands.update(tgid, util, v));
        }
    }

    // RETURNS THE CPU THE TASK WAS QUEUED ON. A TASK SOMEONE ELSE WOKE
    // FIRST STAYS WHERE THAT WAKEUP PUT IT.
    pub fn wake_up(&self, pid: Pid, now: u64, waker: Option<usize>, sync: bool) -> Result<usize> {
        self.tick_clock(now);
        let src = self.cpu_of(pid)?;
        let (tv, snapshot) = {
            let mut rq = self.rq(src)?;
            let t = match rq.tasks.get_mut(&pid) {
                Some(t) => t,
                // ANOTHER WAKEUP HAS IT IN FLIGHT; THE INDEX ALREADY
                // NAMES THE RUNQUEUE IT IS LANDING ON
                None => return self.cpu_of(pid),
            };
            if t.state != TaskState::Sleeping {
                return Ok(src);
            }
            self.update_blocked(t, now);
            (self.task_view_locked(t), t.clone())
        };

        let wake = Wakeup { prev: src, waker: waker.unwrap_or(src), sync };
        let (dst, s) = self.select(&tv, &wake);
        let dst = self.usable_cpu(&snapshot, dst);
        let flags = if snapshot.iowait { SCHED_CPUFREQ_IOWAIT } else { 0 };

        // THE SOURCE LOCK WAS DROPPED FOR SELECTION: RECHECK BEFORE QUEUEING
        if dst == src {
            let mut rq = self.rq(src)?;
            if !self.still_asleep(&rq, pid, src)? {
                drop(rq);
                return self.cpu_of(pid);
            }
            self.update_rq(&mut rq, now);
            if let Some(mut t) = rq.tasks.remove(&pid) {
                t.last_strategy = Some(s);
                self.enqueue_task(&mut rq, t, now);
            }
        } else {
            // LEAVE THE SOURCE WITHOUT HOLDING BOTH LOCKS: ITS SHARE IS
            // FOLDED OUT ON THE SOURCE'S NEXT UPDATE
            let mut t = {
                let mut rq = self.rq(src)?;
                if !self.still_asleep(&rq, pid, src)? {
                    drop(rq);
                    return self.cpu_of(pid);
                }
                let t = rq.tasks.remove(&pid).ok_or_else(|| anyhow!("task {} vanished", pid))?;
                rq.load.remove(t.lane, &t.load);
                self.set_cpu_of(pid, Some(dst));
                t
            };
            t.last_strategy = Some(s);
            t.nr_migrations += 1;
            let mut rq = self.rq(dst)?;
            self.update_rq(&mut rq, now);
            self.attach(&mut rq, &mut t);
            self.enqueue_task(&mut rq, t, now);
        }

        self.bump(|st| {
            st.wakeups += 1;
            st.placements[s.idx()] += 1;
            if dst != src {
                st.wake_migrations += 1;
            }
        });
        self.cpufreq_update(dst, now, flags);
        Ok(dst)
    }

    // CALLER HOLDS src's LOCK
    fn still_asleep(&self, rq: &Rq, pid: Pid, src: usize) -> Result<bool> {
        let asleep = rq.tasks.get(&pid).map_or(false, |t| t.state == TaskState::Sleeping);
        Ok(asleep && self.cpu_of(pid)? == src)
    }

    pub fn sleep(&self, pid: Pid, now: u64) -> Result<()> {
        self.tick_clock(now);
        let cpu = self.cpu_of(pid)?;
        {
            let mut rq = self.rq(cpu)?;
            match rq.tasks.get(&pid) {
                Some(t) if t.state != TaskState::Sleeping => {}
                Some(_) => return Ok(()),
                None => bail!("task {} not on cpu{}", pid, cpu),
            }
            self.update_rq(&mut rq, now);
            self.dequeue_task(&mut rq, pid, true, now);
        }
        self.cpufreq_update(cpu, now, 0);
        Ok(())
    }

    pub fn exit(&self, pid: Pid, now: u64) -> Result<()> {
        self.tick_clock(now);
        let cpu = self.cpu_of(pid)?;
        {
            let mut rq = self.rq(cpu)?;
            self.update_rq(&mut rq, now);
            let queued = rq.tasks.get(&pid).map(|t| t.state != TaskState::Sleeping).unwrap_or(false);
            if queued {
                self.dequeue_task(&mut rq, pid, false, now);
            }
            if let Some(t) = rq.tasks.remove(&pid) {
                rq.load.remove(t.lane, &t.load);
            }
            self.set_cpu_of(pid, None);
        }
        self.bands.leave(pid);
        self.cpufreq_update(cpu, now, 0);
        Ok(())
    }

    // PERIODIC TICK: ADVANCE LOAD, ROTATE THE QUEUE, RAISE THE ONTIME KICK
    // WHEN A TASK THAT JUST CROSSED A PERIOD TURNED HEAVY
    pub fn tick(&self, cpu: usize, now: u64) -> Result<bool> {
        self.tick_clock(now);
        let crossed = {
            let mut rq = self.rq(cpu)?;
            let crossed = self.update_rq(&mut rq, now);
            if let Some(curr) = rq.curr {
                if let Some(next) = rq.queue.pop_front() {
                    rq.queue.push_back(curr);
                    rq.curr = Some(next);
                    if let Some(t) = rq.tasks.get_mut(&curr) {
                        t.state = TaskState::Queued;
                    }
                    if let Some(t) = rq.tasks.get_mut(&next) {
                        t.state = TaskState::Running;
                    }
                }
            }
            crossed.iter()
                .filter_map(|p| rq.tasks.get(p))
                .map(|t| self.task_view_locked(t))
                .collect::<Vec<_>>()
        };

        let mut kicked = false;
        if self.tunables.ontime() && !crossed.is_empty() {
            kicked = self.with_view(|v| crossed.iter().any(|t| self.ontime.need_migration_trigger(v, t)));
            if kicked {
                self.kick.store(true, Ordering::Relaxed);
            }
        }
        self.cpufreq_update(cpu, now, 0);
        Ok(kicked)
    }

    pub fn take_kick(&self) -> bool {
        self.kick.swap(false, Ordering::Relaxed)
    }

    // --- MIGRATION ---

    // BOTH LOCKS HELD. RE-VALIDATES: QUEUED BUT NOT RUNNING, STILL ON src,
    // dst ALLOWED AND ACTIVE.
    fn move_task_locked(&self, src: &mut Rq, dst: &mut Rq, pid: Pid, now: u64) -> bool {
        let ok = match src.tasks.get(&pid) {
            Some(t) => t.state == TaskState::Queued && t.cpu == src.cpu
                && t.allowed.test(dst.cpu) && dst.active,
            None => false,
        };
        if !ok {
            return false;
        }

        self.update_rq(src, now);
        self.update_rq(dst, now);

        let was = src.nr_running();
        let mut t = match src.tasks.remove(&pid) {
            Some(t) => t,
            None => return false,
        };
        src.dequeue(pid);
        src.load.util_est_dequeue(t.lane, t.load.util_est_raw(true), was.saturating_sub(1));
        src.load.detach(t.lane, &t.load);

        self.attach(dst, &mut t);
        t.nr_migrations += 1;
        self.set_cpu_of(pid, Some(dst.cpu));
        self.enqueue_task(dst, t, now);
        true
    }

    pub fn migrate(&self, pid: Pid, dst: usize, now: u64, reason: MigrateReason) -> Result<bool> {
        self.tick_clock(now);
        let src = self.cpu_of(pid)?;
        if src == dst {
            return Ok(false);
        }
        if reason == MigrateReason::Balance {
            let tv = self.task_view(pid).ok_or_else(|| anyhow!("no task {}", pid))?;
            if !self.with_view(|v| self.ontime.can_migrate(v, &tv, dst)) {
                self.bump(|st| st.balance_vetoes += 1);
                return Ok(false);
            }
        }
        let moved = {
            let (mut s, mut d) = self.rq_pair(src, dst)?;
            self.move_task_locked(&mut s, &mut d, pid, now)
        };
        if moved {
            self.bump(|st| st.migrations += 1);
            self.cpufreq_update(src, now, 0);
            self.cpufreq_update(dst, now, 0);
        }
        Ok(moved)
    }

    // NEWLY IDLE CPU PULLS THE LAST QUEUED TASK OF THE BUSIEST RUNQUEUE
    pub fn idle_balance(&self, cpu: usize, now: u64) -> Result<Option<Pid>> {
        {
            let rq = self.rq(cpu)?;
            if !rq.active || rq.nr_running() > 0 {
                return Ok(None);
            }
        }
        let busiest = (0..self.nr_cpus())
            .filter(|&c| c != cpu)
            .map(|c| (self.nr_running(c), c))
            .filter(|&(n, _)| n > 1)
            .max();
        let src = match busiest {
            Some((_, c)) => c,
            None => return Ok(None),
        };
        let cands: Vec<Pid> = {
            let rq = self.rq(src)?;
            rq.queue.iter().rev()
                .filter(|p| rq.tasks.get(p).map(|t| t.allowed.test(cpu)).unwrap_or(false))
                .copied()
                .collect()
        };
        for pid in cands {
            if self.migrate(pid, cpu, now, MigrateReason::Balance)? {
                self.bump(|st| st.balance_pulls += 1);
                return Ok(Some(pid));
            }
        }
        Ok(None)
    }

    fn rq_snapshots(&self) -> Vec<RqSnapshot> {
        self.rqs.iter().map(|m| {
            let rq = lock_rq(m);
            RqSnapshot {
                cpu: rq.cpu,
                curr: rq.curr.and_then(|p| rq.tasks.get(&p)).map(|t| self.task_view_locked(t)),
                queued: rq.queue.iter()
                    .filter_map(|p| rq.tasks.get(p))
                    .map(|t| self.task_view_locked(t))
                    .collect(),
            }
        }).collect()
    }

    // ONE ONTIME SWEEP. EACH MOVE RUNS ON THE SOURCE CPU'S STOPPER.
    pub fn run_ontime(self: &Arc<Self>, now: u64) -> Result<usize> {
        self.tick_clock(now);
        if !self.tunables.ontime() {
            return Ok(0);
        }
        let snaps = self.rq_snapshots();
        let moves = self.with_view(|v| self.ontime.run_cycle(v, &snaps));

        let mut done = 0;
        for m in moves {
            self.set_ontime_migrating(m.pid, true);
            let weak: Weak<Self> = Arc::downgrade(self);
            let res = self.stoppers.stop_one_cpu(m.src, Box::new(move || {
                weak.upgrade().map(|s| s.ontime_stop(m, now)).unwrap_or(false)
            }));
            match res {
                Ok(true) => {
                    done += 1;
                    self.bump(|st| st.ontime_migrations += 1);
                    self.cpufreq_update(m.src, now, 0);
                    self.cpufreq_update(m.dst, now, 0);
                }
                Ok(false) => self.bump(|st| st.ontime_aborts += 1),
                Err(e) => {
                    warn!("ontime: pid {} cpu{} -> cpu{} not dispatched: {:#}", m.pid, m.src, m.dst, e);
                    self.set_ontime_migrating(m.pid, false);
                    self.ontime.finish(m.src);
                }
            }
        }
        Ok(done)
    }

    fn set_ontime_migrating(&self, pid: Pid, v: bool) {
        if let Ok(cpu) = self.cpu_of(pid) {
            if let Ok(mut rq) = self.rq(cpu) {
                if let Some(t) = rq.tasks.get_mut(&pid) {
                    t.ontime_migrating = v;
                }
            }
        }
    }

    // STOPPER CONTEXT ON m.src: THE SOURCE'S CURRENT TASK IS PREEMPTED, THEN
    // THE MOVE IS RE-VALIDATED. ANY FAILED PRECONDITION ABORTS SILENTLY.
    fn ontime_stop(&self, m: Migration, now: u64) -> bool {
        let moved = match self.rq_pair(m.src, m.dst) {
            Ok((mut src, mut dst)) => {
                src.preempt(m.pid);
                let moved = self.move_task_locked(&mut src, &mut dst, m.pid, now);
                src.resched();
                let rq = if moved { &mut dst } else { &mut src };
                if let Some(t) = rq.tasks.get_mut(&m.pid) {
                    t.ontime_migrating = false;
                }
                moved
            }
            Err(_) => false,
        };
        if !moved {
            self.set_ontime_migrating(m.pid, false);
        }
        self.ontime.finish(m.src);
        debug!("ontime stop: pid={} cpu{} -> cpu{} {}", m.pid, m.src, m.dst,
               if moved { "moved" } else { "aborted" });
        moved
    }

    // --- HOTPLUG ---

    pub fn cpu_up(&self, cpu: usize, now: u64) -> Result<()> {
        self.tick_clock(now);
        let mut rq = self.rq(cpu)?;
        if rq.online {
            return Ok(());
        }
        rq.online = true;
        rq.active = true;
        self.update_rq(&mut rq, now);
        info!("sched: cpu{} up", cpu);
        Ok(())
    }

    // RUNNABLE TASKS ARE PUSHED TO ACTIVE CPUS; SLEEPERS MOVE ON THEIR NEXT
    // WAKEUP. A TASK WITH NO ACTIVE ALLOWED CPU LOSES ITS AFFINITY.
    pub fn cpu_down(&self, cpu: usize, now: u64) -> Result<()> {
        self.tick_clock(now);
        let nr_active = self.rqs.iter().filter(|m| lock_rq(m).active).count();
        let runnable: Vec<Pid> = {
            let mut rq = self.rq(cpu)?;
            if !rq.online {
                return Ok(());
            }
            if nr_active <= 1 {
                bail!("cpu{} is the last active cpu", cpu);
            }
            rq.online = false;
            rq.active = false;
            if let Some(curr) = rq.curr {
                rq.preempt(curr);
            }
            rq.queue.iter().copied().collect()
        };

        for pid in runnable {
            let tv = match self.task_view(pid) {
                Some(t) => t,
                None => continue,
            };
            let mut dst = self.with_view(|v| {
                let c = select_proper_cpu(v, &tv, cpu);
                if v.is_active(c) && tv.allowed.test(c) { Some(c) } else { None }
            });
            if dst.is_none() {
                let active = self.with_view(|v| v.active_mask());
                let allowed = tv.allowed.and(active);
                if allowed.is_empty() {
                    warn!("sched: pid {} has no active allowed cpu, affinity broken", pid);
                    if let Ok(mut rq) = self.rq(cpu) {
                        if let Some(t) = rq.tasks.get_mut(&pid) {
                            t.allowed = active;
                        }
                    }
                    dst = active.first();
                } else {
                    dst = allowed.first();
                }
            }
            if let Some(d) = dst {
                let (mut s, mut dd) = self.rq_pair(cpu, d)?;
                s.preempt(pid);
                if !self.move_task_locked(&mut s, &mut dd, pid, now) {
                    warn!("sched: pid {} stuck on offline cpu{}", pid, cpu);
                }
            }
        }
        self.ontime.finish(cpu);
        info!("sched: cpu{} down", cpu);
        Ok(())
    }
}

// --- GOVERNOR INPUTS ---

impl UtilSource for SchedulerState {
    fn boosted_cpu_util(&self, cpu: usize) -> u64 {
        self.with_view(|v| if cpu < v.nr_cpus() { v.boosted_cpu_util(cpu) } else { 0 })
    }

    fn capacity_orig(&self, cpu: usize) -> u64 {
        self.caps.get(cpu).map(|c| c[Lane::Uss.idx()]).unwrap_or(0)
    }

    fn active_ratio(&self, cpu: usize, util: u64, max: u64, now: u64) -> (u64, u64) {
        if !self.tunables.part() {
            return (util, max);
        }
        let mut params = self.part_params;
        params.policy = self.tunables.part_policy();
        match self.rq(cpu) {
            Ok(mut rq) => rq.part.cpu_active_ratio(&params, util, max, now),
            Err(_) => (util, max),
        }
    }

    fn is_idle(&self, cpu: usize) -> bool {
        self.nr_running(cpu) == 0
    }

    fn is_active(&self, cpu: usize) -> bool {
        self.rq(cpu).map(|rq| rq.active).unwrap_or(false)
    }

    fn is_boosted(&self, cpu: usize) -> bool {
        self.global_boost.active(self.now()) || self.rq(cpu).map(|rq| rq.boost() > 0).unwrap_or(false)
    }
}
