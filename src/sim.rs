// EMS SIMULATION DRIVER
// VIRTUAL-TIME LOOP WIRING THE SCHEDULER, THE DVFS STACK AND THE ONTIME
// ENGINE TOGETHER. ONE STEP IS ONE MILLISECOND:
//
//   1. SCRIPTED EVENTS (BOOST REQUESTS, HOTPLUG, SUSPEND)
//   2. WAKEUPS OF DUE TASKS
//   3. EVERY ONLINE CPU RUNS ITS CURRENT TASK FOR THE STEP, FINISHED BURSTS
//      GO TO SLEEP, THEN THE CPU TICKS (LOAD UPDATE + GOVERNOR HOOK)
//   4. NEWLY IDLE CPUS PULL WORK OR ARM THEIR SLACK TIMER
//   5. FIRED SLACK TIMERS FORCE A GOVERNOR UPDATE
//   6. ONTIME SWEEP ON ITS PERIOD OR RIGHT AWAY ON A KICK
//   7. SNAPSHOT INTO THE EVENT LOG
//
// WORK IS MEASURED AT FULL CAPACITY: A 6MS BURST TAKES 6MS ON THE FASTEST
// CPU AT ITS TOP FREQUENCY AND LONGER ANYWHERE ELSE.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::SimConfig;
use crate::cpufreq::acme::{Acme, GovernorKind};
use crate::cpufreq::cal::{Cal, SimCal};
use crate::cpufreq::pm_qos::PmQos;
use crate::cpufreq::schedutil::{Schedutil, UpdateUtil};
use crate::event::{EventLog, Snapshot, Totals, MAX_DOMAINS};
use crate::multi_load::{Lane, SCHED_CAPACITY_SHIFT};
use crate::placement::Strategy;
use crate::platform::Platform;
use crate::sched::{NewTask, SchedStats, SchedulerState};
use crate::topology::CpuMask;
use crate::tuning::Tunables;
use crate::view::Pid;

const MS: u64 = 1_000_000;

// ONE THREAD OF A SCRIPTED TASK
struct SimTask {
    cfg: usize,
    thread: usize,
    pid: Option<Pid>,
    period_ns: u64,
    run_ns: u64,
    start_ns: u64,
    stop_ns: Option<u64>,
    next_wake: u64,
    // REMAINING WORK OF THE CURRENT BURST, NS x CAPACITY
    work_left: u64,
    exited: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct GovReport {
    pub domain: usize,
    pub cpus: String,
    pub governor: &'static str,
    pub updates: u64,
    pub commits: u64,
    pub rate_limited: u64,
    pub final_khz: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskReport {
    pub pid: Pid,
    pub name: String,
    pub cpu: usize,
    pub util_avg: u64,
    pub nr_migrations: u64,
    pub last_strategy: Option<Strategy>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SimReport {
    pub elapsed_ms: u64,
    pub interrupted: bool,
    pub totals: Totals,
    pub sched: SchedStats,
    pub governors: Vec<GovReport>,
    pub cal_writes: u64,
    pub tasks: Vec<TaskReport>,
}

pub struct Simulation {
    cfg: SimConfig,
    platform: Arc<Platform>,
    cal: Arc<SimCal>,
    acme: Arc<Acme>,
    govs: Vec<Arc<Schedutil>>,
    sched: Arc<SchedulerState>,
    tasks: Vec<SimTask>,
    log: EventLog,
    now: u64,
    idle: Vec<bool>,
    boot_qos_held: bool,
    prev: SchedStats,
    prev_commits: u64,
    energy_acc: u64,
}

impl Simulation {
    pub fn new(mut cfg: SimConfig) -> Result<Self> {
        cfg.platform.validate()?;
        cfg.workload.validate(cfg.platform.nr_cpus)?;

        let platform = Arc::new(Platform::from_config(&cfg.platform)?);
        let tunables = Arc::new(Tunables::from_features(&cfg.platform.features));
        let cal = Arc::new(SimCal::from_domains(&cfg.platform.domains));
        let qos = Arc::new(PmQos::new());
        let acme = Acme::init(&cfg.platform, cal.clone() as Arc<dyn Cal>, qos.clone(), platform.clone())
            .context("cpufreq driver init failed")?;
        let sched = SchedulerState::new(&cfg.platform, platform.clone(), tunables, 0)?;

        let mut govs = Vec::new();
        for d in acme.domains() {
            let dc = match cfg.platform.domains.iter().find(|c| c.cal_id == d.cal_id) {
                Some(dc) => dc,
                None => continue,
            };
            if dc.governor.is_static() {
                acme.set_governor(d.id, dc.governor)?;
                continue;
            }
            let gov = Schedutil::new(d.id, acme.clone(), qos.clone(), platform.clone(),
                                     &cfg.platform.governor, &dc.slack)?;
            gov.start()?;
            sched.set_cpufreq_hook(gov.cpus(), Some(gov.clone() as Arc<dyn UpdateUtil>));
            govs.push(gov);
        }

        let mut tasks = Vec::new();
        for (i, t) in cfg.workload.tasks.iter().enumerate() {
            for thread in 0..t.threads {
                tasks.push(SimTask {
                    cfg: i,
                    thread,
                    pid: None,
                    period_ns: t.period_ms * MS,
                    run_ns: t.run_ms * MS,
                    start_ns: t.start_ms * MS,
                    stop_ns: t.stop_ms.map(|ms| ms * MS),
                    next_wake: t.start_ms * MS,
                    work_left: 0,
                    exited: false,
                });
            }
        }

        let nr_cpus = cfg.platform.nr_cpus;
        let mut sim = Self {
            boot_qos_held: true,
            cfg,
            platform,
            cal,
            acme,
            govs,
            sched,
            tasks,
            log: EventLog::new(),
            now: 0,
            idle: vec![true; nr_cpus],
            prev: SchedStats::default(),
            prev_commits: 0,
            energy_acc: 0,
        };
        sim.maybe_release_boot_qos();
        info!("sim: {} cpus, {} domains ({} governed), {} threads, {} ms",
              nr_cpus, sim.acme.nr_domains(), sim.govs.len(), sim.tasks.len(),
              sim.cfg.workload.duration_ms);
        Ok(sim)
    }

    pub fn sched(&self) -> &Arc<SchedulerState> {
        &self.sched
    }

    pub fn acme(&self) -> &Arc<Acme> {
        &self.acme
    }

    pub fn governors(&self) -> &[Arc<Schedutil>] {
        &self.govs
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    fn maybe_release_boot_qos(&mut self) {
        if self.boot_qos_held && self.now >= self.cfg.platform.boot_boost_ms * MS {
            match self.acme.release_boot_qos() {
                Ok(()) => self.boot_qos_held = false,
                Err(e) => warn!("sim: boot pm_qos not released: {:#}", e),
            }
        }
    }

    // RUN UNTIL THE CONFIGURED DURATION OR UNTIL `stop` IS RAISED
    pub fn run(&mut self, stop: &AtomicBool) -> Result<SimReport> {
        let end = self.cfg.workload.duration_ms * MS;
        let mut interrupted = false;
        while self.now < end {
            if stop.load(Ordering::Relaxed) {
                interrupted = true;
                info!("sim: interrupted at {} ms", self.now / MS);
                break;
            }
            self.step()?;
        }
        for gov in &self.govs {
            gov.flush();
        }
        Ok(self.report(interrupted))
    }

    // ADVANCE ONE MILLISECOND
    pub fn step(&mut self) -> Result<()> {
        self.now += MS;
        let now = self.now;
        let now_ms = now / MS;

        self.maybe_release_boot_qos();
        self.scripted_events(now_ms)?;
        self.wake_due_tasks(now)?;

        for cpu in 0..self.idle.len() {
            if self.idle[cpu] && !self.sched.is_idle_cpu(cpu) {
                self.idle[cpu] = false;
                for gov in self.govs.iter().filter(|g| g.cpus().test(cpu)) {
                    gov.idle_exit(cpu, now);
                }
            }
        }

        self.energy_acc += self.step_energy();
        for cpu in 0..self.idle.len() {
            if !self.sched.is_online(cpu) {
                continue;
            }
            self.run_cpu(cpu, now)?;
            self.sched.tick(cpu, now)?;
        }

        for cpu in 0..self.idle.len() {
            if self.idle[cpu] || !self.sched.is_online(cpu) || !self.sched.is_idle_cpu(cpu) {
                continue;
            }
            if self.sched.idle_balance(cpu, now)?.is_some() {
                continue;
            }
            self.idle[cpu] = true;
            let next = self.next_event_ns(cpu, now);
            for gov in self.govs.iter().filter(|g| g.cpus().test(cpu)) {
                gov.idle_enter(self.sched.as_ref(), cpu, now, next);
            }
        }

        for gov in &self.govs {
            for cpu in gov.expired_slack(now) {
                debug!("sim: slack timer fired on cpu{}", cpu);
                self.sched.cpufreq_update(cpu, now, 0);
            }
        }

        if self.sched.take_kick() || now_ms % self.cfg.workload.ontime_period_ms == 0 {
            self.sched.update_bands();
            self.sched.run_ontime(now)?;
        }

        if now_ms % self.cfg.workload.snapshot_ms == 0 {
            self.snapshot(now);
        }
        Ok(())
    }

    fn scripted_events(&mut self, now_ms: u64) -> Result<()> {
        let boosts = self.cfg.workload.boost_requests.clone();
        for b in &boosts {
            if b.at_ms == now_ms {
                info!("sim: boost key {} prio {}", b.key, b.prio);
                self.sched.global_boost.request(b.key, b.prio);
            }
            if b.until_ms == Some(now_ms) {
                self.sched.global_boost.release(b.key);
            }
        }

        let hotplug = self.cfg.workload.hotplug.clone();
        for h in hotplug.iter().filter(|h| h.at_ms == now_ms) {
            let res = if h.online {
                self.sched.cpu_up(h.cpu, self.now).and_then(|_| self.acme.cpu_up(h.cpu))
            } else {
                self.acme.cpu_down(h.cpu).and_then(|_| self.sched.cpu_down(h.cpu, self.now))
            };
            if let Err(e) = res {
                warn!("sim: cpu{} {} failed: {:#}", h.cpu, if h.online { "up" } else { "down" }, e);
            }
            self.idle[h.cpu] = self.sched.is_idle_cpu(h.cpu);
        }

        if self.cfg.workload.suspend_at_ms == Some(now_ms) {
            self.acme.set_tasks_frozen(true);
            match self.acme.suspend() {
                Ok(()) => info!("sim: suspended"),
                Err(e) => warn!("sim: suspend aborted: {:#}", e),
            }
            if let Err(e) = self.acme.resume() {
                warn!("sim: resume failed: {:#}", e);
            }
            self.acme.set_tasks_frozen(false);
        }
        Ok(())
    }

    fn thread_name(&self, t: &SimTask) -> String {
        let tc = &self.cfg.workload.tasks[t.cfg];
        if tc.threads > 1 { format!("{}:{}", tc.name, t.thread) } else { tc.name.clone() }
    }

    fn new_task(&self, t: &SimTask, leader: Option<Pid>) -> Result<NewTask> {
        let tc = &self.cfg.workload.tasks[t.cfg];
        let allowed = match &tc.allowed {
            Some(list) => CpuMask::parse(list)?,
            None => CpuMask::first_n(self.cfg.platform.nr_cpus),
        };
        Ok(NewTask {
            name: self.thread_name(t),
            tgid: tc.tgid.or(leader),
            lane: tc.lane,
            allowed,
            group: tc.group,
            parent: leader,
            iowait: tc.iowait,
        })
    }

    fn wake_due_tasks(&mut self, now: u64) -> Result<()> {
        for i in 0..self.tasks.len() {
            let (due, exited) = {
                let t = &self.tasks[i];
                (t.next_wake <= now && t.work_left == 0, t.exited)
            };
            if exited || !due {
                continue;
            }
            if let Some(stop) = self.tasks[i].stop_ns {
                if now >= stop {
                    if let Some(pid) = self.tasks[i].pid {
                        self.sched.exit(pid, now)?;
                    }
                    self.tasks[i].exited = true;
                    continue;
                }
            }

            let burst = self.tasks[i].run_ns << SCHED_CAPACITY_SHIFT;
            match self.tasks[i].pid {
                Some(pid) => {
                    self.sched.wake_up(pid, now, None, false)?;
                }
                None => {
                    let leader = self.leader_of(i);
                    let spec = self.new_task(&self.tasks[i], leader)?;
                    let pid = self.sched.fork(spec, now)?;
                    if self.cfg.workload.tasks[self.tasks[i].cfg].band {
                        self.sched.band_join(pid)?;
                    }
                    self.tasks[i].pid = Some(pid);
                }
            }
            let t = &mut self.tasks[i];
            t.work_left = burst.max(1);
            t.next_wake = t.next_wake.max(t.start_ns) + t.period_ns;
        }
        Ok(())
    }

    // PID OF THREAD 0 OF THE SAME SCRIPTED TASK
    fn leader_of(&self, i: usize) -> Option<Pid> {
        let t = &self.tasks[i];
        if t.thread == 0 {
            return None;
        }
        self.tasks.iter().find(|o| o.cfg == t.cfg && o.thread == 0).and_then(|o| o.pid)
    }

    fn sim_index(&self, pid: Pid) -> Option<usize> {
        self.tasks.iter().position(|t| t.pid == Some(pid))
    }

    // THE CURRENT TASK OF `cpu` DOES ONE STEP OF WORK AT THE CPU'S SPEED
    fn run_cpu(&mut self, cpu: usize, now: u64) -> Result<()> {
        let pid = match self.sched.runqueue(cpu).0 {
            Some(p) => p,
            None => return Ok(()),
        };
        let idx = match self.sim_index(pid) {
            Some(i) => i,
            None => return Ok(()),
        };
        let lane = self.sched.task(pid).map(|t| t.lane).unwrap_or(Lane::Uss);
        let cap = self.platform.energy().max_capacity(cpu, lane).max(1);
        let speed = (cap * self.platform.freq_scale(cpu)) >> SCHED_CAPACITY_SHIFT;
        let done = MS * speed.max(1);

        let t = &mut self.tasks[idx];
        t.work_left = t.work_left.saturating_sub(done);
        if t.work_left == 0 {
            self.sched.sleep(pid, now)?;
        }
        Ok(())
    }

    // TIME UNTIL THE NEXT WAKEUP OF A TASK LAST SEEN ON `cpu`
    fn next_event_ns(&self, cpu: usize, now: u64) -> u64 {
        self.tasks.iter()
            .filter(|t| !t.exited)
            .filter(|t| t.pid.and_then(|p| self.sched.task(p)).map(|k| k.cpu == cpu).unwrap_or(false))
            .map(|t| t.next_wake.saturating_sub(now))
            .min()
            .unwrap_or(u64::MAX)
    }

    // POWER OF EVERY BUSY CPU AT ITS DOMAIN'S FREQUENCY FOR ONE STEP
    fn step_energy(&self) -> u64 {
        let busy: Vec<(usize, Lane)> = (0..self.idle.len())
            .filter_map(|cpu| {
                let pid = self.sched.runqueue(cpu).0?;
                Some((cpu, self.sched.task(pid).map(|t| t.lane).unwrap_or(Lane::Uss)))
            })
            .collect();
        let energy = self.platform.energy();
        busy.into_iter().map(|(cpu, lane)| {
            let freq = self.acme.domain_of(cpu).map(|d| self.acme.cur_freq(d)).unwrap_or(0);
            energy.table(cpu).iter()
                .filter(|s| s.frequency >= freq)
                .min_by_key(|s| s.frequency)
                .or_else(|| energy.table(cpu).iter().max_by_key(|s| s.frequency))
                .map(|s| s.power[lane.idx()])
                .unwrap_or(0)
        }).sum()
    }

    fn commits(&self) -> u64 {
        self.govs.iter().map(|g| g.stats().commits).sum()
    }

    fn snapshot(&mut self, now: u64) {
        let st = self.sched.stats();
        let commits = self.commits();
        let (util, nr_running) = self.sched.with_view(|v| {
            let util = (0..v.nr_cpus()).filter(|&c| v.is_active(c)).map(|c| v.cpu_util(c)).sum();
            let nr = v.cpus.iter().map(|c| c.nr_running as u64).sum();
            (util, nr)
        });
        let mut s = Snapshot {
            ts_ns: now,
            wakeups: st.wakeups - self.prev.wakeups,
            wake_migrations: st.wake_migrations - self.prev.wake_migrations,
            ontime_migrations: st.ontime_migrations - self.prev.ontime_migrations,
            balance_pulls: st.balance_pulls - self.prev.balance_pulls,
            freq_commits: commits - self.prev_commits,
            util,
            nr_running,
            energy: std::mem::take(&mut self.energy_acc),
            nr_domains: self.acme.nr_domains().min(MAX_DOMAINS),
            ..Default::default()
        };
        for d in 0..s.nr_domains {
            s.freq_khz[d] = self.acme.cur_freq(d);
        }
        self.log.record(s);
        self.prev = st;
        self.prev_commits = commits;
    }

    pub fn report(&self, interrupted: bool) -> SimReport {
        let governors = self.govs.iter().map(|g| {
            let st = g.stats();
            GovReport {
                domain: g.domain(),
                cpus: g.cpus().to_string(),
                governor: GovernorKind::Schedutil.label(),
                updates: st.updates,
                commits: st.commits,
                rate_limited: st.rate_limited,
                final_khz: self.acme.cur_freq(g.domain()),
            }
        }).collect();

        let tasks = self.tasks.iter().filter_map(|t| {
            let pid = t.pid?;
            let name = self.thread_name(t);
            let k = self.sched.task(pid);
            Some(TaskReport {
                pid,
                name,
                cpu: k.as_ref().map(|k| k.cpu).unwrap_or(0),
                util_avg: k.as_ref().map(|k| k.load.util_avg).unwrap_or(0),
                nr_migrations: k.as_ref().map(|k| k.nr_migrations).unwrap_or(0),
                last_strategy: k.and_then(|k| k.last_strategy),
            })
        }).collect();

        SimReport {
            elapsed_ms: self.now / MS,
            interrupted,
            totals: self.log.totals(),
            sched: self.sched.stats(),
            governors,
            cal_writes: self.cal.writes(),
            tasks,
        }
    }

    pub fn print_report(&self, r: &SimReport) {
        println!("\n{}", "=".repeat(50));
        println!("EMS RUN: {} ms{}", r.elapsed_ms, if r.interrupted { " (INTERRUPTED)" } else { "" });
        println!("{}", "=".repeat(50));
        println!("  FORKS / WAKEUPS:   {} / {}", r.sched.forks, r.sched.wakeups);
        println!("  MIGRATIONS:        wake {} ontime {} (aborted {}) pull {} (vetoed {})",
                 r.sched.wake_migrations, r.sched.ontime_migrations, r.sched.ontime_aborts,
                 r.sched.balance_pulls, r.sched.balance_vetoes);
        println!("  CLOCK WRITES:      {}", r.cal_writes);
        println!("\n  PLACEMENT:");
        for s in Strategy::ALL {
            let n = r.sched.placements[s.idx()];
            if n > 0 {
                println!("    {:<14}{}", s.label(), n);
            }
        }
        println!("\n  {:<8} {:<8} {:<10} {:<10} {:<10} {:<10}",
                 "DOMAIN", "CPUS", "UPDATES", "COMMITS", "LIMITED", "FINAL_KHZ");
        for g in &r.governors {
            println!("  {:<8} {:<8} {:<10} {:<10} {:<10} {:<10}",
                     g.domain, g.cpus, g.updates, g.commits, g.rate_limited, g.final_khz);
        }
        println!("\n  {:<6} {:<16} {:<5} {:<8} {:<6} {}", "PID", "NAME", "CPU", "UTIL", "MIGR", "LAST");
        for t in &r.tasks {
            println!("  {:<6} {:<16} {:<5} {:<8} {:<6} {}", t.pid, t.name, t.cpu, t.util_avg,
                     t.nr_migrations, t.last_strategy.map(|s| s.label()).unwrap_or("-"));
        }
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.sched.set_cpufreq_hook(CpuMask::first_n(self.idle.len()), None);
        for gov in &self.govs {
            gov.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::sched::TaskState;

    fn short(ms: u64) -> SimConfig {
        let mut cfg = config::reference();
        cfg.workload.duration_ms = ms;
        cfg
    }

    #[test]
    fn reference_workload_runs() {
        let mut sim = Simulation::new(short(600)).unwrap();
        let stop = AtomicBool::new(false);
        let r = sim.run(&stop).unwrap();
        assert_eq!(r.elapsed_ms, 600);
        assert!(!r.interrupted);
        // ui x2, audio, background x3; game starts at 500 ms
        assert_eq!(r.sched.forks, 7);
        assert!(r.sched.wakeups > 50);
        assert_eq!(sim.log().len(), 6);
        assert!(r.governors.iter().any(|g| g.commits > 0));
        assert!(r.totals.energy > 0);
    }

    #[test]
    fn stop_flag_interrupts() {
        let mut sim = Simulation::new(short(1000)).unwrap();
        let stop = AtomicBool::new(true);
        let r = sim.run(&stop).unwrap();
        assert!(r.interrupted);
        assert_eq!(r.elapsed_ms, 0);
    }

    #[test]
    fn bursts_finish_and_sleep() {
        let mut cfg = short(40);
        cfg.workload.tasks.truncate(0);
        let mut t = config::reference().workload.tasks[2].clone();
        t.allowed = Some("6".into());
        cfg.workload.tasks.push(t);
        let mut sim = Simulation::new(cfg).unwrap();
        // EVEN AT THE LOWEST CLOCK A 1 MS BURST IS DONE WITHIN 8 STEPS
        for _ in 0..8 {
            sim.step().unwrap();
        }
        let pid = sim.sched().pids()[0];
        assert_eq!(sim.sched().task(pid).unwrap().state, TaskState::Sleeping);
        assert!(sim.sched().is_idle_cpu(6));
        // PERIOD 10 MS: AWAKE AGAIN AT 10 MS
        for _ in 0..2 {
            sim.step().unwrap();
        }
        assert_eq!(sim.sched().stats().wakeups, 1);
    }

    #[test]
    fn hotplug_event_takes_cpu_out() {
        let mut cfg = short(30);
        cfg.workload.hotplug.push(config::HotplugEvent { at_ms: 10, cpu: 7, online: false });
        cfg.workload.hotplug.push(config::HotplugEvent { at_ms: 20, cpu: 7, online: true });
        let mut sim = Simulation::new(cfg).unwrap();
        for _ in 0..15 {
            sim.step().unwrap();
        }
        assert!(!sim.sched().is_online(7));
        assert_eq!(sim.sched().nr_running(7), 0);
        for _ in 0..10 {
            sim.step().unwrap();
        }
        assert!(sim.sched().is_online(7));
        assert!(sim.acme().is_enabled(2));
    }
}
