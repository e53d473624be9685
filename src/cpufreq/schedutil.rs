// EMS SCHEDUTIL GOVERNOR
// ONE INSTANCE PER FREQUENCY DOMAIN, DRIVEN BY THE SCHEDULER'S LOAD UPDATES
// RATHER THAN A TIMER. EACH UPDATE SAMPLES THE CALLING CPU, FOLDS IN ITS
// SIBLINGS AND THE IOWAIT BOOST, MAPS util/max TO 1.25 x max_freq AND
// COMMITS THROUGH THE DVFS DRIVER UNLESS RATE LIMITED.
//
// FAST-SWITCH DOMAINS ARE PROGRAMMED INLINE. OTHERS HAND THE REQUEST TO A
// SCHED_FIFO WORKER ("sugov:N") OVER A CHANNEL; NO NEW REQUEST IS COMPUTED
// WHILE ONE IS IN FLIGHT.
//
// LOCKING: POLICY LOCK -> DOMAIN LOCK. THE SCHEDULER CALLS update_util WITH
// NO RUNQUEUE LOCK HELD; UtilSource MAY TAKE THEM.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam::channel::{self, Sender};
use log::{debug, info, warn};

use super::acme::Acme;
use super::pm_qos::PmQos;
use super::table::Relation;
use crate::config::{GovernorConfig, SlackConfig};
use crate::multi_load::Lane;
use crate::notifier::{Decision, NotifierId};
use crate::platform::Platform;
use crate::topology::CpuMask;
use crate::tuning::TICK_NSEC;

// --- UPDATE FLAGS ---

pub const SCHED_CPUFREQ_IOWAIT: u32 = 1 << 0;
pub const SCHED_CPUFREQ_DL: u32 = 1 << 1;

const NSEC_PER_USEC: u64 = 1_000;
const NSEC_PER_MSEC: u64 = 1_000_000;

// SCHED_FIFO PRIORITY OF THE SLOW-PATH WORKER (MAX_USER_RT_PRIO / 2)
const SUGOV_WORKER_PRIO: i32 = 50;

// WHAT THE GOVERNOR READS FROM THE SCHEDULER
pub trait UtilSource {
    fn boosted_cpu_util(&self, cpu: usize) -> u64;
    fn capacity_orig(&self, cpu: usize) -> u64;
    // ACTIVE-RATIO OVERRIDE OF (util, max); IDENTITY WHEN PART IS OFF
    fn active_ratio(&self, cpu: usize, util: u64, max: u64, now: u64) -> (u64, u64);
    fn is_idle(&self, cpu: usize) -> bool;
    fn is_active(&self, cpu: usize) -> bool;
    fn is_boosted(&self, cpu: usize) -> bool;
}

// LOAD-UPDATE HOOK INSTALLED PER CPU
pub trait UpdateUtil: Send + Sync {
    fn update_util(&self, src: &dyn UtilSource, cpu: usize, time: u64, flags: u32);
}

// --- TUNABLES ---

pub struct SugovTunables {
    up_rate_limit_us: AtomicU64,
    down_rate_limit_us: AtomicU64,
}

impl SugovTunables {
    pub fn new(up_us: u64, down_us: u64) -> Self {
        Self { up_rate_limit_us: AtomicU64::new(up_us), down_rate_limit_us: AtomicU64::new(down_us) }
    }

    pub fn up_rate_limit_us(&self) -> u64 {
        self.up_rate_limit_us.load(Ordering::Relaxed)
    }

    pub fn down_rate_limit_us(&self) -> u64 {
        self.down_rate_limit_us.load(Ordering::Relaxed)
    }

    fn up_delay_ns(&self) -> u64 {
        self.up_rate_limit_us() * NSEC_PER_USEC
    }

    fn down_delay_ns(&self) -> u64 {
        self.down_rate_limit_us() * NSEC_PER_USEC
    }

    fn min_rate_limit_ns(&self) -> u64 {
        self.up_delay_ns().min(self.down_delay_ns())
    }
}

// --- PER-CPU STATE ---

#[derive(Clone, Copy, Debug, Default)]
struct SugovCpu {
    cpu: usize,
    util: u64,
    max: u64,
    flags: u32,
    last_update: u64,
    iowait_boost: u64,
    iowait_boost_max: u64,
    iowait_boost_pending: bool,
}

// IDLE SLACK TIMER: WAKES AN IDLE CPU STILL CARRYING UTILIZATION SO THE
// GOVERNOR CAN RE-SAMPLE IT AND DROP THE FREQUENCY
#[derive(Clone, Copy, Debug, Default)]
struct Slack {
    started: bool,
    min: u64,
    expires: Option<u64>,
}

struct PolicyState {
    last_freq_update_time: u64,
    next_freq: u64,
    cached_raw_freq: u64,
    work_in_progress: bool,
    need_freq_update: bool,
    cpus: Vec<SugovCpu>,
    slack: Vec<Slack>,
}

impl PolicyState {
    fn sg_cpu(&mut self, cpu: usize) -> Option<&mut SugovCpu> {
        self.cpus.iter_mut().find(|c| c.cpu == cpu)
    }

    fn slack(&mut self, cpu: usize) -> Option<(&mut Slack, u64)> {
        let idx = self.cpus.iter().position(|c| c.cpu == cpu)?;
        let util = self.cpus[idx].util;
        Some((&mut self.slack[idx], util))
    }
}

enum Work {
    Scale,
    Flush(Sender<()>),
}

struct Worker {
    tx: Sender<Work>,
    handle: JoinHandle<()>,
}

// CUMULATIVE COUNTERS FOR REPORTS
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GovStats {
    pub updates: u64,
    pub commits: u64,
    pub rate_limited: u64,
}

pub struct Schedutil {
    domain: usize,
    cpus: CpuMask,
    boot_group: CpuMask,
    fast_switch: bool,
    iowait_boost: bool,
    slack_enabled: bool,
    slack_expired_ns: u64,
    qos_min_class: usize,
    acme: Arc<Acme>,
    qos: Arc<PmQos>,
    platform: Arc<Platform>,
    tunables: SugovTunables,
    started: AtomicBool,
    state: Mutex<PolicyState>,
    worker: Mutex<Option<Worker>>,
    notifiers: Mutex<Option<(NotifierId, NotifierId)>>,
    updates: AtomicU64,
    commits: AtomicU64,
    rate_limited: AtomicU64,
}

fn fresh_state(cpus: CpuMask) -> PolicyState {
    PolicyState {
        last_freq_update_time: 0,
        next_freq: u64::MAX,
        cached_raw_freq: 0,
        work_in_progress: false,
        need_freq_update: false,
        cpus: cpus.iter().map(|cpu| SugovCpu { cpu, ..Default::default() }).collect(),
        slack: vec![Slack::default(); cpus.weight()],
    }
}

impl Schedutil {
    pub fn new(domain: usize, acme: Arc<Acme>, qos: Arc<PmQos>, platform: Arc<Platform>,
               cfg: &GovernorConfig, slack: &SlackConfig) -> Result<Arc<Self>> {
        let d = acme.domain(domain)?;
        let cpus = d.cpus;
        let fast_switch = acme.supports_fast_switch(domain);
        let qos_min_class = d.qos_classes().0;
        let boot_group = platform.topology().coregroup(0);
        Ok(Arc::new(Self {
            domain,
            cpus,
            boot_group,
            fast_switch,
            iowait_boost: cfg.iowait_boost,
            slack_enabled: slack.enabled,
            slack_expired_ns: slack.expired_ms * NSEC_PER_MSEC,
            qos_min_class,
            acme,
            qos,
            platform,
            tunables: SugovTunables::new(cfg.up_rate_limit_us, cfg.down_rate_limit_us),
            started: AtomicBool::new(false),
            state: Mutex::new(fresh_state(cpus)),
            worker: Mutex::new(None),
            notifiers: Mutex::new(None),
            updates: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, PolicyState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn domain(&self) -> usize {
        self.domain
    }

    pub fn cpus(&self) -> CpuMask {
        self.cpus
    }

    pub fn tunables(&self) -> &SugovTunables {
        &self.tunables
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> GovStats {
        GovStats {
            updates: self.updates.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }

    pub fn next_freq(&self) -> u64 {
        self.lock().next_freq
    }

    pub fn set_rate_limits(&self, up_us: u64, down_us: u64) {
        self.tunables.up_rate_limit_us.store(up_us, Ordering::Relaxed);
        self.tunables.down_rate_limit_us.store(down_us, Ordering::Relaxed);
        info!("sugov{}: rate limits up {}us down {}us", self.domain, up_us, down_us);
    }

    // --- LIFECYCLE ---

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.load(Ordering::Relaxed) {
            return Ok(());
        }
        if !self.fast_switch {
            self.spawn_worker()?;
        }

        let cpuinfo_max = self.acme.domain(self.domain)?.max_freq;
        {
            let mut s = self.lock();
            *s = fresh_state(self.cpus);
            for c in s.cpus.iter_mut() {
                c.iowait_boost_max = cpuinfo_max;
            }
            if self.slack_enabled {
                for sl in s.slack.iter_mut() {
                    sl.min = u64::MAX;
                    sl.started = true;
                }
            }
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let qos_id = self.qos.add_notifier(self.qos_min_class, i32::MIN, move |ev| {
            match weak.upgrade() {
                Some(gov) => gov.on_min_qos(ev.value),
                None => Decision::Done,
            }
        })?;
        let weak: Weak<Self> = Arc::downgrade(self);
        let domain = self.domain;
        let policy_id = self.acme.register_policy_notifier(0, move |ev| {
            if ev.domain != domain {
                return Decision::Done;
            }
            match weak.upgrade() {
                Some(gov) => {
                    gov.set_limits();
                    Decision::Ok
                }
                None => Decision::Done,
            }
        });
        if let Ok(mut n) = self.notifiers.lock() {
            *n = Some((qos_id, policy_id));
        }

        self.started.store(true, Ordering::Relaxed);
        // THE CPUFREQ CORE APPLIES LIMITS RIGHT AFTER A GOVERNOR STARTS
        self.set_limits();
        info!("sugov{}: started on cpus {} ({})", self.domain, self.cpus,
              if self.fast_switch { "fast switch" } else { "worker" });
        Ok(())
    }

    // UNHOOK, STOP SLACK TIMERS, THEN DRAIN AND JOIN THE WORKER
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::Relaxed) {
            return;
        }
        {
            let mut s = self.lock();
            for sl in s.slack.iter_mut() {
                sl.started = false;
                sl.expires = None;
            }
        }
        let ids = self.notifiers.lock().ok().and_then(|mut n| n.take());
        if let Some((qos_id, policy_id)) = ids {
            self.qos.remove_notifier(self.qos_min_class, qos_id);
            self.acme.unregister_policy_notifier(policy_id);
        }

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(w) = worker {
            drop(w.tx);
            // THE WORKER MAY HOLD THE LAST REFERENCE; IT EXITS ON ITS OWN
            if w.handle.thread().id() == std::thread::current().id() {
                return;
            }
            if w.handle.join().is_err() {
                warn!("sugov{}: worker panicked", self.domain);
            }
        }
        info!("sugov{}: stopped", self.domain);
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = channel::unbounded::<Work>();
        let weak: Weak<Self> = Arc::downgrade(self);
        let name = format!("sugov:{}", self.cpus.first().unwrap_or(0));
        let bind = self.boot_group;

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                set_worker_sched(&name, bind);
                for work in rx {
                    match work {
                        Work::Scale => {
                            if let Some(gov) = weak.upgrade() {
                                gov.run_work();
                            }
                        }
                        Work::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .with_context(|| format!("failed to create sugov thread for domain{}", self.domain))?;

        if let Ok(mut w) = self.worker.lock() {
            *w = Some(Worker { tx, handle });
        }
        Ok(())
    }

    fn run_work(&self) {
        let next = self.lock().next_freq;
        if let Err(e) = self.acme.target(self.domain, next, Relation::L) {
            debug!("sugov{}: worker target {} failed: {:#}", self.domain, next, e);
        }
        self.lock().work_in_progress = false;
    }

    // WAIT UNTIL EVERY QUEUED REQUEST HAS BEEN PROGRAMMED
    pub fn flush(&self) {
        let tx = match self.worker.lock() {
            Ok(w) => w.as_ref().map(|w| w.tx.clone()),
            Err(_) => None,
        };
        if let Some(tx) = tx {
            let (done_tx, done_rx) = channel::bounded(1);
            if tx.send(Work::Flush(done_tx)).is_ok() {
                let _ = done_rx.recv();
            }
        }
    }

    // --- LIMITS ---

    // POLICY BOUNDS CHANGED: REFRESH THE SLACK FLOOR, FORCE A RECOMPUTE
    pub fn set_limits(&self) {
        let policy = match self.acme.policy(self.domain) {
            Some(p) => p,
            None => return,
        };
        let first = self.cpus.first().unwrap_or(0);
        let max_cap = self.platform.energy().max_capacity(first, Lane::Uss);
        let min_cap = if policy.max == 0 {
            0
        } else {
            (max_cap * policy.min / policy.max) * 4 / 5 + 1
        };

        let mut s = self.lock();
        for sl in s.slack.iter_mut() {
            sl.min = min_cap;
        }
        s.need_freq_update = true;
    }

    // LOWEST-PRIORITY MIN QOS OBSERVER: ONCE THE FLOOR DROPS BELOW THE
    // RUNNING FREQUENCY, HAND THE DOMAIN BACK TO THE GOVERNOR'S REQUEST
    fn on_min_qos(&self, value: u64) -> Decision {
        let cur = match self.acme.policy(self.domain) {
            Some(p) => p.cur,
            None => return Decision::Bad,
        };
        if value >= cur {
            return Decision::Bad;
        }
        let next = self.lock().next_freq;
        if let Err(e) = self.acme.target(self.domain, next, Relation::L) {
            debug!("sugov{}: qos release target failed: {:#}", self.domain, e);
        }
        Decision::Ok
    }

    // --- FREQUENCY SELECTION ---

    fn should_update_freq(&self, s: &mut PolicyState, time: u64) -> bool {
        if s.work_in_progress {
            return false;
        }
        if s.need_freq_update {
            s.need_freq_update = false;
            s.next_freq = u64::MAX;
            return true;
        }
        time.saturating_sub(s.last_freq_update_time) >= self.tunables.min_rate_limit_ns()
    }

    fn up_down_rate_limit(&self, s: &PolicyState, time: u64, next_freq: u64) -> bool {
        let delta = time.saturating_sub(s.last_freq_update_time);
        if next_freq > s.next_freq && delta < self.tunables.up_delay_ns() {
            return true;
        }
        if next_freq < s.next_freq && delta < self.tunables.down_delay_ns() {
            return true;
        }
        false
    }

    // next_freq = 1.25 x max_freq x util / max, LOWEST LEVEL AT OR ABOVE IT
    fn get_next_freq(&self, s: &mut PolicyState, util: u64, max: u64) -> u64 {
        let policy = match self.acme.policy(self.domain) {
            Some(p) => p,
            None => return s.next_freq,
        };
        let max = max.max(1);
        let freq = (policy.max + (policy.max >> 2)) * util / max;

        if freq == s.cached_raw_freq && s.next_freq != u64::MAX {
            return s.next_freq;
        }
        s.cached_raw_freq = freq;

        self.acme.domain(self.domain).ok()
            .and_then(|d| d.table().resolve(freq, Relation::L, policy.min, policy.max))
            .unwrap_or(policy.max)
    }

    fn get_util(&self, src: &dyn UtilSource, cpu: usize, time: u64) -> (u64, u64) {
        let max_cap = src.capacity_orig(cpu);
        let util = src.boosted_cpu_util(cpu).min(max_cap);
        src.active_ratio(cpu, util, max_cap, time)
    }

    fn set_iowait_boost(&self, c: &mut SugovCpu, time: u64, flags: u32, policy_min: u64) {
        if self.iowait_boost && flags & SCHED_CPUFREQ_IOWAIT != 0 {
            if c.iowait_boost_pending {
                return;
            }
            c.iowait_boost_pending = true;
            if c.iowait_boost != 0 {
                c.iowait_boost = (c.iowait_boost << 1).min(c.iowait_boost_max);
            } else {
                c.iowait_boost = policy_min;
            }
        } else if c.iowait_boost != 0 && time.saturating_sub(c.last_update) > TICK_NSEC {
            // THE CPU LOOKS TO HAVE BEEN IDLE
            c.iowait_boost = 0;
            c.iowait_boost_pending = false;
        }
    }

    fn apply_iowait_boost(c: &mut SugovCpu, util: &mut u64, max: &mut u64, policy_min: u64) {
        if c.iowait_boost == 0 {
            return;
        }
        if c.iowait_boost_pending {
            c.iowait_boost_pending = false;
        } else {
            c.iowait_boost >>= 1;
            if c.iowait_boost < policy_min {
                c.iowait_boost = 0;
                return;
            }
        }

        let boost_util = c.iowait_boost;
        let boost_max = c.iowait_boost_max;
        if *util * boost_max < *max * boost_util {
            *util = boost_util;
            *max = boost_max;
        }
    }

    fn next_freq_shared(&self, src: &dyn UtilSource, s: &mut PolicyState, time: u64,
                        policy_min: u64, cpuinfo_max: u64) -> u64 {
        let mut util = 0;
        let mut max = 1;

        for c in s.cpus.iter_mut() {
            if !src.is_active(c.cpu) {
                continue;
            }
            if time.saturating_sub(c.last_update) > TICK_NSEC && src.is_idle(c.cpu) {
                c.iowait_boost = 0;
                c.iowait_boost_pending = false;
                continue;
            }
            if c.flags & SCHED_CPUFREQ_DL != 0 {
                return cpuinfo_max;
            }
            if c.util * max > c.max * util {
                util = c.util;
                max = c.max;
            }
            Self::apply_iowait_boost(c, &mut util, &mut max, policy_min);
        }

        self.get_next_freq(s, util, max)
    }

    fn update_commit(&self, s: &mut PolicyState, time: u64, next_freq: u64) {
        if s.next_freq == next_freq {
            return;
        }
        if self.up_down_rate_limit(s, time, next_freq) {
            // A RAW FREQUENCY THAT NEVER BECAME next_freq IS NOT CACHED
            s.cached_raw_freq = 0;
            self.rate_limited.fetch_add(1, Ordering::Relaxed);
            return;
        }

        s.next_freq = next_freq;
        s.last_freq_update_time = time;
        self.commits.fetch_add(1, Ordering::Relaxed);

        if self.fast_switch {
            // BOOKKEEPING ADVANCES EVEN WHEN THE CLOCK REFUSES
            if let Err(e) = self.acme.fast_switch(self.domain, next_freq) {
                debug!("sugov{}: fast switch to {} failed: {:#}", self.domain, next_freq, e);
            }
            return;
        }

        // THE WORKER IS PINNED TO THE BOOT COREGROUP AT SPAWN
        let tx = match self.worker.lock() {
            Ok(w) => w.as_ref().map(|w| w.tx.clone()),
            Err(_) => None,
        };
        if let Some(tx) = tx {
            s.work_in_progress = true;
            if tx.send(Work::Scale).is_err() {
                s.work_in_progress = false;
            } else {
                debug!("sugov{}: {} kHz queued", self.domain, next_freq);
            }
        }
    }

    // --- SLACK TIMER ---

    fn need_slack(&self, src: &dyn UtilSource, cpu: usize, util: u64, min: u64,
                  next_event_ns: u64) -> bool {
        !src.is_boosted(cpu) && util > min && next_event_ns > self.slack_expired_ns
    }

    // CPU ABOUT TO IDLE; next_event_ns: TIME UNTIL ITS NEXT SCHEDULED EVENT
    pub fn idle_enter(&self, src: &dyn UtilSource, cpu: usize, now: u64, next_event_ns: u64) {
        let expired = self.slack_expired_ns;
        let mut s = self.lock();
        let (slack, util) = match s.slack(cpu) {
            Some(x) => x,
            None => return,
        };
        if !slack.started {
            return;
        }
        slack.expires = None;
        if self.need_slack(src, cpu, util, slack.min, next_event_ns) {
            slack.expires = Some(now + expired);
            debug!("sugov slack: cpu{} armed util {} min {}", cpu, util, slack.min);
        }
    }

    // CPU WOKE UP: A TIMER THAT HAS NOT FIRED YET IS CANCELLED
    pub fn idle_exit(&self, cpu: usize, now: u64) {
        let mut s = self.lock();
        if let Some((slack, _)) = s.slack(cpu) {
            if slack.expires.map_or(false, |t| t > now) {
                slack.expires = None;
            }
        }
    }

    // CPUS WHOSE SLACK TIMER FIRED BY `now`; EACH TIMER FIRES ONCE
    pub fn expired_slack(&self, now: u64) -> Vec<usize> {
        let mut s = self.lock();
        let mut fired = Vec::new();
        for (i, sl) in s.slack.iter_mut().enumerate() {
            if sl.expires.map_or(false, |t| t <= now) {
                sl.expires = None;
                fired.push(i);
            }
        }
        fired.into_iter().map(|i| s.cpus[i].cpu).collect()
    }

    pub fn update(&self, src: &dyn UtilSource, cpu: usize, time: u64, flags: u32) {
        if !self.started.load(Ordering::Relaxed) || !self.cpus.test(cpu) {
            return;
        }
        self.updates.fetch_add(1, Ordering::Relaxed);

        let (policy_min, cpuinfo_max) = match self.acme.policy(self.domain) {
            Some(p) => (p.min, p.cpuinfo_max),
            None => return,
        };
        let (util, max) = self.get_util(src, cpu, time);

        let mut s = self.lock();
        if let Some(c) = s.sg_cpu(cpu) {
            c.util = util;
            c.max = max;
            c.flags = flags;
            self.set_iowait_boost(c, time, flags, policy_min);
            c.last_update = time;
        }

        if self.should_update_freq(&mut s, time) {
            let next = if flags & SCHED_CPUFREQ_DL != 0 {
                cpuinfo_max
            } else {
                self.next_freq_shared(src, &mut s, time, policy_min, cpuinfo_max)
            };
            self.update_commit(&mut s, time, next);
        }
    }
}

impl UpdateUtil for Schedutil {
    fn update_util(&self, src: &dyn UtilSource, cpu: usize, time: u64, flags: u32) {
        self.update(src, cpu, time, flags);
    }
}

impl Drop for Schedutil {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_worker_sched(name: &str, bind: CpuMask) {
    let param = libc::sched_param { sched_priority: SUGOV_WORKER_PRIO };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        warn!("{}: failed to set SCHED_FIFO: {}", name, std::io::Error::last_os_error());
    }

    if bind.is_empty() {
        return;
    }
    let ret = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        for cpu in bind.iter() {
            libc::CPU_SET(cpu, &mut set);
        }
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if ret != 0 {
        debug!("{}: not bound to cpus {}: {}", name, bind, std::io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::cpufreq::cal::SimCal;

    const MS: u64 = 1_000_000;

    #[derive(Default)]
    struct FakeSource {
        util: Mutex<[u64; 8]>,
        boosted: AtomicBool,
        offline: AtomicU64,
    }

    impl FakeSource {
        fn set(&self, cpu: usize, util: u64) {
            self.util.lock().unwrap()[cpu] = util;
        }
    }

    impl UtilSource for FakeSource {
        fn boosted_cpu_util(&self, cpu: usize) -> u64 {
            self.util.lock().unwrap()[cpu]
        }
        fn capacity_orig(&self, _cpu: usize) -> u64 {
            1024
        }
        fn active_ratio(&self, _cpu: usize, util: u64, max: u64, _now: u64) -> (u64, u64) {
            (util, max)
        }
        fn is_idle(&self, cpu: usize) -> bool {
            self.util.lock().unwrap()[cpu] == 0
        }
        fn is_active(&self, cpu: usize) -> bool {
            self.offline.load(Ordering::Relaxed) & (1 << cpu) == 0
        }
        fn is_boosted(&self, _cpu: usize) -> bool {
            self.boosted.load(Ordering::Relaxed)
        }
    }

    struct Rig {
        acme: Arc<Acme>,
        qos: Arc<PmQos>,
        gov: Arc<Schedutil>,
        src: FakeSource,
    }

    fn rig_with(fast_switch: bool, up_us: u64, down_us: u64) -> Rig {
        let mut cfg = config::reference().platform;
        cfg.domains[0].fast_switch = fast_switch;
        cfg.validate().unwrap();
        let cal = Arc::new(SimCal::from_domains(&cfg.domains));
        let qos = Arc::new(PmQos::new());
        let platform = Arc::new(Platform::from_config(&cfg).unwrap());
        let acme = Acme::init(&cfg, cal, qos.clone(), platform.clone()).unwrap();
        acme.release_boot_qos().unwrap();

        let gcfg = GovernorConfig { up_rate_limit_us: up_us, down_rate_limit_us: down_us, iowait_boost: true };
        let gov = Schedutil::new(0, acme.clone(), qos.clone(), platform, &gcfg, &cfg.domains[0].slack).unwrap();
        gov.start().unwrap();
        Rig { acme, qos, gov, src: FakeSource::default() }
    }

    fn rig() -> Rig {
        rig_with(true, 0, 0)
    }

    #[test]
    fn util_maps_through_the_tipping_point() {
        let r = rig();
        r.src.set(0, 600);
        r.gov.update(&r.src, 0, 100 * MS, 0);
        // 1.25 x 1950000 x 600 / 1024 = 1428222 -> 1534000
        assert_eq!(r.acme.cur_freq(0), 1_534_000);
        r.src.set(0, 100);
        r.gov.update(&r.src, 0, 101 * MS, 0);
        assert_eq!(r.acme.cur_freq(0), 507_000);
        r.src.set(0, 1024);
        r.gov.update(&r.src, 0, 102 * MS, 0);
        assert_eq!(r.acme.cur_freq(0), 1_950_000);
    }

    #[test]
    fn up_rate_limit_suppresses_second_spike() {
        let r = rig_with(true, 8000, 1000);
        r.src.set(0, 100);
        r.gov.update(&r.src, 0, 50 * MS, 0);
        assert_eq!(r.acme.cur_freq(0), 507_000);

        let t = 100 * MS;
        r.src.set(0, 600);
        r.gov.update(&r.src, 0, t, 0);
        assert_eq!(r.acme.cur_freq(0), 1_534_000);

        r.src.set(0, 1024);
        r.gov.update(&r.src, 0, t + 3 * MS, 0);
        assert_eq!(r.acme.cur_freq(0), 1_534_000);
        assert_eq!(r.gov.stats().rate_limited, 1);

        r.gov.update(&r.src, 0, t + 9 * MS, 0);
        assert_eq!(r.acme.cur_freq(0), 1_950_000);
    }

    #[test]
    fn siblings_share_the_policy() {
        let r = rig();
        r.src.set(2, 600);
        r.gov.update(&r.src, 2, 100 * MS, 0);
        r.src.set(0, 100);
        r.gov.update(&r.src, 0, 101 * MS, 0);
        // CPU2 STILL CARRIES LOAD AND SETS THE PACE
        assert_eq!(r.acme.cur_freq(0), 1_534_000);

        // CPU2 WENT IDLE MORE THAN A TICK AGO
        r.src.set(2, 0);
        r.gov.update(&r.src, 0, 110 * MS, 0);
        assert_eq!(r.acme.cur_freq(0), 507_000);
    }

    #[test]
    fn iowait_boost_doubles_then_decays() {
        let r = rig();
        let mut seen = Vec::new();
        for i in 0..3 {
            r.gov.update(&r.src, 0, 100 * MS + i * MS, SCHED_CPUFREQ_IOWAIT);
            seen.push(r.acme.cur_freq(0));
        }
        assert_eq!(seen, vec![832_000, 1_326_000, 1_950_000]);

        r.gov.update(&r.src, 0, 103 * MS, 0);
        assert_eq!(r.acme.cur_freq(0), 1_326_000);
    }

    #[test]
    fn deadline_flag_goes_straight_to_max() {
        let r = rig();
        r.gov.update(&r.src, 0, 100 * MS, SCHED_CPUFREQ_DL);
        assert_eq!(r.acme.cur_freq(0), 1_950_000);
    }

    #[test]
    fn limits_change_forces_recompute() {
        let r = rig();
        r.src.set(0, 100);
        r.gov.update(&r.src, 0, 100 * MS, 0);
        assert_eq!(r.acme.cur_freq(0), 507_000);

        // SOMEONE ELSE MOVED THE CLOCK; THE SAME REQUEST IS DEDUPLICATED
        r.acme.target(0, 1_950_000, Relation::L).unwrap();
        r.gov.update(&r.src, 0, 101 * MS, 0);
        assert_eq!(r.acme.cur_freq(0), 1_950_000);

        r.acme.policy_limits(0, 0, 1_950_000).unwrap();
        r.gov.update(&r.src, 0, 102 * MS, 0);
        assert_eq!(r.acme.cur_freq(0), 507_000);
    }

    #[test]
    fn worker_programs_slow_domains() {
        let r = rig_with(false, 0, 0);
        r.src.set(0, 600);
        r.gov.update(&r.src, 0, 100 * MS, 0);
        r.gov.flush();
        assert_eq!(r.acme.cur_freq(0), 1_534_000);
        r.gov.stop();
        assert!(!r.gov.is_started());
    }

    #[test]
    fn worker_request_survives_offline_boot_group() {
        let mut cfg = config::reference().platform;
        cfg.domains[2].fast_switch = false;
        cfg.validate().unwrap();
        let cal = Arc::new(SimCal::from_domains(&cfg.domains));
        let qos = Arc::new(PmQos::new());
        let platform = Arc::new(Platform::from_config(&cfg).unwrap());
        let acme = Acme::init(&cfg, cal, qos.clone(), platform.clone()).unwrap();
        acme.release_boot_qos().unwrap();
        let gov = Schedutil::new(2, acme.clone(), qos, platform, &GovernorConfig::default(),
                                 &cfg.domains[2].slack).unwrap();
        gov.start().unwrap();
        acme.target(2, 650_000, Relation::L).unwrap();

        // CPUS 0-3 DOWN, THE BIG DOMAIN STILL GETS ITS REQUEST PROGRAMMED
        let src = FakeSource::default();
        src.offline.store(0xf, Ordering::Relaxed);
        src.set(6, 1024);
        gov.update(&src, 6, 100 * MS, SCHED_CPUFREQ_DL);
        gov.flush();
        assert_eq!(gov.next_freq(), 2_730_000);
        assert_eq!(acme.cur_freq(2), 2_730_000);
        gov.stop();
    }

    #[test]
    fn min_qos_release_returns_to_governor_request() {
        let r = rig();
        r.src.set(0, 100);
        r.gov.update(&r.src, 0, 100 * MS, 0);
        assert_eq!(r.gov.next_freq(), 507_000);

        let floor = r.qos.add_request(0, 1_534_000).unwrap();
        assert_eq!(r.acme.cur_freq(0), 1_534_000);
        r.qos.remove_request(floor).unwrap();
        assert_eq!(r.acme.cur_freq(0), 507_000);
    }

    #[test]
    fn slack_timer_arms_only_for_loaded_cpus() {
        let r = rig();
        r.src.set(1, 300);
        r.gov.update(&r.src, 1, 100 * MS, 0);

        r.gov.idle_enter(&r.src, 1, 100 * MS, 200 * MS);
        assert!(r.gov.expired_slack(169 * MS).is_empty());
        assert_eq!(r.gov.expired_slack(170 * MS), vec![1]);
        assert!(r.gov.expired_slack(171 * MS).is_empty());

        // NEXT EVENT SOONER THAN THE SLACK PERIOD
        r.gov.idle_enter(&r.src, 1, 200 * MS, 50 * MS);
        assert!(r.gov.expired_slack(400 * MS).is_empty());

        // WAKING BEFORE EXPIRY CANCELS
        r.gov.idle_enter(&r.src, 1, 300 * MS, 200 * MS);
        r.gov.idle_exit(1, 310 * MS);
        assert!(r.gov.expired_slack(400 * MS).is_empty());

        r.src.boosted.store(true, Ordering::Relaxed);
        r.gov.idle_enter(&r.src, 1, 500 * MS, 200 * MS);
        assert!(r.gov.expired_slack(600 * MS).is_empty());
    }
}
