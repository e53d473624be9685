// EMS ACME DVFS DRIVER
// ONE STATE MACHINE PER FREQUENCY DOMAIN: TRACKS THE CURRENT FREQUENCY,
// APPLIES PM QOS AND POLICY BOUNDS, PROGRAMS THE CLOCK THROUGH CAL AND
// PUBLISHES THE RESULTING CAPACITY. HOTPLUG AND SUSPEND DISABLE A DOMAIN;
// A DISABLED DOMAIN ACCEPTS TARGET REQUESTS AS SILENT NO-OPS.
//
// LOCKING: ONE MUTEX PER DOMAIN. PM QOS CALLBACKS RUN WITH NO PM QOS LOCK
// HELD. DOMAINS UNDER THE DVFS MANAGER ARE SCALED FROM INSIDE ITS LOCK.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::cal::Cal;
use super::dm::{DmScaler, DvfsManager};
use super::pm_qos::{PmQos, QosEvent, QosKind, QosRequest};
use super::table::{FreqTable, Relation};
use crate::config::{DomainConfig, PlatformConfig};
use crate::notifier::{Decision, NotifierChain, NotifierId};
use crate::platform::Platform;
use crate::topology::CpuMask;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GovernorKind {
    #[default]
    Schedutil,
    Performance,
    Powersave,
    Userspace,
}

impl GovernorKind {
    // STATIC GOVERNORS PIN A FREQUENCY AND BYPASS PM QOS
    pub fn is_static(self) -> bool {
        !matches!(self, GovernorKind::Schedutil)
    }

    pub fn label(self) -> &'static str {
        match self {
            GovernorKind::Schedutil => "schedutil",
            GovernorKind::Performance => "performance",
            GovernorKind::Powersave => "powersave",
            GovernorKind::Userspace => "userspace",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransitionPhase {
    Begin,
    End { ok: bool },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TransitionEvent {
    pub domain: usize,
    pub old: u64,
    pub new: u64,
    pub phase: TransitionPhase,
}

// POLICY LIMITS CHANGED
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PolicyEvent {
    pub domain: usize,
    pub min: u64,
    pub max: u64,
}

// SNAPSHOT OF A DOMAIN'S CPUFREQ POLICY
#[derive(Clone, Copy, Debug)]
pub struct Policy {
    pub min: u64,
    pub max: u64,
    pub cpuinfo_min: u64,
    pub cpuinfo_max: u64,
    pub cur: u64,
    pub governor: GovernorKind,
}

struct DomainState {
    old: u64,
    enabled: bool,
    policy_min: u64,
    policy_max: u64,
    governor: GovernorKind,
    online: CpuMask,
}

pub struct Domain {
    pub id: usize,
    pub cal_id: u32,
    pub cpus: CpuMask,
    pub min_freq: u64,
    pub max_freq: u64,
    pub boot_freq: u64,
    pub resume_freq: u64,
    boot_qos: u64,
    need_awake: bool,
    fast_switch: bool,
    table: FreqTable,
    qos_min_class: usize,
    qos_max_class: usize,
    min_req: QosRequest,
    max_req: QosRequest,
    dm_type: Option<usize>,
    state: Mutex<DomainState>,
}

impl Domain {
    fn lock(&self) -> MutexGuard<'_, DomainState> {
        match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn table(&self) -> &FreqTable {
        &self.table
    }

    pub fn dm_type(&self) -> Option<usize> {
        self.dm_type
    }

    pub fn qos_classes(&self) -> (usize, usize) {
        (self.qos_min_class, self.qos_max_class)
    }
}

pub struct Acme {
    domains: Vec<Domain>,
    cal: Arc<dyn Cal>,
    qos: Arc<PmQos>,
    platform: Arc<Platform>,
    dm: Option<Arc<DvfsManager>>,
    transitions: NotifierChain<TransitionEvent>,
    policy_notifiers: NotifierChain<PolicyEvent>,
    // HOTPLUG DRIVEN BY SUSPEND ITSELF IS IGNORED
    tasks_frozen: AtomicBool,
    // FAST REBOOT: ONLY DOMAIN 0 KEEPS ITS RESUME FREQUENCY
    restarting: AtomicBool,
    suspend_timeout: Duration,
}

// --- INIT ---

fn init_domain(id: usize, dc: &DomainConfig, cal: &dyn Cal, qos: &PmQos,
               platform: &Platform) -> Result<Domain> {
    let cpus = CpuMask::parse(&dc.cpus)?;

    let mut max_freq = cal.max_freq(dc.cal_id);
    let mut min_freq = cal.min_freq(dc.cal_id);
    if let Some(f) = dc.max_freq {
        max_freq = max_freq.min(f);
    }
    if let Some(f) = dc.min_freq {
        min_freq = min_freq.max(f);
    }
    if max_freq == 0 || min_freq > max_freq {
        bail!("empty frequency range [{}, {}]", min_freq, max_freq);
    }

    let rates = cal.rate_table(dc.cal_id);
    let volts = cal.asv_table(dc.cal_id);
    let table = FreqTable::new(&rates, min_freq, max_freq);
    if table.is_empty() {
        bail!("no cal level inside [{}, {}]", min_freq, max_freq);
    }

    if let Err(e) = platform.energy_mut().register_domain(cpus, &rates, &volts, max_freq, min_freq) {
        warn!("domain{}: energy table not built: {:#}", id, e);
    }

    qos.add_class(dc.pm_qos_min_class, QosKind::Min)?;
    qos.add_class(dc.pm_qos_max_class, QosKind::Max)?;
    let min_req = qos.add_request(dc.pm_qos_min_class, min_freq)?;
    let max_req = qos.add_request(dc.pm_qos_max_class, max_freq)?;

    let boot_freq = cal.boot_freq(dc.cal_id);
    let resume_freq = cal.resume_freq(dc.cal_id);
    let domain = Domain {
        id,
        cal_id: dc.cal_id,
        cpus,
        min_freq,
        max_freq,
        boot_freq,
        resume_freq,
        boot_qos: dc.boot_qos.map(|f| f.min(max_freq)).unwrap_or(max_freq),
        need_awake: dc.need_awake,
        fast_switch: dc.fast_switch,
        table,
        qos_min_class: dc.pm_qos_min_class,
        qos_max_class: dc.pm_qos_max_class,
        min_req,
        max_req,
        dm_type: dc.dm_type,
        state: Mutex::new(DomainState {
            old: 0,
            enabled: true,
            policy_min: min_freq,
            policy_max: max_freq,
            governor: dc.governor,
            online: cpus,
        }),
    };

    info!("domain{}: cal-id {} cpus {} [{} .. {}] kHz, {} levels, boot {} resume {}",
          id, dc.cal_id, cpus, min_freq, max_freq, domain.table.len(), boot_freq, resume_freq);
    Ok(domain)
}

impl Acme {
    // A DOMAIN THAT FAILS TO INITIALIZE IS LEFT OUT; THE REST STILL COME UP
    pub fn init(cfg: &PlatformConfig, cal: Arc<dyn Cal>, qos: Arc<PmQos>,
                platform: Arc<Platform>) -> Result<Arc<Self>> {
        let mut domains = Vec::new();
        for dc in &cfg.domains {
            let id = domains.len();
            match init_domain(id, dc, cal.as_ref(), &qos, &platform) {
                Ok(d) => domains.push(d),
                Err(e) => warn!("cpufreq domain cal-id {} disabled: {:#}", dc.cal_id, e),
            }
        }
        if domains.is_empty() {
            bail!("no cpufreq domain initialized");
        }

        {
            let mut energy = platform.energy_mut();
            let complete = (0..energy.nr_cpus()).all(|c| !energy.table(c).is_empty());
            energy.set_initialized(complete);
            if complete {
                energy.log_tables();
            }
        }

        let mut acme = Self {
            domains,
            cal,
            qos,
            platform,
            dm: None,
            transitions: NotifierChain::new(),
            policy_notifiers: NotifierChain::new(),
            tasks_frozen: AtomicBool::new(false),
            restarting: AtomicBool::new(false),
            suspend_timeout: Duration::from_micros(cfg.suspend_timeout_us),
        };

        for d in &acme.domains {
            let old = acme.read_clock(d, 0, d.cpus);
            d.lock().old = old;
            acme.platform.set_freq_scale(d.cpus, old, d.max_freq);
        }
        acme.dm = acme.init_dm(cfg);

        let acme = Arc::new(acme);
        acme.register_callbacks()?;

        // BOOT QOS HOLDS UNTIL release_boot_qos
        for d in &acme.domains {
            acme.qos.update_request(&d.min_req, d.boot_qos)?;
            acme.qos.update_request(&d.max_req, d.boot_qos)?;
        }
        Ok(acme)
    }

    fn init_dm(&self, cfg: &PlatformConfig) -> Option<Arc<DvfsManager>> {
        if !self.domains.iter().any(|d| d.dm_type.is_some()) {
            return None;
        }

        let dm = Arc::new(DvfsManager::new());
        for d in &self.domains {
            if let Some(t) = d.dm_type {
                let old = d.lock().old;
                if let Err(e) = dm.register(t, d.min_freq, d.max_freq, old) {
                    warn!("domain{}: dm registration failed: {:#}", d.id, e);
                }
            }
        }
        for c in &cfg.dm_constraints {
            let master = match self.domains.iter().find(|d| d.dm_type == Some(c.master)) {
                Some(d) => d,
                None => continue,
            };
            let levels: Vec<u64> = master.table.iter().collect();
            if let Err(e) = dm.add_constraint(c.master, c.slave, c.kind, &levels, &c.table) {
                warn!("dm constraint {} -> {} dropped: {:#}", c.master, c.slave, e);
            }
        }
        Some(dm)
    }

    fn register_callbacks(self: &Arc<Self>) -> Result<()> {
        for d in &self.domains {
            for class in [d.qos_min_class, d.qos_max_class] {
                let weak: Weak<Self> = Arc::downgrade(self);
                self.qos.add_notifier(class, i32::MAX, move |ev: &QosEvent| {
                    match weak.upgrade() {
                        Some(acme) => acme.on_qos_change(ev.class, ev.value),
                        None => Decision::Done,
                    }
                })?;
            }
        }

        if let Some(dm) = &self.dm {
            for d in &self.domains {
                if let Some(t) = d.dm_type {
                    let weak: Weak<Self> = Arc::downgrade(self);
                    dm.register_scaler(t, weak)?;
                }
            }
        }
        Ok(())
    }

    // --- LOOKUP ---

    pub fn nr_domains(&self) -> usize {
        self.domains.len()
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    pub fn domain(&self, id: usize) -> Result<&Domain> {
        self.domains.get(id).ok_or_else(|| anyhow!("no cpufreq domain {}", id))
    }

    pub fn domain_of(&self, cpu: usize) -> Option<usize> {
        self.domains.iter().position(|d| d.cpus.test(cpu))
    }

    pub fn dm(&self) -> Option<&Arc<DvfsManager>> {
        self.dm.as_ref()
    }

    pub fn cur_freq(&self, id: usize) -> u64 {
        self.domains.get(id).map(|d| d.lock().old).unwrap_or(0)
    }

    pub fn is_enabled(&self, id: usize) -> bool {
        self.domains.get(id).map(|d| d.lock().enabled).unwrap_or(false)
    }

    pub fn supports_fast_switch(&self, id: usize) -> bool {
        self.domains.get(id).map(|d| d.fast_switch).unwrap_or(false)
    }

    pub fn policy(&self, id: usize) -> Option<Policy> {
        let d = self.domains.get(id)?;
        let s = d.lock();
        Some(Policy {
            min: s.policy_min,
            max: s.policy_max,
            cpuinfo_min: d.min_freq,
            cpuinfo_max: d.max_freq,
            cur: s.old,
            governor: s.governor,
        })
    }

    pub fn register_transition_notifier<F>(&self, priority: i32, callback: F) -> NotifierId
    where
        F: Fn(&TransitionEvent) -> Decision + Send + Sync + 'static,
    {
        self.transitions.register(priority, callback)
    }

    pub fn register_policy_notifier<F>(&self, priority: i32, callback: F) -> NotifierId
    where
        F: Fn(&PolicyEvent) -> Decision + Send + Sync + 'static,
    {
        self.policy_notifiers.register(priority, callback)
    }

    pub fn unregister_policy_notifier(&self, id: NotifierId) -> bool {
        self.policy_notifiers.unregister(id)
    }

    pub fn set_tasks_frozen(&self, frozen: bool) {
        self.tasks_frozen.store(frozen, Ordering::Relaxed);
    }

    pub fn set_restarting(&self, restarting: bool) {
        self.restarting.store(restarting, Ordering::Relaxed);
    }

    // --- CLOCK ACCESS ---

    // THE CLOCK AS SEEN BY THE DRIVER. WITHOUT AN ONLINE CPU, OR ON A DOMAIN
    // THAT MUST STAY AWAKE FOR CLOCK ACCESS, THE TRACKED VALUE IS TRUSTED.
    fn read_clock(&self, d: &Domain, old: u64, online: CpuMask) -> u64 {
        if online.is_empty() {
            return old;
        }
        if d.need_awake {
            if old != 0 {
                return old;
            }
            self.cal.set_power_mode(d.cal_id, false);
        }

        let mut freq = self.cal.get_rate(d.cal_id);
        // CAL READS 0 WHILE THE CLOCK IS CHANGING STATE
        if freq == 0 {
            freq = old;
        }

        if d.need_awake {
            self.cal.set_power_mode(d.cal_id, true);
        }
        freq
    }

    pub fn get_freq(&self, id: usize) -> u64 {
        match self.domains.get(id) {
            Some(d) => {
                let (old, online) = {
                    let s = d.lock();
                    (s.old, s.online)
                };
                self.read_clock(d, old, online)
            }
            None => 0,
        }
    }

    fn set_freq(&self, d: &Domain, freq: u64) -> Result<()> {
        if d.need_awake {
            self.cal.set_power_mode(d.cal_id, false);
        }
        let res = self.cal.set_rate(d.cal_id, freq);
        if let Err(e) = &res {
            error!("failed to scale frequency of domain{} to {} kHz: {:#}", d.id, freq, e);
        }
        if d.need_awake {
            self.cal.set_power_mode(d.cal_id, true);
        }
        res
    }

    fn scale(&self, d: &Domain, old: u64, freq: u64) -> Result<()> {
        self.transitions.call(&TransitionEvent {
            domain: d.id, old, new: freq, phase: TransitionPhase::Begin,
        });
        let res = self.set_freq(d, freq);
        self.transitions.call(&TransitionEvent {
            domain: d.id, old, new: freq, phase: TransitionPhase::End { ok: res.is_ok() },
        });
        res
    }

    // --- TARGET ---

    // RESOLVE AND PROGRAM UNDER THE DOMAIN LOCK. POLICY BOUNDS WIN OVER THE
    // REQUEST.
    fn target_locked(&self, d: &Domain, target: u64, relation: Relation) -> Result<()> {
        let mut s = d.lock();
        if !s.enabled {
            return Ok(());
        }

        let real = self.read_clock(d, s.old, s.online);
        if s.old != real {
            panic!("domain{}: tracked frequency {} kHz but the clock runs at {} kHz",
                   d.id, s.old, real);
        }

        let freq = match d.table.resolve(target, relation, s.policy_min, s.policy_max) {
            Some(f) => f,
            None => {
                error!("domain{}: target {} kHz out of range", d.id, target);
                return Ok(());
            }
        };
        if s.old == freq {
            return Ok(());
        }

        self.scale(d, s.old, freq)?;
        debug!("domain{}: {} kHz -> {} kHz", d.id, s.old, freq);
        s.old = freq;
        self.platform.set_freq_scale(d.cpus, freq, s.policy_max);
        Ok(())
    }

    fn apply_pm_qos(&self, d: &Domain, governor: GovernorKind, target: u64) -> u64 {
        if governor.is_static() {
            return target;
        }
        let qos_min = self.qos.value(d.qos_min_class).unwrap_or(0);
        let qos_max = self.qos.value(d.qos_max_class).unwrap_or(u64::MAX);
        target.max(qos_min).min(qos_max)
    }

    pub fn target(&self, id: usize, target: u64, relation: Relation) -> Result<()> {
        let d = self.domain(id)?;
        let (enabled, governor, policy_min, policy_max, old) = {
            let s = d.lock();
            (s.enabled, s.governor, s.policy_min, s.policy_max, s.old)
        };
        if !enabled {
            return Ok(());
        }

        let freq = self.apply_pm_qos(d, governor, target);
        let (dm, dm_type) = match (&self.dm, d.dm_type) {
            (Some(dm), Some(t)) => (dm, t),
            _ => return self.target_locked(d, freq, relation),
        };

        match d.table.resolve(freq, relation, policy_min, policy_max) {
            Some(f) if f == old => return Ok(()),
            Some(_) => {}
            None => {
                error!("domain{}: target {} kHz out of range", d.id, freq);
                return Ok(());
            }
        }

        let qos_min = self.qos.value(d.qos_min_class).unwrap_or(0);
        let qos_max = self.qos.value(d.qos_max_class).unwrap_or(u64::MAX);
        dm.policy_update(dm_type, policy_min.max(qos_min), policy_max.min(qos_max), freq)
            .with_context(|| format!("domain{}: dvfs manager update failed", d.id))?;
        Ok(())
    }

    // INLINE SWITCH FROM THE GOVERNOR. RETURNS THE FREQUENCY NOW RUNNING.
    pub fn fast_switch(&self, id: usize, target: u64) -> Result<u64> {
        let d = self.domain(id)?;
        if !d.fast_switch {
            bail!("domain{} does not support fast switching", id);
        }
        self.target(id, target, Relation::L)?;
        Ok(self.cur_freq(id))
    }

    // RE-TARGET ON BEHALF OF PM QOS OR SUSPEND
    pub fn update_freq(&self, id: usize, freq: u64) -> Result<()> {
        let d = self.domain(id)?;
        let governor = {
            let s = d.lock();
            if s.online.is_empty() {
                bail!("domain{} has no online cpu", id);
            }
            s.governor
        };
        if governor.is_static() {
            return Ok(());
        }
        self.target(id, freq, Relation::H)
    }

    // --- POLICY ---

    pub fn policy_limits(&self, id: usize, min: u64, max: u64) -> Result<()> {
        let d = self.domain(id)?;
        let max = max.min(d.max_freq).max(d.min_freq);
        let min = min.max(d.min_freq).min(max);
        let old = {
            let mut s = d.lock();
            s.policy_min = min;
            s.policy_max = max;
            s.old
        };

        self.platform.energy_mut().update_cpufreq_capacity(d.cpus, max, d.max_freq);
        self.platform.set_freq_scale(d.cpus, old, max);
        self.policy_notifiers.call(&PolicyEvent { domain: id, min, max });

        if max < old {
            self.target(id, max, Relation::H)
        } else if min > old {
            self.target(id, min, Relation::L)
        } else {
            Ok(())
        }
    }

    pub fn set_governor(&self, id: usize, governor: GovernorKind) -> Result<()> {
        let d = self.domain(id)?;
        let (min, max) = {
            let mut s = d.lock();
            s.governor = governor;
            (s.policy_min, s.policy_max)
        };
        info!("domain{}: governor {}", id, governor.label());
        match governor {
            GovernorKind::Performance => self.target_locked(d, max, Relation::H),
            GovernorKind::Powersave => self.target_locked(d, min, Relation::L),
            _ => Ok(()),
        }
    }

    // --- PM QOS ---

    fn need_update_freq(&self, d: &Domain, class: usize, freq: u64) -> bool {
        let cur = self.get_freq(d.id);
        if cur == freq {
            return false;
        }
        if class == d.qos_min_class && cur > freq {
            return false;
        }
        if class == d.qos_max_class && cur < freq {
            return false;
        }
        true
    }

    pub fn on_qos_change(&self, class: usize, value: u64) -> Decision {
        let d = match self.domains.iter().find(|d| d.qos_min_class == class || d.qos_max_class == class) {
            Some(d) => d,
            None => return Decision::Bad,
        };
        if d.lock().online.is_empty() {
            return Decision::Bad;
        }

        if class == d.qos_max_class {
            self.platform.energy_mut().update_qos_capacity(d.cpus, value.min(d.max_freq), d.max_freq);
        }

        if !self.need_update_freq(d, class, value) {
            return Decision::Ok;
        }
        match self.update_freq(d.id, value) {
            Ok(()) => Decision::Ok,
            Err(e) => {
                warn!("domain{}: pm_qos class {} -> {} not applied: {:#}", d.id, class, value, e);
                Decision::Bad
            }
        }
    }

    pub fn release_boot_qos(&self) -> Result<()> {
        for d in &self.domains {
            self.qos.update_request(&d.min_req, d.min_freq)?;
            self.qos.update_request(&d.max_req, d.max_freq)?;
        }
        info!("boot pm_qos released");
        Ok(())
    }

    // --- HOTPLUG ---

    // THE FIRST CPU UP ENABLES THE DOMAIN AND LIFTS THE MAX LIMIT
    pub fn cpu_up(&self, cpu: usize) -> Result<()> {
        if self.tasks_frozen.load(Ordering::Relaxed) {
            return Ok(());
        }
        let id = self.domain_of(cpu).ok_or_else(|| anyhow!("cpu{} is in no cpufreq domain", cpu))?;
        let d = &self.domains[id];
        let first = {
            let mut s = d.lock();
            s.online.set(cpu);
            if s.online.weight() == 1 {
                s.enabled = true;
                true
            } else {
                false
            }
        };
        if first {
            self.qos.update_request(&d.max_req, d.max_freq)?;
            info!("domain{}: enabled by cpu{}", id, cpu);
        }
        Ok(())
    }

    // THE LAST CPU DOWN PINS THE DOMAIN TO ITS MINIMUM, THEN DISABLES IT
    pub fn cpu_down(&self, cpu: usize) -> Result<()> {
        if self.tasks_frozen.load(Ordering::Relaxed) {
            return Ok(());
        }
        let id = self.domain_of(cpu).ok_or_else(|| anyhow!("cpu{} is in no cpufreq domain", cpu))?;
        let d = &self.domains[id];
        let last = {
            let s = d.lock();
            s.online.test(cpu) && s.online.weight() == 1
        };
        if last {
            self.qos.update_request(&d.max_req, d.min_freq)?;
            d.lock().enabled = false;
            info!("domain{}: disabled by cpu{}", id, cpu);
        }
        d.lock().online.clear(cpu);
        Ok(())
    }

    // --- SUSPEND / RESUME ---

    fn suspend_domain(&self, d: &Domain) -> Result<()> {
        let freq = if self.restarting.load(Ordering::Relaxed) && d.id != 0 {
            d.min_freq
        } else {
            d.resume_freq
        };

        self.qos.update_request(&d.min_req, freq)?;
        self.qos.update_request(&d.max_req, freq)?;

        let deadline = Instant::now() + self.suspend_timeout;
        loop {
            {
                let mut s = d.lock();
                if s.old <= freq {
                    // NO REQUEST CAN LAND AFTER THIS
                    s.enabled = false;
                    break;
                }
            }
            if Instant::now() >= deadline {
                bail!("domain{}: still at {} kHz after {:?}, suspend frequency {} kHz",
                      d.id, self.cur_freq(d.id), self.suspend_timeout, freq);
            }
            if let Err(e) = self.update_freq(d.id, freq) {
                debug!("domain{}: suspend sync retry: {:#}", d.id, e);
            }
            std::thread::yield_now();
        }
        info!("domain{}: suspended at {} kHz", d.id, self.cur_freq(d.id));
        Ok(())
    }

    fn resume_domain(&self, d: &Domain) -> Result<()> {
        d.lock().enabled = true;
        self.qos.update_request(&d.min_req, d.min_freq)?;
        self.qos.update_request(&d.max_req, d.max_freq)?;
        Ok(())
    }

    pub fn suspend(&self) -> Result<()> {
        for d in self.domains.iter().rev() {
            self.suspend_domain(d)?;
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        for d in self.domains.iter().rev() {
            self.resume_domain(d)?;
        }
        info!("cpufreq resumed");
        Ok(())
    }
}

impl DmScaler for Acme {
    fn dm_scale(&self, dm_type: usize, freq: u64, relation: Relation) -> Result<()> {
        let d = self.domains.iter().find(|d| d.dm_type == Some(dm_type))
            .ok_or_else(|| anyhow!("no domain with dm type {}", dm_type))?;
        if d.lock().online.is_empty() {
            bail!("domain{}: every cpu is offline", d.id);
        }
        self.target_locked(d, freq, relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::cpufreq::cal::SimCal;
    use crate::multi_load::Lane;

    struct Rig {
        acme: Arc<Acme>,
        cal: Arc<SimCal>,
        qos: Arc<PmQos>,
        platform: Arc<Platform>,
    }

    fn rig() -> Rig {
        let mut cfg = config::reference().platform;
        cfg.validate().unwrap();
        let cal = Arc::new(SimCal::from_domains(&cfg.domains));
        let qos = Arc::new(PmQos::new());
        let platform = Arc::new(Platform::from_config(&cfg).unwrap());
        let acme = Acme::init(&cfg, cal.clone(), qos.clone(), platform.clone()).unwrap();
        acme.release_boot_qos().unwrap();
        Rig { acme, cal, qos, platform }
    }

    #[test]
    fn boots_at_the_clock_rate_with_energy_tables() {
        let r = rig();
        assert_eq!(r.acme.nr_domains(), 3);
        assert_eq!(r.acme.cur_freq(0), 1_950_000);
        assert_eq!(r.acme.domain_of(5), Some(1));
        assert!(r.platform.energy().is_initialized());
        assert_eq!(r.platform.energy().capacity(7, Lane::Uss), 1024);
        assert!(r.acme.dm().is_some());
    }

    #[test]
    fn repeated_target_writes_hardware_once() {
        let r = rig();
        let before = r.cal.writes();
        r.acme.target(0, 1_000_000, Relation::L).unwrap();
        assert_eq!(r.acme.cur_freq(0), 1_053_000);
        r.acme.target(0, 1_000_000, Relation::L).unwrap();
        r.acme.target(0, 1_053_000, Relation::H).unwrap();
        assert_eq!(r.cal.writes(), before + 1);
        assert_eq!(r.platform.freq_scale(0), (1_053_000u64 << 10) / 1_950_000);
    }

    #[test]
    fn qos_bounds_clamp_requests() {
        let r = rig();
        let floor = r.qos.add_request(0, 1_534_000).unwrap();
        assert_eq!(r.acme.cur_freq(0), 1_950_000);
        r.acme.target(0, 507_000, Relation::L).unwrap();
        assert_eq!(r.acme.cur_freq(0), 1_534_000);
        r.qos.remove_request(floor).unwrap();

        // MAX CLASS LOWERS THE RUNNING FREQUENCY AND THE CAPACITY
        let cap_before = r.platform.energy().capacity(0, Lane::Uss);
        r.qos.add_request(1, 1_053_000).unwrap();
        assert_eq!(r.acme.cur_freq(0), 1_053_000);
        assert!(r.platform.energy().capacity(0, Lane::Uss) < cap_before);
        r.acme.target(0, 1_950_000, Relation::L).unwrap();
        assert_eq!(r.acme.cur_freq(0), 1_053_000);
    }

    #[test]
    fn static_governor_ignores_qos() {
        let r = rig();
        r.qos.add_request(1, 832_000).unwrap();
        assert_eq!(r.acme.cur_freq(0), 832_000);
        r.acme.set_governor(0, GovernorKind::Performance).unwrap();
        assert_eq!(r.acme.cur_freq(0), 1_950_000);
        // PM QOS NO LONGER RE-TARGETS THE DOMAIN
        r.qos.add_request(1, 507_000).unwrap();
        assert_eq!(r.acme.cur_freq(0), 1_950_000);
    }

    #[test]
    fn last_cpu_down_disables_domain() {
        let r = rig();
        for cpu in 0..3 {
            r.acme.cpu_down(cpu).unwrap();
            assert!(r.acme.is_enabled(0));
        }
        r.acme.cpu_down(3).unwrap();
        assert!(!r.acme.is_enabled(0));
        assert_eq!(r.acme.cur_freq(0), 507_000);

        // DISABLED: SILENT SUCCESS, NO HARDWARE WRITE
        let writes = r.cal.writes();
        r.acme.target(0, 1_950_000, Relation::L).unwrap();
        assert_eq!(r.cal.writes(), writes);
        assert!(r.acme.update_freq(0, 1_950_000).is_err());

        r.acme.cpu_up(2).unwrap();
        assert!(r.acme.is_enabled(0));
        assert_eq!(r.qos.value(1), Some(1_950_000));
        r.acme.target(0, 1_950_000, Relation::L).unwrap();
        assert_eq!(r.acme.cur_freq(0), 1_950_000);
    }

    #[test]
    fn frozen_hotplug_is_ignored() {
        let r = rig();
        r.acme.set_tasks_frozen(true);
        for cpu in 0..4 {
            r.acme.cpu_down(cpu).unwrap();
        }
        assert!(r.acme.is_enabled(0));
    }

    #[test]
    fn clock_failure_keeps_tracked_frequency() {
        let r = rig();
        r.cal.fail_next_writes(0, 1);
        assert!(r.acme.target(0, 507_000, Relation::L).is_err());
        assert_eq!(r.acme.cur_freq(0), 1_950_000);
        r.acme.target(0, 507_000, Relation::L).unwrap();
        assert_eq!(r.acme.cur_freq(0), 507_000);
    }

    #[test]
    #[should_panic(expected = "tracked frequency")]
    fn clock_drift_is_fatal() {
        let r = rig();
        r.cal.force_rate(0, 832_000);
        let _ = r.acme.target(0, 507_000, Relation::L);
    }

    #[test]
    fn busy_clock_read_falls_back_to_tracked() {
        let r = rig();
        r.cal.busy_next_reads(0, 1);
        assert_eq!(r.acme.get_freq(0), 1_950_000);
    }

    #[test]
    fn awake_domain_balances_power_mode() {
        let r = rig();
        r.acme.target(1, 754_000, Relation::L).unwrap();
        assert_eq!(r.acme.cur_freq(1), 754_000);
        assert_eq!(r.cal.power_mode_depth(1), 0);
    }

    #[test]
    fn big_domain_drags_mid_through_dm() {
        let r = rig();
        r.acme.target(1, 754_000, Relation::L).unwrap();
        r.acme.target(2, 650_000, Relation::L).unwrap();
        assert_eq!(r.acme.cur_freq(2), 650_000);
        assert_eq!(r.acme.cur_freq(1), 754_000);

        r.acme.target(2, 2_730_000, Relation::L).unwrap();
        assert_eq!(r.acme.cur_freq(2), 2_730_000);
        assert_eq!(r.acme.cur_freq(1), 1_378_000);
    }

    #[test]
    fn transitions_are_bracketed() {
        let r = rig();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        r.acme.register_transition_notifier(0, move |ev| {
            s.lock().unwrap().push(ev.phase);
            Decision::Ok
        });
        r.acme.target(0, 507_000, Relation::L).unwrap();
        assert_eq!(*seen.lock().unwrap(),
                   vec![TransitionPhase::Begin, TransitionPhase::End { ok: true }]);
    }

    #[test]
    fn policy_limits_apply_and_notify() {
        let r = rig();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        r.acme.register_policy_notifier(0, move |ev| {
            *s.lock().unwrap() = Some((ev.min, ev.max));
            Decision::Ok
        });
        r.acme.policy_limits(0, 0, 1_326_000).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some((507_000, 1_326_000)));
        assert_eq!(r.acme.cur_freq(0), 1_326_000);
        assert!(r.platform.energy().capacity(0, Lane::Uss) < r.platform.energy().max_capacity(0, Lane::Uss));
    }

    #[test]
    fn suspend_pins_then_resume_restores() {
        let r = rig();
        r.acme.target(0, 507_000, Relation::L).unwrap();
        r.acme.suspend().unwrap();
        for id in 0..3 {
            assert!(!r.acme.is_enabled(id));
        }
        // RESUME FREQUENCY DEFAULTS TO THE BOOT LEVEL
        assert_eq!(r.acme.cur_freq(0), 1_950_000);
        r.acme.target(0, 507_000, Relation::L).unwrap();
        assert_eq!(r.acme.cur_freq(0), 1_950_000);

        r.acme.resume().unwrap();
        assert!(r.acme.is_enabled(0));
        assert_eq!(r.qos.value(0), Some(507_000));
        r.acme.target(0, 507_000, Relation::L).unwrap();
        assert_eq!(r.acme.cur_freq(0), 507_000);
    }

    #[test]
    fn suspend_times_out_when_clock_refuses() {
        let r = rig();
        r.acme.set_restarting(true);
        r.cal.fail_next_writes(2, u32::MAX);
        let err = r.acme.suspend().unwrap_err();
        assert!(format!("{:#}", err).contains("domain2"));
    }
}
