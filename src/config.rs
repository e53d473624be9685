// EMS CONFIGURATION
// PLATFORM DESCRIPTION (COREGROUPS, FREQUENCY DOMAINS, SERVICE POOLS, ONTIME
// BOUNDARIES) AND THE SIMULATED WORKLOAD, LOADED FROM JSON (OPTIONALLY GZIP).
//
// A MALFORMED DOCUMENT IS AN ERROR. A MALFORMED DOMAIN, SERVICE OR BOUNDARY
// ENTRY ONLY DISABLES THAT FEATURE.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::cpufreq::acme::GovernorKind;
use crate::cpufreq::dm::ConstraintKind;
use crate::energy::CpuEnergyData;
use crate::multi_load::Lane;
use crate::part::PartParams;
use crate::topology::{CpuMask, Topology, MAX_CPUS};
use crate::tuning::DEFAULT_COVERAGE_RATIO;
use crate::view::{GroupAttrs, Pid};

// --- PLATFORM ---

// HYSTERESIS BOUNDARIES IN PERCENT OF THE LANE CAPACITY
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OntimeBoundary {
    pub upper_boundary: u64,
    pub lower_boundary: u64,
    pub upper_boundary_s: u64,
    pub lower_boundary_s: u64,
    pub coverage_ratio: u64,
}

impl Default for OntimeBoundary {
    fn default() -> Self {
        Self {
            upper_boundary: 100,
            lower_boundary: 0,
            upper_boundary_s: 100,
            lower_boundary_s: 0,
            coverage_ratio: DEFAULT_COVERAGE_RATIO,
        }
    }
}

impl OntimeBoundary {
    fn is_valid(&self) -> bool {
        self.lower_boundary <= self.upper_boundary
            && self.lower_boundary_s <= self.upper_boundary_s
            && self.coverage_ratio <= 100
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoregroupConfig {
    pub cpus: String,
    #[serde(flatten)]
    pub energy: CpuEnergyData,
    #[serde(default)]
    pub ontime: Option<OntimeBoundary>,
    #[serde(default = "default_part_limit")]
    pub part_limit: u64,
    #[serde(default)]
    pub part_boost: u64,
}

fn default_part_limit() -> u64 {
    1024
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreqLevel {
    pub freq: u64,
    pub volt: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub enabled: bool,
    pub expired_ms: u64,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self { enabled: false, expired_ms: 70 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainConfig {
    pub cal_id: u32,
    pub cpus: String,
    // CAL LEVELS, HIGHEST FREQUENCY FIRST
    pub table: Vec<FreqLevel>,
    #[serde(default)]
    pub min_freq: Option<u64>,
    #[serde(default)]
    pub max_freq: Option<u64>,
    #[serde(default)]
    pub boot_freq: Option<u64>,
    #[serde(default)]
    pub resume_freq: Option<u64>,
    #[serde(default)]
    pub boot_qos: Option<u64>,
    pub pm_qos_min_class: usize,
    pub pm_qos_max_class: usize,
    #[serde(default)]
    pub need_awake: bool,
    #[serde(default = "default_true")]
    pub fast_switch: bool,
    #[serde(default)]
    pub governor: GovernorKind,
    #[serde(default)]
    pub dm_type: Option<usize>,
    #[serde(default)]
    pub slack: SlackConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DmConstraintConfig {
    pub master: usize,
    pub slave: usize,
    pub kind: ConstraintKind,
    // (MASTER FREQ, CONSTRAINT FREQ), MASTER FREQ DESCENDING
    pub table: Vec<(u64, u64)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub level: u32,
    pub light_threshold: u64,
    pub heavy_threshold: u64,
    pub light_cpus: String,
    pub medium_cpus: String,
    pub heavy_cpus: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub up_rate_limit_us: u64,
    pub down_rate_limit_us: u64,
    pub iowait_boost: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self { up_rate_limit_us: 4000, down_rate_limit_us: 20000, iowait_boost: true }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub energy_aware: bool,
    pub util_est: bool,
    pub sync_hint: bool,
    pub eff_mode: bool,
    pub ontime: bool,
    pub part: bool,
    pub tiny_task_level: u64,
    pub tiny_task_cpu: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            energy_aware: true,
            util_est: true,
            sync_hint: true,
            eff_mode: false,
            ontime: true,
            part: false,
            tiny_task_level: crate::tuning::DEFAULT_TINY_TASK_LEVEL,
            tiny_task_cpu: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub nr_cpus: usize,
    pub coregroups: Vec<CoregroupConfig>,
    #[serde(default)]
    pub domains: Vec<DomainConfig>,
    #[serde(default)]
    pub dm_constraints: Vec<DmConstraintConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    // PREFER-PERF AND GLOBAL BOOST TARGETS, DEFAULT: FASTEST COREGROUP
    #[serde(default)]
    pub perf_cpus: Option<String>,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub features: FeatureConfig,
    #[serde(default)]
    pub part: PartParams,
    #[serde(default = "default_boot_boost_ms")]
    pub boot_boost_ms: u64,
    #[serde(default = "default_suspend_timeout_us")]
    pub suspend_timeout_us: u64,
}

fn default_boot_boost_ms() -> u64 {
    crate::tuning::BOOT_BOOST_NS / 1_000_000
}

fn default_suspend_timeout_us() -> u64 {
    10_000
}

// --- WORKLOAD ---

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default)]
    pub tgid: Option<Pid>,
    #[serde(default)]
    pub lane: Lane,
    #[serde(default)]
    pub allowed: Option<String>,
    #[serde(default)]
    pub group: GroupAttrs,
    pub period_ms: u64,
    pub run_ms: u64,
    #[serde(default)]
    pub start_ms: u64,
    #[serde(default)]
    pub stop_ms: Option<u64>,
    #[serde(default)]
    pub iowait: bool,
    #[serde(default = "default_threads")]
    pub threads: usize,
    // THREADS JOIN A TASK BAND KEYED BY THEIR TGID
    #[serde(default)]
    pub band: bool,
}

fn default_threads() -> usize {
    1
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BoostRequest {
    pub at_ms: u64,
    pub key: u64,
    pub prio: i32,
    #[serde(default)]
    pub until_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HotplugEvent {
    pub at_ms: u64,
    pub cpu: usize,
    pub online: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub duration_ms: u64,
    #[serde(default = "default_ontime_period_ms")]
    pub ontime_period_ms: u64,
    #[serde(default = "default_snapshot_ms")]
    pub snapshot_ms: u64,
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub boost_requests: Vec<BoostRequest>,
    #[serde(default)]
    pub hotplug: Vec<HotplugEvent>,
    // SUSPEND/RESUME CYCLE AT THIS TIME
    #[serde(default)]
    pub suspend_at_ms: Option<u64>,
}

fn default_ontime_period_ms() -> u64 {
    4
}

fn default_snapshot_ms() -> u64 {
    100
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimConfig {
    pub platform: PlatformConfig,
    pub workload: WorkloadConfig,
}

// --- LOADING ---

pub fn load(path: &Path) -> Result<SimConfig> {
    let mut file = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut text = String::new();
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        flate2::read::GzDecoder::new(file).read_to_string(&mut text)
            .with_context(|| format!("failed to decompress {}", path.display()))?;
    } else {
        file.read_to_string(&mut text)
            .with_context(|| format!("failed to read {}", path.display()))?;
    }
    parse(&text).with_context(|| format!("invalid config {}", path.display()))
}

// NO PATH: THE BUILT-IN REFERENCE PLATFORM AND WORKLOAD
pub fn load_or_reference(path: Option<&Path>) -> Result<SimConfig> {
    match path {
        Some(p) => load(p),
        None => {
            let mut cfg = reference();
            cfg.platform.validate()?;
            Ok(cfg)
        }
    }
}

pub fn parse(text: &str) -> Result<SimConfig> {
    let mut cfg: SimConfig = serde_json::from_str(text)?;
    cfg.platform.validate()?;
    cfg.workload.validate(cfg.platform.nr_cpus)?;
    Ok(cfg)
}

impl PlatformConfig {
    pub fn topology(&self) -> Result<Topology> {
        let groups = self.coregroups.iter()
            .map(|g| CpuMask::parse(&g.cpus))
            .collect::<Result<Vec<_>>>()?;
        Topology::new(self.nr_cpus, groups)
    }

    // PER-CPU ENERGY INPUTS, INDEXED BY CPU
    pub fn energy_data(&self) -> Result<Vec<CpuEnergyData>> {
        let mut data = vec![None; self.nr_cpus];
        for g in &self.coregroups {
            for cpu in CpuMask::parse(&g.cpus)?.iter() {
                if cpu < self.nr_cpus {
                    data[cpu] = Some(g.energy);
                }
            }
        }
        data.into_iter().enumerate()
            .map(|(cpu, d)| d.with_context(|| format!("cpu{} is in no coregroup", cpu)))
            .collect()
    }

    pub fn perf_mask(&self) -> Result<CpuMask> {
        if let Some(list) = &self.perf_cpus {
            return CpuMask::parse(list);
        }
        match self.coregroups.iter().max_by_key(|g| g.energy.mips) {
            Some(g) => CpuMask::parse(&g.cpus),
            None => Ok(CpuMask::empty()),
        }
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            bail!("nr_cpus {} out of range 1..={}", self.nr_cpus, MAX_CPUS);
        }
        if self.coregroups.is_empty() {
            bail!("no coregroup defined");
        }
        let topology = self.topology()?;

        for g in self.coregroups.iter_mut() {
            if g.energy.mips == 0 {
                bail!("coregroup {} has zero mips", g.cpus);
            }
            if let Some(b) = g.ontime {
                if !b.is_valid() {
                    warn!("coregroup {}: bad ontime boundaries {:?}, ontime disabled", g.cpus, b);
                    g.ontime = None;
                }
            }
        }

        let nr_cpus = self.nr_cpus;
        self.domains.retain(|d| match check_domain(d, &topology, nr_cpus) {
            Ok(()) => true,
            Err(e) => {
                warn!("cpufreq domain cal-id {} disabled: {:#}", d.cal_id, e);
                false
            }
        });

        let dm_types: Vec<usize> = self.domains.iter().filter_map(|d| d.dm_type).collect();
        self.dm_constraints.retain(|c| {
            let ok = dm_types.contains(&c.master) && dm_types.contains(&c.slave)
                && c.master != c.slave && !c.table.is_empty();
            if !ok {
                warn!("dm constraint {} -> {} dropped", c.master, c.slave);
            }
            ok
        });

        self.services.retain(|s| {
            let masks = [&s.light_cpus, &s.medium_cpus, &s.heavy_cpus];
            let ok = s.level > 0 && s.light_threshold <= s.heavy_threshold
                && masks.iter().all(|m| CpuMask::parse(m).is_ok());
            if !ok {
                warn!("service level {} dropped", s.level);
            }
            ok
        });

        if let Some(list) = &self.perf_cpus {
            if CpuMask::parse(list).is_err() {
                warn!("perf_cpus {:?} unparsable, using fastest coregroup", list);
                self.perf_cpus = None;
            }
        }

        if self.features.tiny_task_cpu >= self.nr_cpus {
            warn!("tiny_task_cpu {} out of range, using cpu0", self.features.tiny_task_cpu);
            self.features.tiny_task_cpu = 0;
        }

        Ok(())
    }
}

fn check_domain(d: &DomainConfig, topology: &Topology, nr_cpus: usize) -> Result<()> {
    let cpus = CpuMask::parse(&d.cpus)?;
    let first = match cpus.first() {
        Some(c) if c < nr_cpus => c,
        _ => bail!("no possible cpu in {}", d.cpus),
    };
    if cpus != topology.coregroup_of(first) {
        bail!("cpus {} do not match coregroup {}", cpus, topology.coregroup_of(first));
    }
    if d.table.is_empty() {
        bail!("empty frequency table");
    }
    if d.table.iter().any(|l| l.freq == 0 || l.volt == 0) {
        bail!("zero frequency or voltage in table");
    }
    if d.pm_qos_min_class == d.pm_qos_max_class {
        bail!("min and max pm_qos class are both {}", d.pm_qos_min_class);
    }
    Ok(())
}

impl WorkloadConfig {
    pub fn validate(&self, nr_cpus: usize) -> Result<()> {
        if self.duration_ms == 0 {
            bail!("workload duration is zero");
        }
        if self.ontime_period_ms == 0 || self.snapshot_ms == 0 {
            bail!("ontime_period_ms and snapshot_ms must be positive");
        }
        for t in &self.tasks {
            if t.period_ms == 0 || t.run_ms > t.period_ms {
                bail!("task {}: run_ms {} must be within period_ms {}", t.name, t.run_ms, t.period_ms);
            }
            if t.threads == 0 {
                bail!("task {}: zero threads", t.name);
            }
            if let Some(list) = &t.allowed {
                let mask = CpuMask::parse(list)?;
                if mask.and(CpuMask::first_n(nr_cpus)).is_empty() {
                    bail!("task {}: allowed cpus {} outside the platform", t.name, list);
                }
            }
        }
        for h in &self.hotplug {
            if h.cpu >= nr_cpus {
                bail!("hotplug event for cpu{} beyond nr_cpus {}", h.cpu, nr_cpus);
            }
        }
        Ok(())
    }
}

// --- BUILT-IN REFERENCE PLATFORM ---

fn levels(freqs: &[u64], volts: &[u64]) -> Vec<FreqLevel> {
    freqs.iter().zip(volts).map(|(&freq, &volt)| FreqLevel { freq, volt }).collect()
}

// 4 LITTLE + 2 MID + 2 BIG, THREE FREQUENCY DOMAINS
pub fn reference() -> SimConfig {
    let little = CoregroupConfig {
        cpus: "0-3".into(),
        energy: CpuEnergyData::new(1000, 40),
        ontime: Some(OntimeBoundary { upper_boundary: 60, lower_boundary: 0, ..Default::default() }),
        part_limit: 1024,
        part_boost: 0,
    };
    let mid = CoregroupConfig {
        cpus: "4-5".into(),
        energy: CpuEnergyData::new(1800, 90),
        ontime: Some(OntimeBoundary { upper_boundary: 80, lower_boundary: 30, ..Default::default() }),
        part_limit: 1024,
        part_boost: 0,
    };
    let big = CoregroupConfig {
        cpus: "6-7".into(),
        energy: CpuEnergyData::new(2600, 150),
        ontime: Some(OntimeBoundary { upper_boundary: 100, lower_boundary: 40, ..Default::default() }),
        part_limit: 1024,
        part_boost: 0,
    };

    let domain = |cal_id: u32, cpus: &str, table: Vec<FreqLevel>, min_class: usize| DomainConfig {
        cal_id,
        cpus: cpus.into(),
        table,
        min_freq: None,
        max_freq: None,
        boot_freq: None,
        resume_freq: None,
        boot_qos: None,
        pm_qos_min_class: min_class,
        pm_qos_max_class: min_class + 1,
        need_awake: cal_id != 0,
        fast_switch: true,
        governor: GovernorKind::Schedutil,
        dm_type: None,
        slack: SlackConfig { enabled: true, ..Default::default() },
    };

    let mut platform = PlatformConfig {
        nr_cpus: 8,
        coregroups: vec![little, mid, big],
        domains: vec![
            domain(0, "0-3", levels(
                &[1_950_000, 1_742_000, 1_534_000, 1_326_000, 1_053_000, 832_000, 507_000],
                &[850_000, 800_000, 750_000, 700_000, 650_000, 600_000, 550_000]), 0),
            domain(1, "4-5", levels(
                &[2_314_000, 2_002_000, 1_690_000, 1_378_000, 1_066_000, 754_000],
                &[950_000, 875_000, 800_000, 725_000, 650_000, 600_000]), 2),
            domain(2, "6-7", levels(
                &[2_730_000, 2_314_000, 1_898_000, 1_482_000, 1_066_000, 650_000],
                &[1_050_000, 950_000, 850_000, 750_000, 675_000, 600_000]), 4),
        ],
        dm_constraints: Vec::new(),
        services: vec![ServiceConfig {
            level: 1,
            light_threshold: 100,
            heavy_threshold: 500,
            light_cpus: "0-3".into(),
            medium_cpus: "4-5".into(),
            heavy_cpus: "6-7".into(),
        }],
        perf_cpus: None,
        governor: GovernorConfig::default(),
        features: FeatureConfig::default(),
        part: PartParams::default(),
        boot_boost_ms: 0,
        suspend_timeout_us: default_suspend_timeout_us(),
    };

    // BIG DRAGS MID UP WITH IT
    platform.domains[1].dm_type = Some(1);
    platform.domains[2].dm_type = Some(2);
    platform.dm_constraints.push(DmConstraintConfig {
        master: 2,
        slave: 1,
        kind: ConstraintKind::Min,
        table: vec![(2_730_000, 1_378_000), (1_898_000, 1_066_000), (1_066_000, 754_000)],
    });

    let task = |name: &str, period_ms: u64, run_ms: u64, threads: usize| TaskConfig {
        name: name.into(),
        tgid: None,
        lane: Lane::Uss,
        allowed: None,
        group: GroupAttrs::default(),
        period_ms,
        run_ms,
        start_ms: 0,
        stop_ms: None,
        iowait: false,
        threads,
        band: false,
    };

    let mut ui = task("ui", 16, 6, 2);
    ui.group.prefer_idle = true;
    ui.band = true;
    let mut game = task("game", 16, 14, 1);
    game.start_ms = 500;
    let mut audio = task("audio", 10, 1, 1);
    audio.iowait = true;

    let workload = WorkloadConfig {
        duration_ms: 3000,
        ontime_period_ms: default_ontime_period_ms(),
        snapshot_ms: default_snapshot_ms(),
        tasks: vec![ui, game, audio, task("background", 100, 8, 3)],
        boost_requests: vec![BoostRequest { at_ms: 2000, key: 1, prio: 1, until_ms: Some(2200) }],
        hotplug: Vec::new(),
        suspend_at_ms: None,
    };

    SimConfig { platform, workload }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reference_validates() {
        let mut cfg = reference();
        cfg.platform.validate().unwrap();
        cfg.workload.validate(cfg.platform.nr_cpus).unwrap();
        assert_eq!(cfg.platform.domains.len(), 3);
        let topo = cfg.platform.topology().unwrap();
        assert_eq!(topo.nr_coregroups(), 3);
        assert_eq!(cfg.platform.perf_mask().unwrap().to_string(), "6-7");
        assert_eq!(cfg.platform.dm_constraints.len(), 1);
    }

    #[test]
    fn json_round_trip_through_file() {
        let cfg = reference();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{}", serde_json::to_string(&cfg).unwrap()).unwrap();
        let back = load(f.path()).unwrap();
        assert_eq!(back.platform.nr_cpus, 8);
        assert_eq!(back.workload.tasks.len(), cfg.workload.tasks.len());
    }

    #[test]
    fn gzip_config_is_decompressed() {
        let cfg = reference();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platform.json.gz");
        let file = File::create(&path).unwrap();
        let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        enc.write_all(serde_json::to_string(&cfg).unwrap().as_bytes()).unwrap();
        enc.finish().unwrap();
        assert_eq!(load(&path).unwrap().platform.coregroups.len(), 3);
    }

    #[test]
    fn bad_domain_is_dropped_not_fatal() {
        let mut cfg = reference();
        cfg.platform.domains[1].table.clear();
        cfg.platform.domains[2].cpus = "5-7".into();
        cfg.platform.validate().unwrap();
        assert_eq!(cfg.platform.domains.len(), 1);
        assert_eq!(cfg.platform.domains[0].cal_id, 0);
        // CONSTRAINTS BETWEEN DROPPED DOMAINS GO WITH THEM
        assert!(cfg.platform.dm_constraints.is_empty());
    }

    #[test]
    fn inverted_boundaries_disable_ontime_for_group() {
        let mut cfg = reference();
        cfg.platform.coregroups[1].ontime =
            Some(OntimeBoundary { upper_boundary: 10, lower_boundary: 50, ..Default::default() });
        cfg.platform.validate().unwrap();
        assert!(cfg.platform.coregroups[1].ontime.is_none());
        assert!(cfg.platform.coregroups[0].ontime.is_some());
    }

    #[test]
    fn overlapping_coregroups_are_fatal() {
        let mut cfg = reference();
        cfg.platform.coregroups[1].cpus = "3-5".into();
        assert!(cfg.platform.validate().is_err());
    }

    #[test]
    fn malformed_document_is_error() {
        assert!(parse("{\"platform\": 3}").is_err());
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "not json").unwrap();
        assert!(load(f.path()).is_err());
    }

    #[test]
    fn task_run_longer_than_period_rejected() {
        let mut cfg = reference();
        cfg.workload.tasks[0].run_ms = 100;
        assert!(cfg.workload.validate(8).is_err());
    }
}
