// EMS RUNTIME TESTS
// DVFS DRIVER AND GOVERNOR ON THE SIMULATED CLOCKS, SCHEDULER LOAD
// CONSERVATION, CONFIG FILES THROUGH A FULL SIMULATION RUN
//
// EVERYTHING IS BUILT FROM THE BUILT-IN REFERENCE PLATFORM:
//   CPU 0-3  LITTLE (DOMAIN 0, 507 .. 1950 MHz)
//   CPU 4-5  MID    (DOMAIN 1)
//   CPU 6-7  BIG    (DOMAIN 2)

use std::fs::File;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use ems::cli::check::check_config;
use ems::cli::table::boot_platform;
use ems::config::{self, GovernorConfig, PlatformConfig};
use ems::cpufreq::acme::Acme;
use ems::cpufreq::cal::SimCal;
use ems::cpufreq::pm_qos::PmQos;
use ems::cpufreq::schedutil::{Schedutil, UtilSource};
use ems::cpufreq::Relation;
use ems::multi_load::Lane;
use ems::platform::Platform;
use ems::sched::{NewTask, SchedulerState, TaskState};
use ems::sim::Simulation;
use ems::topology::CpuMask;
use ems::tuning::Tunables;
use ems::view::GroupAttrs;

const MS: u64 = 1_000_000;

fn reference_platform() -> PlatformConfig {
    let mut cfg = config::reference().platform;
    cfg.validate().unwrap();
    cfg
}

struct Stack {
    cal: Arc<SimCal>,
    qos: Arc<PmQos>,
    platform: Arc<Platform>,
    acme: Arc<Acme>,
}

fn dvfs_stack(cfg: &PlatformConfig) -> Stack {
    let cal = Arc::new(SimCal::from_domains(&cfg.domains));
    let qos = Arc::new(PmQos::new());
    let platform = Arc::new(Platform::from_config(cfg).unwrap());
    let acme = Acme::init(cfg, cal.clone(), qos.clone(), platform.clone()).unwrap();
    acme.release_boot_qos().unwrap();
    Stack { cal, qos, platform, acme }
}

// FIXED PER-CPU UTILIZATION, FULL-SCALE CAPACITY
struct Fixed {
    util: Mutex<Vec<u64>>,
}

impl Fixed {
    fn new() -> Self {
        Self { util: Mutex::new(vec![0; 8]) }
    }

    fn set(&self, cpu: usize, util: u64) {
        self.util.lock().unwrap()[cpu] = util;
    }
}

impl UtilSource for Fixed {
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
    fn is_active(&self, _cpu: usize) -> bool {
        true
    }
    fn is_boosted(&self, _cpu: usize) -> bool {
        false
    }
}

fn pinned(name: &str, allowed: &str) -> NewTask {
    NewTask {
        name: name.into(),
        tgid: None,
        lane: Lane::Uss,
        allowed: CpuMask::parse(allowed).unwrap(),
        group: GroupAttrs::default(),
        parent: None,
        iowait: false,
    }
}

// === DVFS DRIVER ===

#[test]
fn repeated_target_is_one_clock_write() {
    let cfg = reference_platform();
    let s = dvfs_stack(&cfg);
    let before = s.cal.writes();

    // LOWEST LEVEL AT OR ABOVE 1.4 GHZ
    s.acme.target(0, 1_400_000, Relation::L).unwrap();
    assert_eq!(s.acme.cur_freq(0), 1_534_000);

    // SAME RESOLVED LEVEL FROM BOTH DIRECTIONS
    s.acme.target(0, 1_400_000, Relation::L).unwrap();
    s.acme.target(0, 1_600_000, Relation::H).unwrap();
    assert_eq!(s.acme.cur_freq(0), 1_534_000);
    assert_eq!(s.cal.writes(), before + 1);
    assert_eq!(s.acme.get_freq(0), 1_534_000);
}

#[test]
fn min_qos_floor_lifts_running_clock() {
    let cfg = reference_platform();
    let s = dvfs_stack(&cfg);
    s.acme.target(0, 507_000, Relation::L).unwrap();
    assert_eq!(s.acme.cur_freq(0), 507_000);

    let floor = s.qos.add_request(0, 1_326_000).unwrap();
    assert_eq!(s.acme.cur_freq(0), 1_326_000);
    s.qos.remove_request(floor).unwrap();
    s.acme.target(0, 507_000, Relation::L).unwrap();
    assert_eq!(s.acme.cur_freq(0), 507_000);
}

#[test]
fn lowered_clock_scales_capacity() {
    let cfg = reference_platform();
    let s = dvfs_stack(&cfg);
    assert_eq!(s.platform.freq_scale(0), 1024);
    s.acme.target(0, 1_053_000, Relation::L).unwrap();
    assert_eq!(s.platform.freq_scale(0), (1_053_000u64 << 10) / 1_950_000);
    // OTHER DOMAINS UNTOUCHED
    assert_eq!(s.platform.freq_scale(6), 1024);
}

// === GOVERNOR RATE LIMIT ===

#[test]
fn up_rate_limit_holds_second_spike() {
    let cfg = reference_platform();
    let s = dvfs_stack(&cfg);
    let gcfg = GovernorConfig { up_rate_limit_us: 8000, down_rate_limit_us: 1000, iowait_boost: false };
    let gov = Schedutil::new(0, s.acme.clone(), s.qos.clone(), s.platform.clone(),
                             &gcfg, &cfg.domains[0].slack).unwrap();
    gov.start().unwrap();
    let src = Fixed::new();

    src.set(0, 100);
    gov.update(&src, 0, 50 * MS, 0);
    assert_eq!(s.acme.cur_freq(0), 507_000);

    // FIRST SPIKE GOES THROUGH
    let t = 100 * MS;
    src.set(0, 600);
    gov.update(&src, 0, t, 0);
    assert_eq!(s.acme.cur_freq(0), 1_534_000);

    // SECOND SPIKE 3 MS LATER IS HELD
    src.set(0, 1024);
    gov.update(&src, 0, t + 3 * MS, 0);
    assert_eq!(s.acme.cur_freq(0), 1_534_000);
    assert_eq!(gov.stats().rate_limited, 1);

    // 9 MS AFTER THE FIRST CHANGE IT IS ALLOWED
    gov.update(&src, 0, t + 9 * MS, 0);
    assert_eq!(s.acme.cur_freq(0), 1_950_000);
    assert!(gov.stats().commits >= 3);
    gov.stop();
}

// === LOAD CONSERVATION ===

#[test]
fn idle_pull_conserves_cpu_util() {
    let cfg = reference_platform();
    let (platform, _acme) = boot_platform(&cfg).unwrap();
    let tunables = Arc::new(Tunables::from_features(&cfg.features));
    let s = SchedulerState::new(&cfg, platform, tunables, MS).unwrap();
    let sum = |s: &SchedulerState| -> u64 {
        (0..s.nr_cpus()).map(|c| s.cpu_view(c).unwrap().util_avg[Lane::Uss.idx()]).sum()
    };

    let a = s.fork(pinned("a", "4"), MS).unwrap();
    let b = s.fork(pinned("b", "4"), MS).unwrap();
    let mut now = MS;
    for _ in 0..40 {
        now += MS;
        s.tick(4, now).unwrap();
    }
    // EVEN NUMBER OF ROTATIONS: a RUNS, b WAITS
    assert_eq!(s.runqueue(4), (Some(a), vec![b]));
    s.set_affinity(b, CpuMask::parse("4-5").unwrap(), now).unwrap();

    let before = sum(&s);
    assert!(before > 0);
    assert_eq!(s.idle_balance(5, now).unwrap(), Some(b));
    assert_eq!(sum(&s), before);
    assert_eq!(s.task(b).unwrap().cpu, 5);
    assert_eq!(s.task(b).unwrap().state, TaskState::Running);
    assert_eq!(s.stats().balance_pulls, 1);

    // NOTHING LEFT TO PULL
    assert_eq!(s.idle_balance(5, now).unwrap(), None);
}

// === CONFIG FILE TO FULL RUN ===

#[test]
fn gzipped_document_drives_a_run() {
    let mut cfg = config::reference();
    cfg.workload.duration_ms = 200;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reference.json.gz");
    let file = File::create(&path).unwrap();
    let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    enc.write_all(serde_json::to_string(&cfg).unwrap().as_bytes()).unwrap();
    enc.finish().unwrap();

    let loaded = config::load(&path).unwrap();
    assert_eq!(loaded.workload.duration_ms, 200);
    assert!(check_config(&loaded).unwrap());

    let mut sim = Simulation::new(loaded).unwrap();
    let report = sim.run(&AtomicBool::new(false)).unwrap();
    assert!(!report.interrupted);
    assert_eq!(report.elapsed_ms, 200);
    // ui x2, audio, background x3; game starts later
    assert_eq!(report.sched.forks, 6);
    assert!(report.sched.wakeups > 0);
    assert_eq!(sim.log().len(), 2);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["elapsed_ms"], 200);
    assert!(json["governors"].as_array().map(|g| !g.is_empty()).unwrap_or(false));
}
