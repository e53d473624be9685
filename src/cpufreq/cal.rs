// CLOCK AND POWER (CAL) INTERFACE
// THE DVFS DRIVER'S ONLY HARDWARE-FACING CALLS. `SimCal` IS THE IN-PROCESS
// CLOCK USED BY THE SIMULATOR AND TESTS: IT COUNTS WRITES AND CAN BE TOLD TO
// FAIL OR TO DRIFT.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};

use crate::config::DomainConfig;

pub trait Cal: Send + Sync {
    // 0 WHILE THE CLOCK IS CHANGING STATE
    fn get_rate(&self, cal_id: u32) -> u64;
    fn set_rate(&self, cal_id: u32, freq: u64) -> Result<()>;
    // HIGHEST FREQUENCY FIRST
    fn rate_table(&self, cal_id: u32) -> Vec<u64>;
    // VOLTAGE PER RATE_TABLE ROW, UV
    fn asv_table(&self, cal_id: u32) -> Vec<u64>;
    fn max_freq(&self, cal_id: u32) -> u64;
    fn min_freq(&self, cal_id: u32) -> u64;
    fn boot_freq(&self, cal_id: u32) -> u64;
    fn resume_freq(&self, cal_id: u32) -> u64;
    // CLUSTER LOW-POWER MODE AROUND CLOCK ACCESS
    fn set_power_mode(&self, _cal_id: u32, _enable: bool) {}
}

struct SimClock {
    rate: u64,
    levels: Vec<(u64, u64)>,
    boot: u64,
    resume: u64,
    fail_writes: u32,
    busy_reads: u32,
    power_mode_off: u32,
}

pub struct SimCal {
    clocks: Mutex<HashMap<u32, SimClock>>,
    writes: AtomicU64,
}

impl SimCal {
    pub fn new() -> Self {
        Self { clocks: Mutex::new(HashMap::new()), writes: AtomicU64::new(0) }
    }

    pub fn from_domains(domains: &[DomainConfig]) -> Self {
        let cal = Self::new();
        for d in domains {
            let levels: Vec<(u64, u64)> = d.table.iter().map(|l| (l.freq, l.volt)).collect();
            cal.add_clock(d.cal_id, &levels, d.boot_freq, d.resume_freq);
        }
        cal
    }

    // BOOTS AT `boot` (DEFAULT: TOP LEVEL). RESUME DEFAULTS TO BOOT.
    pub fn add_clock(&self, cal_id: u32, levels: &[(u64, u64)], boot: Option<u64>, resume: Option<u64>) {
        let mut levels = levels.to_vec();
        levels.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        let top = levels.first().map(|l| l.0).unwrap_or(0);
        let boot = boot.unwrap_or(top);
        let clock = SimClock {
            rate: boot,
            levels,
            boot,
            resume: resume.unwrap_or(boot),
            fail_writes: 0,
            busy_reads: 0,
            power_mode_off: 0,
        };
        if let Ok(mut clocks) = self.clocks.lock() {
            clocks.insert(cal_id, clock);
        }
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    // NEXT `n` set_rate CALLS FAIL
    pub fn fail_next_writes(&self, cal_id: u32, n: u32) {
        self.with_clock(cal_id, |c| c.fail_writes = n);
    }

    // NEXT `n` get_rate CALLS RETURN 0
    pub fn busy_next_reads(&self, cal_id: u32, n: u32) {
        self.with_clock(cal_id, |c| c.busy_reads = n);
    }

    // CHANGE THE CLOCK BEHIND THE DRIVER'S BACK
    pub fn force_rate(&self, cal_id: u32, freq: u64) {
        self.with_clock(cal_id, |c| c.rate = freq);
    }

    // NESTING DEPTH OF DISABLED LOW-POWER MODE; 0 WHEN BALANCED
    pub fn power_mode_depth(&self, cal_id: u32) -> u32 {
        self.with_clock(cal_id, |c| c.power_mode_off).unwrap_or(0)
    }

    fn with_clock<R>(&self, cal_id: u32, f: impl FnOnce(&mut SimClock) -> R) -> Option<R> {
        let mut clocks = self.clocks.lock().ok()?;
        clocks.get_mut(&cal_id).map(f)
    }
}

impl Default for SimCal {
    fn default() -> Self {
        Self::new()
    }
}

impl Cal for SimCal {
    fn get_rate(&self, cal_id: u32) -> u64 {
        self.with_clock(cal_id, |c| {
            if c.busy_reads > 0 {
                c.busy_reads -= 1;
                return 0;
            }
            c.rate
        }).unwrap_or(0)
    }

    fn set_rate(&self, cal_id: u32, freq: u64) -> Result<()> {
        let res = self.with_clock(cal_id, |c| {
            if c.fail_writes > 0 {
                c.fail_writes -= 1;
                bail!("cal{}: pll did not lock at {} kHz", cal_id, freq);
            }
            if !c.levels.iter().any(|l| l.0 == freq) {
                bail!("cal{}: {} kHz is not a table level", cal_id, freq);
            }
            c.rate = freq;
            Ok(())
        }).ok_or_else(|| anyhow!("cal{}: no such clock", cal_id))?;
        if res.is_ok() {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        res
    }

    fn rate_table(&self, cal_id: u32) -> Vec<u64> {
        self.with_clock(cal_id, |c| c.levels.iter().map(|l| l.0).collect()).unwrap_or_default()
    }

    fn asv_table(&self, cal_id: u32) -> Vec<u64> {
        self.with_clock(cal_id, |c| c.levels.iter().map(|l| l.1).collect()).unwrap_or_default()
    }

    fn max_freq(&self, cal_id: u32) -> u64 {
        self.with_clock(cal_id, |c| c.levels.first().map(|l| l.0).unwrap_or(0)).unwrap_or(0)
    }

    fn min_freq(&self, cal_id: u32) -> u64 {
        self.with_clock(cal_id, |c| c.levels.last().map(|l| l.0).unwrap_or(0)).unwrap_or(0)
    }

    fn boot_freq(&self, cal_id: u32) -> u64 {
        self.with_clock(cal_id, |c| c.boot).unwrap_or(0)
    }

    fn resume_freq(&self, cal_id: u32) -> u64 {
        self.with_clock(cal_id, |c| c.resume).unwrap_or(0)
    }

    fn set_power_mode(&self, cal_id: u32, enable: bool) {
        self.with_clock(cal_id, |c| {
            if enable {
                c.power_mode_off = c.power_mode_off.saturating_sub(1);
            } else {
                c.power_mode_off += 1;
            }
        });
    }
}
