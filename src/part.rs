// EMS PART: PERIODIC ACTIVE RATIO TRACKING
// PER-CPU HISTORY OF HOW MUCH OF EACH FIXED PERIOD THE RUNQUEUE WAS BUSY.
// THE GOVERNOR MAY SUBSTITUTE THIS DEMAND FOR THE PELT UTILIZATION WHEN
// THE LOAD IS PERIODIC AND LIGHT ENOUGH, WHICH PELT TENDS TO OVERESTIMATE.

use serde::{Deserialize, Serialize};

use crate::multi_load::{SCHED_CAPACITY_SCALE, SCHED_CAPACITY_SHIFT};

pub const PART_HIST_SIZE_MAX: usize = 10;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartPolicy {
    Recent = 0,
    Max = 1,
    MaxRecentMax = 2,
    Last = 3,
    #[default]
    MaxRecentLast = 4,
    MaxRecentAvg = 5,
}

impl PartPolicy {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Recent),
            1 => Some(Self::Max),
            2 => Some(Self::MaxRecentMax),
            3 => Some(Self::Last),
            4 => Some(Self::MaxRecentLast),
            5 => Some(Self::MaxRecentAvg),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Recent => "RECENT",
            Self::Max => "MAX",
            Self::MaxRecentMax => "MAX_RECENT_MAX",
            Self::Last => "LAST",
            Self::MaxRecentLast => "MAX_RECENT_LAST",
            Self::MaxRecentAvg => "MAX_RECENT_AVG",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartParams {
    pub policy: PartPolicy,
    pub period_size_ns: u64,
    pub hist_size: usize,
    pub high_patten_thres: u64,
    pub high_patten_stdev: u64,
    pub low_patten_count: u64,
    pub low_patten_thres: u64,
    pub low_patten_stdev: u64,
    pub boost_interval_ns: u64,
}

impl Default for PartParams {
    fn default() -> Self {
        Self {
            policy: PartPolicy::MaxRecentLast,
            period_size_ns: 8_000_000,
            hist_size: PART_HIST_SIZE_MAX,
            high_patten_thres: 700,
            high_patten_stdev: 200,
            low_patten_count: 3,
            low_patten_thres: 1024,
            low_patten_stdev: 200,
            boost_interval_ns: 16_000_000,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PartEvent {
    // IDLE -> RUNNING
    Enqueue,
    // RUNNING -> IDLE
    Dequeue,
    Update,
    WakeupNew,
}

fn int_sqrt(x: u64) -> u64 {
    if x < 2 {
        return x;
    }
    let mut r = (x as f64).sqrt() as u64;
    while r * r > x {
        r -= 1;
    }
    while (r + 1) * (r + 1) <= x {
        r += 1;
    }
    r
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ActiveRatio {
    started: bool,
    running: bool,
    period_start: u64,
    last_updated: u64,
    last_boost_time: Option<u64>,
    active_sum: u64,
    hist: [u64; PART_HIST_SIZE_MAX],
    hist_idx: usize,

    pub active_ratio_recent: u64,
    pub active_ratio_avg: u64,
    pub active_ratio_max: u64,
    pub active_ratio_est: u64,
    pub active_ratio_stdev: u64,

    // 0..=1024, SET PER COREGROUP
    pub limit: u64,
    pub boost: u64,
}

impl ActiveRatio {
    pub fn new(limit: u64, boost: u64) -> Self {
        Self { limit, boost, ..Default::default() }
    }

    pub fn start(&mut self, now: u64) {
        if self.started {
            return;
        }
        self.started = true;
        self.period_start = now;
        self.last_updated = now;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn last_hist(&self) -> u64 {
        self.hist[self.hist_idx]
    }

    fn hist_size(p: &PartParams) -> usize {
        p.hist_size.clamp(2, PART_HIST_SIZE_MAX)
    }

    fn calc_hist(&mut self, p: &PartParams) {
        let size = Self::hist_size(p);
        let hist = &self.hist[..size];

        self.active_ratio_avg = hist.iter().sum::<u64>() / size as u64;
        self.active_ratio_max = hist.iter().copied().max().unwrap_or(0);
        self.active_ratio_est = 0;
        self.active_ratio_stdev = 0;

        // PAIRS OF ADJACENT PERIODS FORM ONE PATTERN SAMPLE
        let pattens: Vec<i64> = hist.chunks(2)
            .map(|c| c.iter().sum::<u64>() as i64)
            .filter(|&s| s != 0)
            .collect();
        let p_count = pattens.len() as u64;

        let (p_avg, p_stdev) = if p_count <= 1 {
            (0, 0)
        } else {
            let avg = pattens.iter().sum::<i64>() / p_count as i64;
            let var: i64 = pattens.iter().map(|&x| (x - avg) * (x - avg)).sum::<i64>()
                / (p_count as i64 - 1);
            (avg as u64, int_sqrt(var as u64))
        };

        self.active_ratio_stdev = p_stdev;
        if p_count >= p.low_patten_count
            && p_avg <= p.low_patten_thres
            && p_stdev <= p.low_patten_stdev
        {
            self.active_ratio_est = p_avg / 2;
        }
    }

    fn push_hist(&mut self, p: &PartParams, full: bool, count: u64) {
        let size = Self::hist_size(p);
        self.hist_idx = (self.hist_idx + 1) % size;
        self.hist[self.hist_idx] = self.active_ratio_recent;

        // FULLY BUSY OR FULLY IDLE PERIODS IN BETWEEN, AT MOST ONE LAP
        for _ in 0..count.min(size as u64) {
            self.hist_idx = (self.hist_idx + 1) % size;
            self.hist[self.hist_idx] = if full { SCHED_CAPACITY_SCALE } else { 0 };
        }

        self.calc_hist(p);
    }

    fn advance(&mut self, p: &PartParams, now: u64, boost: bool) {
        if boost {
            self.last_boost_time = Some(now);
            return;
        }
        if let Some(t) = self.last_boost_time {
            if now > t + p.boost_interval_ns {
                self.last_boost_time = None;
            }
        }

        let period = p.period_size_ns.max(1);
        let elapsed = now.saturating_sub(self.period_start);
        let periods;

        if self.running {
            let end = now.min(self.period_start + period);
            self.active_sum += end.saturating_sub(self.last_updated);
            self.active_ratio_recent = (self.active_sum << SCHED_CAPACITY_SHIFT) / period;

            periods = elapsed / period;
            if periods > 0 {
                self.push_hist(p, true, periods - 1);
                self.active_sum = elapsed % period;
                self.active_ratio_recent = (self.active_sum << SCHED_CAPACITY_SHIFT) / period;
            }
        } else {
            periods = elapsed / period;
            if periods > 0 {
                self.push_hist(p, false, periods - 1);
                self.active_ratio_recent = 0;
                self.active_sum = 0;
            }
        }

        self.period_start += period * periods;
        self.last_updated = now;
    }

    // `nr_running`: RUNQUEUE LENGTH BEFORE THE EVENT
    pub fn update(&mut self, p: &PartParams, now: u64, event: PartEvent, nr_running: usize) {
        if !self.started {
            return;
        }
        match event {
            PartEvent::Enqueue => {
                self.advance(p, now, false);
                if nr_running == 0 {
                    self.running = true;
                }
            }
            PartEvent::Dequeue => {
                self.advance(p, now, false);
                if nr_running == 1 {
                    self.running = false;
                }
            }
            PartEvent::Update => self.advance(p, now, false),
            PartEvent::WakeupNew => self.advance(p, now, true),
        }
    }

    // OVERRIDE THE GOVERNOR'S (util, max) WITH THE ACTIVE-RATIO DEMAND
    pub fn cpu_active_ratio(&mut self, p: &PartParams, util: u64, max: u64, now: u64) -> (u64, u64) {
        if !self.started || max == 0 {
            return (util, max);
        }
        let util_ratio = util * SCHED_CAPACITY_SCALE / max;

        if self.last_boost_time.is_some() && util_ratio < self.boost {
            return (self.boost, SCHED_CAPACITY_SCALE);
        }
        if util_ratio > self.limit {
            return (util, max);
        }
        if !self.running
            && (self.active_ratio_avg < p.high_patten_thres
                || self.active_ratio_stdev > p.high_patten_stdev)
        {
            return (0, SCHED_CAPACITY_SCALE);
        }

        self.advance(p, now, false);

        let demand = match p.policy {
            PartPolicy::Recent => self.active_ratio_recent,
            PartPolicy::Max => self.active_ratio_max,
            PartPolicy::MaxRecentMax => self.active_ratio_recent.max(self.active_ratio_max),
            PartPolicy::Last => self.last_hist(),
            PartPolicy::MaxRecentLast => self.active_ratio_recent.max(self.last_hist()),
            PartPolicy::MaxRecentAvg => self.active_ratio_recent.max(self.active_ratio_avg),
        };

        let part_util = demand.max(self.active_ratio_est).min(self.limit);
        if util_ratio > part_util {
            (util, max)
        } else {
            (part_util, SCHED_CAPACITY_SCALE)
        }
    }
}
