// EMS MULTI-LOAD TRACKER
// PELT-STYLE DECAYED LOAD ACCOUNTING, SPLIT INTO LANES.
//
// ONE PERIOD IS 1024US (~1MS). EACH CROSSED PERIOD DECAYS THE SUMS BY
// y WHERE y^32 = 0.5. A TASK CONTRIBUTES TO EXACTLY ONE LANE OF ITS CPU;
// THE CPU KEEPS ONE SUM PER LANE, EACH SCALED BY THAT LANE'S CAPACITY.

use serde::{Deserialize, Serialize};

pub const SCHED_CAPACITY_SHIFT: u32 = 10;
pub const SCHED_CAPACITY_SCALE: u64 = 1 << SCHED_CAPACITY_SHIFT;

pub const LOAD_AVG_PERIOD: u64 = 32;
pub const LOAD_AVG_MAX: u64 = 47742;
const PERIOD_US: u64 = 1024;

// util_est.enqueued LSB: PELT NOT UPDATED SINCE LAST ENQUEUE
pub const UTIL_AVG_UNCHANGED: u64 = 0x1;
const UTIL_EST_WEIGHT_SHIFT: u32 = 2;

pub const NR_LANES: usize = 2;
pub type LaneVec = [u64; NR_LANES];

// (2^32 - 1) * y^n, n = 0..31
const RUNNABLE_AVG_Y_INV: [u32; LOAD_AVG_PERIOD as usize] = [
    0xffffffff, 0xfa83b2da, 0xf5257d14, 0xefe4b99a, 0xeac0c6e6, 0xe5b906e6,
    0xe0ccdeeb, 0xdbfbb796, 0xd744fcc9, 0xd2a81d91, 0xce248c14, 0xc9b9bd85,
    0xc5672a10, 0xc12c4cc9, 0xbd08a39e, 0xb8fbaf46, 0xb504f333, 0xb123f581,
    0xad583ee9, 0xa9a15ab4, 0xa5fed6a9, 0xa2704302, 0x9ef5325f, 0x9b8d39b9,
    0x9837f050, 0x94f4efa8, 0x91c3d373, 0x8ea4398a, 0x8b95c1e3, 0x88980e80,
    0x85aac367, 0x82cd8698,
];

// LANE

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    #[default]
    Uss = 0,
    Sse = 1,
}

impl Lane {
    pub const ALL: [Lane; NR_LANES] = [Lane::Uss, Lane::Sse];

    pub fn idx(self) -> usize {
        self as usize
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Lane::Sse,
            _ => Lane::Uss,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Lane::Uss => "USS",
            Lane::Sse => "SSE",
        }
    }
}

// --- DECAY ARITHMETIC ---

// val * y^n
pub fn decay_load(mut val: u64, mut n: u64) -> u64 {
    if n > LOAD_AVG_PERIOD * 63 {
        return 0;
    }
    if n >= LOAD_AVG_PERIOD {
        val >>= n / LOAD_AVG_PERIOD;
        n %= LOAD_AVG_PERIOD;
    }
    ((val as u128 * RUNNABLE_AVG_Y_INV[n as usize] as u128) >> 32) as u64
}

// d1: REMAINDER OF THE FIRST (PARTIAL) PERIOD, DECAYED `periods` TIMES
// c2: THE FULL PERIODS IN BETWEEN
// d3: THE INCOMPLETE CURRENT PERIOD, UNDECAYED
pub fn accumulate_segments(periods: u64, d1: u64, d3: u64) -> u64 {
    let c1 = decay_load(d1, periods);
    let c2 = LOAD_AVG_MAX - decay_load(LOAD_AVG_MAX, periods) - PERIOD_US;
    c1 + c2 + d3
}

fn divider(period_contrib: u32) -> u64 {
    LOAD_AVG_MAX - PERIOD_US + period_contrib as u64
}

pub struct Step {
    pub periods: u64,
    pub contrib: u64,
}

// ADVANCE THE CLOCK OF ONE SIGNAL SET. RETURNS NONE WHEN LESS THAN 1US
// ELAPSED OR THE CLOCK WENT BACKWARDS.
fn advance(last_update_time: &mut u64, period_contrib: &mut u32,
           now: u64, scale_freq: u64) -> Option<Step> {
    if now < *last_update_time {
        *last_update_time = now;
        return None;
    }
    let delta = (now - *last_update_time) >> 10;
    if delta == 0 {
        return None;
    }
    *last_update_time += delta << 10;

    let mut contrib = delta;
    let mut delta = delta + *period_contrib as u64;
    let periods = delta / PERIOD_US;
    if periods > 0 {
        delta %= PERIOD_US;
        contrib = accumulate_segments(periods, PERIOD_US - *period_contrib as u64, delta);
    }
    *period_contrib = delta as u32;
    contrib = (contrib * scale_freq) >> SCHED_CAPACITY_SHIFT;

    Some(Step { periods, contrib })
}

fn sub_positive(v: &mut u64, d: u64) {
    *v = v.saturating_sub(d);
}

// abs(value) < margin, KERNEL FORMULATION
pub fn within_margin(value: i64, margin: i64) -> bool {
    ((value + margin - 1) as u32) < ((2 * margin - 1) as u32)
}

// SCHEDTUNE BOOST MARGIN: POSITIVE BOOST ADDS A SHARE OF THE HEADROOM,
// NEGATIVE BOOST REMOVES A SHARE OF THE SIGNAL
pub fn schedtune_margin(capacity: u64, signal: u64, boost: i32) -> i64 {
    if signal >= capacity {
        return 0;
    }
    if boost >= 0 {
        ((capacity - signal) as i64 * boost as i64) / 100
    } else {
        -((signal as i64 * -(boost as i64)) / 100)
    }
}

pub fn apply_margin(signal: u64, margin: i64) -> u64 {
    if margin >= 0 {
        signal + margin as u64
    } else {
        signal.saturating_sub(margin.unsigned_abs())
    }
}

// --- TASK SIDE ---

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UtilEst {
    pub enqueued: u64,
    pub ewma: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TaskLoad {
    // 0 MEANS DETACHED FROM ANY CPU
    pub last_update_time: u64,
    pub period_contrib: u32,
    pub runnable_sum: u64,
    pub runnable_avg: u64,
    pub util_sum: u64,
    pub util_avg: u64,
    pub util_est: UtilEst,
}

impl TaskLoad {
    // FORKED TASKS INHERIT HALF THE PARENT'S RUNNABLE; UTIL STARTS EMPTY
    pub fn forked(parent: Option<&TaskLoad>) -> Self {
        let (runnable_sum, runnable_avg) = match parent {
            Some(p) => (p.runnable_sum >> 1, p.runnable_avg >> 1),
            None => (0, 0),
        };
        Self {
            last_update_time: 0,
            period_contrib: 1023,
            runnable_sum,
            runnable_avg,
            ..Default::default()
        }
    }

    // SEED A FRESH TASK FROM THE CPU IT LANDS ON: ITS SHARE OF THE CURRENT
    // LOAD, CAPPED AT HALF THE SPARE CAPACITY
    pub fn post_init(&mut self, cpu_util: u64, nr_running: usize, capacity: u64) {
        let cap = capacity.saturating_sub(cpu_util) / 2;
        if cap == 0 {
            return;
        }
        let util = if cpu_util > 0 {
            (cpu_util / (nr_running as u64 + 1)).min(cap)
        } else {
            cap
        };
        self.util_avg = util;
        self.util_sum = util * divider(self.period_contrib);
    }

    pub fn is_attached(&self) -> bool {
        self.last_update_time != 0
    }

    // RETURNS TRUE WHEN AT LEAST ONE PERIOD WAS CROSSED
    pub fn update(&mut self, now: u64, scale_freq: u64, scale_cpu: u64,
                  runnable: bool, running: bool) -> bool {
        let step = match advance(&mut self.last_update_time, &mut self.period_contrib,
                                 now, scale_freq) {
            Some(s) => s,
            None => return false,
        };

        if step.periods > 0 {
            self.util_sum = decay_load(self.util_sum, step.periods);
            self.runnable_sum = decay_load(self.runnable_sum, step.periods);
        }
        if running {
            self.util_sum += step.contrib * scale_cpu;
        }
        if runnable {
            self.runnable_sum += step.contrib * scale_cpu;
        }
        if step.periods == 0 {
            return false;
        }

        let div = divider(self.period_contrib);
        self.util_avg = self.util_sum / div;
        self.runnable_avg = self.runnable_sum / div;

        // util_avg MOVED: THE NEXT DEQUEUE MAY SAMPLE IT
        self.util_est.enqueued &= !UTIL_AVG_UNCHANGED;
        true
    }

    // max(ewma, enqueued) WHEN util_est IS ON, ELSE PLAIN UTIL
    pub fn util_est_raw(&self, util_est_enabled: bool) -> u64 {
        if util_est_enabled {
            self.util_est.ewma.max(self.util_est.enqueued)
        } else {
            self.util_avg
        }
    }

    pub fn util_est(&self, util_est_enabled: bool) -> u64 {
        if util_est_enabled {
            self.util_avg.max(self.util_est_raw(true))
        } else {
            self.util_avg
        }
    }

    // SAMPLE util_avg INTO THE EWMA AT THE END OF AN ACTIVATION
    pub fn util_est_dequeue(&mut self, task_sleep: bool, enabled: bool, capacity_orig: u64) {
        if !task_sleep || !enabled {
            return;
        }
        if self.util_est.enqueued & UTIL_AVG_UNCHANGED != 0 {
            return;
        }

        let enqueued = self.util_avg | UTIL_AVG_UNCHANGED;
        let last_ewma_diff = enqueued as i64 - self.util_est.ewma as i64;
        if within_margin(last_ewma_diff, (capacity_orig / 100) as i64) {
            return;
        }

        let ewma = ((self.util_est.ewma as i64) << UTIL_EST_WEIGHT_SHIFT) + last_ewma_diff;
        self.util_est = UtilEst {
            enqueued,
            ewma: (ewma.max(0) as u64) >> UTIL_EST_WEIGHT_SHIFT,
        };
    }
}

// --- CPU SIDE ---

#[derive(Clone, Copy, Debug, Default)]
pub struct CpuLoad {
    pub last_update_time: u64,
    pub period_contrib: u32,
    pub util_sum: LaneVec,
    pub util_avg: LaneVec,
    // SUM OF ENQUEUED TASKS' ESTIMATES, FLAG BIT INCLUDED
    pub util_est: LaneVec,
    removed: LaneVec,
}

impl CpuLoad {
    pub fn new(now: u64) -> Self {
        Self {
            last_update_time: now,
            ..Default::default()
        }
    }

    // `running`: LANE OF THE CURRENTLY RUNNING TASK, NONE WHEN IDLE
    pub fn update(&mut self, now: u64, scale_freq: u64, scale_cpu: u64,
                  running: Option<Lane>) -> bool {
        self.apply_removed();

        let step = match advance(&mut self.last_update_time, &mut self.period_contrib,
                                 now, scale_freq) {
            Some(s) => s,
            None => return false,
        };

        if step.periods > 0 {
            for sum in self.util_sum.iter_mut() {
                *sum = decay_load(*sum, step.periods);
            }
        }
        if let Some(lane) = running {
            self.util_sum[lane.idx()] += step.contrib * scale_cpu;
        }
        if step.periods == 0 {
            return false;
        }

        let div = divider(self.period_contrib);
        for lane in Lane::ALL {
            self.util_avg[lane.idx()] = self.util_sum[lane.idx()] / div;
        }
        true
    }

    pub fn attach(&mut self, lane: Lane, task: &TaskLoad) {
        self.util_avg[lane.idx()] += task.util_avg;
        self.util_sum[lane.idx()] += task.util_sum;
    }

    pub fn detach(&mut self, lane: Lane, task: &TaskLoad) {
        sub_positive(&mut self.util_avg[lane.idx()], task.util_avg);
        sub_positive(&mut self.util_sum[lane.idx()], task.util_sum);
    }

    // DEFERRED DETACH, FOLDED IN ON THE NEXT UPDATE
    pub fn remove(&mut self, lane: Lane, task: &TaskLoad) {
        self.removed[lane.idx()] += task.util_avg;
    }

    pub fn apply_removed(&mut self) {
        for lane in Lane::ALL {
            let r = std::mem::take(&mut self.removed[lane.idx()]);
            if r == 0 {
                continue;
            }
            sub_positive(&mut self.util_avg[lane.idx()], r);
            sub_positive(&mut self.util_sum[lane.idx()], r * LOAD_AVG_MAX);
        }
    }

    pub fn util_est_enqueue(&mut self, lane: Lane, task_est_raw: u64) {
        self.util_est[lane.idx()] += task_est_raw | UTIL_AVG_UNCHANGED;
    }

    // `nr_running`: TASKS LEFT ON THE RUNQUEUE AFTER THIS DEQUEUE
    pub fn util_est_dequeue(&mut self, lane: Lane, task_est_raw: u64, nr_running: usize) {
        let slot = &mut self.util_est[lane.idx()];
        if nr_running == 0 {
            *slot = 0;
        } else {
            sub_positive(slot, task_est_raw | UTIL_AVG_UNCHANGED);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    #[test]
    fn decay_halves_every_32_periods() {
        assert_eq!(decay_load(1024, 0), 1023);
        let half = decay_load(1 << 20, 32);
        assert_eq!(half, (1 << 19) - 1);
        assert_eq!(decay_load(u32::MAX as u64, 63 * 32 + 1), 0);
        // MONOTONE IN n
        let mut last = u64::MAX;
        for n in 0..200 {
            let v = decay_load(47742 * 1024, n);
            assert!(v <= last);
            last = v;
        }
    }

    #[test]
    fn accumulated_segments_bounded_by_load_avg_max() {
        let c = accumulate_segments(5000, 1024, 0);
        assert!(c <= LOAD_AVG_MAX);
        assert!(c >= LOAD_AVG_MAX - 1024);
    }

    #[test]
    fn always_running_task_saturates() {
        let mut t = TaskLoad::forked(None);
        t.last_update_time = 1;
        let mut now = 1;
        for _ in 0..1000 {
            now += MS;
            t.update(now, 1024, 1024, true, true);
        }
        assert!(t.util_avg >= 1000, "util_avg {}", t.util_avg);
        assert!(t.util_avg <= 1024);
        assert!(t.runnable_avg >= t.util_avg);
    }

    #[test]
    fn lane_capacity_scales_ceiling() {
        let mut t = TaskLoad::forked(None);
        t.last_update_time = 1;
        let mut now = 1;
        for _ in 0..1000 {
            now += MS;
            t.update(now, 1024, 512, true, true);
        }
        assert!(t.util_avg <= 512);
        assert!(t.util_avg >= 490);
    }

    #[test]
    fn idle_interval_never_increases_util() {
        let mut t = TaskLoad::forked(None);
        t.last_update_time = 1;
        let mut now = 1;
        for _ in 0..50 {
            now += MS;
            t.update(now, 1024, 1024, true, true);
        }
        let mut prev = t.util_avg;
        for step in [1u64, 2, 5, 40, 400] {
            now += step * MS;
            t.update(now, 1024, 1024, false, false);
            assert!(t.util_avg <= prev);
            prev = t.util_avg;
        }
        assert!(prev < 10);
    }

    #[test]
    fn sub_period_update_does_not_publish() {
        let mut t = TaskLoad::forked(None);
        t.last_update_time = 1;
        t.period_contrib = 0;
        assert!(!t.update(1 + 500 * 1024, 1024, 1024, true, true));
        assert_eq!(t.util_avg, 0);
        assert!(t.util_sum > 0);
    }

    #[test]
    fn fork_inherits_half_runnable() {
        let parent = TaskLoad { runnable_sum: 1000, runnable_avg: 300, util_avg: 200, ..Default::default() };
        let child = TaskLoad::forked(Some(&parent));
        assert_eq!(child.runnable_avg, 150);
        assert_eq!(child.runnable_sum, 500);
        assert_eq!(child.util_avg, 0);
        assert_eq!(child.period_contrib, 1023);
        assert!(!child.is_attached());
    }

    #[test]
    fn post_init_caps_at_half_spare() {
        let mut t = TaskLoad::forked(None);
        t.post_init(0, 0, 1024);
        assert_eq!(t.util_avg, 512);

        let mut t = TaskLoad::forked(None);
        t.post_init(900, 1, 1024);
        assert_eq!(t.util_avg, 62);
    }

    #[test]
    fn attach_detach_conserve() {
        let mut cpu = CpuLoad::new(1);
        cpu.util_avg = [300, 40];
        cpu.util_sum = [300 * 47000, 40 * 47000];
        let t = TaskLoad { util_avg: 120, util_sum: 120 * 47000, ..Default::default() };
        cpu.attach(Lane::Sse, &t);
        assert_eq!(cpu.util_avg, [300, 160]);
        cpu.detach(Lane::Sse, &t);
        assert_eq!(cpu.util_avg, [300, 40]);
        // OVER-DETACH CLAMPS AT ZERO
        cpu.detach(Lane::Sse, &t);
        assert_eq!(cpu.util_avg[1], 0);
    }

    #[test]
    fn removed_applied_on_next_update() {
        let mut cpu = CpuLoad::new(1);
        cpu.util_avg = [400, 0];
        cpu.util_sum = [400 * LOAD_AVG_MAX, 0];
        let t = TaskLoad { util_avg: 100, ..Default::default() };
        cpu.remove(Lane::Uss, &t);
        assert_eq!(cpu.util_avg[0], 400);
        cpu.update(1, 1024, 0, None);
        assert_eq!(cpu.util_avg[0], 300);
        assert_eq!(cpu.util_sum[0], 300 * LOAD_AVG_MAX);
    }

    #[test]
    fn cpu_running_lane_accumulates_only_its_lane() {
        let mut cpu = CpuLoad::new(1);
        let mut now = 1;
        for _ in 0..200 {
            now += MS;
            cpu.update(now, 1024, 900, Some(Lane::Sse));
        }
        assert_eq!(cpu.util_avg[Lane::Uss.idx()], 0);
        assert!(cpu.util_avg[Lane::Sse.idx()] > 700);
    }

    #[test]
    fn within_margin_matches_abs() {
        for v in -30i64..30 {
            assert_eq!(within_margin(v, 10), v.abs() < 10, "v={}", v);
        }
    }

    #[test]
    fn util_est_ewma_quarter_weight() {
        let mut t = TaskLoad { util_avg: 400, ..Default::default() };
        t.util_est_dequeue(true, true, 1024);
        // ewma = (0*4 + 401) >> 2
        assert_eq!(t.util_est.enqueued, 401);
        assert_eq!(t.util_est.ewma, 100);

        // UNCHANGED FLAG SET: NO SECOND SAMPLE
        t.util_est_dequeue(true, true, 1024);
        assert_eq!(t.util_est.ewma, 100);
    }

    #[test]
    fn util_est_skips_small_moves_and_migrations() {
        let mut t = TaskLoad { util_avg: 400, util_est: UtilEst { enqueued: 0, ewma: 395 }, ..Default::default() };
        t.util_est_dequeue(true, true, 1024);
        assert_eq!(t.util_est.ewma, 395);

        let mut t = TaskLoad { util_avg: 400, ..Default::default() };
        t.util_est_dequeue(false, true, 1024);
        assert_eq!(t.util_est, UtilEst::default());
    }

    #[test]
    fn cpu_util_est_aggregate() {
        let mut cpu = CpuLoad::new(1);
        cpu.util_est_enqueue(Lane::Uss, 200);
        cpu.util_est_enqueue(Lane::Uss, 100);
        assert_eq!(cpu.util_est[0], 201 + 101);
        cpu.util_est_dequeue(Lane::Uss, 200, 1);
        assert_eq!(cpu.util_est[0], 101);
        cpu.util_est_dequeue(Lane::Uss, 100, 0);
        assert_eq!(cpu.util_est[0], 0);
    }

    #[test]
    fn schedtune_margin_signs() {
        assert_eq!(schedtune_margin(1024, 24, 10), 100);
        assert_eq!(schedtune_margin(1024, 500, -10), -50);
        assert_eq!(schedtune_margin(1024, 1024, 50), 0);
        assert_eq!(apply_margin(500, -50), 450);
    }
}
