// EMS EVENT LOG
// RECORDS PER-INTERVAL SNAPSHOTS DURING A SIMULATION RUN
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION WHILE RECORDING.
// WRAPS AROUND AT CAPACITY: OLDEST ENTRIES OVERWRITTEN.

use serde::Serialize;

pub const MAX_SNAPSHOTS: usize = 8192;
pub const MAX_DOMAINS: usize = 8;

// COUNTERS ARE DELTAS OVER THE INTERVAL ENDING AT ts_ns
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub ts_ns: u64,
    pub wakeups: u64,
    pub wake_migrations: u64,
    pub ontime_migrations: u64,
    pub balance_pulls: u64,
    pub freq_commits: u64,
    // SUM OF CPU UTILIZATION AT THE SAMPLE POINT
    pub util: u64,
    pub nr_running: u64,
    // ESTIMATED ENERGY OVER THE INTERVAL, MODEL UNITS
    pub energy: u64,
    pub nr_domains: usize,
    pub freq_khz: [u64; MAX_DOMAINS],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub samples: usize,
    pub elapsed_ns: u64,
    pub wakeups: u64,
    pub wake_migrations: u64,
    pub ontime_migrations: u64,
    pub balance_pulls: u64,
    pub freq_commits: u64,
    pub energy: u64,
    pub peak_util: u64,
}

pub struct EventLog {
    snapshots: Vec<Snapshot>,
    head: usize,
    len: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SNAPSHOTS)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            snapshots: vec![Snapshot::default(); cap.max(1)],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn cap(&self) -> usize {
        self.snapshots.len()
    }

    // OVERWRITES OLDEST ENTRY WHEN FULL
    pub fn record(&mut self, s: Snapshot) {
        let cap = self.cap();
        self.snapshots[self.head] = s;
        self.head = (self.head + 1) % cap;
        if self.len < cap {
            self.len += 1;
        }
    }

    pub fn wrapped(&self) -> bool {
        self.len == self.cap()
    }

    // CHRONOLOGICAL ORDER
    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        let cap = self.cap();
        let start = if self.len < cap { 0 } else { self.head };
        (0..self.len).map(move |i| &self.snapshots[(start + i) % cap])
    }

    pub fn last(&self) -> Option<&Snapshot> {
        self.iter().last()
    }

    pub fn totals(&self) -> Totals {
        let mut t = Totals { samples: self.len, ..Default::default() };
        let mut first = None;
        for s in self.iter() {
            first.get_or_insert(s.ts_ns);
            t.elapsed_ns = s.ts_ns - first.unwrap_or(s.ts_ns);
            t.wakeups += s.wakeups;
            t.wake_migrations += s.wake_migrations;
            t.ontime_migrations += s.ontime_migrations;
            t.balance_pulls += s.balance_pulls;
            t.freq_commits += s.freq_commits;
            t.energy += s.energy;
            t.peak_util = t.peak_util.max(s.util);
        }
        t
    }

    // DUMP THE TIME SERIES AFTER EXECUTION
    pub fn dump(&self) {
        let mut iter = self.iter();
        let first = match iter.next() {
            Some(s) => s,
            None => return,
        };
        let base_ts = first.ts_ns;

        let mut header = format!("\n{:<10} {:<8} {:<8} {:<8} {:<8} {:<8} {:<8} {:<10}",
            "TIME_S", "WAKE", "WMIG", "ONTIME", "PULL", "COMMIT", "UTIL", "ENERGY");
        for d in 0..first.nr_domains.min(MAX_DOMAINS) {
            header.push_str(&format!(" {:<10}", format!("D{}_KHZ", d)));
        }
        println!("{}", header);
        println!("{}", "-".repeat(header.len().saturating_sub(1)));

        for s in std::iter::once(first).chain(iter) {
            let elapsed_s = (s.ts_ns - base_ts) as f64 / 1_000_000_000.0;
            let mut line = format!("{:<10.3} {:<8} {:<8} {:<8} {:<8} {:<8} {:<8} {:<10}",
                elapsed_s, s.wakeups, s.wake_migrations, s.ontime_migrations,
                s.balance_pulls, s.freq_commits, s.util, s.energy);
            for f in s.freq_khz.iter().take(s.nr_domains.min(MAX_DOMAINS)) {
                line.push_str(&format!(" {:<10}", f));
            }
            println!("{}", line);
        }

        if self.wrapped() {
            println!("\n(RING BUFFER WRAPPED, SHOWING MOST RECENT {} SNAPSHOTS)", self.cap());
        }
        println!("TOTAL SNAPSHOTS: {}", self.len);
    }

    pub fn summary(&self) {
        if self.len < 2 {
            return;
        }
        let t = self.totals();
        let elapsed_s = t.elapsed_ns as f64 / 1_000_000_000.0;

        println!("\n{}", "=".repeat(50));
        println!("EMS SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  TOTAL WAKEUPS:     {}", t.wakeups);
        println!("  WAKE MIGRATIONS:   {}", t.wake_migrations);
        println!("  ONTIME MIGRATIONS: {}", t.ontime_migrations);
        println!("  BALANCE PULLS:     {}", t.balance_pulls);
        println!("  FREQ COMMITS:      {}", t.freq_commits);
        println!("  PEAK UTIL:         {}", t.peak_util);
        println!("  ENERGY:            {}", t.energy);
        if elapsed_s > 0.0 {
            println!("  AVG WAKEUPS/S:     {:.0}", t.wakeups as f64 / elapsed_s);
            let mig_pct = t.wake_migrations as f64 / t.wakeups.max(1) as f64 * 100.0;
            println!("  WAKE MIGRATE RATE: {:.1}%", mig_pct);
        }
        println!("  ELAPSED:           {:.3}s", elapsed_s);
        println!("  SAMPLES:           {}", t.samples);
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
