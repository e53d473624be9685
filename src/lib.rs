// EMS -- ENERGY-AWARE MULTI-CLUSTER SCHEDULING
// PURE SCHEDULING AND DVFS LOGIC; THE BINARY ONLY WIRES IT TO A CLI.

pub mod band;
pub mod boost;
pub mod config;
pub mod cpufreq;
pub mod energy;
pub mod event;
pub mod logging;
pub mod multi_load;
pub mod notifier;
pub mod ontime;
pub mod part;
pub mod placement;
pub mod platform;
pub mod sched;
pub mod service;
pub mod sim;
pub mod stop;
pub mod topology;
pub mod tuning;
pub mod view;

pub mod cli {
    pub mod check;
    pub mod table;
}
