// EMS DVFS STACK
// FREQUENCY TABLES, THE CLOCK (CAL) INTERFACE, PM QOS, THE DVFS MANAGER,
// THE PER-DOMAIN DRIVER (ACME) AND THE SCHEDUTIL-STYLE GOVERNOR.

pub mod acme;
pub mod cal;
pub mod dm;
pub mod pm_qos;
pub mod schedutil;
pub mod table;

pub use table::{FreqTable, Relation};
