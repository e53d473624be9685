// EMS TABLE
// BOOT THE DVFS DRIVER AGAINST THE SIMULATED CLOCKS AND DUMP THE RESULTING
// ENERGY TABLES: ONE BLOCK PER COREGROUP, ONE ROW PER FREQUENCY LEVEL.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::config::{self, PlatformConfig};
use crate::cpufreq::acme::Acme;
use crate::cpufreq::cal::{Cal, SimCal};
use crate::cpufreq::pm_qos::PmQos;
use crate::energy::EnergyState;
use crate::platform::Platform;

#[derive(Clone, Debug, Serialize)]
pub struct TableRow {
    pub freq_khz: u64,
    pub cap: u64,
    pub power: u64,
    pub cap_s: u64,
    pub power_s: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct GroupTable {
    pub coregroup: usize,
    pub cpus: String,
    pub rows: Vec<TableRow>,
}

// PLATFORM WITH EVERY DOMAIN THE DRIVER COULD BRING UP REGISTERED
pub fn boot_platform(cfg: &PlatformConfig) -> Result<(Arc<Platform>, Arc<Acme>)> {
    let platform = Arc::new(Platform::from_config(cfg)?);
    let cal: Arc<dyn Cal> = Arc::new(SimCal::from_domains(&cfg.domains));
    let acme = Acme::init(cfg, cal, Arc::new(PmQos::new()), platform.clone())?;
    Ok((platform, acme))
}

fn row(s: &EnergyState) -> TableRow {
    TableRow { freq_khz: s.frequency, cap: s.cap[0], power: s.power[0], cap_s: s.cap[1], power_s: s.power[1] }
}

pub fn tables(platform: &Platform) -> Vec<GroupTable> {
    let energy = platform.energy();
    platform.topology().coregroups().iter().enumerate().filter_map(|(g, mask)| {
        let first = mask.first()?;
        Some(GroupTable {
            coregroup: g,
            cpus: mask.to_string(),
            rows: energy.table(first).iter().map(row).collect(),
        })
    }).collect()
}

pub fn run_table(path: Option<&Path>, json: bool) -> Result<()> {
    let cfg = config::load_or_reference(path)?;
    let (platform, _acme) = boot_platform(&cfg.platform)?;
    let groups = tables(&platform);

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    for g in &groups {
        println!("COREGROUP {} (CPUS {})", g.coregroup, g.cpus);
        if g.rows.is_empty() {
            println!("  NO ENERGY TABLE");
            println!();
            continue;
        }
        println!("  {:<4} {:<10} {:<6} {:<8} {:<6} {:<8}", "IDX", "FREQ_KHZ", "CAP", "POWER", "CAP_S", "POWER_S");
        for (i, r) in g.rows.iter().enumerate() {
            println!("  {:<4} {:<10} {:<6} {:<8} {:<6} {:<8}", i, r.freq_khz, r.cap, r.power, r.cap_s, r.power_s);
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_tables_cover_every_group() {
        let cfg = config::load_or_reference(None).unwrap();
        let (platform, acme) = boot_platform(&cfg.platform).unwrap();
        assert_eq!(acme.nr_domains(), 3);
        let groups = tables(&platform);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].rows.len(), 7);
        // FASTEST CPU AT ITS TOP LEVEL IS THE 1024 REFERENCE
        let top = groups[2].rows.iter().map(|r| r.cap).max().unwrap();
        assert_eq!(top, 1024);
        assert!(groups[0].rows.iter().all(|r| r.cap < 1024));
    }
}
