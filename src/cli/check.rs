// EMS CONFIG CHECK
// LOAD A PLATFORM/WORKLOAD DOCUMENT, BRING THE DVFS DRIVER UP AGAINST THE
// SIMULATED CLOCKS AND REPORT WHAT CAME UP AND WHAT WAS DROPPED.

use std::path::Path;

use anyhow::Result;

use crate::config::{self, SimConfig};
use crate::cli::table::boot_platform;
use crate::ontime::Ontime;

fn line(label: &str, ok: bool, detail: &str) -> bool {
    println!("  {:<24}{}{}", label, if ok { "OK" } else { "FAILED" },
             if detail.is_empty() { String::new() } else { format!(" ({})", detail) });
    ok
}

// RETURNS FALSE WHEN ANY CHECK FAILED
pub fn check_config(cfg: &SimConfig) -> Result<bool> {
    let p = &cfg.platform;
    let mut ok = true;

    println!("TOPOLOGY:");
    let topology = p.topology()?;
    for (g, mask) in topology.coregroups().iter().enumerate() {
        line(&format!("coregroup {}", g), true, &format!("cpus {}", mask));
    }
    println!();

    println!("CPUFREQ:");
    let (platform, acme) = match boot_platform(p) {
        Ok(x) => x,
        Err(e) => {
            line("driver", false, &format!("{:#}", e));
            return Ok(false);
        }
    };
    for dc in &p.domains {
        let up = acme.domains().iter().find(|d| d.cal_id == dc.cal_id);
        let detail = match up {
            Some(d) => format!("cpus {} [{} .. {}] kHz, {}", d.cpus, d.min_freq, d.max_freq,
                               dc.governor.label()),
            None => format!("cpus {} disabled", dc.cpus),
        };
        ok &= line(&format!("domain cal-id {}", dc.cal_id), up.is_some(), &detail);
    }
    let dm = acme.dm().is_some();
    if p.domains.iter().any(|d| d.dm_type.is_some()) {
        ok &= line("dvfs manager", dm, &format!("{} constraints", p.dm_constraints.len()));
    }
    println!();

    println!("ENERGY MODEL:");
    let energy = platform.energy();
    ok &= line("tables", energy.is_initialized(),
               if energy.is_initialized() { "" } else { "some cpus have no table" });
    let ontime_cfg: Vec<_> = p.coregroups.iter().map(|g| g.ontime).collect();
    let ontime = Ontime::from_config(&ontime_cfg, &topology, &energy);
    drop(energy);
    for g in 0..topology.nr_coregroups() {
        match ontime.bounds(g) {
            Some(b) => line(&format!("ontime group {}", g), true,
                            &format!("upper {} lower {}", b.upper[0], b.lower[0])),
            None => line(&format!("ontime group {}", g), true, "not configured"),
        };
    }
    println!();

    println!("WORKLOAD:");
    line("tasks", true, &format!("{} scripted, {} threads", cfg.workload.tasks.len(),
                                 cfg.workload.tasks.iter().map(|t| t.threads).sum::<usize>()));
    line("duration", true, &format!("{} ms", cfg.workload.duration_ms));
    println!();

    Ok(ok)
}

pub fn run_check(path: Option<&Path>) -> Result<bool> {
    println!("EMS CONFIG CHECK");
    println!();

    let cfg = match config::load_or_reference(path) {
        Ok(c) => c,
        Err(e) => {
            line("config", false, &format!("{:#}", e));
            println!();
            println!("SOME CHECKS FAILED");
            return Ok(false);
        }
    };
    line("config", true, &path.map(|p| p.display().to_string()).unwrap_or_else(|| "built-in reference".into()));
    println!();

    let ok = check_config(&cfg)?;
    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
    }
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reference_passes() {
        assert!(run_check(None).unwrap());
    }

    #[test]
    fn broken_document_fails_cleanly() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"{ \"platform\": 3 }").unwrap();
        assert!(!run_check(Some(f.path())).unwrap());
    }

    #[test]
    fn empty_table_disables_domain() {
        let mut cfg = config::reference();
        cfg.platform.domains[1].table.clear();
        assert!(!check_config(&cfg).unwrap());
    }
}
