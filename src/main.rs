// EMS v0.9.0 -- ENERGY-AWARE MULTI-CLUSTER SCHEDULING SIMULATOR
// HETEROGENEOUS CPU PLACEMENT, ONTIME MIGRATION AND UTIL-DRIVEN DVFS
//
// THE LIBRARY OWNS EVERY DECISION; THIS BINARY LOADS A PLATFORM/WORKLOAD
// DOCUMENT, DRIVES THE SIMULATED CLOCK AND REPORTS

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};

use ems::cli::{check, table};
use ems::config;
use ems::logging;
use ems::sim::Simulation;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "ems")]
#[command(about = "EMS -- ENERGY-AWARE MULTI-CLUSTER SCHEDULER")]
struct Cli {
    // -v DEBUG, -vv TRACE
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    // WARNINGS AND ERRORS ONLY
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    // RUN THE WORKLOAD TO COMPLETION OR CTRL+C
    Run {
        // JSON DOCUMENT, OPTIONALLY GZIPPED; BUILT-IN REFERENCE WHEN ABSENT
        config: Option<PathBuf>,

        // DUMP FULL EVENT LOG ON EXIT
        #[arg(long)]
        dump_log: bool,

        // PRINT THE FINAL REPORT AS JSON
        #[arg(long)]
        json: bool,
    },
    // VALIDATE A DOCUMENT AND BRING THE DVFS DRIVER UP AGAINST IT
    Check {
        config: Option<PathBuf>,
    },
    // PRINT THE ENERGY TABLES THE DRIVER BUILDS
    Table {
        config: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },
}

fn run(path: Option<PathBuf>, dump_log: bool, json: bool) -> Result<()> {
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })?;

    let cfg = config::load_or_reference(path.as_deref())?;
    let duration = cfg.workload.duration_ms;
    let nr_cpus = cfg.platform.nr_cpus;
    let nr_groups = cfg.platform.coregroups.len();
    let nr_tasks: usize = cfg.workload.tasks.iter().map(|t| t.threads).sum();

    if !json {
        println!("EMS v0.9.0");
        println!("CPUS:            {} ({} coregroups)", nr_cpus, nr_groups);
        println!("DOMAINS:         {}", cfg.platform.domains.len());
        println!("TASKS:           {}", nr_tasks);
        println!("DURATION:        {} ms", duration);
        println!("CONFIG:          {}", path.as_ref()
                 .map(|p| p.display().to_string())
                 .unwrap_or_else(|| "built-in reference".into()));
        println!();
    }

    let mut sim = Simulation::new(cfg)?;
    if !json {
        println!("EMS IS ACTIVE (CTRL+C TO EXIT)");
    }

    let report = sim.run(&SHUTDOWN)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("EMS IS SHUTTING DOWN");
    sim.print_report(&report);
    if dump_log {
        sim.log().dump();
    }
    sim.log().summary();
    println!("EMS OUT.");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet)?;

    match cli.command {
        Command::Run { config, dump_log, json } => run(config, dump_log, json),
        Command::Check { config } => {
            if !check::run_check(config.as_deref())? {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Table { config, json } => table::run_table(config.as_deref(), json),
    }
}
