// EMS LOGGING
// TERMINAL LOGGER FOR THE BINARY. THE LIBRARY ONLY TALKS TO THE `log` FACADE.

use anyhow::{Context, Result};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

// 0 = INFO, 1 = DEBUG, 2+ = TRACE; QUIET WINS
pub fn level_for(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Warn;
    }
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn init(verbose: u8, quiet: bool) -> Result<()> {
    let mut lcfg = ConfigBuilder::new();
    lcfg.set_time_level(LevelFilter::Error)
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off);
    TermLogger::init(
        level_for(verbose, quiet),
        lcfg.build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .context("logger already initialised")
}
