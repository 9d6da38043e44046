// File: src/logging.rs
// Terminal plus file logging for the binary.
use crate::context::AppContext;
use anyhow::{Context, Result};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::OpenOptions;

/// Logs to stderr at `level` and appends everything at debug level or above
/// to `roomcal.log` in the data directory.
pub fn init(ctx: &dyn AppContext, level: LevelFilter) -> Result<()> {
    let path = ctx.log_file()?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {:?}", path))?;

    let config = ConfigBuilder::new()
        .add_filter_allow_str("roomcal")
        .build();

    CombinedLogger::init(vec![
        TermLogger::new(
            level,
            config.clone(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Debug.max(level), config, file),
    ])
    .context("Logger already initialized")?;
    Ok(())
}
