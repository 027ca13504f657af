//! Logger initialisation
//!
//! Maps `LogType`/`DebugLevel` onto a `tracing-subscriber` fmt layer. The
//! `RUST_LOG` environment variable, when set, overrides the configured level.

use crate::config::{AgentOptions, LogType};
use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Translate the agent's 0-5 debug level into a tracing filter
pub fn level_for(debug_level: u8) -> LevelFilter {
    match debug_level {
        0 => LevelFilter::INFO,
        1 | 2 => LevelFilter::ERROR,
        3 => LevelFilter::WARN,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn env_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Console logger used by `--test` and `--print`
pub fn init_console(level: LevelFilter) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("cannot initialize logger: {}", e))
}

/// Logger for normal agent operation
pub fn init(options: &AgentOptions) -> Result<()> {
    let level = level_for(options.debug_level);

    match options.log_type {
        LogType::Console => init_console(level),
        LogType::File => {
            let path = options
                .log_file
                .as_ref()
                .ok_or_else(|| anyhow!("cannot initialize logger: LogFile is not set"))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file \"{}\"", path.display()))?;

            tracing_subscriber::fmt()
                .with_env_filter(env_filter(level))
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .try_init()
                .map_err(|e| anyhow!("cannot initialize logger: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_level_mapping() {
        assert_eq!(level_for(0), LevelFilter::INFO);
        assert_eq!(level_for(1), LevelFilter::ERROR);
        assert_eq!(level_for(2), LevelFilter::ERROR);
        assert_eq!(level_for(3), LevelFilter::WARN);
        assert_eq!(level_for(4), LevelFilter::DEBUG);
        assert_eq!(level_for(5), LevelFilter::TRACE);
    }

    #[test]
    fn test_file_logger_requires_path() {
        let options = AgentOptions {
            log_type: LogType::File,
            log_file: None,
            ..AgentOptions::default()
        };
        assert!(init(&options).is_err());
    }
}
