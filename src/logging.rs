//! Logger initialisation.
//!
//! Components log through the `log` facade with an explicit `target:` naming
//! themselves (`downloader`, `verifier`, `port_resolver`, ...), so every line
//! says which part of the pipeline produced it.

use log::LevelFilter;

use crate::error::{ProvisionError, ProvisionResult};

/// Environment variable consulted when no explicit level is given.
pub const LOGLEVEL_ENV: &str = "LOGLEVEL";

/// Map a level name onto a filter. Accepts the names operators already use
/// for this tool (`warning`, `critical`) alongside the `log` spellings.
pub fn parse_level(name: &str) -> ProvisionResult<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "error" | "critical" => Ok(LevelFilter::Error),
        _ => Err(ProvisionError::validation(format!(
            "Not recognized LOGLEVEL: {}",
            name
        ))),
    }
}

/// Resolve the effective level: explicit argument, then `LOGLEVEL`, then `info`.
pub fn resolve_level(explicit: Option<&str>) -> ProvisionResult<LevelFilter> {
    match explicit {
        Some(name) => parse_level(name),
        None => match std::env::var(LOGLEVEL_ENV) {
            Ok(name) => parse_level(&name),
            Err(_) => Ok(LevelFilter::Info),
        },
    }
}

/// Install the global logger. Safe to call more than once; later calls only
/// report the level that would have been used.
pub fn init(explicit: Option<&str>) -> ProvisionResult<LevelFilter> {
    let level = resolve_level(explicit)?;
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_target(true)
        .try_init();
    Ok(level)
}
