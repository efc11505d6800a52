//! Named logging contexts.
//!
//! Every component receives a [`Logger`] at construction time instead of
//! reaching for a process-wide configuration object. A [`Logger`] only carries
//! its target name and the level it was configured with; records are emitted
//! through the [`log`] facade, so whichever backend the binary installs picks
//! them up.

use std::{fmt, str::FromStr};

use log::{Level, LevelFilter};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Logging targets used by the bridge components.
pub mod targets {
    /// Position mapping registry.
    pub const SOURCE_MAP: &str = "SourceMap";
    /// Variables graph.
    pub const VARIABLES: &str = "variablesMap";
    /// Session controller.
    pub const DEBUG: &str = "Debug";
    /// Remote connection.
    pub const REMOTE: &str = "RemoteConnection";
    /// Editor prompt channel.
    pub const IPC: &str = "DebugAdapterIPC";
    /// Editor-facing request loop.
    pub const SERVER: &str = "DapServer";
}

/// Errors raised while reading a log configuration.
#[derive(Debug, Error)]
pub enum LogConfigError {
    /// The level name is not one of `Debug`, `Info`, `Warn`, `Error`, `None`.
    #[error("unknown log level '{0}'")]
    UnknownLevel(String),

    /// A per-target override is not of the form `NAME=LEVEL`.
    #[error("invalid log target '{0}', expected NAME=LEVEL")]
    InvalidTarget(String),
}

/// Parses a level name. `None` switches logging off.
pub fn parse_level(name: &str) -> Result<LevelFilter, LogConfigError> {
    match name.to_ascii_lowercase().as_str() {
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warn" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        "none" => Ok(LevelFilter::Off),
        _ => Err(LogConfigError::UnknownLevel(name.to_owned())),
    }
}

/// A default level plus per-target overrides.
#[derive(Debug, Clone)]
pub struct LogConfig {
    default: LevelFilter,
    targets: FxHashMap<String, LevelFilter>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new(LevelFilter::Info)
    }
}

impl LogConfig {
    /// Creates a configuration logging everything at `default` or above.
    pub fn new(default: LevelFilter) -> Self {
        Self {
            default,
            targets: FxHashMap::default(),
        }
    }

    /// Overrides the level of one target.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>, level: LevelFilter) -> Self {
        self.targets.insert(target.into(), level);
        self
    }

    /// Level configured for `target`.
    pub fn level(&self, target: &str) -> LevelFilter {
        self.targets.get(target).copied().unwrap_or(self.default)
    }

    /// The most verbose level any target uses; the backend must be opened up to this.
    pub fn max_level(&self) -> LevelFilter {
        self.targets
            .values()
            .copied()
            .fold(self.default, Ord::max)
    }

    /// Builds the logging context for `target`.
    pub fn logger(&self, target: &'static str) -> Logger {
        Logger {
            target,
            level: self.level(target),
        }
    }
}

/// A `NAME=LEVEL` override, as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLevel {
    /// Target name.
    pub target: String,
    /// Level for it.
    pub level: LevelFilter,
}

impl FromStr for TargetLevel {
    type Err = LogConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (target, level) = s
            .split_once('=')
            .ok_or_else(|| LogConfigError::InvalidTarget(s.to_owned()))?;
        if target.is_empty() {
            return Err(LogConfigError::InvalidTarget(s.to_owned()));
        }
        Ok(Self {
            target: target.to_owned(),
            level: parse_level(level)?,
        })
    }
}

/// A named logging context handed to a component.
#[derive(Debug, Clone, Copy)]
pub struct Logger {
    target: &'static str,
    level: LevelFilter,
}

impl Logger {
    /// A logger for `target` that forwards every level to the backend.
    pub fn new(target: &'static str) -> Self {
        Self {
            target,
            level: LevelFilter::Trace,
        }
    }

    /// The target name records are emitted under.
    pub fn target(&self) -> &'static str {
        self.target
    }

    /// Returns `true` if records at `level` would be emitted.
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level
    }

    fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.enabled(level) {
            log::log!(target: self.target, level, "{args}");
        }
    }

    /// Emits a debug record.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Debug, args);
    }

    /// Emits an info record.
    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Info, args);
    }

    /// Emits a warning.
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Warn, args);
    }

    /// Emits an error record.
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Error, args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("Debug", LevelFilter::Debug)]
    #[test_case("info", LevelFilter::Info)]
    #[test_case("WARN", LevelFilter::Warn)]
    #[test_case("Error", LevelFilter::Error)]
    #[test_case("None", LevelFilter::Off)]
    fn parses_level_names(name: &str, expected: LevelFilter) {
        assert_eq!(parse_level(name).unwrap(), expected);
    }

    #[test]
    fn rejects_unknown_level() {
        assert!(matches!(
            parse_level("verbose"),
            Err(LogConfigError::UnknownLevel(name)) if name == "verbose"
        ));
    }

    #[test]
    fn target_overrides_default() {
        let config = LogConfig::new(LevelFilter::Warn)
            .with_target(targets::SOURCE_MAP, LevelFilter::Debug);

        let source_map = config.logger(targets::SOURCE_MAP);
        assert!(source_map.enabled(Level::Debug));

        let remote = config.logger(targets::REMOTE);
        assert!(!remote.enabled(Level::Info));
        assert!(remote.enabled(Level::Error));

        assert_eq!(config.max_level(), LevelFilter::Debug);
    }

    #[test]
    fn max_level_covers_quieter_overrides() {
        let config = LogConfig::new(LevelFilter::Info)
            .with_target(targets::REMOTE, LevelFilter::Off)
            .with_target(targets::IPC, LevelFilter::Warn);
        assert_eq!(config.max_level(), LevelFilter::Info);
        assert_eq!(LogConfig::new(LevelFilter::Error).max_level(), LevelFilter::Error);
    }

    #[test]
    fn parses_target_level() {
        let parsed: TargetLevel = "Debug=none".parse().unwrap();
        assert_eq!(parsed.target, "Debug");
        assert_eq!(parsed.level, LevelFilter::Off);

        assert!("Debug".parse::<TargetLevel>().is_err());
        assert!("=info".parse::<TargetLevel>().is_err());
    }
}
