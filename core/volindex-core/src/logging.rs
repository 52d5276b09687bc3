//! Tracing subscriber setup shared by the daemon and the control tool.
//!
//! Filter priority: `VOLINDEX_LOG`, then `RUST_LOG`, then the level implied
//! by the command-line verbosity flags.

use std::io::IsTerminal;

use tracing::Level;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "VOLINDEX_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// Verbose wins when both flags are given.
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    pub const fn default_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Installs the global subscriber writing to stderr. A second call is a
/// no-op.
pub fn init(verbosity: Verbosity) {
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(verbosity == Verbosity::Verbose);

    let _ = tracing_subscriber::registry()
        .with(env_filter(verbosity))
        .with(fmt_layer)
        .try_init();
}

fn env_filter(verbosity: Verbosity) -> EnvFilter {
    if let Ok(directives) = std::env::var(LOG_ENV) {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(default_directive(verbosity))
}

fn default_directive(verbosity: Verbosity) -> String {
    let level = verbosity.default_level();
    match verbosity {
        // Dependencies (tantivy in particular) are chatty at debug.
        Verbosity::Verbose => format!("warn,volindex_core={level},volindexd={level}"),
        _ => level.to_string().to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_wins_over_quiet() {
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
    }

    #[test]
    fn default_directives_parse() {
        assert_eq!(default_directive(Verbosity::Normal), "info");
        assert_eq!(default_directive(Verbosity::Quiet), "error");
        for verbosity in [Verbosity::Quiet, Verbosity::Normal, Verbosity::Verbose] {
            assert!(EnvFilter::try_new(default_directive(verbosity)).is_ok());
        }
    }
}
