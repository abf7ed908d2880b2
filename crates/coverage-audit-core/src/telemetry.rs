//! Tracing initialisation for the coverage-audit binary.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter directive variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "COVERAGE_AUDIT_LOG";

/// How the operator wants log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// Newline-delimited JSON instead of human-readable lines.
    pub json: bool,
    /// `DEBUG` instead of `INFO` when no filter variable is set.
    pub verbose: bool,
}

impl LogOptions {
    pub fn level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(self.level().as_str()))
    }
}

/// Install the global subscriber. Returns `false` when one was already set.
pub fn init_tracing(options: LogOptions) -> bool {
    let registry = tracing_subscriber::registry().with(options.filter());
    let installed = if options.json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_selects_debug() {
        let opts = LogOptions {
            json: false,
            verbose: true,
        };
        assert_eq!(opts.level(), Level::DEBUG);
        assert_eq!(LogOptions::default().level(), Level::INFO);
    }

    #[test]
    fn test_second_init_is_ignored() {
        init_tracing(LogOptions::default());
        assert!(!init_tracing(LogOptions::default()));
    }
}
