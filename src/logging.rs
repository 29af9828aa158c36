//! Structured logging to stderr. `RUST_LOG` overrides the level picked from the flags.

use tracing_subscriber::EnvFilter;

/// Default filter directive for the given verbosity flags.
pub fn default_level(verbose: bool, quiet: bool) -> &'static str {
    if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose, quiet)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_wins_over_verbose() {
        assert_eq!(default_level(true, true), "warn");
        assert_eq!(default_level(true, false), "debug");
        assert_eq!(default_level(false, false), "info");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_logging(false, true);
        init_logging(true, false);
    }
}
