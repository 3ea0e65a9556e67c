//! Diagnostic tracing for the orchestrator.
//!
//! Tracing output goes to stderr and is controlled by `IVAN_LOG` (falling back
//! to `RUST_LOG`). Agent transcripts are not logs: they are persisted on each
//! task's `execution_log` and are unaffected by the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the filter: `IVAN_LOG` → `RUST_LOG` → `info` (`debug` when verbose).
pub fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "ivan=debug,info" } else { "info" };
    EnvFilter::try_from_env("IVAN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(env_filter(verbose))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .compact(),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_does_not_panic() {
        init(false);
        init(true);
    }
}
