//! Logging setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LOG_FILTER_ENV;

pub const DEFAULT_LOG_FILTER: &str = "kiln=info,warn";

/// Install the global subscriber.
///
/// `KILN_LOG` takes precedence over `filter`; an invalid `filter` falls back
/// to [`DEFAULT_LOG_FILTER`]. Returns `false` if a subscriber was already
/// installed, which is not an error.
pub fn init_logging(filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(env_filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_tolerated() {
        init_logging("kiln=debug");
        assert!(!init_logging(DEFAULT_LOG_FILTER));
    }
}
