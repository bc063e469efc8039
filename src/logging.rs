//! Logging setup for hvmbuild.
//!
//! Set the `HVMBUILD_LOG` environment variable to control verbosity:
//! - `HVMBUILD_LOG=1` or `HVMBUILD_LOG=all` - debug output from every stage
//! - `HVMBUILD_LOG=hvmbuild::memory=trace` - any `EnvFilter` directive
//!
//! Without it only `info` and above are printed.

use std::sync::OnceLock;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Environment variable read by [`init`].
pub const LOG_ENV: &str = "HVMBUILD_LOG";

static INIT: OnceLock<()> = OnceLock::new();

/// Filter for a given `HVMBUILD_LOG` value.
pub fn filter_from(value: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::default().add_directive(LevelFilter::INFO.into());
    match value.map(str::trim) {
        None | Some("") => default(),
        Some(v) if v == "1" || v.eq_ignore_ascii_case("all") => {
            EnvFilter::default().add_directive(LevelFilter::DEBUG.into())
        }
        Some(v) => EnvFilter::try_new(v).unwrap_or_else(|_| default()),
    }
}

/// Install the global subscriber, writing to stderr. Later calls are no-ops.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = filter_from(std::env::var(LOG_ENV).ok().as_deref());
        // Another subscriber may already be installed by the embedding program.
        let _ = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_info() {
        assert_eq!(filter_from(None).to_string(), "info");
        assert_eq!(filter_from(Some("  ")).to_string(), "info");
    }

    #[test]
    fn test_all_enables_debug() {
        assert_eq!(filter_from(Some("1")).to_string(), "debug");
        assert_eq!(filter_from(Some("ALL")).to_string(), "debug");
    }

    #[test]
    fn test_directive_passthrough() {
        let filter = filter_from(Some("hvmbuild=trace"));
        assert_eq!(filter.to_string(), "hvmbuild=trace");
    }

    #[test]
    fn test_init_twice() {
        init();
        init();
    }
}
