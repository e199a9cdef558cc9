//! Log setup. The filter sits behind a reload layer so the level from the
//! loaded configuration can replace the bootstrap level without
//! reinstalling the subscriber.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

/// Level used until configuration has been read.
pub const BOOTSTRAP_LEVEL: &str = "info";

/// Crates whose chatter is capped regardless of the configured level.
const QUIET_TARGETS: &[(&str, &str)] = &[("tower_http", "warn"), ("hyper", "warn")];

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Filter directives for a level: the level itself, then per-target caps.
pub fn filter_directives(level: &str) -> String {
    let mut directives = level.to_ascii_lowercase();
    for (target, cap) in QUIET_TARGETS {
        directives.push_str(&format!(",{target}={cap}"));
    }
    directives
}

fn env_override() -> Option<EnvFilter> {
    std::env::var_os("RUST_LOG")?;
    EnvFilter::try_from_default_env().ok()
}

/// Install the global subscriber at [`BOOTSTRAP_LEVEL`]. `RUST_LOG` wins
/// when set. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = env_override().unwrap_or_else(|| EnvFilter::new(filter_directives(BOOTSTRAP_LEVEL)));
    let (filter, handle) = reload::Layer::new(filter);
    if FILTER_HANDLE.set(handle).is_err() {
        return;
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switch to the configured level. Ignored while `RUST_LOG` is set.
pub fn apply_logging_config(logging: &LoggingConfig) {
    if std::env::var_os("RUST_LOG").is_some() {
        tracing::debug!(level = %logging.level, "RUST_LOG is set; keeping its filter");
        return;
    }
    let Some(handle) = FILTER_HANDLE.get() else {
        return;
    };
    let directives = filter_directives(&logging.level);
    match handle.modify(|filter| *filter = EnvFilter::new(&directives)) {
        Ok(()) => tracing::debug!(filter = %directives, "log filter updated"),
        Err(e) => tracing::warn!(error = %e, "failed to update log filter"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directives_cap_noisy_targets() {
        assert_eq!(filter_directives("DEBUG"), "debug,tower_http=warn,hyper=warn");
    }

    #[test]
    fn test_apply_before_init_is_noop() {
        apply_logging_config(&LoggingConfig::default());
    }
}
