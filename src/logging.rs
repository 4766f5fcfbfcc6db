//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins when set; otherwise the configured `application.log_level`
//! applies to this crate and `warn` to everything else.

use crate::config::ApplicationConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Safe to call more than once; later calls are no-ops.
pub fn init(config: &ApplicationConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,spectral_daq={level},spectral_cal={level}",
            level = config.log_level
        ))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
