//! Tracing subscriber setup.
//!
//! The configured level applies to this crate; `RUST_LOG` overrides it
//! entirely when set.

use crate::config::AppConfig;
use tracing_subscriber::EnvFilter;

/// Builds the filter for a configured level, honouring `RUST_LOG`.
pub fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,ccd_daq={log_level}")))
}

/// Installs the global subscriber from the application config.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_from_config(config: &AppConfig) -> anyhow::Result<()> {
    let filter = env_filter(&config.application.log_level);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if config.application.json_logs {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;
    }

    tracing::debug!(level = %config.application.log_level, "Logging initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_uses_configured_level() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(env_filter("debug").to_string().contains("ccd_daq=debug"));
        }
    }
}
