//! Logging initialization honoring the connection config knobs.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, GcsConfig};

/// Installs a global tracing subscriber per the config knobs.
///
/// Logs go to the configured file sink, or stderr when none is set. The
/// `debug` knob raises the default level; `RUST_LOG` still takes
/// precedence. Idempotent: a second call is a no-op.
pub fn init(config: &GcsConfig) -> Result<(), ConfigError> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.log_file.is_none());

    let result = match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| ConfigError::FileRead {
                    path: path.clone(),
                    source,
                })?;
            if config.self_tstamp {
                builder.with_writer(Arc::new(file)).try_init()
            } else {
                builder.without_time().with_writer(Arc::new(file)).try_init()
            }
        }
        None if config.self_tstamp => builder.try_init(),
        None => builder.without_time().try_init(),
    };

    // Already-initialized is fine: multiple connections share a process.
    let _ = result;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_with_file_sink_creates_the_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("starling.log");
        let config = GcsConfig {
            log_file: Some(path.clone()),
            ..GcsConfig::default()
        };
        init(&config).expect("init");
        assert!(path.exists());
    }

    #[test]
    fn init_is_idempotent() {
        let config = GcsConfig::default();
        init(&config).expect("first");
        init(&config).expect("second");
    }
}
