use std::path::PathBuf;
use std::time::Duration;

use crate::limits;

/// Runtime configuration, read from `GREENBOX_*` environment variables
/// with sensible defaults. The embedding binary decides when to call
/// `from_env`; tests construct configs directly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the WAL.
    pub data_dir: PathBuf,
    /// WAL appends since the last compaction before the compactor
    /// rewrites the log as a snapshot.
    pub compact_threshold: u64,
    /// Prometheus exporter port; None disables the exporter.
    pub metrics_port: Option<u16>,
    /// How often the dispatcher drains the notice outbox.
    pub dispatch_interval: Duration,
    /// Delivery attempts per notice before it stays failed.
    pub delivery_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            metrics_port: None,
            dispatch_interval: Duration::from_secs(5),
            delivery_attempts: limits::MAX_DELIVERY_ATTEMPTS,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("GREENBOX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            compact_threshold: std::env::var("GREENBOX_COMPACT_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            metrics_port: std::env::var("GREENBOX_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            dispatch_interval: std::env::var("GREENBOX_DISPATCH_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.dispatch_interval),
            delivery_attempts: std::env::var("GREENBOX_DELIVERY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.delivery_attempts),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("greenbox.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.wal_path(), PathBuf::from("./data/greenbox.wal"));
    }
}
