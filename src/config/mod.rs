//! Queue tuning loaded from `config/worker.toml`.
//!
//! Missing file or missing keys fall back to defaults; the host can also
//! construct settings programmatically and hand them to the queue.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::pool::PoolConfig;

/// Default maximum number of idle workers held by the queue.
const DEFAULT_MAX_IDLE_WORKERS: usize = 3;

/// Default idle expiration in minutes.
const DEFAULT_EXPIRATION_MINUTES: u64 = 5;

/// Default width of the manager task pool.
const DEFAULT_TASK_WIDTH: usize = 8;

#[derive(Deserialize, Debug, Clone, Default)]
pub struct QueueSettings {
    /// Maximum idle capacity. 0 disables pooling and forces direct
    /// construction on every checkout.
    pub max_idle_workers: Option<usize>,
    /// Minutes an idle worker may sit unused before the sweep closes it.
    pub expiration_minutes: Option<u64>,
    /// Width of the manager's bounded task pool.
    pub task_width: Option<usize>,
}

impl QueueSettings {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from("config/worker.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).unwrap_or_default();
        let settings: Self = toml::from_str(&text).unwrap_or_default();
        Ok(settings)
    }

    pub fn max_idle_workers(&self) -> usize {
        self.max_idle_workers.unwrap_or(DEFAULT_MAX_IDLE_WORKERS)
    }

    pub fn expiration_minutes(&self) -> u64 {
        self.expiration_minutes.unwrap_or(DEFAULT_EXPIRATION_MINUTES)
    }

    pub fn task_width(&self) -> usize {
        self.task_width.unwrap_or(DEFAULT_TASK_WIDTH)
    }

    /// Pool tuning derived from these settings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            capacity: self.max_idle_workers(),
            idle_expiration: Duration::from_secs(self.expiration_minutes() * 60),
            ..PoolConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_when_file_is_missing() {
        let settings = QueueSettings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.max_idle_workers(), 3);
        assert_eq!(settings.expiration_minutes(), 5);
        assert_eq!(settings.task_width(), 8);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_idle_workers = 6\nexpiration_minutes = 1").unwrap();

        let settings = QueueSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.max_idle_workers(), 6);
        assert_eq!(settings.expiration_minutes(), 1);
        // Unspecified keys keep their defaults.
        assert_eq!(settings.task_width(), 8);

        let pool = settings.pool_config();
        assert_eq!(pool.capacity, 6);
        assert_eq!(pool.idle_expiration, Duration::from_secs(60));
    }

    #[test]
    fn zero_capacity_disables_pooling() {
        let settings: QueueSettings = toml::from_str("max_idle_workers = 0").unwrap();
        assert_eq!(settings.pool_config().capacity, 0);
    }
}
