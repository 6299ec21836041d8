//! Loop configuration.

use serde::Deserialize;

/// Environment variable overriding [`LoopConfig::threadpool_size`]
pub const THREADPOOL_SIZE_ENV: &str = "EVLOOP_THREADPOOL_SIZE";

/// Upper bound for the worker pool size
pub const MAX_THREADPOOL_SIZE: usize = 1024;

/// Default worker pool size
pub const DEFAULT_THREADPOOL_SIZE: usize = 4;

/// Options for creating a [`Loop`](crate::Loop)
///
/// Deserializable so it can be embedded in an application's TOML config;
/// missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Number of worker threads. 0 means one per CPU core.
    pub threadpool_size: usize,

    /// Name prefix for worker threads (`<prefix>-<index>`)
    pub thread_name: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            threadpool_size: DEFAULT_THREADPOOL_SIZE,
            thread_name: "evloop-worker".to_string(),
        }
    }
}

impl LoopConfig {
    /// Defaults, with the pool size taken from `EVLOOP_THREADPOOL_SIZE` if set
    pub fn from_env() -> Self {
        let value = std::env::var(THREADPOOL_SIZE_ENV).ok();
        Self::default().with_threadpool_override(value.as_deref())
    }

    /// Apply a textual pool size override; unparsable values are ignored
    pub fn with_threadpool_override(mut self, value: Option<&str>) -> Self {
        if let Some(raw) = value {
            match raw.trim().parse::<usize>() {
                Ok(size) => self.threadpool_size = size,
                Err(_) => {
                    tracing::warn!(value = raw, "ignoring invalid {}", THREADPOOL_SIZE_ENV);
                }
            }
        }
        self
    }

    /// Set the worker count
    pub fn with_threadpool_size(mut self, size: usize) -> Self {
        self.threadpool_size = size;
        self
    }

    /// Worker count actually used: 0 resolves to the CPU count, and the
    /// result is clamped to `1..=MAX_THREADPOOL_SIZE`
    pub fn effective_threadpool_size(&self) -> usize {
        let size = if self.threadpool_size == 0 {
            num_cpus::get()
        } else {
            self.threadpool_size
        };
        size.clamp(1, MAX_THREADPOOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = LoopConfig::default();
        assert_eq!(config.threadpool_size, DEFAULT_THREADPOOL_SIZE);
        assert_eq!(config.effective_threadpool_size(), DEFAULT_THREADPOOL_SIZE);
        assert_eq!(config.thread_name, "evloop-worker");
    }

    #[test]
    fn test_config_zero_means_cpu_count() {
        let config = LoopConfig::default().with_threadpool_size(0);
        assert_eq!(config.effective_threadpool_size(), num_cpus::get().min(MAX_THREADPOOL_SIZE));
    }

    #[test]
    fn test_config_clamps_large_pool() {
        let config = LoopConfig::default().with_threadpool_size(1_000_000);
        assert_eq!(config.effective_threadpool_size(), MAX_THREADPOOL_SIZE);
    }

    #[test]
    fn test_config_threadpool_override() {
        let config = LoopConfig::default().with_threadpool_override(Some(" 16 "));
        assert_eq!(config.threadpool_size, 16);

        let config = LoopConfig::default().with_threadpool_override(Some("lots"));
        assert_eq!(config.threadpool_size, DEFAULT_THREADPOOL_SIZE);

        let config = LoopConfig::default().with_threadpool_override(None);
        assert_eq!(config, LoopConfig::default());
    }

    #[test]
    fn test_config_from_toml() {
        let config: LoopConfig = toml::from_str("threadpool_size = 2\n").unwrap();
        assert_eq!(config.threadpool_size, 2);
        assert_eq!(config.thread_name, "evloop-worker");

        let config: LoopConfig =
            toml::from_str("threadpool_size = 8\nthread_name = \"io\"\n").unwrap();
        assert_eq!(config.threadpool_size, 8);
        assert_eq!(config.thread_name, "io");

        let config: LoopConfig = toml::from_str("").unwrap();
        assert_eq!(config, LoopConfig::default());
    }
}
