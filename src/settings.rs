use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default cache entry lifetime, in seconds (about 60 days).
pub const DEFAULT_CACHE_LIFE_SECS: u64 = 60 * 24 * 60 * 60;

/// Read-only launcher settings consumed by the engine. The surrounding
/// application owns persistence and mutation; the engine never writes these.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub instances_dir: PathBuf,
    /// Size of the shared download worker pool. Fixed for the process
    /// lifetime; changing it requires a restart.
    #[serde(default = "default_thread_limit")]
    pub thread_limit: usize,
    /// Download speed cap in bytes per second, 0 for unlimited.
    #[serde(default)]
    pub speed_limit: u64,
    /// Content cache entry lifetime in seconds.
    #[serde(default = "default_cache_life")]
    pub cache_life: u64,
}

impl Settings {
    pub fn new(instances_dir: PathBuf) -> Self {
        Self {
            instances_dir,
            thread_limit: default_thread_limit(),
            speed_limit: 0,
            cache_life: DEFAULT_CACHE_LIFE_SECS,
        }
    }
}

fn default_thread_limit() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(4);
    usize::max(2, cores / 2)
}

fn default_cache_life() -> u64 {
    DEFAULT_CACHE_LIFE_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::new(PathBuf::from("instances"));
        assert!(settings.thread_limit >= 2);
        assert_eq!(settings.speed_limit, 0);
        assert_eq!(settings.cache_life, DEFAULT_CACHE_LIFE_SECS);
    }

    #[test]
    fn missing_fields_fall_back() {
        let settings: Settings =
            serde_json::from_str(r#"{"instancesDir":"/tmp/instances"}"#).expect("parse");
        assert!(settings.thread_limit >= 2);
        assert_eq!(settings.cache_life, DEFAULT_CACHE_LIFE_SECS);
    }
}
