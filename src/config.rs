//! Runtime configuration for genai-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every named cache profile (capacity, TTL, stale window, namespace) lives here,
//! together with the durable storage, sweep and preload knobs shared by all of them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separates the namespace from the cache key in durable record keys.
pub const NAMESPACE_SEPARATOR: char = ':';

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("max_size must be greater than 0 (namespace {namespace:?})")]
    InvalidMaxSize { namespace: String },

    #[error(
        "stale_while_revalidate_ms ({stale_ms}) must be >= ttl_ms ({ttl_ms}) (namespace {namespace:?})"
    )]
    StaleWindowShorterThanTtl {
        namespace: String,
        ttl_ms: u64,
        stale_ms: u64,
    },

    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("namespace {namespace:?} must not contain ':'")]
    NamespaceContainsSeparator { namespace: String },

    #[error("no cache profile named {0:?}")]
    UnknownProfile(String),

    #[error("failed to load config: {0}")]
    Load(String),
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "genai-cache", about = "Inspect and maintain genai-cache durable state")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "genai-cache.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Maintenance commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List the configured cache profiles.
    Profiles,

    /// Rehydrate a profile from durable storage and print its statistics.
    Stats {
        #[arg(short, long)]
        profile: String,
    },

    /// Remove entries past the stale window from durable storage.
    Sweep {
        #[arg(short, long)]
        profile: String,
    },

    /// Purge every durable entry of a profile.
    Clear {
        #[arg(short, long)]
        profile: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Durable storage settings.
    pub storage: StorageConfig,

    /// Periodic sweep settings.
    pub sweep: SweepConfig,

    /// Batch preload settings.
    pub preload: PreloadConfig,

    /// Named cache profiles.
    pub caches: BTreeMap<String, CacheConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut caches = BTreeMap::new();
        caches.insert(
            "ai-analysis".to_string(),
            CacheConfig {
                max_size: 100,
                ttl_ms: 30 * 60 * 1000,                    // 30 min
                stale_while_revalidate_ms: 2 * 60 * 60 * 1000, // 2 h
                namespace: "ai-analysis".to_string(),
            },
        );
        caches.insert(
            "image-generation".to_string(),
            CacheConfig {
                max_size: 50,
                ttl_ms: 24 * 60 * 60 * 1000,                   // 1 day
                stale_while_revalidate_ms: 7 * 24 * 60 * 60 * 1000, // 1 week
                namespace: "image-generation".to_string(),
            },
        );
        caches.insert(
            "design-gallery".to_string(),
            CacheConfig {
                max_size: 200,
                ttl_ms: 60 * 60 * 1000,                     // 1 h
                stale_while_revalidate_ms: 24 * 60 * 60 * 1000, // 1 day
                namespace: "design-gallery".to_string(),
            },
        );

        Self {
            storage: StorageConfig::default(),
            sweep: SweepConfig::default(),
            preload: PreloadConfig::default(),
            caches,
        }
    }
}

/// Settings for one cache manager instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries held in memory.
    pub max_size: usize,

    /// Age (ms) below which an entry is served without revalidation.
    pub ttl_ms: u64,

    /// Age (ms) below which an entry may still be served while it is refreshed.
    pub stale_while_revalidate_ms: u64,

    /// Key prefix isolating this instance's entries.
    pub namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            ttl_ms: 5 * 60 * 1000,
            stale_while_revalidate_ms: 60 * 60 * 1000,
            namespace: "default".to_string(),
        }
    }
}

impl CacheConfig {
    /// Build a config for `namespace` with the given limits.
    pub fn new(namespace: impl Into<String>, max_size: usize, ttl: Duration, stale: Duration) -> Self {
        Self {
            max_size,
            ttl_ms: ttl.as_millis() as u64,
            stale_while_revalidate_ms: stale.as_millis() as u64,
            namespace: namespace.into(),
        }
    }

    /// Reject configurations that cannot describe a working cache.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        // Otherwise "ai" would own every record of "ai:img".
        if self.namespace.contains(NAMESPACE_SEPARATOR) {
            return Err(ConfigError::NamespaceContainsSeparator {
                namespace: self.namespace.clone(),
            });
        }
        if self.max_size == 0 {
            return Err(ConfigError::InvalidMaxSize {
                namespace: self.namespace.clone(),
            });
        }
        if self.stale_while_revalidate_ms < self.ttl_ms {
            return Err(ConfigError::StaleWindowShorterThanTtl {
                namespace: self.namespace.clone(),
                ttl_ms: self.ttl_ms,
                stale_ms: self.stale_while_revalidate_ms,
            });
        }
        Ok(())
    }
}

/// Durable storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one file per durable record.
    pub path: PathBuf,

    /// Optional byte quota across all records (None = unbounded).
    pub quota_bytes: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".genai-cache"),
            quota_bytes: Some(5 * 1024 * 1024), // typical origin storage quota
        }
    }
}

/// Periodic sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Whether managers start a background sweeper.
    pub enabled: bool,

    /// Seconds between sweeps.
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 600,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Batch preload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadConfig {
    /// Maximum fetches in flight per batch chunk.
    pub concurrency: usize,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self { concurrency: 3 }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data =
                std::fs::read_to_string(path).map_err(|e| ConfigError::Load(e.to_string()))?;
            let config: Config =
                serde_json::from_str(&data).map_err(|e| ConfigError::Load(e.to_string()))?;
            for profile in config.caches.values() {
                profile.validate()?;
            }
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Look up a named cache profile.
    pub fn profile(&self, name: &str) -> Result<&CacheConfig, ConfigError> {
        self.caches
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profiles_are_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.caches.len(), 3);
        for profile in cfg.caches.values() {
            profile.validate().unwrap();
        }
        assert_eq!(cfg.sweep.interval(), Duration::from_secs(600));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let cfg = CacheConfig {
            max_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidMaxSize { .. })));
    }

    #[test]
    fn test_validate_rejects_short_stale_window() {
        let cfg = CacheConfig::new("x", 10, Duration::from_secs(10), Duration::from_secs(5));
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::StaleWindowShorterThanTtl { ttl_ms: 10_000, stale_ms: 5_000, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_namespace() {
        let cfg = CacheConfig::new("", 10, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyNamespace));
    }

    #[test]
    fn test_validate_rejects_separator_in_namespace() {
        let cfg = CacheConfig::new("ai:img", 10, Duration::from_secs(1), Duration::from_secs(1));
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::NamespaceContainsSeparator {
                namespace: "ai:img".to_string()
            })
        );
        let cfg = CacheConfig::new("ai-img", 10, Duration::from_secs(1), Duration::from_secs(1));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unknown_profile() {
        let cfg = Config::default();
        assert!(cfg.profile("ai-analysis").is_ok());
        assert_eq!(
            cfg.profile("nope"),
            Err(ConfigError::UnknownProfile("nope".to_string()))
        );
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{"caches": {"moods": {"max_size": 5, "ttl_ms": 100, "stale_while_revalidate_ms": 1000, "namespace": "moods"}}}"#,
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.profile("moods").unwrap().max_size, 5);
        assert_eq!(cfg.preload.concurrency, 3);
    }

    #[test]
    fn test_load_rejects_invalid_profile() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{"caches": {"bad": {"max_size": 0, "ttl_ms": 1, "stale_while_revalidate_ms": 1, "namespace": "bad"}}}"#,
        )
        .unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::InvalidMaxSize { .. })));
    }
}
