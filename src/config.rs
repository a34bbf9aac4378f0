//! Module for cache and transfer tunables.
//!
//! Tunables may be specified in a TOML configuration file; anything missing
//! falls back to the defaults below.

use std::path::Path;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Mount-wide tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Number of partitions in the handle index.
    pub fhcache_partitions: usize,

    /// Per-partition capacity hint for the handle index.
    pub fhcache_size: usize,

    /// Number of independent LRU lanes.
    pub lru_lanes: usize,

    /// Per-lane handle count at which inserts start reclaiming.
    pub lru_lane_hiwat: usize,

    /// Largest accepted single-object write.
    pub max_put_size: ByteSize,

    /// Part size for streaming uploads.
    pub obj_stripe_size: ByteSize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fhcache_partitions: 7,
            fhcache_size: 2017,
            lru_lanes: 5,
            lru_lane_hiwat: 911,
            max_put_size: ByteSize::gib(5),
            obj_stripe_size: ByteSize::mib(4),
        }
    }
}

impl Config {
    /// Load a configuration file, falling back to defaults for absent keys.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert!(c.fhcache_partitions > 0);
        assert!(c.lru_lanes > 0);
        assert!(c.lru_lane_hiwat > 0);
        assert!(c.obj_stripe_size.as_u64() <= c.max_put_size.as_u64());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let c: Config = toml::from_str("lru-lanes = 4\nlru-lane-hiwat = 1000\n")
            .expect("valid partial config");
        assert_eq!(c.lru_lanes, 4);
        assert_eq!(c.lru_lane_hiwat, 1000);
        assert_eq!(c.fhcache_partitions, Config::default().fhcache_partitions);
    }
}
