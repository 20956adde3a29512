//! Engine configuration (SPEC_FULL.md §4.5a/§6), loaded via `figment` the
//! same way the teacher's `figment_config` feature loads its storage
//! configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for an [`crate::engine::Engine`].
///
/// Defaults match spec.md §3/§5: 32 tree-descriptor slots, a 5 second
/// drain timeout on `close`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the fixed tree-descriptor slot pool.
    pub tree_slots: usize,
    /// How long `close` waits for a tree's active node list to drain
    /// before giving up (spec.md §5: "waits up to 5 seconds").
    #[serde(with = "duration_secs")]
    pub close_drain_timeout: Duration,
    /// Soft cap on resident node descriptors before `lru_purge` is
    /// implicitly favored by the cache; callers may still hold more live
    /// descriptors than this via active refcounts.
    pub lru_high_watermark: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            tree_slots: 32,
            close_drain_timeout: Duration::from_secs(5),
            lru_high_watermark: 4096,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables prefixed `BTREE_`,
    /// falling back to [`EngineConfig::default`] for anything unset.
    ///
    /// Mirrors the teacher's `figment_config`-gated `Config::from_env`.
    #[cfg(feature = "figment_config")]
    pub fn from_env() -> Result<Self, figment::Error> {
        use figment::{
            providers::{Env, Serialized},
            Figment,
        };

        Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Env::prefixed("BTREE_"))
            .extract()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tree_slots, 32);
        assert_eq!(cfg.close_drain_timeout, Duration::from_secs(5));
    }
}
