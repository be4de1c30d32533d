// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tunables for a Tessera runtime instance.

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, ConfigService, ConfigStore};

/// Store key used when no explicit key is supplied.
pub const DEFAULT_CONFIG_KEY: &str = "runtime";

/// Upper bound on the default worker count.
const DEFAULT_WORKER_CAP: usize = 8;

/// Runtime tunables.
///
/// Every field has a default, so a partially written config file (or an
/// empty JSON object) deserializes into a usable configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker processors. Each owns one run queue.
    pub workers: usize,
    /// Verify asserted partition disjointness/completeness at creation.
    pub safe_partition_checks: bool,
    /// Verify every region requirement against the issuing context's privileges.
    pub safe_privilege_checks: bool,
    /// Cross-check functor purity and per-launch digests across replicated shards.
    pub safe_control_replication: bool,
    /// Re-execute failed tasks instead of poisoning their results.
    pub resilience: bool,
    /// Replays allowed per task when `resilience` is enabled.
    pub max_replays: u32,
    /// Mapper remap requests honoured before the mapping is declared fatal.
    pub max_remaps: u32,
    /// Phase barrier generations available before a barrier is exhausted.
    pub max_barrier_generations: u32,
    /// Drop dominated users from the analyzer's per-field lists.
    pub enable_eviction: bool,
    /// Default shard count for replicated launches started from config.
    pub shards: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .clamp(1, DEFAULT_WORKER_CAP);
        Self {
            workers,
            safe_partition_checks: true,
            safe_privilege_checks: true,
            safe_control_replication: false,
            resilience: false,
            max_replays: 2,
            max_remaps: 4,
            max_barrier_generations: 65_536,
            enable_eviction: true,
            shards: 1,
        }
    }
}

impl RuntimeConfig {
    /// Check field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.shards == 0 {
            return Err(ConfigError::Invalid {
                field: "shards",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_barrier_generations == 0 {
            return Err(ConfigError::Invalid {
                field: "max_barrier_generations",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Load a config stored under `key`, falling back to defaults when absent.
    pub fn load<S: ConfigStore>(service: &ConfigService<S>, key: &str) -> Result<Self, ConfigError> {
        let cfg = service.load::<Self>(key)?.unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate and persist this config under `key`.
    pub fn save<S: ConfigStore>(&self, service: &ConfigService<S>, key: &str) -> Result<(), ConfigError> {
        self.validate()?;
        service.save(key, self)
    }

    /// Builder-style override of the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Builder-style toggle for task re-execution on failure.
    pub fn with_resilience(mut self, max_replays: u32) -> Self {
        self.resilience = true;
        self.max_replays = max_replays;
        self
    }

    /// Builder-style toggle for replicated-execution safety checks.
    pub fn with_safe_control_replication(mut self, on: bool) -> Self {
        self.safe_control_replication = on;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapStore {
        data: RefCell<HashMap<String, Vec<u8>>>,
    }

    impl ConfigStore for MapStore {
        fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.data
                .borrow()
                .get(key)
                .cloned()
                .ok_or(ConfigError::NotFound)
        }

        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            self.data.borrow_mut().insert(key.to_owned(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.validate().is_ok());
        assert!((1..=DEFAULT_WORKER_CAP).contains(&cfg.workers));
        assert!(cfg.safe_partition_checks);
        assert!(!cfg.resilience);
    }

    #[test]
    fn missing_key_yields_defaults() {
        let service = ConfigService::new(MapStore::default());
        let cfg = RuntimeConfig::load(&service, DEFAULT_CONFIG_KEY).unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let store = MapStore::default();
        store.save_raw("rt", br#"{"workers": 3, "resilience": true}"#).unwrap();
        let service = ConfigService::new(store);
        let cfg = RuntimeConfig::load(&service, "rt").unwrap();
        assert_eq!(cfg.workers, 3);
        assert!(cfg.resilience);
        assert_eq!(cfg.max_remaps, RuntimeConfig::default().max_remaps);
    }

    #[test]
    fn zero_workers_rejected_on_load_and_save() {
        let store = MapStore::default();
        store.save_raw("rt", br#"{"workers": 0}"#).unwrap();
        let service = ConfigService::new(store);
        let err = RuntimeConfig::load(&service, "rt").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "workers", .. }));

        let bad = RuntimeConfig::default().with_workers(0);
        assert!(bad.save(&service, "rt2").is_err());
        assert!(service.store().load_raw("rt2").is_err());
    }

    #[test]
    fn save_then_load_preserves_fields() {
        let service = ConfigService::new(MapStore::default());
        let cfg = RuntimeConfig::default()
            .with_workers(2)
            .with_resilience(5)
            .with_safe_control_replication(true);
        cfg.save(&service, "rt").unwrap();
        assert_eq!(RuntimeConfig::load(&service, "rt").unwrap(), cfg);
    }
}
