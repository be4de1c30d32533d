// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
//! Runtimes started from settings persisted through a config store.

mod common;

use common::{runtime_with_tasks, FLAKY};
use tessera_config::{ConfigError, ConfigService, ConfigStore};
use tessera_core::{RuntimeConfig, RuntimeError, TaskLauncher};
use tessera_dry_tests::{InMemoryConfigStore, TimelineRecorder};

#[test]
fn saved_settings_drive_a_fresh_runtime() {
    let store = InMemoryConfigStore::new();
    let service = ConfigService::new(store.clone());
    RuntimeConfig::default()
        .with_workers(2)
        .with_resilience(2)
        .save(&service, "runtime")
        .unwrap();
    assert_eq!(store.save_count(), 1);
    assert!(store.contains_key("runtime"));

    let loaded = RuntimeConfig::load(&service, "runtime").unwrap();
    assert_eq!(loaded.workers, 2);
    assert!(loaded.resilience);

    let timeline = TimelineRecorder::new();
    let rt = runtime_with_tasks(loaded, &timeline);
    assert_eq!(rt.config().max_replays, 2);
    let ctx = rt.top_level_context();
    let flaky = ctx.execute_task(TaskLauncher::new(FLAKY).with_pod_args(&2u32)).unwrap();
    assert_eq!(flaky.get_as::<u32>().unwrap(), 2);
    assert_eq!(ctx.stats().replays, 2);
}

#[test]
fn invalid_stored_settings_never_start_a_runtime() {
    let store = InMemoryConfigStore::new();
    store.save_raw("runtime", br#"{ "workers": 0 }"#).unwrap();
    let service = ConfigService::new(store.clone());
    assert!(matches!(
        RuntimeConfig::load(&service, "runtime"),
        Err(ConfigError::Invalid { field: "workers", .. })
    ));

    // Bypassing the loader still hits validation at startup.
    let unchecked: RuntimeConfig = service.load("runtime").unwrap().unwrap();
    assert!(matches!(
        tessera_core::Runtime::new(unchecked),
        Err(RuntimeError::Config(ConfigError::Invalid { field: "workers", .. }))
    ));

    store.set_fail_on_load(true);
    assert!(matches!(
        RuntimeConfig::load(&service, "runtime"),
        Err(ConfigError::Other(_))
    ));
    assert_eq!(store.load_count(), 3);
}
