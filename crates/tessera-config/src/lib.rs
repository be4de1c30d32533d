// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Runtime configuration for Tessera and the storage port it is persisted through.
//! Keeps the core runtime independent of where configuration lives.
#![forbid(unsafe_code)]

pub mod config;
pub mod runtime;

pub use config::{check_key, ConfigError, ConfigService, ConfigStore};
pub use runtime::{RuntimeConfig, DEFAULT_CONFIG_KEY};
