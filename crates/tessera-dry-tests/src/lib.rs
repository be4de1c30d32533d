// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Tessera crates.
#![forbid(unsafe_code)]
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`fixtures`] - Runtime builders and canned region trees
//! - [`logging`] - `tracing-subscriber` setup for tests
//! - [`mappers`] - Recording and remap-forcing mappers
//! - [`requirements`] - Region requirement builder
//! - [`timeline`] - Records task start/end order to check dependences

pub mod config;
pub mod fixtures;
pub mod logging;
pub mod mappers;
pub mod requirements;
pub mod timeline;

pub use config::InMemoryConfigStore;
pub use fixtures::{runtime, runtime_with_config, runtime_with_mapper, RegionFixture};
pub use logging::init_test_logging;
pub use mappers::{RecordingMapper, RemapMapper};
pub use requirements::RequirementBuilder;
pub use timeline::{Mark, TimelineRecorder};
