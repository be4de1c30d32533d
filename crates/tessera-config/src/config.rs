// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persistence port for runtime settings.
//!
//! A [`ConfigStore`] moves opaque byte blobs under a key; [`ConfigService`]
//! owns the JSON encoding and the key rules so every store sees the same
//! keys regardless of backend.

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Backend that stores one blob per key.
///
/// Keys reaching a store have already passed [`check_key`].
pub trait ConfigStore {
    /// Reads the blob stored under `key`, or [`ConfigError::NotFound`].
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replaces the blob stored under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Failures while reading, writing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("no config stored under this key")]
    NotFound,
    /// Key is empty or would escape the store's namespace.
    #[error("invalid config key `{0}`")]
    InvalidKey(String),
    /// Backend I/O failure.
    #[error("config i/o failed: {0}")]
    Io(#[from] std::io::Error),
    /// Stored bytes are not valid JSON for the requested type.
    #[error("config encoding failed: {0}")]
    Serde(#[from] serde_json::Error),
    /// Value decoded but breaks a constraint.
    #[error("invalid config field `{field}`: {reason}")]
    Invalid {
        /// Offending field name.
        field: &'static str,
        /// Constraint that was violated.
        reason: String,
    },
    /// Backend-specific failure.
    #[error("config store: {0}")]
    Other(String),
}

/// Rejects keys that are empty, start with a dot or contain path separators.
pub fn check_key(key: &str) -> Result<(), ConfigError> {
    let bad = key.is_empty()
        || key.starts_with('.')
        || key.chars().any(|c| matches!(c, '/' | '\\' | '\0'));
    if bad {
        return Err(ConfigError::InvalidKey(key.to_owned()));
    }
    Ok(())
}

/// JSON front end over a [`ConfigStore`].
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Wraps `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The wrapped store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Unwraps the service.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S: ConfigStore> ConfigService<S> {
    /// Decodes the value under `key`. A missing key or an empty blob is `None`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        check_key(key)?;
        let bytes = match self.store.load_raw(key) {
            Ok(bytes) => bytes,
            Err(ConfigError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Encodes `value` as pretty JSON under `key`.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        check_key(key)?;
        let mut data = serde_json::to_vec_pretty(value)?;
        data.push(b'\n');
        self.store.save_raw(key, &data)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct MapStore(RefCell<BTreeMap<String, Vec<u8>>>);

    impl ConfigStore for MapStore {
        fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
            self.0.borrow().get(key).cloned().ok_or(ConfigError::NotFound)
        }

        fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
            self.0.borrow_mut().insert(key.to_owned(), data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn keys_stay_inside_the_store() {
        for key in ["", ".hidden", "a/b", "a\\b"] {
            assert!(matches!(check_key(key), Err(ConfigError::InvalidKey(_))), "{key:?}");
        }
        assert!(check_key("runtime-v2").is_ok());

        let service = ConfigService::new(MapStore::default());
        assert!(service.save("../escape", &1u32).is_err());
        assert!(service.store().0.borrow().is_empty());
    }

    #[test]
    fn blank_blobs_read_as_missing() {
        let service = ConfigService::new(MapStore::default());
        service.store().save_raw("blank", b"  \n").unwrap();
        assert_eq!(service.load::<u32>("blank").unwrap(), None);
        assert_eq!(service.load::<u32>("absent").unwrap(), None);
    }

    #[test]
    fn garbage_is_a_serde_error() {
        let service = ConfigService::new(MapStore::default());
        service.store().save_raw("bad", b"{not json").unwrap();
        assert!(matches!(service.load::<u32>("bad"), Err(ConfigError::Serde(_))));
    }
}
