//! Satellite configuration: a dictionary plus a per-key access ledger.
//!
//! Every typed read marks its key as used. After `initialize` the satellite
//! logs keys that were never read and keeps only the used ones; `get_config`
//! replies with a projection of this ledger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::dict::Dictionary;
use crate::value::{FromValue, Value, ValueError};

/// Key grouping: user keys are plain, internal keys carry a `_` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    User,
    Internal,
    All,
}

/// Ledger filter for dictionary projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Used,
    Unused,
    All,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration key '{0}'")]
    MissingKey(String),

    #[error("invalid value for key '{key}': {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: ValueError,
    },
}

/// Dictionary with use counting. The ledger only ever grows over the
/// lifetime of a configuration.
#[derive(Debug, Default)]
pub struct Configuration {
    dict: Dictionary,
    // interior mutability so reads can mark usage through &self
    used: HashMap<String, AtomicU32>,
}

impl Configuration {
    pub fn new(dict: Dictionary) -> Self {
        let used = dict
            .keys()
            .map(|key| (key.to_owned(), AtomicU32::new(0)))
            .collect();
        Configuration { dict, used }
    }

    /// Build a configuration whose keys all start marked as used. This is
    /// the retained form stored after initialization, where the unused keys
    /// have already been stripped.
    pub fn new_used(dict: Dictionary) -> Self {
        let used = dict
            .keys()
            .map(|key| (key.to_owned(), AtomicU32::new(1)))
            .collect();
        Configuration { dict, used }
    }

    pub fn has(&self, key: &str) -> bool {
        self.dict.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    fn mark_used(&self, key: &str) {
        if let Some(counter) = self.used.get(key) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn use_count(&self, key: &str) -> u32 {
        self.used
            .get(key)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Typed read. Marks the key as used on every call, including failed
    /// conversions (the key was consulted either way).
    pub fn get<T: FromValue>(&self, key: &str) -> Result<T, ConfigError> {
        let value = self
            .dict
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_owned()))?;
        self.mark_used(key);
        T::from_value(value).map_err(|source| ConfigError::InvalidValue {
            key: key.to_owned(),
            source,
        })
    }

    /// Typed read with a fallback for absent keys.
    pub fn get_or<T: FromValue>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        if !self.has(key) {
            return Ok(default);
        }
        self.get(key)
    }

    /// Read a string key constrained to a declared enum domain. Matching is
    /// case-insensitive; the canonical spelling from `domain` is returned.
    pub fn get_enum(&self, key: &str, domain: &[&str]) -> Result<String, ConfigError> {
        let value = self
            .dict
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_owned()))?;
        self.mark_used(key);
        value
            .as_enum(domain)
            .map_err(|source| ConfigError::InvalidValue {
                key: key.to_owned(),
                source,
            })
    }

    /// Insert or overwrite a value. Existing ledger counts are kept.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        self.used.entry(key.clone()).or_default();
        self.dict.insert(key, value);
    }

    /// Insert only when the key is absent; never touches the ledger of an
    /// existing key.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if !self.has(&key) {
            self.set(key, value);
        }
    }

    /// Overwrite every key that appears in `partial`, leaving the rest.
    pub fn update(&mut self, partial: &Configuration) {
        for (key, value) in partial.dict.iter() {
            self.set(key.to_owned(), value.clone());
        }
    }

    /// Keys that have never been read.
    pub fn unused_keys(&self) -> Vec<String> {
        self.dict
            .keys()
            .filter(|key| self.use_count(key) == 0)
            .map(str::to_owned)
            .collect()
    }

    pub fn size(&self, group: Group) -> usize {
        self.dict.keys().filter(|key| in_group(key, group)).count()
    }

    /// Project the configuration into a plain dictionary, filtered by key
    /// group and ledger state. Projection does not mark keys as used.
    pub fn dictionary(&self, group: Group, usage: Usage) -> Dictionary {
        self.dict
            .iter()
            .filter(|(key, _)| in_group(key, group))
            .filter(|(key, _)| match usage {
                Usage::Used => self.use_count(key) > 0,
                Usage::Unused => self.use_count(key) == 0,
                Usage::All => true,
            })
            .map(|(key, value)| (key.to_owned(), value.clone()))
            .collect()
    }
}

impl Clone for Configuration {
    fn clone(&self) -> Self {
        let used = self
            .used
            .iter()
            .map(|(key, counter)| {
                (
                    key.clone(),
                    AtomicU32::new(counter.load(Ordering::Relaxed)),
                )
            })
            .collect();
        Configuration {
            dict: self.dict.clone(),
            used,
        }
    }
}

impl From<Dictionary> for Configuration {
    fn from(dict: Dictionary) -> Self {
        Configuration::new(dict)
    }
}

fn in_group(key: &str, group: Group) -> bool {
    match group {
        Group::User => !key.starts_with('_'),
        Group::Internal => key.starts_with('_'),
        Group::All => true,
    }
}
