//! Satellite configuration.
//!
//! A configuration is a dictionary with per-key bookkeeping: every successful
//! read marks the key *used*, and keys starting with `_` belong to the
//! internal group. After `initialize` the satellite logs and drops keys the
//! action never read; `update` from a partial configuration only applies keys
//! the reconfiguring action actually consumed.

use std::fmt;

use thiserror::Error;

use crate::dictionary::Dictionary;
use crate::value::{FromValue, IntoValue, Value};

/// Key grouping: operator-provided vs framework-internal settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    /// Keys set by the operator.
    User,
    /// Keys starting with `_`, managed by the framework.
    Internal,
    /// Both groups.
    All,
}

/// Usage filter for dictionary extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    /// Only keys that were read at least once.
    Used,
    /// Only keys never read.
    Unused,
    /// All keys.
    Any,
}

/// Configuration access error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The requested key is not present.
    #[error("configuration key {key:?} is missing")]
    MissingKey {
        key: String,
    },

    /// The key is present but does not convert to the requested type.
    #[error("configuration key {key:?} has invalid type: {reason}")]
    InvalidType {
        key: String,
        reason: String,
    },

    /// The key converts but its value is out of the accepted domain.
    #[error("configuration key {key:?} has invalid value: {reason}")]
    InvalidValue {
        key: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    key: String,
    value: Value,
    used: bool,
}

/// A dictionary with used-key tracking and key grouping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Configuration {
    entries: Vec<Entry>,
}

fn group_of(key: &str) -> Group {
    if key.starts_with('_') {
        Group::Internal
    } else {
        Group::User
    }
}

fn matches_group(key: &str, group: Group) -> bool {
    matches!(group, Group::All) || group_of(key) == group
}

impl Configuration {
    /// Create an empty configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Build from a dictionary; all keys start out unused.
    #[must_use]
    pub fn from_dictionary(dict: Dictionary) -> Self {
        Self {
            entries: dict
                .into_iter()
                .map(|(key, value)| Entry { key, value, used: false })
                .collect(),
        }
    }

    /// Number of keys in the given group.
    #[must_use]
    pub fn size(&self, group: Group) -> usize {
        self.entries.iter().filter(|e| matches_group(&e.key, group)).count()
    }

    /// Whether a key is present.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    /// Read a key as `T`, marking it used on success.
    ///
    /// # Errors
    /// Returns [`ConfigError::MissingKey`] if absent and
    /// [`ConfigError::InvalidType`] if the stored value does not convert.
    pub fn get<T: FromValue>(&mut self, key: &str) -> Result<T, ConfigError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.key == key)
            .ok_or_else(|| ConfigError::MissingKey { key: key.to_owned() })?;
        match entry.value.get::<T>() {
            Ok(value) => {
                entry.used = true;
                Ok(value)
            }
            Err(err) => Err(ConfigError::InvalidType {
                key: key.to_owned(),
                reason: err.to_string(),
            }),
        }
    }

    /// Read a key as `T`, inserting and returning `default` if absent.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidType`] if a present value does not
    /// convert.
    pub fn get_or<T>(&mut self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromValue + IntoValue + Clone,
    {
        self.set_default(key, default.clone());
        self.get(key)
    }

    /// Set a key, overwriting any existing value and clearing its used bit.
    pub fn set(&mut self, key: impl Into<String>, value: impl IntoValue) {
        let key = key.into();
        let value = value.into_value();
        match self.entries.iter_mut().find(|e| e.key == key) {
            Some(entry) => {
                entry.value = value;
                entry.used = false;
            }
            None => self.entries.push(Entry { key, value, used: false }),
        }
    }

    /// Insert a key only if it is not yet present.
    pub fn set_default(&mut self, key: impl Into<String>, value: impl IntoValue) {
        let key = key.into();
        if !self.has(&key) {
            self.entries.push(Entry {
                key,
                value: value.into_value(),
                used: false,
            });
        }
    }

    /// Apply a partial configuration: overwrite exactly those keys whose used
    /// bit is set in `partial`. Applied keys are marked used here as well.
    pub fn update(&mut self, partial: &Configuration) {
        for entry in partial.entries.iter().filter(|e| e.used) {
            match self.entries.iter_mut().find(|e| e.key == entry.key) {
                Some(existing) => {
                    existing.value = entry.value.clone();
                    existing.used = true;
                }
                None => self.entries.push(Entry {
                    key: entry.key.clone(),
                    value: entry.value.clone(),
                    used: true,
                }),
            }
        }
    }

    /// Drop every key that was never read, returning the dropped key names.
    pub fn retain_used(&mut self) -> Vec<String> {
        let mut dropped = Vec::new();
        self.entries.retain(|entry| {
            if entry.used {
                true
            } else {
                dropped.push(entry.key.clone());
                false
            }
        });
        dropped
    }

    /// Keys in the given group matching the usage filter, in insertion order.
    #[must_use]
    pub fn keys(&self, group: Group, usage: Usage) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| matches_group(&e.key, group))
            .filter(|e| match usage {
                Usage::Used => e.used,
                Usage::Unused => !e.used,
                Usage::Any => true,
            })
            .map(|e| e.key.clone())
            .collect()
    }

    /// Extract a dictionary of the keys in `group` matching `usage`.
    #[must_use]
    pub fn dictionary(&self, group: Group, usage: Usage) -> Dictionary {
        self.entries
            .iter()
            .filter(|e| matches_group(&e.key, group))
            .filter(|e| match usage {
                Usage::Used => e.used,
                Usage::Unused => !e.used,
                Usage::Any => true,
            })
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dictionary(Group::All, Usage::Any).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Configuration {
        let mut dict = Dictionary::new();
        dict.insert("voltage", 1500_i64);
        dict.insert("channel", 7_u64);
        dict.insert("_role", "internal");
        Configuration::from_dictionary(dict)
    }

    #[test]
    fn get_marks_used() {
        let mut config = sample();
        assert_eq!(config.keys(Group::All, Usage::Used).len(), 0);
        assert_eq!(config.get::<i64>("voltage"), Ok(1500));
        assert_eq!(config.keys(Group::All, Usage::Used), vec!["voltage"]);
    }

    #[test]
    fn failed_conversion_leaves_key_unused() {
        let mut config = sample();
        assert!(matches!(
            config.get::<bool>("voltage"),
            Err(ConfigError::InvalidType { .. })
        ));
        assert!(config.keys(Group::All, Usage::Used).is_empty());
    }

    #[test]
    fn missing_key_is_reported() {
        let mut config = sample();
        assert_eq!(
            config.get::<i64>("current"),
            Err(ConfigError::MissingKey { key: "current".into() })
        );
    }

    #[test]
    fn set_default_is_noop_for_present_keys() {
        let mut config = sample();
        config.set_default("voltage", 0_i64);
        assert_eq!(config.get::<i64>("voltage"), Ok(1500));
        config.set_default("polarity", "negative");
        assert_eq!(config.get::<String>("polarity").unwrap(), "negative");
    }

    #[test]
    fn get_or_inserts_missing_default() {
        let mut config = sample();
        assert_eq!(config.get_or("retries", 3_i64), Ok(3));
        assert!(config.has("retries"));
    }

    #[test]
    fn groups_split_on_underscore_prefix() {
        let config = sample();
        assert_eq!(config.size(Group::User), 2);
        assert_eq!(config.size(Group::Internal), 1);
        assert_eq!(config.size(Group::All), 3);
        assert_eq!(config.keys(Group::Internal, Usage::Any), vec!["_role"]);
    }

    #[test]
    fn update_applies_only_used_keys() {
        let mut config = sample();
        config.get::<i64>("voltage").unwrap();

        let mut partial_dict = Dictionary::new();
        partial_dict.insert("voltage", 1600_i64);
        partial_dict.insert("channel", 9_u64);
        let mut partial = Configuration::from_dictionary(partial_dict);
        // Only the voltage key is consumed by the (simulated) action.
        partial.get::<i64>("voltage").unwrap();

        config.update(&partial);
        assert_eq!(config.get::<i64>("voltage"), Ok(1600));
        assert_eq!(config.get::<u64>("channel"), Ok(7));
    }

    #[test]
    fn retain_used_drops_unread_keys() {
        let mut config = sample();
        config.get::<i64>("voltage").unwrap();
        let dropped = config.retain_used();
        assert_eq!(dropped, vec!["channel", "_role"]);
        assert_eq!(config.keys(Group::All, Usage::Any), vec!["voltage"]);
        // The surviving key keeps its used bit.
        assert_eq!(config.keys(Group::All, Usage::Used), vec!["voltage"]);
    }

    #[test]
    fn dictionary_round_trip_preserves_entries() {
        let config = sample();
        let dict = config.dictionary(Group::All, Usage::Any);
        let rebuilt = Configuration::from_dictionary(dict.clone());
        assert_eq!(rebuilt.dictionary(Group::All, Usage::Any), dict);
    }
}
