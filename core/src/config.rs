//! Run configuration: an ordered key/value map whose entries can be locked by
//! a named writer.
//!
//! Locking is advisory. It keeps one subsystem from clobbering values another
//! subsystem owns; it is not a mutual-exclusion primitive.

use std::collections::HashMap;
use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::warn;

/// Key reserved for runkit's own bookkeeping; hidden from [`Config::keys`].
pub const RESERVED_KEY: &str = "_runkit";

/// Integer identity handed to a writer the first time it locks a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WriterId(u32);

impl fmt::Display for WriterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    items: IndexMap<String, Value>,
    locked: HashMap<String, WriterId>,
    writers: HashMap<String, WriterId>,
    writer_names: HashMap<WriterId, String>,
    next_writer: u32,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(items: IndexMap<String, Value>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }

    /// Writes `key` unless it is locked by someone other than `writer`.
    ///
    /// A rejected write is dropped, not reported as an error; the return value
    /// says whether the value was stored.
    pub fn set(&mut self, key: impl Into<String>, value: Value, writer: Option<&str>) -> bool {
        let key = key.into();
        if !self.may_write(&key, writer) {
            warn!(key = %key, "config item was locked; dropping write");
            return false;
        }
        self.items.insert(key, value);
        true
    }

    /// [`Config::set`] for every entry of `entries`. Returns how many were
    /// stored.
    pub fn update<I>(&mut self, entries: I, writer: Option<&str>) -> usize
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut stored = 0;
        for (key, value) in entries {
            if self.set(key, value, writer) {
                stored += 1;
            }
        }
        stored
    }

    /// Inserts entries whose keys are not present yet.
    pub fn setdefaults<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        for (key, value) in entries {
            self.items.entry(key).or_insert(value);
        }
    }

    /// Writes every entry and locks it to `writer`. Keys already locked by a
    /// different writer are skipped.
    pub fn update_locked<I>(&mut self, entries: I, writer: &str) -> usize
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let id = self.register_writer(writer);
        let mut stored = 0;
        for (key, value) in entries {
            match self.locked.get(&key) {
                Some(holder) if *holder != id => {
                    warn!(key = %key, writer, "config item locked by another writer");
                }
                _ => {
                    self.locked.insert(key.clone(), id);
                    self.items.insert(key, value);
                    stored += 1;
                }
            }
        }
        stored
    }

    /// User-visible keys, in insertion order.
    pub fn keys(&self) -> Vec<&str> {
        self.items
            .keys()
            .map(String::as_str)
            .filter(|key| *key != RESERVED_KEY)
            .collect()
    }

    pub fn as_map(&self) -> &IndexMap<String, Value> {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Name of the writer holding the lock on `key`, if any.
    pub fn locked_by(&self, key: &str) -> Option<&str> {
        self.locked
            .get(key)
            .and_then(|id| self.writer_names.get(id))
            .map(String::as_str)
    }

    pub fn writer_id(&self, writer: &str) -> Option<WriterId> {
        self.writers.get(writer).copied()
    }

    pub fn writer_name(&self, id: WriterId) -> Option<&str> {
        self.writer_names.get(&id).map(String::as_str)
    }

    fn may_write(&self, key: &str, writer: Option<&str>) -> bool {
        match self.locked.get(key) {
            None => true,
            Some(holder) => writer.and_then(|name| self.writers.get(name)) == Some(holder),
        }
    }

    fn register_writer(&mut self, writer: &str) -> WriterId {
        if let Some(id) = self.writers.get(writer) {
            return *id;
        }
        let id = WriterId(self.next_writer);
        self.next_writer += 1;
        self.writers.insert(writer.to_string(), id);
        self.writer_names.insert(id, writer.to_string());
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entries(pairs: &[(&str, Value)]) -> Vec<(String, Value)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn lock_holder_keeps_writing_others_are_dropped() {
        let mut config = Config::new();
        config.update_locked(entries(&[("lr", json!(0.1))]), "sweep");

        assert!(!config.set("lr", json!(0.5), Some("user")));
        assert!(!config.set("lr", json!(0.7), None));
        assert_eq!(config.get("lr"), Some(&json!(0.1)));

        assert!(config.set("lr", json!(0.2), Some("sweep")));
        assert_eq!(config.get("lr"), Some(&json!(0.2)));
        assert_eq!(config.locked_by("lr"), Some("sweep"));
    }

    #[test]
    fn other_writer_cannot_steal_a_lock() {
        let mut config = Config::new();
        config.update_locked(entries(&[("epochs", json!(10))]), "a");
        let stored = config.update_locked(
            entries(&[("epochs", json!(99)), ("batch", json!(32))]),
            "b",
        );

        assert_eq!(stored, 1);
        assert_eq!(config.get("epochs"), Some(&json!(10)));
        assert_eq!(config.locked_by("epochs"), Some("a"));
        assert_eq!(config.locked_by("batch"), Some("b"));
    }

    #[test]
    fn writer_ids_are_stable_and_bidirectional() {
        let mut config = Config::new();
        config.update_locked(entries(&[("x", json!(1))]), "first");
        config.update_locked(entries(&[("y", json!(2))]), "second");
        config.update_locked(entries(&[("z", json!(3))]), "first");

        let first = config.writer_id("first").expect("first id");
        let second = config.writer_id("second").expect("second id");
        assert!(first < second);
        assert_eq!(config.writer_name(first), Some("first"));
        assert_eq!(config.writer_name(second), Some("second"));
    }

    #[test]
    fn setdefaults_does_not_overwrite() {
        let mut config = Config::from_map(IndexMap::from([("a".to_string(), json!(1))]));
        config.setdefaults(entries(&[("a", json!(2)), ("b", json!(3))]));
        assert_eq!(config.get("a"), Some(&json!(1)));
        assert_eq!(config.get("b"), Some(&json!(3)));
    }

    #[test]
    fn reserved_key_is_hidden_from_keys() {
        let mut config = Config::new();
        config.set("b", json!(1), None);
        config.set(RESERVED_KEY, json!({"cli_version": "0.0.0"}), None);
        config.set("a", json!(2), None);

        assert_eq!(config.keys(), vec!["b", "a"]);
        assert_eq!(config.len(), 3);
    }
}
