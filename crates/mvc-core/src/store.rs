#![forbid(unsafe_code)]

//! Reactive state storage.
//!
//! The store holds the current value of every tracked key in insertion
//! order. Only the controller writes to it; everything else reads.

use indexmap::IndexMap;

use crate::value::Value;

/// Plain snapshot of tracked state, in declaration order.
pub type Snapshot = IndexMap<String, Value>;

#[derive(Debug, Default, Clone)]
pub struct Store {
    values: IndexMap<String, Value>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Write a value, keeping the position of an existing key.
    /// Returns the previous value.
    pub(crate) fn insert(&mut self, key: &str, value: Value) -> Option<Value> {
        match self.values.get_mut(key) {
            Some(slot) => Some(std::mem::replace(slot, value)),
            None => {
                self.values.insert(key.to_owned(), value);
                None
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.shift_remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy of all values, or only of `subset` (missing keys skipped).
    #[must_use]
    pub fn snapshot(&self, subset: Option<&[&str]>) -> Snapshot {
        match subset {
            None => self.values.clone(),
            Some(keys) => keys
                .iter()
                .filter_map(|key| Some(((*key).to_owned(), self.values.get(*key)?.clone())))
                .collect(),
        }
    }
}
