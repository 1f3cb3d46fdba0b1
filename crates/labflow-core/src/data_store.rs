//! The global, dot-addressed data store.

use indexmap::IndexMap;
use labflow_proto::{StoreRead, Value};
use std::collections::HashMap;

/// Flat key/value state shared by every part of an experiment.
///
/// Keys are dotted strings created on first write. Reads of absent keys
/// yield `None`. Mutation is crate-private: the engine pairs every write with
/// a `data_written` trace event, and replay rebuilds a store by folding those
/// events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataStore {
    values: HashMap<String, Value>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a store from an experiment's initial values.
    pub fn from_initial(values: &IndexMap<String, Value>) -> Self {
        Self {
            values: values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Writes `value` under `key`, returning the previous value.
    pub(crate) fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Keys under a dotted namespace, e.g. every `fan.*` key for `"fan"`.
    pub fn keys_under(&self, namespace: &str) -> Vec<&str> {
        self.keys()
            .into_iter()
            .filter(|k| {
                k.len() > namespace.len()
                    && k.starts_with(namespace)
                    && k.as_bytes()[namespace.len()] == b'.'
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The store as a JSON object with sorted keys.
    pub fn to_json(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .keys()
            .into_iter()
            .filter_map(|k| self.values.get(k).map(|v| (k.to_string(), v.clone())))
            .collect();
        Value::Object(map)
    }
}

impl FromIterator<(String, Value)> for DataStore {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl StoreRead for DataStore {
    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn entries(&self) -> Vec<(String, Value)> {
        self.keys()
            .into_iter()
            .filter_map(|k| self.values.get(k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }
}
