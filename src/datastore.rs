//! The key-value transport seam.
//!
//! Replication only needs `get(key)` / `set(key, value)` over dot-separated
//! keys, so the trait stays that small. A value at a key is either plain
//! JSON or a producer callback evaluated on every read (how the endpoint
//! serves live snapshots without republishing them). [`MemoryDatastore`]
//! is the in-process implementation used by tests and demos; real
//! deployments adapt whatever store they have to the same trait.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatastoreError {
    #[error("datastore backend: {0}")]
    Backend(String),
}

/// A zero-argument callback evaluated each time its key is read.
pub type ProducerFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// What can live at a key.
pub enum StoreValue {
    Value(Value),
    Producer(ProducerFn),
}

impl From<Value> for StoreValue {
    fn from(value: Value) -> Self {
        StoreValue::Value(value)
    }
}

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Read a key. `None` when nothing has been stored there.
    async fn get(&self, key: &str) -> Result<Option<Value>, DatastoreError>;

    /// Write a key, overwriting any previous value.
    async fn set(&self, key: &str, value: StoreValue) -> Result<(), DatastoreError>;
}

#[derive(Default)]
struct MemoryInner {
    root: serde_json::Map<String, Value>,
    producers: HashMap<String, ProducerFn>,
}

/// In-memory datastore with hierarchical dot-path keys: writing
/// `a.b.c` creates the intermediate objects, and reading `a.b` returns
/// the object containing `c`. Producer callbacks are matched on the
/// exact key before the tree is consulted.
#[derive(Default)]
pub struct MemoryDatastore {
    inner: RwLock<MemoryInner>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn get(&self, key: &str) -> Result<Option<Value>, DatastoreError> {
        let producer = {
            let inner = self.inner.read().unwrap();
            inner.producers.get(key).cloned()
        };
        if let Some(producer) = producer {
            return Ok(Some(producer()));
        }

        let inner = self.inner.read().unwrap();
        let mut node: Option<&Value> = None;
        for segment in key.split('.') {
            node = match node {
                None => inner.root.get(segment),
                Some(Value::Object(map)) => map.get(segment),
                Some(_) => return Ok(None),
            };
            if node.is_none() {
                return Ok(None);
            }
        }
        Ok(node.cloned())
    }

    async fn set(&self, key: &str, value: StoreValue) -> Result<(), DatastoreError> {
        let mut inner = self.inner.write().unwrap();
        match value {
            StoreValue::Producer(producer) => {
                inner.producers.insert(key.to_string(), producer);
            }
            StoreValue::Value(value) => {
                let segments: Vec<&str> = key.split('.').collect();
                let (last, parents) = match segments.split_last() {
                    Some(split) => split,
                    None => return Ok(()),
                };
                let mut map = &mut inner.root;
                for segment in parents {
                    let entry = map
                        .entry(segment.to_string())
                        .or_insert_with(|| Value::Object(serde_json::Map::new()));
                    if !entry.is_object() {
                        *entry = Value::Object(serde_json::Map::new());
                    }
                    map = match entry.as_object_mut() {
                        Some(map) => map,
                        None => unreachable!("entry was just made an object"),
                    };
                }
                map.insert(last.to_string(), value);
            }
        }
        Ok(())
    }
}
