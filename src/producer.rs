//! The producer endpoint: binds a set and its pulses to well-known
//! datastore keys.
//!
//! Under a `{prefix}` derived from the base path and node name, the
//! endpoint publishes the set's class name, a live snapshot callback, and
//! one bundle key per configured cadence:
//!
//! ```text
//! {prefix}.classname       constant class name
//! {prefix}.all             callback returning every item snapshot
//! {prefix}.pulsars         tag -> bundle map (seeded empty)
//! {prefix}.pulsars.{tag}   latest bundle for that cadence
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::cadence::format_tag;
use crate::datastore::{Datastore, DatastoreError, StoreValue};
use crate::pulse::{BundleSink, Pulse, PulseConfig, PulseError, MIN_INTERVAL};
use crate::set::{Set, TransmitSink};

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("cadence {0:?} is shorter than 100 ms")]
    CadenceTooShort(Duration),

    #[error(transparent)]
    Pulse(#[from] PulseError),

    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

/// Endpoint configuration. The node name defaults to the pluralized
/// lowercased class name (`Dog` -> `dogs`).
#[derive(Clone, Debug)]
pub struct ProducerConfig {
    pub base_path: String,
    pub node_name: Option<String>,
    pub cadences: Vec<Duration>,
    pub allow_empty_transmissions: bool,
    pub include_checksums: bool,
}

impl ProducerConfig {
    pub fn new(base_path: impl Into<String>, cadences: Vec<Duration>) -> Self {
        Self {
            base_path: base_path.into(),
            node_name: None,
            cadences,
            allow_empty_transmissions: true,
            include_checksums: false,
        }
    }
}

/// Writes each emitted bundle to one datastore key.
struct KeyedBundleSink {
    store: Arc<dyn Datastore>,
    key: String,
}

#[async_trait]
impl BundleSink for KeyedBundleSink {
    async fn deliver(&self, bundle: &[String]) -> Result<(), PulseError> {
        let value = Value::Array(bundle.iter().cloned().map(Value::String).collect());
        self.store
            .set(&self.key, value.into())
            .await
            .map_err(|e| PulseError::Delivery(e.to_string()))
    }
}

pub struct ProducerEndpoint {
    set: Set,
    store: Arc<dyn Datastore>,
    prefix: String,
    /// `(tag, interval)` per configured cadence.
    cadences: Vec<(String, Duration)>,
    allow_empty: bool,
    include_checksums: bool,
    pulses: Mutex<Vec<Pulse>>,
}

impl ProducerEndpoint {
    /// Register the endpoint's read-side keys and return the bound
    /// endpoint. Pulses do not run until [`ProducerEndpoint::start`].
    pub async fn bind(
        set: Set,
        store: Arc<dyn Datastore>,
        config: ProducerConfig,
    ) -> Result<Self, ProducerError> {
        for cadence in &config.cadences {
            if *cadence < MIN_INTERVAL {
                return Err(ProducerError::CadenceTooShort(*cadence));
            }
        }

        let class_name = set.class().name().to_string();
        let node_name = config
            .node_name
            .clone()
            .unwrap_or_else(|| default_node_name(&class_name));
        let prefix = if config.base_path.is_empty() {
            node_name
        } else {
            format!("{}.{}", config.base_path, node_name)
        };
        let cadences: Vec<(String, Duration)> = config
            .cadences
            .iter()
            .map(|&d| (format_tag(d), d))
            .collect();

        store
            .set(&format!("{}.classname", prefix), json!(class_name).into())
            .await?;

        let snapshot_source = set.clone();
        store
            .set(
                &format!("{}.all", prefix),
                StoreValue::Producer(Arc::new(move || {
                    serde_json::to_value(snapshot_source.all()).unwrap_or(Value::Null)
                })),
            )
            .await?;

        let mut initial = serde_json::Map::new();
        for (tag, _) in &cadences {
            initial.insert(tag.clone(), json!([]));
        }
        store
            .set(&format!("{}.pulsars", prefix), Value::Object(initial).into())
            .await?;

        Ok(Self {
            set,
            store,
            prefix,
            cadences,
            allow_empty: config.allow_empty_transmissions,
            include_checksums: config.include_checksums,
            pulses: Mutex::new(Vec::new()),
        })
    }

    /// The dot-path every published key hangs under.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Tags of the configured cadences, in configuration order.
    pub fn tags(&self) -> Vec<String> {
        self.cadences.iter().map(|(tag, _)| tag.clone()).collect()
    }

    /// Build one pulse per cadence, wire each to its bundle key, install
    /// them as the set's sink list, and start their timers. Calling
    /// `start` again after `stop` rebuilds the pulses.
    pub fn start(&self) -> Result<(), ProducerError> {
        self.stop();

        let mut pulses = Vec::with_capacity(self.cadences.len());
        let mut sinks = Vec::with_capacity(self.cadences.len());
        for (tag, interval) in &self.cadences {
            let pulse = Pulse::new(PulseConfig {
                interval: *interval,
                collapse: true,
                allow_empty: self.allow_empty,
                include_checksums: self.include_checksums,
            })?;
            pulse.set_transmit(vec![Arc::new(KeyedBundleSink {
                store: Arc::clone(&self.store),
                key: format!("{}.pulsars.{}", self.prefix, tag),
            })]);
            sinks.push(TransmitSink::Coalescing(pulse.clone()));
            pulses.push(pulse);
        }

        self.set.set_transmit(sinks);
        for pulse in &pulses {
            pulse.start();
        }
        *self.pulses.lock().unwrap() = pulses;
        Ok(())
    }

    /// Stop every running pulse. Safe to call repeatedly.
    pub fn stop(&self) {
        for pulse in self.pulses.lock().unwrap().drain(..) {
            pulse.stop();
        }
    }
}

impl Drop for ProducerEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

fn default_node_name(class_name: &str) -> String {
    format!("{}s", class_name.to_lowercase())
}
