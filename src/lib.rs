// Specular - typed object-set replication over key-value stores

pub mod backoff;
pub mod cadence;
pub mod checksum;
pub mod consumer;
pub mod datastore;
pub mod events;
pub mod item;
pub mod named_value;
pub mod producer;
pub mod pulse;
pub mod scalar;
pub mod set;
pub mod wire;

pub use backoff::Backoff;
pub use consumer::{Consumer, ConsumerConfig, ConsumerError};
pub use datastore::{Datastore, DatastoreError, MemoryDatastore, StoreValue};
pub use events::{ItemChange, SetEvent, SubscriptionId};
pub use item::{ClassRegistry, Item, ItemClass, ItemError};
pub use named_value::NamedValue;
pub use producer::{ProducerConfig, ProducerEndpoint, ProducerError};
pub use pulse::{BundleSink, Pulse, PulseConfig, PulseError};
pub use scalar::{Scalar, ScalarError};
pub use set::{Set, SetError, TransmitSink};
pub use wire::{ItemSnapshot, WireError, WireEvent};
