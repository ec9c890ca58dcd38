//! The consumer engine: a reconnecting runloop that mirrors a producer's
//! set into a local one.
//!
//! The loop has two phases. In the initial phase it validates the
//! producer's published class name and cadence tags, fetches the full
//! snapshot, and forcibly converges the local set onto it. It then polls
//! the chosen cadence's bundle key, applying each bundle through the
//! set's receive path, gated by the bundle's checksum framing when the
//! producer publishes it. Any failure drops the loop back to the initial
//! phase and walks the backoff schedule; a cold-starting producer is
//! simply retried until its keys appear. `resync` forces the same
//! full-snapshot path on demand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::backoff::Backoff;
use crate::cadence::{parse_tag, CadenceError};
use crate::datastore::{Datastore, DatastoreError};
use crate::item::{ClassRegistry, Item};
use crate::set::Set;
use crate::wire::{parse_event, ItemSnapshot, WireEvent};

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer is already running")]
    AlreadyRunning,

    #[error("consumer is not running")]
    NotRunning,

    #[error("no class registered under {0}")]
    UnknownClass(String),
}

/// Why one loop iteration failed. Every variant is recoverable: the loop
/// logs it, returns to the initial phase, and backs off.
#[derive(Error, Debug)]
enum LoopError {
    #[error(transparent)]
    Store(#[from] DatastoreError),

    #[error("producer has not published a class name")]
    MissingClassName,

    #[error("producer class {actual} does not match configured class {expected}")]
    ClassNameMismatch { expected: String, actual: String },

    #[error("producer does not offer pulsar {0}")]
    UnknownPulsar(String),

    #[error(transparent)]
    Cadence(#[from] CadenceError),

    #[error("snapshot could not be applied: {0}")]
    Snapshot(String),

    #[error("bundle value is not an array of payloads: {0}")]
    BadBundle(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Initial,
    Polling {
        poll_interval: Duration,
        counter: u32,
    },
}

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// The producer's `{prefix}`.
    pub path: String,
    /// Cadence tag to poll, e.g. `"1s"`.
    pub pulsar: String,
    /// Internal loop step.
    pub runloop_interval: Duration,
    /// Delays applied after successive failures.
    pub backoff_schedule: Vec<Duration>,
}

impl ConsumerConfig {
    pub fn new(path: impl Into<String>, pulsar: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pulsar: pulsar.into(),
            runloop_interval: Duration::from_secs(1),
            backoff_schedule: Backoff::default_schedule(),
        }
    }
}

struct Shared {
    set: Set,
    store: Arc<dyn Datastore>,
    config: ConsumerConfig,
    running: AtomicBool,
    /// Reentrancy guard: only one iteration in flight.
    in_flight: AtomicBool,
    phase: Mutex<Phase>,
    backoff: Mutex<Backoff>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
}

pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    pub fn new(set: Set, store: Arc<dyn Datastore>, config: ConsumerConfig) -> Self {
        let backoff = Backoff::new(config.backoff_schedule.clone());
        Self {
            shared: Arc::new(Shared {
                set,
                store,
                config,
                running: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                phase: Mutex::new(Phase::Initial),
                backoff: Mutex::new(backoff),
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// Build a consumer whose mirror set manages the class registered
    /// under `class_name`, resolving it through the registry instead of
    /// taking a pre-built set. Fails when no such class is registered.
    pub fn from_registry(
        registry: &ClassRegistry,
        class_name: &str,
        store: Arc<dyn Datastore>,
        config: ConsumerConfig,
    ) -> Result<Self, ConsumerError> {
        let class = registry
            .get(class_name)
            .ok_or_else(|| ConsumerError::UnknownClass(class_name.to_string()))?;
        Ok(Self::new(Set::new(class), store, config))
    }

    /// The mirror set this consumer maintains.
    pub fn set(&self) -> Set {
        self.shared.set.clone()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// True once the initial snapshot has been applied and the loop is
    /// polling for bundles.
    pub fn is_polling(&self) -> bool {
        matches!(*self.shared.phase.lock().unwrap(), Phase::Polling { .. })
    }

    /// Begin the runloop. The first tick happens one runloop interval in
    /// the future; no datastore traffic happens inside this call.
    pub fn start(&self) -> Result<(), ConsumerError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyRunning);
        }
        *self.shared.phase.lock().unwrap() = Phase::Initial;
        self.shared.backoff.lock().unwrap().reset();

        let (tx, mut shutdown) = broadcast::channel(1);
        *self.shared.shutdown.lock().unwrap() = Some(tx);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let step = shared.config.runloop_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(step) => {
                        if !shared.running.load(Ordering::SeqCst) {
                            break;
                        }
                        if shared.in_flight.swap(true, Ordering::SeqCst) {
                            continue;
                        }
                        if let Err(e) = run_iteration(&shared).await {
                            log::warn!(
                                "consumer iteration failed ({}): {}",
                                shared.config.path,
                                e
                            );
                            *shared.phase.lock().unwrap() = Phase::Initial;
                            let delay = shared.backoff.lock().unwrap().advance();
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        shared.in_flight.store(false, Ordering::SeqCst);
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
        Ok(())
    }

    /// Halt the runloop. A tick already in flight finishes; the next one
    /// never runs.
    pub fn stop(&self) -> Result<(), ConsumerError> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Err(ConsumerError::NotRunning);
        }
        if let Some(tx) = self.shared.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        *self.shared.phase.lock().unwrap() = Phase::Initial;
        self.shared.backoff.lock().unwrap().reset();
        Ok(())
    }

    /// Force the next tick through the full-snapshot path. Performs no
    /// I/O itself.
    pub fn resync(&self) -> Result<(), ConsumerError> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(ConsumerError::NotRunning);
        }
        *self.shared.phase.lock().unwrap() = Phase::Initial;
        self.shared.backoff.lock().unwrap().reset();
        Ok(())
    }
}

async fn run_iteration(shared: &Shared) -> Result<(), LoopError> {
    let phase = *shared.phase.lock().unwrap();
    match phase {
        Phase::Initial => initialize(shared).await,
        Phase::Polling {
            poll_interval,
            counter,
        } => {
            let counter = counter + 1;
            let elapsed = counter as u128 * shared.config.runloop_interval.as_millis();
            let due = elapsed >= poll_interval.as_millis();
            // Write the counter before any I/O so a concurrent resync is
            // not clobbered afterwards.
            *shared.phase.lock().unwrap() = Phase::Polling {
                poll_interval,
                counter: if due { 0 } else { counter },
            };
            if due {
                poll(shared).await?;
                shared.backoff.lock().unwrap().reset();
            }
            Ok(())
        }
    }
}

/// Validate the producer's published identity, fetch the snapshot, and
/// converge onto it.
async fn initialize(shared: &Shared) -> Result<(), LoopError> {
    let path = &shared.config.path;

    let published = shared.store.get(&format!("{}.classname", path)).await?;
    let published = published.as_ref().and_then(Value::as_str).unwrap_or("");
    if published.is_empty() {
        return Err(LoopError::MissingClassName);
    }
    let declared = shared.set.class().name().to_string();
    if published != declared {
        return Err(LoopError::ClassNameMismatch {
            expected: declared,
            actual: published.to_string(),
        });
    }

    let pulsars = shared.store.get(&format!("{}.pulsars", path)).await?;
    let offered = pulsars
        .as_ref()
        .and_then(Value::as_object)
        .map_or(false, |tags| tags.contains_key(&shared.config.pulsar));
    if !offered {
        return Err(LoopError::UnknownPulsar(shared.config.pulsar.clone()));
    }

    let all = shared
        .store
        .get(&format!("{}.all", path))
        .await?
        .unwrap_or_else(|| Value::Array(Vec::new()));
    let snapshots: Vec<ItemSnapshot> =
        serde_json::from_value(all).map_err(|e| LoopError::Snapshot(e.to_string()))?;
    let class = shared.set.class();
    let items: Vec<Item> = snapshots
        .iter()
        .map(|snapshot| Item::from_snapshot(&class, snapshot))
        .collect::<Result<_, _>>()
        .map_err(|e| LoopError::Snapshot(e.to_string()))?;
    shared
        .set
        .update_set_to(items)
        .map_err(|e| LoopError::Snapshot(e.to_string()))?;

    shared.backoff.lock().unwrap().reset();
    let poll_interval = parse_tag(&shared.config.pulsar)?;
    *shared.phase.lock().unwrap() = Phase::Polling {
        poll_interval,
        counter: 0,
    };
    log::info!("consumer synchronized from {} snapshot", path);
    Ok(())
}

async fn poll(shared: &Shared) -> Result<(), LoopError> {
    let key = format!("{}.pulsars.{}", shared.config.path, shared.config.pulsar);
    let updates = shared.store.get(&key).await?;
    apply_updates(&shared.set, updates)
}

/// Apply one polled bundle.
///
/// When the bundle leads with checksum framing, an end checksum equal to
/// the set's current checksum means the whole bundle is already applied
/// and is discarded; a mismatched start checksum is logged but the bundle
/// is still applied, since it may repair the divergence. Entries that
/// fail to apply are logged and skipped so one bad payload cannot wedge
/// the loop; the end-checksum comparison afterwards surfaces any damage.
fn apply_updates(set: &Set, updates: Option<Value>) -> Result<(), LoopError> {
    let entries = match updates {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Array(entries)) => entries,
        Some(other) => return Err(LoopError::BadBundle(other.to_string())),
    };
    let payloads: Vec<String> = entries
        .into_iter()
        .filter_map(|entry| match entry {
            Value::String(payload) => Some(payload),
            other => {
                log::warn!("skipping non-string bundle entry: {}", other);
                None
            }
        })
        .collect();
    if payloads.is_empty() {
        return Ok(());
    }

    let framing = parse_event(&payloads[0]).ok().filter(WireEvent::is_framing);
    if let Some(WireEvent::Comment {
        start_checksum,
        end_checksum: Some(end),
        ..
    }) = &framing
    {
        let current = set.checksum();
        if *end == current {
            log::debug!("bundle ends at our checksum; nothing to apply");
            return Ok(());
        }
        if let Some(start) = start_checksum {
            if *start != current {
                log::warn!("bundle start checksum diverges from local state");
            }
        }
    }

    for payload in &payloads {
        if let Err(e) = set.receive(payload) {
            log::warn!("skipping bundle entry: {}", e);
        }
    }

    if let Some(WireEvent::Comment {
        end_checksum: Some(end),
        ..
    }) = &framing
    {
        if *end != set.checksum() {
            log::warn!("checksum mismatch after applying bundle; resync will reconcile");
        }
    }
    Ok(())
}
