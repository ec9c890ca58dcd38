//! The pulse: an event coalescer and periodic bundle emitter.
//!
//! A pulse sits between a set and the datastore. It receives the set's
//! events as they happen, folds them into a bandwidth-minimal queue
//! (add-then-remove cancels, repeated property changes keep only the
//! latest delta with the earliest pre-image), and on each timer tick
//! frames the surviving entries into a bundle for its downstream sinks,
//! optionally led by a checksum framing record so the receiver can tell
//! whether applying the bundle is worthwhile and whether it worked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::events::SetEvent;
use crate::set::WeakSet;
use crate::wire::WireEvent;

/// Intervals in (0, 100ms) are rejected; an interval of zero disables
/// the timer entirely (manual `trigger` only).
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum PulseError {
    #[error("interval must be zero or at least 100 ms")]
    IntervalTooShort,

    #[error("bundle delivery failed: {0}")]
    Delivery(String),
}

/// Knobs for one pulse.
#[derive(Clone, Debug)]
pub struct PulseConfig {
    /// Emit cadence. Zero disables the timer.
    pub interval: Duration,
    /// Fold redundant events out of each bundle.
    pub collapse: bool,
    /// Emit bundles even when nothing changed.
    pub allow_empty: bool,
    /// Lead each bundle with a start/end checksum framing record.
    pub include_checksums: bool,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            collapse: true,
            allow_empty: true,
            include_checksums: false,
        }
    }
}

/// A downstream destination for emitted bundles.
#[async_trait]
pub trait BundleSink: Send + Sync {
    async fn deliver(&self, bundle: &[String]) -> Result<(), PulseError>;
}

struct QueueEntry {
    payload: String,
    event: WireEvent,
}

impl QueueEntry {
    fn changed_property(&self) -> Option<&str> {
        match &self.event {
            WireEvent::Changed { change, .. } => Some(&change.property),
            _ => None,
        }
    }
}

struct PulseInner {
    config: PulseConfig,
    /// Queued entries; `None` marks a slot cancelled by collapsing.
    entries: Vec<Option<QueueEntry>>,
    /// Queue index of each item's live `added` entry.
    added_index: HashMap<String, usize>,
    /// Queue indices of each item's `changed` entries.
    changes_by_id: HashMap<String, Vec<usize>>,
    /// Set checksum captured when the first event of the window arrived.
    start_checksum: Option<String>,
    sinks: Vec<Arc<dyn BundleSink>>,
    set: Option<WeakSet>,
    shutdown: Option<broadcast::Sender<()>>,
}

impl PulseInner {
    fn clear(&mut self) -> (Vec<Option<QueueEntry>>, Option<String>) {
        self.added_index.clear();
        self.changes_by_id.clear();
        (
            std::mem::take(&mut self.entries),
            self.start_checksum.take(),
        )
    }
}

/// Handle to one pulse. Clones share state; the timer task holds one.
#[derive(Clone)]
pub struct Pulse {
    inner: Arc<Mutex<PulseInner>>,
}

impl Pulse {
    pub fn new(config: PulseConfig) -> Result<Self, PulseError> {
        if !config.interval.is_zero() && config.interval < MIN_INTERVAL {
            return Err(PulseError::IntervalTooShort);
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(PulseInner {
                config,
                entries: Vec::new(),
                added_index: HashMap::new(),
                changes_by_id: HashMap::new(),
                start_checksum: None,
                sinks: Vec::new(),
                set: None,
                shutdown: None,
            })),
        })
    }

    /// Replace the downstream sink list. An empty list disables output.
    pub fn set_transmit(&self, sinks: Vec<Arc<dyn BundleSink>>) {
        self.inner.lock().unwrap().sinks = sinks;
    }

    pub(crate) fn bind_set(&self, set: WeakSet) {
        self.inner.lock().unwrap().set = Some(set);
    }

    /// Accept one set event into the queue.
    pub fn queue(&self, event: &SetEvent) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if inner.config.collapse
            && inner.config.include_checksums
            && inner.entries.is_empty()
            && inner.start_checksum.is_none()
        {
            // First event of this window: remember where the set stood.
            let set = inner.set.as_ref().and_then(WeakSet::upgrade);
            inner.start_checksum = set.map(|set| set.checksum());
        }

        if !inner.config.collapse {
            Self::push(inner, event.to_wire());
            return;
        }

        match event {
            SetEvent::Added(snapshot) => {
                if let Some(index) = Self::push(inner, event.to_wire()) {
                    inner.added_index.insert(snapshot.id.clone(), index);
                }
            }
            SetEvent::Removed { id } => {
                match inner.added_index.remove(id) {
                    // The add never left this queue, so the pair cancels.
                    Some(index) => inner.entries[index] = None,
                    None => {
                        Self::push(inner, event.to_wire());
                    }
                }
                if let Some(indices) = inner.changes_by_id.remove(id) {
                    for index in indices {
                        inner.entries[index] = None;
                    }
                }
            }
            SetEvent::Changed(change) => {
                let mut wire = event.to_wire();
                let previous = inner.changes_by_id.get(&change.item_id).and_then(|indices| {
                    indices.iter().rev().copied().find(|&index| {
                        inner.entries[index].as_ref().map_or(false, |entry| {
                            entry.changed_property() == Some(change.property.as_str())
                        })
                    })
                });
                if let Some(index) = previous {
                    if let Some(entry) = inner.entries[index].take() {
                        // Keep the pre-image the first collapsed change
                        // saw, not the intermediate one.
                        if let (
                            WireEvent::Changed { change: new, .. },
                            WireEvent::Changed { change: old, .. },
                        ) = (&mut wire, entry.event)
                        {
                            new.old_value = old.old_value;
                        }
                    }
                }
                if let Some(index) = Self::push(inner, wire) {
                    inner
                        .changes_by_id
                        .entry(change.item_id.clone())
                        .or_default()
                        .push(index);
                }
            }
        }
    }

    fn push(inner: &mut PulseInner, event: WireEvent) -> Option<usize> {
        match event.to_payload() {
            Ok(payload) => {
                inner.entries.push(Some(QueueEntry { payload, event }));
                Some(inner.entries.len() - 1)
            }
            Err(e) => {
                log::error!("failed to frame queued event: {}", e);
                None
            }
        }
    }

    /// Install the repeating timer. An already-running timer is stopped
    /// first; a zero interval leaves the pulse manual-trigger only.
    pub fn start(&self) {
        let (interval, mut shutdown) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(tx) = inner.shutdown.take() {
                let _ = tx.send(());
            }
            if inner.config.interval.is_zero() {
                return;
            }
            let (tx, rx) = broadcast::channel(1);
            inner.shutdown = Some(tx);
            (inner.config.interval, rx)
        };

        let pulse = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => pulse.trigger().await,
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    /// Cancel the timer, if any. Queued events stay queued.
    pub fn stop(&self) {
        if let Some(tx) = self.inner.lock().unwrap().shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Emit the current queue as one bundle and reset the window.
    ///
    /// Called by the timer, and directly for manual flushes. With
    /// checksum framing enabled, the bundle is led by a record carrying
    /// the window's starting checksum and the set's checksum now.
    pub async fn trigger(&self) {
        let (entries, start_checksum, sinks, set, include_checksums, allow_empty) = {
            let mut inner = self.inner.lock().unwrap();
            let (entries, start_checksum) = inner.clear();
            (
                entries,
                start_checksum,
                inner.sinks.clone(),
                inner.set.clone(),
                inner.config.include_checksums,
                inner.config.allow_empty,
            )
        };
        if sinks.is_empty() {
            return;
        }

        let mut bundle: Vec<String> = entries
            .into_iter()
            .flatten()
            .map(|entry| entry.payload)
            .collect();
        if bundle.is_empty() && !allow_empty {
            return;
        }

        if include_checksums {
            if let Some(set) = set.as_ref().and_then(WeakSet::upgrade) {
                let end_checksum = set.checksum();
                let start = start_checksum.unwrap_or_else(|| end_checksum.clone());
                match WireEvent::framing(Some(start), end_checksum).to_payload() {
                    Ok(frame) => bundle.insert(0, frame),
                    Err(e) => log::error!("failed to frame bundle checksums: {}", e),
                }
            }
        }

        for sink in sinks {
            if let Err(e) = sink.deliver(&bundle).await {
                log::warn!("bundle sink delivery failed: {}", e);
            }
        }
    }
}
