//! Change records and the synchronous observer registry.
//!
//! Items and sets notify observers through an [`Emitter`]: a list of
//! callbacks invoked synchronously, in registration order, from inside the
//! mutating call. A callback may subscribe to the generic channel (every
//! event) or to one named channel (events for a single property).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::scalar::Scalar;
use crate::wire::{ChangeRecord, ItemRef, ItemSnapshot, WireEvent};

/// Identifies one subscription; pass back to `unsubscribe`.
pub type SubscriptionId = Uuid;

/// One observed change on an item: either a property delta (no
/// timestamps) or a named-value delta (`new_timestamp` present).
#[derive(Clone, Debug, PartialEq)]
pub struct ItemChange {
    pub item_id: String,
    pub property: String,
    pub old_value: Scalar,
    pub new_value: Scalar,
    pub old_timestamp: Option<DateTime<Utc>>,
    pub new_timestamp: Option<DateTime<Utc>>,
}

/// A set-level event, fanned out to observers and transmit sinks.
#[derive(Clone, Debug)]
pub enum SetEvent {
    Added(ItemSnapshot),
    Removed { id: String },
    Changed(ItemChange),
}

impl SetEvent {
    /// Frame this event for the wire. Old timestamps stay local; the
    /// wire only carries a change's pre-image value.
    pub fn to_wire(&self) -> WireEvent {
        match self {
            SetEvent::Added(snapshot) => WireEvent::Added {
                item: snapshot.clone(),
            },
            SetEvent::Removed { id } => WireEvent::Removed {
                item: ItemRef { id: id.clone() },
            },
            SetEvent::Changed(change) => WireEvent::Changed {
                item: ItemRef {
                    id: change.item_id.clone(),
                },
                change: ChangeRecord {
                    property: change.property.clone(),
                    old_value: change.old_value.clone(),
                    new_value: change.new_value.clone(),
                    new_timestamp: change.new_timestamp,
                },
            },
        }
    }
}

type Callback<E> = Box<dyn FnMut(&E) + Send>;

struct Subscriber<E> {
    id: SubscriptionId,
    channel: Option<String>,
    callback: Callback<E>,
}

/// A synchronous, multi-subscriber callback registry.
pub struct Emitter<E> {
    subscribers: Vec<Subscriber<E>>,
}

impl<E> Emitter<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    /// Subscribe to every event.
    pub fn subscribe(&mut self, callback: impl FnMut(&E) + Send + 'static) -> SubscriptionId {
        self.push(None, Box::new(callback))
    }

    /// Subscribe to events on one named channel only.
    pub fn subscribe_channel(
        &mut self,
        channel: impl Into<String>,
        callback: impl FnMut(&E) + Send + 'static,
    ) -> SubscriptionId {
        self.push(Some(channel.into()), Box::new(callback))
    }

    fn push(&mut self, channel: Option<String>, callback: Callback<E>) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.subscribers.push(Subscriber {
            id,
            channel,
            callback,
        });
        id
    }

    /// Drop a subscription. Returns false if the id is unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Deliver an event to every generic subscriber, and to channel
    /// subscribers whose channel matches.
    pub fn emit(&mut self, channel: Option<&str>, event: &E) {
        for sub in self.subscribers.iter_mut() {
            let matches = match (&sub.channel, channel) {
                (None, _) => true,
                (Some(want), Some(got)) => want == got,
                (Some(_), None) => false,
            };
            if matches {
                (sub.callback)(event);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_generic_subscriber_sees_every_channel() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut emitter: Emitter<u32> = Emitter::new();
        let c = Arc::clone(&count);
        emitter.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(None, &1);
        emitter.emit(Some("name"), &2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_channel_subscriber_filters() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut emitter: Emitter<u32> = Emitter::new();
        let c = Arc::clone(&count);
        emitter.subscribe_channel("name", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(Some("name"), &1);
        emitter.emit(Some("other"), &2);
        emitter.emit(None, &3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut emitter: Emitter<u32> = Emitter::new();
        let c = Arc::clone(&count);
        let id = emitter.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(None, &1);
        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        emitter.emit(None, &2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
