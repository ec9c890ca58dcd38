//! The managed set: a uniquely-keyed, insertion-ordered collection of
//! items of one declared class, and the unit of replication.
//!
//! A `Set` is a cloneable handle over mutex-guarded state; every mutation,
//! observer callback, and sink submission happens synchronously inside the
//! mutating call. Replication is wired up on both ends of the pipe:
//! outbound, mutations are submitted to the configured transmit sinks;
//! inbound, [`Set::receive`] applies wire payloads so the same mutations
//! replay against a mirror, firing the same local events.
//!
//! Observer callbacks run while the set's lock is held; they must not
//! call back into the set. Sinks are invoked after the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::checksum::sha256_hex;
use crate::events::{Emitter, ItemChange, SetEvent, SubscriptionId};
use crate::item::{Item, ItemClass, ItemError};
use crate::pulse::Pulse;
use crate::scalar::Scalar;
use crate::wire::{parse_event, ItemSnapshot, WireError, WireEvent};

#[derive(Error, Debug)]
pub enum SetError {
    #[error("item class {actual} does not match set class {expected}")]
    WrongType { expected: String, actual: String },

    #[error("duplicate item id: {0}")]
    DuplicateId(String),

    #[error("no item with id: {0}")]
    NotFound(String),

    #[error("change references unknown item: {0}")]
    UnknownItem(String),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Item(#[from] ItemError),
}

/// A destination for outbound events: either a payload function invoked
/// with each framed JSON event, or a pulse that coalesces events into
/// periodic bundles.
#[derive(Clone)]
pub enum TransmitSink {
    Payload(PayloadSink),
    Coalescing(Pulse),
}

pub type PayloadSink = Arc<dyn Fn(&str) + Send + Sync>;

struct SetInner {
    class: Arc<ItemClass>,
    items: HashMap<String, Item>,
    /// Item ids in insertion order.
    order: Vec<String>,
    added: Emitter<ItemSnapshot>,
    removed: Emitter<String>,
    changed: Emitter<ItemChange>,
    sinks: Vec<TransmitSink>,
    last_received_at: Option<DateTime<Utc>>,
    checksum: Option<String>,
}

/// Handle to a managed set. Clones share the same underlying state.
#[derive(Clone)]
pub struct Set {
    inner: Arc<Mutex<SetInner>>,
}

/// Non-owning handle held by pulses, so a sink does not keep its set
/// alive.
#[derive(Clone)]
pub(crate) struct WeakSet {
    inner: Weak<Mutex<SetInner>>,
}

impl WeakSet {
    pub(crate) fn upgrade(&self) -> Option<Set> {
        self.inner.upgrade().map(|inner| Set { inner })
    }
}

impl Set {
    pub fn new(class: Arc<ItemClass>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SetInner {
                class,
                items: HashMap::new(),
                order: Vec::new(),
                added: Emitter::new(),
                removed: Emitter::new(),
                changed: Emitter::new(),
                sinks: Vec::new(),
                last_received_at: None,
                checksum: None,
            })),
        }
    }

    pub fn class(&self) -> Arc<ItemClass> {
        Arc::clone(&self.inner.lock().unwrap().class)
    }

    pub(crate) fn downgrade(&self) -> WeakSet {
        WeakSet {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Insert an item. The item must carry the set's class and an id not
    /// already present. Observers and sinks see an `added` event.
    pub fn add(&self, item: Item) -> Result<(), SetError> {
        let (events, sinks) = {
            let mut inner = self.inner.lock().unwrap();
            if item.class_name() != inner.class.name() {
                return Err(SetError::WrongType {
                    expected: inner.class.name().to_string(),
                    actual: item.class_name().to_string(),
                });
            }
            let id = item.id().to_string();
            if inner.items.contains_key(&id) {
                return Err(SetError::DuplicateId(id));
            }
            let mut item = item;
            item.hook();
            let snapshot = item.snapshot();
            inner.items.insert(id.clone(), item);
            inner.order.push(id);
            inner.checksum = None;
            inner.added.emit(None, &snapshot);
            (vec![SetEvent::Added(snapshot)], inner.sinks.clone())
        };
        self.fan_out(&events, &sinks);
        Ok(())
    }

    /// Remove the item with the given id. Observers and sinks see a
    /// `removed` event.
    pub fn remove(&self, id: &str) -> Result<(), SetError> {
        let (events, sinks) = {
            let mut inner = self.inner.lock().unwrap();
            let mut item = inner
                .items
                .remove(id)
                .ok_or_else(|| SetError::NotFound(id.to_string()))?;
            inner.order.retain(|existing| existing != id);
            item.unhook();
            inner.checksum = None;
            let id = id.to_string();
            inner.removed.emit(None, &id);
            (vec![SetEvent::Removed { id }], inner.sinks.clone())
        };
        self.fan_out(&events, &sinks);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one item, if present.
    pub fn find(&self, id: &str) -> Option<ItemSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner.items.get(id).map(Item::snapshot)
    }

    /// Snapshots of every item, in insertion order.
    pub fn all(&self) -> Vec<ItemSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .filter_map(|id| inner.items.get(id).map(Item::snapshot))
            .collect()
    }

    /// Mutate one item in place. Changes the closure provokes are fanned
    /// out to observers and sinks when the closure returns.
    pub fn with_item<R>(&self, id: &str, f: impl FnOnce(&mut Item) -> R) -> Result<R, SetError> {
        let (result, events, sinks) = {
            let mut inner = self.inner.lock().unwrap();
            let item = inner
                .items
                .get_mut(id)
                .ok_or_else(|| SetError::NotFound(id.to_string()))?;
            let result = f(item);
            let changes = item.take_changes();
            if !changes.is_empty() {
                inner.checksum = None;
            }
            for change in &changes {
                let channel = change.property.clone();
                inner.changed.emit(Some(&channel), change);
            }
            let events: Vec<SetEvent> = changes.into_iter().map(SetEvent::Changed).collect();
            (result, events, inner.sinks.clone())
        };
        self.fan_out(&events, &sinks);
        Ok(result)
    }

    /// Write a property on a member item.
    pub fn set_property(
        &self,
        id: &str,
        name: impl Into<String>,
        value: impl Into<Scalar>,
    ) -> Result<(), SetError> {
        let name = name.into();
        let value = value.into();
        self.with_item(id, move |item| item.set_property(name, value))
    }

    /// Write a named value on a member item.
    pub fn set_named(
        &self,
        id: &str,
        name: impl Into<String>,
        value: impl Into<Scalar>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<(), SetError> {
        let name = name.into();
        let value = value.into();
        self.with_item(id, move |item| item.set_named(name, value, timestamp))
    }

    /// Apply one wire payload, replaying the remote mutation locally.
    ///
    /// `added` hydrates a new item through the set's class, `removed`
    /// drops by id, and `changed` routes to a named value (timestamp
    /// present) or property write on the referenced item. Comment
    /// records are accepted and ignored.
    pub fn receive(&self, payload: &str) -> Result<(), SetError> {
        let event = parse_event(payload)?;
        match event {
            WireEvent::Comment { .. } => {}
            WireEvent::Added { item } => {
                let item = Item::from_snapshot(&self.class(), &item)?;
                self.add(item)?;
            }
            WireEvent::Removed { item } => {
                self.remove(&item.id)?;
            }
            WireEvent::Changed { item, change } => {
                let applied = match change.new_timestamp {
                    Some(timestamp) => self.with_item(&item.id, move |target| {
                        target.set_named(change.property, change.new_value, Some(timestamp))
                    }),
                    None => self.with_item(&item.id, move |target| {
                        target.set_property(change.property, change.new_value)
                    }),
                };
                applied.map_err(|e| match e {
                    SetError::NotFound(id) => SetError::UnknownItem(id),
                    other => other,
                })?;
            }
        }
        self.inner.lock().unwrap().last_received_at = Some(Utc::now());
        Ok(())
    }

    /// Instant of the last successfully received payload.
    pub fn last_received_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().unwrap().last_received_at
    }

    /// Forcibly converge on a target membership: add items we lack,
    /// remove items the target lacks, then update items present on both
    /// sides. Each step emits its ordinary events.
    pub fn update_set_to(&self, targets: Vec<Item>) -> Result<(), SetError> {
        let existing: Vec<String> = self.inner.lock().unwrap().order.clone();
        let target_ids: HashSet<String> =
            targets.iter().map(|item| item.id().to_string()).collect();

        let (to_update, to_add): (Vec<Item>, Vec<Item>) = targets
            .into_iter()
            .partition(|item| existing.contains(&item.id().to_string()));
        let to_remove: Vec<String> = existing
            .into_iter()
            .filter(|id| !target_ids.contains(id))
            .collect();

        for item in to_add {
            self.add(item)?;
        }
        for id in to_remove {
            self.remove(&id)?;
        }
        for target in to_update {
            let id = target.id().to_string();
            self.with_item(&id, |item| item.update_to(&target))??;
        }
        Ok(())
    }

    /// Digest of the whole set: per-item checksums concatenated in
    /// ascending id order, hashed. Cached until the next mutation.
    pub fn checksum(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cached) = &inner.checksum {
            return cached.clone();
        }
        let mut ids: Vec<String> = inner.items.keys().cloned().collect();
        ids.sort();
        let mut concatenated = String::new();
        for id in &ids {
            if let Some(item) = inner.items.get_mut(id) {
                concatenated.push_str(&item.checksum());
            }
        }
        let digest = sha256_hex(concatenated);
        inner.checksum = Some(digest.clone());
        digest
    }

    /// Install the outbound sink list, replacing any previous one. Pass
    /// an empty list to disable transmission. Pulses in the list are
    /// bound to this set so checksum framing can read it.
    pub fn set_transmit(&self, sinks: Vec<TransmitSink>) {
        for sink in &sinks {
            if let TransmitSink::Coalescing(pulse) = sink {
                pulse.bind_set(self.downgrade());
            }
        }
        self.inner.lock().unwrap().sinks = sinks;
    }

    pub fn clear_transmit(&self) {
        self.inner.lock().unwrap().sinks.clear();
    }

    pub fn on_added(
        &self,
        callback: impl FnMut(&ItemSnapshot) + Send + 'static,
    ) -> SubscriptionId {
        self.inner.lock().unwrap().added.subscribe(callback)
    }

    pub fn on_removed(&self, callback: impl FnMut(&String) + Send + 'static) -> SubscriptionId {
        self.inner.lock().unwrap().removed.subscribe(callback)
    }

    pub fn on_changed(&self, callback: impl FnMut(&ItemChange) + Send + 'static) -> SubscriptionId {
        self.inner.lock().unwrap().changed.subscribe(callback)
    }

    pub fn on_property_changed(
        &self,
        property: impl Into<String>,
        callback: impl FnMut(&ItemChange) + Send + 'static,
    ) -> SubscriptionId {
        self.inner
            .lock()
            .unwrap()
            .changed
            .subscribe_channel(property, callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.added.unsubscribe(id) || inner.removed.unsubscribe(id) || inner.changed.unsubscribe(id)
    }

    /// Deliver events to sinks, outside the set lock. A payload sink gets
    /// each event framed as JSON; a pulse gets the structured event.
    fn fan_out(&self, events: &[SetEvent], sinks: &[TransmitSink]) {
        if sinks.is_empty() || events.is_empty() {
            return;
        }
        for event in events {
            let wire = event.to_wire();
            for sink in sinks {
                match sink {
                    TransmitSink::Payload(deliver) => match wire.to_payload() {
                        Ok(payload) => deliver(&payload),
                        Err(e) => log::error!("failed to frame outbound payload: {}", e),
                    },
                    TransmitSink::Coalescing(pulse) => pulse.queue(event),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dog_class() -> Arc<ItemClass> {
        ItemClass::new("Dog", ["name", "age"])
    }

    fn dog(id: &str) -> Item {
        Item::new(dog_class(), Some(id.to_string()))
    }

    fn t(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, secs).unwrap()
    }

    #[test]
    fn test_add_find_all_in_insertion_order() {
        let set = Set::new(dog_class());
        set.add(dog("b")).unwrap();
        set.add(dog("a")).unwrap();

        assert!(set.contains("a"));
        assert_eq!(set.find("b").unwrap().id, "b");
        let ids: Vec<String> = set.all().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["b", "a"]);
    }

    #[test]
    fn test_add_rejects_duplicates_and_other_classes() {
        let set = Set::new(dog_class());
        set.add(dog("dog1")).unwrap();
        assert!(matches!(
            set.add(dog("dog1")),
            Err(SetError::DuplicateId(_))
        ));

        let cat = Item::new(ItemClass::new("Cat", ["name"]), None);
        assert!(matches!(set.add(cat), Err(SetError::WrongType { .. })));
    }

    #[test]
    fn test_remove_unknown_id_fails() {
        let set = Set::new(dog_class());
        assert!(matches!(set.remove("ghost"), Err(SetError::NotFound(_))));
    }

    #[test]
    fn test_added_and_removed_observers_fire() {
        let set = Set::new(dog_class());
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&added);
        let r = Arc::clone(&removed);
        set.on_added(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        set.on_removed(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        set.add(dog("dog1")).unwrap();
        set.remove("dog1").unwrap();
        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_member_changes_reach_set_observers() {
        let set = Set::new(dog_class());
        set.add(dog("dog1")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set.on_changed(move |change| sink.lock().unwrap().push(change.clone()));

        set.set_property("dog1", "name", "Rex").unwrap();
        set.set_named("dog1", "mood", "sleepy", Some(t(0))).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].property, "name");
        assert_eq!(seen[1].property, "mood");
        assert_eq!(seen[1].new_timestamp, Some(t(0)));
    }

    #[test]
    fn test_per_property_set_observer() {
        let set = Set::new(dog_class());
        set.add(dog("dog1")).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        set.on_property_changed("age", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        set.set_property("dog1", "name", "Rex").unwrap();
        set.set_property("dog1", "age", 3).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_payload_sink_receives_framed_events() {
        let set = Set::new(dog_class());
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&payloads);
        set.set_transmit(vec![TransmitSink::Payload(Arc::new(move |payload: &str| {
            sink.lock().unwrap().push(payload.to_string());
        }))]);

        set.add(dog("dog1")).unwrap();
        set.set_property("dog1", "name", "Rex").unwrap();
        set.remove("dog1").unwrap();

        let payloads = payloads.lock().unwrap();
        assert_eq!(payloads.len(), 3);
        assert!(payloads[0].contains("\"event_name\":\"added\""));
        assert!(payloads[1].contains("\"event_name\":\"changed\""));
        assert!(payloads[2].contains("\"event_name\":\"removed\""));
    }

    #[test]
    fn test_receive_added_then_changed_then_removed() {
        let producer = Set::new(dog_class());
        let consumer = Set::new(dog_class());
        let payloads = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&payloads);
        producer.set_transmit(vec![TransmitSink::Payload(Arc::new(
            move |payload: &str| {
                sink.lock().unwrap().push(payload.to_string());
            },
        ))]);

        let mut rex = dog("dog1");
        rex.set_property("name", "Rex");
        producer.add(rex).unwrap();
        producer.set_property("dog1", "age", 3).unwrap();
        producer.set_named("dog1", "mood", "sleepy", Some(t(0))).unwrap();

        for payload in payloads.lock().unwrap().iter() {
            consumer.receive(payload).unwrap();
        }
        assert_eq!(consumer.checksum(), producer.checksum());
        assert!(consumer.last_received_at().is_some());

        producer.remove("dog1").unwrap();
        let last = payloads.lock().unwrap().last().unwrap().clone();
        consumer.receive(&last).unwrap();
        assert!(!consumer.contains("dog1"));
        assert_eq!(consumer.checksum(), producer.checksum());
    }

    #[test]
    fn test_receive_error_classification() {
        let set = Set::new(dog_class());
        assert!(matches!(
            set.receive("{broken"),
            Err(SetError::Wire(WireError::Malformed(_)))
        ));
        assert!(matches!(
            set.receive(r#"{"event_name":"renamed","item":{"id":"x"}}"#),
            Err(SetError::Wire(WireError::UnknownEvent(_)))
        ));
        assert!(matches!(
            set.receive(
                r#"{"event_name":"changed","item":{"id":"ghost"},"change":{"property":"name","new_value":"x"}}"#
            ),
            Err(SetError::UnknownItem(_))
        ));
    }

    #[test]
    fn test_receive_ignores_comment_records() {
        let set = Set::new(dog_class());
        set.receive(r#"{"event_name":"comment","_metadata":true,"end_checksum":"aa"}"#)
            .unwrap();
        assert!(set.is_empty());
        assert!(set.last_received_at().is_some());
    }

    #[test]
    fn test_set_checksum_is_order_independent() {
        let left = Set::new(dog_class());
        let right = Set::new(dog_class());

        let mut rex = dog("dog1");
        rex.set_property("name", "Rex");
        let mut max = dog("dog2");
        max.set_property("name", "Max");

        left.add(rex).unwrap();
        left.add(max).unwrap();

        let mut rex = dog("dog1");
        rex.set_property("name", "Rex");
        let mut max = dog("dog2");
        max.set_property("name", "Max");

        right.add(max).unwrap();
        right.add(rex).unwrap();

        assert_eq!(left.checksum(), right.checksum());
    }

    #[test]
    fn test_update_set_to_adds_removes_and_updates() {
        let set = Set::new(dog_class());
        let mut keep = dog("keep");
        keep.set_property("name", "Old Name");
        set.add(keep).unwrap();
        set.add(dog("drop")).unwrap();

        let mut keep_target = dog("keep");
        keep_target.set_property("name", "New Name");
        let fresh = dog("fresh");

        let order = Arc::new(Mutex::new(Vec::new()));
        let added_log = Arc::clone(&order);
        set.on_added(move |snapshot| added_log.lock().unwrap().push(format!("add:{}", snapshot.id)));
        let removed_log = Arc::clone(&order);
        set.on_removed(move |id| removed_log.lock().unwrap().push(format!("remove:{}", id)));
        let changed_log = Arc::clone(&order);
        set.on_changed(move |change| {
            changed_log
                .lock()
                .unwrap()
                .push(format!("change:{}", change.item_id))
        });

        set.update_set_to(vec![keep_target, fresh]).unwrap();

        assert!(set.contains("keep"));
        assert!(set.contains("fresh"));
        assert!(!set.contains("drop"));
        assert_eq!(
            set.find("keep").unwrap().properties.get("name"),
            Some(&Scalar::from("New Name"))
        );
        // Additions happen first, then removals, then in-place updates.
        assert_eq!(
            order.lock().unwrap().as_slice(),
            ["add:fresh", "remove:drop", "change:keep"]
        );
    }

    #[test]
    fn test_update_set_to_converges_checksums() {
        let producer = Set::new(dog_class());
        let mut rex = dog("dog1");
        rex.set_property("name", "Rex");
        rex.set_named("mood", "sleepy", Some(t(0)));
        producer.add(rex).unwrap();

        let consumer = Set::new(dog_class());
        consumer.add(dog("stale")).unwrap();

        let class = consumer.class();
        let targets: Vec<Item> = producer
            .all()
            .iter()
            .map(|snapshot| Item::from_snapshot(&class, snapshot).unwrap())
            .collect();
        consumer.update_set_to(targets).unwrap();

        assert_eq!(consumer.checksum(), producer.checksum());
    }
}
