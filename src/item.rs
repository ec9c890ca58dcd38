//! Identified, observable items.
//!
//! An [`Item`] belongs to a declared class ([`ItemClass`]) that names it
//! and lists which properties are observed. Property writes go through an
//! explicit dispatcher (`set_property`) which runs the dirty sweep and
//! notifies observers; named values carry their own timestamps. Items
//! expose a deterministic SHA-256 checksum over their logical state and a
//! serializable snapshot, so a remote mirror can be compared and rebuilt.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::checksum::sha256_hex;
use crate::events::{Emitter, ItemChange, SubscriptionId};
use crate::named_value::NamedValue;
use crate::scalar::Scalar;
use crate::wire::{format_instant, ItemSnapshot};

#[derive(Error, Debug)]
pub enum ItemError {
    #[error("snapshot class {actual} does not match declared class {expected}")]
    ClassMismatch { expected: String, actual: String },
}

/// The declared identity of a family of items: a class name plus the
/// ordered list of observed property names.
///
/// Producer and consumer each construct (or register) the same class
/// record independently; reception validates snapshots against it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ItemClass {
    name: String,
    observed: Vec<String>,
}

impl ItemClass {
    pub fn new(
        name: impl Into<String>,
        observed: impl IntoIterator<Item = impl Into<String>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            observed: observed.into_iter().map(Into::into).collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observed_properties(&self) -> &[String] {
        &self.observed
    }
}

/// Class records keyed by class name.
#[derive(Default)]
pub struct ClassRegistry {
    classes: HashMap<String, Arc<ItemClass>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: Arc<ItemClass>) {
        self.classes.insert(class.name().to_string(), class);
    }

    pub fn get(&self, name: &str) -> Option<Arc<ItemClass>> {
        self.classes.get(name).cloned()
    }
}

/// An identified object with observed scalar properties and timestamped
/// named values.
#[derive(Debug)]
pub struct Item {
    id: String,
    class: Arc<ItemClass>,
    /// Current property values, written through `set_property`.
    values: HashMap<String, Scalar>,
    /// Ordered observed property names; starts as the class's list.
    observed: Vec<String>,
    /// Value each observed property had when last swept.
    last_observed: HashMap<String, Scalar>,
    named: BTreeMap<String, NamedValue>,
    emitter: Emitter<ItemChange>,
    /// Changes queued for the owning set, populated only while hooked.
    pending: Vec<ItemChange>,
    hooked: bool,
    checksum: Option<String>,
}

impl Item {
    /// Create an item of the given class. The id is generated when not
    /// provided. The class's observed properties are declared up front,
    /// all starting absent.
    pub fn new(class: Arc<ItemClass>, id: Option<String>) -> Self {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let observed = class.observed_properties().to_vec();
        let last_observed = observed
            .iter()
            .map(|name| (name.clone(), Scalar::Absent))
            .collect();
        Self {
            id,
            class,
            values: HashMap::new(),
            observed,
            last_observed,
            named: BTreeMap::new(),
            emitter: Emitter::new(),
            pending: Vec::new(),
            hooked: false,
            checksum: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> &Arc<ItemClass> {
        &self.class
    }

    pub fn class_name(&self) -> &str {
        self.class.name()
    }

    /// Replace the ordered list of observed property names. The sweep
    /// baseline is reset to absent and a dirty sweep runs immediately, so
    /// current values of the new names are observed (and notified) at
    /// once.
    pub fn declare_observed(&mut self, names: impl IntoIterator<Item = impl Into<String>>) {
        self.observed = names.into_iter().map(Into::into).collect();
        self.last_observed = self
            .observed
            .iter()
            .map(|name| (name.clone(), Scalar::Absent))
            .collect();
        self.checksum = None;
        self.mark_dirty();
    }

    pub fn observed_properties(&self) -> &[String] {
        &self.observed
    }

    /// Current value of a property; absent when never written.
    pub fn property(&self, name: &str) -> Scalar {
        self.values.get(name).cloned().unwrap_or(Scalar::Absent)
    }

    /// Write a property and run the dirty sweep. Writes to unobserved
    /// names are stored but produce no notification.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.values.insert(name.into(), value.into());
        self.mark_dirty();
    }

    /// Re-read every observed property and emit a change for each one
    /// whose value differs from the sweep baseline.
    pub fn mark_dirty(&mut self) {
        for i in 0..self.observed.len() {
            let name = self.observed[i].clone();
            let current = self.property(&name);
            let last = self
                .last_observed
                .get(&name)
                .cloned()
                .unwrap_or(Scalar::Absent);
            if current != last {
                self.last_observed.insert(name.clone(), current.clone());
                self.emit_change(ItemChange {
                    item_id: self.id.clone(),
                    property: name,
                    old_value: last,
                    new_value: current,
                    old_timestamp: None,
                    new_timestamp: None,
                });
            }
        }
    }

    /// Set a named value, creating the cell on first use. The timestamp
    /// defaults to now. Notifies only when `(value, timestamp)` differs
    /// from the cell's previous state.
    pub fn set_named(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Scalar>,
        timestamp: Option<DateTime<Utc>>,
    ) {
        let name = name.into();
        let value = value.into();
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        let change = match self.named.entry(name.clone()) {
            Entry::Occupied(mut occupied) => occupied
                .get_mut()
                .set(value.clone(), timestamp)
                .map(|replaced| ItemChange {
                    item_id: self.id.clone(),
                    property: name,
                    old_value: replaced.old_value,
                    new_value: value,
                    old_timestamp: Some(replaced.old_timestamp),
                    new_timestamp: Some(timestamp),
                }),
            Entry::Vacant(vacant) => {
                vacant.insert(NamedValue::new(name.clone(), value.clone(), timestamp));
                Some(ItemChange {
                    item_id: self.id.clone(),
                    property: name,
                    old_value: Scalar::Absent,
                    new_value: value,
                    old_timestamp: None,
                    new_timestamp: Some(timestamp),
                })
            }
        };
        if let Some(change) = change {
            self.emit_change(change);
        }
    }

    /// Remove a named value without notification.
    pub fn unset_named(&mut self, name: &str) -> bool {
        let removed = self.named.remove(name).is_some();
        if removed {
            self.checksum = None;
        }
        removed
    }

    pub fn named(&self, name: &str) -> Option<&NamedValue> {
        self.named.get(name)
    }

    /// Value of a named value; absent when the cell does not exist.
    pub fn get_named(&self, name: &str) -> Scalar {
        self.named
            .get(name)
            .map(|cell| cell.value().clone())
            .unwrap_or(Scalar::Absent)
    }

    pub fn named_values(&self) -> impl Iterator<Item = &NamedValue> {
        self.named.values()
    }

    /// Subscribe to every change on this item.
    pub fn on_changed(
        &mut self,
        callback: impl FnMut(&ItemChange) + Send + 'static,
    ) -> SubscriptionId {
        self.emitter.subscribe(callback)
    }

    /// Subscribe to changes of one property or named value.
    pub fn on_property_changed(
        &mut self,
        property: impl Into<String>,
        callback: impl FnMut(&ItemChange) + Send + 'static,
    ) -> SubscriptionId {
        self.emitter.subscribe_channel(property, callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.emitter.unsubscribe(id)
    }

    /// Deterministic digest of `(id, class, observed properties, named
    /// values)`. Cached until the next mutation.
    pub fn checksum(&mut self) -> String {
        if let Some(cached) = &self.checksum {
            return cached.clone();
        }
        let computed = self.compute_checksum();
        self.checksum = Some(computed.clone());
        computed
    }

    fn compute_checksum(&self) -> String {
        let mut parts = Vec::with_capacity(2 + self.observed.len() + self.named.len());
        parts.push(format!("id:{}", self.id));
        parts.push(format!("type:{}", self.class.name()));
        let mut names: Vec<&String> = self.observed.iter().collect();
        names.sort();
        for name in names {
            let value = self
                .last_observed
                .get(name)
                .cloned()
                .unwrap_or(Scalar::Absent);
            parts.push(format!("prop:{}:{}", name, value.encode()));
        }
        for (name, cell) in &self.named {
            parts.push(format!(
                "notion:{}:{}:{}",
                name,
                cell.value().encode(),
                format_instant(&cell.timestamp())
            ));
        }
        sha256_hex(parts.join("|"))
    }

    pub fn snapshot(&self) -> ItemSnapshot {
        let properties = self
            .observed
            .iter()
            .filter_map(|name| {
                let value = self.last_observed.get(name)?;
                if value.is_absent() {
                    None
                } else {
                    Some((name.clone(), value.clone()))
                }
            })
            .collect();
        let notions = self
            .named
            .iter()
            .map(|(name, cell)| (name.clone(), cell.snapshot()))
            .collect();
        ItemSnapshot {
            id: self.id.clone(),
            class_name: self.class.name().to_string(),
            notions,
            properties,
        }
    }

    /// Rebuild an item from a snapshot. The snapshot's class name must
    /// match the given class; properties and named values are restored,
    /// and the observed list is the class's own (not re-declared from the
    /// snapshot).
    pub fn from_snapshot(class: &Arc<ItemClass>, snapshot: &ItemSnapshot) -> Result<Self, ItemError> {
        if snapshot.class_name != class.name() {
            return Err(ItemError::ClassMismatch {
                expected: class.name().to_string(),
                actual: snapshot.class_name.clone(),
            });
        }
        let mut item = Item::new(Arc::clone(class), Some(snapshot.id.clone()));
        for (name, nv) in &snapshot.notions {
            item.named
                .insert(name.clone(), NamedValue::from_snapshot(nv));
        }
        for (name, value) in &snapshot.properties {
            item.values.insert(name.clone(), value.clone());
        }
        item.mark_dirty();
        Ok(item)
    }

    /// Converge this item onto `target`: copy observed properties that
    /// differ, update named values whose `(value, timestamp)` changed,
    /// drop named values absent from the target, and adopt new ones.
    pub fn update_to(&mut self, target: &Item) -> Result<(), ItemError> {
        if target.class_name() != self.class_name() {
            return Err(ItemError::ClassMismatch {
                expected: self.class_name().to_string(),
                actual: target.class_name().to_string(),
            });
        }
        for name in target.observed.clone() {
            let theirs = target.property(&name);
            if self.property(&name) != theirs {
                self.set_property(name, theirs);
            }
        }

        let ours: Vec<String> = self.named.keys().cloned().collect();
        let theirs: Vec<String> = target.named.keys().cloned().collect();
        for name in ours.iter().filter(|n| theirs.contains(*n)) {
            let cell = &target.named[name];
            self.set_named(name.clone(), cell.value().clone(), Some(cell.timestamp()));
        }
        for name in ours.iter().filter(|n| !theirs.contains(*n)) {
            self.unset_named(name);
        }
        for name in theirs.iter().filter(|n| !ours.contains(*n)) {
            let cell = &target.named[name];
            self.set_named(name.clone(), cell.value().clone(), Some(cell.timestamp()));
        }
        Ok(())
    }

    pub(crate) fn hook(&mut self) {
        self.hooked = true;
        self.pending.clear();
    }

    pub(crate) fn unhook(&mut self) {
        self.hooked = false;
        self.pending.clear();
    }

    pub(crate) fn take_changes(&mut self) -> Vec<ItemChange> {
        std::mem::take(&mut self.pending)
    }

    fn emit_change(&mut self, change: ItemChange) {
        // Invalidate before notifying so observers never see a stale digest.
        self.checksum = None;
        if self.hooked {
            self.pending.push(change.clone());
        }
        let channel = change.property.clone();
        self.emitter.emit(Some(&channel), &change);
    }
}
