// SPDX-License-Identifier: Apache-2.0

//! Schema change detection for members without native notifications.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use qore_core::{ColumnDescriptor, SchemaListener, SubscriptionId};
use tracing::debug;

pub type TableSignatures = BTreeMap<String, Vec<ColumnDescriptor>>;

/// Remembers the last seen table signatures and notifies listeners of the
/// difference when given a fresh listing.
#[derive(Default)]
pub struct SchemaWatcher {
    known: Mutex<TableSignatures>,
    listeners: Mutex<BTreeMap<SubscriptionId, Arc<dyn SchemaListener>>>,
    next_subscription: AtomicU64,
}

impl SchemaWatcher {
    pub fn new(initial: TableSignatures) -> Self {
        Self {
            known: Mutex::new(initial),
            ..Default::default()
        }
    }

    pub fn tables(&self) -> Vec<String> {
        self.known.lock().keys().cloned().collect()
    }

    pub fn columns(&self, table: &str) -> Option<Vec<ColumnDescriptor>> {
        self.known.lock().get(table).cloned()
    }

    pub fn subscribe(&self, listener: Arc<dyn SchemaListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().insert(id, listener);
        id
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.listeners.lock().remove(&subscription);
    }

    /// Replaces the known signatures with `current` and notifies every
    /// listener. Returns the number of changed tables.
    pub fn update(&self, current: TableSignatures) -> usize {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut altered = Vec::new();
        {
            let mut known = self.known.lock();
            for (table, columns) in &current {
                match known.get(table) {
                    None => added.push(table.clone()),
                    Some(previous) if previous != columns => altered.push(table.clone()),
                    Some(_) => {}
                }
            }
            removed.extend(known.keys().filter(|t| !current.contains_key(*t)).cloned());
            *known = current;
        }

        let listeners: Vec<Arc<dyn SchemaListener>> = self.listeners.lock().values().cloned().collect();
        for listener in &listeners {
            for table in &added {
                listener.table_added(table);
            }
            for table in &removed {
                listener.table_removed(table);
            }
            for table in &altered {
                listener.table_altered(table);
            }
        }

        let changed = added.len() + removed.len() + altered.len();
        if changed > 0 {
            debug!(
                added = added.len(),
                removed = removed.len(),
                altered = altered.len(),
                "Member schema changed"
            );
        }
        changed
    }
}
