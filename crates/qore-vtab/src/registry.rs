// SPDX-License-Identifier: Apache-2.0

//! Binding registry
//!
//! Arena of table bindings for one host connection. The catalog and the
//! host module share it behind a mutex; the host only ever sees handshake
//! names and `(BindingId, generation)` pairs, never references into it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use qore_core::{
    ColumnDescriptor, FederationError, FederationResult, SourceHandle, TableSource,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::name::TableName;
use crate::proxy::{BufferPolicy, ChangeTrackingProxy};

static HANDSHAKE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique handshake name.
///
/// Handshake names only appear in `CREATE VIRTUAL TABLE` arguments, so they
/// never collide with user table names.
pub fn next_handshake_name() -> String {
    format!("qfed_{}", HANDSHAKE_COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BindingId(pub u64);

/// Lifecycle of a binding as seen by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Uncreated,
    Created,
    Opened(usize),
}

/// Host transaction state for the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    #[default]
    Idle,
    Active,
    Synced,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn in_progress(&self) -> bool {
        matches!(self, TransactionState::Active | TransactionState::Synced)
    }
}

pub type SharedProxy = Arc<Mutex<ChangeTrackingProxy>>;

pub struct TableBinding {
    pub id: BindingId,
    pub sql_name: TableName,
    pub handshake: String,
    pub source: TableSource,
    pub policy: BufferPolicy,
    pub proxy: Option<SharedProxy>,
    /// Source produced by the factory for the current proxy.
    pub produced: Option<SourceHandle>,
    pub generation: u64,
    pub state: BindingState,
    pub last_apply_error: Option<FederationError>,
}

impl TableBinding {
    pub fn columns(&self) -> FederationResult<Vec<ColumnDescriptor>> {
        match &self.source {
            TableSource::Fixed(handle) => Ok(handle.column_descriptors()),
            TableSource::Factory(factory) => factory.columns(),
        }
    }

    /// The fixed source, or what the factory last produced.
    pub fn current_source(&self) -> Option<SourceHandle> {
        match &self.source {
            TableSource::Fixed(handle) => Some(handle.clone()),
            TableSource::Factory(_) => self.produced.clone(),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.proxy
            .as_ref()
            .map(|proxy| proxy.lock().has_pending())
            .unwrap_or(false)
    }

    pub fn open_cursors(&self) -> usize {
        match self.state {
            BindingState::Opened(n) => n,
            _ => 0,
        }
    }

    /// Returns the proxy, creating it (and running the factory) on first use.
    pub fn ensure_proxy(&mut self) -> FederationResult<SharedProxy> {
        if let Some(proxy) = &self.proxy {
            return Ok(proxy.clone());
        }
        let handle = match &self.source {
            TableSource::Fixed(handle) => handle.clone(),
            TableSource::Factory(factory) => {
                let handle = factory.produce()?;
                self.produced = Some(handle.clone());
                handle
            }
        };
        let proxy = Arc::new(Mutex::new(ChangeTrackingProxy::from_handle(&handle, self.policy)?));
        debug!(table = %self.sql_name, generation = self.generation, "Created proxy");
        self.proxy = Some(proxy.clone());
        Ok(proxy)
    }

    /// Drops the proxy and advances the generation. Cursors opened before
    /// this call are rejected as stale from now on.
    pub fn reset_proxy(&mut self) {
        self.proxy = None;
        self.produced = None;
        self.generation += 1;
    }

    pub fn info(&self) -> BindingInfo {
        BindingInfo {
            id: self.id,
            sql_name: self.sql_name.to_string(),
            handshake: self.handshake.clone(),
            generation: self.generation,
            state: self.state,
            factory: self.source.is_factory(),
            pending_edits: self.has_pending(),
            policy: self.policy,
        }
    }
}

/// Snapshot of a binding, safe to hand out without holding the registry lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingInfo {
    pub id: BindingId,
    pub sql_name: String,
    pub handshake: String,
    pub generation: u64,
    pub state: BindingState,
    pub factory: bool,
    pub pending_edits: bool,
    pub policy: BufferPolicy,
}

#[derive(Default)]
pub struct BindingRegistry {
    next_id: u64,
    bindings: BTreeMap<BindingId, TableBinding>,
    by_name: HashMap<String, BindingId>,
    by_handshake: HashMap<String, BindingId>,
    transaction: TransactionState,
    apply_errors: Vec<(String, FederationError)>,
}

pub type SharedRegistry = Arc<Mutex<BindingRegistry>>;

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Inserts a binding in the `Uncreated` state.
    pub fn insert(
        &mut self,
        sql_name: TableName,
        source: TableSource,
        policy: BufferPolicy,
    ) -> FederationResult<&TableBinding> {
        let key = sql_name.key();
        if self.by_name.contains_key(&key) {
            return Err(FederationError::name_in_use(sql_name.to_string()));
        }
        self.next_id += 1;
        let id = BindingId(self.next_id);
        let handshake = next_handshake_name();

        self.by_name.insert(key, id);
        self.by_handshake.insert(handshake.clone(), id);
        let binding = self.bindings.entry(id).or_insert(TableBinding {
            id,
            sql_name,
            handshake,
            source,
            policy,
            proxy: None,
            produced: None,
            generation: 0,
            state: BindingState::Uncreated,
            last_apply_error: None,
        });
        Ok(binding)
    }

    pub fn remove(&mut self, id: BindingId) -> Option<TableBinding> {
        let binding = self.bindings.remove(&id)?;
        self.by_name.remove(&binding.sql_name.key());
        self.by_handshake.remove(&binding.handshake);
        Some(binding)
    }

    pub fn get(&self, id: BindingId) -> Option<&TableBinding> {
        self.bindings.get(&id)
    }

    pub fn get_mut(&mut self, id: BindingId) -> Option<&mut TableBinding> {
        self.bindings.get_mut(&id)
    }

    pub fn find_by_name(&self, sql_name: &TableName) -> Option<&TableBinding> {
        self.by_name
            .get(&sql_name.key())
            .and_then(|id| self.bindings.get(id))
    }

    pub fn find_by_handshake(&self, handshake: &str) -> Option<&TableBinding> {
        self.by_handshake
            .get(handshake)
            .and_then(|id| self.bindings.get(id))
    }

    pub fn find_by_source(&self, source: &SourceHandle) -> Option<&TableBinding> {
        self.bindings.values().find(|binding| {
            binding
                .current_source()
                .map(|current| current.same_source(source))
                .unwrap_or(false)
        })
    }

    pub fn bindings(&self) -> impl Iterator<Item = &TableBinding> {
        self.bindings.values()
    }

    pub fn ids(&self) -> Vec<BindingId> {
        self.bindings.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn transaction(&self) -> TransactionState {
        self.transaction
    }

    pub fn set_transaction(&mut self, state: TransactionState) {
        self.transaction = state;
    }

    pub fn record_apply_error(&mut self, id: BindingId, error: FederationError) {
        if let Some(binding) = self.bindings.get_mut(&id) {
            binding.last_apply_error = Some(error.clone());
            self.apply_errors.push((binding.sql_name.to_string(), error));
        }
    }

    pub fn clear_apply_error(&mut self, id: BindingId) {
        if let Some(binding) = self.bindings.get_mut(&id) {
            binding.last_apply_error = None;
        }
    }

    pub fn take_apply_errors(&mut self) -> Vec<(String, FederationError)> {
        std::mem::take(&mut self.apply_errors)
    }
}
