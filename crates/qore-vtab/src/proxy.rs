// SPDX-License-Identifier: Apache-2.0

//! Change-tracking proxy
//!
//! Sits between the host's cursors and a row source. Reads pass through to
//! the source unless a pending edit shadows the cell; writes are recorded
//! against stable row ordinals and only reach the source on [`apply`].
//!
//! Ordinals never move while edits are pending: a deleted row leaves a hole
//! that scans skip, an inserted row takes the next ordinal past every row
//! seen so far. `apply` compacts them.
//!
//! Under [`BufferPolicy::PassThrough`] updates and inserts reach the source
//! as soon as they are staged, but deletions wait for the next [`apply`]
//! (the host's commit). The host collects every rowid a statement will
//! delete before the first deletion, so the source cannot be compacted in
//! between. Edits staged while deletions wait are held with them.
//!
//! [`apply`]: ChangeTrackingProxy::apply

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use qore_core::{
    ChangeSet, ColumnDescriptor, FederationError, FederationResult, RowUpdate, SharedRowSource,
    SourceCapabilities, SourceHandle, Value,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::forward::ForwardOnlyAdapter;

/// When staged edits reach the row source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    /// Held until the host commits the transaction.
    #[default]
    Buffered,
    /// Updates and inserts applied as soon as they are staged, deletions
    /// at the host's commit.
    PassThrough,
}

pub struct ChangeTrackingProxy {
    source: SharedRowSource,
    columns: Vec<ColumnDescriptor>,
    capabilities: SourceCapabilities,
    policy: BufferPolicy,
    base_rows: usize,
    updates: BTreeMap<usize, BTreeMap<usize, Value>>,
    deleted: BTreeSet<usize>,
    inserted: BTreeMap<usize, Vec<Value>>,
    next_ordinal: usize,
}

impl ChangeTrackingProxy {
    pub fn new(source: SharedRowSource, policy: BufferPolicy) -> FederationResult<Self> {
        let (columns, capabilities, base_rows) = {
            let mut guard = source.lock();
            let base_rows = guard.row_count()?;
            (guard.column_descriptors(), guard.capabilities(), base_rows)
        };
        Ok(Self {
            source,
            columns,
            capabilities,
            policy,
            base_rows,
            updates: BTreeMap::new(),
            deleted: BTreeSet::new(),
            inserted: BTreeMap::new(),
            next_ordinal: base_rows,
        })
    }

    /// Builds a proxy over either kind of source. Sequential sources are
    /// wrapped in a [`ForwardOnlyAdapter`].
    pub fn from_handle(handle: &SourceHandle, policy: BufferPolicy) -> FederationResult<Self> {
        let source: SharedRowSource = match handle {
            SourceHandle::Random(source) => source.clone(),
            SourceHandle::Sequential(stream) => {
                Arc::new(Mutex::new(ForwardOnlyAdapter::new(stream.clone())))
            }
        };
        Self::new(source, policy)
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn capabilities(&self) -> SourceCapabilities {
        self.capabilities
    }

    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    /// Visible rows: source rows plus inserted minus deleted.
    pub fn row_count(&self) -> usize {
        self.base_rows + self.inserted.len() - self.deleted.len()
    }

    /// One past the highest ordinal ever handed out.
    pub fn ordinal_bound(&self) -> usize {
        self.next_ordinal
    }

    pub fn is_visible(&self, ordinal: usize) -> bool {
        if ordinal < self.base_rows {
            !self.deleted.contains(&ordinal)
        } else {
            self.inserted.contains_key(&ordinal)
        }
    }

    /// First visible ordinal at or after `from`.
    pub fn next_visible(&self, from: usize) -> Option<usize> {
        let mut ordinal = from;
        while ordinal < self.base_rows {
            if !self.deleted.contains(&ordinal) {
                return Some(ordinal);
            }
            ordinal += 1;
        }
        self.inserted
            .range(from.max(self.base_rows)..)
            .next()
            .map(|(ordinal, _)| *ordinal)
    }

    pub fn has_pending(&self) -> bool {
        !(self.updates.is_empty() && self.deleted.is_empty() && self.inserted.is_empty())
    }

    pub fn value_at(&self, ordinal: usize, column: usize) -> FederationResult<Value> {
        if column >= self.columns.len() {
            return Err(FederationError::validation(format!(
                "Column {column} out of range"
            )));
        }
        if !self.is_visible(ordinal) {
            return Err(FederationError::row_not_found(ordinal));
        }
        if let Some(values) = self.inserted.get(&ordinal) {
            return Ok(values[column].clone());
        }
        if let Some(value) = self.updates.get(&ordinal).and_then(|cells| cells.get(&column)) {
            return Ok(value.clone());
        }
        self.source.lock().read(ordinal, column)
    }

    /// Stages a new row and returns its ordinal.
    pub fn stage_insert(&mut self, values: Vec<Value>) -> FederationResult<usize> {
        if !self.capabilities.insert {
            return Err(FederationError::read_only_source());
        }
        self.check_width(&values)?;
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.inserted.insert(ordinal, values);
        debug!(ordinal, "Staged insert");
        self.flush_if_pass_through()?;
        Ok(ordinal)
    }

    /// Stages a full replacement row. Only cells that differ from the
    /// source are recorded.
    pub fn stage_update(&mut self, ordinal: usize, values: Vec<Value>) -> FederationResult<()> {
        self.check_width(&values)?;
        if !self.is_visible(ordinal) {
            return Err(FederationError::row_not_found(ordinal));
        }
        if let Some(row) = self.inserted.get_mut(&ordinal) {
            *row = values;
            return self.flush_if_pass_through();
        }
        if !self.capabilities.update {
            return Err(FederationError::read_only_source());
        }

        let mut changed = BTreeMap::new();
        {
            let mut source = self.source.lock();
            for (column, value) in values.into_iter().enumerate() {
                if source.read(ordinal, column)? != value {
                    changed.insert(column, value);
                }
            }
        }
        if changed.is_empty() {
            self.updates.remove(&ordinal);
        } else {
            debug!(ordinal, cells = changed.len(), "Staged update");
            self.updates.insert(ordinal, changed);
        }
        self.flush_if_pass_through()
    }

    pub fn stage_delete(&mut self, ordinal: usize) -> FederationResult<()> {
        if !self.is_visible(ordinal) {
            return Err(FederationError::row_not_found(ordinal));
        }
        if self.inserted.remove(&ordinal).is_some() {
            return self.flush_if_pass_through();
        }
        if !self.capabilities.delete {
            return Err(FederationError::read_only_source());
        }
        self.updates.remove(&ordinal);
        self.deleted.insert(ordinal);
        debug!(ordinal, "Staged delete");
        self.flush_if_pass_through()
    }

    /// The pending edits addressed to the source's current ordinals.
    pub fn change_set(&self) -> ChangeSet {
        ChangeSet {
            updates: self
                .updates
                .iter()
                .filter(|(row, _)| !self.deleted.contains(row))
                .map(|(row, cells)| RowUpdate {
                    row: *row,
                    cells: cells.iter().map(|(c, v)| (*c, v.clone())).collect(),
                })
                .collect(),
            deletions: self.deleted.iter().rev().copied().collect(),
            inserts: self.inserted.values().cloned().collect(),
        }
    }

    /// Pushes pending edits to the source. On failure the edits stay
    /// pending so the caller can retry or discard them.
    pub fn apply(&mut self) -> FederationResult<()> {
        if !self.has_pending() {
            return Ok(());
        }
        let changes = self.change_set();
        let base_rows = {
            let mut source = self.source.lock();
            source.apply_changes(&changes)?;
            source.row_count()?
        };
        debug!(edits = changes.len(), rows = base_rows, "Applied pending edits");
        self.clear();
        self.base_rows = base_rows;
        self.next_ordinal = base_rows;
        Ok(())
    }

    /// Drops pending edits. Idempotent.
    pub fn discard(&mut self) {
        if self.has_pending() {
            debug!("Discarding pending edits");
        }
        self.clear();
        self.next_ordinal = self.base_rows;
    }

    fn clear(&mut self) {
        self.updates.clear();
        self.deleted.clear();
        self.inserted.clear();
    }

    fn check_width(&self, values: &[Value]) -> FederationResult<()> {
        if values.len() != self.columns.len() {
            return Err(FederationError::validation(format!(
                "Row has {} values, table has {} columns",
                values.len(),
                self.columns.len()
            )));
        }
        Ok(())
    }

    fn flush_if_pass_through(&mut self) -> FederationResult<()> {
        match self.policy {
            BufferPolicy::PassThrough if self.deleted.is_empty() => self.apply(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use qore_core::{MemoryTable, RowSource};

    use super::*;

    fn columns() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor::new("id", "INTEGER"),
            ColumnDescriptor::new("name", "TEXT"),
        ]
    }

    fn table(rows: usize) -> Arc<Mutex<MemoryTable>> {
        let data = (0..rows)
            .map(|i| vec![Value::Int(i as i64), Value::Text(format!("n{i}"))])
            .collect();
        Arc::new(Mutex::new(MemoryTable::with_rows(columns(), data).unwrap()))
    }

    fn visible_rows(proxy: &ChangeTrackingProxy) -> Vec<Vec<Value>> {
        let mut out = Vec::new();
        let mut next = proxy.next_visible(0);
        while let Some(ordinal) = next {
            out.push(
                (0..proxy.column_count())
                    .map(|c| proxy.value_at(ordinal, c).unwrap())
                    .collect(),
            );
            next = proxy.next_visible(ordinal + 1);
        }
        out
    }

    #[test]
    fn test_pending_update_shadows_source() {
        let source = table(2);
        let mut proxy = ChangeTrackingProxy::new(source.clone(), BufferPolicy::Buffered).unwrap();
        proxy
            .stage_update(1, vec![Value::Int(1), "z".into()])
            .unwrap();
        assert_eq!(proxy.value_at(1, 1).unwrap(), Value::from("z"));
        assert_eq!(source.lock().read(1, 1).unwrap(), Value::from("n1"));
        assert_eq!(proxy.change_set().updates[0].cells, vec![(1, Value::from("z"))]);
    }

    #[test]
    fn test_unchanged_update_records_nothing() {
        let mut proxy = ChangeTrackingProxy::new(table(2), BufferPolicy::Buffered).unwrap();
        proxy
            .stage_update(0, vec![Value::Int(0), "n0".into()])
            .unwrap();
        assert!(!proxy.has_pending());
    }

    #[test]
    fn test_deleted_row_is_hidden() {
        let mut proxy = ChangeTrackingProxy::new(table(3), BufferPolicy::Buffered).unwrap();
        proxy.stage_delete(1).unwrap();
        assert_eq!(proxy.row_count(), 2);
        assert_eq!(proxy.next_visible(1), Some(2));
        assert!(matches!(
            proxy.value_at(1, 0),
            Err(FederationError::RowNotFound { ordinal: 1 })
        ));
        assert!(matches!(
            proxy.stage_delete(1),
            Err(FederationError::RowNotFound { .. })
        ));
    }

    #[test]
    fn test_insert_takes_next_ordinal() {
        let mut proxy = ChangeTrackingProxy::new(table(2), BufferPolicy::Buffered).unwrap();
        let first = proxy.stage_insert(vec![Value::Int(7), "a".into()]).unwrap();
        let second = proxy.stage_insert(vec![Value::Int(8), "b".into()]).unwrap();
        assert_eq!((first, second), (2, 3));
        proxy.stage_delete(first).unwrap();
        assert_eq!(proxy.row_count(), 3);
        assert_eq!(proxy.ordinal_bound(), 4);
        assert_eq!(proxy.next_visible(2), Some(3));
    }

    #[test]
    fn test_apply_compacts_and_clears() {
        let source = table(3);
        let mut proxy = ChangeTrackingProxy::new(source.clone(), BufferPolicy::Buffered).unwrap();
        proxy.stage_delete(0).unwrap();
        proxy
            .stage_update(2, vec![Value::Int(2), "two".into()])
            .unwrap();
        proxy.stage_insert(vec![Value::Int(3), "three".into()]).unwrap();
        proxy.apply().unwrap();

        assert!(!proxy.has_pending());
        assert_eq!(proxy.row_count(), 3);
        assert_eq!(
            source.lock().rows(),
            &[
                vec![Value::Int(1), Value::from("n1")],
                vec![Value::Int(2), Value::from("two")],
                vec![Value::Int(3), Value::from("three")],
            ]
        );
    }

    #[test]
    fn test_read_only_source_rejects_staging() {
        let source = Arc::new(Mutex::new(
            MemoryTable::with_rows(columns(), vec![vec![Value::Int(1), "x".into()]])
                .unwrap()
                .read_only(),
        ));
        let mut proxy = ChangeTrackingProxy::new(source, BufferPolicy::Buffered).unwrap();
        assert!(matches!(
            proxy.stage_update(0, vec![Value::Int(1), "y".into()]),
            Err(FederationError::ReadOnly { .. })
        ));
        assert!(matches!(
            proxy.stage_insert(vec![Value::Int(2), "y".into()]),
            Err(FederationError::ReadOnly { .. })
        ));
        assert!(matches!(proxy.stage_delete(0), Err(FederationError::ReadOnly { .. })));
    }

    #[test]
    fn test_pass_through_applies_immediately() {
        let source = table(1);
        let mut proxy =
            ChangeTrackingProxy::new(source.clone(), BufferPolicy::PassThrough).unwrap();
        proxy.stage_insert(vec![Value::Int(5), "five".into()]).unwrap();
        assert!(!proxy.has_pending());
        assert_eq!(source.lock().rows().len(), 2);
    }

    #[test]
    fn test_pass_through_holds_deletions_until_apply() {
        let source = table(4);
        let mut proxy =
            ChangeTrackingProxy::new(source.clone(), BufferPolicy::PassThrough).unwrap();
        // Ordinals collected up front, as the host does for a DELETE
        proxy.stage_delete(0).unwrap();
        proxy.stage_delete(2).unwrap();
        assert_eq!(source.lock().rows().len(), 4);
        assert_eq!(proxy.row_count(), 2);
        assert_eq!(proxy.value_at(3, 0).unwrap(), Value::Int(3));

        proxy
            .stage_update(3, vec![Value::Int(3), "three".into()])
            .unwrap();
        assert!(proxy.has_pending());

        proxy.apply().unwrap();
        assert_eq!(
            source.lock().rows(),
            &[
                vec![Value::Int(1), Value::from("n1")],
                vec![Value::Int(3), Value::from("three")],
            ]
        );

        proxy.stage_update(0, vec![Value::Int(1), "one".into()]).unwrap();
        assert!(!proxy.has_pending());
        assert_eq!(source.lock().rows()[0][1], Value::from("one"));
    }

    #[test]
    fn test_sequential_source_is_adapted() {
        let stream = qore_core::RowStream::new(
            columns(),
            vec![vec![Value::Int(1), "x".into()], vec![Value::Int(2), "y".into()]],
        );
        let proxy = ChangeTrackingProxy::from_handle(
            &SourceHandle::sequential(stream),
            BufferPolicy::Buffered,
        )
        .unwrap();
        assert_eq!(proxy.row_count(), 2);
        assert!(!proxy.capabilities().random_access);
        assert_eq!(proxy.value_at(1, 1).unwrap(), Value::from("y"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(i64),
        Update(usize, i64),
        Delete(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<i64>().prop_map(Op::Insert),
            (0usize..16, any::<i64>()).prop_map(|(o, v)| Op::Update(o, v)),
            (0usize..16).prop_map(Op::Delete),
        ]
    }

    fn run(proxy: &mut ChangeTrackingProxy, ops: &[Op]) -> (usize, usize) {
        let (mut inserted, mut deleted) = (0usize, 0usize);
        for op in ops {
            match op {
                Op::Insert(v) => {
                    proxy.stage_insert(vec![Value::Int(*v), "new".into()]).unwrap();
                    inserted += 1;
                }
                Op::Update(ordinal, v) => {
                    let _ = proxy.stage_update(*ordinal, vec![Value::Int(*v), "upd".into()]);
                }
                Op::Delete(ordinal) => {
                    if proxy.stage_delete(*ordinal).is_ok() {
                        deleted += 1;
                    }
                }
            }
        }
        (inserted, deleted)
    }

    proptest! {
        #[test]
        fn prop_row_count_tracks_edits(base in 0usize..8, ops in prop::collection::vec(op(), 0..24)) {
            let mut proxy = ChangeTrackingProxy::new(table(base), BufferPolicy::Buffered).unwrap();
            let (inserted, deleted) = run(&mut proxy, &ops);
            prop_assert_eq!(proxy.row_count(), base + inserted - deleted);
            prop_assert_eq!(visible_rows(&proxy).len(), proxy.row_count());
        }

        #[test]
        fn prop_apply_matches_visible_rows(base in 0usize..8, ops in prop::collection::vec(op(), 0..24)) {
            let source = table(base);
            let mut proxy = ChangeTrackingProxy::new(source.clone(), BufferPolicy::Buffered).unwrap();
            run(&mut proxy, &ops);
            let expected = visible_rows(&proxy);
            proxy.apply().unwrap();
            prop_assert!(!proxy.has_pending());
            prop_assert_eq!(source.lock().rows().to_vec(), expected.clone());
            prop_assert_eq!(visible_rows(&proxy), expected);
        }

        #[test]
        fn prop_discard_is_idempotent(base in 0usize..8, ops in prop::collection::vec(op(), 0..24)) {
            let source = table(base);
            let original = source.lock().rows().to_vec();
            let mut proxy = ChangeTrackingProxy::new(source.clone(), BufferPolicy::Buffered).unwrap();
            run(&mut proxy, &ops);
            proxy.discard();
            let once = visible_rows(&proxy);
            proxy.discard();
            prop_assert_eq!(visible_rows(&proxy), once.clone());
            prop_assert_eq!(once, original.clone());
            prop_assert_eq!(source.lock().rows().to_vec(), original);
        }
    }
}
