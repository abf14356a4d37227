// SPDX-License-Identifier: Apache-2.0

//! Host virtual-table contract
//!
//! [`VirtualTableModule`] lists every callback a host engine drives a
//! virtual table through, independent of the host's ABI. There is a single
//! implementation, [`FederationModule`], which serves every binding of a
//! connection from the shared registry. ABI adapters (see `sqlite`) only
//! translate arguments and results.

use std::sync::Arc;

use parking_lot::Mutex;
use qore_core::{FederationError, FederationResult, FilterOp, OrderTerm, TableSource, Value};
use tracing::{debug, error, instrument, warn};

use crate::cursor::{Cursor, PushdownPlan, PushedFilter, ScanPlan};
use crate::metrics;
use crate::proxy::{BufferPolicy, ChangeTrackingProxy};
use crate::registry::{BindingId, BindingState, SharedProxy, SharedRegistry, TransactionState};
use crate::schema::declare_table;

/// Per-table handle held by the host between `create`/`connect` and
/// `disconnect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    pub binding: BindingId,
    pub handshake: String,
    pub column_count: usize,
}

/// Result of `create`/`connect`: the handle plus the schema to declare.
#[derive(Debug, Clone)]
pub struct TableDeclaration {
    pub handle: TableHandle,
    pub schema: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
    Other,
}

impl ConstraintOp {
    pub fn filter_op(self) -> Option<FilterOp> {
        match self {
            ConstraintOp::Eq => Some(FilterOp::Eq),
            ConstraintOp::Gt => Some(FilterOp::Gt),
            ConstraintOp::Ge => Some(FilterOp::Ge),
            ConstraintOp::Lt => Some(FilterOp::Lt),
            ConstraintOp::Le => Some(FilterOp::Le),
            ConstraintOp::Other => None,
        }
    }
}

/// One WHERE-clause constraint offered by the host planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConstraint {
    /// Column index; -1 is the rowid.
    pub column: i32,
    pub op: ConstraintOp,
    pub usable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexPlan {
    pub plan: ScanPlan,
    /// Constraints whose values `filter` receives, in argument order.
    pub arguments: Vec<usize>,
    /// The host may skip checking the argument constraints itself.
    pub omit: bool,
    /// Set for [`ScanPlan::Pushdown`].
    pub pushdown: Option<PushdownPlan>,
    pub estimated_cost: f64,
    pub estimated_rows: i64,
}

/// A row mutation requested by the host
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Delete {
        rowid: i64,
    },
    Update {
        old_rowid: i64,
        new_rowid: i64,
        values: Vec<Value>,
    },
    Insert {
        rowid: Option<i64>,
        values: Vec<Value>,
    },
}

pub trait VirtualTableModule: Send + Sync {
    fn create(&self, handshake: &str) -> FederationResult<TableDeclaration>;
    fn connect(&self, handshake: &str) -> FederationResult<TableDeclaration>;
    fn disconnect(&self, table: &TableHandle);
    fn destroy(&self, table: &TableHandle) -> FederationResult<()>;

    fn best_index(
        &self,
        table: &TableHandle,
        constraints: &[IndexConstraint],
        order_by: &[OrderTerm],
    ) -> IndexPlan;

    fn open(&self, table: &TableHandle) -> FederationResult<Cursor>;
    fn close(&self, cursor: &Cursor);
    fn filter(
        &self,
        cursor: &mut Cursor,
        plan: ScanPlan,
        pushdown: Option<&PushdownPlan>,
        args: &[Value],
    ) -> FederationResult<()>;
    fn next(&self, cursor: &mut Cursor) -> FederationResult<()>;
    fn eof(&self, cursor: &Cursor) -> bool;
    fn column(&self, cursor: &Cursor, index: usize) -> FederationResult<Value>;
    fn rowid(&self, cursor: &Cursor) -> FederationResult<i64>;

    /// Returns the new rowid for inserts.
    fn update(&self, table: &TableHandle, change: RowChange) -> FederationResult<Option<i64>>;

    fn begin(&self, table: &TableHandle) -> FederationResult<()>;
    fn sync(&self, table: &TableHandle) -> FederationResult<()>;
    fn commit(&self, table: &TableHandle) -> FederationResult<()>;
    fn rollback(&self, table: &TableHandle) -> FederationResult<()>;
}

const DEFAULT_ROW_ESTIMATE: i64 = 1_000;

pub struct FederationModule {
    registry: SharedRegistry,
}

impl FederationModule {
    pub fn new(registry: SharedRegistry) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    fn declare(&self, handshake: &str) -> FederationResult<TableDeclaration> {
        let mut registry = self.registry.lock();
        let id = registry
            .find_by_handshake(handshake)
            .map(|binding| binding.id)
            .ok_or_else(|| FederationError::host_rejected("Wrong usage of virtual tables"))?;
        let binding = registry
            .get_mut(id)
            .ok_or_else(|| FederationError::host_rejected("Wrong usage of virtual tables"))?;

        let columns = binding.columns()?;
        let schema = declare_table(&columns)?;
        if binding.state == BindingState::Uncreated {
            binding.state = BindingState::Created;
        }
        debug!(table = %binding.sql_name, columns = columns.len(), "Declared virtual table");

        Ok(TableDeclaration {
            handle: TableHandle {
                binding: id,
                handshake: handshake.to_string(),
                column_count: columns.len(),
            },
            schema,
        })
    }

    /// Proxy for a live cursor, or `Stale` when the binding was removed or
    /// refreshed since the cursor was opened.
    fn cursor_proxy(&self, cursor: &Cursor) -> FederationResult<SharedProxy> {
        let registry = self.registry.lock();
        let binding = match registry.get(cursor.binding) {
            Some(binding) => binding,
            None => {
                metrics::record_stale();
                return Err(FederationError::stale("table was removed"));
            }
        };
        if binding.generation != cursor.generation {
            metrics::record_stale();
            return Err(FederationError::stale(format!(
                "table {} was refreshed",
                binding.sql_name
            )));
        }
        if let Some(filtered) = &cursor.filtered {
            return Ok(filtered.clone());
        }
        binding.proxy.clone().ok_or_else(|| {
            metrics::record_stale();
            FederationError::stale(format!("table {} was reset", binding.sql_name))
        })
    }

    /// Creates the binding's proxy for a cursor about to scan it. Factory
    /// tables only read their member here, not at `open`.
    fn prepare_scan(&self, cursor: &Cursor) -> FederationResult<()> {
        let mut registry = self.registry.lock();
        match registry.get_mut(cursor.binding) {
            Some(binding) if binding.generation == cursor.generation => {
                binding.ensure_proxy()?;
                Ok(())
            }
            // Reported as stale by the caller
            _ => Ok(()),
        }
    }

    /// Proxy over the rows the table's factory returns for a pushed-down
    /// scan. `None` when the factory declines, or when pending edits or a
    /// write transaction mean the member's rows are not what the host sees.
    fn produce_filtered(
        &self,
        cursor: &Cursor,
        pushdown: &PushdownPlan,
        args: &[Value],
    ) -> FederationResult<Option<SharedProxy>> {
        let factory = {
            let registry = self.registry.lock();
            let writing = registry.transaction().in_progress();
            match registry.get(cursor.binding) {
                Some(binding) if binding.generation == cursor.generation => match &binding.source {
                    TableSource::Factory(factory) if !writing && !binding.has_pending() => {
                        factory.clone()
                    }
                    _ => return Ok(None),
                },
                _ => return Ok(None),
            }
        };
        let request = pushdown.request(args)?;
        let handle = match factory.produce_filtered(&request) {
            Ok(Some(handle)) => handle,
            Ok(None) => return Ok(None),
            Err(err) => {
                warn!(error = %err, "Filtered read failed; scanning the whole table");
                return Ok(None);
            }
        };
        let proxy = ChangeTrackingProxy::from_handle(&handle, BufferPolicy::Buffered)?;
        metrics::record_pushdown();
        debug!(filters = request.filters.len(), rows = proxy.row_count(), "Pushed scan down");
        Ok(Some(Arc::new(Mutex::new(proxy))))
    }

    fn table_proxy(&self, table: &TableHandle) -> FederationResult<SharedProxy> {
        let mut registry = self.registry.lock();
        let binding = registry
            .get_mut(table.binding)
            .ok_or_else(|| FederationError::host_rejected("Virtual table is no longer registered"))?;
        binding.ensure_proxy()
    }

    /// Applies the pending edits of every binding, including edits a
    /// failed commit left behind. Each binding applies on its own: a failure
    /// is recorded against that binding and the rest still apply. Returns
    /// the first failure.
    fn apply_pending(&self) -> Option<FederationError> {
        let proxies: Vec<(BindingId, SharedProxy)> = {
            let registry = self.registry.lock();
            registry
                .bindings()
                .filter_map(|b| b.proxy.clone().map(|p| (b.id, p)))
                .collect()
        };
        let mut first_error = None;
        for (id, proxy) in proxies {
            let result = {
                let mut proxy = proxy.lock();
                if !proxy.has_pending() {
                    continue;
                }
                proxy.apply()
            };
            metrics::record_commit(result.is_ok());
            let mut registry = self.registry.lock();
            match result {
                Ok(()) => registry.clear_apply_error(id),
                Err(err) => {
                    error!(error = %err, "Applying pending edits failed; edits kept pending");
                    registry.record_apply_error(id, err.clone());
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error
    }

    /// Applies every binding's pending edits outside a host transaction.
    #[instrument(skip(self))]
    pub fn commit_all(&self) -> FederationResult<()> {
        let failed = self.apply_pending();
        self.registry.lock().set_transaction(TransactionState::Committed);
        match failed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Discards every binding's pending edits.
    pub fn rollback_all(&self) {
        let proxies: Vec<SharedProxy> = {
            let mut registry = self.registry.lock();
            registry.set_transaction(TransactionState::RolledBack);
            registry.bindings().filter_map(|b| b.proxy.clone()).collect()
        };
        for proxy in proxies {
            proxy.lock().discard();
        }
        metrics::record_rollback();
    }
}

fn ordinal(rowid: i64) -> FederationResult<usize> {
    usize::try_from(rowid)
        .map_err(|_| FederationError::validation(format!("Invalid rowid {rowid}")))
}

impl VirtualTableModule for FederationModule {
    #[instrument(skip(self))]
    fn create(&self, handshake: &str) -> FederationResult<TableDeclaration> {
        self.declare(handshake)
    }

    #[instrument(skip(self))]
    fn connect(&self, handshake: &str) -> FederationResult<TableDeclaration> {
        self.declare(handshake)
    }

    fn disconnect(&self, table: &TableHandle) {
        let mut registry = self.registry.lock();
        if let Some(binding) = registry.get_mut(table.binding) {
            binding.state = BindingState::Uncreated;
        }
    }

    #[instrument(skip(self, table), fields(handshake = %table.handshake))]
    fn destroy(&self, table: &TableHandle) -> FederationResult<()> {
        let mut registry = self.registry.lock();
        if let Some(binding) = registry.get_mut(table.binding) {
            if binding.has_pending() {
                warn!(table = %binding.sql_name, "Destroying table with uncommitted edits");
            }
            binding.reset_proxy();
            binding.state = BindingState::Uncreated;
        }
        Ok(())
    }

    fn best_index(
        &self,
        table: &TableHandle,
        constraints: &[IndexConstraint],
        order_by: &[OrderTerm],
    ) -> IndexPlan {
        let ordinal_column = table.column_count as i32;
        let lookup = constraints.iter().position(|c| {
            c.usable && c.op == ConstraintOp::Eq && (c.column == -1 || c.column == ordinal_column)
        });
        if let Some(index) = lookup {
            return IndexPlan {
                plan: ScanPlan::PointLookup,
                arguments: vec![index],
                omit: true,
                pushdown: None,
                estimated_cost: 1.0,
                estimated_rows: 1,
            };
        }

        let (rows, factory) = {
            let registry = self.registry.lock();
            let binding = registry.get(table.binding);
            let rows = binding
                .and_then(|b| b.proxy.clone())
                .map(|p| p.lock().row_count() as i64)
                .unwrap_or(DEFAULT_ROW_ESTIMATE);
            let factory = binding.and_then(|b| match &b.source {
                TableSource::Factory(factory) => Some(factory.clone()),
                TableSource::Fixed(_) => None,
            });
            (rows, factory)
        };

        if let Some(factory) = factory {
            let pushed: Vec<(usize, PushedFilter)> = constraints
                .iter()
                .enumerate()
                .filter(|(_, c)| c.usable)
                .filter_map(|(index, c)| {
                    let op = c.op.filter_op()?;
                    let column = usize::try_from(c.column)
                        .ok()
                        .filter(|column| *column < table.column_count)?;
                    factory
                        .accepts_filter(column, op)
                        .then_some((index, PushedFilter { column, op }))
                })
                .collect();
            if !pushed.is_empty() {
                let estimated_rows = (rows / (4 * pushed.len() as i64)).max(1);
                let (arguments, filters): (Vec<usize>, Vec<PushedFilter>) =
                    pushed.into_iter().unzip();
                return IndexPlan {
                    plan: ScanPlan::Pushdown,
                    arguments,
                    omit: false,
                    pushdown: Some(PushdownPlan {
                        filters,
                        order_by: order_by.to_vec(),
                    }),
                    estimated_cost: estimated_rows as f64,
                    estimated_rows,
                };
            }
        }

        IndexPlan {
            plan: ScanPlan::FullScan,
            arguments: Vec::new(),
            omit: false,
            pushdown: None,
            estimated_cost: rows.max(1) as f64,
            estimated_rows: rows,
        }
    }

    fn open(&self, table: &TableHandle) -> FederationResult<Cursor> {
        let mut registry = self.registry.lock();
        let txn = registry.transaction();
        let binding = registry
            .get_mut(table.binding)
            .ok_or_else(|| FederationError::host_rejected("Virtual table is no longer registered"))?;

        // Factory tables re-read their member between statements.
        if binding.source.is_factory()
            && binding.proxy.is_some()
            && binding.open_cursors() == 0
            && !txn.in_progress()
            && !binding.has_pending()
        {
            binding.reset_proxy();
        }
        if !binding.source.is_factory() {
            binding.ensure_proxy()?;
        }
        binding.state = BindingState::Opened(binding.open_cursors() + 1);

        Ok(Cursor::new(binding.id, binding.generation, table.column_count))
    }

    fn close(&self, cursor: &Cursor) {
        let mut registry = self.registry.lock();
        if let Some(binding) = registry.get_mut(cursor.binding) {
            binding.state = match binding.open_cursors() {
                0 | 1 => BindingState::Created,
                n => BindingState::Opened(n - 1),
            };
        }
    }

    fn filter(
        &self,
        cursor: &mut Cursor,
        plan: ScanPlan,
        pushdown: Option<&PushdownPlan>,
        args: &[Value],
    ) -> FederationResult<()> {
        cursor.filtered = match (plan, pushdown) {
            (ScanPlan::Pushdown, Some(pushdown)) => self.produce_filtered(cursor, pushdown, args)?,
            _ => None,
        };
        if cursor.filtered.is_none() {
            self.prepare_scan(cursor)?;
        }
        let proxy = self.cursor_proxy(cursor)?;
        let proxy = proxy.lock();
        let bound = proxy.ordinal_bound() as i64;

        cursor.plan = plan;
        cursor.exhausted = false;
        match plan {
            // Without a filtered source the host checks every row itself
            ScanPlan::FullScan | ScanPlan::Pushdown => {
                cursor.position = proxy.next_visible(0).map(|o| o as i64).unwrap_or(bound);
            }
            ScanPlan::PointLookup => {
                let target = args.first().and_then(Value::as_i64);
                match target {
                    Some(rowid) if rowid >= 0 && proxy.is_visible(rowid as usize) => {
                        cursor.position = rowid;
                    }
                    _ => {
                        cursor.position = bound;
                        cursor.exhausted = true;
                    }
                }
            }
        }
        if cursor.position < bound {
            metrics::record_row_scanned();
        }
        Ok(())
    }

    fn next(&self, cursor: &mut Cursor) -> FederationResult<()> {
        let proxy = self.cursor_proxy(cursor)?;
        let proxy = proxy.lock();
        let bound = proxy.ordinal_bound() as i64;
        if cursor.exhausted || cursor.position < 0 || cursor.position >= bound {
            return Err(FederationError::unsupported(
                "cursor advanced past the end of the table",
            ));
        }
        match cursor.plan {
            ScanPlan::PointLookup => cursor.exhausted = true,
            ScanPlan::FullScan | ScanPlan::Pushdown => {
                cursor.position = proxy
                    .next_visible(cursor.position as usize + 1)
                    .map(|o| o as i64)
                    .unwrap_or(bound);
                if cursor.position < bound {
                    metrics::record_row_scanned();
                }
            }
        }
        Ok(())
    }

    fn eof(&self, cursor: &Cursor) -> bool {
        // A stale cursor is not at its end: the following column or rowid
        // call reports the staleness.
        match self.cursor_proxy(cursor) {
            Ok(proxy) => {
                cursor.exhausted || cursor.position >= proxy.lock().ordinal_bound() as i64
            }
            Err(_) => false,
        }
    }

    fn column(&self, cursor: &Cursor, index: usize) -> FederationResult<Value> {
        let proxy = self.cursor_proxy(cursor)?;
        if index == cursor.column_count {
            return Ok(Value::Int(cursor.position));
        }
        if cursor.exhausted || cursor.position < 0 {
            return Err(FederationError::row_not_found(cursor.position.max(0) as usize));
        }
        let value = proxy.lock().value_at(cursor.position as usize, index);
        value
    }

    fn rowid(&self, cursor: &Cursor) -> FederationResult<i64> {
        self.cursor_proxy(cursor)?;
        Ok(cursor.position)
    }

    #[instrument(skip(self, table, change), fields(handshake = %table.handshake))]
    fn update(&self, table: &TableHandle, change: RowChange) -> FederationResult<Option<i64>> {
        let proxy = self.table_proxy(table)?;
        let mut proxy = proxy.lock();
        match change {
            RowChange::Delete { rowid } => {
                proxy.stage_delete(ordinal(rowid)?)?;
                Ok(None)
            }
            RowChange::Update {
                old_rowid,
                new_rowid,
                values,
            } => {
                if old_rowid != new_rowid {
                    return Err(FederationError::unsupported(
                        "changing the rowid of a virtual table row",
                    ));
                }
                proxy.stage_update(ordinal(old_rowid)?, values)?;
                Ok(None)
            }
            RowChange::Insert { rowid: Some(_), .. } => Err(FederationError::unsupported(
                "inserting a row with an explicit rowid",
            )),
            RowChange::Insert { rowid: None, values } => {
                let ordinal = proxy.stage_insert(values)?;
                Ok(Some(ordinal as i64))
            }
        }
    }

    fn begin(&self, _table: &TableHandle) -> FederationResult<()> {
        self.registry.lock().set_transaction(TransactionState::Active);
        Ok(())
    }

    fn sync(&self, _table: &TableHandle) -> FederationResult<()> {
        let mut registry = self.registry.lock();
        if registry.transaction() == TransactionState::Active {
            registry.set_transaction(TransactionState::Synced);
        }
        Ok(())
    }

    /// The host only commits tables written in the transaction, so every
    /// binding with pending edits is applied here, not just `table`.
    #[instrument(skip(self, table), fields(handshake = %table.handshake))]
    fn commit(&self, table: &TableHandle) -> FederationResult<()> {
        let failed = self.apply_pending();
        self.registry.lock().set_transaction(TransactionState::Committed);
        // The host ignores commit failures; the recorded error reaches the caller.
        match failed {
            Some(err) => Err(FederationError::host_rejected(err.to_string())),
            None => Ok(()),
        }
    }

    fn rollback(&self, _table: &TableHandle) -> FederationResult<()> {
        self.rollback_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use qore_core::{
        ChangeSet, ColumnDescriptor, MemoryTable, RowSource, SourceCapabilities, SourceHandle,
        TableSource,
    };

    use super::*;
    use crate::name::TableName;
    use crate::proxy::BufferPolicy;
    use crate::registry::BindingRegistry;

    fn columns() -> Vec<ColumnDescriptor> {
        vec![
            ColumnDescriptor::new("id", "INTEGER"),
            ColumnDescriptor::new("name", "TEXT"),
        ]
    }

    fn memory(rows: &[(i64, &str)]) -> Arc<Mutex<MemoryTable>> {
        let data = rows
            .iter()
            .map(|(id, name)| vec![Value::Int(*id), Value::from(*name)])
            .collect();
        Arc::new(Mutex::new(MemoryTable::with_rows(columns(), data).unwrap()))
    }

    fn setup(source: SourceHandle) -> (Arc<FederationModule>, TableHandle) {
        let registry = BindingRegistry::shared();
        let handshake = registry
            .lock()
            .insert(
                TableName::parse("t").unwrap(),
                TableSource::Fixed(source),
                BufferPolicy::Buffered,
            )
            .unwrap()
            .handshake
            .clone();
        let module = FederationModule::new(registry);
        let decl = module.create(&handshake).unwrap();
        (module, decl.handle)
    }

    fn scan(module: &FederationModule, table: &TableHandle) -> Vec<(i64, Value)> {
        let mut cursor = module.open(table).unwrap();
        module.filter(&mut cursor, ScanPlan::FullScan, None, &[]).unwrap();
        let mut out = Vec::new();
        while !module.eof(&cursor) {
            out.push((module.rowid(&cursor).unwrap(), module.column(&cursor, 1).unwrap()));
            module.next(&mut cursor).unwrap();
        }
        module.close(&cursor);
        out
    }

    #[test]
    fn test_scan_yields_positional_rowids() {
        let (module, table) = setup(SourceHandle::Random(memory(&[(1, "x"), (2, "y")])));
        assert_eq!(
            scan(&module, &table),
            vec![(0, Value::from("x")), (1, Value::from("y"))]
        );
    }

    #[test]
    fn test_unknown_handshake_is_rejected() {
        let module = FederationModule::new(BindingRegistry::shared());
        assert_eq!(
            module.connect("nope").unwrap_err(),
            FederationError::host_rejected("Wrong usage of virtual tables")
        );
    }

    #[test]
    fn test_next_after_eof_fails() {
        let (module, table) = setup(SourceHandle::Random(memory(&[(1, "x")])));
        let mut cursor = module.open(&table).unwrap();
        module.filter(&mut cursor, ScanPlan::FullScan, None, &[]).unwrap();
        module.next(&mut cursor).unwrap();
        assert!(module.eof(&cursor));
        assert!(module.next(&mut cursor).is_err());
    }

    #[test]
    fn test_hidden_column_is_ordinal() {
        let (module, table) = setup(SourceHandle::Random(memory(&[(1, "x"), (2, "y")])));
        let mut cursor = module.open(&table).unwrap();
        module.filter(&mut cursor, ScanPlan::FullScan, None, &[]).unwrap();
        module.next(&mut cursor).unwrap();
        assert_eq!(module.column(&cursor, 2).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_point_lookup() {
        let (module, table) = setup(SourceHandle::Random(memory(&[(1, "x"), (2, "y")])));
        let plan = module.best_index(
            &table,
            &[IndexConstraint {
                column: -1,
                op: ConstraintOp::Eq,
                usable: true,
            }],
            &[],
        );
        assert_eq!(plan.plan, ScanPlan::PointLookup);
        assert_eq!(plan.arguments, vec![0]);
        assert!(plan.omit);

        let mut cursor = module.open(&table).unwrap();
        module
            .filter(&mut cursor, ScanPlan::PointLookup, None, &[Value::Int(1)])
            .unwrap();
        assert!(!module.eof(&cursor));
        assert_eq!(module.column(&cursor, 1).unwrap(), Value::from("y"));
        module.next(&mut cursor).unwrap();
        assert!(module.eof(&cursor));

        module
            .filter(&mut cursor, ScanPlan::PointLookup, None, &[Value::Int(9)])
            .unwrap();
        assert!(module.eof(&cursor));
    }

    #[test]
    fn test_update_rollback_restores() {
        let (module, table) = setup(SourceHandle::Random(memory(&[(1, "x"), (2, "y")])));
        module.begin(&table).unwrap();
        module
            .update(
                &table,
                RowChange::Update {
                    old_rowid: 1,
                    new_rowid: 1,
                    values: vec![Value::Int(2), "z".into()],
                },
            )
            .unwrap();
        assert_eq!(scan(&module, &table)[1].1, Value::from("z"));
        module.rollback(&table).unwrap();
        assert_eq!(scan(&module, &table)[1].1, Value::from("y"));
    }

    #[test]
    fn test_commit_applies_to_source() {
        let source = memory(&[(1, "x")]);
        let (module, table) = setup(SourceHandle::Random(source.clone()));
        module.begin(&table).unwrap();
        let rowid = module
            .update(
                &table,
                RowChange::Insert {
                    rowid: None,
                    values: vec![Value::Int(2), "y".into()],
                },
            )
            .unwrap();
        assert_eq!(rowid, Some(1));
        module.sync(&table).unwrap();
        module.commit(&table).unwrap();
        assert_eq!(source.lock().rows().len(), 2);
        assert_eq!(module.registry().lock().transaction(), TransactionState::Committed);
    }

    #[test]
    fn test_rekey_and_explicit_rowid_rejected() {
        let (module, table) = setup(SourceHandle::Random(memory(&[(1, "x")])));
        assert!(matches!(
            module.update(
                &table,
                RowChange::Update {
                    old_rowid: 0,
                    new_rowid: 5,
                    values: vec![Value::Int(1), "x".into()],
                }
            ),
            Err(FederationError::Unsupported { .. })
        ));
        assert!(matches!(
            module.update(
                &table,
                RowChange::Insert {
                    rowid: Some(4),
                    values: vec![Value::Int(1), "x".into()],
                }
            ),
            Err(FederationError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_read_only_source() {
        let source = MemoryTable::with_rows(columns(), vec![vec![Value::Int(1), "x".into()]])
            .unwrap()
            .read_only();
        let (module, table) = setup(SourceHandle::random(source));
        assert!(matches!(
            module.update(&table, RowChange::Delete { rowid: 0 }),
            Err(FederationError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_refreshed_binding_makes_cursor_stale() {
        let (module, table) = setup(SourceHandle::Random(memory(&[(1, "x")])));
        let mut cursor = module.open(&table).unwrap();
        module.filter(&mut cursor, ScanPlan::FullScan, None, &[]).unwrap();
        module
            .registry()
            .lock()
            .get_mut(table.binding)
            .unwrap()
            .reset_proxy();
        assert!(!module.eof(&cursor));
        assert!(matches!(
            module.column(&cursor, 0),
            Err(FederationError::Stale { .. })
        ));
    }

    struct FailingSource(MemoryTable);

    impl RowSource for FailingSource {
        fn column_count(&self) -> usize {
            self.0.column_count()
        }
        fn column_descriptor(&self, index: usize) -> Option<ColumnDescriptor> {
            self.0.column_descriptor(index)
        }
        fn row_count(&mut self) -> FederationResult<usize> {
            self.0.row_count()
        }
        fn read(&mut self, row: usize, column: usize) -> FederationResult<Value> {
            self.0.read(row, column)
        }
        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities::WRITABLE
        }
        fn apply_changes(&mut self, _changes: &ChangeSet) -> FederationResult<()> {
            Err(FederationError::source("disk full"))
        }
    }

    /// Fails its first `failures` applies, then applies like a memory table.
    struct FlakySource {
        inner: MemoryTable,
        failures: usize,
    }

    impl RowSource for FlakySource {
        fn column_count(&self) -> usize {
            self.inner.column_count()
        }
        fn column_descriptor(&self, index: usize) -> Option<ColumnDescriptor> {
            self.inner.column_descriptor(index)
        }
        fn row_count(&mut self) -> FederationResult<usize> {
            self.inner.row_count()
        }
        fn read(&mut self, row: usize, column: usize) -> FederationResult<Value> {
            self.inner.read(row, column)
        }
        fn capabilities(&self) -> SourceCapabilities {
            SourceCapabilities::WRITABLE
        }
        fn apply_changes(&mut self, changes: &ChangeSet) -> FederationResult<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(FederationError::source("member unavailable"));
            }
            self.inner.apply_changes(changes)
        }
    }

    fn flaky(failures: usize) -> Arc<Mutex<FlakySource>> {
        Arc::new(Mutex::new(FlakySource {
            inner: MemoryTable::with_rows(columns(), vec![vec![Value::Int(1), "x".into()]])
                .unwrap(),
            failures,
        }))
    }

    fn add_table(module: &FederationModule, name: &str, source: SourceHandle) -> TableHandle {
        let handshake = module
            .registry()
            .lock()
            .insert(
                TableName::parse(name).unwrap(),
                TableSource::Fixed(source),
                BufferPolicy::Buffered,
            )
            .unwrap()
            .handshake
            .clone();
        module.create(&handshake).unwrap().handle
    }

    fn rename(module: &FederationModule, table: &TableHandle, rowid: i64, name: &str) {
        module
            .update(
                table,
                RowChange::Update {
                    old_rowid: rowid,
                    new_rowid: rowid,
                    values: vec![Value::Int(1), name.into()],
                },
            )
            .unwrap();
    }

    #[test]
    fn test_commit_retries_edits_of_other_tables() {
        let module = FederationModule::new(BindingRegistry::shared());
        let f_source = flaky(1);
        let f = add_table(&module, "f", SourceHandle::Random(f_source.clone()));
        let g_source = memory(&[(1, "x")]);
        let g = add_table(&module, "g", SourceHandle::Random(g_source.clone()));

        module.begin(&f).unwrap();
        rename(&module, &f, 0, "first");
        assert!(module.commit(&f).is_err());
        assert!(module.registry().lock().get(f.binding).unwrap().last_apply_error.is_some());

        // A later transaction only writes g; the host commits only g
        module.begin(&g).unwrap();
        rename(&module, &g, 0, "second");
        module.commit(&g).unwrap();

        assert_eq!(f_source.lock().read(0, 1).unwrap(), Value::from("first"));
        assert_eq!(g_source.lock().read(0, 1).unwrap(), Value::from("second"));
        let registry = module.registry().lock();
        let binding = registry.get(f.binding).unwrap();
        assert!(!binding.has_pending());
        assert!(binding.last_apply_error.is_none());
    }

    #[test]
    fn test_commit_all_continues_past_failure() {
        let module = FederationModule::new(BindingRegistry::shared());
        let f = add_table(&module, "f", SourceHandle::Random(flaky(usize::MAX)));
        let g_source = memory(&[(1, "x")]);
        let g = add_table(&module, "g", SourceHandle::Random(g_source.clone()));
        rename(&module, &f, 0, "lost");
        rename(&module, &g, 0, "kept");

        let err = module.commit_all().unwrap_err();
        assert_eq!(err, FederationError::source("member unavailable"));
        assert_eq!(g_source.lock().read(0, 1).unwrap(), Value::from("kept"));

        let mut registry = module.registry().lock();
        assert!(registry.get(f.binding).unwrap().has_pending());
        assert!(!registry.get(g.binding).unwrap().has_pending());
        let errors = registry.take_apply_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "f");
    }

    #[test]
    fn test_rollback_discards_every_table() {
        let module = FederationModule::new(BindingRegistry::shared());
        let f = add_table(&module, "f", SourceHandle::Random(memory(&[(1, "x")])));
        let g = add_table(&module, "g", SourceHandle::Random(memory(&[(1, "x")])));
        rename(&module, &f, 0, "a");
        rename(&module, &g, 0, "b");
        module.rollback(&g).unwrap();
        let registry = module.registry().lock();
        assert!(!registry.get(f.binding).unwrap().has_pending());
        assert!(!registry.get(g.binding).unwrap().has_pending());
    }

    #[test]
    fn test_failed_commit_keeps_edits_and_records_error() {
        let source = FailingSource(
            MemoryTable::with_rows(columns(), vec![vec![Value::Int(1), "x".into()]]).unwrap(),
        );
        let (module, table) = setup(SourceHandle::random(source));
        module.begin(&table).unwrap();
        module.update(&table, RowChange::Delete { rowid: 0 }).unwrap();
        let err = module.commit(&table).unwrap_err();
        assert_eq!(err, FederationError::host_rejected("disk full"));

        let mut registry = module.registry().lock();
        assert!(registry.get(table.binding).unwrap().has_pending());
        let errors = registry.take_apply_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "t");
    }
}
