// SPDX-License-Identifier: Apache-2.0

//! SQLite host adapter
//!
//! Registers [`FederationModule`] as a rusqlite update-capable,
//! transactional virtual-table module and implements [`HostEngine`] over a
//! rusqlite connection. The adapter only converts arguments and results;
//! every decision is made by the module.

use std::marker::PhantomData;
use std::os::raw::c_int;
use std::sync::Arc;

use qore_core::{FederationError, FederationResult, OrderTerm, Value};
use rusqlite::ffi;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::vtab::{
    update_module_with_tx, Context, CreateVTab, Filters, IndexConstraintOp, IndexInfo, Inserts,
    TransactionVTab, UpdateVTab, Updates, VTab, VTabConnection, VTabCursor, VTabKind,
    sqlite3_vtab, sqlite3_vtab_cursor,
};
use rusqlite::Connection;
use tracing::debug;

use crate::cursor::{Cursor, PushdownPlan, ScanPlan};
use crate::host::HostEngine;
use crate::module::{
    ConstraintOp, FederationModule, IndexConstraint, RowChange, TableDeclaration, TableHandle,
    VirtualTableModule,
};
use crate::name::{quote_identifier, TableName};

/// Translates a module error into a SQLite result code with its message.
fn to_sqlite_error(err: FederationError) -> rusqlite::Error {
    let code = match &err {
        FederationError::ReadOnly { .. } => ffi::SQLITE_READONLY,
        FederationError::RowNotFound { .. } => ffi::SQLITE_NOTFOUND,
        FederationError::Stale { .. } => ffi::SQLITE_ABORT,
        FederationError::Unsupported { .. } => ffi::SQLITE_MISUSE,
        _ => ffi::SQLITE_ERROR,
    };
    rusqlite::Error::SqliteFailure(ffi::Error::new(code), Some(err.to_string()))
}

/// Maps a host error back into the federation taxonomy.
pub fn from_sqlite_error(err: rusqlite::Error) -> FederationError {
    match &err {
        rusqlite::Error::SqliteFailure(code, message) if code.code == ffi::ErrorCode::ReadOnly => {
            FederationError::read_only(message.clone().unwrap_or_else(|| err.to_string()))
        }
        _ => FederationError::host_rejected(err.to_string()),
    }
}

pub fn value_to_sqlite(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
        Value::Json(j) => SqlValue::Text(j.to_string()),
    }
}

pub fn value_from_sqlite(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Int(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Bytes(b),
    }
}

pub fn value_from_ref(value: ValueRef<'_>) -> Value {
    value_from_sqlite(SqlValue::from(value))
}

/// The handshake is the single module argument, quoted as a SQL string.
fn handshake_argument(args: &[&[u8]]) -> rusqlite::Result<String> {
    let raw = args
        .get(3)
        .ok_or_else(|| to_sqlite_error(FederationError::host_rejected("Wrong usage of virtual tables")))?;
    let text = std::str::from_utf8(raw)
        .map_err(|e| rusqlite::Error::ModuleError(format!("Invalid module argument: {e}")))?
        .trim();
    Ok(text.trim_matches(|c| c == '\'' || c == '"').to_string())
}

#[repr(C)]
pub struct FederatedVTab {
    /// Base class. Must be first
    base: sqlite3_vtab,
    module: Arc<FederationModule>,
    handle: TableHandle,
}

impl FederatedVTab {
    fn from_declaration(module: &Arc<FederationModule>, decl: TableDeclaration) -> (String, Self) {
        (
            decl.schema,
            FederatedVTab {
                base: sqlite3_vtab::default(),
                module: module.clone(),
                handle: decl.handle,
            },
        )
    }

    fn row_values(&self, args: &rusqlite::vtab::Values<'_>) -> rusqlite::Result<Vec<Value>> {
        // args: old rowid, new rowid, declared columns, hidden ordinal column
        (0..self.handle.column_count)
            .map(|i| args.get::<SqlValue>(i + 2).map(value_from_sqlite))
            .collect()
    }
}

fn constraint_op(op: &IndexConstraintOp) -> ConstraintOp {
    match op {
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_EQ => ConstraintOp::Eq,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GT => ConstraintOp::Gt,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_GE => ConstraintOp::Ge,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LT => ConstraintOp::Lt,
        IndexConstraintOp::SQLITE_INDEX_CONSTRAINT_LE => ConstraintOp::Le,
        _ => ConstraintOp::Other,
    }
}

fn module_aux(aux: Option<&Arc<FederationModule>>) -> rusqlite::Result<&Arc<FederationModule>> {
    aux.ok_or_else(|| rusqlite::Error::ModuleError("federation module not installed".to_string()))
}

unsafe impl<'vtab> VTab<'vtab> for FederatedVTab {
    type Aux = Arc<FederationModule>;
    type Cursor = FederatedCursor<'vtab>;

    fn connect(
        _db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let module = module_aux(aux)?;
        let handshake = handshake_argument(args)?;
        let decl = module.connect(&handshake).map_err(to_sqlite_error)?;
        Ok(Self::from_declaration(module, decl))
    }

    fn best_index(&self, info: &mut IndexInfo) -> rusqlite::Result<()> {
        let constraints: Vec<IndexConstraint> = info
            .constraints()
            .map(|c| IndexConstraint {
                column: c.column(),
                op: constraint_op(&c.operator()),
                usable: c.is_usable(),
            })
            .collect();
        // Terms on the hidden ordinal column are left to the host
        let order_by: Vec<OrderTerm> = info
            .order_bys()
            .filter_map(|o| {
                let column = usize::try_from(o.column()).ok()?;
                (column < self.handle.column_count).then_some(OrderTerm {
                    column,
                    descending: o.is_order_by_desc(),
                })
            })
            .collect();

        let plan = self.module.best_index(&self.handle, &constraints, &order_by);
        for (position, index) in plan.arguments.iter().enumerate() {
            let mut usage = info.constraint_usage(*index);
            usage.set_argv_index(position as c_int + 1);
            usage.set_omit(plan.omit);
        }
        if let Some(pushdown) = &plan.pushdown {
            info.set_idx_str(&pushdown.encode());
        }
        info.set_idx_num(plan.plan.idx_num());
        info.set_estimated_cost(plan.estimated_cost);
        info.set_estimated_rows(plan.estimated_rows);
        Ok(())
    }

    fn open(&'vtab mut self) -> rusqlite::Result<FederatedCursor<'vtab>> {
        let cursor = self.module.open(&self.handle).map_err(to_sqlite_error)?;
        Ok(FederatedCursor {
            base: sqlite3_vtab_cursor::default(),
            phantom: PhantomData,
            module: self.module.clone(),
            cursor,
        })
    }
}

impl<'vtab> CreateVTab<'vtab> for FederatedVTab {
    const KIND: VTabKind = VTabKind::Default;

    fn create(
        _db: &mut VTabConnection,
        aux: Option<&Self::Aux>,
        args: &[&[u8]],
    ) -> rusqlite::Result<(String, Self)> {
        let module = module_aux(aux)?;
        let handshake = handshake_argument(args)?;
        let decl = module.create(&handshake).map_err(to_sqlite_error)?;
        Ok(Self::from_declaration(module, decl))
    }

    fn destroy(&self) -> rusqlite::Result<()> {
        self.module.destroy(&self.handle).map_err(to_sqlite_error)
    }
}

impl<'vtab> UpdateVTab<'vtab> for FederatedVTab {
    fn delete(&mut self, arg: ValueRef<'_>) -> rusqlite::Result<()> {
        let rowid = match arg {
            ValueRef::Integer(rowid) => rowid,
            other => {
                return Err(rusqlite::Error::ModuleError(format!(
                    "Invalid rowid {other:?}"
                )))
            }
        };
        self.module
            .update(&self.handle, RowChange::Delete { rowid })
            .map(|_| ())
            .map_err(to_sqlite_error)
    }

    fn insert(&mut self, args: &Inserts<'_>) -> rusqlite::Result<i64> {
        let rowid = args.get::<Option<i64>>(1)?;
        let values = self.row_values(args)?;
        let inserted = self
            .module
            .update(&self.handle, RowChange::Insert { rowid, values })
            .map_err(to_sqlite_error)?;
        inserted.ok_or_else(|| rusqlite::Error::ModuleError("insert returned no rowid".to_string()))
    }

    fn update(&mut self, args: &Updates<'_>) -> rusqlite::Result<()> {
        let old_rowid = args.get::<i64>(0)?;
        let new_rowid = args.get::<i64>(1)?;
        let values = self.row_values(args)?;
        self.module
            .update(
                &self.handle,
                RowChange::Update {
                    old_rowid,
                    new_rowid,
                    values,
                },
            )
            .map(|_| ())
            .map_err(to_sqlite_error)
    }
}

impl<'vtab> TransactionVTab<'vtab> for FederatedVTab {
    fn begin(&mut self) -> rusqlite::Result<()> {
        self.module.begin(&self.handle).map_err(to_sqlite_error)
    }

    fn sync(&mut self) -> rusqlite::Result<()> {
        self.module.sync(&self.handle).map_err(to_sqlite_error)
    }

    fn commit(&mut self) -> rusqlite::Result<()> {
        self.module.commit(&self.handle).map_err(to_sqlite_error)
    }

    fn rollback(&mut self) -> rusqlite::Result<()> {
        self.module.rollback(&self.handle).map_err(to_sqlite_error)
    }
}

impl Drop for FederatedVTab {
    fn drop(&mut self) {
        self.module.disconnect(&self.handle);
    }
}

#[repr(C)]
pub struct FederatedCursor<'vtab> {
    /// Base class. Must be first
    base: sqlite3_vtab_cursor,
    phantom: PhantomData<&'vtab FederatedVTab>,
    module: Arc<FederationModule>,
    cursor: Cursor,
}

unsafe impl VTabCursor for FederatedCursor<'_> {
    fn filter(
        &mut self,
        idx_num: c_int,
        idx_str: Option<&str>,
        args: &Filters<'_>,
    ) -> rusqlite::Result<()> {
        let values: Vec<Value> = (0..args.len())
            .map(|i| args.get::<SqlValue>(i).map(value_from_sqlite))
            .collect::<rusqlite::Result<_>>()?;
        let pushdown = idx_str
            .map(PushdownPlan::decode)
            .transpose()
            .map_err(to_sqlite_error)?;
        self.module
            .filter(
                &mut self.cursor,
                ScanPlan::from_idx_num(idx_num),
                pushdown.as_ref(),
                &values,
            )
            .map_err(to_sqlite_error)
    }

    fn next(&mut self) -> rusqlite::Result<()> {
        self.module.next(&mut self.cursor).map_err(to_sqlite_error)
    }

    fn eof(&self) -> bool {
        self.module.eof(&self.cursor)
    }

    fn column(&self, ctx: &mut Context, i: c_int) -> rusqlite::Result<()> {
        let index = usize::try_from(i)
            .map_err(|_| rusqlite::Error::ModuleError(format!("Invalid column index {i}")))?;
        let value = self
            .module
            .column(&self.cursor, index)
            .map_err(to_sqlite_error)?;
        ctx.set_result(&value_to_sqlite(&value))
    }

    fn rowid(&self) -> rusqlite::Result<i64> {
        self.module.rowid(&self.cursor).map_err(to_sqlite_error)
    }
}

impl Drop for FederatedCursor<'_> {
    fn drop(&mut self) {
        self.module.close(&self.cursor);
    }
}

/// Result rows of an ad-hoc host query
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// A rusqlite connection acting as the federation host.
pub struct SqliteHost {
    conn: Connection,
}

impl SqliteHost {
    pub fn open_in_memory() -> FederationResult<Self> {
        let conn = Connection::open_in_memory().map_err(from_sqlite_error)?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Runs one or more statements, returning the rows changed by the last.
    pub fn execute(&self, sql: &str) -> FederationResult<usize> {
        self.conn.execute_batch(sql).map_err(from_sqlite_error)?;
        Ok(self.conn.changes() as usize)
    }

    pub fn query(&self, sql: &str) -> FederationResult<QueryRows> {
        let mut stmt = self.conn.prepare(sql).map_err(from_sqlite_error)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();
        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, SqlValue>(i).map(value_from_sqlite))
                    .collect::<rusqlite::Result<Vec<Value>>>()
            })
            .map_err(from_sqlite_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(from_sqlite_error)?;
        Ok(QueryRows { columns, rows })
    }
}

impl HostEngine for SqliteHost {
    fn install_module(&self, module_name: &str, module: Arc<FederationModule>) -> FederationResult<()> {
        self.conn
            .create_module(module_name, update_module_with_tx::<FederatedVTab>(), Some(module))
            .map_err(from_sqlite_error)?;
        debug!(module = module_name, "Installed federation module");
        Ok(())
    }

    fn create_virtual_table(&self, table: &TableName, module_name: &str, handshake: &str) -> FederationResult<()> {
        let sql = format!(
            "CREATE VIRTUAL TABLE {} USING {}('{}')",
            table.to_sql(),
            module_name,
            handshake.replace('\'', "''")
        );
        self.conn
            .execute_batch(&sql)
            .map_err(|e| FederationError::host_rejected(e.to_string()))
    }

    fn drop_table(&self, table: &TableName) -> FederationResult<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE {}", table.to_sql()))
            .map_err(|e| FederationError::host_rejected(e.to_string()))
    }

    fn attach_namespace(&self, namespace: &str) -> FederationResult<()> {
        self.conn
            .execute_batch(&format!("ATTACH DATABASE ':memory:' AS {}", quote_identifier(namespace)))
            .map_err(|e| FederationError::host_rejected(e.to_string()))
    }

    fn detach_namespace(&self, namespace: &str) -> FederationResult<()> {
        self.conn
            .execute_batch(&format!("DETACH DATABASE {}", quote_identifier(namespace)))
            .map_err(|e| FederationError::host_rejected(e.to_string()))
    }
}
