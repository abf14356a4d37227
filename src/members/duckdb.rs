// SPDX-License-Identifier: Apache-2.0

//! DuckDB member
//!
//! Tables of the `main` schema are addressed by DuckDB's `rowid`
//! pseudo-column; views are read-only.

use std::path::Path;
use std::sync::Arc;

use ::duckdb::{params_from_iter, types::Value as DuckValue, Connection};
use parking_lot::Mutex;
use qore_core::{
    ColumnDescriptor, FederationError, FederationResult, FilterOp, MemberCapabilities,
    MemberConnection, MemberId, ScanRequest, SchemaListener, SourceHandle, StorageClass,
    SubscriptionId, Value,
};
use qore_vtab::name::quote_identifier;
use tracing::{debug, info, instrument};

use super::snapshot::{filters_supported, KeyedStatement, MemberStore, RowKey, SnapshotTable};
use super::watch::{SchemaWatcher, TableSignatures};

fn source_error(e: ::duckdb::Error) -> FederationError {
    FederationError::source(e.to_string())
}

/// Converts a value to a DuckDB value for parameter binding.
fn value_to_duckdb(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(b) => DuckValue::Boolean(*b),
        Value::Int(i) => DuckValue::BigInt(*i),
        Value::Float(f) => DuckValue::Double(*f),
        Value::Text(s) => DuckValue::Text(s.clone()),
        Value::Bytes(b) => DuckValue::Blob(b.clone()),
        Value::Json(j) => DuckValue::Text(j.to_string()),
    }
}

/// Extracts a value from a DuckDB row.
fn duckdb_value(row: &::duckdb::Row<'_>, idx: usize) -> Value {
    // Try types in order of likelihood
    if let Ok(v) = row.get::<_, Option<i64>>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.get::<_, Option<f64>>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.get::<_, Option<bool>>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.get::<_, Option<String>>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.get::<_, Option<Vec<u8>>>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    Value::Null
}

pub struct DuckDbStore {
    conn: Mutex<Connection>,
}

impl MemberStore for DuckDbStore {
    fn fetch(
        &self,
        sql: &str,
        params: &[Value],
        width: usize,
    ) -> FederationResult<Vec<Vec<Value>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(source_error)?;
        let values: Vec<DuckValue> = params.iter().map(value_to_duckdb).collect();
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((0..width).map(|i| duckdb_value(row, i)).collect::<Vec<_>>())
            })
            .map_err(source_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(source_error)?;
        Ok(rows)
    }

    fn execute_in_transaction(&self, statements: &[KeyedStatement]) -> FederationResult<()> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction().map_err(source_error)?;
        for statement in statements {
            let values: Vec<DuckValue> = statement.params.iter().map(value_to_duckdb).collect();
            tx.execute(&statement.sql, params_from_iter(values.iter()))
                .map_err(source_error)?;
        }
        tx.commit().map_err(source_error)
    }

    /// Types without a direct value mapping are read as text, decimals as
    /// doubles.
    fn select_expr(&self, column: &ColumnDescriptor) -> String {
        let name = quote_identifier(&column.name);
        match read_as(&column.declared_type) {
            ReadAs::Native => name,
            ReadAs::Double => format!("CAST({name} AS DOUBLE)"),
            ReadAs::Text => format!("CAST({name} AS VARCHAR)"),
        }
    }

    fn placeholder(&self, index: usize, _column: &ColumnDescriptor) -> String {
        format!("${index}")
    }

    /// Columns read through a text cast are compared by their text form on
    /// the host, so they stay there.
    fn filterable(&self, column: &ColumnDescriptor, op: FilterOp) -> bool {
        read_as(&column.declared_type) != ReadAs::Text
            && match column.storage_class() {
                StorageClass::Integer | StorageClass::Real => true,
                StorageClass::Text => op == FilterOp::Eq,
                StorageClass::Blob => false,
            }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadAs {
    Native,
    Double,
    Text,
}

fn read_as(declared_type: &str) -> ReadAs {
    let upper = declared_type.to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or("").trim();
    match base {
        "BOOLEAN" | "TINYINT" | "SMALLINT" | "INTEGER" | "BIGINT" | "UTINYINT" | "USMALLINT"
        | "UINTEGER" | "FLOAT" | "DOUBLE" | "REAL" | "VARCHAR" | "TEXT" | "BLOB" => ReadAs::Native,
        "DECIMAL" | "NUMERIC" => ReadAs::Double,
        _ => ReadAs::Text,
    }
}

pub struct DuckDbMember {
    id: MemberId,
    name: String,
    store: Arc<DuckDbStore>,
    watcher: SchemaWatcher,
}

impl DuckDbMember {
    pub fn open(path: &Path) -> FederationResult<Self> {
        let conn = Connection::open(path).map_err(|e| {
            FederationError::source(format!("Failed to open DuckDB file '{}': {e}", path.display()))
        })?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("duckdb")
            .to_string();
        Self::from_connection(name, conn)
    }

    pub fn open_in_memory(name: impl Into<String>) -> FederationResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| FederationError::source(format!("Failed to open DuckDB: {e}")))?;
        Self::from_connection(name, conn)
    }

    pub fn from_connection(name: impl Into<String>, conn: Connection) -> FederationResult<Self> {
        let signatures = read_signatures(&conn)?;
        let name = name.into();
        info!(member = %name, tables = signatures.len(), "Opened DuckDB member");
        Ok(Self {
            id: MemberId::new(),
            name,
            store: Arc::new(DuckDbStore {
                conn: Mutex::new(conn),
            }),
            watcher: SchemaWatcher::new(signatures),
        })
    }

    #[instrument(skip(self, sql), fields(member = %self.name))]
    pub fn execute_batch(&self, sql: &str) -> FederationResult<()> {
        self.store.conn.lock().execute_batch(sql).map_err(source_error)?;
        self.refresh_schema()?;
        Ok(())
    }

    pub fn refresh_schema(&self) -> FederationResult<usize> {
        let signatures = {
            let conn = self.store.conn.lock();
            read_signatures(&conn)?
        };
        Ok(self.watcher.update(signatures))
    }

    fn is_view(&self, table: &str) -> FederationResult<bool> {
        let conn = self.store.conn.lock();
        let table_type: String = conn
            .query_row(
                "SELECT table_type FROM information_schema.tables \
                 WHERE table_schema = 'main' AND table_name = ?1",
                [table],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                ::duckdb::Error::QueryReturnedNoRows => FederationError::not_found(table),
                other => source_error(other),
            })?;
        Ok(table_type.contains("VIEW"))
    }
}

fn read_signatures(conn: &Connection) -> FederationResult<TableSignatures> {
    let mut stmt = conn
        .prepare(
            "SELECT table_name, column_name, data_type, is_nullable \
             FROM information_schema.columns \
             WHERE table_schema = 'main' \
             ORDER BY table_name, ordinal_position",
        )
        .map_err(source_error)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(source_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(source_error)?;

    let mut signatures = TableSignatures::new();
    for (table, column, data_type, is_nullable) in rows {
        let descriptor = ColumnDescriptor::new(column, data_type);
        let descriptor = if is_nullable == "YES" {
            descriptor
        } else {
            descriptor.not_null()
        };
        signatures.entry(table).or_default().push(descriptor);
    }
    Ok(signatures)
}

impl MemberConnection for DuckDbMember {
    fn id(&self) -> MemberId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    /// One DuckDB connection per member, not shared across threads.
    fn capabilities(&self) -> MemberCapabilities {
        MemberCapabilities {
            thread_safe: false,
            writable: true,
        }
    }

    fn list_tables(&self) -> FederationResult<Vec<String>> {
        Ok(self.watcher.tables())
    }

    fn describe_table(&self, table: &str) -> FederationResult<Vec<ColumnDescriptor>> {
        self.watcher
            .columns(table)
            .ok_or_else(|| FederationError::not_found(table))
    }

    fn open_table(&self, table: &str) -> FederationResult<SourceHandle> {
        let columns = self.describe_table(table)?;
        let view = self.is_view(table)?;
        let key = if view { RowKey::None } else { RowKey::RowId };
        debug!(member = %self.name, table, view, "Opening member table");
        Ok(SourceHandle::random(SnapshotTable::new(
            self.store.clone(),
            table,
            columns,
            key,
            !view,
        )))
    }

    fn accepts_filter(&self, table: &str, column: usize, op: FilterOp) -> bool {
        self.watcher
            .columns(table)
            .and_then(|columns| columns.get(column).cloned())
            .is_some_and(|column| self.store.filterable(&column, op))
    }

    fn open_table_filtered(
        &self,
        table: &str,
        request: &ScanRequest,
    ) -> FederationResult<Option<SourceHandle>> {
        let columns = self.describe_table(table)?;
        if !filters_supported(self.store.as_ref(), &columns, request) {
            return Ok(None);
        }
        debug!(member = %self.name, table, filters = request.filters.len(), "Opening filtered member table");
        Ok(Some(SourceHandle::random(
            SnapshotTable::new(self.store.clone(), table, columns, RowKey::None, false)
                .filtered(request.clone()),
        )))
    }

    fn subscribe(&self, listener: Arc<dyn SchemaListener>) -> SubscriptionId {
        self.watcher.subscribe(listener)
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        self.watcher.unsubscribe(subscription)
    }
}
