// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL member
//!
//! Bridges an sqlx pool to the synchronous member contract with a private
//! current-thread runtime. Rows are addressed by primary key; tables
//! without one accept inserts only.
//!
//! PostgreSQL has no schema notification we can listen to without a
//! dedicated connection, so changes are detected by [`PostgresMember::refresh_schema`].

use std::sync::Arc;

use qore_core::{
    ColumnDescriptor, FederationError, FederationResult, FilterOp, MemberConnection, MemberId,
    ScanRequest, SchemaListener, SourceHandle, StorageClass, SubscriptionId, Value,
};
use qore_vtab::name::quote_identifier;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{AssertSqlSafe, Row};
use tokio::runtime::Runtime;
use tracing::{debug, info, instrument};

use super::snapshot::{filters_supported, KeyedStatement, MemberStore, RowKey, SnapshotTable};
use super::watch::{SchemaWatcher, TableSignatures};

const DEFAULT_SCHEMA: &str = "public";
const MAX_CONNECTIONS: u32 = 4;

fn source_error(e: sqlx::Error) -> FederationError {
    FederationError::source(e.to_string())
}

/// Types read without a cast.
fn is_native_type(udt: &str) -> bool {
    matches!(
        udt,
        "int2" | "int4" | "int8" | "bool" | "float4" | "float8" | "text" | "varchar" | "bpchar"
            | "name" | "bytea" | "json" | "jsonb"
    )
}

/// Helper to bind a value to a Postgres query
fn bind_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(b),
        Value::Int(i) => query.bind(i),
        Value::Float(f) => query.bind(f),
        Value::Text(s) => query.bind(s),
        Value::Bytes(b) => query.bind(b),
        Value::Json(j) => query.bind(j),
    }
}

/// Extracts a value from a PgRow at the given index
fn extract_value(row: &PgRow, idx: usize) -> Value {
    // try_get with Option<T> handles NULLs
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::Int).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(|i| Value::Int(i64::from(i))).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::Float).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(|f| Value::Float(f64::from(f))).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::Text).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v.map(Value::Bytes).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<serde_json::Value>, _>(idx) {
        return v.map(Value::Json).unwrap_or(Value::Null);
    }
    Value::Null
}

fn select_expression(column: &ColumnDescriptor) -> String {
    let name = quote_identifier(&column.name);
    if is_native_type(&column.declared_type) {
        name
    } else if column.storage_class() == StorageClass::Real {
        format!("{name}::float8")
    } else {
        format!("{name}::text")
    }
}

/// The host has no boolean type; integers written to a `bool` column are
/// converted back.
fn coerce_value(value: Value, column: &ColumnDescriptor) -> Value {
    match value {
        Value::Int(i) if column.declared_type == "bool" => Value::Bool(i != 0),
        other => other,
    }
}

pub struct PostgresStore {
    pool: PgPool,
    runtime: Runtime,
}

impl MemberStore for PostgresStore {
    fn fetch(
        &self,
        sql: &str,
        params: &[Value],
        width: usize,
    ) -> FederationResult<Vec<Vec<Value>>> {
        let mut query = sqlx::query(AssertSqlSafe(sql.to_owned()));
        for value in params {
            query = bind_param(query, value);
        }
        let rows = self
            .runtime
            .block_on(query.fetch_all(&self.pool))
            .map_err(source_error)?;
        Ok(rows
            .iter()
            .map(|row| (0..width).map(|i| extract_value(row, i)).collect())
            .collect())
    }

    fn execute_in_transaction(&self, statements: &[KeyedStatement]) -> FederationResult<()> {
        self.runtime
            .block_on(async {
                let mut tx = self.pool.begin().await?;
                for statement in statements {
                    let mut query = sqlx::query(AssertSqlSafe(statement.sql.clone()));
                    for value in &statement.params {
                        query = bind_param(query, value);
                    }
                    query.execute(&mut *tx).await?;
                }
                tx.commit().await
            })
            .map_err(source_error)
    }

    fn placeholder(&self, index: usize, column: &ColumnDescriptor) -> String {
        format!("${index}::{}", quote_identifier(&column.declared_type))
    }

    fn select_expr(&self, column: &ColumnDescriptor) -> String {
        select_expression(column)
    }

    fn coerce(&self, value: Value, column: &ColumnDescriptor) -> Value {
        coerce_value(value, column)
    }

    fn filterable(&self, column: &ColumnDescriptor, op: FilterOp) -> bool {
        is_filterable(column, op)
    }
}

/// Columns read through a cast compare differently on the server, and
/// `json` has no equality operator.
fn is_filterable(column: &ColumnDescriptor, op: FilterOp) -> bool {
    let udt = column.declared_type.as_str();
    if !is_native_type(udt) || matches!(udt, "json" | "jsonb") {
        return false;
    }
    match column.storage_class() {
        StorageClass::Integer | StorageClass::Real => true,
        StorageClass::Text => op == FilterOp::Eq,
        StorageClass::Blob => false,
    }
}

pub struct PostgresMember {
    id: MemberId,
    name: String,
    schema: String,
    store: Arc<PostgresStore>,
    watcher: SchemaWatcher,
}

impl PostgresMember {
    /// Connects to `url`, exposing the tables of the `public` schema.
    pub fn connect(url: &str) -> FederationResult<Self> {
        Self::connect_schema(url, DEFAULT_SCHEMA)
    }

    #[instrument(skip(url))]
    pub fn connect_schema(url: &str, schema: &str) -> FederationResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| FederationError::source(format!("Failed to start runtime: {e}")))?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(MAX_CONNECTIONS)
                    .connect(url),
            )
            .map_err(|e| FederationError::source(format!("Failed to connect to PostgreSQL: {e}")))?;
        let store = PostgresStore { pool, runtime };
        let signatures = read_signatures(&store, schema)?;
        let name = format!("postgres:{schema}");
        info!(member = %name, tables = signatures.len(), "Connected PostgreSQL member");
        Ok(Self {
            id: MemberId::new(),
            name,
            schema: schema.to_string(),
            store: Arc::new(store),
            watcher: SchemaWatcher::new(signatures),
        })
    }

    /// Runs a statement directly on the member and reports schema changes.
    pub fn execute(&self, sql: &str) -> FederationResult<()> {
        self.store
            .runtime
            .block_on(sqlx::query(AssertSqlSafe(sql.to_owned())).execute(&self.store.pool))
            .map_err(source_error)?;
        self.refresh_schema()?;
        Ok(())
    }

    pub fn refresh_schema(&self) -> FederationResult<usize> {
        let signatures = read_signatures(&self.store, &self.schema)?;
        Ok(self.watcher.update(signatures))
    }

    fn table_kind(&self, table: &str) -> FederationResult<(bool, Vec<String>)> {
        let store = &self.store;
        let (table_type, pk_columns) = store
            .runtime
            .block_on(async {
                let table_type: Option<(String,)> = sqlx::query_as(
                    "SELECT table_type::text FROM information_schema.tables \
                     WHERE table_schema = $1 AND table_name = $2",
                )
                .bind(&self.schema)
                .bind(table)
                .fetch_optional(&store.pool)
                .await?;

                let pk_rows: Vec<(String,)> = sqlx::query_as(
                    r#"
                    SELECT a.attname::text
                    FROM pg_index i
                    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
                    JOIN pg_class c ON c.oid = i.indrelid
                    JOIN pg_namespace n ON n.oid = c.relnamespace
                    WHERE i.indisprimary
                      AND n.nspname = $1
                      AND c.relname = $2
                    ORDER BY array_position(i.indkey, a.attnum)
                    "#,
                )
                .bind(&self.schema)
                .bind(table)
                .fetch_all(&store.pool)
                .await?;
                Ok::<_, sqlx::Error>((table_type, pk_rows))
            })
            .map_err(source_error)?;
        let (table_type,) = table_type.ok_or_else(|| FederationError::not_found(table))?;
        let pk_columns = pk_columns.into_iter().map(|(name,)| name).collect();
        Ok((table_type == "BASE TABLE", pk_columns))
    }
}

fn read_signatures(store: &PostgresStore, schema: &str) -> FederationResult<TableSignatures> {
    let rows: Vec<(String, String, String, String)> = store
        .runtime
        .block_on(
            sqlx::query_as(
                r#"
                SELECT table_name::text, column_name::text, udt_name::text, is_nullable::text
                FROM information_schema.columns
                WHERE table_schema = $1
                ORDER BY table_name, ordinal_position
                "#,
            )
            .bind(schema)
            .fetch_all(&store.pool),
        )
        .map_err(source_error)?;

    let mut signatures = TableSignatures::new();
    for (table, column, udt, is_nullable) in rows {
        let descriptor = ColumnDescriptor::new(column, udt);
        let descriptor = if is_nullable == "YES" {
            descriptor
        } else {
            descriptor.not_null()
        };
        signatures.entry(table).or_default().push(descriptor);
    }
    Ok(signatures)
}

impl MemberConnection for PostgresMember {
    fn id(&self) -> MemberId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
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
        let (base_table, pk_columns) = self.table_kind(table)?;
        let indices: Vec<usize> = pk_columns
            .iter()
            .filter_map(|pk| columns.iter().position(|c| c.name == pk.as_str()))
            .collect();
        let key = if base_table && !indices.is_empty() && indices.len() == pk_columns.len() {
            RowKey::Columns(indices)
        } else {
            RowKey::None
        };
        debug!(member = %self.name, table, ?key, base_table, "Opening member table");
        Ok(SourceHandle::random(
            SnapshotTable::new(self.store.clone(), table, columns, key, base_table)
                .in_schema(self.schema.clone()),
        ))
    }

    fn accepts_filter(&self, table: &str, column: usize, op: FilterOp) -> bool {
        self.watcher
            .columns(table)
            .and_then(|columns| columns.get(column).cloned())
            .is_some_and(|column| is_filterable(&column, op))
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
                .in_schema(self.schema.clone())
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
