// SPDX-License-Identifier: Apache-2.0

//! SQLite member
//!
//! A rusqlite connection whose tables and views join a hub. Rows are
//! addressed by `rowid`; views and `WITHOUT ROWID` tables are exposed
//! read-only (views) or insert-only (`WITHOUT ROWID`).

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use qore_core::{
    ColumnDescriptor, FederationError, FederationResult, FilterOp, MemberCapabilities,
    MemberConnection, MemberId, ScanRequest, SchemaListener, SourceHandle, SubscriptionId, Value,
};
use qore_vtab::name::quote_identifier;
use qore_vtab::sqlite::{value_from_sqlite, value_to_sqlite};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, info, instrument};

use super::snapshot::{filters_supported, KeyedStatement, MemberStore, RowKey, SnapshotTable};
use super::watch::{SchemaWatcher, TableSignatures};

fn source_error(e: rusqlite::Error) -> FederationError {
    FederationError::source(e.to_string())
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl MemberStore for SqliteStore {
    fn fetch(
        &self,
        sql: &str,
        params: &[Value],
        width: usize,
    ) -> FederationResult<Vec<Vec<Value>>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql).map_err(source_error)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter().map(value_to_sqlite)), |row| {
                (0..width)
                    .map(|i| row.get::<_, SqlValue>(i).map(value_from_sqlite))
                    .collect::<rusqlite::Result<Vec<Value>>>()
            })
            .map_err(source_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(source_error)?;
        Ok(rows)
    }

    fn execute_in_transaction(&self, statements: &[KeyedStatement]) -> FederationResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(source_error)?;
        for statement in statements {
            tx.execute(
                &statement.sql,
                params_from_iter(statement.params.iter().map(value_to_sqlite)),
            )
            .map_err(source_error)?;
        }
        tx.commit().map_err(source_error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Table,
    View,
}

pub struct SqliteMember {
    id: MemberId,
    name: String,
    store: Arc<SqliteStore>,
    watcher: SchemaWatcher,
    writable: bool,
}

impl SqliteMember {
    pub fn open(path: &Path) -> FederationResult<Self> {
        let conn = Connection::open(path).map_err(|e| {
            FederationError::source(format!("Failed to open SQLite file '{}': {e}", path.display()))
        })?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("sqlite")
            .to_string();
        Self::from_connection(name, conn)
    }

    pub fn open_in_memory(name: impl Into<String>) -> FederationResult<Self> {
        let conn = Connection::open_in_memory().map_err(source_error)?;
        Self::from_connection(name, conn)
    }

    pub fn from_connection(name: impl Into<String>, conn: Connection) -> FederationResult<Self> {
        let signatures = read_signatures(&conn)?;
        let name = name.into();
        info!(member = %name, tables = signatures.len(), "Opened SQLite member");
        Ok(Self {
            id: MemberId::new(),
            name,
            store: Arc::new(SqliteStore {
                conn: Mutex::new(conn),
            }),
            watcher: SchemaWatcher::new(signatures),
            writable: true,
        })
    }

    /// Exposes every table read-only.
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    /// Runs statements directly on the member, then reports schema changes
    /// they caused to subscribers.
    #[instrument(skip(self, sql), fields(member = %self.name))]
    pub fn execute_batch(&self, sql: &str) -> FederationResult<()> {
        self.store.conn.lock().execute_batch(sql).map_err(source_error)?;
        self.refresh_schema()?;
        Ok(())
    }

    /// Re-reads the schema and notifies subscribers of any difference.
    pub fn refresh_schema(&self) -> FederationResult<usize> {
        let signatures = {
            let conn = self.store.conn.lock();
            read_signatures(&conn)?
        };
        Ok(self.watcher.update(signatures))
    }

    fn object_key(&self, table: &str) -> FederationResult<(ObjectKind, RowKey)> {
        let conn = self.store.conn.lock();
        let kind: String = conn
            .query_row(
                "SELECT type FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
                [table],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => FederationError::not_found(table),
                other => source_error(other),
            })?;
        if kind == "view" {
            return Ok((ObjectKind::View, RowKey::None));
        }
        let has_rowid = conn
            .prepare(&format!("SELECT rowid FROM {} LIMIT 0", quote_identifier(table)))
            .is_ok();
        let key = if has_rowid { RowKey::RowId } else { RowKey::None };
        Ok((ObjectKind::Table, key))
    }
}

fn read_signatures(conn: &Connection) -> FederationResult<TableSignatures> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .map_err(source_error)?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(source_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(source_error)?;

    let mut signatures = TableSignatures::new();
    for table in tables {
        let mut info = conn
            .prepare(&format!("PRAGMA table_info({})", quote_identifier(&table)))
            .map_err(source_error)?;
        let columns = info
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let declared: String = row.get(2)?;
                let not_null: bool = row.get(3)?;
                let column = ColumnDescriptor::new(name, declared);
                Ok(if not_null { column.not_null() } else { column })
            })
            .map_err(source_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(source_error)?;
        signatures.insert(table, columns);
    }
    Ok(signatures)
}

impl MemberConnection for SqliteMember {
    fn id(&self) -> MemberId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> MemberCapabilities {
        MemberCapabilities {
            thread_safe: true,
            writable: self.writable,
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
        let (kind, key) = self.object_key(table)?;
        let writable = self.writable && kind == ObjectKind::Table;
        debug!(member = %self.name, table, ?key, writable, "Opening member table");
        Ok(SourceHandle::random(SnapshotTable::new(
            self.store.clone(),
            table,
            columns,
            key,
            writable,
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
        let (_, key) = self.object_key(table)?;
        debug!(member = %self.name, table, filters = request.filters.len(), "Opening filtered member table");
        Ok(Some(SourceHandle::random(
            SnapshotTable::new(self.store.clone(), table, columns, key, false)
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

#[cfg(test)]
mod tests {
    use qore_core::RowSource;

    use super::*;

    fn member() -> SqliteMember {
        let member = SqliteMember::open_in_memory("mem").unwrap();
        member
            .execute_batch(
                "CREATE TABLE items(id INTEGER NOT NULL, label TEXT);
                 INSERT INTO items VALUES (1, 'a'), (2, 'b');
                 CREATE VIEW labels AS SELECT label FROM items;",
            )
            .unwrap();
        member
    }

    #[test]
    fn test_lists_tables_and_views() {
        let member = member();
        assert_eq!(member.list_tables().unwrap(), vec!["items", "labels"]);
        let columns = member.describe_table("items").unwrap();
        assert_eq!(columns[0].name, "id");
        assert!(!columns[0].nullable);
        assert!(matches!(
            member.describe_table("missing"),
            Err(FederationError::NotFound { .. })
        ));
    }

    #[test]
    fn test_view_is_read_only() {
        let member = member();
        let handle = member.open_table("labels").unwrap();
        let SourceHandle::Random(source) = handle else {
            panic!("expected a random-access source");
        };
        let mut source = source.lock();
        assert!(!source.capabilities().is_writable());
        assert_eq!(source.row_count().unwrap(), 2);
    }

    #[test]
    fn test_filtered_open_reads_matching_rows() {
        let member = member();
        assert!(member.accepts_filter("items", 0, FilterOp::Gt));
        assert!(!member.accepts_filter("items", 1, FilterOp::Gt));
        assert!(!member.accepts_filter("items", 9, FilterOp::Eq));

        let request = ScanRequest {
            filters: vec![qore_core::ColumnFilter {
                column: 0,
                op: FilterOp::Gt,
                value: Value::Int(1),
            }],
            order_by: Vec::new(),
        };
        let Some(SourceHandle::Random(source)) =
            member.open_table_filtered("items", &request).unwrap()
        else {
            panic!("expected a filtered random-access source");
        };
        let mut source = source.lock();
        assert_eq!(source.row_count().unwrap(), 1);
        assert_eq!(source.read(0, 1).unwrap(), Value::from("b"));
        assert!(!source.capabilities().is_writable());

        // A text value cannot be compared with an integer column member-side
        let mismatched = ScanRequest {
            filters: vec![qore_core::ColumnFilter {
                column: 0,
                op: FilterOp::Eq,
                value: Value::from("1"),
            }],
            order_by: Vec::new(),
        };
        assert!(member.open_table_filtered("items", &mismatched).unwrap().is_none());
    }

    #[test]
    fn test_on_disk_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE stock(sku TEXT, qty INTEGER)").unwrap();
        }
        let member = SqliteMember::open(&path).unwrap();
        assert_eq!(member.name(), "inventory");
        assert_eq!(member.list_tables().unwrap(), vec!["stock"]);
    }
}
