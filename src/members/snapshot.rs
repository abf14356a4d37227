// SPDX-License-Identifier: Apache-2.0

//! Keyed snapshot of a member table
//!
//! Reads the whole table on first access and addresses rows by position.
//! Committed edits are translated back into keyed `UPDATE`/`DELETE`/`INSERT`
//! statements run in one member transaction, after which the snapshot is
//! reloaded.
//!
//! A filtered snapshot reads only the rows matching a [`ScanRequest`] and
//! is read-only.

use std::sync::Arc;

use qore_core::{
    ChangeSet, ColumnDescriptor, FederationError, FederationResult, FilterOp, RowSource,
    ScanRequest, SourceCapabilities, StorageClass, Value,
};
use qore_vtab::name::quote_identifier;
use tracing::{debug, instrument};

/// How rows of a member table are addressed in write-back statements
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKey {
    /// The engine's implicit `rowid`.
    RowId,
    /// Primary key columns, by index into the column list.
    Columns(Vec<usize>),
    /// No usable key: only inserts are possible.
    None,
}

/// A statement with positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Query access a snapshot needs from its member
pub trait MemberStore: Send + Sync {
    /// Runs `sql` with positional `params` and returns its rows, each
    /// `width` values wide.
    fn fetch(
        &self,
        sql: &str,
        params: &[Value],
        width: usize,
    ) -> FederationResult<Vec<Vec<Value>>>;

    /// Runs all statements in one transaction, rolling back on failure.
    fn execute_in_transaction(&self, statements: &[KeyedStatement]) -> FederationResult<()>;

    /// Parameter marker for the 1-based `index`, bound to `column`.
    fn placeholder(&self, index: usize, _column: &ColumnDescriptor) -> String {
        format!("?{index}")
    }

    /// Expression used to read `column` in the snapshot query.
    fn select_expr(&self, column: &ColumnDescriptor) -> String {
        quote_identifier(&column.name)
    }

    /// Adjusts a host value before it is bound for `column`.
    fn coerce(&self, value: Value, _column: &ColumnDescriptor) -> Value {
        value
    }

    /// Whether the member evaluates `op` on `column` as the host would.
    /// Text ordering depends on collation, so only equality is trusted.
    fn filterable(&self, column: &ColumnDescriptor, op: FilterOp) -> bool {
        match column.storage_class() {
            StorageClass::Integer | StorageClass::Real => true,
            StorageClass::Text => op == FilterOp::Eq,
            StorageClass::Blob => false,
        }
    }
}

/// Whether every filter of `request` can run on the member: a known,
/// filterable column compared with a value of its storage class.
pub fn filters_supported<S: MemberStore + ?Sized>(
    store: &S,
    columns: &[ColumnDescriptor],
    request: &ScanRequest,
) -> bool {
    !request.filters.is_empty()
        && request.filters.iter().all(|filter| {
            columns
                .get(filter.column)
                .is_some_and(|column| store.filterable(column, filter.op) && filter.fits(column))
        })
}

struct Loaded {
    keys: Vec<Vec<Value>>,
    rows: Vec<Vec<Value>>,
}

pub struct SnapshotTable<S: MemberStore> {
    store: Arc<S>,
    schema: Option<String>,
    table: String,
    columns: Vec<ColumnDescriptor>,
    key: RowKey,
    capabilities: SourceCapabilities,
    request: Option<ScanRequest>,
    loaded: Option<Loaded>,
}

impl<S: MemberStore> SnapshotTable<S> {
    pub fn new(
        store: Arc<S>,
        table: impl Into<String>,
        columns: Vec<ColumnDescriptor>,
        key: RowKey,
        writable: bool,
    ) -> Self {
        let keyed = writable && key != RowKey::None;
        Self {
            store,
            schema: None,
            table: table.into(),
            columns,
            key,
            capabilities: SourceCapabilities {
                random_access: true,
                update: keyed,
                insert: writable,
                delete: keyed,
            },
            request: None,
            loaded: None,
        }
    }

    /// Reads only the rows matching `request`. The snapshot becomes
    /// read-only.
    pub fn filtered(mut self, request: ScanRequest) -> Self {
        self.request = Some(request);
        self.capabilities = SourceCapabilities::READ_ONLY;
        self
    }

    /// Qualifies the table with a schema in generated statements.
    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn key(&self) -> &RowKey {
        &self.key
    }

    fn relation(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&self.table)),
            None => quote_identifier(&self.table),
        }
    }

    fn select_sql(&self) -> (String, Vec<Value>) {
        let mut exprs: Vec<String> = Vec::with_capacity(self.columns.len() + 1);
        if self.key == RowKey::RowId {
            exprs.push("rowid".to_string());
        }
        exprs.extend(self.columns.iter().map(|c| self.store.select_expr(c)));
        let mut sql = format!(
            "SELECT {} FROM {}",
            exprs.join(", "),
            self.relation()
        );

        let mut params = Vec::new();
        let mut order: Vec<String> = Vec::new();
        if let Some(request) = &self.request {
            let mut conditions = Vec::with_capacity(request.filters.len());
            for filter in &request.filters {
                let Some(column) = self.columns.get(filter.column) else {
                    continue;
                };
                params.push(self.store.coerce(filter.value.clone(), column));
                conditions.push(format!(
                    "{} {} {}",
                    quote_identifier(&column.name),
                    filter.op.as_sql(),
                    self.store.placeholder(params.len(), column)
                ));
            }
            if !conditions.is_empty() {
                sql.push_str(&format!(" WHERE {}", conditions.join(" AND ")));
            }
            order.extend(request.order_by.iter().filter_map(|term| {
                let column = self.columns.get(term.column)?;
                let direction = if term.descending { "DESC" } else { "ASC" };
                Some(format!("{} {direction}", quote_identifier(&column.name)))
            }));
        }
        match &self.key {
            RowKey::RowId => order.push("rowid".to_string()),
            RowKey::Columns(indices) => order.extend(
                indices
                    .iter()
                    .map(|i| quote_identifier(&self.columns[*i].name)),
            ),
            RowKey::None => {}
        }
        if !order.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", order.join(", ")));
        }
        (sql, params)
    }

    fn load(&mut self) -> FederationResult<&Loaded> {
        if self.loaded.is_none() {
            let width = self.columns.len() + usize::from(self.key == RowKey::RowId);
            let (sql, params) = self.select_sql();
            let fetched = self.store.fetch(&sql, &params, width)?;
            let mut keys = Vec::with_capacity(fetched.len());
            let mut rows = Vec::with_capacity(fetched.len());
            for mut row in fetched {
                let key = match &self.key {
                    RowKey::RowId => {
                        if row.is_empty() {
                            return Err(FederationError::source("Snapshot row is missing its rowid"));
                        }
                        vec![row.remove(0)]
                    }
                    RowKey::Columns(indices) => indices
                        .iter()
                        .map(|i| row.get(*i).cloned().unwrap_or(Value::Null))
                        .collect(),
                    RowKey::None => Vec::new(),
                };
                keys.push(key);
                rows.push(row);
            }
            debug!(table = %self.table, rows = rows.len(), "Loaded member table");
            self.loaded = Some(Loaded { keys, rows });
        }
        self.loaded
            .as_ref()
            .ok_or_else(|| FederationError::source("Snapshot failed to load"))
    }

    /// `WHERE` clause for the row keyed by `key`, numbering parameters from
    /// `first`.
    fn key_condition(&self, key: &[Value], first: usize, params: &mut Vec<Value>) -> FederationResult<String> {
        let conditions: Vec<String> = match &self.key {
            RowKey::RowId => {
                params.push(key.first().cloned().unwrap_or(Value::Null));
                vec![format!("rowid = ?{first}")]
            }
            RowKey::Columns(indices) => indices
                .iter()
                .zip(key)
                .enumerate()
                .map(|(offset, (column, value))| {
                    let column = &self.columns[*column];
                    params.push(self.store.coerce(value.clone(), column));
                    format!(
                        "{} = {}",
                        quote_identifier(&column.name),
                        self.store.placeholder(first + offset, column)
                    )
                })
                .collect(),
            RowKey::None => return Err(FederationError::read_only_source()),
        };
        Ok(conditions.join(" AND "))
    }

    fn row_key(&self, loaded: &Loaded, row: usize) -> FederationResult<Vec<Value>> {
        loaded
            .keys
            .get(row)
            .cloned()
            .ok_or_else(|| FederationError::row_not_found(row))
    }

    fn statements(&mut self, changes: &ChangeSet) -> FederationResult<Vec<KeyedStatement>> {
        self.load()?;
        let loaded = self
            .loaded
            .as_ref()
            .ok_or_else(|| FederationError::source("Snapshot failed to load"))?;
        let table = self.relation();
        let mut statements = Vec::with_capacity(changes.len());

        for update in &changes.updates {
            if update.cells.is_empty() {
                continue;
            }
            let mut params = Vec::with_capacity(update.cells.len() + 1);
            let mut assignments = Vec::with_capacity(update.cells.len());
            for (column, value) in &update.cells {
                let descriptor = self.columns.get(*column).ok_or_else(|| {
                    FederationError::validation(format!("Column {column} out of range"))
                })?;
                params.push(self.store.coerce(value.clone(), descriptor));
                assignments.push(format!(
                    "{} = {}",
                    quote_identifier(&descriptor.name),
                    self.store.placeholder(params.len(), descriptor)
                ));
            }
            let key = self.row_key(loaded, update.row)?;
            let condition = self.key_condition(&key, params.len() + 1, &mut params)?;
            statements.push(KeyedStatement {
                sql: format!("UPDATE {table} SET {} WHERE {condition}", assignments.join(", ")),
                params,
            });
        }

        for &row in &changes.deletions {
            let key = self.row_key(loaded, row)?;
            let mut params = Vec::with_capacity(key.len());
            let condition = self.key_condition(&key, 1, &mut params)?;
            statements.push(KeyedStatement {
                sql: format!("DELETE FROM {table} WHERE {condition}"),
                params,
            });
        }

        for values in &changes.inserts {
            if values.len() != self.columns.len() {
                return Err(FederationError::validation(format!(
                    "Inserted row has {} values, table has {} columns",
                    values.len(),
                    self.columns.len()
                )));
            }
            let names: Vec<String> = self.columns.iter().map(|c| quote_identifier(&c.name)).collect();
            let markers: Vec<String> = self
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| self.store.placeholder(i + 1, c))
                .collect();
            let params = values
                .iter()
                .zip(&self.columns)
                .map(|(v, c)| self.store.coerce(v.clone(), c))
                .collect();
            statements.push(KeyedStatement {
                sql: format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    names.join(", "),
                    markers.join(", ")
                ),
                params,
            });
        }
        Ok(statements)
    }
}

impl<S: MemberStore> SnapshotTable<S> {
    /// Writes applied updates into the loaded snapshot. Row positions stay
    /// where they are until the next reload.
    fn patch_loaded(&mut self, changes: &ChangeSet) {
        let Some(loaded) = self.loaded.as_mut() else {
            return;
        };
        for update in &changes.updates {
            let Some(row) = loaded.rows.get_mut(update.row) else {
                continue;
            };
            for (column, value) in &update.cells {
                if let Some(cell) = row.get_mut(*column) {
                    *cell = value.clone();
                }
            }
            let key = loaded.keys.get_mut(update.row);
            if let (RowKey::Columns(indices), Some(key)) = (&self.key, key) {
                for (slot, index) in key.iter_mut().zip(indices) {
                    if let Some(value) = row.get(*index) {
                        *slot = value.clone();
                    }
                }
            }
        }
    }
}

impl<S: MemberStore> RowSource for SnapshotTable<S> {
    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_descriptor(&self, index: usize) -> Option<ColumnDescriptor> {
        self.columns.get(index).cloned()
    }

    fn row_count(&mut self) -> FederationResult<usize> {
        Ok(self.load()?.rows.len())
    }

    fn read(&mut self, row: usize, column: usize) -> FederationResult<Value> {
        let loaded = self.load()?;
        let values = loaded
            .rows
            .get(row)
            .ok_or_else(|| FederationError::row_not_found(row))?;
        values
            .get(column)
            .cloned()
            .ok_or_else(|| FederationError::validation(format!("Column {column} out of range")))
    }

    fn capabilities(&self) -> SourceCapabilities {
        self.capabilities
    }

    #[instrument(skip(self, changes), fields(table = %self.table, edits = changes.len()))]
    fn apply_changes(&mut self, changes: &ChangeSet) -> FederationResult<()> {
        let caps = self.capabilities;
        if (!changes.updates.is_empty() && !caps.update)
            || (!changes.deletions.is_empty() && !caps.delete)
            || (!changes.inserts.is_empty() && !caps.insert)
        {
            return Err(FederationError::read_only_source());
        }
        let statements = self.statements(changes)?;
        self.store.execute_in_transaction(&statements)?;
        if changes.deletions.is_empty() && changes.inserts.is_empty() {
            self.patch_loaded(changes);
        } else {
            self.loaded = None;
        }
        debug!(statements = statements.len(), "Wrote edits back to member");
        Ok(())
    }
}
