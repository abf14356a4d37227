// SPDX-License-Identifier: Apache-2.0

//! Row source contracts
//!
//! A row source is the tabular data behind a virtual table. Random-access
//! sources implement [`RowSource`]; streams that can only be read forward
//! implement [`SequentialSource`]. Both are shared behind a mutex so the
//! catalog can hand the same source out to callers while the engine reads it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{FederationError, FederationResult};
use crate::types::{ColumnDescriptor, StorageClass, Value};

/// What a row source lets the engine do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceCapabilities {
    pub random_access: bool,
    pub update: bool,
    pub insert: bool,
    pub delete: bool,
}

impl SourceCapabilities {
    pub const READ_ONLY: Self = Self {
        random_access: true,
        update: false,
        insert: false,
        delete: false,
    };

    pub const WRITABLE: Self = Self {
        random_access: true,
        update: true,
        insert: true,
        delete: true,
    };

    pub fn is_writable(&self) -> bool {
        self.update || self.insert || self.delete
    }
}

/// Cell changes for one existing row
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    pub row: usize,
    pub cells: Vec<(usize, Value)>,
}

/// A batch of edits addressed to a source's current row ordinals.
///
/// Updates are ascending by row, deletions descending (so earlier
/// deletions never shift the address of later ones) and inserts are
/// appended in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub updates: Vec<RowUpdate>,
    pub deletions: Vec<usize>,
    pub inserts: Vec<Vec<Value>>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.deletions.is_empty() && self.inserts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len() + self.deletions.len() + self.inserts.len()
    }

    /// Applies the batch to an in-memory row buffer of `width` columns.
    pub fn apply_to_rows(&self, rows: &mut Vec<Vec<Value>>, width: usize) -> FederationResult<()> {
        for update in &self.updates {
            let row = rows
                .get_mut(update.row)
                .ok_or_else(|| FederationError::row_not_found(update.row))?;
            for (column, value) in &update.cells {
                let cell = row.get_mut(*column).ok_or_else(|| {
                    FederationError::validation(format!("Column {column} out of range"))
                })?;
                *cell = value.clone();
            }
        }

        for &ordinal in &self.deletions {
            if ordinal >= rows.len() {
                return Err(FederationError::row_not_found(ordinal));
            }
            rows.remove(ordinal);
        }

        for values in &self.inserts {
            if values.len() != width {
                return Err(FederationError::validation(format!(
                    "Inserted row has {} values, table has {width} columns",
                    values.len()
                )));
            }
            rows.push(values.clone());
        }

        Ok(())
    }
}

/// Random-access tabular data
pub trait RowSource: Send {
    fn column_count(&self) -> usize;

    fn column_descriptor(&self, index: usize) -> Option<ColumnDescriptor>;

    fn row_count(&mut self) -> FederationResult<usize>;

    fn read(&mut self, row: usize, column: usize) -> FederationResult<Value>;

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::READ_ONLY
    }

    fn column_descriptors(&self) -> Vec<ColumnDescriptor> {
        (0..self.column_count())
            .filter_map(|i| self.column_descriptor(i))
            .collect()
    }

    fn write(&mut self, _row: usize, _column: usize, _value: Value) -> FederationResult<()> {
        Err(FederationError::read_only_source())
    }

    /// Appends a row and returns its ordinal.
    fn append_row(&mut self, _values: Vec<Value>) -> FederationResult<usize> {
        Err(FederationError::read_only_source())
    }

    fn remove_row(&mut self, _row: usize) -> FederationResult<()> {
        Err(FederationError::read_only_source())
    }

    /// Applies a batch of edits.
    ///
    /// The default walks the batch through `write`, `remove_row` and
    /// `append_row` and is not atomic: a failure part way leaves the
    /// earlier edits in place. Sources that can do better override it.
    fn apply_changes(&mut self, changes: &ChangeSet) -> FederationResult<()> {
        for update in &changes.updates {
            for (column, value) in &update.cells {
                self.write(update.row, *column, value.clone())?;
            }
        }
        for &row in &changes.deletions {
            self.remove_row(row)?;
        }
        for values in &changes.inserts {
            self.append_row(values.clone())?;
        }
        Ok(())
    }
}

/// Forward-only tabular data
pub trait SequentialSource: Send {
    fn column_descriptors(&self) -> Vec<ColumnDescriptor>;

    /// Next row, or `None` at the end of the stream.
    fn next_row(&mut self) -> FederationResult<Option<Vec<Value>>>;

    /// Restarts the stream at its first row.
    fn rewind(&mut self) -> FederationResult<()>;

    fn writable(&self) -> bool {
        false
    }

    /// Replaces the stream's content with `rows`.
    fn rewrite(&mut self, _rows: Vec<Vec<Value>>) -> FederationResult<()> {
        Err(FederationError::read_only_source())
    }
}

pub type SharedRowSource = Arc<Mutex<dyn RowSource>>;
pub type SharedSequentialSource = Arc<Mutex<dyn SequentialSource>>;

/// A shared row source of either kind
#[derive(Clone)]
pub enum SourceHandle {
    Random(SharedRowSource),
    Sequential(SharedSequentialSource),
}

impl SourceHandle {
    pub fn random<S: RowSource + 'static>(source: S) -> Self {
        SourceHandle::Random(Arc::new(Mutex::new(source)))
    }

    pub fn sequential<S: SequentialSource + 'static>(source: S) -> Self {
        SourceHandle::Sequential(Arc::new(Mutex::new(source)))
    }

    pub fn column_descriptors(&self) -> Vec<ColumnDescriptor> {
        match self {
            SourceHandle::Random(s) => s.lock().column_descriptors(),
            SourceHandle::Sequential(s) => s.lock().column_descriptors(),
        }
    }

    /// Identity comparison: true when both handles share the same allocation.
    pub fn same_source(&self, other: &SourceHandle) -> bool {
        self.data_ptr() == other.data_ptr()
    }

    fn data_ptr(&self) -> *const () {
        match self {
            SourceHandle::Random(s) => Arc::as_ptr(s).cast::<()>(),
            SourceHandle::Sequential(s) => Arc::as_ptr(s).cast::<()>(),
        }
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceHandle::Random(_) => write!(f, "SourceHandle::Random({:p})", self.data_ptr()),
            SourceHandle::Sequential(_) => {
                write!(f, "SourceHandle::Sequential({:p})", self.data_ptr())
            }
        }
    }
}

/// Comparison a factory can evaluate on its own side of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl FilterOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
        }
    }
}

/// `column op value`, with the value bound by the host at scan time
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnFilter {
    pub column: usize,
    pub op: FilterOp,
    pub value: Value,
}

impl ColumnFilter {
    /// Whether the value belongs to `column`'s storage class, so a member
    /// compares it the way the host does. NULL never matches and is left
    /// to the host.
    pub fn fits(&self, column: &ColumnDescriptor) -> bool {
        match (column.storage_class(), &self.value) {
            (StorageClass::Integer, Value::Int(_) | Value::Bool(_)) => true,
            (StorageClass::Real, Value::Int(_) | Value::Float(_)) => true,
            (StorageClass::Text, Value::Text(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTerm {
    pub column: usize,
    pub descending: bool,
}

/// Restrictions of one scan, handed to [`SourceFactory::produce_filtered`].
///
/// The host checks every row it reads against its own constraints again,
/// so a factory may return rows that do not match, never drop rows that
/// do. `order_by` is a hint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanRequest {
    pub filters: Vec<ColumnFilter>,
    pub order_by: Vec<OrderTerm>,
}

/// Produces a source on demand.
///
/// Used for hub tables: the columns are needed when the host declares the
/// table, the data only when a scan opens.
pub trait SourceFactory: Send + Sync {
    fn columns(&self) -> FederationResult<Vec<ColumnDescriptor>>;

    fn produce(&self) -> FederationResult<SourceHandle>;

    /// Whether `produce_filtered` can evaluate `op` on `column`.
    fn accepts_filter(&self, _column: usize, _op: FilterOp) -> bool {
        false
    }

    /// Produces a read-only source holding the rows that match `request`.
    /// `None` declines and the scan reads the full table instead.
    fn produce_filtered(&self, _request: &ScanRequest) -> FederationResult<Option<SourceHandle>> {
        Ok(None)
    }
}

/// What a binding reads from
#[derive(Clone)]
pub enum TableSource {
    Fixed(SourceHandle),
    Factory(Arc<dyn SourceFactory>),
}

impl TableSource {
    pub fn is_factory(&self) -> bool {
        matches!(self, TableSource::Factory(_))
    }
}

impl From<SourceHandle> for TableSource {
    fn from(handle: SourceHandle) -> Self {
        TableSource::Fixed(handle)
    }
}

impl fmt::Debug for TableSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableSource::Fixed(handle) => f.debug_tuple("Fixed").field(handle).finish(),
            TableSource::Factory(_) => f.write_str("Factory"),
        }
    }
}
