// SPDX-License-Identifier: Apache-2.0

//! In-memory row sources.

use crate::error::{FederationError, FederationResult};
use crate::source::{ChangeSet, RowSource, SequentialSource, SourceCapabilities};
use crate::types::{ColumnDescriptor, Value};

/// Random-access table held in memory. Batches apply atomically.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Vec<Value>>,
    capabilities: SourceCapabilities,
}

impl MemoryTable {
    pub fn new(columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            capabilities: SourceCapabilities::WRITABLE,
        }
    }

    pub fn with_rows(columns: Vec<ColumnDescriptor>, rows: Vec<Vec<Value>>) -> FederationResult<Self> {
        let width = columns.len();
        if let Some(bad) = rows.iter().position(|r| r.len() != width) {
            return Err(FederationError::validation(format!(
                "Row {bad} has {} values, table has {width} columns",
                rows[bad].len()
            )));
        }
        Ok(Self {
            columns,
            rows,
            capabilities: SourceCapabilities::WRITABLE,
        })
    }

    pub fn read_only(mut self) -> Self {
        self.capabilities = SourceCapabilities::READ_ONLY;
        self
    }

    pub fn with_capabilities(mut self, capabilities: SourceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    fn check_row(&self, row: usize) -> FederationResult<()> {
        if row < self.rows.len() {
            Ok(())
        } else {
            Err(FederationError::row_not_found(row))
        }
    }
}

impl RowSource for MemoryTable {
    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_descriptor(&self, index: usize) -> Option<ColumnDescriptor> {
        self.columns.get(index).cloned()
    }

    fn row_count(&mut self) -> FederationResult<usize> {
        Ok(self.rows.len())
    }

    fn read(&mut self, row: usize, column: usize) -> FederationResult<Value> {
        self.check_row(row)?;
        self.rows[row]
            .get(column)
            .cloned()
            .ok_or_else(|| FederationError::validation(format!("Column {column} out of range")))
    }

    fn capabilities(&self) -> SourceCapabilities {
        self.capabilities
    }

    fn write(&mut self, row: usize, column: usize, value: Value) -> FederationResult<()> {
        if !self.capabilities.update {
            return Err(FederationError::read_only_source());
        }
        self.check_row(row)?;
        let cell = self.rows[row]
            .get_mut(column)
            .ok_or_else(|| FederationError::validation(format!("Column {column} out of range")))?;
        *cell = value;
        Ok(())
    }

    fn append_row(&mut self, values: Vec<Value>) -> FederationResult<usize> {
        if !self.capabilities.insert {
            return Err(FederationError::read_only_source());
        }
        if values.len() != self.columns.len() {
            return Err(FederationError::validation(format!(
                "Inserted row has {} values, table has {} columns",
                values.len(),
                self.columns.len()
            )));
        }
        self.rows.push(values);
        Ok(self.rows.len() - 1)
    }

    fn remove_row(&mut self, row: usize) -> FederationResult<()> {
        if !self.capabilities.delete {
            return Err(FederationError::read_only_source());
        }
        self.check_row(row)?;
        self.rows.remove(row);
        Ok(())
    }

    fn apply_changes(&mut self, changes: &ChangeSet) -> FederationResult<()> {
        let caps = self.capabilities;
        if (!changes.updates.is_empty() && !caps.update)
            || (!changes.deletions.is_empty() && !caps.delete)
            || (!changes.inserts.is_empty() && !caps.insert)
        {
            return Err(FederationError::read_only_source());
        }
        let mut next = self.rows.clone();
        changes.apply_to_rows(&mut next, self.columns.len())?;
        self.rows = next;
        Ok(())
    }
}

/// Forward-only stream over an in-memory row buffer.
#[derive(Debug, Clone)]
pub struct RowStream {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Vec<Value>>,
    position: usize,
    writable: bool,
    rewinds: usize,
}

impl RowStream {
    pub fn new(columns: Vec<ColumnDescriptor>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            position: 0,
            writable: false,
            rewinds: 0,
        }
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// How many times the stream has been restarted.
    pub fn rewinds(&self) -> usize {
        self.rewinds
    }
}

impl SequentialSource for RowStream {
    fn column_descriptors(&self) -> Vec<ColumnDescriptor> {
        self.columns.clone()
    }

    fn next_row(&mut self) -> FederationResult<Option<Vec<Value>>> {
        let row = self.rows.get(self.position).cloned();
        if row.is_some() {
            self.position += 1;
        }
        Ok(row)
    }

    fn rewind(&mut self) -> FederationResult<()> {
        self.position = 0;
        self.rewinds += 1;
        Ok(())
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn rewrite(&mut self, rows: Vec<Vec<Value>>) -> FederationResult<()> {
        if !self.writable {
            return Err(FederationError::read_only_source());
        }
        self.rows = rows;
        self.position = 0;
        Ok(())
    }
}
