// SPDX-License-Identifier: Apache-2.0

//! Random access over forward-only streams.
//!
//! Reads walk the stream linearly and restart it when an earlier row is
//! requested, so scattered access is O(n) per seek. Applying edits buffers
//! the whole stream, replays the batch on the buffer and rewrites the source.

use qore_core::{
    ChangeSet, ColumnDescriptor, FederationError, FederationResult, RowSource, RowUpdate,
    SequentialSource, SharedSequentialSource, SourceCapabilities, Value,
};
use tracing::debug;

pub struct ForwardOnlyAdapter {
    source: SharedSequentialSource,
    columns: Vec<ColumnDescriptor>,
    writable: bool,
    /// Ordinal of the row the next `next_row` call returns.
    next_ordinal: usize,
    current: Option<(usize, Vec<Value>)>,
    row_count: Option<usize>,
}

impl ForwardOnlyAdapter {
    pub fn new(source: SharedSequentialSource) -> Self {
        let (columns, writable) = {
            let guard = source.lock();
            (guard.column_descriptors(), guard.writable())
        };
        Self {
            source,
            columns,
            writable,
            next_ordinal: 0,
            current: None,
            row_count: None,
        }
    }

    fn restart(&mut self, source: &mut dyn SequentialSource) -> FederationResult<()> {
        source.rewind()?;
        self.next_ordinal = 0;
        self.current = None;
        Ok(())
    }

    fn seek(&mut self, row: usize) -> FederationResult<&[Value]> {
        let hit = matches!(&self.current, Some((ordinal, _)) if *ordinal == row);
        if !hit {
            let source = self.source.clone();
            let mut source = source.lock();
            if row < self.next_ordinal {
                debug!(row, position = self.next_ordinal, "Rewinding forward-only source");
                self.restart(&mut *source)?;
            }
            loop {
                match source.next_row()? {
                    Some(values) => {
                        let ordinal = self.next_ordinal;
                        self.next_ordinal += 1;
                        if ordinal == row {
                            self.current = Some((ordinal, values));
                            break;
                        }
                    }
                    None => {
                        self.row_count = Some(self.next_ordinal);
                        return Err(FederationError::row_not_found(row));
                    }
                }
            }
        }
        match &self.current {
            Some((_, values)) => Ok(values),
            None => Err(FederationError::row_not_found(row)),
        }
    }

    fn buffer_all(&mut self) -> FederationResult<Vec<Vec<Value>>> {
        let source = self.source.clone();
        let mut source = source.lock();
        self.restart(&mut *source)?;
        let mut rows = Vec::new();
        while let Some(values) = source.next_row()? {
            rows.push(values);
        }
        self.next_ordinal = rows.len();
        Ok(rows)
    }
}

impl RowSource for ForwardOnlyAdapter {
    fn column_count(&self) -> usize {
        self.columns.len()
    }

    fn column_descriptor(&self, index: usize) -> Option<ColumnDescriptor> {
        self.columns.get(index).cloned()
    }

    fn row_count(&mut self) -> FederationResult<usize> {
        if let Some(count) = self.row_count {
            return Ok(count);
        }
        let source = self.source.clone();
        let mut source = source.lock();
        self.restart(&mut *source)?;
        let mut count = 0;
        while source.next_row()?.is_some() {
            count += 1;
        }
        self.next_ordinal = count;
        self.row_count = Some(count);
        Ok(count)
    }

    fn read(&mut self, row: usize, column: usize) -> FederationResult<Value> {
        let values = self.seek(row)?;
        values
            .get(column)
            .cloned()
            .ok_or_else(|| FederationError::validation(format!("Column {column} out of range")))
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities {
            random_access: false,
            update: self.writable,
            insert: self.writable,
            delete: self.writable,
        }
    }

    fn write(&mut self, row: usize, column: usize, value: Value) -> FederationResult<()> {
        self.apply_changes(&ChangeSet {
            updates: vec![RowUpdate {
                row,
                cells: vec![(column, value)],
            }],
            ..Default::default()
        })
    }

    fn append_row(&mut self, values: Vec<Value>) -> FederationResult<usize> {
        let count = self.row_count()?;
        self.apply_changes(&ChangeSet {
            inserts: vec![values],
            ..Default::default()
        })?;
        Ok(count)
    }

    fn remove_row(&mut self, row: usize) -> FederationResult<()> {
        self.apply_changes(&ChangeSet {
            deletions: vec![row],
            ..Default::default()
        })
    }

    fn apply_changes(&mut self, changes: &ChangeSet) -> FederationResult<()> {
        if !self.writable {
            return Err(FederationError::read_only_source());
        }
        let mut rows = self.buffer_all()?;
        changes.apply_to_rows(&mut rows, self.columns.len())?;

        let source = self.source.clone();
        let mut source = source.lock();
        source.rewrite(rows)?;
        self.restart(&mut *source)?;
        self.row_count = None;
        Ok(())
    }
}
