// SPDX-License-Identifier: Apache-2.0

//! Table declarations handed to the host when it creates or connects a table.

use std::collections::HashSet;

use qore_core::{ColumnDescriptor, FederationError, FederationResult};

use crate::name::quote_identifier;

/// Hidden integer column carrying the row ordinal.
pub const ORDINAL_COLUMN: &str = "__row_ordinal";

/// Builds the `CREATE TABLE x(...)` statement describing a virtual table.
///
/// Empty names become `_<position>`, names are made unique
/// case-insensitively by appending `_<n>`, and the hidden ordinal column is
/// always last.
pub fn declare_table(columns: &[ColumnDescriptor]) -> FederationResult<String> {
    if columns.is_empty() {
        return Err(FederationError::host_rejected(
            "Virtual table has no column to declare",
        ));
    }

    let mut used: HashSet<String> = HashSet::new();
    used.insert(ORDINAL_COLUMN.to_string());

    let mut defs = Vec::with_capacity(columns.len() + 1);
    for (position, column) in columns.iter().enumerate() {
        let base = if column.name.trim().is_empty() {
            format!("_{}", position + 1)
        } else {
            column.name.to_string()
        };
        let name = unique_name(&base, &mut used);

        let mut def = format!("{} {}", quote_identifier(&name), column.storage_class().as_sql());
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        defs.push(def);
    }
    defs.push(format!("{} INTEGER HIDDEN", quote_identifier(ORDINAL_COLUMN)));

    Ok(format!("CREATE TABLE x({})", defs.join(", ")))
}

fn unique_name(base: &str, used: &mut HashSet<String>) -> String {
    if used.insert(base.to_lowercase()) {
        return base.to_string();
    }
    let mut counter = 1;
    loop {
        let candidate = format!("{base}_{counter}");
        if used.insert(candidate.to_lowercase()) {
            return candidate;
        }
        counter += 1;
    }
}
