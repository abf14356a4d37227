// SPDX-License-Identifier: Apache-2.0

//! Qualified SQL table names.

use std::fmt;
use std::sync::OnceLock;

use qore_core::{FederationError, FederationResult};
use regex::Regex;
use serde::{Deserialize, Serialize};

fn identifier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("static identifier pattern"))
}

/// True for names usable as a namespace or module name without quoting.
pub fn is_plain_identifier(name: &str) -> bool {
    identifier_regex().is_match(name)
}

/// Doubles embedded quotes and wraps the identifier in double quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A table name, optionally qualified by the schema (namespace) it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(schema: Option<&str>, name: &str) -> FederationResult<Self> {
        if name.is_empty() {
            return Err(FederationError::validation("Table name cannot be empty"));
        }
        if let Some(schema) = schema {
            if !is_plain_identifier(schema) {
                return Err(FederationError::validation(format!(
                    "Invalid namespace '{schema}'"
                )));
            }
        }
        Ok(Self {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Parses `table` or `schema.table`. Only the first dot separates.
    pub fn parse(raw: &str) -> FederationResult<Self> {
        match raw.split_once('.') {
            Some((schema, name)) if is_plain_identifier(schema) => Self::new(Some(schema), name),
            _ => Self::new(None, raw),
        }
    }

    /// Case-insensitive lookup key, matching the host's identifier rules.
    pub fn key(&self) -> String {
        self.to_string().to_lowercase()
    }

    /// Quoted form for use in SQL text.
    pub fn to_sql(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&self.name)),
            None => quote_identifier(&self.name),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qualified() {
        let name = TableName::parse("ns.Orders").unwrap();
        assert_eq!(name.schema.as_deref(), Some("ns"));
        assert_eq!(name.name, "Orders");
        assert_eq!(name.key(), "ns.orders");
        assert_eq!(name.to_sql(), "\"ns\".\"Orders\"");
    }

    #[test]
    fn test_parse_plain_and_quoting() {
        let name = TableName::parse("my \"odd\" table").unwrap();
        assert!(name.schema.is_none());
        assert_eq!(name.to_sql(), "\"my \"\"odd\"\" table\"");
    }

    #[test]
    fn test_rejects_empty() {
        assert!(TableName::parse("").is_err());
        assert!(TableName::new(Some("bad ns"), "t").is_err());
    }
}
