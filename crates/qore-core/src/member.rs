// SPDX-License-Identifier: Apache-2.0

//! Hub member contracts
//!
//! A member is a live database connection whose tables are exposed through
//! the hub. Members report schema changes to subscribed listeners.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::FederationResult;
use crate::source::{FilterOp, ScanRequest, SourceHandle};
use crate::types::{ColumnDescriptor, MemberId, SubscriptionId};

/// What a member's client library allows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCapabilities {
    /// The client library tolerates calls from threads other than the opener.
    pub thread_safe: bool,
    pub writable: bool,
}

impl Default for MemberCapabilities {
    fn default() -> Self {
        Self {
            thread_safe: true,
            writable: true,
        }
    }
}

/// Receives schema-change notifications from a member
pub trait SchemaListener: Send + Sync {
    fn table_added(&self, table: &str);
    fn table_removed(&self, table: &str);
    fn table_altered(&self, table: &str);
}

/// A live connection that can contribute tables to a hub
pub trait MemberConnection: Send + Sync {
    fn id(&self) -> MemberId;

    /// Human readable name used in logs and error messages.
    fn name(&self) -> &str;

    fn capabilities(&self) -> MemberCapabilities {
        MemberCapabilities::default()
    }

    fn list_tables(&self) -> FederationResult<Vec<String>>;

    fn describe_table(&self, table: &str) -> FederationResult<Vec<ColumnDescriptor>>;

    /// Opens a fresh source reading the table's current content.
    fn open_table(&self, table: &str) -> FederationResult<SourceHandle>;

    /// Whether `open_table_filtered` can evaluate `op` on `column` of `table`.
    fn accepts_filter(&self, _table: &str, _column: usize, _op: FilterOp) -> bool {
        false
    }

    /// Opens a read-only source with the rows of `table` that match
    /// `request`, or `None` to have the host read the whole table.
    fn open_table_filtered(
        &self,
        _table: &str,
        _request: &ScanRequest,
    ) -> FederationResult<Option<SourceHandle>> {
        Ok(None)
    }

    fn subscribe(&self, listener: Arc<dyn SchemaListener>) -> SubscriptionId;

    fn unsubscribe(&self, subscription: SubscriptionId);
}
