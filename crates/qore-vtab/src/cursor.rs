// SPDX-License-Identifier: Apache-2.0

//! Scan cursors.

use std::fmt;

use qore_core::{ColumnFilter, FederationError, FederationResult, FilterOp, OrderTerm, ScanRequest, Value};
use serde::{Deserialize, Serialize};

use crate::registry::{BindingId, SharedProxy};

/// How a scan walks the table, chosen by `best_index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanPlan {
    #[default]
    FullScan,
    /// Single row addressed by an equality constraint on the rowid.
    PointLookup,
    /// Constraints handed to the table's factory, described by a
    /// [`PushdownPlan`].
    Pushdown,
}

impl ScanPlan {
    pub fn idx_num(&self) -> i32 {
        match self {
            ScanPlan::FullScan => 0,
            ScanPlan::PointLookup => 1,
            ScanPlan::Pushdown => 2,
        }
    }

    pub fn from_idx_num(idx_num: i32) -> Self {
        match idx_num {
            1 => ScanPlan::PointLookup,
            2 => ScanPlan::Pushdown,
            _ => ScanPlan::FullScan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushedFilter {
    pub column: usize,
    pub op: FilterOp,
}

/// Filters whose values arrive as `filter` arguments, in argument order,
/// plus the scan's ORDER BY. Travels from `best_index` to `filter` as the
/// host's index string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushdownPlan {
    pub filters: Vec<PushedFilter>,
    pub order_by: Vec<OrderTerm>,
}

impl PushdownPlan {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> FederationResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| FederationError::host_rejected(format!("Invalid scan plan: {e}")))
    }

    /// Binds the host's arguments to the filters.
    pub fn request(&self, args: &[Value]) -> FederationResult<ScanRequest> {
        if args.len() != self.filters.len() {
            return Err(FederationError::host_rejected(format!(
                "Scan plan has {} filters, got {} arguments",
                self.filters.len(),
                args.len()
            )));
        }
        Ok(ScanRequest {
            filters: self
                .filters
                .iter()
                .zip(args)
                .map(|(filter, value)| ColumnFilter {
                    column: filter.column,
                    op: filter.op,
                    value: value.clone(),
                })
                .collect(),
            order_by: self.order_by.clone(),
        })
    }
}

/// A host cursor. It never borrows the binding: each call re-resolves
/// `(binding, generation)` and fails with `Stale` once either is gone.
#[derive(Clone)]
pub struct Cursor {
    pub(crate) binding: BindingId,
    pub(crate) generation: u64,
    /// Current ordinal; -1 until the first `filter`.
    pub(crate) position: i64,
    pub(crate) column_count: usize,
    pub(crate) plan: ScanPlan,
    pub(crate) exhausted: bool,
    /// Rows a factory produced for a pushed-down scan. Ordinals then
    /// address this proxy, not the binding's.
    pub(crate) filtered: Option<SharedProxy>,
}

impl Cursor {
    pub(crate) fn new(binding: BindingId, generation: u64, column_count: usize) -> Self {
        Self {
            binding,
            generation,
            position: -1,
            column_count,
            plan: ScanPlan::FullScan,
            exhausted: false,
            filtered: None,
        }
    }

    pub fn binding(&self) -> BindingId {
        self.binding
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn column_count(&self) -> usize {
        self.column_count
    }

    pub fn plan(&self) -> ScanPlan {
        self.plan
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered.is_some()
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("binding", &self.binding)
            .field("generation", &self.generation)
            .field("position", &self.position)
            .field("plan", &self.plan)
            .field("exhausted", &self.exhausted)
            .field("filtered", &self.filtered.is_some())
            .finish()
    }
}
