// SPDX-License-Identifier: Apache-2.0

//! # qore-vtab
//!
//! Virtual-table engine for QoreFed.
//!
//! Exposes in-process row sources and live member connections as tables of
//! an embedded SQL host:
//!
//! - **Proxy**: buffers edits against a source until the host commits
//! - **Catalog**: registers sources under SQL names and issues the DDL
//! - **Module**: answers every host callback for the registered tables
//! - **Hub**: mirrors the tables of attached members
//! - **SQLite**: the rusqlite binding of the module

pub mod catalog;
pub mod cursor;
pub mod forward;
pub mod host;
pub mod hub;
pub mod metrics;
pub mod module;
pub mod name;
pub mod proxy;
pub mod registry;
pub mod schema;
pub mod sqlite;

pub use catalog::{VirtualCatalog, DEFAULT_MODULE_NAME};
pub use cursor::{Cursor, ScanPlan};
pub use forward::ForwardOnlyAdapter;
pub use host::HostEngine;
pub use hub::{Hub, MemberInfo};
pub use module::{FederationModule, RowChange, VirtualTableModule};
pub use name::TableName;
pub use proxy::{BufferPolicy, ChangeTrackingProxy};
pub use registry::{BindingId, BindingInfo, BindingState, TransactionState};
pub use sqlite::{QueryRows, SqliteHost};
