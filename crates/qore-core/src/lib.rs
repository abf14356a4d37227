// SPDX-License-Identifier: Apache-2.0

//! # qore-core
//!
//! Federation core for QoreFed.
//!
//! This crate provides the foundational types, traits, and error handling
//! shared by the virtual-table engine and the member drivers:
//!
//! - **Types**: cell values, column descriptors, storage classes, member ids
//! - **Sources**: random-access and sequential row-source contracts
//! - **Members**: live-connection and schema-listener contracts for the hub
//! - **Error**: the unified `FederationError` taxonomy

pub mod error;
pub mod member;
pub mod memory;
pub mod source;
pub mod types;

pub use error::{FederationError, FederationResult};
pub use member::{MemberCapabilities, MemberConnection, SchemaListener};
pub use memory::{MemoryTable, RowStream};
pub use source::{
    ChangeSet, ColumnFilter, FilterOp, OrderTerm, RowSource, RowUpdate, ScanRequest,
    SequentialSource, SharedRowSource, SharedSequentialSource, SourceCapabilities, SourceFactory,
    SourceHandle, TableSource,
};
pub use types::{ColumnDescriptor, MemberId, StorageClass, SubscriptionId, Value};
