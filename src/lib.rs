// SPDX-License-Identifier: Apache-2.0

//! QoreFed - virtual-table federation over an embedded SQLite host
//!
//! Makes in-process row sources and the tables of other live database
//! connections queryable (and, where the source allows, writable) as
//! ordinary tables of one SQLite connection.

pub mod config;
pub mod connection;
pub mod members;
pub mod observability;

pub use config::{FederationConfig, LoggingConfig};
pub use connection::{ConnectionCapabilities, ThreadAffinity, VirtualConnection};
pub use qore_core::{
    ColumnDescriptor, FederationError, FederationResult, MemberConnection, MemoryTable, RowSource,
    RowStream, SequentialSource, SourceHandle, TableSource, Value,
};
pub use qore_vtab::{BindingInfo, BufferPolicy, MemberInfo, QueryRows};

/// Loads configuration from `QOREFED_CONFIG` (or defaults), installs the
/// tracing subscriber it describes and opens an in-memory connection.
pub fn open_from_env() -> FederationResult<VirtualConnection> {
    let config = FederationConfig::from_env()?;
    observability::init_tracing(&config.logging);
    VirtualConnection::open(config)
}
