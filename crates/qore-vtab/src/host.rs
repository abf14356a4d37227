// SPDX-License-Identifier: Apache-2.0

//! Host engine seam
//!
//! The catalog and hub only need a handful of DDL operations from the host.
//! Implementations report host failures as `HostRejected` with the host's
//! own message.

use std::sync::Arc;

use qore_core::FederationResult;

use crate::module::FederationModule;
use crate::name::TableName;

pub trait HostEngine {
    /// Registers the federation module under `module_name`.
    fn install_module(
        &self,
        module_name: &str,
        module: Arc<FederationModule>,
    ) -> FederationResult<()>;

    /// `CREATE VIRTUAL TABLE <table> USING <module>('<handshake>')`
    fn create_virtual_table(
        &self,
        table: &TableName,
        module_name: &str,
        handshake: &str,
    ) -> FederationResult<()>;

    fn drop_table(&self, table: &TableName) -> FederationResult<()>;

    /// Makes `namespace` usable as a schema qualifier for new tables.
    fn attach_namespace(&self, namespace: &str) -> FederationResult<()>;

    fn detach_namespace(&self, namespace: &str) -> FederationResult<()>;
}
