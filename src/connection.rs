// SPDX-License-Identifier: Apache-2.0

//! Virtual connection
//!
//! A SQLite host connection with the federation module installed, the
//! catalog of virtual tables and the hub of attached members.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use qore_core::{
    FederationError, FederationResult, MemberConnection, MemberId, SourceHandle, TableSource,
};
use qore_vtab::metrics::{self, EngineMetricsSnapshot};
use qore_vtab::{
    BindingInfo, BufferPolicy, Hub, MemberInfo, QueryRows, SqliteHost, VirtualCatalog,
};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::FederationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadAffinity {
    /// Usable from any thread.
    Any,
    /// Usable only from the thread that opened it.
    OpeningThread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionCapabilities {
    pub thread_affinity: ThreadAffinity,
}

pub struct VirtualConnection {
    catalog: VirtualCatalog<SqliteHost>,
    hub: Mutex<Hub>,
    config: FederationConfig,
    opened_on: ThreadId,
    released: bool,
}

impl VirtualConnection {
    pub fn open_in_memory() -> FederationResult<Self> {
        Self::open(FederationConfig::default())
    }

    pub fn open(config: FederationConfig) -> FederationResult<Self> {
        Self::with_host(SqliteHost::open_in_memory()?, config)
    }

    /// Installs the federation module on an existing host connection.
    pub fn with_host(host: SqliteHost, config: FederationConfig) -> FederationResult<Self> {
        config.validate()?;
        let catalog = VirtualCatalog::new(host, &config.module_name, config.buffer_policy)?;
        info!(module = %config.module_name, policy = ?config.buffer_policy, "Opened virtual connection");
        Ok(Self {
            catalog,
            hub: Mutex::new(Hub::new()),
            config,
            opened_on: thread::current().id(),
            released: false,
        })
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn catalog(&self) -> &VirtualCatalog<SqliteHost> {
        &self.catalog
    }

    pub fn host(&self) -> &SqliteHost {
        self.catalog.host()
    }

    pub fn capabilities(&self) -> ConnectionCapabilities {
        let thread_affinity = if self.hub.lock().all_thread_safe() {
            ThreadAffinity::Any
        } else {
            ThreadAffinity::OpeningThread
        };
        ConnectionCapabilities { thread_affinity }
    }

    fn check_thread(&self) -> FederationResult<()> {
        if self.capabilities().thread_affinity == ThreadAffinity::OpeningThread
            && thread::current().id() != self.opened_on
        {
            return Err(FederationError::unsupported(
                "connection is bound to the thread that opened it",
            ));
        }
        Ok(())
    }

    fn before_statement(&self) -> FederationResult<()> {
        self.check_thread()?;
        if self.config.auto_process_member_events {
            self.hub.lock().process_events(&self.catalog);
        }
        Ok(())
    }

    /// Surfaces commit failures the host could not report.
    fn after_statement(&self) -> FederationResult<()> {
        let mut errors = self.catalog.take_apply_errors().into_iter();
        match errors.next() {
            Some((table, first)) => {
                warn!(table = %table, error = %first, "Commit failed to apply edits");
                for (table, err) in errors {
                    warn!(table = %table, error = %err, "Commit failed to apply edits");
                }
                Err(first)
            }
            None => Ok(()),
        }
    }

    /// Runs one or more statements and returns the rows changed by the last.
    #[instrument(skip(self, sql))]
    pub fn execute(&self, sql: &str) -> FederationResult<usize> {
        self.before_statement()?;
        let changed = self.catalog.host().execute(sql)?;
        self.after_statement()?;
        Ok(changed)
    }

    pub fn query(&self, sql: &str) -> FederationResult<QueryRows> {
        self.before_statement()?;
        let rows = self.catalog.host().query(sql)?;
        self.after_statement()?;
        Ok(rows)
    }

    pub fn add_table(
        &self,
        sql_name: &str,
        source: impl Into<TableSource>,
    ) -> FederationResult<BindingInfo> {
        self.check_thread()?;
        self.catalog.register(sql_name, source)
    }

    pub fn add_table_with_policy(
        &self,
        sql_name: &str,
        source: impl Into<TableSource>,
        policy: BufferPolicy,
    ) -> FederationResult<BindingInfo> {
        self.check_thread()?;
        self.catalog.register_with_policy(sql_name, source, policy)
    }

    pub fn remove_table(&self, sql_name: &str) -> FederationResult<()> {
        self.check_thread()?;
        self.catalog.unregister(sql_name)
    }

    pub fn get_table(&self, sql_name: &str) -> Option<SourceHandle> {
        self.catalog.get_table(sql_name)
    }

    pub fn for_each_table<F>(&self, visitor: F)
    where
        F: FnMut(&BindingInfo, Option<&SourceHandle>),
    {
        self.catalog.for_each(visitor)
    }

    pub fn refresh_table(&self, sql_name: &str) -> FederationResult<BindingInfo> {
        self.check_thread()?;
        self.catalog.refresh(sql_name)
    }

    pub fn hub_attach(
        &self,
        member: Arc<dyn MemberConnection>,
        namespace: Option<&str>,
    ) -> FederationResult<MemberInfo> {
        self.check_thread()?;
        self.hub.lock().attach(&self.catalog, member, namespace)
    }

    pub fn hub_detach(&self, member: MemberId) -> FederationResult<()> {
        self.check_thread()?;
        self.hub.lock().detach(&self.catalog, member)
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.hub.lock().members()
    }

    /// The member attached under `namespace`, or the un-namespaced one for
    /// `None`.
    pub fn hub_member(&self, namespace: Option<&str>) -> Option<Arc<dyn MemberConnection>> {
        self.hub.lock().member_by_namespace(namespace)
    }

    /// Applies queued member schema notifications now.
    pub fn process_member_events(&self) -> FederationResult<usize> {
        self.check_thread()?;
        Ok(self.hub.lock().process_events(&self.catalog))
    }

    /// Applies pending edits of every table outside a host transaction.
    pub fn commit_all(&self) -> FederationResult<()> {
        self.check_thread()?;
        self.catalog.module().commit_all()
    }

    pub fn rollback_all(&self) -> FederationResult<()> {
        self.check_thread()?;
        self.catalog.module().rollback_all();
        Ok(())
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        metrics::snapshot()
    }

    /// Detaches every member and drops every virtual table.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.hub.get_mut().detach_all(&self.catalog);
        self.catalog.remove_all();
        info!("Closed virtual connection");
    }
}

impl Drop for VirtualConnection {
    fn drop(&mut self) {
        self.release();
    }
}
