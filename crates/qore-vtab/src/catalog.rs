// SPDX-License-Identifier: Apache-2.0

//! Virtual catalog
//!
//! Owns the bindings of one host connection and keeps them in step with the
//! host's schema: registering issues `CREATE VIRTUAL TABLE`, unregistering
//! issues `DROP TABLE`. The registry lock is never held while DDL runs, since
//! the host calls back into the module during the statement.

use std::sync::Arc;

use qore_core::{FederationError, FederationResult, SourceHandle, TableSource};
use tracing::{info, instrument, warn};

use crate::host::HostEngine;
use crate::module::FederationModule;
use crate::name::{is_plain_identifier, TableName};
use crate::proxy::BufferPolicy;
use crate::registry::{BindingId, BindingInfo, BindingRegistry, SharedRegistry};

pub const DEFAULT_MODULE_NAME: &str = "qorefed";

pub struct VirtualCatalog<H: HostEngine> {
    host: H,
    registry: SharedRegistry,
    module: Arc<FederationModule>,
    module_name: String,
    default_policy: BufferPolicy,
}

impl<H: HostEngine> VirtualCatalog<H> {
    /// Installs the federation module on `host` under `module_name`.
    pub fn new(host: H, module_name: &str, default_policy: BufferPolicy) -> FederationResult<Self> {
        if !is_plain_identifier(module_name) {
            return Err(FederationError::validation(format!(
                "Invalid module name '{module_name}'"
            )));
        }
        let registry = BindingRegistry::shared();
        let module = FederationModule::new(registry.clone());
        host.install_module(module_name, module.clone())?;
        Ok(Self {
            host,
            registry,
            module,
            module_name: module_name.to_string(),
            default_policy,
        })
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn module(&self) -> &Arc<FederationModule> {
        &self.module
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn default_policy(&self) -> BufferPolicy {
        self.default_policy
    }

    pub fn register(
        &self,
        sql_name: &str,
        source: impl Into<TableSource>,
    ) -> FederationResult<BindingInfo> {
        self.register_with_policy(sql_name, source, self.default_policy)
    }

    /// Registers `source` as table `sql_name` (`table` or `namespace.table`).
    #[instrument(skip(self, source))]
    pub fn register_with_policy(
        &self,
        sql_name: &str,
        source: impl Into<TableSource>,
        policy: BufferPolicy,
    ) -> FederationResult<BindingInfo> {
        self.register_name(TableName::parse(sql_name)?, source.into(), policy)
    }

    /// Registers `source` under an already-qualified name.
    ///
    /// Fails with `NameInUse` when the name is taken and with `HostRejected`
    /// (carrying the host's message) when the host refuses the table; in the
    /// latter case nothing stays registered.
    pub fn register_name(
        &self,
        name: TableName,
        source: TableSource,
        policy: BufferPolicy,
    ) -> FederationResult<BindingInfo> {
        let (id, handshake) = {
            let mut registry = self.registry.lock();
            let binding = registry.insert(name.clone(), source, policy)?;
            (binding.id, binding.handshake.clone())
        };

        if let Err(err) = self
            .host
            .create_virtual_table(&name, &self.module_name, &handshake)
        {
            self.registry.lock().remove(id);
            warn!(table = %name, error = %err, "Host rejected virtual table");
            return Err(match err {
                FederationError::HostRejected { .. } => err,
                other => FederationError::host_rejected(other.to_string()),
            });
        }

        let info = self.info(id)?;
        info!(table = %name, handshake = %handshake, "Registered virtual table");
        Ok(info)
    }

    /// Drops table `sql_name` from the host and forgets its binding.
    ///
    /// Buffered edits that were never committed are discarded, not applied.
    #[instrument(skip(self))]
    pub fn unregister(&self, sql_name: &str) -> FederationResult<()> {
        self.unregister_name(&TableName::parse(sql_name)?)
    }

    pub fn unregister_name(&self, name: &TableName) -> FederationResult<()> {
        let id = self
            .registry
            .lock()
            .find_by_name(name)
            .map(|binding| binding.id)
            .ok_or_else(|| FederationError::not_found(name.to_string()))?;

        self.warn_pending(id);
        self.host.drop_table(name)?;
        self.registry.lock().remove(id);
        info!(table = %name, "Unregistered virtual table");
        Ok(())
    }

    /// Removes every binding, logging host failures instead of stopping.
    pub fn remove_all(&self) {
        let names: Vec<(BindingId, TableName)> = self
            .registry
            .lock()
            .bindings()
            .map(|binding| (binding.id, binding.sql_name.clone()))
            .collect();
        for (id, name) in names {
            self.warn_pending(id);
            if let Err(err) = self.host.drop_table(&name) {
                warn!(table = %name, error = %err, "Failed to drop virtual table");
            }
            self.registry.lock().remove(id);
        }
    }

    /// Must run before the host drops the table: dropping resets the proxy.
    fn warn_pending(&self, id: BindingId) {
        let registry = self.registry.lock();
        if let Some(binding) = registry.get(id).filter(|binding| binding.has_pending()) {
            warn!(table = %binding.sql_name, "Discarded uncommitted edits of removed table");
        }
    }

    fn info(&self, id: BindingId) -> FederationResult<BindingInfo> {
        self.registry
            .lock()
            .get(id)
            .map(|binding| binding.info())
            .ok_or_else(|| FederationError::not_found(format!("binding {}", id.0)))
    }

    pub fn contains(&self, sql_name: &str) -> bool {
        self.lookup_by_sql_name(sql_name).is_some()
    }

    pub fn lookup_by_sql_name(&self, sql_name: &str) -> Option<BindingInfo> {
        let name = TableName::parse(sql_name).ok()?;
        self.registry.lock().find_by_name(&name).map(|b| b.info())
    }

    pub fn lookup_by_handshake_name(&self, handshake: &str) -> Option<BindingInfo> {
        self.registry
            .lock()
            .find_by_handshake(handshake)
            .map(|b| b.info())
    }

    pub fn lookup_by_source_identity(&self, source: &SourceHandle) -> Option<BindingInfo> {
        self.registry.lock().find_by_source(source).map(|b| b.info())
    }

    /// The table's source: the fixed one, or what its factory produced
    /// (`None` until the factory has run).
    pub fn get_table(&self, sql_name: &str) -> Option<SourceHandle> {
        let name = TableName::parse(sql_name).ok()?;
        self.registry
            .lock()
            .find_by_name(&name)
            .and_then(|binding| binding.current_source())
    }

    /// Calls `visitor` for every binding. The bindings are snapshotted first
    /// and the lock released, so the visitor may call back into the catalog.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&BindingInfo, Option<&SourceHandle>),
    {
        let snapshot: Vec<(BindingInfo, Option<SourceHandle>)> = self
            .registry
            .lock()
            .bindings()
            .map(|binding| (binding.info(), binding.current_source()))
            .collect();
        for (info, source) in &snapshot {
            visitor(info, source.as_ref());
        }
    }

    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().is_empty()
    }

    /// Drops the table's proxy so its source is re-read on next use.
    /// Cursors opened before the refresh are rejected as stale.
    pub fn refresh(&self, sql_name: &str) -> FederationResult<BindingInfo> {
        let name = TableName::parse(sql_name)?;
        let mut registry = self.registry.lock();
        let id = registry
            .find_by_name(&name)
            .map(|binding| binding.id)
            .ok_or_else(|| FederationError::not_found(sql_name))?;
        let binding = registry
            .get_mut(id)
            .ok_or_else(|| FederationError::not_found(sql_name))?;
        if binding.has_pending() {
            return Err(FederationError::unsupported(format!(
                "refreshing {name} while it has uncommitted edits"
            )));
        }
        binding.reset_proxy();
        Ok(binding.info())
    }

    /// Commit failures recorded since the last call.
    pub fn take_apply_errors(&self) -> Vec<(String, FederationError)> {
        self.registry.lock().take_apply_errors()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::sync::Mutex as StdMutex;

    use qore_core::{ColumnDescriptor, MemoryTable, Value};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    use super::*;
    use crate::module::{RowChange, VirtualTableModule};

    /// Records DDL and optionally rejects table creation.
    #[derive(Default)]
    struct RecordingHost {
        statements: RefCell<Vec<String>>,
        reject: Option<String>,
        module: RefCell<Option<Arc<FederationModule>>>,
    }

    impl HostEngine for RecordingHost {
        fn install_module(
            &self,
            module_name: &str,
            module: Arc<FederationModule>,
        ) -> FederationResult<()> {
            self.statements.borrow_mut().push(format!("MODULE {module_name}"));
            *self.module.borrow_mut() = Some(module);
            Ok(())
        }

        fn create_virtual_table(
            &self,
            table: &TableName,
            module_name: &str,
            handshake: &str,
        ) -> FederationResult<()> {
            if let Some(message) = &self.reject {
                return Err(FederationError::host_rejected(message.clone()));
            }
            self.statements.borrow_mut().push(format!(
                "CREATE VIRTUAL TABLE {} USING {module_name}('{handshake}')",
                table.to_sql()
            ));
            Ok(())
        }

        /// Resets the proxy the way the module's `destroy` does.
        fn drop_table(&self, table: &TableName) -> FederationResult<()> {
            self.statements
                .borrow_mut()
                .push(format!("DROP TABLE {}", table.to_sql()));
            if let Some(module) = self.module.borrow().as_ref() {
                let mut registry = module.registry().lock();
                let id = registry.find_by_name(table).map(|b| b.id);
                if let Some(binding) = id.and_then(|id| registry.get_mut(id)) {
                    binding.reset_proxy();
                }
            }
            Ok(())
        }

        fn attach_namespace(&self, _namespace: &str) -> FederationResult<()> {
            Ok(())
        }

        fn detach_namespace(&self, _namespace: &str) -> FederationResult<()> {
            Ok(())
        }
    }

    fn source() -> SourceHandle {
        SourceHandle::random(
            MemoryTable::with_rows(
                vec![ColumnDescriptor::new("id", "INTEGER")],
                vec![vec![Value::Int(1)]],
            )
            .unwrap(),
        )
    }

    fn catalog(host: RecordingHost) -> VirtualCatalog<RecordingHost> {
        VirtualCatalog::new(host, DEFAULT_MODULE_NAME, BufferPolicy::Buffered).unwrap()
    }

    #[test]
    fn test_register_issues_ddl() {
        let catalog = catalog(RecordingHost::default());
        let info = catalog.register("t", source()).unwrap();
        let statements = catalog.host().statements.borrow();
        assert_eq!(statements[0], "MODULE qorefed");
        assert_eq!(
            statements[1],
            format!("CREATE VIRTUAL TABLE \"t\" USING qorefed('{}')", info.handshake)
        );
    }

    #[test]
    fn test_name_in_use_then_reregister() {
        let catalog = catalog(RecordingHost::default());
        catalog.register("t", source()).unwrap();
        assert!(matches!(
            catalog.register("t", source()),
            Err(FederationError::NameInUse { .. })
        ));
        catalog.unregister("t").unwrap();
        assert!(catalog.register("t", source()).is_ok());
    }

    #[test]
    fn test_host_rejection_rolls_back() {
        let catalog = catalog(RecordingHost {
            reject: Some("table t already exists".into()),
            ..Default::default()
        });
        let err = catalog.register("t", source()).unwrap_err();
        assert_eq!(err, FederationError::host_rejected("table t already exists"));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_unregister_unknown() {
        let catalog = catalog(RecordingHost::default());
        assert!(matches!(
            catalog.unregister("missing"),
            Err(FederationError::NotFound { .. })
        ));
    }

    #[test]
    fn test_lookups() {
        let catalog = catalog(RecordingHost::default());
        let handle = source();
        let info = catalog.register("ns.Items", handle.clone()).unwrap();
        assert_eq!(catalog.lookup_by_sql_name("NS.items").unwrap().id, info.id);
        assert_eq!(
            catalog.lookup_by_handshake_name(&info.handshake).unwrap().id,
            info.id
        );
        assert_eq!(catalog.lookup_by_source_identity(&handle).unwrap().id, info.id);
        assert!(catalog.lookup_by_source_identity(&source()).is_none());
        assert!(catalog.get_table("ns.items").unwrap().same_source(&handle));
    }

    #[test]
    fn test_for_each_allows_reentry() {
        let catalog = catalog(RecordingHost::default());
        catalog.register("a", source()).unwrap();
        catalog.register("b", source()).unwrap();
        let mut seen = Vec::new();
        catalog.for_each(|info, source| {
            assert!(source.is_some());
            assert!(catalog.contains(&info.sql_name));
            seen.push(info.sql_name.clone());
        });
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_remove_all() {
        let catalog = catalog(RecordingHost::default());
        catalog.register("a", source()).unwrap();
        catalog.register("b", source()).unwrap();
        catalog.remove_all();
        assert!(catalog.is_empty());
        assert_eq!(
            catalog
                .host()
                .statements
                .borrow()
                .iter()
                .filter(|s| s.starts_with("DROP"))
                .count(),
            2
        );
    }

    /// Collects the messages of WARN events.
    #[derive(Clone, Default)]
    struct WarningCapture(Arc<StdMutex<Vec<String>>>);

    impl<S: Subscriber> Layer<S> for WarningCapture {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() != Level::WARN {
                return;
            }
            struct Message<'a>(&'a mut String);
            impl tracing::field::Visit for Message<'_> {
                fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                    if field.name() == "message" {
                        *self.0 = format!("{value:?}");
                    }
                }
            }
            let mut message = String::new();
            event.record(&mut Message(&mut message));
            if let Ok(mut warnings) = self.0.lock() {
                warnings.push(message);
            }
        }
    }

    #[test]
    fn test_unregister_warns_about_uncommitted_edits() {
        let catalog = catalog(RecordingHost::default());
        let info = catalog.register("t", source()).unwrap();
        catalog.register("u", source()).unwrap();
        let handle = catalog.module().connect(&info.handshake).unwrap().handle;
        catalog
            .module()
            .update(&handle, RowChange::Delete { rowid: 0 })
            .unwrap();

        let capture = WarningCapture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());
        tracing::subscriber::with_default(subscriber, || {
            catalog.unregister("u").unwrap();
            catalog.unregister("t").unwrap();
        });

        let warnings = capture.0.lock().unwrap().clone();
        assert_eq!(warnings, vec!["Discarded uncommitted edits of removed table"]);
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_invalid_module_name() {
        let result =
            VirtualCatalog::new(RecordingHost::default(), "bad name", BufferPolicy::Buffered);
        assert!(result.is_err());
    }
}
