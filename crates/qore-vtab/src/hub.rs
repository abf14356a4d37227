// SPDX-License-Identifier: Apache-2.0

//! Connection hub
//!
//! Exposes every table of attached member connections as a virtual table,
//! either under the member's namespace (`ns.table`) or unqualified. Member
//! schema notifications may arrive on any thread; they are queued and
//! applied to the catalog by [`Hub::process_events`] on the owning thread.

use std::collections::BTreeMap;
use std::sync::Arc;

use qore_core::{
    ColumnDescriptor, FederationError, FederationResult, FilterOp, MemberConnection, MemberId,
    ScanRequest, SchemaListener, SourceFactory, SourceHandle, SubscriptionId, TableSource,
};
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, instrument, warn};

use crate::catalog::VirtualCatalog;
use crate::host::HostEngine;
use crate::name::{is_plain_identifier, TableName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberEventKind {
    Added,
    Removed,
    Altered,
}

#[derive(Debug, Clone)]
struct MemberEvent {
    attachment: u64,
    kind: MemberEventKind,
    table: String,
}

/// Forwards a member's notifications into the hub's queue.
struct HubListener {
    attachment: u64,
    events: UnboundedSender<MemberEvent>,
}

impl HubListener {
    fn push(&self, kind: MemberEventKind, table: &str) {
        let event = MemberEvent {
            attachment: self.attachment,
            kind,
            table: table.to_string(),
        };
        if self.events.send(event).is_err() {
            debug!(table, "Hub is gone, dropping member notification");
        }
    }
}

impl SchemaListener for HubListener {
    fn table_added(&self, table: &str) {
        self.push(MemberEventKind::Added, table);
    }

    fn table_removed(&self, table: &str) {
        self.push(MemberEventKind::Removed, table);
    }

    fn table_altered(&self, table: &str) {
        self.push(MemberEventKind::Altered, table);
    }
}

/// Produces a member table's source each time a scan needs fresh data.
struct MemberTableFactory {
    member: Arc<dyn MemberConnection>,
    table: String,
}

impl SourceFactory for MemberTableFactory {
    fn columns(&self) -> FederationResult<Vec<ColumnDescriptor>> {
        self.member.describe_table(&self.table)
    }

    fn produce(&self) -> FederationResult<SourceHandle> {
        self.member.open_table(&self.table)
    }

    fn accepts_filter(&self, column: usize, op: FilterOp) -> bool {
        self.member.accepts_filter(&self.table, column, op)
    }

    fn produce_filtered(&self, request: &ScanRequest) -> FederationResult<Option<SourceHandle>> {
        self.member.open_table_filtered(&self.table, request)
    }
}

struct AttachedMember {
    member: Arc<dyn MemberConnection>,
    namespace: Option<String>,
    subscription: SubscriptionId,
    attachment: u64,
    /// Member table name -> exposed name
    tables: BTreeMap<String, TableName>,
}

impl AttachedMember {
    fn info(&self) -> MemberInfo {
        MemberInfo {
            id: self.member.id(),
            name: self.member.name().to_string(),
            namespace: self.namespace.clone(),
            tables: self.tables.values().map(|t| t.to_string()).collect(),
            thread_safe: self.member.capabilities().thread_safe,
        }
    }
}

/// Snapshot of an attached member
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberInfo {
    pub id: MemberId,
    pub name: String,
    pub namespace: Option<String>,
    pub tables: Vec<String>,
    pub thread_safe: bool,
}

pub struct Hub {
    members: Vec<AttachedMember>,
    next_attachment: u64,
    events_tx: UnboundedSender<MemberEvent>,
    events_rx: UnboundedReceiver<MemberEvent>,
}

impl Hub {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            members: Vec::new(),
            next_attachment: 0,
            events_tx,
            events_rx,
        }
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.iter().map(AttachedMember::info).collect()
    }

    pub fn is_attached(&self, member: MemberId) -> bool {
        self.members.iter().any(|m| m.member.id() == member)
    }

    /// The member attached under `namespace` (case-insensitive), or the
    /// un-namespaced member for `None`.
    pub fn member_by_namespace(&self, namespace: Option<&str>) -> Option<Arc<dyn MemberConnection>> {
        self.members
            .iter()
            .find(|m| match (m.namespace.as_deref(), namespace) {
                (Some(attached), Some(wanted)) => attached.eq_ignore_ascii_case(wanted),
                (None, None) => true,
                _ => false,
            })
            .map(|m| m.member.clone())
    }

    /// True when every attached member tolerates calls from any thread.
    pub fn all_thread_safe(&self) -> bool {
        self.members
            .iter()
            .all(|m| m.member.capabilities().thread_safe)
    }

    /// Attaches `member`, exposing each of its tables as `namespace.table`
    /// (or bare `table` without a namespace). On failure nothing stays
    /// registered.
    #[instrument(skip(self, catalog, member), fields(member = member.name()))]
    pub fn attach<H: HostEngine>(
        &mut self,
        catalog: &VirtualCatalog<H>,
        member: Arc<dyn MemberConnection>,
        namespace: Option<&str>,
    ) -> FederationResult<MemberInfo> {
        if self.is_attached(member.id()) {
            return Err(FederationError::already_attached(member.name()));
        }
        let namespace = match namespace {
            Some(ns) => {
                if !is_plain_identifier(ns) {
                    return Err(FederationError::validation(format!(
                        "Invalid namespace '{ns}'"
                    )));
                }
                let taken = self.members.iter().any(|m| {
                    m.namespace
                        .as_deref()
                        .map(|other| other.eq_ignore_ascii_case(ns))
                        .unwrap_or(false)
                });
                if taken {
                    return Err(FederationError::namespace_in_use(ns));
                }
                Some(ns.to_string())
            }
            None => {
                if self.members.iter().any(|m| m.namespace.is_none()) {
                    return Err(FederationError::DuplicateUnnamespaced);
                }
                None
            }
        };

        // Subscribe before listing so no table added in between is missed;
        // duplicate additions are ignored later.
        self.next_attachment += 1;
        let attachment = self.next_attachment;
        let subscription = member.subscribe(Arc::new(HubListener {
            attachment,
            events: self.events_tx.clone(),
        }));

        let tables = match member.list_tables() {
            Ok(tables) => tables,
            Err(err) => {
                member.unsubscribe(subscription);
                return Err(err);
            }
        };

        if let Some(ns) = &namespace {
            if let Err(err) = catalog.host().attach_namespace(ns) {
                member.unsubscribe(subscription);
                return Err(err);
            }
        }

        let mut entry = AttachedMember {
            member,
            namespace,
            subscription,
            attachment,
            tables: BTreeMap::new(),
        };
        for table in tables {
            if let Err(err) = register_member_table(catalog, &mut entry, &table) {
                warn!(table = %table, error = %err, "Attach failed, rolling back");
                release(catalog, &entry);
                return Err(err);
            }
        }

        let info = entry.info();
        info!(tables = info.tables.len(), namespace = ?info.namespace, "Attached member");
        self.members.push(entry);
        Ok(info)
    }

    /// Detaches `member`, removing exactly the tables it contributed.
    #[instrument(skip(self, catalog))]
    pub fn detach<H: HostEngine>(
        &mut self,
        catalog: &VirtualCatalog<H>,
        member: MemberId,
    ) -> FederationResult<()> {
        let index = self
            .members
            .iter()
            .position(|m| m.member.id() == member)
            .ok_or_else(|| FederationError::not_attached(member.to_string()))?;
        let entry = self.members.remove(index);
        let result = release(catalog, &entry);
        info!(member = entry.member.name(), "Detached member");
        result
    }

    /// Detaches every member, logging failures.
    pub fn detach_all<H: HostEngine>(&mut self, catalog: &VirtualCatalog<H>) {
        for entry in std::mem::take(&mut self.members) {
            if let Err(err) = release(catalog, &entry) {
                warn!(member = entry.member.name(), error = %err, "Failed to detach member");
            }
        }
    }

    /// Applies queued member notifications. Returns how many changed the
    /// catalog; events for detached members or untracked tables are ignored.
    pub fn process_events<H: HostEngine>(&mut self, catalog: &VirtualCatalog<H>) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            let Some(entry) = self
                .members
                .iter_mut()
                .find(|m| m.attachment == event.attachment)
            else {
                debug!(table = %event.table, "Ignoring notification from detached member");
                continue;
            };

            let result = match event.kind {
                MemberEventKind::Added => table_added(catalog, entry, &event.table),
                MemberEventKind::Removed => table_removed(catalog, entry, &event.table),
                MemberEventKind::Altered => table_altered(catalog, entry, &event.table),
            };
            match result {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(table = %event.table, kind = ?event.kind, error = %err, "Failed to apply member notification")
                }
            }
        }
        applied
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

fn register_member_table<H: HostEngine>(
    catalog: &VirtualCatalog<H>,
    entry: &mut AttachedMember,
    table: &str,
) -> FederationResult<()> {
    let name = TableName::new(entry.namespace.as_deref(), table)?;
    let factory = Arc::new(MemberTableFactory {
        member: entry.member.clone(),
        table: table.to_string(),
    });
    catalog.register_name(
        name.clone(),
        TableSource::Factory(factory),
        catalog.default_policy(),
    )?;
    entry.tables.insert(table.to_string(), name);
    Ok(())
}

fn unregister_member_table<H: HostEngine>(
    catalog: &VirtualCatalog<H>,
    name: &TableName,
) -> FederationResult<()> {
    match catalog.unregister_name(name) {
        Err(FederationError::NotFound { .. }) => {
            debug!(table = %name, "Member table was already removed");
            Ok(())
        }
        other => other,
    }
}

/// Unsubscribes and removes every table and the namespace of `entry`.
fn release<H: HostEngine>(catalog: &VirtualCatalog<H>, entry: &AttachedMember) -> FederationResult<()> {
    entry.member.unsubscribe(entry.subscription);
    let mut first_error = None;
    for name in entry.tables.values() {
        if let Err(err) = unregister_member_table(catalog, name) {
            warn!(table = %name, error = %err, "Failed to remove member table");
            first_error.get_or_insert(err);
        }
    }
    if let Some(ns) = &entry.namespace {
        if let Err(err) = catalog.host().detach_namespace(ns) {
            warn!(namespace = %ns, error = %err, "Failed to detach namespace");
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn table_added<H: HostEngine>(
    catalog: &VirtualCatalog<H>,
    entry: &mut AttachedMember,
    table: &str,
) -> FederationResult<bool> {
    if entry.tables.contains_key(table) {
        return Ok(false);
    }
    register_member_table(catalog, entry, table)?;
    debug!(table, "Member table added");
    Ok(true)
}

fn table_removed<H: HostEngine>(
    catalog: &VirtualCatalog<H>,
    entry: &mut AttachedMember,
    table: &str,
) -> FederationResult<bool> {
    let Some(name) = entry.tables.get(table).cloned() else {
        return Ok(false);
    };
    unregister_member_table(catalog, &name)?;
    entry.tables.remove(table);
    debug!(table, "Member table removed");
    Ok(true)
}

fn table_altered<H: HostEngine>(
    catalog: &VirtualCatalog<H>,
    entry: &mut AttachedMember,
    table: &str,
) -> FederationResult<bool> {
    if !table_removed(catalog, entry, table)? {
        return Ok(false);
    }
    register_member_table(catalog, entry, table)?;
    debug!(table, "Member table re-declared");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;
    use qore_core::{MemoryTable, RowSource, Value};

    use super::*;
    use crate::catalog::DEFAULT_MODULE_NAME;
    use crate::proxy::BufferPolicy;
    use crate::sqlite::SqliteHost;

    /// Member whose tables are in-memory tables.
    struct FakeMember {
        id: MemberId,
        name: String,
        tables: Mutex<BTreeMap<String, MemoryTable>>,
        listeners: Mutex<BTreeMap<SubscriptionId, Arc<dyn SchemaListener>>>,
        next_subscription: AtomicU64,
        thread_safe: bool,
        /// Evaluates equality filters on `open_table_filtered` when set.
        filtering: bool,
        requests: Mutex<Vec<ScanRequest>>,
    }

    impl FakeMember {
        fn new(name: &str, tables: &[&str]) -> Arc<Self> {
            let member = Arc::new(Self {
                id: MemberId::new(),
                name: name.to_string(),
                tables: Mutex::new(BTreeMap::new()),
                listeners: Mutex::new(BTreeMap::new()),
                next_subscription: AtomicU64::new(0),
                thread_safe: true,
                filtering: false,
                requests: Mutex::new(Vec::new()),
            });
            for table in tables {
                member.tables.lock().insert(table.to_string(), Self::table(1));
            }
            member
        }

        fn table(rows: i64) -> MemoryTable {
            MemoryTable::with_rows(
                vec![ColumnDescriptor::new("v", "INTEGER")],
                (0..rows).map(|i| vec![Value::Int(i)]).collect(),
            )
            .unwrap()
        }

        fn add_table(&self, name: &str, rows: i64) {
            self.tables.lock().insert(name.to_string(), Self::table(rows));
            for listener in self.listeners.lock().values() {
                listener.table_added(name);
            }
        }

        fn drop_table(&self, name: &str) {
            self.tables.lock().remove(name);
            for listener in self.listeners.lock().values() {
                listener.table_removed(name);
            }
        }

        fn listener_count(&self) -> usize {
            self.listeners.lock().len()
        }
    }

    impl MemberConnection for FakeMember {
        fn id(&self) -> MemberId {
            self.id
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> qore_core::MemberCapabilities {
            qore_core::MemberCapabilities {
                thread_safe: self.thread_safe,
                writable: true,
            }
        }

        fn list_tables(&self) -> FederationResult<Vec<String>> {
            Ok(self.tables.lock().keys().cloned().collect())
        }

        fn describe_table(&self, table: &str) -> FederationResult<Vec<ColumnDescriptor>> {
            self.tables
                .lock()
                .get(table)
                .map(|t| t.column_descriptors())
                .ok_or_else(|| FederationError::not_found(table))
        }

        fn open_table(&self, table: &str) -> FederationResult<SourceHandle> {
            self.tables
                .lock()
                .get(table)
                .cloned()
                .map(SourceHandle::random)
                .ok_or_else(|| FederationError::not_found(table))
        }

        fn accepts_filter(&self, _table: &str, _column: usize, op: FilterOp) -> bool {
            self.filtering && op == FilterOp::Eq
        }

        fn open_table_filtered(
            &self,
            table: &str,
            request: &ScanRequest,
        ) -> FederationResult<Option<SourceHandle>> {
            self.requests.lock().push(request.clone());
            let tables = self.tables.lock();
            let source = tables.get(table).ok_or_else(|| FederationError::not_found(table))?;
            let rows = source
                .rows()
                .iter()
                .filter(|row| request.filters.iter().all(|f| row[f.column] == f.value))
                .cloned()
                .collect();
            let filtered = MemoryTable::with_rows(source.column_descriptors(), rows)?.read_only();
            Ok(Some(SourceHandle::random(filtered)))
        }

        fn subscribe(&self, listener: Arc<dyn SchemaListener>) -> SubscriptionId {
            let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
            self.listeners.lock().insert(id, listener);
            id
        }

        fn unsubscribe(&self, subscription: SubscriptionId) {
            self.listeners.lock().remove(&subscription);
        }
    }

    fn catalog() -> VirtualCatalog<SqliteHost> {
        VirtualCatalog::new(
            SqliteHost::open_in_memory().unwrap(),
            DEFAULT_MODULE_NAME,
            BufferPolicy::Buffered,
        )
        .unwrap()
    }

    fn count(catalog: &VirtualCatalog<SqliteHost>, table: &str) -> Value {
        catalog
            .host()
            .query(&format!("SELECT count(*) FROM {table}"))
            .unwrap()
            .rows[0][0]
            .clone()
    }

    #[test]
    fn test_attach_and_detach_namespace() {
        let catalog = catalog();
        let mut hub = Hub::new();
        let member = FakeMember::new("m", &["a", "b"]);

        let info = hub.attach(&catalog, member.clone(), Some("ns")).unwrap();
        assert_eq!(info.tables, vec!["ns.a", "ns.b"]);
        assert_eq!(count(&catalog, "ns.a"), Value::Int(1));
        assert!(catalog.contains("ns.b"));

        hub.detach(&catalog, member.id()).unwrap();
        assert!(catalog.is_empty());
        assert_eq!(member.listener_count(), 0);

        member.add_table("c", 2);
        let info = hub.attach(&catalog, member.clone(), Some("ns")).unwrap();
        assert_eq!(info.tables, vec!["ns.a", "ns.b", "ns.c"]);
    }

    #[test]
    fn test_attach_conflicts() {
        let catalog = catalog();
        let mut hub = Hub::new();
        let first = FakeMember::new("first", &["a"]);
        let second = FakeMember::new("second", &["b"]);
        let third = FakeMember::new("third", &["c"]);

        hub.attach(&catalog, first.clone(), None).unwrap();
        assert!(matches!(
            hub.attach(&catalog, first.clone(), Some("x")),
            Err(FederationError::AlreadyAttached { .. })
        ));
        assert!(matches!(
            hub.attach(&catalog, second.clone(), None),
            Err(FederationError::DuplicateUnnamespaced)
        ));
        hub.attach(&catalog, second, Some("ns")).unwrap();
        assert!(matches!(
            hub.attach(&catalog, third.clone(), Some("NS")),
            Err(FederationError::NamespaceInUse { .. })
        ));
        assert!(matches!(
            hub.attach(&catalog, third, Some("bad ns")),
            Err(FederationError::Validation { .. })
        ));
        assert!(matches!(
            hub.detach(&catalog, MemberId::new()),
            Err(FederationError::NotAttached { .. })
        ));
    }

    #[test]
    fn test_failed_attach_rolls_back() {
        let catalog = catalog();
        catalog
            .register(
                "b",
                SourceHandle::random(FakeMember::table(1)),
            )
            .unwrap();
        let mut hub = Hub::new();
        let member = FakeMember::new("m", &["a", "b"]);
        assert!(matches!(
            hub.attach(&catalog, member.clone(), None),
            Err(FederationError::NameInUse { .. })
        ));
        assert!(!catalog.contains("a"));
        assert!(catalog.contains("b"));
        assert_eq!(member.listener_count(), 0);
        assert!(hub.members().is_empty());
    }

    #[test]
    fn test_notifications_update_catalog() {
        let catalog = catalog();
        let mut hub = Hub::new();
        let member = FakeMember::new("m", &["a"]);
        hub.attach(&catalog, member.clone(), Some("ns")).unwrap();

        member.add_table("c", 3);
        member.add_table("a", 5);
        member.drop_table("missing");
        assert_eq!(hub.process_events(&catalog), 1);
        assert_eq!(count(&catalog, "ns.c"), Value::Int(3));

        member.drop_table("a");
        assert_eq!(hub.process_events(&catalog), 1);
        assert!(!catalog.contains("ns.a"));
    }

    #[test]
    fn test_factory_rereads_member_between_statements() {
        let catalog = catalog();
        let mut hub = Hub::new();
        let member = FakeMember::new("m", &["a"]);
        hub.attach(&catalog, member.clone(), None).unwrap();
        assert_eq!(count(&catalog, "a"), Value::Int(1));

        member.tables.lock().insert("a".into(), FakeMember::table(4));
        assert_eq!(count(&catalog, "a"), Value::Int(4));
    }

    #[test]
    fn test_member_by_namespace() {
        let catalog = catalog();
        let mut hub = Hub::new();
        let plain = FakeMember::new("plain", &["a"]);
        let named = FakeMember::new("named", &["b"]);
        hub.attach(&catalog, plain.clone(), None).unwrap();
        hub.attach(&catalog, named.clone(), Some("Sales")).unwrap();

        assert_eq!(hub.member_by_namespace(Some("sales")).unwrap().id(), named.id());
        assert_eq!(hub.member_by_namespace(None).unwrap().id(), plain.id());
        assert!(hub.member_by_namespace(Some("other")).is_none());

        hub.detach(&catalog, named.id()).unwrap();
        assert!(hub.member_by_namespace(Some("sales")).is_none());
    }

    #[test]
    fn test_equality_filter_reaches_member() {
        let catalog = catalog();
        let mut hub = Hub::new();
        let mut member = FakeMember::new("m", &[]);
        Arc::get_mut(&mut member).unwrap().filtering = true;
        member.tables.lock().insert("a".into(), FakeMember::table(5));
        hub.attach(&catalog, member.clone(), None).unwrap();

        let rows = catalog.host().query("SELECT v FROM a WHERE v = 3").unwrap().rows;
        assert_eq!(rows, vec![vec![Value::Int(3)]]);
        {
            let requests = member.requests.lock();
            assert_eq!(requests.len(), 1);
            assert_eq!(requests[0].filters[0].op, FilterOp::Eq);
            assert_eq!(requests[0].filters[0].value, Value::Int(3));
        }

        // Range constraints are declined and checked by the host
        let rows = catalog.host().query("SELECT v FROM a WHERE v > 2 ORDER BY v").unwrap().rows;
        assert_eq!(rows, vec![vec![Value::Int(3)], vec![Value::Int(4)]]);
        assert_eq!(member.requests.lock().len(), 1);

        // Writing statements scan the whole table so rowids address it
        let changed = catalog.host().execute("UPDATE a SET v = 30 WHERE v = 3").unwrap();
        assert_eq!(changed, 1);
        assert_eq!(member.requests.lock().len(), 1);
    }
}
