//! StateStore — redb-backed object persistence for fleetset.
//!
//! Provides typed operations over machine sets, machines, and nodes. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).
//!
//! Writes are optimistic: callers that pass a non-zero `resource_version`
//! get [`StateError::Conflict`] if the stored object has moved on. Deleting
//! an object that still has finalizers only stamps `deletion_timestamp`;
//! the object is removed once its finalizers are patched away.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::events::{EventAction, StoreEvent};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// Length of the random hex suffix appended to `generate_name` (40 bits).
const GENERATED_SUFFIX_LEN: usize = 10;

/// Separator between namespace and name in table keys.
const KEY_SEPARATOR: char = '/';

/// Partial update of a machine's metadata. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct MachinePatch {
    pub labels: Option<Labels>,
    pub annotations: Option<std::collections::BTreeMap<String, String>>,
    pub owner_references: Option<Vec<OwnerReference>>,
    pub finalizers: Option<Vec<String>>,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<StoreEvent>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> StateResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            db: Arc::new(db),
            events,
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(MACHINE_SETS).map_err(map_err!(Table))?;
        txn.open_table(MACHINES).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to committed changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // ── MachineSets ────────────────────────────────────────────────

    /// Create or replace a machine set's metadata and spec.
    ///
    /// Status is preserved across updates and only written through
    /// [`StateStore::update_machine_set_status`]. A non-zero
    /// `resource_version` makes the write conditional.
    pub fn put_machine_set(&self, set: &MachineSet) -> StateResult<MachineSet> {
        let key = set.metadata.key();
        validate_namespaced(&key)?;
        let table_key = key.table_key();

        let stored = self.write(|txn| {
            let existing: Option<MachineSet> = read_in(txn, MACHINE_SETS, &table_key)?;
            let mut next = set.clone();
            match existing {
                Some(current) => {
                    check_version(&key, set.metadata.resource_version, &current.metadata)?;
                    next.metadata.uid = current.metadata.uid;
                    next.metadata.creation_timestamp = current.metadata.creation_timestamp;
                    next.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
                    next.metadata.generation = if current.spec != set.spec {
                        current.metadata.generation + 1
                    } else {
                        current.metadata.generation
                    };
                    next.status = current.status;
                }
                None => init_meta(&mut next.metadata),
            }
            next.metadata.resource_version = next_resource_version(txn)?;
            insert_in(txn, MACHINE_SETS, &table_key, &next)?;
            Ok(next)
        })?;

        debug!(%key, resource_version = stored.metadata.resource_version, "machine set stored");
        self.publish(stored.clone().into_event(EventAction::Applied));
        Ok(stored)
    }

    pub fn get_machine_set(&self, key: &ObjectKey) -> StateResult<Option<MachineSet>> {
        self.get_object(key)
    }

    /// List machine sets, optionally restricted to one namespace.
    pub fn list_machine_sets(&self, namespace: Option<&str>) -> StateResult<Vec<MachineSet>> {
        self.list_objects(namespace)
    }

    /// Replace a machine set's status. The caller's `resource_version` must
    /// match the stored one.
    pub fn update_machine_set_status(&self, set: &MachineSet) -> StateResult<MachineSet> {
        let key = set.metadata.key();
        let table_key = key.table_key();

        let stored = self.write(|txn| {
            let mut current: MachineSet = read_in(txn, MACHINE_SETS, &table_key)?
                .ok_or_else(|| StateError::NotFound(format!("{MACHINE_SET_KIND} {key}")))?;
            check_exact_version(&key, set.metadata.resource_version, &current.metadata)?;
            current.status = set.status.clone();
            current.metadata.resource_version = next_resource_version(txn)?;
            insert_in(txn, MACHINE_SETS, &table_key, &current)?;
            Ok(current)
        })?;

        debug!(%key, resource_version = stored.metadata.resource_version, "machine set status updated");
        self.publish(stored.clone().into_event(EventAction::Applied));
        Ok(stored)
    }

    pub fn delete_machine_set(&self, key: &ObjectKey, uid: Option<&str>) -> StateResult<()> {
        self.delete_object::<MachineSet>(key, uid)
    }

    // ── Machines ───────────────────────────────────────────────────

    /// Create a new machine. An empty name is generated from `generate_name`.
    pub fn create_machine(&self, machine: &Machine) -> StateResult<Machine> {
        let mut next = machine.clone();
        if next.metadata.name.is_empty() {
            let prefix = next.metadata.generate_name.as_deref().ok_or_else(|| {
                StateError::Invalid("machine needs a name or generate_name".to_string())
            })?;
            next.metadata.name = format!("{prefix}{}", random_suffix());
        }
        let key = next.metadata.key();
        validate_namespaced(&key)?;
        let table_key = key.table_key();

        let stored = self.write(|txn| {
            if read_in::<Machine>(txn, MACHINES, &table_key)?.is_some() {
                return Err(StateError::AlreadyExists(format!("{MACHINE_KIND} {key}")));
            }
            init_meta(&mut next.metadata);
            next.metadata.resource_version = next_resource_version(txn)?;
            insert_in(txn, MACHINES, &table_key, &next)?;
            Ok(next)
        })?;

        debug!(%key, uid = %stored.metadata.uid, "machine created");
        self.publish(stored.clone().into_event(EventAction::Applied));
        Ok(stored)
    }

    pub fn get_machine(&self, key: &ObjectKey) -> StateResult<Option<Machine>> {
        self.get_object(key)
    }

    /// List machines, optionally restricted to one namespace.
    pub fn list_machines(&self, namespace: Option<&str>) -> StateResult<Vec<Machine>> {
        self.list_objects(namespace)
    }

    /// Apply a metadata patch. With `resource_version` set, the patch only
    /// applies if the stored machine has not changed since it was read.
    ///
    /// Clearing the finalizers of a terminating machine removes it.
    pub fn patch_machine(
        &self,
        key: &ObjectKey,
        resource_version: Option<u64>,
        patch: MachinePatch,
    ) -> StateResult<Machine> {
        let table_key = key.table_key();

        let (machine, action) = self.write(|txn| {
            let mut current: Machine = read_in(txn, MACHINES, &table_key)?
                .ok_or_else(|| StateError::NotFound(format!("{MACHINE_KIND} {key}")))?;
            if let Some(expected) = resource_version {
                check_exact_version(key, expected, &current.metadata)?;
            }
            let meta = &mut current.metadata;
            if let Some(labels) = patch.labels {
                meta.labels = labels;
            }
            if let Some(annotations) = patch.annotations {
                meta.annotations = annotations;
            }
            if let Some(owners) = patch.owner_references {
                meta.owner_references = owners;
            }
            if let Some(finalizers) = patch.finalizers {
                meta.finalizers = finalizers;
            }

            if meta.is_terminating() && meta.finalizers.is_empty() {
                remove_in(txn, MACHINES, &table_key)?;
                return Ok((current, EventAction::Deleted));
            }
            current.metadata.resource_version = next_resource_version(txn)?;
            insert_in(txn, MACHINES, &table_key, &current)?;
            Ok((current, EventAction::Applied))
        })?;

        debug!(%key, ?action, "machine patched");
        self.publish(machine.clone().into_event(action));
        Ok(machine)
    }

    /// Replace a machine's status. The caller's `resource_version` must
    /// match the stored one.
    pub fn update_machine_status(&self, machine: &Machine) -> StateResult<Machine> {
        let key = machine.metadata.key();
        let table_key = key.table_key();

        let stored = self.write(|txn| {
            let mut current: Machine = read_in(txn, MACHINES, &table_key)?
                .ok_or_else(|| StateError::NotFound(format!("{MACHINE_KIND} {key}")))?;
            check_exact_version(&key, machine.metadata.resource_version, &current.metadata)?;
            current.status = machine.status.clone();
            current.metadata.resource_version = next_resource_version(txn)?;
            insert_in(txn, MACHINES, &table_key, &current)?;
            Ok(current)
        })?;

        self.publish(stored.clone().into_event(EventAction::Applied));
        Ok(stored)
    }

    /// Delete a machine. With `uid` set, the delete only applies to that
    /// exact incarnation of the name.
    pub fn delete_machine(&self, key: &ObjectKey, uid: Option<&str>) -> StateResult<()> {
        self.delete_object::<Machine>(key, uid)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, node: &Node) -> StateResult<Node> {
        let key = node.metadata.key();
        if key.name.is_empty() || key.name.contains(KEY_SEPARATOR) {
            return Err(StateError::Invalid(format!(
                "node name must be non-empty and free of {KEY_SEPARATOR:?}, got {:?}",
                key.name
            )));
        }
        let table_key = key.table_key();

        let stored = self.write(|txn| {
            let existing: Option<Node> = read_in(txn, NODES, &table_key)?;
            let mut next = node.clone();
            next.metadata.namespace.clear();
            match existing {
                Some(current) => {
                    check_version(&key, node.metadata.resource_version, &current.metadata)?;
                    next.metadata.uid = current.metadata.uid;
                    next.metadata.creation_timestamp = current.metadata.creation_timestamp;
                    next.metadata.generation = current.metadata.generation;
                }
                None => init_meta(&mut next.metadata),
            }
            next.metadata.resource_version = next_resource_version(txn)?;
            insert_in(txn, NODES, &table_key, &next)?;
            Ok(next)
        })?;

        self.publish(stored.clone().into_event(EventAction::Applied));
        Ok(stored)
    }

    pub fn get_node(&self, name: &str) -> StateResult<Option<Node>> {
        self.get_object(&ObjectKey::new("", name))
    }

    pub fn list_nodes(&self) -> StateResult<Vec<Node>> {
        self.list_objects(None)
    }

    pub fn delete_node(&self, name: &str) -> StateResult<()> {
        self.delete_object::<Node>(&ObjectKey::new("", name), None)
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn get_object<T: StoredObject>(&self, key: &ObjectKey) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        let object = match table.get(key.table_key().as_str()).map_err(map_err!(Read))? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(object)
    }

    fn list_objects<T: StoredObject>(&self, namespace: Option<&str>) -> StateResult<Vec<T>> {
        let prefix = namespace.map(|ns| format!("{ns}{KEY_SEPARATOR}"));
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(T::TABLE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !prefix.as_deref().is_none_or(|p| key.value().starts_with(p)) {
                continue;
            }
            let object: T = decode(value.value())?;
            // The key prefix alone cannot tell `a` from `a/b`.
            if namespace.is_none_or(|ns| object.meta().namespace == ns) {
                results.push(object);
            }
        }
        Ok(results)
    }

    fn delete_object<T: StoredObject>(&self, key: &ObjectKey, uid: Option<&str>) -> StateResult<()> {
        let table_key = key.table_key();

        let event = self.write(|txn| {
            let mut current: T = read_in(txn, T::TABLE, &table_key)?
                .ok_or_else(|| StateError::NotFound(format!("{} {key}", T::KIND)))?;
            if let Some(uid) = uid
                && current.meta().uid != uid
            {
                return Err(StateError::Conflict(format!(
                    "{} {key}: uid precondition {uid} does not match {}",
                    T::KIND,
                    current.meta().uid
                )));
            }

            if current.meta().finalizers.is_empty() {
                remove_in(txn, T::TABLE, &table_key)?;
                return Ok(Some(current.into_event(EventAction::Deleted)));
            }
            if current.meta().is_terminating() {
                return Ok(None);
            }
            current.meta_mut().deletion_timestamp = Some(epoch_secs());
            current.meta_mut().resource_version = next_resource_version(txn)?;
            insert_in(txn, T::TABLE, &table_key, &current)?;
            Ok(Some(current.into_event(EventAction::Applied)))
        })?;

        match event {
            Some(event) => {
                debug!(kind = T::KIND, %key, action = ?event.action(), "delete processed");
                self.publish(event);
            }
            None => debug!(kind = T::KIND, %key, "already terminating"),
        }
        Ok(())
    }

    /// Run `f` in a write transaction, committing only if it succeeds.
    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> StateResult<R>) -> StateResult<R> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        match f(&txn) {
            Ok(result) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(result)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    fn publish(&self, event: StoreEvent) {
        // Sending only fails when nobody is subscribed.
        let _ = self.events.send(event);
    }
}

/// Object kinds the store persists.
trait StoredObject: Serialize + DeserializeOwned + Clone {
    const TABLE: ObjectTable;
    const KIND: &'static str;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn into_event(self, action: EventAction) -> StoreEvent;
}

impl StoredObject for MachineSet {
    const TABLE: ObjectTable = MACHINE_SETS;
    const KIND: &'static str = MACHINE_SET_KIND;
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn into_event(self, action: EventAction) -> StoreEvent {
        StoreEvent::MachineSet { action, object: self }
    }
}

impl StoredObject for Machine {
    const TABLE: ObjectTable = MACHINES;
    const KIND: &'static str = MACHINE_KIND;
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn into_event(self, action: EventAction) -> StoreEvent {
        StoreEvent::Machine { action, object: self }
    }
}

impl StoredObject for Node {
    const TABLE: ObjectTable = NODES;
    const KIND: &'static str = NODE_KIND;
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
    fn into_event(self, action: EventAction) -> StoreEvent {
        StoreEvent::Node { action, object: self }
    }
}

fn read_in<T: DeserializeOwned>(
    txn: &WriteTransaction,
    definition: ObjectTable,
    key: &str,
) -> StateResult<Option<T>> {
    let table = txn.open_table(definition).map_err(map_err!(Table))?;
    let object = match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Some(decode(guard.value())?),
        None => None,
    };
    Ok(object)
}

fn insert_in<T: Serialize>(
    txn: &WriteTransaction,
    definition: ObjectTable,
    key: &str,
    object: &T,
) -> StateResult<()> {
    let value = serde_json::to_vec(object).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(definition).map_err(map_err!(Table))?;
    table
        .insert(key, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn remove_in(txn: &WriteTransaction, definition: ObjectTable, key: &str) -> StateResult<()> {
    let mut table = txn.open_table(definition).map_err(map_err!(Table))?;
    table.remove(key).map_err(map_err!(Write))?;
    Ok(())
}

fn next_resource_version(txn: &WriteTransaction) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(RESOURCE_VERSION_KEY)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(RESOURCE_VERSION_KEY, next)
        .map_err(map_err!(Write))?;
    Ok(next)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Stamp store-owned metadata on a newly created object.
fn init_meta(meta: &mut ObjectMeta) {
    meta.uid = Uuid::new_v4().to_string();
    meta.generation = 1;
    meta.creation_timestamp = epoch_secs();
    meta.deletion_timestamp = None;
}

fn validate_namespaced(key: &ObjectKey) -> StateResult<()> {
    if key.namespace.is_empty() || key.name.is_empty() {
        return Err(StateError::Invalid(format!(
            "namespaced object needs a namespace and a name, got {key:?}"
        )));
    }
    if key.namespace.contains(KEY_SEPARATOR) || key.name.contains(KEY_SEPARATOR) {
        return Err(StateError::Invalid(format!(
            "namespace and name must not contain {KEY_SEPARATOR:?}, got {key:?}"
        )));
    }
    Ok(())
}

/// Conditional write: zero means "any version".
fn check_version(key: &ObjectKey, expected: u64, current: &ObjectMeta) -> StateResult<()> {
    if expected == 0 {
        return Ok(());
    }
    check_exact_version(key, expected, current)
}

fn check_exact_version(key: &ObjectKey, expected: u64, current: &ObjectMeta) -> StateResult<()> {
    if expected != current.resource_version {
        return Err(StateError::Conflict(format!(
            "{key}: resource version {expected} is stale (current {})",
            current.resource_version
        )));
    }
    Ok(())
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..GENERATED_SUFFIX_LEN].to_string()
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::LabelSelector;

    fn test_set(namespace: &str, name: &str, replicas: i32) -> MachineSet {
        let mut spec = MachineSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector::from_labels([("pool", name)]),
            ..Default::default()
        };
        spec.template
            .metadata
            .labels
            .insert("pool".to_string(), name.to_string());
        MachineSet::new(namespace, name, spec)
    }

    fn test_machine(namespace: &str, name: &str) -> Machine {
        let mut machine = Machine::new(namespace, name);
        machine
            .metadata
            .labels
            .insert("pool".to_string(), "workers".to_string());
        machine
    }

    // ── MachineSet ─────────────────────────────────────────────────

    #[test]
    fn machine_set_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.put_machine_set(&test_set("default", "workers", 2)).unwrap();

        assert!(!stored.metadata.uid.is_empty());
        assert_eq!(stored.metadata.generation, 1);
        assert!(stored.metadata.resource_version > 0);

        let retrieved = store
            .get_machine_set(&ObjectKey::new("default", "workers"))
            .unwrap();
        assert_eq!(retrieved, Some(stored));
    }

    #[test]
    fn machine_set_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        let result = store.get_machine_set(&ObjectKey::new("nope", "nothing")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn machine_set_generation_tracks_spec_changes() {
        let store = StateStore::open_in_memory().unwrap();
        let first = store.put_machine_set(&test_set("default", "workers", 2)).unwrap();

        // Same spec: generation unchanged, uid preserved.
        let mut same = test_set("default", "workers", 2);
        same.metadata.labels.insert("team".into(), "infra".into());
        let second = store.put_machine_set(&same).unwrap();
        assert_eq!(second.metadata.generation, 1);
        assert_eq!(second.metadata.uid, first.metadata.uid);
        assert!(second.metadata.resource_version > first.metadata.resource_version);

        let third = store.put_machine_set(&test_set("default", "workers", 5)).unwrap();
        assert_eq!(third.metadata.generation, 2);
    }

    #[test]
    fn machine_set_put_preserves_status() {
        let store = StateStore::open_in_memory().unwrap();
        let mut stored = store.put_machine_set(&test_set("default", "workers", 2)).unwrap();
        stored.status.replicas = 2;
        store.update_machine_set_status(&stored).unwrap();

        let reapplied = store.put_machine_set(&test_set("default", "workers", 3)).unwrap();
        assert_eq!(reapplied.status.replicas, 2);
    }

    #[test]
    fn machine_set_status_update_detects_conflict() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.put_machine_set(&test_set("default", "workers", 2)).unwrap();

        let mut first = stored.clone();
        first.status.replicas = 1;
        store.update_machine_set_status(&first).unwrap();

        let mut stale = stored;
        stale.status.replicas = 7;
        let err = store.update_machine_set_status(&stale).unwrap_err();
        assert!(err.is_conflict());

        let current = store
            .get_machine_set(&ObjectKey::new("default", "workers"))
            .unwrap()
            .unwrap();
        assert_eq!(current.status.replicas, 1);
    }

    #[test]
    fn machine_set_status_update_on_missing_set_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .update_machine_set_status(&test_set("default", "ghost", 1))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn machine_set_list_by_namespace() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_machine_set(&test_set("ns1", "a", 1)).unwrap();
        store.put_machine_set(&test_set("ns1", "b", 1)).unwrap();
        store.put_machine_set(&test_set("ns10", "c", 1)).unwrap();

        assert_eq!(store.list_machine_sets(Some("ns1")).unwrap().len(), 2);
        assert_eq!(store.list_machine_sets(Some("ns10")).unwrap().len(), 1);
        assert_eq!(store.list_machine_sets(None).unwrap().len(), 3);
    }

    #[test]
    fn namespaced_objects_need_namespace() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.put_machine_set(&test_set("", "a", 1)).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
    }

    #[test]
    fn separator_in_namespace_or_name_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_machine_set(&test_set("a", "w", 1)).unwrap();

        let err = store.create_machine(&test_machine("a/b", "m1")).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        let err = store.create_machine(&test_machine("a", "b/m1")).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        let err = store.put_machine_set(&test_set("a/b", "w", 1)).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
        let err = store.put_node(&Node::new("rack/1")).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));

        let mut generated = test_machine("a", "");
        generated.metadata.generate_name = Some("w/".to_string());
        let err = store.create_machine(&generated).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));

        assert!(store.list_machines(Some("a")).unwrap().is_empty());
        assert!(store.list_machines(None).unwrap().is_empty());
        assert_eq!(store.list_machine_sets(Some("a")).unwrap().len(), 1);
    }

    #[test]
    fn deleting_a_set_leaves_its_machines() {
        let store = StateStore::open_in_memory().unwrap();
        let set = store.put_machine_set(&test_set("default", "workers", 1)).unwrap();
        let mut machine = test_machine("default", "m1");
        machine.metadata.owner_references.push(OwnerReference {
            kind: MACHINE_SET_KIND.to_string(),
            name: "workers".to_string(),
            uid: set.metadata.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
            ..Default::default()
        });
        store.create_machine(&machine).unwrap();

        store.delete_machine_set(&set.metadata.key(), None).unwrap();
        assert!(store.get_machine_set(&set.metadata.key()).unwrap().is_none());
        let orphaned = store.list_machines(Some("default")).unwrap();
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].metadata.owner_references[0].uid, set.metadata.uid);
    }

    #[test]
    fn namespace_listing_only_returns_that_namespace() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_machine(&test_machine("a", "m1")).unwrap();
        store.create_machine(&test_machine("ab", "m2")).unwrap();

        // A row written under a colliding key is still attributed by its own namespace.
        let mut stray = test_machine("a/b", "m3");
        stray.metadata.uid = "stray".to_string();
        store
            .write(|txn| insert_in(txn, MACHINES, "a/b/m3", &stray))
            .unwrap();

        let names: Vec<String> = store
            .list_machines(Some("a"))
            .unwrap()
            .into_iter()
            .map(|m| m.metadata.name)
            .collect();
        assert_eq!(names, ["m1"]);
        assert_eq!(store.list_machines(None).unwrap().len(), 3);
    }

    // ── Machine ────────────────────────────────────────────────────

    #[test]
    fn machine_create_generates_name() {
        let store = StateStore::open_in_memory().unwrap();
        let mut machine = test_machine("default", "");
        machine.metadata.generate_name = Some("workers-".to_string());

        let created = store.create_machine(&machine).unwrap();
        assert!(created.metadata.name.starts_with("workers-"));
        assert_eq!(created.metadata.name.len(), "workers-".len() + GENERATED_SUFFIX_LEN);
        assert!(!created.metadata.uid.is_empty());
        assert!(created.metadata.creation_timestamp > 0);
    }

    #[test]
    fn machine_create_without_name_is_invalid() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.create_machine(&test_machine("default", "")).unwrap_err();
        assert!(matches!(err, StateError::Invalid(_)));
    }

    #[test]
    fn machine_create_duplicate_is_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_machine(&test_machine("default", "m1")).unwrap();
        let err = store.create_machine(&test_machine("default", "m1")).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn machine_create_ignores_caller_supplied_deletion_timestamp() {
        let store = StateStore::open_in_memory().unwrap();
        let mut machine = test_machine("default", "m1");
        machine.metadata.deletion_timestamp = Some(5);
        let created = store.create_machine(&machine).unwrap();
        assert!(!created.metadata.is_terminating());
    }

    #[test]
    fn machine_patch_owner_references_with_version_check() {
        let store = StateStore::open_in_memory().unwrap();
        let created = store.create_machine(&test_machine("default", "m1")).unwrap();
        let key = created.metadata.key();

        let owner = OwnerReference {
            api_version: GROUP_VERSION.into(),
            kind: MACHINE_SET_KIND.into(),
            name: "workers".into(),
            uid: "set-uid".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let patch = MachinePatch {
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        };

        let patched = store
            .patch_machine(&key, Some(created.metadata.resource_version), patch.clone())
            .unwrap();
        assert_eq!(patched.metadata.owner_references, vec![owner]);
        // Labels untouched by a partial patch.
        assert_eq!(patched.metadata.labels, created.metadata.labels);

        let err = store
            .patch_machine(&key, Some(created.metadata.resource_version), patch)
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn machine_patch_missing_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store
            .patch_machine(&ObjectKey::new("default", "ghost"), None, MachinePatch::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn machine_delete_without_finalizers_removes() {
        let store = StateStore::open_in_memory().unwrap();
        let created = store.create_machine(&test_machine("default", "m1")).unwrap();
        let key = created.metadata.key();

        store.delete_machine(&key, Some(&created.metadata.uid)).unwrap();
        assert!(store.get_machine(&key).unwrap().is_none());
        assert!(store.delete_machine(&key, None).unwrap_err().is_not_found());
    }

    #[test]
    fn machine_delete_with_finalizers_is_two_phase() {
        let store = StateStore::open_in_memory().unwrap();
        let mut machine = test_machine("default", "m1");
        machine.metadata.finalizers.push("infra.fleetset.dev".into());
        let created = store.create_machine(&machine).unwrap();
        let key = created.metadata.key();

        store.delete_machine(&key, None).unwrap();
        let terminating = store.get_machine(&key).unwrap().unwrap();
        assert!(terminating.metadata.is_terminating());

        // A second delete is a no-op.
        store.delete_machine(&key, None).unwrap();
        let again = store.get_machine(&key).unwrap().unwrap();
        assert_eq!(again.metadata.resource_version, terminating.metadata.resource_version);

        // Removing the finalizer completes the deletion.
        store
            .patch_machine(
                &key,
                None,
                MachinePatch {
                    finalizers: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(store.get_machine(&key).unwrap().is_none());
    }

    #[test]
    fn machine_delete_uid_precondition() {
        let store = StateStore::open_in_memory().unwrap();
        let created = store.create_machine(&test_machine("default", "m1")).unwrap();
        let err = store
            .delete_machine(&created.metadata.key(), Some("someone-else"))
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store.get_machine(&created.metadata.key()).unwrap().is_some());
    }

    #[test]
    fn machine_status_update() {
        let store = StateStore::open_in_memory().unwrap();
        let mut machine = store.create_machine(&test_machine("default", "m1")).unwrap();
        machine.status.node_ref = Some(ObjectReference {
            kind: NODE_KIND.into(),
            name: "node-1".into(),
            ..Default::default()
        });
        let updated = store.update_machine_status(&machine).unwrap();
        assert_eq!(updated.status.node_ref.unwrap().name, "node-1");

        // The old version is now stale.
        assert!(store.update_machine_status(&machine).unwrap_err().is_conflict());
    }

    // ── Node ───────────────────────────────────────────────────────

    #[test]
    fn node_put_get_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let stored = store.put_node(&Node::new("node-1")).unwrap();
        assert!(!stored.metadata.uid.is_empty());

        let updated = store.put_node(&Node::new("node-1")).unwrap();
        assert_eq!(updated.metadata.uid, stored.metadata.uid);

        assert_eq!(store.list_nodes().unwrap().len(), 1);
        assert!(store.get_node("node-1").unwrap().is_some());

        store.delete_node("node-1").unwrap();
        assert!(store.get_node("node-1").unwrap().is_none());
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn writes_publish_events() {
        let store = StateStore::open_in_memory().unwrap();
        let mut events = store.subscribe();

        store.put_machine_set(&test_set("default", "workers", 1)).unwrap();
        let created = store.create_machine(&test_machine("default", "m1")).unwrap();
        store.delete_machine(&created.metadata.key(), None).unwrap();

        let first = events.try_recv().unwrap();
        assert!(matches!(first, StoreEvent::MachineSet { action: EventAction::Applied, .. }));
        let second = events.try_recv().unwrap();
        assert!(matches!(second, StoreEvent::Machine { action: EventAction::Applied, .. }));
        let third = events.try_recv().unwrap();
        assert_eq!(third.action(), EventAction::Deleted);
        assert_eq!(third.key(), ObjectKey::new("default", "m1"));
    }

    #[test]
    fn failed_writes_publish_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        store.create_machine(&test_machine("default", "m1")).unwrap();
        let mut events = store.subscribe();

        assert!(store.create_machine(&test_machine("default", "m1")).is_err());
        assert!(events.try_recv().is_err());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        let version = {
            let store = StateStore::open(&db_path).unwrap();
            store.put_machine_set(&test_set("prod", "workers", 3)).unwrap();
            store.create_machine(&test_machine("prod", "m1")).unwrap().metadata.resource_version
        };

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let set = store.get_machine_set(&ObjectKey::new("prod", "workers")).unwrap();
        assert_eq!(set.unwrap().desired_replicas(), 3);

        // Resource versions keep increasing across restarts.
        let next = store.create_machine(&test_machine("prod", "m2")).unwrap();
        assert!(next.metadata.resource_version > version);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_machine_sets(None).unwrap().is_empty());
        assert!(store.list_machines(Some("any")).unwrap().is_empty());
        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.delete_node("nope").unwrap_err().is_not_found());
    }
}
