//! Shared builders for unit tests.

use fleetset_state::*;

pub const NAMESPACE: &str = "default";

pub fn store() -> StateStore {
    StateStore::open_in_memory().unwrap()
}

/// A set selecting `pool=<name>` whose template carries the same label.
pub fn machine_set(name: &str, replicas: i32) -> MachineSet {
    let mut spec = MachineSetSpec {
        replicas: Some(replicas),
        selector: LabelSelector::from_labels([("pool", name)]),
        ..Default::default()
    };
    spec.template
        .metadata
        .labels
        .insert("pool".to_string(), name.to_string());
    spec.template.spec.version = Some("v1.30.0".to_string());
    MachineSet::new(NAMESPACE, name, spec)
}

pub fn stored_set(store: &StateStore, name: &str, replicas: i32) -> MachineSet {
    store.put_machine_set(&machine_set(name, replicas)).unwrap()
}

/// An unowned machine labelled `pool=<pool>`.
pub fn machine(name: &str, pool: &str) -> Machine {
    let mut machine = Machine::new(NAMESPACE, name);
    machine
        .metadata
        .labels
        .insert("pool".to_string(), pool.to_string());
    machine
}

pub fn owned_machine(set: &MachineSet, name: &str) -> Machine {
    let mut machine = machine(name, &set.metadata.name);
    machine
        .metadata
        .owner_references
        .push(crate::ownership::controller_ref_for(set));
    machine
}

pub fn foreign_ref(name: &str) -> OwnerReference {
    OwnerReference {
        api_version: GROUP_VERSION.to_string(),
        kind: MACHINE_SET_KIND.to_string(),
        name: name.to_string(),
        uid: format!("{name}-uid"),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn node_ref(node: &str) -> ObjectReference {
    ObjectReference {
        kind: NODE_KIND.to_string(),
        name: node.to_string(),
        ..Default::default()
    }
}

/// A node whose `Ready` condition turned true at `since`.
pub fn ready_node(name: &str, since: u64) -> Node {
    let mut node = Node::new(name);
    let mut ready = Condition::new(NODE_READY, ConditionStatus::True);
    ready.last_transition_time = since;
    node.status.conditions.push(ready);
    node
}
