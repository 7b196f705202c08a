//! The persistence interface the controller reconciles against.
//!
//! Every call is a suspension point; the controller never holds a lock
//! across one. Writes are version- or UID-checked so concurrent writers
//! surface as [`StateError::Conflict`](fleetset_state::StateError::Conflict)
//! rather than lost updates.

use std::future::Future;

use fleetset_state::{
    Machine, MachinePatch, MachineSet, Node, ObjectKey, OwnerReference, StateResult, StateStore,
};

pub trait FleetClient: Send + Sync {
    fn get_machine_set(
        &self,
        key: &ObjectKey,
    ) -> impl Future<Output = StateResult<Option<MachineSet>>> + Send;

    fn get_machine(&self, key: &ObjectKey)
    -> impl Future<Output = StateResult<Option<Machine>>> + Send;

    fn list_machine_sets(
        &self,
        namespace: Option<&str>,
    ) -> impl Future<Output = StateResult<Vec<MachineSet>>> + Send;

    fn list_machines(
        &self,
        namespace: Option<&str>,
    ) -> impl Future<Output = StateResult<Vec<Machine>>> + Send;

    fn list_nodes(&self) -> impl Future<Output = StateResult<Vec<Node>>> + Send;

    /// Create a machine; an empty name is generated from `generate_name`.
    fn create_machine(
        &self,
        machine: &Machine,
    ) -> impl Future<Output = StateResult<Machine>> + Send;

    /// Delete a machine, only if its UID still equals `uid` when given.
    fn delete_machine(
        &self,
        key: &ObjectKey,
        uid: Option<&str>,
    ) -> impl Future<Output = StateResult<()>> + Send;

    /// Replace a machine's owner references, only if it is still at
    /// `resource_version`.
    fn patch_machine_owners(
        &self,
        key: &ObjectKey,
        resource_version: u64,
        owner_references: Vec<OwnerReference>,
    ) -> impl Future<Output = StateResult<Machine>> + Send;

    /// Write the status sub-resource, only if the set is still at its
    /// `resource_version`.
    fn update_machine_set_status(
        &self,
        set: &MachineSet,
    ) -> impl Future<Output = StateResult<MachineSet>> + Send;
}

impl FleetClient for StateStore {
    async fn get_machine_set(&self, key: &ObjectKey) -> StateResult<Option<MachineSet>> {
        StateStore::get_machine_set(self, key)
    }

    async fn get_machine(&self, key: &ObjectKey) -> StateResult<Option<Machine>> {
        StateStore::get_machine(self, key)
    }

    async fn list_machine_sets(&self, namespace: Option<&str>) -> StateResult<Vec<MachineSet>> {
        StateStore::list_machine_sets(self, namespace)
    }

    async fn list_machines(&self, namespace: Option<&str>) -> StateResult<Vec<Machine>> {
        StateStore::list_machines(self, namespace)
    }

    async fn list_nodes(&self) -> StateResult<Vec<Node>> {
        StateStore::list_nodes(self)
    }

    async fn create_machine(&self, machine: &Machine) -> StateResult<Machine> {
        StateStore::create_machine(self, machine)
    }

    async fn delete_machine(&self, key: &ObjectKey, uid: Option<&str>) -> StateResult<()> {
        StateStore::delete_machine(self, key, uid)
    }

    async fn patch_machine_owners(
        &self,
        key: &ObjectKey,
        resource_version: u64,
        owner_references: Vec<OwnerReference>,
    ) -> StateResult<Machine> {
        let patch = MachinePatch {
            owner_references: Some(owner_references),
            ..Default::default()
        };
        StateStore::patch_machine(self, key, Some(resource_version), patch)
    }

    async fn update_machine_set_status(&self, set: &MachineSet) -> StateResult<MachineSet> {
        StateStore::update_machine_set_status(self, set)
    }
}
