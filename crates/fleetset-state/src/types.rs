//! Object model for fleetset.
//!
//! A [`MachineSet`] declares "N identical machines"; a [`Machine`] is one
//! managed compute instance; a [`Node`] is the running host a machine is
//! eventually attached to. All types are serializable to/from JSON for
//! storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::selector::LabelSelector;

/// API group/version stamped into owner references.
pub const GROUP_VERSION: &str = "fleetset.dev/v1alpha1";

pub const MACHINE_SET_KIND: &str = "MachineSet";
pub const MACHINE_KIND: &str = "Machine";
pub const NODE_KIND: &str = "Node";

/// Label stamped on every machine a set creates, naming the set.
pub const SET_NAME_LABEL: &str = "fleetset.dev/set-name";

/// Annotation that marks a machine as the preferred scale-down victim.
pub const DELETE_MACHINE_ANNOTATION: &str = "fleetset.dev/delete-machine";

/// Node condition reporting that the node is ready for workloads.
pub const NODE_READY: &str = "Ready";

/// Set condition reporting whether the spec passed validation.
pub const SPEC_VALID: &str = "SpecValid";

/// Set condition reporting failed machine creations or deletions.
pub const REPLICA_FAILURE: &str = "ReplicaFailure";

pub type Labels = BTreeMap<String, String>;

// ── Metadata ──────────────────────────────────────────────────────

/// Namespace + name of an object. Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the composite key used in redb tables.
    pub fn table_key(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.namespace, self.name)
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.table_key())
    }
}

/// Metadata common to every stored object.
///
/// `uid`, `resource_version`, `generation` and `creation_timestamp` are
/// owned by the store; values supplied by callers on create are replaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    /// Prefix for a store-generated name when `name` is empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    pub uid: String,
    pub resource_version: u64,
    /// Incremented by the store whenever a set's spec changes.
    pub generation: u64,
    /// Unix timestamp (seconds) when the object was created.
    pub creation_timestamp: u64,
    /// Unix timestamp (seconds) when deletion was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<u64>,
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
    /// Pending cleanup hooks; an object with finalizers is only marked for
    /// deletion until they are removed.
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// The owner reference flagged as controller, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.is_controller())
    }
}

/// Reference from a dependent object to its owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    pub fn is_controller(&self) -> bool {
        self.controller == Some(true)
    }
}

/// Opaque pointer to another object, possibly of a kind this crate does not model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectReference {
    pub api_version: String,
    pub kind: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

// ── Conditions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// An observation about an object, keyed by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix timestamp (seconds) of the last status flip.
    #[serde(default)]
    pub last_transition_time: u64,
}

impl Condition {
    pub fn new(type_: &str, status: ConditionStatus) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: None,
            message: None,
            last_transition_time: 0,
        }
    }

    pub fn with_reason(mut self, reason: &str, message: impl Into<String>) -> Self {
        self.reason = Some(reason.to_string());
        self.message = Some(message.into());
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Insert or replace a condition. The transition time only moves when the
/// status actually changes, so re-asserting a condition is a no-op.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: u64) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time
            } else {
                now
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = now;
            conditions.push(condition);
        }
    }
}

pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

// ── MachineSet ────────────────────────────────────────────────────

/// Desired state: `replicas` machines stamped from `template`, tracked by `selector`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSet {
    pub metadata: ObjectMeta,
    pub spec: MachineSetSpec,
    #[serde(default)]
    pub status: MachineSetStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSetSpec {
    /// Desired machine count; `None` means 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Seconds a machine's node must have been ready before it counts as available.
    pub min_ready_seconds: u32,
    pub delete_policy: DeletePolicy,
    pub selector: LabelSelector,
    pub template: MachineTemplateSpec,
}

/// Tie-break order among equally preferred scale-down victims.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletePolicy {
    /// Delete the oldest machines first.
    #[default]
    Oldest,
    /// Delete the most recently created machines first.
    Newest,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineTemplateSpec {
    pub metadata: TemplateMeta,
    pub spec: MachineSpec,
}

/// Labels and annotations copied onto every created machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateMeta {
    pub labels: Labels,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSetStatus {
    pub replicas: u32,
    /// Machines whose labels contain every template label.
    pub fully_labeled_replicas: u32,
    pub ready_replicas: u32,
    pub available_replicas: u32,
    pub observed_generation: u64,
    pub conditions: Vec<Condition>,
}

impl MachineSet {
    pub fn new(namespace: &str, name: &str, spec: MachineSetSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: MachineSetStatus::default(),
        }
    }

    /// Desired replica count, with the absent case defaulted to 1.
    pub fn desired_replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }
}

// ── Machine ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSpec {
    /// Kubelet/agent version to run on the node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub bootstrap: Bootstrap,
    /// Infrastructure resource backing this machine; opaque to the controller.
    pub infrastructure_ref: ObjectReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bootstrap {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineStatus {
    /// Set by the node-attachment collaborator once the node has joined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,
    pub conditions: Vec<Condition>,
}

impl Machine {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            ..Default::default()
        }
    }
}

// ── Node ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeStatus {
    pub conditions: Vec<Condition>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: ObjectMeta::new("", name),
            status: NodeStatus::default(),
        }
    }

    /// When the node became ready, if its `Ready` condition is currently true.
    pub fn ready_since(&self) -> Option<u64> {
        find_condition(&self.status.conditions, NODE_READY)
            .filter(|c| c.is_true())
            .map(|c| c.last_transition_time)
    }
}
