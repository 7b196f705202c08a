//! redb table definitions for the fleetset state store.
//!
//! Object tables use `&str` keys and `&[u8]` values (JSON-serialized objects).
//! Namespaced keys follow the pattern `{namespace}/{name}`.

use redb::TableDefinition;

/// Shape shared by every object table.
pub type ObjectTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Machine sets keyed by `{namespace}/{name}`.
pub const MACHINE_SETS: ObjectTable = TableDefinition::new("machine_sets");

/// Machines keyed by `{namespace}/{name}`.
pub const MACHINES: ObjectTable = TableDefinition::new("machines");

/// Nodes keyed by `{name}` (cluster-scoped).
pub const NODES: ObjectTable = TableDefinition::new("nodes");

/// Store-wide counters.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the last issued resource version.
pub const RESOURCE_VERSION_KEY: &str = "resource_version";
