//! Maps a changed machine to the machine sets that should look at it.

use tracing::debug;

use fleetset_state::{MACHINE_SET_KIND, Machine, ObjectKey};

use crate::client::FleetClient;
use crate::error::ControllerResult;

/// Which sets care about a machine change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitMapping {
    /// The machine has a machine-set controller; its owner is triggered
    /// directly, so no selector lookup is needed.
    Owned,
    /// No set's selector matches the machine.
    Unmatched,
    /// Sets whose selectors match the machine and may adopt it.
    Matched(Vec<ObjectKey>),
}

impl UnitMapping {
    /// Keys to enqueue; both empty outcomes collapse to nothing.
    pub fn into_keys(self) -> Vec<ObjectKey> {
        match self {
            UnitMapping::Matched(keys) => keys,
            UnitMapping::Owned | UnitMapping::Unmatched => Vec::new(),
        }
    }
}

/// Find the sets in `machine`'s namespace that should reconcile because of
/// a change to it.
pub async fn map_unit_to_sets<C: FleetClient>(
    client: &C,
    machine: &Machine,
) -> ControllerResult<UnitMapping> {
    if machine
        .metadata
        .controller_ref()
        .is_some_and(|owner| owner.kind == MACHINE_SET_KIND)
    {
        return Ok(UnitMapping::Owned);
    }

    let sets = client
        .list_machine_sets(Some(&machine.metadata.namespace))
        .await?;
    let keys: Vec<ObjectKey> = sets
        .iter()
        .filter(|set| set.spec.selector.matches(&machine.metadata.labels))
        .map(|set| set.metadata.key())
        .collect();

    debug!(machine = %machine.metadata.key(), matches = keys.len(), "mapped machine to sets");
    if keys.is_empty() {
        Ok(UnitMapping::Unmatched)
    } else {
        Ok(UnitMapping::Matched(keys))
    }
}
