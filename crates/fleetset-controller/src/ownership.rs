//! Ownership classification and orphan adoption.
//!
//! Ownership is never stored on the controller side; it is derived from a
//! machine's owner references every time it is needed, so a stale cache can
//! never make two sets believe they own the same machine.

use tracing::debug;

use fleetset_state::{
    GROUP_VERSION, MACHINE_KIND, MACHINE_SET_KIND, Machine, MachineSet, ObjectKey, OwnerReference,
};

use crate::client::FleetClient;
use crate::error::{ControllerError, ControllerResult};
use crate::retry::retry_on_conflict;

/// How a machine relates to a given machine set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// No controller owner; eligible for adoption if the selector matches.
    Orphan,
    /// Controlled by this set.
    Owned,
    /// Controlled by something else.
    Foreign,
}

pub fn classify(set: &MachineSet, machine: &Machine) -> Ownership {
    match machine.metadata.controller_ref() {
        None => Ownership::Orphan,
        Some(owner) if owner.kind == MACHINE_SET_KIND && owner.uid == set.metadata.uid => {
            Ownership::Owned
        }
        Some(_) => Ownership::Foreign,
    }
}

/// Whether `machine` must be left out of `set`'s membership regardless of
/// its labels: it is terminating, or another controller owns it.
pub fn should_exclude(set: &MachineSet, machine: &Machine) -> bool {
    machine.metadata.is_terminating() || classify(set, machine) == Ownership::Foreign
}

/// The controller owner reference `set` stamps on the machines it manages.
pub fn controller_ref_for(set: &MachineSet) -> OwnerReference {
    OwnerReference {
        api_version: GROUP_VERSION.to_string(),
        kind: MACHINE_SET_KIND.to_string(),
        name: set.metadata.name.clone(),
        uid: set.metadata.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Make `set` the controller of an orphaned `machine`.
///
/// The owner-reference list is patched against the machine's resource
/// version. On conflict the machine is reloaded and re-checked before the
/// next attempt. Returns `None` when the reloaded machine no longer belongs
/// to `set` (labels changed, terminating, or claimed by another owner), and
/// the adopted machine otherwise.
pub async fn adopt_orphan<C: FleetClient>(
    client: &C,
    set: &MachineSet,
    machine: &Machine,
    attempts: u32,
) -> ControllerResult<Option<Machine>> {
    let key = machine.metadata.key();
    retry_on_conflict(attempts, |attempt| {
        adopt_attempt(client, set, machine, &key, attempt)
    })
    .await
}

async fn adopt_attempt<C: FleetClient>(
    client: &C,
    set: &MachineSet,
    machine: &Machine,
    key: &ObjectKey,
    attempt: u32,
) -> ControllerResult<Option<Machine>> {
    let current = if attempt == 0 {
        machine.clone()
    } else {
        client
            .get_machine(key)
            .await?
            .ok_or_else(|| ControllerError::not_found(MACHINE_KIND, key))?
    };

    if current.metadata.is_terminating() || !set.spec.selector.matches(&current.metadata.labels) {
        debug!(machine = %key, "machine no longer a candidate for adoption");
        return Ok(None);
    }
    match classify(set, &current) {
        Ownership::Owned => return Ok(Some(current)),
        Ownership::Foreign => {
            debug!(machine = %key, "machine claimed by another controller");
            return Ok(None);
        }
        Ownership::Orphan => {}
    }

    let mut owners = current.metadata.owner_references.clone();
    owners.push(controller_ref_for(set));
    let adopted = client
        .patch_machine_owners(key, current.metadata.resource_version, owners)
        .await?;
    debug!(set = %set.metadata.key(), machine = %key, "adopted orphan");
    Ok(Some(adopted))
}

#[cfg(test)]
mod tests {
    use fleetset_state::{MachinePatch, StateStore};

    use super::*;
    use crate::fixtures::*;

    #[test]
    fn classify_by_controller_reference() {
        let set = {
            let mut set = machine_set("workers", 1);
            set.metadata.uid = "workers-uid".into();
            set
        };

        assert_eq!(classify(&set, &machine("m1", "workers")), Ownership::Orphan);
        assert_eq!(classify(&set, &owned_machine(&set, "m2")), Ownership::Owned);

        let mut foreign = machine("m3", "workers");
        foreign.metadata.owner_references.push(foreign_ref("other"));
        assert_eq!(classify(&set, &foreign), Ownership::Foreign);

        // Same UID but a different kind is still someone else.
        let mut wrong_kind = machine("m4", "workers");
        let mut owner = controller_ref_for(&set);
        owner.kind = "MachineDeployment".into();
        wrong_kind.metadata.owner_references.push(owner);
        assert_eq!(classify(&set, &wrong_kind), Ownership::Foreign);

        // A non-controller owner does not claim the machine.
        let mut shared = machine("m5", "workers");
        let mut owner = foreign_ref("other");
        owner.controller = None;
        shared.metadata.owner_references.push(owner);
        assert_eq!(classify(&set, &shared), Ownership::Orphan);
    }

    #[test]
    fn exclusion_rules() {
        let mut set = machine_set("workers", 1);
        set.metadata.uid = "workers-uid".into();

        assert!(!should_exclude(&set, &machine("m1", "workers")));
        assert!(!should_exclude(&set, &owned_machine(&set, "m2")));

        let mut terminating = owned_machine(&set, "m3");
        terminating.metadata.deletion_timestamp = Some(100);
        assert!(should_exclude(&set, &terminating));

        let mut foreign = machine("m4", "workers");
        foreign.metadata.owner_references.push(foreign_ref("other"));
        assert!(should_exclude(&set, &foreign));
    }

    #[test]
    fn controller_ref_blocks_owner_deletion() {
        let mut set = machine_set("workers", 1);
        set.metadata.uid = "workers-uid".into();
        let owner = controller_ref_for(&set);
        assert_eq!(owner.api_version, GROUP_VERSION);
        assert_eq!(owner.kind, MACHINE_SET_KIND);
        assert_eq!(owner.name, "workers");
        assert_eq!(owner.uid, "workers-uid");
        assert!(owner.is_controller());
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    fn set_foreign_owner(store: &StateStore, key: &ObjectKey) {
        store
            .patch_machine(
                key,
                None,
                MachinePatch {
                    owner_references: Some(vec![foreign_ref("other")]),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn adopts_orphan_in_place() {
        let store = store();
        let set = stored_set(&store, "workers", 1);
        let orphan = store.create_machine(&machine("m1", "workers")).unwrap();

        let adopted = adopt_orphan(&store, &set, &orphan, 3).await.unwrap().unwrap();
        assert_eq!(adopted.metadata.uid, orphan.metadata.uid);
        assert_eq!(classify(&set, &adopted), Ownership::Owned);
        let owner = adopted.metadata.controller_ref().unwrap();
        assert_eq!(owner.block_owner_deletion, Some(true));

        let stored = store.get_machine(&orphan.metadata.key()).unwrap().unwrap();
        assert_eq!(stored.metadata.owner_references, adopted.metadata.owner_references);
    }

    #[tokio::test]
    async fn retries_after_conflict() {
        let store = store();
        let set = stored_set(&store, "workers", 1);
        let stale = store.create_machine(&machine("m1", "workers")).unwrap();

        // A concurrent writer bumps the version without changing ownership.
        let mut annotations = stale.metadata.annotations.clone();
        annotations.insert("touched".into(), "yes".into());
        store
            .patch_machine(
                &stale.metadata.key(),
                None,
                MachinePatch {
                    annotations: Some(annotations),
                    ..Default::default()
                },
            )
            .unwrap();

        let adopted = adopt_orphan(&store, &set, &stale, 3).await.unwrap().unwrap();
        assert_eq!(classify(&set, &adopted), Ownership::Owned);
        assert_eq!(adopted.metadata.annotations["touched"], "yes");
    }

    #[tokio::test]
    async fn backs_off_when_claimed_concurrently() {
        let store = store();
        let set = stored_set(&store, "workers", 1);
        let stale = store.create_machine(&machine("m1", "workers")).unwrap();
        set_foreign_owner(&store, &stale.metadata.key());

        let result = adopt_orphan(&store, &set, &stale, 3).await.unwrap();
        assert!(result.is_none());

        let stored = store.get_machine(&stale.metadata.key()).unwrap().unwrap();
        assert_eq!(stored.metadata.owner_references, vec![foreign_ref("other")]);
    }

    #[tokio::test]
    async fn exhausted_conflicts_are_reported() {
        let store = store();
        let set = stored_set(&store, "workers", 1);
        let stale = store.create_machine(&machine("m1", "workers")).unwrap();
        set_foreign_owner(&store, &stale.metadata.key());

        // A single attempt never gets to reload.
        let err = adopt_orphan(&store, &set, &stale, 1).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn vanished_machine_is_not_found() {
        let store = store();
        let set = stored_set(&store, "workers", 1);
        let created = store.create_machine(&machine("m1", "workers")).unwrap();
        store.delete_machine(&created.metadata.key(), None).unwrap();

        let err = adopt_orphan(&store, &set, &created, 3).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
