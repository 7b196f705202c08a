//! MachineSet manifests on disk.
//!
//! A manifest is a single `MachineSet` in TOML (`.toml`) or JSON (`.json`).
//! Store-owned metadata in a manifest (uid, versions, status) is ignored on
//! apply.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use tracing::debug;

use fleetset_state::{MachineSet, MachineSetStatus, StateStore};

/// Namespace assumed when a manifest leaves it empty.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Parse one manifest file.
pub fn load(path: &Path) -> anyhow::Result<MachineSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let set = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("parsing TOML manifest {}", path.display()))?,
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("parsing JSON manifest {}", path.display()))?,
        _ => bail!("unsupported manifest format: {}", path.display()),
    };
    Ok(set)
}

/// Parse every `.toml` and `.json` file in `dir`, in file-name order.
pub fn load_dir(dir: &Path) -> anyhow::Result<Vec<MachineSet>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading manifest directory {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    paths.retain(|p| {
        p.is_file() && matches!(p.extension().and_then(|e| e.to_str()), Some("toml" | "json"))
    });
    paths.sort();

    paths.iter().map(|p| load(p)).collect()
}

/// Create or update the set described by a manifest.
pub fn apply(store: &StateStore, mut set: MachineSet) -> anyhow::Result<MachineSet> {
    if set.metadata.namespace.is_empty() {
        set.metadata.namespace = DEFAULT_NAMESPACE.to_string();
    }
    set.metadata.resource_version = 0;
    set.status = MachineSetStatus::default();

    let stored = store.put_machine_set(&set)?;
    debug!(
        set = %stored.metadata.key(),
        generation = stored.metadata.generation,
        "manifest applied"
    );
    Ok(stored)
}
