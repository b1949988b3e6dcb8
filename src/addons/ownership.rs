//! Folder ownership safety.
//!
//! Pure set computation deciding which folders a deletion may touch. Every
//! destructive path in the engine filters its candidates through
//! [`partition`] first.

use std::collections::BTreeSet;

use super::types::{AddonId, InstalledAddon};

/// Candidate folders split into what may go and what must stay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderPlan {
    /// Present on disk and owned by nothing outside the deletion set.
    pub deletable: BTreeSet<String>,
    /// Candidates still declared by an add-on outside the deletion set.
    pub protected: BTreeSet<String>,
}

/// Folders declared by installed add-ons outside `deletion_set`.
#[must_use]
pub fn protected_folders<'a>(
    installed: impl IntoIterator<Item = &'a InstalledAddon>,
    deletion_set: &BTreeSet<AddonId>,
) -> BTreeSet<String> {
    installed
        .into_iter()
        .filter(|a| !deletion_set.contains(&a.id()))
        .flat_map(|a| a.entry.folder_names().chain(std::iter::once(a.folder.as_str())))
        .map(String::from)
        .collect()
}

/// Splits `candidates` against the protected set.
///
/// Candidates absent from `present` are dropped silently.
#[must_use]
pub fn partition(
    candidates: &BTreeSet<String>,
    present: &BTreeSet<String>,
    protected: &BTreeSet<String>,
) -> FolderPlan {
    let mut plan = FolderPlan::default();
    for folder in candidates {
        if protected.contains(folder) {
            plan.protected.insert(folder.clone());
        } else if present.contains(folder) {
            plan.deletable.insert(folder.clone());
        }
    }
    plan
}

/// Convenience over [`protected_folders`] and [`partition`].
#[must_use]
pub fn plan<'a>(
    installed: impl IntoIterator<Item = &'a InstalledAddon>,
    deletion_set: &BTreeSet<AddonId>,
    candidates: &BTreeSet<String>,
    present: &BTreeSet<String>,
) -> FolderPlan {
    let protected = protected_folders(installed, deletion_set);
    partition(candidates, present, &protected)
}
