//! Relationships between installed add-ons.
//!
//! A parent declares another add-on's main folder in its own folder list;
//! the other add-on is then its child (bundled). Relationships are derived
//! from the installed map on demand and never stored.

use std::collections::{BTreeMap, BTreeSet};

use super::types::{AddonId, InstalledAddon};

/// Installed add-ons keyed by main folder.
pub type InstalledMap = BTreeMap<String, InstalledAddon>;

/// Installed add-ons other than `addon` whose folder list contains its main
/// folder.
#[must_use]
pub fn parents_of<'a>(installed: &'a InstalledMap, addon: &InstalledAddon) -> Vec<&'a InstalledAddon> {
    installed
        .values()
        .filter(|other| other.id() != addon.id() && other.owns(&addon.folder))
        .collect()
}

/// Installed add-ons other than `addon` whose main folder is in its folder
/// list.
#[must_use]
pub fn children_of<'a>(installed: &'a InstalledMap, addon: &InstalledAddon) -> Vec<&'a InstalledAddon> {
    installed
        .values()
        .filter(|other| other.id() != addon.id() && addon.owns(&other.folder))
        .collect()
}

/// Transitive closure of [`children_of`], excluding `addon` itself.
///
/// Ordered by main folder. Cycles are cut by the visited set.
#[must_use]
pub fn all_descendants<'a>(installed: &'a InstalledMap, addon: &InstalledAddon) -> Vec<&'a InstalledAddon> {
    let mut visited = BTreeSet::from([addon.id()]);
    let mut found = BTreeMap::new();
    let mut stack = children_of(installed, addon);

    while let Some(child) = stack.pop() {
        if !visited.insert(child.id()) {
            continue;
        }
        found.insert(child.folder.as_str(), child);
        stack.extend(children_of(installed, child));
    }

    found.into_values().collect()
}

/// Children of a group of add-ons that no installed add-on outside the group
/// also bundles.
///
/// `group_ids` are the ids being replaced; `group_folders` the union of
/// their declared folders, which may include folders of entries that are
/// not installed.
#[must_use]
pub fn exclusive_children<'a>(
    installed: &'a InstalledMap,
    group_ids: &BTreeSet<AddonId>,
    group_folders: &BTreeSet<String>,
) -> Vec<&'a InstalledAddon> {
    installed
        .values()
        .filter(|child| !group_ids.contains(&child.id()))
        .filter(|child| group_folders.contains(&child.folder))
        .filter(|child| {
            !installed.values().any(|other| {
                other.id() != child.id()
                    && !group_ids.contains(&other.id())
                    && other.owns(&child.folder)
            })
        })
        .collect()
}
