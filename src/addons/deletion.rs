//! Deletion orchestrator.
//!
//! Removes an installed add-on and the descendants the user did not choose
//! to keep. Candidate folders pass through the ownership check before any
//! of them is touched; physical deletes run concurrently and are retried.

use std::collections::{BTreeMap, BTreeSet};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::catalog::CatalogIndex;
use super::gateway::FsGateway;
use super::graph::{all_descendants, InstalledMap};
use super::ownership;
use super::scanner::read_descriptor;
use super::types::{AddonError, AddonId};
use super::version::titles_match;

/// Upper bound on concurrent folder deletions.
const MAX_DELETE_WORKERS: usize = 8;

/// Retry schedule for physical deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first.
    pub retries: u32,
    /// Wait before the first retry; doubles each time.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(250),
        }
    }
}

/// Result of deleting a set of folders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    /// Folders removed from disk.
    pub removed: BTreeSet<String>,
    /// Folders that could not be removed, with the last error.
    pub failed: BTreeMap<String, String>,
    /// Candidates kept because an add-on outside the set owns them.
    pub protected: BTreeSet<String>,
}

impl DeletionReport {
    /// True if every deletable folder was removed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Deletes one folder, retrying retryable failures.
fn delete_with_retry(gateway: &dyn FsGateway, folder: &str, policy: RetryPolicy) -> Result<(), String> {
    let path = gateway.root().join(folder);
    let mut wait = policy.backoff;
    let mut attempt = 0;

    loop {
        match gateway.delete_folder_recursive(&path) {
            Ok(()) if !gateway.exists(&path) => return Ok(()),
            Ok(()) => debug!("[DELETE] '{}' still present after delete", folder),
            Err(e) if !gateway.exists(&path) => {
                debug!("[DELETE] '{}' already gone: {}", folder, e);
                return Ok(());
            }
            Err(e) if !e.is_retryable() => return Err(e.to_string()),
            Err(e) => debug!("[DELETE] Attempt {} on '{}' failed: {}", attempt + 1, folder, e),
        }

        if attempt >= policy.retries {
            return Err(format!("still present after {} attempts", attempt + 1));
        }
        attempt += 1;
        thread::sleep(wait);
        wait = wait.saturating_mul(2);
    }
}

/// Deletes `folders` under the root concurrently.
///
/// Returns the removed folders and the failures. Never fails as a whole.
pub fn delete_folders(
    gateway: &dyn FsGateway,
    folders: &BTreeSet<String>,
    policy: RetryPolicy,
) -> (BTreeSet<String>, BTreeMap<String, String>) {
    let list: Vec<&String> = folders.iter().collect();
    let workers = list.len().clamp(1, MAX_DELETE_WORKERS);
    let chunk_size = list.len().div_ceil(workers).max(1);

    let results: Vec<(String, Result<(), String>)> = thread::scope(|scope| {
        let handles: Vec<_> = list
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|f| ((*f).clone(), delete_with_retry(gateway, f, policy)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|h| match h.join() {
                Ok(results) => results,
                Err(_) => {
                    warn!("[DELETE] Delete worker panicked");
                    Vec::new()
                }
            })
            .collect()
    });

    let mut removed = BTreeSet::new();
    let mut failed = BTreeMap::new();
    for (folder, result) in results {
        match result {
            Ok(()) => {
                removed.insert(folder);
            }
            Err(reason) => {
                warn!("[DELETE] Could not delete '{}': {}", folder, reason);
                failed.insert(folder, reason);
            }
        }
    }
    // Folders lost to a panicked worker.
    for folder in folders {
        if !removed.contains(folder) && !failed.contains_key(folder) {
            failed.insert(folder.clone(), "delete worker panicked".to_string());
        }
    }

    (removed, failed)
}

/// Deletes an installed add-on.
pub struct DeletionOrchestrator<'a> {
    gateway: &'a dyn FsGateway,
    installed: &'a InstalledMap,
    catalog: &'a CatalogIndex,
    policy: RetryPolicy,
}

impl<'a> DeletionOrchestrator<'a> {
    #[must_use]
    pub fn new(
        gateway: &'a dyn FsGateway,
        installed: &'a InstalledMap,
        catalog: &'a CatalogIndex,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            installed,
            catalog,
            policy,
        }
    }

    /// Ids removed when deleting `target_folder` while keeping `keep_ids`.
    ///
    /// The target is always included; its descendants unless kept.
    pub fn deletion_set(
        &self,
        target_folder: &str,
        keep_ids: &BTreeSet<AddonId>,
    ) -> Result<BTreeSet<AddonId>, AddonError> {
        let target = self
            .installed
            .get(target_folder)
            .ok_or_else(|| AddonError::NotInstalled(target_folder.to_string()))?;

        let mut set = BTreeSet::from([target.id()]);
        set.extend(
            all_descendants(self.installed, target)
                .into_iter()
                .map(|d| d.id())
                .filter(|id| !keep_ids.contains(id)),
        );
        Ok(set)
    }

    /// Folders that may belong to the deletion set: declared folders and
    /// folders whose descriptor title matches a member's catalog title.
    fn candidates(&self, set: &BTreeSet<AddonId>, present: &BTreeSet<String>) -> BTreeSet<String> {
        let members: Vec<_> = self
            .installed
            .values()
            .filter(|a| set.contains(&a.id()))
            .collect();

        let mut candidates: BTreeSet<String> = members
            .iter()
            .flat_map(|a| a.entry.folder_names().chain(std::iter::once(a.folder.as_str())))
            .map(String::from)
            .collect();

        let titles: Vec<&str> = members
            .iter()
            .map(|a| {
                self.catalog
                    .get(a.id())
                    .map_or(a.entry.title.as_str(), |e| e.title.as_str())
            })
            .collect();

        let unclaimed: Vec<&String> = present.iter().filter(|f| !candidates.contains(*f)).collect();
        for folder in unclaimed {
            match read_descriptor(self.gateway, folder) {
                Ok(descriptor) => {
                    let Some(ref title) = descriptor.title else {
                        continue;
                    };
                    if titles.iter().any(|t| titles_match(t, title)) {
                        debug!("[DELETE] '{}' matched by title '{}'", folder, title);
                        candidates.insert(folder.clone());
                    }
                }
                Err(e) => debug!("[DELETE] Could not read descriptor of '{}': {}", folder, e),
            }
        }

        candidates
    }

    /// Deletes the target and its unkept descendants.
    pub fn delete(
        &self,
        target_folder: &str,
        keep_ids: &BTreeSet<AddonId>,
    ) -> Result<DeletionReport, AddonError> {
        let set = self.deletion_set(target_folder, keep_ids)?;
        let present: BTreeSet<String> = self.gateway.top_level_folders()?.into_iter().collect();
        let candidates = self.candidates(&set, &present);
        let plan = ownership::plan(self.installed.values(), &set, &candidates, &present);

        info!(
            "[DELETE] Removing {:?}: {} folder(s), {} protected",
            set,
            plan.deletable.len(),
            plan.protected.len()
        );

        let (removed, failed) = delete_folders(self.gateway, &plan.deletable, self.policy);
        Ok(DeletionReport {
            removed,
            failed,
            protected: plan.protected,
        })
    }
}
