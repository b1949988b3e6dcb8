//! Freshness resolver.
//!
//! Decides whether an installed add-on is behind its catalog entry or its
//! upstream repository. Read-only: nothing here touches the disk.

use tracing::{debug, warn};

use super::github::{latest_fingerprint, RepoRef, SourceControl};
use super::record::filename_from_url;
use super::types::InstalledAddon;
use super::version::{is_newer, max_version};

/// Staleness flags for one installed add-on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Freshness {
    /// Catalog version is newer than the installed one.
    pub version_stale: bool,
    /// Recorded package filename differs from the catalog's current one.
    pub filename_stale: bool,
    /// Declared folders are missing on disk.
    pub corrupted: bool,
    /// Upstream repository moved past the recorded fingerprint.
    pub source_stale: bool,
}

impl Freshness {
    /// Returns true if any flag is set.
    #[must_use]
    pub fn needs_update(&self) -> bool {
        self.version_stale || self.filename_stale || self.corrupted || self.source_stale
    }
}

/// Installed version used for comparison.
///
/// The descriptor and the recorded catalog version can disagree when a
/// package ships no manifest; the higher one wins.
#[must_use]
pub fn effective_local_version(addon: &InstalledAddon) -> &str {
    match addon.backend_version.as_deref() {
        Some(backend) => max_version(&addon.local_version, backend),
        None => &addon.local_version,
    }
}

/// Checks catalog version and filename only.
#[must_use]
pub fn check_catalog(addon: &InstalledAddon) -> Freshness {
    let version_stale = is_newer(&addon.entry.version, effective_local_version(addon));

    let current = filename_from_url(&addon.entry.download_url);
    let filename_stale = !addon.installed_filename.is_empty()
        && !current.is_empty()
        && addon.installed_filename != current;

    Freshness {
        version_stale,
        filename_stale,
        corrupted: addon.corrupted,
        source_stale: false,
    }
}

/// Compares the recorded fingerprint against upstream.
///
/// Only consulted when the entry links a repository and a fingerprint was
/// recorded. Lookup failures count as not stale.
#[must_use]
pub fn check_source(addon: &InstalledAddon, source: &dyn SourceControl) -> bool {
    let Some(ref stored) = addon.source_fingerprint else {
        return false;
    };
    let Some(repo) = addon.entry.source_repo_url.as_deref().and_then(RepoRef::parse) else {
        return false;
    };

    match latest_fingerprint(source, &repo) {
        Ok(Some(latest)) => {
            let stale = !latest.matches(stored);
            if stale {
                debug!("[FRESHNESS] {} moved from {} to {}", addon.folder, stored, latest);
            }
            stale
        }
        Ok(None) => false,
        Err(e) => {
            warn!("[FRESHNESS] Fingerprint lookup for {} failed: {}", addon.folder, e);
            false
        }
    }
}

/// Resolves all flags for one add-on.
#[must_use]
pub fn resolve(addon: &InstalledAddon, source: Option<&dyn SourceControl>) -> Freshness {
    let mut freshness = check_catalog(addon);
    if let Some(source) = source {
        freshness.source_stale = check_source(addon, source);
    }
    freshness
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::github::{CommitInfo, ReleaseInfo};
    use crate::addons::record::SourceFingerprint;
    use crate::addons::types::{AddonError, CatalogEntry, FolderSpec};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;

    fn installed(local: &str, catalog: &str) -> InstalledAddon {
        let entry = CatalogEntry::new(1, "Foo", catalog, vec![FolderSpec::new("Foo", true)]);
        InstalledAddon {
            folder: "Foo".into(),
            installed_filename: filename_from_url(&entry.download_url),
            entry,
            local_version: local.into(),
            local_title: None,
            backend_version: None,
            source_fingerprint: None,
            corrupted: false,
            missing_folders: BTreeSet::new(),
        }
    }

    struct FixedSource(Option<String>);

    impl SourceControl for FixedSource {
        fn latest_release(&self, _: &RepoRef) -> Result<Option<ReleaseInfo>, AddonError> {
            Ok(None)
        }

        fn latest_commit(&self, _: &RepoRef) -> Result<Option<CommitInfo>, AddonError> {
            match self.0 {
                Some(ref sha) => Ok(Some(CommitInfo {
                    sha: sha.clone(),
                    committed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                })),
                None => Err(AddonError::RateLimited),
            }
        }
    }

    #[test]
    fn test_equal_versions_fresh() {
        let addon = installed("1.2.0", "1.2.0");
        assert!(!resolve(&addon, None).needs_update());
    }

    #[test]
    fn test_newer_catalog_version_stale() {
        let addon = installed("1.0.0", "1.2.0");
        let f = resolve(&addon, None);
        assert!(f.version_stale);
        assert!(f.needs_update());
    }

    #[test]
    fn test_backend_version_counts_as_installed() {
        let mut addon = installed("1.0.0", "1.2.0");
        addon.backend_version = Some("1.2.0".into());
        assert!(!check_catalog(&addon).version_stale);
    }

    #[test]
    fn test_filename_change_stale() {
        let mut addon = installed("1.2.0", "1.2.0");
        addon.installed_filename = "foo-old.zip".into();
        assert!(check_catalog(&addon).filename_stale);
    }

    #[test]
    fn test_source_stale_only_with_fingerprint() {
        let mut addon = installed("1.0.0", "1.0.0");
        addon.entry.source_repo_url = Some("https://github.com/o/foo".into());
        let source = FixedSource(Some("bbbbbbb1234".into()));

        assert!(!check_source(&addon, &source));

        addon.source_fingerprint = Some(SourceFingerprint::commit("aaaaaaa"));
        assert!(check_source(&addon, &source));

        addon.source_fingerprint = Some(SourceFingerprint::commit("bbbbbbb"));
        assert!(!check_source(&addon, &source));
    }

    #[test]
    fn test_source_errors_not_stale() {
        let mut addon = installed("1.0.0", "1.0.0");
        addon.entry.source_repo_url = Some("https://github.com/o/foo".into());
        addon.source_fingerprint = Some(SourceFingerprint::commit("aaaaaaa"));
        assert!(!check_source(&addon, &FixedSource(None)));
    }
}
