//! Directory scanner.
//!
//! Matches top-level folders of the installation root against catalog main
//! folders and builds the installed set plus the conflict queue. Folders are
//! inspected on a small pool of scoped worker threads; results are merged
//! once all workers finish.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::thread;

use tracing::{debug, info, warn};

use super::gateway::FsGateway;
use super::record::{filename_from_url, InstallRecord, RECORD_FILE_NAME};
use super::types::{AddonError, CatalogEntry, Conflict, InstalledAddon};
use super::version::{Descriptor, MANIFEST_EXTENSIONS};

/// Upper bound on scan worker threads.
const MAX_SCAN_WORKERS: usize = 8;

/// Result of one scan pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Installed add-ons keyed by main folder.
    pub installed: BTreeMap<String, InstalledAddon>,
    /// Folders awaiting a user decision, ordered by folder name.
    pub conflicts: Vec<Conflict>,
}

impl ScanResult {
    /// Finds an installed add-on by catalog id.
    #[must_use]
    pub fn find_by_id(&self, id: u64) -> Option<&InstalledAddon> {
        self.installed.values().find(|a| a.entry.id == id)
    }
}

/// Outcome of inspecting one folder.
enum FolderOutcome {
    Installed(Box<InstalledAddon>),
    Conflict(Conflict),
    Skipped,
}

/// Path of the manifest inside `folder`, if any.
pub fn manifest_path(gateway: &dyn FsGateway, folder: &str) -> Option<PathBuf> {
    let dir = gateway.root().join(folder);
    MANIFEST_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{}.{}", folder, ext)))
        .find(|p| gateway.exists(p))
}

/// Reads the descriptor of `folder`; an absent manifest yields defaults.
pub fn read_descriptor(gateway: &dyn FsGateway, folder: &str) -> Result<Descriptor, AddonError> {
    match manifest_path(gateway, folder) {
        Some(path) => Ok(Descriptor::parse(&gateway.read_file(&path)?)),
        None => Ok(Descriptor::default()),
    }
}

/// Path of the sidecar for a main folder.
#[must_use]
pub fn record_path(root: &Path, folder: &str) -> PathBuf {
    root.join(folder).join(RECORD_FILE_NAME)
}

/// Reads the sidecar of `folder` if present.
pub fn read_record(gateway: &dyn FsGateway, folder: &str) -> Result<Option<InstallRecord>, AddonError> {
    let path = record_path(gateway.root(), folder);
    if !gateway.exists(&path) {
        return Ok(None);
    }
    Ok(Some(InstallRecord::parse(&gateway.read_file(&path)?)))
}

/// Directory scanner over one installation root.
pub struct Scanner<'a> {
    gateway: &'a dyn FsGateway,
    /// Main folder to claiming entries, in catalog order.
    by_main: HashMap<String, Vec<&'a CatalogEntry>>,
}

impl<'a> Scanner<'a> {
    /// Creates a scanner, indexing catalog main folders.
    ///
    /// Entries with an empty folder list or no main folder are skipped.
    #[must_use]
    pub fn new(gateway: &'a dyn FsGateway, catalog: &'a [CatalogEntry]) -> Self {
        let mut by_main: HashMap<String, Vec<&CatalogEntry>> = HashMap::new();

        for entry in catalog {
            if let Err(e) = entry.validate() {
                warn!("[SCAN] {}", e);
            }
            match entry.main_folder() {
                Some(main) => by_main.entry(main.to_string()).or_default().push(entry),
                None => debug!("[SCAN] Entry {} has no main folder, skipped", entry.id),
            }
        }

        Self { gateway, by_main }
    }

    /// Runs a full scan pass.
    ///
    /// Fails only if the root itself cannot be listed.
    pub fn scan(&self) -> Result<ScanResult, AddonError> {
        let present: BTreeSet<String> = self.gateway.top_level_folders()?.into_iter().collect();
        let candidates: Vec<&String> = present
            .iter()
            .filter(|f| self.by_main.contains_key(f.as_str()))
            .collect();

        info!(
            "[SCAN] {} folders on disk, {} match catalog main folders",
            present.len(),
            candidates.len()
        );

        let workers = thread::available_parallelism()
            .map_or(1, |n| n.get())
            .clamp(1, MAX_SCAN_WORKERS);
        let chunk_size = candidates.len().div_ceil(workers).max(1);

        let outcomes: Vec<FolderOutcome> = thread::scope(|scope| {
            let handles: Vec<_> = candidates
                .chunks(chunk_size)
                .map(|chunk| {
                    let present = &present;
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|folder| self.inspect_folder(folder, present))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|h| match h.join() {
                    Ok(outcomes) => outcomes,
                    Err(_) => {
                        warn!("[SCAN] Scan worker panicked, its folders are skipped");
                        Vec::new()
                    }
                })
                .collect()
        });

        let mut result = ScanResult::default();
        for outcome in outcomes {
            match outcome {
                FolderOutcome::Installed(addon) => {
                    result.installed.insert(addon.folder.clone(), *addon);
                }
                FolderOutcome::Conflict(conflict) => result.conflicts.push(conflict),
                FolderOutcome::Skipped => {}
            }
        }
        result.conflicts.sort_by(|a, b| a.folder.cmp(&b.folder));

        info!(
            "[SCAN] {} installed, {} conflict(s)",
            result.installed.len(),
            result.conflicts.len()
        );
        Ok(result)
    }

    /// Inspects one folder; errors are logged and the folder skipped.
    fn inspect_folder(&self, folder: &str, present: &BTreeSet<String>) -> FolderOutcome {
        match self.try_inspect_folder(folder, present) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[SCAN] Skipping folder '{}': {}", folder, e);
                FolderOutcome::Skipped
            }
        }
    }

    fn try_inspect_folder(
        &self,
        folder: &str,
        present: &BTreeSet<String>,
    ) -> Result<FolderOutcome, AddonError> {
        let Some(matches) = self.by_main.get(folder) else {
            return Ok(FolderOutcome::Skipped);
        };

        let descriptor = read_descriptor(self.gateway, folder)?;
        let record = read_record(self.gateway, folder)?;

        if let Some(ref record) = record {
            if let Some(id) = record.id {
                if let Some(entry) = matches.iter().find(|e| e.id == id) {
                    debug!("[SCAN] '{}' resolved by record to {}", folder, id);
                    return Ok(FolderOutcome::Installed(Box::new(build_installed(
                        folder,
                        entry,
                        &descriptor,
                        Some(record),
                        present,
                    ))));
                }
                warn!(
                    "[SCAN] Record in '{}' names {} which does not claim it; ignoring record",
                    folder, id
                );
            }
        }

        if let [entry] = matches.as_slice() {
            debug!("[SCAN] '{}' adopted as {}", folder, entry.id);
            let adopted = adoption_record(entry, &descriptor, record.as_ref());
            self.repair_record(folder, &adopted);
            return Ok(FolderOutcome::Installed(Box::new(build_installed(
                folder,
                entry,
                &descriptor,
                Some(&adopted),
                present,
            ))));
        }

        let mut candidates: Vec<_> = matches.iter().map(|e| e.id).collect();
        candidates.sort_unstable();
        debug!("[SCAN] '{}' claimed by {:?}", folder, candidates);

        Ok(FolderOutcome::Conflict(Conflict {
            folder: folder.to_string(),
            candidates,
            local_version: descriptor.version_or_default(),
        }))
    }

    /// Writes the sidecar for an adopted folder, replacing a record that
    /// did not resolve. Failure only costs a re-adoption on the next scan.
    fn repair_record(&self, folder: &str, record: &InstallRecord) {
        let path = record_path(self.gateway.root(), folder);
        if let Err(e) = self.gateway.overwrite(&path, &record.render()) {
            warn!("[SCAN] Could not create record for '{}': {}", folder, e);
        }
    }
}

/// Record written when a folder is adopted.
///
/// A fingerprint from an unusable `previous` record is carried over.
#[must_use]
pub fn adoption_record(
    entry: &CatalogEntry,
    descriptor: &Descriptor,
    previous: Option<&InstallRecord>,
) -> InstallRecord {
    InstallRecord {
        id: Some(entry.id),
        folders: entry.folder_names().map(String::from).collect(),
        filename: filename_from_url(&entry.download_url),
        backend_version: Some(descriptor.version_or_default()),
        fingerprint: previous.and_then(|r| r.fingerprint.clone()),
    }
}

/// Builds the installed view of a folder resolved to `entry`.
#[must_use]
pub fn build_installed(
    folder: &str,
    entry: &CatalogEntry,
    descriptor: &Descriptor,
    record: Option<&InstallRecord>,
    present: &BTreeSet<String>,
) -> InstalledAddon {
    let missing_folders: BTreeSet<String> = entry
        .folder_names()
        .filter(|f| !present.contains(*f))
        .map(String::from)
        .collect();

    InstalledAddon {
        folder: folder.to_string(),
        entry: entry.clone(),
        local_version: descriptor.version_or_default(),
        local_title: descriptor.title.clone(),
        backend_version: record.and_then(|r| r.backend_version.clone()),
        installed_filename: record.map(|r| r.filename.clone()).unwrap_or_default(),
        source_fingerprint: record.and_then(|r| r.fingerprint.clone()),
        corrupted: !missing_folders.is_empty(),
        missing_folders,
    }
}

/// Scans `gateway`'s root against `catalog`.
pub fn scan(gateway: &dyn FsGateway, catalog: &[CatalogEntry]) -> Result<ScanResult, AddonError> {
    Scanner::new(gateway, catalog).scan()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::gateway::LocalFs;
    use crate::addons::types::FolderSpec;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalFs) {
        let dir = TempDir::new().unwrap();
        let gateway = LocalFs::new(dir.path()).unwrap();
        (dir, gateway)
    }

    fn mkdir(dir: &TempDir, name: &str) {
        fs::create_dir_all(dir.path().join(name)).unwrap();
    }

    #[test]
    fn test_absent_folder_not_installed() {
        let (_dir, gw) = setup();
        let catalog = vec![CatalogEntry::new(1, "Foo", "1.2.0", vec![FolderSpec::new("Foo", true)])];
        let result = scan(&gw, &catalog).unwrap();
        assert!(result.installed.is_empty());
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_single_match_adopted_and_record_created() {
        let (dir, gw) = setup();
        mkdir(&dir, "Foo");
        fs::write(dir.path().join("Foo/Foo.txt"), "## Title: Foo\n## Version: 1.1.0\n").unwrap();
        let catalog = vec![CatalogEntry::new(1, "Foo", "1.2.0", vec![FolderSpec::new("Foo", true)])];

        let result = scan(&gw, &catalog).unwrap();
        let foo = &result.installed["Foo"];
        assert_eq!(foo.id(), 1);
        assert_eq!(foo.local_version, "1.1.0");
        assert!(!foo.corrupted);

        let record = fs::read_to_string(dir.path().join("Foo").join(RECORD_FILE_NAME)).unwrap();
        assert!(record.contains("ID: 1"));
    }

    #[test]
    fn test_missing_folder_marks_corrupted() {
        let (dir, gw) = setup();
        mkdir(&dir, "Foo");
        let catalog = vec![CatalogEntry::new(
            1,
            "Foo",
            "1.0.0",
            vec![FolderSpec::new("Foo", true), FolderSpec::new("FooLib", false)],
        )];

        let result = scan(&gw, &catalog).unwrap();
        let foo = &result.installed["Foo"];
        assert!(foo.corrupted);
        assert!(foo.missing_folders.contains("FooLib"));
    }

    #[test]
    fn test_ambiguous_folder_becomes_conflict() {
        let (dir, gw) = setup();
        mkdir(&dir, "Shared");
        let catalog = vec![
            CatalogEntry::new(5, "One", "1.0", vec![FolderSpec::new("Shared", true)]),
            CatalogEntry::new(3, "Two", "1.0", vec![FolderSpec::new("Shared", true)]),
        ];

        let result = scan(&gw, &catalog).unwrap();
        assert!(result.installed.is_empty());
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].candidates, vec![3, 5]);
        assert!(!dir.path().join("Shared").join(RECORD_FILE_NAME).exists());
    }

    #[test]
    fn test_record_disambiguates() {
        let (dir, gw) = setup();
        mkdir(&dir, "Shared");
        fs::write(dir.path().join("Shared").join(RECORD_FILE_NAME), "ID: 5\n").unwrap();
        let catalog = vec![
            CatalogEntry::new(5, "One", "1.0", vec![FolderSpec::new("Shared", true)]),
            CatalogEntry::new(3, "Two", "1.0", vec![FolderSpec::new("Shared", true)]),
        ];

        let result = scan(&gw, &catalog).unwrap();
        assert_eq!(result.installed["Shared"].id(), 5);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_latin1_manifest_still_scanned() {
        let (dir, gw) = setup();
        mkdir(&dir, "Foo");
        fs::write(dir.path().join("Foo/Foo.toc"), b"## Title: Caf\xe9\n## Version: 1.0.0\n").unwrap();
        let catalog = vec![CatalogEntry::new(1, "Foo", "1.2.0", vec![FolderSpec::new("Foo", true)])];

        let result = scan(&gw, &catalog).unwrap();
        let foo = &result.installed["Foo"];
        assert_eq!(foo.local_version, "1.0.0");
        assert!(foo.local_title.as_deref().unwrap().starts_with("Caf"));
    }

    #[test]
    fn test_unresolved_record_keeps_fingerprint() {
        let (dir, gw) = setup();
        mkdir(&dir, "Foo");
        fs::write(
            dir.path().join("Foo").join(RECORD_FILE_NAME),
            "ID: abc\nGitFingerprint: release:v1.0\n",
        )
        .unwrap();
        let catalog = vec![CatalogEntry::new(1, "Foo", "1.0.0", vec![FolderSpec::new("Foo", true)])];

        let result = scan(&gw, &catalog).unwrap();
        let foo = &result.installed["Foo"];
        assert_eq!(foo.id(), 1);
        assert_eq!(
            foo.source_fingerprint,
            Some(crate::addons::record::SourceFingerprint::release("v1.0"))
        );

        let record = fs::read_to_string(dir.path().join("Foo").join(RECORD_FILE_NAME)).unwrap();
        assert!(record.contains("ID: 1"));
        assert!(record.contains("GitFingerprint: release:v1.0"));
    }

    #[test]
    fn test_malformed_entry_skipped() {
        let (dir, gw) = setup();
        mkdir(&dir, "Foo");
        let catalog = vec![CatalogEntry::new(1, "Broken", "1.0", Vec::new())];
        let result = scan(&gw, &catalog).unwrap();
        assert!(result.installed.is_empty());
    }
}
