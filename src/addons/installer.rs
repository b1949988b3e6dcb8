//! Installer pipeline.
//!
//! One install runs as a sequence of explicit [`PipelineState`]s. Each step
//! consumes the current state and returns the next; the loop stops at
//! `Done`, `AwaitingConfirmation` or `Failed`. Phases are reported to the
//! event sink as they are entered.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::catalog::CatalogIndex;
use super::deletion::{delete_folders, RetryPolicy};
use super::download::{download_first, Downloader};
use super::engine::{EngineEvent, EngineSettings, EventSink};
use super::freshness::check_catalog;
use super::gateway::{DirEntryInfo, FsGateway};
use super::github::{latest_fingerprint, RepoRef, SourceControl};
use super::graph::{exclusive_children, InstalledMap};
use super::normalize::normalize_layout;
use super::ownership;
use super::record::{filename_from_url, InstallRecord, SourceFingerprint};
use super::scanner::{manifest_path, record_path};
use super::types::{AddonError, AddonId, CatalogEntry, InstallOptions};
use super::version::{bump_descriptor_version, max_version, Descriptor};

/// Phase of an install, without the data carried between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    ResolvingTarget,
    CheckingBundles,
    Deleting,
    Downloading,
    Extracting,
    Normalizing,
    WritingRecord,
    AwaitingConfirmation,
    Done,
    Failed,
}

impl PipelinePhase {
    /// Returns true for phases that end a run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::AwaitingConfirmation)
    }

    #[must_use]
    pub fn display(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::ResolvingTarget => "Resolving target",
            Self::CheckingBundles => "Checking bundles",
            Self::Deleting => "Removing old files",
            Self::Downloading => "Downloading",
            Self::Extracting => "Extracting",
            Self::Normalizing => "Normalizing layout",
            Self::WritingRecord => "Writing record",
            Self::AwaitingConfirmation => "Awaiting confirmation",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display())
    }
}

/// What one run works on, built while resolving the target.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    /// Entry being installed.
    pub entry: CatalogEntry,
    /// Ids of the variation family.
    pub family_ids: BTreeSet<AddonId>,
    /// Union of the family's declared folders.
    pub family_folders: BTreeSet<String>,
    /// Installed add-ons whose folders this install replaces.
    pub deletion_ids: BTreeSet<AddonId>,
    /// Fingerprint recorded by the previous install.
    pub previous_fingerprint: Option<SourceFingerprint>,
    /// Fingerprint fetched during this install.
    pub fresh_fingerprint: Option<SourceFingerprint>,
}

/// State of an install, carrying what the next step needs.
#[derive(Debug, Clone)]
pub enum PipelineState {
    Idle,
    ResolvingTarget,
    CheckingBundles(Box<InstallPlan>),
    Deleting(Box<InstallPlan>),
    Downloading(Box<InstallPlan>),
    Extracting {
        plan: Box<InstallPlan>,
        archive: PathBuf,
    },
    Normalizing {
        plan: Box<InstallPlan>,
        new_entries: Vec<DirEntryInfo>,
    },
    WritingRecord(Box<InstallPlan>),
    /// Exclusive children of the family would be replaced.
    AwaitingConfirmation { dependents: Vec<AddonId> },
    /// Finished; `changed` is false when nothing needed doing.
    Done { changed: bool },
    Failed { reason: String },
}

impl PipelineState {
    #[must_use]
    pub fn phase(&self) -> PipelinePhase {
        match self {
            Self::Idle => PipelinePhase::Idle,
            Self::ResolvingTarget => PipelinePhase::ResolvingTarget,
            Self::CheckingBundles(_) => PipelinePhase::CheckingBundles,
            Self::Deleting(_) => PipelinePhase::Deleting,
            Self::Downloading(_) => PipelinePhase::Downloading,
            Self::Extracting { .. } => PipelinePhase::Extracting,
            Self::Normalizing { .. } => PipelinePhase::Normalizing,
            Self::WritingRecord(_) => PipelinePhase::WritingRecord,
            Self::AwaitingConfirmation { .. } => PipelinePhase::AwaitingConfirmation,
            Self::Done { .. } => PipelinePhase::Done,
            Self::Failed { .. } => PipelinePhase::Failed,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Files were replaced and the record written.
    Installed,
    /// Already current; nothing was touched.
    UpToDate,
    /// Stopped before deleting anything; rerun with the bundle check
    /// skipped to proceed.
    NeedsConfirmation { dependents: Vec<AddonId> },
}

/// Runs installs against one installation root.
pub struct InstallerPipeline<'a> {
    gateway: &'a dyn FsGateway,
    catalog: &'a CatalogIndex,
    installed: &'a InstalledMap,
    source_control: Option<&'a dyn SourceControl>,
    downloader: &'a dyn Downloader,
    settings: &'a EngineSettings,
    sink: &'a dyn EventSink,
}

impl<'a> InstallerPipeline<'a> {
    #[must_use]
    pub fn new(
        gateway: &'a dyn FsGateway,
        catalog: &'a CatalogIndex,
        installed: &'a InstalledMap,
        downloader: &'a dyn Downloader,
        settings: &'a EngineSettings,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            gateway,
            catalog,
            installed,
            source_control: None,
            downloader,
            settings,
            sink,
        }
    }

    /// Enables fingerprint lookups.
    #[must_use]
    pub fn with_source_control(mut self, source_control: Option<&'a dyn SourceControl>) -> Self {
        self.source_control = source_control;
        self
    }

    /// Installs `id`, driving the state machine to a terminal state.
    pub fn run(&self, id: AddonId, options: InstallOptions) -> Result<InstallOutcome, AddonError> {
        let mut state = PipelineState::ResolvingTarget;

        loop {
            self.sink.emit(EngineEvent::StateChanged {
                addon_id: id,
                phase: state.phase(),
            });

            match state {
                PipelineState::Done { changed } => {
                    info!("[INSTALL] {} finished (changed={})", id, changed);
                    return Ok(if changed {
                        InstallOutcome::Installed
                    } else {
                        InstallOutcome::UpToDate
                    });
                }
                PipelineState::AwaitingConfirmation { dependents } => {
                    info!("[INSTALL] {} waits for confirmation, dependents {:?}", id, dependents);
                    return Ok(InstallOutcome::NeedsConfirmation { dependents });
                }
                PipelineState::Failed { reason } => {
                    return Err(AddonError::Archive(reason));
                }
                current => {
                    let phase = current.phase();
                    state = match self.step(id, options, current) {
                        Ok(next) => next,
                        Err(e) => {
                            warn!("[INSTALL] {} failed while {}: {}", id, phase, e);
                            self.sink.emit(EngineEvent::StateChanged {
                                addon_id: id,
                                phase: PipelinePhase::Failed,
                            });
                            return Err(e);
                        }
                    };
                }
            }
        }
    }

    /// Advances one state.
    pub fn step(
        &self,
        id: AddonId,
        options: InstallOptions,
        state: PipelineState,
    ) -> Result<PipelineState, AddonError> {
        match state {
            PipelineState::Idle => Ok(PipelineState::ResolvingTarget),
            PipelineState::ResolvingTarget => self.resolve_target(id, options),
            PipelineState::CheckingBundles(plan) => Ok(self.check_bundles(plan, options)),
            PipelineState::Deleting(plan) => Ok(self.delete_family(plan)),
            PipelineState::Downloading(plan) => self.download(plan),
            PipelineState::Extracting { plan, archive } => self.extract(plan, &archive),
            PipelineState::Normalizing { plan, new_entries } => {
                normalize_layout(self.gateway, &plan.entry, &new_entries)?;
                Ok(PipelineState::WritingRecord(plan))
            }
            PipelineState::WritingRecord(plan) => {
                self.write_record(&plan)?;
                Ok(PipelineState::Done { changed: true })
            }
            terminal => Ok(terminal),
        }
    }

    fn resolve_target(&self, id: AddonId, options: InstallOptions) -> Result<PipelineState, AddonError> {
        let entry = self.catalog.get(id).ok_or(AddonError::NotInCatalog(id))?;
        if entry.main_folder().is_none() {
            return Err(AddonError::MalformedCatalog {
                id,
                reason: "no main folder".to_string(),
            });
        }

        let current = self.installed.values().find(|a| a.id() == id);
        if let Some(addon) = current {
            if !options.reinstall && !check_catalog(addon).needs_update() {
                debug!("[INSTALL] {} is up to date", id);
                return Ok(PipelineState::Done { changed: false });
            }
        }

        let family = self.catalog.family(id);
        let family_ids: BTreeSet<AddonId> = family.iter().map(|e| e.id).collect();
        let family_folders: BTreeSet<String> = family
            .iter()
            .flat_map(|e| e.folder_names())
            .map(String::from)
            .collect();
        let deletion_ids = self
            .installed
            .values()
            .filter(|a| family_ids.contains(&a.id()))
            .map(|a| a.id())
            .collect();

        debug!("[INSTALL] {} resolved to family {:?}", id, family_ids);

        Ok(PipelineState::CheckingBundles(Box::new(InstallPlan {
            entry: entry.clone(),
            family_ids,
            family_folders,
            deletion_ids,
            previous_fingerprint: current.and_then(|a| a.source_fingerprint.clone()),
            fresh_fingerprint: None,
        })))
    }

    fn check_bundles(&self, mut plan: Box<InstallPlan>, options: InstallOptions) -> PipelineState {
        let dependents: Vec<AddonId> =
            exclusive_children(self.installed, &plan.family_ids, &plan.family_folders)
                .into_iter()
                .map(|a| a.id())
                .collect();

        if dependents.is_empty() {
            return PipelineState::Deleting(plan);
        }
        if !options.skip_bundle_check {
            return PipelineState::AwaitingConfirmation { dependents };
        }

        debug!("[INSTALL] Replacing bundled dependents {:?}", dependents);
        plan.deletion_ids.extend(dependents);
        PipelineState::Deleting(plan)
    }

    fn delete_family(&self, plan: Box<InstallPlan>) -> PipelineState {
        let mut candidates = plan.family_folders.clone();
        for addon in self.installed.values().filter(|a| plan.deletion_ids.contains(&a.id())) {
            candidates.insert(addon.folder.clone());
            candidates.extend(addon.entry.folder_names().map(String::from));
        }

        let present: BTreeSet<String> = match self.gateway.top_level_folders() {
            Ok(folders) => folders.into_iter().collect(),
            Err(e) => {
                warn!("[INSTALL] Could not list root before delete: {}", e);
                return PipelineState::Downloading(plan);
            }
        };

        let folder_plan = ownership::plan(self.installed.values(), &plan.deletion_ids, &candidates, &present);
        if !folder_plan.protected.is_empty() {
            debug!("[INSTALL] Keeping folders still in use: {:?}", folder_plan.protected);
        }

        let policy = RetryPolicy {
            retries: self.settings.delete_retries,
            backoff: self.settings.delete_backoff,
        };
        let (removed, failed) = delete_folders(self.gateway, &folder_plan.deletable, policy);
        debug!("[INSTALL] Removed {} folder(s)", removed.len());

        for (folder, reason) in failed {
            self.sink.emit(EngineEvent::FolderDeleteFailed { folder, reason });
        }

        PipelineState::Downloading(plan)
    }

    /// Download sources in order of preference.
    fn download_urls(&self, entry: &CatalogEntry) -> Vec<String> {
        let mut urls = Vec::new();
        if self.settings.prefer_source_control {
            if let Some(repo) = entry.source_repo_url.as_deref().and_then(RepoRef::parse) {
                urls.push(repo.default_branch_archive_url());
            }
        }
        if !entry.download_url.is_empty() {
            urls.push(entry.download_url.clone());
        }
        urls
    }

    fn download(&self, mut plan: Box<InstallPlan>) -> Result<PipelineState, AddonError> {
        let id = plan.entry.id;
        let urls = self.download_urls(&plan.entry);
        let archive = self.settings.cache_dir.join(format!("addon-{}.pkg", id));

        let mut last = 0u8;
        let mut progress = |percent: u8| {
            if percent > last {
                last = percent;
                self.sink.emit(EngineEvent::DownloadProgress {
                    addon_id: id,
                    percent,
                });
            }
        };
        let used = download_first(self.downloader, &urls, &archive, &mut progress)?;
        debug!("[INSTALL] {} downloaded from {}", id, used);

        if let (Some(source), Some(repo)) = (
            self.source_control,
            plan.entry.source_repo_url.as_deref().and_then(RepoRef::parse),
        ) {
            match latest_fingerprint(source, &repo) {
                Ok(fingerprint) => plan.fresh_fingerprint = fingerprint,
                Err(e) => warn!("[INSTALL] Fingerprint lookup for {} failed: {}", repo, e),
            }
        }

        Ok(PipelineState::Extracting { plan, archive })
    }

    fn extract(&self, plan: Box<InstallPlan>, archive: &Path) -> Result<PipelineState, AddonError> {
        let root = self.gateway.root().to_path_buf();
        let before: HashSet<String> = self
            .gateway
            .list_dir(&root)?
            .into_iter()
            .map(|e| e.name)
            .collect();

        let result = self.gateway.extract_archive(archive, &root);
        if let Err(e) = std::fs::remove_file(archive) {
            debug!("[INSTALL] Could not remove {}: {}", archive.display(), e);
        }
        result?;

        let new_entries: Vec<DirEntryInfo> = self
            .gateway
            .list_dir(&root)?
            .into_iter()
            .filter(|e| !before.contains(&e.name))
            .collect();
        debug!("[INSTALL] Extraction added {:?}", new_entries);

        Ok(PipelineState::Normalizing { plan, new_entries })
    }

    fn write_record(&self, plan: &InstallPlan) -> Result<(), AddonError> {
        let entry = &plan.entry;
        let main = entry.main_folder().ok_or_else(|| AddonError::MalformedCatalog {
            id: entry.id,
            reason: "no main folder".to_string(),
        })?;

        let record = InstallRecord {
            id: Some(entry.id),
            folders: entry.folder_names().map(String::from).collect(),
            filename: filename_from_url(&entry.download_url),
            backend_version: Some(entry.version.clone()),
            fingerprint: plan
                .fresh_fingerprint
                .clone()
                .or_else(|| plan.previous_fingerprint.clone()),
        };
        self.gateway
            .overwrite(&record_path(self.gateway.root(), main), &record.render())?;

        if let Some(path) = manifest_path(self.gateway, main) {
            let content = self.gateway.read_file(&path)?;
            let local = Descriptor::parse(&content).version_or_default();
            let target = max_version(&local, &entry.version);
            let bumped = bump_descriptor_version(&content, target);
            if bumped != content {
                debug!("[INSTALL] Bumping {} version to {}", main, target);
                self.gateway.overwrite(&path, &bumped)?;
            }
        }

        Ok(())
    }
}
