//! Add-on engine facade.
//!
//! [`AddonEngine`] owns the current scan state and exposes the operations a
//! presentation layer calls: scan, conflict resolution, install, delete and
//! update-all. Progress and results are reported through an [`EventSink`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::catalog::CatalogIndex;
use super::deletion::{DeletionOrchestrator, DeletionReport, RetryPolicy};
use super::download::Downloader;
use super::freshness::{self, Freshness};
use super::gateway::FsGateway;
use super::github::SourceControl;
use super::installer::{InstallOutcome, InstallerPipeline, PipelinePhase};
use super::scanner::{self, adoption_record, read_descriptor, record_path, ScanResult};
use super::types::{AddonError, AddonId, Conflict, InstallOptions};

/// Tunables for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Where downloaded archives are kept until extracted.
    pub cache_dir: PathBuf,
    /// Try the repository archive before the hosted file.
    pub prefer_source_control: bool,
    /// Extra attempts for a failed folder delete.
    pub delete_retries: u32,
    /// Wait before the first delete retry.
    pub delete_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            cache_dir: std::env::temp_dir().join("addonkeeper"),
            prefer_source_control: true,
            delete_retries: policy.retries,
            delete_backoff: policy.backoff,
        }
    }
}

/// Summary of one installed add-on for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonStatus {
    pub folder: String,
    pub id: AddonId,
    pub title: String,
    pub local_version: String,
    pub catalog_version: String,
    pub freshness: Freshness,
}

/// Result of an update-all run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Add-ons installed successfully.
    pub updated: Vec<AddonId>,
    /// Add-ons whose install failed, with the reason.
    pub failed: Vec<(AddonId, String)>,
}

/// Engine notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A scan pass finished.
    ScanFinished {
        addons: Vec<AddonStatus>,
        conflicts: Vec<Conflict>,
    },
    /// An install entered a new phase.
    StateChanged { addon_id: AddonId, phase: PipelinePhase },
    /// Download progress in percent.
    DownloadProgress { addon_id: AddonId, percent: u8 },
    /// An install stopped because bundled dependents would be replaced.
    ConfirmationRequired {
        addon_id: AddonId,
        dependents: Vec<AddonId>,
    },
    /// A folder could not be deleted; the operation continued.
    FolderDeleteFailed { folder: String, reason: String },
    /// Human-readable outcome of an operation.
    Notification(String),
    /// Update-all finished.
    BatchFinished(BatchSummary),
    /// An operation failed.
    Error(String),
    /// The background worker finished a request.
    Idle,
}

/// Receives engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

impl EventSink for Sender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        if self.send(event).is_err() {
            debug!("[ENGINE] Event receiver dropped");
        }
    }
}

/// Discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Reconciliation engine over one installation root.
pub struct AddonEngine {
    gateway: Arc<dyn FsGateway>,
    catalog: CatalogIndex,
    source_control: Option<Arc<dyn SourceControl>>,
    downloader: Arc<dyn Downloader>,
    settings: EngineSettings,
    sink: Arc<dyn EventSink>,
    state: ScanResult,
    freshness: BTreeMap<String, Freshness>,
}

impl AddonEngine {
    /// Creates an engine. Call [`Self::scan`] before anything else.
    #[must_use]
    pub fn new(
        gateway: Arc<dyn FsGateway>,
        catalog: CatalogIndex,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Self {
            gateway,
            catalog,
            source_control: None,
            downloader,
            settings: EngineSettings::default(),
            sink: Arc::new(NullSink),
            state: ScanResult::default(),
            freshness: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_source_control(mut self, source_control: Arc<dyn SourceControl>) -> Self {
        self.source_control = Some(source_control);
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the event sink.
    pub fn set_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sink = sink;
    }

    /// State of the last scan.
    #[must_use]
    pub fn state(&self) -> &ScanResult {
        &self.state
    }

    #[must_use]
    pub fn catalog(&self) -> &CatalogIndex {
        &self.catalog
    }

    /// Freshness of an installed add-on from the last scan.
    #[must_use]
    pub fn freshness(&self, folder: &str) -> Option<Freshness> {
        self.freshness.get(folder).copied()
    }

    /// Installed add-ons with their freshness, ordered by folder.
    #[must_use]
    pub fn statuses(&self) -> Vec<AddonStatus> {
        self.state
            .installed
            .values()
            .map(|a| AddonStatus {
                folder: a.folder.clone(),
                id: a.id(),
                title: a.entry.title.clone(),
                local_version: a.local_version.clone(),
                catalog_version: a.entry.version.clone(),
                freshness: self.freshness.get(&a.folder).copied().unwrap_or_default(),
            })
            .collect()
    }

    /// Rescans the root and re-resolves freshness.
    pub fn scan(&mut self) -> Result<&ScanResult, AddonError> {
        self.state = scanner::scan(self.gateway.as_ref(), self.catalog.entries())?;

        let source = self.source_control.as_deref();
        self.freshness = self
            .state
            .installed
            .iter()
            .map(|(folder, addon)| (folder.clone(), freshness::resolve(addon, source)))
            .collect();

        let stale = self.freshness.values().filter(|f| f.needs_update()).count();
        info!(
            "[ENGINE] Scan: {} installed, {} need update, {} conflict(s)",
            self.state.installed.len(),
            stale,
            self.state.conflicts.len()
        );

        self.sink.emit(EngineEvent::ScanFinished {
            addons: self.statuses(),
            conflicts: self.state.conflicts.clone(),
        });
        Ok(&self.state)
    }

    /// Settles a conflict by recording `id` as the folder's owner.
    pub fn resolve_conflict(&mut self, folder: &str, id: AddonId) -> Result<(), AddonError> {
        let conflict = self
            .state
            .conflicts
            .iter()
            .find(|c| c.folder == folder)
            .ok_or_else(|| AddonError::UnknownConflict(folder.to_string()))?;
        if !conflict.candidates.contains(&id) {
            return Err(AddonError::InvalidChoice {
                folder: folder.to_string(),
                id,
            });
        }
        let entry = self.catalog.get(id).ok_or(AddonError::NotInCatalog(id))?;

        let descriptor = read_descriptor(self.gateway.as_ref(), folder)?;
        let previous = scanner::read_record(self.gateway.as_ref(), folder)?;
        let record = adoption_record(entry, &descriptor, previous.as_ref());
        self.gateway
            .overwrite(&record_path(self.gateway.root(), folder), &record.render())?;
        info!("[ENGINE] Conflict on '{}' resolved to {}", folder, id);

        self.scan()?;
        self.notify(format!("'{}' is now tracked as {}", folder, entry_title(&self.catalog, id)));
        Ok(())
    }

    /// Installs or updates one add-on.
    pub fn install(&mut self, id: AddonId, options: InstallOptions) -> Result<InstallOutcome, AddonError> {
        let result = {
            let pipeline = InstallerPipeline::new(
                self.gateway.as_ref(),
                &self.catalog,
                &self.state.installed,
                self.downloader.as_ref(),
                &self.settings,
                self.sink.as_ref(),
            )
            .with_source_control(self.source_control.as_deref());
            pipeline.run(id, options)
        };

        match result {
            Ok(InstallOutcome::NeedsConfirmation { ref dependents }) => {
                self.sink.emit(EngineEvent::ConfirmationRequired {
                    addon_id: id,
                    dependents: dependents.clone(),
                });
            }
            Ok(InstallOutcome::Installed) if !options.batch => {
                self.scan()?;
                self.notify(format!("Installed {}", entry_title(&self.catalog, id)));
            }
            Ok(InstallOutcome::UpToDate) if !options.batch => {
                self.notify(format!("{} is up to date", entry_title(&self.catalog, id)));
            }
            Ok(_) => {}
            Err(ref e) => {
                self.sink.emit(EngineEvent::Error(format!(
                    "Installing {} failed: {}",
                    entry_title(&self.catalog, id),
                    e
                )));
            }
        }

        result
    }

    /// Deletes an installed add-on and the descendants not listed in
    /// `keep_ids`.
    pub fn delete(&mut self, folder: &str, keep_ids: &BTreeSet<AddonId>) -> Result<DeletionReport, AddonError> {
        let policy = RetryPolicy {
            retries: self.settings.delete_retries,
            backoff: self.settings.delete_backoff,
        };
        let report = DeletionOrchestrator::new(
            self.gateway.as_ref(),
            &self.state.installed,
            &self.catalog,
            policy,
        )
        .delete(folder, keep_ids)?;

        for (failed, reason) in &report.failed {
            self.sink.emit(EngineEvent::FolderDeleteFailed {
                folder: failed.clone(),
                reason: reason.clone(),
            });
        }

        self.scan()?;
        self.notify(format!(
            "Deleted {} folder(s), {} kept, {} failed",
            report.removed.len(),
            report.protected.len(),
            report.failed.len()
        ));
        Ok(report)
    }

    /// Updates every installed add-on that needs it, one at a time.
    pub fn update_all(&mut self) -> Result<BatchSummary, AddonError> {
        let mut queue: VecDeque<AddonId> = self
            .state
            .installed
            .iter()
            .filter(|(folder, _)| self.freshness.get(*folder).is_some_and(|f| f.needs_update()))
            .map(|(_, addon)| addon.id())
            .collect();

        info!("[ENGINE] Update-all: {} queued", queue.len());
        let mut summary = BatchSummary::default();

        while let Some(id) = queue.pop_front() {
            debug!("[ENGINE] Updating {} ({} left)", id, queue.len());
            match self.install(id, InstallOptions::batch_update()) {
                Ok(_) => summary.updated.push(id),
                Err(e) => {
                    warn!("[ENGINE] Update of {} failed: {}", id, e);
                    summary.failed.push((id, e.to_string()));
                }
            }
        }

        self.sink.emit(EngineEvent::BatchFinished(summary.clone()));
        self.scan()?;
        Ok(summary)
    }

    fn notify(&self, message: String) {
        self.sink.emit(EngineEvent::Notification(message));
    }
}

fn entry_title(catalog: &CatalogIndex, id: AddonId) -> String {
    catalog
        .get(id)
        .map_or_else(|| id.to_string(), |e| e.title.clone())
}
