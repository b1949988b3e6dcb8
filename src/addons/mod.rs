//! Add-on reconciliation engine.
//!
//! Discovers what is installed under a game client's add-on root, matches
//! it against a remote catalog and drives install, update and uninstall
//! operations without breaking bundled or variant packages.
//!
//! # Architecture
//!
//! - **scanner**: matches on-disk folders to catalog entries
//! - **freshness**: decides which installed add-ons are stale
//! - **graph** / **ownership**: parent and child relationships, folder safety
//! - **installer**: the per-add-on install state machine
//! - **deletion**: uninstall with protection of shared folders
//! - **engine**: facade, events and update-all
//! - **worker**: runs the engine on a background thread
//!
//! # Usage
//!
//! ```ignore
//! use addonkeeper::addons::{AddonEngine, BackgroundEngine, CatalogIndex, HttpDownloader, LocalFs};
//!
//! let engine = AddonEngine::new(Arc::new(LocalFs::new(root)?), CatalogIndex::new(entries), Arc::new(HttpDownloader::new()));
//! let worker = BackgroundEngine::spawn(engine);
//! worker.request_scan();
//! // ... poll for events in the main loop
//! ```

mod catalog;
mod deletion;
mod download;
mod engine;
pub mod freshness;
mod gateway;
mod github;
mod graph;
mod installer;
mod normalize;
pub mod ownership;
mod record;
mod scanner;
mod types;
mod version;
mod worker;

pub use catalog::{fetch_all, CatalogIndex, CatalogPage, CatalogSource, JsonCatalog};
pub use deletion::{delete_folders, DeletionOrchestrator, DeletionReport, RetryPolicy};
pub use download::{Downloader, HttpDownloader, ProgressTracker};
pub use engine::{
    AddonEngine, AddonStatus, BatchSummary, EngineEvent, EngineSettings, EventSink, NullSink,
};
pub use freshness::Freshness;
pub use gateway::{confine, DirEntryInfo, FsGateway, LocalFs};
pub use github::{
    latest_fingerprint, newest_fingerprint, CommitInfo, GitHubClient, ReleaseInfo, RepoRef,
    SourceControl,
};
pub use graph::{all_descendants, children_of, exclusive_children, parents_of, InstalledMap};
pub use installer::{InstallOutcome, InstallPlan, InstallerPipeline, PipelinePhase, PipelineState};
pub use normalize::{is_scaffolding, normalize_layout};
pub use ownership::FolderPlan;
pub use record::{filename_from_url, FingerprintKind, InstallRecord, SourceFingerprint, RECORD_FILE_NAME};
pub use scanner::{scan, ScanResult, Scanner};
pub use types::{
    AddonError, AddonId, CatalogEntry, Conflict, FolderSpec, InstallOptions, InstalledAddon,
    DEFAULT_LOCAL_VERSION,
};
pub use version::{compare_versions, AddonVersion, Descriptor};
pub use worker::{BackgroundEngine, EngineRequest, WorkerStatus};

