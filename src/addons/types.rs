//! Add-on type definitions.
//!
//! Core data structures shared by the scanner, resolver, installer and
//! deletion flows.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::SourceFingerprint;

/// Catalog identifier of an add-on.
pub type AddonId = u64;

/// Version assumed when an add-on ships no version descriptor.
pub const DEFAULT_LOCAL_VERSION: &str = "1.0.0";

/// One folder shipped by an add-on package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderSpec {
    /// Top-level folder name inside the installation root.
    pub folder_name: String,
    /// Whether this folder identifies the add-on as installed.
    #[serde(default)]
    pub is_main: bool,
}

impl FolderSpec {
    /// Creates a folder spec.
    #[must_use]
    pub fn new(folder_name: impl Into<String>, is_main: bool) -> Self {
        Self {
            folder_name: folder_name.into(),
            is_main,
        }
    }
}

/// An add-on record as published by the remote catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    /// Catalog identifier.
    pub id: AddonId,
    /// Display title.
    pub title: String,
    /// Published version string.
    pub version: String,
    /// URL of the hosted package file.
    pub download_url: String,
    /// Source-control repository link, when the author publishes one.
    #[serde(default)]
    pub source_repo_url: Option<String>,
    /// Folders shipped by the package, in catalog order.
    #[serde(default)]
    pub folder_list: Vec<FolderSpec>,
    /// Parent entry when this entry is a variation.
    #[serde(default)]
    pub variation_of: Option<AddonId>,
    /// Variations published under this entry.
    #[serde(default)]
    pub variant_ids: BTreeSet<AddonId>,
}

impl CatalogEntry {
    /// Creates an entry with the given folders and no links.
    #[must_use]
    pub fn new(id: AddonId, title: &str, version: &str, folders: Vec<FolderSpec>) -> Self {
        Self {
            id,
            title: title.to_string(),
            version: version.to_string(),
            download_url: format!("https://cdn.example.invalid/{}/{}.zip", id, version),
            source_repo_url: None,
            folder_list: folders,
            variation_of: None,
            variant_ids: BTreeSet::new(),
        }
    }

    /// Returns the main folder name.
    ///
    /// When an entry wrongly declares several main folders the first wins.
    #[must_use]
    pub fn main_folder(&self) -> Option<&str> {
        self.folder_list
            .iter()
            .find(|f| f.is_main)
            .map(|f| f.folder_name.as_str())
    }

    /// Returns every declared folder name.
    pub fn folder_names(&self) -> impl Iterator<Item = &str> {
        self.folder_list.iter().map(|f| f.folder_name.as_str())
    }

    /// Returns true if `folder` is declared by this entry.
    #[must_use]
    pub fn declares(&self, folder: &str) -> bool {
        self.folder_names().any(|f| f == folder)
    }

    /// Checks the folder-list invariant.
    ///
    /// An entry with several main folders is reported as an error here but
    /// callers may still use it through [`Self::main_folder`].
    pub fn validate(&self) -> Result<(), AddonError> {
        if self.folder_list.is_empty() {
            return Err(AddonError::MalformedCatalog {
                id: self.id,
                reason: "empty folder list".to_string(),
            });
        }

        let mains = self.folder_list.iter().filter(|f| f.is_main).count();
        match mains {
            0 => Err(AddonError::MalformedCatalog {
                id: self.id,
                reason: "no main folder".to_string(),
            }),
            1 => Ok(()),
            n => Err(AddonError::MalformedCatalog {
                id: self.id,
                reason: format!("{} main folders", n),
            }),
        }
    }
}

/// An add-on found on disk and matched to a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledAddon {
    /// Main folder on disk; the key of the installed map.
    pub folder: String,
    /// Catalog entry snapshot taken at scan time.
    pub entry: CatalogEntry,
    /// Version read from the on-disk descriptor.
    pub local_version: String,
    /// Title declared by the on-disk descriptor.
    pub local_title: Option<String>,
    /// Catalog version recorded at install time.
    pub backend_version: Option<String>,
    /// Package filename recorded at install time.
    pub installed_filename: String,
    /// Upstream fingerprint recorded at install time.
    pub source_fingerprint: Option<SourceFingerprint>,
    /// True if any declared folder is missing on disk.
    pub corrupted: bool,
    /// Declared folders not present on disk.
    pub missing_folders: BTreeSet<String>,
}

impl InstalledAddon {
    /// Returns the catalog id.
    #[must_use]
    pub fn id(&self) -> AddonId {
        self.entry.id
    }

    /// Returns true if `folder` is part of this add-on's declared folders.
    #[must_use]
    pub fn owns(&self, folder: &str) -> bool {
        self.entry.declares(folder)
    }
}

/// A folder claimed as main by several catalog entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Contested folder; doubles as the conflict id.
    pub folder: String,
    /// Catalog ids claiming the folder, ascending.
    pub candidates: Vec<AddonId>,
    /// Version read from the folder's descriptor.
    pub local_version: String,
}

/// Options for one install request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    /// Reinstall even when the add-on is up to date.
    pub reinstall: bool,
    /// Skip the bundled-dependents confirmation.
    pub skip_bundle_check: bool,
    /// Part of an update-all batch: no per-item notification or rescan.
    pub batch: bool,
}

impl InstallOptions {
    /// Options for an update-all batch item.
    #[must_use]
    pub fn batch_update() -> Self {
        Self {
            reinstall: true,
            skip_bundle_check: true,
            batch: true,
        }
    }
}

/// Add-on engine errors.
#[derive(Debug, Error)]
pub enum AddonError {
    /// A path resolved outside the installation root.
    #[error("Path escapes installation root: {}", .0.display())]
    PathViolation(PathBuf),

    /// Network or remote API failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote API rate limit exceeded.
    #[error("Source-control API rate limit exceeded")]
    RateLimited,

    /// Filesystem operation failed.
    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        /// Path the operation targeted.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Catalog entry violates the folder-list invariant.
    #[error("Malformed catalog entry {id}: {reason}")]
    MalformedCatalog {
        /// Offending entry.
        id: AddonId,
        /// What is wrong with it.
        reason: String,
    },

    /// Archive could not be read or extracted.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Id not present in the catalog.
    #[error("Add-on {0} not found in catalog")]
    NotInCatalog(AddonId),

    /// Folder is not an installed add-on.
    #[error("Add-on '{0}' is not installed")]
    NotInstalled(String),

    /// No pending conflict for the folder.
    #[error("No conflict pending for folder '{0}'")]
    UnknownConflict(String),

    /// Chosen entry is not a candidate of the conflict.
    #[error("Add-on {id} does not claim folder '{folder}'")]
    InvalidChoice {
        /// Contested folder.
        folder: String,
        /// Rejected choice.
        id: AddonId,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AddonError {
    /// Wraps an I/O error with the path it concerns.
    pub fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Returns true if repeating the operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Filesystem { source, .. } => source.kind() != io::ErrorKind::NotFound,
            Self::Network(_) => true,
            _ => false,
        }
    }
}
