//! Shared fixtures for engine integration tests.
//!
//! Provides a temporary installation root, in-memory zip archives, and
//! fake network collaborators so tests never leave the machine.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use addonkeeper::addons::{
    AddonEngine, AddonError, CatalogEntry, CatalogIndex, CommitInfo, Downloader, EngineEvent,
    EngineSettings, EventSink, LocalFs, ReleaseInfo, RepoRef, SourceControl, RECORD_FILE_NAME,
};

/// Temporary installation root plus a separate download cache.
pub struct Fixture {
    pub root: TempDir,
    pub cache: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().unwrap(),
            cache: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.path(rel).exists()
    }

    pub fn write(&self, rel: &str, contents: &str) {
        let path = self.path(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap()
    }

    /// Creates `folder` with a manifest carrying `title` and `version`.
    pub fn addon_folder(&self, folder: &str, title: &str, version: &str) {
        self.write(
            &format!("{folder}/{folder}.toc"),
            &format!("## Title: {title}\n## Version: {version}\n{folder}.lua\n"),
        );
    }

    /// Writes a sidecar into `folder`.
    pub fn sidecar(&self, folder: &str, contents: &str) {
        self.write(&format!("{folder}/{RECORD_FILE_NAME}"), contents);
    }

    pub fn record(&self, folder: &str) -> String {
        self.read(&format!("{folder}/{RECORD_FILE_NAME}"))
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            cache_dir: self.cache.path().to_path_buf(),
            prefer_source_control: false,
            delete_retries: 1,
            delete_backoff: Duration::from_millis(1),
        }
    }

    /// Engine over this root with fake collaborators.
    pub fn engine(&self, entries: Vec<CatalogEntry>, downloader: FakeDownloader) -> AddonEngine {
        let gateway = LocalFs::new(self.root.path()).unwrap();
        AddonEngine::new(Arc::new(gateway), CatalogIndex::new(entries), Arc::new(downloader))
            .with_settings(self.settings())
    }
}

/// Builds a zip archive in memory. Paths ending in `/` become directories.
pub fn zip_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    for (name, contents) in files {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
    }

    writer.finish().unwrap().into_inner()
}

/// Serves prebuilt archives instead of fetching them.
#[derive(Default)]
pub struct FakeDownloader {
    by_url: HashMap<String, Vec<u8>>,
    fallback: Option<Vec<u8>>,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl FakeDownloader {
    /// Serves `archive` for every URL.
    pub fn serving(archive: Vec<u8>) -> Self {
        Self {
            fallback: Some(archive),
            ..Self::default()
        }
    }

    /// Fails every download.
    pub fn offline() -> Self {
        Self::default()
    }

    /// Serves `archive` for one URL only.
    pub fn with_url(mut self, url: &str, archive: Vec<u8>) -> Self {
        self.by_url.insert(url.to_string(), archive);
        self
    }
}

impl Downloader for FakeDownloader {
    fn download(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(u8)) -> Result<(), AddonError> {
        self.requests.lock().unwrap().push(url.to_string());

        let Some(bytes) = self.by_url.get(url).or(self.fallback.as_ref()) else {
            return Err(AddonError::Network(format!("no route to {url}")));
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| AddonError::fs(parent, e))?;
        }
        fs::write(dest, bytes).map_err(|e| AddonError::fs(dest, e))?;
        progress(50);
        progress(100);
        Ok(())
    }
}

/// Source control answering from fixed values.
#[derive(Default)]
pub struct FakeSourceControl {
    pub release: Option<ReleaseInfo>,
    pub commit: Option<CommitInfo>,
}

impl FakeSourceControl {
    pub fn with_release(tag: &str, published_at: DateTime<Utc>) -> Self {
        Self {
            release: Some(ReleaseInfo {
                tag: tag.to_string(),
                published_at,
            }),
            commit: None,
        }
    }
}

impl SourceControl for FakeSourceControl {
    fn latest_release(&self, _repo: &RepoRef) -> Result<Option<ReleaseInfo>, AddonError> {
        Ok(self.release.clone())
    }

    fn latest_commit(&self, _repo: &RepoRef) -> Result<Option<CommitInfo>, AddonError> {
        Ok(self.commit.clone())
    }
}

/// Source control whose every lookup fails.
pub struct UnreachableSourceControl;

impl SourceControl for UnreachableSourceControl {
    fn latest_release(&self, repo: &RepoRef) -> Result<Option<ReleaseInfo>, AddonError> {
        Err(AddonError::Network(format!("{repo} unreachable")))
    }

    fn latest_commit(&self, repo: &RepoRef) -> Result<Option<CommitInfo>, AddonError> {
        Err(AddonError::Network(format!("{repo} unreachable")))
    }
}

/// Records every event it receives.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}
