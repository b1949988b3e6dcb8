//! Catalog access.
//!
//! The remote catalog is an external collaborator reached through
//! [`CatalogSource`]. The engine only reads entries; [`CatalogIndex`] keeps
//! them addressable by id and resolves variation families.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use super::types::{AddonError, AddonId, CatalogEntry};

/// Upper bound on pages fetched in one pass.
const MAX_CATALOG_PAGES: usize = 500;

/// Entries per page served by [`JsonCatalog`].
const JSON_PAGE_SIZE: usize = 100;

/// Maximum hops followed along `variation_of` links.
const MAX_VARIATION_DEPTH: usize = 16;

/// One page of catalog results.
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub entries: Vec<CatalogEntry>,
    /// True if another page follows.
    pub has_more: bool,
}

/// Paged catalog access.
pub trait CatalogSource: Send + Sync {
    /// Fetches page `page`, starting at zero.
    fn fetch_page(&self, page: usize) -> Result<CatalogPage, AddonError>;
}

/// Pages through a source until it reports no further pages.
pub fn fetch_all(source: &dyn CatalogSource) -> Result<Vec<CatalogEntry>, AddonError> {
    let mut entries = Vec::new();

    for page in 0..MAX_CATALOG_PAGES {
        let result = source.fetch_page(page)?;
        debug!("[CATALOG] Page {}: {} entries", page, result.entries.len());
        entries.extend(result.entries);
        if !result.has_more {
            info!("[CATALOG] Fetched {} entries in {} page(s)", entries.len(), page + 1);
            return Ok(entries);
        }
    }

    warn!("[CATALOG] Stopped after {} pages", MAX_CATALOG_PAGES);
    Ok(entries)
}

/// Catalog stored as a JSON array of entries on disk.
///
/// The file is parsed on the first page request and reused for the rest.
#[derive(Debug)]
pub struct JsonCatalog {
    path: PathBuf,
    loaded: RwLock<Option<Arc<Vec<CatalogEntry>>>>,
}

impl JsonCatalog {
    /// Creates a source reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: RwLock::new(None),
        }
    }

    fn load(&self) -> Result<Arc<Vec<CatalogEntry>>, AddonError> {
        if let Ok(guard) = self.loaded.read() {
            if let Some(ref entries) = *guard {
                return Ok(Arc::clone(entries));
            }
        }

        let content = fs::read_to_string(&self.path).map_err(|e| AddonError::fs(&self.path, e))?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&content).map_err(|e| {
            AddonError::Config(format!("Invalid catalog {}: {}", self.path.display(), e))
        })?;
        debug!("[CATALOG] Loaded {} entries from {}", entries.len(), self.path.display());

        let entries = Arc::new(entries);
        if let Ok(mut guard) = self.loaded.write() {
            *guard = Some(Arc::clone(&entries));
        }
        Ok(entries)
    }
}

impl CatalogSource for JsonCatalog {
    fn fetch_page(&self, page: usize) -> Result<CatalogPage, AddonError> {
        let all = self.load()?;
        let start = page.saturating_mul(JSON_PAGE_SIZE);
        let entries: Vec<_> = all.iter().skip(start).take(JSON_PAGE_SIZE).cloned().collect();
        let has_more = start + entries.len() < all.len();
        Ok(CatalogPage { entries, has_more })
    }
}

/// Catalog entries indexed by id.
#[derive(Debug, Clone, Default)]
pub struct CatalogIndex {
    entries: Vec<CatalogEntry>,
    by_id: HashMap<AddonId, usize>,
}

impl CatalogIndex {
    /// Builds an index. Later duplicates of an id are dropped.
    #[must_use]
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        let mut index = Self::default();
        for entry in entries {
            if index.by_id.contains_key(&entry.id) {
                warn!("[CATALOG] Duplicate entry id {} ignored", entry.id);
                continue;
            }
            index.by_id.insert(entry.id, index.entries.len());
            index.entries.push(entry);
        }
        index
    }

    /// Looks up an entry.
    #[must_use]
    pub fn get(&self, id: AddonId) -> Option<&CatalogEntry> {
        self.by_id.get(&id).map(|&i| &self.entries[i])
    }

    /// All entries in catalog order.
    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Follows `variation_of` links to the top-level entry.
    ///
    /// Stops at a missing parent or a cycle and returns the last entry
    /// reached.
    #[must_use]
    pub fn variation_root(&self, id: AddonId) -> AddonId {
        let mut current = id;
        let mut visited = BTreeSet::from([id]);

        for _ in 0..MAX_VARIATION_DEPTH {
            let Some(parent) = self.get(current).and_then(|e| e.variation_of) else {
                break;
            };
            if self.get(parent).is_none() || !visited.insert(parent) {
                break;
            }
            current = parent;
        }

        current
    }

    /// Returns the variation family of `id`: its root and every variant of
    /// the root, plus `id` itself.
    #[must_use]
    pub fn family(&self, id: AddonId) -> Vec<&CatalogEntry> {
        let root = self.variation_root(id);
        let mut ids = BTreeSet::from([root, id]);

        if let Some(root_entry) = self.get(root) {
            ids.extend(root_entry.variant_ids.iter().copied());
        }
        // Variants that point at the root without being listed by it.
        ids.extend(
            self.entries
                .iter()
                .filter(|e| e.variation_of == Some(root))
                .map(|e| e.id),
        );

        ids.into_iter().filter_map(|i| self.get(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::types::FolderSpec;

    fn entry(id: AddonId, parent: Option<AddonId>, variants: &[AddonId]) -> CatalogEntry {
        let mut e = CatalogEntry::new(id, &format!("A{}", id), "1.0", vec![FolderSpec::new("F", true)]);
        e.variation_of = parent;
        e.variant_ids = variants.iter().copied().collect();
        e
    }

    #[test]
    fn test_family_from_variant() {
        let index = CatalogIndex::new(vec![
            entry(1, None, &[2]),
            entry(2, Some(1), &[]),
            entry(3, Some(1), &[]),
            entry(4, None, &[]),
        ]);
        let ids: Vec<_> = index.family(2).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(index.variation_root(3), 1);
    }

    #[test]
    fn test_variation_cycle_terminates() {
        let index = CatalogIndex::new(vec![entry(1, Some(2), &[]), entry(2, Some(1), &[])]);
        let root = index.variation_root(1);
        assert!(root == 1 || root == 2);
        assert_eq!(index.family(1).len(), 2);
    }

    #[test]
    fn test_duplicate_ids_keep_first() {
        let mut dup = entry(1, None, &[]);
        dup.title = "Other".into();
        let index = CatalogIndex::new(vec![entry(1, None, &[]), dup]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(1).map(|e| e.title.as_str()), Some("A1"));
    }

    struct Paged(Vec<Vec<CatalogEntry>>);

    impl CatalogSource for Paged {
        fn fetch_page(&self, page: usize) -> Result<CatalogPage, AddonError> {
            Ok(CatalogPage {
                entries: self.0.get(page).cloned().unwrap_or_default(),
                has_more: page + 1 < self.0.len(),
            })
        }
    }

    #[test]
    fn test_json_catalog_parsed_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        let entries: Vec<_> = (1..=150).map(|id| entry(id, None, &[])).collect();
        fs::write(&path, serde_json::to_string(&entries).unwrap()).unwrap();
        let source = JsonCatalog::new(&path);

        let first = source.fetch_page(0).unwrap();
        assert_eq!(first.entries.len(), JSON_PAGE_SIZE);
        assert!(first.has_more);

        fs::write(&path, "not json").unwrap();
        let second = source.fetch_page(1).unwrap();
        assert_eq!(second.entries.len(), 50);
        assert!(!second.has_more);
    }

    #[test]
    fn test_json_catalog_invalid_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(&path, "[{").unwrap();
        assert!(matches!(
            JsonCatalog::new(&path).fetch_page(0),
            Err(AddonError::Config(_))
        ));
    }

    #[test]
    fn test_fetch_all_pages() {
        let source = Paged(vec![vec![entry(1, None, &[])], vec![entry(2, None, &[])]]);
        let all = fetch_all(&source).unwrap();
        assert_eq!(all.len(), 2);
    }
}
