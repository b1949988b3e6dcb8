//! Folder layout normalization after extraction.
//!
//! Repository archives rarely unpack into the layout the game client
//! expects. This pass renames a wrapper folder to the main folder, flattens
//! wrappers holding several declared folders, collapses folders nested in
//! themselves and removes repository scaffolding left at the root.

use std::path::Path;

use tracing::{debug, info};

use super::gateway::{DirEntryInfo, FsGateway};
use super::types::{AddonError, CatalogEntry};

/// Maximum self-nesting levels collapsed per folder.
const MAX_NESTING_DEPTH: usize = 4;

/// Exact names treated as repository scaffolding.
const SCAFFOLDING_NAMES: &[&str] = &[".git", ".github", ".gitignore", ".gitattributes", ".gitmodules"];

/// Name prefixes treated as repository scaffolding, matched case-insensitively.
const SCAFFOLDING_PREFIXES: &[&str] = &["license", "readme", "changelog"];

/// Returns true if a root entry is repository scaffolding.
#[must_use]
pub fn is_scaffolding(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SCAFFOLDING_NAMES.contains(&lower.as_str())
        || SCAFFOLDING_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Normalizes the layout produced by one extraction.
///
/// `new_entries` are the root entries that did not exist before the
/// archive was unpacked. Fails if the main folder is still missing
/// afterwards.
pub fn normalize_layout(
    gateway: &dyn FsGateway,
    entry: &CatalogEntry,
    new_entries: &[DirEntryInfo],
) -> Result<(), AddonError> {
    let main = entry.main_folder().ok_or_else(|| AddonError::MalformedCatalog {
        id: entry.id,
        reason: "no main folder".to_string(),
    })?;
    let root = gateway.root().to_path_buf();

    let new_dirs: Vec<&DirEntryInfo> = new_entries
        .iter()
        .filter(|e| e.is_dir && !is_scaffolding(&e.name))
        .collect();

    let mut produced: Vec<String> = new_dirs.iter().map(|e| e.name.clone()).collect();
    if let [wrapper] = new_dirs.as_slice() {
        if wrapper.name != main && !entry.declares(&wrapper.name) {
            produced = unwrap_folder(gateway, entry, &root, &wrapper.name, main)?;
        }
    }

    // Folders that existed before this extraction are never rewritten.
    for folder in produced.iter().filter(|f| entry.declares(f)) {
        collapse_self_nesting(gateway, &root, folder)?;
    }

    for scaffold in new_entries.iter().filter(|e| is_scaffolding(&e.name)) {
        let path = root.join(&scaffold.name);
        if !gateway.exists(&path) {
            continue;
        }
        debug!("[INSTALL] Removing scaffolding {}", scaffold.name);
        if scaffold.is_dir {
            gateway.delete_folder_recursive(&path)?;
        } else {
            gateway.delete_file(&path)?;
        }
    }

    if !gateway.exists(&root.join(main)) {
        return Err(AddonError::Archive(format!(
            "Main folder '{}' missing after extraction",
            main
        )));
    }

    Ok(())
}

/// Moves a single wrapper folder into place.
///
/// A wrapper holding two or more declared folders is flattened into the
/// root; any other wrapper becomes the main folder. Returns the root
/// folders it produced.
fn unwrap_folder(
    gateway: &dyn FsGateway,
    entry: &CatalogEntry,
    root: &Path,
    wrapper: &str,
    main: &str,
) -> Result<Vec<String>, AddonError> {
    let wrapper_path = root.join(wrapper);
    let children = gateway.list_dir(&wrapper_path)?;
    let declared = children
        .iter()
        .filter(|c| c.is_dir && entry.declares(&c.name))
        .count();

    let mut produced = Vec::new();
    if declared >= 2 {
        info!("[INSTALL] Flattening '{}' into the root", wrapper);
        for child in children.iter().filter(|c| c.is_dir && !is_scaffolding(&c.name)) {
            gateway.copy_recursive(&wrapper_path.join(&child.name), &root.join(&child.name))?;
            produced.push(child.name.clone());
        }
    } else {
        info!("[INSTALL] Renaming '{}' to '{}'", wrapper, main);
        gateway.copy_recursive(&wrapper_path, &root.join(main))?;
        produced.push(main.to_string());
    }

    gateway.delete_folder_recursive(&wrapper_path)?;
    Ok(produced)
}

/// Replaces `folder/folder/...` with its innermost level.
///
/// A level is only collapsed while it holds nothing but the same-named
/// inner folder and scaffolding.
fn collapse_self_nesting(gateway: &dyn FsGateway, root: &Path, folder: &str) -> Result<(), AddonError> {
    let outer = root.join(folder);

    for _ in 0..MAX_NESTING_DEPTH {
        if !is_bare_wrapper(gateway, &outer, folder)? {
            return Ok(());
        }

        debug!("[INSTALL] Collapsing nested '{}'", folder);
        let temp = root.join(format!(".{}.normalize", folder));
        if gateway.exists(&temp) {
            gateway.delete_folder_recursive(&temp)?;
        }
        gateway.copy_recursive(&outer.join(folder), &temp)?;
        gateway.delete_folder_recursive(&outer)?;
        gateway.copy_recursive(&temp, &outer)?;
        gateway.delete_folder_recursive(&temp)?;
    }

    Ok(())
}

/// True if `dir` contains the folder `name` and nothing else but scaffolding.
fn is_bare_wrapper(gateway: &dyn FsGateway, dir: &Path, name: &str) -> Result<bool, AddonError> {
    if !gateway.exists(&dir.join(name)) {
        return Ok(false);
    }
    Ok(gateway
        .list_dir(dir)?
        .iter()
        .all(|e| (e.is_dir && e.name == name) || is_scaffolding(&e.name)))
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
        let gw = LocalFs::new(dir.path()).unwrap();
        (dir, gw)
    }

    fn touch(dir: &TempDir, rel: &str) {
        let p = dir.path().join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, "x").unwrap();
    }

    fn new_dir(name: &str) -> DirEntryInfo {
        DirEntryInfo { name: name.into(), is_dir: true }
    }

    fn new_file(name: &str) -> DirEntryInfo {
        DirEntryInfo { name: name.into(), is_dir: false }
    }

    #[test]
    fn test_wrapper_renamed_to_main() {
        let (dir, gw) = setup();
        touch(&dir, "Repo-main/Foo.toc");
        touch(&dir, "Repo-main/core.lua");
        let entry = CatalogEntry::new(1, "Foo", "1.0", vec![FolderSpec::new("Foo", true)]);

        normalize_layout(&gw, &entry, &[new_dir("Repo-main")]).unwrap();

        assert!(dir.path().join("Foo/core.lua").exists());
        assert!(!dir.path().join("Repo-main").exists());
    }

    #[test]
    fn test_wrapper_with_declared_folders_flattened() {
        let (dir, gw) = setup();
        touch(&dir, "Pack-1.0/Foo/Foo.toc");
        touch(&dir, "Pack-1.0/FooLib/lib.lua");
        touch(&dir, "Pack-1.0/.github/ci.yml");
        let entry = CatalogEntry::new(
            1,
            "Foo",
            "1.0",
            vec![FolderSpec::new("Foo", true), FolderSpec::new("FooLib", false)],
        );

        normalize_layout(&gw, &entry, &[new_dir("Pack-1.0")]).unwrap();

        assert!(dir.path().join("Foo/Foo.toc").exists());
        assert!(dir.path().join("FooLib/lib.lua").exists());
        assert!(!dir.path().join(".github").exists());
        assert!(!dir.path().join("Pack-1.0").exists());
    }

    #[test]
    fn test_self_nesting_collapsed() {
        let (dir, gw) = setup();
        touch(&dir, "Foo/Foo/Foo/Foo.toc");
        let entry = CatalogEntry::new(1, "Foo", "1.0", vec![FolderSpec::new("Foo", true)]);

        normalize_layout(&gw, &entry, &[new_dir("Foo")]).unwrap();

        assert!(dir.path().join("Foo/Foo.toc").exists());
        assert!(!dir.path().join("Foo/Foo").exists());
        assert!(!dir.path().join(".Foo.normalize").exists());
    }

    #[test]
    fn test_nesting_with_siblings_kept() {
        let (dir, gw) = setup();
        touch(&dir, "Foo/Foo/icon.tga");
        touch(&dir, "Foo/Foo_Mainline.toc");
        touch(&dir, "Foo/core.lua");
        let entry = CatalogEntry::new(1, "Foo", "1.0", vec![FolderSpec::new("Foo", true)]);

        normalize_layout(&gw, &entry, &[new_dir("Foo")]).unwrap();

        assert!(dir.path().join("Foo/core.lua").exists());
        assert!(dir.path().join("Foo/Foo_Mainline.toc").exists());
        assert!(dir.path().join("Foo/Foo/icon.tga").exists());
    }

    #[test]
    fn test_existing_declared_folder_untouched() {
        let (dir, gw) = setup();
        touch(&dir, "Foo/Foo.toc");
        touch(&dir, "Lib/Lib/inner.lua");
        let entry = CatalogEntry::new(
            1,
            "Foo",
            "1.0",
            vec![FolderSpec::new("Foo", true), FolderSpec::new("Lib", false)],
        );

        normalize_layout(&gw, &entry, &[new_dir("Foo")]).unwrap();

        assert!(dir.path().join("Lib/Lib/inner.lua").exists());
    }

    #[test]
    fn test_renamed_wrapper_collapsed() {
        let (dir, gw) = setup();
        touch(&dir, "Repo-main/Foo/Foo.toc");
        touch(&dir, "Repo-main/README.md");
        let entry = CatalogEntry::new(1, "Foo", "1.0", vec![FolderSpec::new("Foo", true)]);

        normalize_layout(&gw, &entry, &[new_dir("Repo-main")]).unwrap();

        assert!(dir.path().join("Foo/Foo.toc").exists());
        assert!(!dir.path().join("Foo/Foo").exists());
    }

    #[test]
    fn test_scaffolding_removed_only_if_new() {
        let (dir, gw) = setup();
        touch(&dir, "Foo/Foo.toc");
        touch(&dir, "README.md");
        touch(&dir, "LICENSE");
        let entry = CatalogEntry::new(1, "Foo", "1.0", vec![FolderSpec::new("Foo", true)]);

        normalize_layout(&gw, &entry, &[new_dir("Foo"), new_file("LICENSE")]).unwrap();

        assert!(!dir.path().join("LICENSE").exists());
        assert!(dir.path().join("README.md").exists());
    }

    #[test]
    fn test_missing_main_fails() {
        let (dir, gw) = setup();
        touch(&dir, "Other/x.lua");
        touch(&dir, "Another/y.lua");
        let entry = CatalogEntry::new(1, "Foo", "1.0", vec![FolderSpec::new("Foo", true)]);

        let err = normalize_layout(&gw, &entry, &[new_dir("Other"), new_dir("Another")]).unwrap_err();
        assert!(matches!(err, AddonError::Archive(_)));
    }

    #[test]
    fn test_scaffolding_names() {
        assert!(is_scaffolding("LICENSE.txt"));
        assert!(is_scaffolding("readme.md"));
        assert!(is_scaffolding(".git"));
        assert!(!is_scaffolding("Foo"));
    }
}
