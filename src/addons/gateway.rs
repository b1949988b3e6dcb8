//! Filesystem gateway.
//!
//! Every read and write the engine performs on the installation tree goes
//! through [`FsGateway`]. [`LocalFs`] confines all paths to the
//! installation root and refuses anything that resolves outside it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, warn};

use super::types::AddonError;

/// Maximum directory depth followed by recursive copies.
const MAX_COPY_DEPTH: usize = 64;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntryInfo {
    /// File or folder name.
    pub name: String,
    /// True for directories.
    pub is_dir: bool,
}

/// Filesystem operations available to the engine.
pub trait FsGateway: Send + Sync {
    /// Installation root all paths are confined to.
    fn root(&self) -> &Path;

    /// Lists a directory, sorted by name.
    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>, AddonError>;

    /// Reads a text file. Invalid UTF-8 sequences are replaced.
    fn read_file(&self, path: &Path) -> Result<String, AddonError>;

    /// Creates a new file; fails if it already exists.
    fn write_file(&self, path: &Path, contents: &str) -> Result<(), AddonError>;

    /// Creates or truncates a file.
    fn overwrite(&self, path: &Path, contents: &str) -> Result<(), AddonError>;

    /// Returns true if the path exists inside the root.
    fn exists(&self, path: &Path) -> bool;

    /// Deletes one file.
    fn delete_file(&self, path: &Path) -> Result<(), AddonError>;

    /// Deletes a folder and everything below it.
    fn delete_folder_recursive(&self, path: &Path) -> Result<(), AddonError>;

    /// Unpacks a zip or tar.gz archive into `dest`.
    ///
    /// `archive` may live outside the root; `dest` may not.
    fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<(), AddonError>;

    /// Copies a file or folder tree, merging into an existing destination.
    fn copy_recursive(&self, src: &Path, dst: &Path) -> Result<(), AddonError>;

    /// Returns the names of the top-level folders under the root.
    fn top_level_folders(&self) -> Result<Vec<String>, AddonError> {
        Ok(self
            .list_dir(self.root())?
            .into_iter()
            .filter(|e| e.is_dir)
            .map(|e| e.name)
            .collect())
    }
}

/// Lexically normalizes a path, resolving `.` and `..` components.
///
/// Returns `None` if `..` climbs above the first component.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                normalized.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
        }
    }
    Some(normalized)
}

/// Lexically resolves `path` against `root` and checks containment.
///
/// Relative paths are joined onto the root. `..` components that climb
/// above the root are rejected. `root` must already be normalized.
pub fn confine(root: &Path, path: &Path) -> Result<PathBuf, AddonError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    match normalize(&joined) {
        Some(normalized) if normalized.starts_with(root) => Ok(normalized),
        _ => Err(AddonError::PathViolation(joined)),
    }
}

/// Gateway over the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFs {
    /// Root as given, lexically normalized.
    root: PathBuf,
    /// Root with symlinks resolved.
    canonical_root: PathBuf,
}

impl LocalFs {
    /// Creates a gateway for an existing installation root.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, AddonError> {
        let root = root.into();
        let canonical_root = root
            .canonicalize()
            .map_err(|e| AddonError::fs(&root, e))?;

        let root = if root.is_absolute() {
            normalize(&root).unwrap_or_else(|| canonical_root.clone())
        } else {
            canonical_root.clone()
        };

        Ok(Self {
            root,
            canonical_root,
        })
    }

    /// Lexical confinement only; used by reads.
    fn resolve(&self, path: &Path) -> Result<PathBuf, AddonError> {
        confine(&self.root, path)
    }

    /// Confinement for mutating calls: also resolves symlinks on the
    /// deepest existing ancestor and refuses the root itself.
    fn resolve_mut(&self, path: &Path) -> Result<PathBuf, AddonError> {
        let resolved = self.resolve(path)?;
        if resolved == self.root {
            return Err(AddonError::PathViolation(resolved));
        }

        let mut ancestor: &Path = &resolved;
        loop {
            if fs::symlink_metadata(ancestor).is_ok() {
                let canonical = ancestor
                    .canonicalize()
                    .map_err(|e| AddonError::fs(ancestor, e))?;
                if !canonical.starts_with(&self.canonical_root) {
                    warn!("[FS] {} resolves outside root via {}", resolved.display(), canonical.display());
                    return Err(AddonError::PathViolation(resolved));
                }
                break;
            }
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => break,
            }
        }

        Ok(resolved)
    }

    fn ensure_parent(path: &Path) -> Result<(), AddonError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AddonError::fs(parent, e))?;
        }
        Ok(())
    }

    fn extract_zip(&self, archive: &Path, dest: &Path) -> Result<(), AddonError> {
        let file = File::open(archive).map_err(|e| AddonError::fs(archive, e))?;
        let mut zip = zip::ZipArchive::new(file)
            .map_err(|e| AddonError::Archive(format!("Failed to open archive: {}", e)))?;

        for i in 0..zip.len() {
            let mut entry = zip
                .by_index(i)
                .map_err(|e| AddonError::Archive(format!("Failed to read archive entry: {}", e)))?;

            let name = entry.name().to_string();
            let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
                warn!("[FS] Archive entry escapes destination: {}", name);
                return Err(AddonError::PathViolation(dest.join(name)));
            };
            if relative.as_os_str().is_empty() {
                continue;
            }

            let out = self.resolve_mut(&dest.join(&relative))?;

            if entry.is_dir() {
                fs::create_dir_all(&out).map_err(|e| AddonError::fs(&out, e))?;
            } else {
                Self::ensure_parent(&out)?;
                let mut outfile = File::create(&out).map_err(|e| AddonError::fs(&out, e))?;
                io::copy(&mut entry, &mut outfile).map_err(|e| AddonError::fs(&out, e))?;
            }
        }

        Ok(())
    }

    fn extract_tar_gz(&self, archive: &Path, dest: &Path) -> Result<(), AddonError> {
        let file = File::open(archive).map_err(|e| AddonError::fs(archive, e))?;
        let mut tar = tar::Archive::new(GzDecoder::new(file));

        let entries = tar
            .entries()
            .map_err(|e| AddonError::Archive(format!("Failed to open archive: {}", e)))?;

        for entry in entries {
            let mut entry = entry
                .map_err(|e| AddonError::Archive(format!("Failed to read archive entry: {}", e)))?;
            let relative = entry
                .path()
                .map_err(|e| AddonError::Archive(format!("Invalid entry path: {}", e)))?
                .into_owned();

            let escapes = relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes {
                warn!("[FS] Archive entry escapes destination: {}", relative.display());
                return Err(AddonError::PathViolation(dest.join(relative)));
            }
            if relative.as_os_str().is_empty() {
                continue;
            }

            let out = self.resolve_mut(&dest.join(&relative))?;
            let kind = entry.header().entry_type();

            if kind.is_dir() {
                fs::create_dir_all(&out).map_err(|e| AddonError::fs(&out, e))?;
            } else if kind.is_file() {
                Self::ensure_parent(&out)?;
                entry.unpack(&out).map_err(|e| AddonError::fs(&out, e))?;
            } else {
                debug!("[FS] Skipping non-regular archive entry {}", relative.display());
            }
        }

        Ok(())
    }

    fn copy_tree(&self, src: &Path, dst: &Path, depth: usize) -> Result<(), AddonError> {
        if depth > MAX_COPY_DEPTH {
            return Err(AddonError::fs(
                src,
                io::Error::new(io::ErrorKind::Other, "folder nesting too deep"),
            ));
        }

        fs::create_dir_all(dst).map_err(|e| AddonError::fs(dst, e))?;

        for entry in fs::read_dir(src).map_err(|e| AddonError::fs(src, e))? {
            let entry = entry.map_err(|e| AddonError::fs(src, e))?;
            let file_type = entry.file_type().map_err(|e| AddonError::fs(entry.path(), e))?;
            let src_path = entry.path();
            let dst_path = dst.join(entry.file_name());

            if file_type.is_symlink() {
                debug!("[FS] Not copying symlink {}", src_path.display());
            } else if file_type.is_dir() {
                self.copy_tree(&src_path, &dst_path, depth + 1)?;
            } else {
                fs::copy(&src_path, &dst_path).map_err(|e| AddonError::fs(&src_path, e))?;
            }
        }

        Ok(())
    }
}

impl FsGateway for LocalFs {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>, AddonError> {
        let path = self.resolve(path)?;
        let mut entries = Vec::new();

        for entry in fs::read_dir(&path).map_err(|e| AddonError::fs(&path, e))? {
            let entry = entry.map_err(|e| AddonError::fs(&path, e))?;
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                warn!("[FS] Skipping non-UTF-8 entry in {}", path.display());
                continue;
            };
            // Follows symlinks so linked add-on folders list as folders.
            let is_dir = entry.path().is_dir();
            entries.push(DirEntryInfo { name, is_dir });
        }

        entries.sort();
        Ok(entries)
    }

    fn read_file(&self, path: &Path) -> Result<String, AddonError> {
        let path = self.resolve(path)?;
        let bytes = fs::read(&path).map_err(|e| AddonError::fs(&path, e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<(), AddonError> {
        let path = self.resolve_mut(path)?;
        Self::ensure_parent(&path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| AddonError::fs(&path, e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| AddonError::fs(&path, e))
    }

    fn overwrite(&self, path: &Path, contents: &str) -> Result<(), AddonError> {
        let path = self.resolve_mut(path)?;
        Self::ensure_parent(&path)?;
        fs::write(&path, contents).map_err(|e| AddonError::fs(&path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).is_ok_and(|p| p.exists())
    }

    fn delete_file(&self, path: &Path) -> Result<(), AddonError> {
        let path = self.resolve_mut(path)?;
        fs::remove_file(&path).map_err(|e| AddonError::fs(&path, e))
    }

    fn delete_folder_recursive(&self, path: &Path) -> Result<(), AddonError> {
        let path = self.resolve_mut(path)?;
        fs::remove_dir_all(&path).map_err(|e| AddonError::fs(&path, e))
    }

    fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<(), AddonError> {
        let dest = self.resolve(dest)?;

        let mut magic = [0u8; 4];
        let read = File::open(archive)
            .and_then(|mut f| f.read(&mut magic))
            .map_err(|e| AddonError::fs(archive, e))?;

        match &magic[..read] {
            [b'P', b'K', 3, 4] | [b'P', b'K', 5, 6] => self.extract_zip(archive, &dest),
            [0x1f, 0x8b, ..] => self.extract_tar_gz(archive, &dest),
            _ => Err(AddonError::Archive(format!(
                "Unsupported archive format: {}",
                archive.display()
            ))),
        }
    }

    fn copy_recursive(&self, src: &Path, dst: &Path) -> Result<(), AddonError> {
        let src = self.resolve(src)?;
        let dst = self.resolve_mut(dst)?;

        if src.is_dir() {
            self.copy_tree(&src, &dst, 0)
        } else {
            Self::ensure_parent(&dst)?;
            fs::copy(&src, &dst)
                .map(|_| ())
                .map_err(|e| AddonError::fs(&src, e))
        }
    }
}
