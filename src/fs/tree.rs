// Directory tree walking helpers

use crate::error::{CacheError, Result};
use jwalk::WalkDir;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

/// A regular file found while walking a tree.
#[derive(Debug, Clone)]
pub struct TreeFile {
    pub path: PathBuf,
    /// Path relative to the walk root.
    pub relative: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub accessed: Option<SystemTime>,
}

/// Everything under a root, directories listed parents first.
#[derive(Debug, Clone, Default)]
pub struct TreeListing {
    pub directories: Vec<PathBuf>,
    pub files: Vec<TreeFile>,
}

impl TreeListing {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Walk `root` without following links. Entries that fail to read are
/// logged and skipped.
pub fn walk(root: &Path) -> Result<TreeListing> {
    if !root.is_dir() {
        return Err(CacheError::NotADirectory {
            path: root.to_path_buf(),
        });
    }

    let mut listing = TreeListing::default();
    for entry_result in WalkDir::new(root)
        .skip_hidden(false) // Don't skip hidden files
        .follow_links(false) // Don't follow symlinks to avoid loops
        .sort(true)
    {
        let entry = match entry_result {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Error walking {}: {}", root.display(), e);
                continue;
            }
        };
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(root).map(Path::to_path_buf) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            listing.directories.push(relative);
        } else if file_type.is_file() {
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("Failed to read metadata of {}: {}", path.display(), e);
                    continue;
                }
            };
            listing.files.push(TreeFile {
                relative,
                size: metadata.len(),
                modified: metadata.modified().ok(),
                accessed: metadata.accessed().ok(),
                path,
            });
        }
    }
    Ok(listing)
}

/// Total size of regular files under `root`, zero if it cannot be walked.
pub fn dir_size(root: &Path) -> u64 {
    walk(root).map(|l| l.total_bytes()).unwrap_or(0)
}
