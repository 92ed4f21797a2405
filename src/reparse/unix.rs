// Redirection backend for hosts without mount-point reparse points.
// A directory symlink stands in for the junction.

use crate::error::{CacheError, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub(super) fn create_redirection(mount: &Path, target: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, mount)
            .map_err(|e| CacheError::io(e, "creating redirection", mount))
    }
    #[cfg(not(unix))]
    {
        let _ = (mount, target);
        Err(CacheError::Unsupported {
            operation: "creating redirection".into(),
        })
    }
}

pub(super) fn remove_redirection(mount: &Path) -> Result<()> {
    fs::remove_file(mount).map_err(|e| CacheError::io(e, "removing redirection", mount))
}

pub(super) fn is_redirection(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

pub(super) fn read_target(mount: &Path) -> Result<PathBuf> {
    let target =
        fs::read_link(mount).map_err(|e| CacheError::io(e, "reading redirection", mount))?;
    if target.is_absolute() {
        Ok(target)
    } else {
        let parent = mount.parent().unwrap_or_else(|| Path::new(""));
        Ok(parent.join(target))
    }
}

pub(super) fn set_hidden(_path: &Path, _hidden: bool) -> Result<()> {
    Ok(())
}
