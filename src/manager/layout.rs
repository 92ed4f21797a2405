// Filesystem layout of an accelerated folder:
// <cache_root>/<drive>/<name> holds the cache, <source>.original the parked original

use crate::error::{CacheError, Result};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf, Prefix};

pub const ORIGINAL_SUFFIX: &str = ".original";

/// Drive letter, UNC server, or `root` when the path has no prefix.
pub fn drive_label(source: &Path) -> String {
    match source.components().next() {
        Some(Component::Prefix(prefix)) => match prefix.kind() {
            Prefix::Disk(letter) | Prefix::VerbatimDisk(letter) => {
                (letter as char).to_ascii_uppercase().to_string()
            }
            Prefix::UNC(server, _) | Prefix::VerbatimUNC(server, _) => {
                server.to_string_lossy().into_owned()
            }
            Prefix::DeviceNS(name) | Prefix::Verbatim(name) => name.to_string_lossy().into_owned(),
        },
        _ => "root".to_string(),
    }
}

/// `source` without trailing separators or `.` components.
pub fn clean(source: &Path) -> PathBuf {
    source
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

pub fn cache_path_for(cache_root: &Path, source: &Path) -> Result<PathBuf> {
    let source = clean(source);
    let name = source.file_name().ok_or_else(|| CacheError::Unsupported {
        operation: format!("accelerating volume root {}", source.display()),
    })?;
    Ok(cache_root.join(drive_label(&source)).join(name))
}

pub fn original_path_for(source: &Path) -> PathBuf {
    let mut text: OsString = clean(source).into_os_string();
    text.push(ORIGINAL_SUFFIX);
    PathBuf::from(text)
}
