//! Persistent configuration
//!
//! JSON file holding the accelerated folders, the default cache root and the
//! sync and verification defaults. Rewritten after every mutation.

use crate::copy::{HugeFileStrategy, VerificationMode};
use crate::error::{CacheError, Result};
use crate::reparse::paths_equal;
use crate::sync::SyncMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const APP_DIR: &str = "CacheMax";
const CONFIG_FILE: &str = "config.json";

/// One managed redirection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratedMount {
    pub mount_point: PathBuf,
    pub original_path: PathBuf,
    pub cache_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Size when last measured.
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncDefaults {
    pub mode: SyncMode,
    pub delay_seconds: u64,
    pub debounce_ms: u64,
    pub max_concurrent_copies: usize,
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self {
            mode: SyncMode::Immediate,
            delay_seconds: 3,
            debounce_ms: 500,
            max_concurrent_copies: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub default_cache_root: Option<PathBuf>,
    pub accelerated_folders: Vec<AcceleratedMount>,
    pub sync: SyncDefaults,
    pub verification: VerificationMode,
    pub huge_file_strategy: HugeFileStrategy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_cache_root: None,
            accelerated_folders: Vec::new(),
            sync: SyncDefaults::default(),
            verification: VerificationMode::Sha256,
            huge_file_strategy: HugeFileStrategy::default(),
        }
    }
}

impl AppConfig {
    pub fn find(&self, mount_point: &Path) -> Option<&AcceleratedMount> {
        self.accelerated_folders
            .iter()
            .find(|m| paths_equal(&m.mount_point, mount_point))
    }
}

/// Per-user config location: `<data dir>/CacheMax/config.json`.
pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::data_dir().ok_or_else(|| CacheError::Config {
        path: PathBuf::from(CONFIG_FILE),
        reason: "no per-user data directory on this system".into(),
    })?;
    Ok(dir.join(APP_DIR).join(CONFIG_FILE))
}

/// Loaded configuration bound to its file.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: AppConfig,
}

impl ConfigStore {
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path()?)
    }

    /// Load `path`. A missing file is created with defaults; an unreadable
    /// one is logged and replaced by defaults in memory.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            warn!("No config found, creating default at {}", path.display());
            let store = Self {
                path,
                config: AppConfig::default(),
            };
            store.save()?;
            return Ok(store);
        }

        info!("Loading config from {}", path.display());
        let config = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("Config {} is invalid ({}), using defaults", path.display(), e);
                AppConfig::default()
            }),
            Err(e) => {
                warn!("Cannot read config {} ({}), using defaults", path.display(), e);
                AppConfig::default()
            }
        };
        Ok(Self { path, config })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| CacheError::io(e, "creating config directory", dir))?;
        }
        let json = serde_json::to_string_pretty(&self.config).map_err(|e| CacheError::Config {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&self.path, json).map_err(|e| CacheError::io(e, "writing config", &self.path))?;
        info!("Saved config to {}", self.path.display());
        Ok(())
    }

    /// Insert or replace the record for `mount.mount_point`.
    pub fn add_mount(&mut self, mount: AcceleratedMount) -> Result<()> {
        self.config
            .accelerated_folders
            .retain(|m| !paths_equal(&m.mount_point, &mount.mount_point));
        self.config.accelerated_folders.push(mount);
        self.save()
    }

    pub fn remove_mount(&mut self, mount_point: &Path) -> Result<Option<AcceleratedMount>> {
        let index = self
            .config
            .accelerated_folders
            .iter()
            .position(|m| paths_equal(&m.mount_point, mount_point));
        let Some(index) = index else {
            return Ok(None);
        };
        let removed = self.config.accelerated_folders.remove(index);
        self.save()?;
        Ok(Some(removed))
    }

    pub fn get_mount(&self, mount_point: &Path) -> Option<&AcceleratedMount> {
        self.config.find(mount_point)
    }

    pub fn mounts(&self) -> &[AcceleratedMount] {
        &self.config.accelerated_folders
    }

    pub fn set_default_root(&mut self, root: impl Into<PathBuf>) -> Result<()> {
        self.config.default_cache_root = Some(root.into());
        self.save()
    }

    pub fn update_size(&mut self, mount_point: &Path, size_bytes: u64) -> Result<bool> {
        let found = self
            .config
            .accelerated_folders
            .iter_mut()
            .find(|m| paths_equal(&m.mount_point, mount_point));
        match found {
            Some(mount) => {
                mount.size_bytes = size_bytes;
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mount(name: &str) -> AcceleratedMount {
        AcceleratedMount {
            mount_point: PathBuf::from(format!("/data/{name}")),
            original_path: PathBuf::from(format!("/data/{name}.original")),
            cache_path: PathBuf::from(format!("/cache/root/{name}")),
            created_at: Utc::now(),
            size_bytes: 0,
        }
    }

    #[test]
    fn test_missing_file_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let store = ConfigStore::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.config(), &AppConfig::default());
    }

    #[test]
    fn test_mutations_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut store = ConfigStore::load(&path).unwrap();
        store.add_mount(mount("A")).unwrap();
        store.add_mount(mount("B")).unwrap();
        store.set_default_root("/fast").unwrap();
        store.update_size(Path::new("/data/A"), 42).unwrap();
        store.remove_mount(Path::new("/data/B")).unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.mounts().len(), 1);
        assert_eq!(reloaded.mounts()[0].size_bytes, 42);
        assert_eq!(reloaded.config().default_cache_root, Some(PathBuf::from("/fast")));
    }

    #[test]
    fn test_add_replaces_same_mount() {
        let dir = tempdir().unwrap();
        let mut store = ConfigStore::load(dir.path().join("c.json")).unwrap();
        store.add_mount(mount("A")).unwrap();
        let mut again = mount("A");
        again.size_bytes = 7;
        store.add_mount(again).unwrap();
        assert_eq!(store.mounts().len(), 1);
        assert_eq!(store.get_mount(Path::new("/data/A")).unwrap().size_bytes, 7);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let store = ConfigStore::load(&path).unwrap();
        assert!(store.mounts().is_empty());
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"default_cache_root": "/fast", "sync": {"mode": "Periodic"}}"#).unwrap();
        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.config().sync.mode, SyncMode::Periodic);
        assert_eq!(store.config().sync.delay_seconds, 3);
        assert_eq!(store.config().verification, VerificationMode::Sha256);
    }
}
