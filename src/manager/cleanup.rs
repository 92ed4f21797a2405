// Cache quota management and statistics

use super::CacheManager;
use crate::error::{CacheError, Result};
use crate::fs::tree::{self, TreeFile};
use crate::progress::Progress;
use chrono::{DateTime, Utc};
use humansize::{format_size, BINARY};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub files_deleted: u64,
    pub bytes_freed: u64,
    /// Files left alone because the original does not hold the same size.
    pub files_unreplicated: u64,
    pub failures: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_path: PathBuf,
    pub total_bytes: u64,
    pub file_count: usize,
    /// Sync operations not yet finished for this cache.
    pub queued: usize,
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl CacheManager {
    /// Delete least-recently-accessed cache files until `bytes_to_free` bytes
    /// are released. Only files already present in the original with the same
    /// size are evicted, and their deletion is not replicated.
    pub async fn cleanup(
        &self,
        cache: &Path,
        bytes_to_free: u64,
        progress: &Progress,
    ) -> Result<CleanupReport> {
        let record = self.mount_for_cache(cache).ok_or_else(|| CacheError::UnknownMount {
            path: cache.to_path_buf(),
        })?;
        let listing = {
            let root = cache.to_path_buf();
            tokio::task::spawn_blocking(move || tree::walk(&root)).await??
        };
        progress.report(format!(
            "Freeing {} from {}",
            format_size(bytes_to_free, BINARY),
            cache.display()
        ));

        let mut files = listing.files;
        // never-accessed files sort first
        files.sort_by_key(|f| f.accessed);

        let mut report = CleanupReport::default();
        for file in files {
            if report.bytes_freed >= bytes_to_free {
                break;
            }
            if !is_replicated(&file, &record.original_path) {
                report.files_unreplicated += 1;
                continue;
            }
            self.sync_engine()
                .suppress_deletes([file.path.clone()], self.settings().eviction_suppression);
            match tokio::fs::remove_file(&file.path).await {
                Ok(()) => {
                    report.files_deleted += 1;
                    report.bytes_freed += file.size;
                    progress.report(format!(
                        "Evicted {} ({})",
                        file.relative.display(),
                        format_size(file.size, BINARY)
                    ));
                }
                Err(e) => {
                    warn!("Failed to evict {}: {}", file.path.display(), e);
                    report.failures.push((file.relative, e.to_string()));
                }
            }
        }

        info!(
            "Cleanup of {}: {} files, {} freed",
            cache.display(),
            report.files_deleted,
            format_size(report.bytes_freed, BINARY)
        );
        Ok(report)
    }

    pub async fn cache_stats(&self, cache: &Path) -> Result<CacheStats> {
        let listing = {
            let root = cache.to_path_buf();
            tokio::task::spawn_blocking(move || tree::walk(&root)).await??
        };
        let (queued, oldest_pending) = self.sync_engine().backlog(cache);
        if let Some(mount) = self.mount_for_cache(cache) {
            self.note_size(&mount.mount_point, listing.total_bytes());
        }
        Ok(CacheStats {
            cache_path: cache.to_path_buf(),
            total_bytes: listing.total_bytes(),
            file_count: listing.files.len(),
            queued,
            oldest_pending,
        })
    }
}

fn is_replicated(file: &TreeFile, original_root: &Path) -> bool {
    std::fs::metadata(original_root.join(&file.relative))
        .map(|m| m.is_file() && m.len() == file.size)
        .unwrap_or(false)
}
