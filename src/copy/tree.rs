// Whole-directory copies through the verified engine

use super::engine::VerifiedCopyEngine;
use super::options::CopyOptions;
use crate::error::{CacheError, Result};
use crate::fs::tree;
use crate::progress::Progress;
use humansize::{format_size, BINARY};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Summary of a tree copy.
#[derive(Debug, Clone, Default)]
pub struct TreeCopyReport {
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub directories: u64,
    /// Relative path and error text for every file that failed.
    pub failures: Vec<(PathBuf, String)>,
}

impl TreeCopyReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

impl VerifiedCopyEngine {
    /// Copy every file under `source` into `destination`, at most
    /// `concurrency` files at a time.
    pub async fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        options: &CopyOptions,
        concurrency: usize,
        progress: &Progress,
    ) -> Result<TreeCopyReport> {
        let listing = {
            let root = source.to_path_buf();
            tokio::task::spawn_blocking(move || tree::walk(&root)).await??
        };

        std::fs::create_dir_all(destination)
            .map_err(|e| CacheError::io(e, "creating directory", destination))?;
        for dir in &listing.directories {
            let target = destination.join(dir);
            std::fs::create_dir_all(&target)
                .map_err(|e| CacheError::io(e, "creating directory", &target))?;
        }

        let total_files = listing.files.len() as u64;
        let total_bytes = listing.total_bytes();
        info!(
            "Copying {} files ({}) from {} to {}",
            total_files,
            format_size(total_bytes, BINARY),
            source.display(),
            destination.display()
        );
        progress.report(format!(
            "Copying {} files ({})",
            total_files,
            format_size(total_bytes, BINARY)
        ));

        let slots = Arc::new(Semaphore::new(concurrency.max(1)));
        let done = Arc::new(AtomicU64::new(0));
        let mut tasks = JoinSet::new();

        for file in listing.files {
            let permit = slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CacheError::internal(e.to_string()))?;
            let engine = self.clone();
            let options = options.clone();
            let progress = progress.clone();
            let done = done.clone();
            let target = destination.join(&file.relative);
            tasks.spawn(async move {
                let outcome = engine
                    .copy_with(&file.path, &target, &options, &Progress::silent(), None)
                    .await;
                drop(permit);
                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                progress.report(format!(
                    "[{}/{}] {}",
                    finished,
                    total_files,
                    file.relative.display()
                ));
                (file.relative, outcome)
            });
        }

        let mut report = TreeCopyReport {
            directories: listing.directories.len() as u64,
            ..Default::default()
        };
        while let Some(joined) = tasks.join_next().await {
            let (relative, outcome) = joined?;
            if outcome.success {
                report.files_copied += 1;
                report.bytes_copied += outcome.bytes_copied;
            } else {
                let reason = outcome.error.unwrap_or_else(|| "copy failed".into());
                warn!("Failed to copy {}: {}", relative.display(), reason);
                report.failures.push((relative, reason));
            }
        }

        Ok(report)
    }
}
