//! Streaming copy with integrity verification.

use super::options::CopyOptions;
use super::verify::{self, VerificationResult};
use crate::error::{CacheError, ErrorClass, Result};
use crate::fs::lock::is_exclusively_locked;
use crate::fs::space::available_space;
use crate::progress::Progress;
use humansize::{format_size, BINARY};
use serde::Serialize;
use std::fs::{self, File, FileTimes};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Byte-level progress observer: `(bytes_done, total)`.
pub type ByteProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Result of one verified copy.
#[derive(Debug, Clone, Serialize)]
pub struct CopyOutcome {
    pub success: bool,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub bytes_copied: u64,
    pub duration: Duration,
    /// MiB per second over the whole operation.
    pub throughput: f64,
    pub verification: Option<VerificationResult>,
    pub attempts: u32,
    pub error: Option<String>,
    #[serde(skip)]
    pub error_class: Option<ErrorClass>,
}

impl CopyOutcome {
    fn new(source: &Path, destination: &Path) -> Self {
        Self {
            success: false,
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            bytes_copied: 0,
            duration: Duration::ZERO,
            throughput: 0.0,
            verification: None,
            attempts: 0,
            error: None,
            error_class: None,
        }
    }

    fn failed(mut self, err: &CacheError) -> Self {
        self.success = false;
        self.error = Some(err.to_string());
        self.error_class = Some(err.class());
        self
    }

    /// Convert into a `Result`, keeping the outcome on success.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        let reason = self.error.clone().unwrap_or_else(|| "copy failed".into());
        Err(match self.error_class {
            Some(ErrorClass::Integrity) => CacheError::VerificationFailed {
                path: self.destination,
                reason,
            },
            Some(ErrorClass::Contention) => CacheError::Locked {
                path: self.source,
                attempts: self.attempts,
            },
            _ => CacheError::Internal {
                message: format!("copying {}: {}", self.source.display(), reason),
            },
        })
    }
}

/// Copies single files with bounded memory and verifies the result.
#[derive(Debug, Clone, Default)]
pub struct VerifiedCopyEngine {
    defaults: CopyOptions,
}

impl VerifiedCopyEngine {
    pub fn new(defaults: CopyOptions) -> Self {
        Self { defaults }
    }

    /// Options used when callers pass none.
    pub fn defaults(&self) -> &CopyOptions {
        &self.defaults
    }

    /// Copy with the engine's default options.
    pub async fn copy(&self, source: &Path, destination: &Path, progress: &Progress) -> CopyOutcome {
        self.copy_with(source, destination, &self.defaults, progress, None)
            .await
    }

    /// Copy on the blocking pool. The copy always runs to completion once
    /// started; callers that want to stop early must do so between files.
    pub async fn copy_with(
        &self,
        source: &Path,
        destination: &Path,
        options: &CopyOptions,
        progress: &Progress,
        on_bytes: Option<ByteProgress>,
    ) -> CopyOutcome {
        let (src, dst) = (source.to_path_buf(), destination.to_path_buf());
        let (options, progress) = (options.clone(), progress.clone());
        let task = tokio::task::spawn_blocking(move || {
            copy_blocking(&src, &dst, &options, &progress, on_bytes.as_deref())
        });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => CopyOutcome::new(source, destination).failed(&CacheError::from(e)),
        }
    }
}

/// The synchronous copy pipeline: preflight, stream with retry, timestamps,
/// verification.
pub fn copy_blocking(
    source: &Path,
    destination: &Path,
    options: &CopyOptions,
    progress: &Progress,
    on_bytes: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
) -> CopyOutcome {
    let started = Instant::now();
    let mut outcome = CopyOutcome::new(source, destination);

    let size = match preflight(source, destination, options) {
        Ok(size) => size,
        Err(e) => {
            debug!("Preflight failed for {}: {}", source.display(), e);
            return outcome.failed(&e);
        }
    };

    let mode = options.verification.effective();
    let algorithm = mode.algorithm();
    let source_digest = loop {
        outcome.attempts += 1;
        match stream(source, destination, size, options, algorithm, progress, on_bytes) {
            Ok((bytes, digest)) => {
                outcome.bytes_copied = bytes;
                break digest;
            }
            Err(e) if retryable(&e) && outcome.attempts <= options.max_retries => {
                warn!(
                    "Copy of {} failed (attempt {}): {}; retrying in {:?}",
                    source.display(),
                    outcome.attempts,
                    e,
                    options.retry_delay
                );
                progress.report(format!("Retrying copy of {}: {}", source.display(), e));
                std::thread::sleep(options.retry_delay);
            }
            Err(e) => {
                outcome.duration = started.elapsed();
                return outcome.failed(&e);
            }
        }
    };

    if options.preserve_timestamps {
        if let Err(e) = copy_timestamps(source, destination) {
            warn!("Failed to copy timestamps to {}: {}", destination.display(), e);
        }
    }

    let verification = verify::verify(
        source,
        destination,
        options,
        source_digest.as_deref(),
        progress,
    );
    let passed = verification.passed;
    let reason = verification.error.clone();
    outcome.verification = Some(verification);
    outcome.duration = started.elapsed();
    outcome.throughput = throughput(outcome.bytes_copied, outcome.duration);

    if passed {
        outcome.success = true;
        debug!(
            "Copied {} -> {} ({}, {:.1} MiB/s, {})",
            source.display(),
            destination.display(),
            format_size(outcome.bytes_copied, BINARY),
            outcome.throughput,
            mode
        );
        outcome
    } else {
        let err = CacheError::VerificationFailed {
            path: destination.to_path_buf(),
            reason: reason.unwrap_or_else(|| format!("{mode} verification failed")),
        };
        warn!("{}", err);
        outcome.failed(&err)
    }
}

/// Checks that must pass before any byte moves. Returns the source size.
fn preflight(source: &Path, destination: &Path, options: &CopyOptions) -> Result<u64> {
    let metadata = fs::metadata(source).map_err(|e| CacheError::io(e, "reading metadata", source))?;
    if !metadata.is_file() {
        return Err(CacheError::NotAFile {
            path: source.to_path_buf(),
        });
    }
    let size = metadata.len();

    let existing = fs::metadata(destination).ok();
    if let Some(existing) = &existing {
        if existing.is_dir() {
            return Err(CacheError::AlreadyExists {
                path: destination.to_path_buf(),
            });
        }
        if !options.overwrite {
            return Err(CacheError::AlreadyExists {
                path: destination.to_path_buf(),
            });
        }
    }

    if is_exclusively_locked(source) {
        return Err(CacheError::Locked {
            path: source.to_path_buf(),
            attempts: 1,
        });
    }

    let space_dir = nearest_existing_ancestor(destination);
    if let Some(available) = space_dir.as_deref().and_then(available_space) {
        // the overwritten file's blocks come back
        let available = available.saturating_add(existing.map(|m| m.len()).unwrap_or(0));
        let required = (size as f64 * options.space_margin).ceil() as u64;
        if available < required {
            return Err(CacheError::InsufficientSpace {
                path: destination.to_path_buf(),
                required,
                available,
            });
        }
    }

    Ok(size)
}

fn nearest_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .skip(1)
        .find(|p| p.is_dir())
        .map(Path::to_path_buf)
}

#[allow(clippy::too_many_arguments)]
fn stream(
    source: &Path,
    destination: &Path,
    size: u64,
    options: &CopyOptions,
    algorithm: Option<crate::hash::HashAlgorithm>,
    progress: &Progress,
    on_bytes: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
) -> Result<(u64, Option<String>)> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|e| CacheError::io(e, "creating directory", parent))?;
    }

    let mut reader = File::open(source).map_err(|e| CacheError::io(e, "opening source", source))?;
    let mut writer =
        File::create(destination).map_err(|e| CacheError::io(e, "creating destination", destination))?;

    let mut hasher = algorithm.map(|a| a.hasher());
    let mut buffer = vec![0u8; options.buffer_size_for(size)];
    let mut copied: u64 = 0;
    let started = Instant::now();
    let mut last_report = Instant::now();
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CacheError::io(e, "reading source", source)),
        };
        writer
            .write_all(&buffer[..n])
            .map_err(|e| CacheError::io(e, "writing destination", destination))?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buffer[..n]);
        }
        copied += n as u64;

        if last_report.elapsed() >= options.progress_interval {
            last_report = Instant::now();
            if let Some(on_bytes) = on_bytes {
                on_bytes(copied, size);
            }
            progress.report(format!(
                "Copying {}: {:.0}% ({} / {}, {:.1} MiB/s)",
                name,
                percent(copied, size),
                format_size(copied, BINARY),
                format_size(size, BINARY),
                throughput(copied, started.elapsed())
            ));
        }
    }

    writer
        .flush()
        .map_err(|e| CacheError::io(e, "flushing destination", destination))?;
    if options.force_disk_sync {
        writer
            .sync_all()
            .map_err(|e| CacheError::io(e, "syncing destination", destination))?;
    }
    if let Some(on_bytes) = on_bytes {
        on_bytes(copied, size.max(copied));
    }

    let digest = hasher.map(|h| crate::hash::bytes_to_hex(&h.finalize()));
    Ok((copied, digest))
}

fn copy_timestamps(source: &Path, destination: &Path) -> std::io::Result<()> {
    let metadata = fs::metadata(source)?;
    let mut times = FileTimes::new();
    if let Ok(modified) = metadata.modified() {
        times = times.set_modified(modified);
    }
    if let Ok(accessed) = metadata.accessed() {
        times = times.set_accessed(accessed);
    }
    fs::OpenOptions::new()
        .write(true)
        .open(destination)?
        .set_times(times)
}

fn retryable(err: &CacheError) -> bool {
    matches!(err, CacheError::Io { .. }) || err.is_transient()
}

pub(crate) fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        (done as f64 / total as f64 * 100.0).min(100.0)
    }
}

fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100.0);
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(percent(300, 200), 100.0);
    }

    #[test]
    fn test_throughput() {
        assert_eq!(throughput(10, Duration::ZERO), 0.0);
        let mib = throughput(2 * 1024 * 1024, Duration::from_secs(2));
        assert!((mib - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_outcome_converts_to_error() {
        let err = CacheError::VerificationFailed {
            path: PathBuf::from("dst"),
            reason: "SHA256 mismatch".into(),
        };
        let outcome = CopyOutcome::new(Path::new("src"), Path::new("dst")).failed(&err);
        assert!(matches!(
            outcome.into_result(),
            Err(CacheError::VerificationFailed { .. })
        ));
    }
}
