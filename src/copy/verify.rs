//! Post-copy verification.
//!
//! All functions here are blocking and are run from `spawn_blocking` by the
//! engine.

use super::options::{CopyOptions, HugeFileStrategy, VerificationMode};
use crate::error::{CacheError, Result};
use crate::hash::{self, HashAlgorithm};
use crate::progress::Progress;
use humansize::{format_size, BINARY};
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

/// Modified times closer than this count as equal.
pub const DATE_TOLERANCE: Duration = Duration::from_secs(2);

/// Result of verifying one copy. Immutable once produced.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub mode: VerificationMode,
    /// Set when the huge-file policy applied.
    pub strategy: Option<HugeFileStrategy>,
    pub passed: bool,
    pub source_digest: Option<String>,
    pub target_digest: Option<String>,
    /// Zero-based indices of segments that differ (segmented strategy).
    pub failed_segments: Vec<u64>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl VerificationResult {
    fn new(mode: VerificationMode) -> Self {
        Self {
            mode,
            strategy: None,
            passed: false,
            source_digest: None,
            target_digest: None,
            failed_segments: Vec::new(),
            elapsed: Duration::ZERO,
            error: None,
        }
    }

    fn fail(mut self, reason: impl Into<String>) -> Self {
        self.passed = false;
        self.error = Some(reason.into());
        self
    }
}

/// Verify `target` against `source` under `options`.
///
/// `source_digest` is the digest computed while streaming the copy, if any.
/// It is only trusted when it was produced by the same algorithm the mode
/// selects.
pub fn verify(
    source: &Path,
    target: &Path,
    options: &CopyOptions,
    source_digest: Option<&str>,
    progress: &Progress,
) -> VerificationResult {
    let started = Instant::now();
    let mode = options.verification.effective();
    let mut result = match run(source, target, options, mode, source_digest, progress) {
        Ok(result) => result,
        Err(e) => VerificationResult::new(mode).fail(e.to_string()),
    };
    result.elapsed = started.elapsed();
    result
}

fn run(
    source: &Path,
    target: &Path,
    options: &CopyOptions,
    mode: VerificationMode,
    source_digest: Option<&str>,
    progress: &Progress,
) -> Result<VerificationResult> {
    let result = VerificationResult::new(mode);
    let source_meta =
        std::fs::metadata(source).map_err(|e| CacheError::io(e, "reading metadata", source))?;
    let target_meta =
        std::fs::metadata(target).map_err(|e| CacheError::io(e, "reading metadata", target))?;

    if source_meta.len() != target_meta.len() {
        return Ok(result.fail(format!(
            "size mismatch: source {} bytes, target {} bytes",
            source_meta.len(),
            target_meta.len()
        )));
    }
    let size = source_meta.len();

    match mode {
        VerificationMode::None | VerificationMode::Size => Ok(VerificationResult {
            passed: true,
            ..result
        }),
        VerificationMode::SizeAndDate => {
            let source_time = source_meta
                .modified()
                .map_err(|e| CacheError::io(e, "reading modified time", source))?;
            let target_time = target_meta
                .modified()
                .map_err(|e| CacheError::io(e, "reading modified time", target))?;
            if time_distance(source_time, target_time) <= DATE_TOLERANCE {
                Ok(VerificationResult {
                    passed: true,
                    ..result
                })
            } else {
                Ok(result.fail("modified times differ by more than 2 seconds"))
            }
        }
        VerificationMode::ByteByByte => {
            let buffer_size = options.buffer_size_for(size);
            match first_difference(source, target, buffer_size)? {
                None => Ok(VerificationResult {
                    passed: true,
                    ..result
                }),
                Some(offset) => Ok(result.fail(format!("contents differ at byte {offset}"))),
            }
        }
        VerificationMode::Md5 | VerificationMode::Sha256 | VerificationMode::Sha512 => {
            let algorithm = mode.algorithm().unwrap_or(HashAlgorithm::Sha256);
            if options.is_huge(size) {
                verify_huge(source, target, options, algorithm, size, source_digest, progress, result)
            } else {
                let buffer_size = options.buffer_size_for(size);
                let source_digest = match source_digest {
                    Some(d) => d.to_string(),
                    None => hash::hash_file(source, algorithm, buffer_size)?,
                };
                let target_digest = hash::hash_file(target, algorithm, buffer_size)?;
                Ok(compare_digests(result, algorithm, source_digest, target_digest))
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn verify_huge(
    source: &Path,
    target: &Path,
    options: &CopyOptions,
    algorithm: HashAlgorithm,
    size: u64,
    source_digest: Option<&str>,
    progress: &Progress,
    mut result: VerificationResult,
) -> Result<VerificationResult> {
    let strategy = options.huge_file_strategy;
    let buffer_size = options.buffer_size_for(size);
    let granularity = options.segment_size.max(1);
    result.strategy = Some(strategy);

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut report = |done: u64, total: u64| {
        progress.report(format!(
            "Verifying {}: {} / {}",
            name,
            format_size(done, BINARY),
            format_size(total, BINARY)
        ));
    };

    match strategy {
        HugeFileStrategy::FullHashWithProgress => {
            let source_digest = match source_digest {
                Some(d) => d.to_string(),
                None => hash::hash_file_with_progress(
                    source,
                    algorithm,
                    buffer_size,
                    granularity,
                    &mut report,
                )?,
            };
            let target_digest =
                hash::hash_file_with_progress(target, algorithm, buffer_size, granularity, &mut report)?;
            Ok(compare_digests(result, algorithm, source_digest, target_digest))
        }
        HugeFileStrategy::Segmented => {
            let segments = size.div_ceil(granularity);
            for index in 0..segments {
                let offset = index * granularity;
                let len = granularity.min(size - offset);
                let a = hash::hash_range(source, algorithm, buffer_size, offset, len)?;
                let b = hash::hash_range(target, algorithm, buffer_size, offset, len)?;
                if a != b {
                    result.failed_segments.push(index);
                }
                report(offset + len, size);
            }
            result.source_digest = source_digest.map(str::to_string);
            if result.failed_segments.is_empty() {
                result.passed = true;
                Ok(result)
            } else {
                let failed = result.failed_segments.len();
                Ok(result.fail(format!("{failed} of {segments} segments differ")))
            }
        }
        HugeFileStrategy::DualHash => {
            let fast_source = hash::hash_file(source, HashAlgorithm::Md5, buffer_size)?;
            let fast_target = hash::hash_file(target, HashAlgorithm::Md5, buffer_size)?;
            if fast_source != fast_target {
                result.source_digest = Some(fast_source);
                result.target_digest = Some(fast_target);
                return Ok(result.fail("MD5 mismatch; strong hash skipped"));
            }
            if algorithm == HashAlgorithm::Md5 {
                return Ok(compare_digests(result, algorithm, fast_source, fast_target));
            }
            let source_digest = match source_digest {
                Some(d) => d.to_string(),
                None => hash::hash_file(source, algorithm, buffer_size)?,
            };
            let target_digest =
                hash::hash_file_with_progress(target, algorithm, buffer_size, granularity, &mut report)?;
            Ok(compare_digests(result, algorithm, source_digest, target_digest))
        }
        HugeFileStrategy::Incremental => {
            let source_digest = match source_digest {
                Some(d) => d.to_string(),
                None => hash::hash_file(source, algorithm, buffer_size)?,
            };
            let target_digest =
                hash::hash_file_with_progress(target, algorithm, buffer_size, granularity, &mut report)?;
            Ok(compare_digests(result, algorithm, source_digest, target_digest))
        }
    }
}

fn compare_digests(
    mut result: VerificationResult,
    algorithm: HashAlgorithm,
    source_digest: String,
    target_digest: String,
) -> VerificationResult {
    let matched = source_digest == target_digest;
    result.source_digest = Some(source_digest);
    result.target_digest = Some(target_digest);
    if matched {
        result.passed = true;
        result
    } else {
        result.fail(format!("{algorithm} mismatch"))
    }
}

/// Offset of the first differing byte, or None if the files are identical.
pub fn first_difference(a: &Path, b: &Path, buffer_size: usize) -> Result<Option<u64>> {
    let mut left = File::open(a).map_err(|e| CacheError::io(e, "opening for compare", a))?;
    let mut right = File::open(b).map_err(|e| CacheError::io(e, "opening for compare", b))?;
    let mut lbuf = vec![0u8; buffer_size.max(1)];
    let mut rbuf = vec![0u8; buffer_size.max(1)];
    let mut offset: u64 = 0;

    loop {
        let n = read_full(&mut left, &mut lbuf).map_err(|e| CacheError::io(e, "reading", a))?;
        let m = read_full(&mut right, &mut rbuf).map_err(|e| CacheError::io(e, "reading", b))?;
        if let Some(pos) = lbuf[..n.min(m)]
            .iter()
            .zip(&rbuf[..n.min(m)])
            .position(|(x, y)| x != y)
        {
            return Ok(Some(offset + pos as u64));
        }
        if n != m {
            return Ok(Some(offset + n.min(m) as u64));
        }
        if n == 0 {
            return Ok(None);
        }
        offset += n as u64;
    }
}

// Fill as much of `buf` as the reader allows
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn time_distance(a: SystemTime, b: SystemTime) -> Duration {
    a.duration_since(b)
        .or_else(|_| b.duration_since(a))
        .unwrap_or(Duration::ZERO)
}
