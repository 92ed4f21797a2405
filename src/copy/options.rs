//! Copy options and verification policy.

use crate::hash::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Smallest and largest buffer the engine will use.
pub const MIN_BUFFER_SIZE: usize = 64 * KIB as usize;
pub const MAX_BUFFER_SIZE: usize = 64 * MIB as usize;

/// How a finished copy is checked against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VerificationMode {
    /// Requested "no verification". Always upgraded to SHA256.
    None,
    /// Lengths match.
    Size,
    /// Lengths match and modified times agree within two seconds.
    SizeAndDate,
    #[serde(rename = "MD5")]
    Md5,
    #[default]
    #[serde(rename = "SHA256")]
    Sha256,
    #[serde(rename = "SHA512")]
    Sha512,
    /// Full byte comparison.
    ByteByByte,
}

impl VerificationMode {
    /// The mode the engine actually runs.
    pub fn effective(self) -> Self {
        match self {
            VerificationMode::None => VerificationMode::Sha256,
            other => other,
        }
    }

    /// Digest computed during the copy pass, if this mode uses one.
    pub fn algorithm(self) -> Option<HashAlgorithm> {
        match self.effective() {
            VerificationMode::Md5 => Some(HashAlgorithm::Md5),
            VerificationMode::Sha256 => Some(HashAlgorithm::Sha256),
            VerificationMode::Sha512 => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Size-only checks cannot catch content corruption.
    pub fn checks_content(self) -> bool {
        !matches!(
            self.effective(),
            VerificationMode::Size | VerificationMode::SizeAndDate
        )
    }
}

impl fmt::Display for VerificationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerificationMode::None => "None",
            VerificationMode::Size => "Size",
            VerificationMode::SizeAndDate => "SizeAndDate",
            VerificationMode::Md5 => "MD5",
            VerificationMode::Sha256 => "SHA256",
            VerificationMode::Sha512 => "SHA512",
            VerificationMode::ByteByByte => "ByteByByte",
        };
        f.write_str(name)
    }
}

/// Verification strategy for files above the huge-file threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HugeFileStrategy {
    /// Hash the whole destination, reporting progress per segment.
    #[default]
    FullHashWithProgress,
    /// Compare fixed-size windows independently.
    Segmented,
    /// MD5 first; the strong digest runs only if MD5 agrees.
    DualHash,
    /// Reuse the copy-pass source digest, hash only the destination.
    Incremental,
}

/// Options for a single verified copy.
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub verification: VerificationMode,
    pub huge_file_strategy: HugeFileStrategy,
    /// Files larger than this use `huge_file_strategy`.
    pub huge_file_threshold: u64,
    /// Window size for segmented verification and progress granularity.
    pub segment_size: u64,
    /// Scales the size-derived buffer; clamped to 64 KiB..64 MiB.
    pub buffer_multiplier: f64,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub preserve_timestamps: bool,
    pub force_disk_sync: bool,
    pub overwrite: bool,
    /// Required free space as a multiple of the file size.
    pub space_margin: f64,
    pub progress_interval: Duration,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            verification: VerificationMode::Sha256,
            huge_file_strategy: HugeFileStrategy::default(),
            huge_file_threshold: 10 * GIB,
            segment_size: GIB,
            buffer_multiplier: 1.0,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            preserve_timestamps: true,
            force_disk_sync: true,
            overwrite: true,
            space_margin: 1.1,
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl CopyOptions {
    pub fn with_verification(mut self, mode: VerificationMode) -> Self {
        self.verification = mode;
        self
    }

    pub fn with_huge_file_strategy(mut self, strategy: HugeFileStrategy, threshold: u64) -> Self {
        self.huge_file_strategy = strategy;
        self.huge_file_threshold = threshold;
        self
    }

    /// Buffer size for a file of `file_size` bytes.
    pub fn buffer_size_for(&self, file_size: u64) -> usize {
        let base = base_buffer_size(file_size) as f64;
        let multiplier = if self.buffer_multiplier.is_finite() && self.buffer_multiplier > 0.0 {
            self.buffer_multiplier
        } else {
            1.0
        };
        ((base * multiplier) as usize).clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
    }

    pub fn is_huge(&self, file_size: u64) -> bool {
        file_size > self.huge_file_threshold
    }
}

fn base_buffer_size(file_size: u64) -> u64 {
    if file_size < MIB {
        64 * KIB
    } else if file_size < 10 * MIB {
        256 * KIB
    } else if file_size < 100 * MIB {
        MIB
    } else if file_size < GIB {
        4 * MIB
    } else {
        16 * MIB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_upgraded() {
        assert_eq!(VerificationMode::None.effective(), VerificationMode::Sha256);
        assert_eq!(VerificationMode::None.algorithm(), Some(HashAlgorithm::Sha256));
        assert!(VerificationMode::None.checks_content());
        assert!(!VerificationMode::SizeAndDate.checks_content());
    }

    #[test]
    fn test_buffer_size_table() {
        let options = CopyOptions::default();
        assert_eq!(options.buffer_size_for(0), 64 * 1024);
        assert_eq!(options.buffer_size_for(MIB - 1), 64 * 1024);
        assert_eq!(options.buffer_size_for(MIB), 256 * 1024);
        assert_eq!(options.buffer_size_for(50 * MIB), MIB as usize);
        assert_eq!(options.buffer_size_for(500 * MIB), 4 * MIB as usize);
        assert_eq!(options.buffer_size_for(90 * GIB), 16 * MIB as usize);
    }

    #[test]
    fn test_buffer_multiplier_is_clamped() {
        let mut options = CopyOptions::default();
        options.buffer_multiplier = 0.01;
        assert_eq!(options.buffer_size_for(0), MIN_BUFFER_SIZE);
        options.buffer_multiplier = 100.0;
        assert_eq!(options.buffer_size_for(90 * GIB), MAX_BUFFER_SIZE);
        options.buffer_multiplier = 2.0;
        assert_eq!(options.buffer_size_for(50 * MIB), 2 * MIB as usize);
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&VerificationMode::Sha512).unwrap();
        assert_eq!(json, "\"SHA512\"");
        let mode: VerificationMode = serde_json::from_str("\"ByteByByte\"").unwrap();
        assert_eq!(mode, VerificationMode::ByteByByte);
    }
}
