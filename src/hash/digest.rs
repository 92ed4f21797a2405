// Digest computation module
// Hash algorithm registry and streaming file hashing

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest as Sha2Digest, Sha256, Sha512};

/// Trait for hash algorithm implementations
pub trait Hasher: Send {
    /// Update the hasher with new data
    fn update(&mut self, data: &[u8]);

    /// Finalize the hash and return the result
    fn finalize(self: Box<Self>) -> Vec<u8>;

    /// Get the output size in bytes
    fn output_size(&self) -> usize;
}

/// Digest algorithms used for copy verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn hasher(self) -> Box<dyn Hasher> {
        match self {
            HashAlgorithm::Md5 => Box::new(Md5Wrapper(Md5Digest::new())),
            HashAlgorithm::Sha256 => Box::new(Sha256Wrapper(Sha2Digest::new())),
            HashAlgorithm::Sha512 => Box::new(Sha512Wrapper(Sha2Digest::new())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Sha512 => "SHA512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// MD5 wrapper
pub struct Md5Wrapper(Md5);

impl Hasher for Md5Wrapper {
    fn update(&mut self, data: &[u8]) {
        Md5Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        Md5Digest::finalize(self.0).to_vec()
    }

    fn output_size(&self) -> usize {
        16 // 128 bits
    }
}

// SHA-256 wrapper
pub struct Sha256Wrapper(Sha256);

impl Hasher for Sha256Wrapper {
    fn update(&mut self, data: &[u8]) {
        Sha2Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        Sha2Digest::finalize(self.0).to_vec()
    }

    fn output_size(&self) -> usize {
        32 // 256 bits
    }
}

// SHA-512 wrapper
pub struct Sha512Wrapper(Sha512);

impl Hasher for Sha512Wrapper {
    fn update(&mut self, data: &[u8]) {
        Sha2Digest::update(&mut self.0, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        Sha2Digest::finalize(self.0).to_vec()
    }

    fn output_size(&self) -> usize {
        64 // 512 bits
    }
}

/// Hash a whole file, reporting `(bytes_done, total)` every `granularity` bytes.
pub fn hash_file_with_progress(
    path: &Path,
    algorithm: HashAlgorithm,
    buffer_size: usize,
    granularity: u64,
    on_progress: &mut dyn FnMut(u64, u64),
) -> Result<String> {
    let mut file = File::open(path).map_err(|e| CacheError::io(e, "opening for hash", path))?;
    let total = file
        .metadata()
        .map_err(|e| CacheError::io(e, "reading metadata", path))?
        .len();
    hash_reader(&mut file, path, algorithm, buffer_size, u64::MAX, granularity, total, on_progress)
}

/// Hash a whole file.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm, buffer_size: usize) -> Result<String> {
    hash_file_with_progress(path, algorithm, buffer_size, u64::MAX, &mut |_, _| {})
}

/// Hash `len` bytes of `path` starting at `offset`.
pub fn hash_range(
    path: &Path,
    algorithm: HashAlgorithm,
    buffer_size: usize,
    offset: u64,
    len: u64,
) -> Result<String> {
    let mut file = File::open(path).map_err(|e| CacheError::io(e, "opening for hash", path))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| CacheError::io(e, "seeking", path))?;
    hash_reader(&mut file, path, algorithm, buffer_size, len, u64::MAX, len, &mut |_, _| {})
}

#[allow(clippy::too_many_arguments)]
fn hash_reader(
    file: &mut File,
    path: &Path,
    algorithm: HashAlgorithm,
    buffer_size: usize,
    limit: u64,
    granularity: u64,
    total: u64,
    on_progress: &mut dyn FnMut(u64, u64),
) -> Result<String> {
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut done: u64 = 0;
    let mut next_report = granularity;

    while done < limit {
        let want = (limit - done).min(buffer.len() as u64) as usize;
        let bytes_read = file
            .read(&mut buffer[..want])
            .map_err(|e| CacheError::io(e, "reading for hash", path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        done += bytes_read as u64;

        if done >= next_report {
            on_progress(done, total);
            next_report = next_report.saturating_add(granularity);
        }
    }

    Ok(bytes_to_hex(&hasher.finalize()))
}

/// Lowercase hex encoding of a digest
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
