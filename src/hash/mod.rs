// Digest library
// Hash algorithms and streaming file hashing used by copy verification

pub mod digest;

pub use digest::{
    bytes_to_hex, hash_file, hash_file_with_progress, hash_range, HashAlgorithm, Hasher,
};
