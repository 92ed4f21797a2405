//! Verified copy engine.
//!
//! Moves file bytes with memory use bounded by the buffer size, hashes the
//! source while streaming, then re-reads the destination to prove the copy.
//! A copy whose verification fails is a failed copy, whatever the I/O layer
//! reported.

pub mod engine;
pub mod options;
pub mod tree;
pub mod verify;

pub use engine::{ByteProgress, CopyOutcome, VerifiedCopyEngine};
pub use options::{CopyOptions, HugeFileStrategy, VerificationMode, GIB, KIB, MIB};
pub use tree::TreeCopyReport;
pub use verify::VerificationResult;
