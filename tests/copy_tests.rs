// Tests for the verified copy engine

use cachemax::copy::verify::verify;
use cachemax::copy::{CopyOptions, HugeFileStrategy, VerificationMode, VerifiedCopyEngine, KIB};
use cachemax::hash::{hash_file, HashAlgorithm};
use cachemax::fs::space::available_space;
use cachemax::{CacheError, ErrorClass, Progress};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::tempdir;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Flip one byte of `path` in place and put its modified time back.
fn corrupt(path: &Path, offset: u64) {
    let modified = fs::metadata(path).unwrap().modified().unwrap();
    let mut file = OpenOptions::new().read(true).write(true).open(path).unwrap();
    let mut data = fs::read(path).unwrap();
    data[offset as usize] ^= 0xFF;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&data[offset as usize..offset as usize + 1]).unwrap();
    file.sync_all().unwrap();
    drop(file);
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
}

fn engine() -> VerifiedCopyEngine {
    VerifiedCopyEngine::new(CopyOptions {
        force_disk_sync: false,
        ..CopyOptions::default()
    })
}

#[tokio::test]
async fn test_copy_produces_identical_file() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.bin");
    let dst = dir.path().join("nested/dst.bin");
    fs::write(&src, payload(300 * KIB as usize)).unwrap();

    let outcome = engine().copy(&src, &dst, &Progress::silent()).await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(outcome.bytes_copied, 300 * KIB);

    let verification = outcome.verification.unwrap();
    assert!(verification.passed);
    assert_eq!(verification.mode, VerificationMode::Sha256);
    assert_eq!(
        hash_file(&src, HashAlgorithm::Sha256, 64 * 1024).unwrap(),
        hash_file(&dst, HashAlgorithm::Sha256, 64 * 1024).unwrap()
    );
    let src_time = fs::metadata(&src).unwrap().modified().unwrap();
    let dst_time = fs::metadata(&dst).unwrap().modified().unwrap();
    assert_eq!(src_time, dst_time);
}

#[tokio::test]
async fn test_requested_none_still_hashes() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("a.txt");
    fs::write(&src, b"content").unwrap();

    let options = CopyOptions::default().with_verification(VerificationMode::None);
    let outcome = engine()
        .copy_with(&src, &dir.path().join("b.txt"), &options, &Progress::silent(), None)
        .await;
    assert!(outcome.success);
    assert_eq!(outcome.verification.unwrap().mode, VerificationMode::Sha256);
}

#[test]
fn test_flipped_byte_detected_by_content_modes() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("src.bin");
    let dst = dir.path().join("dst.bin");
    fs::write(&src, payload(4096)).unwrap();
    fs::copy(&src, &dst).unwrap();
    let modified = fs::metadata(&src).unwrap().modified().unwrap();
    File::options().write(true).open(&dst).unwrap().set_modified(modified).unwrap();
    corrupt(&dst, 1234);

    for mode in [
        VerificationMode::Md5,
        VerificationMode::Sha256,
        VerificationMode::Sha512,
        VerificationMode::ByteByByte,
    ] {
        let options = CopyOptions::default().with_verification(mode);
        let result = verify(&src, &dst, &options, None, &Progress::silent());
        assert!(!result.passed, "{mode} accepted a corrupted copy");
    }

    for mode in [VerificationMode::Size, VerificationMode::SizeAndDate] {
        let options = CopyOptions::default().with_verification(mode);
        let result = verify(&src, &dst, &options, None, &Progress::silent());
        assert!(result.passed, "{mode} should only look at metadata");
    }
}

#[test]
fn test_huge_file_strategies() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("big.bin");
    let dst = dir.path().join("big.copy");
    fs::write(&src, payload(256 * KIB as usize)).unwrap();
    fs::copy(&src, &dst).unwrap();

    let strategies = [
        HugeFileStrategy::FullHashWithProgress,
        HugeFileStrategy::Segmented,
        HugeFileStrategy::DualHash,
        HugeFileStrategy::Incremental,
    ];
    let options_for = |strategy| {
        let mut options = CopyOptions::default().with_huge_file_strategy(strategy, 16 * KIB);
        options.segment_size = 64 * KIB;
        options
    };

    for strategy in strategies {
        let result = verify(&src, &dst, &options_for(strategy), None, &Progress::silent());
        assert!(result.passed, "{strategy:?} rejected an identical copy");
        assert_eq!(result.strategy, Some(strategy));
    }

    // third segment
    corrupt(&dst, 150 * KIB);
    for strategy in strategies {
        let result = verify(&src, &dst, &options_for(strategy), None, &Progress::silent());
        assert!(!result.passed, "{strategy:?} accepted a corrupted copy");
        if strategy == HugeFileStrategy::Segmented {
            assert_eq!(result.failed_segments, vec![2]);
        }
    }
}

#[tokio::test]
async fn test_missing_source_fails_without_creating_target() {
    let dir = tempdir().unwrap();
    let dst = dir.path().join("dst.bin");
    let outcome = engine()
        .copy(&dir.path().join("absent.bin"), &dst, &Progress::silent())
        .await;
    assert!(!outcome.success);
    assert!(outcome.error.is_some());
    assert!(!dst.exists());
    assert!(outcome.into_result().is_err());
}

#[tokio::test]
async fn test_insufficient_space_fails_before_writing() {
    let dir = tempdir().unwrap();
    if available_space(dir.path()).is_none() {
        return;
    }
    let src = dir.path().join("src.bin");
    let dst = dir.path().join("out/dst.bin");
    fs::write(&src, payload(64 * KIB as usize)).unwrap();

    // no volume holds a petabyte per byte of source
    let engine = VerifiedCopyEngine::new(CopyOptions {
        force_disk_sync: false,
        space_margin: 1e15,
        ..CopyOptions::default()
    });
    let outcome = engine.copy(&src, &dst, &Progress::silent()).await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_class, Some(ErrorClass::Precondition));
    assert!(outcome.error.unwrap().contains("insufficient space"));
    assert_eq!(outcome.bytes_copied, 0);
    assert!(!dst.exists());
}

#[cfg(windows)]
#[tokio::test]
async fn test_locked_source_reports_contention() {
    use std::os::windows::fs::OpenOptionsExt;

    let dir = tempdir().unwrap();
    let src = dir.path().join("held.bin");
    let dst = dir.path().join("dst.bin");
    fs::write(&src, payload(4 * KIB as usize)).unwrap();
    let _held = OpenOptions::new()
        .read(true)
        .share_mode(0)
        .open(&src)
        .unwrap();

    let outcome = engine().copy(&src, &dst, &Progress::silent()).await;
    assert!(!outcome.success);
    assert_eq!(outcome.error_class, Some(ErrorClass::Contention));
    assert!(!dst.exists());
    assert!(matches!(
        outcome.into_result(),
        Err(CacheError::Locked { .. })
    ));
}

#[tokio::test]
async fn test_copy_tree_reports_every_file() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("tree");
    fs::create_dir_all(src.join("a/b")).unwrap();
    fs::create_dir_all(src.join("empty")).unwrap();
    fs::write(src.join("top.txt"), b"1").unwrap();
    fs::write(src.join("a/mid.txt"), b"22").unwrap();
    fs::write(src.join("a/b/deep.txt"), b"333").unwrap();

    let dst = dir.path().join("copy");
    let engine = engine();
    let report = engine
        .copy_tree(&src, &dst, engine.defaults(), 2, &Progress::silent())
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.files_copied, 3);
    assert_eq!(report.bytes_copied, 6);
    assert!(dst.join("empty").is_dir());
    assert_eq!(fs::read(dst.join("a/b/deep.txt")).unwrap(), b"333");
}
