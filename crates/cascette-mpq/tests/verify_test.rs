//! Signature and file verification, including damaged archives.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::fs;
use std::path::Path;

use cascette_mpq::config::CreateOptions;
use cascette_mpq::verify::{
    ARCHIVE_NO_SIGNATURE, ARCHIVE_WEAK_SIGNATURE_ERROR, ARCHIVE_WEAK_SIGNATURE_OK,
    VERIFY_FILE_CHECKSUM_ERROR, VERIFY_FILE_HAS_CHECKSUM, VERIFY_FILE_HAS_MD5,
    VERIFY_FILE_MD5_ERROR, VERIFY_OPEN_ERROR,
};
use cascette_mpq::{
    AttributeFlags, CreateMode, FlagInput, MemoryEngine, MpqError, OpenMode, Storm, VerifyFlags,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn create_with_attributes(storm: &Storm<MemoryEngine>, path: &Path) {
    let options = CreateOptions::new().with_attributes(AttributeFlags {
        crc32: true,
        md5: true,
        ..AttributeFlags::default()
    });
    let mut archive = storm.create(path, CreateMode::Options(options)).unwrap();
    archive
        .add_file_from_bytes("war3map.j", b"function main", None)
        .unwrap();
    archive.sign().unwrap();
    archive.close().unwrap();
}

/// Flip one byte of the first stored payload in the archive image
fn damage_first_entry(path: &Path) {
    let raw = fs::read(path).unwrap();
    let mut image: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    let byte = &mut image["entries"][0]["data"][0];
    let flipped = byte.as_u64().unwrap() ^ 0xFF;
    *byte = serde_json::Value::from(flipped);
    fs::write(path, serde_json::to_vec(&image).unwrap()).unwrap();
}

#[test]
fn unsigned_archive_passes() {
    let dir = TempDir::new().unwrap();
    let storm = Storm::new(MemoryEngine::new());
    let archive = storm
        .create(dir.path().join("plain.mpq"), CreateMode::Default)
        .unwrap();

    assert_eq!(archive.verify_status().unwrap(), ARCHIVE_NO_SIGNATURE);
    archive.verify().unwrap();
}

#[test]
fn intact_archive_verifies() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("signed.mpq");
    let storm = Storm::new(MemoryEngine::new());
    create_with_attributes(&storm, &path);

    let archive = storm.open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(archive.verify_status().unwrap(), ARCHIVE_WEAK_SIGNATURE_OK);
    archive.verify().unwrap();

    let status = archive.verify_file_status("war3map.j", None).unwrap();
    assert_eq!(status, VERIFY_FILE_HAS_CHECKSUM | VERIFY_FILE_HAS_MD5);
    archive.verify_file("war3map.j", None).unwrap();
}

#[test]
fn damaged_archive_fails_verification() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("damaged.mpq");
    let storm = Storm::new(MemoryEngine::new());
    create_with_attributes(&storm, &path);
    damage_first_entry(&path);

    let archive = storm.open(&path, OpenMode::ReadOnly).unwrap();
    assert!(matches!(
        archive.verify(),
        Err(MpqError::ArchiveVerification {
            status: ARCHIVE_WEAK_SIGNATURE_ERROR
        })
    ));

    match archive.verify_file("war3map.j", None) {
        Err(MpqError::FileVerification { name, status }) => {
            assert_eq!(name, "war3map.j");
            assert_ne!(status & VERIFY_FILE_MD5_ERROR, 0);
            assert_ne!(status & VERIFY_FILE_CHECKSUM_ERROR, 0);
        }
        other => panic!("expected a verification failure, got {other:?}"),
    }
}

#[test]
fn checks_can_be_narrowed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("narrow.mpq");
    let storm = Storm::new(MemoryEngine::new());
    create_with_attributes(&storm, &path);
    damage_first_entry(&path);

    let archive = storm.open(&path, OpenMode::ReadOnly).unwrap();
    let md5_only = FlagInput::Named(VerifyFlags {
        file_md5: true,
        ..VerifyFlags::default()
    });
    assert_eq!(
        archive.verify_file_status("war3map.j", Some(&md5_only)).unwrap(),
        VERIFY_FILE_HAS_MD5 | VERIFY_FILE_MD5_ERROR
    );

    // sector CRCs were never written, so this check finds nothing to fail
    let sector_only = FlagInput::Raw(VerifyFlags::SECTOR_CRC);
    archive
        .verify_file("war3map.j", Some(&sector_only))
        .unwrap();
}

#[test]
fn missing_file_fails_verification() {
    let dir = TempDir::new().unwrap();
    let storm = Storm::new(MemoryEngine::new());
    let archive = storm
        .create(dir.path().join("empty.mpq"), CreateMode::Default)
        .unwrap();

    assert_eq!(
        archive.verify_file_status("missing.txt", None).unwrap(),
        VERIFY_OPEN_ERROR
    );
    assert!(matches!(
        archive.verify_file("missing.txt", None),
        Err(MpqError::FileVerification { .. })
    ));
}
