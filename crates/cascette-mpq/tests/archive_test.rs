//! Archive lifecycle and write operations against the in-memory engine.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::fs;

use cascette_mpq::engine::ErrorCode;
use cascette_mpq::{
    Codec, CompressionInput, CreateMode, FileFlags, FlagInput, InfoClass, MemoryEngine, MpqError,
    OpenMode, Storm,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn setup() -> (TempDir, Storm<MemoryEngine>) {
    // RUST_LOG=cascette_mpq=debug shows engine calls
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let dir = TempDir::new().expect("Failed to create temp dir");
    (dir, Storm::new(MemoryEngine::new()))
}

#[test]
fn close_is_idempotent_and_invalidates_every_operation() {
    let (dir, storm) = setup();
    let mut archive = storm
        .create(dir.path().join("closed.mpq"), CreateMode::Default)
        .unwrap();
    archive.add_file_from_bytes("a.txt", b"alpha", None).unwrap();

    archive.close().unwrap();
    archive.close().unwrap();
    assert!(!archive.is_open());
    assert_eq!(archive.raw_handle(), None);
    assert_eq!(storm.engine().open_handle_count(), 0);

    assert!(archive.has_file("a.txt").unwrap_err().is_invalid_handle());
    assert!(archive.read_file("a.txt").unwrap_err().is_invalid_handle());
    assert!(archive.search("*", None).unwrap_err().is_invalid_handle());
    assert!(archive.verify().unwrap_err().is_invalid_handle());
    assert!(archive.flush().unwrap_err().is_invalid_handle());
    assert!(
        archive
            .get_info(InfoClass::MaxFileCount)
            .unwrap_err()
            .is_invalid_handle()
    );
    assert!(
        archive
            .add_file_from_bytes("b.txt", b"beta", None)
            .unwrap_err()
            .is_invalid_handle()
    );
    assert!(archive.remove_file("a.txt").unwrap_err().is_invalid_handle());
    assert!(archive.set_max_files(64).unwrap_err().is_invalid_handle());
}

#[test]
fn failed_close_keeps_the_handle_for_a_retry() {
    let (dir, storm) = setup();
    let sub = dir.path().join("sub");
    fs::create_dir(&sub).unwrap();
    let path = sub.join("retry.mpq");

    let mut archive = storm.create(&path, CreateMode::Default).unwrap();
    archive.add_file_from_bytes("a.txt", b"alpha", None).unwrap();
    fs::remove_dir_all(&sub).unwrap();

    let err = archive.close().unwrap_err();
    assert_eq!(err.engine_code(), Some(ErrorCode::FILE_NOT_FOUND));
    assert!(archive.is_open());
    assert_eq!(storm.engine().open_handle_count(), 1);

    fs::create_dir(&sub).unwrap();
    archive.close().unwrap();
    assert!(!archive.is_open());
    assert_eq!(storm.engine().open_handle_count(), 0);

    let reopened = storm.open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(reopened.read_file_to_string("a.txt").unwrap(), "alpha");
}

#[test]
fn drop_closes_and_persists() {
    let (dir, storm) = setup();
    let path = dir.path().join("dropped.mpq");
    {
        let mut archive = storm.create(&path, CreateMode::Default).unwrap();
        archive
            .add_file_from_bytes("data\\readme.txt", b"persisted", None)
            .unwrap();
    }
    assert_eq!(storm.engine().open_handle_count(), 0);

    let archive = storm.open(&path, OpenMode::ReadOnly).unwrap();
    assert_eq!(
        archive.read_file_to_string("data\\readme.txt").unwrap(),
        "persisted"
    );
}

#[test]
fn add_read_rename_extract_remove() {
    let (dir, storm) = setup();
    let mut archive = storm
        .create(dir.path().join("ops.mpq"), CreateMode::Default)
        .unwrap();
    let script = b"function main takes nothing returns nothing";

    archive.add_file_from_bytes("war3map.j", script, None).unwrap();
    assert!(archive.has_file("war3map.j").unwrap());
    assert!(archive.has_file("WAR3MAP.J").unwrap());
    assert!(!archive.has_file("war3map.lua").unwrap());
    assert_eq!(&archive.read_file("war3map.j").unwrap()[..], script);

    archive.rename_file("war3map.j", "scripts\\war3map.j").unwrap();
    assert!(!archive.has_file("war3map.j").unwrap());
    assert!(archive.has_file("scripts/war3map.j").unwrap());

    let out = dir.path().join("war3map.j");
    archive.extract_file("scripts\\war3map.j", &out).unwrap();
    assert_eq!(fs::read(&out).unwrap(), script);

    archive.remove_file("scripts\\war3map.j").unwrap();
    assert!(!archive.has_file("scripts\\war3map.j").unwrap());
    let err = archive.remove_file("scripts\\war3map.j").unwrap_err();
    assert_eq!(err.engine_code(), Some(ErrorCode::FILE_NOT_FOUND));
}

#[test]
fn add_file_from_host_path() {
    let (dir, storm) = setup();
    let source = dir.path().join("source.txt");
    fs::write(&source, "from disk").unwrap();

    let mut archive = storm
        .create(dir.path().join("host.mpq"), CreateMode::Default)
        .unwrap();
    archive.add_file(&source, "units\\source.txt", None).unwrap();
    archive
        .add_file_with_compression(
            &source,
            "units\\zlib.txt",
            None,
            &CompressionInput::from(Codec::Zlib),
            Some(&CompressionInput::from(&[Codec::Bzip2, Codec::Huffman][..])),
        )
        .unwrap();

    assert_eq!(
        archive.read_file_to_string("units\\source.txt").unwrap(),
        "from disk"
    );
    assert_eq!(
        archive.read_file_to_string("units\\zlib.txt").unwrap(),
        "from disk"
    );
}

#[test]
fn replace_flag_controls_overwrites() {
    let (dir, storm) = setup();
    let mut archive = storm
        .create(dir.path().join("replace.mpq"), CreateMode::Default)
        .unwrap();

    archive.add_file_from_bytes("a.txt", b"first", None).unwrap();
    archive.add_file_from_bytes("a.txt", b"second", None).unwrap();
    assert_eq!(archive.read_file_to_string("a.txt").unwrap(), "second");

    let keep = FlagInput::Named(FileFlags {
        compress: true,
        ..FileFlags::default()
    });
    let err = archive
        .add_file_from_bytes("a.txt", b"third", Some(&keep))
        .unwrap_err();
    assert_eq!(err.engine_code(), Some(ErrorCode::ALREADY_EXISTS));
    assert_eq!(archive.read_file_to_string("a.txt").unwrap(), "second");
}

#[test]
fn implode_and_compress_are_rejected() {
    let (dir, storm) = setup();
    let mut archive = storm
        .create(dir.path().join("implode.mpq"), CreateMode::Default)
        .unwrap();

    let named = FlagInput::Named(FileFlags {
        implode: true,
        compress: true,
        ..FileFlags::default()
    });
    assert!(matches!(
        archive.add_file_from_bytes("a.txt", b"x", Some(&named)),
        Err(MpqError::InvalidOptionCombination(_))
    ));

    let raw = FlagInput::Raw(FileFlags::IMPLODE | FileFlags::COMPRESS);
    assert!(matches!(
        archive.add_file_from_bytes("a.txt", b"x", Some(&raw)),
        Err(MpqError::InvalidOptionCombination(_))
    ));
    assert!(!archive.has_file("a.txt").unwrap());
}

#[test]
fn unknown_codec_name_is_rejected() {
    let (dir, storm) = setup();
    let mut archive = storm
        .create(dir.path().join("codec.mpq"), CreateMode::Default)
        .unwrap();

    let flags = FlagInput::Named(FileFlags {
        compression: Some(CompressionInput::from("lzx")),
        ..FileFlags::default()
    });
    assert!(matches!(
        archive.add_file_from_bytes("a.txt", b"x", Some(&flags)),
        Err(MpqError::UnknownFlagName(_))
    ));
}

#[test]
fn read_only_archives_refuse_writes() {
    let (dir, storm) = setup();
    let path = dir.path().join("ro.mpq");
    storm
        .create(&path, CreateMode::Default)
        .unwrap()
        .close()
        .unwrap();

    let mut archive = storm.open(&path, OpenMode::ReadOnly).unwrap();
    let err = archive.add_file_from_bytes("a.txt", b"x", None).unwrap_err();
    assert_eq!(err.engine_code(), Some(ErrorCode::ACCESS_DENIED));
}

#[test]
fn create_refuses_existing_path() {
    let (dir, storm) = setup();
    let path = dir.path().join("twice.mpq");
    storm.create(&path, CreateMode::Default).unwrap();

    let err = storm.create(&path, CreateMode::Default).unwrap_err();
    assert_eq!(err.engine_code(), Some(ErrorCode::ALREADY_EXISTS));
}

#[test]
fn open_missing_archive_reports_engine_error() {
    let (dir, storm) = setup();
    let err = storm
        .open(dir.path().join("missing.mpq"), OpenMode::Default)
        .unwrap_err();
    assert_eq!(err.engine_code(), Some(ErrorCode::FILE_NOT_FOUND));
}

#[test]
fn bytes_round_trip_through_a_new_path() {
    let (dir, storm) = setup();
    let mut archive = storm
        .create(dir.path().join("original.mpq"), CreateMode::Default)
        .unwrap();
    archive.add_file_from_bytes("a.txt", b"alpha", None).unwrap();
    let bytes = archive.to_bytes().unwrap();

    let copy = storm
        .from_bytes(&bytes, dir.path().join("copy.mpq"), OpenMode::Default)
        .unwrap();
    assert_eq!(copy.file_path(), dir.path().join("copy.mpq").as_path());
    assert_eq!(copy.read_file_to_string("a.txt").unwrap(), "alpha");
}

#[test]
fn max_file_count_is_range_checked() {
    let (dir, storm) = setup();
    let mut archive = storm
        .create(dir.path().join("max.mpq"), CreateMode::Default)
        .unwrap();

    assert!(matches!(
        archive.set_max_files(2),
        Err(MpqError::MaxFileCountOutOfRange { count: 2, .. })
    ));
    assert!(matches!(
        archive.set_max_files(0x8_0001),
        Err(MpqError::MaxFileCountOutOfRange { .. })
    ));

    archive.set_max_files(64).unwrap();
    assert_eq!(
        archive.get_info(InfoClass::MaxFileCount).unwrap().as_u32(),
        Some(64)
    );
    assert_eq!(
        archive.get_info(InfoClass::HashTableSize).unwrap().as_u32(),
        Some(64)
    );

    assert!(matches!(
        storm.create(
            dir.path().join("tiny.mpq"),
            CreateMode::Flags {
                flags: 0,
                max_files: 1
            }
        ),
        Err(MpqError::MaxFileCountOutOfRange { .. })
    ));
}

#[test]
fn patches_overlay_base_files() {
    let (dir, storm) = setup();
    let base_path = dir.path().join("base.mpq");
    let patch_path = dir.path().join("patch.mpq");

    let mut base = storm.create(&base_path, CreateMode::Default).unwrap();
    base.add_file_from_bytes("a.txt", b"base", None).unwrap();
    base.add_file_from_bytes("b.txt", b"untouched", None).unwrap();
    base.close().unwrap();

    let mut patch = storm.create(&patch_path, CreateMode::Default).unwrap();
    patch.add_file_from_bytes("a.txt", b"patched", None).unwrap();
    patch.close().unwrap();

    let mut archive = storm.open(&base_path, OpenMode::ReadOnly).unwrap();
    assert!(!archive.is_patched().unwrap());
    archive.patch(&patch_path, "").unwrap();
    assert!(archive.is_patched().unwrap());

    assert_eq!(archive.read_file_to_string("a.txt").unwrap(), "patched");
    assert_eq!(archive.read_file_to_string("b.txt").unwrap(), "untouched");
}

#[test]
fn compact_and_listfile_need_existing_listfile() {
    let (dir, storm) = setup();
    let mut archive = storm
        .create(dir.path().join("compact.mpq"), CreateMode::Default)
        .unwrap();
    archive.add_file_from_bytes("a.txt", b"alpha", None).unwrap();

    let listfile = dir.path().join("listfile.txt");
    fs::write(&listfile, "a.txt\r\nb.txt\r\n").unwrap();
    archive.add_listfile(&listfile).unwrap();
    archive.compact(Some(&listfile)).unwrap();
    archive.compact(None).unwrap();
    assert_eq!(archive.read_file_to_string("a.txt").unwrap(), "alpha");

    let err = archive
        .add_listfile(dir.path().join("missing.txt"))
        .unwrap_err();
    assert_eq!(err.engine_code(), Some(ErrorCode::FILE_NOT_FOUND));
}
