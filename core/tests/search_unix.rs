//! End-to-end condition round-trips through the real local shell.
//!
//! These run the compiled enumeration commands against fixture trees via
//! the local session, exercising command synthesis, execution and record
//! parsing together. GNU findutils is assumed, so the suite is gated to
//! Linux hosts.
#![cfg(target_os = "linux")]

use std::sync::Arc;

use shellfs_core::fs::{FileExt, Filesystem, Flags};
use shellfs_core::search::{Condition, Field, Op, Value};
use shellfs_core::session::local::LocalSession;
use shellfs_core::unix::UnixFilesystem;

fn fixture() -> (tempfile::TempDir, Arc<UnixFilesystem>) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("foo.txt"), b"shallow").unwrap();
    std::fs::write(dir.path().join("other.log"), b"noise").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/foo.txt"), b"deep!").unwrap();
    let fs = UnixFilesystem::new(Arc::new(LocalSession::new())).unwrap();
    (dir, fs)
}

#[test]
fn basename_equality_with_depth_one_finds_only_the_shallow_match() {
    let (dir, fs) = fixture();
    let searcher = fs.searcher().unwrap();
    let result = searcher
        .search(&[
            Condition::new(Field::Basename, Op::Equals, Value::Str("foo.txt".into())),
            Condition::from(dir.path().to_str().unwrap()),
            Condition::depth(1),
        ])
        .unwrap();
    let paths: Vec<_> = result.files.iter().map(|f| f.path().to_string()).collect();
    assert_eq!(
        paths,
        vec![dir.path().join("foo.txt").display().to_string()]
    );
    assert!(!result.truncated);
}

#[test]
fn basename_equality_recursive_finds_both_matches() {
    let (dir, fs) = fixture();
    let searcher = fs.searcher().unwrap();
    let result = searcher
        .search(&[
            Condition::new(Field::Basename, Op::Equals, Value::Str("foo.txt".into())),
            Condition::from(dir.path().to_str().unwrap()),
            Condition::recurse(),
        ])
        .unwrap();
    assert_eq!(result.files.len(), 2);
}

#[test]
fn search_results_carry_posix_metadata() {
    let (dir, fs) = fixture();
    let searcher = fs.searcher().unwrap();
    let result = searcher
        .search(&[
            Condition::new(Field::Basename, Op::Equals, Value::Str("foo.txt".into())),
            Condition::from(dir.path().to_str().unwrap()),
            Condition::depth(1),
        ])
        .unwrap();
    let file = &result.files[0];
    assert_eq!(file.length().unwrap(), 7);
    assert!(file.modify_time().unwrap().is_some());
    match file.extended().unwrap() {
        FileExt::Posix(ext) => {
            assert_eq!(ext.permissions.len(), 9);
            assert!(ext.uid >= 0);
        }
        other => panic!("expected posix ext, got {other:?}"),
    }
}

#[test]
fn repeated_identical_query_is_served_from_the_command_cache() {
    let (dir, fs) = fixture();
    let searcher = fs.searcher().unwrap();
    let conditions = vec![
        Condition::new(Field::Basename, Op::Equals, Value::Str("foo.txt".into())),
        Condition::from(dir.path().to_str().unwrap()),
        Condition::depth(1),
    ];
    let first = searcher.search(&conditions).unwrap();
    // Remove the fixture; a cached query must not re-run the command.
    std::fs::remove_file(dir.path().join("foo.txt")).unwrap();
    let second = searcher.search(&conditions).unwrap();
    assert_eq!(first.files.len(), second.files.len());
    assert_eq!(first.files[0].path(), second.files[0].path());
}

#[test]
fn remote_stat_and_listing_through_the_shell() {
    let (dir, fs) = fixture();
    let handle = fs
        .get_file(dir.path().to_str().unwrap(), Flags::ReadOnly)
        .unwrap();
    assert!(handle.is_directory());
    let mut names = handle.child_names().unwrap();
    names.sort();
    assert_eq!(names, vec!["foo.txt", "other.log", "sub"]);
}

#[test]
fn remote_read_write_round_trip() {
    let (dir, fs) = fixture();
    let path = dir.path().join("written.bin");
    let handle = fs
        .get_file(path.to_str().unwrap(), Flags::ReadWrite)
        .unwrap();
    handle.write(b"over the wire", false).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"over the wire");

    let mut content = Vec::new();
    std::io::Read::read_to_end(&mut handle.open().unwrap(), &mut content).unwrap();
    assert_eq!(content, b"over the wire");
}

#[test]
fn batch_alignment_against_the_real_shell() {
    let (dir, fs) = fixture();
    let a = dir.path().join("foo.txt").display().to_string();
    let missing = dir.path().join("nope.txt").display().to_string();
    let b = dir.path().join("other.log").display().to_string();
    let files = fs
        .get_files(&[a.as_str(), missing.as_str(), b.as_str()], Flags::ReadOnly)
        .unwrap();
    assert!(files[0].is_some());
    assert!(files[1].is_none());
    assert!(files[2].is_some());
}
