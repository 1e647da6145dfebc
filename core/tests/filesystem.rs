//! Cache and batch semantics of the unified file model, driven through a
//! scripted session so every remote command is observable.

mod common;

use std::sync::Arc;

use common::{linux_file_record, ScriptedSession};
use shellfs_core::fs::{Filesystem, Flags};
use shellfs_core::unix::UnixFilesystem;

fn stat_marker() -> &'static str {
    // Every driver stat command is a find -printf invocation.
    "-printf"
}

#[test]
fn cache_idempotence_second_lookup_issues_no_command() {
    let session = Arc::new(
        ScriptedSession::new().reply("/etc/hosts", linux_file_record("/etc/hosts", 1024)),
    );
    let fs = UnixFilesystem::new(session.clone()).unwrap();

    let first = fs.get_file("/etc/hosts", Flags::ReadOnly).unwrap();
    assert_eq!(first.length().unwrap(), 1024);
    let commands_after_first = session.command_count(stat_marker());
    assert_eq!(commands_after_first, 1);

    let second = fs.get_file("/etc/hosts", Flags::ReadOnly).unwrap();
    assert_eq!(second.length().unwrap(), 1024);
    assert_eq!(
        session.command_count(stat_marker()),
        commands_after_first,
        "cache hit must not issue a remote command"
    );
    assert_eq!(first.info().unwrap(), second.info().unwrap());
}

#[test]
fn no_cache_lookups_never_seed_the_cache() {
    let session = Arc::new(
        ScriptedSession::new().reply("/var/run/lock", linux_file_record("/var/run/lock", 0)),
    );
    let fs = UnixFilesystem::new(session.clone()).unwrap();

    let transient = fs.get_file("/var/run/lock", Flags::NoCache).unwrap();
    transient.info().unwrap();
    assert_eq!(session.command_count(stat_marker()), 1);

    // A read-only lookup of the same path must miss and re-query.
    let cached = fs.get_file("/var/run/lock", Flags::ReadOnly).unwrap();
    cached.info().unwrap();
    assert_eq!(session.command_count(stat_marker()), 2);
}

#[test]
fn read_write_handles_bypass_the_cache_entirely() {
    let session = Arc::new(
        ScriptedSession::new().reply("/etc/motd", linux_file_record("/etc/motd", 99)),
    );
    let fs = UnixFilesystem::new(session.clone()).unwrap();

    fs.get_file("/etc/motd", Flags::ReadOnly)
        .unwrap()
        .info()
        .unwrap();
    let writable = fs.get_file("/etc/motd", Flags::ReadWrite).unwrap();
    writable.info().unwrap();
    // The writable handle may not be served from the read-only cache.
    assert_eq!(session.command_count(stat_marker()), 2);
}

#[test]
fn batch_lookup_aligns_missing_paths_with_none() {
    let mut batch_output = String::new();
    batch_output.push_str(&linux_file_record("/a", 1));
    batch_output.push_str(&linux_file_record("/b", 2));
    let session = Arc::new(ScriptedSession::new().reply("xargs", batch_output));
    let fs = UnixFilesystem::new(session.clone()).unwrap();

    let files = fs
        .get_files(&["/a", "/missing", "/b"], Flags::ReadOnly)
        .unwrap();
    assert_eq!(files.len(), 3);
    assert_eq!(files[0].as_ref().unwrap().path(), "/a");
    assert!(files[1].is_none());
    assert_eq!(files[2].as_ref().unwrap().path(), "/b");
    // One compound command serves the whole batch.
    assert_eq!(session.command_count("xargs"), 1);
}

#[test]
fn batch_lookup_deduplicates_repeated_paths() {
    let session =
        Arc::new(ScriptedSession::new().reply("xargs", linux_file_record("/dup", 7)));
    let fs = UnixFilesystem::new(session.clone()).unwrap();

    let files = fs.get_files(&["/dup", "/dup"], Flags::ReadOnly).unwrap();
    assert_eq!(files.len(), 2);
    assert!(files[0].is_some());
    assert!(files[1].is_some());
    let cmd = session
        .commands
        .lock()
        .unwrap()
        .iter()
        .find(|c| c.contains("xargs"))
        .cloned()
        .unwrap();
    assert_eq!(cmd.matches("/dup").count(), 1, "{cmd}");
}

#[test]
fn access_denied_is_local_and_immediate() {
    let session = Arc::new(
        ScriptedSession::new().reply("/etc/passwd", linux_file_record("/etc/passwd", 512)),
    );
    let fs = UnixFilesystem::new(session.clone()).unwrap();

    let file = fs.get_file("/etc/passwd", Flags::ReadOnly).unwrap();
    file.info().unwrap();
    let commands_before = session.commands.lock().unwrap().len();
    assert!(file.delete().is_err());
    assert!(file.write(b"x", false).is_err());
    assert!(file.mkdir().is_err());
    // None of those attempts may reach the host.
    assert_eq!(session.commands.lock().unwrap().len(), commands_before);
}
