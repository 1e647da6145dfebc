//! Path-keyed metadata cache.
//!
//! Holds read-only handles only. Insertion is idempotent: the first
//! metadata snapshot for a path wins and re-insertion is a no-op; entries
//! never refresh for the lifetime of the cache, so callers can rely on
//! cache stability within one run.
//!
//! Two backends:
//!
//! - **transient**: a process-lifetime map;
//! - **persistent**: additionally mirrors serialized metadata records into
//!   an ordered on-disk index that survives restarts. Writes are batched
//!   and flushed periodically; the cache is an accelerator, not a system of
//!   record, so losing a tail of unflushed inserts is acceptable. A corrupt
//!   or unreadable index file is deleted and rebuilt, never trusted
//!   partially.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::session::Session;

use super::{FileExt, FileInfo, FileType, PosixExt, RemoteFile, WindowsExt};

/// Sentinel for an absent timestamp in the on-disk record.
const NO_TIME: i64 = -1;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build the cache a session's configuration asks for: persistent when
/// `cache.persistent` is set and the session has a workspace to put the
/// index in, transient otherwise.
pub(crate) fn for_session(session: &dyn Session, index_name: &str) -> Arc<FileCache> {
    if session.properties().cache_persistent() {
        if let Some(workspace) = session.workspace() {
            return FileCache::persistent(
                workspace.join(index_name),
                session.properties().cache_flush_every(),
            );
        }
        tracing::debug!("persistent cache requested but session has no workspace");
    }
    FileCache::transient()
}

/// Result of a cache probe.
pub(crate) enum CacheHit {
    /// A live handle from this process.
    Handle(Arc<RemoteFile>),
    /// A metadata record restored from the persistent index; the filesystem
    /// reconstitutes a handle around it.
    Record(FileInfo),
}

/// Shared metadata cache, owned by a filesystem.
pub(crate) struct FileCache {
    mem: Mutex<HashMap<String, Arc<RemoteFile>>>,
    disk: Option<Mutex<DiskIndex>>,
}

impl FileCache {
    /// Process-lifetime cache with no on-disk mirror.
    pub(crate) fn transient() -> Arc<Self> {
        Arc::new(Self {
            mem: Mutex::new(HashMap::new()),
            disk: None,
        })
    }

    /// Cache mirrored into an ordered index file at `path`.
    pub(crate) fn persistent(path: PathBuf, flush_every: usize) -> Arc<Self> {
        Arc::new(Self {
            mem: Mutex::new(HashMap::new()),
            disk: Some(Mutex::new(DiskIndex::load(path, flush_every))),
        })
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<CacheHit> {
        if let Some(file) = lock(&self.mem).get(path) {
            tracing::trace!(path, "metadata cache hit");
            return Some(CacheHit::Handle(file.clone()));
        }
        if let Some(disk) = &self.disk {
            if let Some(record) = lock(disk).entries.get(path) {
                tracing::trace!(path, "persistent cache hit");
                return Some(CacheHit::Record(record.to_info()));
            }
        }
        None
    }

    /// Insert a resolved read-only handle. A no-op for unresolved handles
    /// and for paths already present (first insert wins).
    pub(crate) fn insert(&self, file: &Arc<RemoteFile>) {
        if !file.flags().cacheable() {
            return;
        }
        let Some(info) = file.peek_info() else {
            return;
        };
        let mut keys = vec![info.path.clone()];
        if info.canonical_path != info.path {
            keys.push(info.canonical_path.clone());
        }
        {
            let mut mem = lock(&self.mem);
            for key in &keys {
                if !mem.contains_key(key) {
                    tracing::trace!(path = %key, "metadata cache store");
                    mem.insert(key.clone(), file.clone());
                }
            }
        }
        if let Some(disk) = &self.disk {
            let mut disk = lock(disk);
            let record = MetaRecord::from_info(info.as_ref());
            for key in keys {
                disk.insert(key, record.clone());
            }
        }
    }

    /// Force pending persistent-index writes out to disk.
    pub(crate) fn flush(&self) {
        if let Some(disk) = &self.disk {
            lock(disk).flush();
        }
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Ordered on-disk index of serialized metadata records.
struct DiskIndex {
    path: PathBuf,
    entries: BTreeMap<String, MetaRecord>,
    dirty: usize,
    flush_every: usize,
}

impl DiskIndex {
    fn load(path: PathBuf, flush_every: usize) -> Self {
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match postcard::from_bytes::<BTreeMap<String, MetaRecord>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(
                        index = %path.display(),
                        error = %e,
                        "corrupt cache index, rebuilding"
                    );
                    let _ = std::fs::remove_file(&path);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries,
            dirty: 0,
            flush_every: flush_every.max(1),
        }
    }

    fn insert(&mut self, key: String, record: MetaRecord) {
        if self.entries.contains_key(&key) {
            return;
        }
        self.entries.insert(key, record);
        self.dirty += 1;
        if self.dirty >= self.flush_every {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.dirty == 0 {
            return;
        }
        match postcard::to_allocvec(&self.entries) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    tracing::warn!(
                        index = %self.path.display(),
                        error = %e,
                        "cache index flush failed"
                    );
                } else {
                    self.dirty = 0;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache index serialization failed");
            }
        }
    }
}

/// On-disk form of a metadata snapshot: type tag, optional timestamps as
/// sentinel-or-epoch-millis, length and the OS extension fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaRecord {
    file_type: u8,
    path: String,
    canonical_path: String,
    link_target: Option<String>,
    length: u64,
    access_time: i64,
    create_time: i64,
    modify_time: i64,
    ext: ExtRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum ExtRecord {
    None,
    Posix {
        permissions: String,
        uid: i64,
        gid: i64,
        selinux: Option<String>,
    },
    Windows {
        attributes: u32,
        owner: Option<String>,
        file_version: Option<String>,
        product_version: Option<String>,
    },
}

impl MetaRecord {
    fn from_info(info: &FileInfo) -> Self {
        let stamp = |t: &Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.timestamp_millis()).unwrap_or(NO_TIME)
        };
        Self {
            file_type: match info.file_type {
                FileType::File => 0,
                FileType::Directory => 1,
                FileType::Link => 2,
            },
            path: info.path.clone(),
            canonical_path: info.canonical_path.clone(),
            link_target: info.link_target.clone(),
            length: info.length,
            access_time: stamp(&info.access_time),
            create_time: stamp(&info.create_time),
            modify_time: stamp(&info.modify_time),
            ext: match &info.ext {
                FileExt::None => ExtRecord::None,
                FileExt::Posix(p) => ExtRecord::Posix {
                    permissions: p.permissions.clone(),
                    uid: p.uid,
                    gid: p.gid,
                    selinux: p.selinux.clone(),
                },
                FileExt::Windows(w) => ExtRecord::Windows {
                    attributes: w.attributes,
                    owner: w.owner.clone(),
                    file_version: w.file_version.clone(),
                    product_version: w.product_version.clone(),
                },
            },
        }
    }

    fn to_info(&self) -> FileInfo {
        let unstamp = |millis: i64| {
            if millis == NO_TIME {
                None
            } else {
                DateTime::from_timestamp_millis(millis)
            }
        };
        FileInfo {
            file_type: match self.file_type {
                1 => FileType::Directory,
                2 => FileType::Link,
                _ => FileType::File,
            },
            path: self.path.clone(),
            canonical_path: self.canonical_path.clone(),
            link_target: self.link_target.clone(),
            length: self.length,
            access_time: unstamp(self.access_time),
            create_time: unstamp(self.create_time),
            modify_time: unstamp(self.modify_time),
            ext: match &self.ext {
                ExtRecord::None => FileExt::None,
                ExtRecord::Posix {
                    permissions,
                    uid,
                    gid,
                    selinux,
                } => FileExt::Posix(PosixExt {
                    permissions: permissions.clone(),
                    uid: *uid,
                    gid: *gid,
                    selinux: selinux.clone(),
                }),
                ExtRecord::Windows {
                    attributes,
                    owner,
                    file_version,
                    product_version,
                } => FileExt::Windows(WindowsExt {
                    attributes: *attributes,
                    owner: owner.clone(),
                    file_version: file_version.clone(),
                    product_version: product_version.clone(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info(path: &str) -> FileInfo {
        FileInfo {
            file_type: FileType::File,
            path: path.to_string(),
            canonical_path: path.to_string(),
            link_target: None,
            length: 42,
            access_time: None,
            create_time: None,
            modify_time: DateTime::from_timestamp_millis(1_700_000_000_000),
            ext: FileExt::Posix(PosixExt {
                permissions: "rw-r--r--".into(),
                uid: 0,
                gid: 0,
                selinux: None,
            }),
        }
    }

    #[test]
    fn record_round_trip_preserves_fields() {
        let info = sample_info("/etc/hosts");
        let record = MetaRecord::from_info(&info);
        let back = record.to_info();
        assert_eq!(back, info);
    }

    #[test]
    fn absent_timestamps_use_sentinel() {
        let info = sample_info("/a");
        let record = MetaRecord::from_info(&info);
        assert_eq!(record.access_time, NO_TIME);
        assert!(record.modify_time > 0);
    }

    #[test]
    fn corrupt_index_is_deleted_and_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fscache.idx");
        std::fs::write(&path, b"definitely not postcard").unwrap();
        let index = DiskIndex::load(path.clone(), 4);
        assert!(index.entries.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn flush_batches_by_insert_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fscache.idx");
        let mut index = DiskIndex::load(path.clone(), 2);
        index.insert("/a".into(), MetaRecord::from_info(&sample_info("/a")));
        assert!(!path.exists(), "first insert stays batched");
        index.insert("/b".into(), MetaRecord::from_info(&sample_info("/b")));
        assert!(path.exists(), "second insert reaches the batch bound");
    }

    #[test]
    fn persisted_index_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fscache.idx");
        {
            let mut index = DiskIndex::load(path.clone(), 1);
            index.insert("/etc/hosts".into(), MetaRecord::from_info(&sample_info("/etc/hosts")));
        }
        let index = DiskIndex::load(path, 1);
        let record = index.entries.get("/etc/hosts").unwrap();
        assert_eq!(record.length, 42);
    }

    #[test]
    fn reinsertion_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fscache.idx");
        let mut index = DiskIndex::load(path, 1);
        let mut first = MetaRecord::from_info(&sample_info("/x"));
        first.length = 1;
        let mut second = MetaRecord::from_info(&sample_info("/x"));
        second.length = 2;
        index.insert("/x".into(), first);
        index.insert("/x".into(), second);
        assert_eq!(index.entries.get("/x").unwrap().length, 1);
    }
}
