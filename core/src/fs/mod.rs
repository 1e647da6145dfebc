//! Host-independent file model.
//!
//! A [`RemoteFile`] is one path on one filesystem. Its metadata is an
//! immutable [`FileInfo`] snapshot, produced at most once per handle by the
//! per-OS [`Accessor`] strategy the handle owns. Read-only handles register
//! themselves with their filesystem's cache the moment metadata resolves;
//! every other access mode bypasses the cache entirely.
//!
//! Mutating operations (write, delete, mkdir) are permitted only on
//! read-write handles. Attempting them on anything else is an immediate
//! local error, never sent to the host.

pub mod cache;
pub mod guess;
pub mod local;

use std::fmt;
use std::io::Read;
use std::sync::{Arc, RwLock, Weak};

use chrono::{DateTime, Utc};

use crate::errors::{FileError, SearchError};
use crate::search::Searchable;
use crate::session::Session;

use cache::FileCache;

/// Access mode of a file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flags {
    /// Immutable once resolved; the only cacheable mode.
    ReadOnly,
    /// Permits write, delete and mkdir. Never cached.
    ReadWrite,
    /// For files expected to grow while being read (logs, spools). Never
    /// cached.
    Volatile,
    /// Read-only semantics without cache participation.
    NoCache,
}

impl Flags {
    pub(crate) fn cacheable(self) -> bool {
        matches!(self, Flags::ReadOnly)
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Flags::ReadOnly => "read-only",
            Flags::ReadWrite => "read-write",
            Flags::Volatile => "volatile",
            Flags::NoCache => "no-cache",
        };
        f.write_str(s)
    }
}

/// Basic type of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Directory,
    Link,
}

/// OS-specific extension of a metadata snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum FileExt {
    None,
    Posix(PosixExt),
    Windows(WindowsExt),
}

/// POSIX permission and ownership data.
#[derive(Debug, Clone, PartialEq)]
pub struct PosixExt {
    /// Permission string as printed by the host, e.g. `rwxr-x---`.
    pub permissions: String,
    /// Numeric owner id; `-1` when the host reported a non-numeric value.
    pub uid: i64,
    /// Numeric group id; `-1` when the host reported a non-numeric value.
    pub gid: i64,
    /// SELinux security context, when the host reports one.
    pub selinux: Option<String>,
}

/// Windows attribute and version data.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowsExt {
    pub attributes: u32,
    pub owner: Option<String>,
    pub file_version: Option<String>,
    pub product_version: Option<String>,
}

/// Immutable metadata snapshot for one path.
///
/// Timestamps are `None` when the host cannot report them. Produced once
/// per handle and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub file_type: FileType,
    pub path: String,
    pub canonical_path: String,
    pub link_target: Option<String>,
    pub length: u64,
    pub access_time: Option<DateTime<Utc>>,
    pub create_time: Option<DateTime<Utc>>,
    pub modify_time: Option<DateTime<Utc>>,
    pub ext: FileExt,
}

/// Per-OS strategy that fetches raw metadata and byte streams for one
/// handle. Owned exclusively by its [`RemoteFile`].
pub trait Accessor: Send + Sync {
    /// Fetch the metadata snapshot. [`FileError::NotFound`] when the path
    /// does not exist.
    fn fetch(&self) -> Result<FileInfo, FileError>;

    /// Open the file's content for reading.
    fn open(&self) -> Result<Box<dyn Read + Send>, FileError>;

    /// Replace (or append to) the file's content.
    fn write(&self, data: &[u8], append: bool) -> Result<(), FileError>;

    /// Child names of a directory.
    fn list(&self) -> Result<Vec<String>, FileError>;

    fn delete(&self) -> Result<(), FileError>;

    fn mkdir(&self) -> Result<(), FileError>;
}

/// A handle to one path on one filesystem.
pub struct RemoteFile {
    me: Weak<RemoteFile>,
    path: String,
    delim: &'static str,
    flags: Flags,
    accessor: Box<dyn Accessor>,
    info: RwLock<Option<Arc<FileInfo>>>,
    cache: Weak<FileCache>,
}

impl RemoteFile {
    /// Create a handle whose metadata will be resolved lazily through the
    /// accessor.
    pub(crate) fn new(
        path: String,
        delim: &'static str,
        flags: Flags,
        accessor: Box<dyn Accessor>,
        cache: Weak<FileCache>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            path,
            delim,
            flags,
            accessor,
            info: RwLock::new(None),
            cache,
        })
    }

    /// Create a handle from already-known metadata (search results, batch
    /// stats, cache reconstitution). Read-only handles self-register.
    pub(crate) fn from_info(
        info: FileInfo,
        delim: &'static str,
        flags: Flags,
        accessor: Box<dyn Accessor>,
        cache: Weak<FileCache>,
    ) -> Arc<Self> {
        let file = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            path: info.path.clone(),
            delim,
            flags,
            accessor,
            info: RwLock::new(Some(Arc::new(info))),
            cache,
        });
        file.register();
        file
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Final path component (the path itself for a bare root).
    pub fn name(&self) -> &str {
        name_of(&self.path, self.delim)
    }

    /// Parent directory portion of the path.
    pub fn parent(&self) -> &str {
        parent_of(&self.path, self.delim)
    }

    /// Metadata already resolved on this handle, if any. Never triggers a
    /// host round trip.
    pub fn peek_info(&self) -> Option<Arc<FileInfo>> {
        self.info
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The metadata snapshot, fetching it on first access. The first
    /// resolution wins; concurrent resolvers observe the same snapshot.
    pub fn info(&self) -> Result<Arc<FileInfo>, FileError> {
        if let Some(info) = self.peek_info() {
            return Ok(info);
        }
        let fetched = self.accessor.fetch()?;
        let info = {
            let mut slot = self
                .info
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match slot.as_ref() {
                // A concurrent resolver won; its snapshot stands.
                Some(existing) => existing.clone(),
                None => {
                    let arc = Arc::new(fetched);
                    *slot = Some(arc.clone());
                    arc
                }
            }
        };
        self.register();
        Ok(info)
    }

    fn register(&self) {
        if !self.flags.cacheable() {
            return;
        }
        if let (Some(me), Some(cache)) = (self.me.upgrade(), self.cache.upgrade()) {
            cache.insert(&me);
        }
    }

    pub fn exists(&self) -> bool {
        self.info().is_ok()
    }

    pub fn file_type(&self) -> Result<FileType, FileError> {
        Ok(self.info()?.file_type)
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.file_type(), Ok(FileType::Directory))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.file_type(), Ok(FileType::File))
    }

    pub fn is_link(&self) -> bool {
        matches!(self.file_type(), Ok(FileType::Link))
    }

    pub fn length(&self) -> Result<u64, FileError> {
        Ok(self.info()?.length)
    }

    pub fn modify_time(&self) -> Result<Option<DateTime<Utc>>, FileError> {
        Ok(self.info()?.modify_time)
    }

    pub fn access_time(&self) -> Result<Option<DateTime<Utc>>, FileError> {
        Ok(self.info()?.access_time)
    }

    pub fn create_time(&self) -> Result<Option<DateTime<Utc>>, FileError> {
        Ok(self.info()?.create_time)
    }

    /// Canonical path with `.`/`..`/links resolved; computed once with the
    /// rest of the metadata.
    pub fn canonical_path(&self) -> Result<String, FileError> {
        Ok(self.info()?.canonical_path.clone())
    }

    pub fn link_target(&self) -> Result<Option<String>, FileError> {
        Ok(self.info()?.link_target.clone())
    }

    pub fn extended(&self) -> Result<FileExt, FileError> {
        Ok(self.info()?.ext.clone())
    }

    /// Child names, for directories.
    pub fn child_names(&self) -> Result<Vec<String>, FileError> {
        if !self.is_directory() {
            return Err(FileError::Unsupported("list of a non-directory"));
        }
        self.accessor.list()
    }

    /// Open content for reading. Allowed in every access mode.
    pub fn open(&self) -> Result<Box<dyn Read + Send>, FileError> {
        self.accessor.open()
    }

    pub fn write(&self, data: &[u8], append: bool) -> Result<(), FileError> {
        self.require_write("write")?;
        self.accessor.write(data, append)
    }

    pub fn delete(&self) -> Result<(), FileError> {
        self.require_write("delete")?;
        self.accessor.delete()
    }

    pub fn mkdir(&self) -> Result<(), FileError> {
        self.require_write("mkdir")?;
        self.accessor.mkdir()
    }

    fn require_write(&self, operation: &'static str) -> Result<(), FileError> {
        if self.flags == Flags::ReadWrite {
            Ok(())
        } else {
            Err(FileError::AccessDenied {
                path: self.path.clone(),
                operation,
                flags: self.flags.to_string(),
            })
        }
    }
}

impl fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFile")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("resolved", &self.peek_info().is_some())
            .finish()
    }
}

/// A mounted filesystem on the target host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub path: String,
    pub fs_type: String,
}

/// One filesystem on one host.
pub trait Filesystem: Send + Sync {
    /// Host-native path delimiter.
    fn delimiter(&self) -> &'static str;

    /// Look up one path. Read-only requests probe the cache first; all
    /// other modes go straight to the host.
    fn get_file(&self, path: &str, flags: Flags) -> Result<Arc<RemoteFile>, FileError>;

    /// Look up many paths with one compound host query. The result is
    /// positionally aligned with `paths`; entries for paths that do not
    /// exist are `None`.
    fn get_files(&self, paths: &[&str], flags: Flags)
        -> Result<Vec<Option<Arc<RemoteFile>>>, FileError>;

    /// The search facility for this filesystem.
    fn searcher(&self) -> Result<Arc<dyn Searchable>, SearchError>;

    /// Mounted filesystems on the host.
    fn mounts(&self) -> Result<Vec<Mount>, FileError>;

    /// List a directory as handles, inheriting the directory's flags.
    fn list(&self, dir: &RemoteFile) -> Result<Vec<Arc<RemoteFile>>, FileError> {
        let names = dir.child_names()?;
        let delim = self.delimiter();
        let base = if dir.path().ends_with(delim) {
            dir.path().to_string()
        } else {
            format!("{}{}", dir.path(), delim)
        };
        names
            .iter()
            .map(|name| self.get_file(&format!("{base}{name}"), dir.flags()))
            .collect()
    }
}

/// Final path component of `path` under the given delimiter.
pub(crate) fn name_of<'p>(path: &'p str, delim: &str) -> &'p str {
    if path == delim {
        return path;
    }
    let trimmed = path.strip_suffix(delim).unwrap_or(path);
    match trimmed.rfind(delim) {
        Some(idx) => &trimmed[idx + delim.len()..],
        None => trimmed,
    }
}

/// Parent portion of `path` under the given delimiter.
pub(crate) fn parent_of<'p>(path: &'p str, delim: &'p str) -> &'p str {
    if path == delim {
        return path;
    }
    let trimmed = path.strip_suffix(delim).unwrap_or(path);
    match trimmed.rfind(delim) {
        Some(0) => delim,
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    }
}

/// Expand environment references in a path using the *remote* environment:
/// `$VAR`/`${VAR}` on Unix flavors, `%VAR%` on Windows.
pub(crate) fn expand_path(session: &dyn Session, path: &str) -> String {
    if session.os_flavor().is_windows() {
        let mut out = String::with_capacity(path.len());
        let mut rest = path;
        while let Some(start) = rest.find('%') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('%') {
                Some(end) => {
                    let name = &after[..end];
                    match session.getenv(name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push('%');
                            out.push_str(name);
                            out.push('%');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push('%');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    } else {
        shellexpand::env_with_context_no_errors(path, |var| session.getenv(var)).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_display_matches_wire_names() {
        assert_eq!(Flags::ReadOnly.to_string(), "read-only");
        assert_eq!(Flags::NoCache.to_string(), "no-cache");
        assert!(Flags::ReadOnly.cacheable());
        assert!(!Flags::Volatile.cacheable());
    }

    #[test]
    fn name_and_parent_extraction() {
        assert_eq!(name_of("/var/log/messages", "/"), "messages");
        assert_eq!(parent_of("/var/log/messages", "/"), "/var/log");
        assert_eq!(name_of("/", "/"), "/");
        assert_eq!(parent_of("/top", "/"), "/");
        assert_eq!(name_of("C:\\Windows\\System32", "\\"), "System32");
        assert_eq!(parent_of("C:\\Windows\\System32", "\\"), "C:\\Windows");
    }

    #[test]
    fn expand_path_unix_uses_remote_env() {
        use crate::config::Properties;
        use crate::errors::SessionError;
        use crate::session::{OsFlavor, SessionProcess};
        use std::collections::HashMap;
        use std::path::Path;

        struct EnvSession(Properties);
        impl Session for EnvSession {
            fn os_flavor(&self) -> OsFlavor {
                OsFlavor::Linux
            }
            fn hostname(&self) -> &str {
                "test"
            }
            fn properties(&self) -> &Properties {
                &self.0
            }
            fn getenv(&self, name: &str) -> Option<String> {
                (name == "HOME").then(|| "/home/scan".to_string())
            }
            fn workspace(&self) -> Option<&Path> {
                None
            }
            fn is_connected(&self) -> bool {
                true
            }
            fn connect(&self) -> Result<(), SessionError> {
                Ok(())
            }
            fn disconnect(&self) {}
            fn start_process(
                &self,
                _cmd: &str,
                _env: Option<&HashMap<String, String>>,
                _dir: Option<&str>,
            ) -> Result<Box<dyn SessionProcess>, SessionError> {
                Err(SessionError::NotConnected)
            }
        }

        let session = EnvSession(Properties::new());
        assert_eq!(expand_path(&session, "$HOME/.profile"), "/home/scan/.profile");
        assert_eq!(expand_path(&session, "/etc/hosts"), "/etc/hosts");
    }
}
