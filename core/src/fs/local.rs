//! Local filesystem access through `std::fs`.
//!
//! The degenerate case of the file model: no command channel, no parsing.
//! It shares the cache, flag gating and guesser logic with the remote
//! filesystems, which makes it the reference implementation for tests and
//! the accessor of choice when the session host *is* the local machine and
//! native calls are cheaper than shell round trips.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::errors::{FileError, SearchError};
use crate::search::{
    unsupported, Condition, Field, Op, SearchResult, Searchable, DEPTH_UNLIMITED, FILETYPE_DIR,
    FILETYPE_FILE, FILETYPE_LINK,
};
use crate::session::Session;

use super::cache::{CacheHit, FileCache};
use super::{expand_path, guess, Accessor, FileExt, FileInfo, FileType, Filesystem, Flags, Mount,
    RemoteFile};

#[cfg(windows)]
const DELIM: &str = "\\";
#[cfg(not(windows))]
const DELIM: &str = "/";

/// Filesystem of the local host.
pub struct LocalFilesystem {
    me: Weak<LocalFilesystem>,
    session: Arc<dyn Session>,
    cache: Arc<FileCache>,
}

impl LocalFilesystem {
    pub fn new(session: Arc<dyn Session>) -> Arc<Self> {
        let cache = super::cache::for_session(&*session, "fscache-local.idx");
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session,
            cache,
        })
    }

    fn normalize(&self, path: &str) -> String {
        let mut path = expand_path(&*self.session, path);
        while path.len() > DELIM.len() && path.ends_with(DELIM) {
            path.truncate(path.len() - DELIM.len());
        }
        path
    }

    fn file_from_info(&self, info: FileInfo, flags: Flags) -> Arc<RemoteFile> {
        let accessor = LocalAccessor::new(PathBuf::from(&info.path));
        RemoteFile::from_info(
            info,
            DELIM,
            flags,
            Box::new(accessor),
            Arc::downgrade(&self.cache),
        )
    }
}

impl Filesystem for LocalFilesystem {
    fn delimiter(&self) -> &'static str {
        DELIM
    }

    fn get_file(&self, path: &str, flags: Flags) -> Result<Arc<RemoteFile>, FileError> {
        let path = self.normalize(path);
        if flags.cacheable() {
            match self.cache.lookup(&path) {
                Some(CacheHit::Handle(file)) => return Ok(file),
                Some(CacheHit::Record(info)) => return Ok(self.file_from_info(info, flags)),
                None => {}
            }
        }
        let accessor = LocalAccessor::new(PathBuf::from(&path));
        Ok(RemoteFile::new(
            path,
            DELIM,
            flags,
            Box::new(accessor),
            Arc::downgrade(&self.cache),
        ))
    }

    fn get_files(
        &self,
        paths: &[&str],
        flags: Flags,
    ) -> Result<Vec<Option<Arc<RemoteFile>>>, FileError> {
        paths
            .iter()
            .map(|path| {
                let file = self.get_file(path, flags)?;
                Ok(if file.exists() { Some(file) } else { None })
            })
            .collect()
    }

    fn searcher(&self) -> Result<Arc<dyn Searchable>, SearchError> {
        let fs = self
            .me
            .upgrade()
            .ok_or_else(|| SearchError::Unsupported("filesystem dropped".to_string()))?;
        Ok(Arc::new(LocalSearcher { fs }))
    }

    fn mounts(&self) -> Result<Vec<Mount>, FileError> {
        Ok(vec![Mount {
            path: DELIM.to_string(),
            fs_type: "local".to_string(),
        }])
    }
}

/// Accessor backed by `std::fs`.
pub(crate) struct LocalAccessor {
    path: PathBuf,
}

impl LocalAccessor {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn map_err(&self, e: std::io::Error) -> FileError {
        if e.kind() == std::io::ErrorKind::NotFound {
            FileError::NotFound(self.path.display().to_string())
        } else {
            FileError::Io(e)
        }
    }
}

fn system_time(t: std::io::Result<std::time::SystemTime>) -> Option<DateTime<Utc>> {
    t.ok().map(DateTime::<Utc>::from)
}

#[cfg(unix)]
fn posix_ext(meta: &std::fs::Metadata) -> FileExt {
    use std::os::unix::fs::MetadataExt;
    FileExt::Posix(super::PosixExt {
        permissions: format_mode(meta.mode()),
        uid: meta.uid() as i64,
        gid: meta.gid() as i64,
        selinux: None,
    })
}

#[cfg(not(unix))]
fn posix_ext(_meta: &std::fs::Metadata) -> FileExt {
    FileExt::None
}

/// Render the low nine mode bits as `rwxrwxrwx`.
#[cfg(unix)]
fn format_mode(mode: u32) -> String {
    let mut out = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

impl Accessor for LocalAccessor {
    fn fetch(&self) -> Result<FileInfo, FileError> {
        let meta = std::fs::symlink_metadata(&self.path).map_err(|e| self.map_err(e))?;
        let file_type = if meta.file_type().is_symlink() {
            FileType::Link
        } else if meta.is_dir() {
            FileType::Directory
        } else {
            FileType::File
        };
        let link_target = if file_type == FileType::Link {
            std::fs::read_link(&self.path)
                .ok()
                .map(|t| t.display().to_string())
        } else {
            None
        };
        let canonical_path = std::fs::canonicalize(&self.path)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| self.path.display().to_string());
        Ok(FileInfo {
            file_type,
            path: self.path.display().to_string(),
            canonical_path,
            link_target,
            length: meta.len(),
            access_time: system_time(meta.accessed()),
            create_time: system_time(meta.created()),
            modify_time: system_time(meta.modified()),
            ext: posix_ext(&meta),
        })
    }

    fn open(&self) -> Result<Box<dyn Read + Send>, FileError> {
        let file = std::fs::File::open(&self.path).map_err(|e| self.map_err(e))?;
        Ok(Box::new(file))
    }

    fn write(&self, data: &[u8], append: bool) -> Result<(), FileError> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(append)
            .write(true)
            .truncate(!append)
            .open(&self.path)
            .map_err(|e| self.map_err(e))?;
        file.write_all(data).map_err(|e| self.map_err(e))
    }

    fn list(&self) -> Result<Vec<String>, FileError> {
        let entries = std::fs::read_dir(&self.path).map_err(|e| self.map_err(e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.map_err(e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn delete(&self) -> Result<(), FileError> {
        let meta = std::fs::symlink_metadata(&self.path).map_err(|e| self.map_err(e))?;
        if meta.is_dir() {
            std::fs::remove_dir_all(&self.path).map_err(|e| self.map_err(e))
        } else {
            std::fs::remove_file(&self.path).map_err(|e| self.map_err(e))
        }
    }

    fn mkdir(&self) -> Result<(), FileError> {
        std::fs::create_dir(&self.path).map_err(|e| self.map_err(e))
    }
}

/// Compiled form of a condition list for the local walker.
struct WalkParams {
    from: String,
    depth: i64,
    dir_only: bool,
    file_only: bool,
    link_only: bool,
    follow_links: bool,
    basename_eq: Option<String>,
    basename_ne: Option<String>,
    basename_re: Option<Regex>,
    basename_any: Option<Vec<String>>,
    basename_none: Option<Vec<String>>,
    path_re: Option<Regex>,
    dirname_re: Option<Regex>,
}

impl WalkParams {
    fn compile(conditions: &[Condition]) -> Result<Self, SearchError> {
        let mut params = WalkParams {
            from: DELIM.to_string(),
            depth: DEPTH_UNLIMITED,
            dir_only: false,
            file_only: false,
            link_only: false,
            follow_links: false,
            basename_eq: None,
            basename_ne: None,
            basename_re: None,
            basename_any: None,
            basename_none: None,
            path_re: None,
            dirname_re: None,
        };
        for condition in conditions {
            match (condition.field(), condition.op()) {
                (Field::From, Op::Equals) => {
                    params.from = condition
                        .as_str_value()
                        .ok_or_else(|| unsupported(condition))?
                        .to_string();
                }
                (Field::Depth, Op::Equals) => {
                    params.depth = condition.as_int().ok_or_else(|| unsupported(condition))?;
                }
                (Field::FileType, Op::Equals) => {
                    match condition.as_str_value() {
                        Some(FILETYPE_DIR) => params.dir_only = true,
                        Some(FILETYPE_FILE) => params.file_only = true,
                        Some(FILETYPE_LINK) => params.link_only = true,
                        _ => return Err(unsupported(condition)),
                    };
                }
                (Field::FollowLinks, Op::Equals) => params.follow_links = true,
                (Field::Basename, Op::Equals) => {
                    params.basename_eq = Some(
                        condition
                            .as_str_value()
                            .ok_or_else(|| unsupported(condition))?
                            .to_string(),
                    );
                }
                (Field::Basename, Op::NotEquals) => {
                    params.basename_ne = Some(
                        condition
                            .as_str_value()
                            .ok_or_else(|| unsupported(condition))?
                            .to_string(),
                    );
                }
                (Field::Basename, Op::Match) => {
                    params.basename_re = Some(
                        condition
                            .as_regex()
                            .ok_or_else(|| unsupported(condition))?
                            .clone(),
                    );
                }
                (Field::Basename, Op::AnyOf) => {
                    params.basename_any = Some(
                        condition
                            .as_list()
                            .ok_or_else(|| unsupported(condition))?
                            .to_vec(),
                    );
                }
                (Field::Basename, Op::NoneOf) => {
                    params.basename_none = Some(
                        condition
                            .as_list()
                            .ok_or_else(|| unsupported(condition))?
                            .to_vec(),
                    );
                }
                (Field::Path, Op::Match) => {
                    params.path_re = Some(
                        condition
                            .as_regex()
                            .ok_or_else(|| unsupported(condition))?
                            .clone(),
                    );
                }
                (Field::Dirname, Op::Match) => {
                    params.dirname_re = Some(
                        condition
                            .as_regex()
                            .ok_or_else(|| unsupported(condition))?
                            .clone(),
                    );
                }
                // The local walker has no mount table or ownership filters.
                _ => return Err(unsupported(condition)),
            }
        }
        Ok(params)
    }

    fn matches(&self, path: &str, name: &str, file_type: FileType) -> bool {
        if self.dir_only && file_type != FileType::Directory {
            return false;
        }
        if self.file_only && file_type != FileType::File {
            return false;
        }
        if self.link_only && file_type != FileType::Link {
            return false;
        }
        if let Some(eq) = &self.basename_eq {
            if name != eq {
                return false;
            }
        }
        if let Some(ne) = &self.basename_ne {
            if name == ne {
                return false;
            }
        }
        if let Some(re) = &self.basename_re {
            if !re.is_match(name) {
                return false;
            }
        }
        if let Some(any) = &self.basename_any {
            if !any.iter().any(|n| n == name) {
                return false;
            }
        }
        if let Some(none) = &self.basename_none {
            if none.iter().any(|n| n == name) {
                return false;
            }
        }
        if let Some(re) = &self.path_re {
            if !re.is_match(path) {
                return false;
            }
        }
        if let Some(re) = &self.dirname_re {
            if !re.is_match(super::parent_of(path, DELIM)) {
                return false;
            }
        }
        true
    }
}

/// Recursive walker over the local filesystem.
struct LocalSearcher {
    fs: Arc<LocalFilesystem>,
}

impl LocalSearcher {
    fn walk(
        &self,
        dir: &Path,
        depth_left: i64,
        params: &WalkParams,
        result: &mut SearchResult,
    ) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                result.diagnostics.push(format!("{}: {e}", dir.display()));
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    result.diagnostics.push(format!("{}: {e}", dir.display()));
                    continue;
                }
            };
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    result.diagnostics.push(format!("{}: {e}", path.display()));
                    continue;
                }
            };
            let file_type = if meta.file_type().is_symlink() {
                FileType::Link
            } else if meta.is_dir() {
                FileType::Directory
            } else {
                FileType::File
            };
            let path_str = path.display().to_string();
            if params.matches(&path_str, &name, file_type) {
                match self.fs.get_file(&path_str, Flags::ReadOnly) {
                    Ok(file) => result.files.push(file),
                    Err(e) => result.diagnostics.push(format!("{path_str}: {e}")),
                }
            }
            let descend = meta.is_dir()
                || (params.follow_links && file_type == FileType::Link && path.is_dir());
            if descend {
                // depth_left counts levels this walk may still visit; the
                // children of this entry sit one level deeper.
                if depth_left == DEPTH_UNLIMITED {
                    self.walk(&path, DEPTH_UNLIMITED, params, result);
                } else if depth_left > 1 {
                    self.walk(&path, depth_left - 1, params, result);
                }
            }
        }
    }
}

impl Searchable for LocalSearcher {
    fn search(&self, conditions: &[Condition]) -> Result<SearchResult, SearchError> {
        let params = WalkParams::compile(conditions)?;
        let mut result = SearchResult::default();
        let from = Path::new(&params.from);
        if !from.is_dir() {
            return Ok(result);
        }
        // Depth 1 means direct children only, matching the remote grammar.
        let depth_left = if params.depth == DEPTH_UNLIMITED {
            DEPTH_UNLIMITED
        } else {
            params.depth
        };
        if depth_left != 0 {
            self.walk(from, depth_left, &params, &mut result);
        }
        Ok(result)
    }

    fn guess_parent(
        &self,
        pattern: &Regex,
        directory: bool,
    ) -> Result<Option<Vec<String>>, SearchError> {
        let flavor = self.fs.session.os_flavor();
        guess::guess_parent(&*self.fs, flavor, pattern, directory).map_err(SearchError::File)
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use crate::search::Value;
    use crate::session::local::LocalSession;

    fn filesystem() -> Arc<LocalFilesystem> {
        LocalFilesystem::new(Arc::new(LocalSession::new()))
    }

    #[test]
    fn fetch_reports_type_size_and_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"12345").unwrap();

        let fs = filesystem();
        let file = fs
            .get_file(path.to_str().unwrap(), Flags::ReadOnly)
            .unwrap();
        assert!(file.is_file());
        assert_eq!(file.length().unwrap(), 5);
        match file.extended().unwrap() {
            FileExt::Posix(ext) => assert_eq!(ext.permissions.len(), 9),
            other => panic!("expected posix ext, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_reports_not_found_on_resolution() {
        let fs = filesystem();
        let file = fs.get_file("/no/such/path/here", Flags::ReadOnly).unwrap();
        assert!(!file.exists());
        match file.info() {
            Err(FileError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn write_requires_read_write_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"orig").unwrap();

        let fs = filesystem();
        let read_only = fs
            .get_file(path.to_str().unwrap(), Flags::ReadOnly)
            .unwrap();
        match read_only.write(b"nope", false) {
            Err(FileError::AccessDenied { operation, .. }) => assert_eq!(operation, "write"),
            other => panic!("expected AccessDenied, got {other:?}"),
        }

        let writable = fs
            .get_file(path.to_str().unwrap(), Flags::ReadWrite)
            .unwrap();
        writable.write(b"new", false).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn delete_and_mkdir_gated_the_same_way() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");

        let fs = filesystem();
        let no_cache = fs.get_file(sub.to_str().unwrap(), Flags::NoCache).unwrap();
        assert!(matches!(
            no_cache.mkdir(),
            Err(FileError::AccessDenied { .. })
        ));

        let writable = fs.get_file(sub.to_str().unwrap(), Flags::ReadWrite).unwrap();
        writable.mkdir().unwrap();
        assert!(sub.is_dir());
        writable.delete().unwrap();
        assert!(!sub.exists());
    }

    #[test]
    fn listing_composes_child_handles_with_inherited_flags() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();

        let fs = filesystem();
        let handle = fs
            .get_file(dir.path().to_str().unwrap(), Flags::NoCache)
            .unwrap();
        let children = fs.list(&handle).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.flags() == Flags::NoCache));
        let names: Vec<_> = children.iter().map(|c| c.name().to_string()).collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"b".to_string()));
    }

    #[test]
    fn symlink_reports_link_type_and_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.txt");
        std::fs::write(&target, b"t").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let fs = filesystem();
        let file = fs.get_file(link.to_str().unwrap(), Flags::ReadOnly).unwrap();
        assert!(file.is_link());
        assert_eq!(
            file.link_target().unwrap().as_deref(),
            Some(target.to_str().unwrap())
        );
    }

    #[test]
    fn search_depth_one_finds_only_shallow_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/foo.txt"), b"y").unwrap();

        let fs = filesystem();
        let searcher = fs.searcher().unwrap();
        let conditions = vec![
            Condition::new(
                Field::Basename,
                Op::Equals,
                Value::Str("foo.txt".to_string()),
            ),
            Condition::from(dir.path().to_str().unwrap()),
            Condition::depth(1),
        ];
        let result = searcher.search(&conditions).unwrap();
        let paths: Vec<_> = result.files.iter().map(|f| f.path().to_string()).collect();
        assert_eq!(paths, vec![dir.path().join("foo.txt").display().to_string()]);
    }

    #[test]
    fn search_recurse_finds_both() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("foo.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/foo.txt"), b"y").unwrap();

        let fs = filesystem();
        let searcher = fs.searcher().unwrap();
        let conditions = vec![
            Condition::new(
                Field::Basename,
                Op::Equals,
                Value::Str("foo.txt".to_string()),
            ),
            Condition::from(dir.path().to_str().unwrap()),
            Condition::recurse(),
        ];
        let result = searcher.search(&conditions).unwrap();
        assert_eq!(result.files.len(), 2);
    }

    #[test]
    fn unsupported_condition_is_rejected_not_ignored() {
        let fs = filesystem();
        let searcher = fs.searcher().unwrap();
        let conditions = vec![
            Condition::from("/tmp"),
            Condition::new(Field::FsType, Op::Equals, Value::Str("ext4".to_string())),
        ];
        match searcher.search(&conditions) {
            Err(SearchError::Unsupported(_)) => {}
            other => panic!("expected Unsupported, got {:?}", other.map(|r| r.files.len())),
        }
    }

    #[test]
    fn search_all_is_positionally_aligned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.log"), b"1").unwrap();
        std::fs::write(dir.path().join("two.log"), b"2").unwrap();

        let fs = filesystem();
        let searcher = fs.searcher().unwrap();
        let base = dir.path().to_str().unwrap();
        let batches = vec![
            vec![
                Condition::new(Field::Basename, Op::Equals, Value::Str("one.log".into())),
                Condition::from(base),
                Condition::depth(1),
            ],
            vec![
                Condition::new(Field::Basename, Op::Equals, Value::Str("two.log".into())),
                Condition::from(base),
                Condition::depth(1),
            ],
        ];
        let results = searcher.search_all(&batches);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().files[0].name(), "one.log");
        assert_eq!(results[1].as_ref().unwrap().files[0].name(), "two.log");
    }
}
