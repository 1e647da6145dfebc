//! Filesystem access to Unix hosts over a shell channel.
//!
//! Every operation is a synthesized command line: metadata comes from the
//! flavor driver's stat command, directory listings from `ls`, content from
//! `cat`, searches from the driver's compiled `find` pipeline. Output flows
//! back through the resilient executor and is parsed into [`FileInfo`]
//! records.

pub(crate) mod driver;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;

use crate::config::Timeout;
use crate::errors::{FileError, SearchError};
use crate::exec::{self, HandlerFn, RemoteCommand};
use crate::fs::cache::{self, CacheHit, FileCache};
use crate::fs::{expand_path, guess, Accessor, FileInfo, Filesystem, Flags, Mount, RemoteFile};
use crate::io::PerishableReader;
use crate::search::{Condition, SearchResult, Searchable};
use crate::session::{check_argument, OsFlavor, Session, SessionProcess};

use driver::UnixDriver;

const DELIM: &str = "/";

/// A Unix host's filesystem, reached through its shell.
pub struct UnixFilesystem {
    me: Weak<UnixFilesystem>,
    session: Arc<dyn Session>,
    driver: UnixDriver,
    cache: Arc<FileCache>,
    /// Compiled-command text -> matched paths, per process lifetime.
    search_cache: Mutex<HashMap<String, Vec<String>>>,
    mounts: Mutex<Option<Vec<Mount>>>,
}

impl UnixFilesystem {
    /// Build a filesystem for the session's detected flavor. SELinux
    /// detection (which widens the Linux record format) runs one probe
    /// command and tolerates failure.
    pub fn new(session: Arc<dyn Session>) -> Result<Arc<Self>, FileError> {
        let driver = match session.os_flavor() {
            OsFlavor::Linux => UnixDriver::Linux {
                selinux: detect_selinux(&*session),
            },
            OsFlavor::MacOs => UnixDriver::MacOs,
            OsFlavor::Solaris => UnixDriver::Solaris,
            OsFlavor::Windows => {
                return Err(FileError::Unsupported("Windows session on a Unix filesystem"))
            }
        };
        let cache = cache::for_session(&*session, "fscache-unix.idx");
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session,
            driver,
            cache,
            search_cache: Mutex::new(HashMap::new()),
            mounts: Mutex::new(None),
        }))
    }

    fn me(&self) -> Result<Arc<Self>, FileError> {
        self.me
            .upgrade()
            .ok_or(FileError::Unsupported("filesystem dropped"))
    }

    fn accessor(&self, path: &str) -> UnixAccessor {
        UnixAccessor {
            fs: self.me.clone(),
            path: path.to_string(),
        }
    }

    fn file_from_info(&self, info: FileInfo, flags: Flags) -> Arc<RemoteFile> {
        let accessor = self.accessor(&info.path);
        RemoteFile::from_info(
            info,
            DELIM,
            flags,
            Box::new(accessor),
            Arc::downgrade(&self.cache),
        )
    }

    /// Stat one path through the driver's record format.
    fn fetch_info(&self, path: &str) -> Result<FileInfo, FileError> {
        check_argument(path, self.session.os_flavor())?;
        let cmd = self.driver.stat_command(path);
        let output = RemoteCommand::new(&*self.session, cmd)
            .read_timeout(self.session.properties().timeout(Timeout::Small))
            .capture()?;
        for line in output.lines() {
            if let Some(info) = self.driver.parse_record(&line) {
                return Ok(info);
            }
        }
        match output.exit_code {
            Some(0) => Err(FileError::Parse {
                path: path.to_string(),
                detail: String::from_utf8_lossy(&output.stdout).into_owned(),
            }),
            _ => Err(FileError::NotFound(path.to_string())),
        }
    }

    fn run_checked(&self, cmd: String, operation: &str) -> Result<(), FileError> {
        let output = RemoteCommand::new(&*self.session, cmd)
            .read_timeout(self.session.properties().timeout(Timeout::Small))
            .capture()?;
        match output.exit_code {
            Some(0) | None => Ok(()),
            Some(code) => Err(FileError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "{operation} failed with exit code {code}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))),
        }
    }
}

fn detect_selinux(session: &dyn Session) -> bool {
    match exec::first_line(session, "/usr/sbin/getenforce", Timeout::Small) {
        Ok(status) => {
            status.eq_ignore_ascii_case("Enforcing") || status.eq_ignore_ascii_case("Permissive")
        }
        Err(e) => {
            tracing::debug!(error = %e, "SELinux probe failed; assuming disabled");
            false
        }
    }
}

impl Filesystem for UnixFilesystem {
    fn delimiter(&self) -> &'static str {
        DELIM
    }

    fn get_file(&self, path: &str, flags: Flags) -> Result<Arc<RemoteFile>, FileError> {
        let mut path = expand_path(&*self.session, path);
        if path.len() > DELIM.len() && path.ends_with(DELIM) {
            // Only mount paths keep a trailing delimiter.
            let is_mount = self.mounts()?.iter().any(|m| m.path == path);
            if !is_mount {
                path.truncate(path.len() - DELIM.len());
            }
        }
        if flags.cacheable() {
            match self.cache.lookup(&path) {
                Some(CacheHit::Handle(file)) => return Ok(file),
                Some(CacheHit::Record(info)) => return Ok(self.file_from_info(info, flags)),
                None => {}
            }
        }
        let accessor = self.accessor(&path);
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
        let expanded: Vec<String> = paths
            .iter()
            .map(|p| expand_path(&*self.session, p))
            .collect();
        let mut unique: Vec<&str> = Vec::new();
        for path in &expanded {
            check_argument(path, self.session.os_flavor())?;
            if !unique.contains(&path.as_str()) {
                unique.push(path);
            }
        }
        // One compound round trip stats every unique path.
        let cmd = format!(
            "printf \"{}\\n\" | xargs -I{{}} {}",
            unique.join("\\n"),
            self.driver.stat_command("{}")
        );
        let output = RemoteCommand::new(&*self.session, cmd)
            .read_timeout(self.session.properties().timeout(Timeout::Medium))
            .capture()?;
        let mut found: HashMap<String, Arc<RemoteFile>> = HashMap::new();
        for line in output.lines() {
            if let Some(info) = self.driver.parse_record(&line) {
                let file = self.file_from_info(info, flags);
                found.insert(file.path().to_string(), file);
            }
        }
        Ok(expanded
            .iter()
            .map(|path| found.get(path.as_str()).cloned())
            .collect())
    }

    fn searcher(&self) -> Result<Arc<dyn Searchable>, SearchError> {
        let fs = self.me().map_err(SearchError::File)?;
        Ok(Arc::new(UnixFileSearcher { fs }))
    }

    fn mounts(&self) -> Result<Vec<Mount>, FileError> {
        let mut cached = self
            .mounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mounts) = cached.as_ref() {
            return Ok(mounts.clone());
        }
        let lines = exec::lines(&*self.session, self.driver.mount_command(), Timeout::Small)?;
        let mounts: Vec<Mount> = lines
            .iter()
            .filter_map(|line| self.driver.parse_mount_line(line))
            .collect();
        *cached = Some(mounts.clone());
        Ok(mounts)
    }
}

/// Accessor that stats, reads and mutates one path via shell commands.
struct UnixAccessor {
    fs: Weak<UnixFilesystem>,
    path: String,
}

impl UnixAccessor {
    fn fs(&self) -> Result<Arc<UnixFilesystem>, FileError> {
        self.fs
            .upgrade()
            .ok_or(FileError::Unsupported("filesystem dropped"))
    }
}

impl Accessor for UnixAccessor {
    fn fetch(&self) -> Result<FileInfo, FileError> {
        self.fs()?.fetch_info(&self.path)
    }

    fn open(&self) -> Result<Box<dyn Read + Send>, FileError> {
        let fs = self.fs()?;
        check_argument(&self.path, fs.session.os_flavor())?;
        let mut process = fs
            .session
            .start_process(&format!("cat '{}'", self.path), None, None)?;
        let stream = process
            .take_stdout()
            .ok_or_else(|| FileError::Io(io::Error::new(io::ErrorKind::Other, "no stream")))?;
        let deadline = fs.session.properties().timeout(Timeout::Large);
        Ok(Box::new(ProcessStream {
            reader: PerishableReader::new(stream, deadline),
            process,
        }))
    }

    fn write(&self, data: &[u8], append: bool) -> Result<(), FileError> {
        let fs = self.fs()?;
        check_argument(&self.path, fs.session.os_flavor())?;
        let redirect = if append { ">>" } else { ">" };
        let cmd = format!("base64 -d {redirect} '{}'", self.path);
        let mut process = fs.session.start_process(&cmd, None, None)?;
        {
            let mut stdin = process.take_stdin().ok_or_else(|| {
                FileError::Io(io::Error::new(io::ErrorKind::Other, "no input stream"))
            })?;
            stdin.write_all(BASE64.encode(data).as_bytes())?;
            stdin.flush()?;
            // Closing stdin lets the decoder see end of input.
        }
        let code = process.wait_for(fs.session.properties().timeout(Timeout::Small))?;
        if matches!(code, Some(c) if c != 0) {
            return Err(FileError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("write failed with exit code {code:?}"),
            )));
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, FileError> {
        let fs = self.fs()?;
        check_argument(&self.path, fs.session.os_flavor())?;
        let output = RemoteCommand::new(&*fs.session, format!("ls -a1 '{}'", self.path))
            .read_timeout(fs.session.properties().timeout(Timeout::Small))
            .capture()?;
        if matches!(output.exit_code, Some(c) if c != 0) {
            return Err(FileError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("ls failed: {}", String::from_utf8_lossy(&output.stderr).trim()),
            )));
        }
        Ok(output
            .lines()
            .into_iter()
            .filter(|name| !name.is_empty() && name != "." && name != "..")
            .collect())
    }

    fn delete(&self) -> Result<(), FileError> {
        let fs = self.fs()?;
        check_argument(&self.path, fs.session.os_flavor())?;
        fs.run_checked(format!("rm -r '{}'", self.path), "rm")
    }

    fn mkdir(&self) -> Result<(), FileError> {
        let fs = self.fs()?;
        check_argument(&self.path, fs.session.os_flavor())?;
        fs.run_checked(format!("mkdir '{}'", self.path), "mkdir")
    }
}

/// Keeps the backing process alive for as long as its stream is being read.
struct ProcessStream {
    reader: PerishableReader,
    process: Box<dyn SessionProcess>,
}

impl Read for ProcessStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        self.reader.close();
        if self.process.is_running() {
            self.process.destroy();
        }
    }
}

/// Condition-list search over a Unix filesystem.
pub struct UnixFileSearcher {
    fs: Arc<UnixFilesystem>,
}

impl Searchable for UnixFileSearcher {
    fn search(&self, conditions: &[Condition]) -> Result<SearchResult, SearchError> {
        let cmd = self.fs.driver.find_command(conditions)?;

        if let Some(paths) = self
            .fs
            .search_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&cmd)
            .cloned()
        {
            tracing::debug!(%cmd, "search served from compiled-command cache");
            let mut result = SearchResult::default();
            for path in paths {
                result
                    .files
                    .push(self.fs.get_file(&path, Flags::ReadOnly)?);
            }
            return Ok(result);
        }

        tracing::debug!(%cmd, "search start");
        let mut files = Vec::new();
        let mut diagnostics = Vec::new();
        let fs = &self.fs;
        let mut handler = HandlerFn(|reader: &mut PerishableReader| -> io::Result<()> {
            // Re-initialize; a retry discards the previous attempt's rows.
            files.clear();
            diagnostics.clear();
            while let Some(line) = reader.read_line()? {
                if line.trim().is_empty() {
                    continue;
                }
                match fs.driver.parse_record(&line) {
                    Some(info) => {
                        tracing::trace!(path = %info.path, "search match");
                        files.push(fs.file_from_info(info, Flags::ReadOnly));
                    }
                    None => {
                        diagnostics.push(format!("skipped unparseable record: {line}"));
                    }
                }
            }
            Ok(())
        });

        let deadline = self.fs.session.properties().timeout(Timeout::ExtraLarge);
        let run = RemoteCommand::new(&*self.fs.session, cmd.clone())
            .read_timeout(deadline)
            .stream(&mut handler, None);

        let mut result = SearchResult {
            files,
            truncated: false,
            diagnostics,
        };
        match run {
            Ok(code) => {
                if matches!(code, Some(c) if c != 0) {
                    // find exits non-zero when parts of the tree were
                    // unreadable; what it did print is still good.
                    result.truncated = true;
                    result
                        .diagnostics
                        .push(format!("enumeration exit code {code:?}"));
                } else {
                    self.fs
                        .search_cache
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(cmd.clone(), result.files.iter().map(|f| f.path().to_string()).collect());
                }
            }
            Err(e) => {
                tracing::warn!(%cmd, error = %e, "search command failed");
                result.truncated = true;
                result.diagnostics.push(format!("search failed: {e}"));
            }
        }
        tracing::debug!(%cmd, matches = result.files.len(), "search done");
        Ok(result)
    }

    fn guess_parent(
        &self,
        pattern: &Regex,
        directory: bool,
    ) -> Result<Option<Vec<String>>, SearchError> {
        guess::guess_parent(
            &*self.fs,
            self.fs.session.os_flavor(),
            pattern,
            directory,
        )
        .map_err(SearchError::File)
    }
}
