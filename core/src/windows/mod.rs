//! Filesystem access to Windows hosts over a scripting channel.
//!
//! All traffic goes through a pooled PowerShell runspace: metadata comes
//! from `Print-FileInfo` blocks, directory listings from `Get-ChildItem`,
//! content and large result sets from a gzip + Base64 transfer encoding
//! emitted by the support module.

pub mod runspace;
pub mod search;

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::DateTime;

use crate::errors::{FileError, RunspaceError, SearchError};
use crate::fs::cache::{self, CacheHit, FileCache};
use crate::fs::{expand_path, Accessor, FileExt, FileInfo, FileType, Filesystem, Flags, Mount,
    RemoteFile, WindowsExt};
use crate::search::Searchable;
use crate::session::Session;

use runspace::{RunspaceLease, RunspacePool};

const DELIM: &str = "\\";

/// `FILE_ATTRIBUTE_REPARSE_POINT`: the path is a link/junction.
const ATTR_REPARSE_POINT: u32 = 0x400;

/// A Windows host's filesystem, reached through a pooled interpreter.
pub struct WindowsFilesystem {
    me: Weak<WindowsFilesystem>,
    session: Arc<dyn Session>,
    cache: Arc<FileCache>,
    pool: Arc<RunspacePool>,
    runspace: RunspaceLease,
    /// Compiled-command text (upper-cased) -> matched paths.
    search_cache: Mutex<HashMap<String, Vec<String>>>,
    mounts: Mutex<Option<Vec<Mount>>>,
}

impl WindowsFilesystem {
    pub fn new(session: Arc<dyn Session>) -> Result<Arc<Self>, FileError> {
        if !session.os_flavor().is_windows() {
            return Err(FileError::Unsupported("non-Windows session on a Windows filesystem"));
        }
        let pool = Arc::new(RunspacePool::new(
            session.clone(),
            session.properties().runspace_capacity(),
        ));
        let view = runspace::native_view(&*session);
        let lease = pool.acquire(view)?;
        let cache = cache::for_session(&*session, "fscache-win.idx");
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            session,
            cache,
            pool,
            runspace: lease,
            search_cache: Mutex::new(HashMap::new()),
            mounts: Mutex::new(None),
        }))
    }

    /// The interpreter pool, for callers that need their own view.
    pub fn pool(&self) -> &Arc<RunspacePool> {
        &self.pool
    }

    fn invoke(&self, command: &str) -> Result<String, FileError> {
        Ok(self.runspace.invoke(command)?)
    }

    fn accessor(&self, path: &str) -> WindowsAccessor {
        WindowsAccessor {
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
}

impl Filesystem for WindowsFilesystem {
    fn delimiter(&self) -> &'static str {
        DELIM
    }

    fn get_file(&self, path: &str, flags: Flags) -> Result<Arc<RemoteFile>, FileError> {
        let mut path = expand_path(&*self.session, path);
        if path.len() > DELIM.len() && path.ends_with(DELIM) {
            // Drive roots keep their trailing delimiter; nothing else does.
            let is_mount = self
                .mounts()?
                .iter()
                .any(|m| m.path.eq_ignore_ascii_case(&path));
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
        let mut unique: Vec<&String> = Vec::new();
        for path in &expanded {
            if !unique.contains(&path) {
                unique.push(path);
            }
        }
        let quoted: Vec<String> = unique.iter().map(|p| format!("'{}'", ps_quote(p))).collect();
        let cmd = format!(
            "@({}) | ForEach-Object {{ Get-Item -LiteralPath $_ -Force -ErrorAction SilentlyContinue }} | Print-FileInfo | Send-Encoded",
            quoted.join(",")
        );
        let encoded = self.invoke(&cmd)?;
        let text = decode_transfer(&encoded)?;
        let (records, skipped) = parse_file_records(&text);
        for diagnostic in skipped {
            tracing::warn!(%diagnostic, "batch stat record skipped");
        }
        // Path comparisons fold case; that is how the host resolves them.
        let mut found: HashMap<String, Arc<RemoteFile>> = HashMap::new();
        for info in records {
            let key = info.path.to_uppercase();
            let file = self.file_from_info(info, flags);
            found.insert(key, file);
        }
        Ok(expanded
            .iter()
            .map(|path| found.get(&path.to_uppercase()).cloned())
            .collect())
    }

    fn searcher(&self) -> Result<Arc<dyn Searchable>, SearchError> {
        let fs = self
            .me
            .upgrade()
            .ok_or(FileError::Unsupported("filesystem dropped"))
            .map_err(SearchError::File)?;
        Ok(Arc::new(search::WindowsFileSearcher::new(fs)))
    }

    fn mounts(&self) -> Result<Vec<Mount>, FileError> {
        let mut cached = self
            .mounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mounts) = cached.as_ref() {
            return Ok(mounts.clone());
        }
        let output = self.invoke(
            "[System.IO.DriveInfo]::GetDrives() | ForEach-Object { \"$($_.RootDirectory.FullName)|$($_.DriveFormat)\" }",
        )?;
        let mounts: Vec<Mount> = output
            .lines()
            .filter_map(|line| {
                let (path, fs_type) = line.trim().split_once('|')?;
                Some(Mount {
                    path: path.to_string(),
                    fs_type: fs_type.to_string(),
                })
            })
            .collect();
        *cached = Some(mounts.clone());
        Ok(mounts)
    }
}

/// Accessor that drives every operation through the runspace.
struct WindowsAccessor {
    fs: Weak<WindowsFilesystem>,
    path: String,
}

impl WindowsAccessor {
    fn fs(&self) -> Result<Arc<WindowsFilesystem>, FileError> {
        self.fs
            .upgrade()
            .ok_or(FileError::Unsupported("filesystem dropped"))
    }
}

impl Accessor for WindowsAccessor {
    fn fetch(&self) -> Result<FileInfo, FileError> {
        let fs = self.fs()?;
        let cmd = format!(
            "Get-Item -LiteralPath '{}' -Force | Print-FileInfo",
            ps_quote(&self.path)
        );
        let output = match fs.invoke(&cmd) {
            Ok(output) => output,
            Err(FileError::Runspace(RunspaceError::Failed(msg)))
                if msg.contains("ItemNotFoundException") || msg.contains("Cannot find path") =>
            {
                return Err(FileError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(e),
        };
        let (records, _) = parse_file_records(&output);
        records
            .into_iter()
            .next()
            .ok_or_else(|| FileError::NotFound(self.path.clone()))
    }

    fn open(&self) -> Result<Box<dyn Read + Send>, FileError> {
        let fs = self.fs()?;
        let encoded = fs.invoke(&format!("Send-File -Path '{}'", ps_quote(&self.path)))?;
        let bytes = decode_transfer_bytes(&encoded)?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn write(&self, data: &[u8], append: bool) -> Result<(), FileError> {
        let fs = self.fs()?;
        let payload = BASE64.encode(data);
        let path = ps_quote(&self.path);
        let cmd = if append {
            format!(
                "$b=[Convert]::FromBase64String('{payload}'); $s=[System.IO.File]::Open('{path}','Append'); $s.Write($b,0,$b.Length); $s.Close()"
            )
        } else {
            format!("[System.IO.File]::WriteAllBytes('{path}',[Convert]::FromBase64String('{payload}'))")
        };
        fs.invoke(&cmd)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, FileError> {
        let fs = self.fs()?;
        let output = fs.invoke(&format!(
            "Get-ChildItem -LiteralPath '{}' -Force | Select-Object -ExpandProperty Name",
            ps_quote(&self.path)
        ))?;
        Ok(output
            .lines()
            .map(|l| l.trim_end().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    fn delete(&self) -> Result<(), FileError> {
        let fs = self.fs()?;
        fs.invoke(&format!(
            "Remove-Item -LiteralPath '{}' -Recurse -Force",
            ps_quote(&self.path)
        ))?;
        Ok(())
    }

    fn mkdir(&self) -> Result<(), FileError> {
        let fs = self.fs()?;
        fs.invoke(&format!(
            "New-Item -ItemType Directory -Path '{}' | Out-Null",
            ps_quote(&self.path)
        ))?;
        Ok(())
    }
}

/// Escape a string for embedding in a single-quoted PowerShell literal.
pub(crate) fn ps_quote(s: &str) -> String {
    s.replace('\'', "''")
}

/// Decode a gzip + Base64 transfer block into text.
pub(crate) fn decode_transfer(encoded: &str) -> Result<String, FileError> {
    let bytes = decode_transfer_bytes(encoded)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Decode a gzip + Base64 transfer block into raw bytes.
pub(crate) fn decode_transfer_bytes(encoded: &str) -> Result<Vec<u8>, FileError> {
    let compact: String = encoded
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let compressed = BASE64.decode(compact.as_bytes()).map_err(|e| FileError::Parse {
        path: String::new(),
        detail: format!("bad transfer encoding: {e}"),
    })?;
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(&compressed[..])
        .read_to_end(&mut out)
        .map_err(|e| FileError::Parse {
            path: String::new(),
            detail: format!("bad compressed block: {e}"),
        })?;
    Ok(out)
}

/// Parse a stream of `Print-FileInfo` brace blocks. Malformed blocks are
/// skipped and described in the second return value.
pub(crate) fn parse_file_records(text: &str) -> (Vec<FileInfo>, Vec<String>) {
    let mut records = Vec::new();
    let mut skipped = Vec::new();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        if line.trim() != "{" {
            continue;
        }
        let mut fields: Vec<(String, String)> = Vec::new();
        let mut closed = false;
        for line in lines.by_ref() {
            let line = line.trim();
            if line == "}" {
                closed = true;
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                fields.push((key.trim().to_string(), value.trim().to_string()));
            }
        }
        if !closed {
            skipped.push("unterminated record block".to_string());
            break;
        }
        match block_to_info(&fields) {
            Some(info) => records.push(info),
            None => skipped.push(format!("incomplete record: {fields:?}")),
        }
    }
    (records, skipped)
}

fn block_to_info(fields: &[(String, String)]) -> Option<FileInfo> {
    let get = |key: &str| {
        fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    let path = get("Path")?.to_string();
    let attributes = get("Attributes")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(0) as u32;
    let link_target = get("LinkTarget").map(str::to_string);
    let file_type = if attributes & ATTR_REPARSE_POINT != 0 || link_target.is_some() {
        FileType::Link
    } else if get("Type") == Some("Directory") {
        FileType::Directory
    } else {
        FileType::File
    };
    let millis = |key: &str| {
        get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|ms| *ms > 0)
            .and_then(DateTime::from_timestamp_millis)
    };
    Some(FileInfo {
        file_type,
        canonical_path: path.clone(),
        path,
        link_target,
        length: get("Length").and_then(|v| v.parse().ok()).unwrap_or(0),
        access_time: millis("Atime"),
        create_time: millis("Ctime"),
        modify_time: millis("Mtime"),
        ext: FileExt::Windows(WindowsExt {
            attributes,
            owner: get("Owner").map(str::to_string),
            file_version: get("FileVersion").map(str::to_string),
            product_version: get("ProductVersion").map(str::to_string),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_file_record_block() {
        let text = "\
{
Type: File
Path: C:\\Windows\\notepad.exe
Length: 201216
Ctime: 1600000000000
Mtime: 1650000000000
Atime: 1700000000000
Attributes: 32
Owner: NT AUTHORITY\\SYSTEM
FileVersion: 10.0.19041.1
}
";
        let (records, skipped) = parse_file_records(text);
        assert!(skipped.is_empty());
        assert_eq!(records.len(), 1);
        let info = &records[0];
        assert_eq!(info.path, "C:\\Windows\\notepad.exe");
        assert_eq!(info.file_type, FileType::File);
        assert_eq!(info.length, 201_216);
        assert_eq!(info.modify_time.unwrap().timestamp_millis(), 1_650_000_000_000);
        match &info.ext {
            FileExt::Windows(ext) => {
                assert_eq!(ext.attributes, 32);
                assert_eq!(ext.owner.as_deref(), Some("NT AUTHORITY\\SYSTEM"));
                assert_eq!(ext.file_version.as_deref(), Some("10.0.19041.1"));
            }
            other => panic!("expected windows ext, got {other:?}"),
        }
    }

    #[test]
    fn reparse_point_is_a_link() {
        let text = "{\nType: Directory\nPath: C:\\Users\\All Users\nAttributes: 1046\nLinkTarget: C:\\ProgramData\n}\n";
        let (records, _) = parse_file_records(text);
        assert_eq!(records[0].file_type, FileType::Link);
        assert_eq!(records[0].link_target.as_deref(), Some("C:\\ProgramData"));
    }

    #[test]
    fn pathless_block_is_skipped_with_diagnostic() {
        let text = "{\nType: File\nLength: 10\n}\n{\nType: File\nPath: C:\\ok.txt\n}\n";
        let (records, skipped) = parse_file_records(text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "C:\\ok.txt");
        assert_eq!(skipped.len(), 1);
    }

    #[test]
    fn transfer_decode_round_trip() {
        let payload = "{\nPath: C:\\x\n}\n";
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(payload.as_bytes()).unwrap();
        let compressed = gz.finish().unwrap();
        let b64 = BASE64.encode(&compressed);
        // Chunk into 76-column lines the way the remote side does.
        let chunked: String = b64
            .as_bytes()
            .chunks(76)
            .map(|c| format!("{}\r\n", String::from_utf8_lossy(c)))
            .collect();
        assert_eq!(decode_transfer(&chunked).unwrap(), payload);
    }

    #[test]
    fn ps_quote_doubles_single_quotes() {
        assert_eq!(ps_quote("C:\\it's here"), "C:\\it''s here");
        assert_eq!(ps_quote("plain"), "plain");
    }
}
