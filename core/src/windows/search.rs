//! Condition compilation and search over a Windows filesystem.
//!
//! A condition list compiles into one `Find-Files`/`Find-Directories`
//! pipeline ending in `Print-FileInfo | Send-Encoded`, so even very large
//! result sets come back as one compressed block. Basename patterns are
//! translated to a wildcard glob when expressible (globs are matched far
//! more cheaply on the remote side); everything else falls back to the
//! scripting engine's regex dialect. Identical compiled commands within a
//! session are served from memory; the key is case-insensitive because the
//! host's paths are.

use std::sync::Arc;

use regex::Regex;

use crate::config::Timeout;
use crate::errors::SearchError;
use crate::fs::{guess, Filesystem, Flags};
use crate::search::{
    unsupported, Condition, Field, Op, SearchResult, Searchable, DEPTH_UNLIMITED, FILETYPE_DIR,
    FILETYPE_FILE,
};

use super::{decode_transfer, parse_file_records, ps_quote, WindowsFilesystem};

/// Condition-list search over a Windows filesystem.
pub struct WindowsFileSearcher {
    fs: Arc<WindowsFilesystem>,
}

struct Query {
    command: String,
    from: String,
    fs_type: Option<String>,
}

impl WindowsFileSearcher {
    pub(crate) fn new(fs: Arc<WindowsFilesystem>) -> Self {
        Self { fs }
    }
}

fn compile(conditions: &[Condition]) -> Result<Query, SearchError> {
    let mut from: Option<String> = None;
    let mut depth = DEPTH_UNLIMITED;
    let mut dir_only = false;
    let mut fs_type: Option<String> = None;
    let mut path_re: Option<String> = None;
    let mut dirname_re: Option<String> = None;
    let mut basename_eq: Option<String> = None;
    let mut basename_re: Option<String> = None;

    for condition in conditions {
        match (condition.field(), condition.op()) {
            (Field::From, Op::Equals) => {
                from = Some(
                    condition
                        .as_str_value()
                        .ok_or_else(|| unsupported(condition))?
                        .to_string(),
                );
            }
            (Field::Depth, Op::Equals) => {
                depth = condition.as_int().ok_or_else(|| unsupported(condition))?;
            }
            (Field::FileType, Op::Equals) => match condition.as_str_value() {
                Some(FILETYPE_DIR) => dir_only = true,
                Some(FILETYPE_FILE) => {}
                _ => return Err(unsupported(condition)),
            },
            (Field::FsType, Op::Equals) => {
                fs_type = Some(
                    condition
                        .as_str_value()
                        .ok_or_else(|| unsupported(condition))?
                        .to_string(),
                );
            }
            (Field::Path, Op::Match) => {
                path_re = Some(to_powershell_regex(
                    condition.as_regex().ok_or_else(|| unsupported(condition))?,
                ));
            }
            (Field::Dirname, Op::Match) => {
                dirname_re = Some(to_powershell_regex(
                    condition.as_regex().ok_or_else(|| unsupported(condition))?,
                ));
            }
            (Field::Basename, Op::Equals) => {
                basename_eq = Some(
                    condition
                        .as_str_value()
                        .ok_or_else(|| unsupported(condition))?
                        .to_string(),
                );
            }
            (Field::Basename, Op::NotEquals) => {
                let anti = condition
                    .as_str_value()
                    .ok_or_else(|| unsupported(condition))?;
                basename_re = Some(format!("(?!^{}$)(^.*$)", regex::escape(anti)));
            }
            (Field::Basename, Op::Match) => {
                basename_re = Some(to_powershell_regex(
                    condition.as_regex().ok_or_else(|| unsupported(condition))?,
                ));
            }
            (Field::Basename, Op::AnyOf) => {
                let names = condition.as_list().ok_or_else(|| unsupported(condition))?;
                basename_re = Some(format!("^(?:{})$", alternation(names)));
            }
            (Field::Basename, Op::NoneOf) => {
                let names = condition.as_list().ok_or_else(|| unsupported(condition))?;
                basename_re = Some(format!("(?!^(?:{})$)(^.*$)", alternation(names)));
            }
            // Link traversal and POSIX ownership have no counterpart in
            // this pipeline.
            _ => return Err(unsupported(condition)),
        }
    }

    let from = from.ok_or_else(|| {
        SearchError::Unsupported("search requires a starting directory".to_string())
    })?;

    let mut command = if dir_only {
        let mut c = format!("Find-Directories -Path '{}'", ps_quote(&from));
        if let Some(pattern) = &dirname_re {
            c.push_str(&format!(" -Pattern '{}'", ps_quote(pattern)));
        }
        c
    } else {
        let mut c = format!("Find-Files -Path '{}'", ps_quote(&from));
        if let Some(pattern) = &path_re {
            c.push_str(&format!(" -Pattern '{}'", ps_quote(pattern)));
        }
        if let Some(name) = &basename_eq {
            c.push_str(&format!(" -LiteralFilename '{}'", ps_quote(name)));
        }
        if let Some(pattern) = &basename_re {
            match regex_to_glob(pattern) {
                Some(glob) => {
                    tracing::debug!(%pattern, %glob, "basename pattern expressed as glob");
                    c.push_str(&format!(" -FilenameGlob '{}'", ps_quote(&glob)));
                }
                None => {
                    c.push_str(&format!(" -Filename '{}'", ps_quote(pattern)));
                }
            }
        }
        c
    };
    command.push_str(&format!(" -Depth {depth}"));
    command.push_str(" | Print-FileInfo | Send-Encoded");
    Ok(Query {
        command,
        from,
        fs_type,
    })
}

impl Searchable for WindowsFileSearcher {
    fn search(&self, conditions: &[Condition]) -> Result<SearchResult, SearchError> {
        let query = compile(conditions)?;

        if let Some(fs_type) = &query.fs_type {
            // The filter can only hold if the starting drive is of the
            // requested filesystem type.
            let from_upper = query.from.to_uppercase();
            let ok = self.fs.mounts().map_err(SearchError::File)?.iter().any(|m| {
                m.fs_type.eq_ignore_ascii_case(fs_type)
                    && from_upper.starts_with(&m.path.to_uppercase())
            });
            if !ok {
                return Ok(SearchResult::default());
            }
        }

        let memo_key = query.command.to_uppercase();
        if let Some(paths) = self
            .fs
            .search_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&memo_key)
            .cloned()
        {
            tracing::debug!(cmd = %query.command, "search served from compiled-command cache");
            let mut result = SearchResult::default();
            for path in paths {
                result.files.push(self.fs.get_file(&path, Flags::ReadOnly)?);
            }
            return Ok(result);
        }

        if !self.fs.get_file(&query.from, Flags::ReadOnly)?.is_directory() {
            return Ok(SearchResult::default());
        }

        tracing::debug!(cmd = %query.command, "search start");
        let mut result = SearchResult::default();
        let deadline = self.fs.session.properties().timeout(Timeout::ExtraLarge);
        match self.fs.runspace.invoke_timeout(&query.command, deadline) {
            Ok(encoded) => {
                let text = decode_transfer(&encoded).map_err(SearchError::File)?;
                let (records, skipped) = parse_file_records(&text);
                result.diagnostics.extend(skipped);
                for info in records {
                    tracing::trace!(path = %info.path, "search match");
                    result
                        .files
                        .push(self.fs.file_from_info(info, Flags::ReadOnly));
                }
                self.fs
                    .search_cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(
                        memo_key,
                        result.files.iter().map(|f| f.path().to_string()).collect(),
                    );
            }
            Err(e) => {
                // A failed enumeration degrades to a partial result.
                tracing::warn!(cmd = %query.command, error = %e, "search command failed");
                result.truncated = true;
                result.diagnostics.push(format!("search failed: {e}"));
            }
        }
        tracing::debug!(cmd = %query.command, matches = result.files.len(), "search done");
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

fn alternation(names: &[String]) -> String {
    names
        .iter()
        .map(|n| regex::escape(n))
        .collect::<Vec<_>>()
        .join("|")
}

/// Translate a portable pattern into the scripting engine's dialect.
///
/// The dialects agree on everything this crate emits except POSIX bracket
/// classes, which .NET does not know.
fn to_powershell_regex(pattern: &Regex) -> String {
    pattern
        .as_str()
        .replace("[:alnum:]", "a-zA-Z0-9")
        .replace("[:alpha:]", "a-zA-Z")
        .replace("[:digit:]", "0-9")
        .replace("[:upper:]", "A-Z")
        .replace("[:lower:]", "a-z")
        .replace("[:space:]", " \\t\\r\\n")
}

/// Express an anchored, literal-plus-wildcards regex as a `-like` glob.
/// Returns `None` for anything the glob language cannot say.
fn regex_to_glob(pattern: &str) -> Option<String> {
    let mut glob = String::new();
    let mut rest = pattern;
    if let Some(stripped) = rest.strip_prefix('^') {
        rest = stripped;
    } else {
        glob.push('*');
    }
    let anchored_end = rest.ends_with('$') && !rest.ends_with("\\$");
    let core = if anchored_end {
        &rest[..rest.len() - 1]
    } else {
        rest
    };
    let mut chars = core.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next()?;
                if escaped.is_alphanumeric() {
                    // A character class like \d; not expressible.
                    return None;
                }
                if matches!(escaped, '*' | '?' | '[' | ']') {
                    // Glob metacharacters cannot be escaped portably.
                    return None;
                }
                glob.push(escaped);
            }
            '.' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    glob.push('*');
                } else {
                    glob.push('?');
                }
            }
            '*' | '+' | '?' | '|' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' => return None,
            c => glob.push(c),
        }
    }
    if !anchored_end {
        glob.push('*');
    }
    Some(glob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::Value;

    #[test]
    fn compile_basename_equality_with_depth() {
        let query = compile(&[
            Condition::new(Field::Basename, Op::Equals, Value::Str("hosts".into())),
            Condition::from("C:\\Windows\\System32"),
            Condition::depth(2),
        ])
        .unwrap();
        assert_eq!(
            query.command,
            "Find-Files -Path 'C:\\Windows\\System32' -LiteralFilename 'hosts' -Depth 2 | Print-FileInfo | Send-Encoded"
        );
    }

    #[test]
    fn compile_directory_search_uses_find_directories() {
        let re = Regex::new("^C:\\\\Users\\\\.*").unwrap();
        let query = compile(&[
            Condition::directories(),
            Condition::new(Field::Dirname, Op::Match, Value::Regex(re)),
            Condition::from("C:\\Users"),
            Condition::recurse(),
        ])
        .unwrap();
        assert!(query.command.starts_with("Find-Directories -Path 'C:\\Users'"));
        assert!(query.command.contains("-Pattern"));
        assert!(query.command.contains("-Depth -1"));
    }

    #[test]
    fn compile_glob_expressible_pattern_uses_glob() {
        let re = Regex::new("^.*\\.dll$").unwrap();
        let query = compile(&[
            Condition::new(Field::Basename, Op::Match, Value::Regex(re)),
            Condition::from("C:\\Windows"),
        ])
        .unwrap();
        assert!(query.command.contains("-FilenameGlob '*.dll'"), "{}", query.command);
    }

    #[test]
    fn compile_inexpressible_pattern_falls_back_to_regex() {
        let re = Regex::new("^(system|user)\\.dat$").unwrap();
        let query = compile(&[
            Condition::new(Field::Basename, Op::Match, Value::Regex(re)),
            Condition::from("C:\\"),
        ])
        .unwrap();
        assert!(query.command.contains("-Filename '^(system|user)\\.dat$'"), "{}", query.command);
    }

    #[test]
    fn compile_rejects_posix_ownership_fields() {
        let result = compile(&[
            Condition::from("C:\\"),
            Condition::new(Field::User, Op::Equals, Value::Int(0)),
        ]);
        assert!(matches!(result, Err(SearchError::Unsupported(_))));
    }

    #[test]
    fn compile_requires_a_starting_directory() {
        let result = compile(&[Condition::depth(1)]);
        assert!(matches!(result, Err(SearchError::Unsupported(_))));
    }

    #[test]
    fn compile_embedded_quotes_are_doubled() {
        let query = compile(&[Condition::from("C:\\it's")]).unwrap();
        assert!(query.command.contains("'C:\\it''s'"), "{}", query.command);
    }

    #[test]
    fn regex_to_glob_translates_simple_patterns() {
        assert_eq!(regex_to_glob("^foo\\.txt$").as_deref(), Some("foo.txt"));
        assert_eq!(regex_to_glob("^foo.*$").as_deref(), Some("foo*"));
        assert_eq!(regex_to_glob("^foo..$").as_deref(), Some("foo??"));
        assert_eq!(regex_to_glob("foo").as_deref(), Some("*foo*"));
        assert_eq!(regex_to_glob("^.*\\.conf$").as_deref(), Some("*.conf"));
    }

    #[test]
    fn regex_to_glob_rejects_inexpressible_patterns() {
        assert!(regex_to_glob("^(a|b)$").is_none());
        assert!(regex_to_glob("^x+$").is_none());
        assert!(regex_to_glob("^[0-9]+$").is_none());
        assert!(regex_to_glob("^\\d+$").is_none());
        assert!(regex_to_glob("^a\\*b$").is_none());
    }

    #[test]
    fn posix_classes_translate_to_dotnet() {
        let re = Regex::new("^log[[:digit:]]+\\.txt$").unwrap();
        assert_eq!(to_powershell_regex(&re), "^log[0-9]+\\.txt$");
    }

    #[test]
    fn alternation_escapes_names() {
        assert_eq!(
            alternation(&["a.txt".to_string(), "b+c".to_string()]),
            "a\\.txt|b\\+c"
        );
    }
}
