//! Parent-scope guessing for path patterns.
//!
//! Given a regular expression anchored at the start of a path, find the
//! narrowest literal directory prefix that must contain every match, so a
//! recursive search can start there instead of scanning whole mounts.

use regex::{Regex, RegexBuilder};

use crate::errors::FileError;
use crate::session::OsFlavor;

use super::{Filesystem, Flags};

/// Above this many candidate subdirectories the refinement step is not
/// worth its round trips; the single common parent is returned instead.
const MAX_GUESSES: usize = 100;

/// Characters that make a pattern segment non-literal unless escaped.
const REGEX_CHARS: &[char] = &[
    '\\', '^', '$', '.', '[', ']', '(', ')', '*', '+', '?', '|', '{', '}',
];

/// Guess the parent directories for `pattern`.
///
/// Returns `None` when no guess can be made (the pattern is unanchored or
/// its first segment is already non-literal), `Some(vec![])` when the
/// computed prefix provably cannot yield matches, and otherwise the list of
/// starting directories.
///
/// When `directory` is set and the first non-literal segment begins with a
/// literal run, one extra listing of the prefix narrows the result to the
/// concrete subdirectories matching that run, buying one more round trip for a
/// much tighter scope.
pub(crate) fn guess_parent(
    fs: &dyn Filesystem,
    flavor: OsFlavor,
    pattern: &Regex,
    directory: bool,
) -> Result<Option<Vec<String>>, FileError> {
    let text = pattern.as_str();
    let Some(body) = text.strip_prefix('^') else {
        return Ok(None);
    };
    if !flavor.is_windows() && !body.starts_with('/') {
        // Absolute Unix paths start with the delimiter; anything else
        // cannot name a real path.
        return Ok(Some(Vec::new()));
    }

    let delim = flavor.delimiter();
    let segments: Vec<&str> = body.split(flavor.escaped_delimiter()).collect();

    let mut literal_parts: Vec<String> = Vec::new();
    let mut stopped_at: Option<&str> = None;
    for segment in segments.iter().copied() {
        match literal_segment(segment) {
            Some(literal) => literal_parts.push(literal),
            None => {
                stopped_at = Some(segment);
                break;
            }
        }
    }

    let parent = literal_parts.join(delim);
    if parent.is_empty() {
        return Ok(None);
    }

    let base = fs.get_file(&parent, Flags::ReadOnly)?;
    if !base.exists() {
        return Ok(Some(Vec::new()));
    }

    if directory {
        if let Some(segment) = stopped_at {
            let run = literal_run(segment);
            if !run.is_empty() {
                match refine(fs, flavor, &parent, &run) {
                    Ok(refined) => return Ok(Some(refined)),
                    Err(e) => {
                        // Refinement is an optimization; fall back to the
                        // unrefined prefix on any failure.
                        tracing::debug!(error = %e, "candidate refinement failed");
                    }
                }
            }
        }
    }

    Ok(Some(vec![parent]))
}

/// List `parent` and keep the subdirectories whose name starts with `run`.
fn refine(
    fs: &dyn Filesystem,
    flavor: OsFlavor,
    parent: &str,
    run: &str,
) -> Result<Vec<String>, FileError> {
    let prefix = RegexBuilder::new(&format!("^{}", regex::escape(run)))
        .case_insensitive(flavor.case_insensitive())
        .build()
        .map_err(|e| FileError::Parse {
            path: parent.to_string(),
            detail: e.to_string(),
        })?;

    let base = fs.get_file(parent, Flags::ReadOnly)?;
    let delim = fs.delimiter();
    let joined_parent = if parent.ends_with(delim) {
        parent.to_string()
    } else {
        format!("{parent}{delim}")
    };

    // Match names first and stat afterwards; building candidate paths is
    // free, the directory check costs a round trip.
    let candidates: Vec<String> = base
        .child_names()?
        .into_iter()
        .filter(|name| prefix.is_match(name))
        .map(|name| format!("{joined_parent}{name}"))
        .collect();

    tracing::trace!(
        count = candidates.len(),
        parent,
        run,
        "parent-scope candidates"
    );
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    if candidates.len() >= MAX_GUESSES {
        // Searching this many roots costs more than scanning the parent.
        tracing::debug!(count = candidates.len(), parent, "candidate overflow");
        return Ok(vec![parent.to_string()]);
    }

    let refs: Vec<&str> = candidates.iter().map(String::as_str).collect();
    let files = fs.get_files(&refs, Flags::ReadOnly)?;
    Ok(files
        .into_iter()
        .flatten()
        .filter(|f| f.is_directory())
        .map(|f| f.path().to_string())
        .collect())
}

/// If `segment` contains no unescaped regex metacharacter, return its
/// literal (unescaped) text. An escaped punctuation character (`\.`) is
/// literal; an escaped alphanumeric (`\d`, `\w`) is a character class and
/// disqualifies the segment.
fn literal_segment(segment: &str) -> Option<String> {
    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(escaped) if !escaped.is_alphanumeric() => out.push(escaped),
                _ => return None,
            }
        } else if REGEX_CHARS.contains(&c) {
            return None;
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Leading literal text of `segment`, up to its first unescaped
/// metacharacter or character class.
fn literal_run(segment: &str) -> String {
    let mut out = String::new();
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(escaped) if !escaped.is_alphanumeric() => out.push(escaped),
                _ => break,
            }
        } else if REGEX_CHARS.contains(&c) {
            break;
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_segment_accepts_escaped_metachars() {
        assert_eq!(literal_segment("etc").as_deref(), Some("etc"));
        assert_eq!(literal_segment("cron\\.d").as_deref(), Some("cron.d"));
        assert_eq!(literal_segment(""), Some(String::new()));
        assert!(literal_segment(".*").is_none());
        assert!(literal_segment("a+b").is_none());
        assert!(literal_segment("trailing\\").is_none());
        // \d is a character class, not an escaped literal
        assert!(literal_segment("log\\d").is_none());
    }

    #[test]
    fn literal_run_stops_at_first_metachar() {
        assert_eq!(literal_run("x.*"), "x");
        assert_eq!(literal_run("host\\.\\d+"), "host.");
        assert_eq!(literal_run(".*"), "");
        assert_eq!(literal_run("plain"), "plain");
    }
}
