//! Portable search-condition model.
//!
//! A query is an ordered list of [`Condition`]s, implicitly AND-ed. A field
//! absent from the list is *unconstrained*, not excluded. Conditions are
//! pure value objects; translating them into a host command line is the job
//! of the per-platform compilers, which must reject combinations they
//! cannot express with [`SearchError::Unsupported`] instead of silently
//! ignoring them.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::errors::SearchError;
use crate::fs::RemoteFile;

/// Condition value for a regular file, with [`Field::FileType`].
pub const FILETYPE_FILE: &str = "f";
/// Condition value for a directory, with [`Field::FileType`].
pub const FILETYPE_DIR: &str = "d";
/// Condition value for a link, with [`Field::FileType`].
pub const FILETYPE_LINK: &str = "l";

/// Depth value meaning "no depth bound".
pub const DEPTH_UNLIMITED: i64 = -1;

/// The aspect of a file a condition constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// Full path, as a pattern.
    Path,
    /// Directory portion of the path.
    Dirname,
    /// Final path component.
    Basename,
    /// File/directory/link discriminator (`FILETYPE_*` values).
    FileType,
    /// Filesystem type of the mount holding the file.
    FsType,
    /// Recursion depth bound (`DEPTH_UNLIMITED` for none).
    Depth,
    /// Starting directory of the search.
    From,
    /// Unix: traverse symbolic links.
    FollowLinks,
    /// Unix: stay on one filesystem.
    Xdev,
    /// Unix: permission bits.
    Perm,
    /// Unix: owning user id.
    User,
    /// Unix: owning group id.
    Group,
}

/// How a condition compares its field against its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Equals,
    NotEquals,
    /// Regular-expression match.
    Match,
    /// Matches any entry of a value list.
    AnyOf,
    /// Matches no entry of a value list.
    NoneOf,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Equals => "==",
            Op::NotEquals => "!=",
            Op::Match => "=~",
            Op::AnyOf => "in",
            Op::NoneOf => "not in",
        };
        f.write_str(s)
    }
}

/// A condition value; the expected variant depends on field and operator.
#[derive(Debug, Clone)]
pub enum Value {
    Str(String),
    Regex(Regex),
    Int(i64),
    List(Vec<String>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Regex(a), Value::Regex(b)) => a.as_str() == b.as_str(),
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Regex(r) => write!(f, "/{}/", r.as_str()),
            Value::Int(i) => write!(f, "{i}"),
            Value::List(l) => write!(f, "{l:?}"),
        }
    }
}

/// One filterable constraint in a portable search query.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    field: Field,
    op: Op,
    value: Value,
}

/// The unlimited-recursion condition.
pub const RECURSE: Condition = Condition {
    field: Field::Depth,
    op: Op::Equals,
    value: Value::Int(DEPTH_UNLIMITED),
};

impl Condition {
    pub fn new(field: Field, op: Op, value: Value) -> Self {
        Self { field, op, value }
    }

    /// The unlimited-recursion condition; same as [`RECURSE`].
    pub fn recurse() -> Self {
        RECURSE
    }

    /// Bound the search to `depth` levels below the starting directory.
    pub fn depth(depth: i64) -> Self {
        Self::new(Field::Depth, Op::Equals, Value::Int(depth))
    }

    /// Start the search at `path`.
    pub fn from(path: impl Into<String>) -> Self {
        Self::new(Field::From, Op::Equals, Value::Str(path.into()))
    }

    /// Restrict matches to directories.
    pub fn directories() -> Self {
        Self::new(
            Field::FileType,
            Op::Equals,
            Value::Str(FILETYPE_DIR.to_string()),
        )
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn as_str_value(&self) -> Option<&str> {
        match &self.value {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_regex(&self) -> Option<&Regex> {
        match &self.value {
            Value::Regex(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.value {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match &self.value {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {} {}", self.field, self.op, self.value)
    }
}

/// Shorthand for the error every compiler raises on a condition it cannot
/// honor.
pub(crate) fn unsupported(condition: &Condition) -> SearchError {
    SearchError::Unsupported(condition.to_string())
}

/// Outcome of one search: the matches, plus whether coverage may be
/// incomplete and the diagnostics explaining why.
#[derive(Default)]
pub struct SearchResult {
    pub files: Vec<Arc<RemoteFile>>,
    /// True when a failure limited coverage without aborting the query.
    pub truncated: bool,
    /// Human-readable notes on skipped records or failed sub-commands.
    pub diagnostics: Vec<String>,
}

impl SearchResult {
    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// A recursive search facility over one filesystem.
pub trait Searchable: Send + Sync {
    /// Run one query.
    fn search(&self, conditions: &[Condition]) -> Result<SearchResult, SearchError>;

    /// Run several queries concurrently, one worker each. Results are
    /// positionally aligned with `batches`.
    fn search_all(&self, batches: &[Vec<Condition>]) -> Vec<Result<SearchResult, SearchError>> {
        std::thread::scope(|scope| {
            let workers: Vec<_> = batches
                .iter()
                .map(|conditions| scope.spawn(move || self.search(conditions)))
                .collect();
            workers
                .into_iter()
                .map(|w| match w.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    /// Guess the narrowest starting directories for a path pattern. `None`
    /// means indeterminate (the caller must scan every mount); an empty
    /// vector means the pattern cannot match anything.
    fn guess_parent(
        &self,
        pattern: &Regex,
        directory: bool,
    ) -> Result<Option<Vec<String>>, SearchError>;
}
