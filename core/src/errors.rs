//! Unified error types for the shellfs core crate.
//!
//! Each concern (session transport, command execution, file access, search
//! compilation, runspace management) has its own enum; consumers map these
//! to their own transport errors. The split mirrors the failure taxonomy the
//! rest of the crate is built around:
//!
//! - a *hang* (no bytes before the read deadline) is retried and eventually
//!   surfaced as [`ExecError::Hung`];
//! - a *session integrity failure* (channel-level break mid-command) is
//!   retried after a reconnect and eventually surfaced as
//!   [`ExecError::Integrity`];
//! - an *unsupported query* is an immediate [`SearchError::Unsupported`];
//! - an *access violation* (write/delete on a read-only handle) is an
//!   immediate, non-retryable [`FileError::AccessDenied`].

use thiserror::Error;

/// Top-level error type encompassing all core error categories.
#[derive(Error, Debug)]
pub enum Error {
    /// A session transport error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// A command execution error.
    #[error("Exec error: {0}")]
    Exec(#[from] ExecError),

    /// A file-access error.
    #[error("File error: {0}")]
    File(#[from] FileError),

    /// A search compilation or execution error.
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    /// A runspace lifecycle error.
    #[error("Runspace error: {0}")]
    Runspace(#[from] RunspaceError),

    /// A configuration error (invalid values, missing fields, parse failures).
    #[error("Config error: {0}")]
    Config(String),

    /// A low-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the session/connection layer.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The remote process could not be started.
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    /// The channel broke at the session level (distinct from a command-level
    /// hang). The executor reconnects and retries on this.
    #[error("Session disconnected: {0}")]
    Disconnected(String),

    /// An operation was attempted on a session that is not connected.
    #[error("Session not connected")]
    NotConnected,

    /// The session configuration is invalid.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A string destined for a command line contains characters that could
    /// break out of its enclosing quotes.
    #[error("Unsafe characters in argument: {0}")]
    UnsafeArgument(String),

    /// A low-level I/O error during session operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the resilient command executor.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The command produced no output before the read deadline (or hit an
    /// unexpected end-of-stream) on every attempt.
    #[error("Command hung after {attempts} attempt(s): {cmd}")]
    Hung {
        cmd: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// The session broke mid-command on every attempt, reconnects included.
    #[error("Session integrity failure after {attempts} attempt(s): {cmd}")]
    Integrity {
        cmd: String,
        attempts: u32,
        #[source]
        source: SessionError,
    },

    /// A non-retryable session failure (e.g. the spawn itself was rejected).
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// A non-retryable I/O failure while consuming command output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to file handles and file operations.
#[derive(Error, Debug)]
pub enum FileError {
    /// The requested file or directory was not found.
    #[error("File not found: {0}")]
    NotFound(String),

    /// A mutating operation was attempted on a handle whose access mode does
    /// not permit it. Local and immediate, never retried.
    #[error("Access denied: {operation} on {path} (flags: {flags})")]
    AccessDenied {
        path: String,
        operation: &'static str,
        flags: String,
    },

    /// A metadata record could not be parsed from command output.
    #[error("Unparseable metadata for {path}: {detail}")]
    Parse { path: String, detail: String },

    /// The operation is not supported on this filesystem.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// A command issued on behalf of this file failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// A session-level failure while operating on this file.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// A runspace invocation issued on behalf of this file failed.
    #[error(transparent)]
    Runspace(#[from] RunspaceError),

    /// A low-level I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from search compilation and execution.
#[derive(Error, Debug)]
pub enum SearchError {
    /// The active platform compiler cannot express this condition. Always
    /// surfaced immediately; silently dropping the condition would corrupt
    /// result-set semantics.
    #[error("Unsupported condition: {0}")]
    Unsupported(String),

    /// The compiled enumeration command failed.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// A file operation performed while assembling results failed.
    #[error(transparent)]
    File(#[from] FileError),

    /// A runspace invocation failed.
    #[error(transparent)]
    Runspace(#[from] RunspaceError),
}

/// Errors from pooled scripting interpreters.
#[derive(Error, Debug)]
pub enum RunspaceError {
    /// The interpreter process exited; the exit code is included if known.
    #[error("Runspace process stopped (exit code {0:?})")]
    Stopped(Option<i32>),

    /// The invocation produced no prompt before the deadline.
    #[error("Runspace invocation timed out: {0}")]
    Timeout(String),

    /// The interpreter reported errors on its error stream.
    #[error("Runspace invocation failed: {0}")]
    Failed(String),

    /// The pool is at capacity; spawning another interpreter is a hard error.
    #[error("Runspace pool at capacity ({0})")]
    AtCapacity(usize),

    /// A session transport error while driving the interpreter.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// A low-level I/O error on the interpreter's streams.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_display() {
        let err = SessionError::SpawnFailed("no such shell".into());
        assert_eq!(err.to_string(), "Spawn failed: no such shell");

        let err = SessionError::NotConnected;
        assert_eq!(err.to_string(), "Session not connected");
    }

    #[test]
    fn exec_error_display() {
        let err = ExecError::Hung {
            cmd: "find / -type f".into(),
            attempts: 4,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline"),
        };
        assert_eq!(
            err.to_string(),
            "Command hung after 4 attempt(s): find / -type f"
        );
    }

    #[test]
    fn file_error_display() {
        let err = FileError::NotFound("/tmp/missing".into());
        assert_eq!(err.to_string(), "File not found: /tmp/missing");

        let err = FileError::AccessDenied {
            path: "/etc/shadow".into(),
            operation: "delete",
            flags: "read-only".into(),
        };
        assert_eq!(
            err.to_string(),
            "Access denied: delete on /etc/shadow (flags: read-only)"
        );
    }

    #[test]
    fn error_from_session_error() {
        let err: Error = SessionError::NotConnected.into();
        assert_eq!(err.to_string(), "Session error: Session not connected");
    }

    #[test]
    fn search_error_from_exec_error() {
        let exec = ExecError::Session(SessionError::NotConnected);
        let err: SearchError = exec.into();
        assert!(matches!(err, SearchError::Exec(_)));
    }

    #[test]
    fn runspace_error_display() {
        let err = RunspaceError::AtCapacity(8);
        assert_eq!(err.to_string(), "Runspace pool at capacity (8)");
    }
}
