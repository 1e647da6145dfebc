//! Resilient command execution over a session channel.
//!
//! [`RemoteCommand`] runs one command to completion, wrapping its output in
//! a [`PerishableReader`] and handing the reader to a caller-supplied
//! [`ReaderHandler`] that incrementally consumes lines or bytes. Failure
//! handling distinguishes two recoverable cases:
//!
//! - **hang**: the read deadline expires, or the stream ends unexpectedly
//!   mid-record: the process is killed and the same command restarted, up to
//!   the session's configured retry count;
//! - **integrity failure**: the channel itself broke, so the session is
//!   disconnected and re-established before the next attempt.
//!
//! Anything else is surfaced immediately. The error stream is drained by a
//! second scoped worker so it can never back-pressure the output stream.
//!
//! Because a handler may be re-invoked after a retry, handlers must fully
//! re-initialize themselves at the top of `handle()` and must never swallow
//! reader errors.

use std::collections::HashMap;
use std::io::{self, Read};
use std::time::Duration;

use crate::config::Timeout;
use crate::errors::{ExecError, SessionError};
use crate::io::PerishableReader;
use crate::session::Session;

/// Consumer of a process stream, invoked once per execution attempt.
pub trait ReaderHandler: Send {
    fn handle(&mut self, reader: &mut PerishableReader) -> io::Result<()>;
}

/// Adapter turning a closure into a [`ReaderHandler`].
pub struct HandlerFn<F>(pub F);

impl<F> ReaderHandler for HandlerFn<F>
where
    F: FnMut(&mut PerishableReader) -> io::Result<()> + Send,
{
    fn handle(&mut self, reader: &mut PerishableReader) -> io::Result<()> {
        (self.0)(reader)
    }
}

/// Captured output of a completed command.
#[derive(Debug)]
pub struct ExecOutput {
    pub cmd: String,
    /// `None` when the bounded exit-code wait timed out.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Output split into lines. Guaranteed to contain at least one entry:
    /// a command that printed nothing is unusual, so it is logged as a
    /// warning, stderr is consulted as a fallback, and a single empty line
    /// stands in if both streams were silent.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = to_lines(&self.stdout);
        if lines.is_empty() {
            tracing::warn!(
                cmd = %self.cmd,
                exit_code = ?self.exit_code,
                "command produced no output"
            );
            if !self.stderr.is_empty() {
                let err_lines = to_lines(&self.stderr);
                if !err_lines.is_empty() {
                    return err_lines;
                }
            }
            lines.push(String::new());
        }
        lines
    }

    /// First non-empty line of output, or an empty string.
    pub fn first_line(&self) -> String {
        self.lines()
            .into_iter()
            .find(|l| !l.is_empty())
            .unwrap_or_default()
    }
}

fn to_lines(bytes: &[u8]) -> Vec<String> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let text = String::from_utf8_lossy(bytes);
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l).to_string())
        .collect();
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Run a command and capture its output as lines.
pub fn lines(session: &dyn Session, cmd: &str, tier: Timeout) -> Result<Vec<String>, ExecError> {
    Ok(RemoteCommand::new(session, cmd)
        .read_timeout(session.properties().timeout(tier))
        .capture()?
        .lines())
}

/// Run a command and return the first non-empty line of output.
pub fn first_line(session: &dyn Session, cmd: &str, tier: Timeout) -> Result<String, ExecError> {
    Ok(RemoteCommand::new(session, cmd)
        .read_timeout(session.properties().timeout(tier))
        .capture()?
        .first_line())
}

/// One command, ready to run against a session.
pub struct RemoteCommand<'a> {
    session: &'a dyn Session,
    cmd: String,
    env: Option<HashMap<String, String>>,
    dir: Option<String>,
    read_timeout: Duration,
    retries: Option<u32>,
}

enum Failure {
    Hang(io::Error),
    Integrity(SessionError),
    Fatal(ExecError),
}

impl<'a> RemoteCommand<'a> {
    pub fn new(session: &'a dyn Session, cmd: impl Into<String>) -> Self {
        let read_timeout = session.properties().timeout(Timeout::Medium);
        Self {
            session,
            cmd: cmd.into(),
            env: None,
            dir: None,
            read_timeout,
            retries: None,
        }
    }

    /// Environment overrides applied to this command only.
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Working directory for the command.
    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Maximum time the command may go without producing a byte of output.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Override the session's configured retry count.
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Run to completion, streaming output through `out` and the error
    /// stream through `err` (or a warn-logging drain when `None`).
    pub fn stream(
        &self,
        out: &mut dyn ReaderHandler,
        mut err: Option<&mut dyn ReaderHandler>,
    ) -> Result<Option<i32>, ExecError> {
        let retries = self
            .retries
            .unwrap_or_else(|| self.session.properties().exec_retries());
        let max_attempts = retries.saturating_add(1);
        let mut attempt = 1u32;
        loop {
            let err_attempt: Option<&mut dyn ReaderHandler> = match err {
                Some(ref mut h) => Some(&mut **h),
                None => None,
            };
            match self.run_once(out, err_attempt) {
                Ok(code) => return Ok(code),
                Err(Failure::Hang(source)) => {
                    if attempt >= max_attempts {
                        return Err(ExecError::Hung {
                            cmd: self.cmd.clone(),
                            attempts: attempt,
                            source,
                        });
                    }
                    tracing::info!(cmd = %self.cmd, attempt, "command hung, restarting");
                }
                Err(Failure::Integrity(source)) => {
                    if attempt >= max_attempts {
                        return Err(ExecError::Integrity {
                            cmd: self.cmd.clone(),
                            attempts: attempt,
                            source,
                        });
                    }
                    tracing::warn!(
                        cmd = %self.cmd,
                        attempt,
                        error = %source,
                        "session integrity failure, reconnecting"
                    );
                    self.session.disconnect();
                }
                Err(Failure::Fatal(e)) => return Err(e),
            }
            attempt += 1;
        }
    }

    /// Run to completion, capturing both streams into memory (bounded by
    /// the session's `process.maxbuflen`).
    pub fn capture(&self) -> Result<ExecOutput, ExecError> {
        let max = self.session.properties().process_maxbuflen();
        let mut out = BufferHandler::new(max);
        let mut err = BufferHandler::new(max);
        let exit_code = self.stream(&mut out, Some(&mut err))?;
        Ok(ExecOutput {
            cmd: self.cmd.clone(),
            exit_code,
            stdout: out.take(),
            stderr: err.take(),
        })
    }

    fn run_once(
        &self,
        out: &mut dyn ReaderHandler,
        err: Option<&mut dyn ReaderHandler>,
    ) -> Result<Option<i32>, Failure> {
        if !self.session.is_connected() {
            self.session
                .connect()
                .map_err(|e| Failure::Fatal(ExecError::Session(e)))?;
        }
        let mut process = self
            .session
            .start_process(&self.cmd, self.env.as_ref(), self.dir.as_deref())
            .map_err(classify_session)?;
        let stdout = match process.take_stdout() {
            Some(s) => s,
            None => {
                process.destroy();
                return Err(Failure::Fatal(ExecError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "process exposed no output stream",
                ))));
            }
        };
        let stderr = process.take_stderr();
        let drain_deadline = self.session.properties().timeout(Timeout::ExtraLarge);
        let wait_deadline = self.session.properties().timeout(Timeout::Small);

        let (out_result, wait_result) = std::thread::scope(|scope| {
            let err_worker = stderr.map(|stream| {
                let mut reader = PerishableReader::new(stream, drain_deadline);
                let closer = reader.closer();
                let handler = err;
                let join = scope.spawn(move || {
                    let result = match handler {
                        Some(h) => h.handle(&mut reader),
                        None => drain_logging(&mut reader),
                    };
                    if let Err(e) = result {
                        if !reader.is_closed() {
                            tracing::warn!(error = %e, "error-stream drain failed");
                        }
                    }
                });
                (closer, join)
            });

            let mut reader = PerishableReader::new(stdout, self.read_timeout);
            let out_result = out.handle(&mut reader);
            reader.close();

            let wait_result = match &out_result {
                Ok(()) => process.wait_for(wait_deadline),
                Err(_) => Ok(None),
            };
            if let Some((closer, join)) = err_worker {
                closer.close();
                let _ = join.join();
            }
            (out_result, wait_result)
        });

        match out_result {
            Ok(()) => match wait_result {
                Ok(code) => {
                    if process.is_running() {
                        process.destroy();
                    }
                    Ok(code)
                }
                Err(e) => {
                    process.destroy();
                    Err(classify_session(e))
                }
            },
            Err(e) => {
                // The process has hung up (or the channel broke); kill it so
                // the retry starts clean.
                process.destroy();
                Err(classify_io(e))
            }
        }
    }
}

fn classify_io(e: io::Error) -> Failure {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof => Failure::Hang(e),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => Failure::Integrity(SessionError::Disconnected(e.to_string())),
        _ => Failure::Fatal(ExecError::Io(e)),
    }
}

fn classify_session(e: SessionError) -> Failure {
    match e {
        SessionError::Disconnected(_) | SessionError::NotConnected => Failure::Integrity(e),
        SessionError::Io(inner) => classify_io(inner),
        other => Failure::Fatal(ExecError::Session(other)),
    }
}

/// Default error-stream consumer: drain, warn-log non-empty lines.
fn drain_logging(reader: &mut PerishableReader) -> io::Result<()> {
    while let Some(line) = reader.read_line()? {
        if !line.is_empty() {
            tracing::warn!(stderr = %line, "command error output");
        }
    }
    Ok(())
}

/// A handler that buffers stream data up to a byte bound; data past the
/// bound is drained and discarded so the process never blocks on a full
/// pipe.
struct BufferHandler {
    buf: Vec<u8>,
    max: usize,
}

impl BufferHandler {
    fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
        }
    }

    fn take(self) -> Vec<u8> {
        self.buf
    }
}

impl ReaderHandler for BufferHandler {
    fn handle(&mut self, reader: &mut PerishableReader) -> io::Result<()> {
        // Re-initialize: on a retry, output from the failed attempt is gone.
        self.buf.clear();
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                return Ok(());
            }
            let room = self.max.saturating_sub(self.buf.len());
            let kept = n.min(room);
            if kept > 0 {
                self.buf.extend_from_slice(&chunk[..kept]);
            } else {
                tracing::debug!("output buffer full, discarding excess");
            }
        }
    }
}
