//! Pooled PowerShell interpreters over a session channel.
//!
//! A [`Runspace`] is one long-lived `powershell -File -` process driven
//! through its stdin, reused across many invocations to amortize the
//! interpreter's startup cost. Invocations are framed with a marker line so
//! output can be read back without depending on prompt heuristics; errors
//! are drained from stderr by a background thread and surfaced after the
//! frame completes.
//!
//! The [`RunspacePool`] hands out runspaces by bit-width view under a
//! per-slot reservation: a caller gets an idle matching slot or a freshly
//! spawned one, and exceeding the pool capacity is a hard error rather
//! than a queueing wait.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::Timeout;
use crate::errors::RunspaceError;
use crate::io::PerishableReader;
use crate::session::{Session, SessionProcess};

/// Command that starts the interpreter reading statements from stdin.
const INIT_COMMAND: &str = "powershell -NoProfile -File -";

/// PowerShell support module loaded into every runspace at spawn.
const SUPPORT_MODULE: &str = include_str!("support.psm1");

/// Bit-width view of the interpreter process.
///
/// On 64-bit hosts a 32-bit view sees the SysWOW64 registry/filesystem
/// redirections, which matters when inspecting 32-bit software.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Bits32,
    Bits64,
}

/// Detect the native bit-width of the session host from its environment.
pub(crate) fn native_view(session: &dyn Session) -> View {
    match session.getenv("PROCESSOR_ARCHITECTURE") {
        Some(arch) if arch.eq_ignore_ascii_case("x86") => {
            // A 32-bit process on a 64-bit host exposes the real
            // architecture through PROCESSOR_ARCHITEW6432.
            if session.getenv("PROCESSOR_ARCHITEW6432").is_some() {
                View::Bits64
            } else {
                View::Bits32
            }
        }
        _ => View::Bits64,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct RunspaceInner {
    process: Box<dyn SessionProcess>,
    stdin: Box<dyn Write + Send>,
    stdout: PerishableReader,
    /// Digests of modules already loaded into this interpreter.
    modules: HashSet<u64>,
}

/// One live scripting interpreter.
pub struct Runspace {
    id: String,
    view: View,
    inner: Mutex<RunspaceInner>,
    /// Error-stream lines drained by the background thread.
    errors: Arc<Mutex<Vec<String>>>,
    busy: AtomicBool,
    marker_seq: AtomicU64,
    default_timeout: Duration,
}

impl Runspace {
    fn spawn(session: &dyn Session, view: View) -> Result<Arc<Self>, RunspaceError> {
        let cmd = if view == View::Bits32 && native_view(session) == View::Bits64 {
            format!("%SystemRoot%\\SysWOW64\\cmd.exe /c {INIT_COMMAND}")
        } else {
            INIT_COMMAND.to_string()
        };
        let mut process = session.start_process(&cmd, None, None)?;
        let stdin = process
            .take_stdin()
            .ok_or_else(|| RunspaceError::Failed("interpreter has no input stream".into()))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| RunspaceError::Failed("interpreter has no output stream".into()))?;
        let stderr = process.take_stderr();

        let errors = Arc::new(Mutex::new(Vec::new()));
        if let Some(stream) = stderr {
            let sink = errors.clone();
            let deadline = session.properties().timeout(Timeout::ExtraLarge);
            std::thread::Builder::new()
                .name("shellfs-runspace-err".to_string())
                .spawn(move || {
                    let mut reader = PerishableReader::new(stream, deadline);
                    while let Ok(Some(line)) = reader.read_line() {
                        if !line.trim().is_empty() {
                            lock(&sink).push(line);
                        }
                    }
                })
                .map_err(|e| RunspaceError::Failed(format!("stderr drain spawn: {e}")))?;
        }

        let default_timeout = session.properties().timeout(Timeout::Medium);
        let runspace = Arc::new(Runspace {
            id: uuid::Uuid::new_v4().to_string(),
            view,
            inner: Mutex::new(RunspaceInner {
                process,
                stdin,
                stdout: PerishableReader::new(stdout, default_timeout),
                modules: HashSet::new(),
            }),
            errors,
            busy: AtomicBool::new(false),
            marker_seq: AtomicU64::new(0),
            default_timeout,
        });
        tracing::debug!(id = %runspace.id, ?view, "runspace spawned");

        // Widen the host buffer so long pipelines do not wrap, then load
        // the support cmdlets.
        runspace.invoke(
            "$host.UI.RawUI.BufferSize = New-Object System.Management.Automation.Host.Size(512,2000)",
        )?;
        runspace.load_module(SUPPORT_MODULE)?;
        Ok(runspace)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// Run one statement and return everything it printed before the frame
    /// marker, with the default invocation timeout.
    pub fn invoke(&self, command: &str) -> Result<String, RunspaceError> {
        self.invoke_timeout(command, self.default_timeout)
    }

    /// Run one statement with an explicit output deadline.
    pub fn invoke_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, RunspaceError> {
        let mut inner = lock(&self.inner);
        if !inner.process.is_running() {
            return Err(RunspaceError::Stopped(inner.process.exit_code()));
        }
        tracing::debug!(id = %self.id, command, "runspace invoke");

        let marker = format!(
            "#shellfs:{}:{}#",
            self.id,
            self.marker_seq.fetch_add(1, Ordering::Relaxed)
        );
        inner.stdin.write_all(command.trim().as_bytes())?;
        inner.stdin.write_all(b"\r\n")?;
        inner
            .stdin
            .write_all(format!("Write-Output '{marker}'\r\n").as_bytes())?;
        inner.stdin.flush()?;

        inner.stdout.set_deadline(timeout);
        let mut output: Vec<String> = Vec::new();
        loop {
            match inner.stdout.read_line() {
                Ok(Some(line)) => {
                    let trimmed = line.trim_end();
                    if trimmed == marker {
                        break;
                    }
                    if is_prompt(trimmed) {
                        continue;
                    }
                    output.push(trimmed.to_string());
                }
                Ok(None) => return Err(RunspaceError::Stopped(inner.process.exit_code())),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(RunspaceError::Timeout(command.to_string()));
                }
                Err(e) => return Err(RunspaceError::Io(e)),
            }
        }

        let errors = std::mem::take(&mut *lock(&self.errors));
        if !errors.is_empty() {
            return Err(RunspaceError::Failed(errors.join("\n")));
        }
        Ok(output.join("\r\n"))
    }

    /// Load a module source into the interpreter, once per content digest.
    pub fn load_module(&self, source: &str) -> Result<(), RunspaceError> {
        let digest = {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            source.hash(&mut hasher);
            hasher.finish()
        };
        {
            let inner = lock(&self.inner);
            if inner.modules.contains(&digest) {
                tracing::debug!(id = %self.id, digest, "module already loaded");
                return Ok(());
            }
        }
        // Feed the module as one invocation; PowerShell absorbs the
        // function definitions silently.
        self.invoke(source)?;
        lock(&self.inner).modules.insert(digest);
        Ok(())
    }

    fn shutdown(&self) {
        let _ = self.invoke_timeout("exit", Duration::from_secs(2));
        let mut inner = lock(&self.inner);
        if inner.process.is_running() {
            inner.process.destroy();
        }
        tracing::debug!(id = %self.id, "runspace stopped");
    }
}

/// Interactive hosts echo `PS C:\...>` prompts when stdin is a pipe on
/// some OS builds; those lines are framing noise, not output.
fn is_prompt(line: &str) -> bool {
    line.starts_with("PS ") && line.trim_end().ends_with('>')
}

/// Exclusive reservation of one pool slot.
pub struct RunspaceLease {
    runspace: Arc<Runspace>,
}

impl Deref for RunspaceLease {
    type Target = Runspace;

    fn deref(&self) -> &Runspace {
        &self.runspace
    }
}

impl Drop for RunspaceLease {
    fn drop(&mut self) {
        self.runspace.busy.store(false, Ordering::SeqCst);
    }
}

/// Fixed-capacity pool of interpreters, keyed by bit-width view.
pub struct RunspacePool {
    session: Arc<dyn Session>,
    capacity: usize,
    slots: Mutex<Vec<Arc<Runspace>>>,
}

impl RunspacePool {
    pub fn new(session: Arc<dyn Session>, capacity: usize) -> Self {
        Self {
            session,
            capacity,
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve an idle interpreter of the requested view, spawning one if
    /// the pool has room. At capacity with no idle slot this fails hard.
    pub fn acquire(&self, view: View) -> Result<RunspaceLease, RunspaceError> {
        let mut slots = lock(&self.slots);
        for slot in slots.iter() {
            if slot.view() == view && !slot.busy.swap(true, Ordering::SeqCst) {
                return Ok(RunspaceLease {
                    runspace: slot.clone(),
                });
            }
        }
        if slots.len() >= self.capacity {
            return Err(RunspaceError::AtCapacity(self.capacity));
        }
        let runspace = Runspace::spawn(&*self.session, view)?;
        runspace.busy.store(true, Ordering::SeqCst);
        slots.push(runspace.clone());
        Ok(RunspaceLease { runspace })
    }

    /// Stop every interpreter in the pool.
    pub fn shutdown(&self) {
        let slots = std::mem::take(&mut *lock(&self.slots));
        for runspace in slots {
            runspace.shutdown();
        }
    }
}

impl Drop for RunspacePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lines_are_recognized() {
        assert!(is_prompt("PS C:\\Users\\admin>"));
        assert!(is_prompt("PS C:\\> "));
        assert!(!is_prompt("Path: C:\\Windows"));
        assert!(!is_prompt("PSComputerName"));
    }
}
