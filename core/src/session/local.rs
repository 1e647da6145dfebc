//! Local command-interpreter session.
//!
//! Runs commands through the local shell (`sh -c` on Unix, `powershell
//! -Command` on Windows). Useful on its own for scanning the local host and
//! as the reference [`Session`] implementation for integration tests: every
//! higher layer treats it exactly like a remote channel.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::Properties;
use crate::errors::SessionError;
use crate::session::{OsFlavor, Session, SessionProcess};

/// A session attached to the local host.
pub struct LocalSession {
    hostname: String,
    props: Properties,
    env: HashMap<String, String>,
    workspace: Option<PathBuf>,
    connected: AtomicBool,
}

impl LocalSession {
    pub fn new() -> Self {
        Self::with_properties(Properties::new())
    }

    pub fn with_properties(props: Properties) -> Self {
        Self {
            hostname: "localhost".to_string(),
            props,
            env: std::env::vars().collect(),
            workspace: None,
            connected: AtomicBool::new(true),
        }
    }

    /// Set the local scratch directory (enables the persistent cache).
    pub fn with_workspace(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace = Some(dir.into());
        self
    }
}

impl Default for LocalSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Session for LocalSession {
    fn os_flavor(&self) -> OsFlavor {
        if cfg!(target_os = "windows") {
            OsFlavor::Windows
        } else if cfg!(target_os = "macos") {
            OsFlavor::MacOs
        } else if cfg!(target_os = "solaris") {
            OsFlavor::Solaris
        } else {
            OsFlavor::Linux
        }
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn properties(&self) -> &Properties {
        &self.props
    }

    fn getenv(&self, name: &str) -> Option<String> {
        self.env.get(name).cloned()
    }

    fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connect(&self) -> Result<(), SessionError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn start_process(
        &self,
        cmd: &str,
        env: Option<&HashMap<String, String>>,
        dir: Option<&str>,
    ) -> Result<Box<dyn SessionProcess>, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("powershell");
            c.arg("-NoProfile").arg("-Command").arg(cmd);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg("-c").arg(cmd);
            c
        };
        if let Some(env) = env {
            command.envs(env);
        }
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SessionError::SpawnFailed(format!("{cmd}: {e}")))?;
        Ok(Box::new(LocalProcess { child, code: None }))
    }
}

/// One spawned local shell command.
struct LocalProcess {
    child: Child,
    code: Option<i32>,
}

impl SessionProcess for LocalProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.child
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn Write + Send>)
    }

    fn wait_for(&mut self, timeout: Duration) -> Result<Option<i32>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.code = status.code();
                    return Ok(self.code);
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        // Exit code stays unknown; not an error.
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
    }

    fn exit_code(&mut self) -> Option<i32> {
        if self.code.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.code = status.code();
            }
        }
        self.code
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn destroy(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    #[test]
    fn echo_round_trip() {
        let session = LocalSession::new();
        let mut p = session.start_process("echo hello", None, None).unwrap();
        let mut out = String::new();
        p.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out.trim(), "hello");
        assert_eq!(p.wait_for(Duration::from_secs(5)).unwrap(), Some(0));
    }

    #[test]
    fn env_overrides_apply() {
        let session = LocalSession::new();
        let mut env = HashMap::new();
        env.insert("SHELLFS_TEST_VAR".to_string(), "42".to_string());
        let mut p = session
            .start_process("echo $SHELLFS_TEST_VAR", Some(&env), None)
            .unwrap();
        let mut out = String::new();
        p.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out.trim(), "42");
    }

    #[test]
    fn working_directory_applies() {
        let dir = tempfile::tempdir().unwrap();
        let session = LocalSession::new();
        let mut p = session
            .start_process("pwd", None, Some(dir.path().to_str().unwrap()))
            .unwrap();
        let mut out = String::new();
        p.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        // Compare canonicalized paths; the tempdir may sit behind a symlink.
        let reported = std::fs::canonicalize(out.trim()).unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(reported, expected);
    }

    #[test]
    fn destroy_kills_the_process() {
        let session = LocalSession::new();
        let mut p = session.start_process("sleep 30", None, None).unwrap();
        assert!(p.is_running());
        p.destroy();
        assert!(!p.is_running());
    }

    #[test]
    fn wait_for_times_out_without_error() {
        let session = LocalSession::new();
        let mut p = session.start_process("sleep 30", None, None).unwrap();
        let code = p.wait_for(Duration::from_millis(50)).unwrap();
        assert_eq!(code, None);
        p.destroy();
    }

    #[test]
    fn nonzero_exit_code_reported() {
        let session = LocalSession::new();
        let mut p = session.start_process("exit 3", None, None).unwrap();
        assert_eq!(p.wait_for(Duration::from_secs(5)).unwrap(), Some(3));
    }

    #[test]
    fn disconnected_session_rejects_commands() {
        let session = LocalSession::new();
        session.disconnect();
        assert!(session.start_process("true", None, None).is_err());
        session.connect().unwrap();
        assert!(session.start_process("true", None, None).is_ok());
    }
}
