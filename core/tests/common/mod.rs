//! Shared test doubles: scripted sessions that stand in for a live
//! command channel and record every command they are asked to run.

// Each integration test is compiled as its own crate, so not every test file
// uses every helper from this shared module. Suppress dead_code warnings.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shellfs_core::config::Properties;
use shellfs_core::errors::SessionError;
use shellfs_core::session::{OsFlavor, Session, SessionProcess};

/// A canned reply: any command containing `pattern` gets `stdout`.
pub struct Reply {
    pub pattern: &'static str,
    pub stdout: Vec<u8>,
}

/// Session double that answers commands from a script and records them.
pub struct ScriptedSession {
    props: Properties,
    flavor: OsFlavor,
    replies: Mutex<Vec<Reply>>,
    pub commands: Arc<Mutex<Vec<String>>>,
    connected: AtomicBool,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    /// When set, every process produces a stream that never yields data.
    hang: bool,
    /// When set, every spawn fails with a channel-integrity error.
    broken: bool,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self {
            props: Properties::new(),
            flavor: OsFlavor::Linux,
            replies: Mutex::new(Vec::new()),
            commands: Arc::new(Mutex::new(Vec::new())),
            connected: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            hang: false,
            broken: false,
        }
    }

    /// Every command hangs (produces no output bytes, ever).
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new()
        }
    }

    /// Every spawn reports a channel-integrity failure.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::new()
        }
    }

    pub fn reply(self, pattern: &'static str, stdout: impl Into<Vec<u8>>) -> Self {
        self.replies.lock().unwrap().push(Reply {
            pattern,
            stdout: stdout.into(),
        });
        self
    }

    pub fn command_count(&self, containing: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(containing))
            .count()
    }
}

impl Session for ScriptedSession {
    fn os_flavor(&self) -> OsFlavor {
        self.flavor
    }

    fn hostname(&self) -> &str {
        "scripted"
    }

    fn properties(&self) -> &Properties {
        &self.props
    }

    fn getenv(&self, _name: &str) -> Option<String> {
        None
    }

    fn workspace(&self) -> Option<&Path> {
        None
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn connect(&self) -> Result<(), SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn start_process(
        &self,
        cmd: &str,
        _env: Option<&HashMap<String, String>>,
        _dir: Option<&str>,
    ) -> Result<Box<dyn SessionProcess>, SessionError> {
        self.commands.lock().unwrap().push(cmd.to_string());
        if self.broken {
            return Err(SessionError::Disconnected("scripted break".into()));
        }
        if self.hang {
            return Ok(Box::new(ScriptedProcess {
                stdout: Some(Box::new(Silent)),
                alive: true,
            }));
        }
        let stdout = self
            .replies
            .lock()
            .unwrap()
            .iter()
            .find(|r| cmd.contains(r.pattern))
            .map(|r| r.stdout.clone())
            .unwrap_or_default();
        Ok(Box::new(ScriptedProcess {
            stdout: Some(Box::new(Cursor::new(stdout))),
            alive: true,
        }))
    }
}

/// A stream that never produces data and never returns.
struct Silent;

impl Read for Silent {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            std::thread::sleep(Duration::from_secs(60));
        }
    }
}

struct ScriptedProcess {
    stdout: Option<Box<dyn Read + Send>>,
    alive: bool,
}

impl SessionProcess for ScriptedProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdout.take()
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        None
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        None
    }

    fn wait_for(&mut self, _timeout: Duration) -> Result<Option<i32>, SessionError> {
        self.alive = false;
        Ok(Some(0))
    }

    fn exit_code(&mut self) -> Option<i32> {
        if self.alive {
            None
        } else {
            Some(0)
        }
    }

    fn is_running(&mut self) -> bool {
        self.alive
    }

    fn destroy(&mut self) {
        self.alive = false;
    }
}

/// Build one NUL-delimited Linux metadata record for a regular file.
pub fn linux_file_record(path: &str, size: u64) -> String {
    format!("-rw-r--r--\x000\x000\x00{size}\x001700000000.0\x001700000000.0\x001700000000.0\x00{path}\x00\n")
}
