//! SSH-backed session (feature `ssh`).
//!
//! Commands run over `ssh2` exec channels, which expose blocking byte
//! streams and an exit status, which is exactly the shape [`SessionProcess`]
//! wants. Extended (stderr) data is merged into the main stream because
//! stream splitting is not reliable across servers; the executor handles a
//! `None` error stream.
//!
//! The libssh2 session timeout is set to a short tick so blocking channel
//! operations return periodically; readers use those ticks to observe the
//! kill flag without holding the channel lock across a blocked read.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::Properties;
use crate::errors::SessionError;
use crate::session::{OsFlavor, Session, SessionProcess};

/// Tick applied to all blocking libssh2 operations, in milliseconds.
const SESSION_TICK_MS: u32 = 500;

/// How an SSH session authenticates.
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

/// Connection parameters for an SSH session.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ConnState {
    session: ssh2::Session,
    env: HashMap<String, String>,
    flavor: OsFlavor,
}

/// A [`Session`] over an established SSH connection.
pub struct SshSession {
    config: SshConfig,
    props: Properties,
    workspace: Option<PathBuf>,
    state: Mutex<Option<ConnState>>,
}

impl SshSession {
    pub fn new(config: SshConfig, props: Properties) -> Self {
        Self {
            config,
            props,
            workspace: None,
            state: Mutex::new(None),
        }
    }

    /// Set the local scratch directory (enables the persistent cache).
    pub fn with_workspace(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace = Some(dir.into());
        self
    }

    fn open_session(&self) -> Result<ssh2::Session, SessionError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let tcp = TcpStream::connect(&addr)
            .map_err(|e| SessionError::Disconnected(format!("connect {addr}: {e}")))?;
        let mut session = ssh2::Session::new()
            .map_err(|e| SessionError::Disconnected(format!("session init: {e}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| SessionError::Disconnected(format!("handshake: {e}")))?;

        match &self.config.auth {
            SshAuth::Password(password) => session
                .userauth_password(&self.config.username, password)
                .map_err(|e| SessionError::Disconnected(format!("password auth: {e}")))?,
            SshAuth::Key { path, passphrase } => session
                .userauth_pubkey_file(
                    &self.config.username,
                    None,
                    path,
                    passphrase.as_deref(),
                )
                .map_err(|e| SessionError::Disconnected(format!("key auth: {e}")))?,
            SshAuth::Agent => session
                .userauth_agent(&self.config.username)
                .map_err(|e| SessionError::Disconnected(format!("agent auth: {e}")))?,
        }
        if !session.authenticated() {
            return Err(SessionError::Disconnected("authentication failed".into()));
        }
        session.set_timeout(SESSION_TICK_MS);
        Ok(session)
    }

    /// Run a short probe command on a fresh channel and capture its output.
    fn probe(session: &ssh2::Session, cmd: &str) -> Result<String, SessionError> {
        let mut channel = session
            .channel_session()
            .map_err(|e| SessionError::Disconnected(e.to_string()))?;
        channel
            .exec(cmd)
            .map_err(|e| SessionError::Disconnected(e.to_string()))?;
        let mut output = String::new();
        let deadline = Instant::now() + Duration::from_secs(30);
        let mut buf = [0u8; 4096];
        loop {
            match channel.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                Err(e) => return Err(SessionError::Io(e)),
            }
        }
        let _ = channel.wait_close();
        Ok(output)
    }
}

impl Session for SshSession {
    fn os_flavor(&self) -> OsFlavor {
        lock(&self.state)
            .as_ref()
            .map(|st| st.flavor)
            .unwrap_or(OsFlavor::Linux)
    }

    fn hostname(&self) -> &str {
        &self.config.host
    }

    fn properties(&self) -> &Properties {
        &self.props
    }

    fn getenv(&self, name: &str) -> Option<String> {
        lock(&self.state)
            .as_ref()
            .and_then(|st| st.env.get(name).cloned())
    }

    fn workspace(&self) -> Option<&Path> {
        self.workspace.as_deref()
    }

    fn is_connected(&self) -> bool {
        lock(&self.state).is_some()
    }

    fn connect(&self) -> Result<(), SessionError> {
        let mut state = lock(&self.state);
        if state.is_some() {
            return Ok(());
        }
        let session = self.open_session()?;

        let flavor = match Self::probe(&session, "uname -s") {
            Ok(name) => match name.trim() {
                "Darwin" => OsFlavor::MacOs,
                "SunOS" => OsFlavor::Solaris,
                _ => OsFlavor::Linux,
            },
            Err(e) => {
                tracing::warn!(error = %e, "flavor probe failed, assuming Linux");
                OsFlavor::Linux
            }
        };
        let env = match Self::probe(&session, "env") {
            Ok(text) => text
                .lines()
                .filter_map(|line| {
                    let (key, value) = line.split_once('=')?;
                    Some((key.to_string(), value.to_string()))
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "environment probe failed");
                HashMap::new()
            }
        };
        tracing::debug!(host = %self.config.host, ?flavor, "session connected");
        *state = Some(ConnState {
            session,
            env,
            flavor,
        });
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = lock(&self.state);
        if let Some(st) = state.take() {
            let _ = st
                .session
                .disconnect(None, "session closed", None);
            tracing::debug!(host = %self.config.host, "session disconnected");
        }
    }

    fn start_process(
        &self,
        cmd: &str,
        env: Option<&HashMap<String, String>>,
        dir: Option<&str>,
    ) -> Result<Box<dyn SessionProcess>, SessionError> {
        let state = lock(&self.state);
        let st = state.as_ref().ok_or(SessionError::NotConnected)?;
        let mut channel = st
            .session
            .channel_session()
            .map_err(|e| SessionError::Disconnected(e.to_string()))?;
        // Servers commonly reject setenv requests; stderr splitting is
        // equally unreliable. Merge extended data and synthesize env/cwd
        // into the command line instead.
        channel
            .handle_extended_data(ssh2::ExtendedData::Merge)
            .map_err(|e| SessionError::Disconnected(e.to_string()))?;
        let full = build_command(cmd, env, dir);
        channel
            .exec(&full)
            .map_err(|e| SessionError::SpawnFailed(format!("{cmd}: {e}")))?;
        let killed = Arc::new(AtomicBool::new(false));
        Ok(Box::new(SshProcess {
            channel: Arc::new(Mutex::new(channel)),
            killed,
            code: None,
            stdout_taken: false,
            stdin_taken: false,
        }))
    }
}

/// Synthesize working directory and environment overrides into the command
/// line.
fn build_command(cmd: &str, env: Option<&HashMap<String, String>>, dir: Option<&str>) -> String {
    let mut full = String::new();
    if let Some(env) = env {
        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            full.push_str(&format!("export {key}='{}'; ", env[key].replace('\'', "'\\''")));
        }
    }
    if let Some(dir) = dir {
        full.push_str(&format!("cd '{}' && ", dir.replace('\'', "'\\''")));
    }
    full.push_str(cmd);
    full
}

struct SshProcess {
    channel: Arc<Mutex<ssh2::Channel>>,
    killed: Arc<AtomicBool>,
    code: Option<i32>,
    stdout_taken: bool,
    stdin_taken: bool,
}

impl SessionProcess for SshProcess {
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        if self.stdout_taken {
            return None;
        }
        self.stdout_taken = true;
        Some(Box::new(ChannelStream {
            channel: self.channel.clone(),
            killed: self.killed.clone(),
        }))
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        // Extended data is merged into the main stream.
        None
    }

    fn take_stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        if self.stdin_taken {
            return None;
        }
        self.stdin_taken = true;
        Some(Box::new(ChannelWriter {
            channel: self.channel.clone(),
        }))
    }

    fn wait_for(&mut self, timeout: Duration) -> Result<Option<i32>, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut channel = lock(&self.channel);
                if channel.eof() {
                    let _ = channel.wait_close();
                    self.code = channel.exit_status().ok();
                    return Ok(self.code);
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn exit_code(&mut self) -> Option<i32> {
        self.code
    }

    fn is_running(&mut self) -> bool {
        !lock(&self.channel).eof()
    }

    fn destroy(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
        let mut channel = lock(&self.channel);
        let _ = channel.close();
    }
}

/// Reader over the channel's merged output stream.
struct ChannelStream {
    channel: Arc<Mutex<ssh2::Channel>>,
    killed: Arc<AtomicBool>,
}

impl Read for ChannelStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.killed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            let result = lock(&self.channel).read(buf);
            match result {
                Ok(n) => return Ok(n),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    // Session tick elapsed with no data; check the kill
                    // flag and go around.
                }
                Err(e) => {
                    if self.killed.load(Ordering::SeqCst) {
                        return Ok(0);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Writer over the channel's input stream.
struct ChannelWriter {
    channel: Arc<Mutex<ssh2::Channel>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.channel).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        lock(&self.channel).flush()
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        let _ = lock(&self.channel).send_eof();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_plain() {
        assert_eq!(build_command("ls -la", None, None), "ls -la");
    }

    #[test]
    fn build_command_with_dir_and_env() {
        let mut env = HashMap::new();
        env.insert("LC_ALL".to_string(), "C".to_string());
        let full = build_command("find . -type f", Some(&env), Some("/var/log"));
        assert_eq!(
            full,
            "export LC_ALL='C'; cd '/var/log' && find . -type f"
        );
    }

    #[test]
    fn build_command_escapes_single_quotes() {
        let full = build_command("true", None, Some("/tmp/it's"));
        assert_eq!(full, "cd '/tmp/it'\\''s' && true");
    }

    #[test]
    fn env_exports_are_deterministically_ordered() {
        let mut env = HashMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        let full = build_command("true", Some(&env), None);
        assert_eq!(full, "export A='1'; export B='2'; true");
    }
}
