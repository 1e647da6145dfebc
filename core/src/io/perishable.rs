//! Deadline-enforced blocking reader for command output streams.
//!
//! A [`PerishableReader`] wraps the byte stream of a running remote command.
//! Reads block until data arrives, but never past the configured deadline:
//! a task registered with the shared [`timer`](super::timer) forcibly wakes
//! the blocked reader and marks it expired. Every successful read re-arms
//! the deadline, so a *slow* stream survives indefinitely while a *silent*
//! one is cut off.
//!
//! The underlying stream is drained by a dedicated pump thread, which is
//! what makes `close()` safe to call from any thread: terminal state is
//! flipped under the shared lock and the blocked consumer is notified, even
//! though the pump itself may stay parked in a kernel read until the process
//! is killed and its pipe collapses.
//!
//! Terminal states are sticky. Once closed, end-of-stream or expired, every
//! further read fails (or reports EOF) deterministically.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::timer::{self, TimerTask};

/// Pump threads stop pulling once this many bytes are buffered ahead of the
/// consumer, so a slow consumer cannot balloon memory.
const HIGH_WATER: usize = 256 * 1024;

/// Deadline applied when a caller passes a zero duration.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(3600);

static READER_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    /// The peer closed the stream.
    Eof,
    /// `close()` was called.
    Closed,
    /// The deadline fired with no data.
    Expired,
}

struct Inner {
    buf: VecDeque<u8>,
    state: StreamState,
    /// Error reported by the underlying stream, replayed to the consumer.
    error: Option<(io::ErrorKind, String)>,
    /// True while a consumer is parked in a deadline wait; the expiry task
    /// checks it so a deadline that pops after the read completed is a no-op.
    wait_active: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    cond: Condvar,
}

fn lock(shared: &Shared) -> MutexGuard<'_, Inner> {
    shared
        .inner
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A blocking reader that becomes unusable after a bounded idle period.
pub struct PerishableReader {
    shared: Arc<Shared>,
    deadline: Duration,
    replay: Replay,
    eof_seen: bool,
}

impl PerishableReader {
    /// Wrap `stream`, enforcing `deadline` on every blocking read. A zero
    /// deadline falls back to one hour.
    pub fn new(stream: Box<dyn Read + Send>, deadline: Duration) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                buf: VecDeque::new(),
                state: StreamState::Open,
                error: None,
                wait_active: false,
            }),
            cond: Condvar::new(),
        });
        let pump_shared = shared.clone();
        let name = format!(
            "shellfs-reader-{}",
            READER_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        if let Err(e) = std::thread::Builder::new()
            .name(name)
            .spawn(move || pump(stream, pump_shared))
        {
            // Without a pump the stream can never produce data; expose that
            // as an immediate error state rather than a silent hang.
            let mut guard = lock(&shared);
            guard.error = Some((io::ErrorKind::Other, format!("pump spawn failed: {e}")));
            drop(guard);
        }
        Self {
            shared,
            deadline: effective(deadline),
            replay: Replay::new(),
            eof_seen: false,
        }
    }

    /// (Re-)arm the deadline used by subsequent reads.
    pub fn set_deadline(&mut self, deadline: Duration) {
        self.deadline = effective(deadline);
    }

    /// Record a rewind point. Bytes consumed from here on are replayable via
    /// [`reset`](Self::reset) as long as no more than `limit` bytes pass.
    pub fn mark(&mut self, limit: usize) {
        self.replay.mark(limit);
    }

    /// Rewind to the last [`mark`](Self::mark). Fails if there is no active
    /// mark or more than its limit was consumed since.
    pub fn reset(&mut self) -> io::Result<()> {
        self.replay.reset()
    }

    /// Flip the reader into its closed state and wake any blocked read.
    pub fn close(&self) {
        let mut guard = lock(&self.shared);
        if guard.state == StreamState::Open {
            guard.state = StreamState::Closed;
        }
        self.shared.cond.notify_all();
    }

    /// A detached handle that can close this reader from another thread
    /// while this one is parked in a blocking read.
    pub fn closer(&self) -> PerishableCloser {
        PerishableCloser {
            shared: self.shared.clone(),
        }
    }

    pub fn is_expired(&self) -> bool {
        lock(&self.shared).state == StreamState::Expired
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared).state == StreamState::Closed
    }

    /// True once a read has observed end-of-stream.
    pub fn is_eof(&self) -> bool {
        self.eof_seen
    }

    /// Read one line, tolerating both `\n` and `\r\n` endings (a lone `\r`
    /// is probed with a one-byte mark/reset). Returns `None` at end of
    /// stream with no pending bytes.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = self.read(&mut byte)?;
            if n == 0 {
                if buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
            }
            match byte[0] {
                b'\n' => return Ok(Some(String::from_utf8_lossy(&buf).into_owned())),
                b'\r' => {
                    self.mark(1);
                    let mut peek = [0u8; 1];
                    let n = self.read(&mut peek)?;
                    if n == 1 && peek[0] != b'\n' {
                        self.reset()?;
                    }
                    return Ok(Some(String::from_utf8_lossy(&buf).into_owned()));
                }
                b => buf.push(b),
            }
        }
    }

    fn blocking_read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if let Some(n) = self.replay.serve(out) {
            return Ok(n);
        }
        let mut task: Option<TimerTask> = None;
        let mut guard = lock(&self.shared);
        let result = loop {
            if !guard.buf.is_empty() {
                let n = out.len().min(guard.buf.len());
                for (slot, byte) in out.iter_mut().zip(guard.buf.drain(..n)) {
                    *slot = byte;
                }
                break Ok(n);
            }
            match guard.state {
                StreamState::Eof => break Ok(0),
                StreamState::Closed => {
                    break Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader closed"))
                }
                StreamState::Expired => {
                    break Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "read deadline expired",
                    ))
                }
                StreamState::Open => {}
            }
            if let Some((kind, msg)) = guard.error.clone() {
                break Err(io::Error::new(kind, msg));
            }
            if task.is_none() {
                guard.wait_active = true;
                let expiry = self.shared.clone();
                task = Some(timer::shared().schedule(self.deadline, move || {
                    let mut g = lock(&expiry);
                    if g.state == StreamState::Open && g.wait_active {
                        g.state = StreamState::Expired;
                        tracing::warn!("read deadline expired with no data");
                    }
                    expiry.cond.notify_all();
                }));
            }
            guard = self
                .shared
                .cond
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        };
        guard.wait_active = false;
        // Wake the pump in case it is parked on the high-water mark.
        self.shared.cond.notify_all();
        drop(guard);
        if let Some(task) = task {
            timer::shared().cancel(&task);
        }
        match &result {
            Ok(0) => self.eof_seen = true,
            Ok(n) => self.replay.record(&out[..*n]),
            Err(_) => {}
        }
        result
    }
}

impl Read for PerishableReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.blocking_read(out)
    }
}

/// Cross-thread close handle for a [`PerishableReader`].
#[derive(Clone)]
pub struct PerishableCloser {
    shared: Arc<Shared>,
}

impl PerishableCloser {
    pub fn close(&self) {
        let mut guard = lock(&self.shared);
        if guard.state == StreamState::Open {
            guard.state = StreamState::Closed;
        }
        self.shared.cond.notify_all();
    }
}

impl Drop for PerishableReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn effective(deadline: Duration) -> Duration {
    if deadline.is_zero() {
        DEFAULT_DEADLINE
    } else {
        deadline
    }
}

/// Pump thread body: pull from the underlying stream into the shared buffer
/// until a terminal state is reached.
fn pump(mut stream: Box<dyn Read + Send>, shared: Arc<Shared>) {
    let mut chunk = [0u8; 8192];
    loop {
        let read = stream.read(&mut chunk);
        let mut guard = lock(&shared);
        if guard.state != StreamState::Open {
            break;
        }
        match read {
            Ok(0) => {
                guard.state = StreamState::Eof;
                shared.cond.notify_all();
                break;
            }
            Ok(n) => {
                guard.buf.extend(&chunk[..n]);
                shared.cond.notify_all();
                while guard.buf.len() >= HIGH_WATER && guard.state == StreamState::Open {
                    guard = shared
                        .cond
                        .wait(guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                if guard.state != StreamState::Open {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                guard.error = Some((e.kind(), e.to_string()));
                shared.cond.notify_all();
                break;
            }
        }
    }
}

/// Replay buffer backing `mark`/`reset`.
///
/// `record` accumulates bytes consumed since the mark; `pending` holds
/// rewound bytes that must be served before the live stream. Exceeding the
/// mark's limit drops the ability to rewind (the buffer never grows past
/// the limit) and `reset()` reports the overflow explicitly.
struct Replay {
    pending: VecDeque<u8>,
    record: Vec<u8>,
    limit: usize,
    active: bool,
    overflowed: bool,
}

impl Replay {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            record: Vec::new(),
            limit: 0,
            active: false,
            overflowed: false,
        }
    }

    fn mark(&mut self, limit: usize) {
        self.record.clear();
        self.limit = limit;
        self.active = limit > 0;
        self.overflowed = false;
    }

    fn reset(&mut self) -> io::Result<()> {
        if !self.active {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no active mark"));
        }
        if self.overflowed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "replay buffer overflow",
            ));
        }
        let mut rewound: VecDeque<u8> = self.record.drain(..).collect();
        rewound.extend(self.pending.drain(..));
        self.pending = rewound;
        Ok(())
    }

    /// Serve rewound bytes, if any, re-recording them as they pass.
    fn serve(&mut self, out: &mut [u8]) -> Option<usize> {
        if self.pending.is_empty() {
            return None;
        }
        let n = out.len().min(self.pending.len());
        for (slot, byte) in out.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        let (served, _) = out.split_at(n);
        let served = served.to_vec();
        self.record(&served);
        Some(n)
    }

    fn record(&mut self, bytes: &[u8]) {
        if !self.active || self.overflowed {
            return;
        }
        if self.record.len() + bytes.len() > self.limit {
            self.overflowed = true;
            self.record.clear();
        } else {
            self.record.extend_from_slice(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Instant;

    /// A stream that never produces data and never returns.
    struct Silent;

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            loop {
                std::thread::sleep(Duration::from_secs(60));
            }
        }
    }

    fn reader_over(bytes: &[u8], deadline: Duration) -> PerishableReader {
        PerishableReader::new(Box::new(Cursor::new(bytes.to_vec())), deadline)
    }

    #[test]
    fn reads_buffered_data_then_eof() {
        let mut r = reader_over(b"hello", Duration::from_secs(5));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert!(r.is_eof());
    }

    #[test]
    fn deadline_unblocks_silent_stream() {
        let mut r = PerishableReader::new(Box::new(Silent), Duration::from_millis(50));
        let start = Instant::now();
        let mut buf = [0u8; 16];
        let err = r.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(
            start.elapsed() <= Duration::from_millis(150),
            "unblocked after {:?}",
            start.elapsed()
        );
        assert!(r.is_expired());
        // Terminal: every further read fails the same way.
        let err = r.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn successful_read_rearms_deadline() {
        // A stream that yields one byte per 30ms stays alive under a 100ms
        // deadline even though the total transfer takes longer.
        struct Trickle(u8);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    return Ok(0);
                }
                std::thread::sleep(Duration::from_millis(30));
                buf[0] = b'x';
                self.0 -= 1;
                Ok(1)
            }
        }
        let mut r = PerishableReader::new(Box::new(Trickle(8)), Duration::from_millis(100));
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn close_from_another_thread_unblocks() {
        let mut r = PerishableReader::new(Box::new(Silent), Duration::from_secs(60));
        let closer = r.closer();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            closer.close();
        });
        let start = Instant::now();
        let mut buf = [0u8; 4];
        let err = r.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(r.is_closed());
        handle.join().unwrap();
    }

    #[test]
    fn read_line_handles_lf_and_crlf() {
        let mut r = reader_over(b"one\ntwo\r\nthree", Duration::from_secs(5));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("one"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("two"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("three"));
        assert_eq!(r.read_line().unwrap(), None);
    }

    #[test]
    fn read_line_lone_cr_does_not_eat_next_byte() {
        let mut r = reader_over(b"a\rb\n", Duration::from_secs(5));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("a"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn mark_reset_replays_consumed_bytes() {
        let mut r = reader_over(b"abcdef", Duration::from_secs(5));
        let mut buf = [0u8; 3];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        r.mark(8);
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"def");
        r.reset().unwrap();
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn reset_after_overflow_reports_error() {
        let mut r = reader_over(b"abcdefghij", Duration::from_secs(5));
        r.mark(4);
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf).unwrap();
        let err = r.reset().unwrap_err();
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn reset_without_mark_is_an_error() {
        let mut r = reader_over(b"abc", Duration::from_secs(5));
        assert!(r.reset().is_err());
    }

    #[test]
    fn repeated_reset_rewinds_to_same_mark() {
        let mut r = reader_over(b"abcd", Duration::from_secs(5));
        r.mark(8);
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).unwrap();
        r.reset().unwrap();
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ab");
        r.reset().unwrap();
        r.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ab");
    }

    #[test]
    fn zero_deadline_falls_back_to_default() {
        let r = reader_over(b"x", Duration::ZERO);
        assert_eq!(r.deadline, DEFAULT_DEADLINE);
    }
}
