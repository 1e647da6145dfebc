//! Per-host configuration store with typed lookups.
//!
//! Every tunable in the crate flows through a [`Properties`] store attached
//! to the session: retry counts, read-deadline tiers, cache backend
//! selection, buffer bounds. Stores are plain string maps so they can be
//! loaded from per-host JSON documents; typed accessors parse on read and
//! fall back to the documented default when a key is missing or malformed.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::Error;

/// Number of times a hung or broken command is restarted before the last
/// error is surfaced to the caller.
pub const PROP_EXEC_RETRIES: &str = "exec.retries";

/// Read-deadline tiers, in milliseconds.
pub const PROP_READ_TIMEOUT_S: &str = "read.timeout.small";
pub const PROP_READ_TIMEOUT_M: &str = "read.timeout.medium";
pub const PROP_READ_TIMEOUT_L: &str = "read.timeout.large";
pub const PROP_READ_TIMEOUT_XL: &str = "read.timeout.xl";

/// Selects the persistent (on-disk) metadata cache backend instead of the
/// transient in-memory one.
pub const PROP_CACHE_PERSISTENT: &str = "cache.persistent";

/// Number of inserts the persistent cache batches before flushing to disk.
pub const PROP_CACHE_FLUSH_EVERY: &str = "cache.flush.every";

/// Upper bound on bytes captured from a process stream into memory.
pub const PROP_PROCESS_MAXBUFLEN: &str = "process.maxbuflen";

/// Maximum number of live scripting interpreters in a runspace pool.
pub const PROP_RUNSPACE_CAPACITY: &str = "runspace.capacity";

const DEFAULT_EXEC_RETRIES: u32 = 3;
const DEFAULT_TIMEOUT_S: u64 = 30_000;
const DEFAULT_TIMEOUT_M: u64 = 120_000;
const DEFAULT_TIMEOUT_L: u64 = 900_000;
const DEFAULT_TIMEOUT_XL: u64 = 3_600_000;
const DEFAULT_CACHE_FLUSH_EVERY: usize = 64;
const DEFAULT_PROCESS_MAXBUFLEN: usize = 4 * 1024 * 1024;
const DEFAULT_RUNSPACE_CAPACITY: usize = 8;

/// Read-deadline tier for command output.
///
/// Tiers resolve through the session's [`Properties`] so individual hosts
/// can stretch them (e.g. a slow WAN link) without touching call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Quick probes: stat of a single path, version checks.
    Small,
    /// Ordinary enumeration commands.
    Medium,
    /// Recursive searches over large trees.
    Large,
    /// Streams that may legitimately stay quiet for a long time (stderr
    /// drains, bulk transfers).
    ExtraLarge,
}

/// A per-host configuration store.
///
/// Values are strings; typed getters parse on access. A key may be
/// *overridden by indirection*: `override_key(a, b)` makes lookups of `a`
/// read the value stored under `b` first, falling back to `a` itself. This
/// lets a host profile redirect a shared key to a host-specific one without
/// rewriting the shared defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Properties {
    #[serde(default)]
    values: HashMap<String, String>,
    #[serde(default)]
    overrides: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a store from a JSON document of the form
    /// `{"values": {...}, "overrides": {...}}`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Set a raw value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Redirect lookups of `key` to read `target` first.
    pub fn override_key(&mut self, key: impl Into<String>, target: impl Into<String>) {
        self.overrides.insert(key.into(), target.into());
    }

    /// Raw string lookup, following one level of override indirection.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        if let Some(target) = self.overrides.get(key) {
            if let Some(v) = self.values.get(target) {
                return Some(v.as_str());
            }
        }
        self.values.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str) -> Option<u32> {
        self.get_str(key)?.trim().parse().ok()
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        self.get_str(key)?.trim().parse().ok()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get_str(key)?.trim() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        }
    }

    // -- Well-known keys ----------------------------------------------------

    pub fn exec_retries(&self) -> u32 {
        self.get_int(PROP_EXEC_RETRIES)
            .unwrap_or(DEFAULT_EXEC_RETRIES)
    }

    pub fn timeout(&self, tier: Timeout) -> Duration {
        let (key, default) = match tier {
            Timeout::Small => (PROP_READ_TIMEOUT_S, DEFAULT_TIMEOUT_S),
            Timeout::Medium => (PROP_READ_TIMEOUT_M, DEFAULT_TIMEOUT_M),
            Timeout::Large => (PROP_READ_TIMEOUT_L, DEFAULT_TIMEOUT_L),
            Timeout::ExtraLarge => (PROP_READ_TIMEOUT_XL, DEFAULT_TIMEOUT_XL),
        };
        let millis = self
            .get_long(key)
            .filter(|ms| *ms > 0)
            .map(|ms| ms as u64)
            .unwrap_or(default);
        Duration::from_millis(millis)
    }

    pub fn cache_persistent(&self) -> bool {
        self.get_bool(PROP_CACHE_PERSISTENT).unwrap_or(false)
    }

    pub fn cache_flush_every(&self) -> usize {
        self.get_long(PROP_CACHE_FLUSH_EVERY)
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_CACHE_FLUSH_EVERY)
    }

    pub fn process_maxbuflen(&self) -> usize {
        self.get_long(PROP_PROCESS_MAXBUFLEN)
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_PROCESS_MAXBUFLEN)
    }

    pub fn runspace_capacity(&self) -> usize {
        self.get_long(PROP_RUNSPACE_CAPACITY)
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_RUNSPACE_CAPACITY)
    }
}
