//! Workspace lock: the only mutual exclusion between governor processes.
//!
//! The lock file holds `{pid, started_at, boot_id}`. A lock is stale when it
//! was written during a different boot or its pid is gone; stale locks are
//! reclaimed. Anything that does not validate is left untouched and reported
//! as corrupt.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";
const UNKNOWN_BOOT_ID: &str = "unknown";

/// Contents of `lock.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub started_at: String,
    pub boot_id: String,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock held by pid {} since {}", .0.pid, .0.started_at)]
    Held(LockInfo),
    #[error("lock file {} is corrupt ({reason}); delete it manually once no tick is running", path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Host facts the lock depends on. Tests substitute fixed values.
pub trait HostProbe {
    fn current_pid(&self) -> u32;
    fn boot_id(&self) -> String;
    fn is_alive(&self, pid: u32) -> bool;
}

/// The running host.
pub struct SystemHost;

impl HostProbe for SystemHost {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn boot_id(&self) -> String {
        fs::read_to_string(BOOT_ID_PATH)
            .map(|id| id.trim().to_string())
            .ok()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| UNKNOWN_BOOT_ID.to_string())
    }

    #[cfg(unix)]
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // Signal 0 probes existence; EPERM means it exists under another user.
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(not(unix))]
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Exclusive ownership of the lock. Released on drop.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    info: LockInfo,
    reclaimed: Option<LockInfo>,
    released: bool,
}

impl LockHandle {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// The stale lock this acquisition replaced, if any.
    pub fn reclaimed(&self) -> Option<&LockInfo> {
        self.reclaimed.as_ref()
    }

    pub fn release(mut self) -> anyhow::Result<()> {
        self.released = true;
        release_lock(&self.path)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release_lock(&self.path) {
            warn!(err = %err, path = %self.path.display(), "failed to release lock on drop");
        }
    }
}

/// Acquire the lock at `path` for the current process.
pub fn acquire(path: &Path, started_at: &str) -> Result<LockHandle, LockError> {
    acquire_with(path, started_at, &SystemHost)
}

#[instrument(skip_all, fields(path = %path.display()))]
pub fn acquire_with<H: HostProbe>(
    path: &Path,
    started_at: &str,
    host: &H,
) -> Result<LockHandle, LockError> {
    let parent = path
        .parent()
        .with_context(|| format!("lock path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let info = LockInfo {
        pid: host.current_pid(),
        started_at: started_at.to_string(),
        boot_id: host.boot_id(),
    };
    let mut reclaimed = None;

    // Retries follow a reclaimed stale lock, or one another process moved away.
    for _ in 0..3 {
        if try_create(path, &info)? {
            debug!(pid = info.pid, "lock acquired");
            return Ok(LockHandle {
                path: path.to_path_buf(),
                info,
                reclaimed,
                released: false,
            });
        }
        let existing = match read_existing(path)? {
            Some(existing) => existing,
            None => continue,
        };
        if !is_stale(&existing, &info.boot_id, host) {
            return Err(LockError::Held(existing));
        }
        info!(
            stale_pid = existing.pid,
            stale_boot_id = %existing.boot_id,
            "reclaiming stale lock"
        );
        if remove_stale(path, &existing, info.pid)? {
            reclaimed = Some(existing);
        }
    }
    // Another process won the race for the reclaimed lock.
    match read_existing(path)? {
        Some(existing) => Err(LockError::Held(existing)),
        None => Err(LockError::Io(anyhow::anyhow!(
            "lock {} kept changing during acquisition",
            path.display()
        ))),
    }
}

/// Delete the lock file. Missing files are fine.
pub fn release_lock(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "lock released");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove lock {}", path.display())),
    }
}

/// Read the lock without acquiring it (for status displays).
pub fn read_lock(path: &Path) -> Result<Option<LockInfo>, LockError> {
    read_existing(path)
}

/// Whether the process recorded in `info` may still be holding the lock.
pub fn holder_is_live<H: HostProbe>(info: &LockInfo, host: &H) -> bool {
    !is_stale(info, &host.boot_id(), host)
}

fn is_stale<H: HostProbe>(existing: &LockInfo, current_boot: &str, host: &H) -> bool {
    if existing.boot_id != current_boot {
        return true;
    }
    !host.is_alive(existing.pid)
}

/// Remove the lock at `path` only if it still is the `stale` one judged.
///
/// The file is renamed to a private tombstone first and checked there, so a
/// fresh lock another process created after our read is never deleted: it is
/// linked back (without overwriting) and reported as held. Returns `false`
/// when the file had already gone.
fn remove_stale(path: &Path, stale: &LockInfo, pid: u32) -> Result<bool, LockError> {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let tombstone = path.with_extension(format!("json.{pid}.{seq}.stale"));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(LockError::Io(
                anyhow::Error::new(err).context(format!("move stale lock {}", path.display())),
            ));
        }
    }
    let moved = read_existing(&tombstone);
    if matches!(&moved, Ok(Some(info)) if info == stale) {
        let _ = fs::remove_file(&tombstone);
        return Ok(true);
    }
    warn!(path = %path.display(), "lock changed while reclaiming; restoring it");
    if let Err(err) = fs::hard_link(&tombstone, path)
        && err.kind() != ErrorKind::AlreadyExists
    {
        return Err(LockError::Io(anyhow::Error::new(err).context(format!(
            "restore lock {} from {}",
            path.display(),
            tombstone.display()
        ))));
    }
    let _ = fs::remove_file(&tombstone);
    match moved {
        Ok(Some(current)) => Err(LockError::Held(current)),
        Ok(None) => Ok(false),
        Err(LockError::Corrupt { reason, .. }) => Err(corrupt(path, &reason)),
        Err(err) => Err(err),
    }
}

/// Write `info` to a temp file and hard-link it into place, so the lock
/// appears with its full contents or not at all.
fn try_create(path: &Path, info: &LockInfo) -> anyhow::Result<bool> {
    let tmp = path.with_extension(format!("json.{}.tmp", info.pid));
    let mut buf = serde_json::to_string_pretty(info).context("serialize lock")?;
    buf.push('\n');
    fs::write(&tmp, buf).with_context(|| format!("write temp lock {}", tmp.display()))?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("create lock {}", path.display())),
    }
}

fn read_existing(path: &Path) -> Result<Option<LockInfo>, LockError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) if err.kind() == ErrorKind::InvalidData => {
            return Err(corrupt(path, "not valid UTF-8"));
        }
        Err(err) => {
            return Err(LockError::Io(
                anyhow::Error::new(err).context(format!("read lock {}", path.display())),
            ));
        }
    };
    parse_lock(&contents)
        .map(Some)
        .map_err(|reason| corrupt(path, &reason))
}

fn corrupt(path: &Path, reason: &str) -> LockError {
    LockError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Strict shape validation; serde alone would accept floats or zero pids.
fn parse_lock(contents: &str) -> Result<LockInfo, String> {
    let value: Value =
        serde_json::from_str(contents).map_err(|err| format!("invalid JSON: {err}"))?;
    let Value::Object(map) = value else {
        return Err("expected a JSON object".to_string());
    };
    let pid = match map.get("pid") {
        Some(Value::Number(n)) => n
            .as_u64()
            .filter(|pid| *pid > 0)
            .and_then(|pid| u32::try_from(pid).ok())
            .filter(|pid| i32::try_from(*pid).is_ok())
            .ok_or_else(|| format!("pid must be a positive integer, got {n}"))?,
        Some(other) => return Err(format!("pid must be a positive integer, got {other}")),
        None => return Err("missing pid".to_string()),
    };
    let started_at = non_empty_string(&map, "started_at")?;
    let boot_id = non_empty_string(&map, "boot_id")?;
    Ok(LockInfo {
        pid,
        started_at,
        boot_id,
    })
}

fn non_empty_string(map: &serde_json::Map<String, Value>, key: &str) -> Result<String, String> {
    match map.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(format!("{key} must be non-empty")),
        Some(other) => Err(format!("{key} must be a string, got {other}")),
        None => Err(format!("missing {key}")),
    }
}
