//! Cross-process advisory lock around the state file.
//!
//! The lock is a sibling file created with `create_new`, holding the owner's
//! pid, acquisition time and a random token. A lock older than `stale_after`
//! is assumed to belong to a crashed process and is stolen.
//!
//! Stealers serialize on a second `.steal` gate file and re-check staleness
//! while holding it, so a late stealer cannot remove a lock that a faster one
//! already replaced. Release renames the lock to a private tombstone before
//! checking the token, and links it back if it is no longer ours.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll: Duration,
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll: Duration::from_millis(50),
            stale_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockInfo {
    pid: u32,
    acquired_at: i64,
    #[serde(default)]
    token: String,
}

fn read_info(path: &Path) -> Option<LockInfo> {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
}

fn tombstone(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.{}", std::process::id(), Uuid::new_v4().simple()));
    PathBuf::from(name)
}

/// Put a displaced lock back unless someone already holds the path.
fn restore(tomb: &Path, path: &Path) {
    if let Err(e) = fs::hard_link(tomb, path) {
        tracing::warn!(path = %path.display(), error = %e, "could not restore displaced state lock");
    }
    let _ = fs::remove_file(tomb);
}

/// Held lock; the file is removed on drop if it is still ours.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let tomb = tombstone(&self.path);
        match fs::rename(&self.path, &tomb) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "state lock vanished before release");
                return;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to release state lock");
                return;
            }
        }
        let ours = read_info(&tomb).is_some_and(|info| info.token == self.token);
        if ours {
            let _ = fs::remove_file(&tomb);
        } else {
            tracing::warn!(path = %self.path.display(), "state lock was taken over; leaving it");
            restore(&tomb, &self.path);
        }
    }
}

/// Acquire the lock at `path`, polling until `opts.timeout` elapses.
pub fn acquire(path: &Path, opts: &LockOptions) -> Result<LockGuard, StoreError> {
    let started = Instant::now();
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let info = LockInfo {
                    pid: std::process::id(),
                    acquired_at: Utc::now().timestamp_millis(),
                    token: Uuid::new_v4().to_string(),
                };
                let guard = LockGuard {
                    path: path.to_path_buf(),
                    token: info.token.clone(),
                };
                let body = serde_json::to_vec(&info)?;
                file.write_all(&body)
                    .and_then(|_| file.sync_all())
                    .map_err(io_err)?;
                return Ok(guard);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if is_stale(path, opts.stale_after) && steal(path, opts.stale_after).map_err(io_err)? {
                    continue;
                }
                if started.elapsed() >= opts.timeout {
                    return Err(StoreError::LockTimeout {
                        path: path.to_path_buf(),
                        waited_ms: started.elapsed().as_millis() as u64,
                    });
                }
                std::thread::sleep(opts.poll);
            }
            Err(source) => return Err(io_err(source)),
        }
    }
}

/// Remove a stale lock. Returns whether the path may now be free; `false`
/// means another stealer is busy or the lock turned out to be fresh.
fn steal(path: &Path, stale_after: Duration) -> std::io::Result<bool> {
    let mut gate = path.as_os_str().to_owned();
    gate.push(".steal");
    let gate = PathBuf::from(gate);
    match OpenOptions::new().write(true).create_new(true).open(&gate) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            // Left behind by a stealer that died mid-steal.
            if is_stale(&gate, stale_after) {
                let _ = fs::remove_file(&gate);
            }
            return Ok(false);
        }
        Err(e) => return Err(e),
    }

    let result = if is_stale(path, stale_after) {
        match fs::remove_file(path) {
            Ok(()) => {
                tracing::warn!(path = %path.display(), "stole stale state lock");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e),
        }
    } else {
        Ok(false)
    };
    let _ = fs::remove_file(&gate);
    result
}

/// Age of the lock from its recorded timestamp, falling back to the file's
/// mtime when the body is unreadable (a writer may have died mid-write).
fn lock_age(path: &Path) -> Option<Duration> {
    let recorded = read_info(path).map(|info| {
        let age_ms = Utc::now().timestamp_millis().saturating_sub(info.acquired_at);
        Duration::from_millis(age_ms.max(0) as u64)
    });
    recorded.or_else(|| {
        let modified = fs::metadata(path).ok()?.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    })
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    lock_age(path).is_some_and(|age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(200),
            poll: Duration::from_millis(10),
            stale_after: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_acquire_creates_and_drop_removes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json.lock");
        {
            let _guard = acquire(&path, &fast()).unwrap();
            assert!(path.exists());
            let info: LockInfo = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
            assert_eq!(info.pid, std::process::id());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_second_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json.lock");
        let _guard = acquire(&path, &fast()).unwrap();
        match acquire(&path, &fast()) {
            Err(StoreError::LockTimeout { .. }) => {}
            other => panic!("expected LockTimeout, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_lock_is_stolen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json.lock");
        let old = LockInfo {
            pid: 1,
            acquired_at: Utc::now().timestamp_millis() - 60_000,
            token: "crashed".to_string(),
        };
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();

        let _guard = acquire(&path, &fast()).unwrap();
        let info: LockInfo = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn test_fresh_unparsable_lock_is_respected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json.lock");
        fs::write(&path, b"{\"pid\":").unwrap();
        assert!(matches!(
            acquire(&path, &fast()),
            Err(StoreError::LockTimeout { .. })
        ));
    }

    #[test]
    fn test_released_lock_can_be_reacquired_by_waiter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json.lock");
        let guard = acquire(&path, &fast()).unwrap();

        let waiter_path = path.clone();
        let waiter = std::thread::spawn(move || {
            let opts = LockOptions {
                timeout: Duration::from_secs(2),
                ..fast()
            };
            acquire(&waiter_path, &opts).map(|_| ())
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_racing_stealers_never_overlap() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Barrier};

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json.lock");
        let old = LockInfo {
            pid: 1,
            acquired_at: Utc::now().timestamp_millis() - 60_000,
            token: "crashed".to_string(),
        };
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();

        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let (path, barrier, inside, peak) =
                    (path.clone(), barrier.clone(), inside.clone(), peak.clone());
                std::thread::spawn(move || {
                    let opts = LockOptions {
                        timeout: Duration::from_secs(5),
                        poll: Duration::from_millis(5),
                        stale_after: Duration::from_secs(30),
                    };
                    barrier.wait();
                    let _guard = acquire(&path, &opts).unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
    }

    #[test]
    fn test_guard_leaves_a_lock_it_no_longer_owns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json.lock");
        let guard = acquire(&path, &fast()).unwrap();
        let usurper = LockInfo {
            pid: 2,
            acquired_at: Utc::now().timestamp_millis(),
            token: "someone-else".to_string(),
        };
        fs::write(&path, serde_json::to_vec(&usurper).unwrap()).unwrap();

        drop(guard);
        let info: LockInfo = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(info.token, "someone-else");
    }

    #[test]
    fn test_fresh_lock_survives_a_late_steal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("projects.json.lock");
        let _guard = acquire(&path, &fast()).unwrap();

        // A process that judged the previous lock stale arrives late.
        assert!(!steal(&path, Duration::from_secs(30)).unwrap());
        let info: LockInfo = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(info.pid, std::process::id());
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
