//! Lock acquisition, yielding, and stale-lock reclamation.

use crate::error::{LockError, LockResult};
use crate::record::LockRecord;
use converge_core::canonify::canonify;
use converge_core::constants::{LOCK_HASH_MODULUS, MACRO_ALPHABET};
use converge_core::promise::TransactionAttributes;
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Handle to a held lock, referencing both database keys of the promise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    lock_key: String,
    last_key: String,
    /// Set for ignore-locks mode, where the promise proceeds unlocked
    unlocked: bool,
}

impl LockHandle {
    /// The `lock.*` key this handle holds
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Whether this handle represents a real database entry
    pub fn is_real(&self) -> bool {
        !self.unlocked
    }
}

/// Persistent lock manager over a local key/value store.
///
/// The database library provides its own file locking; the in-process
/// mutex additionally keeps threads of one agent from racing on a key.
#[derive(Debug)]
pub struct LockManager {
    db: sled::Db,
    mu: Mutex<()>,
    work_dir: PathBuf,
    /// Treated as this process's start time in records we write
    started_at: i64,
    ignore_locks: bool,
}

impl LockManager {
    /// Opens (creating if needed) the lock database under `work_dir`
    pub fn open(work_dir: &Path) -> LockResult<Self> {
        let db_path = work_dir.join("converge_lock_db");
        let db = sled::open(&db_path)?;
        Ok(Self {
            db,
            mu: Mutex::new(()),
            work_dir: work_dir.to_path_buf(),
            started_at: unix_now(),
            ignore_locks: false,
        })
    }

    /// Disables locking entirely; acquire hands out unlocked handles
    pub fn set_ignore_locks(&mut self, ignore: bool) {
        self.ignore_locks = ignore;
    }

    /// Attempts to acquire the lock for one promise instance.
    ///
    /// Returns `None` when the promise completed less than `if_elapsed`
    /// minutes ago ("promise kept, nothing to do") or another live process
    /// holds the lock. An expired holder is killed with escalating signals
    /// and its lock reclaimed. Database trouble is logged and reported as
    /// `None`: no lock is held and the promise is skipped this interval.
    pub fn acquire(
        &self,
        operator: &str,
        operand: &str,
        host: &str,
        bundle: &str,
        now: i64,
        txn: &TransactionAttributes,
    ) -> LockResult<Option<LockHandle>> {
        if self.ignore_locks || now == 0 {
            return Ok(Some(LockHandle {
                lock_key: String::new(),
                last_key: String::new(),
                unlocked: true,
            }));
        }

        let _guard = self.mu.lock();

        let digest = lock_digest(operator, operand);
        let base = format!(
            "{}.{}.{}.{}_{}",
            truncate(&canonify(host), 40),
            truncate(bundle, 100),
            truncate(&canonify(operator), 60),
            truncate(&canonify(operand), 100),
            digest
        );
        let lock_key = format!("lock.{}", base);
        let last_key = format!("last.{}", base);

        debug!(
            lock = lock_key.as_str(),
            if_elapsed = txn.if_elapsed,
            expire_after = txn.expire_after,
            "acquiring lock"
        );

        let last_completed = match self.probe_time_seeding(&last_key, now) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "lock database unavailable, skipping promise");
                return Ok(None);
            }
        };

        let elapsed_min = (now - last_completed) / 60;
        if elapsed_min < 0 {
            info!(
                operator,
                operand, "another agent completed this since we started"
            );
            return Ok(None);
        }
        if (elapsed_min as u64) < txn.if_elapsed {
            info!(
                operator,
                operand,
                elapsed = elapsed_min,
                if_elapsed = txn.if_elapsed,
                "nothing promised yet, interval has not elapsed"
            );
            return Ok(None);
        }

        let current = match self.read_record(&lock_key) {
            Ok(current) => current,
            Err(e) => {
                error!(error = %e, "lock database unavailable, skipping promise");
                return Ok(None);
            }
        };
        if let Some(current) = current {
            // A negative age means the holder's clock is ahead of ours;
            // the lock is still held, never expired
            let held_min = (now - current.acquired_at) / 60;
            if held_min < 0 || (held_min as u64) < txn.expire_after {
                debug!(lock = lock_key.as_str(), "lock already held, skipping");
                return Ok(None);
            }

            info!(
                lock = lock_key.as_str(),
                held_minutes = held_min,
                expire_after = txn.expire_after,
                "lock expired"
            );
            match current.pid {
                0 => {
                    // Unreachable through from_bytes, kept for the corrupt path
                    error!(lock = lock_key.as_str(), "illegal pid in lock, ignoring");
                }
                pid => {
                    if kill_with_escalation(pid) {
                        self.log_completion(
                            host,
                            pid,
                            "Lock expired, process killed",
                            operator,
                            operand,
                        )?;
                        self.db.remove(lock_key.as_bytes())?;
                    } else {
                        error!(
                            pid,
                            lock = lock_key.as_str(),
                            "unable to kill expired agent process, exiting this time"
                        );
                        return Err(LockError::KillFailed {
                            pid,
                            key: lock_key,
                        });
                    }
                }
            }
        }

        if let Err(e) = self.write_record(
            &lock_key,
            LockRecord {
                pid: std::process::id(),
                acquired_at: now,
                process_start_time: self.started_at,
            },
        ) {
            error!(error = %e, "lock database unavailable, skipping promise");
            return Ok(None);
        }

        Ok(Some(LockHandle {
            lock_key,
            last_key,
            unlocked: false,
        }))
    }

    /// Releases a lock: removes the `lock.*` entry and stamps the
    /// `last.*` entry with the completion time
    pub fn yield_lock(&self, handle: &LockHandle, host: &str, now: i64) -> LockResult<()> {
        if handle.unlocked {
            return Ok(());
        }
        let _guard = self.mu.lock();

        debug!(lock = handle.lock_key.as_str(), "releasing lock");
        self.db.remove(handle.lock_key.as_bytes())?;
        self.write_record(
            &handle.last_key,
            LockRecord {
                pid: std::process::id(),
                acquired_at: now,
                process_start_time: self.started_at,
            },
        )?;
        self.log_completion(
            host,
            std::process::id(),
            "Lock removed normally",
            &handle.lock_key,
            "",
        )
    }

    /// Sweeps the `lock.*` namespace, removing records older than
    /// `expire_after_minutes`. Returns how many entries were reclaimed.
    pub fn purge_expired(&self, now: i64, expire_after_minutes: u64) -> LockResult<usize> {
        let _guard = self.mu.lock();
        let mut removed = 0;
        for item in self.db.scan_prefix(b"lock.") {
            let (key, value) = item?;
            let key_str = String::from_utf8_lossy(&key).to_string();
            match LockRecord::from_bytes(&key_str, &value) {
                Ok(record) => {
                    let held_min = (now - record.acquired_at) / 60;
                    if held_min >= 0 && held_min as u64 >= expire_after_minutes {
                        self.db.remove(&key)?;
                        removed += 1;
                    }
                }
                Err(e) => {
                    warn!(key = key_str.as_str(), error = %e, "purging corrupt lock record");
                    self.db.remove(&key)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// The completion time recorded under `key`, if any and parseable
    pub fn completion_time(&self, key: &str) -> LockResult<Option<i64>> {
        Ok(self.read_record(key)?.map(|r| r.acquired_at))
    }

    /// Reads the raw record under a fully-formed key
    pub fn read_record(&self, key: &str) -> LockResult<Option<LockRecord>> {
        match self.db.get(key.as_bytes())? {
            Some(value) => match LockRecord::from_bytes(key, &value) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    warn!(key, error = %e, "ignoring corrupt lock record");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// The completion time under `key`, seeding a fresh record when the
    /// key has never been written. Seeding prevents deadlock loops from
    /// surviving when `if_elapsed` exceeds the scheduling interval.
    fn probe_time_seeding(&self, key: &str, now: i64) -> LockResult<i64> {
        match self.read_record(key)? {
            Some(record) => Ok(record.acquired_at),
            None => {
                self.write_record(
                    key,
                    LockRecord {
                        pid: std::process::id(),
                        acquired_at: now,
                        process_start_time: self.started_at,
                    },
                )?;
                Ok(0)
            }
        }
    }

    fn write_record(&self, key: &str, record: LockRecord) -> LockResult<()> {
        self.db.insert(key.as_bytes(), record.to_bytes().to_vec())?;
        self.db.flush()?;
        Ok(())
    }

    /// Appends one line to the per-host completion runlog
    fn log_completion(
        &self,
        host: &str,
        pid: u32,
        message: &str,
        operator: &str,
        operand: &str,
    ) -> LockResult<()> {
        let path = self
            .work_dir
            .join(format!("converge.{}.runlog", truncate(&canonify(host), 40)));
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LockError::Runlog {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        writeln!(
            file,
            "{}:{}:pid={}:{}:{}",
            unix_now(),
            message,
            pid,
            operator,
            operand
        )
        .map_err(|e| LockError::Runlog {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

/// Positional digest of operator-then-operand, as embedded in lock ids
fn lock_digest(operator: &str, operand: &str) -> u64 {
    let mut sum: u64 = 0;
    for &b in operator.as_bytes().iter().chain(operand.as_bytes()) {
        sum = (MACRO_ALPHABET.wrapping_mul(sum).wrapping_add(b as u64)) % LOCK_HASH_MODULUS;
    }
    sum
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() > max {
        &s[..max]
    } else {
        s
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Kills an expired lock holder: INT, wait 1s; TERM, wait 5s; KILL,
/// wait 1s. A vanished process (ESRCH) counts as success.
fn kill_with_escalation(pid: u32) -> bool {
    let pid = pid as libc::pid_t;
    for (signal, grace) in [
        (libc::SIGINT, Duration::from_secs(1)),
        (libc::SIGTERM, Duration::from_secs(5)),
        (libc::SIGKILL, Duration::from_secs(1)),
    ] {
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            thread::sleep(grace);
            // Probe whether it is gone
            let probe = unsafe { libc::kill(pid, 0) };
            if probe != 0 {
                return true;
            }
            continue;
        }
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(0);
        if errno == libc::ESRCH {
            return true;
        }
        warn!(pid, signal, errno, "signal delivery failed");
    }
    false
}
