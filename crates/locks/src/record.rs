//! The on-disk lock record.
//!
//! The value format is part of the external contract: exactly 24 bytes,
//! `pid: u32 | 4 pad bytes | acquired_at: i64 | process_start_time: i64`,
//! little-endian. Existing readers assume the pad bytes are zero, so the
//! record is serialised field-by-field into a zeroed buffer; native struct
//! layout is never written to disk.

use crate::error::{LockError, LockResult};

/// Exact size of a serialised lock record
pub const LOCK_RECORD_SIZE: usize = 24;

/// A held-lock or last-completion record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRecord {
    /// Process holding (or last holding) the lock
    pub pid: u32,
    /// When the lock was acquired, or the promise last completed
    pub acquired_at: i64,
    /// Start time of the recording process, for pid-reuse detection
    pub process_start_time: i64,
}

impl LockRecord {
    /// Serialises into the fixed 24-byte layout. The buffer starts zeroed,
    /// so the pad bytes between `pid` and `acquired_at` are always zero.
    pub fn to_bytes(&self) -> [u8; LOCK_RECORD_SIZE] {
        let mut buf = [0u8; LOCK_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[8..16].copy_from_slice(&self.acquired_at.to_le_bytes());
        buf[16..24].copy_from_slice(&self.process_start_time.to_le_bytes());
        buf
    }

    /// Parses the fixed layout. A record of the wrong size or a zero pid
    /// is corrupt.
    pub fn from_bytes(key: &str, bytes: &[u8]) -> LockResult<Self> {
        if bytes.len() != LOCK_RECORD_SIZE {
            return Err(LockError::CorruptRecord {
                key: key.to_string(),
                reason: format!("{} bytes, expected {}", bytes.len(), LOCK_RECORD_SIZE),
            });
        }
        let pid = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if pid == 0 {
            return Err(LockError::CorruptRecord {
                key: key.to_string(),
                reason: "zero pid".to_string(),
            });
        }
        let mut time8 = [0u8; 8];
        time8.copy_from_slice(&bytes[8..16]);
        let acquired_at = i64::from_le_bytes(time8);
        time8.copy_from_slice(&bytes[16..24]);
        let process_start_time = i64::from_le_bytes(time8);
        Ok(Self {
            pid,
            acquired_at,
            process_start_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let record = LockRecord {
            pid: 4321,
            acquired_at: 1_700_000_000,
            process_start_time: 1_699_999_000,
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), LOCK_RECORD_SIZE);
        let parsed = LockRecord::from_bytes("lock.test", &bytes).expect("valid record");
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_padding_bytes_are_zero() {
        let record = LockRecord {
            pid: u32::MAX,
            acquired_at: i64::MAX,
            process_start_time: i64::MAX,
        };
        let bytes = record.to_bytes();
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_wrong_size_is_corrupt() {
        assert!(LockRecord::from_bytes("lock.test", &[0u8; 23]).is_err());
        assert!(LockRecord::from_bytes("lock.test", &[0u8; 25]).is_err());
    }

    #[test]
    fn test_zero_pid_is_corrupt() {
        let record = LockRecord {
            pid: 7,
            acquired_at: 1,
            process_start_time: 1,
        };
        let mut bytes = record.to_bytes();
        bytes[0..4].copy_from_slice(&0u32.to_le_bytes());
        assert!(LockRecord::from_bytes("lock.test", &bytes).is_err());
    }
}
