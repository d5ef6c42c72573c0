//! The hole-preserving block writer.
//!
//! Copied regular files keep their sparseness: a block that is entirely
//! zero is skipped over with a seek instead of written. If the file ends
//! in a hole the kernel would truncate it at the last actual write, so a
//! single byte is written and the file truncated back to the right
//! length to materialise the trailing hole.

use crate::error::{ClientError, ClientResult};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Writes a transfer stream into a staging file, eliding holes
#[derive(Debug)]
pub struct SparseWriter {
    file: File,
    path: String,
    preserve_holes: bool,
    last_write_made_hole: bool,
    total: u64,
}

impl SparseWriter {
    /// Creates the staging file exclusively, mode 0600. An existing file
    /// of that name is a failed race-exploit attempt and refuses the copy.
    pub fn create(path: &Path, preserve_holes: bool) -> ClientResult<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| ClientError::Io {
                operation: format!("create {}", path.display()),
                reason: e.to_string(),
            })?;
        Ok(Self {
            file,
            path: path.display().to_string(),
            preserve_holes,
            last_write_made_hole: false,
            total: 0,
        })
    }

    /// Writes one block, seeking over it instead when it is all zeros
    pub fn write_block(&mut self, block: &[u8]) -> ClientResult<()> {
        if block.is_empty() {
            return Ok(());
        }
        if self.preserve_holes && block.iter().all(|&b| b == 0) {
            self.file
                .seek(SeekFrom::Current(block.len() as i64))
                .map_err(|e| ClientError::Io {
                    operation: format!("seek in {}", self.path),
                    reason: e.to_string(),
                })?;
            self.last_write_made_hole = true;
        } else {
            self.file.write_all(block).map_err(|e| ClientError::Io {
                operation: format!("write {}", self.path),
                reason: e.to_string(),
            })?;
            self.last_write_made_hole = false;
        }
        self.total += block.len() as u64;
        Ok(())
    }

    /// Bytes accounted so far, written or elided
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Completes the stream. A trailing hole is materialised by writing
    /// one byte and truncating back to the accounted length.
    pub fn finish(mut self) -> ClientResult<u64> {
        if self.last_write_made_hole {
            self.file
                .write_all(&[0])
                .and_then(|_| self.file.set_len(self.total))
                .map_err(|e| ClientError::Io {
                    operation: format!("materialise trailing hole in {}", self.path),
                    reason: e.to_string(),
                })?;
        }
        self.file.flush().map_err(|e| ClientError::Io {
            operation: format!("flush {}", self.path),
            reason: e.to_string(),
        })?;
        Ok(self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    #[test]
    fn test_refuses_existing_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("staging");
        std::fs::write(&path, b"present").expect("seed file");
        assert!(SparseWriter::create(&path, true).is_err());
    }

    #[test]
    fn test_content_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("out");
        let mut writer = SparseWriter::create(&path, true).expect("creates");
        writer.write_block(b"hello ").expect("writes");
        writer.write_block(b"world").expect("writes");
        assert_eq!(writer.finish().expect("finishes"), 11);
        assert_eq!(std::fs::read(&path).expect("readable"), b"hello world");
    }

    #[test]
    fn test_interior_and_trailing_holes() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("sparse");
        let zeros = vec![0u8; 4096];
        let data = vec![b'x'; 4096];

        let mut writer = SparseWriter::create(&path, true).expect("creates");
        writer.write_block(&zeros).expect("hole");
        writer.write_block(&data).expect("data");
        writer.write_block(&zeros).expect("trailing hole");
        assert_eq!(writer.finish().expect("finishes"), 12288);

        let mut expected = vec![0u8; 4096];
        expected.extend_from_slice(&data);
        expected.extend_from_slice(&zeros);
        assert_eq!(std::fs::read(&path).expect("readable"), expected);

        let meta = std::fs::metadata(&path).expect("metadata");
        assert_eq!(meta.len(), 12288);
        // On filesystems supporting sparse files the holes occupy no blocks
        if meta.blocks() * 512 < 12288 {
            assert!(meta.blocks() * 512 <= 8192);
        }
    }

    #[test]
    fn test_holes_disabled_writes_zeros() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("dense");
        let zeros = vec![0u8; 1024];
        let mut writer = SparseWriter::create(&path, false).expect("creates");
        writer.write_block(&zeros).expect("writes");
        writer.finish().expect("finishes");
        assert_eq!(std::fs::read(&path).expect("readable"), zeros);
    }
}
