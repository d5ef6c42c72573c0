//! Hard-link topology preservation during one recursive copy.
//!
//! The first time a multiply-linked source inode is copied, its
//! destination path is recorded under `(device, inode)`. Every later copy
//! of the same inode links to that first destination instead of copying
//! again, so the source's link structure survives within a single
//! recursive descent. The cache is not kept across runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// `(device, inode) → first destination path`
#[derive(Debug, Default)]
pub struct HardLinkCache {
    entries: HashMap<(u64, u64), PathBuf>,
}

impl HardLinkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the first destination for an inode. Returns false when the
    /// inode already has a root destination (the caller links instead).
    pub fn register(&mut self, dev: u64, ino: u64, destination: &Path) -> bool {
        match self.entries.entry((dev, ino)) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(destination.to_path_buf());
                true
            }
        }
    }

    /// The recorded first destination for an inode
    pub fn first_destination(&self, dev: u64, ino: u64) -> Option<&Path> {
        self.entries.get(&(dev, ino)).map(PathBuf::as_path)
    }

    /// Number of tracked inodes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_destination_wins() {
        let mut cache = HardLinkCache::new();
        assert!(cache.register(1, 100, Path::new("/dst/a")));
        assert!(!cache.register(1, 100, Path::new("/dst/b")));
        assert_eq!(
            cache.first_destination(1, 100),
            Some(Path::new("/dst/a"))
        );
    }

    #[test]
    fn test_device_distinguishes_inodes() {
        let mut cache = HardLinkCache::new();
        cache.register(1, 100, Path::new("/dst/a"));
        assert!(cache.first_destination(2, 100).is_none());
    }
}
