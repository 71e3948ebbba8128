//! File Handle Tracking
//!
//! Manages open file handles for the FUSE filesystem.
//! Each open() call creates a handle, read()/write() use it, release() removes it.

use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::cache::{AccessMode, CachedFile};

/// Represents an open file handle
pub struct FileHandle {
    /// Inode number of the open file
    pub ino: u64,
    /// Cache engine state for this open
    pub cached: CachedFile,
    /// Open file descriptor for the local copy
    pub file: File,
}

impl FileHandle {
    pub fn is_write(&self) -> bool {
        self.cached.mode == AccessMode::ReadWrite
    }
}

/// Manages all open file handles
pub struct HandleTable {
    /// Map from file handle ID to FileHandle
    handles: HashMap<u64, FileHandle>,
    /// Next file handle ID to assign
    next_fh: AtomicU64,
}

impl HandleTable {
    /// Create a new empty handle table
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            // Start at 1 (0 is sometimes special in FUSE)
            next_fh: AtomicU64::new(1),
        }
    }

    /// Open the local copy behind a cached file and return a file handle ID
    ///
    /// # Arguments
    /// * `ino` - Inode number of the file
    /// * `cached` - Verified cache entry from the file cache
    ///
    /// # Returns
    /// File handle ID
    pub fn open(&mut self, ino: u64, cached: CachedFile) -> std::io::Result<u64> {
        let file = match cached.mode {
            AccessMode::ReadOnly => File::open(&cached.local_path)?,
            AccessMode::ReadWrite => File::options()
                .read(true)
                .write(true)
                .open(&cached.local_path)?,
        };

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);

        debug!(
            fh = fh,
            ino = ino,
            quick_key = %cached.quick_key,
            mode = ?cached.mode,
            "Opened file handle"
        );

        self.handles.insert(fh, FileHandle { ino, cached, file });
        Ok(fh)
    }

    /// Get a reference to a file handle
    pub fn get(&self, fh: u64) -> Option<&FileHandle> {
        self.handles.get(&fh)
    }

    /// Get a mutable reference to a file handle
    pub fn get_mut(&mut self, fh: u64) -> Option<&mut FileHandle> {
        self.handles.get_mut(&fh)
    }

    /// Find an open writable handle for an inode
    pub fn find_writer(&mut self, ino: u64) -> Option<&mut FileHandle> {
        self.handles
            .values_mut()
            .find(|h| h.ino == ino && h.is_write())
    }

    /// Close a file handle and return the handle data
    ///
    /// The caller is responsible for any upload/cleanup actions.
    pub fn close(&mut self, fh: u64) -> Option<FileHandle> {
        let handle = self.handles.remove(&fh);
        if let Some(ref h) = handle {
            debug!(
                fh = fh,
                ino = h.ino,
                quick_key = %h.cached.quick_key,
                state = ?h.cached.state(),
                "Closed file handle"
            );
        }
        handle
    }

    /// Get the number of open handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if there are no open handles
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
