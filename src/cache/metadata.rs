//! Metadata Cache Implementation
//!
//! TTL cache for file attributes and directory listings, using Moka.
//! Synchronous to match FUSE callback semantics. The whole cache is dropped
//! whenever the account's device revision moves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fuser::FileAttr;
use moka::sync::Cache;
use tracing::{debug, info, trace};

use crate::api::{remote_file_to_attr, DirEntry, RemoteFileInfo};

/// Sentinel for "no device revision observed yet"
const NO_DEVICE_REVISION: u64 = u64::MAX;

/// Attribute and directory listing caches, 10 and 5 minute TTLs
pub struct MetadataCache {
    /// Cache for file attributes by inode
    attr_cache: Cache<u64, FileAttr>,
    /// Cache for directory listings by inode (without `.` and `..`)
    dir_cache: Cache<u64, Vec<DirEntry>>,
    /// Last device revision seen from the remote
    device_revision: AtomicU64,
}

impl MetadataCache {
    /// Create a new metadata cache with default TTLs
    pub fn new() -> Self {
        Self::with_ttls(
            Duration::from_secs(600), // 10 minutes for attributes
            Duration::from_secs(300), // 5 minutes for directories
        )
    }

    /// Create a cache with custom TTLs
    ///
    /// # Arguments
    /// * `attr_ttl` - TTL for file attributes
    /// * `dir_ttl` - TTL for directory listings
    pub fn with_ttls(attr_ttl: Duration, dir_ttl: Duration) -> Self {
        let attr_cache = Cache::builder()
            .time_to_live(attr_ttl)
            .name("file_attr_cache")
            .build();

        let dir_cache = Cache::builder()
            .time_to_live(dir_ttl)
            .name("dir_listing_cache")
            .build();

        Self {
            attr_cache,
            dir_cache,
            device_revision: AtomicU64::new(NO_DEVICE_REVISION),
        }
    }

    /// Get file attributes from cache
    pub fn get_attr(&self, ino: u64) -> Option<FileAttr> {
        let attr = self.attr_cache.get(&ino);
        trace!(ino = ino, hit = attr.is_some(), "Attribute cache lookup");
        attr
    }

    /// Insert file attributes into cache
    pub fn insert_attr(&self, ino: u64, attr: FileAttr) {
        self.attr_cache.insert(ino, attr);
        trace!(ino = ino, "Cached file attributes");
    }

    /// Insert file attributes from remote file info
    pub fn insert_file_info(&self, ino: u64, file_info: &RemoteFileInfo) {
        self.insert_attr(ino, remote_file_to_attr(ino, file_info));
    }

    /// Get directory listing from cache (without `.` and `..`)
    pub fn get_dir(&self, ino: u64) -> Option<Vec<DirEntry>> {
        let entries = self.dir_cache.get(&ino);
        trace!(ino = ino, hit = entries.is_some(), "Directory cache lookup");
        entries
    }

    /// Insert directory listing into cache
    pub fn insert_dir(&self, ino: u64, entries: Vec<DirEntry>) {
        debug!(ino = ino, entries = entries.len(), "Cached directory listing");
        self.dir_cache.insert(ino, entries);
    }

    /// Invalidate a specific inode's cached metadata
    ///
    /// Call this when file metadata changes.
    pub fn invalidate(&self, ino: u64) {
        self.attr_cache.invalidate(&ino);
        self.dir_cache.invalidate(&ino);
        debug!(ino = ino, "Invalidated cache for inode");
    }

    /// Record the remote device revision
    ///
    /// Any change means something moved remotely; every cached entry is
    /// dropped.
    ///
    /// # Returns
    /// true if the caches were cleared
    pub fn observe_device_revision(&self, revision: u64) -> bool {
        let previous = self.device_revision.swap(revision, Ordering::AcqRel);
        if previous == revision {
            return false;
        }

        if previous != NO_DEVICE_REVISION {
            info!(
                previous = previous,
                current = revision,
                "Remote changed, dropping cached metadata"
            );
            self.clear();
        }
        previous != NO_DEVICE_REVISION
    }

    /// Drop every cached attribute and listing
    pub fn clear(&self) {
        self.attr_cache.invalidate_all();
        self.dir_cache.invalidate_all();
        debug!("Cleared all metadata caches");
    }

    /// Log what the cache holds, on unmount
    pub fn log_metrics(&self) {
        let device_revision = self.device_revision.load(Ordering::Acquire);
        info!(
            attr_entries = self.attr_cache.entry_count(),
            dir_entries = self.dir_cache.entry_count(),
            device_revision = (device_revision != NO_DEVICE_REVISION).then_some(device_revision),
            "Metadata cache state"
        );
    }
}

impl Default for MetadataCache {
    fn default() -> Self {
        Self::new()
    }
}
