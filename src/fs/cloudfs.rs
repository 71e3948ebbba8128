//! Cloud FUSE Filesystem Implementation
//!
//! Implements the fuser::Filesystem trait on top of the file cache. Metadata
//! comes from the remote API through a TTL cache; file content is always
//! served from a verified local copy.

use std::ffi::OsStr;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use tracing::{debug, error, info, warn};

use super::handles::HandleTable;
use super::inode::{InodeTable, RemoteNode};
use super::leases::LeaseTable;
use crate::api::{
    directory_attr, file_attr, remote_file_to_attr, BlockingRemote, DirEntry, FolderKey, QuickKey,
    RemoteFileInfo,
};
use crate::cache::{
    status_of, AccessMode, CacheError, CachedFile, FileCache, MetadataCache, RemoteStore,
    RemoteVersion,
};

/// TTL for attributes and entries handed to the kernel
const TTL: Duration = Duration::from_secs(1);

/// Cloud Filesystem - mounts the remote account as a FUSE volume
pub struct CloudFilesystem {
    /// Inode table for path/inode mapping
    inode_table: InodeTable,
    /// Open file handles
    handles: HandleTable,
    /// Per-file reservations held by open handles
    leases: LeaseTable,
    /// TTL cache of remote metadata
    metadata: MetadataCache,
    /// Verified local copies of file content
    file_cache: FileCache,
    /// Remote API, blocking on the daemon's runtime
    remote: BlockingRemote,
}

impl CloudFilesystem {
    /// Create a new filesystem over a file cache and a remote
    pub fn new(file_cache: FileCache, remote: BlockingRemote) -> Self {
        Self {
            inode_table: InodeTable::new(),
            handles: HandleTable::new(),
            leases: LeaseTable::new(),
            metadata: MetadataCache::new(),
            file_cache,
            remote,
        }
    }

    /// Drop cached metadata if anything changed remotely
    fn refresh_device_status(&self) {
        match self.remote.block_on(self.remote.client().device_status()) {
            Ok(revision) => {
                self.metadata.observe_device_revision(revision);
            }
            Err(e) => warn!(error = %e, "Failed to get device status"),
        }
    }

    fn folder_key(&self, ino: u64) -> Result<FolderKey, i32> {
        match self.inode_table.get_node(ino) {
            Some(RemoteNode::Folder(key)) => Ok(key.clone()),
            Some(RemoteNode::File(_)) => Err(libc::ENOTDIR),
            None => Err(libc::ENOENT),
        }
    }

    fn quick_key(&self, ino: u64) -> Result<QuickKey, i32> {
        match self.inode_table.get_node(ino) {
            Some(RemoteNode::File(key)) => Ok(key.clone()),
            Some(RemoteNode::Folder(_)) => Err(libc::EISDIR),
            None => Err(libc::ENOENT),
        }
    }

    /// List directory contents, from the metadata cache when possible
    fn list_directory(&mut self, ino: u64) -> Result<Vec<DirEntry>, i32> {
        if let Some(entries) = self.metadata.get_dir(ino) {
            return Ok(entries);
        }

        let folder_key = self.folder_key(ino)?;
        let parent_path = self
            .inode_table
            .get_path(ino)
            .unwrap_or_default()
            .to_string();

        let (folders, files) = self
            .remote
            .block_on(self.remote.client().folder_content(&folder_key))
            .map_err(|e| {
                error!(folder = %folder_key, error = %e, "Failed to list remote folder");
                e.to_errno()
            })?;

        let mut entries = Vec::with_capacity(folders.len() + files.len());

        for folder in folders {
            let path = InodeTable::child_path(&parent_path, &folder.name);
            let child = self
                .inode_table
                .lookup_or_create(&path, RemoteNode::Folder(folder.folder_key));
            self.metadata
                .insert_attr(child, directory_attr(child, folder.created));
            entries.push(DirEntry {
                name: folder.name,
                ino: child,
                kind: FileType::Directory,
            });
        }

        for file in files {
            let path = InodeTable::child_path(&parent_path, &file.name);
            let child = self
                .inode_table
                .lookup_or_create(&path, RemoteNode::File(file.quick_key.clone()));
            self.metadata.insert_file_info(child, &file);
            entries.push(DirEntry {
                name: file.name,
                ino: child,
                kind: FileType::RegularFile,
            });
        }

        debug!(ino = ino, count = entries.len(), "Got remote folder listing");
        self.metadata.insert_dir(ino, entries.clone());
        Ok(entries)
    }

    /// Current remote metadata for a file, refreshing the cache
    fn fetch_file_info(&self, ino: u64, quick_key: &QuickKey) -> Result<RemoteFileInfo, i32> {
        let info = self.remote.file_info(quick_key).map_err(|e| {
            warn!(quick_key = %quick_key, error = %e, "Failed to get file info");
            e.to_errno()
        })?;
        self.metadata.insert_file_info(ino, &info);
        Ok(info)
    }

    /// Get file attributes for an inode
    fn get_attr_for_inode(&mut self, ino: u64) -> Result<FileAttr, i32> {
        // Local edits not yet uploaded decide the size
        if let Some(handle) = self.handles.find_writer(ino) {
            if handle.cached.is_dirty() {
                let len = handle.file.metadata().map_err(|e| io_errno(&e))?.len();
                return Ok(file_attr(ino, len, SystemTime::now()));
            }
        }

        if let Some(attr) = self.metadata.get_attr(ino) {
            return Ok(attr);
        }

        match self.inode_table.get_node(ino).cloned() {
            None => Err(libc::ENOENT),
            Some(RemoteNode::Folder(_)) => {
                let attr = directory_attr(ino, 0);
                self.metadata.insert_attr(ino, attr);
                Ok(attr)
            }
            Some(RemoteNode::File(quick_key)) => self
                .fetch_file_info(ino, &quick_key)
                .map(|info| remote_file_to_attr(ino, &info)),
        }
    }

    /// Bring the local copy of a file up to the current remote revision
    fn open_cache_entry(
        &self,
        ino: u64,
        quick_key: &QuickKey,
        mode: AccessMode,
    ) -> Result<CachedFile, i32> {
        let info = self.fetch_file_info(ino, quick_key)?;
        let target = RemoteVersion::from_info(&info)
            .map_err(|e| cache_errno("open", quick_key, e))?;

        // A copy left from an earlier run has no recorded revision; it is
        // checked against the current one.
        let local_revision = self
            .file_cache
            .local_revision(quick_key)
            .unwrap_or(target.revision);

        self.file_cache
            .open_file(&self.remote, quick_key, local_revision, target, mode)
            .map_err(|e| cache_errno("open", quick_key, e))
    }

    fn open_handle(&mut self, ino: u64, quick_key: &QuickKey, mode: AccessMode) -> Result<u64, i32> {
        let cached = self.open_cache_entry(ino, quick_key, mode)?;
        self.handles.open(ino, cached).map_err(|e| io_errno(&e))
    }

    /// Truncate through an open writable handle, or through a short-lived one
    fn truncate(&mut self, ino: u64, fh: Option<u64>, size: u64) -> Result<(), i32> {
        let handle = match fh {
            Some(fh) => self.handles.get_mut(fh).filter(|h| h.is_write()),
            None => self.handles.find_writer(ino),
        };

        if let Some(handle) = handle {
            let quick_key = handle.cached.quick_key.clone();
            self.file_cache
                .truncate_file(&self.remote, &mut handle.cached, size)
                .map_err(|e| cache_errno("truncate", &quick_key, e))?;
            self.metadata
                .insert_attr(ino, file_attr(ino, size, SystemTime::now()));
            return Ok(());
        }

        // truncate(2) on a file nobody has open
        let quick_key = self.quick_key(ino)?;
        if !self.leases.acquire(&quick_key, AccessMode::ReadWrite) {
            return Err(libc::EBUSY);
        }
        let result = self.truncate_unopened(ino, &quick_key, size);
        self.leases.release(&quick_key, AccessMode::ReadWrite);
        result
    }

    fn truncate_unopened(&self, ino: u64, quick_key: &QuickKey, size: u64) -> Result<(), i32> {
        let mut cached = self.open_cache_entry(ino, quick_key, AccessMode::ReadWrite)?;
        self.file_cache
            .truncate_file(&self.remote, &mut cached, size)
            .map_err(|e| cache_errno("truncate", quick_key, e))?;
        self.file_cache
            .upload_patch(&self.remote, &mut cached)
            .map_err(|e| cache_errno("upload", quick_key, e))?;
        self.metadata.invalidate(ino);
        Ok(())
    }

    /// Upload pending edits of a handle
    ///
    /// # Returns
    /// 0 on success, -errno on failure
    fn sync_handle(&mut self, fh: u64) -> i32 {
        let Some(handle) = self.handles.get_mut(fh) else {
            return -libc::EBADF;
        };
        if !handle.cached.is_dirty() {
            return 0;
        }

        if let Err(e) = handle.file.sync_all() {
            return -io_errno(&e);
        }

        let result = self
            .file_cache
            .upload_patch(&self.remote, &mut handle.cached);
        match &result {
            Ok(revision) => {
                self.metadata.invalidate(handle.ino);
                debug!(fh = fh, revision = revision, "Handle synchronized");
            }
            Err(e) => {
                error!(
                    fh = fh,
                    quick_key = %handle.cached.quick_key,
                    error = %e,
                    "Failed to upload local edits"
                );
            }
        }
        status_of(&result)
    }
}

/// Access mode requested by open(2) flags
fn access_mode(flags: i32) -> AccessMode {
    if flags & libc::O_ACCMODE == libc::O_RDONLY {
        AccessMode::ReadOnly
    } else {
        AccessMode::ReadWrite
    }
}

fn io_errno(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn cache_errno(op: &'static str, quick_key: &QuickKey, err: CacheError) -> i32 {
    warn!(op = op, quick_key = %quick_key, error = %err, "Cache operation failed");
    err.to_errno()
}

/// Read up to `buf.len()` bytes at `offset`, stopping early only at EOF
fn read_at_most(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl Filesystem for CloudFilesystem {
    /// Get file attributes
    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!(ino = ino, "getattr");

        match self.get_attr_for_inode(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => {
                warn!(ino = ino, errno = errno, "getattr failed");
                reply.error(errno);
            }
        }
    }

    /// Look up a file by name in a directory
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        debug!(parent = parent, name = name, "lookup");

        let entries = match self.list_directory(parent) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let Some(ino) = entries.iter().find(|e| e.name == name).map(|e| e.ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        match self.get_attr_for_inode(ino) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    /// Only size changes are honored; other attributes are reported unchanged
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(ino = ino, size = ?size, fh = ?fh, "setattr");

        if let Some(size) = size {
            if let Err(errno) = self.truncate(ino, fh, size) {
                reply.error(errno);
                return;
            }
        }

        match self.get_attr_for_inode(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    /// Read directory contents
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!(ino = ino, offset = offset, "readdir");

        let entries = match self.list_directory(ino) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let dots = [
            DirEntry {
                name: ".".to_string(),
                ino,
                kind: FileType::Directory,
            },
            DirEntry {
                name: "..".to_string(),
                ino: self.inode_table.get_parent_ino(ino),
                kind: FileType::Directory,
            },
        ];

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, entry) in dots.iter().chain(entries.iter()).enumerate().skip(skip) {
            // reply.add returns true if buffer is full
            let buffer_full = reply.add(
                entry.ino,
                (i + 1) as i64, // offset for next entry
                entry.kind,
                &entry.name,
            );

            if buffer_full {
                break;
            }
        }

        reply.ok();
    }

    /// Open a directory
    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!(ino = ino, "opendir");

        let folder_key = match self.folder_key(ino) {
            Ok(key) => key,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        // Remote changes are picked up when the root is opened
        if folder_key.is_root() {
            self.refresh_device_status();
        }

        // No per-open directory state
        reply.opened(0, 0);
    }

    /// Release (close) a directory
    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        debug!(ino = ino, "releasedir");
        reply.ok();
    }

    /// Open a file, making sure a verified local copy exists
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let mode = access_mode(flags);
        debug!(ino = ino, mode = ?mode, "open");

        let quick_key = match self.quick_key(ino) {
            Ok(key) => key,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        if !self.leases.acquire(&quick_key, mode) {
            reply.error(libc::EBUSY);
            return;
        }

        match self.open_handle(ino, &quick_key, mode) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => {
                self.leases.release(&quick_key, mode);
                reply.error(errno);
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!(ino = ino, fh = fh, offset = offset, size = size, "read");

        let Some(handle) = self.handles.get(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };

        let mut buf = vec![0u8; size as usize];
        match read_at_most(&handle.file, &mut buf, offset) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!(ino = ino, fh = fh, offset = offset, len = data.len(), "write");

        let Some(handle) = self.handles.get_mut(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        if !handle.is_write() {
            reply.error(libc::EBADF);
            return;
        }
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };

        if let Err(e) = handle.file.write_all_at(data, offset) {
            reply.error(io_errno(&e));
            return;
        }
        if let Err(e) = self.file_cache.mark_dirty(&mut handle.cached, offset) {
            reply.error(e.to_errno());
            return;
        }

        let len = handle
            .file
            .metadata()
            .map(|m| m.len())
            .unwrap_or(offset + data.len() as u64);
        self.metadata
            .insert_attr(ino, file_attr(ino, len, SystemTime::now()));

        reply.written(data.len() as u32);
    }

    /// Upload local edits when a descriptor is closed
    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        debug!(ino = ino, fh = fh, "flush");

        match self.sync_handle(fh) {
            0 => reply.ok(),
            status => reply.error(-status),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        debug!(ino = ino, fh = fh, "fsync");

        match self.sync_handle(fh) {
            0 => reply.ok(),
            status => reply.error(-status),
        }
    }

    /// Release a file handle, uploading anything flush did not
    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!(ino = ino, fh = fh, "release");

        let status = self.sync_handle(fh);

        if let Some(handle) = self.handles.close(fh) {
            if handle.cached.is_dirty() {
                warn!(
                    quick_key = %handle.cached.quick_key,
                    base = handle.cached.local_revision,
                    remote = handle.cached.remote_revision,
                    "Closing handle with edits that were not uploaded"
                );
            }
            self.leases
                .release(&handle.cached.quick_key, handle.cached.mode);
        }

        match status {
            0 => reply.ok(),
            status => reply.error(-status),
        }
    }

    fn destroy(&mut self) {
        if !self.handles.is_empty() {
            warn!(open = self.handles.len(), "Unmounting with open file handles");
        }
        self.metadata.log_metrics();
        info!(cache_dir = %self.file_cache.cache_dir().display(), "Filesystem unmounted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_access_mode_from_flags() {
        assert_eq!(access_mode(libc::O_RDONLY), AccessMode::ReadOnly);
        assert_eq!(access_mode(libc::O_RDONLY | libc::O_NONBLOCK), AccessMode::ReadOnly);
        assert_eq!(access_mode(libc::O_WRONLY), AccessMode::ReadWrite);
        assert_eq!(access_mode(libc::O_RDWR | libc::O_APPEND), AccessMode::ReadWrite);
    }

    #[test]
    fn test_read_at_most_stops_at_eof() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello world").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(read_at_most(tmp.as_file(), &mut buf, 6).unwrap(), 5);
        assert_eq!(&buf[..5], b"world");
        assert_eq!(read_at_most(tmp.as_file(), &mut buf, 0).unwrap(), 8);
        assert_eq!(read_at_most(tmp.as_file(), &mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn test_io_errno() {
        let err = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(io_errno(&err), libc::ENOSPC);
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(io_errno(&err), libc::EIO);
    }
}
