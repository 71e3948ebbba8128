//! Local File Cache
//!
//! Keeps one verified blob per remote file on local disk and decides on every
//! open whether the blob can be served, must be re-downloaded, or is stale.
//! Local edits are turned into patches and uploaded on flush.
//!
//! A blob is only handed out after it passed integrity verification for the
//! revision it claims to represent.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::errors::CacheError;
use super::hash::{sha256_file, ContentHash};
use super::integrity;
use super::patch::{build_patch, Patch, SizeDelta};
use crate::api::{ApiError, QuickKey, RemoteFileInfo};

/// Remote operations the cache needs; every call blocks until done
pub trait RemoteStore {
    /// Download the current content of a file into `dest`
    fn download(&self, quick_key: &QuickKey, dest: &mut File) -> Result<u64, ApiError>;

    /// Fetch current metadata (revision, size, hash) of a file
    fn file_info(&self, quick_key: &QuickKey) -> Result<RemoteFileInfo, ApiError>;

    /// Upload a patch; returns the new remote revision
    fn upload_patch(&self, quick_key: &QuickKey, upload: &PatchUpload<'_>) -> Result<u64, ApiError>;
}

/// A patch plus the revision it applies to and the content it produces
#[derive(Debug)]
pub struct PatchUpload<'a> {
    pub base_revision: u64,
    pub base_hash: &'a ContentHash,
    pub patch: &'a Patch,
    pub target_hash: ContentHash,
    pub target_size: u64,
}

/// What the remote reports for its current revision of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteVersion {
    pub revision: u64,
    pub size: u64,
    pub hash: ContentHash,
}

impl RemoteVersion {
    /// Extract the version from file metadata; files without a hash are rejected
    pub fn from_info(info: &RemoteFileInfo) -> Result<Self, CacheError> {
        let hash = info.hash.ok_or_else(|| {
            CacheError::InvalidArgument(format!("remote reports no hash for {}", info.quick_key))
        })?;
        Ok(Self {
            revision: info.revision,
            size: info.size,
            hash,
        })
    }
}

/// Requested access for an open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Lifecycle of a cached file within one open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Absent,
    Downloading,
    Valid,
    Dirty,
    Uploading,
}

/// Last verified revision of a blob
#[derive(Debug, Clone, Copy)]
struct Baseline {
    revision: u64,
    size: u64,
    hash: ContentHash,
}

/// Per-handle view of one cached remote file
#[derive(Debug)]
pub struct CachedFile {
    pub quick_key: QuickKey,
    /// Revision the blob was downloaded from or last synchronized to
    pub local_revision: u64,
    /// Revision believed current on the server
    pub remote_revision: u64,
    pub expected_size: u64,
    pub expected_hash: ContentHash,
    pub local_path: PathBuf,
    pub mode: AccessMode,
    state: CacheState,
    /// Lowest offset whose content may differ from `local_revision`
    dirty_from: Option<u64>,
}

impl CachedFile {
    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state == CacheState::Dirty
    }

    fn set_version(&mut self, version: RemoteVersion) {
        self.remote_revision = version.revision;
        self.expected_size = version.size;
        self.expected_hash = version.hash;
    }
}

/// Local disk cache of remote file content
pub struct FileCache {
    /// Root directory for cached blobs
    cache_dir: PathBuf,
    /// Verified revision per key, for this session only
    baselines: Mutex<HashMap<QuickKey, Baseline>>,
}

impl FileCache {
    /// Create a file cache rooted at `cache_dir`
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("Failed to create cache directory: {:?}", cache_dir))?;

        let cache = Self {
            cache_dir,
            baselines: Mutex::new(HashMap::new()),
        };

        // Clean up any stale temp files from previous runs
        cache.cleanup();

        info!(cache_dir = %cache.cache_dir.display(), "File cache initialized");
        Ok(cache)
    }

    /// Open a remote file through the cache
    ///
    /// # Arguments
    /// * `remote` - Remote store used when the blob must be (re)downloaded
    /// * `quick_key` - Remote file identifier
    /// * `local_revision` - Revision the caller believes the local blob holds
    /// * `target` - Current remote revision with its size and hash
    /// * `mode` - Requested access
    ///
    /// # Returns
    /// A handle whose blob is verified for `target.revision`
    pub fn open_file<R: RemoteStore + ?Sized>(
        &self,
        remote: &R,
        quick_key: &QuickKey,
        local_revision: u64,
        target: RemoteVersion,
        mode: AccessMode,
    ) -> Result<CachedFile, CacheError> {
        let mut handle = CachedFile {
            quick_key: quick_key.clone(),
            local_revision,
            remote_revision: target.revision,
            expected_size: target.size,
            expected_hash: target.hash,
            local_path: self.path_for(quick_key),
            mode,
            state: CacheState::Absent,
            dirty_from: None,
        };

        if handle.local_path.exists() {
            if local_revision == target.revision {
                match integrity::verify(&handle.local_path, target.size, &target.hash) {
                    Ok(()) => {
                        debug!(quick_key = %quick_key, revision = local_revision, "File cache HIT");
                        handle.state = CacheState::Valid;
                        self.record_baseline(&handle);
                        return Ok(handle);
                    }
                    Err(e) => {
                        warn!(quick_key = %quick_key, error = %e, "Cached copy failed verification, discarding");
                    }
                }
            } else {
                debug!(
                    quick_key = %quick_key,
                    local = local_revision,
                    remote = target.revision,
                    "Cached copy is stale, discarding"
                );
            }
            self.evict(quick_key)?;
        }

        debug!(quick_key = %quick_key, size = target.size, "File cache MISS, downloading");
        self.fetch(remote, &mut handle)?;
        Ok(handle)
    }

    /// Truncate (or extend) a cached file
    ///
    /// The remote revision is queried first; a blob the server has moved past
    /// is refreshed before truncating, unless it already holds local edits.
    pub fn truncate_file<R: RemoteStore + ?Sized>(
        &self,
        remote: &R,
        handle: &mut CachedFile,
        new_size: u64,
    ) -> Result<(), CacheError> {
        if handle.mode != AccessMode::ReadWrite {
            return Err(CacheError::InvalidArgument(format!(
                "{} is not open for writing",
                handle.quick_key
            )));
        }

        let info = remote.file_info(&handle.quick_key).map_err(CacheError::Remote)?;
        if info.revision != handle.local_revision {
            if handle.is_dirty() {
                handle.remote_revision = info.revision;
                return Err(CacheError::RevisionConflict {
                    quick_key: handle.quick_key.to_string(),
                    base_revision: handle.local_revision,
                    remote_revision: info.revision,
                });
            }

            info!(
                quick_key = %handle.quick_key,
                local = handle.local_revision,
                remote = info.revision,
                "Remote moved ahead, refreshing before truncate"
            );
            handle.set_version(RemoteVersion::from_info(&info)?);
            self.refetch_in_place(remote, handle)?;
        }

        let current_len = fs::metadata(&handle.local_path)?.len();
        OpenOptions::new()
            .write(true)
            .open(&handle.local_path)?
            .set_len(new_size)?;

        debug!(
            quick_key = %handle.quick_key,
            from = current_len,
            to = new_size,
            "Truncated cached file"
        );
        self.mark_dirty(handle, current_len.min(new_size))
    }

    /// Record a local modification starting at `offset`
    pub fn mark_dirty(&self, handle: &mut CachedFile, offset: u64) -> Result<(), CacheError> {
        if handle.mode != AccessMode::ReadWrite {
            return Err(CacheError::InvalidArgument(format!(
                "{} is not open for writing",
                handle.quick_key
            )));
        }
        handle.dirty_from = Some(handle.dirty_from.map_or(offset, |from| from.min(offset)));
        handle.state = CacheState::Dirty;
        Ok(())
    }

    /// Sizes before and after local edits
    ///
    /// # Returns
    /// `(old_size, new_size)`: the verified size at `local_revision` and the
    /// current on-disk size
    pub fn get_new_and_old_sizes(
        &self,
        quick_key: &QuickKey,
        local_revision: u64,
    ) -> Result<(u64, u64), CacheError> {
        let baseline = self.baseline_at(quick_key, local_revision)?;
        let new_size = fs::metadata(self.path_for(quick_key))?.len();
        Ok((baseline.size, new_size))
    }

    /// Upload local edits of a dirty handle as a patch
    ///
    /// # Returns
    /// The revision the handle is synchronized to afterwards
    pub fn upload_patch<R: RemoteStore + ?Sized>(
        &self,
        remote: &R,
        handle: &mut CachedFile,
    ) -> Result<u64, CacheError> {
        if !handle.is_dirty() {
            return Ok(handle.local_revision);
        }

        let baseline = self.baseline_at(&handle.quick_key, handle.local_revision)?;
        let (old_size, new_size) =
            self.get_new_and_old_sizes(&handle.quick_key, handle.local_revision)?;
        let patch = build_patch(
            SizeDelta::new(old_size, new_size),
            &baseline.hash,
            handle.dirty_from,
            &handle.local_path,
        )?;

        if patch == Patch::Unchanged {
            debug!(quick_key = %handle.quick_key, "No effective change, skipping upload");
            handle.state = CacheState::Valid;
            handle.dirty_from = None;
            return Ok(handle.local_revision);
        }

        let (target_hash, target_size) = sha256_file(&handle.local_path)?;
        let upload = PatchUpload {
            base_revision: handle.local_revision,
            base_hash: &baseline.hash,
            patch: &patch,
            target_hash,
            target_size,
        };

        handle.state = CacheState::Uploading;
        match remote.upload_patch(&handle.quick_key, &upload) {
            Ok(new_revision) => {
                handle.local_revision = new_revision;
                handle.set_version(RemoteVersion {
                    revision: new_revision,
                    size: target_size,
                    hash: target_hash,
                });
                handle.state = CacheState::Valid;
                handle.dirty_from = None;
                self.record_baseline(handle);
                info!(quick_key = %handle.quick_key, revision = new_revision, "Local edits synchronized");
                Ok(new_revision)
            }
            Err(ApiError::RevisionConflict {
                base_revision,
                remote_revision,
            }) => {
                handle.state = CacheState::Dirty;
                handle.remote_revision = remote_revision;
                Err(CacheError::RevisionConflict {
                    quick_key: handle.quick_key.to_string(),
                    base_revision,
                    remote_revision,
                })
            }
            Err(e) => {
                handle.state = CacheState::Dirty;
                Err(CacheError::Remote(e))
            }
        }
    }

    /// Revision of the last verified blob for a key, if any this session
    pub fn local_revision(&self, quick_key: &QuickKey) -> Option<u64> {
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(quick_key)
            .map(|b| b.revision)
    }

    /// Drop a cached blob and its recorded revision
    pub fn evict(&self, quick_key: &QuickKey) -> Result<(), CacheError> {
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(quick_key);

        let local_path = self.path_for(quick_key);
        match fs::remove_file(&local_path) {
            Ok(()) => {
                debug!(quick_key = %quick_key, "Evicted cached file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    /// Clean up stale temp files on startup
    pub fn cleanup(&self) {
        // Remove any .tmp files left from interrupted downloads
        if let Ok(read_dir) = fs::read_dir(&self.cache_dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    /// Get the cache directory path
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Deterministic blob location for a key
    pub fn path_for(&self, quick_key: &QuickKey) -> PathBuf {
        self.cache_dir.join(quick_key.as_str())
    }

    /// Download, verify and atomically install the blob for `handle`
    fn fetch<R: RemoteStore + ?Sized>(
        &self,
        remote: &R,
        handle: &mut CachedFile,
    ) -> Result<(), CacheError> {
        let tmp = self.download_verified(remote, handle)?;
        tmp.persist(&handle.local_path).map_err(|e| CacheError::Io(e.error))?;
        self.finish_fetch(handle);
        Ok(())
    }

    /// Replace the content of an existing blob with the current remote copy
    ///
    /// The blob keeps its inode, so descriptors already open on it observe
    /// the new content.
    fn refetch_in_place<R: RemoteStore + ?Sized>(
        &self,
        remote: &R,
        handle: &mut CachedFile,
    ) -> Result<(), CacheError> {
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.quick_key);

        let mut tmp = self.download_verified(remote, handle)?;
        let source = tmp.as_file_mut();
        source.seek(SeekFrom::Start(0))?;

        let mut blob = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&handle.local_path)?;
        blob.set_len(0)?;
        io::copy(source, &mut blob)?;
        blob.sync_all()?;

        self.finish_fetch(handle);
        Ok(())
    }

    /// Download into a temp file in the cache dir and verify it
    ///
    /// The temp file is removed on drop if anything fails.
    fn download_verified<R: RemoteStore + ?Sized>(
        &self,
        remote: &R,
        handle: &mut CachedFile,
    ) -> Result<NamedTempFile, CacheError> {
        handle.state = CacheState::Downloading;

        let mut tmp = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".tmp")
            .tempfile_in(&self.cache_dir)?;

        if let Err(e) = remote.download(&handle.quick_key, tmp.as_file_mut()) {
            handle.state = CacheState::Absent;
            return Err(CacheError::DownloadFailed(e));
        }

        if let Err(e) = integrity::verify(tmp.path(), handle.expected_size, &handle.expected_hash) {
            handle.state = CacheState::Absent;
            return Err(CacheError::IntegrityFailed(e));
        }
        Ok(tmp)
    }

    fn finish_fetch(&self, handle: &mut CachedFile) {
        handle.local_revision = handle.remote_revision;
        handle.state = CacheState::Valid;
        self.record_baseline(handle);

        debug!(
            quick_key = %handle.quick_key,
            revision = handle.local_revision,
            local = %handle.local_path.display(),
            "Stored verified file in cache"
        );
    }

    fn record_baseline(&self, handle: &CachedFile) {
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                handle.quick_key.clone(),
                Baseline {
                    revision: handle.local_revision,
                    size: handle.expected_size,
                    hash: handle.expected_hash,
                },
            );
    }

    fn baseline_at(&self, quick_key: &QuickKey, revision: u64) -> Result<Baseline, CacheError> {
        self.baselines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(quick_key)
            .filter(|b| b.revision == revision)
            .copied()
            .ok_or_else(|| {
                CacheError::InvalidArgument(format!(
                    "no verified copy of {} at revision {}",
                    quick_key, revision
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::FolderKey;
    use std::io::{Seek, SeekFrom, Write};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-memory remote holding one file
    struct MockRemote {
        content: Mutex<Vec<u8>>,
        revision: Mutex<u64>,
        downloads: AtomicU32,
        uploads: Mutex<Vec<(u64, Patch)>>,
        corrupt_downloads: AtomicBool,
    }

    impl MockRemote {
        fn new(content: &[u8], revision: u64) -> Self {
            Self {
                content: Mutex::new(content.to_vec()),
                revision: Mutex::new(revision),
                downloads: AtomicU32::new(0),
                uploads: Mutex::new(Vec::new()),
                corrupt_downloads: AtomicBool::new(false),
            }
        }

        fn version(&self) -> RemoteVersion {
            let content = self.content.lock().unwrap();
            RemoteVersion {
                revision: *self.revision.lock().unwrap(),
                size: content.len() as u64,
                hash: ContentHash::of_bytes(&content),
            }
        }

        /// Someone else changes the file remotely
        fn replace(&self, content: &[u8]) {
            *self.content.lock().unwrap() = content.to_vec();
            *self.revision.lock().unwrap() += 1;
        }

        fn downloads(&self) -> u32 {
            self.downloads.load(Ordering::SeqCst)
        }
    }

    impl RemoteStore for MockRemote {
        fn download(&self, _quick_key: &QuickKey, dest: &mut File) -> Result<u64, ApiError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            let mut data = self.content.lock().unwrap().clone();
            if self.corrupt_downloads.load(Ordering::SeqCst) && !data.is_empty() {
                data[0] ^= 0xff;
            }
            dest.write_all(&data).unwrap();
            Ok(data.len() as u64)
        }

        fn file_info(&self, quick_key: &QuickKey) -> Result<RemoteFileInfo, ApiError> {
            let version = self.version();
            Ok(RemoteFileInfo {
                quick_key: quick_key.clone(),
                name: "file.bin".to_string(),
                hash: Some(version.hash),
                parent: FolderKey::root(),
                created: 0,
                revision: version.revision,
                size: version.size,
            })
        }

        fn upload_patch(
            &self,
            _quick_key: &QuickKey,
            upload: &PatchUpload<'_>,
        ) -> Result<u64, ApiError> {
            let mut revision = self.revision.lock().unwrap();
            if upload.base_revision != *revision {
                return Err(ApiError::RevisionConflict {
                    base_revision: upload.base_revision,
                    remote_revision: *revision,
                });
            }

            let mut content = self.content.lock().unwrap();
            match upload.patch {
                Patch::Unchanged => {}
                Patch::Append { offset, bytes } => {
                    content.truncate(*offset as usize);
                    content.extend_from_slice(bytes);
                }
                Patch::Truncate { new_size } => content.truncate(*new_size as usize),
                Patch::Replace { bytes } => *content = bytes.clone(),
            }
            assert_eq!(ContentHash::of_bytes(&content), upload.target_hash);

            *revision += 1;
            self.uploads
                .lock()
                .unwrap()
                .push((upload.base_revision, upload.patch.clone()));
            Ok(*revision)
        }
    }

    fn key() -> QuickKey {
        QuickKey::new("abcdefghijk").unwrap()
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    fn setup(data: &[u8], revision: u64) -> (tempfile::TempDir, FileCache, MockRemote) {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().join("cache")).unwrap();
        (dir, cache, MockRemote::new(data, revision))
    }

    #[test]
    fn test_open_absent_downloads_and_verifies() {
        let data = content(300);
        let (_dir, cache, remote) = setup(&data, 1);

        let handle = cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadOnly)
            .unwrap();

        assert_eq!(remote.downloads(), 1);
        assert_eq!(handle.state(), CacheState::Valid);
        assert_eq!(handle.local_revision, 1);
        assert_eq!(fs::read(&handle.local_path).unwrap(), data);
        assert_eq!(cache.local_revision(&key()), Some(1));
    }

    #[test]
    fn test_reopen_unchanged_file_uses_no_network() {
        let (_dir, cache, remote) = setup(&content(300), 3);
        cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadOnly)
            .unwrap();
        assert_eq!(remote.downloads(), 1);

        for _ in 0..3 {
            let handle = cache
                .open_file(&remote, &key(), 3, remote.version(), AccessMode::ReadOnly)
                .unwrap();
            assert_eq!(handle.state(), CacheState::Valid);
        }
        assert_eq!(remote.downloads(), 1);
    }

    #[test]
    fn test_stale_revision_forces_one_download() {
        let (_dir, cache, remote) = setup(&content(100), 1);
        cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadOnly)
            .unwrap();

        let newer = content(120);
        remote.replace(&newer);
        let before = remote.downloads();

        let handle = cache
            .open_file(&remote, &key(), 1, remote.version(), AccessMode::ReadOnly)
            .unwrap();

        assert_eq!(remote.downloads(), before + 1);
        assert_eq!(handle.local_revision, 2);
        assert_eq!(handle.local_revision, handle.remote_revision);
        assert_eq!(fs::read(&handle.local_path).unwrap(), newer);
    }

    #[test]
    fn test_stale_revision_redownloads_even_if_bytes_match() {
        let data = content(64);
        let (_dir, cache, remote) = setup(&data, 1);
        cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadOnly)
            .unwrap();

        // Same bytes, new revision
        remote.replace(&data);
        cache
            .open_file(&remote, &key(), 1, remote.version(), AccessMode::ReadOnly)
            .unwrap();
        assert_eq!(remote.downloads(), 2);
    }

    #[test]
    fn test_corrupted_local_copy_is_redownloaded() {
        let data = content(200);
        let (_dir, cache, remote) = setup(&data, 4);
        let handle = cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadOnly)
            .unwrap();

        let mut tampered = data.clone();
        tampered[10] ^= 1;
        fs::write(&handle.local_path, &tampered).unwrap();

        let handle = cache
            .open_file(&remote, &key(), 4, remote.version(), AccessMode::ReadOnly)
            .unwrap();
        assert_eq!(remote.downloads(), 2);
        assert_eq!(fs::read(&handle.local_path).unwrap(), data);
    }

    #[test]
    fn test_corrupted_download_fails_open() {
        let (_dir, cache, remote) = setup(&content(50), 1);
        remote.corrupt_downloads.store(true, Ordering::SeqCst);

        let result = cache.open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadOnly);

        assert!(matches!(result, Err(CacheError::IntegrityFailed(_))));
        assert!(!cache.path_for(&key()).exists());
        assert_eq!(cache.local_revision(&key()), None);
        // No temp files left behind
        assert_eq!(fs::read_dir(cache.cache_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_append_uploads_only_new_bytes() {
        let base = content(100);
        let (_dir, cache, remote) = setup(&base, 7);
        let mut handle = cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadWrite)
            .unwrap();

        let extra = vec![0xabu8; 50];
        let mut file = OpenOptions::new().write(true).open(&handle.local_path).unwrap();
        file.seek(SeekFrom::Start(100)).unwrap();
        file.write_all(&extra).unwrap();
        cache.mark_dirty(&mut handle, 100).unwrap();

        assert_eq!(cache.get_new_and_old_sizes(&key(), 7).unwrap(), (100, 150));

        let revision = cache.upload_patch(&remote, &mut handle).unwrap();

        assert_eq!(revision, 8);
        assert_eq!(handle.local_revision, 8);
        assert_eq!(handle.state(), CacheState::Valid);
        assert_eq!(handle.expected_size, 150);
        let uploads = remote.uploads.lock().unwrap();
        assert_eq!(
            uploads[0],
            (7, Patch::Append { offset: 100, bytes: extra })
        );
    }

    #[test]
    fn test_truncate_then_upload() {
        let base = content(200);
        let (_dir, cache, remote) = setup(&base, 2);
        let mut handle = cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadWrite)
            .unwrap();

        cache.truncate_file(&remote, &mut handle, 80).unwrap();
        assert!(handle.is_dirty());
        assert_eq!(cache.get_new_and_old_sizes(&key(), 2).unwrap(), (200, 80));

        cache.upload_patch(&remote, &mut handle).unwrap();
        assert_eq!(
            remote.uploads.lock().unwrap()[0],
            (2, Patch::Truncate { new_size: 80 })
        );
        assert_eq!(*remote.content.lock().unwrap(), base[..80].to_vec());
        assert_eq!(cache.local_revision(&key()), Some(3));
    }

    #[test]
    fn test_truncate_refreshes_stale_blob_first() {
        let (_dir, cache, remote) = setup(&content(100), 1);
        let mut handle = cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadWrite)
            .unwrap();

        let newer = content(150);
        remote.replace(&newer);

        cache.truncate_file(&remote, &mut handle, 120).unwrap();
        assert_eq!(remote.downloads(), 2);
        assert_eq!(handle.local_revision, 2);
        assert_eq!(fs::read(&handle.local_path).unwrap(), newer[..120].to_vec());
    }

    #[test]
    fn test_open_descriptor_survives_truncate_refresh() {
        let (_dir, cache, remote) = setup(&content(100), 1);
        let mut handle = cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadWrite)
            .unwrap();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&handle.local_path)
            .unwrap();

        let newer = content(150);
        remote.replace(&newer);
        cache.truncate_file(&remote, &mut handle, 120).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 120);

        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(b"USERDATA").unwrap();
        cache.mark_dirty(&mut handle, 0).unwrap();
        assert_eq!(cache.upload_patch(&remote, &mut handle).unwrap(), 3);

        let mut expected = newer[..120].to_vec();
        expected[..8].copy_from_slice(b"USERDATA");
        assert_eq!(*remote.content.lock().unwrap(), expected);
        assert_eq!(fs::read(&handle.local_path).unwrap(), expected);
    }

    #[test]
    fn test_truncate_dirty_handle_after_remote_change_conflicts() {
        let (_dir, cache, remote) = setup(&content(100), 1);
        let mut handle = cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadWrite)
            .unwrap();

        let mut file = OpenOptions::new().write(true).open(&handle.local_path).unwrap();
        file.write_all(b"edit").unwrap();
        cache.mark_dirty(&mut handle, 0).unwrap();

        remote.replace(&content(150));
        let before = remote.downloads();

        assert!(matches!(
            cache.truncate_file(&remote, &mut handle, 10),
            Err(CacheError::RevisionConflict {
                base_revision: 1,
                remote_revision: 2,
                ..
            })
        ));
        assert_eq!(remote.downloads(), before);
        assert_eq!(fs::metadata(&handle.local_path).unwrap().len(), 100);
        assert!(handle.is_dirty());
        assert_eq!(handle.local_revision, 1);
    }

    #[test]
    fn test_truncate_read_only_is_rejected() {
        let (_dir, cache, remote) = setup(&content(10), 1);
        let mut handle = cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadOnly)
            .unwrap();

        assert!(matches!(
            cache.truncate_file(&remote, &mut handle, 0),
            Err(CacheError::InvalidArgument(_))
        ));
        assert_eq!(fs::metadata(&handle.local_path).unwrap().len(), 10);
    }

    #[test]
    fn test_revision_conflict_leaves_remote_untouched() {
        let base = content(100);
        let (_dir, cache, remote) = setup(&base, 5);
        let mut handle = cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadWrite)
            .unwrap();

        let mut file = OpenOptions::new().append(true).open(&handle.local_path).unwrap();
        file.write_all(b"local edit").unwrap();
        cache.mark_dirty(&mut handle, 100).unwrap();

        let theirs = content(90);
        remote.replace(&theirs);

        let result = cache.upload_patch(&remote, &mut handle);
        assert!(matches!(
            result,
            Err(CacheError::RevisionConflict {
                base_revision: 5,
                remote_revision: 6,
                ..
            })
        ));
        assert!(handle.is_dirty());
        assert_eq!(handle.local_revision, 5);
        assert!(remote.uploads.lock().unwrap().is_empty());
        assert_eq!(*remote.content.lock().unwrap(), theirs);
    }

    #[test]
    fn test_unchanged_dirty_handle_skips_upload() {
        let (_dir, cache, remote) = setup(&content(40), 1);
        let mut handle = cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadWrite)
            .unwrap();

        cache.mark_dirty(&mut handle, 0).unwrap();
        assert_eq!(cache.upload_patch(&remote, &mut handle).unwrap(), 1);
        assert_eq!(handle.state(), CacheState::Valid);
        assert!(remote.uploads.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sizes_require_matching_revision() {
        let (_dir, cache, remote) = setup(&content(10), 1);
        cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadOnly)
            .unwrap();

        assert_eq!(cache.get_new_and_old_sizes(&key(), 1).unwrap(), (10, 10));
        assert!(matches!(
            cache.get_new_and_old_sizes(&key(), 2),
            Err(CacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_evict_and_cleanup() {
        let (_dir, cache, remote) = setup(&content(10), 1);
        cache
            .open_file(&remote, &key(), 0, remote.version(), AccessMode::ReadOnly)
            .unwrap();

        let stale = cache.cache_dir().join(".download-abc.tmp");
        fs::write(&stale, b"partial").unwrap();
        cache.cleanup();
        assert!(!stale.exists());

        cache.evict(&key()).unwrap();
        assert!(!cache.path_for(&key()).exists());
        assert_eq!(cache.local_revision(&key()), None);
        cache.evict(&key()).unwrap();
    }
}
