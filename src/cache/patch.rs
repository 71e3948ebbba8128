//! Patch Builder
//!
//! Turns a locally edited blob into the smallest upload the remote accepts:
//! an append, a truncation, or a full replacement. Interior edits always fall
//! back to full replacement; no binary diffing is attempted.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use tracing::debug;

use super::errors::CacheError;
use super::hash::{hash_file, ContentHash, HashAlgorithm};

/// How a blob's length changed since the base revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeDelta {
    pub old_size: u64,
    pub new_size: u64,
}

impl SizeDelta {
    pub fn new(old_size: u64, new_size: u64) -> Self {
        Self { old_size, new_size }
    }

    pub fn is_growth(&self) -> bool {
        self.new_size > self.old_size
    }

    pub fn is_shrink(&self) -> bool {
        self.new_size < self.old_size
    }
}

/// Upload-ready description of a local edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch {
    /// Content matches the base revision
    Unchanged,
    /// Bytes appended after the unchanged base content
    Append { offset: u64, bytes: Vec<u8> },
    /// Base content cut at `new_size`, no payload
    Truncate { new_size: u64 },
    /// Whole new content, written from offset 0
    Replace { bytes: Vec<u8> },
}

impl Patch {
    /// Wire name of the patch kind
    pub fn kind(&self) -> &'static str {
        match self {
            Patch::Unchanged => "none",
            Patch::Append { .. } => "append",
            Patch::Truncate { .. } => "truncate",
            Patch::Replace { .. } => "replace",
        }
    }

    /// Offset the payload is written at
    pub fn offset(&self) -> u64 {
        match self {
            Patch::Append { offset, .. } => *offset,
            Patch::Truncate { new_size } => *new_size,
            Patch::Unchanged | Patch::Replace { .. } => 0,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Patch::Append { bytes, .. } | Patch::Replace { bytes } => bytes,
            Patch::Unchanged | Patch::Truncate { .. } => &[],
        }
    }
}

/// Build the patch that brings the base revision up to the local blob
///
/// # Arguments
/// * `delta` - Base revision size and current blob size
/// * `base_hash` - SHA-256 of the base revision content
/// * `dirty_from` - Lowest offset touched by local writes or truncation, if any
/// * `local_path` - The edited blob
pub fn build_patch(
    delta: SizeDelta,
    base_hash: &ContentHash,
    dirty_from: Option<u64>,
    local_path: &Path,
) -> Result<Patch, CacheError> {
    let SizeDelta { old_size, new_size } = delta;

    let patch = if delta.is_shrink() {
        if dirty_from.map_or(true, |offset| offset >= new_size) {
            Patch::Truncate { new_size }
        } else {
            Patch::Replace {
                bytes: read_range(local_path, 0, new_size)?,
            }
        }
    } else if delta.is_growth() {
        if prefix_unchanged(local_path, old_size, base_hash, dirty_from)? {
            Patch::Append {
                offset: old_size,
                bytes: read_range(local_path, old_size, new_size)?,
            }
        } else {
            Patch::Replace {
                bytes: read_range(local_path, 0, new_size)?,
            }
        }
    } else if dirty_from.is_none() || content_matches(local_path, old_size, base_hash)? {
        Patch::Unchanged
    } else {
        Patch::Replace {
            bytes: read_range(local_path, 0, new_size)?,
        }
    };

    debug!(
        path = %local_path.display(),
        old_size = old_size,
        new_size = new_size,
        kind = patch.kind(),
        payload = patch.payload().len(),
        "Built patch"
    );
    Ok(patch)
}

/// Whether the first `len` bytes still hash to the base revision's hash
fn prefix_unchanged(
    path: &Path,
    len: u64,
    base_hash: &ContentHash,
    dirty_from: Option<u64>,
) -> Result<bool, CacheError> {
    if dirty_from.is_some_and(|offset| offset < len) {
        return Ok(false);
    }
    content_matches(path, len, base_hash)
}

/// Hash the first `len` bytes and compare with `base_hash`
fn content_matches(path: &Path, len: u64, base_hash: &ContentHash) -> Result<bool, CacheError> {
    let (digest, read) = hash_file(path, HashAlgorithm::Sha256, Some(len))?;
    Ok(read == len && base_hash.matches(&digest))
}

/// Read bytes `[start, end)` from a file
fn read_range(path: &Path, start: u64, end: u64) -> Result<Vec<u8>, CacheError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::with_capacity(end.saturating_sub(start) as usize);
    file.take(end.saturating_sub(start)).read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_append_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let base = content(100);
        let mut grown = base.clone();
        grown.extend((0..50).map(|i| i as u8 ^ 0x5a));
        fs::write(&path, &grown).unwrap();

        let patch = build_patch(
            SizeDelta::new(100, 150),
            &ContentHash::of_bytes(&base),
            Some(100),
            &path,
        )
        .unwrap();

        assert_eq!(
            patch,
            Patch::Append {
                offset: 100,
                bytes: grown[100..150].to_vec()
            }
        );
        assert_eq!(patch.payload().len(), 50);
    }

    #[test]
    fn test_truncate_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let base = content(200);
        fs::write(&path, &base[..80]).unwrap();

        let patch = build_patch(
            SizeDelta::new(200, 80),
            &ContentHash::of_bytes(&base),
            Some(80),
            &path,
        )
        .unwrap();

        assert_eq!(patch, Patch::Truncate { new_size: 80 });
        assert!(patch.payload().is_empty());
    }

    #[test]
    fn test_growth_with_interior_edit_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let base = content(100);
        let mut edited = content(150);
        edited[10] ^= 0xff;
        fs::write(&path, &edited).unwrap();

        // Not flagged by dirty_from, caught by the prefix hash
        let patch = build_patch(
            SizeDelta::new(100, 150),
            &ContentHash::of_bytes(&base),
            Some(100),
            &path,
        )
        .unwrap();

        assert_eq!(patch, Patch::Replace { bytes: edited });
        assert_eq!(patch.offset(), 0);
    }

    #[test]
    fn test_shrink_after_interior_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let base = content(200);
        let mut edited = base[..80].to_vec();
        edited[5] = 0;
        fs::write(&path, &edited).unwrap();

        let patch = build_patch(
            SizeDelta::new(200, 80),
            &ContentHash::of_bytes(&base),
            Some(5),
            &path,
        )
        .unwrap();

        assert_eq!(patch, Patch::Replace { bytes: edited });
    }

    #[test]
    fn test_same_size_edit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let base = content(64);
        let hash = ContentHash::of_bytes(&base);

        fs::write(&path, &base).unwrap();
        assert_eq!(
            build_patch(SizeDelta::new(64, 64), &hash, None, &path).unwrap(),
            Patch::Unchanged
        );
        assert_eq!(
            build_patch(SizeDelta::new(64, 64), &hash, Some(0), &path).unwrap(),
            Patch::Unchanged
        );

        let mut edited = base.clone();
        edited[63] ^= 1;
        fs::write(&path, &edited).unwrap();
        assert_eq!(
            build_patch(SizeDelta::new(64, 64), &hash, Some(63), &path).unwrap(),
            Patch::Replace { bytes: edited }
        );
    }

    #[test]
    fn test_size_delta() {
        assert!(SizeDelta::new(1, 2).is_growth());
        assert!(SizeDelta::new(2, 1).is_shrink());
        let same = SizeDelta::new(3, 3);
        assert!(!same.is_growth() && !same.is_shrink());
    }
}
