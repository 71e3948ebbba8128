//! Integrity Verification
//!
//! Checks a cached blob against the size and SHA-256 hash the remote reports
//! for a revision. Size is checked first so a blob of the wrong length is
//! never hashed.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use super::errors::IntegrityError;
use super::hash::{sha256_file, ContentHash};

/// Verify a local file against an expected size and hash
pub fn verify(
    path: &Path,
    expected_size: u64,
    expected_hash: &ContentHash,
) -> Result<(), IntegrityError> {
    verify_size(path, expected_size)?;
    verify_hash(path, expected_hash)?;
    debug!(path = %path.display(), size = expected_size, "Integrity check passed");
    Ok(())
}

/// Compare the on-disk size with the expected size
pub fn verify_size(path: &Path, expected_size: u64) -> Result<(), IntegrityError> {
    let actual = fs::metadata(path)?.len();
    if actual != expected_size {
        warn!(
            path = %path.display(),
            expected = expected_size,
            actual = actual,
            "Cached file has unexpected size"
        );
        return Err(IntegrityError::SizeMismatch {
            expected: expected_size,
            actual,
        });
    }
    Ok(())
}

/// Hash the whole file and compare with the expected hash
pub fn verify_hash(path: &Path, expected_hash: &ContentHash) -> Result<(), IntegrityError> {
    let (actual, _) = sha256_file(path)?;
    if !expected_hash.matches(actual.as_bytes()) {
        warn!(
            path = %path.display(),
            remote = %expected_hash,
            local = %actual,
            "Cached file hash differs from remote"
        );
        return Err(IntegrityError::HashMismatch {
            expected: expected_hash.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(data).unwrap();
        path
    }

    #[test]
    fn test_verify_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"the quick brown fox jumps over the lazy dog";
        let path = write_file(dir.path(), "blob", data);

        verify(&path, data.len() as u64, &ContentHash::of_bytes(data)).unwrap();
    }

    #[test]
    fn test_verify_size_mismatch_on_extend_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789";
        let hash = ContentHash::of_bytes(data);

        let longer = write_file(dir.path(), "longer", b"0123456789!");
        let shorter = write_file(dir.path(), "shorter", b"012345678");

        assert!(matches!(
            verify(&longer, data.len() as u64, &hash),
            Err(IntegrityError::SizeMismatch { expected: 10, actual: 11 })
        ));
        assert!(matches!(
            verify(&shorter, data.len() as u64, &hash),
            Err(IntegrityError::SizeMismatch { expected: 10, actual: 9 })
        ));
    }

    #[test]
    fn test_verify_hash_mismatch_on_flipped_byte() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"0123456789".to_vec();
        let hash = ContentHash::of_bytes(&data);

        let mut flipped = data.clone();
        flipped[4] ^= 0x01;
        let path = write_file(dir.path(), "flipped", &flipped);

        match verify(&path, data.len() as u64, &hash) {
            Err(IntegrityError::HashMismatch { expected, actual }) => {
                assert_eq!(expected, hash.to_hex());
                assert_ne!(expected, actual);
            }
            other => panic!("expected hash mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_verify_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let hash = ContentHash::of_bytes(b"");
        assert!(matches!(
            verify(&dir.path().join("missing"), 0, &hash),
            Err(IntegrityError::Io(_))
        ));
    }
}
