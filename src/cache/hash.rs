//! Content Hashing
//!
//! Streaming MD5 / SHA-256 computation over files and readers, plus the
//! table-driven hex codec used to compare and transmit digests.

use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};

use super::errors::HashError;

/// Read block size for streaming hashes: 64 KB
const BLOCK_SIZE: usize = 64 * 1024;

/// Length of a SHA-256 digest in bytes
pub const SHA256_LEN: usize = 32;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// Legacy digest, used for request signatures
    Md5,
    /// Integrity digest for cached content
    Sha256,
}

enum DigestContext {
    Md5(Md5),
    Sha256(Sha256),
}

enum HasherState {
    Uninitialized,
    Accumulating(DigestContext),
    Finalized,
}

/// Streaming hasher over one digest algorithm
///
/// The algorithm is fixed at construction. Blocks are pushed with
/// [`Hasher::feed`]; [`Hasher::finalize`] may be called exactly once, after the
/// hasher was started (explicitly or by the first block).
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            state: HasherState::Uninitialized,
        }
    }

    /// Initialize the digest context. Starting an accumulating hasher is a no-op.
    pub fn start(&mut self) -> Result<(), HashError> {
        match self.state {
            HasherState::Uninitialized => {
                let context = match self.algorithm {
                    HashAlgorithm::Md5 => DigestContext::Md5(Md5::new()),
                    HashAlgorithm::Sha256 => DigestContext::Sha256(Sha256::new()),
                };
                self.state = HasherState::Accumulating(context);
                Ok(())
            }
            HasherState::Accumulating(_) => Ok(()),
            HasherState::Finalized => Err(HashError::InvalidState("hasher already finalized")),
        }
    }

    /// Feed one block into the digest
    pub fn feed(&mut self, block: &[u8]) -> Result<(), HashError> {
        self.start()?;
        if let HasherState::Accumulating(context) = &mut self.state {
            match context {
                DigestContext::Md5(ctx) => ctx.update(block),
                DigestContext::Sha256(ctx) => ctx.update(block),
            }
        }
        Ok(())
    }

    /// Produce the digest and close the hasher
    pub fn finalize(&mut self) -> Result<Vec<u8>, HashError> {
        match std::mem::replace(&mut self.state, HasherState::Finalized) {
            HasherState::Accumulating(DigestContext::Md5(ctx)) => Ok(ctx.finalize().to_vec()),
            HasherState::Accumulating(DigestContext::Sha256(ctx)) => Ok(ctx.finalize().to_vec()),
            HasherState::Uninitialized => {
                self.state = HasherState::Uninitialized;
                Err(HashError::InvalidState("finalize before initialization"))
            }
            HasherState::Finalized => Err(HashError::InvalidState("hasher already finalized")),
        }
    }
}

/// Hash a reader, stopping at end of stream or after `limit` bytes
///
/// # Returns
/// The digest and the number of bytes consumed
pub fn hash_reader<R: Read>(
    mut reader: R,
    algorithm: HashAlgorithm,
    limit: Option<u64>,
) -> Result<(Vec<u8>, u64), HashError> {
    let mut hasher = Hasher::new(algorithm);
    hasher.start()?;

    let mut buffer = vec![0u8; BLOCK_SIZE];
    let mut total: u64 = 0;

    loop {
        let want = match limit {
            Some(limit) => (limit - total).min(BLOCK_SIZE as u64) as usize,
            None => BLOCK_SIZE,
        };
        if want == 0 {
            break;
        }

        let n = match reader.read(&mut buffer[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(HashError::Io(e)),
        };

        hasher.feed(&buffer[..n])?;
        total += n as u64;
    }

    Ok((hasher.finalize()?, total))
}

/// Hash a file by path
pub fn hash_file(
    path: &Path,
    algorithm: HashAlgorithm,
    limit: Option<u64>,
) -> Result<(Vec<u8>, u64), HashError> {
    let file = File::open(path)?;
    hash_reader(file, algorithm, limit)
}

/// SHA-256 of a whole file as a fixed-size hash
pub fn sha256_file(path: &Path) -> Result<(ContentHash, u64), HashError> {
    let (digest, size) = hash_file(path, HashAlgorithm::Sha256, None)?;
    Ok((ContentHash::from_slice(&digest)?, size))
}

/// SHA-256 content hash as reported by the remote for a file revision
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; SHA256_LEN]);

impl ContentHash {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        let array: [u8; SHA256_LEN] = bytes.try_into().map_err(|_| {
            HashError::InvalidArgument(format!(
                "expected {} digest bytes, got {}",
                SHA256_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        Self::from_slice(&hex_to_binary(hex)?)
    }

    /// Hash bytes held in memory
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; SHA256_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        binary_to_hex(&self.0)
    }

    /// Compare against raw digest bytes without early exit
    pub fn matches(&self, other: &[u8]) -> bool {
        digests_equal(&self.0, other)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({})", &hex[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Byte to two lowercase hex digits. The server only accepts lowercase.
const BASE16_ENCODING_TABLE: [[u8; 2]; 256] = build_encoding_table();

/// ASCII to nibble value; 0xff marks characters that are not hex digits
const BASE16_DECODING_TABLE: [u8; 128] = build_decoding_table();

const fn build_encoding_table() -> [[u8; 2]; 256] {
    let digits = b"0123456789abcdef";
    let mut table = [[0u8; 2]; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = [digits[i >> 4], digits[i & 0x0f]];
        i += 1;
    }
    table
}

const fn build_decoding_table() -> [u8; 128] {
    let mut table = [0xffu8; 128];
    let mut i = 0;
    while i < 10 {
        table[b'0' as usize + i] = i as u8;
        i += 1;
    }
    let mut i = 0;
    while i < 6 {
        table[b'a' as usize + i] = 10 + i as u8;
        table[b'A' as usize + i] = 10 + i as u8;
        i += 1;
    }
    table
}

/// Encode bytes as lowercase hex
pub fn binary_to_hex(binary: &[u8]) -> String {
    let mut out = Vec::with_capacity(binary.len() * 2);
    for &byte in binary {
        out.extend_from_slice(&BASE16_ENCODING_TABLE[byte as usize]);
    }
    // Every table entry is ASCII.
    String::from_utf8(out).unwrap_or_default()
}

/// Decode a hex string into bytes
///
/// Digit values come from a lookup table and invalid characters are
/// accumulated into a single flag checked once at the end, so the work done
/// does not depend on the digit values.
pub fn hex_to_binary(hex: &str) -> Result<Vec<u8>, HashError> {
    let input = hex.as_bytes();
    if input.len() % 2 != 0 {
        return Err(HashError::InvalidArgument(format!(
            "hex string has odd length {}",
            input.len()
        )));
    }

    let mut out = Vec::with_capacity(input.len() / 2);
    let mut invalid: u8 = 0;
    for pair in input.chunks_exact(2) {
        let high = BASE16_DECODING_TABLE[(pair[0] & 0x7f) as usize];
        let low = BASE16_DECODING_TABLE[(pair[1] & 0x7f) as usize];
        invalid |= (pair[0] | pair[1]) & 0x80;
        invalid |= (high | low) & 0xf0;
        out.push((high << 4) | (low & 0x0f));
    }

    if invalid != 0 {
        return Err(HashError::InvalidArgument(
            "hex string contains non-hex characters".to_string(),
        ));
    }
    Ok(out)
}

/// Equality over digests that inspects every byte
pub fn digests_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const SHA256_ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const SHA256_EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const MD5_ABC: &str = "900150983cd24fb0d6963f7d28e17f72";

    #[test]
    fn test_known_digests() {
        let (sha, n) = hash_reader(Cursor::new(b"abc"), HashAlgorithm::Sha256, None).unwrap();
        assert_eq!(binary_to_hex(&sha), SHA256_ABC);
        assert_eq!(n, 3);

        let (md5, n) = hash_reader(Cursor::new(b"abc"), HashAlgorithm::Md5, None).unwrap();
        assert_eq!(binary_to_hex(&md5), MD5_ABC);
        assert_eq!(n, 3);
    }

    #[test]
    fn test_empty_source_hashes() {
        let (sha, n) = hash_reader(Cursor::new(b""), HashAlgorithm::Sha256, None).unwrap();
        assert_eq!(binary_to_hex(&sha), SHA256_EMPTY);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_limit_stops_early() {
        let (prefix, n) =
            hash_reader(Cursor::new(b"abcdef"), HashAlgorithm::Sha256, Some(3)).unwrap();
        assert_eq!(binary_to_hex(&prefix), SHA256_ABC);
        assert_eq!(n, 3);

        // A limit past the end reports what was actually read
        let (_, n) = hash_reader(Cursor::new(b"abc"), HashAlgorithm::Sha256, Some(100)).unwrap();
        assert_eq!(n, 3);
    }

    #[test]
    fn test_multi_block_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..(BLOCK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&data).unwrap();

        let (hash, size) = sha256_file(tmp.path()).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(hash, ContentHash::of_bytes(&data));
    }

    #[test]
    fn test_finalize_state_machine() {
        let mut hasher = Hasher::new(HashAlgorithm::Sha256);
        assert!(matches!(hasher.finalize(), Err(HashError::InvalidState(_))));

        hasher.feed(b"abc").unwrap();
        assert_eq!(binary_to_hex(&hasher.finalize().unwrap()), SHA256_ABC);
        assert!(matches!(hasher.finalize(), Err(HashError::InvalidState(_))));
        assert!(matches!(hasher.feed(b"x"), Err(HashError::InvalidState(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = hash_file(&dir.path().join("nope"), HashAlgorithm::Sha256, None);
        assert!(matches!(result, Err(HashError::Io(_))));
    }

    #[test]
    fn test_hex_roundtrip() {
        let all: Vec<u8> = (0..=255u8).collect();
        for sample in [&[][..], &[0x00][..], &[0xff, 0x10, 0x0a][..], &all[..]] {
            assert_eq!(hex_to_binary(&binary_to_hex(sample)).unwrap(), sample);
        }
    }

    #[test]
    fn test_hex_decode_accepts_uppercase() {
        assert_eq!(hex_to_binary("DEADbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_hex_decode_rejects_garbage() {
        assert!(hex_to_binary("abc").is_err());
        assert!(hex_to_binary("zz").is_err());
        assert!(hex_to_binary("é").is_err());
    }

    #[test]
    fn test_content_hash_from_hex() {
        let hash = ContentHash::from_hex(SHA256_ABC).unwrap();
        assert_eq!(hash.to_hex(), SHA256_ABC);
        assert!(hash.matches(&hex_to_binary(SHA256_ABC).unwrap()));
        assert!(ContentHash::from_hex(MD5_ABC).is_err());
    }

    #[test]
    fn test_digests_equal() {
        assert!(digests_equal(b"abc", b"abc"));
        assert!(!digests_equal(b"abc", b"abd"));
        assert!(!digests_equal(b"abc", b"ab"));
    }
}
