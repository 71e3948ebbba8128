//! Local caching layer
//!
//! Verified on-disk copies of remote files, the patch builder that turns local
//! edits into uploads, and a TTL cache of metadata for the FUSE layer.

pub mod errors;
pub mod file_cache;
pub mod hash;
pub mod integrity;
pub mod metadata;
pub mod patch;

pub use errors::{status_of, CacheError};
pub use file_cache::{
    AccessMode, CacheState, CachedFile, FileCache, PatchUpload, RemoteStore, RemoteVersion,
};
pub use hash::{binary_to_hex, hash_reader, ContentHash, HashAlgorithm};
pub use metadata::MetadataCache;
