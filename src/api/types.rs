//! API types and FileAttr conversion
//!
//! Validated key types, response decoding for the remote API, and conversion
//! of remote metadata to FUSE attributes.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::NaiveDateTime;
use fuser::{FileAttr, FileType};
use serde::{Deserialize, Deserializer};

use super::errors::ApiError;
use crate::cache::ContentHash;

/// Root folder alias accepted wherever a folder key is expected
pub const ROOT_FOLDER_ALIAS: &str = "myfiles";

/// Stable identifier of a remote file: 11 or 15 alphanumeric characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuickKey(String);

impl QuickKey {
    pub fn new(key: &str) -> Result<Self, ApiError> {
        if (key.len() != 11 && key.len() != 15) || !key.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(ApiError::InvalidArgument(format!(
                "quick key must be 11 or 15 alphanumeric characters: {:?}",
                key
            )));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuickKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for QuickKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        QuickKey::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// Identifier of a remote folder: 13 alphanumeric characters, or the root
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FolderKey(Option<String>);

impl FolderKey {
    pub fn new(key: &str) -> Result<Self, ApiError> {
        if key == ROOT_FOLDER_ALIAS {
            return Ok(Self::root());
        }
        if key.len() != 13 || !key.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ApiError::InvalidArgument(format!(
                "folder key must be 13 alphanumeric characters: {:?}",
                key
            )));
        }
        Ok(Self(Some(key.to_string())))
    }

    pub fn root() -> Self {
        Self(None)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_none()
    }

    /// Key as sent in query strings
    pub fn as_str(&self) -> &str {
        self.0.as_deref().unwrap_or(ROOT_FOLDER_ALIAS)
    }
}

impl fmt::Display for FolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FolderKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        FolderKey::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// Deserialize a number that might be encoded as a string or null.
/// The API returns most numeric fields as strings (e.g. "1024").
fn deserialize_flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct FlexibleU64Visitor;

    impl<'de> de::Visitor<'de> for FlexibleU64Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a u64, a string containing a u64, or null")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u64, E> {
            u64::try_from(value).map_err(|_| de::Error::custom("negative value for u64"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<u64, E> {
            value.parse::<u64>().map_err(de::Error::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }

        fn visit_unit<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }
    }

    deserializer.deserialize_any(FlexibleU64Visitor)
}

/// Parse "YYYY-MM-DD HH:MM:SS" into seconds since epoch; unparsable means 0
fn deserialize_created<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .and_then(|s| NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S").ok())
        .and_then(|t| u64::try_from(t.and_utc().timestamp()).ok())
        .unwrap_or(0))
}

fn deserialize_hash<'de, D>(deserializer: D) -> Result<Option<ContentHash>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(hex) if !hex.is_empty() => ContentHash::from_hex(&hex)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

fn deserialize_parent<'de, D>(deserializer: D) -> Result<FolderKey, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(key) if !key.is_empty() => FolderKey::new(&key).map_err(serde::de::Error::custom),
        _ => Ok(FolderKey::root()),
    }
}

/// Remote file metadata
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFileInfo {
    #[serde(rename = "quickkey")]
    pub quick_key: QuickKey,
    #[serde(rename = "filename")]
    pub name: String,
    /// SHA-256 of the content at `revision`
    #[serde(default, deserialize_with = "deserialize_hash")]
    pub hash: Option<ContentHash>,
    /// Parent folder (root when absent)
    #[serde(
        default = "FolderKey::root",
        rename = "parent_folderkey",
        deserialize_with = "deserialize_parent"
    )]
    pub parent: FolderKey,
    /// Creation time in seconds since epoch
    #[serde(default, deserialize_with = "deserialize_created")]
    pub created: u64,
    #[serde(default, deserialize_with = "deserialize_flexible_u64")]
    pub revision: u64,
    #[serde(default, deserialize_with = "deserialize_flexible_u64")]
    pub size: u64,
}

/// Remote folder entry from a content listing
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFolderInfo {
    #[serde(rename = "folderkey")]
    pub folder_key: FolderKey,
    pub name: String,
    #[serde(default, deserialize_with = "deserialize_flexible_u64")]
    pub revision: u64,
    #[serde(default, deserialize_with = "deserialize_created")]
    pub created: u64,
}

/// Standard response envelope: `{"response": {...}}`
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub response: ResponseBody<T>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseBody<T> {
    pub result: String,
    #[serde(default, deserialize_with = "deserialize_flexible_u64")]
    pub error: u64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    /// Check the result field and hand out the payload
    pub fn into_result(self, action: &str) -> Result<T, ApiError> {
        let body = self.response;
        if body.result != "Success" {
            let message = body.message.unwrap_or_else(|| format!("{} failed", action));
            return Err(ApiError::from_code(body.error as u32, &message));
        }
        body.data
            .ok_or_else(|| ApiError::Decode(format!("{}: missing response payload", action)))
    }
}

/// Decode a response body into its payload
pub fn decode_response<T: for<'de> Deserialize<'de>>(
    body: &str,
    action: &str,
) -> Result<T, ApiError> {
    let envelope: Envelope<T> = serde_json::from_str(body)?;
    envelope.into_result(action)
}

/// Payload of user/get_session_token
#[derive(Debug, Deserialize)]
pub struct SessionTokenPayload {
    pub session_token: String,
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub secret_key: u64,
    pub time: String,
}

/// Payload of device/get_status
#[derive(Debug, Deserialize)]
pub struct DeviceStatusPayload {
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub device_revision: u64,
}

/// Payload of file/get_info
#[derive(Debug, Deserialize)]
pub struct FileInfoPayload {
    pub file_info: RemoteFileInfo,
}

/// Payload of file/get_links
#[derive(Debug, Deserialize)]
pub struct LinksPayload {
    pub links: Vec<FileLink>,
}

#[derive(Debug, Deserialize)]
pub struct FileLink {
    #[serde(rename = "quickkey")]
    pub quick_key: String,
    #[serde(default)]
    pub direct_download: Option<String>,
}

/// Payload of folder/get_content
#[derive(Debug, Deserialize)]
pub struct FolderContentPayload {
    pub folder_content: FolderContent,
}

#[derive(Debug, Deserialize)]
pub struct FolderContent {
    #[serde(default)]
    pub folders: Vec<RemoteFolderInfo>,
    #[serde(default)]
    pub files: Vec<RemoteFileInfo>,
    #[serde(default)]
    pub more_chunks: Option<String>,
}

impl FolderContent {
    pub fn has_more(&self) -> bool {
        self.more_chunks.as_deref() == Some("yes")
    }
}

/// Payload of upload/patch
#[derive(Debug, Deserialize)]
pub struct PatchUploadPayload {
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub new_revision: u64,
    #[serde(default, deserialize_with = "deserialize_flexible_u64")]
    pub device_revision: u64,
}

/// Directory entry for readdir results
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// File/folder name (not full path)
    pub name: String,
    /// Inode number
    pub ino: u64,
    /// File type (directory or regular file)
    pub kind: FileType,
}

/// Convert remote file metadata to FUSE attributes
pub fn remote_file_to_attr(ino: u64, file: &RemoteFileInfo) -> FileAttr {
    let created = UNIX_EPOCH + Duration::from_secs(file.created);
    file_attr(ino, file.size, created)
}

/// FileAttr for a regular file of a given size
pub fn file_attr(ino: u64, size: u64, mtime: SystemTime) -> FileAttr {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: FileType::RegularFile,
        perm: 0o644,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

/// Create a FileAttr for a directory
pub fn directory_attr(ino: u64, created: u64) -> FileAttr {
    let time = if created == 0 {
        SystemTime::now()
    } else {
        UNIX_EPOCH + Duration::from_secs(created)
    };
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: time,
        mtime: time,
        ctime: time,
        crtime: time,
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid,
        gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_quick_key_validation() {
        assert!(QuickKey::new("abcdefghijk").is_ok());
        assert!(QuickKey::new("abcdefghijklmno").is_ok());
        assert!(QuickKey::new("abcdefghij").is_err());
        assert!(QuickKey::new("abcdefghijkl").is_err());
        assert!(QuickKey::new("abcdefghi/k").is_err());
        assert!(QuickKey::new("").is_err());
    }

    #[test]
    fn test_folder_key_validation() {
        assert!(FolderKey::new("abcdefghijklm").is_ok());
        assert!(FolderKey::new("myfiles").unwrap().is_root());
        assert!(FolderKey::new("abcdefghijkl").is_err());
        assert_eq!(FolderKey::root().as_str(), "myfiles");
    }

    #[test]
    fn test_decode_file_info() {
        let body = format!(
            r#"{{"response": {{
                "action": "file/get_info",
                "result": "Success",
                "file_info": {{
                    "quickkey": "abcdefghijk",
                    "filename": "notes.txt",
                    "hash": "{}",
                    "parent_folderkey": "folderkey0001",
                    "created": "2014-06-01 12:30:00",
                    "revision": "7",
                    "size": "3"
                }}
            }}}}"#,
            HASH
        );
        let payload: FileInfoPayload = decode_response(&body, "file/get_info").unwrap();
        let info = payload.file_info;
        assert_eq!(info.quick_key.as_str(), "abcdefghijk");
        assert_eq!(info.name, "notes.txt");
        assert_eq!(info.hash.unwrap().to_hex(), HASH);
        assert_eq!(info.parent.as_str(), "folderkey0001");
        assert_eq!(info.created, 1401625800);
        assert_eq!(info.revision, 7);
        assert_eq!(info.size, 3);
    }

    #[test]
    fn test_missing_parent_means_root() {
        let body = r#"{"response": {"result": "Success", "file_info": {
            "quickkey": "abcdefghijk", "filename": "a", "revision": 1, "size": 0
        }}}"#;
        let payload: FileInfoPayload = decode_response(body, "file/get_info").unwrap();
        assert!(payload.file_info.parent.is_root());
        assert!(payload.file_info.hash.is_none());
    }

    #[test]
    fn test_error_envelope() {
        let body = r#"{"response": {"result": "Error", "error": "105", "message": "Session token is missing"}}"#;
        let err = decode_response::<DeviceStatusPayload>(body, "device/get_status").unwrap_err();
        assert!(matches!(err, ApiError::TokenRejected(105)));

        let body = r#"{"response": {"result": "Error", "error": 110, "message": "Unknown or invalid QuickKey"}}"#;
        let err = decode_response::<FileInfoPayload>(body, "file/get_info").unwrap_err();
        assert!(matches!(err, ApiError::Api { code: 110, .. }));
    }

    #[test]
    fn test_decode_folder_content() {
        let body = r#"{"response": {"result": "Success", "folder_content": {
            "more_chunks": "no",
            "folders": [{"folderkey": "folderkey0002", "name": "docs", "revision": "3"}],
            "files": [{"quickkey": "abcdefghijk", "filename": "a.txt", "size": "10", "revision": "2"}]
        }}}"#;
        let payload: FolderContentPayload = decode_response(body, "folder/get_content").unwrap();
        assert_eq!(payload.folder_content.folders[0].name, "docs");
        assert_eq!(payload.folder_content.files[0].size, 10);
        assert!(!payload.folder_content.has_more());
    }

    #[test]
    fn test_invalid_key_in_response_is_decode_error() {
        let body = r#"{"response": {"result": "Success", "file_info": {
            "quickkey": "short", "filename": "a"
        }}}"#;
        let err = decode_response::<FileInfoPayload>(body, "file/get_info").unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }
}
