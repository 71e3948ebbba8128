//! Remote API Client
//!
//! One method per endpoint, each built on the retry wrapper. Also provides the
//! blocking [`RemoteStore`] adapter the file cache uses from FUSE threads.

use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::errors::ApiError;
use super::retry::{call_with_retry, retry_transfer, TokenSession};
use super::types::{
    decode_response, DeviceStatusPayload, FileInfoPayload, FolderContentPayload, FolderKey,
    LinksPayload, PatchUploadPayload, QuickKey, RemoteFileInfo, RemoteFolderInfo,
};
use crate::cache::{PatchUpload, RemoteStore};

/// API client for making authenticated requests
#[derive(Clone)]
pub struct ApiClient {
    conn: Arc<Connection>,
}

impl ApiClient {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    /// Signed GET through the retry wrapper, decoding the response payload
    async fn signed_get<T>(
        &self,
        endpoint: &str,
        action: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ApiError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let conn = &*self.conn;
        call_with_retry(conn, endpoint, query, |request| async move {
            let body = conn.execute(&request, None).await?;
            decode_response::<T>(&body, action)
        })
        .await
    }

    /// Account-wide device revision; changes whenever anything changes remotely
    pub async fn device_status(&self) -> Result<u64, ApiError> {
        let payload: DeviceStatusPayload = self
            .signed_get(
                "device/get_status.php",
                "device/get_status",
                &[("response_format", "json")],
            )
            .await?;
        debug!(device_revision = payload.device_revision, "Got device status");
        Ok(payload.device_revision)
    }

    /// Get file metadata by quick key
    pub async fn file_info(&self, quick_key: &QuickKey) -> Result<RemoteFileInfo, ApiError> {
        let payload: FileInfoPayload = self
            .signed_get(
                "file/get_info.php",
                "file/get_info",
                &[("quick_key", quick_key.as_str()), ("response_format", "json")],
            )
            .await?;
        Ok(payload.file_info)
    }

    /// Get the direct download link for a file
    pub async fn direct_link(&self, quick_key: &QuickKey) -> Result<String, ApiError> {
        let payload: LinksPayload = self
            .signed_get(
                "file/get_links.php",
                "file/get_links",
                &[
                    ("quick_key", quick_key.as_str()),
                    ("link_type", "direct_download"),
                    ("response_format", "json"),
                ],
            )
            .await?;

        payload
            .links
            .into_iter()
            .find(|link| link.quick_key == quick_key.as_str())
            .and_then(|link| link.direct_download)
            .ok_or_else(|| ApiError::Decode(format!("no direct link for {}", quick_key)))
    }

    /// List the folders and files directly inside a folder
    ///
    /// Folders and files are listed separately, each in numbered chunks.
    pub async fn folder_content(
        &self,
        folder_key: &FolderKey,
    ) -> Result<(Vec<RemoteFolderInfo>, Vec<RemoteFileInfo>), ApiError> {
        let mut folders = Vec::new();
        let mut files = Vec::new();

        for content_type in ["folders", "files"] {
            let mut chunk: u32 = 1;
            loop {
                let chunk_str = chunk.to_string();
                let payload: FolderContentPayload = self
                    .signed_get(
                        "folder/get_content.php",
                        "folder/get_content",
                        &[
                            ("folder_key", folder_key.as_str()),
                            ("content_type", content_type),
                            ("chunk", chunk_str.as_str()),
                            ("response_format", "json"),
                        ],
                    )
                    .await?;

                let content = payload.folder_content;
                let more = content.has_more();
                folders.extend(content.folders);
                files.extend(content.files);

                if !more {
                    break;
                }
                chunk += 1;
            }
        }

        debug!(
            folder = %folder_key,
            folders = folders.len(),
            files = files.len(),
            "Listed folder content"
        );
        Ok((folders, files))
    }

    /// Download file content into `dest`
    ///
    /// The link lookup and the transfer are retried together: a link may
    /// expire while a failed transfer is retried. `dest` is emptied before
    /// every attempt.
    ///
    /// # Returns
    /// Number of bytes written
    pub async fn download_file(&self, quick_key: &QuickKey, dest: &mut File) -> Result<u64, ApiError> {
        let written = retry_transfer(
            quick_key.as_str(),
            self.conn.max_retries(),
            dest,
            |sink| self.download_once(quick_key, sink),
        )
        .await?;

        info!(quick_key = %quick_key, size = written, "Downloaded file");
        Ok(written)
    }

    /// One attempt: resolve the direct link and stream the body into `dest`
    async fn download_once(&self, quick_key: &QuickKey, mut dest: File) -> Result<u64, ApiError> {
        let url = self.direct_link(quick_key).await?;
        debug!(quick_key = %quick_key, "Downloading file");

        // Direct links are pre-authorized; no signature involved
        let mut response = self.conn.download_client().get(&url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Http(status.as_u16(), body));
        }

        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            dest.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        dest.flush()?;
        Ok(written)
    }

    /// Upload a patch against a base revision
    ///
    /// The remote revision is checked first so that an edit based on an old
    /// revision is rejected before anything is sent.
    ///
    /// # Returns
    /// The new remote revision
    pub async fn upload_patch(
        &self,
        quick_key: &QuickKey,
        upload: &PatchUpload<'_>,
    ) -> Result<u64, ApiError> {
        let current = self.file_info(quick_key).await?;
        if current.revision != upload.base_revision {
            warn!(
                quick_key = %quick_key,
                base = upload.base_revision,
                remote = current.revision,
                "Remote revision moved, refusing to upload patch"
            );
            return Err(ApiError::RevisionConflict {
                base_revision: upload.base_revision,
                remote_revision: current.revision,
            });
        }

        let base_hash = upload.base_hash.to_hex();
        let target_hash = upload.target_hash.to_hex();
        let target_size = upload.target_size.to_string();
        let source_revision = upload.base_revision.to_string();
        let offset = upload.patch.offset().to_string();
        let query = [
            ("quick_key", quick_key.as_str()),
            ("source_revision", source_revision.as_str()),
            ("source_hash", base_hash.as_str()),
            ("target_hash", target_hash.as_str()),
            ("target_size", target_size.as_str()),
            ("patch_type", upload.patch.kind()),
            ("offset", offset.as_str()),
            ("response_format", "json"),
        ];

        info!(
            quick_key = %quick_key,
            kind = upload.patch.kind(),
            payload = upload.patch.payload().len(),
            "Uploading patch"
        );

        let conn = &*self.conn;
        let result = call_with_retry(conn, "upload/patch.php", &query, |request| async move {
            let body = conn
                .execute(&request, Some(upload.patch.payload().to_vec()))
                .await?;
            decode_response::<PatchUploadPayload>(&body, "upload/patch")
        })
        .await;

        match result {
            Ok(payload) => {
                info!(
                    quick_key = %quick_key,
                    revision = payload.new_revision,
                    device_revision = payload.device_revision,
                    "Patch uploaded"
                );
                Ok(payload.new_revision)
            }
            Err(ApiError::Http(409, _)) => {
                let remote = self.file_info(quick_key).await?;
                Err(ApiError::RevisionConflict {
                    base_revision: upload.base_revision,
                    remote_revision: remote.revision,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Blocking adapter over [`ApiClient`] for synchronous FUSE callbacks
pub struct BlockingRemote {
    client: ApiClient,
    runtime: Handle,
}

impl BlockingRemote {
    pub fn new(client: ApiClient, runtime: Handle) -> Self {
        Self { client, runtime }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Run an API future to completion on the daemon's runtime
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl RemoteStore for BlockingRemote {
    fn download(&self, quick_key: &QuickKey, dest: &mut File) -> Result<u64, ApiError> {
        self.block_on(self.client.download_file(quick_key, dest))
    }

    fn file_info(&self, quick_key: &QuickKey) -> Result<RemoteFileInfo, ApiError> {
        self.block_on(self.client.file_info(quick_key))
    }

    fn upload_patch(&self, quick_key: &QuickKey, upload: &PatchUpload<'_>) -> Result<u64, ApiError> {
        self.block_on(self.client.upload_patch(quick_key, upload))
    }
}
