//! Chunked upload session - resume, per-block upload, completion

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use md5::{Digest, Md5};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use super::record::ProgressRecord;
use super::recorder::{DestinationKey, RecoveryStore};
use super::source::UploadSource;
use super::splitter::{block_count, BlockSplitter};
use super::{UploadResult, UploadTarget};
use crate::config::{validate_block_size, Config};
use crate::error::UploadError;
use crate::token::encode_key;
use crate::transport::{RequestBody, RetryableTransport};

/// Header carrying the hex MD5 of a block
const CONTENT_MD5: &str = "content-md5";

/// Prefix for user metadata headers on completion
pub const META_HEADER_PREFIX: &str = "x-qn-meta-";

/// Lifecycle of a chunked upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Fresh,
    Initiating,
    Uploading,
    Completing,
    Done,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    #[serde(rename = "uploadId")]
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct PartResponse {
    etag: String,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    parts: Vec<CompletePart<'a>>,
}

#[derive(Debug, Serialize)]
struct CompletePart<'a> {
    #[serde(rename = "Etag")]
    etag: &'a str,
    #[serde(rename = "PartNumber")]
    part_number: u32,
}

/// Drives one resumable multi-block upload.
///
/// Blocks go out strictly in order; the record is persisted after each
/// acknowledgment and only deleted once the object is assembled.
pub struct ChunkedUploadSession {
    config: Arc<Config>,
    transport: RetryableTransport,
    store: Arc<dyn RecoveryStore>,
    target: UploadTarget,
    destination: DestinationKey,
    status: SessionStatus,
    record: ProgressRecord,
    resumed: bool,
    blocks_sent: usize,
}

impl ChunkedUploadSession {
    pub fn new(
        config: Arc<Config>,
        transport: RetryableTransport,
        store: Arc<dyn RecoveryStore>,
        target: UploadTarget,
        destination: DestinationKey,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            target,
            destination,
            status: SessionStatus::Fresh,
            record: ProgressRecord::new(String::new()),
            resumed: false,
            blocks_sent: 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// In-memory progress (session id is empty until initiated)
    pub fn record(&self) -> &ProgressRecord {
        &self.record
    }

    /// Whether this run picked up a persisted record
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Blocks sent by this run, excluding those adopted from a record
    pub fn blocks_sent(&self) -> usize {
        self.blocks_sent
    }

    pub fn destination(&self) -> &DestinationKey {
        &self.destination
    }

    /// Upload `source` to completion, resuming from persisted progress if usable
    pub async fn upload(
        &mut self,
        source: &mut UploadSource,
        source_size: Option<u64>,
    ) -> Result<UploadResult, UploadError> {
        if self.status != SessionStatus::Fresh {
            return Err(UploadError::InvalidConfiguration(
                "upload session can only be driven once".to_string(),
            ));
        }

        match self.drive(source, source_size).await {
            Ok(result) => {
                self.status = SessionStatus::Done;
                Ok(result)
            }
            Err(e) => {
                error!(
                    "Chunked upload of {}/{} failed after {} uploaded bytes: {}",
                    self.target.bucket, self.target.key, self.record.uploaded_bytes, e
                );
                self.status = SessionStatus::Failed;
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        source: &mut UploadSource,
        source_size: Option<u64>,
    ) -> Result<UploadResult, UploadError> {
        validate_block_size(self.config.block_size)?;
        let resumed = self.try_resume(source, source_size).await?;

        // Never read past the declared size
        let remaining = source_size
            .map(|size| size.saturating_sub(self.record.uploaded_bytes))
            .unwrap_or(u64::MAX);
        let mut splitter =
            BlockSplitter::new((&mut *source).take(remaining), self.config.block_size)?;

        // The first block is read before initiating so an empty source costs no session
        let mut next = splitter.next_block().await?;
        if !resumed {
            if next.is_none() {
                return Err(UploadError::IncompleteUpload(
                    "cannot upload an empty source in blocks".to_string(),
                ));
            }
            self.status = SessionStatus::Initiating;
            let session_id = self.initiate().await?;
            info!("Started upload session {}", session_id);
            self.record = ProgressRecord::new(session_id);
        }

        self.status = SessionStatus::Uploading;
        let total_blocks = source_size.map(|size| block_count(size, self.config.block_size));

        while let Some(block) = next {
            let part_num = self.record.next_part_num();
            let len = block.len() as u64;
            match total_blocks {
                Some(total) => info!("Uploading block {}/{} ({} bytes)...", part_num, total, len),
                None => info!("Uploading block {} ({} bytes)...", part_num, len),
            }

            let session_id = self.record.session_id.clone();
            let etag = self.upload_block(&session_id, part_num, block).await?;

            self.record.push_block(etag, len);
            self.store.save(&self.destination, &self.record)?;
            self.blocks_sent += 1;

            next = splitter.next_block().await?;
        }

        if let Some(size) = source_size {
            let source = splitter.into_inner().into_inner();
            check_declared_size(source, self.record.uploaded_bytes, size).await?;
        }

        self.complete().await
    }

    /// Adopt a valid persisted record and position the source after its bytes
    async fn try_resume(
        &mut self,
        source: &mut UploadSource,
        source_size: Option<u64>,
    ) -> Result<bool, UploadError> {
        let loaded = match self.store.load(&self.destination) {
            Ok(record) => record,
            Err(e) => {
                error!(
                    "Recovery store failed to load progress for {}/{}, starting over: {}",
                    self.destination.bucket, self.destination.key, e
                );
                None
            }
        };

        let Some(record) = loaded else {
            return Ok(false);
        };

        match record.validate_for_resume(source_size, self.config.record_freshness, Utc::now()) {
            Ok(()) => {
                debug!(
                    "Skipping {} bytes by {}",
                    record.uploaded_bytes,
                    if source.supports_seek() { "seeking" } else { "reading ahead" }
                );
                source.skip(record.uploaded_bytes).await?;
                info!(
                    "Resuming session {} at block {} ({} bytes already uploaded)",
                    record.session_id,
                    record.next_part_num(),
                    record.uploaded_bytes
                );
                self.record = record;
                self.resumed = true;
                Ok(true)
            }
            Err(reason) => {
                info!(
                    "Discarding progress record for {}/{}: {}",
                    self.destination.bucket, self.destination.key, reason
                );
                Ok(false)
            }
        }
    }

    fn uploads_path(&self) -> String {
        format!(
            "/buckets/{}/objects/{}/uploads",
            self.target.bucket,
            encode_key(&self.target.key)
        )
    }

    fn auth_headers(&self) -> Result<HeaderMap, UploadError> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("UpToken {}", self.target.token)).map_err(|_| {
            UploadError::InvalidConfiguration("upload token is not a valid header value".to_string())
        })?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    async fn initiate(&self) -> Result<String, UploadError> {
        let (url, backups) = self.config.urls_for(&self.uploads_path());
        let headers = self.auth_headers()?;

        let response = self
            .transport
            .request(Method::POST, &url, &backups, headers, RequestBody::Empty)
            .await?
            .into_success()?;

        let init: InitResponse = response.json()?;
        if init.upload_id.is_empty() {
            return Err(UploadError::InvalidResponse(
                "service returned an empty upload id".to_string(),
            ));
        }
        Ok(init.upload_id)
    }

    async fn upload_block(
        &self,
        session_id: &str,
        part_num: u32,
        block: Bytes,
    ) -> Result<String, UploadError> {
        let path = format!("{}/{}/{}", self.uploads_path(), session_id, part_num);
        let (url, backups) = self.config.urls_for(&path);

        let mut headers = self.auth_headers()?;
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        if !self.target.disable_checksum {
            let digest = hex::encode(Md5::digest(&block));
            if let Ok(value) = HeaderValue::from_str(&digest) {
                headers.insert(HeaderName::from_static(CONTENT_MD5), value);
            }
        }

        let response = self
            .transport
            .request(Method::PUT, &url, &backups, headers, RequestBody::Bytes(block))
            .await?
            .into_success()
            .map_err(|e| match e {
                UploadError::ChecksumMismatch { .. } => UploadError::ChecksumMismatch {
                    part_num: Some(part_num),
                },
                other => other,
            })?;

        let part: PartResponse = response.json()?;
        Ok(part.etag)
    }

    async fn complete(&mut self) -> Result<UploadResult, UploadError> {
        self.status = SessionStatus::Completing;

        let parts = self.record.completion_parts()?;
        let body = CompleteRequest {
            parts: parts
                .iter()
                .map(|ack| CompletePart {
                    etag: &ack.etag,
                    part_number: ack.part_num,
                })
                .collect(),
        };
        let body = serde_json::to_vec(&body).map_err(|e| {
            UploadError::InvalidConfiguration(format!("failed to encode completion body: {}", e))
        })?;

        let mut headers = self.auth_headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        for (name, value) in meta_headers(&self.target)? {
            headers.insert(name, value);
        }

        let path = format!("{}/{}", self.uploads_path(), self.record.session_id);
        let (url, backups) = self.config.urls_for(&path);

        info!(
            "Completing session {} with {} blocks",
            self.record.session_id,
            self.record.blocks.len()
        );
        let response = self
            .transport
            .request(Method::POST, &url, &backups, headers, RequestBody::Bytes(body.into()))
            .await?
            .into_success()?;
        let result: UploadResult = response.json()?;

        if let Err(e) = self.store.delete(&self.destination) {
            warn!(
                "Upload of {}/{} completed but its progress record could not be removed: {}",
                self.destination.bucket, self.destination.key, e
            );
        }

        Ok(result)
    }

    /// Cancel the persisted session server-side and forget its progress.
    ///
    /// Returns `false` when there was nothing to abort.
    pub async fn abort(&mut self) -> Result<bool, UploadError> {
        let record = match self.store.load(&self.destination)? {
            Some(record) if !record.session_id.is_empty() => record,
            _ => return Ok(false),
        };

        let path = format!("{}/{}", self.uploads_path(), record.session_id);
        let (url, backups) = self.config.urls_for(&path);
        let headers = self.auth_headers()?;

        let response = self
            .transport
            .request(Method::DELETE, &url, &backups, headers, RequestBody::Empty)
            .await?;

        // 612: session already gone server-side
        if response.status != 612 && response.status != 404 {
            response.into_success()?;
        }

        self.store.delete(&self.destination)?;
        info!("Aborted upload session {}", record.session_id);
        Ok(true)
    }
}

/// Fail unless exactly `declared` bytes went out and the source has nothing left
async fn check_declared_size(
    source: &mut UploadSource,
    uploaded: u64,
    declared: u64,
) -> Result<(), UploadError> {
    if uploaded != declared {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("source ended after {} of {} declared bytes", uploaded, declared),
        )
        .into());
    }
    let mut extra = [0u8; 1];
    if source.read(&mut extra).await? > 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("source is longer than the declared {} bytes", declared),
        )
        .into());
    }
    Ok(())
}

/// `x-qn-meta-*` headers for the caller's metadata
pub(crate) fn meta_headers(
    target: &UploadTarget,
) -> Result<Vec<(HeaderName, HeaderValue)>, UploadError> {
    target
        .meta
        .iter()
        .map(|(key, value)| {
            let name = HeaderName::from_bytes(format!("{}{}", META_HEADER_PREFIX, key).as_bytes())
                .map_err(|_| {
                    UploadError::InvalidConfiguration(format!("invalid metadata key: {}", key))
                })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                UploadError::InvalidConfiguration(format!("invalid metadata value for {}", key))
            })?;
            Ok((name, value))
        })
        .collect()
}
