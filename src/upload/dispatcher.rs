//! Upload dispatcher - picks direct or chunked upload per payload

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::direct::DirectUploadStrategy;
use super::recorder::{file_identity, DestinationKey, RecoveryStore};
use super::session::ChunkedUploadSession;
use super::source::UploadSource;
use super::{UploadResult, UploadTarget};
use crate::config::Config;
use crate::error::UploadError;
use crate::token::UploadToken;
use crate::transport::{DefaultRetryPolicy, RetryableTransport};

/// Caller's preference for chunked uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumablePolicy {
    /// Chunked above the threshold or for unknown sizes
    #[default]
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for ResumablePolicy {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(UploadError::InvalidConfiguration(format!(
                "unknown resumable policy: {}",
                other
            ))),
        }
    }
}

/// How a payload ends up being sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    Direct,
    Chunked,
}

/// Choose a strategy from the caller's policy and the payload size
pub fn choose_strategy(
    policy: ResumablePolicy,
    size: Option<u64>,
    threshold: u64,
) -> Result<UploadStrategy, UploadError> {
    match (policy, size) {
        (ResumablePolicy::Always, _) => Ok(UploadStrategy::Chunked),
        (ResumablePolicy::Never, Some(_)) => Ok(UploadStrategy::Direct),
        (ResumablePolicy::Never, None) => Err(UploadError::InvalidConfiguration(
            "direct upload requires a known payload size".to_string(),
        )),
        (ResumablePolicy::Auto, Some(size)) if size <= threshold => Ok(UploadStrategy::Direct),
        (ResumablePolicy::Auto, _) => Ok(UploadStrategy::Chunked),
    }
}

/// What to upload where
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub token: String,
    /// Defaults to the bucket in the token's scope
    pub bucket: Option<String>,
    /// Defaults to the key derived from the token
    pub key: Option<String>,
    pub meta: BTreeMap<String, String>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub disable_checksum: bool,
    pub policy: ResumablePolicy,
}

impl UploadRequest {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn disable_checksum(mut self, disable: bool) -> Self {
        self.disable_checksum = disable;
        self
    }

    pub fn policy(mut self, policy: ResumablePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Entry point for uploads: resolves the destination and routes the payload
pub struct UploadDispatcher {
    config: Arc<Config>,
    transport: RetryableTransport,
    store: Arc<dyn RecoveryStore>,
    adapt_retry_policy: bool,
}

impl UploadDispatcher {
    pub fn new(config: Arc<Config>, store: Arc<dyn RecoveryStore>) -> Result<Self, UploadError> {
        let transport = RetryableTransport::new(&config)?;
        Ok(Self {
            config,
            transport,
            store,
            adapt_retry_policy: true,
        })
    }

    /// Use a preconfigured transport; its retry policy is left untouched
    pub fn with_transport(
        config: Arc<Config>,
        transport: RetryableTransport,
        store: Arc<dyn RecoveryStore>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            adapt_retry_policy: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn choose(
        &self,
        policy: ResumablePolicy,
        size: Option<u64>,
    ) -> Result<UploadStrategy, UploadError> {
        choose_strategy(policy, size, self.config.upload_threshold)
    }

    /// Upload a local file; its identity keeps progress records per file version
    pub async fn upload_file(
        &self,
        path: &Path,
        request: UploadRequest,
    ) -> Result<UploadResult, UploadError> {
        let size = tokio::fs::metadata(path).await?.len();
        let strategy = self.choose(request.policy, Some(size))?;
        let (target, transport) = self.resolve(&request)?;

        info!(
            "Uploading {} ({} bytes) to {}/{} via {:?} upload",
            path.display(),
            size,
            target.bucket,
            target.key,
            strategy
        );

        match strategy {
            UploadStrategy::Direct => {
                let data = tokio::fs::read(path).await?;
                let file_name = request.file_name.clone().unwrap_or_else(|| {
                    path.file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| target.key.clone())
                });
                DirectUploadStrategy::new(self.config.clone(), transport)
                    .upload(&target, Bytes::from(data), &file_name, request.mime_type.as_deref())
                    .await
            }
            UploadStrategy::Chunked => {
                let destination = file_destination(&target, path);
                let file = tokio::fs::File::open(path).await?;
                let mut source = UploadSource::seekable(file);
                let mut session = ChunkedUploadSession::new(
                    self.config.clone(),
                    transport,
                    self.store.clone(),
                    target,
                    destination,
                );
                session.upload(&mut source, Some(size)).await
            }
        }
    }

    /// Upload from an arbitrary source; `size` is `None` for streams of unknown length
    pub async fn upload_stream(
        &self,
        mut source: UploadSource,
        size: Option<u64>,
        request: UploadRequest,
    ) -> Result<UploadResult, UploadError> {
        let strategy = self.choose(request.policy, size)?;
        let (target, transport) = self.resolve(&request)?;

        info!(
            "Uploading stream ({}) to {}/{} via {:?} upload",
            size.map(|s| format!("{} bytes", s))
                .unwrap_or_else(|| "unknown size".to_string()),
            target.bucket,
            target.key,
            strategy
        );

        match (strategy, size) {
            (UploadStrategy::Direct, Some(size)) => {
                let data = source.read_all(size).await?;
                let file_name = request.file_name.clone().unwrap_or_else(|| target.key.clone());
                DirectUploadStrategy::new(self.config.clone(), transport)
                    .upload(&target, Bytes::from(data), &file_name, request.mime_type.as_deref())
                    .await
            }
            (UploadStrategy::Direct, None) => Err(UploadError::InvalidConfiguration(
                "direct upload requires a known payload size".to_string(),
            )),
            (UploadStrategy::Chunked, _) => {
                let destination = DestinationKey::new(&target.bucket, &target.key);
                let mut session = ChunkedUploadSession::new(
                    self.config.clone(),
                    transport,
                    self.store.clone(),
                    target,
                    destination,
                );
                session.upload(&mut source, size).await
            }
        }
    }

    /// Abort the persisted chunked session for a destination.
    ///
    /// Pass the same `path` used for the upload so the file identity matches.
    pub async fn abort(
        &self,
        request: &UploadRequest,
        path: Option<&Path>,
    ) -> Result<bool, UploadError> {
        let (target, transport) = self.resolve(request)?;
        let destination = match path {
            Some(path) => file_destination(&target, path),
            None => DestinationKey::new(&target.bucket, &target.key),
        };
        let mut session = ChunkedUploadSession::new(
            self.config.clone(),
            transport,
            self.store.clone(),
            target,
            destination,
        );
        session.abort().await
    }

    /// Fill bucket and key from the token where the caller left them out
    fn resolve(
        &self,
        request: &UploadRequest,
    ) -> Result<(UploadTarget, RetryableTransport), UploadError> {
        if request.token.trim().is_empty() {
            return Err(UploadError::InvalidConfiguration(
                "upload token cannot be empty".to_string(),
            ));
        }

        let parsed = UploadToken::parse(&request.token);
        if let Err(e) = &parsed {
            debug!("Upload token could not be decoded: {}", e);
        }

        let bucket = match &request.bucket {
            Some(bucket) => bucket.clone(),
            None => parsed.as_ref().map_err(token_error)?.bucket().to_string(),
        };
        if bucket.is_empty() {
            return Err(UploadError::InvalidConfiguration(
                "bucket cannot be empty".to_string(),
            ));
        }

        let key = match &request.key {
            Some(key) => key.clone(),
            None => parsed.as_ref().map_err(token_error)?.object_key()?,
        };

        let transport = match &parsed {
            Ok(token) if self.adapt_retry_policy && token.has_return_url() => {
                debug!("Upload policy has a return URL, relaxing retry rules");
                self.transport
                    .with_retry_policy(Arc::new(DefaultRetryPolicy::new().with_return_url(true)))
            }
            _ => self.transport.clone(),
        };

        Ok((
            UploadTarget {
                bucket,
                key,
                token: request.token.clone(),
                meta: request.meta.clone(),
                disable_checksum: request.disable_checksum,
            },
            transport,
        ))
    }
}

fn file_destination(target: &UploadTarget, path: &Path) -> DestinationKey {
    let destination = DestinationKey::new(&target.bucket, &target.key);
    match file_identity(path) {
        Ok(identity) => destination.with_source_identity(identity),
        Err(e) => {
            warn!(
                "Could not identify {}, progress is keyed by destination only: {}",
                path.display(),
                e
            );
            destination
        }
    }
}

fn token_error(e: &UploadError) -> UploadError {
    UploadError::InvalidConfiguration(format!("cannot derive destination from token: {}", e))
}
