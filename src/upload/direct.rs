//! Single-request form upload for small payloads

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use tracing::info;

use super::session::META_HEADER_PREFIX;
use super::{UploadResult, UploadTarget};
use crate::config::Config;
use crate::error::UploadError;
use crate::transport::{FormField, FormValue, RequestBody, RetryableTransport};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Uploads a whole payload as one multipart form POST
#[derive(Debug, Clone)]
pub struct DirectUploadStrategy {
    config: Arc<Config>,
    transport: RetryableTransport,
}

impl DirectUploadStrategy {
    pub fn new(config: Arc<Config>, transport: RetryableTransport) -> Self {
        Self { config, transport }
    }

    pub async fn upload(
        &self,
        target: &UploadTarget,
        data: Bytes,
        file_name: &str,
        mime_type: Option<&str>,
    ) -> Result<UploadResult, UploadError> {
        let fields = form_fields(target, data, file_name, mime_type);
        let (url, backups) = self.config.urls_for("/");

        info!(
            "Uploading {}/{} in a single request",
            target.bucket, target.key
        );
        let response = self
            .transport
            .request(
                Method::POST,
                &url,
                &backups,
                HeaderMap::new(),
                RequestBody::Form(fields),
            )
            .await?
            .into_success()?;

        response.json()
    }
}

/// Form fields in the order the service expects, file part last
fn form_fields(
    target: &UploadTarget,
    data: Bytes,
    file_name: &str,
    mime_type: Option<&str>,
) -> Vec<FormField> {
    let mut fields = vec![
        FormField::text("token", target.token.as_str()),
        FormField::text("key", target.key.as_str()),
    ];
    if !target.disable_checksum {
        fields.push(FormField::text("crc32", crc32fast::hash(&data).to_string()));
    }
    for (key, value) in &target.meta {
        fields.push(FormField::text(
            format!("{}{}", META_HEADER_PREFIX, key),
            value.as_str(),
        ));
    }
    fields.push(FormField {
        name: "file".to_string(),
        value: FormValue::File {
            data,
            file_name: file_name.to_string(),
            mime_type: mime_type.unwrap_or(DEFAULT_MIME_TYPE).to_string(),
        },
    });
    fields
}
