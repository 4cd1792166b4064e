//! Upload token decoding
//!
//! The token is treated as opaque on the wire. It is only decoded here to
//! recover the destination bucket and key when the caller omits them.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;

use crate::error::UploadError;

/// Policy fields the uploader cares about
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadPolicy {
    pub scope: String,
    #[serde(rename = "isPrefixalScope", default)]
    pub is_prefixal_scope: Option<u8>,
    #[serde(rename = "saveKey", default)]
    pub save_key: Option<String>,
    #[serde(rename = "returnUrl", default)]
    pub return_url: Option<String>,
    #[serde(default)]
    pub deadline: Option<u64>,
}

/// A decoded `<access_key>:<signature>:<encoded_policy>` upload token
#[derive(Debug, Clone)]
pub struct UploadToken {
    token: String,
    policy: UploadPolicy,
}

impl UploadToken {
    /// Decode the policy part of an upload token
    pub fn parse(token: &str) -> Result<Self, UploadError> {
        let encoded_policy = token
            .splitn(3, ':')
            .nth(2)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                UploadError::InvalidConfiguration("malformed upload token".to_string())
            })?;

        let raw = URL_SAFE
            .decode(encoded_policy)
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded_policy.trim_end_matches('=')))
            .map_err(|e| {
                UploadError::InvalidConfiguration(format!("upload token policy is not base64: {}", e))
            })?;

        let policy: UploadPolicy = serde_json::from_slice(&raw).map_err(|e| {
            UploadError::InvalidConfiguration(format!("upload token policy is not valid: {}", e))
        })?;

        Ok(Self {
            token: token.to_string(),
            policy,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.token
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Bucket named by the policy scope
    pub fn bucket(&self) -> &str {
        self.policy
            .scope
            .split_once(':')
            .map(|(bucket, _)| bucket)
            .unwrap_or(&self.policy.scope)
    }

    pub fn is_prefixal_scope(&self) -> bool {
        self.policy.is_prefixal_scope.unwrap_or(0) != 0
    }

    pub fn has_return_url(&self) -> bool {
        self.policy
            .return_url
            .as_deref()
            .is_some_and(|url| !url.is_empty())
    }

    /// Object key the token is scoped to
    pub fn object_key(&self) -> Result<String, UploadError> {
        if let Some(save_key) = &self.policy.save_key {
            return Ok(save_key.clone());
        }
        if self.is_prefixal_scope() {
            return Err(UploadError::InvalidConfiguration(
                "missing object key: token scope is a key prefix".to_string(),
            ));
        }
        match self.policy.scope.split_once(':') {
            Some((_, key)) if !key.is_empty() => Ok(key.to_string()),
            _ => Err(UploadError::InvalidConfiguration(
                "missing object key: token does not name one".to_string(),
            )),
        }
    }
}

/// URL-safe base64 of an object key, as used in upload paths
pub fn encode_key(key: &str) -> String {
    URL_SAFE.encode(key.as_bytes())
}
