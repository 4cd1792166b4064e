//! HTTP transport with backup endpoints and pluggable retry rules

mod client;
mod retry;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{TransportError, UploadError};

pub use client::RetryableTransport;
pub use retry::{AttemptOutcome, DefaultRetryPolicy, NoRetryPolicy, RetryPolicy};

/// Response header carrying the service's request id
pub const REQUEST_ID_HEADER: &str = "X-ReqId";

/// Request payload, cheap to clone for each attempt
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    Form(Vec<FormField>),
}

#[derive(Debug, Clone)]
pub struct FormField {
    pub name: String,
    pub value: FormValue,
}

#[derive(Debug, Clone)]
pub enum FormValue {
    Text(String),
    File {
        data: Bytes,
        file_name: String,
        mime_type: String,
    },
}

impl FormField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: FormValue::Text(value.into()),
        }
    }
}

/// Final response of a (possibly retried) request
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn request_id(&self) -> Option<&str> {
        self.headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
    }

    fn json_value(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn body_is_object(&self) -> bool {
        matches!(self.json_value(), Some(Value::Object(_)))
    }

    /// The `error` field of a JSON body, if present
    pub fn error_message(&self) -> Option<String> {
        match self.json_value()? {
            Value::Object(map) => map.get("error").map(|e| match e {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.error_message().is_none()
    }

    /// Turn a failed response into the matching error
    pub fn into_success(self) -> Result<Self, UploadError> {
        if self.is_success() {
            return Ok(self);
        }
        if self.status == 406 {
            return Err(UploadError::ChecksumMismatch { part_num: None });
        }
        let message = self.error_message().unwrap_or_else(|| {
            String::from_utf8_lossy(&self.body).trim().to_string()
        });
        Err(TransportError::Status {
            status: self.status,
            request_id: self.request_id().map(str::to_string),
            url: self.url,
            message,
        }
        .into())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, UploadError> {
        serde_json::from_slice(&self.body).map_err(|e| {
            UploadError::InvalidResponse(format!("{} returned unexpected body: {}", self.url, e))
        })
    }
}
