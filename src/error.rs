//! Error types shared by the upload engine

use thiserror::Error;

/// Errors surfaced to callers of the upload API
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Completion was attempted with an empty or gapped block list
    #[error("incomplete upload: {0}")]
    IncompleteUpload(String),

    #[error("{}", checksum_message(.part_num))]
    ChecksumMismatch { part_num: Option<u32> },

    #[error("recovery store error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

fn checksum_message(part_num: &Option<u32>) -> String {
    match part_num {
        Some(n) => format!("checksum mismatch for block {}", n),
        None => "checksum mismatch".to_string(),
    }
}

/// Failures talking to the storage service
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}: {message}")]
    Status {
        status: u16,
        url: String,
        request_id: Option<String>,
        message: String,
    },

    #[error("no upload endpoint available")]
    NoEndpoint,
}

impl TransportError {
    /// HTTP status of the final response, if one was received
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Recovery store failures that are not plain "no record"
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reasons a persisted progress record cannot be resumed.
///
/// Never surfaced to callers: the session logs the reason and starts over.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StaleRecord {
    #[error("record has no session id")]
    MissingSession,

    #[error("record has no acknowledged blocks")]
    NoBlocks,

    #[error("block at position {position} has part number {part_num}")]
    NonContiguous { position: usize, part_num: u32 },

    #[error("record reports no uploaded bytes")]
    NothingUploaded,

    #[error("record claims {uploaded} bytes but source has {size}")]
    ExceedsSource { uploaded: u64, size: u64 },

    #[error("source size is unknown")]
    UnknownSourceSize,

    #[error("record is {age_secs}s old")]
    Expired { age_secs: i64 },
}
