//! qiniu-uploader library - resumable chunked uploads to object storage

pub mod config;
pub mod error;
pub mod http_logger;
pub mod token;
pub mod transport;
pub mod upload;

// Re-export commonly used types
pub use config::{Config, ConfigOptions};
pub use error::{RecorderError, StaleRecord, TransportError, UploadError};
pub use token::{encode_key, UploadToken};
pub use transport::{DefaultRetryPolicy, RetryPolicy, RetryableTransport};
pub use upload::{
    ChunkedUploadSession, DestinationKey, FileRecoveryStore, MemoryRecoveryStore,
    NoopRecoveryStore, RecoveryStore, ResumablePolicy, SessionStatus, UploadDispatcher,
    UploadRequest, UploadResult, UploadSource, UploadStrategy,
};
