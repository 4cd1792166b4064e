//! Upload engine: block splitting, progress records, chunked and direct uploads

mod direct;
mod dispatcher;
mod record;
mod recorder;
mod session;
mod source;
mod splitter;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use direct::{DirectUploadStrategy, DEFAULT_MIME_TYPE};
pub use dispatcher::{
    choose_strategy, ResumablePolicy, UploadDispatcher, UploadRequest, UploadStrategy,
};
pub use record::{BlockAck, ProgressRecord};
pub use recorder::{
    file_identity, DestinationKey, FileRecoveryStore, MemoryRecoveryStore, NoopRecoveryStore,
    RecoveryStore,
};
pub use session::{ChunkedUploadSession, SessionStatus, META_HEADER_PREFIX};
pub use source::{SeekableRead, UploadSource};
pub use splitter::{block_count, BlockSplitter};

/// Resolved destination and options shared by both upload strategies
#[derive(Debug, Clone)]
pub struct UploadTarget {
    pub bucket: String,
    pub key: String,
    pub token: String,
    pub meta: BTreeMap<String, String>,
    pub disable_checksum: bool,
}

impl UploadTarget {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            token: token.into(),
            meta: BTreeMap::new(),
            disable_checksum: false,
        }
    }
}

/// Descriptor of the stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub hash: String,
    pub key: String,
}
