//! Resumable progress state for chunked uploads

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StaleRecord, UploadError};

/// Service acknowledgment for one stored block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockAck {
    pub etag: String,
    pub part_num: u32,
}

/// Progress of one multi-block session, persisted after every block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub session_id: String,
    pub blocks: Vec<BlockAck>,
    pub uploaded_bytes: u64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// Fresh record for a newly initiated session
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            blocks: Vec::new(),
            uploaded_bytes: 0,
            created_at: Utc::now(),
        }
    }

    /// Part number the next uploaded block will carry
    pub fn next_part_num(&self) -> u32 {
        self.blocks.len() as u32 + 1
    }

    /// Record an acknowledged block of `len` bytes
    pub fn push_block(&mut self, etag: impl Into<String>, len: u64) {
        let part_num = self.next_part_num();
        self.blocks.push(BlockAck {
            etag: etag.into(),
            part_num,
        });
        self.uploaded_bytes += len;
    }

    /// First position whose part number breaks the 1, 2, 3... sequence
    fn first_gap(&self) -> Option<(usize, u32)> {
        self.blocks
            .iter()
            .enumerate()
            .find(|(i, ack)| ack.part_num as usize != i + 1)
            .map(|(i, ack)| (i, ack.part_num))
    }

    pub fn has_contiguous_blocks(&self) -> bool {
        self.first_gap().is_none()
    }

    /// Check the record against a source of `source_size` bytes
    pub fn validate_for_resume(
        &self,
        source_size: Option<u64>,
        freshness: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), StaleRecord> {
        let age_secs = (now - self.created_at).num_seconds();
        let window_secs = i64::try_from(freshness.as_secs()).unwrap_or(i64::MAX);
        if age_secs >= window_secs {
            return Err(StaleRecord::Expired { age_secs });
        }
        if self.session_id.is_empty() {
            return Err(StaleRecord::MissingSession);
        }
        if self.blocks.is_empty() {
            return Err(StaleRecord::NoBlocks);
        }
        if let Some((position, part_num)) = self.first_gap() {
            return Err(StaleRecord::NonContiguous { position, part_num });
        }
        if self.uploaded_bytes == 0 {
            return Err(StaleRecord::NothingUploaded);
        }
        let size = source_size.ok_or(StaleRecord::UnknownSourceSize)?;
        if self.uploaded_bytes > size {
            return Err(StaleRecord::ExceedsSource {
                uploaded: self.uploaded_bytes,
                size,
            });
        }
        Ok(())
    }

    pub fn is_valid_for_resume(&self, source_size: Option<u64>, freshness: Duration) -> bool {
        self.validate_for_resume(source_size, freshness, Utc::now())
            .is_ok()
    }

    /// Ack list ready for the completion call, or why it cannot be sent
    pub fn completion_parts(&self) -> Result<&[BlockAck], UploadError> {
        if self.blocks.is_empty() {
            return Err(UploadError::IncompleteUpload(
                "no blocks were uploaded".to_string(),
            ));
        }
        if let Some((position, part_num)) = self.first_gap() {
            return Err(UploadError::IncompleteUpload(format!(
                "block at position {} has part number {}",
                position, part_num
            )));
        }
        Ok(&self.blocks)
    }
}
