//! Fixed-size block splitting over an async byte stream

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{validate_block_size_with, MIN_BLOCK_SIZE};
use crate::error::UploadError;

/// Splits a stream into blocks of exactly `block_size` bytes, except the last.
///
/// Forward-only: once a short or empty read signals end of stream, no more
/// blocks are produced. Replay is the caller's job (seek or skip the source).
pub struct BlockSplitter<R> {
    reader: R,
    block_size: u64,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin> BlockSplitter<R> {
    pub fn new(reader: R, block_size: u64) -> Result<Self, UploadError> {
        Self::with_granularity(reader, block_size, MIN_BLOCK_SIZE)
    }

    /// Like [`BlockSplitter::new`] with a non-default minimum granularity
    pub fn with_granularity(
        reader: R,
        block_size: u64,
        granularity: u64,
    ) -> Result<Self, UploadError> {
        validate_block_size_with(block_size, granularity)?;
        Ok(Self {
            reader,
            block_size,
            exhausted: false,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Read the next block, or `None` at end of stream
    pub async fn next_block(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut buf = Vec::with_capacity(self.block_size as usize);
        (&mut self.reader)
            .take(self.block_size)
            .read_to_end(&mut buf)
            .await?;

        if (buf.len() as u64) < self.block_size {
            self.exhausted = true;
        }
        if buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(buf)))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Number of blocks a payload of `len` bytes splits into
pub fn block_count(len: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return 0;
    }
    len.div_ceil(block_size)
}
