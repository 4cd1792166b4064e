//! Upload sources: random-access files and forward-only streams

use std::io::{Cursor, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, ReadBuf};

/// Reader that can also seek
pub trait SeekableRead: AsyncRead + AsyncSeek + Unpin + Send {}
impl<T: AsyncRead + AsyncSeek + Unpin + Send> SeekableRead for T {}

/// Payload handed to an uploader
pub enum UploadSource {
    Seekable(Box<dyn SeekableRead>),
    Sequential(Box<dyn AsyncRead + Unpin + Send>),
}

impl UploadSource {
    pub fn seekable<R: AsyncRead + AsyncSeek + Unpin + Send + 'static>(reader: R) -> Self {
        Self::Seekable(Box::new(reader))
    }

    pub fn sequential<R: AsyncRead + Unpin + Send + 'static>(reader: R) -> Self {
        Self::Sequential(Box::new(reader))
    }

    /// In-memory payload, seekable
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::seekable(Cursor::new(data.into()))
    }

    pub fn supports_seek(&self) -> bool {
        matches!(self, Self::Seekable(_))
    }

    /// Advance past `n` bytes already stored server-side
    pub async fn skip(&mut self, n: u64) -> std::io::Result<()> {
        match self {
            Self::Seekable(reader) => {
                let offset = i64::try_from(n).map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "skip offset too large")
                })?;
                reader.seek(SeekFrom::Current(offset)).await?;
                Ok(())
            }
            Self::Sequential(reader) => {
                let mut limited = (&mut *reader).take(n);
                let discarded = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
                if discarded < n {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("source ended after {} of {} bytes", discarded, n),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Read the whole payload, refusing anything longer than `expected`
    pub async fn read_all(&mut self, expected: u64) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(expected as usize);
        (&mut *self).take(expected + 1).read_to_end(&mut buf).await?;
        if buf.len() as u64 != expected {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("expected {} bytes from source, got {}", expected, buf.len()),
            ));
        }
        Ok(buf)
    }
}

impl AsyncRead for UploadSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Seekable(reader) => Pin::new(reader).poll_read(cx, buf),
            Self::Sequential(reader) => Pin::new(reader).poll_read(cx, buf),
        }
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seekable(_) => write!(f, "UploadSource::Seekable"),
            Self::Sequential(_) => write!(f, "UploadSource::Sequential"),
        }
    }
}
