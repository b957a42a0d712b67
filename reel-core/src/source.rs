//! Byte sources feeding the container parser
//!
//! A source yields the file as an ordered sequence of chunks and `None` once
//! the stream is complete. Chunk boundaries carry no meaning.

use crate::protocol::SourceLocator;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Read size used for local files
const FILE_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ByteSource: Send {
    /// Next chunk of the stream, `None` at end of stream
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError>;

    /// Human readable origin for logs
    fn describe(&self) -> String;
}

#[async_trait]
impl ByteSource for Box<dyn ByteSource> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        (**self).next_chunk().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Open the byte source a locator points at
pub async fn open_source(
    locator: &SourceLocator,
    client: &reqwest::Client,
) -> Result<Box<dyn ByteSource>, SourceError> {
    match locator {
        SourceLocator::Http(url) => Ok(Box::new(HttpByteSource::connect(client, url.clone()).await?)),
        SourceLocator::File(path) => Ok(Box::new(FileByteSource::open(path.clone()).await?)),
    }
}

// ============================================================================
// HTTP
// ============================================================================

/// Streaming HTTP body
pub struct HttpByteSource {
    url: url::Url,
    response: reqwest::Response,
    received: u64,
}

impl HttpByteSource {
    pub async fn connect(client: &reqwest::Client, url: url::Url) -> Result<Self, SourceError> {
        tracing::debug!("fetching {}", url);
        let response = client.get(url.clone()).send().await?.error_for_status()?;
        tracing::debug!(
            "fetch responded: {} ({:?} bytes)",
            response.status(),
            response.content_length()
        );

        Ok(Self {
            url,
            response,
            received: 0,
        })
    }
}

#[async_trait]
impl ByteSource for HttpByteSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        let chunk = self.response.chunk().await?;
        if let Some(bytes) = &chunk {
            self.received += bytes.len() as u64;
        } else {
            tracing::debug!("{} complete after {} bytes", self.url, self.received);
        }
        Ok(chunk)
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

// ============================================================================
// Local file
// ============================================================================

pub struct FileByteSource {
    path: PathBuf,
    file: tokio::fs::File,
}

impl FileByteSource {
    pub async fn open(path: PathBuf) -> Result<Self, SourceError> {
        let file = tokio::fs::File::open(&path).await.map_err(|source| SourceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { path, file })
    }
}

#[async_trait]
impl ByteSource for FileByteSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        let mut buf = BytesMut::with_capacity(FILE_CHUNK_SIZE);
        let read = self.file.read_buf(&mut buf).await.map_err(|source| SourceError::Io {
            path: self.path.display().to_string(),
            source,
        })?;

        if read == 0 {
            Ok(None)
        } else {
            Ok(Some(buf.freeze()))
        }
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Pre-split chunks, mostly useful for feeding a parser odd chunk boundaries
pub struct MemoryByteSource {
    chunks: VecDeque<Bytes>,
}

impl MemoryByteSource {
    pub fn new(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }

    /// Split `data` into chunks of at most `chunk_size` bytes
    pub fn chunked(data: impl Into<Bytes>, chunk_size: usize) -> Self {
        let data = data.into();
        let chunk_size = chunk_size.max(1);
        let chunks = (0..data.len())
            .step_by(chunk_size)
            .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
            .collect();
        Self { chunks }
    }
}

#[async_trait]
impl ByteSource for MemoryByteSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        Ok(self.chunks.pop_front())
    }

    fn describe(&self) -> String {
        format!("memory ({} chunks left)", self.chunks.len())
    }
}
