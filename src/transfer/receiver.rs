//! Receiving side of one file transfer

use bytes::{Bytes, BytesMut};

use super::{ReceivedFile, TransferError, TransferResult};
use crate::protocol::channel::DEFAULT_MIME;
use crate::protocol::FileMetadata;

/// Accumulates the chunks of one announced file
#[derive(Debug)]
pub struct FileReceiver {
    metadata: FileMetadata,
    chunks: Vec<Bytes>,
    bytes_received: u64,
    progress: f64,
}

impl FileReceiver {
    /// Start receiving the file described by `metadata`
    pub fn new(mut metadata: FileMetadata) -> Self {
        if metadata.mime.is_empty() {
            metadata.mime = DEFAULT_MIME.to_string();
        }
        let progress = if metadata.size == 0 { 1.0 } else { 0.0 };
        FileReceiver {
            metadata,
            chunks: Vec::new(),
            bytes_received: 0,
            progress,
        }
    }

    /// Declared properties of the file
    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    /// Append a chunk and return the updated progress
    pub fn push_chunk(&mut self, chunk: Bytes) -> TransferResult<f64> {
        let received = self.bytes_received + chunk.len() as u64;
        if received > self.metadata.size {
            return Err(TransferError::Overflow {
                file_id: self.metadata.file_id,
                declared: self.metadata.size,
                received,
            });
        }

        self.bytes_received = received;
        self.chunks.push(chunk);
        self.progress = (received as f64 / self.metadata.size as f64).min(1.0);
        Ok(self.progress)
    }

    /// Received fraction in `0.0..=1.0`, never decreasing
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Bytes received so far
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Whether the declared size has been reached
    pub fn is_complete(&self) -> bool {
        self.bytes_received >= self.metadata.size
    }

    /// Assemble the payload
    pub fn finish(self) -> ReceivedFile {
        let mut data = BytesMut::with_capacity(self.bytes_received as usize);
        for chunk in &self.chunks {
            data.extend_from_slice(chunk);
        }
        ReceivedFile {
            file_id: self.metadata.file_id,
            name: self.metadata.name,
            mime: self.metadata.mime,
            data: data.freeze(),
        }
    }
}
