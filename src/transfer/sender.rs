//! Sending side of one file transfer
//!
//! The file is cut into chunks of at most `chunk_size` bytes. Chunks are grouped into
//! partitions of at most `max_partition_size` bytes; after each partition the sender
//! stops and waits for the receiver to acknowledge the boundary offset before producing
//! the next one. Chunks are clipped at the partition ceiling, so every partition except
//! the last holds exactly `max_partition_size` bytes and a file of `S` bytes produces
//! `ceil(S / max_partition_size)` boundaries.

use bytes::Bytes;

use super::{OutgoingFile, TransferError, TransferResult};
use crate::config::{CHUNK_SIZE, MAX_PARTITION_SIZE};
use crate::protocol::{FileMetadata, PartitionMark};

/// Chunks to send followed by the boundary that closes them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// Raw chunk payloads, in order
    pub chunks: Vec<Bytes>,
    /// Boundary to announce after the last chunk
    pub mark: PartitionMark,
}

/// Flow-controlled sender for one file
#[derive(Debug)]
pub struct FileSender {
    file_id: u32,
    name: String,
    mime: String,
    data: Bytes,
    offset: usize,
    acknowledged: usize,
    awaiting: Option<PartitionMark>,
    chunk_size: usize,
    max_partition_size: usize,
}

impl FileSender {
    /// Sender using the protocol chunk and partition sizes
    pub fn new(file_id: u32, file: OutgoingFile) -> Self {
        Self::with_limits(file_id, file, CHUNK_SIZE, MAX_PARTITION_SIZE)
    }

    /// Sender with explicit sizes; `chunk_size` is capped at `max_partition_size`
    pub fn with_limits(
        file_id: u32,
        file: OutgoingFile,
        chunk_size: usize,
        max_partition_size: usize,
    ) -> Self {
        let max_partition_size = max_partition_size.max(1);
        FileSender {
            file_id,
            name: file.name,
            mime: file.mime,
            data: file.data,
            offset: 0,
            acknowledged: 0,
            awaiting: None,
            chunk_size: chunk_size.clamp(1, max_partition_size),
            max_partition_size,
        }
    }

    /// Identifier announced in every control message for this file
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// File name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata announcing this file
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            file_id: self.file_id,
            name: self.name.clone(),
            mime: self.mime.clone(),
            size: self.data.len() as u64,
        }
    }

    /// Produce the next partition
    ///
    /// Fails while a boundary is unacknowledged or once the whole file was sent.
    pub fn next_partition(&mut self) -> TransferResult<Partition> {
        if let Some(mark) = self.awaiting {
            return Err(TransferError::AwaitingAck(mark));
        }
        if self.offset >= self.data.len() {
            return Err(TransferError::Finished(self.file_id));
        }

        let mut chunks = Vec::new();
        let mut partition_size = 0;
        while partition_size < self.max_partition_size && self.offset < self.data.len() {
            let len = self
                .chunk_size
                .min(self.max_partition_size - partition_size)
                .min(self.data.len() - self.offset);
            chunks.push(self.data.slice(self.offset..self.offset + len));
            self.offset += len;
            partition_size += len;
        }

        let mark = PartitionMark {
            file_id: self.file_id,
            offset: self.offset as u64,
        };
        self.awaiting = Some(mark);
        Ok(Partition { chunks, mark })
    }

    /// Accept the receiver's acknowledgement of the pending boundary
    pub fn acknowledge(&mut self, mark: PartitionMark) -> TransferResult<()> {
        match self.awaiting {
            Some(expected) if expected == mark => {
                self.awaiting = None;
                self.acknowledged = self.offset;
                Ok(())
            }
            expected => Err(TransferError::UnexpectedAck {
                expected,
                received: mark,
            }),
        }
    }

    /// Whether a boundary is waiting for acknowledgement
    pub fn is_waiting(&self) -> bool {
        self.awaiting.is_some()
    }

    /// Whether every byte was sent and acknowledged
    pub fn is_complete(&self) -> bool {
        self.awaiting.is_none() && self.offset >= self.data.len()
    }

    /// Acknowledged fraction in `0.0..=1.0`; an empty file counts as done
    pub fn progress(&self) -> f64 {
        if self.data.is_empty() {
            1.0
        } else {
            self.acknowledged as f64 / self.data.len() as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size: usize) -> OutgoingFile {
        OutgoingFile::new(
            "data.bin",
            "",
            (0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>(),
        )
    }

    fn send_all(sender: &mut FileSender) -> Vec<Partition> {
        let mut partitions = Vec::new();
        while !sender.is_complete() {
            let partition = sender.next_partition().unwrap();
            sender.acknowledge(partition.mark).unwrap();
            partitions.push(partition);
        }
        partitions
    }

    #[test]
    fn test_boundary_count_is_ceil() {
        // C < P < S with S not a multiple of P
        let mut sender = FileSender::with_limits(1, file(25), 3, 10);
        let partitions = send_all(&mut sender);

        assert_eq!(partitions.len(), 3);
        let offsets: Vec<u64> = partitions.iter().map(|p| p.mark.offset).collect();
        assert_eq!(offsets, vec![10, 20, 25]);

        let sizes: Vec<Vec<usize>> = partitions
            .iter()
            .map(|p| p.chunks.iter().map(|c| c.len()).collect())
            .collect();
        assert_eq!(sizes[0], vec![3, 3, 3, 1]);
        assert_eq!(sizes[2], vec![3, 2]);
    }

    #[test]
    fn test_exact_multiple_of_partition() {
        let mut sender = FileSender::with_limits(1, file(20), 5, 10);
        assert_eq!(send_all(&mut sender).len(), 2);
    }

    #[test]
    fn test_default_sizes() {
        let size = 2 * MAX_PARTITION_SIZE + MAX_PARTITION_SIZE / 2;
        let mut sender = FileSender::new(9, file(size));
        let partitions = send_all(&mut sender);

        assert_eq!(partitions.len(), 3);
        assert!(partitions
            .iter()
            .flat_map(|p| p.chunks.iter())
            .all(|c| c.len() <= CHUNK_SIZE));
        let total: usize = partitions.iter().flat_map(|p| &p.chunks).map(|c| c.len()).sum();
        assert_eq!(total, size);
    }

    #[test]
    fn test_waits_for_acknowledgement() {
        let mut sender = FileSender::with_limits(4, file(30), 4, 10);
        let first = sender.next_partition().unwrap();
        assert!(sender.is_waiting());
        assert!(matches!(
            sender.next_partition(),
            Err(TransferError::AwaitingAck(mark)) if mark == first.mark
        ));

        let wrong = PartitionMark {
            file_id: 4,
            offset: 20,
        };
        assert!(matches!(
            sender.acknowledge(wrong),
            Err(TransferError::UnexpectedAck { .. })
        ));
        assert_eq!(sender.progress(), 0.0);

        sender.acknowledge(first.mark).unwrap();
        assert!((sender.progress() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_file_is_complete() {
        let mut sender = FileSender::new(2, file(0));
        assert!(sender.is_complete());
        assert_eq!(sender.progress(), 1.0);
        assert!(matches!(
            sender.next_partition(),
            Err(TransferError::Finished(2))
        ));
        assert_eq!(sender.metadata().size, 0);
    }
}
