//! Chunked file transfer over a data channel
//!
//! A [`TransferEngine`] exists per remote peer. It serializes outgoing files (FIFO, one at
//! a time), paces them with partition acknowledgements and reassembles incoming files.
//! The engine never touches the channel itself: every call returns an [`Outbox`] of
//! frames to send and events to report, which keeps it synchronous and easy to test.

use std::collections::VecDeque;
use std::path::Path;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{CHUNK_SIZE, MAX_PARTITION_SIZE};
use crate::protocol::channel::DEFAULT_MIME;
use crate::protocol::{ChannelFrame, ChannelMessage, PartitionMark, ProtocolError};

pub mod receiver;
pub mod sender;

pub use receiver::FileReceiver;
pub use sender::{FileSender, Partition};

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    /// A binary chunk arrived with no file announced
    #[error("Chunk received without file metadata")]
    UnexpectedChunk,

    /// More bytes arrived than the metadata declared
    #[error("File {file_id} overflowed: declared {declared} bytes, got {received}")]
    Overflow {
        /// File concerned
        file_id: u32,
        /// Declared size
        declared: u64,
        /// Bytes received including the offending chunk
        received: u64,
    },

    /// An acknowledgement did not match the pending boundary
    #[error("Unexpected acknowledgement {received:?}, expected {expected:?}")]
    UnexpectedAck {
        /// Boundary waiting for acknowledgement, if any
        expected: Option<PartitionMark>,
        /// Acknowledgement received
        received: PartitionMark,
    },

    /// A partition was requested while the previous one is unacknowledged
    #[error("Waiting for acknowledgement of {0:?}")]
    AwaitingAck(PartitionMark),

    /// A partition was requested after the last one
    #[error("File {0} already sent")]
    Finished(u32),

    /// Message could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Local file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// A file queued for sending
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingFile {
    /// File name announced to the receiver
    pub name: String,
    /// MIME type announced to the receiver
    pub mime: String,
    /// Contents
    pub data: Bytes,
}

impl OutgoingFile {
    /// Describe in-memory contents
    pub fn new(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        OutgoingFile {
            name: name.into(),
            mime: mime.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk
    pub async fn from_path(path: impl AsRef<Path>) -> TransferResult<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(OutgoingFile::new(name, DEFAULT_MIME, data))
    }
}

/// A completely received file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Sender-scoped identifier
    pub file_id: u32,
    /// Declared name
    pub name: String,
    /// Declared MIME type, defaulted when absent
    pub mime: String,
    /// Contents
    pub data: Bytes,
}

/// Which way a transfer flows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// We are sending
    Outgoing,
    /// We are receiving
    Incoming,
}

/// Something the application should know about a transfer
#[derive(Clone, Debug, PartialEq)]
pub enum TransferEvent {
    /// Fraction of a file transferred so far
    Progress {
        /// Direction of the transfer
        direction: Direction,
        /// File concerned
        file_id: u32,
        /// File name
        name: String,
        /// Fraction in `0.0..=1.0`
        progress: f64,
    },
    /// An outgoing file was fully acknowledged
    Sent {
        /// File concerned
        file_id: u32,
        /// File name
        name: String,
    },
    /// An incoming file was fully received
    Received(ReceivedFile),
    /// A transfer was discarded before completion
    Aborted {
        /// Direction of the transfer
        direction: Direction,
        /// File concerned
        file_id: u32,
        /// File name
        name: String,
    },
}

/// Frames to send and events to report after an engine call
#[derive(Debug, Default)]
pub struct Outbox {
    /// Frames for the data channel, in order
    pub frames: Vec<ChannelFrame>,
    /// Events for the application
    pub events: Vec<TransferEvent>,
}

impl Outbox {
    fn message(&mut self, message: &ChannelMessage) -> TransferResult<()> {
        self.frames.push(ChannelFrame::Text(message.to_json()?));
        Ok(())
    }
}

/// File transfers with one remote peer
#[derive(Debug)]
pub struct TransferEngine {
    next_file_id: u32,
    queue: VecDeque<OutgoingFile>,
    outgoing: Option<FileSender>,
    incoming: Option<FileReceiver>,
    chunk_size: usize,
    max_partition_size: usize,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferEngine {
    /// Engine using the protocol chunk and partition sizes
    pub fn new() -> Self {
        Self::with_limits(CHUNK_SIZE, MAX_PARTITION_SIZE)
    }

    /// Engine with explicit sizes
    pub fn with_limits(chunk_size: usize, max_partition_size: usize) -> Self {
        TransferEngine {
            next_file_id: 1,
            queue: VecDeque::new(),
            outgoing: None,
            incoming: None,
            chunk_size,
            max_partition_size,
        }
    }

    /// Queue a file behind those already waiting
    pub fn enqueue(&mut self, file: OutgoingFile) {
        debug!("Queued {} ({} bytes)", file.name, file.data.len());
        self.queue.push_back(file);
    }

    /// Files waiting behind the active transfer
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether an outgoing transfer is in flight
    pub fn is_sending(&self) -> bool {
        self.outgoing.is_some()
    }

    /// Whether an incoming transfer is in flight
    pub fn is_receiving(&self) -> bool {
        self.incoming.is_some()
    }

    /// Start the next queued file if nothing is being sent
    ///
    /// Call once the channel is open and after enqueueing.
    pub fn pump(&mut self) -> TransferResult<Outbox> {
        let mut outbox = Outbox::default();
        self.start_next(&mut outbox)?;
        Ok(outbox)
    }

    /// Handle a file control message from the remote peer
    pub fn handle_message(&mut self, message: ChannelMessage) -> TransferResult<Outbox> {
        let mut outbox = Outbox::default();
        match message {
            ChannelMessage::FileMetadata(metadata) => {
                if let Some(previous) = self.incoming.take() {
                    warn!(
                        "File {} superseded before completion",
                        previous.metadata().name
                    );
                    outbox.events.push(TransferEvent::Aborted {
                        direction: Direction::Incoming,
                        file_id: previous.metadata().file_id,
                        name: previous.metadata().name.clone(),
                    });
                }

                info!("Receiving {} ({} bytes)", metadata.name, metadata.size);
                let receiver = FileReceiver::new(metadata);
                if receiver.is_complete() {
                    self.complete_incoming(receiver, &mut outbox);
                } else {
                    self.incoming = Some(receiver);
                }
            }

            ChannelMessage::FilePartitionBoundary(mark) => {
                outbox.message(&ChannelMessage::FilePartitionReceived(mark))?;
            }

            ChannelMessage::FilePartitionReceived(mark) => {
                let Some(sender) = self.outgoing.as_mut() else {
                    return Err(TransferError::UnexpectedAck {
                        expected: None,
                        received: mark,
                    });
                };
                sender.acknowledge(mark)?;
                outbox.events.push(TransferEvent::Progress {
                    direction: Direction::Outgoing,
                    file_id: sender.file_id(),
                    name: sender.name().to_string(),
                    progress: sender.progress(),
                });

                if sender.is_complete() {
                    self.finish_outgoing(&mut outbox)?;
                } else {
                    let partition = sender.next_partition()?;
                    push_partition(partition, &mut outbox)?;
                }
            }

            ChannelMessage::Text(_) => {}
        }
        Ok(outbox)
    }

    /// Handle a binary chunk for the active incoming file
    pub fn handle_chunk(&mut self, chunk: Bytes) -> TransferResult<Outbox> {
        let mut outbox = Outbox::default();
        let receiver = self
            .incoming
            .as_mut()
            .ok_or(TransferError::UnexpectedChunk)?;

        if let Err(e) = receiver.push_chunk(chunk) {
            if let Some(receiver) = self.incoming.take() {
                outbox.events.push(TransferEvent::Aborted {
                    direction: Direction::Incoming,
                    file_id: receiver.metadata().file_id,
                    name: receiver.metadata().name.clone(),
                });
            }
            warn!("Discarding incoming file: {}", e);
            return Ok(outbox);
        }

        outbox.events.push(TransferEvent::Progress {
            direction: Direction::Incoming,
            file_id: receiver.metadata().file_id,
            name: receiver.metadata().name.clone(),
            progress: receiver.progress(),
        });
        if receiver.is_complete() {
            if let Some(receiver) = self.incoming.take() {
                self.complete_incoming(receiver, &mut outbox);
            }
        }
        Ok(outbox)
    }

    /// Discard in-flight transfers after the channel was lost
    ///
    /// Files still waiting in the queue are kept for the next channel.
    pub fn reset(&mut self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        if let Some(sender) = self.outgoing.take() {
            events.push(TransferEvent::Aborted {
                direction: Direction::Outgoing,
                file_id: sender.file_id(),
                name: sender.name().to_string(),
            });
        }
        if let Some(receiver) = self.incoming.take() {
            events.push(TransferEvent::Aborted {
                direction: Direction::Incoming,
                file_id: receiver.metadata().file_id,
                name: receiver.metadata().name.clone(),
            });
        }
        events
    }

    fn start_next(&mut self, outbox: &mut Outbox) -> TransferResult<()> {
        while self.outgoing.is_none() {
            let Some(file) = self.queue.pop_front() else {
                return Ok(());
            };

            let file_id = self.next_file_id;
            self.next_file_id = self.next_file_id.wrapping_add(1);
            let mut sender =
                FileSender::with_limits(file_id, file, self.chunk_size, self.max_partition_size);

            info!("Sending {} as file {}", sender.name(), file_id);
            outbox.message(&ChannelMessage::FileMetadata(sender.metadata()))?;

            if sender.is_complete() {
                outbox.events.push(TransferEvent::Sent {
                    file_id,
                    name: sender.name().to_string(),
                });
                continue;
            }

            let partition = sender.next_partition()?;
            push_partition(partition, outbox)?;
            self.outgoing = Some(sender);
        }
        Ok(())
    }

    fn finish_outgoing(&mut self, outbox: &mut Outbox) -> TransferResult<()> {
        if let Some(sender) = self.outgoing.take() {
            info!("Sent {}", sender.name());
            outbox.events.push(TransferEvent::Sent {
                file_id: sender.file_id(),
                name: sender.name().to_string(),
            });
        }
        self.start_next(outbox)
    }

    fn complete_incoming(&mut self, receiver: FileReceiver, outbox: &mut Outbox) {
        let file = receiver.finish();
        info!("Received {} ({} bytes)", file.name, file.data.len());
        outbox.events.push(TransferEvent::Received(file));
    }
}

fn push_partition(partition: Partition, outbox: &mut Outbox) -> TransferResult<()> {
    outbox
        .frames
        .extend(partition.chunks.into_iter().map(ChannelFrame::Binary));
    outbox.message(&ChannelMessage::FilePartitionBoundary(partition.mark))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shuttle frames between two engines until both are quiet
    fn run(a: &mut TransferEngine, b: &mut TransferEngine, first: Outbox) -> (Vec<TransferEvent>, Vec<TransferEvent>, usize) {
        let mut a_events = first.events;
        let mut b_events = Vec::new();
        let mut boundaries = 0;
        let mut to_b = first.frames;
        let mut to_a = Vec::new();

        while !to_b.is_empty() || !to_a.is_empty() {
            for frame in std::mem::take(&mut to_b) {
                let out = match frame {
                    ChannelFrame::Text(text) => {
                        let message = ChannelMessage::parse(&text).unwrap();
                        if matches!(message, ChannelMessage::FilePartitionBoundary(_)) {
                            boundaries += 1;
                        }
                        b.handle_message(message).unwrap()
                    }
                    ChannelFrame::Binary(chunk) => b.handle_chunk(chunk).unwrap(),
                };
                to_a.extend(out.frames);
                b_events.extend(out.events);
            }
            for frame in std::mem::take(&mut to_a) {
                let out = match frame {
                    ChannelFrame::Text(text) => {
                        a.handle_message(ChannelMessage::parse(&text).unwrap()).unwrap()
                    }
                    ChannelFrame::Binary(chunk) => a.handle_chunk(chunk).unwrap(),
                };
                to_b.extend(out.frames);
                a_events.extend(out.events);
            }
        }
        (a_events, b_events, boundaries)
    }

    fn payload(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn received(events: &[TransferEvent]) -> Vec<&ReceivedFile> {
        events
            .iter()
            .filter_map(|event| match event {
                TransferEvent::Received(file) => Some(file),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_round_trip_with_protocol_sizes() {
        let size = 3 * MAX_PARTITION_SIZE + 12_345;
        let mut a = TransferEngine::new();
        let mut b = TransferEngine::new();

        a.enqueue(OutgoingFile::new("big.bin", "application/x-test", payload(size)));
        let first = a.pump().unwrap();
        let (a_events, b_events, boundaries) = run(&mut a, &mut b, first);

        assert_eq!(boundaries, 4);
        let files = received(&b_events);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].data.len(), size);
        assert_eq!(files[0].data.as_ref(), payload(size).as_slice());
        assert_eq!(files[0].mime, "application/x-test");
        assert!(a_events.contains(&TransferEvent::Sent {
            file_id: 1,
            name: "big.bin".to_string()
        }));
        assert!(!a.is_sending());
        assert!(!b.is_receiving());
    }

    #[test]
    fn test_progress_is_monotonic_and_reaches_one() {
        let mut a = TransferEngine::with_limits(4, 16);
        let mut b = TransferEngine::with_limits(4, 16);
        a.enqueue(OutgoingFile::new("p.txt", "text/plain", payload(50)));
        let first = a.pump().unwrap();
        let (a_events, b_events, boundaries) = run(&mut a, &mut b, first);
        assert_eq!(boundaries, 4);

        for (events, direction) in [(&b_events, Direction::Incoming), (&a_events, Direction::Outgoing)] {
            let progress: Vec<f64> = events
                .iter()
                .filter_map(|event| match event {
                    TransferEvent::Progress {
                        direction: d,
                        progress,
                        ..
                    } if *d == direction => Some(*progress),
                    _ => None,
                })
                .collect();
            assert!(!progress.is_empty());
            assert!(progress.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(progress.last(), Some(&1.0));
        }
    }

    #[test]
    fn test_files_sent_in_queue_order() {
        let mut a = TransferEngine::with_limits(3, 8);
        let mut b = TransferEngine::with_limits(3, 8);
        a.enqueue(OutgoingFile::new("one", "", payload(20)));
        a.enqueue(OutgoingFile::new("two", "", payload(5)));
        a.enqueue(OutgoingFile::new("three", "", payload(9)));
        assert_eq!(a.queued(), 3);

        let first = a.pump().unwrap();
        assert!(a.is_sending());
        assert_eq!(a.queued(), 2);
        // A second pump while busy sends nothing
        assert!(a.pump().unwrap().frames.is_empty());

        let (_, b_events, _) = run(&mut a, &mut b, first);
        let names: Vec<&str> = received(&b_events).iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
        let ids: Vec<u32> = received(&b_events).iter().map(|f| f.file_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_empty_file_sends_metadata_only() {
        let mut a = TransferEngine::new();
        let mut b = TransferEngine::new();
        a.enqueue(OutgoingFile::new("empty", "", Vec::new()));

        let first = a.pump().unwrap();
        assert_eq!(first.frames.len(), 1);
        assert!(first.events.contains(&TransferEvent::Sent {
            file_id: 1,
            name: "empty".to_string()
        }));

        let (_, b_events, boundaries) = run(&mut a, &mut b, first);
        assert_eq!(boundaries, 0);
        let files = received(&b_events);
        assert_eq!(files.len(), 1);
        assert!(files[0].data.is_empty());
        assert_eq!(files[0].mime, DEFAULT_MIME);
    }

    #[test]
    fn test_boundary_always_acknowledged() {
        let mut b = TransferEngine::new();
        let mark = PartitionMark {
            file_id: 42,
            offset: 1024,
        };
        let out = b
            .handle_message(ChannelMessage::FilePartitionBoundary(mark))
            .unwrap();
        assert_eq!(
            out.frames,
            vec![ChannelFrame::Text(
                ChannelMessage::FilePartitionReceived(mark).to_json().unwrap()
            )]
        );
    }

    #[test]
    fn test_stray_chunk_and_ack_rejected() {
        let mut engine = TransferEngine::new();
        assert!(matches!(
            engine.handle_chunk(Bytes::from_static(b"x")),
            Err(TransferError::UnexpectedChunk)
        ));
        assert!(matches!(
            engine.handle_message(ChannelMessage::FilePartitionReceived(PartitionMark {
                file_id: 1,
                offset: 10
            })),
            Err(TransferError::UnexpectedAck { expected: None, .. })
        ));
    }

    #[test]
    fn test_reset_discards_active_transfers() {
        let mut a = TransferEngine::with_limits(4, 8);
        let mut b = TransferEngine::with_limits(4, 8);
        a.enqueue(OutgoingFile::new("first", "", payload(32)));
        a.enqueue(OutgoingFile::new("second", "", payload(4)));

        let out = a.pump().unwrap();
        for frame in out.frames {
            match frame {
                ChannelFrame::Text(text) => {
                    b.handle_message(ChannelMessage::parse(&text).unwrap()).unwrap();
                }
                ChannelFrame::Binary(chunk) => {
                    b.handle_chunk(chunk).unwrap();
                }
            }
        }
        assert!(b.is_receiving());

        assert_eq!(
            a.reset(),
            vec![TransferEvent::Aborted {
                direction: Direction::Outgoing,
                file_id: 1,
                name: "first".to_string()
            }]
        );
        assert!(matches!(
            b.reset().as_slice(),
            [TransferEvent::Aborted {
                direction: Direction::Incoming,
                ..
            }]
        ));

        // The queued file survives and goes out on the next channel
        let out = a.pump().unwrap();
        let text = match &out.frames[0] {
            ChannelFrame::Text(text) => text.clone(),
            other => panic!("Unexpected frame: {:?}", other),
        };
        match ChannelMessage::parse(&text).unwrap() {
            ChannelMessage::FileMetadata(meta) => {
                assert_eq!(meta.name, "second");
                assert_eq!(meta.file_id, 2);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_superseded_incoming_file_is_aborted() {
        let mut b = TransferEngine::new();
        let meta = |file_id, name: &str| {
            ChannelMessage::FileMetadata(crate::protocol::FileMetadata {
                file_id,
                name: name.to_string(),
                mime: String::new(),
                size: 10,
            })
        };
        b.handle_message(meta(1, "a")).unwrap();
        b.handle_chunk(Bytes::from_static(b"12345")).unwrap();

        let out = b.handle_message(meta(2, "b")).unwrap();
        assert!(matches!(
            out.events.as_slice(),
            [TransferEvent::Aborted { file_id: 1, .. }]
        ));
        let out = b.handle_chunk(Bytes::from_static(b"0123456789")).unwrap();
        assert!(matches!(out.events.last(), Some(TransferEvent::Received(file)) if file.file_id == 2));
    }
}
