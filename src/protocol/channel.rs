//! Data-channel envelopes
//!
//! Control messages are JSON text frames. File chunks are raw binary frames without any
//! wrapper, told apart from control messages only by the frame type.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::ProtocolResult;

/// MIME type assumed when the sender declares none
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Declared properties of a file about to be streamed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Sender-scoped file identifier
    pub file_id: u32,
    /// File name
    pub name: String,
    /// MIME type
    #[serde(rename = "type", default)]
    pub mime: String,
    /// Declared size in bytes
    pub size: u64,
}

/// Cumulative byte offset reached by a file at a partition boundary
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMark {
    /// File the mark belongs to
    pub file_id: u32,
    /// Bytes sent so far
    pub offset: u64,
}

/// Control messages carried as text frames
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "kebab-case")]
pub enum ChannelMessage {
    /// Plain text message
    Text(String),
    /// Announces a file; chunks follow as binary frames
    FileMetadata(FileMetadata),
    /// Sender paused after a partition and waits for acknowledgement
    FilePartitionBoundary(PartitionMark),
    /// Receiver acknowledges a partition, letting the sender resume
    FilePartitionReceived(PartitionMark),
}

impl ChannelMessage {
    /// Parse from a text frame
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize into a text frame
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One frame on a data channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelFrame {
    /// JSON control message
    Text(String),
    /// Raw file chunk
    Binary(Bytes),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_envelope_shape() {
        let json = ChannelMessage::Text("hello".to_string()).to_json().unwrap();
        assert_eq!(json, r#"{"type":"text","detail":"hello"}"#);
    }

    #[test]
    fn test_file_envelopes_carry_file_id() {
        let meta = ChannelMessage::FileMetadata(FileMetadata {
            file_id: 7,
            name: "notes.txt".to_string(),
            mime: "text/plain".to_string(),
            size: 12,
        });
        let value: serde_json::Value = serde_json::from_str(&meta.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "file-metadata");
        assert_eq!(value["detail"]["fileId"], 7);
        assert_eq!(value["detail"]["type"], "text/plain");

        let ack = ChannelMessage::parse(
            r#"{"type":"file-partition-received","detail":{"fileId":7,"offset":1048576}}"#,
        )
        .unwrap();
        assert_eq!(
            ack,
            ChannelMessage::FilePartitionReceived(PartitionMark {
                file_id: 7,
                offset: 1_048_576
            })
        );
    }

    #[test]
    fn test_metadata_without_type() {
        let parsed = ChannelMessage::parse(
            r#"{"type":"file-metadata","detail":{"fileId":1,"name":"a.bin","size":3}}"#,
        )
        .unwrap();
        match parsed {
            ChannelMessage::FileMetadata(meta) => assert!(meta.mime.is_empty()),
            other => panic!("Wrong message: {:?}", other),
        }
    }
}
