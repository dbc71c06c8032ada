//! Replication wire protocol
//!
//! All messages are serialized with bincode and validated with CRC32.
//!
//! Format: [message_type:1][length:4][payload:N][crc32:4]
//!
//! Effect batches travel inside `Effects` messages as opaque payloads; the
//! payload bytes are exactly the batch wire format of [`crate::effects`].

use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Name of the wire command that carries an effect batch
pub const COMMAND_NAME: &str = "GRAPH.EFFECT";

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// The wire command: graph id plus serialized batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectCommand {
    /// Target graph
    pub graph_id: String,
    /// Per-graph position in master commit order, starting at 1
    pub sequence: u64,
    /// Serialized effect batch
    pub payload: Vec<u8>,
}

impl EffectCommand {
    /// Command arguments as they appear on the monitoring channel
    pub fn args(&self) -> (&str, &str, &[u8]) {
        (COMMAND_NAME, &self.graph_id, &self.payload)
    }
}

/// Replication message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMessageType {
    /// Handshake from replica to master
    Hello = 0x01,
    /// Handshake response from master
    Welcome = 0x02,
    /// Heartbeat ping
    Ping = 0x10,
    /// Heartbeat pong
    Pong = 0x11,
    /// Effect batch
    Effects = 0x20,
    /// Effect batch acknowledgment
    EffectsAck = 0x21,
    /// Request full resynchronization
    RequestResync = 0x30,
    /// Resync snapshot metadata
    ResyncMeta = 0x31,
    /// Resync snapshot chunk
    ResyncChunk = 0x32,
    /// Resync complete
    ResyncComplete = 0x33,
    /// Error message
    Error = 0xFF,
}

impl TryFrom<u8> for ReplicationMessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Welcome),
            0x10 => Ok(Self::Ping),
            0x11 => Ok(Self::Pong),
            0x20 => Ok(Self::Effects),
            0x21 => Ok(Self::EffectsAck),
            0x30 => Ok(Self::RequestResync),
            0x31 => Ok(Self::ResyncMeta),
            0x32 => Ok(Self::ResyncChunk),
            0x33 => Ok(Self::ResyncComplete),
            0xFF => Ok(Self::Error),
            _ => Err(Error::replication(format!("Unknown message type: {}", value))),
        }
    }
}

/// Replication messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// Hello from replica
    Hello {
        /// Replica ID
        replica_id: String,
        /// Graph the replica follows
        graph_id: String,
        /// Protocol version spoken by the replica
        protocol_version: u32,
    },

    /// Welcome from master; a new connection always starts with a resync
    Welcome {
        /// Master ID
        master_id: String,
        /// Last sequence dispatched by the master
        current_sequence: u64,
    },

    /// Heartbeat ping
    Ping {
        /// Sender clock, ms since epoch
        timestamp: u64,
    },

    /// Heartbeat pong
    Pong {
        /// Timestamp echoed from the ping
        timestamp: u64,
    },

    /// Effect batch to apply
    Effects {
        /// Graph ID
        graph_id: String,
        /// Batch sequence number
        sequence: u64,
        /// Encoded effect batch
        payload: Vec<u8>,
    },

    /// Batch applied (or refused) by the replica
    EffectsAck {
        /// Sequence being acknowledged
        sequence: u64,
        /// False if the replica refused the batch
        success: bool,
    },

    /// Replica asks for a full snapshot
    RequestResync {
        /// Replica ID
        replica_id: String,
        /// Why the replica cannot continue
        reason: String,
    },

    /// Snapshot metadata; batches after `sequence` follow the snapshot
    ResyncMeta {
        /// Snapshot ID
        snapshot_id: String,
        /// Last batch sequence covered by the snapshot
        sequence: u64,
        /// Compressed size in bytes
        total_size: u64,
        /// Number of chunks that follow
        chunk_count: u32,
        /// CRC32 of the compressed snapshot
        checksum: u32,
    },

    /// Snapshot data chunk
    ResyncChunk {
        /// Snapshot ID
        snapshot_id: String,
        /// Chunk position, from 0
        chunk_index: u32,
        /// Chunk bytes
        data: Vec<u8>,
        /// CRC32 of `data`
        checksum: u32,
    },

    /// Snapshot transfer complete
    ResyncComplete {
        /// Snapshot ID
        snapshot_id: String,
        /// False if the master aborted the transfer
        success: bool,
    },

    /// Error message
    Error {
        /// Error code
        code: u32,
        /// Human readable message
        message: String,
    },
}

impl From<EffectCommand> for ReplicationMessage {
    fn from(cmd: EffectCommand) -> Self {
        Self::Effects {
            graph_id: cmd.graph_id,
            sequence: cmd.sequence,
            payload: cmd.payload,
        }
    }
}

impl ReplicationMessage {
    /// Get message type
    pub fn message_type(&self) -> ReplicationMessageType {
        match self {
            Self::Hello { .. } => ReplicationMessageType::Hello,
            Self::Welcome { .. } => ReplicationMessageType::Welcome,
            Self::Ping { .. } => ReplicationMessageType::Ping,
            Self::Pong { .. } => ReplicationMessageType::Pong,
            Self::Effects { .. } => ReplicationMessageType::Effects,
            Self::EffectsAck { .. } => ReplicationMessageType::EffectsAck,
            Self::RequestResync { .. } => ReplicationMessageType::RequestResync,
            Self::ResyncMeta { .. } => ReplicationMessageType::ResyncMeta,
            Self::ResyncChunk { .. } => ReplicationMessageType::ResyncChunk,
            Self::ResyncComplete { .. } => ReplicationMessageType::ResyncComplete,
            Self::Error { .. } => ReplicationMessageType::Error,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)
            .map_err(|e| Error::replication(format!("Serialization failed: {}", e)))?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::replication(format!(
                "Message too large: {} bytes",
                payload.len()
            )));
        }

        let mut buf = Vec::with_capacity(1 + 4 + payload.len() + 4);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);

        // CRC32 of type + length + payload
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());

        Ok(buf)
    }

    /// Decode message from bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        // min: type(1) + length(4) + crc(4)
        if buf.len() < 9 {
            return Err(Error::replication("Message too short"));
        }

        let crc_offset = buf.len() - 4;
        let stored_crc = read_u32(&buf[crc_offset..]);

        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_offset]);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(Error::replication(format!(
                "CRC mismatch: expected {:x}, got {:x}",
                stored_crc, computed_crc
            )));
        }

        let length = read_u32(&buf[1..5]) as usize;
        if buf.len() != 5 + length + 4 {
            return Err(Error::replication("Incomplete message"));
        }

        let msg_type = ReplicationMessageType::try_from(buf[0])?;
        let message: Self = bincode::deserialize(&buf[5..5 + length])
            .map_err(|e| Error::replication(format!("Deserialization failed: {}", e)))?;

        if message.message_type() != msg_type {
            return Err(Error::replication(format!(
                "Frame type {:?} does not match payload {:?}",
                msg_type,
                message.message_type()
            )));
        }
        Ok(message)
    }

    /// Write message to async stream
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let buf = self.encode()?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read message from async stream
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        // type(1) + length(4)
        let mut header = [0u8; 5];
        reader.read_exact(&mut header).await?;

        let length = read_u32(&header[1..5]) as usize;
        if length > MAX_FRAME_LEN {
            return Err(Error::replication(format!("Frame too large: {} bytes", length)));
        }

        // payload + CRC
        let mut full_buf = vec![0u8; 5 + length + 4];
        full_buf[..5].copy_from_slice(&header);
        reader.read_exact(&mut full_buf[5..]).await?;

        Self::decode(&full_buf)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode() {
        let msg = ReplicationMessage::Ping {
            timestamp: 1234567890,
        };

        let encoded = msg.encode().unwrap();
        let decoded = ReplicationMessage::decode(&encoded).unwrap();

        match decoded {
            ReplicationMessage::Ping { timestamp } => assert_eq!(timestamp, 1234567890),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_effects_message_from_command() {
        let cmd = EffectCommand {
            graph_id: "g".into(),
            sequence: 42,
            payload: vec![0, 0, 0, 0],
        };
        let encoded = ReplicationMessage::from(cmd.clone()).encode().unwrap();
        assert_eq!(encoded[0], ReplicationMessageType::Effects as u8);

        match ReplicationMessage::decode(&encoded).unwrap() {
            ReplicationMessage::Effects {
                graph_id,
                sequence,
                payload,
            } => {
                assert_eq!(graph_id, cmd.graph_id);
                assert_eq!(sequence, 42);
                assert_eq!(payload, cmd.payload);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_command_args() {
        let cmd = EffectCommand {
            graph_id: "social".into(),
            sequence: 1,
            payload: vec![9],
        };
        assert_eq!(cmd.args(), ("GRAPH.EFFECT", "social", &[9u8][..]));
    }

    #[test]
    fn test_crc_validation() {
        let msg = ReplicationMessage::Ping { timestamp: 123 };
        let mut encoded = msg.encode().unwrap();
        encoded[5] ^= 0xFF;

        let result = ReplicationMessage::decode(&encoded);
        assert!(result.unwrap_err().to_string().contains("CRC"));
    }

    #[test]
    fn test_type_byte_must_match_payload() {
        let mut encoded = ReplicationMessage::Ping { timestamp: 1 }.encode().unwrap();
        encoded[0] = ReplicationMessageType::Pong as u8;
        let crc_offset = encoded.len() - 4;
        let mut hasher = Hasher::new();
        hasher.update(&encoded[..crc_offset]);
        let crc = hasher.finalize().to_le_bytes();
        encoded[crc_offset..].copy_from_slice(&crc);

        assert!(ReplicationMessage::decode(&encoded).is_err());
    }

    #[test]
    fn test_message_types() {
        assert_eq!(
            ReplicationMessage::Hello {
                replica_id: "".into(),
                graph_id: "".into(),
                protocol_version: 1
            }
            .message_type(),
            ReplicationMessageType::Hello
        );
        assert_eq!(
            ReplicationMessage::RequestResync {
                replica_id: "r".into(),
                reason: "gap".into()
            }
            .message_type(),
            ReplicationMessageType::RequestResync
        );
        assert_eq!(ReplicationMessageType::try_from(0x33).unwrap(), ReplicationMessageType::ResyncComplete);
        assert!(ReplicationMessageType::try_from(0x40).is_err());
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = ReplicationMessage::EffectsAck {
            sequence: 7,
            success: true,
        };
        msg.write_to(&mut client).await.unwrap();

        match ReplicationMessage::read_from(&mut server).await.unwrap() {
            ReplicationMessage::EffectsAck { sequence, success } => {
                assert_eq!(sequence, 7);
                assert!(success);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let mut header = vec![ReplicationMessageType::Effects as u8];
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        client.write_all(&header).await.unwrap();

        assert!(ReplicationMessage::read_from(&mut server).await.is_err());
    }
}
