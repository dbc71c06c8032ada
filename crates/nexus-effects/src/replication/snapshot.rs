//! Full resynchronization snapshots
//!
//! A snapshot is the complete committed state of one graph: schema
//! dictionaries plus every node and edge. It is serialized with bincode,
//! compressed with zstd and protected by a CRC32 checksum, then shipped
//! in chunks.

use crate::graph::{GraphContent, GraphStore};
use crate::schema::{SchemaRegistry, SchemaSnapshot};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Complete graph state transferred on resync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Graph the snapshot belongs to
    pub graph_id: String,
    /// Schema dictionaries
    pub schema: SchemaSnapshot,
    /// Nodes and edges
    pub content: GraphContent,
}

impl GraphSnapshot {
    /// Capture the committed state of a master graph
    pub fn capture<S: GraphStore + ?Sized>(graph_id: &str, schema: &SchemaRegistry, store: &S) -> Self {
        Self {
            graph_id: graph_id.to_string(),
            schema: schema.snapshot(),
            content: store.export(),
        }
    }
}

/// Snapshot metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Snapshot ID
    pub id: String,
    /// Creation timestamp (Unix millis)
    pub created_at: u64,
    /// Last batch sequence included in the snapshot
    pub sequence: u64,
    /// Total uncompressed size
    pub uncompressed_size: u64,
    /// Total compressed size
    pub compressed_size: u64,
    /// CRC32 checksum of the compressed data
    pub checksum: u32,
}

/// Compressed snapshot ready for transfer
#[derive(Debug, Clone)]
pub struct EncodedSnapshot {
    /// Metadata
    pub metadata: SnapshotMetadata,
    /// Compressed bytes
    pub data: Vec<u8>,
}

impl EncodedSnapshot {
    /// Split the compressed bytes into transfer chunks
    pub fn chunks(&self, chunk_size: usize) -> impl Iterator<Item = SnapshotChunk> + '_ {
        self.data
            .chunks(chunk_size.max(1))
            .enumerate()
            .map(|(index, data)| SnapshotChunk {
                index: index as u32,
                checksum: crc32fast::hash(data),
                data: data.to_vec(),
            })
    }

    /// Number of chunks for a chunk size
    pub fn chunk_count(&self, chunk_size: usize) -> u32 {
        self.data.len().div_ceil(chunk_size.max(1)) as u32
    }
}

/// One transfer chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotChunk {
    /// Position in the transfer
    pub index: u32,
    /// Chunk bytes
    pub data: Vec<u8>,
    /// CRC32 of `data`
    pub checksum: u32,
}

/// Serialize, compress and checksum a snapshot
pub fn encode_snapshot(snapshot: &GraphSnapshot, sequence: u64, compression_level: i32) -> Result<EncodedSnapshot> {
    let start = Instant::now();
    let id = uuid::Uuid::new_v4().to_string();

    let raw = bincode::serialize(snapshot)
        .map_err(|e| Error::snapshot(format!("Serialization failed: {}", e)))?;
    let data = zstd::encode_all(raw.as_slice(), compression_level)
        .map_err(|e| Error::snapshot(format!("Compression failed: {}", e)))?;
    let checksum = crc32fast::hash(&data);

    let created_at = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    tracing::info!(
        "Snapshot {} of graph '{}' created in {:?} ({} nodes, {} edges, {} bytes -> {} bytes)",
        id,
        snapshot.graph_id,
        start.elapsed(),
        snapshot.content.nodes.len(),
        snapshot.content.edges.len(),
        raw.len(),
        data.len()
    );

    Ok(EncodedSnapshot {
        metadata: SnapshotMetadata {
            id,
            created_at,
            sequence,
            uncompressed_size: raw.len() as u64,
            compressed_size: data.len() as u64,
            checksum,
        },
        data,
    })
}

/// Verify, decompress and deserialize a snapshot
pub fn decode_snapshot(data: &[u8], checksum: u32) -> Result<GraphSnapshot> {
    let computed = crc32fast::hash(data);
    if computed != checksum {
        return Err(Error::snapshot(format!(
            "Checksum mismatch: expected {:x}, got {:x}",
            checksum, computed
        )));
    }

    let raw = zstd::decode_all(data).map_err(|e| Error::snapshot(format!("Decompression failed: {}", e)))?;
    bincode::deserialize(&raw).map_err(|e| Error::snapshot(format!("Deserialization failed: {}", e)))
}

/// Reassembles a chunked transfer on the receiving side
#[derive(Debug)]
pub struct SnapshotAssembler {
    metadata: SnapshotMetadata,
    chunk_count: u32,
    next_index: u32,
    data: Vec<u8>,
}

impl SnapshotAssembler {
    /// Start receiving a snapshot announced by its metadata
    pub fn new(metadata: SnapshotMetadata, chunk_count: u32) -> Self {
        let capacity = metadata.compressed_size.min(64 * 1024 * 1024) as usize;
        Self {
            metadata,
            chunk_count,
            next_index: 0,
            data: Vec::with_capacity(capacity),
        }
    }

    /// Metadata of the transfer
    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Check whether every chunk arrived
    pub fn is_complete(&self) -> bool {
        self.next_index == self.chunk_count
    }

    /// Accept the next chunk; chunks must arrive in order
    pub fn push(&mut self, chunk: SnapshotChunk) -> Result<()> {
        if chunk.index != self.next_index {
            return Err(Error::snapshot(format!(
                "Expected chunk {} but got {}",
                self.next_index, chunk.index
            )));
        }
        if chunk.index >= self.chunk_count {
            return Err(Error::snapshot(format!(
                "Chunk {} beyond announced count {}",
                chunk.index, self.chunk_count
            )));
        }
        if crc32fast::hash(&chunk.data) != chunk.checksum {
            return Err(Error::snapshot(format!("Chunk {} checksum mismatch", chunk.index)));
        }
        if self.data.len() + chunk.data.len() > self.metadata.compressed_size as usize {
            return Err(Error::snapshot("Snapshot larger than announced"));
        }

        self.data.extend_from_slice(&chunk.data);
        self.next_index += 1;
        Ok(())
    }

    /// Decode the reassembled snapshot
    pub fn finish(self) -> Result<GraphSnapshot> {
        if !self.is_complete() {
            return Err(Error::snapshot(format!(
                "Transfer incomplete: {} of {} chunks",
                self.next_index, self.chunk_count
            )));
        }
        decode_snapshot(&self.data, self.metadata.checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::WriteTransaction;
    use crate::graph::MemoryGraph;
    use crate::value::{EncodeLimits, PropertyValue};

    fn sample() -> GraphSnapshot {
        let mut store = MemoryGraph::new();
        let mut schema = SchemaRegistry::new();
        let mut tx = WriteTransaction::begin(&mut store, &mut schema, EncodeLimits::default()).unwrap();
        let a = tx
            .create_node(&["Person"], &[("name", PropertyValue::from("Ada"))])
            .unwrap();
        let b = tx.create_node(&["Person"], &[]).unwrap();
        tx.create_edge("KNOWS", a, b, &[("since", PropertyValue::Integer(1843))])
            .unwrap();
        tx.commit().unwrap();

        GraphSnapshot::capture("social", &schema, &store)
    }

    #[test]
    fn test_encode_decode() {
        let snapshot = sample();
        let encoded = encode_snapshot(&snapshot, 5, 3).unwrap();
        assert_eq!(encoded.metadata.sequence, 5);
        assert_eq!(encoded.metadata.compressed_size, encoded.data.len() as u64);

        let decoded = decode_snapshot(&encoded.data, encoded.metadata.checksum).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_checksum_mismatch() {
        let encoded = encode_snapshot(&sample(), 0, 1).unwrap();
        let err = decode_snapshot(&encoded.data, encoded.metadata.checksum ^ 1).unwrap_err();
        assert!(matches!(err, Error::Snapshot(_)));
    }

    #[test]
    fn test_chunked_transfer() {
        let snapshot = sample();
        let encoded = encode_snapshot(&snapshot, 1, 3).unwrap();
        let chunk_count = encoded.chunk_count(16);
        assert!(chunk_count > 1);

        let mut assembler = SnapshotAssembler::new(encoded.metadata.clone(), chunk_count);
        for chunk in encoded.chunks(16) {
            assert!(!assembler.is_complete());
            assembler.push(chunk).unwrap();
        }
        assert_eq!(assembler.finish().unwrap(), snapshot);
    }

    #[test]
    fn test_out_of_order_chunk_rejected() {
        let encoded = encode_snapshot(&sample(), 1, 3).unwrap();
        let mut assembler = SnapshotAssembler::new(encoded.metadata.clone(), encoded.chunk_count(8));
        let second = encoded.chunks(8).nth(1).unwrap();
        assert!(assembler.push(second).is_err());
    }

    #[test]
    fn test_corrupt_chunk_rejected() {
        let encoded = encode_snapshot(&sample(), 1, 3).unwrap();
        let mut assembler = SnapshotAssembler::new(encoded.metadata.clone(), encoded.chunk_count(8));
        let mut first = encoded.chunks(8).next().unwrap();
        first.data[0] ^= 0xFF;
        assert!(assembler.push(first).is_err());
    }

    #[test]
    fn test_incomplete_transfer() {
        let encoded = encode_snapshot(&sample(), 1, 3).unwrap();
        let assembler = SnapshotAssembler::new(encoded.metadata.clone(), encoded.chunk_count(8));
        assert!(assembler.finish().is_err());
    }

    #[test]
    fn test_empty_graph() {
        let snapshot = GraphSnapshot::capture("empty", &SchemaRegistry::new(), &MemoryGraph::new());
        let encoded = encode_snapshot(&snapshot, 0, 3).unwrap();
        assert!(!encoded.data.is_empty());
        assert_eq!(decode_snapshot(&encoded.data, encoded.metadata.checksum).unwrap(), snapshot);
    }
}
