//! Content blob storage
//!
//! Current blobs live per tree keyed by content id. Historical copies are
//! keyed by (content id, publish tag) and stored compressed with a checksum
//! so archived bytes can be verified when read back.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::object::{ContentId, TreeKind};
use crate::storage::{RepoError, Result};

/// zstd level used for historical copies
const HISTORY_COMPRESSION_LEVEL: i32 = 3;

/// Blob store interface implemented by every backend
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write_blob(&self, tree: TreeKind, id: ContentId, data: Bytes) -> Result<()>;

    async fn read_blob(&self, tree: TreeKind, id: ContentId) -> Result<Option<Bytes>>;

    async fn remove_blob(&self, tree: TreeKind, id: ContentId) -> Result<()>;

    /// Store an already encoded historical frame
    async fn write_historical_blob(&self, id: ContentId, publish_tag: u64, frame: Vec<u8>) -> Result<()>;

    async fn read_historical_blob(&self, id: ContentId, publish_tag: u64) -> Result<Option<Vec<u8>>>;

    async fn remove_historical_blob(&self, id: ContentId, publish_tag: u64) -> Result<()>;
}

/// On-disk frame of a historical blob
#[derive(Debug, Serialize, Deserialize)]
struct HistoricalFrame {
    /// Hex SHA-256 of the uncompressed bytes
    checksum: String,
    compressed: Vec<u8>,
}

/// Hex SHA-256 of a byte slice
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compress and frame bytes for the historical copy path
pub fn encode_historical(data: &[u8]) -> Result<Vec<u8>> {
    let compressed = zstd::encode_all(data, HISTORY_COMPRESSION_LEVEL)
        .map_err(|e| RepoError::Serialization(format!("Compression failed: {}", e)))?;
    let frame = HistoricalFrame {
        checksum: checksum(data),
        compressed,
    };
    Ok(bincode::serialize(&frame)?)
}

/// Decode a historical frame and verify its checksum
pub fn decode_historical(frame: &[u8]) -> Result<Bytes> {
    let frame: HistoricalFrame = bincode::deserialize(frame)?;
    let data = zstd::decode_all(frame.compressed.as_slice())
        .map_err(|e| RepoError::Serialization(format!("Decompression failed: {}", e)))?;
    let actual = checksum(&data);
    if actual != frame.checksum {
        return Err(RepoError::Consistency(format!(
            "Historical blob checksum mismatch: expected {}, got {}",
            frame.checksum, actual
        )));
    }
    Ok(Bytes::from(data))
}

/// Content store facade used by the resource store
#[derive(Clone)]
pub struct ContentStore {
    blobs: Arc<dyn BlobStore>,
}

impl ContentStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub async fn write(&self, tree: TreeKind, id: ContentId, data: Bytes) -> Result<()> {
        self.blobs.write_blob(tree, id, data).await
    }

    pub async fn read(&self, tree: TreeKind, id: ContentId) -> Result<Option<Bytes>> {
        self.blobs.read_blob(tree, id).await
    }

    pub async fn remove(&self, tree: TreeKind, id: ContentId) -> Result<()> {
        self.blobs.remove_blob(tree, id).await
    }

    /// Copy the draft blob of a content id over the live one
    ///
    /// Returns the copied bytes so the caller can archive them. Folders have
    /// no blob; `None` is returned and nothing is written.
    pub async fn publish(&self, id: ContentId) -> Result<Option<Bytes>> {
        match self.blobs.read_blob(TreeKind::Draft, id).await? {
            Some(data) => {
                self.blobs.write_blob(TreeKind::Live, id, data.clone()).await?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Write the historical copy of `data` for a publish tag
    pub async fn archive(&self, id: ContentId, publish_tag: u64, data: &[u8]) -> Result<()> {
        let frame = encode_historical(data)?;
        self.blobs.write_historical_blob(id, publish_tag, frame).await
    }

    pub async fn read_archived(&self, id: ContentId, publish_tag: u64) -> Result<Option<Bytes>> {
        match self.blobs.read_historical_blob(id, publish_tag).await? {
            Some(frame) => decode_historical(&frame).map(Some),
            None => Ok(None),
        }
    }

    pub async fn remove_archived(&self, id: ContentId, publish_tag: u64) -> Result<()> {
        self.blobs.remove_historical_blob(id, publish_tag).await
    }
}
