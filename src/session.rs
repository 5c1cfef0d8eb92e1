use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

use crate::util::encode_hex_lower;

pub const UPLOAD_SESSION_VERSION: u32 = 1;

fn current_session_version() -> u32 {
    UPLOAD_SESSION_VERSION
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }

    pub fn compute_hex(self, data: &[u8]) -> String {
        match self {
            Self::Md5 => format!("{:x}", md5::compute(data)),
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(data);
                encode_hex_lower(&hasher.finalize())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    Uploading,
    Acked,
    Failed,
}

impl ChunkState {
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Uploading)
                | (Self::Uploading, Self::Acked)
                | (Self::Uploading, Self::Failed)
                | (Self::Failed, Self::Uploading)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("chunk {index} cannot move from {from:?} to {to:?}")]
pub struct InvalidChunkTransition {
    pub index: usize,
    pub from: ChunkState,
    pub to: ChunkState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub index: usize,
    /// Inclusive start offset.
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
    pub state: ChunkState,
    #[serde(default)]
    pub attempts: usize,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl ChunkDescriptor {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn content_range(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end.saturating_sub(1), total_size)
    }

    fn transition(&mut self, next: ChunkState) -> Result<(), InvalidChunkTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidChunkTransition {
                index: self.index,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Paused,
    Completed,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    #[serde(default = "current_session_version")]
    pub version: u32,
    pub upload_id: String,
    pub total_size: u64,
    pub chunk_size: usize,
    pub chunks: Vec<ChunkDescriptor>,
    pub state: SessionState,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub checksum_algorithm: Option<ChecksumAlgorithm>,
}

impl UploadSession {
    /// Splits `total_size` bytes into `chunk_size` slices; the last one may be
    /// shorter.
    pub fn new(upload_id: impl Into<String>, total_size: u64, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            version: UPLOAD_SESSION_VERSION,
            upload_id: upload_id.into(),
            total_size,
            chunk_size,
            chunks: partition(total_size, chunk_size),
            state: SessionState::Active,
            metadata: BTreeMap::new(),
            checksum_algorithm: None,
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk(&self, index: usize) -> Option<&ChunkDescriptor> {
        self.chunks.get(index)
    }

    pub fn acked_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|chunk| chunk.state == ChunkState::Acked)
            .count()
    }

    pub fn acked_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|chunk| chunk.state == ChunkState::Acked)
            .map(ChunkDescriptor::len)
            .sum()
    }

    pub fn is_fully_acked(&self) -> bool {
        self.chunks
            .iter()
            .all(|chunk| chunk.state == ChunkState::Acked)
    }

    /// Indices of chunks that still need to be sent, in order.
    pub fn outstanding_chunks(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|chunk| chunk.state != ChunkState::Acked)
            .map(|chunk| chunk.index)
            .collect()
    }

    pub fn layout_matches(&self, chunk_size: usize) -> bool {
        self.chunk_size == chunk_size && self.chunks == self.relaid_chunks()
    }

    pub(crate) fn begin_chunk(&mut self, index: usize) -> Result<(), InvalidChunkTransition> {
        let chunk = self.chunk_mut(index, ChunkState::Uploading)?;
        chunk.transition(ChunkState::Uploading)?;
        chunk.attempts = chunk.attempts.saturating_add(1);
        Ok(())
    }

    /// Records a server acknowledgement. Returns `false` when the chunk was
    /// already acked.
    pub fn mark_acked(&mut self, index: usize) -> Result<bool, InvalidChunkTransition> {
        let chunk = self.chunk_mut(index, ChunkState::Acked)?;
        if chunk.state == ChunkState::Acked {
            return Ok(false);
        }
        chunk.transition(ChunkState::Acked)?;
        Ok(true)
    }

    pub(crate) fn mark_failed(&mut self, index: usize) -> Result<(), InvalidChunkTransition> {
        self.chunk_mut(index, ChunkState::Failed)?
            .transition(ChunkState::Failed)
    }

    /// Chunks persisted mid-flight never got an ack; they go back to the
    /// queue.
    pub(crate) fn reset_in_flight(&mut self) {
        for chunk in &mut self.chunks {
            if chunk.state == ChunkState::Uploading {
                chunk.state = ChunkState::Pending;
            }
        }
    }

    /// Drops the ack of a chunk whose bytes no longer match the payload.
    pub(crate) fn invalidate_chunk(&mut self, index: usize, checksum: Option<String>) {
        if let Some(chunk) = self.chunks.get_mut(index) {
            chunk.state = ChunkState::Pending;
            chunk.checksum = checksum;
        }
    }

    pub(crate) fn attach_checksums(&mut self, payload: &[u8], algorithm: ChecksumAlgorithm) {
        self.checksum_algorithm = Some(algorithm);
        for chunk in &mut self.chunks {
            chunk.checksum = Some(algorithm.compute_hex(slice_of(payload, chunk)));
        }
    }

    fn chunk_mut(
        &mut self,
        index: usize,
        to: ChunkState,
    ) -> Result<&mut ChunkDescriptor, InvalidChunkTransition> {
        self.chunks
            .get_mut(index)
            .ok_or(InvalidChunkTransition {
                index,
                from: ChunkState::Pending,
                to,
            })
    }

    fn relaid_chunks(&self) -> Vec<ChunkDescriptor> {
        partition(self.total_size, self.chunk_size)
            .into_iter()
            .zip(&self.chunks)
            .map(|(fresh, existing)| ChunkDescriptor {
                state: existing.state,
                attempts: existing.attempts,
                checksum: existing.checksum.clone(),
                ..fresh
            })
            .collect()
    }
}

pub(crate) fn slice_of<'a>(payload: &'a [u8], chunk: &ChunkDescriptor) -> &'a [u8] {
    &payload[chunk.start as usize..chunk.end as usize]
}

fn partition(total_size: u64, chunk_size: usize) -> Vec<ChunkDescriptor> {
    let chunk_size = chunk_size.max(1) as u64;
    let mut chunks = Vec::with_capacity(total_size.div_ceil(chunk_size) as usize);
    let mut start = 0_u64;
    while start < total_size {
        let end = start.saturating_add(chunk_size).min(total_size);
        chunks.push(ChunkDescriptor {
            index: chunks.len(),
            start,
            end,
            state: ChunkState::Pending,
            attempts: 0,
            checksum: None,
        });
        start = end;
    }
    chunks
}
