//! Chunk and Broadcast value types

use crate::content::Attachment;
use crate::ids::EventId;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

/// One audio segment of a broadcast
///
/// Two chunks are the same chunk when they share `(broadcast_id, sequence)`,
/// whatever their attachment. A chunk delivered both by the bulk fetch and by
/// the live feed therefore collapses into one entry of a set.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub broadcast_id: EventId,
    pub sequence: u32,
    pub attachment: Attachment,
    pub duration_ms: u64,
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.broadcast_id == other.broadcast_id && self.sequence == other.sequence
    }
}

impl Eq for Chunk {}

impl Hash for Chunk {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.broadcast_id.hash(state);
        self.sequence.hash(state);
    }
}

/// Whether the local session records the broadcast or plays it back
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BroadcastKind {
    Player,
    Recorder,
}

/// Immutable snapshot of a broadcast
///
/// A new snapshot replaces the previous one on every rebuild; `duration_ms`
/// is always the sum of the chunk durations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Broadcast {
    chunks: HashSet<Chunk>,
    duration_ms: u64,
    kind: BroadcastKind,
}

impl Broadcast {
    pub fn new(chunks: HashSet<Chunk>, kind: BroadcastKind) -> Self {
        let duration_ms = chunks.iter().map(|c| c.duration_ms).sum();
        Self {
            chunks,
            duration_ms,
            kind,
        }
    }

    pub fn empty(kind: BroadcastKind) -> Self {
        Self::new(HashSet::new(), kind)
    }

    pub fn chunks(&self) -> &HashSet<Chunk> {
        &self.chunks
    }

    /// Chunks in sequence order
    pub fn sorted_chunks(&self) -> Vec<&Chunk> {
        let mut chunks: Vec<&Chunk> = self.chunks.iter().collect();
        chunks.sort_by_key(|c| c.sequence);
        chunks
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn kind(&self) -> BroadcastKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn contains_sequence(&self, sequence: u32) -> bool {
        self.chunks.iter().any(|c| c.sequence == sequence)
    }
}
