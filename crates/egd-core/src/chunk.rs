//! `PoolChunk`: a fixed-capacity, append-only buffer of entropy bytes.

use chrono::{DateTime, Utc};

/// One fixed-capacity segment of the entropy pool.
///
/// Once `len(bytes) == capacity` the chunk is full and accepts no further
/// writes. `id` is assigned by the owning pool and never reused within a
/// pool's lifetime.
#[derive(Debug, Clone)]
pub struct PoolChunk {
    id: i64,
    bytes: Vec<u8>,
    capacity: usize,
    created_at: DateTime<Utc>,
}

impl PoolChunk {
    pub fn new(id: i64, capacity: usize) -> Self {
        Self {
            id,
            bytes: Vec::with_capacity(capacity),
            capacity,
            created_at: Utc::now(),
        }
    }

    /// Reconstruct a chunk from a persisted image. `created_at` is not part
    /// of the on-disk per-chunk record (only the pool-level header carries
    /// one), so loaded chunks are stamped with the load time.
    pub fn from_persisted(id: i64, bytes: Vec<u8>, capacity: usize) -> Self {
        Self {
            id,
            bytes,
            capacity,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.bytes.len() == self.capacity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Appends as many bytes from `data` as fit before `capacity` is
    /// reached. Returns the number of bytes actually appended.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let room = self.capacity - self.bytes.len();
        let n = room.min(data.len());
        self.bytes.extend_from_slice(&data[..n]);
        n
    }

    /// Defensive copy of the chunk's current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// Appends this chunk's on-disk record (`id i64 LE | size u32 LE | bytes`)
    /// to `out`.
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&(self.bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_fills_then_rejects() {
        let mut chunk = PoolChunk::new(0, 4);
        assert_eq!(chunk.append(&[1, 2]), 2);
        assert_eq!(chunk.len(), 2);
        assert!(!chunk.is_full());
        assert_eq!(chunk.append(&[3, 4, 5]), 2, "only room for 2 more bytes");
        assert!(chunk.is_full());
        assert_eq!(chunk.append(&[9]), 0, "full chunk accepts nothing");
        assert_eq!(chunk.snapshot(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn serialize_layout() {
        let mut chunk = PoolChunk::new(7, 3);
        chunk.append(&[0xAA, 0xBB]);
        let mut out = Vec::new();
        chunk.serialize_into(&mut out);
        assert_eq!(&out[0..8], &7i64.to_le_bytes());
        assert_eq!(&out[8..12], &2u32.to_le_bytes());
        assert_eq!(&out[12..], &[0xAA, 0xBB]);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut chunk = PoolChunk::new(0, 4);
        chunk.append(&[1, 2]);
        let snap = chunk.snapshot();
        chunk.append(&[3]);
        assert_eq!(snap, vec![1, 2], "earlier snapshot must not observe later writes");
    }
}
