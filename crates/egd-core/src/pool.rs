//! The bounded, persistent entropy pool: a sequence of fixed-capacity
//! [`PoolChunk`]s, filled in order, never exceeding a configured total.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::chunk::PoolChunk;
use crate::error::{EgdError, ErrorCategory};
use crate::format::{self, PoolImage};

/// A point-in-time view of pool occupancy, returned by `status`/`sources`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub total_bytes: i64,
    pub max_entropy: i64,
    pub chunk_count: usize,
    pub chunk_capacity: i32,
}

/// The daemon's bounded entropy store.
///
/// Not internally synchronized — callers share it behind an
/// `Arc<tokio::sync::RwLock<EntropyPool>>` so readers (stats, persistence
/// snapshots) and the single writer (deposit) compose with the rest of the
/// async runtime instead of blocking inside the type itself.
pub struct EntropyPool {
    max_entropy: i64,
    chunk_capacity: i32,
    chunks: Vec<PoolChunk>,
    next_chunk_id: i64,
    created_at: DateTime<Utc>,
}

impl EntropyPool {
    pub fn new(max_entropy: i64, chunk_capacity: i32) -> Self {
        Self {
            max_entropy,
            chunk_capacity,
            chunks: Vec::new(),
            next_chunk_id: 0,
            created_at: Utc::now(),
        }
    }

    pub fn total_bytes(&self) -> i64 {
        self.chunks.iter().map(|c| c.len() as i64).sum()
    }

    pub fn max_entropy(&self) -> i64 {
        self.max_entropy
    }

    pub fn chunk_capacity(&self) -> i32 {
        self.chunk_capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_bytes: self.total_bytes(),
            max_entropy: self.max_entropy,
            chunk_count: self.chunks.len(),
            chunk_capacity: self.chunk_capacity,
        }
    }

    /// Deposits as much of `data` as fits under `max_entropy`, filling the
    /// current tail chunk before opening new ones. Returns the number of
    /// bytes actually stored; a short write is not an error — the caller
    /// decides whether to log it.
    pub fn deposit(&mut self, data: &[u8]) -> usize {
        let mut remaining_room = (self.max_entropy - self.total_bytes()).max(0) as usize;
        if remaining_room == 0 || data.is_empty() {
            return 0;
        }

        let mut written = 0usize;
        while written < data.len() && remaining_room > 0 {
            if self.chunks.last().map(|c| c.is_full()).unwrap_or(true) {
                self.chunks.push(PoolChunk::new(self.next_chunk_id, self.chunk_capacity as usize));
                self.next_chunk_id += 1;
            }
            let tail = self.chunks.last_mut().expect("chunk just pushed if needed");

            let slice_end = (written + remaining_room).min(data.len());
            let n = tail.append(&data[written..slice_end]);
            written += n;
            remaining_room -= n;

            if n == 0 {
                // Tail reported full but wasn't replaced above; avoid looping forever.
                break;
            }
        }
        written
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Builds a persistable snapshot of the current pool state.
    pub fn to_image(&self) -> PoolImage {
        PoolImage {
            max_entropy: self.max_entropy,
            chunk_capacity: self.chunk_capacity,
            created_at_ns: self.created_at.timestamp_nanos_opt().unwrap_or(0),
            chunks: self.chunks.iter().map(|c| (c.id(), c.snapshot())).collect(),
        }
    }

    /// Rebuilds a pool from a decoded image. `max_entropy`/`chunk_capacity`
    /// passed explicitly take precedence over the persisted ones so a
    /// config change (e.g. raising the cap) is honored for a reloaded pool.
    pub fn from_image(image: PoolImage, max_entropy: i64, chunk_capacity: i32) -> Self {
        let next_chunk_id = image.chunks.iter().map(|(id, _)| *id).max().map(|m| m + 1).unwrap_or(0);
        let secs = image.created_at_ns.div_euclid(1_000_000_000);
        let nsecs = image.created_at_ns.rem_euclid(1_000_000_000) as u32;
        let created_at = DateTime::<Utc>::from_timestamp(secs, nsecs).unwrap_or_else(Utc::now);
        let chunks = image
            .chunks
            .into_iter()
            .map(|(id, bytes)| PoolChunk::from_persisted(id, bytes, chunk_capacity as usize))
            .collect();
        Self {
            max_entropy,
            chunk_capacity,
            chunks,
            next_chunk_id,
            created_at,
        }
    }

    /// Persists this pool's image atomically: write to a sibling temp file
    /// with owner-only permissions, fsync, then rename over `path`.
    ///
    /// Encodes under `&self` (call this while still holding the read guard)
    /// but callers that need the I/O to run *without* the pool lock held
    /// should instead snapshot via `to_image`/`format::encode`, drop the
    /// guard, and call [`persist_image`] directly.
    pub async fn persist(&self, path: &Path) -> Result<(), EgdError> {
        let bytes = format::encode(&self.to_image());
        atomic_write(path, &bytes).await
    }

    /// Loads a pool image from `path`, returning `Ok(None)` if the file does
    /// not exist (a fresh pool should be created in that case).
    pub async fn load(path: &Path, max_entropy: i64, chunk_capacity: i32) -> Result<Option<Self>, EgdError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let image = format::decode(&bytes)?;
                Ok(Some(Self::from_image(image, max_entropy, chunk_capacity)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EgdError::new(
                ErrorCategory::Fatal,
                "pool",
                "PERSIST_READ_FAILED",
                format!("reading {}: {e}", path.display()),
            )
            .with_cause(e)),
        }
    }
}

/// Writes an already-encoded pool image atomically, independent of any
/// `EntropyPool` borrow — lets a caller snapshot and encode under the read
/// lock, drop it, then run the I/O unguarded.
pub async fn persist_image(path: &Path, image_bytes: &[u8]) -> Result<(), EgdError> {
    atomic_write(path, image_bytes).await
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), EgdError> {
    use std::os::unix::fs::OpenOptionsExt;
    use tokio::io::AsyncWriteExt;

    let tmp_path = path.with_extension("tmp");
    let write_result: Result<(), EgdError> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)
            .await
            .map_err(|e| EgdError::new(ErrorCategory::Fatal, "pool", "PERSIST_WRITE_FAILED", e.to_string()).with_cause(e))?;

        file.write_all(bytes)
            .await
            .map_err(|e| EgdError::new(ErrorCategory::Fatal, "pool", "PERSIST_WRITE_FAILED", e.to_string()).with_cause(e))?;
        file.sync_all()
            .await
            .map_err(|e| EgdError::new(ErrorCategory::Fatal, "pool", "PERSIST_WRITE_FAILED", e.to_string()).with_cause(e))?;
        drop(file);

        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| EgdError::new(ErrorCategory::Fatal, "pool", "PERSIST_WRITE_FAILED", e.to_string()).with_cause(e))?;
        Ok(())
    }
    .await;

    if write_result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    write_result
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S3 — three sequential deposit(50) calls against max=100/capacity=40
    /// yield chunks [40, 40, 20], total 100, and the third call is a no-op.
    #[test]
    fn deposit_respects_total_cap_across_chunks() {
        let mut pool = EntropyPool::new(100, 40);
        assert_eq!(pool.deposit(&[1u8; 50]), 50);
        assert_eq!(pool.deposit(&[2u8; 50]), 50);
        assert_eq!(pool.deposit(&[3u8; 50]), 0);
        assert_eq!(pool.total_bytes(), 100);
        assert_eq!(pool.chunk_count(), 3);
    }

    #[test]
    fn deposit_into_empty_pool_opens_first_chunk() {
        let mut pool = EntropyPool::new(10, 4);
        assert_eq!(pool.deposit(&[1, 2, 3]), 3);
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn deposit_is_noop_on_empty_input() {
        let mut pool = EntropyPool::new(10, 4);
        assert_eq!(pool.deposit(&[]), 0);
        assert_eq!(pool.chunk_count(), 0);
    }

    #[test]
    fn image_round_trip_preserves_bytes_and_ids() {
        let mut pool = EntropyPool::new(100, 10);
        pool.deposit(&[9u8; 25]);
        let image = pool.to_image();
        let restored = EntropyPool::from_image(image, 100, 10);
        assert_eq!(restored.total_bytes(), 25);
        assert_eq!(restored.chunk_count(), 3);
        // next id after loading 3 chunks (0,1,2) must continue from 3
        let mut restored = restored;
        restored.deposit(&[1u8; 1]);
    }
}
