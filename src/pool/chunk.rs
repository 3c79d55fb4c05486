//! Keyspace partitioning and chunk bookkeeping.
//!
//! The keyspace `[0, work_size)` is cut into fixed-size chunks on demand. Fresh
//! chunks are produced lazily from a cursor so that very large keyspaces never
//! materialize their full partition; reclaimed chunks wait in an ordered queue
//! and always sort below the cursor, which keeps allocation in strict ascending
//! offset order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A contiguous, half-open range `[start, start + length)` of the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Chunk {
    pub start: u64,
    pub length: u64,
}

impl Chunk {
    pub fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Whether `index` lies inside the chunk.
    pub fn contains(&self, index: u64) -> bool {
        index >= self.start && index < self.end()
    }
}

impl std::fmt::Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end())
    }
}

/// Hands out disjoint chunks of the keyspace and tracks their state.
///
/// Every chunk is in exactly one of three states: pending (the reclaim queue or
/// the not-yet-cut tail), assigned (in flight to one session), or retired.
#[derive(Debug)]
pub struct ChunkAllocator {
    work_size: u64,
    chunk_size: u64,
    /// Start of the first chunk that has never been handed out.
    cursor: u64,
    /// Chunks handed back by dead sessions, keyed by start offset.
    reclaimed: BTreeMap<u64, Chunk>,
    /// Chunks currently owned by a session, keyed by start offset.
    in_flight: BTreeMap<u64, Chunk>,
    retired: u64,
}

impl ChunkAllocator {
    /// Create an allocator for `[0, work_size)` with the given chunk length.
    ///
    /// `chunk_size` must be non-zero; jobs are validated before reaching here.
    pub fn new(work_size: u64, chunk_size: u64) -> Self {
        debug_assert!(chunk_size > 0, "chunk size must be non-zero");
        Self {
            work_size,
            chunk_size: chunk_size.max(1),
            cursor: 0,
            reclaimed: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            retired: 0,
        }
    }

    /// Remove and return the lowest-offset pending chunk.
    ///
    /// Returns `None` when nothing is pending. Assigned chunks may still come
    /// back through [`reclaim`](Self::reclaim), so `None` does not mean the
    /// run is over; see [`is_exhausted`](Self::is_exhausted).
    pub fn next_chunk(&mut self) -> Option<Chunk> {
        let chunk = match self.reclaimed.pop_first() {
            Some((_, chunk)) => chunk,
            None => {
                if self.cursor >= self.work_size {
                    return None;
                }
                let length = self.chunk_size.min(self.work_size - self.cursor);
                let chunk = Chunk::new(self.cursor, length);
                self.cursor += length;
                chunk
            }
        };
        self.in_flight.insert(chunk.start, chunk);
        Some(chunk)
    }

    /// Return an in-flight chunk to the pending queue.
    ///
    /// Reclaiming a chunk that is already pending is a no-op. Returns whether
    /// the chunk changed state.
    pub fn reclaim(&mut self, chunk: Chunk) -> bool {
        match self.in_flight.remove(&chunk.start) {
            Some(owned) => {
                self.reclaimed.insert(owned.start, owned);
                true
            }
            None => {
                if !self.reclaimed.contains_key(&chunk.start) && chunk.start < self.cursor {
                    tracing::debug!(%chunk, "Ignoring reclaim of a chunk that is not in flight");
                }
                false
            }
        }
    }

    /// Mark an in-flight chunk as fully searched.
    ///
    /// Returns whether the chunk was in flight.
    pub fn retire(&mut self, chunk: Chunk) -> bool {
        if self.in_flight.remove(&chunk.start).is_some() {
            self.retired += 1;
            true
        } else {
            tracing::debug!(%chunk, "Ignoring retire of a chunk that is not in flight");
            false
        }
    }

    /// Total number of chunks in the partition.
    pub fn total_chunks(&self) -> u64 {
        self.work_size.div_ceil(self.chunk_size)
    }

    /// Number of chunks waiting to be assigned.
    pub fn pending_len(&self) -> u64 {
        let fresh = (self.work_size - self.cursor.min(self.work_size)).div_ceil(self.chunk_size);
        self.reclaimed.len() as u64 + fresh
    }

    /// Number of chunks currently assigned to sessions.
    #[cfg(test)]
    pub fn in_flight_len(&self) -> u64 {
        self.in_flight.len() as u64
    }

    /// Number of chunks searched without a match.
    pub fn retired_len(&self) -> u64 {
        self.retired
    }

    /// True once every chunk of the partition has been retired.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.work_size && self.reclaimed.is_empty() && self.in_flight.is_empty()
    }

    /// Whether `chunk` is currently handed out.
    #[cfg(test)]
    pub fn is_in_flight(&self, chunk: &Chunk) -> bool {
        self.in_flight.get(&chunk.start) == Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(alloc: &mut ChunkAllocator) -> Vec<Chunk> {
        std::iter::from_fn(|| alloc.next_chunk()).collect()
    }

    #[test]
    fn test_partition_is_exact_for_many_sizes() {
        for work_size in [0u64, 1, 2, 7, 25, 99, 100, 101, 1000] {
            for chunk_size in [1u64, 2, 3, 10, 25, 33, 100, 5000] {
                let mut alloc = ChunkAllocator::new(work_size, chunk_size);
                let chunks = drain(&mut alloc);

                let mut expected_start = 0;
                for chunk in &chunks {
                    assert_eq!(chunk.start, expected_start, "gap or overlap");
                    assert!(chunk.length > 0 && chunk.length <= chunk_size);
                    expected_start = chunk.end();
                }
                assert_eq!(expected_start, work_size);
                assert_eq!(chunks.len() as u64, alloc.total_chunks());
            }
        }
    }

    #[test]
    fn test_final_chunk_is_truncated() {
        let mut alloc = ChunkAllocator::new(10, 4);
        let chunks = drain(&mut alloc);
        assert_eq!(
            chunks,
            vec![Chunk::new(0, 4), Chunk::new(4, 4), Chunk::new(8, 2)]
        );
    }

    #[test]
    fn test_reclaimed_chunk_comes_back_first_and_whole() {
        let mut alloc = ChunkAllocator::new(100, 25);
        let first = alloc.next_chunk().unwrap();
        let second = alloc.next_chunk().unwrap();
        assert_eq!(second, Chunk::new(25, 25));

        assert!(alloc.reclaim(first));
        assert_eq!(alloc.next_chunk(), Some(Chunk::new(0, 25)));
        assert_eq!(alloc.next_chunk(), Some(Chunk::new(50, 25)));
    }

    #[test]
    fn test_reclaim_orders_by_offset() {
        let mut alloc = ChunkAllocator::new(100, 25);
        let chunks = drain(&mut alloc);
        assert!(alloc.reclaim(chunks[2]));
        assert!(alloc.reclaim(chunks[0]));
        assert_eq!(alloc.next_chunk(), Some(chunks[0]));
        assert_eq!(alloc.next_chunk(), Some(chunks[2]));
        assert_eq!(alloc.next_chunk(), None);
    }

    #[test]
    fn test_reclaim_is_idempotent() {
        let mut alloc = ChunkAllocator::new(50, 25);
        let chunk = alloc.next_chunk().unwrap();
        assert!(alloc.reclaim(chunk));
        assert!(!alloc.reclaim(chunk));
        assert_eq!(alloc.pending_len(), 2);
        assert_eq!(alloc.next_chunk(), Some(chunk));
        assert_eq!(alloc.next_chunk(), Some(Chunk::new(25, 25)));
        assert_eq!(alloc.next_chunk(), None);
    }

    #[test]
    fn test_retire_and_exhaustion() {
        let mut alloc = ChunkAllocator::new(100, 25);
        assert!(!alloc.is_exhausted());
        let chunks = drain(&mut alloc);
        assert_eq!(alloc.in_flight_len(), 4);
        assert!(!alloc.is_exhausted());

        for chunk in &chunks {
            assert!(alloc.retire(*chunk));
        }
        assert!(!alloc.retire(chunks[0]));
        assert_eq!(alloc.retired_len(), 4);
        assert!(alloc.is_exhausted());
    }

    #[test]
    fn test_state_counts_cover_partition() {
        let mut alloc = ChunkAllocator::new(100, 10);
        let a = alloc.next_chunk().unwrap();
        let b = alloc.next_chunk().unwrap();
        let _c = alloc.next_chunk().unwrap();
        alloc.retire(a);
        alloc.reclaim(b);

        let total = alloc.pending_len() + alloc.in_flight_len() + alloc.retired_len();
        assert_eq!(total, alloc.total_chunks());
        assert!(!alloc.is_in_flight(&b));
    }

    #[test]
    fn test_empty_keyspace_is_exhausted() {
        let mut alloc = ChunkAllocator::new(0, 10);
        assert!(alloc.is_exhausted());
        assert_eq!(alloc.next_chunk(), None);
    }

    #[test]
    fn test_chunk_contains() {
        let chunk = Chunk::new(50, 50);
        assert!(chunk.contains(50));
        assert!(chunk.contains(99));
        assert!(!chunk.contains(100));
        assert!(!chunk.contains(49));
        assert_eq!(chunk.to_string(), "[50, 100)");
    }
}
