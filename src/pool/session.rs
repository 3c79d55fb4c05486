//! Per-connection worker state.

use super::chunk::Chunk;
use super::codec::FrameBuffer;
use super::protocol::ProtocolError;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Identifier of a session, unique for the lifetime of a coordinator.
pub type SessionId = u64;

/// Lifecycle stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, holding no chunk.
    Idle,
    /// Holding a chunk.
    Working,
    /// Terminal.
    Closed,
}

/// The coordinator's view of one connected worker.
#[derive(Debug)]
pub struct WorkerSession {
    pub id: SessionId,
    pub peer: SocketAddr,
    /// Name the worker introduced itself with, if any.
    pub hostname: Option<String>,
    chunk: Option<Chunk>,
    checkpoint_index: u64,
    started_at: Instant,
    last_heard: Instant,
    alive: bool,
    inbound: FrameBuffer,
    chunks_completed: u64,
}

impl WorkerSession {
    pub fn new(id: SessionId, peer: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            peer,
            hostname: None,
            chunk: None,
            checkpoint_index: 0,
            started_at: now,
            last_heard: now,
            alive: true,
            inbound: FrameBuffer::default(),
            chunks_completed: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        if !self.alive {
            SessionState::Closed
        } else if self.chunk.is_some() {
            SessionState::Working
        } else {
            SessionState::Idle
        }
    }

    pub fn chunk(&self) -> Option<Chunk> {
        self.chunk
    }

    pub fn checkpoint_index(&self) -> u64 {
        self.checkpoint_index
    }

    pub fn chunks_completed(&self) -> u64 {
        self.chunks_completed
    }

    pub fn inbound(&mut self) -> &mut FrameBuffer {
        &mut self.inbound
    }

    /// Hand the session a chunk. Progress restarts at the chunk's first index.
    pub fn assign(&mut self, chunk: Chunk) {
        debug_assert!(self.chunk.is_none(), "session already holds a chunk");
        self.chunk = Some(chunk);
        self.checkpoint_index = chunk.start;
    }

    /// Give up the current chunk, e.g. for retirement or reclaim.
    pub fn take_chunk(&mut self) -> Option<Chunk> {
        self.chunk.take()
    }

    /// Like [`take_chunk`](Self::take_chunk), counting the chunk as searched.
    pub fn complete_chunk(&mut self) -> Option<Chunk> {
        let chunk = self.chunk.take();
        if chunk.is_some() {
            self.chunks_completed += 1;
        }
        chunk
    }

    /// Apply a progress report.
    ///
    /// The index must fall inside the assigned chunk and must not move
    /// backwards.
    pub fn checkpoint(&mut self, index: u64) -> Result<(), ProtocolError> {
        let chunk = self.chunk.ok_or(ProtocolError::NoChunk {
            message: "checkpoint",
        })?;
        if !chunk.contains(index) {
            return Err(ProtocolError::CheckpointOutOfRange { index, chunk });
        }
        if index < self.checkpoint_index {
            return Err(ProtocolError::CheckpointRegressed {
                index,
                current: self.checkpoint_index,
            });
        }
        self.checkpoint_index = index;
        Ok(())
    }

    /// Record that bytes arrived, complete frame or not.
    pub fn heard(&mut self, now: Instant) {
        self.last_heard = self.last_heard.max(now);
    }

    /// Instant after which the session counts as silent.
    pub fn deadline(&self, timeout: Duration) -> Instant {
        self.last_heard + timeout
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heard) > timeout
    }

    /// Time since the connection was accepted.
    pub fn connected_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    /// Mark the session terminal, returning any chunk it still held.
    pub fn close(&mut self) -> Option<Chunk> {
        self.alive = false;
        self.chunk.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(now: Instant) -> WorkerSession {
        WorkerSession::new(1, "127.0.0.1:9000".parse().unwrap(), now)
    }

    #[test]
    fn test_lifecycle_states() {
        let now = Instant::now();
        let mut s = session(now);
        assert_eq!(s.state(), SessionState::Idle);

        s.assign(Chunk::new(0, 10));
        assert_eq!(s.state(), SessionState::Working);
        assert_eq!(s.checkpoint_index(), 0);

        assert_eq!(s.complete_chunk(), Some(Chunk::new(0, 10)));
        assert_eq!(s.state(), SessionState::Idle);
        assert_eq!(s.chunks_completed(), 1);

        s.assign(Chunk::new(10, 10));
        assert_eq!(s.close(), Some(Chunk::new(10, 10)));
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_checkpoint_rules() {
        let mut s = session(Instant::now());
        assert_eq!(
            s.checkpoint(3),
            Err(ProtocolError::NoChunk {
                message: "checkpoint"
            })
        );

        s.assign(Chunk::new(50, 50));
        assert!(s.checkpoint(50).is_ok());
        assert!(s.checkpoint(75).is_ok());
        assert!(s.checkpoint(75).is_ok());
        assert_eq!(s.checkpoint_index(), 75);

        assert!(matches!(
            s.checkpoint(60),
            Err(ProtocolError::CheckpointRegressed {
                index: 60,
                current: 75
            })
        ));
        assert!(matches!(
            s.checkpoint(100),
            Err(ProtocolError::CheckpointOutOfRange { .. })
        ));
        assert!(matches!(
            s.checkpoint(49),
            Err(ProtocolError::CheckpointOutOfRange { .. })
        ));
        assert!(s.checkpoint_index() <= 100);
    }

    #[test]
    fn test_reassignment_resets_progress_to_chunk_start() {
        let mut s = session(Instant::now());
        s.assign(Chunk::new(0, 50));
        s.checkpoint(40).unwrap();
        s.take_chunk();
        s.assign(Chunk::new(50, 50));
        assert_eq!(s.checkpoint_index(), 50);
    }

    #[test]
    fn test_liveness_tracking() {
        let start = Instant::now();
        let timeout = Duration::from_secs(5);
        let mut s = session(start);

        assert!(!s.is_timed_out(start + Duration::from_secs(5), timeout));
        assert!(s.is_timed_out(start + Duration::from_secs(6), timeout));

        s.heard(start + Duration::from_secs(4));
        assert!(!s.is_timed_out(start + Duration::from_secs(6), timeout));
        assert_eq!(s.deadline(timeout), start + Duration::from_secs(9));

        // Out-of-order timestamps never move liveness backwards.
        s.heard(start);
        assert_eq!(s.deadline(timeout), start + Duration::from_secs(9));
        assert_eq!(
            s.connected_for(start + Duration::from_secs(6)),
            Duration::from_secs(6)
        );
    }
}
