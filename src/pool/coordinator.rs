//! Scheduling core of the pool.
//!
//! The [`Coordinator`] owns the session table, the chunk allocator and the run
//! state. It performs no I/O: the event loop feeds it accepted connections,
//! inbound bytes, disconnects and clock ticks, then drains the queued
//! [`Outbound`] actions and carries them out. Given the same sequence of
//! events it always makes the same decisions.

use super::chunk::{Chunk, ChunkAllocator};
use super::job::{Job, RunState};
use super::protocol::{
    CoordinatorMessage, MAX_HOSTNAME_LEN, ProtocolError, WorkerMessage, decode_value,
};
use super::session::{SessionId, SessionState, WorkerSession};
use crate::db::{ResultRecord, ResultSink};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Action the event loop must perform on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Write one message to the session's socket.
    Send {
        session: SessionId,
        message: CoordinatorMessage,
    },
    /// Shut down and forget the session's socket.
    Close { session: SessionId },
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A worker reported a match.
    Found,
    /// Every chunk was searched without a match.
    Exhausted,
    /// The operator interrupted the run.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Found => write!(f, "found"),
            StopReason::Exhausted => write!(f, "not found"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// End-of-run figures for the summary printout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub reason: Option<StopReason>,
    pub result: Option<Vec<u8>>,
    pub worker_time: Duration,
    pub elapsed: Duration,
    pub chunks_retired: u64,
    pub total_chunks: u64,
    pub sessions_served: u64,
}

/// The pool's scheduler.
pub struct Coordinator {
    job: Job,
    run: RunState,
    allocator: ChunkAllocator,
    sessions: BTreeMap<SessionId, WorkerSession>,
    sink: Box<dyn ResultSink>,
    outbox: Vec<Outbound>,
    cancelled: bool,
    stopped: Option<StopReason>,
    next_id: SessionId,
}

impl Coordinator {
    /// Create a coordinator for a validated job.
    pub fn new(job: Job, sink: Box<dyn ResultSink>, now: Instant) -> Self {
        let allocator = ChunkAllocator::new(job.work_size, job.chunk_size);
        Self {
            job,
            run: RunState::new(now),
            allocator,
            sessions: BTreeMap::new(),
            sink,
            outbox: Vec::new(),
            cancelled: false,
            stopped: None,
            next_id: 1,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    #[cfg(test)]
    pub fn run_state(&self) -> &RunState {
        &self.run
    }

    pub fn allocator(&self) -> &ChunkAllocator {
        &self.allocator
    }

    #[cfg(test)]
    pub fn session(&self, id: SessionId) -> Option<&WorkerSession> {
        self.sessions.get(&id)
    }

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// True while another connection may be accepted.
    pub fn has_capacity(&self) -> bool {
        !self.is_stopping() && self.sessions.len() < self.job.max_workers
    }

    fn is_stopping(&self) -> bool {
        self.stopped.is_some() || self.cancelled || self.run.found()
    }

    /// Register a new connection, greet it and try to give it work.
    pub fn accept(&mut self, peer: SocketAddr, now: Instant) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(id, WorkerSession::new(id, peer, now));
        info!(session = id, %peer, "Worker connected");

        self.outbox.push(Outbound::Send {
            session: id,
            message: CoordinatorMessage::welcome(
                &self.job.target,
                self.job.checkpoint_interval,
                self.job.timeout.as_secs(),
            ),
        });
        self.try_assign(id);
        id
    }

    /// Feed bytes read from a session's socket.
    ///
    /// Every complete frame is applied in order. A protocol violation closes
    /// the session and reclaims its chunk.
    pub fn receive(&mut self, id: SessionId, bytes: &[u8], now: Instant) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.heard(now);
        session.inbound().extend(bytes);

        while !self.is_stopping() {
            let Some(session) = self.sessions.get_mut(&id) else {
                return;
            };
            let message = match session.inbound().next_message::<WorkerMessage>() {
                Ok(Some(message)) => message,
                Ok(None) => return,
                Err(e) => {
                    self.drop_session(id, now, &e);
                    return;
                }
            };
            if let Err(e) = self.apply(id, message) {
                self.drop_session(id, now, &e);
                return;
            }
        }
    }

    fn apply(&mut self, id: SessionId, message: WorkerMessage) -> Result<(), ProtocolError> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(());
        };

        match message {
            WorkerMessage::Hello { hostname } => {
                if hostname.len() > MAX_HOSTNAME_LEN {
                    return Err(ProtocolError::HostnameTooLong {
                        len: hostname.len(),
                        limit: MAX_HOSTNAME_LEN,
                    });
                }
                debug!(session = id, %hostname, "Worker introduced itself");
                session.hostname = Some(hostname);
            }
            WorkerMessage::Heartbeat => {}
            WorkerMessage::Checkpoint { index } => {
                session.checkpoint(index)?;
                debug!(session = id, index, "Checkpoint");
            }
            WorkerMessage::Exhausted => {
                let chunk = session.complete_chunk().ok_or(ProtocolError::NoChunk {
                    message: "exhausted",
                })?;
                self.allocator.retire(chunk);
                debug!(
                    session = id,
                    start = chunk.start,
                    length = chunk.length,
                    retired = self.allocator.retired_len(),
                    total = self.allocator.total_chunks(),
                    "Chunk exhausted"
                );
                self.try_assign(id);
            }
            WorkerMessage::Found { value } => {
                let chunk = session
                    .chunk()
                    .ok_or(ProtocolError::NoChunk { message: "found" })?;
                let value = decode_value(&value)?;
                session.take_chunk();
                self.allocator.retire(chunk);
                self.record_found(id, chunk, value);
            }
        }
        Ok(())
    }

    fn record_found(&mut self, id: SessionId, chunk: Chunk, value: Vec<u8>) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let ip = session.peer.ip().to_string();
        let record = ResultRecord {
            client_id: id,
            hostname: session.hostname.clone().unwrap_or_else(|| ip.clone()),
            ip,
            label: self.job.label.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            value_hex: hex::encode(&value),
        };

        if !self.run.record_found(value) {
            return;
        }
        info!(session = id, %chunk, value = %record.value_hex, "Match found");
        if let Err(e) = self.sink.record_result(&record) {
            warn!(session = id, error = %e, "Failed to record result");
        }
    }

    /// The peer closed its connection.
    pub fn disconnect(&mut self, id: SessionId, now: Instant) {
        if self.close_session(id, now) {
            info!(session = id, "Worker disconnected");
            self.assign_idle();
        }
    }

    /// Writing to the session failed; treat it as gone.
    pub fn send_failed(&mut self, id: SessionId, now: Instant) {
        if self.close_session(id, now) {
            warn!(session = id, "Write to worker failed, closing session");
            self.assign_idle();
        }
    }

    /// Close every session that has been silent longer than the job timeout.
    pub fn sweep(&mut self, now: Instant) {
        let timeout = self.job.timeout;
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_timed_out(now, timeout))
            .map(|s| s.id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in expired {
            if self.close_session(id, now) {
                warn!(session = id, timeout_secs = timeout.as_secs(), "Worker timed out");
            }
        }
        self.assign_idle();
    }

    /// Request a graceful stop on the next [`poll_stop`](Self::poll_stop).
    pub fn cancel(&mut self) {
        if !self.cancelled {
            info!("Cancellation requested");
        }
        self.cancelled = true;
    }

    /// Check the stop conditions.
    ///
    /// The first time one holds, every live session is sent `stop` and closed.
    /// Chunks still in flight are retired when the run found its value, and
    /// go back to pending when it was cancelled, since nobody finished them.
    /// Later calls return the same reason without doing anything.
    pub fn poll_stop(&mut self, now: Instant) -> Option<StopReason> {
        if self.stopped.is_some() {
            return self.stopped;
        }
        let reason = if self.run.found() {
            StopReason::Found
        } else if self.cancelled {
            StopReason::Cancelled
        } else if self.allocator.is_exhausted() {
            StopReason::Exhausted
        } else {
            return None;
        };

        for (id, mut session) in std::mem::take(&mut self.sessions) {
            self.outbox.push(Outbound::Send {
                session: id,
                message: CoordinatorMessage::Stop,
            });
            match session.close() {
                Some(chunk) if reason == StopReason::Cancelled => {
                    self.allocator.reclaim(chunk);
                }
                Some(chunk) => {
                    self.allocator.retire(chunk);
                }
                None => {}
            }
            self.run.add_worker_time(session.connected_for(now));
            self.outbox.push(Outbound::Close { session: id });
        }

        info!(%reason, "Run stopping");
        self.stopped = Some(reason);
        self.stopped
    }

    /// How long until the earliest session deadline, if any session is live.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        self.sessions
            .values()
            .map(|s| s.deadline(self.job.timeout).saturating_duration_since(now))
            .min()
    }

    /// Take the queued actions, oldest first.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Figures for the end-of-run summary.
    pub fn summary(&self, now: Instant) -> RunSummary {
        RunSummary {
            reason: self.stopped,
            result: self.run.result().map(<[u8]>::to_vec),
            worker_time: self.run.worker_time(),
            elapsed: now.saturating_duration_since(self.run.started_at()),
            chunks_retired: self.allocator.retired_len(),
            total_chunks: self.allocator.total_chunks(),
            sessions_served: self.next_id - 1,
        }
    }

    fn try_assign(&mut self, id: SessionId) {
        if self.is_stopping() {
            return;
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        if session.state() != SessionState::Idle {
            return;
        }
        let Some(chunk) = self.allocator.next_chunk() else {
            debug!(session = id, "No chunk available, worker left idle");
            return;
        };
        session.assign(chunk);
        debug!(
            session = id,
            start = chunk.start,
            length = chunk.length,
            "Assigned chunk"
        );
        self.outbox.push(Outbound::Send {
            session: id,
            message: CoordinatorMessage::assign(chunk),
        });
    }

    /// Hand pending chunks to idle sessions in table order.
    fn assign_idle(&mut self) {
        let idle: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.state() == SessionState::Idle)
            .map(|s| s.id)
            .collect();
        for id in idle {
            if self.allocator.pending_len() == 0 {
                break;
            }
            self.try_assign(id);
        }
    }

    fn drop_session(&mut self, id: SessionId, now: Instant, error: &ProtocolError) {
        if self.close_session(id, now) {
            warn!(session = id, %error, "Protocol error, closing session");
            self.assign_idle();
        }
    }

    /// Remove a session, reclaiming its chunk and banking its time.
    fn close_session(&mut self, id: SessionId, now: Instant) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            return false;
        };
        if let Some(chunk) = session.close() {
            self.allocator.reclaim(chunk);
            debug!(
                session = id,
                %chunk,
                checkpoint = session.checkpoint_index(),
                "Reclaimed chunk"
            );
        }
        self.run.add_worker_time(session.connected_for(now));
        debug!(
            session = id,
            chunks_completed = session.chunks_completed(),
            "Session closed"
        );
        self.outbox.push(Outbound::Close { session: id });
        true
    }
}
