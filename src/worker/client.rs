//! Blocking worker connection.

use super::keyspace::Keyspace;
use crate::error::{KeypoolError, Result};
use crate::pool::chunk::Chunk;
use crate::pool::codec::FrameBuffer;
use crate::pool::protocol::{CoordinatorMessage, MAX_HOSTNAME_LEN, ProtocolError, WorkerMessage};
use sha2::{Digest, Sha256};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// How long to wait for the coordinator's greeting.
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// What a worker did before the coordinator let it go.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub chunks_searched: u64,
    pub candidates_tested: u64,
    /// The matching candidate, if this worker found it.
    pub found: Option<String>,
}

/// Outcome of searching one chunk.
enum Search {
    Exhausted,
    Found(String),
    Stopped,
}

struct Connection {
    stream: TcpStream,
    inbound: FrameBuffer,
}

impl Connection {
    fn send(&mut self, message: &WorkerMessage) -> Result<()> {
        self.stream.write_all(message.to_line().as_bytes())?;
        Ok(())
    }

    /// Wait for the next message, up to the socket's read timeout.
    ///
    /// `Ok(None)` means the timeout elapsed.
    fn recv(&mut self) -> Result<Option<CoordinatorMessage>> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(message) = self.inbound.next_message()? {
                return Ok(Some(message));
            }
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(KeypoolError::Disconnected),
                Ok(n) => self.inbound.extend(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Check for a message without waiting.
    fn poll(&mut self) -> Result<Option<CoordinatorMessage>> {
        self.stream.set_nonblocking(true)?;
        let result = self.recv();
        self.stream.set_nonblocking(false)?;
        result
    }
}

/// Connect to `addr` and work until the coordinator stops this worker.
#[instrument(skip(keyspace))]
pub fn run(addr: &str, keyspace: &Keyspace) -> Result<WorkerReport> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(WELCOME_TIMEOUT))?;
    let mut conn = Connection {
        stream,
        inbound: FrameBuffer::default(),
    };

    let (target, checkpoint_interval, timeout_secs) = match conn.recv()? {
        Some(CoordinatorMessage::Welcome {
            target,
            checkpoint_interval,
            timeout_secs,
        }) => (hex::decode(target)?, checkpoint_interval.max(1), timeout_secs),
        Some(other) => {
            return Err(ProtocolError::Malformed(format!("expected welcome, got {:?}", other)).into());
        }
        None => {
            return Err(KeypoolError::Handshake(
                "no welcome from coordinator".to_string(),
            ));
        }
    };
    info!(
        target = %hex::encode(&target),
        checkpoint_interval,
        timeout_secs,
        "Connected to coordinator"
    );

    conn.stream
        .set_read_timeout(Some(heartbeat_interval(timeout_secs)))?;
    conn.send(&WorkerMessage::Hello {
        hostname: hostname(),
    })?;

    let mut report = WorkerReport::default();
    loop {
        let message = match conn.recv() {
            Ok(Some(message)) => message,
            Ok(None) => {
                conn.send(&WorkerMessage::Heartbeat)?;
                continue;
            }
            Err(KeypoolError::Disconnected) => {
                info!("Coordinator closed the connection");
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        match message {
            CoordinatorMessage::Assign { start, length } => {
                let chunk = Chunk::new(start, length);
                debug!(%chunk, "Searching chunk");
                match search(&mut conn, keyspace, &target, chunk, checkpoint_interval, &mut report)? {
                    Search::Exhausted => report.chunks_searched += 1,
                    Search::Found(value) => {
                        info!(%value, "Match found");
                        report.found = Some(value);
                    }
                    Search::Stopped => return Ok(report),
                }
            }
            CoordinatorMessage::Stop => {
                info!("Stopped by coordinator");
                return Ok(report);
            }
            CoordinatorMessage::Welcome { .. } => debug!("Ignoring repeated welcome"),
        }
    }
}

fn search(
    conn: &mut Connection,
    keyspace: &Keyspace,
    target: &[u8],
    chunk: Chunk,
    checkpoint_interval: u64,
    report: &mut WorkerReport,
) -> Result<Search> {
    for index in chunk.start..chunk.end() {
        let candidate = keyspace.candidate(index);
        report.candidates_tested += 1;
        if Sha256::digest(candidate.as_bytes()).as_slice() == target {
            conn.send(&WorkerMessage::found(candidate.as_bytes()))?;
            return Ok(Search::Found(candidate));
        }

        let next = index + 1;
        if (next - chunk.start) % checkpoint_interval == 0 && next < chunk.end() {
            conn.send(&WorkerMessage::Checkpoint { index: next })?;
            if let Some(CoordinatorMessage::Stop) = conn.poll()? {
                return Ok(Search::Stopped);
            }
        }
    }
    conn.send(&WorkerMessage::Exhausted)?;
    Ok(Search::Exhausted)
}

/// Heartbeat three times per coordinator timeout so one late beat is harmless.
fn heartbeat_interval(timeout_secs: u64) -> Duration {
    Duration::from_millis((timeout_secs.saturating_mul(1000) / 3).max(1))
}

fn hostname() -> String {
    let mut name = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    while name.len() > MAX_HOSTNAME_LEN {
        name.pop();
    }
    name
}
