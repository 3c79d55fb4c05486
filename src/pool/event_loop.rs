//! Socket plumbing around the [`Coordinator`].
//!
//! Each connection gets a reader task that forwards raw bytes over a channel
//! and a writer task that drains a queue of outbound lines. The loop itself is
//! the only code that touches the coordinator, so the session table never
//! needs a lock, and it never awaits a peer: a worker that stops reading
//! stalls only its own writer. Each iteration waits for one event (an accept,
//! inbound bytes, cancellation or the poll timer), drains whatever else is
//! already queued, then sweeps timeouts, checks the stop conditions and hands
//! outbound messages to the writers.

use super::coordinator::{Coordinator, Outbound, StopReason};
use super::session::SessionId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Longest the loop sleeps without re-checking timeouts and cancellation.
pub const POLL_GRANULARITY: Duration = Duration::from_millis(250);

/// A worker that cannot take a message within this long is dropped.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const READ_BUFFER_BYTES: usize = 4096;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What a connection task reports.
#[derive(Debug)]
enum SessionEvent {
    Data(SessionId, Vec<u8>),
    Closed(SessionId),
    WriteFailed(SessionId),
}

struct Connection {
    outbox: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Serve the pool until a stop condition holds.
///
/// On return every connection has been sent `stop` and shut down, or its
/// writer gave up after [`WRITE_TIMEOUT`].
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn run(
    listener: TcpListener,
    coordinator: &mut Coordinator,
    cancel: CancellationToken,
) -> StopReason {
    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut connections: HashMap<SessionId, Connection> = HashMap::new();
    // Writers of closed sessions still draining their last messages.
    let mut closing: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let wait = coordinator
            .next_deadline(Instant::now().into_std())
            .map_or(POLL_GRANULARITY, |d| d.min(POLL_GRANULARITY));

        tokio::select! {
            biased;

            _ = cancel.cancelled() => coordinator.cancel(),

            accepted = listener.accept(), if coordinator.has_capacity() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let id = coordinator.accept(peer, Instant::now().into_std());
                    let (read, write) = stream.into_split();
                    let (outbox, lines) = mpsc::unbounded_channel();
                    let reader = tokio::spawn(read_loop(id, read, tx.clone()));
                    let writer = tokio::spawn(write_loop(id, write, lines, tx.clone()));
                    connections.insert(id, Connection { outbox, reader, writer });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },

            Some(event) = rx.recv() => handle_event(coordinator, event),

            _ = tokio::time::sleep(wait) => {}
        }

        while let Ok(event) = rx.try_recv() {
            handle_event(coordinator, event);
        }

        let now = Instant::now().into_std();
        coordinator.sweep(now);
        let stop = coordinator.poll_stop(now);
        flush(coordinator, &mut connections, &mut closing);
        closing.retain(|writer| !writer.is_finished());

        if let Some(reason) = stop {
            for (_, connection) in connections.drain() {
                connection.reader.abort();
                closing.push(connection.writer);
            }
            let deadline = Instant::now() + WRITE_TIMEOUT;
            for writer in closing {
                if tokio::time::timeout_at(deadline, writer).await.is_err() {
                    debug!("Writer still busy at shutdown, abandoning it");
                }
            }
            return reason;
        }
    }
}

fn handle_event(coordinator: &mut Coordinator, event: SessionEvent) {
    let now = Instant::now().into_std();
    match event {
        SessionEvent::Data(id, bytes) => coordinator.receive(id, &bytes, now),
        SessionEvent::Closed(id) => coordinator.disconnect(id, now),
        SessionEvent::WriteFailed(id) => coordinator.send_failed(id, now),
    }
}

/// Hand queued actions to the connection tasks without waiting on any peer.
///
/// Closing a connection drops its queue; the writer sends what is left and
/// shuts the socket down.
fn flush(
    coordinator: &mut Coordinator,
    connections: &mut HashMap<SessionId, Connection>,
    closing: &mut Vec<JoinHandle<()>>,
) {
    for action in coordinator.drain_outbound() {
        match action {
            Outbound::Send { session, message } => {
                if let Some(connection) = connections.get(&session) {
                    // A closed queue means the writer failed and has said so.
                    let _ = connection.outbox.send(message.to_line());
                }
            }
            Outbound::Close { session } => {
                if let Some(connection) = connections.remove(&session) {
                    connection.reader.abort();
                    closing.push(connection.writer);
                }
            }
        }
    }
}

async fn read_loop<R>(id: SessionId, mut reader: R, events: mpsc::Sender<SessionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if events
                    .send(SessionEvent::Data(id, buf[..n].to_vec()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                debug!(session = id, error = %e, "Read failed");
                break;
            }
        }
    }
    let _ = events.send(SessionEvent::Closed(id)).await;
}

async fn write_loop<W>(
    id: SessionId,
    mut writer: W,
    mut lines: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<SessionEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        match tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(line.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(session = id, error = %e, "Write failed");
                let _ = events.send(SessionEvent::WriteFailed(id)).await;
                return;
            }
            Err(_) => {
                debug!(session = id, "Write timed out");
                let _ = events.send(SessionEvent::WriteFailed(id)).await;
                return;
            }
        }
    }
    let _ = tokio::time::timeout(WRITE_TIMEOUT, writer.shutdown()).await;
}
