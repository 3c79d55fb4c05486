//! Reassembly of newline-delimited frames from a byte stream.
//!
//! Reads arrive in arbitrary pieces; a [`FrameBuffer`] accumulates them and
//! yields one decoded message per complete line, keeping any trailing partial
//! line for the next read.

use super::protocol::ProtocolError;
use serde::de::DeserializeOwned;

/// Largest frame a session may buffer, excluding the newline.
pub const MAX_FRAME_BYTES: usize = 2048;

/// Capacity-bounded inbound buffer for one connection.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    /// Bytes at the front of `buf` already returned as frames.
    consumed: usize,
    /// Bytes after `consumed` known to contain no newline.
    scanned: usize,
    capacity: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(4096)),
            consumed: 0,
            scanned: 0,
            capacity,
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        if self.consumed > 0 {
            self.buf.drain(..self.consumed);
            self.consumed = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame.
    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.buf.len() - self.consumed
    }

    /// Decode the next complete frame, if any.
    ///
    /// Blank lines are skipped. Returns `Ok(None)` when only a partial frame
    /// remains. A frame longer than the capacity, complete or not, is an error,
    /// as is a line that does not decode as `T`.
    pub fn next_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            let unread = &self.buf[self.consumed..];
            let Some(newline) = unread[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = unread.len();
                if unread.len() > self.capacity {
                    return Err(ProtocolError::FrameTooLarge {
                        limit: self.capacity,
                    });
                }
                return Ok(None);
            };

            let line_len = self.scanned + newline;
            if line_len > self.capacity {
                return Err(ProtocolError::FrameTooLarge {
                    limit: self.capacity,
                });
            }

            let line = &unread[..line_len];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let decoded = if line.iter().all(u8::is_ascii_whitespace) {
                None
            } else {
                Some(
                    serde_json::from_slice::<T>(line)
                        .map_err(|e| ProtocolError::Malformed(e.to_string())),
                )
            };

            self.consumed += line_len + 1;
            self.scanned = 0;

            match decoded {
                Some(result) => return result.map(Some),
                None => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::protocol::WorkerMessage;

    #[test]
    fn test_single_complete_frame() {
        let mut buf = FrameBuffer::default();
        buf.extend(b"{\"type\":\"exhausted\"}\n");
        assert_eq!(
            buf.next_message::<WorkerMessage>().unwrap(),
            Some(WorkerMessage::Exhausted)
        );
        assert_eq!(buf.next_message::<WorkerMessage>().unwrap(), None);
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut buf = FrameBuffer::default();
        buf.extend(b"{\"type\":\"checkpo");
        assert_eq!(buf.next_message::<WorkerMessage>().unwrap(), None);
        buf.extend(b"int\",\"index\":7}\n{\"type\":\"heart");
        assert_eq!(
            buf.next_message::<WorkerMessage>().unwrap(),
            Some(WorkerMessage::Checkpoint { index: 7 })
        );
        assert_eq!(buf.next_message::<WorkerMessage>().unwrap(), None);
        buf.extend(b"beat\"}\n");
        assert_eq!(
            buf.next_message::<WorkerMessage>().unwrap(),
            Some(WorkerMessage::Heartbeat)
        );
    }

    #[test]
    fn test_dripped_bytes_form_one_frame() {
        let mut buf = FrameBuffer::default();
        let line = b"{\"type\":\"exhausted\"}\n";
        for (i, byte) in line.iter().enumerate() {
            buf.extend(std::slice::from_ref(byte));
            let msg = buf.next_message::<WorkerMessage>().unwrap();
            if i + 1 < line.len() {
                assert!(msg.is_none());
            } else {
                assert_eq!(msg, Some(WorkerMessage::Exhausted));
            }
        }
    }

    #[test]
    fn test_several_frames_in_one_read_and_blank_lines() {
        let mut buf = FrameBuffer::default();
        buf.extend(b"\n{\"type\":\"heartbeat\"}\r\n\r\n{\"type\":\"exhausted\"}\n");
        assert_eq!(
            buf.next_message::<WorkerMessage>().unwrap(),
            Some(WorkerMessage::Heartbeat)
        );
        assert_eq!(
            buf.next_message::<WorkerMessage>().unwrap(),
            Some(WorkerMessage::Exhausted)
        );
        assert_eq!(buf.next_message::<WorkerMessage>().unwrap(), None);
    }

    #[test]
    fn test_unterminated_overflow_is_error() {
        let mut buf = FrameBuffer::new(16);
        buf.extend(&[b'x'; 16]);
        assert_eq!(buf.next_message::<WorkerMessage>().unwrap(), None);
        buf.extend(b"y");
        assert_eq!(
            buf.next_message::<WorkerMessage>(),
            Err(ProtocolError::FrameTooLarge { limit: 16 })
        );
    }

    #[test]
    fn test_complete_oversize_frame_is_error() {
        let mut buf = FrameBuffer::new(8);
        buf.extend(b"{\"type\":\"exhausted\"}\n");
        assert!(matches!(
            buf.next_message::<WorkerMessage>(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_malformed_frame_is_error_not_dropped() {
        let mut buf = FrameBuffer::default();
        buf.extend(b"garbage\n{\"type\":\"exhausted\"}\n");
        assert!(matches!(
            buf.next_message::<WorkerMessage>(),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
