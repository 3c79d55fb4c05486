//! Wire protocol between the coordinator and its workers.
//!
//! Messages are JSON-serialized and newline-delimited, one message per line.
//! Binary payloads (the search target and found values) travel hex-encoded.

use super::chunk::Chunk;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest found value a worker may report, in decoded bytes.
pub const MAX_VALUE_LEN: usize = 255;

/// Largest hostname accepted in a `hello` message.
pub const MAX_HOSTNAME_LEN: usize = 255;

/// Message from the coordinator to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordinatorMessage {
    /// Job parameters, sent once right after the connection is accepted.
    #[serde(rename = "welcome")]
    Welcome {
        /// Hex-encoded search target.
        target: String,
        /// Report a checkpoint every this many candidates.
        checkpoint_interval: u64,
        /// Silence longer than this gets the worker reclaimed.
        timeout_secs: u64,
    },

    /// Search the range `[start, start + length)`.
    #[serde(rename = "assign")]
    Assign { start: u64, length: u64 },

    /// Terminate the search and disconnect.
    #[serde(rename = "stop")]
    Stop,
}

/// Message from a worker to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Optional introduction.
    #[serde(rename = "hello")]
    Hello { hostname: String },

    /// Liveness ping with no other meaning.
    #[serde(rename = "heartbeat")]
    Heartbeat,

    /// Progress marker inside the assigned chunk.
    #[serde(rename = "checkpoint")]
    Checkpoint { index: u64 },

    /// The assigned chunk was searched without a match.
    #[serde(rename = "exhausted")]
    Exhausted,

    /// A match was located. `value` is hex-encoded.
    #[serde(rename = "found")]
    Found { value: String },
}

/// Session-scoped protocol violation.
///
/// Any of these closes the offending session and reclaims its chunk; the run
/// itself continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("{message} without an assigned chunk")]
    NoChunk { message: &'static str },

    #[error("checkpoint {index} outside assigned chunk {chunk}")]
    CheckpointOutOfRange { index: u64, chunk: Chunk },

    #[error("checkpoint {index} regresses below {current}")]
    CheckpointRegressed { index: u64, current: u64 },

    #[error("found value is {len} bytes, limit is {limit}")]
    ValueTooLong { len: usize, limit: usize },

    #[error("found value is not valid hex: {0}")]
    InvalidValue(String),

    #[error("hostname is {len} bytes, limit is {limit}")]
    HostnameTooLong { len: usize, limit: usize },
}

impl CoordinatorMessage {
    /// Create the greeting for a job.
    pub fn welcome(target: &[u8], checkpoint_interval: u64, timeout_secs: u64) -> Self {
        Self::Welcome {
            target: hex::encode(target),
            checkpoint_interval,
            timeout_secs,
        }
    }

    /// Create an assignment for a chunk.
    pub fn assign(chunk: Chunk) -> Self {
        Self::Assign {
            start: chunk.start,
            length: chunk.length,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("CoordinatorMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    #[cfg(test)]
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkerMessage {
    /// Create a found report for a raw value.
    pub fn found(value: &[u8]) -> Self {
        Self::Found {
            value: hex::encode(value),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkerMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    #[cfg(test)]
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Decode and bound-check a hex-encoded found value.
pub fn decode_value(value: &str) -> Result<Vec<u8>, ProtocolError> {
    // Two hex digits per byte; reject before allocating.
    if value.len() > MAX_VALUE_LEN * 2 {
        return Err(ProtocolError::ValueTooLong {
            len: value.len() / 2,
            limit: MAX_VALUE_LEN,
        });
    }
    hex::decode(value).map_err(|e| ProtocolError::InvalidValue(e.to_string()))
}
