//! Worker pool coordinator.
//!
//! Remote workers connect over TCP, receive disjoint chunks of the keyspace
//! `[0, work_size)` and report progress until one of them finds a match, the
//! whole keyspace has been searched, or the operator interrupts the run.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────┐  ┌──────────┐  ┌──────────┐
//!   │ Worker 1 │  │ Worker 2 │  │ Worker N │
//!   └────┬─────┘  └────┬─────┘  └────┬─────┘
//!        │ JSON lines  │             │
//!   ┌────▼─────────────▼─────────────▼────┐
//!   │  event_loop (reader task per conn)  │
//!   └─────────────────┬───────────────────┘
//!                     │ bytes / EOF / ticks
//!   ┌─────────────────▼───────────────────┐
//!   │  Coordinator                        │
//!   │   sessions ── ChunkAllocator        │
//!   │   RunState ── ResultSink            │
//!   └─────────────────────────────────────┘
//! ```
//!
//! # Policy
//!
//! - **Ascending order**: chunks are handed out lowest offset first,
//!   reclaimed chunks before fresh ones
//! - **Restart on reclaim**: a reclaimed chunk is searched again from its
//!   start; checkpoints are progress reports only
//! - **Liveness**: any bytes from a worker count as a sign of life, complete
//!   frame or not

pub mod chunk;
pub mod codec;
pub mod coordinator;
pub mod event_loop;
pub mod job;
pub mod protocol;
pub mod session;

pub use coordinator::{Coordinator, RunSummary, StopReason};
pub use job::Job;
