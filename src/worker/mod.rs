//! Reference worker.
//!
//! Connects to a coordinator, searches each assigned chunk by hashing the
//! candidate for every index with SHA-256, and reports progress, exhaustion
//! or the matching value.

pub mod client;
pub mod keyspace;

pub use client::run;
pub use keyspace::Keyspace;

use sha2::{Digest, Sha256};

/// SHA-256 of `value`.
pub fn digest(value: &[u8]) -> [u8; 32] {
    Sha256::digest(value).into()
}
