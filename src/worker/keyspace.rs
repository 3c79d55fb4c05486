//! Mapping from keyspace indices to candidate strings.
//!
//! Indices enumerate every non-empty string over the charset in shortlex
//! order (bijective base-k numbering): with charset `ab`, index 0 is `a`,
//! 1 is `b`, 2 is `aa`, 3 is `ab` and so on. Every string appears exactly once.

use crate::error::{KeypoolError, Result};

/// Lowercase letters and digits.
pub const DEFAULT_CHARSET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";

/// An ordered, duplicate-free set of characters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    charset: Vec<char>,
}

impl Keyspace {
    pub fn new(charset: &str) -> Result<Self> {
        let chars: Vec<char> = charset.chars().collect();
        if chars.is_empty() {
            return Err(KeypoolError::InvalidJob("charset must not be empty".into()));
        }
        for (i, c) in chars.iter().enumerate() {
            if chars[..i].contains(c) {
                return Err(KeypoolError::InvalidJob(format!(
                    "charset contains '{}' more than once",
                    c
                )));
            }
        }
        Ok(Self { charset: chars })
    }

    /// Number of characters in the charset.
    pub fn radix(&self) -> u64 {
        self.charset.len() as u64
    }

    /// The candidate at `index`.
    pub fn candidate(&self, index: u64) -> String {
        let k = self.radix();
        // Work in u128 so index u64::MAX still has a successor.
        let mut n = index as u128 + 1;
        let mut out = Vec::new();
        while n > 0 {
            n -= 1;
            out.push(self.charset[(n % k as u128) as usize]);
            n /= k as u128;
        }
        out.iter().rev().collect()
    }

    /// Number of candidates no longer than `max_len`, saturating at `u64::MAX`.
    pub fn size_up_to(&self, max_len: u32) -> u64 {
        let k = self.radix();
        let mut total: u64 = 0;
        let mut layer: u64 = 1;
        for _ in 0..max_len {
            layer = layer.saturating_mul(k);
            total = total.saturating_add(layer);
        }
        total
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self {
            charset: DEFAULT_CHARSET.chars().collect(),
        }
    }
}
