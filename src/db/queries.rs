//! Read queries over recorded results.

use super::Database;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A found value as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResult {
    pub id: i64,
    pub label: String,
    pub hostname: String,
    pub ip_address: String,
    pub session_id: i64,
    pub recorded_at: DateTime<Utc>,
    pub value_hex: String,
}

impl StoredResult {
    /// Parse a row from the database.
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let ts: i64 = row.get("timestamp")?;
        Ok(Self {
            id: row.get("id")?,
            label: row.get("label")?,
            hostname: row.get("hostname")?,
            ip_address: row.get("ip_address")?,
            session_id: row.get("session_id")?,
            recorded_at: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
            value_hex: row.get("value_hex")?,
        })
    }

    /// The value as text when it is valid UTF-8.
    pub fn value_text(&self) -> Option<String> {
        hex::decode(&self.value_hex)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }
}

impl Database {
    /// Recorded results, newest first. A `limit` of 0 means unlimited.
    pub fn recent_results(&self, limit: usize) -> Result<Vec<StoredResult>> {
        let limit = if limit == 0 { -1 } else { limit as i64 };
        let mut stmt = self.conn.prepare(
            r#"
            SELECT r.id, l.label, c.hostname, c.ip_address, r.session_id, r.timestamp, r.value_hex
            FROM results r
            JOIN labels l ON l.id = r.label_id
            JOIN clients c ON c.id = l.client_id
            ORDER BY r.timestamp DESC, r.id DESC
            LIMIT ?
            "#,
        )?;
        let rows = stmt.query_map([limit], StoredResult::from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
