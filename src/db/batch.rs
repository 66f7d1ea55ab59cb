//! Id-list helpers that stay under SQLite's host parameter limit.

use anyhow::Result;
use rusqlite::{params_from_iter, Connection};

/// Largest id list bound as inline `?` parameters.
pub(crate) const MAX_INLINE_IDS: usize = 900;

/// An `IN` operand for an id list: either `(?, ?, ...)` with the ids as
/// parameters, or a sub-select over `temp.batch_ids` with no parameters.
///
/// The temp table is per connection and refilled on every call, so only one
/// large `IdFilter` may be live per connection at a time.
pub(crate) struct IdFilter {
    pub clause: String,
    pub params: Vec<i64>,
}

impl IdFilter {
    pub fn build(conn: &Connection, ids: &[i64]) -> Result<Self> {
        if ids.len() <= MAX_INLINE_IDS {
            let placeholders = vec!["?"; ids.len()].join(", ");
            return Ok(Self {
                clause: format!("({})", placeholders),
                params: ids.to_vec(),
            });
        }

        conn.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS batch_ids (id INTEGER PRIMARY KEY);
             DELETE FROM temp.batch_ids;",
        )?;
        for chunk in ids.chunks(MAX_INLINE_IDS) {
            let placeholders = vec!["(?)"; chunk.len()].join(", ");
            conn.execute(
                &format!("INSERT OR IGNORE INTO temp.batch_ids (id) VALUES {}", placeholders),
                params_from_iter(chunk.iter()),
            )?;
        }

        tracing::trace!(count = ids.len(), "Loaded ids into temp table");

        Ok(Self {
            clause: "(SELECT id FROM temp.batch_ids)".to_string(),
            params: Vec::new(),
        })
    }
}
