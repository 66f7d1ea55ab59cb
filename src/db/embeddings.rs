//! Embedding store: face id -> unit-norm vector, in its own SQLite file.
//!
//! Written once per detected face and read in full on every clustering run,
//! so the table is a plain rowid table scanned in key order.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct EmbeddingStore {
    conn: Mutex<Connection>,
}

impl EmbeddingStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(
            r#"
            PRAGMA synchronous = NORMAL;
            CREATE TABLE IF NOT EXISTS embeddings (
                face_id INTEGER PRIMARY KEY,
                dim INTEGER NOT NULL,
                vector BLOB NOT NULL
            );
            "#,
        )?;

        tracing::debug!(path = ?path, "Embedding store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Embedding store lock poisoned"))
    }

    pub fn put(&self, face_id: i64, embedding: &[f32]) -> Result<()> {
        self.put_many(&[(face_id, embedding)])
    }

    /// Write several vectors in one transaction.
    pub fn put_many(&self, entries: &[(i64, &[f32])]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO embeddings (face_id, dim, vector) VALUES (?, ?, ?)",
            )?;
            for (face_id, embedding) in entries {
                stmt.execute(params![
                    face_id,
                    embedding.len() as i64,
                    embedding_to_bytes(embedding)
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, face_id: i64) -> Result<Option<Vec<f32>>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT vector FROM embeddings WHERE face_id = ?",
            [face_id],
            |row| row.get::<_, Vec<u8>>(0),
        );

        match result {
            Ok(bytes) => Ok(Some(bytes_to_embedding(&bytes))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored vector in face id order. May include orphans whose face
    /// row has been deleted; callers intersect with live face ids.
    pub fn load_all(&self) -> Result<Vec<(i64, Vec<f32>)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT face_id, vector FROM embeddings ORDER BY face_id")?;
        let rows = stmt
            .query_map([], |row| {
                let bytes: Vec<u8> = row.get(1)?;
                Ok((row.get(0)?, bytes_to_embedding(&bytes)))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count)
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Convert f32 slice to little-endian bytes for storage
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
