mod batch;
mod cache;
mod schema;
pub mod clusterings;
pub mod embeddings;
pub mod faces;
pub mod photos;
pub mod tags;

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

pub use cache::ActiveClusteringCache;
pub use clusterings::{ClusterAssignment, Clustering, NewEpoch, PersonCount, PersonPhoto};
pub use embeddings::EmbeddingStore;
pub use faces::{BoundingBox, Face, FaceRecord, NewFace, ScannedPhoto};
pub use photos::{Photo, ScanStatus};
pub use schema::SCHEMA;
pub use tags::TagSummary;

/// Person id reserved for faces that belong to no cluster.
pub const UNMATCHED_PERSON: i64 = 0;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// The metadata store.
///
/// All mutations go through a single writer connection; UI-facing reads use
/// a second connection so they are served from the last committed snapshot
/// (WAL) while a worker holds a write transaction open.
pub struct Database {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: PathBuf,
    active_cache: ActiveClusteringCache,
}

impl Database {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer = open_connection(path)?;
        writer.execute_batch(SCHEMA)?;
        let reader = open_connection(path)?;

        tracing::debug!(path = ?path, "Metadata store opened");

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            path: path.to_path_buf(),
            active_cache: ActiveClusteringCache::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| anyhow!("Writer connection lock poisoned"))
    }

    pub(crate) fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| anyhow!("Reader connection lock poisoned"))
    }

    pub(crate) fn active_cache(&self) -> &ActiveClusteringCache {
        &self.active_cache
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(mode = %mode, "WAL journal mode unavailable");
    }
    conn.execute_batch(
        r#"
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA temp_store = MEMORY;
        "#,
    )?;
    Ok(conn)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// Fresh metadata + embedding stores in a temporary directory.
    pub fn open_stores() -> (TempDir, Database, EmbeddingStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("metadata.db")).unwrap();
        let store = EmbeddingStore::open(&dir.path().join("embeddings.db")).unwrap();
        (dir, db, store)
    }

    pub fn unit(values: &[f32]) -> Vec<f32> {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        values.iter().map(|v| v / norm).collect()
    }

    /// Insert a completed photo with one face per embedding; returns face ids.
    pub fn add_photo_with_faces(
        db: &Database,
        store: &EmbeddingStore,
        path: &str,
        embeddings: &[Vec<f32>],
    ) -> Vec<i64> {
        let (photo_id, _) = db.upsert_photo(path, "hash").unwrap();
        let faces = embeddings
            .iter()
            .map(|e| NewFace {
                bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
                embedding: e.clone(),
            })
            .collect();
        let ids = db
            .commit_scanned_batch(&[ScannedPhoto { photo_id, faces }], store)
            .unwrap();
        ids.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;

    #[test]
    fn test_reader_sees_committed_writes() {
        let (_dir, db, _store) = open_stores();
        db.upsert_photo("/p/a.jpg", "h").unwrap();

        assert_eq!(db.count_photos().unwrap(), 1);
    }

    #[test]
    fn test_wal_mode_enabled() {
        let (_dir, db, _store) = open_stores();
        let conn = db.reader().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
