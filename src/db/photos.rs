use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashSet;

use super::batch::IdFilter;
use super::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Pending,
    Completed,
    Error,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Completed => "completed",
            ScanStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ScanStatus::Pending),
            "completed" => Some(ScanStatus::Completed),
            "error" => Some(ScanStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Photo {
    pub photo_id: i64,
    pub file_path: String,
    pub file_hash: Option<String>,
    pub scan_status: ScanStatus,
    pub date_added: String,
}

fn status_column(value: String) -> rusqlite::Result<ScanStatus> {
    ScanStatus::parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown scan_status '{}'", value).into(),
        )
    })
}

impl Database {
    /// Insert a photo or refresh the hash of an existing row.
    ///
    /// Returns the row's id and its status *before* this call, so a path
    /// that is already `completed` keeps its id and can be skipped.
    pub fn upsert_photo(&self, file_path: &str, file_hash: &str) -> Result<(i64, ScanStatus)> {
        let conn = self.writer()?;
        let (photo_id, status): (i64, String) = conn.query_row(
            r#"
            INSERT INTO photos (file_path, file_hash, scan_status, date_added)
            VALUES (?, ?, 'pending', ?)
            ON CONFLICT(file_path) DO UPDATE SET file_hash = excluded.file_hash
            RETURNING photo_id, scan_status
            "#,
            params![file_path, file_hash, Utc::now().to_rfc3339()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let status = ScanStatus::parse(&status)
            .ok_or_else(|| anyhow!("Unknown scan_status '{}' for {}", status, file_path))?;
        Ok((photo_id, status))
    }

    pub fn photo_id_for_path(&self, file_path: &str) -> Result<Option<i64>> {
        let conn = self.reader()?;
        let result = conn.query_row(
            "SELECT photo_id FROM photos WHERE file_path = ?",
            [file_path],
            |row| row.get(0),
        );

        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_photo(&self, photo_id: i64) -> Result<Option<Photo>> {
        let conn = self.reader()?;
        let result = conn.query_row(
            r#"
            SELECT photo_id, file_path, file_hash, scan_status, date_added
            FROM photos WHERE photo_id = ?
            "#,
            [photo_id],
            |row| {
                Ok(Photo {
                    photo_id: row.get(0)?,
                    file_path: row.get(1)?,
                    file_hash: row.get(2)?,
                    scan_status: status_column(row.get(3)?)?,
                    date_added: row.get(4)?,
                })
            },
        );

        match result {
            Ok(photo) => Ok(Some(photo)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Paths whose detection has finished.
    pub fn completed_paths(&self) -> Result<HashSet<String>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT file_path FROM photos WHERE scan_status = 'completed'")?;
        let paths = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(paths)
    }

    /// Paths left `pending` or `error` by an earlier run.
    pub fn pending_and_error_paths(&self) -> Result<Vec<String>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT file_path FROM photos WHERE scan_status IN ('pending', 'error') ORDER BY photo_id",
        )?;
        let paths = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(paths)
    }

    /// Delete every photo whose path is not in `live_paths`.
    /// Returns the number of photos removed.
    pub fn remove_deleted_photos(&self, live_paths: &HashSet<String>) -> Result<usize> {
        let stale: Vec<i64> = {
            let conn = self.reader()?;
            let mut stmt = conn.prepare("SELECT photo_id, file_path FROM photos")?;
            let rows: Vec<(i64, String)> = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            rows.into_iter()
                .filter(|(_, path)| !live_paths.contains(path))
                .map(|(id, _)| id)
                .collect()
        };

        if stale.is_empty() {
            return Ok(0);
        }

        self.delete_photos(&stale)?;
        tracing::info!(count = stale.len(), "Removed photos no longer on disk");
        Ok(stale.len())
    }

    /// Delete photos with their faces and every face-keyed row.
    /// Embedding store entries are left behind as harmless orphans.
    pub fn delete_photos(&self, photo_ids: &[i64]) -> Result<()> {
        if photo_ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let face_ids = face_ids_for_photos(&tx, photo_ids)?;
        if !face_ids.is_empty() {
            let faces = IdFilter::build(&tx, &face_ids)?;
            for table in [
                "cluster_assignments",
                "face_tags",
                "tag_primary_photos",
                "hidden_photos",
                "faces",
            ] {
                tx.execute(
                    &format!("DELETE FROM {} WHERE face_id IN {}", table, faces.clause),
                    params_from_iter(faces.params.iter()),
                )?;
            }
        }

        let photos = IdFilter::build(&tx, photo_ids)?;
        tx.execute(
            &format!("DELETE FROM photos WHERE photo_id IN {}", photos.clause),
            params_from_iter(photos.params.iter()),
        )?;

        tx.commit()?;
        tracing::debug!(photos = photo_ids.len(), faces = face_ids.len(), "Deleted photos");
        Ok(())
    }

    pub fn set_photo_status(&self, photo_id: i64, status: ScanStatus) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "UPDATE photos SET scan_status = ? WHERE photo_id = ?",
            params![status.as_str(), photo_id],
        )?;
        Ok(())
    }

    /// Mark a whole group as `error`, e.g. after its batch commit failed.
    pub fn mark_photos_error(&self, photo_ids: &[i64]) -> Result<()> {
        if photo_ids.is_empty() {
            return Ok(());
        }
        let conn = self.writer()?;
        let filter = IdFilter::build(&conn, photo_ids)?;
        conn.execute(
            &format!(
                "UPDATE photos SET scan_status = 'error' WHERE photo_id IN {}",
                filter.clause
            ),
            params_from_iter(filter.params.iter()),
        )?;
        Ok(())
    }

    pub fn count_photos(&self) -> Result<i64> {
        let conn = self.reader()?;
        let count = conn.query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Photos still `pending` or `error`.
    pub fn count_pending_photos(&self) -> Result<i64> {
        let conn = self.reader()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM photos WHERE scan_status IN ('pending', 'error')",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn face_ids_for_photos(conn: &Connection, photo_ids: &[i64]) -> Result<Vec<i64>> {
    let filter = IdFilter::build(conn, photo_ids)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT face_id FROM faces WHERE photo_id IN {}",
        filter.clause
    ))?;
    let ids = stmt
        .query_map(params_from_iter(filter.params.iter()), |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(ids)
}
