//! Face rows. Embeddings are written to the embedding store in the same
//! commit path but live in their own file.

use anyhow::Result;
use rusqlite::{params, Row};

use super::embeddings::EmbeddingStore;
use super::Database;

/// Face rectangle in pixel coordinates of the oriented image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

#[derive(Debug, Clone)]
pub struct Face {
    pub face_id: i64,
    pub photo_id: i64,
    pub bbox: BoundingBox,
}

/// Face with the path of the photo it was found in.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    pub face: Face,
    pub file_path: String,
}

/// A detected face waiting to be committed. `embedding` is unit-norm.
#[derive(Debug, Clone)]
pub struct NewFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
}

/// Detection result for one photo of a scan batch.
#[derive(Debug, Clone)]
pub struct ScannedPhoto {
    pub photo_id: i64,
    pub faces: Vec<NewFace>,
}

pub(crate) fn face_from_row(row: &Row, offset: usize) -> rusqlite::Result<Face> {
    Ok(Face {
        face_id: row.get(offset)?,
        photo_id: row.get(offset + 1)?,
        bbox: BoundingBox {
            x1: row.get(offset + 2)?,
            y1: row.get(offset + 3)?,
            x2: row.get(offset + 4)?,
            y2: row.get(offset + 5)?,
        },
    })
}

impl Database {
    /// Commit the faces of a group of photos and mark them `completed`.
    ///
    /// Face rows and statuses are one metadata transaction. Embeddings are
    /// written in between, so a failure before the final commit leaves at
    /// most orphaned embeddings and no face rows. Returns the new face ids
    /// per photo, in input order.
    pub fn commit_scanned_batch(
        &self,
        batch: &[ScannedPhoto],
        store: &EmbeddingStore,
    ) -> Result<Vec<Vec<i64>>> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let mut face_ids = Vec::with_capacity(batch.len());
        let mut embeddings = Vec::new();
        {
            let mut insert = tx.prepare(
                r#"
                INSERT INTO faces (photo_id, bbox_x1, bbox_y1, bbox_x2, bbox_y2)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )?;
            let mut complete =
                tx.prepare("UPDATE photos SET scan_status = 'completed' WHERE photo_id = ?")?;

            for photo in batch {
                let mut ids = Vec::with_capacity(photo.faces.len());
                for face in &photo.faces {
                    let b = &face.bbox;
                    let face_id =
                        insert.insert(params![photo.photo_id, b.x1, b.y1, b.x2, b.y2])?;
                    embeddings.push((face_id, face.embedding.as_slice()));
                    ids.push(face_id);
                }
                complete.execute([photo.photo_id])?;
                face_ids.push(ids);
            }
        }

        store.put_many(&embeddings)?;
        tx.commit()?;

        tracing::debug!(
            photos = batch.len(),
            faces = embeddings.len(),
            "Committed scan batch"
        );
        Ok(face_ids)
    }

    /// Ids of every face row, ascending.
    pub fn all_face_ids(&self) -> Result<Vec<i64>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT face_id FROM faces ORDER BY face_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn face_record(&self, face_id: i64) -> Result<Option<FaceRecord>> {
        let conn = self.reader()?;
        let result = conn.query_row(
            r#"
            SELECT f.face_id, f.photo_id, f.bbox_x1, f.bbox_y1, f.bbox_x2, f.bbox_y2,
                   p.file_path
            FROM faces f
            JOIN photos p ON p.photo_id = f.photo_id
            WHERE f.face_id = ?
            "#,
            [face_id],
            |row| {
                Ok(FaceRecord {
                    face: face_from_row(row, 0)?,
                    file_path: row.get(6)?,
                })
            },
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn faces_for_photo(&self, photo_id: i64) -> Result<Vec<Face>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT face_id, photo_id, bbox_x1, bbox_y1, bbox_x2, bbox_y2
            FROM faces WHERE photo_id = ? ORDER BY face_id
            "#,
        )?;
        let faces = stmt
            .query_map([photo_id], |row| face_from_row(row, 0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(faces)
    }

    pub fn count_faces(&self) -> Result<i64> {
        let conn = self.reader()?;
        let count = conn.query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(count)
    }
}
