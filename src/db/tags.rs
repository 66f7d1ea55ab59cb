//! Face tags, primary faces for tags, and hidden state.

use anyhow::{bail, Result};
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::collections::HashMap;

use super::batch::IdFilter;
use super::{Database, UNMATCHED_PERSON};

/// Tag counts among the faces of one person.
#[derive(Debug, Clone, PartialEq)]
pub struct TagSummary {
    /// Most common tag; ties go to the lexicographically smallest name.
    pub dominant: Option<String>,
    pub tagged_count: usize,
    pub total_count: usize,
    /// `(tag, count)`, most common first.
    pub tags: Vec<(String, usize)>,
}

impl Database {
    // ========================================================================
    // Face tags
    // ========================================================================

    /// Tag faces manually, replacing any earlier tag on them.
    pub fn tag_faces(&self, face_ids: &[i64], tag_name: &str) -> Result<()> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO face_tags (face_id, tag_name, is_manual) VALUES (?, ?, 1)",
            )?;
            for face_id in face_ids {
                stmt.execute(params![face_id, tag_name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn untag_faces(&self, face_ids: &[i64]) -> Result<()> {
        if face_ids.is_empty() {
            return Ok(());
        }
        let conn = self.writer()?;
        let filter = IdFilter::build(&conn, face_ids)?;
        conn.execute(
            &format!("DELETE FROM face_tags WHERE face_id IN {}", filter.clause),
            params_from_iter(filter.params.iter()),
        )?;
        Ok(())
    }

    /// Tags of the given faces; untagged faces are absent from the map.
    pub fn face_tags(&self, face_ids: &[i64]) -> Result<HashMap<i64, String>> {
        self.select_face_tags(face_ids, false)
    }

    /// Only the tags a user set. Tags written by propagation are left out.
    pub fn manual_face_tags(&self, face_ids: &[i64]) -> Result<HashMap<i64, String>> {
        self.select_face_tags(face_ids, true)
    }

    fn select_face_tags(&self, face_ids: &[i64], manual_only: bool) -> Result<HashMap<i64, String>> {
        if face_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.reader()?;
        let filter = IdFilter::build(&conn, face_ids)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT face_id, tag_name FROM face_tags WHERE face_id IN {}{}",
            filter.clause,
            if manual_only { " AND is_manual = 1" } else { "" }
        ))?;
        let tags = stmt
            .query_map(params_from_iter(filter.params.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tags)
    }

    pub fn all_face_tags(&self) -> Result<HashMap<i64, String>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT face_id, tag_name FROM face_tags")?;
        let tags = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tags)
    }

    pub fn person_tag_summary(&self, clustering_id: i64, person_id: i64) -> Result<TagSummary> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT ft.tag_name
            FROM cluster_assignments ca
            JOIN faces f ON f.face_id = ca.face_id
            LEFT JOIN face_tags ft ON ft.face_id = ca.face_id
            WHERE ca.clustering_id = ? AND ca.person_id = ?
            "#,
        )?;
        let tags: Vec<Option<String>> = stmt
            .query_map(params![clustering_id, person_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for tag in tags.iter().flatten() {
            *counts.entry(tag.clone()).or_insert(0) += 1;
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Ok(TagSummary {
            dominant: ranked.first().map(|(name, _)| name.clone()),
            tagged_count: ranked.iter().map(|(_, n)| n).sum(),
            total_count: tags.len(),
            tags: ranked,
        })
    }

    // ========================================================================
    // Primary face per tag
    // ========================================================================

    pub fn set_primary_face_for_tag(&self, tag_name: &str, face_id: i64) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT OR REPLACE INTO tag_primary_photos (tag_name, face_id) VALUES (?, ?)",
            params![tag_name, face_id],
        )?;
        Ok(())
    }

    /// The chosen face for a tag. A row whose face no longer exists is
    /// deleted and reported as absent.
    pub fn primary_face_for_tag(&self, tag_name: &str) -> Result<Option<i64>> {
        let row: Option<(i64, bool)> = {
            let conn = self.reader()?;
            conn.query_row(
                r#"
                SELECT tp.face_id,
                       EXISTS (SELECT 1 FROM faces f WHERE f.face_id = tp.face_id)
                FROM tag_primary_photos tp WHERE tp.tag_name = ?
                "#,
                [tag_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        match row {
            Some((face_id, true)) => Ok(Some(face_id)),
            Some((face_id, false)) => {
                tracing::debug!(tag = tag_name, face_id, "Dropping stale primary face");
                let conn = self.writer()?;
                conn.execute("DELETE FROM tag_primary_photos WHERE tag_name = ?", [tag_name])?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Hidden persons and photos
    // ========================================================================

    pub fn hide_person(&self, clustering_id: i64, person_id: i64) -> Result<()> {
        if person_id == UNMATCHED_PERSON {
            bail!("Unmatched faces cannot be hidden as a person");
        }
        let conn = self.writer()?;
        conn.execute(
            "INSERT OR IGNORE INTO hidden_persons (clustering_id, person_id) VALUES (?, ?)",
            params![clustering_id, person_id],
        )?;
        Ok(())
    }

    pub fn unhide_person(&self, clustering_id: i64, person_id: i64) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "DELETE FROM hidden_persons WHERE clustering_id = ? AND person_id = ?",
            params![clustering_id, person_id],
        )?;
        Ok(())
    }

    pub fn hidden_persons(&self, clustering_id: i64) -> Result<Vec<i64>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT person_id FROM hidden_persons WHERE clustering_id = ? ORDER BY person_id",
        )?;
        let ids = stmt
            .query_map([clustering_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Faces that belong to a hidden person of `clustering_id`.
    pub fn hidden_face_ids(&self, clustering_id: i64) -> Result<Vec<i64>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT ca.face_id
            FROM cluster_assignments ca
            JOIN hidden_persons hp
              ON hp.clustering_id = ca.clustering_id AND hp.person_id = ca.person_id
            WHERE ca.clustering_id = ?
            ORDER BY ca.face_id
            "#,
        )?;
        let ids = stmt
            .query_map([clustering_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn hide_photo(&self, face_id: i64) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "INSERT OR IGNORE INTO hidden_photos (face_id) VALUES (?)",
            [face_id],
        )?;
        Ok(())
    }

    pub fn unhide_photo(&self, face_id: i64) -> Result<()> {
        let conn = self.writer()?;
        conn.execute("DELETE FROM hidden_photos WHERE face_id = ?", [face_id])?;
        Ok(())
    }

    pub fn hidden_photos(&self) -> Result<Vec<i64>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare("SELECT face_id FROM hidden_photos ORDER BY face_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }
}
