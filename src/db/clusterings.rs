use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::faces::face_from_row;
use super::{BoundingBox, Database, UNMATCHED_PERSON};

/// One clustering epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Clustering {
    pub clustering_id: i64,
    /// Membership threshold in percent.
    pub threshold: f64,
    pub created_at: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAssignment {
    pub face_id: i64,
    pub clustering_id: i64,
    pub person_id: i64,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonCount {
    pub person_id: i64,
    pub face_count: i64,
}

/// A face of a person together with its photo, for paginated views.
#[derive(Debug, Clone)]
pub struct PersonPhoto {
    pub face_id: i64,
    pub photo_id: i64,
    pub file_path: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub hidden: bool,
}

/// Everything a clustering run persists, staged before the epoch row exists.
#[derive(Debug, Clone, Default)]
pub struct NewEpoch {
    /// Percent.
    pub threshold: f64,
    /// `(face_id, person_id, confidence)`
    pub assignments: Vec<(i64, i64, f32)>,
    /// Tags propagated to untagged faces; never replace an existing tag.
    pub auto_tags: Vec<(i64, String)>,
    /// Person ids hidden in the new epoch.
    pub hidden_persons: Vec<i64>,
}

impl Database {
    /// The active epoch, served from a short-lived cache.
    pub fn active_clustering(&self) -> Result<Option<Clustering>> {
        if let Some(cached) = self.active_cache().get() {
            return Ok(cached);
        }

        let conn = self.reader()?;
        let active = conn
            .query_row(
                r#"
                SELECT clustering_id, threshold, created_at, is_active
                FROM clusterings WHERE is_active = 1
                ORDER BY clustering_id DESC LIMIT 1
                "#,
                [],
                |row| {
                    Ok(Clustering {
                        clustering_id: row.get(0)?,
                        threshold: row.get(1)?,
                        created_at: row.get(2)?,
                        is_active: row.get(3)?,
                    })
                },
            )
            .optional()?;

        self.active_cache().store(active.clone());
        Ok(active)
    }

    pub fn get_clusterings(&self) -> Result<Vec<Clustering>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT clustering_id, threshold, created_at, is_active FROM clusterings ORDER BY clustering_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Clustering {
                    clustering_id: row.get(0)?,
                    threshold: row.get(1)?,
                    created_at: row.get(2)?,
                    is_active: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Persist a clustering run as the new active epoch.
    ///
    /// One transaction: the previous epoch is deactivated only if the new
    /// epoch with all of its assignments, auto tags and hidden persons
    /// commits. Auto tags of earlier epochs are replaced by this epoch's;
    /// manual tags are never touched. Assignments and tags for faces deleted
    /// since the run loaded its embeddings are skipped.
    pub fn commit_clustering(&self, epoch: &NewEpoch) -> Result<i64> {
        let clustering_id = {
            let mut conn = self.writer()?;
            let tx = conn.transaction()?;

            tx.execute("UPDATE clusterings SET is_active = 0 WHERE is_active = 1", [])?;
            tx.execute(
                "INSERT INTO clusterings (threshold, created_at, is_active) VALUES (?, ?, 1)",
                params![epoch.threshold, Utc::now().to_rfc3339()],
            )?;
            let clustering_id = tx.last_insert_rowid();

            {
                let mut assign = tx.prepare(
                    r#"
                    INSERT INTO cluster_assignments (face_id, clustering_id, person_id, confidence)
                    SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM faces WHERE face_id = ?1)
                    "#,
                )?;
                for (face_id, person_id, confidence) in &epoch.assignments {
                    assign.execute(params![face_id, clustering_id, person_id, confidence])?;
                }

                tx.execute("DELETE FROM face_tags WHERE is_manual = 0", [])?;
                let mut tag = tx.prepare(
                    r#"
                    INSERT OR IGNORE INTO face_tags (face_id, tag_name, is_manual)
                    SELECT ?1, ?2, 0 WHERE EXISTS (SELECT 1 FROM faces WHERE face_id = ?1)
                    "#,
                )?;
                for (face_id, tag_name) in &epoch.auto_tags {
                    tag.execute(params![face_id, tag_name])?;
                }

                let mut hide = tx.prepare(
                    "INSERT OR IGNORE INTO hidden_persons (clustering_id, person_id) VALUES (?, ?)",
                )?;
                for person_id in &epoch.hidden_persons {
                    if *person_id != UNMATCHED_PERSON {
                        hide.execute(params![clustering_id, person_id])?;
                    }
                }
            }

            tx.commit()?;
            clustering_id
        };

        self.active_cache().invalidate();

        tracing::info!(
            clustering_id,
            assignments = epoch.assignments.len(),
            auto_tags = epoch.auto_tags.len(),
            hidden = epoch.hidden_persons.len(),
            "Committed clustering epoch"
        );
        Ok(clustering_id)
    }

    pub fn assignments_for(&self, clustering_id: i64) -> Result<Vec<ClusterAssignment>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT ca.face_id, ca.clustering_id, ca.person_id, ca.confidence
            FROM cluster_assignments ca
            JOIN faces f ON f.face_id = ca.face_id
            WHERE ca.clustering_id = ?
            ORDER BY ca.face_id
            "#,
        )?;
        let rows = stmt
            .query_map([clustering_id], |row| {
                Ok(ClusterAssignment {
                    face_id: row.get(0)?,
                    clustering_id: row.get(1)?,
                    person_id: row.get(2)?,
                    confidence: row.get(3)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Persons of an epoch with face counts, unmatched (0) included.
    pub fn persons_in_clustering(&self, clustering_id: i64) -> Result<Vec<PersonCount>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT ca.person_id, COUNT(*)
            FROM cluster_assignments ca
            JOIN faces f ON f.face_id = ca.face_id
            WHERE ca.clustering_id = ?
            GROUP BY ca.person_id
            ORDER BY ca.person_id
            "#,
        )?;
        let rows = stmt
            .query_map([clustering_id], |row| {
                Ok(PersonCount {
                    person_id: row.get(0)?,
                    face_count: row.get(1)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn face_ids_for_person(&self, clustering_id: i64, person_id: i64) -> Result<Vec<i64>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT ca.face_id
            FROM cluster_assignments ca
            JOIN faces f ON f.face_id = ca.face_id
            WHERE ca.clustering_id = ? AND ca.person_id = ?
            ORDER BY ca.face_id
            "#,
        )?;
        let ids = stmt
            .query_map(params![clustering_id, person_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// One page of a person's faces, best match first, plus the total count
    /// under the same hidden-photo filter.
    pub fn photos_for_person(
        &self,
        clustering_id: i64,
        person_id: i64,
        limit: usize,
        offset: usize,
        include_hidden: bool,
    ) -> Result<(Vec<PersonPhoto>, i64)> {
        let conn = self.reader()?;
        let hidden_filter = if include_hidden {
            ""
        } else {
            "AND hp.face_id IS NULL"
        };

        let total: i64 = conn.query_row(
            &format!(
                r#"
                SELECT COUNT(*)
                FROM cluster_assignments ca
                JOIN faces f ON f.face_id = ca.face_id
                LEFT JOIN hidden_photos hp ON hp.face_id = ca.face_id
                WHERE ca.clustering_id = ? AND ca.person_id = ? {}
                "#,
                hidden_filter
            ),
            params![clustering_id, person_id],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT f.face_id, f.photo_id, f.bbox_x1, f.bbox_y1, f.bbox_x2, f.bbox_y2,
                   p.file_path, ca.confidence, hp.face_id IS NOT NULL
            FROM cluster_assignments ca
            JOIN faces f ON f.face_id = ca.face_id
            JOIN photos p ON p.photo_id = f.photo_id
            LEFT JOIN hidden_photos hp ON hp.face_id = ca.face_id
            WHERE ca.clustering_id = ? AND ca.person_id = ? {}
            ORDER BY ca.confidence DESC, f.face_id
            LIMIT ? OFFSET ?
            "#,
            hidden_filter
        ))?;
        let photos = stmt
            .query_map(
                params![clustering_id, person_id, limit as i64, offset as i64],
                |row| {
                    let face = face_from_row(row, 0)?;
                    Ok(PersonPhoto {
                        face_id: face.face_id,
                        photo_id: face.photo_id,
                        bbox: face.bbox,
                        file_path: row.get(6)?,
                        confidence: row.get(7)?,
                        hidden: row.get(8)?,
                    })
                },
            )?
            .filter_map(|r| r.ok())
            .collect();

        Ok((photos, total))
    }

    /// Faces with no assignment in `clustering_id`, i.e. faces committed
    /// after that epoch was computed.
    pub fn count_unassigned_faces(&self, clustering_id: i64) -> Result<i64> {
        let conn = self.reader()?;
        let count = conn.query_row(
            r#"
            SELECT COUNT(*) FROM faces f
            WHERE NOT EXISTS (
                SELECT 1 FROM cluster_assignments ca
                WHERE ca.face_id = f.face_id AND ca.clustering_id = ?
            )
            "#,
            params![clustering_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Drop assignments whose face row is gone. Returns rows removed.
    pub fn prune_stale_assignments(&self) -> Result<usize> {
        let conn = self.writer()?;
        let removed = conn.execute(
            "DELETE FROM cluster_assignments WHERE face_id NOT IN (SELECT face_id FROM faces)",
            [],
        )?;
        if removed > 0 {
            tracing::info!(removed, "Pruned stale cluster assignments");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;

    fn epoch(assignments: Vec<(i64, i64, f32)>) -> NewEpoch {
        NewEpoch {
            threshold: 50.0,
            assignments,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_active_epoch() {
        let (_dir, db, store) = open_stores();
        let faces = add_photo_with_faces(&db, &store, "/p/a.jpg", &[unit(&[1.0, 0.0])]);
        assert!(db.active_clustering().unwrap().is_none());

        let first = db.commit_clustering(&epoch(vec![(faces[0], 1, 0.9)])).unwrap();
        assert_eq!(db.active_clustering().unwrap().unwrap().clustering_id, first);

        let second = db.commit_clustering(&epoch(vec![(faces[0], 0, 0.0)])).unwrap();
        let active: Vec<_> = db
            .get_clusterings()
            .unwrap()
            .into_iter()
            .filter(|c| c.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].clustering_id, second);
        assert_eq!(db.active_clustering().unwrap().unwrap().clustering_id, second);
    }

    #[test]
    fn test_assignments_for_missing_faces_are_skipped() {
        let (_dir, db, store) = open_stores();
        let faces = add_photo_with_faces(&db, &store, "/p/a.jpg", &[unit(&[1.0, 0.0])]);

        let id = db
            .commit_clustering(&NewEpoch {
                threshold: 50.0,
                assignments: vec![(faces[0], 1, 0.9), (4242, 1, 0.9)],
                auto_tags: vec![(4242, "Ghost".to_string())],
                hidden_persons: vec![0, 1],
            })
            .unwrap();

        assert_eq!(db.assignments_for(id).unwrap().len(), 1);
        assert!(db.all_face_tags().unwrap().is_empty());
        assert_eq!(db.hidden_persons(id).unwrap(), vec![1]);
    }

    #[test]
    fn test_auto_tags_do_not_overwrite() {
        let (_dir, db, store) = open_stores();
        let faces = add_photo_with_faces(
            &db,
            &store,
            "/p/a.jpg",
            &[unit(&[1.0, 0.0]), unit(&[1.0, 0.1])],
        );
        db.tag_faces(&faces[..1], "Alice").unwrap();

        db.commit_clustering(&NewEpoch {
            threshold: 50.0,
            assignments: vec![(faces[0], 1, 0.9), (faces[1], 1, 0.9)],
            auto_tags: vec![(faces[0], "Bob".to_string()), (faces[1], "Alice".to_string())],
            hidden_persons: Vec::new(),
        })
        .unwrap();

        let tags = db.face_tags(&faces).unwrap();
        assert_eq!(tags.get(&faces[0]).map(String::as_str), Some("Alice"));
        assert_eq!(tags.get(&faces[1]).map(String::as_str), Some("Alice"));
    }

    #[test]
    fn test_auto_tags_follow_latest_epoch() {
        let (_dir, db, store) = open_stores();
        let faces = add_photo_with_faces(
            &db,
            &store,
            "/p/a.jpg",
            &[unit(&[1.0, 0.0]), unit(&[1.0, 0.1]), unit(&[1.0, 0.2])],
        );
        db.tag_faces(&faces[..1], "Alice").unwrap();

        db.commit_clustering(&NewEpoch {
            threshold: 50.0,
            assignments: faces.iter().map(|&f| (f, 1, 0.9)).collect(),
            auto_tags: vec![(faces[1], "Alice".to_string()), (faces[2], "Alice".to_string())],
            hidden_persons: Vec::new(),
        })
        .unwrap();
        db.commit_clustering(&NewEpoch {
            threshold: 50.0,
            assignments: vec![(faces[0], 1, 0.9), (faces[1], 1, 0.9), (faces[2], 0, 0.0)],
            auto_tags: vec![(faces[1], "Alice".to_string())],
            hidden_persons: Vec::new(),
        })
        .unwrap();

        let tags = db.face_tags(&faces).unwrap();
        assert_eq!(tags.get(&faces[0]).map(String::as_str), Some("Alice"));
        assert_eq!(tags.get(&faces[1]).map(String::as_str), Some("Alice"));
        assert!(!tags.contains_key(&faces[2]));
        assert_eq!(db.manual_face_tags(&faces).unwrap().len(), 1);
    }

    #[test]
    fn test_unassigned_faces_counted_per_epoch() {
        let (_dir, db, store) = open_stores();
        let first = add_photo_with_faces(&db, &store, "/p/a.jpg", &[unit(&[1.0, 0.0])]);
        let id = db.commit_clustering(&epoch(vec![(first[0], 0, 0.0)])).unwrap();
        assert_eq!(db.count_unassigned_faces(id).unwrap(), 0);

        add_photo_with_faces(&db, &store, "/p/b.jpg", &[unit(&[1.0, 0.1]), unit(&[0.0, 1.0])]);
        assert_eq!(db.count_unassigned_faces(id).unwrap(), 2);
    }

    #[test]
    fn test_person_queries_and_pagination() {
        let (_dir, db, store) = open_stores();
        let mut faces = Vec::new();
        for i in 0..5 {
            faces.extend(add_photo_with_faces(
                &db,
                &store,
                &format!("/p/{}.jpg", i),
                &[unit(&[1.0, i as f32 * 0.01])],
            ));
        }
        let assignments = faces
            .iter()
            .enumerate()
            .map(|(i, &f)| (f, if i < 4 { 1 } else { 0 }, 0.9 - i as f32 * 0.1))
            .collect();
        let id = db.commit_clustering(&epoch(assignments)).unwrap();

        assert_eq!(
            db.persons_in_clustering(id).unwrap(),
            vec![
                PersonCount { person_id: 0, face_count: 1 },
                PersonCount { person_id: 1, face_count: 4 },
            ]
        );
        assert_eq!(db.face_ids_for_person(id, 1).unwrap(), faces[..4].to_vec());

        db.hide_photo(faces[0]).unwrap();
        let (page, total) = db.photos_for_person(id, 1, 2, 0, false).unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].face_id, faces[1]);

        let (page, total) = db.photos_for_person(id, 1, 10, 0, true).unwrap();
        assert_eq!(total, 4);
        assert!(page[0].hidden);
    }
}
