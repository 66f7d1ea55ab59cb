//! Read-side views and user actions on persons of the active epoch.

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::db::{Clustering, Database, PersonPhoto, UNMATCHED_PERSON};

pub const UNMATCHED_NAME: &str = "Unmatched Faces";

/// A person of the active epoch as shown in a people list.
#[derive(Debug, Clone)]
pub struct PersonSummary {
    pub clustering_id: i64,
    pub person_id: i64,
    /// Dominant tag, if any face of the person is tagged.
    pub tag: Option<String>,
    /// Tag, `Person N`, or `Unmatched Faces`; `(hidden)` appended when hidden.
    pub display_name: String,
    pub face_count: usize,
    pub tagged_count: usize,
    pub hidden: bool,
    /// Primary face for the tag, else the person's best face.
    pub representative_face: Option<i64>,
}

/// One page of a person's faces.
#[derive(Debug, Clone)]
pub struct PersonPage {
    pub photos: Vec<PersonPhoto>,
    pub total: usize,
    pub page: usize,
    pub pages: usize,
}

pub struct People {
    db: Arc<Database>,
}

impl People {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn require_active(&self) -> Result<Clustering> {
        match self.db.active_clustering()? {
            Some(c) => Ok(c),
            None => bail!("No clustering available yet"),
        }
    }

    pub fn list_people(&self, show_hidden: bool) -> Result<Vec<PersonSummary>> {
        let Some(clustering) = self.db.active_clustering()? else {
            return Ok(Vec::new());
        };
        let clustering_id = clustering.clustering_id;
        let hidden = self.db.hidden_persons(clustering_id)?;

        let mut people = Vec::new();
        for person in self.db.persons_in_clustering(clustering_id)? {
            let person_id = person.person_id;
            let is_hidden = hidden.contains(&person_id);
            if is_hidden && !show_hidden {
                continue;
            }

            let summary = self.db.person_tag_summary(clustering_id, person_id)?;
            let tag = if person_id == UNMATCHED_PERSON {
                None
            } else {
                summary.dominant
            };

            let mut display_name = match (&tag, person_id) {
                (_, UNMATCHED_PERSON) => UNMATCHED_NAME.to_string(),
                (Some(name), _) => name.clone(),
                (None, id) => format!("Person {}", id),
            };
            if is_hidden {
                display_name.push_str(" (hidden)");
            }

            let mut representative_face = match &tag {
                Some(name) => self.db.primary_face_for_tag(name)?,
                None => None,
            };
            if representative_face.is_none() {
                let (first, _) = self.db.photos_for_person(clustering_id, person_id, 1, 0, true)?;
                representative_face = first.first().map(|p| p.face_id);
            }

            people.push(PersonSummary {
                clustering_id,
                person_id,
                tag,
                display_name,
                face_count: person.face_count as usize,
                tagged_count: summary.tagged_count,
                hidden: is_hidden,
                representative_face,
            });
        }

        Ok(people)
    }

    /// Zero-based page of a person's faces, best match first.
    pub fn photos_for_person(
        &self,
        person_id: i64,
        page: usize,
        page_size: usize,
        show_hidden_photos: bool,
    ) -> Result<PersonPage> {
        let clustering = self.require_active()?;
        let page_size = page_size.max(1);

        let (photos, total) = self.db.photos_for_person(
            clustering.clustering_id,
            person_id,
            page_size,
            page * page_size,
            show_hidden_photos,
        )?;
        let total = total as usize;

        Ok(PersonPage {
            photos,
            total,
            page,
            pages: total.div_ceil(page_size),
        })
    }

    /// Tag every face of the person with `name`. Returns faces tagged.
    pub fn rename_person(&self, person_id: i64, name: &str) -> Result<usize> {
        let name = name.trim();
        if name.is_empty() {
            bail!("Name cannot be empty");
        }
        if person_id == UNMATCHED_PERSON {
            bail!("Unmatched faces cannot be named as one person");
        }

        let clustering = self.require_active()?;
        let faces = self.db.face_ids_for_person(clustering.clustering_id, person_id)?;
        self.db.tag_faces(&faces, name)?;

        tracing::info!(person_id, name, faces = faces.len(), "Person renamed");
        Ok(faces.len())
    }

    /// Remove tags from every face of the person. Returns faces untagged.
    pub fn untag_person(&self, person_id: i64) -> Result<usize> {
        let clustering = self.require_active()?;
        let faces = self.db.face_ids_for_person(clustering.clustering_id, person_id)?;
        self.db.untag_faces(&faces)?;
        Ok(faces.len())
    }

    /// Make `face_id` the representative face of the person's tag.
    pub fn set_primary_photo(&self, person_id: i64, face_id: i64) -> Result<()> {
        let clustering = self.require_active()?;
        if person_id == UNMATCHED_PERSON {
            bail!("Unmatched faces have no name to attach a photo to");
        }

        let Some(tag) = self
            .db
            .person_tag_summary(clustering.clustering_id, person_id)?
            .dominant
        else {
            bail!("Name this person before choosing a primary photo");
        };

        self.db.set_primary_face_for_tag(&tag, face_id)
    }

    pub fn hide_person(&self, person_id: i64) -> Result<()> {
        let clustering = self.require_active()?;
        self.db.hide_person(clustering.clustering_id, person_id)
    }

    pub fn unhide_person(&self, person_id: i64) -> Result<()> {
        let clustering = self.require_active()?;
        self.db.unhide_person(clustering.clustering_id, person_id)
    }

    pub fn hide_photo(&self, face_id: i64) -> Result<()> {
        self.db.hide_photo(face_id)
    }

    pub fn unhide_photo(&self, face_id: i64) -> Result<()> {
        self.db.unhide_photo(face_id)
    }
}
