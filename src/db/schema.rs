pub const SCHEMA: &str = r#"
-- Photos: one row per file path ever discovered
CREATE TABLE IF NOT EXISTS photos (
    photo_id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_path TEXT NOT NULL UNIQUE,
    file_hash TEXT,
    scan_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (scan_status IN ('pending', 'completed', 'error')),
    date_added TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_photos_status ON photos(scan_status);

-- Faces: detected face regions; embeddings live in the embedding store
CREATE TABLE IF NOT EXISTS faces (
    face_id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL,
    bbox_x1 REAL NOT NULL,
    bbox_y1 REAL NOT NULL,
    bbox_x2 REAL NOT NULL,
    bbox_y2 REAL NOT NULL,
    FOREIGN KEY (photo_id) REFERENCES photos(photo_id)
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);

-- Clusterings: one row per clustering epoch, at most one active
CREATE TABLE IF NOT EXISTS clusterings (
    clustering_id INTEGER PRIMARY KEY AUTOINCREMENT,
    threshold REAL NOT NULL,       -- percent, 0-100
    created_at TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_clusterings_single_active
    ON clusterings(is_active) WHERE is_active = 1;

-- Face to person mapping per epoch; person_id 0 means unmatched
CREATE TABLE IF NOT EXISTS cluster_assignments (
    face_id INTEGER NOT NULL,
    clustering_id INTEGER NOT NULL,
    person_id INTEGER NOT NULL,
    confidence REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (face_id, clustering_id),
    FOREIGN KEY (face_id) REFERENCES faces(face_id),
    FOREIGN KEY (clustering_id) REFERENCES clusterings(clustering_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_assignments_person
    ON cluster_assignments(clustering_id, person_id);

-- Persons hidden by the user, scoped to an epoch
CREATE TABLE IF NOT EXISTS hidden_persons (
    clustering_id INTEGER NOT NULL,
    person_id INTEGER NOT NULL,
    PRIMARY KEY (clustering_id, person_id),
    FOREIGN KEY (clustering_id) REFERENCES clusterings(clustering_id) ON DELETE CASCADE
);

-- Faces whose photo is hidden from person views
CREATE TABLE IF NOT EXISTS hidden_photos (
    face_id INTEGER PRIMARY KEY,
    FOREIGN KEY (face_id) REFERENCES faces(face_id)
);

-- User and auto-propagated names; survive re-clustering
CREATE TABLE IF NOT EXISTS face_tags (
    face_id INTEGER PRIMARY KEY,
    tag_name TEXT NOT NULL,
    is_manual INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY (face_id) REFERENCES faces(face_id)
);

CREATE INDEX IF NOT EXISTS idx_face_tags_name ON face_tags(tag_name);

-- Representative face chosen for a tag
CREATE TABLE IF NOT EXISTS tag_primary_photos (
    tag_name TEXT PRIMARY KEY,
    face_id INTEGER NOT NULL,
    FOREIGN KEY (face_id) REFERENCES faces(face_id)
);
"#;
