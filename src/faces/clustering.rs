//! Person clustering over all stored face embeddings.
//!
//! One run builds a similarity graph, propagates labels, validates each
//! group against its centroid, merges groups that share a tag, propagates
//! tags inside groups, and carries hidden persons over from the previous
//! epoch. Everything is staged in memory and committed as one epoch.

use ndarray::{Array1, Array2};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::graph::build_graph;
use super::l2_normalize;
use super::propagation::{propagate, PropagationParams};
use crate::config::ClusteringConfig;
use crate::db::{Database, EmbeddingStore, NewEpoch, UNMATCHED_PERSON};
use crate::error::ClusterError;
use crate::tasks::{report, report_warning, StatusSink};

/// Tuning for one clustering run, thresholds as cosine similarity.
#[derive(Debug, Clone)]
pub struct ClusterParams {
    /// User-facing threshold in percent, stored with the epoch.
    pub threshold_percent: u32,
    /// Centroid membership threshold.
    pub threshold: f32,
    /// Edge admission threshold, `threshold + margin` capped at 1.
    pub edge_threshold: f32,
    pub max_iterations: usize,
    pub convergence_fraction: f64,
    pub block_size: usize,
    pub seed: Option<u64>,
}

impl ClusterParams {
    pub fn from_config(config: &ClusteringConfig, threshold_percent: u32) -> Self {
        let threshold_percent = threshold_percent.clamp(1, 100);
        let threshold = threshold_percent as f32 / 100.0;
        let edge_threshold = (threshold + config.edge_margin as f32 / 100.0).min(1.0);

        Self {
            threshold_percent,
            threshold,
            edge_threshold,
            max_iterations: config.max_iterations,
            convergence_fraction: config.convergence_fraction,
            block_size: config.block_size,
            seed: config.seed,
        }
    }
}

/// Outcome of a clustering run.
#[derive(Debug, Clone, Default)]
pub struct ClusterSummary {
    /// `None` when there was nothing to cluster.
    pub clustering_id: Option<i64>,
    pub faces: usize,
    pub persons: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub iterations: usize,
    pub merged_clusters: usize,
    pub auto_tagged: usize,
    pub hidden_persons: usize,
    pub skipped_embeddings: usize,
}

/// Per-face result: `(person_id, confidence)`, indexed like the embeddings.
pub type Assignment = (i64, f32);

pub struct ClusterEngine {
    db: Arc<Database>,
    store: Arc<EmbeddingStore>,
}

impl ClusterEngine {
    pub fn new(db: Arc<Database>, store: Arc<EmbeddingStore>) -> Self {
        Self { db, store }
    }

    /// Run a full clustering pass and commit it as the new active epoch.
    ///
    /// On any error, or when cancelled, nothing is written and the previous
    /// epoch stays active.
    pub fn run(
        &self,
        params: &ClusterParams,
        sink: &dyn StatusSink,
        cancel: &AtomicBool,
    ) -> Result<ClusterSummary, ClusterError> {
        let started = Instant::now();
        report(sink, "Loading embeddings...");

        // Captured before anything changes so hidden persons can be followed
        // into the new epoch by their faces.
        let previous = self.db.active_clustering()?;
        let hidden_faces: HashSet<i64> = match &previous {
            Some(c) => self.db.hidden_face_ids(c.clustering_id)?.into_iter().collect(),
            None => HashSet::new(),
        };

        let loaded = self.load_embeddings()?;
        if loaded.face_ids.is_empty() {
            report(sink, "No faces found");
            return Ok(ClusterSummary {
                skipped_embeddings: loaded.skipped.len(),
                ..Default::default()
            });
        }
        if !loaded.skipped.is_empty() {
            report_warning(
                sink,
                format!(
                    "Skipped {} faces without a usable embedding",
                    loaded.skipped.len()
                ),
            );
        }

        let face_ids = loaded.face_ids;
        let embeddings = loaded.matrix;
        let n = face_ids.len();

        report(
            sink,
            format!(
                "Clustering {} faces (threshold {}%)...",
                n, params.threshold_percent
            ),
        );

        let graph = build_graph(&embeddings, params.edge_threshold, params.block_size);
        tracing::debug!(nodes = n, edges = graph.edge_count(), "Similarity graph built");

        if cancel.load(Ordering::SeqCst) {
            return Err(ClusterError::Cancelled);
        }

        let seed = params.seed.unwrap_or_else(rand::random);
        tracing::info!(seed, "Label propagation seed");
        let propagation = propagate(
            &graph,
            &PropagationParams {
                max_iterations: params.max_iterations,
                convergence_fraction: params.convergence_fraction,
                seed,
            },
            cancel,
        )
        .ok_or(ClusterError::Cancelled)?;

        report(
            sink,
            format!(
                "Label propagation finished after {} iterations{}",
                propagation.iterations,
                if propagation.converged { "" } else { " (iteration cap reached)" }
            ),
        );

        let mut assignments = validate_clusters(&propagation.labels, &embeddings, params.threshold);

        let tags = self.db.manual_face_tags(&face_ids)?;
        let merged_clusters = merge_by_tags(&mut assignments, &face_ids, &tags);
        let auto_tags = propagate_tags(&assignments, &face_ids, &tags);
        let hidden_persons = carry_hidden(&assignments, &face_ids, &hidden_faces);

        if cancel.load(Ordering::SeqCst) {
            return Err(ClusterError::Cancelled);
        }

        report(sink, "Saving clustering...");
        // Faces that could not take part still get an assignment in the epoch.
        let epoch = NewEpoch {
            threshold: params.threshold_percent as f64,
            assignments: face_ids
                .iter()
                .zip(&assignments)
                .map(|(&face_id, &(person_id, confidence))| (face_id, person_id, confidence))
                .chain(
                    loaded
                        .skipped
                        .iter()
                        .map(|&face_id| (face_id, UNMATCHED_PERSON, 0.0)),
                )
                .collect(),
            auto_tags,
            hidden_persons,
        };
        let clustering_id = self.db.commit_clustering(&epoch)?;

        let persons: BTreeSet<i64> = assignments
            .iter()
            .map(|&(p, _)| p)
            .filter(|&p| p != UNMATCHED_PERSON)
            .collect();
        let matched = assignments.iter().filter(|&&(p, _)| p != UNMATCHED_PERSON).count();

        let faces = n + loaded.skipped.len();

        let summary = ClusterSummary {
            clustering_id: Some(clustering_id),
            faces,
            persons: persons.len(),
            matched,
            unmatched: faces - matched,
            iterations: propagation.iterations,
            merged_clusters,
            auto_tagged: epoch.auto_tags.len(),
            hidden_persons: epoch.hidden_persons.len(),
            skipped_embeddings: loaded.skipped.len(),
        };

        report(sink, "Clustering complete:");
        report(sink, format!("  Total persons: {}", summary.persons));
        report(sink, format!("  Matched faces: {}", summary.matched));
        report(sink, format!("  Unmatched faces: {}", summary.unmatched));
        if merged_clusters > 0 {
            report(sink, format!("  Clusters merged by tag: {}", merged_clusters));
        }
        tracing::info!(
            clustering_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Clustering run finished"
        );

        Ok(summary)
    }

    /// Unit vectors of every live face, in face id order. Live faces without
    /// a usable vector come back in `skipped`; embeddings of deleted faces
    /// are ignored.
    fn load_embeddings(&self) -> Result<LoadedEmbeddings, ClusterError> {
        let live: BTreeSet<i64> = self.db.all_face_ids()?.into_iter().collect();
        let mut rows: Vec<(i64, Vec<f32>)> = Vec::with_capacity(live.len());

        for (face_id, vector) in self.store.load_all()? {
            if !live.contains(&face_id) {
                continue;
            }
            if let Some(v) = l2_normalize(&vector) {
                rows.push((face_id, v));
            }
        }

        if let Some(dim) = majority_dimension(&rows)? {
            let before = rows.len();
            rows.retain(|(_, v)| v.len() == dim);
            if rows.len() < before {
                tracing::warn!(
                    expected = dim,
                    skipped = before - rows.len(),
                    "Skipping embeddings with mismatched dimension"
                );
            }
        }
        let dim = rows.first().map_or(0, |(_, v)| v.len());

        let face_ids: Vec<i64> = rows.iter().map(|(id, _)| *id).collect();
        let loaded: HashSet<i64> = face_ids.iter().copied().collect();
        let skipped: Vec<i64> = live.into_iter().filter(|id| !loaded.contains(id)).collect();

        let flat: Vec<f32> = rows.into_iter().flat_map(|(_, v)| v).collect();
        let matrix = Array2::from_shape_vec((face_ids.len(), dim), flat)
            .map_err(|e| ClusterError::Storage(e.into()))?;

        Ok(LoadedEmbeddings {
            face_ids,
            matrix,
            skipped,
        })
    }
}

struct LoadedEmbeddings {
    face_ids: Vec<i64>,
    matrix: Array2<f32>,
    /// Live faces left out of the matrix.
    skipped: Vec<i64>,
}

/// Dimension shared by more than half of the vectors. Without such a
/// majority the store is inconsistent and clustering refuses to run.
fn majority_dimension(rows: &[(i64, Vec<f32>)]) -> Result<Option<usize>, ClusterError> {
    if rows.is_empty() {
        return Ok(None);
    }

    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for (_, v) in rows {
        *counts.entry(v.len()).or_insert(0) += 1;
    }

    let (dim, count) = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(&d, &c)| (d, c))
        .unwrap_or((0, 0));

    if count * 2 > rows.len() {
        Ok(Some(dim))
    } else {
        Err(ClusterError::DimensionMismatch { expected: dim })
    }
}

/// Turn propagation labels into person ids.
///
/// Groups are visited in label order. A group needs at least two members
/// whose similarity to the group's renormalized centroid reaches
/// `threshold`; those members get the next person id. Their confidence is
/// the similarity to the centroid of the survivors alone, so rejected
/// outliers do not drag it down. Everyone else is unmatched with
/// confidence 0.
pub fn validate_clusters(labels: &[usize], embeddings: &Array2<f32>, threshold: f32) -> Vec<Assignment> {
    let mut assignments = vec![(UNMATCHED_PERSON, 0.0f32); labels.len()];

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (idx, &label) in labels.iter().enumerate() {
        groups.entry(label).or_default().push(idx);
    }

    let mut next_person = 1i64;
    for members in groups.values() {
        if members.len() < 2 {
            continue;
        }

        let Some(centroid) = unit_mean(members, embeddings) else {
            continue;
        };
        let survivors: Vec<usize> = members
            .iter()
            .copied()
            .filter(|&i| embeddings.row(i).dot(&centroid) >= threshold)
            .collect();

        if survivors.len() < 2 {
            continue;
        }
        let Some(centroid) = unit_mean(&survivors, embeddings) else {
            continue;
        };

        for i in survivors {
            let sim = embeddings.row(i).dot(&centroid);
            assignments[i] = (next_person, sim.clamp(0.0, 1.0));
        }
        next_person += 1;
    }

    assignments
}

/// Renormalized mean of the given rows; `None` if they cancel out.
fn unit_mean(rows: &[usize], embeddings: &Array2<f32>) -> Option<Array1<f32>> {
    let mut sum = Array1::<f32>::zeros(embeddings.ncols());
    for &i in rows {
        sum += &embeddings.row(i);
    }
    l2_normalize(&sum.to_vec()).map(Array1::from)
}

/// Merge persons that share a tag into the person holding most of that
/// tag's faces. Ties go to the smaller person id. Unmatched faces are left
/// alone. Returns the number of persons merged away.
pub fn merge_by_tags(
    assignments: &mut [Assignment],
    face_ids: &[i64],
    tags: &HashMap<i64, String>,
) -> usize {
    let mut by_tag: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, face_id) in face_ids.iter().enumerate() {
        if let Some(tag) = tags.get(face_id) {
            by_tag.entry(tag.as_str()).or_default().push(idx);
        }
    }

    let mut merged = 0;
    for (tag, indices) in by_tag {
        let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
        for &idx in &indices {
            let person = assignments[idx].0;
            if person != UNMATCHED_PERSON {
                *counts.entry(person).or_insert(0) += 1;
            }
        }
        if counts.len() < 2 {
            continue;
        }

        let Some((&target, _)) = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        else {
            continue;
        };

        let sources: HashSet<i64> = counts.keys().copied().filter(|&p| p != target).collect();
        for assignment in assignments.iter_mut() {
            if sources.contains(&assignment.0) {
                assignment.0 = target;
            }
        }

        tracing::debug!(tag, into = target, merged = ?sources, "Merged persons sharing a tag");
        merged += sources.len();
    }

    merged
}

/// Tags for untagged faces of persons that already have tagged faces: the
/// most common tag in the person, ties to the smallest name.
pub fn propagate_tags(
    assignments: &[Assignment],
    face_ids: &[i64],
    tags: &HashMap<i64, String>,
) -> Vec<(i64, String)> {
    let mut persons: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (idx, &(person, _)) in assignments.iter().enumerate() {
        if person != UNMATCHED_PERSON {
            persons.entry(person).or_default().push(idx);
        }
    }

    let mut auto_tags = Vec::new();
    for members in persons.values() {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for &idx in members {
            if let Some(tag) = tags.get(&face_ids[idx]) {
                *counts.entry(tag.as_str()).or_insert(0) += 1;
            }
        }

        let Some((dominant, _)) = counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        else {
            continue;
        };

        for &idx in members {
            let face_id = face_ids[idx];
            if !tags.contains_key(&face_id) {
                auto_tags.push((face_id, dominant.to_string()));
            }
        }
    }

    auto_tags
}

/// Person ids of the new epoch that contain any previously hidden face.
pub fn carry_hidden(
    assignments: &[Assignment],
    face_ids: &[i64],
    hidden_faces: &HashSet<i64>,
) -> Vec<i64> {
    let persons: BTreeSet<i64> = face_ids
        .iter()
        .zip(assignments)
        .filter(|(face_id, _)| hidden_faces.contains(face_id))
        .map(|(_, &(person, _))| person)
        .filter(|&person| person != UNMATCHED_PERSON)
        .collect();
    persons.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::*;
    use crate::tasks::ChannelSink;
    use ndarray::array;

    fn params(percent: u32) -> ClusterParams {
        let config = ClusteringConfig {
            seed: Some(7),
            ..Default::default()
        };
        ClusterParams::from_config(&config, percent)
    }

    fn engine(db: Database, store: EmbeddingStore) -> (ClusterEngine, Arc<Database>) {
        let db = Arc::new(db);
        (ClusterEngine::new(db.clone(), Arc::new(store)), db)
    }

    fn run(engine: &ClusterEngine, percent: u32) -> ClusterSummary {
        let (sink, _rx) = ChannelSink::new();
        engine.run(&params(percent), &sink, &AtomicBool::new(false)).unwrap()
    }

    fn person_of(db: &Database, clustering_id: i64, face_id: i64) -> (i64, f32) {
        db.assignments_for(clustering_id)
            .unwrap()
            .into_iter()
            .find(|a| a.face_id == face_id)
            .map(|a| (a.person_id, a.confidence))
            .unwrap()
    }

    /// Unit vector near axis `axis` of an 8-d space, nudged along `nudge`.
    fn near_axis(axis: usize, nudge: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; 8];
        v[axis] = 1.0;
        v[nudge] += 0.1;
        unit(&v)
    }

    #[test]
    fn test_params_from_percent() {
        let p = params(50);
        assert!((p.threshold - 0.5).abs() < 1e-6);
        assert!((p.edge_threshold - 0.55).abs() < 1e-6);
        assert!((params(98).edge_threshold - 1.0).abs() < 1e-6);
        assert_eq!(params(0).threshold_percent, 1);
    }

    #[test]
    fn test_validate_rejects_outliers_and_singletons() {
        let emb = array![
            [1.0f32, 0.0, 0.0],
            [0.99, 0.141, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 1.0, 0.0],
        ];
        // Propagation put 0, 1 and the unrelated 2 together; 3 alone.
        let labels = vec![5, 5, 5, 9];
        let out = validate_clusters(&labels, &emb, 0.7);

        assert_eq!(out[0].0, 1);
        assert_eq!(out[1].0, 1);
        assert_eq!(out[2], (UNMATCHED_PERSON, 0.0));
        assert_eq!(out[3], (UNMATCHED_PERSON, 0.0));

        // Scored against the pair's own centroid, not one pulled toward face 2.
        assert!(out[0].1 > 0.99, "confidence {}", out[0].1);
        assert!(out[1].1 > 0.99, "confidence {}", out[1].1);
    }

    #[test]
    fn test_validate_needs_two_survivors() {
        let emb = array![[1.0f32, 0.0], [0.0, 1.0]];
        let out = validate_clusters(&[0, 0], &emb, 0.9);
        assert!(out.iter().all(|&(p, c)| p == UNMATCHED_PERSON && c == 0.0));
    }

    #[test]
    fn test_merge_majority_wins() {
        let face_ids = vec![10, 11, 12, 13, 14];
        let mut assignments = vec![(5, 0.9), (5, 0.9), (5, 0.9), (7, 0.9), (7, 0.9)];
        let tags: HashMap<i64, String> = [10, 11, 12, 13]
            .iter()
            .map(|&f| (f, "Bob".to_string()))
            .collect();

        assert_eq!(merge_by_tags(&mut assignments, &face_ids, &tags), 1);
        assert!(assignments.iter().all(|&(p, _)| p == 5));
    }

    #[test]
    fn test_merge_tie_goes_to_smaller_person() {
        let face_ids = vec![1, 2];
        let mut assignments = vec![(4, 0.9), (2, 0.9)];
        let tags: HashMap<i64, String> =
            [(1, "Ann".to_string()), (2, "Ann".to_string())].into_iter().collect();

        merge_by_tags(&mut assignments, &face_ids, &tags);
        assert_eq!(assignments, vec![(2, 0.9), (2, 0.9)]);
    }

    #[test]
    fn test_propagate_tags_never_overwrites() {
        let face_ids = vec![1, 2, 3, 4];
        let assignments = vec![(1, 0.9), (1, 0.9), (1, 0.9), (0, 0.0)];
        let tags: HashMap<i64, String> = [(1, "Alice".to_string())].into_iter().collect();

        let auto = propagate_tags(&assignments, &face_ids, &tags);
        assert_eq!(
            auto,
            vec![(2, "Alice".to_string()), (3, "Alice".to_string())]
        );
    }

    #[test]
    fn test_propagate_tags_tie_is_lexicographic() {
        let face_ids = vec![1, 2, 3];
        let assignments = vec![(1, 0.9), (1, 0.9), (1, 0.9)];
        let tags: HashMap<i64, String> =
            [(1, "Zoe".to_string()), (2, "Amy".to_string())].into_iter().collect();

        assert_eq!(
            propagate_tags(&assignments, &face_ids, &tags),
            vec![(3, "Amy".to_string())]
        );
    }

    #[test]
    fn test_carry_hidden_ignores_unmatched() {
        let face_ids = vec![1, 2, 3];
        let assignments = vec![(4, 0.9), (0, 0.0), (4, 0.9)];
        let hidden: HashSet<i64> = [1, 2].into_iter().collect();

        assert_eq!(carry_hidden(&assignments, &face_ids, &hidden), vec![4]);
    }

    #[test]
    fn test_majority_dimension() {
        let rows = vec![(1, vec![1.0; 4]), (2, vec![1.0; 4]), (3, vec![1.0; 2])];
        assert_eq!(majority_dimension(&rows).unwrap(), Some(4));

        let split = vec![(1, vec![1.0; 4]), (2, vec![1.0; 2])];
        assert!(matches!(
            majority_dimension(&split),
            Err(ClusterError::DimensionMismatch { .. })
        ));
        assert_eq!(majority_dimension(&[]).unwrap(), None);
    }

    #[test]
    fn test_unusable_embeddings_are_unmatched_in_epoch() {
        let (_dir, db, store) = open_stores();
        let fa = add_photo_with_faces(&db, &store, "/p/a.jpg", &[near_axis(0, 1)])[0];
        let fb = add_photo_with_faces(&db, &store, "/p/b.jpg", &[near_axis(0, 2)])[0];
        let fc = add_photo_with_faces(&db, &store, "/p/c.jpg", &[near_axis(0, 3)])[0];
        let short = add_photo_with_faces(&db, &store, "/p/d.jpg", &[unit(&[1.0, 0.0])])[0];
        let zero = add_photo_with_faces(&db, &store, "/p/e.jpg", &[vec![0.0; 8]])[0];

        let (engine, db) = engine(db, store);
        let summary = run(&engine, 50);
        let id = summary.clustering_id.unwrap();

        let assignments = db.assignments_for(id).unwrap();
        assert_eq!(assignments.len() as i64, db.count_faces().unwrap());
        assert_eq!(db.count_unassigned_faces(id).unwrap(), 0);

        assert_eq!(person_of(&db, id, short), (UNMATCHED_PERSON, 0.0));
        assert_eq!(person_of(&db, id, zero), (UNMATCHED_PERSON, 0.0));
        let person = person_of(&db, id, fa).0;
        assert_ne!(person, UNMATCHED_PERSON);
        assert_eq!(person_of(&db, id, fb).0, person);
        assert_eq!(person_of(&db, id, fc).0, person);

        assert_eq!(summary.faces, 5);
        assert_eq!(summary.skipped_embeddings, 2);
        assert_eq!(summary.unmatched, 2);
    }

    #[test]
    fn test_scenario_similar_pair_is_one_person() {
        let (_dir, db, store) = open_stores();
        let a = unit(&[1.0, 0.0]);
        let b = unit(&[0.98, (1.0f32 - 0.98 * 0.98).sqrt()]);
        let fa = add_photo_with_faces(&db, &store, "/p/a.jpg", &[a])[0];
        let fb = add_photo_with_faces(&db, &store, "/p/b.jpg", &[b])[0];

        let (engine, db) = engine(db, store);
        let summary = run(&engine, 50);
        let id = summary.clustering_id.unwrap();

        let (pa, ca) = person_of(&db, id, fa);
        let (pb, cb) = person_of(&db, id, fb);
        assert_eq!(pa, pb);
        assert_ne!(pa, UNMATCHED_PERSON);
        // Both faces sit at cos(theta/2) from the centroid, with cos(theta) = 0.98.
        assert!((ca - 0.995).abs() < 0.01);
        assert!((cb - 0.995).abs() < 0.01);
        assert_eq!(summary.persons, 1);
    }

    #[test]
    fn test_scenario_lonely_face_is_unmatched() {
        let (_dir, db, store) = open_stores();
        let face = add_photo_with_faces(&db, &store, "/p/a.jpg", &[unit(&[1.0, 0.0])])[0];

        let (engine, db) = engine(db, store);
        let id = run(&engine, 50).clustering_id.unwrap();

        assert_eq!(person_of(&db, id, face), (UNMATCHED_PERSON, 0.0));
    }

    #[test]
    fn test_scenario_tag_propagates_to_cluster_mate() {
        let (_dir, db, store) = open_stores();
        let fa = add_photo_with_faces(&db, &store, "/p/a.jpg", &[near_axis(0, 1)])[0];
        let fb = add_photo_with_faces(&db, &store, "/p/b.jpg", &[near_axis(0, 2)])[0];
        db.tag_faces(&[fa], "Alice").unwrap();

        let (engine, db) = engine(db, store);
        run(&engine, 50);

        let tags = db.face_tags(&[fa, fb]).unwrap();
        assert_eq!(tags[&fa], "Alice");
        assert_eq!(tags[&fb], "Alice");
    }

    #[test]
    fn test_scenario_split_tag_is_merged() {
        let (_dir, db, store) = open_stores();
        let group_a: Vec<i64> = (1..4)
            .map(|n| add_photo_with_faces(&db, &store, &format!("/p/a{}.jpg", n), &[near_axis(0, n)])[0])
            .collect();
        let group_b: Vec<i64> = (5..7)
            .map(|n| add_photo_with_faces(&db, &store, &format!("/p/b{}.jpg", n), &[near_axis(4, n)])[0])
            .collect();
        db.tag_faces(&group_a, "Bob").unwrap();
        db.tag_faces(&group_b[..1], "Bob").unwrap();

        let (engine, db) = engine(db, store);
        let summary = run(&engine, 50);
        let id = summary.clustering_id.unwrap();

        let majority = person_of(&db, id, group_a[0]).0;
        assert_ne!(majority, UNMATCHED_PERSON);
        for face in group_a.iter().chain(&group_b) {
            assert_eq!(person_of(&db, id, *face).0, majority);
        }
        assert_eq!(summary.merged_clusters, 1);
        assert_eq!(summary.persons, 1);
    }

    #[test]
    fn test_propagated_tags_do_not_merge_persons() {
        let (_dir, db, store) = open_stores();
        let group_a: Vec<i64> = (1..4)
            .map(|n| add_photo_with_faces(&db, &store, &format!("/p/a{}.jpg", n), &[near_axis(0, n)])[0])
            .collect();
        let group_b: Vec<i64> = (5..8)
            .map(|n| add_photo_with_faces(&db, &store, &format!("/p/b{}.jpg", n), &[near_axis(4, n)])[0])
            .collect();
        db.tag_faces(&group_a[..1], "Carl").unwrap();

        // A stale propagated tag on the other person, as an earlier epoch
        // that lumped both groups together would have left it.
        db.commit_clustering(&NewEpoch {
            threshold: 10.0,
            assignments: group_a.iter().chain(&group_b).map(|&f| (f, 1, 0.5)).collect(),
            auto_tags: group_b.iter().map(|&f| (f, "Carl".to_string())).collect(),
            hidden_persons: Vec::new(),
        })
        .unwrap();

        let (engine, db) = engine(db, store);
        let summary = run(&engine, 50);
        let id = summary.clustering_id.unwrap();

        assert_eq!(summary.merged_clusters, 0);
        assert_eq!(summary.persons, 2);
        assert_ne!(person_of(&db, id, group_a[0]).0, person_of(&db, id, group_b[0]).0);

        let tags = db.face_tags(&group_b).unwrap();
        assert!(tags.is_empty(), "stale tags {:?}", tags);
        let tags = db.face_tags(&group_a).unwrap();
        assert!(group_a.iter().all(|f| tags[f] == "Carl"));
    }

    #[test]
    fn test_threshold_monotonicity() {
        let (_dir, db, store) = open_stores();
        for axis in [0usize, 3, 6] {
            for nudge in 0..8 {
                if nudge == axis {
                    continue;
                }
                let v = near_axis(axis, nudge);
                add_photo_with_faces(&db, &store, &format!("/p/{}-{}.jpg", axis, nudge), &[v]);
            }
        }
        let (engine, db) = engine(db, store);

        let mut previous_max = usize::MAX;
        for percent in [30, 50, 70, 90, 97] {
            let id = run(&engine, percent).clustering_id.unwrap();
            let max = db
                .persons_in_clustering(id)
                .unwrap()
                .into_iter()
                .filter(|p| p.person_id != UNMATCHED_PERSON)
                .map(|p| p.face_count as usize)
                .max()
                .unwrap_or(0);
            assert!(max <= previous_max, "threshold {}%", percent);
            previous_max = max;
        }
    }

    #[test]
    fn test_idempotent_tags_and_single_active_across_runs() {
        let (_dir, db, store) = open_stores();
        let fa = add_photo_with_faces(&db, &store, "/p/a.jpg", &[near_axis(0, 1)])[0];
        add_photo_with_faces(&db, &store, "/p/b.jpg", &[near_axis(0, 2)]);
        db.tag_faces(&[fa], "Alice").unwrap();

        let (engine, db) = engine(db, store);
        for _ in 0..3 {
            run(&engine, 50);
        }

        let active: Vec<_> = db
            .get_clusterings()
            .unwrap()
            .into_iter()
            .filter(|c| c.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(db.face_tags(&[fa]).unwrap()[&fa], "Alice");
    }

    #[test]
    fn test_hidden_person_follows_faces() {
        let (_dir, db, store) = open_stores();
        let faces: Vec<i64> = (1..4)
            .map(|n| add_photo_with_faces(&db, &store, &format!("/p/{}.jpg", n), &[near_axis(0, n)])[0])
            .collect();
        let others: Vec<i64> = (5..8)
            .map(|n| add_photo_with_faces(&db, &store, &format!("/q/{}.jpg", n), &[near_axis(4, n)])[0])
            .collect();

        let (engine, db) = engine(db, store);
        let first = run(&engine, 50).clustering_id.unwrap();
        let hidden_person = person_of(&db, first, faces[0]).0;
        db.hide_person(first, hidden_person).unwrap();

        let second = run(&engine, 60).clustering_id.unwrap();
        let new_person = person_of(&db, second, faces[0]).0;
        let other_person = person_of(&db, second, others[0]).0;

        let hidden = db.hidden_persons(second).unwrap();
        assert!(hidden.contains(&new_person));
        assert!(!hidden.contains(&other_person));
    }

    #[test]
    fn test_empty_store_is_noop() {
        let (_dir, db, store) = open_stores();
        let (engine, db) = engine(db, store);

        let summary = run(&engine, 50);
        assert!(summary.clustering_id.is_none());
        assert!(db.active_clustering().unwrap().is_none());
    }

    #[test]
    fn test_orphan_embeddings_are_ignored() {
        let (_dir, db, store) = open_stores();
        let live = add_photo_with_faces(&db, &store, "/p/a.jpg", &[near_axis(0, 1)])[0];
        store.put(9999, &near_axis(0, 2)).unwrap();

        let (engine, db) = engine(db, store);
        let id = run(&engine, 50).clustering_id.unwrap();

        let assignments = db.assignments_for(id).unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].face_id, live);
    }

    #[test]
    fn test_cancelled_run_keeps_previous_epoch() {
        let (_dir, db, store) = open_stores();
        add_photo_with_faces(&db, &store, "/p/a.jpg", &[near_axis(0, 1)]);
        add_photo_with_faces(&db, &store, "/p/b.jpg", &[near_axis(0, 2)]);

        let (engine, db) = engine(db, store);
        let first = run(&engine, 50).clustering_id.unwrap();

        let (sink, _rx) = ChannelSink::new();
        let result = engine.run(&params(50), &sink, &AtomicBool::new(true));
        assert!(matches!(result, Err(ClusterError::Cancelled)));
        assert_eq!(db.active_clustering().unwrap().unwrap().clustering_id, first);
        assert_eq!(db.get_clusterings().unwrap().len(), 1);
    }
}
