//! Chinese Whispers label propagation.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::graph::SimilarityGraph;

#[derive(Debug, Clone, Copy)]
pub struct PropagationParams {
    pub max_iterations: usize,
    /// Stop once a pass changes fewer than this share of labels.
    pub convergence_fraction: f64,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct Propagation {
    /// Final label per node; labels are node indices.
    pub labels: Vec<usize>,
    pub iterations: usize,
    pub converged: bool,
}

/// Run propagation. Returns `None` if `cancel` was raised between passes.
///
/// Each node starts with its own index as label. Every pass visits nodes in
/// a shuffled order and sets each node's label to the neighbour label with
/// the largest summed edge weight, taking effect immediately for the rest
/// of the pass. Ties go to the smaller label.
pub fn propagate(
    graph: &SimilarityGraph,
    params: &PropagationParams,
    cancel: &AtomicBool,
) -> Option<Propagation> {
    let n = graph.node_count();
    let mut labels: Vec<usize> = (0..n).collect();
    let mut order: Vec<usize> = (0..n).filter(|&i| !graph.adjacency[i].is_empty()).collect();
    let mut rng = StdRng::seed_from_u64(params.seed);
    let min_changes = params.convergence_fraction * n as f64;

    let mut iterations = 0;
    let mut converged = order.is_empty();
    let mut votes: HashMap<usize, f32> = HashMap::new();

    while !converged && iterations < params.max_iterations {
        if cancel.load(Ordering::SeqCst) {
            return None;
        }

        order.shuffle(&mut rng);
        let mut changes = 0usize;

        for &node in &order {
            votes.clear();
            for &(neighbor, weight) in &graph.adjacency[node] {
                *votes.entry(labels[neighbor]).or_insert(0.0) += weight;
            }

            let best = votes
                .iter()
                .max_by(|a, b| {
                    a.1.partial_cmp(b.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.0.cmp(a.0))
                })
                .map(|(&label, _)| label);

            if let Some(label) = best {
                if label != labels[node] {
                    labels[node] = label;
                    changes += 1;
                }
            }
        }

        iterations += 1;
        tracing::trace!(iteration = iterations, changes, "Propagation pass");
        converged = (changes as f64) < min_changes || changes == 0;
    }

    Some(Propagation {
        labels,
        iterations,
        converged,
    })
}
