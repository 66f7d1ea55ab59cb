//! Sparse similarity graph over unit-norm embeddings.

use ndarray::{s, Array2};
use rayon::prelude::*;

/// Undirected weighted graph as symmetric adjacency lists.
#[derive(Debug, Clone, Default)]
pub struct SimilarityGraph {
    pub adjacency: Vec<Vec<(usize, f32)>>,
}

impl SimilarityGraph {
    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum::<usize>() / 2
    }
}

/// Connect every pair whose cosine similarity is at least `edge_threshold`.
///
/// Rows are processed `block_size` at a time against the whole matrix, so
/// peak memory is `block_size * n` similarities rather than `n * n`. Blocks
/// run on the rayon pool.
pub fn build_graph(embeddings: &Array2<f32>, edge_threshold: f32, block_size: usize) -> SimilarityGraph {
    let n = embeddings.nrows();
    let block_size = block_size.max(1);
    let transposed = embeddings.t();

    let starts: Vec<usize> = (0..n).step_by(block_size).collect();
    let blocks: Vec<Vec<(usize, usize, f32)>> = starts
        .par_iter()
        .map(|&start| {
            let end = (start + block_size).min(n);
            let sims = embeddings.slice(s![start..end, ..]).dot(&transposed);

            let mut edges = Vec::new();
            for (local, row) in sims.outer_iter().enumerate() {
                let i = start + local;
                for (j, &sim) in row.iter().enumerate().skip(i + 1) {
                    if sim >= edge_threshold {
                        edges.push((i, j, sim));
                    }
                }
            }
            edges
        })
        .collect();

    let mut adjacency = vec![Vec::new(); n];
    for (i, j, sim) in blocks.into_iter().flatten() {
        adjacency[i].push((j, sim));
        adjacency[j].push((i, sim));
    }

    SimilarityGraph { adjacency }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_edges_respect_threshold() {
        let emb = array![[1.0f32, 0.0], [0.8, 0.6], [0.0, 1.0]];
        let graph = build_graph(&emb, 0.7, 1000);

        assert_eq!(graph.node_count(), 3);
        // 0-1: 0.8, 1-2: 0.6, 0-2: 0.0
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.adjacency[0].len(), 1);
        assert_eq!(graph.adjacency[0][0].0, 1);
        assert!((graph.adjacency[1][0].1 - 0.8).abs() < 1e-6);
        assert!(graph.adjacency[2].is_empty());
    }

    #[test]
    fn test_block_size_does_not_change_result() {
        let rows: Vec<f32> = (0..20)
            .flat_map(|i| {
                let angle = i as f32 * 0.15;
                [angle.cos(), angle.sin()]
            })
            .collect();
        let emb = Array2::from_shape_vec((20, 2), rows).unwrap();

        let whole = build_graph(&emb, 0.9, 1000);
        let blocked = build_graph(&emb, 0.9, 3);

        assert_eq!(whole.edge_count(), blocked.edge_count());
        for (a, b) in whole.adjacency.iter().zip(&blocked.adjacency) {
            let mut a: Vec<usize> = a.iter().map(|e| e.0).collect();
            let mut b: Vec<usize> = b.iter().map(|e| e.0).collect();
            a.sort();
            b.sort();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_empty_input() {
        let emb = Array2::<f32>::zeros((0, 4));
        assert_eq!(build_graph(&emb, 0.5, 10).node_count(), 0);
    }
}
