//! Isolation-tree internals for the forest anomaly detector.
//!
//! Each tree recursively partitions a random subsample along random
//! features; anomalous points isolate in fewer splits. Scores follow
//! Liu, Ting & Zhou (2008): s(x, n) = 2^(-E(h(x)) / c(n)).

use ndarray::ArrayView2;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

enum Node {
    Split {
        feature: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

/// A fitted forest of isolation trees.
pub struct Forest {
    trees: Vec<Node>,
    subsample: usize,
}

impl Forest {
    /// Build `n_estimators` trees over random subsamples of `data`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
    pub fn fit(
        data: ArrayView2<'_, f64>,
        n_estimators: usize,
        max_samples: usize,
        seed: u64,
    ) -> Self {
        let n = data.nrows();
        let subsample = max_samples.clamp(2, n.max(2)).min(n.max(2));
        let max_depth = (subsample as f64).log2().ceil() as usize;

        let mut rng = SmallRng::seed_from_u64(seed);
        let mut indices: Vec<usize> = (0..n).collect();
        let trees = (0..n_estimators.max(1))
            .map(|_| {
                indices.shuffle(&mut rng);
                let rows: Vec<usize> = indices.iter().copied().take(subsample).collect();
                build_tree(data, &rows, max_depth, &mut rng)
            })
            .collect();

        Self { trees, subsample }
    }

    /// Anomaly score in [0, 1] for each row; higher is more anomalous.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scores(&self, data: ArrayView2<'_, f64>) -> Vec<f64> {
        let cn = c_factor(self.subsample);
        data.rows()
            .into_iter()
            .map(|row| {
                let point: Vec<f64> = row.to_vec();
                let avg_path: f64 = self
                    .trees
                    .iter()
                    .map(|tree| path_length(&point, tree, 0))
                    .sum::<f64>()
                    / self.trees.len() as f64;
                if cn > 0.0 {
                    2.0f64.powf(-avg_path / cn)
                } else {
                    0.5
                }
            })
            .collect()
    }
}

fn build_tree(
    data: ArrayView2<'_, f64>,
    rows: &[usize],
    depth_left: usize,
    rng: &mut SmallRng,
) -> Node {
    let n = rows.len();
    if n <= 1 || depth_left == 0 {
        return Node::Leaf { size: n };
    }

    let feature = rng.gen_range(0..data.ncols());
    let mut min_val = f64::INFINITY;
    let mut max_val = f64::NEG_INFINITY;
    for &r in rows {
        let v = data[[r, feature]];
        min_val = min_val.min(v);
        max_val = max_val.max(v);
    }
    // Constant feature in this subsample: nothing to split on
    if (max_val - min_val).abs() < 1e-15 {
        return Node::Leaf { size: n };
    }

    let value = rng.gen_range(min_val..max_val);
    let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
        rows.iter().partition(|&&r| data[[r, feature]] < value);
    if left_rows.is_empty() || right_rows.is_empty() {
        return Node::Leaf { size: n };
    }

    Node::Split {
        feature,
        value,
        left: Box::new(build_tree(data, &left_rows, depth_left - 1, rng)),
        right: Box::new(build_tree(data, &right_rows, depth_left - 1, rng)),
    }
}

#[allow(clippy::cast_precision_loss)]
fn path_length(point: &[f64], node: &Node, depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + c_factor(*size),
        Node::Split {
            feature,
            value,
            left,
            right,
        } => {
            if point[*feature] < *value {
                path_length(point, left, depth + 1)
            } else {
                path_length(point, right, depth + 1)
            }
        }
    }
}

/// Expected unsuccessful-search depth in a BST of size n:
/// c(n) = 2H(n-1) - 2(n-1)/n, with H(i) ~ ln(i) + gamma.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn c_factor(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    if n == 2 {
        return 1.0;
    }
    let n_f = n as f64;
    let harmonic = (n_f - 1.0).ln() + 0.577_215_664_9;
    2.0 * harmonic - 2.0 * (n_f - 1.0) / n_f
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn cluster_with_outlier() -> Array2<f64> {
        let mut rows: Vec<[f64; 2]> = (0..40)
            .map(|i| {
                [
                    5.0 + (i % 7) as f64 * 0.2,
                    5.0 + (i % 5) as f64 * 0.3,
                ]
            })
            .collect();
        rows.push([50.0, 50.0]);
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Array2::from_shape_vec((rows.len(), 2), flat).unwrap()
    }

    #[test]
    fn test_outlier_scores_highest() {
        let data = cluster_with_outlier();
        let forest = Forest::fit(data.view(), 100, 256, 42);
        let scores = forest.scores(data.view());

        let max_idx = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(max_idx, 40);
        assert!(scores[40] > 0.5);
    }

    #[test]
    fn test_scores_in_unit_range() {
        let data = cluster_with_outlier();
        let forest = Forest::fit(data.view(), 50, 64, 42);
        for &s in &forest.scores(data.view()) {
            assert!((0.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn test_seeded_reproducibility() {
        let data = cluster_with_outlier();
        let a = Forest::fit(data.view(), 50, 64, 7).scores(data.view());
        let b = Forest::fit(data.view(), 50, 64, 7).scores(data.view());
        assert_eq!(a, b);
    }

    #[test]
    fn test_c_factor_known_values() {
        assert!((c_factor(1) - 0.0).abs() < f64::EPSILON);
        assert!((c_factor(2) - 1.0).abs() < f64::EPSILON);
        assert!((c_factor(256) - 10.244).abs() < 0.1);
    }
}
