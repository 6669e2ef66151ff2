//! Cluster validity and embedding quality metrics.
//!
//! All metrics ignore noise points (label -1) and return `None` when fewer
//! than two real clusters remain.

use ndarray::{Array1, ArrayView2};
use std::collections::BTreeMap;

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Distinct non-noise labels with their member row indices, label-sorted.
fn cluster_members(labels: &[i64]) -> BTreeMap<i64, Vec<usize>> {
    let mut members: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        if label >= 0 {
            members.entry(label).or_default().push(i);
        }
    }
    members
}

fn centroid(data: ArrayView2<'_, f64>, rows: &[usize]) -> Array1<f64> {
    let mut c = Array1::zeros(data.ncols());
    for &r in rows {
        c += &data.row(r);
    }
    #[allow(clippy::cast_precision_loss)]
    {
        c /= rows.len() as f64;
    }
    c
}

/// Mean silhouette coefficient over non-noise points.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn silhouette_score(data: ArrayView2<'_, f64>, labels: &[i64]) -> Option<f64> {
    let members = cluster_members(labels);
    if members.len() < 2 {
        return None;
    }

    let mut total = 0.0;
    let mut counted = 0usize;

    for (&label, rows) in &members {
        for &i in rows {
            let point: Vec<f64> = data.row(i).to_vec();

            // a: mean distance to own cluster (excluding self)
            let a = if rows.len() > 1 {
                rows.iter()
                    .filter(|&&j| j != i)
                    .map(|&j| euclidean(&point, &data.row(j).to_vec()))
                    .sum::<f64>()
                    / (rows.len() - 1) as f64
            } else {
                0.0
            };

            // b: smallest mean distance to any other cluster
            let b = members
                .iter()
                .filter(|(&other, _)| other != label)
                .map(|(_, other_rows)| {
                    other_rows
                        .iter()
                        .map(|&j| euclidean(&point, &data.row(j).to_vec()))
                        .sum::<f64>()
                        / other_rows.len() as f64
                })
                .fold(f64::INFINITY, f64::min);

            let denom = a.max(b);
            if denom > 0.0 {
                total += (b - a) / denom;
            }
            counted += 1;
        }
    }

    if counted == 0 {
        None
    } else {
        Some(total / counted as f64)
    }
}

/// Calinski-Harabasz index: between-cluster over within-cluster dispersion.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn calinski_harabasz_score(data: ArrayView2<'_, f64>, labels: &[i64]) -> Option<f64> {
    let members = cluster_members(labels);
    let k = members.len();
    if k < 2 {
        return None;
    }

    let all_rows: Vec<usize> = members.values().flatten().copied().collect();
    let n = all_rows.len();
    if n <= k {
        return None;
    }
    let global = centroid(data, &all_rows);

    let mut between = 0.0;
    let mut within = 0.0;
    for rows in members.values() {
        let c = centroid(data, rows);
        let diff = &c - &global;
        between += rows.len() as f64 * diff.dot(&diff);
        for &r in rows {
            let d = &data.row(r).to_owned() - &c;
            within += d.dot(&d);
        }
    }

    if within <= 0.0 {
        return None;
    }
    Some((between / (k - 1) as f64) / (within / (n - k) as f64))
}

/// Davies-Bouldin index: mean worst-case cluster similarity (lower is better).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn davies_bouldin_score(data: ArrayView2<'_, f64>, labels: &[i64]) -> Option<f64> {
    let members = cluster_members(labels);
    let k = members.len();
    if k < 2 {
        return None;
    }

    let centroids: Vec<Array1<f64>> = members.values().map(|rows| centroid(data, rows)).collect();
    let scatters: Vec<f64> = members
        .values()
        .zip(&centroids)
        .map(|(rows, c)| {
            rows.iter()
                .map(|&r| euclidean(&data.row(r).to_vec(), &c.to_vec()))
                .sum::<f64>()
                / rows.len() as f64
        })
        .collect();

    let mut total = 0.0;
    for i in 0..k {
        let mut worst = 0.0f64;
        for j in 0..k {
            if i == j {
                continue;
            }
            let d = euclidean(&centroids[i].to_vec(), &centroids[j].to_vec());
            if d > 0.0 {
                worst = worst.max((scatters[i] + scatters[j]) / d);
            }
        }
        total += worst;
    }

    Some(total / k as f64)
}

/// Per-axis variance of an embedding.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn axis_variances(data: ArrayView2<'_, f64>) -> Vec<f64> {
    let n = data.nrows();
    if n == 0 {
        return vec![0.0; data.ncols()];
    }
    (0..data.ncols())
        .map(|c| {
            let col = data.column(c);
            let m = col.sum() / n as f64;
            col.iter().map(|x| (x - m).powi(2)).sum::<f64>() / n as f64
        })
        .collect()
}

/// Mean per-axis variance, used as an embedding spread score.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean_axis_variance(data: ArrayView2<'_, f64>) -> f64 {
    let vars = axis_variances(data);
    if vars.is_empty() {
        return 0.0;
    }
    vars.iter().sum::<f64>() / vars.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_blobs() -> (ndarray::Array2<f64>, Vec<i64>) {
        let data = array![
            [0.0, 0.0],
            [0.1, 0.0],
            [0.0, 0.1],
            [10.0, 10.0],
            [10.1, 10.0],
            [10.0, 10.1],
        ];
        let labels = vec![0, 0, 0, 1, 1, 1];
        (data, labels)
    }

    #[test]
    fn test_silhouette_separated_blobs() {
        let (data, labels) = two_blobs();
        let score = silhouette_score(data.view(), &labels).unwrap();
        assert!(score > 0.9, "expected near-perfect separation, got {score}");
    }

    #[test]
    fn test_silhouette_single_cluster_is_none() {
        let data = array![[0.0, 0.0], [1.0, 1.0]];
        assert!(silhouette_score(data.view(), &[0, 0]).is_none());
    }

    #[test]
    fn test_silhouette_ignores_noise() {
        let data = array![[0.0, 0.0], [0.1, 0.0], [10.0, 10.0], [10.1, 10.0], [5.0, 5.0]];
        let labels = vec![0, 0, 1, 1, -1];
        let score = silhouette_score(data.view(), &labels).unwrap();
        assert!(score > 0.9);
    }

    #[test]
    fn test_calinski_harabasz_prefers_separation() {
        let (data, labels) = two_blobs();
        let good = calinski_harabasz_score(data.view(), &labels).unwrap();
        let bad_labels = vec![0, 1, 0, 1, 0, 1];
        let bad = calinski_harabasz_score(data.view(), &bad_labels).unwrap();
        assert!(good > bad);
    }

    #[test]
    fn test_davies_bouldin_low_for_separated_blobs() {
        let (data, labels) = two_blobs();
        let score = davies_bouldin_score(data.view(), &labels).unwrap();
        assert!(score < 0.1, "got {score}");
    }

    #[test]
    fn test_axis_variances() {
        let data = array![[0.0, 1.0], [2.0, 1.0], [4.0, 1.0]];
        let vars = axis_variances(data.view());
        assert_abs_diff_eq!(vars[0], 8.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(vars[1], 0.0, epsilon = 1e-12);
    }
}
