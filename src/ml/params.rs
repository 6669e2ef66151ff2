//! Dataset-shape parameter heuristics.
//!
//! Pure functions: they inspect (n_samples, n_features) and measured curves
//! and return adjusted parameters. The adapters in `reduction`, `clustering`
//! and `anomaly` call these during `fit`.

use crate::ml::stats;
use crate::structs::{TsneConfig, UmapConfig};
use ndarray::ArrayView2;
use tracing::debug;

/// Above this sample count the slow embedders switch to budget settings.
pub const LARGE_DATASET: usize = 10_000;

/// Eps multipliers tried around the k-distance base during DBSCAN auto-tuning.
pub const EPS_FACTORS: [f64; 5] = [0.5, 0.75, 1.0, 1.25, 1.5];

/// min_samples candidates tried during DBSCAN auto-tuning.
pub const MIN_SAMPLES_GRID: [usize; 4] = [3, 5, 7, 10];

/// t-SNE parameters after shape adaptation.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedTsne {
    pub perplexity: f64,
    pub learning_rate: f64,
    pub n_iter: usize,
    /// Initialize from the leading principal components on large datasets.
    pub pca_init: bool,
}

/// Clamp perplexity to what the sample count supports and cap the
/// iteration budget on large datasets.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn adapt_tsne(config: &TsneConfig, n_samples: usize) -> AdaptedTsne {
    let max_perplexity = (n_samples.saturating_sub(1)) as f64 / 3.0;
    let perplexity = config.perplexity.min(max_perplexity).max(5.0);

    let (n_iter, pca_init) = if n_samples > LARGE_DATASET {
        (config.n_iter.clamp(250, 500), true)
    } else {
        (config.n_iter, false)
    };

    if (perplexity - config.perplexity).abs() > f64::EPSILON {
        debug!(
            requested = config.perplexity,
            adapted = perplexity,
            n_samples,
            "perplexity clamped"
        );
    }

    AdaptedTsne {
        perplexity,
        learning_rate: config.learning_rate,
        n_iter,
        pca_init,
    }
}

/// UMAP parameters after shape adaptation.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedUmap {
    pub n_neighbors: usize,
    pub min_dist: f64,
    pub n_epochs: Option<usize>,
    pub low_memory: bool,
}

/// Keep n_neighbors strictly below the sample count; budget epochs on
/// large datasets.
#[must_use]
pub fn adapt_umap(config: &UmapConfig, n_samples: usize) -> AdaptedUmap {
    let n_neighbors = config
        .n_neighbors
        .min(n_samples.saturating_sub(1))
        .max(2);

    let (n_epochs, low_memory) = if n_samples > LARGE_DATASET {
        (Some(config.n_epochs.unwrap_or(200).min(200)), true)
    } else {
        (config.n_epochs, config.low_memory)
    };

    AdaptedUmap {
        n_neighbors,
        min_dist: config.min_dist,
        n_epochs,
        low_memory,
    }
}

/// Index of the elbow in a decreasing inertia curve: the point with the
/// largest second discrete derivative.
#[must_use]
pub fn elbow_index(inertias: &[f64]) -> usize {
    if inertias.len() < 3 {
        return 0;
    }
    let mut best = (1usize, f64::NEG_INFINITY);
    for i in 1..inertias.len() - 1 {
        let curvature = inertias[i - 1] - 2.0 * inertias[i] + inertias[i + 1];
        if curvature > best.1 {
            best = (i, curvature);
        }
    }
    best.0
}

/// Choose K from measured inertia and silhouette curves.
///
/// The silhouette-optimal K wins when its score exceeds `silhouette_threshold`,
/// otherwise the elbow K is used.
#[must_use]
pub fn choose_k(
    ks: &[usize],
    inertias: &[f64],
    silhouettes: &[Option<f64>],
    silhouette_threshold: f64,
) -> usize {
    debug_assert_eq!(ks.len(), inertias.len());
    debug_assert_eq!(ks.len(), silhouettes.len());
    if ks.is_empty() {
        return 2;
    }

    let elbow_k = ks[elbow_index(inertias)];

    let best_silhouette = silhouettes
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.map(|v| (i, v)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    match best_silhouette {
        Some((i, score)) if score > silhouette_threshold => {
            debug!(k = ks[i], score, "silhouette-selected K");
            ks[i]
        }
        _ => {
            debug!(k = elbow_k, "elbow-selected K");
            elbow_k
        }
    }
}

/// Distance from each sample to its k-th nearest neighbour, ascending.
#[must_use]
pub fn k_distances(data: ArrayView2<'_, f64>, k: usize) -> Vec<f64> {
    let n = data.nrows();
    let mut result = Vec::with_capacity(n);
    for i in 0..n {
        let mut dists: Vec<f64> = (0..n)
            .filter(|&j| j != i)
            .map(|j| {
                data.row(i)
                    .iter()
                    .zip(data.row(j).iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    .sqrt()
            })
            .collect();
        dists.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(&d) = dists.get(k.saturating_sub(1)) {
            result.push(d);
        }
    }
    result.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    result
}

/// Base eps for DBSCAN auto-tuning: the 95th percentile k-distance with
/// k = min(5, n - 1).
#[must_use]
pub fn dbscan_eps_base(data: ArrayView2<'_, f64>) -> f64 {
    let k = 5.min(data.nrows().saturating_sub(1)).max(1);
    let dists = k_distances(data, k);
    let base = stats::percentile(&dists, 95.0);
    if base > 0.0 {
        base
    } else {
        0.5
    }
}

/// Contamination estimate from per-feature IQR outlier rates, clamped
/// to [0.01, 0.30].
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn auto_contamination(data: ArrayView2<'_, f64>) -> f64 {
    let n = data.nrows();
    if n == 0 || data.ncols() == 0 {
        return 0.1;
    }

    let mut outlier_rows = vec![false; n];
    for c in 0..data.ncols() {
        let col = data.column(c).to_vec();
        let (q1, _, q3) = stats::quartiles(&col);
        let iqr = q3 - q1;
        let lower = q1 - 1.5 * iqr;
        let upper = q3 + 1.5 * iqr;
        for (r, &v) in col.iter().enumerate() {
            if v < lower || v > upper {
                outlier_rows[r] = true;
            }
        }
    }

    let ratio = outlier_rows.iter().filter(|&&o| o).count() as f64 / n as f64;
    ratio.clamp(0.01, 0.30)
}
