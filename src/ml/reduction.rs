//! Dimensionality reduction adapters producing 3D embeddings.
//!
//! `fit` adapts parameters to the dataset shape, `transform` computes the
//! embedding. Output always has exactly three columns; methods that yield
//! fewer components are zero-padded.

use crate::ml::{metrics, params};
use crate::structs::{
    AlgorithmOutput, AlgorithmResult, Error, KernelPcaConfig, PcaConfig, ProcessingConfig,
    ReductionMethod, Result, TsneConfig, UmapConfig,
};
use linfa::traits::{Fit, Predict};
use linfa::DatasetBase;
use linfa_linalg::eigh::{EigSort, Eigh};
use linfa_reduction::Pca;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::time::Instant;
use tracing::debug;

const OUTPUT_DIM: usize = 3;

/// Dimensionality reduction adapter over the supported methods.
pub enum Reducer {
    Pca {
        config: PcaConfig,
        fitted: bool,
    },
    KernelPca {
        config: KernelPcaConfig,
        /// Resolved at fit time: configured gamma or 1 / n_features.
        gamma: Option<f64>,
    },
    Tsne {
        config: TsneConfig,
        random_state: u64,
        adapted: Option<params::AdaptedTsne>,
    },
    Mds {
        fitted: bool,
    },
    Umap {
        config: UmapConfig,
    },
}

impl Reducer {
    #[must_use]
    pub fn from_config(config: &ProcessingConfig) -> Self {
        match config.reduction_method {
            ReductionMethod::Pca => Self::Pca {
                config: config.pca.clone(),
                fitted: false,
            },
            ReductionMethod::KernelPca => Self::KernelPca {
                config: config.kernel_pca.clone(),
                gamma: None,
            },
            ReductionMethod::Tsne => Self::Tsne {
                config: config.tsne.clone(),
                random_state: config.random_state,
                adapted: None,
            },
            ReductionMethod::Mds => Self::Mds { fitted: false },
            ReductionMethod::Umap => Self::Umap {
                config: config.umap.clone(),
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pca { .. } => "pca",
            Self::KernelPca { .. } => "kernel_pca",
            Self::Tsne { .. } => "tsne",
            Self::Mds { .. } => "mds",
            Self::Umap { .. } => "umap",
        }
    }

    /// Adapt parameters to the dataset shape.
    ///
    /// # Errors
    /// Returns `Error::UnsupportedMethod` for UMAP, which has no native
    /// backend, and `Error::Validation` for degenerate inputs.
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(&mut self, data: ArrayView2<'_, f64>) -> Result<()> {
        if data.nrows() < 2 {
            return Err(Error::Validation(
                "Dimensionality reduction requires at least 2 samples".into(),
            ));
        }

        match self {
            Self::Pca { fitted, .. } | Self::Mds { fitted } => *fitted = true,
            Self::KernelPca { config, gamma } => {
                *gamma = Some(
                    config
                        .gamma
                        .unwrap_or_else(|| 1.0 / data.ncols().max(1) as f64),
                );
            }
            Self::Tsne {
                config, adapted, ..
            } => {
                *adapted = Some(params::adapt_tsne(config, data.nrows()));
            }
            Self::Umap { config } => {
                // Parameter adaptation is still meaningful for reporting,
                // but there is no backend to run.
                let _ = params::adapt_umap(config, data.nrows());
                return Err(Error::UnsupportedMethod(
                    "umap is not available in this build".into(),
                ));
            }
        }
        debug!(method = self.name(), "reducer fitted");
        Ok(())
    }

    /// Compute the 3D embedding.
    ///
    /// # Errors
    /// Returns `Error::NotFitted` before `fit`, or `Error::Algorithm` when
    /// the underlying computation fails.
    pub fn transform(&self, data: ArrayView2<'_, f64>) -> Result<AlgorithmResult> {
        let started = Instant::now();
        let (embedding, mut metadata) = match self {
            Self::Pca { config, fitted } => {
                if !*fitted {
                    return Err(Error::NotFitted("pca reducer"));
                }
                run_pca(data, config.whiten)?
            }
            Self::KernelPca { gamma, .. } => {
                let gamma = gamma.ok_or(Error::NotFitted("kernel_pca reducer"))?;
                run_kernel_pca(data, gamma)?
            }
            Self::Tsne {
                adapted,
                random_state,
                ..
            } => {
                let adapted = adapted
                    .as_ref()
                    .ok_or(Error::NotFitted("tsne reducer"))?;
                run_tsne(data, adapted, *random_state)?
            }
            Self::Mds { fitted } => {
                if !*fitted {
                    return Err(Error::NotFitted("mds reducer"));
                }
                run_mds(data)?
            }
            Self::Umap { .. } => {
                return Err(Error::UnsupportedMethod(
                    "umap is not available in this build".into(),
                ));
            }
        };

        let axis_vars = metrics::axis_variances(embedding.view());
        let mut result_metrics = std::collections::BTreeMap::new();
        result_metrics.insert(
            "embedding_variance".to_string(),
            metrics::mean_axis_variance(embedding.view()),
        );
        if let Some(ratios) = metadata.get("explained_variance_ratio").and_then(Value::as_array) {
            let total: f64 = ratios.iter().filter_map(Value::as_f64).sum();
            result_metrics.insert("explained_variance".to_string(), total);
        }
        if let Some(obj) = metadata.as_object_mut() {
            obj.insert("axis_variances".to_string(), json!(axis_vars));
        }

        Ok(AlgorithmResult {
            output: AlgorithmOutput::Embedding(embedding),
            metadata,
            metrics: result_metrics,
            elapsed: started.elapsed(),
            params: self.params(),
        })
    }

    /// Fit, then transform.
    ///
    /// # Errors
    /// Propagates errors from either step.
    pub fn fit_transform(&mut self, data: ArrayView2<'_, f64>) -> Result<AlgorithmResult> {
        self.fit(data)?;
        self.transform(data)
    }

    /// Resolved parameters after adaptation.
    #[must_use]
    pub fn params(&self) -> Value {
        match self {
            Self::Pca { config, .. } => json!({
                "method": "pca",
                "n_components": OUTPUT_DIM,
                "whiten": config.whiten,
            }),
            Self::KernelPca { gamma, config } => json!({
                "method": "kernel_pca",
                "n_components": OUTPUT_DIM,
                "gamma": gamma.or(config.gamma),
            }),
            Self::Tsne {
                config, adapted, ..
            } => adapted.as_ref().map_or_else(
                || {
                    json!({
                        "method": "tsne",
                        "perplexity": config.perplexity,
                        "learning_rate": config.learning_rate,
                        "n_iter": config.n_iter,
                    })
                },
                |a| {
                    json!({
                        "method": "tsne",
                        "perplexity": a.perplexity,
                        "learning_rate": a.learning_rate,
                        "n_iter": a.n_iter,
                        "pca_init": a.pca_init,
                    })
                },
            ),
            Self::Mds { .. } => json!({ "method": "mds", "n_components": OUTPUT_DIM }),
            Self::Umap { config } => json!({
                "method": "umap",
                "n_neighbors": config.n_neighbors,
                "min_dist": config.min_dist,
            }),
        }
    }
}

/// Pad or truncate an embedding to exactly [`OUTPUT_DIM`] columns.
fn pad_to_output_dim(embedding: Array2<f64>) -> Array2<f64> {
    let (n, d) = embedding.dim();
    if d == OUTPUT_DIM {
        return embedding;
    }
    let mut out = Array2::zeros((n, OUTPUT_DIM));
    for r in 0..n {
        for c in 0..d.min(OUTPUT_DIM) {
            out[[r, c]] = embedding[[r, c]];
        }
    }
    out
}

#[allow(clippy::cast_precision_loss)]
fn run_pca(data: ArrayView2<'_, f64>, whiten: bool) -> Result<(Array2<f64>, Value)> {
    let n_samples = data.nrows();
    let n_components = OUTPUT_DIM.min(data.ncols()).min(n_samples - 1).max(1);

    let dataset = DatasetBase::from(data.to_owned());
    let pca = Pca::params(n_components)
        .fit(&dataset)
        .map_err(|e| Error::Algorithm(format!("PCA failed: {e}")))?;

    // Explained variance from singular values
    let singular_values = pca.singular_values();
    let total_variance: f64 = singular_values.iter().map(|s| s * s).sum();
    let explained_variance_ratio: Vec<f64> = if total_variance > 0.0 {
        singular_values
            .iter()
            .map(|s| (s * s) / total_variance)
            .collect()
    } else {
        vec![0.0; n_components]
    };

    let mut embedding = pca.predict(&dataset);
    if whiten {
        for c in 0..embedding.ncols() {
            let col = embedding.column(c).to_vec();
            let sd = crate::ml::stats::variance(&col).sqrt();
            if sd > 0.0 {
                for v in embedding.column_mut(c) {
                    *v /= sd;
                }
            }
        }
    }

    let metadata = json!({
        "explained_variance_ratio": explained_variance_ratio,
        "n_components": n_components,
    });
    Ok((pad_to_output_dim(embedding), metadata))
}

fn rbf_kernel(data: ArrayView2<'_, f64>, gamma: f64) -> Array2<f64> {
    let n = data.nrows();
    let mut k = Array2::zeros((n, n));
    for i in 0..n {
        for j in i..n {
            let sq: f64 = data
                .row(i)
                .iter()
                .zip(data.row(j).iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            let v = (-gamma * sq).exp();
            k[[i, j]] = v;
            k[[j, i]] = v;
        }
    }
    k
}

/// Double-center a symmetric matrix in place: K <- J K J with J = I - 1/n.
#[allow(clippy::cast_precision_loss)]
fn double_center(k: &mut Array2<f64>) {
    let n = k.nrows() as f64;
    let row_means: Array1<f64> = k.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(0));
    let grand_mean = row_means.sum() / n;
    for i in 0..k.nrows() {
        for j in 0..k.ncols() {
            k[[i, j]] += grand_mean - row_means[i] - row_means[j];
        }
    }
}

/// Top eigenpairs of a centered Gram matrix projected to coordinates.
#[allow(clippy::cast_precision_loss)]
fn gram_to_coordinates(mut gram: Array2<f64>) -> Result<(Array2<f64>, Vec<f64>)> {
    double_center(&mut gram);

    let (vals, vecs) = gram
        .eigh()
        .map_err(|e| Error::Algorithm(format!("eigendecomposition failed: {e}")))?;
    let (vals, vecs) = (vals, vecs).sort_eig_desc();

    let n = vecs.nrows();
    let k = OUTPUT_DIM.min(vals.len());
    let mut coords = Array2::zeros((n, k));
    for c in 0..k {
        let scale = vals[c].max(0.0).sqrt();
        for r in 0..n {
            coords[[r, c]] = vecs[[r, c]] * scale;
        }
    }

    let total: f64 = vals.iter().map(|v| v.max(0.0)).sum();
    let ratios: Vec<f64> = (0..k)
        .map(|c| {
            if total > 0.0 {
                vals[c].max(0.0) / total
            } else {
                0.0
            }
        })
        .collect();

    Ok((pad_to_output_dim(coords), ratios))
}

fn run_kernel_pca(data: ArrayView2<'_, f64>, gamma: f64) -> Result<(Array2<f64>, Value)> {
    let kernel = rbf_kernel(data, gamma);
    let (coords, ratios) = gram_to_coordinates(kernel)?;
    let metadata = json!({
        "explained_variance_ratio": ratios,
        "gamma": gamma,
    });
    Ok((coords, metadata))
}

/// Classical metric MDS: eigendecomposition of the double-centered
/// squared-distance matrix.
fn run_mds(data: ArrayView2<'_, f64>) -> Result<(Array2<f64>, Value)> {
    let n = data.nrows();
    let mut gram = Array2::zeros((n, n));
    for i in 0..n {
        for j in i..n {
            let sq: f64 = data
                .row(i)
                .iter()
                .zip(data.row(j).iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            gram[[i, j]] = -0.5 * sq;
            gram[[j, i]] = -0.5 * sq;
        }
    }
    let (coords, ratios) = gram_to_coordinates(gram)?;
    let metadata = json!({ "explained_variance_ratio": ratios });
    Ok((coords, metadata))
}

// ----------------------------------------------------------------------------
// t-SNE (exact gradient)
// ----------------------------------------------------------------------------

const EARLY_EXAGGERATION: f64 = 12.0;
const EARLY_PHASE_ITERS: usize = 250;

#[allow(clippy::cast_precision_loss)]
fn run_tsne(
    data: ArrayView2<'_, f64>,
    adapted: &params::AdaptedTsne,
    random_state: u64,
) -> Result<(Array2<f64>, Value)> {
    let n = data.nrows();
    let p = joint_probabilities(data, adapted.perplexity);

    let mut rng = SmallRng::seed_from_u64(random_state);
    let mut y = if adapted.pca_init {
        let (mut init, _) = run_pca(data, false)?;
        // Shrink so gradient descent starts from a tight layout
        init.mapv_inplace(|v| v * 1e-4);
        init
    } else {
        let mut init = Array2::zeros((n, OUTPUT_DIM));
        for v in init.iter_mut() {
            *v = normal_sample(&mut rng) * 1e-4;
        }
        init
    };

    let mut velocity: Array2<f64> = Array2::zeros((n, OUTPUT_DIM));
    let mut gains: Array2<f64> = Array2::from_elem((n, OUTPUT_DIM), 1.0);
    let lr = adapted.learning_rate;

    for iter in 0..adapted.n_iter {
        let exaggeration = if iter < EARLY_PHASE_ITERS {
            EARLY_EXAGGERATION
        } else {
            1.0
        };
        let momentum = if iter < EARLY_PHASE_ITERS { 0.5 } else { 0.8 };

        // Low-dimensional affinities (Student-t kernel)
        let mut q_num = Array2::zeros((n, n));
        let mut q_sum = 0.0;
        for i in 0..n {
            for j in (i + 1)..n {
                let sq: f64 = (0..OUTPUT_DIM)
                    .map(|d| (y[[i, d]] - y[[j, d]]).powi(2))
                    .sum();
                let v = 1.0 / (1.0 + sq);
                q_num[[i, j]] = v;
                q_num[[j, i]] = v;
                q_sum += 2.0 * v;
            }
        }
        let q_sum = q_sum.max(1e-12);

        // Gradient: 4 * sum_j (p_ij*ex - q_ij) * num_ij * (y_i - y_j)
        let mut grad: Array2<f64> = Array2::zeros((n, OUTPUT_DIM));
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                let mult = (p[[i, j]] * exaggeration - q_num[[i, j]] / q_sum) * q_num[[i, j]];
                for d in 0..OUTPUT_DIM {
                    grad[[i, d]] += 4.0 * mult * (y[[i, d]] - y[[j, d]]);
                }
            }
        }

        // Adaptive gains as in the reference implementation
        for i in 0..n {
            for d in 0..OUTPUT_DIM {
                let same_sign = grad[[i, d]].signum() == velocity[[i, d]].signum();
                gains[[i, d]] = if same_sign {
                    (gains[[i, d]] * 0.8).max(0.01)
                } else {
                    gains[[i, d]] + 0.2
                };
                velocity[[i, d]] =
                    momentum * velocity[[i, d]] - lr * gains[[i, d]] * grad[[i, d]];
                y[[i, d]] += velocity[[i, d]];
            }
        }

        // Re-center to keep coordinates bounded
        let means: Vec<f64> = (0..OUTPUT_DIM)
            .map(|d| y.column(d).sum() / n as f64)
            .collect();
        for i in 0..n {
            for d in 0..OUTPUT_DIM {
                y[[i, d]] -= means[d];
            }
        }
    }

    let metadata = json!({
        "perplexity": adapted.perplexity,
        "n_iter": adapted.n_iter,
    });
    Ok((y, metadata))
}

/// Symmetrized high-dimensional affinities at the requested perplexity.
#[allow(clippy::cast_precision_loss)]
fn joint_probabilities(data: ArrayView2<'_, f64>, perplexity: f64) -> Array2<f64> {
    let n = data.nrows();
    let mut sq_dists = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let sq: f64 = data
                .row(i)
                .iter()
                .zip(data.row(j).iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            sq_dists[[i, j]] = sq;
            sq_dists[[j, i]] = sq;
        }
    }

    let target_entropy = perplexity.ln();
    let mut p = Array2::zeros((n, n));

    for i in 0..n {
        // Binary search the precision matching the target perplexity
        let mut beta = 1.0;
        let mut beta_min = f64::NEG_INFINITY;
        let mut beta_max = f64::INFINITY;

        for _ in 0..50 {
            let mut sum = 0.0;
            let mut weighted = 0.0;
            for j in 0..n {
                if i == j {
                    continue;
                }
                let w = (-beta * sq_dists[[i, j]]).exp();
                sum += w;
                weighted += w * sq_dists[[i, j]];
            }
            let sum = sum.max(1e-12);
            let entropy = beta * weighted / sum + sum.ln();

            let diff = entropy - target_entropy;
            if diff.abs() < 1e-5 {
                break;
            }
            if diff > 0.0 {
                beta_min = beta;
                beta = if beta_max.is_finite() {
                    (beta + beta_max) / 2.0
                } else {
                    beta * 2.0
                };
            } else {
                beta_max = beta;
                beta = if beta_min.is_finite() {
                    (beta + beta_min) / 2.0
                } else {
                    beta / 2.0
                };
            }
        }

        let mut sum = 0.0;
        for j in 0..n {
            if i != j {
                let w = (-beta * sq_dists[[i, j]]).exp();
                p[[i, j]] = w;
                sum += w;
            }
        }
        let sum = sum.max(1e-12);
        for j in 0..n {
            p[[i, j]] /= sum;
        }
    }

    // Symmetrize and normalize
    let mut joint = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            joint[[i, j]] = ((p[[i, j]] + p[[j, i]]) / (2.0 * n as f64)).max(1e-12);
        }
    }
    for i in 0..n {
        joint[[i, i]] = 0.0;
    }
    joint
}

/// Standard normal sample via Box-Muller.
fn normal_sample(rng: &mut SmallRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::ProcessingConfig;
    use ndarray::Array2;
    use rand::Rng;

    fn sample_data(n: usize, d: usize, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        Array2::from_shape_fn((n, d), |_| rng.gen_range(-1.0..1.0))
    }

    fn config_for(method: ReductionMethod) -> ProcessingConfig {
        ProcessingConfig {
            reduction_method: method,
            ..ProcessingConfig::default()
        }
    }

    #[test]
    fn test_transform_before_fit_fails() {
        let reducer = Reducer::from_config(&config_for(ReductionMethod::Pca));
        let data = sample_data(10, 4, 1);
        assert!(matches!(
            reducer.transform(data.view()),
            Err(Error::NotFitted(_))
        ));
    }

    #[test]
    fn test_pca_shape_and_variance() {
        let mut reducer = Reducer::from_config(&config_for(ReductionMethod::Pca));
        let data = sample_data(30, 5, 2);
        let result = reducer.fit_transform(data.view()).unwrap();
        let embedding = result.embedding().unwrap();
        assert_eq!(embedding.dim(), (30, 3));
        let explained = result.metrics["explained_variance"];
        assert!(explained > 0.0 && explained <= 1.0 + 1e-9);
    }

    #[test]
    fn test_pca_pads_narrow_input() {
        let mut reducer = Reducer::from_config(&config_for(ReductionMethod::Pca));
        let data = sample_data(20, 2, 3);
        let result = reducer.fit_transform(data.view()).unwrap();
        let embedding = result.embedding().unwrap();
        assert_eq!(embedding.dim(), (20, 3));
        // Third axis must be the zero pad
        assert!(embedding.column(2).iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_kernel_pca_gamma_defaults_to_inverse_features() {
        let mut reducer = Reducer::from_config(&config_for(ReductionMethod::KernelPca));
        let data = sample_data(15, 4, 4);
        reducer.fit(data.view()).unwrap();
        let params = reducer.params();
        assert!((params["gamma"].as_f64().unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_kernel_pca_embedding_finite() {
        let mut reducer = Reducer::from_config(&config_for(ReductionMethod::KernelPca));
        let data = sample_data(20, 4, 5);
        let result = reducer.fit_transform(data.view()).unwrap();
        assert!(result.embedding().unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_mds_recovers_pairwise_structure() {
        // Two distant groups must remain distant in the embedding
        let mut data = Array2::zeros((10, 4));
        for i in 5..10 {
            for c in 0..4 {
                data[[i, c]] = 100.0;
            }
        }
        let mut reducer = Reducer::from_config(&config_for(ReductionMethod::Mds));
        let result = reducer.fit_transform(data.view()).unwrap();
        let e = result.embedding().unwrap();
        let within = (e.row(0).to_owned() - e.row(1).to_owned())
            .mapv(f64::abs)
            .sum();
        let between = (e.row(0).to_owned() - e.row(7).to_owned())
            .mapv(f64::abs)
            .sum();
        assert!(between > within * 10.0);
    }

    #[test]
    fn test_tsne_deterministic_under_seed() {
        let data = sample_data(20, 4, 6);
        let config = ProcessingConfig {
            reduction_method: ReductionMethod::Tsne,
            tsne: TsneConfig {
                n_iter: 50,
                ..TsneConfig::default()
            },
            ..ProcessingConfig::default()
        };
        let a = Reducer::from_config(&config)
            .fit_transform(data.view())
            .unwrap();
        let b = Reducer::from_config(&config)
            .fit_transform(data.view())
            .unwrap();
        assert_eq!(
            a.embedding().unwrap().as_slice().unwrap(),
            b.embedding().unwrap().as_slice().unwrap()
        );
    }

    #[test]
    fn test_tsne_output_shape_and_finiteness() {
        let data = sample_data(25, 4, 7);
        let config = ProcessingConfig {
            reduction_method: ReductionMethod::Tsne,
            tsne: TsneConfig {
                n_iter: 60,
                ..TsneConfig::default()
            },
            ..ProcessingConfig::default()
        };
        let result = Reducer::from_config(&config)
            .fit_transform(data.view())
            .unwrap();
        let e = result.embedding().unwrap();
        assert_eq!(e.dim(), (25, 3));
        assert!(e.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_umap_unsupported() {
        let mut reducer = Reducer::from_config(&config_for(ReductionMethod::Umap));
        let data = sample_data(10, 3, 8);
        assert!(matches!(
            reducer.fit(data.view()),
            Err(Error::UnsupportedMethod(_))
        ));
    }
}
