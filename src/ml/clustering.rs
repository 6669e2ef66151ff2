//! Clustering adapters over the 3D embedding.
//!
//! `fit` resolves data-dependent parameters (auto-K, DBSCAN eps grid) and
//! trains where the method supports prediction; `transform` assigns labels.
//! Noise points get the label -1.

use crate::ml::{hdbscan, metrics, params};
use crate::structs::{
    AgglomerativeConfig, AlgorithmOutput, AlgorithmResult, ClusteringMethod, DbscanConfig,
    Error, GaussianMixtureConfig, HdbscanConfig, KmeansConfig, Linkage, ProcessingConfig,
    Result,
};
use linfa::traits::{Fit, Predict, Transformer};
use linfa::DatasetBase;
use linfa::ParamGuard;
use linfa_clustering::{Dbscan, GaussianMixtureModel, KMeans};
use linfa_nn::distance::L2Dist;
use ndarray::ArrayView2;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

/// Clustering algorithm adapter.
pub enum Clusterer {
    KMeans {
        config: KmeansConfig,
        random_state: u64,
        model: Option<FittedKmeans>,
    },
    Dbscan {
        config: DbscanConfig,
        /// (eps, min_samples) after auto-tuning.
        resolved: Option<(f64, usize)>,
    },
    Hdbscan {
        config: HdbscanConfig,
        fitted: bool,
    },
    Agglomerative {
        config: AgglomerativeConfig,
        fitted: bool,
    },
    GaussianMixture {
        config: GaussianMixtureConfig,
        model: Option<GaussianMixtureModel<f64>>,
    },
}

pub struct FittedKmeans {
    model: KMeans<f64, L2Dist>,
    k: usize,
}

impl Clusterer {
    #[must_use]
    pub fn from_config(config: &ProcessingConfig) -> Self {
        match config.clustering_method {
            ClusteringMethod::Kmeans => Self::KMeans {
                config: config.kmeans.clone(),
                random_state: config.random_state,
                model: None,
            },
            ClusteringMethod::Dbscan => Self::Dbscan {
                config: config.dbscan.clone(),
                resolved: None,
            },
            ClusteringMethod::Hdbscan => Self::Hdbscan {
                config: config.hdbscan.clone(),
                fitted: false,
            },
            ClusteringMethod::Agglomerative => Self::Agglomerative {
                config: config.agglomerative.clone(),
                fitted: false,
            },
            ClusteringMethod::GaussianMixture => Self::GaussianMixture {
                config: config.gaussian_mixture.clone(),
                model: None,
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::KMeans { .. } => "kmeans",
            Self::Dbscan { .. } => "dbscan",
            Self::Hdbscan { .. } => "hdbscan",
            Self::Agglomerative { .. } => "agglomerative",
            Self::GaussianMixture { .. } => "gaussian_mixture",
        }
    }

    /// Resolve parameters against `data` and train where applicable.
    ///
    /// # Errors
    /// Returns `Error::Validation` when the sample count cannot support the
    /// requested clustering, `Error::Algorithm` when the solver fails.
    pub fn fit(&mut self, data: ArrayView2<'_, f64>) -> Result<()> {
        let n = data.nrows();
        if n < 2 {
            return Err(Error::Validation(
                "Clustering requires at least 2 samples".into(),
            ));
        }

        match self {
            Self::KMeans {
                config,
                random_state,
                model,
            } => {
                let k = match config.auto_k_range {
                    Some((lo, hi)) => select_k(config, data, lo, hi, *random_state)?,
                    None => config.n_clusters,
                };
                if k == 0 || k > n {
                    return Err(Error::Validation(format!(
                        "Cannot create {k} clusters with only {n} samples"
                    )));
                }
                let fitted = fit_kmeans(data, k, config.max_iter, config.tolerance, *random_state)?;
                *model = Some(FittedKmeans { model: fitted, k });
            }
            Self::Dbscan { config, resolved } => {
                *resolved = Some(if config.auto_params {
                    tune_dbscan(data)
                } else {
                    (config.eps, config.min_samples)
                });
            }
            Self::Hdbscan { config, fitted } => {
                if config.min_cluster_size < 2 {
                    return Err(Error::Config(
                        "hdbscan min_cluster_size must be at least 2".into(),
                    ));
                }
                *fitted = true;
            }
            Self::Agglomerative { config, fitted } => {
                if config.n_clusters == 0 || config.n_clusters > n {
                    return Err(Error::Validation(format!(
                        "Cannot create {} clusters with only {n} samples",
                        config.n_clusters
                    )));
                }
                *fitted = true;
            }
            Self::GaussianMixture { config, model } => {
                if config.n_clusters == 0 || config.n_clusters > n {
                    return Err(Error::Validation(format!(
                        "Cannot create {} clusters with only {n} samples",
                        config.n_clusters
                    )));
                }
                let dataset = DatasetBase::from(data.to_owned());
                let gmm = GaussianMixtureModel::params(config.n_clusters)
                    .max_n_iterations(config.max_iter)
                    .tolerance(config.tolerance)
                    .fit(&dataset)
                    .map_err(|e| Error::Algorithm(format!("Gaussian mixture failed: {e}")))?;
                *model = Some(gmm);
            }
        }
        debug!(method = self.name(), "clusterer fitted");
        Ok(())
    }

    /// Assign a label to every row; -1 marks noise.
    ///
    /// # Errors
    /// Returns `Error::NotFitted` before `fit`.
    pub fn transform(&self, data: ArrayView2<'_, f64>) -> Result<AlgorithmResult> {
        let started = Instant::now();
        let labels = match self {
            Self::KMeans { model, .. } => {
                let fitted = model.as_ref().ok_or(Error::NotFitted("kmeans"))?;
                let predictions = fitted.model.predict(&DatasetBase::from(data.to_owned()));
                predictions.iter().map(|&c| c as i64).collect::<Vec<_>>()
            }
            Self::Dbscan { resolved, .. } => {
                let (eps, min_samples) = resolved.ok_or(Error::NotFitted("dbscan"))?;
                run_dbscan(data, eps, min_samples)?
            }
            Self::Hdbscan { config, fitted } => {
                if !*fitted {
                    return Err(Error::NotFitted("hdbscan"));
                }
                hdbscan::run(data, config.min_cluster_size, config.min_samples)?
            }
            Self::Agglomerative { config, fitted } => {
                if !*fitted {
                    return Err(Error::NotFitted("agglomerative"));
                }
                agglomerate(data, config.n_clusters, config.linkage)
            }
            Self::GaussianMixture { model, .. } => {
                let gmm = model.as_ref().ok_or(Error::NotFitted("gaussian mixture"))?;
                let predictions = gmm.predict(&DatasetBase::from(data.to_owned()));
                predictions.iter().map(|&c| c as i64).collect::<Vec<_>>()
            }
        };

        let (mut metrics_map, metadata) = label_summary(data, &labels);
        metrics_map.insert("n_samples".into(), data.nrows() as f64);

        Ok(AlgorithmResult {
            output: AlgorithmOutput::Labels(labels),
            metadata,
            metrics: metrics_map,
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

    #[must_use]
    pub fn params(&self) -> Value {
        match self {
            Self::KMeans { config, model, .. } => json!({
                "method": "kmeans",
                "n_clusters": model.as_ref().map_or(config.n_clusters, |m| m.k),
                "max_iter": config.max_iter,
                "tolerance": config.tolerance,
                "auto_k": config.auto_k_range.is_some(),
            }),
            Self::Dbscan { config, resolved } => {
                let (eps, min_samples) =
                    resolved.unwrap_or((config.eps, config.min_samples));
                json!({
                    "method": "dbscan",
                    "eps": eps,
                    "min_samples": min_samples,
                    "auto_params": config.auto_params,
                })
            }
            Self::Hdbscan { config, .. } => json!({
                "method": "hdbscan",
                "min_cluster_size": config.min_cluster_size,
                "min_samples": config.min_samples,
            }),
            Self::Agglomerative { config, .. } => json!({
                "method": "agglomerative",
                "n_clusters": config.n_clusters,
                "linkage": config.linkage,
            }),
            Self::GaussianMixture { config, .. } => json!({
                "method": "gaussian_mixture",
                "n_clusters": config.n_clusters,
                "max_iter": config.max_iter,
            }),
        }
    }
}

fn fit_kmeans(
    data: ArrayView2<'_, f64>,
    k: usize,
    max_iter: u64,
    tolerance: f64,
    random_state: u64,
) -> Result<KMeans<f64, L2Dist>> {
    let dataset = DatasetBase::from(data.to_owned());
    let rng = SmallRng::seed_from_u64(random_state);
    KMeans::params_with_rng(k, rng)
        .max_n_iterations(max_iter)
        .tolerance(tolerance)
        .fit(&dataset)
        .map_err(|e| Error::Algorithm(format!("K-means failed: {e}")))
}

/// Sweep K over the inclusive range, recording inertia and silhouette,
/// then let the selection heuristic pick.
fn select_k(
    config: &KmeansConfig,
    data: ArrayView2<'_, f64>,
    lo: usize,
    hi: usize,
    random_state: u64,
) -> Result<usize> {
    let n = data.nrows();
    let lo = lo.max(2);
    let hi = hi.min(n.saturating_sub(1)).max(lo);

    let mut ks = Vec::new();
    let mut inertias = Vec::new();
    let mut silhouettes = Vec::new();
    for k in lo..=hi {
        let model = fit_kmeans(data, k, config.max_iter, config.tolerance, random_state)?;
        let labels: Vec<i64> = model
            .predict(&DatasetBase::from(data.to_owned()))
            .iter()
            .map(|&c| c as i64)
            .collect();
        ks.push(k);
        inertias.push(model.inertia());
        silhouettes.push(metrics::silhouette_score(data, &labels));
    }

    let chosen = params::choose_k(
        &ks,
        &inertias,
        &silhouettes,
        config.silhouette_preference_threshold,
    );
    debug!(chosen, lo, hi, "auto-selected cluster count");
    Ok(chosen)
}

fn run_dbscan(data: ArrayView2<'_, f64>, eps: f64, min_samples: usize) -> Result<Vec<i64>> {
    let params = Dbscan::params(min_samples)
        .tolerance(eps)
        .check()
        .map_err(|e| Error::Algorithm(format!("DBSCAN params invalid: {e}")))?;
    let clusters = params.transform(&data.to_owned());
    Ok(clusters
        .iter()
        .map(|c| c.map_or(hdbscan::NOISE, |id| id as i64))
        .collect())
}

/// Grid-search eps and min_samples, scoring silhouette scaled by the
/// non-noise fraction. Defaults survive when every candidate degenerates.
#[allow(clippy::cast_precision_loss)]
fn tune_dbscan(data: ArrayView2<'_, f64>) -> (f64, usize) {
    let base = params::dbscan_eps_base(data);
    let n = data.nrows() as f64;

    let mut best: Option<((f64, usize), f64)> = None;
    for &factor in &params::EPS_FACTORS {
        let eps = base * factor;
        for &min_samples in &params::MIN_SAMPLES_GRID {
            let Ok(labels) = run_dbscan(data, eps, min_samples) else {
                continue;
            };
            let noise_ratio =
                labels.iter().filter(|&&l| l == hdbscan::NOISE).count() as f64 / n;
            let Some(silhouette) = metrics::silhouette_score(data, &labels) else {
                continue;
            };
            let score = silhouette * (1.0 - noise_ratio);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some(((eps, min_samples), score));
            }
        }
    }

    let (resolved, score) = best.unwrap_or(((base, 5), f64::NAN));
    debug!(eps = resolved.0, min_samples = resolved.1, score, "dbscan auto-tuned");
    resolved
}

/// Bottom-up hierarchical merging with the configured linkage, stopping
/// at the requested cluster count.
fn agglomerate(data: ArrayView2<'_, f64>, n_clusters: usize, linkage: Linkage) -> Vec<i64> {
    let n = data.nrows();
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();

    let dist = |i: usize, j: usize| -> f64 {
        data.row(i)
            .iter()
            .zip(data.row(j).iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    };

    while members.len() > n_clusters {
        let mut best = (0usize, 1usize, f64::INFINITY);
        for a in 0..members.len() {
            for b in a + 1..members.len() {
                let d = linkage_distance(&members[a], &members[b], linkage, &dist);
                if d < best.2 {
                    best = (a, b, d);
                }
            }
        }
        let merged = members.remove(best.1);
        members[best.0].extend(merged);
    }

    let mut labels = vec![0i64; n];
    for (cluster_id, cluster) in members.iter().enumerate() {
        for &i in cluster {
            labels[i] = cluster_id as i64;
        }
    }
    labels
}

fn linkage_distance(
    a: &[usize],
    b: &[usize],
    linkage: Linkage,
    dist: &impl Fn(usize, usize) -> f64,
) -> f64 {
    match linkage {
        Linkage::Average => {
            let total: f64 = a
                .iter()
                .flat_map(|&i| b.iter().map(move |&j| dist(i, j)))
                .sum();
            #[allow(clippy::cast_precision_loss)]
            {
                total / (a.len() * b.len()) as f64
            }
        }
        Linkage::Complete => a
            .iter()
            .flat_map(|&i| b.iter().map(move |&j| dist(i, j)))
            .fold(f64::NEG_INFINITY, f64::max),
        Linkage::Single => a
            .iter()
            .flat_map(|&i| b.iter().map(move |&j| dist(i, j)))
            .fold(f64::INFINITY, f64::min),
    }
}

/// Quality metrics plus a structural summary of the labelling.
#[allow(clippy::cast_precision_loss)]
fn label_summary(
    data: ArrayView2<'_, f64>,
    labels: &[i64],
) -> (BTreeMap<String, f64>, Value) {
    let mut sizes: BTreeMap<i64, usize> = BTreeMap::new();
    let mut n_noise = 0usize;
    for &label in labels {
        if label == hdbscan::NOISE {
            n_noise += 1;
        } else {
            *sizes.entry(label).or_insert(0) += 1;
        }
    }

    let mut metrics_map = BTreeMap::new();
    metrics_map.insert("n_clusters".into(), sizes.len() as f64);
    metrics_map.insert("n_noise".into(), n_noise as f64);
    if let Some(s) = metrics::silhouette_score(data, labels) {
        metrics_map.insert("silhouette".into(), s);
    }
    if let Some(ch) = metrics::calinski_harabasz_score(data, labels) {
        metrics_map.insert("calinski_harabasz".into(), ch);
    }
    if let Some(db) = metrics::davies_bouldin_score(data, labels) {
        metrics_map.insert("davies_bouldin".into(), db);
    }

    let metadata = json!({
        "cluster_sizes": sizes,
        "n_noise": n_noise,
    });
    (metrics_map, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Three well-separated blobs in 3D.
    fn three_blobs() -> Array2<f64> {
        let centers = [[0.0, 0.0, 0.0], [10.0, 10.0, 0.0], [0.0, 10.0, 10.0]];
        let mut rows = Vec::new();
        for center in &centers {
            for i in 0..10 {
                let jitter = (i % 5) as f64 * 0.1;
                rows.push([center[0] + jitter, center[1] - jitter, center[2] + jitter]);
            }
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Array2::from_shape_vec((rows.len(), 3), flat).unwrap()
    }

    fn config_for(method: ClusteringMethod) -> ProcessingConfig {
        ProcessingConfig {
            clustering_method: method,
            ..ProcessingConfig::default()
        }
    }

    #[test]
    fn test_transform_before_fit_fails() {
        let clusterer = Clusterer::from_config(&config_for(ClusteringMethod::Kmeans));
        let data = three_blobs();
        assert!(matches!(
            clusterer.transform(data.view()),
            Err(Error::NotFitted(_))
        ));
    }

    #[test]
    fn test_kmeans_recovers_three_blobs() {
        let mut clusterer = Clusterer::from_config(&config_for(ClusteringMethod::Kmeans));
        let data = three_blobs();
        let result = clusterer.fit_transform(data.view()).unwrap();
        let labels = result.labels().unwrap();

        assert_eq!(labels.len(), 30);
        // Each blob must be internally consistent
        for blob in 0..3 {
            let first = labels[blob * 10];
            assert!(labels[blob * 10..(blob + 1) * 10].iter().all(|&l| l == first));
        }
        assert!((result.metrics["n_clusters"] - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_kmeans_auto_k_finds_three() {
        let config = ProcessingConfig {
            clustering_method: ClusteringMethod::Kmeans,
            kmeans: KmeansConfig {
                auto_k_range: Some((2, 6)),
                ..KmeansConfig::default()
            },
            ..ProcessingConfig::default()
        };
        let mut clusterer = Clusterer::from_config(&config);
        let data = three_blobs();
        let result = clusterer.fit_transform(data.view()).unwrap();
        assert_eq!(result.params["n_clusters"], 3);
    }

    #[test]
    fn test_kmeans_too_many_clusters_rejected() {
        let config = ProcessingConfig {
            clustering_method: ClusteringMethod::Kmeans,
            kmeans: KmeansConfig {
                n_clusters: 50,
                ..KmeansConfig::default()
            },
            ..ProcessingConfig::default()
        };
        let mut clusterer = Clusterer::from_config(&config);
        let data = three_blobs();
        assert!(matches!(
            clusterer.fit(data.view()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_dbscan_auto_params_separates_blobs() {
        let config = ProcessingConfig {
            clustering_method: ClusteringMethod::Dbscan,
            dbscan: DbscanConfig {
                auto_params: true,
                ..DbscanConfig::default()
            },
            ..ProcessingConfig::default()
        };
        let mut clusterer = Clusterer::from_config(&config);
        let data = three_blobs();
        let result = clusterer.fit_transform(data.view()).unwrap();
        assert!(result.metrics["n_clusters"] >= 2.0);
    }

    #[test]
    fn test_dbscan_noise_labelled_minus_one() {
        let config = ProcessingConfig {
            clustering_method: ClusteringMethod::Dbscan,
            dbscan: DbscanConfig {
                eps: 0.5,
                min_samples: 3,
                auto_params: false,
            },
            ..ProcessingConfig::default()
        };
        let mut clusterer = Clusterer::from_config(&config);

        // Blobs plus one far-away straggler
        let mut data = three_blobs().into_raw_vec();
        data.extend([100.0, 100.0, 100.0]);
        let data = Array2::from_shape_vec((31, 3), data).unwrap();

        let result = clusterer.fit_transform(data.view()).unwrap();
        let labels = result.labels().unwrap();
        assert_eq!(labels[30], -1);
    }

    #[test]
    fn test_hdbscan_adapter_runs() {
        let mut clusterer = Clusterer::from_config(&config_for(ClusteringMethod::Hdbscan));
        let data = three_blobs();
        let result = clusterer.fit_transform(data.view()).unwrap();
        assert!(result.metrics["n_clusters"] >= 2.0);
    }

    #[test]
    fn test_agglomerative_exact_cluster_count() {
        for linkage in [Linkage::Average, Linkage::Complete, Linkage::Single] {
            let config = ProcessingConfig {
                clustering_method: ClusteringMethod::Agglomerative,
                agglomerative: AgglomerativeConfig {
                    n_clusters: 3,
                    linkage,
                },
                ..ProcessingConfig::default()
            };
            let mut clusterer = Clusterer::from_config(&config);
            let data = three_blobs();
            let result = clusterer.fit_transform(data.view()).unwrap();
            assert!((result.metrics["n_clusters"] - 3.0).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn test_gaussian_mixture_labels_every_row() {
        let mut clusterer =
            Clusterer::from_config(&config_for(ClusteringMethod::GaussianMixture));
        let data = three_blobs();
        let result = clusterer.fit_transform(data.view()).unwrap();
        assert_eq!(result.labels().unwrap().len(), 30);
    }

    #[test]
    fn test_metrics_reported_for_clean_labelling() {
        let mut clusterer = Clusterer::from_config(&config_for(ClusteringMethod::Kmeans));
        let data = three_blobs();
        let result = clusterer.fit_transform(data.view()).unwrap();
        assert!(result.metrics["silhouette"] > 0.5);
        assert!(result.metrics.contains_key("davies_bouldin"));
    }
}
