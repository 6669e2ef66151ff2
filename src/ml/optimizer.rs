//! Grid and random hyperparameter search.
//!
//! Parameter spaces are immutable tables adjusted to the dataset shape
//! before expansion. Trials run on the blocking pool under a dedicated
//! semaphore; a failed trial records score -1.0 with its error and is
//! excluded from best selection.

use crate::ml::clustering::Clusterer;
use crate::ml::params;
use crate::ml::reduction::Reducer;
use crate::structs::{
    AlgorithmResult, ClusteringMethod, Error, OptimizationResult, ProcessingConfig,
    ReductionMethod, Result, TrialOutcome,
};
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// What the optimizer is tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeAlgorithm {
    Clustering(ClusteringMethod),
    Reduction(ReductionMethod),
}

impl OptimizeAlgorithm {
    /// Parse a CLI algorithm name.
    ///
    /// # Errors
    /// Returns `Error::UnsupportedMethod` for unknown names.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "kmeans" => Ok(Self::Clustering(ClusteringMethod::Kmeans)),
            "dbscan" => Ok(Self::Clustering(ClusteringMethod::Dbscan)),
            "hdbscan" => Ok(Self::Clustering(ClusteringMethod::Hdbscan)),
            "agglomerative" => Ok(Self::Clustering(ClusteringMethod::Agglomerative)),
            "gaussian_mixture" => Ok(Self::Clustering(ClusteringMethod::GaussianMixture)),
            "pca" => Ok(Self::Reduction(ReductionMethod::Pca)),
            "kernel_pca" => Ok(Self::Reduction(ReductionMethod::KernelPca)),
            "tsne" => Ok(Self::Reduction(ReductionMethod::Tsne)),
            "mds" => Ok(Self::Reduction(ReductionMethod::Mds)),
            other => Err(Error::UnsupportedMethod(other.to_string())),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Clustering(ClusteringMethod::Kmeans) => "kmeans",
            Self::Clustering(ClusteringMethod::Dbscan) => "dbscan",
            Self::Clustering(ClusteringMethod::Hdbscan) => "hdbscan",
            Self::Clustering(ClusteringMethod::Agglomerative) => "agglomerative",
            Self::Clustering(ClusteringMethod::GaussianMixture) => "gaussian_mixture",
            Self::Reduction(ReductionMethod::Pca) => "pca",
            Self::Reduction(ReductionMethod::KernelPca) => "kernel_pca",
            Self::Reduction(ReductionMethod::Tsne) => "tsne",
            Self::Reduction(ReductionMethod::Mds) => "mds",
            Self::Reduction(ReductionMethod::Umap) => "umap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    Grid,
    Random,
}

impl SearchMethod {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Grid => "grid",
            Self::Random => "random",
        }
    }
}

/// Objective used for clustering trials. Reduction trials always score
/// 0.7 x explained variance + 0.3 x embedding variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    Silhouette,
    CalinskiHarabasz,
    DaviesBouldin,
}

pub struct HyperparameterOptimizer {
    base: ProcessingConfig,
    objective: Objective,
    max_workers: usize,
}

impl HyperparameterOptimizer {
    #[must_use]
    pub fn new(base: ProcessingConfig) -> Self {
        Self {
            base,
            objective: Objective::Silhouette,
            max_workers: 4,
        }
    }

    #[must_use]
    pub fn with_objective(mut self, objective: Objective) -> Self {
        self.objective = objective;
        self
    }

    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Run the search over `data` (the preprocessed matrix for clustering
    /// and reduction alike).
    ///
    /// # Errors
    /// Returns `Error::UnsupportedMethod` for algorithms with no tunable
    /// backend, `Error::Optimization` when every trial fails.
    #[allow(clippy::cast_precision_loss)]
    pub async fn optimize(
        &self,
        algorithm: OptimizeAlgorithm,
        data: Arc<Array2<f64>>,
        method: SearchMethod,
        n_trials: usize,
    ) -> Result<OptimizationResult> {
        let started = Instant::now();
        let space = param_space(algorithm, &data)?;
        let mut combos = expand(&space);
        if combos.is_empty() {
            combos.push(Map::new());
        }

        if method == SearchMethod::Random && combos.len() > n_trials {
            let mut rng = SmallRng::seed_from_u64(self.base.random_state);
            combos.shuffle(&mut rng);
            combos.truncate(n_trials);
        }
        info!(
            algorithm = algorithm.name(),
            method = method.name(),
            trials = combos.len(),
            "optimization started"
        );

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut handles = Vec::with_capacity(combos.len());
        for combo in combos {
            let semaphore = Arc::clone(&semaphore);
            let data = Arc::clone(&data);
            let base = self.base.clone();
            let objective = self.objective;
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return failed_trial(&combo, "worker pool closed", 0.0);
                };
                let trial_started = Instant::now();
                let worker_combo = combo.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    run_trial(&base, algorithm, &worker_combo, &data, objective)
                })
                .await;
                match outcome {
                    Ok(trial) => trial,
                    Err(e) => failed_trial(
                        &combo,
                        &format!("trial panicked: {e}"),
                        trial_started.elapsed().as_secs_f64(),
                    ),
                }
            }));
        }

        let mut trials = Vec::with_capacity(handles.len());
        for handle in handles {
            let trial = handle
                .await
                .map_err(|e| Error::Optimization(format!("trial task failed: {e}")))?;
            trials.push(trial);
        }

        // Best successful trial, first occurrence wins ties
        let mut best: Option<&TrialOutcome> = None;
        for trial in trials.iter().filter(|t| t.error.is_none()) {
            if best.map_or(true, |b| trial.score > b.score) {
                best = Some(trial);
            }
        }
        let best = best.ok_or_else(|| {
            Error::Optimization(format!(
                "all {} trials failed for {}",
                trials.len(),
                algorithm.name()
            ))
        })?;

        info!(
            best_score = best.score,
            elapsed = ?started.elapsed(),
            "optimization finished"
        );
        Ok(OptimizationResult {
            best_params: best.params.clone(),
            best_score: best.score,
            n_trials: trials.len(),
            total_time_secs: started.elapsed().as_secs_f64(),
            search_method: method.name().to_string(),
            trials,
        })
    }
}

/// Shape-adjusted parameter table for one algorithm.
fn param_space(
    algorithm: OptimizeAlgorithm,
    data: &Array2<f64>,
) -> Result<Vec<(String, Vec<Value>)>> {
    let n = data.nrows();
    let k_values = |cap: usize| -> Vec<Value> {
        (2..=cap.min(n.saturating_sub(1)).max(2))
            .map(|k| json!(k))
            .collect()
    };

    let space = match algorithm {
        OptimizeAlgorithm::Clustering(ClusteringMethod::Kmeans) => {
            vec![("n_clusters".to_string(), k_values(10))]
        }
        OptimizeAlgorithm::Clustering(ClusteringMethod::Dbscan) => {
            let base = params::dbscan_eps_base(data.view());
            vec![
                (
                    "eps".to_string(),
                    params::EPS_FACTORS.iter().map(|f| json!(base * f)).collect(),
                ),
                (
                    "min_samples".to_string(),
                    params::MIN_SAMPLES_GRID.iter().map(|m| json!(m)).collect(),
                ),
            ]
        }
        OptimizeAlgorithm::Clustering(ClusteringMethod::Hdbscan) => vec![(
            "min_cluster_size".to_string(),
            [3usize, 5, 10, 15]
                .iter()
                .filter(|&&s| s <= n)
                .map(|s| json!(s))
                .collect(),
        )],
        OptimizeAlgorithm::Clustering(ClusteringMethod::Agglomerative) => vec![
            ("n_clusters".to_string(), k_values(8)),
            (
                "linkage".to_string(),
                vec![json!("average"), json!("complete"), json!("single")],
            ),
        ],
        OptimizeAlgorithm::Clustering(ClusteringMethod::GaussianMixture) => {
            vec![("n_clusters".to_string(), k_values(8))]
        }
        OptimizeAlgorithm::Reduction(ReductionMethod::Pca) => {
            vec![("whiten".to_string(), vec![json!(false), json!(true)])]
        }
        OptimizeAlgorithm::Reduction(ReductionMethod::KernelPca) => vec![(
            "gamma".to_string(),
            vec![json!(0.001), json!(0.01), json!(0.1), json!(1.0)],
        )],
        OptimizeAlgorithm::Reduction(ReductionMethod::Tsne) => vec![
            (
                "perplexity".to_string(),
                vec![json!(5.0), json!(10.0), json!(30.0), json!(50.0)],
            ),
            (
                "learning_rate".to_string(),
                vec![json!(50.0), json!(200.0), json!(500.0)],
            ),
        ],
        OptimizeAlgorithm::Reduction(ReductionMethod::Mds) => Vec::new(),
        OptimizeAlgorithm::Reduction(ReductionMethod::Umap) => {
            return Err(Error::UnsupportedMethod(
                "umap has no tunable backend".to_string(),
            ));
        }
    };
    Ok(space)
}

/// Cross-product expansion of the parameter table.
fn expand(space: &[(String, Vec<Value>)]) -> Vec<Map<String, Value>> {
    let mut combos = vec![Map::new()];
    for (name, values) in space {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.insert(name.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    if space.is_empty() {
        combos.clear();
    }
    combos
}

fn failed_trial(combo: &Map<String, Value>, message: &str, elapsed_secs: f64) -> TrialOutcome {
    warn!(error = message, "trial failed");
    TrialOutcome {
        params: Value::Object(combo.clone()),
        score: -1.0,
        elapsed_secs,
        error: Some(message.to_string()),
    }
}

fn run_trial(
    base: &ProcessingConfig,
    algorithm: OptimizeAlgorithm,
    combo: &Map<String, Value>,
    data: &Array2<f64>,
    objective: Objective,
) -> TrialOutcome {
    let started = Instant::now();
    let result = apply_params(base, algorithm, combo).and_then(|config| match algorithm {
        OptimizeAlgorithm::Clustering(_) => {
            Clusterer::from_config(&config).fit_transform(data.view())
        }
        OptimizeAlgorithm::Reduction(_) => {
            Reducer::from_config(&config).fit_transform(data.view())
        }
    });

    match result {
        Ok(outcome) => {
            let score = score_trial(algorithm, &outcome, objective);
            debug!(score, "trial scored");
            TrialOutcome {
                params: Value::Object(combo.clone()),
                score,
                elapsed_secs: started.elapsed().as_secs_f64(),
                error: None,
            }
        }
        Err(e) => failed_trial(combo, &e.to_string(), started.elapsed().as_secs_f64()),
    }
}

/// Clustering trials score by the configured validity metric (-1.0 when
/// it is not computable); reduction trials blend explained variance with
/// embedding spread.
fn score_trial(
    algorithm: OptimizeAlgorithm,
    result: &AlgorithmResult,
    objective: Objective,
) -> f64 {
    match algorithm {
        OptimizeAlgorithm::Clustering(_) => match objective {
            Objective::Silhouette => result.metrics.get("silhouette").copied().unwrap_or(-1.0),
            Objective::CalinskiHarabasz => result
                .metrics
                .get("calinski_harabasz")
                .copied()
                .unwrap_or(-1.0),
            Objective::DaviesBouldin => result
                .metrics
                .get("davies_bouldin")
                .copied()
                .map_or(-1.0, |db| -db),
        },
        OptimizeAlgorithm::Reduction(_) => {
            let variance = result.metrics.get("embedding_variance").copied().unwrap_or(0.0);
            match result.metrics.get("explained_variance") {
                Some(&explained) => 0.7 * explained + 0.3 * variance,
                None => variance,
            }
        }
    }
}

/// Overlay one trial's parameters onto a copy of the base configuration.
fn apply_params(
    base: &ProcessingConfig,
    algorithm: OptimizeAlgorithm,
    combo: &Map<String, Value>,
) -> Result<ProcessingConfig> {
    let mut config = base.clone();
    match algorithm {
        OptimizeAlgorithm::Clustering(method) => config.clustering_method = method,
        OptimizeAlgorithm::Reduction(method) => config.reduction_method = method,
    }

    for (name, value) in combo {
        let bad = || Error::Optimization(format!("bad value for {name}: {value}"));
        match (algorithm, name.as_str()) {
            (OptimizeAlgorithm::Clustering(ClusteringMethod::Kmeans), "n_clusters") => {
                config.kmeans.n_clusters = value.as_u64().ok_or_else(bad)? as usize;
                config.kmeans.auto_k_range = None;
            }
            (OptimizeAlgorithm::Clustering(ClusteringMethod::Dbscan), "eps") => {
                config.dbscan.eps = value.as_f64().ok_or_else(bad)?;
                config.dbscan.auto_params = false;
            }
            (OptimizeAlgorithm::Clustering(ClusteringMethod::Dbscan), "min_samples") => {
                config.dbscan.min_samples = value.as_u64().ok_or_else(bad)? as usize;
                config.dbscan.auto_params = false;
            }
            (OptimizeAlgorithm::Clustering(ClusteringMethod::Hdbscan), "min_cluster_size") => {
                config.hdbscan.min_cluster_size = value.as_u64().ok_or_else(bad)? as usize;
            }
            (OptimizeAlgorithm::Clustering(ClusteringMethod::Agglomerative), "n_clusters") => {
                config.agglomerative.n_clusters = value.as_u64().ok_or_else(bad)? as usize;
            }
            (OptimizeAlgorithm::Clustering(ClusteringMethod::Agglomerative), "linkage") => {
                config.agglomerative.linkage =
                    serde_json::from_value(value.clone()).map_err(|_| bad())?;
            }
            (OptimizeAlgorithm::Clustering(ClusteringMethod::GaussianMixture), "n_clusters") => {
                config.gaussian_mixture.n_clusters = value.as_u64().ok_or_else(bad)? as usize;
            }
            (OptimizeAlgorithm::Reduction(ReductionMethod::Pca), "whiten") => {
                config.pca.whiten = value.as_bool().ok_or_else(bad)?;
            }
            (OptimizeAlgorithm::Reduction(ReductionMethod::KernelPca), "gamma") => {
                config.kernel_pca.gamma = Some(value.as_f64().ok_or_else(bad)?);
            }
            (OptimizeAlgorithm::Reduction(ReductionMethod::Tsne), "perplexity") => {
                config.tsne.perplexity = value.as_f64().ok_or_else(bad)?;
            }
            (OptimizeAlgorithm::Reduction(ReductionMethod::Tsne), "learning_rate") => {
                config.tsne.learning_rate = value.as_f64().ok_or_else(bad)?;
            }
            _ => {
                return Err(Error::Optimization(format!(
                    "unknown parameter {name} for {}",
                    algorithm.name()
                )));
            }
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_blob_matrix() -> Arc<Array2<f64>> {
        let centers = [[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]];
        let mut rows = Vec::new();
        for center in &centers {
            for i in 0..12 {
                rows.push([
                    center[0] + (i % 4) as f64 * 0.2,
                    center[1] + (i % 3) as f64 * 0.2,
                ]);
            }
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Arc::new(Array2::from_shape_vec((rows.len(), 2), flat).unwrap())
    }

    #[test]
    fn test_expand_cross_product() {
        let space = vec![
            ("a".to_string(), vec![json!(1), json!(2)]),
            ("b".to_string(), vec![json!("x"), json!("y"), json!("z")]),
        ];
        let combos = expand(&space);
        assert_eq!(combos.len(), 6);
        assert!(combos.iter().all(|c| c.len() == 2));
    }

    #[test]
    fn test_algorithm_name_roundtrip() {
        for name in ["kmeans", "dbscan", "hdbscan", "pca", "tsne"] {
            assert_eq!(OptimizeAlgorithm::from_name(name).unwrap().name(), name);
        }
        assert!(OptimizeAlgorithm::from_name("tsnee").is_err());
    }

    #[tokio::test]
    async fn test_grid_search_kmeans_finds_three() {
        let optimizer = HyperparameterOptimizer::new(ProcessingConfig::default());
        let data = three_blob_matrix();
        let result = optimizer
            .optimize(
                OptimizeAlgorithm::Clustering(ClusteringMethod::Kmeans),
                data,
                SearchMethod::Grid,
                0,
            )
            .await
            .unwrap();

        assert_eq!(result.best_params["n_clusters"], 3);
        assert_eq!(result.search_method, "grid");
        // Best must dominate every successful trial
        for trial in result.trials.iter().filter(|t| t.error.is_none()) {
            assert!(result.best_score >= trial.score);
        }
    }

    #[tokio::test]
    async fn test_random_search_respects_trial_budget() {
        let optimizer = HyperparameterOptimizer::new(ProcessingConfig::default());
        let data = three_blob_matrix();
        let result = optimizer
            .optimize(
                OptimizeAlgorithm::Clustering(ClusteringMethod::Dbscan),
                data,
                SearchMethod::Random,
                5,
            )
            .await
            .unwrap();
        assert!(result.n_trials <= 5);
    }

    #[tokio::test]
    async fn test_random_search_seeded_reproducible() {
        let data = three_blob_matrix();
        let mut best_params = Vec::new();
        for _ in 0..2 {
            let optimizer = HyperparameterOptimizer::new(ProcessingConfig::default());
            let result = optimizer
                .optimize(
                    OptimizeAlgorithm::Clustering(ClusteringMethod::Kmeans),
                    Arc::clone(&data),
                    SearchMethod::Random,
                    3,
                )
                .await
                .unwrap();
            best_params.push(result.best_params);
        }
        assert_eq!(best_params[0], best_params[1]);
    }

    #[tokio::test]
    async fn test_reduction_search_scores_pca() {
        let optimizer = HyperparameterOptimizer::new(ProcessingConfig::default());
        let data = three_blob_matrix();
        let result = optimizer
            .optimize(
                OptimizeAlgorithm::Reduction(ReductionMethod::Pca),
                data,
                SearchMethod::Grid,
                0,
            )
            .await
            .unwrap();
        assert_eq!(result.n_trials, 2);
        assert!(result.best_score > 0.0);
    }

    #[tokio::test]
    async fn test_all_failed_trials_error() {
        // One sample: every clustering trial must fail validation
        let optimizer = HyperparameterOptimizer::new(ProcessingConfig::default());
        let data = Arc::new(Array2::from_shape_vec((1, 2), vec![0.0, 0.0]).unwrap());
        let result = optimizer
            .optimize(
                OptimizeAlgorithm::Clustering(ClusteringMethod::Kmeans),
                data,
                SearchMethod::Grid,
                0,
            )
            .await;
        assert!(matches!(result, Err(Error::Optimization(_))));
    }

    #[tokio::test]
    async fn test_umap_rejected_up_front() {
        let optimizer = HyperparameterOptimizer::new(ProcessingConfig::default());
        let data = three_blob_matrix();
        let result = optimizer
            .optimize(
                OptimizeAlgorithm::Reduction(ReductionMethod::Umap),
                data,
                SearchMethod::Grid,
                0,
            )
            .await;
        assert!(matches!(result, Err(Error::UnsupportedMethod(_))));
    }
}
