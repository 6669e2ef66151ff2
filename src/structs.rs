//! Consolidated public types for the pointcloud crate
//!
//! This module contains all public structs, enums, and traits used across the crate.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum Error {
    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Algorithm error: {0}")]
    Algorithm(String),

    #[error("{0} used before fit")]
    NotFitted(&'static str),

    #[error("Optimization error: {0}")]
    Optimization(String),

    #[error("Task conflict: {0}")]
    TaskConflict(String),

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Processing Stages
// ============================================================================

/// Fixed pipeline stages, executed in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Preprocessing,
    DimensionalityReduction,
    Clustering,
    AnomalyDetection,
    Validation,
    Finalization,
}

impl Stage {
    pub const ALL: [Self; 6] = [
        Self::Preprocessing,
        Self::DimensionalityReduction,
        Self::Clustering,
        Self::AnomalyDetection,
        Self::Validation,
        Self::Finalization,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Preprocessing => "preprocessing",
            Self::DimensionalityReduction => "dimensionality_reduction",
            Self::Clustering => "clustering",
            Self::AnomalyDetection => "anomaly_detection",
            Self::Validation => "validation",
            Self::Finalization => "finalization",
        }
    }

    /// Progress percentage reported when this stage begins: its index over
    /// the stage count.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(self) -> f64 {
        let index = Self::ALL.iter().position(|&s| s == self).unwrap_or(0);
        index as f64 / Self::ALL.len() as f64 * 100.0
    }
}

/// Progress update emitted at stage transitions.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub dataset_id: String,
    pub stage: String,
    pub progress: f64,
    pub message: String,
}

// ============================================================================
// Algorithm Results
// ============================================================================

/// The data an algorithm stage produces.
#[derive(Debug, Clone)]
pub enum AlgorithmOutput {
    /// 3D embedding, one row per sample.
    Embedding(Array2<f64>),
    /// Cluster labels, -1 for noise.
    Labels(Vec<i64>),
    /// Indices of samples flagged anomalous.
    AnomalyIndices(Vec<usize>),
}

/// Immutable record of one algorithm execution.
#[derive(Debug, Clone)]
pub struct AlgorithmResult {
    pub output: AlgorithmOutput,
    /// Algorithm-specific extras (thresholds, variance ratios, noise counts).
    pub metadata: Value,
    /// Numeric performance metrics keyed by name.
    pub metrics: BTreeMap<String, f64>,
    pub elapsed: Duration,
    /// Exact parameters used, after adaptation.
    pub params: Value,
}

impl AlgorithmResult {
    #[must_use]
    pub fn embedding(&self) -> Option<&Array2<f64>> {
        match &self.output {
            AlgorithmOutput::Embedding(e) => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn labels(&self) -> Option<&[i64]> {
        match &self.output {
            AlgorithmOutput::Labels(l) => Some(l),
            _ => None,
        }
    }

    #[must_use]
    pub fn anomaly_indices(&self) -> Option<&[usize]> {
        match &self.output {
            AlgorithmOutput::AnomalyIndices(a) => Some(a),
            _ => None,
        }
    }
}

/// Per-run state threaded through the pipeline.
#[derive(Debug)]
pub struct ProcessingContext {
    pub dataset_id: String,
    pub owner_id: Option<String>,
    pub stage: Stage,
    /// Monotonically non-decreasing, 0..=100.
    pub progress: f64,
    pub started: std::time::Instant,
    pub stage_results: BTreeMap<Stage, AlgorithmResult>,
}

impl ProcessingContext {
    #[must_use]
    pub fn new(dataset_id: impl Into<String>, owner_id: Option<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            owner_id,
            stage: Stage::Preprocessing,
            progress: 0.0,
            started: std::time::Instant::now(),
            stage_results: BTreeMap::new(),
        }
    }

    /// Advance to `stage`, never letting progress move backwards.
    pub fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        self.progress = self.progress.max(stage.percent());
    }
}

// ============================================================================
// Table Data
// ============================================================================

/// Represents a parsed CSV/TSV file with headers and rows
#[derive(Debug, Clone)]
pub struct TableData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TableData {
    /// Get number of rows
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Get number of columns
    #[must_use]
    pub fn col_count(&self) -> usize {
        self.headers.len()
    }

    /// Get column index by name
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Get a column as a vector of strings
    #[must_use]
    pub fn column(&self, index: usize) -> Option<Vec<&str>> {
        if index >= self.headers.len() {
            return None;
        }
        Some(
            self.rows
                .iter()
                .filter_map(|row| row.get(index).map(String::as_str))
                .collect(),
        )
    }

    /// Find columns that contain numeric data
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn numeric_column_indices(&self) -> Vec<usize> {
        (0..self.col_count())
            .filter(|&i| {
                self.column(i).is_some_and(|col| {
                    // Consider numeric if at least 50% of non-empty values parse as numbers
                    let non_empty: Vec<_> = col.iter().filter(|s| !s.is_empty()).collect();
                    if non_empty.is_empty() {
                        return false;
                    }
                    let numeric_count = non_empty
                        .iter()
                        .filter(|s| s.parse::<f64>().is_ok())
                        .count();
                    numeric_count as f64 / non_empty.len() as f64 >= 0.5
                })
            })
            .collect()
    }

    /// Convert rows to JSON maps keyed by header, numbers parsed where possible.
    #[must_use]
    pub fn to_records(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.headers
                    .iter()
                    .zip(row.iter())
                    .map(|(h, v)| {
                        let value = if v.is_empty() {
                            Value::Null
                        } else if let Ok(n) = v.parse::<f64>() {
                            serde_json::Number::from_f64(n)
                                .map_or_else(|| Value::String(v.clone()), Value::Number)
                        } else {
                            Value::String(v.clone())
                        };
                        (h.clone(), value)
                    })
                    .collect()
            })
            .collect()
    }
}

// ============================================================================
// Feature Matrix
// ============================================================================

/// Numeric feature matrix produced by preprocessing
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    /// Feature names (column headers)
    pub names: Vec<String>,
    /// Samples x features
    pub data: Array2<f64>,
    /// Original row indices (for mapping back after sampling/drops)
    pub row_indices: Vec<usize>,
}

impl FeatureMatrix {
    /// Get number of samples (rows)
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.data.nrows()
    }

    /// Get number of features (columns)
    #[must_use]
    pub fn n_features(&self) -> usize {
        self.data.ncols()
    }
}

/// Preprocessing output: the matrix plus an audit trail of applied steps.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub matrix: FeatureMatrix,
    pub steps: Vec<String>,
    pub warnings: Vec<String>,
}

// ============================================================================
// Configuration
// ============================================================================

fn default_random_state() -> u64 {
    42
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionMethod {
    Pca,
    KernelPca,
    Tsne,
    Mds,
    Umap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringMethod {
    Kmeans,
    Dbscan,
    Hdbscan,
    Agglomerative,
    GaussianMixture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyMethod {
    IsolationForest,
    OneClassSvm,
    LocalOutlierFactor,
    EllipticEnvelope,
    Ensemble,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TsneConfig {
    pub perplexity: f64,
    pub learning_rate: f64,
    pub n_iter: usize,
}

impl Default for TsneConfig {
    fn default() -> Self {
        Self {
            perplexity: 30.0,
            learning_rate: 200.0,
            n_iter: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UmapConfig {
    pub n_neighbors: usize,
    pub min_dist: f64,
    pub n_epochs: Option<usize>,
    pub low_memory: bool,
}

impl Default for UmapConfig {
    fn default() -> Self {
        Self {
            n_neighbors: 15,
            min_dist: 0.1,
            n_epochs: None,
            low_memory: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaConfig {
    pub whiten: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelPcaConfig {
    /// RBF kernel width; `None` means 1 / n_features.
    pub gamma: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KmeansConfig {
    pub n_clusters: usize,
    pub max_iter: u64,
    pub tolerance: f64,
    /// When set, `n_clusters` is chosen automatically over this inclusive range.
    pub auto_k_range: Option<(usize, usize)>,
    /// Silhouette score above which the silhouette-optimal K wins over the
    /// elbow K during auto selection. Heuristic cutoff, overridable.
    pub silhouette_preference_threshold: f64,
}

impl Default for KmeansConfig {
    fn default() -> Self {
        Self {
            n_clusters: 3,
            max_iter: 300,
            tolerance: 1e-4,
            auto_k_range: None,
            silhouette_preference_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbscanConfig {
    pub eps: f64,
    pub min_samples: usize,
    /// Estimate eps/min_samples from the data instead of using the above.
    pub auto_params: bool,
}

impl Default for DbscanConfig {
    fn default() -> Self {
        Self {
            eps: 0.5,
            min_samples: 5,
            auto_params: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HdbscanConfig {
    pub min_cluster_size: usize,
    pub min_samples: Option<usize>,
}

impl Default for HdbscanConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 5,
            min_samples: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Linkage {
    Average,
    Complete,
    Single,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgglomerativeConfig {
    pub n_clusters: usize,
    pub linkage: Linkage,
}

impl Default for AgglomerativeConfig {
    fn default() -> Self {
        Self {
            n_clusters: 3,
            linkage: Linkage::Average,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GaussianMixtureConfig {
    pub n_clusters: usize,
    pub max_iter: u64,
    pub tolerance: f64,
}

impl Default for GaussianMixtureConfig {
    fn default() -> Self {
        Self {
            n_clusters: 3,
            max_iter: 100,
            tolerance: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestConfig {
    pub n_estimators: usize,
    pub max_samples: usize,
    /// Expected anomaly fraction; `None` estimates it from IQR outlier rates.
    pub contamination: Option<f64>,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        Self {
            n_estimators: 100,
            max_samples: 256,
            contamination: Some(0.1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LofConfig {
    pub n_neighbors: usize,
    pub contamination: f64,
}

impl Default for LofConfig {
    fn default() -> Self {
        Self {
            n_neighbors: 20,
            contamination: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OneClassSvmConfig {
    /// RBF kernel width; `None` means 1 / n_features.
    pub gamma: Option<f64>,
    pub contamination: f64,
}

impl Default for OneClassSvmConfig {
    fn default() -> Self {
        Self {
            gamma: None,
            contamination: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EllipticEnvelopeConfig {
    pub contamination: f64,
}

impl Default for EllipticEnvelopeConfig {
    fn default() -> Self {
        Self { contamination: 0.1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub members: Vec<AnomalyMethod>,
    /// Per-member weights, normalized to sum 1; `None` means equal.
    pub weights: Option<Vec<f64>>,
    /// Fraction of members that must vote anomalous.
    pub vote_threshold: f64,
    pub contamination: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            members: vec![
                AnomalyMethod::IsolationForest,
                AnomalyMethod::LocalOutlierFactor,
                AnomalyMethod::EllipticEnvelope,
            ],
            weights: None,
            vote_threshold: 0.5,
            contamination: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingStrategy {
    Drop,
    Mean,
    Median,
    Mode,
    Knn,
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum OutlierStrategy {
    /// Clip values outside Q1 - 1.5*IQR .. Q3 + 1.5*IQR.
    IqrClip,
    /// Remove rows with any |z| above the threshold.
    ZScoreRemove { threshold: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMethod {
    Standard,
    MinMax,
    Robust,
    Power,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "method")]
pub enum FeatureSelection {
    /// Drop features with variance below the threshold.
    Variance { threshold: f64 },
    /// Keep the k features most correlated with the target column.
    Univariate { target: String, k: usize },
    /// Keep the k features with the largest least-squares coefficients
    /// against the target, computed on standardized features.
    ModelBased { target: String, k: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Explicit feature columns; `None` auto-detects numeric columns.
    pub feature_columns: Option<Vec<String>>,
    pub handle_missing: MissingStrategy,
    pub knn_neighbors: usize,
    pub outliers: Option<OutlierStrategy>,
    pub scaling: ScalingMethod,
    pub feature_selection: Option<FeatureSelection>,
    pub max_samples: Option<usize>,
    /// Column to stratify by when sampling.
    pub stratify_column: Option<String>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            feature_columns: None,
            handle_missing: MissingStrategy::Drop,
            knn_neighbors: 5,
            outliers: None,
            scaling: ScalingMethod::Standard,
            feature_selection: None,
            max_samples: None,
            stratify_column: None,
        }
    }
}

/// Complete configuration for one processing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub reduction_method: ReductionMethod,
    pub clustering_method: ClusteringMethod,
    pub detect_anomalies: bool,
    pub anomaly_method: AnomalyMethod,
    #[serde(default = "default_random_state")]
    pub random_state: u64,

    pub tsne: TsneConfig,
    pub umap: UmapConfig,
    pub pca: PcaConfig,
    pub kernel_pca: KernelPcaConfig,

    pub kmeans: KmeansConfig,
    pub dbscan: DbscanConfig,
    pub hdbscan: HdbscanConfig,
    pub agglomerative: AgglomerativeConfig,
    pub gaussian_mixture: GaussianMixtureConfig,

    pub isolation_forest: IsolationForestConfig,
    pub lof: LofConfig,
    pub one_class_svm: OneClassSvmConfig,
    pub elliptic_envelope: EllipticEnvelopeConfig,
    pub ensemble: EnsembleConfig,

    pub preprocess: PreprocessConfig,

    /// Column used to scale point sizes into [0.5, 2.0].
    pub size_column: Option<String>,
    /// Column whose value becomes the point label in the original row payload.
    pub label_column: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            reduction_method: ReductionMethod::Pca,
            clustering_method: ClusteringMethod::Kmeans,
            detect_anomalies: true,
            anomaly_method: AnomalyMethod::IsolationForest,
            random_state: default_random_state(),
            tsne: TsneConfig::default(),
            umap: UmapConfig::default(),
            pca: PcaConfig::default(),
            kernel_pca: KernelPcaConfig::default(),
            kmeans: KmeansConfig::default(),
            dbscan: DbscanConfig::default(),
            hdbscan: HdbscanConfig::default(),
            agglomerative: AgglomerativeConfig::default(),
            gaussian_mixture: GaussianMixtureConfig::default(),
            isolation_forest: IsolationForestConfig::default(),
            lof: LofConfig::default(),
            one_class_svm: OneClassSvmConfig::default(),
            elliptic_envelope: EllipticEnvelopeConfig::default(),
            ensemble: EnsembleConfig::default(),
            preprocess: PreprocessConfig::default(),
            size_column: None,
            label_column: None,
        }
    }
}

// ============================================================================
// Point Cloud Output
// ============================================================================

/// A single 3D point in the visualization result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPoint {
    pub id: String,
    pub position: [f64; 3],
    /// Hex color, e.g. "#1F77B4".
    pub color: String,
    pub size: f64,
    /// Cluster assignment; -1 for noise.
    pub cluster: i64,
    pub is_anomaly: bool,
    pub original_data: serde_json::Map<String, Value>,
}

/// Aggregate information about one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    pub color: String,
    pub count: usize,
    /// Mean position of member points.
    pub center: [f64; 3],
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub total_points: usize,
    pub processing_time: f64,
    pub reduction_method: String,
    pub clustering_method: String,
    pub features_used: Vec<String>,
    pub preprocessing_steps: Vec<String>,
    /// Whole-run clustering validity metrics, when computable.
    pub performance: BTreeMap<String, f64>,
}

/// Complete result of one processing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub points: Vec<DataPoint>,
    pub clusters: Vec<Cluster>,
    /// IDs of anomalous points.
    pub anomalies: Vec<String>,
    pub metadata: ProcessingMetadata,
}

// ============================================================================
// Optimization Types
// ============================================================================

/// Outcome of a single optimization trial.
#[derive(Debug, Clone, Serialize)]
pub struct TrialOutcome {
    pub params: Value,
    /// Objective score; -1.0 for failed trials.
    pub score: f64,
    pub elapsed_secs: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    pub best_params: Value,
    pub best_score: f64,
    pub trials: Vec<TrialOutcome>,
    pub total_time_secs: f64,
    pub n_trials: usize,
    pub search_method: String,
}

// ============================================================================
// Task Types
// ============================================================================

/// Terminal or in-flight state of a background processing task.
#[derive(Debug, Clone)]
pub enum TaskStatus {
    Running,
    Completed(Box<ProcessingResult>),
    Failed(String),
    Cancelled,
    NotFound,
}

impl TaskStatus {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
        }
    }
}
