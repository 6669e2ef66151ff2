//! Anomaly detection adapters and the heterogeneous ensemble.
//!
//! Detectors score the preprocessed feature matrix (never the 3D
//! embedding). `fit` resolves parameters and trains on the given data,
//! `transform` produces flagged indices plus score statistics.

use crate::ml::forest::Forest;
use crate::ml::{params, stats};
use crate::structs::{
    AlgorithmOutput, AlgorithmResult, AnomalyMethod, EllipticEnvelopeConfig, EnsembleConfig,
    Error, IsolationForestConfig, LofConfig, OneClassSvmConfig, ProcessingConfig, Result,
};
use linfa_linalg::eigh::Eigh;
use ndarray::{Array1, Array2, ArrayView2};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

/// Single-method anomaly detector.
pub enum Detector {
    IsolationForest {
        config: IsolationForestConfig,
        random_state: u64,
        model: Option<(Forest, f64)>,
    },
    OneClassSvm {
        config: OneClassSvmConfig,
        model: Option<SvddModel>,
    },
    LocalOutlierFactor {
        config: LofConfig,
        /// k after clamping to n - 1.
        k: Option<usize>,
    },
    EllipticEnvelope {
        config: EllipticEnvelopeConfig,
        model: Option<EllipticModel>,
    },
}

/// Kernel-space mean model: the RBF SVDD decision function in the
/// all-support-vector limit. Anomaly score is the squared feature-space
/// distance to the mean of the training set.
pub struct SvddModel {
    gamma: f64,
    train: Array2<f64>,
    /// (1/n^2) * sum_ij k(x_i, x_j), precomputed at fit.
    mean_term: f64,
}

/// Mahalanobis model: mean vector and eigendecomposition-based precision.
pub struct EllipticModel {
    mean: Array1<f64>,
    precision: Array2<f64>,
}

impl Detector {
    /// Build a detector for one non-ensemble method.
    ///
    /// # Errors
    /// Returns `Error::Config` when handed the ensemble method; ensembles
    /// are built through [`EnsembleAnomalyDetector`].
    pub fn from_method(method: AnomalyMethod, config: &ProcessingConfig) -> Result<Self> {
        match method {
            AnomalyMethod::IsolationForest => Ok(Self::IsolationForest {
                config: config.isolation_forest.clone(),
                random_state: config.random_state,
                model: None,
            }),
            AnomalyMethod::OneClassSvm => Ok(Self::OneClassSvm {
                config: config.one_class_svm.clone(),
                model: None,
            }),
            AnomalyMethod::LocalOutlierFactor => Ok(Self::LocalOutlierFactor {
                config: config.lof.clone(),
                k: None,
            }),
            AnomalyMethod::EllipticEnvelope => Ok(Self::EllipticEnvelope {
                config: config.elliptic_envelope.clone(),
                model: None,
            }),
            AnomalyMethod::Ensemble => Err(Error::Config(
                "ensemble members cannot themselves be ensembles".into(),
            )),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::IsolationForest { .. } => "isolation_forest",
            Self::OneClassSvm { .. } => "one_class_svm",
            Self::LocalOutlierFactor { .. } => "local_outlier_factor",
            Self::EllipticEnvelope { .. } => "elliptic_envelope",
        }
    }

    fn contamination(&self) -> f64 {
        match self {
            Self::IsolationForest { config, model, .. } => model
                .as_ref()
                .map_or_else(|| config.contamination.unwrap_or(0.1), |(_, c)| *c),
            Self::OneClassSvm { config, .. } => config.contamination,
            Self::LocalOutlierFactor { config, .. } => config.contamination,
            Self::EllipticEnvelope { config, .. } => config.contamination,
        }
    }

    /// Train on `data`, resolving auto parameters first.
    ///
    /// # Errors
    /// Returns `Error::Validation` for degenerate input, `Error::Algorithm`
    /// when the underlying model cannot be computed.
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(&mut self, data: ArrayView2<'_, f64>) -> Result<()> {
        let n = data.nrows();
        if n < 2 {
            return Err(Error::Validation(
                "Anomaly detection requires at least 2 samples".into(),
            ));
        }

        match self {
            Self::IsolationForest {
                config,
                random_state,
                model,
            } => {
                let contamination = config
                    .contamination
                    .unwrap_or_else(|| params::auto_contamination(data));
                let forest =
                    Forest::fit(data, config.n_estimators, config.max_samples, *random_state);
                *model = Some((forest, contamination));
            }
            Self::OneClassSvm { config, model } => {
                let gamma = config
                    .gamma
                    .unwrap_or_else(|| 1.0 / data.ncols().max(1) as f64);
                let train = data.to_owned();
                let mut total = 0.0;
                for i in 0..n {
                    for j in 0..n {
                        total += rbf(data.row(i).to_vec().as_slice(), data.row(j).to_vec().as_slice(), gamma);
                    }
                }
                *model = Some(SvddModel {
                    gamma,
                    train,
                    mean_term: total / (n as f64 * n as f64),
                });
            }
            Self::LocalOutlierFactor { config, k } => {
                *k = Some(config.n_neighbors.min(n - 1).max(1));
            }
            Self::EllipticEnvelope { model, .. } => {
                *model = Some(fit_elliptic(data)?);
            }
        }
        debug!(method = self.name(), "detector fitted");
        Ok(())
    }

    /// Raw anomaly scores (higher = more anomalous) and the flagging
    /// threshold derived from the contamination rate.
    ///
    /// # Errors
    /// Returns `Error::NotFitted` before `fit`.
    pub fn score(&self, data: ArrayView2<'_, f64>) -> Result<(Vec<f64>, f64)> {
        let scores = match self {
            Self::IsolationForest { model, .. } => {
                let (forest, _) = model.as_ref().ok_or(Error::NotFitted("isolation forest"))?;
                forest.scores(data)
            }
            Self::OneClassSvm { model, .. } => {
                let model = model.as_ref().ok_or(Error::NotFitted("one-class svm"))?;
                svdd_scores(model, data)
            }
            Self::LocalOutlierFactor { k, .. } => {
                let k = k.ok_or(Error::NotFitted("local outlier factor"))?;
                lof_scores(data, k)
            }
            Self::EllipticEnvelope { model, .. } => {
                let model = model.as_ref().ok_or(Error::NotFitted("elliptic envelope"))?;
                mahalanobis_scores(model, data)
            }
        };

        let threshold = contamination_threshold(&scores, self.contamination());
        Ok((scores, threshold))
    }

    /// Flag anomalies and package the result.
    ///
    /// # Errors
    /// Returns `Error::NotFitted` before `fit`.
    #[allow(clippy::cast_precision_loss)]
    pub fn transform(&self, data: ArrayView2<'_, f64>) -> Result<AlgorithmResult> {
        let started = Instant::now();
        let (scores, threshold) = self.score(data)?;
        let indices: Vec<usize> = scores
            .iter()
            .enumerate()
            .filter(|(_, &s)| s >= threshold)
            .map(|(i, _)| i)
            .collect();

        let metrics = score_metrics(&scores, threshold, indices.len(), data.nrows());
        let metadata = json!({
            "method": self.name(),
            "threshold": threshold,
            "contamination": self.contamination(),
        });

        Ok(AlgorithmResult {
            output: AlgorithmOutput::AnomalyIndices(indices),
            metadata,
            metrics,
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
            Self::IsolationForest { config, model, .. } => json!({
                "method": "isolation_forest",
                "n_estimators": config.n_estimators,
                "max_samples": config.max_samples,
                "contamination": model
                    .as_ref()
                    .map_or(config.contamination.unwrap_or(0.1), |(_, c)| *c),
            }),
            Self::OneClassSvm { config, model } => json!({
                "method": "one_class_svm",
                "gamma": model.as_ref().map_or(config.gamma.unwrap_or(0.0), |m| m.gamma),
                "contamination": config.contamination,
            }),
            Self::LocalOutlierFactor { config, k } => json!({
                "method": "local_outlier_factor",
                "n_neighbors": k.unwrap_or(config.n_neighbors),
                "contamination": config.contamination,
            }),
            Self::EllipticEnvelope { config, .. } => json!({
                "method": "elliptic_envelope",
                "contamination": config.contamination,
            }),
        }
    }
}

/// Score at the (1 - contamination) quantile; everything at or above it
/// gets flagged.
fn contamination_threshold(scores: &[f64], contamination: f64) -> f64 {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    stats::percentile(&sorted, (1.0 - contamination.clamp(0.0, 1.0)) * 100.0)
}

#[allow(clippy::cast_precision_loss)]
fn score_metrics(
    scores: &[f64],
    threshold: f64,
    anomaly_count: usize,
    n: usize,
) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();
    metrics.insert("score_mean".into(), stats::mean(scores));
    metrics.insert(
        "score_max".into(),
        scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    );
    metrics.insert("threshold".into(), threshold);
    metrics.insert("anomaly_count".into(), anomaly_count as f64);
    metrics.insert("anomaly_ratio".into(), anomaly_count as f64 / n.max(1) as f64);
    metrics
}

fn rbf(a: &[f64], b: &[f64], gamma: f64) -> f64 {
    let sq: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
    (-gamma * sq).exp()
}

#[allow(clippy::cast_precision_loss)]
fn svdd_scores(model: &SvddModel, data: ArrayView2<'_, f64>) -> Vec<f64> {
    let n_train = model.train.nrows() as f64;
    data.rows()
        .into_iter()
        .map(|row| {
            let point = row.to_vec();
            let cross: f64 = model
                .train
                .rows()
                .into_iter()
                .map(|t| rbf(&point, t.to_vec().as_slice(), model.gamma))
                .sum::<f64>()
                / n_train;
            // k(x, x) = 1 for the RBF kernel
            1.0 - 2.0 * cross + model.mean_term
        })
        .collect()
}

/// Local outlier factor over the whole matrix: k-distances, local
/// reachability density, then the density ratio against neighbours.
#[allow(clippy::cast_precision_loss)]
fn lof_scores(data: ArrayView2<'_, f64>, k: usize) -> Vec<f64> {
    let n = data.nrows();
    let k = k.min(n - 1).max(1);

    // Neighbour lists (index, distance), ascending
    let mut neighbors: Vec<Vec<(usize, f64)>> = Vec::with_capacity(n);
    for i in 0..n {
        let mut dists: Vec<(usize, f64)> = (0..n)
            .filter(|&j| j != i)
            .map(|j| {
                let d: f64 = data
                    .row(i)
                    .iter()
                    .zip(data.row(j).iter())
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    .sqrt();
                (j, d)
            })
            .collect();
        dists.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        dists.truncate(k);
        neighbors.push(dists);
    }

    let k_distance: Vec<f64> = neighbors
        .iter()
        .map(|nbrs| nbrs.last().map_or(0.0, |&(_, d)| d))
        .collect();

    // Local reachability density
    let lrd: Vec<f64> = (0..n)
        .map(|i| {
            let reach_sum: f64 = neighbors[i]
                .iter()
                .map(|&(j, d)| d.max(k_distance[j]))
                .sum();
            if reach_sum > 0.0 {
                neighbors[i].len() as f64 / reach_sum
            } else {
                f64::INFINITY
            }
        })
        .collect();

    (0..n)
        .map(|i| {
            if !lrd[i].is_finite() {
                return 1.0;
            }
            let ratio_sum: f64 = neighbors[i]
                .iter()
                .map(|&(j, _)| {
                    if lrd[j].is_finite() {
                        lrd[j] / lrd[i]
                    } else {
                        1.0
                    }
                })
                .sum();
            ratio_sum / neighbors[i].len() as f64
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn fit_elliptic(data: ArrayView2<'_, f64>) -> Result<EllipticModel> {
    let n = data.nrows() as f64;
    let d = data.ncols();

    let mean: Array1<f64> = data.mean_axis(ndarray::Axis(0)).ok_or_else(|| {
        Error::Algorithm("cannot compute mean of empty matrix".into())
    })?;

    let mut cov = Array2::zeros((d, d));
    for row in data.rows() {
        let diff = &row.to_owned() - &mean;
        for i in 0..d {
            for j in 0..d {
                cov[[i, j]] += diff[i] * diff[j];
            }
        }
    }
    cov /= n;

    // Precision from the eigendecomposition, clamping tiny eigenvalues
    let (vals, vecs) = cov
        .eigh()
        .map_err(|e| Error::Algorithm(format!("covariance eigendecomposition failed: {e}")))?;
    let max_val = vals.iter().copied().fold(0.0f64, f64::max);
    let floor = (max_val * 1e-9).max(1e-12);

    let mut precision = Array2::zeros((d, d));
    for k in 0..d {
        let inv = 1.0 / vals[k].max(floor);
        for i in 0..d {
            for j in 0..d {
                precision[[i, j]] += vecs[[i, k]] * inv * vecs[[j, k]];
            }
        }
    }

    Ok(EllipticModel { mean, precision })
}

fn mahalanobis_scores(model: &EllipticModel, data: ArrayView2<'_, f64>) -> Vec<f64> {
    data.rows()
        .into_iter()
        .map(|row| {
            let diff = &row.to_owned() - &model.mean;
            diff.dot(&model.precision.dot(&diff))
        })
        .collect()
}

// ============================================================================
// Ensemble
// ============================================================================

struct FittedMember {
    detector: Detector,
    weight: f64,
}

/// Weighted combination of independently fitted detectors.
///
/// A point is flagged when either rule fires: the weighted member vote
/// reaches `vote_threshold`, or the combined normalized score reaches the
/// (1 - contamination) quantile. The OR deliberately favors recall, so the
/// realized anomaly fraction can exceed the nominal contamination.
pub struct EnsembleAnomalyDetector {
    members: Vec<FittedMember>,
    vote_threshold: f64,
    contamination: f64,
}

impl EnsembleAnomalyDetector {
    /// Fit every configured member; members that fail to fit are logged
    /// and dropped. The surviving list is immutable afterwards.
    ///
    /// # Errors
    /// Returns `Error::Algorithm` when no member survives fitting.
    pub fn fit(
        ensemble: &EnsembleConfig,
        config: &ProcessingConfig,
        data: ArrayView2<'_, f64>,
    ) -> Result<Self> {
        if ensemble.members.is_empty() {
            return Err(Error::Config("ensemble has no members".into()));
        }
        if let Some(weights) = &ensemble.weights {
            if weights.len() != ensemble.members.len() {
                return Err(Error::Config(format!(
                    "{} weights for {} ensemble members",
                    weights.len(),
                    ensemble.members.len()
                )));
            }
        }

        let mut members = Vec::new();
        for (i, &method) in ensemble.members.iter().enumerate() {
            let weight = ensemble
                .weights
                .as_ref()
                .map_or(1.0, |w| w[i]);
            let mut detector = match Detector::from_method(method, config) {
                Ok(d) => d,
                Err(e) => {
                    warn!(member = ?method, error = %e, "skipping ensemble member");
                    continue;
                }
            };
            match detector.fit(data) {
                Ok(()) => members.push(FittedMember { detector, weight }),
                Err(e) => {
                    warn!(member = detector.name(), error = %e, "ensemble member failed to fit");
                }
            }
        }

        if members.is_empty() {
            return Err(Error::Algorithm(
                "every ensemble member failed to fit".into(),
            ));
        }

        // Normalize surviving weights to sum 1
        let total: f64 = members.iter().map(|m| m.weight).sum();
        if total > 0.0 {
            for m in &mut members {
                m.weight /= total;
            }
        } else {
            #[allow(clippy::cast_precision_loss)]
            let equal = 1.0 / members.len() as f64;
            for m in &mut members {
                m.weight = equal;
            }
        }

        Ok(Self {
            members,
            vote_threshold: ensemble.vote_threshold,
            contamination: ensemble.contamination,
        })
    }

    /// Combine member votes and normalized scores into final flags.
    ///
    /// # Errors
    /// Propagates member scoring failures.
    #[allow(clippy::cast_precision_loss)]
    pub fn transform(&self, data: ArrayView2<'_, f64>) -> Result<AlgorithmResult> {
        let started = Instant::now();
        let n = data.nrows();

        let mut combined = vec![0.0f64; n];
        let mut votes = vec![0.0f64; n];
        for member in &self.members {
            let (scores, threshold) = member.detector.score(data)?;
            let normalized = min_max_normalize(&scores);
            for i in 0..n {
                combined[i] += member.weight * normalized[i];
                if scores[i] >= threshold {
                    votes[i] += 1.0;
                }
            }
        }

        let member_count = self.members.len() as f64;
        let score_cut = contamination_threshold(&combined, self.contamination);

        let indices: Vec<usize> = (0..n)
            .filter(|&i| {
                votes[i] / member_count >= self.vote_threshold || combined[i] >= score_cut
            })
            .collect();

        let metrics = score_metrics(&combined, score_cut, indices.len(), n);
        let metadata = json!({
            "method": "ensemble",
            "members": self.members.iter().map(|m| m.detector.name()).collect::<Vec<_>>(),
            "weights": self.members.iter().map(|m| m.weight).collect::<Vec<_>>(),
            "vote_threshold": self.vote_threshold,
            "score_threshold": score_cut,
        });

        Ok(AlgorithmResult {
            output: AlgorithmOutput::AnomalyIndices(indices),
            metadata,
            metrics,
            elapsed: started.elapsed(),
            params: json!({
                "method": "ensemble",
                "members": self.members.iter().map(|m| m.detector.params()).collect::<Vec<_>>(),
                "vote_threshold": self.vote_threshold,
                "contamination": self.contamination,
            }),
        })
    }
}

/// Scale to [0, 1]; constant inputs map to 0.
fn min_max_normalize(scores: &[f64]) -> Vec<f64> {
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = (max - min).max(1e-8);
    scores.iter().map(|&s| (s - min) / range).collect()
}
