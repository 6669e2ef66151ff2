//! Fixed-order processing pipeline.
//!
//! Stages run in declaration order on the blocking thread pool; the
//! cancellation token is checked at every stage boundary, so a cancel
//! takes effect before the next stage starts, never mid-algorithm.
//! Progress callbacks are best-effort: a panicking subscriber is logged
//! and ignored.

use crate::ml::anomaly::{Detector, EnsembleAnomalyDetector};
use crate::ml::clustering::Clusterer;
use crate::ml::preprocess::Preprocessor;
use crate::ml::reduction::Reducer;
use crate::structs::{
    AlgorithmResult, AnomalyMethod, Error, Preprocessed, ProcessingConfig, ProcessingContext,
    ProgressEvent, Result, Stage,
};
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subscriber for stage-transition progress events.
pub type ProgressSink = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Everything the stages produced, in pipeline order.
pub struct StageOutputs {
    pub preprocessed: Preprocessed,
    pub reduction: AlgorithmResult,
    pub clustering: AlgorithmResult,
    pub anomaly: Option<AlgorithmResult>,
}

pub struct Pipeline {
    config: ProcessingConfig,
    cancel: CancellationToken,
    progress: Option<ProgressSink>,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: ProcessingConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Run every stage over `records`.
    ///
    /// Clustering consumes the 3D embedding; anomaly detection scores the
    /// preprocessed feature matrix.
    ///
    /// # Errors
    /// Returns `Error::Cancelled` when the token fires between stages, or
    /// the first stage failure otherwise.
    pub async fn run(
        &self,
        ctx: &mut ProcessingContext,
        records: Vec<Map<String, Value>>,
    ) -> Result<StageOutputs> {
        let dataset_id = ctx.dataset_id.clone();
        info!(dataset_id = %dataset_id, rows = records.len(), "pipeline started");

        self.enter_stage(ctx, Stage::Preprocessing, "Preparing features")?;
        let preprocessed = {
            let config = self.config.clone();
            run_blocking(move || {
                Preprocessor::new(config.preprocess.clone(), config.random_state).run(&records)
            })
            .await?
        };
        debug!(
            samples = preprocessed.matrix.n_samples(),
            features = preprocessed.matrix.n_features(),
            "preprocessing done"
        );

        self.enter_stage(ctx, Stage::DimensionalityReduction, "Projecting to 3D")?;
        let reduction = {
            let config = self.config.clone();
            let matrix = preprocessed.matrix.data.clone();
            run_blocking(move || {
                let mut reducer = Reducer::from_config(&config);
                reducer.fit_transform(matrix.view())
            })
            .await?
        };
        ctx.stage_results
            .insert(Stage::DimensionalityReduction, reduction.clone());

        self.enter_stage(ctx, Stage::Clustering, "Grouping points")?;
        let embedding = reduction
            .embedding()
            .ok_or_else(|| Error::Algorithm("reduction produced no embedding".into()))?
            .clone();
        let clustering = {
            let config = self.config.clone();
            run_blocking(move || {
                let mut clusterer = Clusterer::from_config(&config);
                clusterer.fit_transform(embedding.view())
            })
            .await?
        };
        ctx.stage_results.insert(Stage::Clustering, clustering.clone());

        self.enter_stage(ctx, Stage::AnomalyDetection, "Flagging anomalies")?;
        let anomaly = if self.config.detect_anomalies {
            let config = self.config.clone();
            let matrix = preprocessed.matrix.data.clone();
            let result = run_blocking(move || {
                if config.anomaly_method == AnomalyMethod::Ensemble {
                    let fitted =
                        EnsembleAnomalyDetector::fit(&config.ensemble, &config, matrix.view())?;
                    fitted.transform(matrix.view())
                } else {
                    let mut detector = Detector::from_method(config.anomaly_method, &config)?;
                    detector.fit_transform(matrix.view())
                }
            })
            .await?;
            ctx.stage_results
                .insert(Stage::AnomalyDetection, result.clone());
            Some(result)
        } else {
            None
        };

        self.enter_stage(ctx, Stage::Validation, "Validating results")?;
        validate_outputs(&preprocessed, &reduction, &clustering, anomaly.as_ref())?;

        self.enter_stage(ctx, Stage::Finalization, "Assembling result")?;
        info!(
            dataset_id = %dataset_id,
            elapsed = ?ctx.started.elapsed(),
            "pipeline finished"
        );

        Ok(StageOutputs {
            preprocessed,
            reduction,
            clustering,
            anomaly,
        })
    }

    /// Cancellation check, context advance and progress emission for one
    /// stage boundary.
    fn enter_stage(&self, ctx: &mut ProcessingContext, stage: Stage, message: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(ctx.dataset_id.clone()));
        }
        ctx.enter(stage);

        if let Some(sink) = &self.progress {
            let event = ProgressEvent {
                dataset_id: ctx.dataset_id.clone(),
                stage: stage.name().to_string(),
                progress: ctx.progress,
                message: message.to_string(),
            };
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| sink(&event)));
            if outcome.is_err() {
                warn!(stage = stage.name(), "progress subscriber panicked");
            }
        }
        debug!(stage = stage.name(), progress = ctx.progress, "stage entered");
        Ok(())
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Algorithm(format!("worker task failed: {e}")))?
}

/// Cross-stage consistency checks before assembly.
fn validate_outputs(
    preprocessed: &Preprocessed,
    reduction: &AlgorithmResult,
    clustering: &AlgorithmResult,
    anomaly: Option<&AlgorithmResult>,
) -> Result<()> {
    let n = preprocessed.matrix.n_samples();

    let embedding = reduction
        .embedding()
        .ok_or_else(|| Error::Algorithm("reduction produced no embedding".into()))?;
    if embedding.nrows() != n {
        return Err(Error::Algorithm(format!(
            "embedding has {} rows for {n} samples",
            embedding.nrows()
        )));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(Error::Algorithm("embedding contains non-finite values".into()));
    }

    let labels = clustering
        .labels()
        .ok_or_else(|| Error::Algorithm("clustering produced no labels".into()))?;
    if labels.len() != n {
        return Err(Error::Algorithm(format!(
            "{} cluster labels for {n} samples",
            labels.len()
        )));
    }

    if let Some(result) = anomaly {
        let indices = result
            .anomaly_indices()
            .ok_or_else(|| Error::Algorithm("anomaly stage produced no indices".into()))?;
        if indices.iter().any(|&i| i >= n) {
            return Err(Error::Algorithm("anomaly index out of range".into()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn sample_records(n: usize) -> Vec<Map<String, Value>> {
        (0..n)
            .map(|i| {
                let mut record = Map::new();
                record.insert("a".into(), json!(i as f64 * 0.5));
                record.insert("b".into(), json!((i % 7) as f64));
                record.insert("c".into(), json!((i * i % 13) as f64));
                record.insert("d".into(), json!(if i < n / 2 { 0.0 } else { 10.0 }));
                record
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_pipeline_produces_all_outputs() {
        let pipeline = Pipeline::new(ProcessingConfig::default());
        let mut ctx = ProcessingContext::new("ds-test", None);
        let outputs = pipeline.run(&mut ctx, sample_records(60)).await.unwrap();

        let n = outputs.preprocessed.matrix.n_samples();
        assert_eq!(outputs.reduction.embedding().unwrap().nrows(), n);
        assert_eq!(outputs.clustering.labels().unwrap().len(), n);
        assert!(outputs.anomaly.is_some());
        assert!((ctx.progress - Stage::Finalization.percent()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_anomaly_stage_skippable() {
        let config = ProcessingConfig {
            detect_anomalies: false,
            ..ProcessingConfig::default()
        };
        let pipeline = Pipeline::new(config);
        let mut ctx = ProcessingContext::new("ds-test", None);
        let outputs = pipeline.run(&mut ctx, sample_records(40)).await.unwrap();
        assert!(outputs.anomaly.is_none());
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_stops_before_first_stage() {
        let token = CancellationToken::new();
        token.cancel();
        let pipeline = Pipeline::new(ProcessingConfig::default()).with_cancel(token);
        let mut ctx = ProcessingContext::new("ds-test", None);
        let result = pipeline.run(&mut ctx, sample_records(40)).await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_progress_events_monotone_and_complete() {
        let events: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink: ProgressSink = Arc::new(move |event: &ProgressEvent| {
            sink_events.lock().unwrap().push(event.progress);
        });

        let pipeline = Pipeline::new(ProcessingConfig::default()).with_progress(sink);
        let mut ctx = ProcessingContext::new("ds-test", None);
        pipeline.run(&mut ctx, sample_records(50)).await.unwrap();

        let recorded = events.lock().unwrap();
        assert_eq!(recorded.len(), Stage::ALL.len());
        assert!(recorded.windows(2).all(|w| w[0] <= w[1]));
        assert!((recorded.last().unwrap() - Stage::Finalization.percent()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_panicking_progress_subscriber_tolerated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sink_calls = Arc::clone(&calls);
        let sink: ProgressSink = Arc::new(move |_: &ProgressEvent| {
            sink_calls.fetch_add(1, Ordering::SeqCst);
            panic!("subscriber bug");
        });

        let pipeline = Pipeline::new(ProcessingConfig::default()).with_progress(sink);
        let mut ctx = ProcessingContext::new("ds-test", None);
        let outputs = pipeline.run(&mut ctx, sample_records(50)).await;

        assert!(outputs.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), Stage::ALL.len());
    }

    #[tokio::test]
    async fn test_too_few_rows_fails_in_preprocessing() {
        let pipeline = Pipeline::new(ProcessingConfig::default());
        let mut ctx = ProcessingContext::new("ds-test", None);
        let result = pipeline.run(&mut ctx, sample_records(5)).await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
