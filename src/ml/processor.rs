//! Top-level processor: runs the pipeline and assembles the point cloud.

use crate::ml::pipeline::{Pipeline, ProgressSink, StageOutputs};
use crate::structs::{
    Cluster, DataPoint, ProcessingConfig, ProcessingContext, ProcessingMetadata,
    ProcessingResult, ProgressEvent, Result,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Cluster colors, reused modulo when there are more clusters.
pub const PALETTE: [&str; 15] = [
    "#1F77B4", "#FF7F0E", "#2CA02C", "#D62728", "#9467BD", "#8C564B", "#E377C2", "#7F7F7F",
    "#BCBD22", "#17BECF", "#AEC7E8", "#FFBB78", "#98DF8A", "#FF9896", "#C5B0D5",
];

/// Noise points (label -1) always render gray.
pub const NOISE_COLOR: &str = "#808080";

/// Anomalous points always render red, overriding the cluster color.
pub const ANOMALY_COLOR: &str = "#FF0000";

const SIZE_RANGE: (f64, f64) = (0.5, 2.0);

pub struct MlProcessor {
    config: ProcessingConfig,
    cancel: CancellationToken,
    progress: Option<ProgressSink>,
}

impl MlProcessor {
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

    /// Run the full pipeline over `records` and build the visualization
    /// result.
    ///
    /// # Errors
    /// Propagates pipeline failures; see [`Pipeline::run`].
    pub async fn process(
        &self,
        dataset_id: &str,
        records: Vec<Map<String, Value>>,
    ) -> Result<ProcessingResult> {
        let mut ctx = ProcessingContext::new(dataset_id, None);
        let mut pipeline = Pipeline::new(self.config.clone()).with_cancel(self.cancel.clone());
        if let Some(sink) = &self.progress {
            pipeline = pipeline.with_progress(sink.clone());
        }

        let outputs = match pipeline.run(&mut ctx, records.clone()).await {
            Ok(outputs) => outputs,
            Err(e) => {
                if let Some(sink) = &self.progress {
                    let event = ProgressEvent {
                        dataset_id: ctx.dataset_id.clone(),
                        stage: ctx.stage.name().to_string(),
                        progress: ctx.progress,
                        message: format!("processing failed: {e}"),
                    };
                    let _ = std::panic::catch_unwind(AssertUnwindSafe(|| sink(&event)));
                }
                return Err(e);
            }
        };
        let result = self.assemble(&ctx, &records, &outputs);
        info!(
            dataset_id,
            points = result.points.len(),
            clusters = result.clusters.len(),
            anomalies = result.anomalies.len(),
            "processing complete"
        );
        Ok(result)
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn assemble(
        &self,
        ctx: &ProcessingContext,
        records: &[Map<String, Value>],
        outputs: &StageOutputs,
    ) -> ProcessingResult {
        let matrix = &outputs.preprocessed.matrix;
        let embedding = outputs
            .reduction
            .embedding()
            .map_or_else(|| ndarray::Array2::zeros((0, 3)), Clone::clone);
        let labels = outputs.clustering.labels().unwrap_or(&[]);
        let anomaly_set: HashSet<usize> = outputs
            .anomaly
            .as_ref()
            .and_then(|a| a.anomaly_indices())
            .map(|indices| indices.iter().copied().collect())
            .unwrap_or_default();

        let sizes = point_sizes(records, &matrix.row_indices, self.config.size_column.as_deref());

        let mut points = Vec::with_capacity(matrix.n_samples());
        let mut anomalies = Vec::new();
        for i in 0..matrix.n_samples() {
            let cluster = labels.get(i).copied().unwrap_or(-1);
            let is_anomaly = anomaly_set.contains(&i);
            let color = if is_anomaly {
                ANOMALY_COLOR.to_string()
            } else {
                cluster_color(cluster)
            };

            let original_row = matrix.row_indices.get(i).copied().unwrap_or(i);
            let mut original_data = records.get(original_row).cloned().unwrap_or_default();
            if let Some(label_column) = &self.config.label_column {
                if let Some(value) = original_data.get(label_column).cloned() {
                    original_data.insert("label".into(), value);
                }
            }

            let id = Uuid::new_v4().to_string();
            if is_anomaly {
                anomalies.push(id.clone());
            }
            points.push(DataPoint {
                id,
                position: [embedding[[i, 0]], embedding[[i, 1]], embedding[[i, 2]]],
                color,
                size: sizes.get(i).copied().unwrap_or(1.0),
                cluster,
                is_anomaly,
                original_data,
            });
        }

        let clusters = summarize_clusters(&points);
        let performance = merge_performance(outputs);

        let metadata = ProcessingMetadata {
            total_points: points.len(),
            processing_time: ctx.started.elapsed().as_secs_f64(),
            reduction_method: method_name(&outputs.reduction.params),
            clustering_method: method_name(&outputs.clustering.params),
            features_used: matrix.names.clone(),
            preprocessing_steps: outputs.preprocessed.steps.clone(),
            performance,
        };

        ProcessingResult {
            points,
            clusters,
            anomalies,
            metadata,
        }
    }
}

fn method_name(params: &Value) -> String {
    params["method"].as_str().unwrap_or("unknown").to_string()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn cluster_color(cluster: i64) -> String {
    if cluster < 0 {
        NOISE_COLOR.to_string()
    } else {
        PALETTE[(cluster as usize) % PALETTE.len()].to_string()
    }
}

/// Per-point sizes from the configured column, min-max scaled into
/// [0.5, 2.0]. Missing or non-numeric values get size 1.0.
fn point_sizes(
    records: &[Map<String, Value>],
    row_indices: &[usize],
    size_column: Option<&str>,
) -> Vec<f64> {
    let Some(column) = size_column else {
        return vec![1.0; row_indices.len()];
    };

    let raw: Vec<Option<f64>> = row_indices
        .iter()
        .map(|&r| {
            records
                .get(r)
                .and_then(|record| record.get(column))
                .and_then(Value::as_f64)
        })
        .collect();

    let present: Vec<f64> = raw.iter().filter_map(|v| *v).collect();
    if present.is_empty() {
        return vec![1.0; row_indices.len()];
    }
    let min = present.iter().copied().fold(f64::INFINITY, f64::min);
    let max = present.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;

    raw.iter()
        .map(|v| match v {
            Some(value) if range > 0.0 => {
                SIZE_RANGE.0 + (value - min) / range * (SIZE_RANGE.1 - SIZE_RANGE.0)
            }
            Some(_) => 1.0,
            None => 1.0,
        })
        .collect()
}

#[allow(clippy::cast_precision_loss)]
fn summarize_clusters(points: &[DataPoint]) -> Vec<Cluster> {
    let mut groups: BTreeMap<i64, (usize, [f64; 3])> = BTreeMap::new();
    for point in points {
        if point.cluster < 0 {
            continue;
        }
        let entry = groups.entry(point.cluster).or_insert((0, [0.0; 3]));
        entry.0 += 1;
        for axis in 0..3 {
            entry.1[axis] += point.position[axis];
        }
    }

    groups
        .into_iter()
        .map(|(id, (count, sums))| {
            let n = count as f64;
            Cluster {
                id,
                color: cluster_color(id),
                count,
                center: [sums[0] / n, sums[1] / n, sums[2] / n],
                label: format!("Cluster {id}"),
            }
        })
        .collect()
}

/// Whole-run metrics: reduction quality plus clustering validity.
fn merge_performance(outputs: &StageOutputs) -> BTreeMap<String, f64> {
    let mut performance = BTreeMap::new();
    for (key, value) in &outputs.reduction.metrics {
        performance.insert(format!("reduction_{key}"), *value);
    }
    for (key, value) in &outputs.clustering.metrics {
        performance.insert(format!("clustering_{key}"), *value);
    }
    if let Some(anomaly) = &outputs.anomaly {
        for (key, value) in &anomaly.metrics {
            performance.insert(format!("anomaly_{key}"), *value);
        }
    }
    performance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{ClusteringMethod, IsolationForestConfig, KmeansConfig};
    use serde_json::json;

    fn blob_records(n: usize) -> Vec<Map<String, Value>> {
        (0..n)
            .map(|i| {
                let blob = i % 3;
                let offset = blob as f64 * 20.0;
                let mut record = Map::new();
                record.insert("name".into(), json!(format!("row-{i}")));
                record.insert("x".into(), json!(offset + (i % 5) as f64 * 0.2));
                record.insert("y".into(), json!(offset + (i % 7) as f64 * 0.3));
                record.insert("z".into(), json!(offset + (i % 4) as f64 * 0.1));
                record.insert("weight".into(), json!((i % 10) as f64));
                record
            })
            .collect()
    }

    fn test_config() -> ProcessingConfig {
        ProcessingConfig {
            clustering_method: ClusteringMethod::Kmeans,
            kmeans: KmeansConfig {
                n_clusters: 3,
                ..KmeansConfig::default()
            },
            isolation_forest: IsolationForestConfig {
                contamination: Some(0.1),
                ..IsolationForestConfig::default()
            },
            ..ProcessingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_end_to_end_point_cloud() {
        let processor = MlProcessor::new(test_config());
        let result = processor.process("ds-1", blob_records(100)).await.unwrap();

        assert_eq!(result.points.len(), 100);
        assert_eq!(result.clusters.len(), 3);
        assert!(result.clusters.iter().all(|c| c.count > 0));
        // Contamination 0.1 over 100 rows flags roughly a tenth
        assert!((5..=15).contains(&result.anomalies.len()));
        assert_eq!(result.metadata.total_points, 100);
        assert_eq!(result.metadata.reduction_method, "pca");
        assert_eq!(result.metadata.clustering_method, "kmeans");
        assert!(result.metadata.performance.contains_key("clustering_silhouette"));

        // Point ids are unique
        let ids: HashSet<&str> = result.points.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), result.points.len());
    }

    #[tokio::test]
    async fn test_anomaly_points_red_and_listed() {
        let processor = MlProcessor::new(test_config());
        let result = processor.process("ds-1", blob_records(60)).await.unwrap();

        for point in &result.points {
            if point.is_anomaly {
                assert_eq!(point.color, ANOMALY_COLOR);
                assert!(result.anomalies.contains(&point.id));
            } else {
                assert_ne!(point.color, ANOMALY_COLOR);
            }
        }
        assert!(!result.anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_cluster_colors_follow_palette() {
        let processor = MlProcessor::new(test_config());
        let result = processor.process("ds-1", blob_records(60)).await.unwrap();

        for cluster in &result.clusters {
            assert_eq!(cluster.color, PALETTE[cluster.id as usize % PALETTE.len()]);
            assert!(cluster.count > 0);
            assert!(cluster.label.starts_with("Cluster "));
        }
    }

    #[tokio::test]
    async fn test_cluster_center_is_member_mean() {
        let processor = MlProcessor::new(test_config());
        let result = processor.process("ds-1", blob_records(60)).await.unwrap();

        for cluster in &result.clusters {
            let members: Vec<&DataPoint> = result
                .points
                .iter()
                .filter(|p| p.cluster == cluster.id)
                .collect();
            assert_eq!(members.len(), cluster.count);
            for axis in 0..3 {
                let mean = members.iter().map(|p| p.position[axis]).sum::<f64>()
                    / members.len() as f64;
                assert!((cluster.center[axis] - mean).abs() < 1e-6);
            }
        }
    }

    #[tokio::test]
    async fn test_size_column_scaled_into_range() {
        let config = ProcessingConfig {
            size_column: Some("weight".into()),
            ..test_config()
        };
        let processor = MlProcessor::new(config);
        let result = processor.process("ds-1", blob_records(60)).await.unwrap();

        for point in &result.points {
            assert!(point.size >= SIZE_RANGE.0 && point.size <= SIZE_RANGE.1);
        }
        let distinct: HashSet<u64> = result.points.iter().map(|p| p.size.to_bits()).collect();
        assert!(distinct.len() > 1);
    }

    #[tokio::test]
    async fn test_original_data_round_trips() {
        let processor = MlProcessor::new(test_config());
        let result = processor.process("ds-1", blob_records(30)).await.unwrap();
        assert!(result.points.iter().all(|p| p.original_data.contains_key("name")));
    }

    #[tokio::test]
    async fn test_failure_emits_error_event() {
        use std::sync::{Arc, Mutex};

        let messages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_messages = Arc::clone(&messages);
        let sink: crate::ml::pipeline::ProgressSink = Arc::new(move |event: &ProgressEvent| {
            sink_messages.lock().unwrap().push(event.message.clone());
        });

        let processor = MlProcessor::new(test_config()).with_progress(sink);
        // Too few rows, fails validation inside preprocessing
        let outcome = processor.process("ds-1", blob_records(5)).await;
        assert!(outcome.is_err());

        let recorded = messages.lock().unwrap();
        let last = recorded.last().expect("at least one event");
        assert!(last.contains("processing failed"));
    }

    #[test]
    fn test_point_sizes_without_column() {
        let sizes = point_sizes(&[], &[0, 1, 2], None);
        assert_eq!(sizes, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_cluster_color_noise() {
        assert_eq!(cluster_color(-1), NOISE_COLOR);
        assert_eq!(cluster_color(0), PALETTE[0]);
        assert_eq!(cluster_color(15), PALETTE[0]);
    }
}
