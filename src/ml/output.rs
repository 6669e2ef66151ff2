//! Result file writers for the CLI.

use crate::structs::{OptimizationResult, ProcessingResult, Result};
use std::fs;
use std::path::Path;

/// Write `points.json` - the full point cloud.
///
/// # Errors
/// Returns error if serialization or the write fails
pub fn write_points(output_dir: &Path, result: &ProcessingResult) -> Result<()> {
    let path = output_dir.join("points.json");
    let json = serde_json::to_string_pretty(&result.points)?;
    fs::write(path, json)?;
    Ok(())
}

/// Write `clusters.json` - cluster summaries.
///
/// # Errors
/// Returns error if serialization or the write fails
pub fn write_clusters(output_dir: &Path, result: &ProcessingResult) -> Result<()> {
    let path = output_dir.join("clusters.json");
    let json = serde_json::to_string_pretty(&result.clusters)?;
    fs::write(path, json)?;
    Ok(())
}

/// Write `summary.txt` - human readable run overview.
///
/// # Errors
/// Returns error if file cannot be written
pub fn write_summary(output_dir: &Path, result: &ProcessingResult) -> Result<()> {
    let path = output_dir.join("summary.txt");
    fs::write(path, render_summary(result))?;
    Ok(())
}

/// Write `optimization.json` - search trials and the best configuration.
///
/// # Errors
/// Returns error if serialization or the write fails
pub fn write_optimization(output_dir: &Path, result: &OptimizationResult) -> Result<()> {
    let path = output_dir.join("optimization.json");
    let json = serde_json::to_string_pretty(result)?;
    fs::write(path, json)?;
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn render_summary(result: &ProcessingResult) -> String {
    use std::fmt::Write as _;

    let meta = &result.metadata;
    let mut content = String::new();
    let _ = writeln!(content, "Point cloud summary");
    let _ = writeln!(content, "===================");
    let _ = writeln!(content, "Points:            {}", meta.total_points);
    let _ = writeln!(content, "Clusters:          {}", result.clusters.len());
    let _ = writeln!(content, "Anomalies:         {}", result.anomalies.len());
    let _ = writeln!(content, "Reduction method:  {}", meta.reduction_method);
    let _ = writeln!(content, "Clustering method: {}", meta.clustering_method);
    let _ = writeln!(content, "Processing time:   {:.2}s", meta.processing_time);
    let _ = writeln!(content, "Features used:     {}", meta.features_used.join(", "));

    let _ = writeln!(content, "\nPreprocessing steps:");
    for step in &meta.preprocessing_steps {
        let _ = writeln!(content, "  - {step}");
    }

    if !result.clusters.is_empty() {
        let _ = writeln!(content, "\nClusters:");
        for cluster in &result.clusters {
            let pct = cluster.count as f64 / meta.total_points.max(1) as f64 * 100.0;
            let _ = writeln!(
                content,
                "  {} ({}): {} points ({pct:.1}%) at [{:.2}, {:.2}, {:.2}]",
                cluster.label,
                cluster.color,
                cluster.count,
                cluster.center[0],
                cluster.center[1],
                cluster.center[2]
            );
        }
    }

    if !meta.performance.is_empty() {
        let _ = writeln!(content, "\nPerformance metrics:");
        for (name, value) in &meta.performance {
            let _ = writeln!(content, "  {name}: {value:.4}");
        }
    }

    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{Cluster, DataPoint, ProcessingMetadata};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sample_result() -> ProcessingResult {
        let mut performance = BTreeMap::new();
        performance.insert("clustering_silhouette".to_string(), 0.72);
        ProcessingResult {
            points: vec![DataPoint {
                id: "p-1".into(),
                position: [0.1, 0.2, 0.3],
                color: "#1F77B4".into(),
                size: 1.0,
                cluster: 0,
                is_anomaly: false,
                original_data: serde_json::Map::new(),
            }],
            clusters: vec![Cluster {
                id: 0,
                color: "#1F77B4".into(),
                count: 1,
                center: [0.1, 0.2, 0.3],
                label: "Cluster 0".into(),
            }],
            anomalies: vec![],
            metadata: ProcessingMetadata {
                total_points: 1,
                processing_time: 0.5,
                reduction_method: "pca".into(),
                clustering_method: "kmeans".into(),
                features_used: vec!["x".into(), "y".into()],
                preprocessing_steps: vec!["scaling: standard".into()],
                performance,
            },
        }
    }

    #[test]
    fn test_write_points_and_clusters() {
        let dir = TempDir::new().expect("create temp dir");
        let result = sample_result();

        write_points(dir.path(), &result).expect("write points");
        write_clusters(dir.path(), &result).expect("write clusters");

        let points: Vec<DataPoint> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("points.json")).expect("read"),
        )
        .expect("parse");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].id, "p-1");

        let clusters: Vec<Cluster> = serde_json::from_str(
            &fs::read_to_string(dir.path().join("clusters.json")).expect("read"),
        )
        .expect("parse");
        assert_eq!(clusters[0].label, "Cluster 0");
    }

    #[test]
    fn test_summary_mentions_key_facts() {
        let dir = TempDir::new().expect("create temp dir");
        write_summary(dir.path(), &sample_result()).expect("write summary");

        let content = fs::read_to_string(dir.path().join("summary.txt")).expect("read");
        assert!(content.contains("Points:            1"));
        assert!(content.contains("Cluster 0"));
        assert!(content.contains("clustering_silhouette: 0.7200"));
        assert!(content.contains("scaling: standard"));
    }

    #[test]
    fn test_write_optimization() {
        let dir = TempDir::new().expect("create temp dir");
        let result = OptimizationResult {
            best_params: serde_json::json!({"n_clusters": 3}),
            best_score: 0.8,
            trials: vec![],
            total_time_secs: 1.5,
            n_trials: 9,
            search_method: "grid".into(),
        };
        write_optimization(dir.path(), &result).expect("write optimization");

        let content =
            fs::read_to_string(dir.path().join("optimization.json")).expect("read");
        assert!(content.contains("\"n_clusters\": 3"));
        assert!(content.contains("\"search_method\": \"grid\""));
    }
}
