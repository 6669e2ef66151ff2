#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::uninlined_format_args)]

mod csv_reader;
mod ml;
mod structs;

use clap::{Parser, Subcommand};
use ml::optimizer::{HyperparameterOptimizer, OptimizeAlgorithm, SearchMethod};
use ml::pipeline::ProgressSink;
use ml::preprocess::Preprocessor;
use ml::processor::MlProcessor;
use ml::task_manager::AsyncTaskManager;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use structs::{Error, ProcessingConfig, Result, TaskStatus};
use tracing_subscriber::EnvFilter;

/// pointcloud - turn tabular data into a clustered 3D point cloud
#[derive(Parser, Debug)]
#[command(name = "pointcloud")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full pipeline on a CSV/TSV file and write result files
    Analyze {
        /// Input CSV/TSV file
        #[arg(short, long)]
        csv: PathBuf,

        /// Output directory for result files
        #[arg(short, long, default_value = "./pointcloud_output")]
        output_dir: PathBuf,

        /// Treat input as TSV instead of CSV
        #[arg(long)]
        tsv: bool,

        /// JSON file with a full processing configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Dimensionality reduction method (pca, kernel_pca, tsne, mds, umap)
        #[arg(long)]
        reduction: Option<String>,

        /// Clustering method (kmeans, dbscan, hdbscan, agglomerative, gaussian_mixture)
        #[arg(long)]
        clustering: Option<String>,

        /// Anomaly detection method (isolation_forest, one_class_svm,
        /// local_outlier_factor, elliptic_envelope, ensemble)
        #[arg(long)]
        anomaly: Option<String>,

        /// Skip anomaly detection entirely
        #[arg(long)]
        no_anomalies: bool,

        /// Number of K-means clusters (0 = choose automatically)
        #[arg(short = 'k', long, default_value = "3")]
        clusters: usize,

        /// Column used to scale point sizes
        #[arg(long)]
        size_column: Option<String>,

        /// Column copied into each point as its label
        #[arg(long)]
        label_column: Option<String>,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Search hyperparameters for one algorithm and write optimization.json
    Optimize {
        /// Input CSV/TSV file
        #[arg(short, long)]
        csv: PathBuf,

        /// Output directory for result files
        #[arg(short, long, default_value = "./pointcloud_output")]
        output_dir: PathBuf,

        /// Treat input as TSV instead of CSV
        #[arg(long)]
        tsv: bool,

        /// Algorithm to tune (kmeans, dbscan, hdbscan, agglomerative,
        /// gaussian_mixture, pca, kernel_pca, tsne, mds)
        #[arg(short, long)]
        algorithm: String,

        /// Search method (grid, random)
        #[arg(short, long, default_value = "grid")]
        method: String,

        /// Trial budget for random search
        #[arg(short, long, default_value = "20")]
        trials: usize,

        /// Concurrent trial workers
        #[arg(short, long, default_value = "4")]
        workers: usize,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    match Args::parse().command {
        Commands::Analyze {
            csv,
            output_dir,
            tsv,
            config,
            reduction,
            clustering,
            anomaly,
            no_anomalies,
            clusters,
            size_column,
            label_column,
            seed,
        } => {
            let mut processing = load_config(config.as_deref())?;
            if let Some(name) = reduction {
                processing.reduction_method = parse_variant(&name)?;
            }
            if let Some(name) = clustering {
                processing.clustering_method = parse_variant(&name)?;
            }
            if let Some(name) = anomaly {
                processing.anomaly_method = parse_variant(&name)?;
            }
            if no_anomalies {
                processing.detect_anomalies = false;
            }
            if clusters == 0 {
                processing.kmeans.auto_k_range = Some((2, 10));
            } else {
                processing.kmeans.n_clusters = clusters;
            }
            processing.size_column = size_column;
            processing.label_column = label_column;
            processing.random_state = seed;

            run_analyze(&csv, &output_dir, processing, tsv).await
        }

        Commands::Optimize {
            csv,
            output_dir,
            tsv,
            algorithm,
            method,
            trials,
            workers,
            seed,
        } => {
            let processing = ProcessingConfig {
                random_state: seed,
                ..ProcessingConfig::default()
            };
            run_optimize(
                &csv,
                &output_dir,
                processing,
                tsv,
                &algorithm,
                &method,
                trials,
                workers,
            )
            .await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ProcessingConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        }
        None => Ok(ProcessingConfig::default()),
    }
}

/// Parse a snake_case method name into its enum variant.
fn parse_variant<T: DeserializeOwned>(name: &str) -> Result<T> {
    serde_json::from_value(Value::String(name.to_string()))
        .map_err(|_| Error::UnsupportedMethod(name.to_string()))
}

fn read_records(
    csv_path: &Path,
    tsv: bool,
) -> Result<Vec<serde_json::Map<String, Value>>> {
    if !csv_path.exists() {
        return Err(Error::Config(format!(
            "Input file not found: {}",
            csv_path.display()
        )));
    }
    let table = csv_reader::read_table(csv_path, tsv)?;
    eprintln!(
        "Loaded {} rows x {} columns",
        table.row_count(),
        table.col_count()
    );
    Ok(table.to_records())
}

async fn run_analyze(
    csv_path: &Path,
    output_dir: &Path,
    config: ProcessingConfig,
    tsv: bool,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;
    eprintln!("Analyzing: {}", csv_path.display());
    let records = read_records(csv_path, tsv)?;

    let dataset_id = "cli";
    let manager = AsyncTaskManager::with_defaults();

    let ctrlc_manager = Arc::clone(&manager);
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, cancelling...");
        let _ = ctrlc_manager.cancel(dataset_id);
    })
    .map_err(|e| Error::Config(format!("Failed to set Ctrl+C handler: {e}")))?;

    let sink: ProgressSink = Arc::new(|event| {
        eprintln!("[{:>5.1}%] {}: {}", event.progress, event.stage, event.message);
    });
    manager.submit(dataset_id, move |token| async move {
        MlProcessor::new(config)
            .with_cancel(token)
            .with_progress(sink)
            .process(dataset_id, records)
            .await
    })?;

    let result = loop {
        match manager.status(dataset_id) {
            TaskStatus::Running => tokio::time::sleep(Duration::from_millis(100)).await,
            TaskStatus::Completed(result) => break *result,
            TaskStatus::Failed(message) => return Err(Error::Algorithm(message)),
            TaskStatus::Cancelled => return Err(Error::Cancelled(dataset_id.to_string())),
            TaskStatus::NotFound => {
                return Err(Error::TaskConflict(format!(
                    "{dataset_id} disappeared from the task registry"
                )));
            }
        }
    };

    ml::output::write_points(output_dir, &result)?;
    ml::output::write_clusters(output_dir, &result)?;
    ml::output::write_summary(output_dir, &result)?;

    eprintln!("Output written to {}", output_dir.display());
    eprintln!("  - points.json");
    eprintln!("  - clusters.json");
    eprintln!("  - summary.txt");
    eprintln!(
        "{} points, {} clusters, {} anomalies",
        result.points.len(),
        result.clusters.len(),
        result.anomalies.len()
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_optimize(
    csv_path: &Path,
    output_dir: &Path,
    config: ProcessingConfig,
    tsv: bool,
    algorithm: &str,
    method: &str,
    trials: usize,
    workers: usize,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)?;
    let records = read_records(csv_path, tsv)?;

    let algorithm = OptimizeAlgorithm::from_name(algorithm)?;
    let method = match method {
        "grid" => SearchMethod::Grid,
        "random" => SearchMethod::Random,
        other => return Err(Error::UnsupportedMethod(other.to_string())),
    };

    eprintln!("Preprocessing for optimization...");
    let preprocessed =
        Preprocessor::new(config.preprocess.clone(), config.random_state).run(&records)?;
    let data = Arc::new(preprocessed.matrix.data);

    eprintln!(
        "Optimizing {} ({} search, {} workers)...",
        algorithm.name(),
        method.name(),
        workers
    );
    let optimizer = HyperparameterOptimizer::new(config).with_max_workers(workers);
    let result = optimizer.optimize(algorithm, data, method, trials).await?;

    ml::output::write_optimization(output_dir, &result)?;

    eprintln!("Output written to {}", output_dir.display());
    eprintln!("  - optimization.json");
    eprintln!(
        "Best score {:.4} after {} trials: {}",
        result.best_score, result.n_trials, result.best_params
    );
    Ok(())
}
