pub mod anomaly;
pub mod clustering;
pub mod forest;
pub mod hdbscan;
pub mod metrics;
pub mod optimizer;
pub mod output;
pub mod params;
pub mod pipeline;
pub mod preprocess;
pub mod processor;
pub mod reduction;
pub mod stats;
pub mod task_manager;
