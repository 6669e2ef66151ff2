//! Tabular preprocessing: sampling, column selection, missing values,
//! outlier handling, scaling, and feature selection.
//!
//! Every applied step appends a line to the audit trail carried in
//! [`Preprocessed::steps`]; non-fatal issues end up in `warnings`.

use crate::ml::stats;
use crate::structs::{
    Error, FeatureMatrix, FeatureSelection, MissingStrategy, OutlierStrategy, Preprocessed,
    PreprocessConfig, Result, ScalingMethod,
};
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Minimum number of rows a dataset must have before processing.
pub const MIN_ROWS: usize = 10;

pub struct Preprocessor {
    config: PreprocessConfig,
    random_state: u64,
}

impl Preprocessor {
    #[must_use]
    pub fn new(config: PreprocessConfig, random_state: u64) -> Self {
        Self {
            config,
            random_state,
        }
    }

    /// Run the full preprocessing chain over raw records.
    ///
    /// # Errors
    /// Returns `Error::Validation` when the input has too few rows, no
    /// numeric columns, or when every row is lost to missing-value drops.
    pub fn run(&self, records: &[Map<String, Value>]) -> Result<Preprocessed> {
        if records.len() < MIN_ROWS {
            return Err(Error::Validation(format!(
                "Dataset has {} rows; at least {MIN_ROWS} required",
                records.len()
            )));
        }

        let mut steps = Vec::new();
        let mut warnings = Vec::new();

        // 1. Sampling
        let indices = self.sample_indices(records, &mut steps);

        // 2. Column selection
        let names = self.select_columns(records, &mut steps)?;

        // 3. Raw numeric extraction (None = missing)
        let mut rows: Vec<Vec<Option<f64>>> = indices
            .iter()
            .map(|&i| names.iter().map(|n| numeric_value(&records[i], n)).collect())
            .collect();
        let mut row_indices = indices;

        // 4. Missing values
        self.handle_missing(&mut rows, &mut row_indices, &mut steps)?;

        let mut data = to_array(&rows);
        let mut names = names;

        // 5. Outliers
        if let Some(strategy) = self.config.outliers {
            apply_outliers(strategy, &mut data, &mut row_indices, &mut steps);
        }

        // 6. Scaling
        apply_scaling(self.config.scaling, &mut data, &mut steps);

        // 7. Feature selection
        if let Some(selection) = &self.config.feature_selection {
            select_features(
                selection,
                records,
                &row_indices,
                &mut data,
                &mut names,
                &mut steps,
                &mut warnings,
            );
        }

        validate(&data, &names, &mut warnings);

        debug!(
            rows = data.nrows(),
            features = data.ncols(),
            "preprocessing complete"
        );

        Ok(Preprocessed {
            matrix: FeatureMatrix {
                names,
                data,
                row_indices,
            },
            steps,
            warnings,
        })
    }

    /// Indices of rows to keep, sampled down to `max_samples` when needed.
    fn sample_indices(&self, records: &[Map<String, Value>], steps: &mut Vec<String>) -> Vec<usize> {
        let n = records.len();
        let Some(max) = self.config.max_samples else {
            return (0..n).collect();
        };
        if n <= max {
            return (0..n).collect();
        }

        let mut rng = SmallRng::seed_from_u64(self.random_state);
        let mut picked = if let Some(column) = &self.config.stratify_column {
            stratified_sample(records, column, max, &mut rng)
        } else {
            let mut all: Vec<usize> = (0..n).collect();
            all.shuffle(&mut rng);
            all.truncate(max);
            all
        };
        picked.sort_unstable();
        steps.push(format!(
            "sampled {} of {n} rows ({})",
            picked.len(),
            if self.config.stratify_column.is_some() {
                "stratified"
            } else {
                "uniform"
            }
        ));
        picked
    }

    fn select_columns(
        &self,
        records: &[Map<String, Value>],
        steps: &mut Vec<String>,
    ) -> Result<Vec<String>> {
        let names = if let Some(requested) = &self.config.feature_columns {
            let present: Vec<String> = requested
                .iter()
                .filter(|name| records.iter().any(|r| r.contains_key(*name)))
                .cloned()
                .collect();
            if present.len() < requested.len() {
                warn!(
                    requested = requested.len(),
                    present = present.len(),
                    "some requested feature columns are missing"
                );
            }
            present
        } else {
            auto_numeric_columns(records)
        };

        if names.is_empty() {
            return Err(Error::Validation(
                "No usable numeric feature columns found".into(),
            ));
        }
        steps.push(format!("selected {} feature columns", names.len()));
        Ok(names)
    }

    fn handle_missing(
        &self,
        rows: &mut Vec<Vec<Option<f64>>>,
        row_indices: &mut Vec<usize>,
        steps: &mut Vec<String>,
    ) -> Result<()> {
        let missing_total: usize = rows
            .iter()
            .map(|r| r.iter().filter(|v| v.is_none()).count())
            .sum();
        if missing_total == 0 {
            return Ok(());
        }

        match self.config.handle_missing {
            MissingStrategy::Drop => {
                let keep: Vec<bool> = rows.iter().map(|r| r.iter().all(Option::is_some)).collect();
                let mut i = 0;
                rows.retain(|_| {
                    let k = keep[i];
                    i += 1;
                    k
                });
                let mut i = 0;
                row_indices.retain(|_| {
                    let k = keep[i];
                    i += 1;
                    k
                });
                if rows.is_empty() {
                    return Err(Error::Validation(
                        "All rows dropped while handling missing values".into(),
                    ));
                }
                steps.push(format!("dropped rows with missing values ({missing_total} cells)"));
            }
            MissingStrategy::Zero => {
                fill_constant(rows, 0.0);
                steps.push("filled missing values with zero".into());
            }
            MissingStrategy::Mean => {
                fill_per_column(rows, stats::mean);
                steps.push("imputed missing values (mean)".into());
            }
            MissingStrategy::Median => {
                fill_per_column(rows, |observed| stats::quartiles(observed).1);
                steps.push("imputed missing values (median)".into());
            }
            MissingStrategy::Mode => {
                fill_per_column(rows, mode);
                steps.push("imputed missing values (mode)".into());
            }
            MissingStrategy::Knn => {
                knn_impute(rows, self.config.knn_neighbors);
                steps.push(format!(
                    "imputed missing values (knn, k={})",
                    self.config.knn_neighbors
                ));
            }
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn select_features(
    selection: &FeatureSelection,
    records: &[Map<String, Value>],
    row_indices: &[usize],
    data: &mut Array2<f64>,
    names: &mut Vec<String>,
    steps: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    let keep: Vec<usize> = match selection {
        FeatureSelection::Variance { threshold } => {
            let kept: Vec<usize> = (0..data.ncols())
                .filter(|&c| stats::variance(&data.column(c).to_vec()) >= *threshold)
                .collect();
            if kept.is_empty() {
                // Keep the single most variable feature rather than none
                let best = (0..data.ncols())
                    .max_by(|&a, &b| {
                        stats::variance(&data.column(a).to_vec())
                            .partial_cmp(&stats::variance(&data.column(b).to_vec()))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .unwrap_or(0);
                warnings.push("variance selection removed every feature; kept the most variable one".into());
                vec![best]
            } else {
                kept
            }
        }
        FeatureSelection::Univariate { target, k } => {
            match target_values(records, row_indices, target) {
                Some(y) => {
                    let mut scored: Vec<(usize, f64)> = (0..data.ncols())
                        .map(|c| {
                            let score = stats::correlation(&data.column(c).to_vec(), &y)
                                .map(f64::abs)
                                .unwrap_or(0.0);
                            (c, score)
                        })
                        .collect();
                    scored.sort_by(|a, b| {
                        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    let mut kept: Vec<usize> =
                        scored.iter().take((*k).max(1)).map(|(c, _)| *c).collect();
                    kept.sort_unstable();
                    kept
                }
                None => {
                    warnings
                        .push(format!("target column '{target}' unusable; feature selection skipped"));
                    return;
                }
            }
        }
        FeatureSelection::ModelBased { target, k } => {
            match target_values(records, row_indices, target) {
                Some(y) => match model_coefficients(data, &y) {
                    Some(coefs) => {
                        let mut scored: Vec<(usize, f64)> =
                            coefs.iter().copied().map(f64::abs).enumerate().collect();
                        scored.sort_by(|a, b| {
                            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                        });
                        let mut kept: Vec<usize> =
                            scored.iter().take((*k).max(1)).map(|(c, _)| *c).collect();
                        kept.sort_unstable();
                        kept
                    }
                    None => {
                        warnings.push("model-based selection failed to solve; skipped".into());
                        return;
                    }
                },
                None => {
                    warnings
                        .push(format!("target column '{target}' unusable; feature selection skipped"));
                    return;
                }
            }
        }
    };

    if keep.len() == names.len() {
        return;
    }
    *data = data.select(ndarray::Axis(1), &keep);
    *names = keep.iter().map(|&c| names[c].clone()).collect();
    steps.push(format!("selected {} features", keep.len()));
}

/// Numeric value of a record field, parsing numeric strings.
fn numeric_value(record: &Map<String, Value>, name: &str) -> Option<f64> {
    match record.get(name) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Bool(b)) => Some(f64::from(u8::from(*b))),
        _ => None,
    }
}

/// Columns where at least 50% of non-null values are numeric.
#[allow(clippy::cast_precision_loss)]
fn auto_numeric_columns(records: &[Map<String, Value>]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }

    names
        .into_iter()
        .filter(|name| {
            let mut non_null = 0usize;
            let mut numeric = 0usize;
            for record in records {
                match record.get(name) {
                    None | Some(Value::Null) => {}
                    Some(v) => {
                        non_null += 1;
                        if numeric_value_of(v) {
                            numeric += 1;
                        }
                    }
                }
            }
            non_null > 0 && numeric as f64 / non_null as f64 >= 0.5
        })
        .collect()
}

fn numeric_value_of(v: &Value) -> bool {
    match v {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

fn stratified_sample(
    records: &[Map<String, Value>],
    column: &str,
    max: usize,
    rng: &mut SmallRng,
) -> Vec<usize> {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        let key = record
            .get(column)
            .map_or_else(|| "<null>".to_string(), ToString::to_string);
        groups.entry(key).or_default().push(i);
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let frac = max as f64 / records.len() as f64;
    let mut picked = Vec::with_capacity(max);
    let mut keys: Vec<&String> = groups.keys().collect();
    keys.sort();
    for key in keys {
        let members = &groups[key];
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let take = ((members.len() as f64 * frac).round() as usize).clamp(1, members.len());
        let mut shuffled = members.clone();
        shuffled.shuffle(rng);
        picked.extend(shuffled.into_iter().take(take));
    }
    picked.truncate(max);
    picked
}

fn fill_constant(rows: &mut [Vec<Option<f64>>], value: f64) {
    for row in rows.iter_mut() {
        for cell in row.iter_mut() {
            if cell.is_none() {
                *cell = Some(value);
            }
        }
    }
}

fn fill_per_column(rows: &mut [Vec<Option<f64>>], statistic: impl Fn(&[f64]) -> f64) {
    let n_cols = rows.first().map_or(0, Vec::len);
    for c in 0..n_cols {
        let observed: Vec<f64> = rows.iter().filter_map(|r| r[c]).collect();
        let fill = if observed.is_empty() {
            0.0
        } else {
            statistic(&observed)
        };
        for row in rows.iter_mut() {
            if row[c].is_none() {
                row[c] = Some(fill);
            }
        }
    }
}

/// Most frequent value, bucketing by exact bit pattern.
fn mode(values: &[f64]) -> f64 {
    let mut counts: HashMap<u64, (usize, f64)> = HashMap::new();
    for &v in values {
        let entry = counts.entry(v.to_bits()).or_insert((0, v));
        entry.0 += 1;
    }
    counts
        .values()
        .max_by_key(|(count, _)| *count)
        .map_or(0.0, |(_, v)| *v)
}

/// Impute missing cells from the k nearest rows that observe them.
///
/// Distance is the mean squared difference over features observed in both
/// rows; rows sharing no features fall back to the column mean.
#[allow(clippy::cast_precision_loss)]
fn knn_impute(rows: &mut Vec<Vec<Option<f64>>>, k: usize) {
    let snapshot = rows.clone();
    let n_cols = snapshot.first().map_or(0, Vec::len);
    let column_means: Vec<f64> = (0..n_cols)
        .map(|c| {
            let observed: Vec<f64> = snapshot.iter().filter_map(|r| r[c]).collect();
            stats::mean(&observed)
        })
        .collect();

    for (i, row) in rows.iter_mut().enumerate() {
        let missing: Vec<usize> = (0..n_cols).filter(|&c| row[c].is_none()).collect();
        if missing.is_empty() {
            continue;
        }

        let mut neighbors: Vec<(f64, usize)> = Vec::new();
        for (j, other) in snapshot.iter().enumerate() {
            if i == j {
                continue;
            }
            let mut dist = 0.0;
            let mut shared = 0usize;
            for c in 0..n_cols {
                if let (Some(a), Some(b)) = (snapshot[i][c], other[c]) {
                    dist += (a - b).powi(2);
                    shared += 1;
                }
            }
            if shared > 0 {
                neighbors.push((dist / shared as f64, j));
            }
        }
        neighbors.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        for c in missing {
            let values: Vec<f64> = neighbors
                .iter()
                .filter_map(|&(_, j)| snapshot[j][c])
                .take(k.max(1))
                .collect();
            row[c] = Some(if values.is_empty() {
                column_means[c]
            } else {
                stats::mean(&values)
            });
        }
    }
}

fn to_array(rows: &[Vec<Option<f64>>]) -> Array2<f64> {
    let n_cols = rows.first().map_or(0, Vec::len);
    let flat: Vec<f64> = rows
        .iter()
        .flat_map(|r| r.iter().map(|v| v.unwrap_or(f64::NAN)))
        .collect();
    Array2::from_shape_vec((rows.len(), n_cols), flat).unwrap_or_else(|_| Array2::zeros((0, 0)))
}

fn apply_outliers(
    strategy: OutlierStrategy,
    data: &mut Array2<f64>,
    row_indices: &mut Vec<usize>,
    steps: &mut Vec<String>,
) {
    match strategy {
        OutlierStrategy::IqrClip => {
            let mut clipped = 0usize;
            for c in 0..data.ncols() {
                let (q1, _, q3) = stats::quartiles(&data.column(c).to_vec());
                let iqr = q3 - q1;
                let lower = q1 - 1.5 * iqr;
                let upper = q3 + 1.5 * iqr;
                for v in data.column_mut(c) {
                    if *v < lower {
                        *v = lower;
                        clipped += 1;
                    } else if *v > upper {
                        *v = upper;
                        clipped += 1;
                    }
                }
            }
            steps.push(format!("clipped outliers (iqr, {clipped} values)"));
        }
        OutlierStrategy::ZScoreRemove { threshold } => {
            let n_cols = data.ncols();
            let column_stats: Vec<(f64, f64)> = (0..n_cols)
                .map(|c| {
                    let col = data.column(c).to_vec();
                    (stats::mean(&col), stats::variance(&col).sqrt())
                })
                .collect();

            let keep: Vec<usize> = (0..data.nrows())
                .filter(|&r| {
                    (0..n_cols).all(|c| {
                        let (m, sd) = column_stats[c];
                        sd <= 0.0 || ((data[[r, c]] - m) / sd).abs() <= threshold
                    })
                })
                .collect();

            // Removing everything would make the matrix unusable
            if !keep.is_empty() && keep.len() < data.nrows() {
                let removed = data.nrows() - keep.len();
                *data = data.select(ndarray::Axis(0), &keep);
                *row_indices = keep.iter().map(|&r| row_indices[r]).collect();
                steps.push(format!("removed {removed} outlier rows (zscore > {threshold})"));
            }
        }
    }
}

fn apply_scaling(method: ScalingMethod, data: &mut Array2<f64>, steps: &mut Vec<String>) {
    match method {
        ScalingMethod::None => {}
        ScalingMethod::Standard => {
            for c in 0..data.ncols() {
                let col = data.column(c).to_vec();
                let m = stats::mean(&col);
                let sd = stats::variance(&col).sqrt();
                for v in data.column_mut(c) {
                    *v = if sd > 0.0 { (*v - m) / sd } else { 0.0 };
                }
            }
        }
        ScalingMethod::MinMax => {
            for c in 0..data.ncols() {
                let col = data.column(c).to_vec();
                let min = col.iter().copied().fold(f64::INFINITY, f64::min);
                let max = col.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let range = max - min;
                for v in data.column_mut(c) {
                    *v = if range > 0.0 { (*v - min) / range } else { 0.0 };
                }
            }
        }
        ScalingMethod::Robust => {
            for c in 0..data.ncols() {
                let (q1, median, q3) = stats::quartiles(&data.column(c).to_vec());
                let iqr = q3 - q1;
                for v in data.column_mut(c) {
                    *v = if iqr > 0.0 { (*v - median) / iqr } else { 0.0 };
                }
            }
        }
        ScalingMethod::Power => {
            for c in 0..data.ncols() {
                let col = data.column(c).to_vec();
                let lambda = best_yeo_johnson_lambda(&col);
                let transformed: Vec<f64> = col.iter().map(|&x| yeo_johnson(x, lambda)).collect();
                let m = stats::mean(&transformed);
                let sd = stats::variance(&transformed).sqrt();
                for (v, &t) in data.column_mut(c).iter_mut().zip(&transformed) {
                    *v = if sd > 0.0 { (t - m) / sd } else { 0.0 };
                }
            }
        }
    }
    steps.push(format!("scaled features ({})", scaling_name(method)));
}

fn scaling_name(method: ScalingMethod) -> &'static str {
    match method {
        ScalingMethod::Standard => "standard",
        ScalingMethod::MinMax => "minmax",
        ScalingMethod::Robust => "robust",
        ScalingMethod::Power => "power",
        ScalingMethod::None => "none",
    }
}

/// Yeo-Johnson transform for a single value.
#[must_use]
pub fn yeo_johnson(x: f64, lambda: f64) -> f64 {
    if x >= 0.0 {
        if lambda.abs() < 1e-12 {
            (x + 1.0).ln()
        } else {
            ((x + 1.0).powf(lambda) - 1.0) / lambda
        }
    } else if (lambda - 2.0).abs() < 1e-12 {
        -(-x + 1.0).ln()
    } else {
        -((-x + 1.0).powf(2.0 - lambda) - 1.0) / (2.0 - lambda)
    }
}

/// Pick the Yeo-Johnson lambda maximizing the profile log-likelihood
/// over a coarse grid.
#[allow(clippy::cast_precision_loss)]
fn best_yeo_johnson_lambda(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mut best = (1.0, f64::NEG_INFINITY);
    let mut lambda = -2.0;
    while lambda <= 2.0 + 1e-9 {
        let transformed: Vec<f64> = values.iter().map(|&x| yeo_johnson(x, lambda)).collect();
        let var = stats::variance(&transformed);
        if var > 0.0 {
            let jacobian: f64 = values
                .iter()
                .map(|&x| x.signum() * (x.abs() + 1.0).ln())
                .sum();
            let llf = -n / 2.0 * var.ln() + (lambda - 1.0) * jacobian;
            if llf > best.1 {
                best = (lambda, llf);
            }
        }
        lambda += 0.5;
    }
    best.0
}

/// Numeric target values aligned to the surviving rows.
fn target_values(
    records: &[Map<String, Value>],
    row_indices: &[usize],
    target: &str,
) -> Option<Vec<f64>> {
    let values: Vec<Option<f64>> = row_indices
        .iter()
        .map(|&i| numeric_value(&records[i], target))
        .collect();
    if values.iter().any(Option::is_none) {
        return None;
    }
    Some(values.into_iter().flatten().collect())
}

/// Least-squares coefficients of standardized features against the target.
fn model_coefficients(data: &Array2<f64>, y: &[f64]) -> Option<Vec<f64>> {
    let n = data.nrows();
    let d = data.ncols();
    if n != y.len() || n == 0 || d == 0 {
        return None;
    }

    // Normal equations with a small ridge term for stability
    let mut xtx = vec![vec![0.0f64; d]; d];
    let mut xty = vec![0.0f64; d];
    for r in 0..n {
        for i in 0..d {
            xty[i] += data[[r, i]] * y[r];
            for j in i..d {
                xtx[i][j] += data[[r, i]] * data[[r, j]];
            }
        }
    }
    for i in 0..d {
        for j in 0..i {
            xtx[i][j] = xtx[j][i];
        }
        xtx[i][i] += 1e-6;
    }

    solve_linear(xtx, xty)
}

/// Gaussian elimination with partial pivoting.
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for col in (row + 1)..n {
            sum -= a[row][col] * x[col];
        }
        x[row] = sum / a[row][row];
    }
    Some(x)
}

fn validate(data: &Array2<f64>, names: &[String], warnings: &mut Vec<String>) {
    if data.iter().any(|v| !v.is_finite()) {
        warnings.push("matrix contains non-finite values after preprocessing".into());
    }
    for (c, name) in names.iter().enumerate() {
        if c < data.ncols() && stats::variance(&data.column(c).to_vec()) <= 0.0 {
            warnings.push(format!("feature '{name}' is constant"));
        }
    }
    if data.nrows() < MIN_ROWS {
        warnings.push(format!(
            "only {} rows remain after preprocessing",
            data.nrows()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::PreprocessConfig;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn make_records(n: usize) -> Vec<Map<String, Value>> {
        (0..n)
            .map(|i| {
                record(&[
                    ("name", json!(format!("row{i}"))),
                    ("a", json!(i as f64)),
                    ("b", json!(i as f64 * 2.0)),
                ])
            })
            .collect()
    }

    #[test]
    fn test_rejects_tiny_dataset() {
        let pre = Preprocessor::new(PreprocessConfig::default(), 42);
        let err = pre.run(&make_records(5)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_auto_detects_numeric_columns() {
        let pre = Preprocessor::new(PreprocessConfig::default(), 42);
        let out = pre.run(&make_records(12)).unwrap();
        assert_eq!(out.matrix.names, vec!["a", "b"]);
        assert_eq!(out.matrix.n_samples(), 12);
    }

    #[test]
    fn test_drop_missing_rows() {
        let mut records = make_records(12);
        records[3].insert("a".into(), Value::Null);
        let pre = Preprocessor::new(PreprocessConfig::default(), 42);
        let out = pre.run(&records).unwrap();
        assert_eq!(out.matrix.n_samples(), 11);
        assert!(!out.matrix.row_indices.contains(&3));
    }

    #[test]
    fn test_mean_imputation() {
        let mut records = make_records(11);
        records[0].insert("a".into(), Value::Null);
        let config = PreprocessConfig {
            handle_missing: MissingStrategy::Mean,
            scaling: ScalingMethod::None,
            ..PreprocessConfig::default()
        };
        let out = Preprocessor::new(config, 42).run(&records).unwrap();
        assert_eq!(out.matrix.n_samples(), 11);
        // Mean of 1..=10
        assert!((out.matrix.data[[0, 0]] - 5.5).abs() < 1e-9);
    }

    #[test]
    fn test_knn_imputation_uses_neighbors() {
        let mut records = make_records(11);
        records[5].insert("a".into(), Value::Null);
        let config = PreprocessConfig {
            handle_missing: MissingStrategy::Knn,
            knn_neighbors: 2,
            scaling: ScalingMethod::None,
            ..PreprocessConfig::default()
        };
        let out = Preprocessor::new(config, 42).run(&records).unwrap();
        // Neighbors by column b (rows 4 and 6) have a = 4 and 6
        assert!((out.matrix.data[[5, 0]] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_standard_scaling_centers_columns() {
        let out = Preprocessor::new(PreprocessConfig::default(), 42)
            .run(&make_records(20))
            .unwrap();
        let col = out.matrix.data.column(0).to_vec();
        assert!(stats::mean(&col).abs() < 1e-9);
        assert!((stats::variance(&col) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_minmax_scaling_bounds() {
        let config = PreprocessConfig {
            scaling: ScalingMethod::MinMax,
            ..PreprocessConfig::default()
        };
        let out = Preprocessor::new(config, 42).run(&make_records(15)).unwrap();
        for v in out.matrix.data.iter() {
            assert!((0.0..=1.0).contains(v));
        }
    }

    #[test]
    fn test_scaling_none_still_audited() {
        let config = PreprocessConfig {
            scaling: ScalingMethod::None,
            ..PreprocessConfig::default()
        };
        let out = Preprocessor::new(config, 42).run(&make_records(12)).unwrap();
        assert!(out.steps.iter().any(|s| s.contains("scaled features (none)")));
    }

    #[test]
    fn test_zscore_outlier_removal() {
        let mut records = make_records(20);
        records.push(record(&[
            ("name", json!("spike")),
            ("a", json!(1000.0)),
            ("b", json!(2000.0)),
        ]));
        let config = PreprocessConfig {
            outliers: Some(OutlierStrategy::ZScoreRemove { threshold: 3.0 }),
            ..PreprocessConfig::default()
        };
        let out = Preprocessor::new(config, 42).run(&records).unwrap();
        assert_eq!(out.matrix.n_samples(), 20);
        assert!(!out.matrix.row_indices.contains(&20));
    }

    #[test]
    fn test_iqr_clipping_bounds_extremes() {
        let mut records = make_records(20);
        records.push(record(&[
            ("name", json!("spike")),
            ("a", json!(1000.0)),
            ("b", json!(2000.0)),
        ]));
        let config = PreprocessConfig {
            outliers: Some(OutlierStrategy::IqrClip),
            scaling: ScalingMethod::None,
            ..PreprocessConfig::default()
        };
        let out = Preprocessor::new(config, 42).run(&records).unwrap();
        assert_eq!(out.matrix.n_samples(), 21);
        let max = out
            .matrix
            .data
            .column(0)
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        assert!(max < 100.0);
    }

    #[test]
    fn test_uniform_sampling_caps_rows() {
        let config = PreprocessConfig {
            max_samples: Some(10),
            ..PreprocessConfig::default()
        };
        let out = Preprocessor::new(config, 42).run(&make_records(50)).unwrap();
        assert_eq!(out.matrix.n_samples(), 10);
        assert!(out.steps.iter().any(|s| s.contains("sampled")));
    }

    #[test]
    fn test_sampling_is_seeded() {
        let config = PreprocessConfig {
            max_samples: Some(10),
            ..PreprocessConfig::default()
        };
        let a = Preprocessor::new(config.clone(), 7)
            .run(&make_records(50))
            .unwrap();
        let b = Preprocessor::new(config, 7).run(&make_records(50)).unwrap();
        assert_eq!(a.matrix.row_indices, b.matrix.row_indices);
    }

    #[test]
    fn test_variance_feature_selection() {
        let mut records = make_records(15);
        for r in &mut records {
            r.insert("constant".into(), json!(1.0));
        }
        let config = PreprocessConfig {
            feature_selection: Some(FeatureSelection::Variance { threshold: 1e-6 }),
            ..PreprocessConfig::default()
        };
        let out = Preprocessor::new(config, 42).run(&records).unwrap();
        assert!(!out.matrix.names.contains(&"constant".to_string()));
    }

    #[test]
    fn test_univariate_selection_keeps_correlated() {
        let records: Vec<Map<String, Value>> = (0..20)
            .map(|i| {
                record(&[
                    ("x", json!(i as f64)),
                    ("noise", json!(if i % 2 == 0 { 1.0 } else { -1.0 })),
                    ("target", json!(i as f64 * 3.0)),
                ])
            })
            .collect();
        let config = PreprocessConfig {
            feature_columns: Some(vec!["x".into(), "noise".into()]),
            feature_selection: Some(FeatureSelection::Univariate {
                target: "target".into(),
                k: 1,
            }),
            ..PreprocessConfig::default()
        };
        let out = Preprocessor::new(config, 42).run(&records).unwrap();
        assert_eq!(out.matrix.names, vec!["x"]);
    }

    #[test]
    fn test_yeo_johnson_identity_at_lambda_one() {
        assert!((yeo_johnson(3.0, 1.0) - 3.0).abs() < 1e-12);
        assert!((yeo_johnson(-3.0, 1.0) + 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_yeo_johnson_log_at_lambda_zero() {
        assert!((yeo_johnson(::std::f64::consts::E - 1.0, 0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_column_warning() {
        let mut records = make_records(12);
        for r in &mut records {
            r.insert("flat".into(), json!(5.0));
        }
        let out = Preprocessor::new(PreprocessConfig::default(), 42)
            .run(&records)
            .unwrap();
        assert!(out.warnings.iter().any(|w| w.contains("flat")));
    }
}
