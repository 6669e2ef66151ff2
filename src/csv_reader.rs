use crate::structs::{Result, TableData};
use csv::ReaderBuilder;
use std::path::Path;

/// Parse a CSV or TSV file into a [`TableData`].
///
/// # Errors
/// Returns an error if the file cannot be read or is not valid CSV/TSV.
pub fn read_table(path: &Path, is_tsv: bool) -> Result<TableData> {
    let delimiter = if is_tsv { b'\t' } else { b',' };

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers: Vec<String> = reader.headers()?.iter().map(ToString::to_string).collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let row: Vec<String> = record.iter().map(ToString::to_string).collect();
        rows.push(row);
    }

    Ok(TableData { headers, rows })
}
