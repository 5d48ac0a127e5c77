//! Reference list ingestion
//!
//! The reference list is a CSV file with a header row. The first column holds the
//! repository URL; the optional second and third columns hold a category and the date
//! the entry was added. Any further columns are ignored.

use anyhow::{Context, Result};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// One entry of the reference list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRecord {
    pub url: String,
    pub category: Option<String>,
    pub added_date: Option<String>,
}

/// Read all records from a reference list file
pub fn read_reference_list(path: &Path) -> Result<Vec<ReferenceRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open reference list: {:?}", path))?;

    let records = parse_reference_list(file)
        .with_context(|| format!("Failed to parse reference list: {:?}", path))?;

    info!("Read {} entries from {:?}", records.len(), path);
    Ok(records)
}

/// Parse reference records from any CSV source
pub fn parse_reference_list<R: Read>(source: R) -> Result<Vec<ReferenceRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(source);

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("Malformed row {}", index + 2))?;

        let url = row.get(0).unwrap_or_default();
        if url.is_empty() {
            debug!("Skipping row {} without a URL", index + 2);
            continue;
        }

        records.push(ReferenceRecord {
            url: url.to_string(),
            category: optional_column(&row, 1),
            added_date: optional_column(&row, 2),
        });
    }

    Ok(records)
}

fn optional_column(row: &csv::StringRecord, index: usize) -> Option<String> {
    row.get(index)
        .filter(|value| !value.is_empty())
        .map(String::from)
}
