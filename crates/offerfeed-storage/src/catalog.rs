use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::Context;
use offerfeed_core::{FeedRow, CATALOG_COLUMNS, INVENTORY_COLUMNS};
use reqwest::Url;
use serde::Serialize;
use tokio::fs;

/// Serializes rows in column order. The header is written even for an empty set.
pub fn encode_catalog_csv<R: FeedRow>(rows: &[R]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(R::COLUMNS)
        .context("writing catalog header")?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("serializing catalog row {}", row.vehicle_id()))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing catalog csv: {}", err.error()))
}

/// Data rows of an existing catalog, or `None` when there is no file.
pub async fn count_catalog_rows(path: &Path) -> anyhow::Result<Option<usize>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking catalog {}", path.display()))?
    {
        return Ok(None);
    }
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading catalog {}", path.display()))?;
    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    let mut count = 0usize;
    for record in reader.records() {
        record.with_context(|| format!("parsing catalog {}", path.display()))?;
        count += 1;
    }
    Ok(Some(count))
}

/// Loads a catalog by header name; absent columns read as empty strings.
pub async fn read_catalog_rows(path: &Path) -> anyhow::Result<Vec<BTreeMap<String, String>>> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading catalog {}", path.display()))?;
    parse_catalog_csv(&bytes).with_context(|| format!("parsing catalog {}", path.display()))
}

pub fn parse_catalog_csv(bytes: &[u8]) -> anyhow::Result<Vec<BTreeMap<String, String>>> {
    let mut reader = csv::Reader::from_reader(bytes);
    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.trim().to_string(), v.to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Hard integrity problems of a candidate set: blank required fields and repeated ids.
pub fn validate_rows<R: FeedRow>(rows: &[R]) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    for (index, row) in rows.iter().enumerate() {
        let id = row.vehicle_id();
        let missing = row.missing_required();
        if !missing.is_empty() {
            problems.push(format!(
                "row {} ({id}): missing {}",
                index + 1,
                missing.join(", ")
            ));
        }
        if !id.trim().is_empty() && !seen.insert(id) {
            problems.push(format!("duplicate vehicle_id {id}"));
        }
    }
    problems
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogValidation {
    pub row_count: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CatalogValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

fn is_http_url(value: &str) -> bool {
    Url::parse(value.trim())
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

/// Checks a published catalog the way downstream ingestion would.
pub async fn validate_catalog_file(path: &Path) -> anyhow::Result<CatalogValidation> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading catalog {}", path.display()))?;
    let mut reader = csv::Reader::from_reader(bytes.as_slice());
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    // Inventory artifacts are told apart by their dealer location columns.
    let columns: &[&str] = if headers.iter().any(|h| h == "address") {
        &INVENTORY_COLUMNS
    } else {
        &CATALOG_COLUMNS
    };

    let mut report = CatalogValidation::default();
    for &column in columns {
        if !headers.iter().any(|h| h == column) {
            report.errors.push(format!("missing column {column}"));
        }
    }
    if !report.errors.is_empty() {
        return Ok(report);
    }

    let rows = parse_catalog_csv(&bytes)
        .with_context(|| format!("parsing catalog {}", path.display()))?;
    report.row_count = rows.len();

    let mut seen = HashSet::new();
    for (index, row) in rows.iter().enumerate() {
        let line = index + 2;
        let field = |name: &str| row.get(name).map(|v| v.trim()).unwrap_or_default();

        let id = field("vehicle_id");
        if id.is_empty() {
            report.errors.push(format!("line {line}: empty vehicle_id"));
        } else if !seen.insert(id.to_string()) {
            report.errors.push(format!("line {line}: duplicate vehicle_id {id}"));
        }

        for required in ["title", "link", "image_link"] {
            if field(required).is_empty() {
                report.errors.push(format!("line {line}: empty {required}"));
            }
        }
        if field("price").is_empty() && field("amount_price").is_empty() {
            report
                .errors
                .push(format!("line {line}: neither price nor amount_price set"));
        }

        let link = field("link");
        if !link.is_empty() && !is_http_url(link) {
            report.errors.push(format!("line {line}: invalid link {link}"));
        }
        let image = field("image_link");
        if !image.is_empty() && !is_http_url(image) {
            report
                .warnings
                .push(format!("line {line}: invalid image_link {image}"));
        }
        let amount = field("amount_price");
        if !amount.is_empty() && !amount.chars().any(|c| c.is_alphabetic()) {
            report
                .warnings
                .push(format!("line {line}: amount_price {amount} has no currency"));
        }
    }

    Ok(report)
}
