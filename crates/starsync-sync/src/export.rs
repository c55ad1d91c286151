//! Per-run artifacts: markdown summary, JSON delta and parquet snapshots.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int32Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use starsync_core::{CustomerEntry, DateEntry, FactOrderLine, IssueKind, ProductEntry, RowIssue};
use starsync_storage::TableCounts;
use tokio::fs;

use crate::resolve::DimensionCandidates;
use crate::{RunMode, RunSummary};

pub const SUMMARY_FILE: &str = "run_summary.md";
pub const DELTA_FILE: &str = "run_delta.json";
const SNAPSHOT_DIR: &str = "snapshots";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub fn reports_dir_for(workspace_root: &Path, summary: &RunSummary) -> PathBuf {
    workspace_root.join("reports").join(summary.run_id.to_string())
}

fn render_summary(summary: &RunSummary) -> String {
    let issues = summary
        .issue_counts()
        .iter()
        .map(|(kind, n)| format!("- {}: {n}", kind.as_str()))
        .collect::<Vec<_>>();
    format!(
        "# Star-Schema Sync Run\n\n- Run ID: `{}`\n- Mode: {}\n- Started: {}\n- Finished: {}\n- Input lines: {}\n- Valid lines: {}\n- Dropped by header dedup: {}\n\n## Inserted\n- Dim_Customer: {}\n- Dim_Product: {}\n- Dim_Date: {}\n- Fact_Order: {}\n- Facts skipped as already loaded: {}\n\n## Issues\n{}\n",
        summary.run_id,
        summary.mode,
        summary.started_at,
        summary.finished_at,
        summary.input_lines,
        summary.valid_lines,
        summary.deduplicated_lines,
        summary.inserted.customers,
        summary.inserted.products,
        summary.inserted.dates,
        summary.inserted.facts,
        summary.skipped_facts,
        if issues.is_empty() {
            "- none".to_string()
        } else {
            issues.join("\n")
        }
    )
}

/// Writes `run_summary.md` and `run_delta.json` under `reports/<run_id>/`.
pub async fn write_reports(workspace_root: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let reports_dir = reports_dir_for(workspace_root, summary);
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    fs::write(reports_dir.join(SUMMARY_FILE), render_summary(summary))
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    let delta = serde_json::to_vec_pretty(summary).context("serializing run delta")?;
    fs::write(reports_dir.join(DELTA_FILE), delta)
        .await
        .with_context(|| format!("writing {DELTA_FILE}"))?;

    Ok(reports_dir)
}

/// Writes the batch's candidate dimension rows and facts as parquet plus a manifest.
pub async fn export_parquet_snapshots(
    reports_dir: &Path,
    candidates: &DimensionCandidates,
    facts: &[FactOrderLine],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join(SNAPSHOT_DIR);
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let tables = [
        ("dim_customer", customer_batch(&candidates.customers)?),
        ("dim_product", product_batch(&candidates.products)?),
        ("dim_date", date_batch(&candidates.dates)?),
        ("fact_order", fact_batch(facts)?),
    ];
    let mut files = Vec::with_capacity(tables.len());
    for (table, batch) in tables {
        files.push(write_snapshot_table(&snapshot_dir, table, &batch).await?);
    }

    let manifest_path = snapshot_dir.join(MANIFEST_FILE);
    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

/// The parts of a `run_delta.json` the digest needs.
#[derive(Debug, Deserialize)]
struct RunDelta {
    run_id: String,
    mode: RunMode,
    finished_at: DateTime<Utc>,
    inserted: TableCounts,
    #[serde(default)]
    skipped_facts: usize,
    #[serde(default)]
    issues: Vec<RowIssue>,
}

fn read_run_delta(path: &Path) -> Result<RunDelta> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Markdown digest of the `runs` most recently finished runs under `reports/`.
pub fn report_daily_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let reports_root = workspace_root
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reports");
    let mut deltas = Vec::new();
    for entry in std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let run_dir = entry?.path();
        let delta_path = run_dir.join(DELTA_FILE);
        if delta_path.is_file() {
            deltas.push((run_dir, read_run_delta(&delta_path)?));
        }
    }
    deltas.sort_by(|(_, a), (_, b)| b.finished_at.cmp(&a.finished_at));

    let mut out = String::from("# Star-Schema Sync Report\n");
    for (run_dir, delta) in deltas.into_iter().take(runs.max(1)) {
        let mut by_kind: BTreeMap<IssueKind, usize> = BTreeMap::new();
        for issue in &delta.issues {
            *by_kind.entry(issue.kind).or_default() += 1;
        }
        let issues = if by_kind.is_empty() {
            "none".to_string()
        } else {
            by_kind
                .iter()
                .map(|(kind, n)| format!("{} {n}", kind.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        };

        out.push_str(&format!(
            "\n## Run `{}` ({}, finished {})\n",
            delta.run_id, delta.mode, delta.finished_at
        ));
        out.push_str(&format!(
            "- inserted: {} customers, {} products, {} dates, {} facts ({} skipped)\n",
            delta.inserted.customers,
            delta.inserted.products,
            delta.inserted.dates,
            delta.inserted.facts,
            delta.skipped_facts
        ));
        out.push_str(&format!("- issues: {issues}\n"));
        let manifest_path = run_dir.join(SNAPSHOT_DIR).join(MANIFEST_FILE);
        if manifest_path.is_file() {
            out.push_str(&format!("- parquet manifest: `{}`\n", manifest_path.display()));
        }
    }
    Ok(out)
}

/// Encodes `batch` in memory, writes it as `<table>.parquet`, and describes the written bytes.
async fn write_snapshot_table(
    snapshot_dir: &Path,
    table: &str,
    batch: &RecordBatch,
) -> Result<ParquetManifestFile> {
    let mut encoded = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut encoded, batch.schema(), None)
        .with_context(|| format!("opening {table} parquet writer"))?;
    writer
        .write(batch)
        .with_context(|| format!("encoding {table} rows"))?;
    writer
        .close()
        .with_context(|| format!("finishing {table} parquet"))?;

    let file_name = format!("{table}.parquet");
    let path = snapshot_dir.join(&file_name);
    fs::write(&path, &encoded)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(ParquetManifestFile {
        name: table.to_string(),
        path: format!("{SNAPSHOT_DIR}/{file_name}"),
        sha256: hex::encode(Sha256::digest(&encoded)),
        bytes: encoded.len() as u64,
    })
}

fn text_column<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(values))
}

fn nullable_text_column<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(values.collect::<StringArray>())
}

fn customer_batch(rows: &[CustomerEntry]) -> Result<RecordBatch> {
    RecordBatch::try_from_iter_with_nullable([
        ("customer_id", text_column(rows.iter().map(|r| r.customer_id.as_str())), false),
        ("name", text_column(rows.iter().map(|r| r.name.as_str())), false),
        ("segment", text_column(rows.iter().map(|r| r.segment.as_str())), false),
    ])
    .context("building dim_customer record batch")
}

fn product_batch(rows: &[ProductEntry]) -> Result<RecordBatch> {
    RecordBatch::try_from_iter_with_nullable([
        ("item_code", text_column(rows.iter().map(|r| r.item_code.as_str())), false),
        ("unit", text_column(rows.iter().map(|r| r.unit.as_str())), false),
        ("name", text_column(rows.iter().map(|r| r.name.as_str())), false),
        (
            "category_code",
            nullable_text_column(rows.iter().map(|r| r.category_code.as_deref())),
            true,
        ),
        (
            "category_name",
            nullable_text_column(rows.iter().map(|r| r.category_name.as_deref())),
            true,
        ),
    ])
    .context("building dim_product record batch")
}

fn date_batch(rows: &[DateEntry]) -> Result<RecordBatch> {
    let dates: Vec<String> = rows.iter().map(|r| r.date.to_string()).collect();
    RecordBatch::try_from_iter_with_nullable([
        ("date", text_column(dates.iter().map(String::as_str)), false),
        (
            "year",
            Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.year))) as ArrayRef,
            false,
        ),
        (
            "month",
            Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.month))) as ArrayRef,
            false,
        ),
        (
            "day",
            Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.day))) as ArrayRef,
            false,
        ),
        (
            "quarter",
            Arc::new(UInt32Array::from_iter_values(rows.iter().map(|r| r.quarter))) as ArrayRef,
            false,
        ),
    ])
    .context("building dim_date record batch")
}

fn fact_batch(rows: &[FactOrderLine]) -> Result<RecordBatch> {
    let dates: Vec<String> = rows.iter().map(|r| r.order_date.to_string()).collect();
    RecordBatch::try_from_iter_with_nullable([
        ("order_code", text_column(rows.iter().map(|r| r.order_code.as_str())), false),
        ("customer_id", text_column(rows.iter().map(|r| r.customer_id.as_str())), false),
        ("item_code", text_column(rows.iter().map(|r| r.item_code.as_str())), false),
        ("unit", text_column(rows.iter().map(|r| r.unit.as_str())), false),
        ("order_date", text_column(dates.iter().map(String::as_str)), false),
        (
            "quantity",
            Arc::new(rows.iter().map(|r| r.quantity).collect::<Int64Array>()) as ArrayRef,
            true,
        ),
        (
            "unit_price",
            Arc::new(rows.iter().map(|r| r.unit_price).collect::<Float64Array>()) as ArrayRef,
            true,
        ),
        (
            "line_total",
            Arc::new(rows.iter().map(|r| r.line_total).collect::<Float64Array>()) as ArrayRef,
            true,
        ),
    ])
    .context("building fact_order record batch")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_delta(root: &Path, run_id: &str, finished_at: &str, facts: usize) {
        let dir = root.join("reports").join(run_id);
        std::fs::create_dir_all(&dir).unwrap();
        let delta = serde_json::json!({
            "run_id": run_id,
            "mode": "daily",
            "started_at": finished_at,
            "finished_at": finished_at,
            "inserted": {"customers": 0, "products": 0, "dates": 0, "facts": facts},
            "skipped_facts": 1,
            "issues": [{"kind": "categorization", "row": 3, "detail": "Honey"}]
        });
        std::fs::write(dir.join(DELTA_FILE), delta.to_string()).unwrap();
    }

    #[test]
    fn digest_lists_latest_finished_runs_first() {
        let dir = tempfile::tempdir().unwrap();
        write_delta(dir.path(), "run-b", "2024-01-02T23:00:00Z", 5);
        write_delta(dir.path(), "run-a", "2024-01-01T23:00:00Z", 7);
        write_delta(dir.path(), "run-c", "2024-01-03T23:00:00Z", 9);
        std::fs::create_dir_all(dir.path().join("reports/not-a-run")).unwrap();

        let digest = report_daily_markdown(2, Some(dir.path().to_path_buf())).unwrap();
        let c = digest.find("run-c").expect("latest run listed");
        let b = digest.find("run-b").expect("second run listed");
        assert!(c < b);
        assert!(!digest.contains("run-a"));
        assert!(digest.contains("9 facts (1 skipped)"));
        assert!(digest.contains("categorization 1"));
    }

    #[tokio::test]
    async fn manifest_hashes_match_written_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = export_parquet_snapshots(dir.path(), &DimensionCandidates::default(), &[])
            .await
            .unwrap();
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 4);
        for file in files {
            let bytes = std::fs::read(dir.path().join(file["path"].as_str().unwrap())).unwrap();
            assert_eq!(file["bytes"].as_u64(), Some(bytes.len() as u64));
            assert_eq!(file["sha256"].as_str(), Some(hex::encode(Sha256::digest(&bytes)).as_str()));
        }
    }
}
