//! Raw order input loading, reference catalog, and field normalization.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use starsync_core::{parse_order_date, IssueKind, NormalizedOrderLine, RowIssue};
use thiserror::Error;
use tracing::debug;

pub mod catalog;
pub mod normalize;

pub use catalog::Catalog;
pub use normalize::{
    line_total, normalize_customer_name, normalize_date, normalize_product_name, order_code,
    repair_number, repair_price, FieldNormalizer, OrderCoder,
};

pub const CRATE_NAME: &str = "starsync-ingest";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid json input: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported input shape: {0}")]
    UnsupportedShape(&'static str),
    #[error("spreadsheet input {0:?} is not read directly; export its rows as a JSON array of objects")]
    Spreadsheet(String),
    #[error("row {row}: required field `{field}` is missing")]
    MissingField { row: usize, field: &'static str },
    #[error("row {row}: date {value:?} is not a calendar date")]
    DateParse { row: usize, value: String },
}

impl IngestError {
    /// Row-level failures are recovered by dropping the row.
    pub fn to_row_issue(&self) -> Option<RowIssue> {
        match self {
            Self::MissingField { row, .. } | Self::DateParse { row, .. } => Some(RowIssue::new(
                IssueKind::InputValidation,
                Some(*row),
                self.to_string(),
            )),
            _ => None,
        }
    }
}

/// A scalar as transcribed: numbers may arrive as JSON numbers or noisy text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawOrderHeader {
    #[serde(default, alias = "Ngày tạo đơn")]
    pub date: Option<String>,
    #[serde(default, alias = "Tên khách hàng")]
    pub customer: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLineItem {
    #[serde(default, alias = "Tên mặt hàng")]
    pub product: Option<String>,
    #[serde(default, alias = "Đơn vị tính")]
    pub unit: Option<String>,
    #[serde(default, alias = "Số lượng")]
    pub quantity: Option<RawValue>,
    #[serde(default, alias = "Đơn giá")]
    pub unit_price: Option<RawValue>,
}

/// One upstream block: the order header followed by its line items.
#[derive(Debug, Clone, Default)]
pub struct RawOrderBlock {
    pub header: RawOrderHeader,
    pub items: Vec<RawLineItem>,
}

/// One line of the tabular dataset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlatRow {
    #[serde(default, alias = "Ngày tạo đơn")]
    pub date: Option<String>,
    #[serde(default, alias = "Mã tạo đơn")]
    pub order_code: Option<String>,
    #[serde(default, alias = "Tên khách hàng")]
    pub customer: Option<String>,
    #[serde(default, alias = "Phân khúc khách hàng")]
    pub segment: Option<String>,
    #[serde(default, alias = "Mã nhóm hàng")]
    pub category_code: Option<String>,
    #[serde(default, alias = "Tên nhóm hàng")]
    pub category_name: Option<String>,
    #[serde(default, alias = "Mã mặt hàng")]
    pub item_code: Option<String>,
    #[serde(default, alias = "Tên mặt hàng")]
    pub product: Option<String>,
    #[serde(default, alias = "Đơn vị tính")]
    pub unit: Option<String>,
    #[serde(default, alias = "Số lượng")]
    pub quantity: Option<RawValue>,
    #[serde(default, alias = "Đơn giá")]
    pub unit_price: Option<RawValue>,
    /// Accepted but always recomputed.
    #[serde(default, alias = "Thành tiền")]
    pub line_total: Option<RawValue>,
}

#[derive(Debug, Clone)]
pub enum RawInput {
    OrderBlocks(Vec<RawOrderBlock>),
    FlatRows(Vec<FlatRow>),
}

impl RawInput {
    pub fn line_count(&self) -> usize {
        match self {
            Self::OrderBlocks(blocks) => blocks.iter().map(|b| b.items.len()).sum(),
            Self::FlatRows(rows) => rows.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedInput {
    pub input: RawInput,
    pub issues: Vec<RowIssue>,
}

pub fn load_input(path: impl AsRef<Path>) -> Result<LoadedInput> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if matches!(extension.as_deref(), Some("xlsx" | "xls")) {
        return Err(IngestError::Spreadsheet(path.display().to_string()).into());
    }
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_input(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_input(text: &str) -> Result<LoadedInput, IngestError> {
    let doc: JsonValue = serde_json::from_str(text)?;
    let JsonValue::Array(entries) = doc else {
        return Err(IngestError::UnsupportedShape("top-level value must be an array"));
    };

    if entries.iter().all(JsonValue::is_array) {
        Ok(parse_blocks(entries))
    } else if entries.iter().all(JsonValue::is_object) {
        Ok(parse_flat_rows(entries))
    } else {
        Err(IngestError::UnsupportedShape(
            "entries must be all order blocks or all flat rows",
        ))
    }
}

fn malformed(detail: String) -> RowIssue {
    RowIssue::new(IssueKind::MalformedBlock, None, detail)
}

fn parse_blocks(entries: Vec<JsonValue>) -> LoadedInput {
    let mut blocks = Vec::with_capacity(entries.len());
    let mut issues = Vec::new();

    for (block_idx, entry) in entries.into_iter().enumerate() {
        let JsonValue::Array(values) = entry else {
            continue;
        };
        let mut values = values.into_iter();
        let header = match values.next() {
            Some(first @ JsonValue::Object(_)) => match serde_json::from_value(first) {
                Ok(header) => header,
                Err(err) => {
                    issues.push(malformed(format!("block {block_idx}: bad header: {err}")));
                    continue;
                }
            },
            _ => {
                issues.push(malformed(format!("block {block_idx}: missing order header")));
                continue;
            }
        };

        let mut items = Vec::new();
        for (item_idx, value) in values.enumerate() {
            if !value.is_object() {
                issues.push(malformed(format!(
                    "block {block_idx} item {item_idx}: not an object"
                )));
                continue;
            }
            match serde_json::from_value(value) {
                Ok(item) => items.push(item),
                Err(err) => issues.push(malformed(format!(
                    "block {block_idx} item {item_idx}: {err}"
                ))),
            }
        }
        blocks.push(RawOrderBlock { header, items });
    }

    debug!(blocks = blocks.len(), skipped = issues.len(), "parsed order blocks");
    LoadedInput {
        input: RawInput::OrderBlocks(blocks),
        issues,
    }
}

fn parse_flat_rows(entries: Vec<JsonValue>) -> LoadedInput {
    let mut rows = Vec::with_capacity(entries.len());
    let mut issues = Vec::new();
    for (idx, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value(entry) {
            Ok(row) => rows.push(row),
            Err(err) => issues.push(malformed(format!("row {idx}: {err}"))),
        }
    }
    LoadedInput {
        input: RawInput::FlatRows(rows),
        issues,
    }
}

/// Normalizes every line of the input, preserving document order.
pub fn normalize_input(input: &RawInput, catalog: &Catalog) -> Vec<NormalizedOrderLine> {
    let mut normalizer = FieldNormalizer::new(catalog);
    let lines: Vec<_> = match input {
        RawInput::OrderBlocks(blocks) => blocks
            .iter()
            .flat_map(|block| normalizer.normalize_block(block))
            .collect(),
        RawInput::FlatRows(rows) => rows
            .iter()
            .map(|row| normalizer.normalize_flat_row(row))
            .collect(),
    };
    debug!(
        lines = lines.len(),
        orders = normalizer.coder().distinct_orders(),
        reused_codes = normalizer.coder().cache_hits(),
        "normalized input"
    );
    lines
}

/// Checks the required fields of a normalized line and parses its order date.
pub fn validate_line(line: &NormalizedOrderLine) -> Result<NaiveDate, IngestError> {
    let required = [
        ("customer name", &line.customer_name),
        ("product name", &line.product_name),
        ("unit", &line.unit),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(IngestError::MissingField {
                row: line.source_row,
                field,
            });
        }
    }
    parse_order_date(&line.order_date).ok_or_else(|| IngestError::DateParse {
        row: line.source_row,
        value: line.order_date.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCKS: &str = r#"[
        [{"Ngày tạo đơn": "ngày 1 tháng 1 năm 2024", "Tên khách hàng": "Acme"},
         {"Tên mặt hàng": "Nấm Rơm tươi", "Đơn vị tính": "kg", "Số lượng": "2", "Đơn giá": 45},
         "garbage"],
        [],
        [{"date": "01/01/2024", "customer": "Acme (branch 2)"},
         {"product": "Ớt", "unit": "hộp", "quantity": 1, "unit_price": "30.000"}]
    ]"#;

    #[test]
    fn spreadsheet_paths_are_rejected_with_export_hint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("processed_output.XLSX");
        fs::write(&path, b"PK\x03\x04").expect("write");
        let err = load_input(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IngestError>(),
            Some(IngestError::Spreadsheet(_))
        ));
        assert!(err.to_string().contains("JSON array of objects"));
    }

    #[test]
    fn parses_blocks_and_reports_malformed_entries() {
        let loaded = parse_input(BLOCKS).expect("parse");
        let RawInput::OrderBlocks(blocks) = &loaded.input else {
            panic!("expected blocks");
        };
        assert_eq!(blocks.len(), 2);
        assert_eq!(loaded.input.line_count(), 2);
        assert_eq!(loaded.issues.len(), 2);
        assert!(loaded
            .issues
            .iter()
            .all(|i| i.kind == IssueKind::MalformedBlock));
    }

    #[test]
    fn headers_sharing_date_and_customer_share_an_order_code() {
        let loaded = parse_input(BLOCKS).expect("parse");
        let lines = normalize_input(&loaded.input, &Catalog::default());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].order_date, "01/01/2024");
        assert_eq!(lines[1].customer_name, "Acme");
        assert_eq!(lines[0].order_code, lines[1].order_code);
        assert_eq!(lines[0].line_total, Some(2 * 45_000));
        assert_eq!(lines[1].line_total, Some(30_000));
        assert_eq!((lines[0].source_row, lines[1].source_row), (0, 1));
    }

    #[test]
    fn flat_rows_keep_source_codes_and_hints() {
        let text = r#"[
            {"Ngày tạo đơn": "02/01/2024", "Mã tạo đơn": "DH-LEGACY1", "Tên khách hàng": "Beba",
             "Phân khúc khách hàng": "Wholesale", "Mã mặt hàng": "T", "Mã nhóm hàng": "T",
             "Tên nhóm hàng": "Tiêu hột", "Tên mặt hàng": "Tiêu hột", "Đơn vị tính": "hộp",
             "Số lượng": 3, "Đơn giá": 8, "Thành tiền": 999}
        ]"#;
        let loaded = parse_input(text).expect("parse");
        let lines = normalize_input(&loaded.input, &Catalog::default());
        let line = &lines[0];
        assert_eq!(line.order_code, "DH-LEGACY1");
        assert_eq!(line.segment_hint.as_deref(), Some("Other"));
        assert_eq!(line.line_total, Some(24_000));
        let category = line.source_category.as_ref().expect("category");
        assert_eq!(category.item_code, "T");
        assert_eq!(category.category_name.as_deref(), Some("Tiêu hột"));
    }

    #[test]
    fn mixed_documents_are_rejected() {
        let err = parse_input(r#"[[{"date": "x"}], {"date": "y"}]"#).unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedShape(_)));
        assert!(matches!(parse_input("{}"), Err(IngestError::UnsupportedShape(_))));
    }

    #[test]
    fn validation_rejects_unparseable_dates_and_missing_fields() {
        let loaded = parse_input(
            r#"[[{"date": "hôm qua", "customer": "Acme"}, {"product": "Ớt", "unit": "hộp", "quantity": 1, "unit_price": 5}],
                [{"date": "01/01/2024", "customer": "Acme"}, {"product": "Ớt", "quantity": 1, "unit_price": 5}]]"#,
        )
        .expect("parse");
        let lines = normalize_input(&loaded.input, &Catalog::default());

        let err = validate_line(&lines[0]).unwrap_err();
        assert!(matches!(err, IngestError::DateParse { row: 0, .. }));
        assert_eq!(
            err.to_row_issue().map(|i| i.kind),
            Some(IssueKind::InputValidation)
        );

        let err = validate_line(&lines[1]).unwrap_err();
        assert!(matches!(err, IngestError::MissingField { field: "unit", .. }));
    }
}
