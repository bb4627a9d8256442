//! CSV batch files: parsing uploads and rendering exports.
//!
//! An upload has a header row with `S. No.`, `Product Name` and
//! `Input Image Urls` (any order, case-insensitive, extra columns ignored).
//! The URL cell holds a comma-separated list. Validation collects every
//! problem in the file before rejecting it.

use std::collections::HashSet;

use url::Url;

use crate::error::{ImgBatchError, Result};
use crate::model::Product;

pub const SERIAL_HEADER: &str = "S. No.";
pub const PRODUCT_HEADER: &str = "Product Name";
pub const URLS_HEADER: &str = "Input Image Urls";
pub const OUTPUT_URLS_HEADER: &str = "Output Image Urls";

/// One validated row of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    pub serial_number: i64,
    pub product_name: String,
    pub urls: Vec<String>,
}

impl BatchRow {
    pub fn image_count(&self) -> usize {
        self.urls.len()
    }
}

fn find_column(headers: &csv::StringRecord, name: &str) -> Option<usize> {
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(name))
}

/// Split a URL cell on commas. Empty entries (trailing commas) are dropped.
pub fn split_urls(cell: &str) -> Vec<String> {
    cell.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse and validate an uploaded batch.
///
/// # Errors
/// `InvalidBatch` listing every problem found.
pub fn parse_batch(contents: &[u8]) -> Result<Vec<BatchRow>> {
    let contents = contents.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(contents);
    if contents.iter().all(u8::is_ascii_whitespace) {
        return Err(ImgBatchError::InvalidBatch(vec![
            "Uploaded CSV file is empty".to_string(),
        ]));
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(contents);

    let headers = reader
        .headers()
        .map_err(|e| ImgBatchError::InvalidBatch(vec![format!("Error parsing CSV file: {e}")]))?
        .clone();

    let (Some(serial_col), Some(name_col), Some(urls_col)) = (
        find_column(&headers, SERIAL_HEADER),
        find_column(&headers, PRODUCT_HEADER),
        find_column(&headers, URLS_HEADER),
    ) else {
        return Err(ImgBatchError::InvalidBatch(vec![format!(
            "CSV has incorrect headers. Expected: {SERIAL_HEADER}, {PRODUCT_HEADER}, {URLS_HEADER}"
        )]));
    };

    let mut rows = Vec::new();
    let mut errors = Vec::new();
    let mut seen_serials = HashSet::new();
    let mut row_count = 0usize;

    for record in reader.records() {
        row_count += 1;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                errors.push(format!("Row {row_count}: {e}"));
                continue;
            }
        };
        let row_errors_before = errors.len();

        let serial_cell = record.get(serial_col).unwrap_or_default();
        let serial_number = match serial_cell.parse::<i64>() {
            Ok(n) => Some(n),
            Err(_) if serial_cell.is_empty() => {
                errors.push(format!("Row {row_count}: \"{SERIAL_HEADER}\" is required"));
                None
            }
            Err(_) => {
                errors.push(format!(
                    "Row {row_count}: \"{SERIAL_HEADER}\" must be an integer, got '{serial_cell}'"
                ));
                None
            }
        };
        if let Some(n) = serial_number {
            if !seen_serials.insert(n) {
                errors.push(format!("Row {row_count}: duplicate \"{SERIAL_HEADER}\" {n}"));
            }
        }

        let product_name = record.get(name_col).unwrap_or_default();
        if product_name.is_empty() {
            errors.push(format!("Row {row_count}: \"{PRODUCT_HEADER}\" is required"));
        }

        let urls = split_urls(record.get(urls_col).unwrap_or_default());
        if urls.is_empty() {
            errors.push(format!("Row {row_count}: No image URLs provided"));
        }
        for (index, url) in urls.iter().enumerate() {
            let valid = Url::parse(url)
                .map(|u| matches!(u.scheme(), "http" | "https"))
                .unwrap_or(false);
            if !valid {
                errors.push(format!(
                    "Row {row_count}: Invalid URL format at position {}: {url}",
                    index + 1
                ));
            }
        }

        if errors.len() == row_errors_before {
            if let Some(serial_number) = serial_number {
                rows.push(BatchRow {
                    serial_number,
                    product_name: product_name.to_string(),
                    urls,
                });
            }
        }
    }

    if row_count == 0 {
        errors.push("CSV file has no data rows".to_string());
    }
    if !errors.is_empty() {
        return Err(ImgBatchError::InvalidBatch(errors));
    }
    Ok(rows)
}

/// Render the export file: one row per product, ordered by serial number.
///
/// Output URLs line up with input URLs; an image without output contributes
/// an empty entry.
pub fn render_export(products: &[Product]) -> Result<String> {
    let mut sorted: Vec<&Product> = products.iter().collect();
    sorted.sort_by_key(|p| p.serial_number);

    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(Vec::new());
    writer
        .write_record([SERIAL_HEADER, PRODUCT_HEADER, URLS_HEADER, OUTPUT_URLS_HEADER])
        .map_err(|e| anyhow::anyhow!("Failed to write export header: {e}"))?;

    for product in sorted {
        let inputs = product
            .images
            .iter()
            .map(|i| i.input_url.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let outputs = product
            .images
            .iter()
            .map(|i| i.output_url.as_deref().unwrap_or(""))
            .collect::<Vec<_>>()
            .join(",");
        writer
            .write_record([
                product.serial_number.to_string(),
                product.product_name.clone(),
                inputs,
                outputs,
            ])
            .map_err(|e| anyhow::anyhow!("Failed to write export row: {e}"))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush export: {e}"))?;
    String::from_utf8(bytes).map_err(|e| anyhow::anyhow!("Export is not UTF-8: {e}").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestId;
    use chrono::Utc;

    fn errors_of(result: Result<Vec<BatchRow>>) -> Vec<String> {
        match result {
            Err(ImgBatchError::InvalidBatch(errors)) => errors,
            other => panic!("expected InvalidBatch, got {other:?}"),
        }
    }

    #[test]
    fn parses_valid_batch() {
        let csv = "S. No.,Product Name,Input Image Urls\n\
                   1,SKU1,\"https://img.test/a.jpg, https://img.test/b.jpg\"\n\
                   2,SKU2,https://img.test/c.png\n";
        let rows = parse_batch(csv.as_bytes()).unwrap();
        assert_eq!(
            rows,
            vec![
                BatchRow {
                    serial_number: 1,
                    product_name: "SKU1".to_string(),
                    urls: vec![
                        "https://img.test/a.jpg".to_string(),
                        "https://img.test/b.jpg".to_string()
                    ],
                },
                BatchRow {
                    serial_number: 2,
                    product_name: "SKU2".to_string(),
                    urls: vec!["https://img.test/c.png".to_string()],
                },
            ]
        );
    }

    #[test]
    fn headers_are_case_insensitive_and_reorderable() {
        let csv = "\u{feff}input image urls , product name,s. no.,notes\n\
                   https://img.test/a.jpg,Thing,5,ignored\n";
        let rows = parse_batch(csv.as_bytes()).unwrap();
        assert_eq!(rows[0].serial_number, 5);
        assert_eq!(rows[0].product_name, "Thing");
    }

    #[test]
    fn rejects_wrong_headers() {
        let errors = errors_of(parse_batch(b"id,name,urls\n1,a,https://x.test/a.png\n"));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("CSV has incorrect headers"));
    }

    #[test]
    fn collects_every_row_error() {
        let csv = "S. No.,Product Name,Input Image Urls\n\
                   abc,Thing,https://img.test/a.jpg\n\
                   2,,https://img.test/b.jpg\n\
                   3,Other,\"https://img.test/c.jpg, not-a-url\"\n\
                   4,Empty,\n\
                   3,Dup,https://img.test/d.jpg\n";
        let errors = errors_of(parse_batch(csv.as_bytes()));
        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors[0].starts_with("Row 1:"));
        assert!(errors[1].contains("Product Name"));
        assert!(errors[2].contains("position 2: not-a-url"));
        assert!(errors[3].contains("No image URLs"));
        assert!(errors[4].contains("duplicate"));
    }

    #[test]
    fn rejects_empty_files() {
        let errors = errors_of(parse_batch(b""));
        assert_eq!(errors, vec!["Uploaded CSV file is empty".to_string()]);

        let errors = errors_of(parse_batch(b"S. No.,Product Name,Input Image Urls\n"));
        assert_eq!(errors, vec!["CSV file has no data rows".to_string()]);
    }

    #[test]
    fn trailing_commas_are_ignored() {
        assert_eq!(
            split_urls("https://a.test/1.png, ,https://a.test/2.png,"),
            vec!["https://a.test/1.png", "https://a.test/2.png"]
        );
    }

    #[test]
    fn export_aligns_outputs_and_sorts_by_serial() {
        let id = RequestId::new();
        let mut second = Product::new(
            id,
            2,
            "Second",
            vec![
                "https://img.test/a.png".to_string(),
                "https://img.test/b.png".to_string(),
            ],
        );
        second.images[1].complete("https://cdn.test/b.jpg".to_string(), Utc::now());
        let first = Product::new(id, 1, "First, Inc", vec!["https://img.test/c.png".to_string()]);

        let csv = render_export(&[second, first]).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "S. No.,Product Name,Input Image Urls,Output Image Urls",
                "1,\"First, Inc\",https://img.test/c.png,",
                "2,Second,\"https://img.test/a.png,https://img.test/b.png\",\",https://cdn.test/b.jpg\"",
            ]
        );
    }
}
