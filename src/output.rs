//! Result persistence and console preview.
//!
//! Writes result sets as CSV or JSON, reads saved CSV files back for the
//! `show` command and renders an aligned text preview.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::dune::{ResultSet, Row};
use crate::error::{DuneError, Result};

/// Result file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    /// Pretty-printed array of row objects.
    Json,
}

impl OutputFormat {
    /// Infers the format from a file extension, defaulting to CSV.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => Self::Json,
            _ => Self::Csv,
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid output format: {s}. Expected: csv or json")),
        }
    }
}

/// Writes the result set to `path` in the given format.
///
/// Parent directories are created as needed.
pub fn write_result(result: &ResultSet, path: &Path, format: OutputFormat) -> Result<()> {
    let content = match format {
        OutputFormat::Csv => to_csv(result),
        OutputFormat::Json => serde_json::to_string_pretty(&result.rows)
            .map_err(|e| DuneError::output(format!("Failed to serialize rows: {e}")))?,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| {
            DuneError::output(format!("Failed to create {}: {e}", parent.display()))
        })?;
    }

    fs::write(path, content)
        .map_err(|e| DuneError::output(format!("Failed to write {}: {e}", path.display())))?;

    tracing::info!(
        "Saved {} row(s) to {}",
        result.row_count(),
        path.display()
    );
    Ok(())
}

/// Renders the result set as CSV with a header row.
///
/// Nulls become empty fields; strings are written raw and other values in
/// their JSON form.
pub fn to_csv(result: &ResultSet) -> String {
    let mut out = String::new();
    push_record(&mut out, result.columns.iter().map(String::as_str));

    for row in &result.rows {
        let fields: Vec<String> = result
            .columns
            .iter()
            .map(|column| cell_text(row, column))
            .collect();
        push_record(&mut out, fields.iter().map(String::as_str));
    }

    out
}

fn push_record<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&escape_csv(field));
    }
    out.push('\n');
}

/// Quotes a field containing a delimiter, quote or line break.
pub fn escape_csv(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn cell_text(row: &Row, column: &str) -> String {
    match row.get(column) {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Reads a CSV file written by [`write_result`]; every value is a string.
pub fn read_csv(path: &Path) -> Result<ResultSet> {
    let content = fs::read_to_string(path)
        .map_err(|e| DuneError::output(format!("Failed to read {}: {e}", path.display())))?;
    parse_csv(&content)
        .map_err(|e| DuneError::output(format!("Invalid CSV in {}: {e}", path.display())))
}

/// Parses CSV text with a header row into a result set.
pub fn parse_csv(content: &str) -> std::result::Result<ResultSet, String> {
    let mut records = split_records(content)?.into_iter();

    let Some(columns) = records.next() else {
        return Ok(ResultSet::default());
    };

    let mut rows = Vec::new();
    for (line, record) in records.enumerate() {
        if record.len() != columns.len() {
            return Err(format!(
                "record {} has {} field(s), expected {}",
                line + 1,
                record.len(),
                columns.len()
            ));
        }

        let row: Row = columns
            .iter()
            .cloned()
            .zip(record.into_iter().map(serde_json::Value::String))
            .collect();
        rows.push(row);
    }

    Ok(ResultSet { columns, rows })
}

/// Splits CSV text into records, honouring quoted fields.
fn split_records(content: &str) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}

/// Maximum width of a preview column before truncation.
const MAX_PREVIEW_WIDTH: usize = 40;

/// Renders the first `limit` rows as an aligned text table.
pub fn preview(result: &ResultSet, limit: usize) -> String {
    if result.columns.is_empty() {
        return "(no columns)\n".to_string();
    }

    let shown: Vec<Vec<String>> = result
        .rows
        .iter()
        .take(limit)
        .map(|row| {
            result
                .columns
                .iter()
                .map(|c| truncate(&cell_text(row, c).replace(['\n', '\r'], " ")))
                .collect()
        })
        .collect();

    let widths: Vec<usize> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            shown
                .iter()
                .map(|cells| cells[i].chars().count())
                .chain(std::iter::once(truncate(column).chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    let header: Vec<String> = result.columns.iter().map(|c| truncate(c)).collect();
    push_line(&mut out, &header, &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    push_line(&mut out, &rule, &widths);
    for cells in &shown {
        push_line(&mut out, cells, &widths);
    }

    out.push_str(&format!(
        "({} of {} rows)\n",
        shown.len(),
        result.row_count()
    ));
    out
}

fn push_line(out: &mut String, cells: &[String], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_PREVIEW_WIDTH {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_PREVIEW_WIDTH - 1).collect();
    cut.push('…');
    cut
}
