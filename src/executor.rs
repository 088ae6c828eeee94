//! Query execution and result shaping.

use crate::constants::LOG_QUERY_TRUNCATE_LENGTH;
use crate::error::ServerError;
use crate::sanitize::sanitize;
use crate::session::SessionManager;
use crate::xmla::{CellValue, Rowset};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// A language-neutral result cell.
///
/// Serializes untagged: `Null` becomes JSON `null`, never zero or `""`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultValue {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl ResultValue {
    /// Convert a remote cell.
    ///
    /// Dates become ISO-8601 text. Decimals keep full precision as text
    /// unless `coerce_numbers` is set.
    pub fn from_cell(cell: CellValue, coerce_numbers: bool) -> Self {
        match cell {
            CellValue::Null => ResultValue::Null,
            CellValue::Boolean(v) => ResultValue::Bool(v),
            CellValue::Integer(v) => ResultValue::Integer(v),
            CellValue::Double(v) if v.is_finite() => ResultValue::Number(v),
            CellValue::Double(v) => ResultValue::Text(v.to_string()),
            CellValue::Decimal(v) if coerce_numbers => v
                .to_string()
                .parse::<f64>()
                .map(ResultValue::Number)
                .unwrap_or_else(|_| ResultValue::Text(v.to_string())),
            CellValue::Text(v) => ResultValue::Text(v),
            other => other
                .as_text()
                .map(ResultValue::Text)
                .unwrap_or(ResultValue::Null),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ResultValue::Null)
    }
}

/// Result of a query execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// The statement as sent to the server.
    pub query: String,

    /// Column names in server order.
    pub columns: Vec<String>,

    /// Rows in server order, capped at the row limit.
    pub rows: Vec<Vec<ResultValue>>,

    /// Rows returned by the server, before the cap.
    pub row_count: usize,

    /// Whether `rows` was cut at the row limit.
    pub truncated: bool,

    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Shape a rowset, keeping at most `max_rows` rows.
    pub fn from_rowset(query: String, rowset: Rowset, max_rows: usize, coerce_numbers: bool) -> Self {
        let row_count = rowset.len();
        let columns = rowset.columns.into_iter().map(|c| c.name).collect();
        let rows = rowset
            .rows
            .into_iter()
            .take(max_rows)
            .map(|row| {
                row.into_iter()
                    .map(|cell| ResultValue::from_cell(cell, coerce_numbers))
                    .collect()
            })
            .collect();

        Self {
            query,
            columns,
            rows,
            row_count,
            truncated: row_count > max_rows,
            execution_time_ms: 0,
        }
    }

    /// Rows as JSON objects keyed by column name, for prompts.
    pub fn records(&self, limit: usize) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.rows
            .iter()
            .take(limit)
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(|v| serde_json::to_value(v).unwrap_or_default()))
                    .collect()
            })
            .collect()
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Row cap for this call; never above the configured maximum.
    pub max_rows: Option<usize>,
    pub coerce_numbers: bool,
}

/// Sanitizes and runs queries on the session.
pub struct QueryExecutor {
    session: Arc<SessionManager>,
    max_rows: usize,
}

impl QueryExecutor {
    pub fn new(session: Arc<SessionManager>, max_rows: usize) -> Self {
        Self { session, max_rows }
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Sanitize `raw` and run it.
    pub async fn execute(&self, raw: &str, options: ExecuteOptions) -> Result<QueryResult, ServerError> {
        let query = sanitize(raw);
        if query.is_empty() {
            return Err(ServerError::validation("query is empty after removing formatting"));
        }

        let cap = options
            .max_rows
            .map_or(self.max_rows, |n| n.min(self.max_rows));

        debug!(
            "Executing query: {}",
            truncate_for_log(&query, LOG_QUERY_TRUNCATE_LENGTH)
        );
        let start = Instant::now();
        let rowset = self.session.execute_raw(&query).await?;

        let mut result = QueryResult::from_rowset(query, rowset, cap, options.coerce_numbers);
        result.execution_time_ms = start.elapsed().as_millis() as u64;
        debug!(
            "Query returned {} rows in {}ms",
            result.row_count, result.execution_time_ms
        );
        Ok(result)
    }
}

/// Shorten text for log lines, on a character boundary.
pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmla::RowsetColumn;
    use chrono::NaiveDateTime;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn rowset() -> Rowset {
        let date = NaiveDateTime::parse_from_str("2024-01-15T00:00:00", "%Y-%m-%dT%H:%M:%S").unwrap();
        Rowset::new(
            vec![
                RowsetColumn::new("Sales[Date]"),
                RowsetColumn::new("Sales[Amount]"),
                RowsetColumn::new("Sales[Region]"),
            ],
            vec![
                vec![
                    CellValue::DateTime(date),
                    CellValue::Decimal(Decimal::from_str("1234.5600").unwrap()),
                    CellValue::Null,
                ],
                vec![CellValue::Null, CellValue::Integer(0), CellValue::Text(String::new())],
                vec![CellValue::Null, CellValue::Null, CellValue::Text("West".into())],
            ],
        )
    }

    #[test]
    fn test_shape_preserves_order_and_nulls() {
        let result = QueryResult::from_rowset("EVALUATE Sales".into(), rowset(), 10, false);
        assert_eq!(result.columns, vec!["Sales[Date]", "Sales[Amount]", "Sales[Region]"]);
        assert_eq!(result.row_count, 3);
        assert!(!result.truncated);

        assert_eq!(result.rows[0][0], ResultValue::Text("2024-01-15T00:00:00".into()));
        assert_eq!(result.rows[0][1], ResultValue::Text("1234.5600".into()));
        assert!(result.rows[0][2].is_null());
        assert_eq!(result.rows[1][1], ResultValue::Integer(0));
        assert_eq!(result.rows[1][2], ResultValue::Text(String::new()));
        assert_eq!(result.rows[2][2], ResultValue::Text("West".into()));
    }

    #[test]
    fn test_numeric_coercion() {
        let result = QueryResult::from_rowset("q".into(), rowset(), 10, true);
        assert_eq!(result.rows[0][1], ResultValue::Number(1234.56));
    }

    #[test]
    fn test_truncation() {
        let result = QueryResult::from_rowset("q".into(), rowset(), 2, false);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.row_count, 3);
        assert!(result.truncated);
    }

    #[test]
    fn test_json_shape() {
        let result = QueryResult::from_rowset("q".into(), rowset(), 10, false);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["rowCount"], 3);
        assert!(json["rows"][0][2].is_null());
        assert_eq!(json["rows"][1][1], 0);

        let records = result.records(1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["Sales[Amount]"], "1234.5600");
    }

    #[test]
    fn test_non_finite_double() {
        assert_eq!(
            ResultValue::from_cell(CellValue::Double(f64::NAN), false),
            ResultValue::Text("NaN".into())
        );
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("EVALUATE Sales", 8), "EVALUATE...");
        assert_eq!(truncate_for_log("\u{e9}\u{e9}\u{e9}", 2), "\u{e9}\u{e9}...");
    }
}
