//! Value, rowset and schema types shared by the remote protocol and the cache.

use crate::xmla::endpoint::XmlaEndpoint;
use chrono::{DateTime, FixedOffset, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Serialize;

/// A cell decoded from a remote rowset.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Decimal(Decimal),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Text(String),
}

impl CellValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Text content, with non-text scalars rendered.
    pub fn as_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Text(v) => Some(v.clone()),
            CellValue::Boolean(v) => Some(v.to_string()),
            CellValue::Integer(v) => Some(v.to_string()),
            CellValue::Double(v) => Some(v.to_string()),
            CellValue::Decimal(v) => Some(v.to_string()),
            CellValue::DateTime(v) => Some(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            CellValue::DateTimeOffset(v) => Some(v.to_rfc3339()),
        }
    }

    /// Integer content; text holding an integer is accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Integer(v) => Some(*v),
            CellValue::Decimal(v) => v.trunc().to_string().parse().ok(),
            CellValue::Double(v) if v.fract() == 0.0 => Some(*v as i64),
            CellValue::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean content; DMVs sometimes report flags as text.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CellValue::Boolean(v) => Some(*v),
            CellValue::Integer(v) => Some(*v != 0),
            CellValue::Text(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Column metadata of a rowset.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsetColumn {
    /// Display name, e.g. `Sales[Amount]`.
    pub name: String,
    /// XSD type reported by the server, if any.
    pub data_type: Option<String>,
}

impl RowsetColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: None,
        }
    }
}

/// A tabular result exactly as the remote server returned it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rowset {
    pub columns: Vec<RowsetColumn>,
    pub rows: Vec<Vec<CellValue>>,
}

impl Rowset {
    /// Build a rowset from column names and rows.
    pub fn new(columns: Vec<RowsetColumn>, rows: Vec<Vec<CellValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column, matched case-insensitively and ignoring brackets.
    ///
    /// DMV rowsets name columns `ID`, `Name`, ...; DAX rowsets name them
    /// `Table[Column]` or `[Column]`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        let wanted = name.trim_matches(|c| c == '[' || c == ']');
        self.columns.iter().position(|c| {
            c.name.eq_ignore_ascii_case(wanted)
                || c.name
                    .trim_matches(|c| c == '[' || c == ']')
                    .eq_ignore_ascii_case(wanted)
        })
    }

    /// Cell at `row` in the named column; `None` when either is missing.
    pub fn cell(&self, row: usize, column: &str) -> Option<&CellValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

/// Parameters of a handshake.
#[derive(Clone)]
pub struct ConnectParams {
    pub endpoint: XmlaEndpoint,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub catalog: String,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("endpoint", &self.endpoint.url().as_str())
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("catalog", &self.catalog)
            .finish()
    }
}

/// Whether an entity holds data or only measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Table,
    MeasureContainer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_hint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A model relationship, seen from its many (or from) side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipDescriptor {
    pub from_column: String,
    pub to_entity: String,
    pub to_column: String,
    pub cardinality: String,
    pub cross_filter: String,
    pub active: bool,
}

/// Structure of one entity of the remote model.
///
/// Immutable once cached; names are case-sensitive and unique per catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescriptor {
    pub name: String,
    pub kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub columns: Vec<ColumnDescriptor>,
    pub measures: Vec<MeasureDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count_hint: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<RelationshipDescriptor>,
}

impl EntityDescriptor {
    /// A data table with the given columns and nothing else.
    pub fn table(name: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name: name.into(),
            kind: EntityKind::Table,
            description: None,
            columns,
            measures: Vec::new(),
            row_count_hint: None,
            relationships: Vec::new(),
        }
    }

    /// A measure-only table.
    pub fn measure_container(name: impl Into<String>, measures: Vec<MeasureDescriptor>) -> Self {
        Self {
            name: name.into(),
            kind: EntityKind::MeasureContainer,
            description: None,
            columns: Vec::new(),
            measures,
            row_count_hint: None,
            relationships: Vec::new(),
        }
    }
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_hint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: type_hint.into(),
            description: None,
        }
    }
}

impl MeasureDescriptor {
    pub fn new(name: impl Into<String>, expression: Option<String>) -> Self {
        Self {
            name: name.into(),
            expression,
            description: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_cell_conversions() {
        assert_eq!(CellValue::Text(" 42 ".into()).as_i64(), Some(42));
        assert_eq!(
            CellValue::Decimal(Decimal::from_str("12.00").unwrap()).as_i64(),
            Some(12)
        );
        assert_eq!(CellValue::Text("TRUE".into()).as_bool(), Some(true));
        assert_eq!(CellValue::Integer(0).as_bool(), Some(false));
        assert_eq!(CellValue::Null.as_text(), None);
        assert!(CellValue::Null.is_null());
    }

    #[test]
    fn test_datetime_text_is_iso() {
        let dt = NaiveDateTime::parse_from_str("2024-03-01T08:30:00", "%Y-%m-%dT%H:%M:%S").unwrap();
        assert_eq!(
            CellValue::DateTime(dt).as_text().as_deref(),
            Some("2024-03-01T08:30:00")
        );
    }

    #[test]
    fn test_column_lookup() {
        let rowset = Rowset::new(
            vec![RowsetColumn::new("Sales[Amount]"), RowsetColumn::new("ID")],
            vec![vec![CellValue::Integer(5), CellValue::Integer(7)]],
        );
        assert_eq!(rowset.column_index("id"), Some(1));
        assert_eq!(rowset.column_index("Sales[Amount]"), Some(0));
        assert_eq!(rowset.cell(0, "ID"), Some(&CellValue::Integer(7)));
        assert_eq!(rowset.cell(1, "ID"), None);
        assert_eq!(rowset.cell(0, "Missing"), None);
    }

    #[test]
    fn test_descriptor_serialization() {
        let entity = EntityDescriptor::table("Sales", vec![ColumnDescriptor::new("Date", "DateTime")]);
        let json = serde_json::to_value(&entity).unwrap();
        assert_eq!(json["kind"], "table");
        assert_eq!(json["columns"][0]["typeHint"], "DateTime");
        assert!(json.get("relationships").is_none());
        assert!(json.get("rowCountHint").is_none());
    }
}
