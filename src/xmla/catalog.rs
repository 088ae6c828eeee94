//! Assembly of DMV rowsets into entity descriptors.
//!
//! Nothing here performs I/O: the connection runs the DMV statements and hands
//! the rowsets over, which keeps the filtering rules testable offline.

use crate::constants::{
    DMV_COLUMNS, DMV_MEASURES, DMV_TABLES, EXCLUDED_TABLE_PREFIXES,
};
use crate::xmla::types::{
    CellValue, ColumnDescriptor, EntityDescriptor, EntityKind, MeasureDescriptor,
    RelationshipDescriptor, Rowset,
};
use std::collections::HashMap;

/// Column `Type` value of the internal row-number column.
const ROW_NUMBER_COLUMN_TYPE: i64 = 3;

/// Quote a string as a DMV/DAX literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `EVALUATE TOPN(n, 'Table')` for sampling an entity.
pub fn sample_statement(entity: &str, rows: usize) -> String {
    format!("EVALUATE TOPN({}, {})", rows, quote_literal(entity))
}

/// DMV statement selecting one table by name.
pub fn table_by_name(name: &str) -> String {
    format!("{} WHERE [Name] = {}", DMV_TABLES, quote_literal(name))
}

/// DMV statement selecting the columns of one table.
pub fn columns_of(table_id: i64) -> String {
    format!("{} WHERE [TableID] = {}", DMV_COLUMNS, table_id)
}

/// DMV statement selecting the measures of one table.
pub fn measures_of(table_id: i64) -> String {
    format!("{} WHERE [TableID] = {}", DMV_MEASURES, table_id)
}

/// Whether a table name is internal to the engine.
pub fn is_excluded(name: &str) -> bool {
    EXCLUDED_TABLE_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Name of a tabular data type code.
pub fn type_hint(code: Option<i64>) -> &'static str {
    match code {
        Some(2) => "String",
        Some(6) => "Int64",
        Some(8) => "Double",
        Some(9) => "DateTime",
        Some(10) => "Decimal",
        Some(11) => "Boolean",
        Some(17) => "Binary",
        Some(19) => "Variant",
        _ => "Unknown",
    }
}

pub fn cardinality_label(from: Option<i64>, to: Option<i64>) -> &'static str {
    match (from, to) {
        (Some(2), Some(1)) => "Many-to-One",
        (Some(1), Some(2)) => "One-to-Many",
        (Some(1), Some(1)) => "One-to-One",
        (Some(2), Some(2)) => "Many-to-Many",
        _ => "Unknown",
    }
}

pub fn cross_filter_label(code: Option<i64>) -> &'static str {
    match code {
        Some(1) => "Single",
        Some(2) => "Both",
        Some(3) => "Automatic",
        Some(4) => "None",
        _ => "Unknown",
    }
}

fn text(rowset: &Rowset, row: usize, column: &str) -> Option<String> {
    rowset
        .cell(row, column)
        .and_then(CellValue::as_text)
        .filter(|s| !s.is_empty())
}

fn int(rowset: &Rowset, row: usize, column: &str) -> Option<i64> {
    rowset.cell(row, column).and_then(CellValue::as_i64)
}

fn flag(rowset: &Rowset, row: usize, column: &str) -> bool {
    rowset
        .cell(row, column)
        .and_then(CellValue::as_bool)
        .unwrap_or(false)
}

/// A user-facing table row of `TMSCHEMA_TABLES`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
}

/// Visible tables, in server order.
pub fn visible_tables(tables: &Rowset) -> Vec<TableRow> {
    (0..tables.len())
        .filter_map(|row| {
            let id = int(tables, row, "ID")?;
            let name = text(tables, row, "Name")?;
            if is_excluded(&name) || flag(tables, row, "IsPrivate") {
                return None;
            }
            Some(TableRow {
                id,
                name,
                description: text(tables, row, "Description"),
            })
        })
        .collect()
}

fn column_name(rowset: &Rowset, row: usize) -> Option<String> {
    text(rowset, row, "ExplicitName").or_else(|| text(rowset, row, "InferredName"))
}

/// Visible columns grouped by table id.
fn columns_by_table(columns: &Rowset) -> HashMap<i64, Vec<ColumnDescriptor>> {
    let mut grouped: HashMap<i64, Vec<ColumnDescriptor>> = HashMap::new();
    for row in 0..columns.len() {
        if flag(columns, row, "IsHidden")
            || int(columns, row, "Type") == Some(ROW_NUMBER_COLUMN_TYPE)
        {
            continue;
        }
        let (Some(table_id), Some(name)) = (int(columns, row, "TableID"), column_name(columns, row))
        else {
            continue;
        };
        let mut column = ColumnDescriptor::new(name, type_hint(int(columns, row, "ExplicitDataType")));
        column.description = text(columns, row, "Description");
        grouped.entry(table_id).or_default().push(column);
    }
    grouped
}

fn measures_by_table(measures: &Rowset) -> HashMap<i64, Vec<MeasureDescriptor>> {
    let mut grouped: HashMap<i64, Vec<MeasureDescriptor>> = HashMap::new();
    for row in 0..measures.len() {
        let (Some(table_id), Some(name)) = (int(measures, row, "TableID"), text(measures, row, "Name"))
        else {
            continue;
        };
        let mut measure = MeasureDescriptor::new(name, text(measures, row, "Expression"));
        measure.description = text(measures, row, "Description");
        grouped.entry(table_id).or_default().push(measure);
    }
    grouped
}

fn build_entity(
    table: &TableRow,
    columns: Vec<ColumnDescriptor>,
    measures: Vec<MeasureDescriptor>,
) -> EntityDescriptor {
    let mut entity = if columns.is_empty() && !measures.is_empty() {
        EntityDescriptor::measure_container(table.name.clone(), measures)
    } else {
        let mut entity = EntityDescriptor::table(table.name.clone(), columns);
        entity.measures = measures;
        entity
    };
    entity.description = table.description.clone();
    entity
}

/// Build descriptors for every visible table.
pub fn assemble_entities(tables: &Rowset, columns: &Rowset, measures: &Rowset) -> Vec<EntityDescriptor> {
    let mut columns = columns_by_table(columns);
    let mut measures = measures_by_table(measures);

    visible_tables(tables)
        .iter()
        .map(|table| {
            build_entity(
                table,
                columns.remove(&table.id).unwrap_or_default(),
                measures.remove(&table.id).unwrap_or_default(),
            )
        })
        .collect()
}

/// Build the descriptor of a single table from rowsets already filtered to it.
pub fn assemble_entity(table: &TableRow, columns: &Rowset, measures: &Rowset) -> EntityDescriptor {
    build_entity(
        table,
        columns_by_table(columns).remove(&table.id).unwrap_or_default(),
        measures_by_table(measures).remove(&table.id).unwrap_or_default(),
    )
}

/// Attach storage row counts; the largest count per dimension wins.
pub fn apply_row_counts(entities: &mut [EntityDescriptor], storage: &Rowset) {
    let mut counts: HashMap<String, u64> = HashMap::new();
    for row in 0..storage.len() {
        let (Some(name), Some(count)) = (
            text(storage, row, "DIMENSION_NAME"),
            int(storage, row, "ROWS_COUNT").and_then(|c| u64::try_from(c).ok()),
        ) else {
            continue;
        };
        let slot = counts.entry(name).or_insert(0);
        *slot = (*slot).max(count);
    }

    for entity in entities.iter_mut().filter(|e| e.kind == EntityKind::Table) {
        if let Some(count) = counts.get(&entity.name) {
            entity.row_count_hint = Some(*count);
        }
    }
}

/// Attach relationships to the entities on their from side.
///
/// `tables` and `column_ids` are the unfiltered id listings; relationships
/// whose endpoints cannot be resolved are dropped.
pub fn apply_relationships(
    entities: &mut [EntityDescriptor],
    tables: &Rowset,
    column_ids: &Rowset,
    relationships: &Rowset,
) {
    let table_names: HashMap<i64, String> = (0..tables.len())
        .filter_map(|row| Some((int(tables, row, "ID")?, text(tables, row, "Name")?)))
        .collect();
    let column_names: HashMap<i64, String> = (0..column_ids.len())
        .filter_map(|row| Some((int(column_ids, row, "ID")?, column_name(column_ids, row)?)))
        .collect();

    let mut by_entity: HashMap<String, Vec<RelationshipDescriptor>> = HashMap::new();
    for row in 0..relationships.len() {
        let resolve = |table_col: &str, column_col: &str| {
            let table = table_names.get(&int(relationships, row, table_col)?)?;
            let column = column_names.get(&int(relationships, row, column_col)?)?;
            Some((table.clone(), column.clone()))
        };
        let (Some((from_table, from_column)), Some((to_entity, to_column))) = (
            resolve("FromTableID", "FromColumnID"),
            resolve("ToTableID", "ToColumnID"),
        ) else {
            continue;
        };

        by_entity.entry(from_table).or_default().push(RelationshipDescriptor {
            from_column,
            to_entity,
            to_column,
            cardinality: cardinality_label(
                int(relationships, row, "FromCardinality"),
                int(relationships, row, "ToCardinality"),
            )
            .to_string(),
            cross_filter: cross_filter_label(int(relationships, row, "CrossFilteringBehavior"))
                .to_string(),
            active: relationships
                .cell(row, "IsActive")
                .and_then(CellValue::as_bool)
                .unwrap_or(true),
        });
    }

    for entity in entities.iter_mut() {
        if let Some(relationships) = by_entity.remove(&entity.name) {
            entity.relationships = relationships;
        }
    }
}
