// used when reading cells out of the store
use rusqlite::types::{FromSql, FromSqlResult, ValueRef};

// used for the JSON shape of result rows
use serde::ser::{Serialize, SerializeMap, Serializer};

// used to print out readable forms of a cell
use std::fmt;
use std::sync::Arc;

// ------------- Cells --------------
/// One value of a result row, as stored.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CellValue::Integer(i) => Some(*i as f64),
            CellValue::Real(r) => Some(*r),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(t) => Some(t),
            _ => None,
        }
    }
}

impl FromSql for CellValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => CellValue::Null,
            ValueRef::Integer(i) => CellValue::Integer(i),
            ValueRef::Real(r) => CellValue::Real(r),
            ValueRef::Text(t) => CellValue::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => CellValue::Text(String::from_utf8_lossy(b).into_owned()),
        })
    }
}

/// Exports write nulls as empty strings.
impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => Ok(()),
            CellValue::Integer(i) => write!(f, "{i}"),
            CellValue::Real(r) => write!(f, "{r}"),
            CellValue::Text(t) => f.write_str(t),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CellValue::Null => serializer.serialize_none(),
            CellValue::Integer(i) => serializer.serialize_i64(*i),
            CellValue::Real(r) => serializer.serialize_f64(*r),
            CellValue::Text(t) => serializer.serialize_str(t),
        }
    }
}

// ------------- Rows --------------
/// A flattened source record keyed by field name, columns in catalog order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    columns: Arc<[String]>,
    cells: Vec<CellValue>,
}

impl ResultRow {
    pub fn new(columns: Arc<[String]>, cells: Vec<CellValue>) -> Self {
        Self { columns, cells }
    }
    pub fn get(&self, field: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .position(|c| c == field)
            .map(|i| &self.cells[i])
    }
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
    pub fn cells(&self) -> &[CellValue] {
        &self.cells
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.columns.iter().map(String::as_str).zip(self.cells.iter())
    }
}

impl Serialize for ResultRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (name, cell) in self.iter() {
            map.serialize_entry(name, cell)?;
        }
        map.end()
    }
}
