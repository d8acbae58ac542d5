//! Scenario data model shared by both engines.
//!
//! A [`Scenario`] is produced externally and carries one or more [`Table`]s.
//! Rows are [`Record`]s: insertion-ordered maps from column name to [`Value`].

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single cell value as exchanged between engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Replace NaN and infinities with `Null` for transport.
    pub fn normalized(&self) -> Value {
        match self {
            Value::Float(f) if !f.is_finite() => Value::Null,
            other => other.clone(),
        }
    }

    /// Total order used for sorting: nulls first, then booleans, numbers, text.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Integer(_) | Value::Float(_) => 2,
                Value::Text(_) => 3,
            }
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// One row: column name to value, in column order.
pub type Record = IndexMap<String, Value>;

/// Rows keyed by table name, in the order they were collected.
pub type TableSet = IndexMap<String, Vec<Record>>;

/// Column type as declared by the scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredType {
    #[serde(alias = "text")]
    String,
    #[serde(alias = "number", alias = "real", alias = "double")]
    Float,
    #[serde(alias = "int")]
    Integer,
    Date,
    #[serde(alias = "bool")]
    Boolean,
}

impl DeclaredType {
    /// SQLite column affinity used when the declared type is honored.
    pub fn sql_affinity(self) -> &'static str {
        match self {
            DeclaredType::String | DeclaredType::Date => "TEXT",
            DeclaredType::Float => "REAL",
            DeclaredType::Integer | DeclaredType::Boolean => "INTEGER",
        }
    }
}

/// A declared column in a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub declared_type: DeclaredType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_pk: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, declared_type: DeclaredType) -> Self {
        Self {
            name: name.into(),
            declared_type,
            description: None,
            is_pk: false,
        }
    }
}

/// A named table: declared schema plus rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub schema: Vec<ColumnDef>,
    #[serde(default)]
    pub data: Vec<Record>,
}

impl Table {
    pub fn new(name: impl Into<String>, schema: Vec<ColumnDef>, data: Vec<Record>) -> Self {
        Self {
            name: name.into(),
            schema,
            data,
        }
    }

    /// Column names: declared schema order, or the first row's keys when
    /// no schema was declared.
    pub fn column_names(&self) -> Vec<String> {
        if self.schema.is_empty() {
            self.data
                .first()
                .map(|row| row.keys().cloned().collect())
                .unwrap_or_default()
        } else {
            self.schema.iter().map(|c| c.name.clone()).collect()
        }
    }

    /// Row-shape defects: rows whose keys differ from the table's columns.
    pub fn validate(&self) -> Vec<String> {
        let columns = self.column_names();
        let mut defects = Vec::new();
        for (idx, row) in self.data.iter().enumerate() {
            let missing: Vec<&str> = columns
                .iter()
                .filter(|c| !row.contains_key(c.as_str()))
                .map(String::as_str)
                .collect();
            let extra: Vec<&str> = row
                .keys()
                .filter(|k| !columns.contains(k))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                defects.push(format!("row {} is missing {:?}", idx, missing));
            }
            if !extra.is_empty() {
                defects.push(format!("row {} has unexpected {:?}", idx, extra));
            }
        }
        defects
    }
}

/// Scenario content handed to the bootstrapper.
///
/// Accepts the multi-table shape `{id, tables}` as well as the single-table
/// shape `{id, schema, sampleData}`, which loads as a table named `df`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScenarioWire")]
pub struct Scenario {
    pub id: String,
    pub tables: Vec<Table>,
}

/// Name given to the table of a single-table scenario.
pub const DEFAULT_TABLE: &str = "df";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScenarioWire {
    id: String,
    #[serde(default)]
    tables: Option<Vec<Table>>,
    #[serde(default)]
    schema: Option<Vec<ColumnDef>>,
    #[serde(default)]
    sample_data: Option<Vec<Record>>,
}

impl TryFrom<ScenarioWire> for Scenario {
    type Error = Error;

    fn try_from(wire: ScenarioWire) -> Result<Self> {
        let tables = match (wire.tables, wire.sample_data) {
            (Some(tables), _) => tables,
            (None, Some(data)) => vec![Table::new(
                DEFAULT_TABLE,
                wire.schema.unwrap_or_default(),
                data,
            )],
            (None, None) => {
                return Err(Error::MalformedScenario(format!(
                    "scenario {} has neither `tables` nor `sampleData`",
                    wire.id
                )));
            }
        };
        Ok(Scenario {
            id: wire.id,
            tables,
        })
    }
}

impl Scenario {
    pub fn new(id: impl Into<String>, tables: Vec<Table>) -> Self {
        Self {
            id: id.into(),
            tables,
        }
    }

    /// Parse a scenario from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Content fingerprint over column names and row values.
///
/// Used by both adapters to decide whether a table changed since it was
/// last exchanged with the other engine.
pub fn fingerprint<'a, C, R>(columns: C, rows: R) -> u64
where
    C: IntoIterator<Item = &'a str>,
    R: IntoIterator,
    R::Item: IntoIterator<Item = &'a Value>,
{
    let mut hasher = FxHasher::default();
    for column in columns {
        column.hash(&mut hasher);
    }
    let mut count = 0usize;
    for row in rows {
        for value in row {
            value.hash(&mut hasher);
        }
        count += 1;
    }
    count.hash(&mut hasher);
    hasher.finish()
}

/// Build a record from `(column, value)` pairs.
pub fn record<K, V, I>(pairs: I) -> Record
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
