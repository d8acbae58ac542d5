//! `DataFrame`: the script runtime's native tabular type.
//!
//! Column-named rows of [`Value`]s. The operations here are plain Rust so
//! they can be tested without an engine; [`register`] binds them into a
//! rhai [`Engine`] as the runtime's data-manipulation library.

use std::fmt;

use rhai::{Array, Dynamic, Engine, EvalAltResult, FnPtr, INT, Map, NativeCallContext, Position};

use crate::model::{Record, Value, fingerprint};

/// Rows shown by `to_string` before eliding the rest.
const DISPLAY_ROWS: usize = 10;

/// In-memory table bound to a script variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

pub(crate) type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

pub(crate) fn script_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.into()),
        Position::NONE,
    ))
}

impl Frame {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Build a frame from records. Columns come from the first record; later
    /// records are matched by key, missing keys become null.
    pub fn from_records(records: &[Record]) -> Self {
        let columns: Vec<String> = records
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        let rows = records
            .iter()
            .map(|r| {
                columns
                    .iter()
                    .map(|c| r.get(c).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }

    /// Up to `cap` rows as records, with non-finite floats normalized to null.
    pub fn to_records(&self, cap: usize) -> Vec<Record> {
        self.rows
            .iter()
            .take(cap)
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(Value::normalized))
                    .collect()
            })
            .collect()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn fingerprint(&self) -> u64 {
        fingerprint(self.columns.iter().map(String::as_str), self.rows.iter())
    }

    fn column_index(&self, name: &str) -> ScriptResult<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| script_error(format!("DataFrame has no column '{}'", name)))
    }

    pub fn head(&self, n: usize) -> Frame {
        Frame::new(self.columns.clone(), self.rows.iter().take(n).cloned().collect())
    }

    pub fn tail(&self, n: usize) -> Frame {
        let skip = self.rows.len().saturating_sub(n);
        Frame::new(self.columns.clone(), self.rows[skip..].to_vec())
    }

    pub fn select(&self, names: &[String]) -> ScriptResult<Frame> {
        let idx = names
            .iter()
            .map(|n| self.column_index(n))
            .collect::<ScriptResult<Vec<_>>>()?;
        let rows = self
            .rows
            .iter()
            .map(|row| idx.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Frame::new(names.to_vec(), rows))
    }

    pub fn drop_column(&self, name: &str) -> ScriptResult<Frame> {
        let idx = self.column_index(name)?;
        let mut out = self.clone();
        out.columns.remove(idx);
        for row in &mut out.rows {
            row.remove(idx);
        }
        Ok(out)
    }

    pub fn rename(&self, from: &str, to: &str) -> ScriptResult<Frame> {
        let idx = self.column_index(from)?;
        let mut out = self.clone();
        out.columns[idx] = to.to_string();
        Ok(out)
    }

    pub fn sort_by(&self, column: &str, ascending: bool) -> ScriptResult<Frame> {
        let idx = self.column_index(column)?;
        let mut rows = self.rows.clone();
        rows.sort_by(|a, b| {
            let ord = a[idx].sort_cmp(&b[idx]);
            if ascending { ord } else { ord.reverse() }
        });
        Ok(Frame::new(self.columns.clone(), rows))
    }

    pub fn column(&self, name: &str) -> ScriptResult<Vec<Value>> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    /// Append a row given as column → value pairs. Unknown keys add columns.
    pub fn push_record(&mut self, record: Record) {
        for key in record.keys() {
            if !self.columns.contains(key) {
                self.columns.push(key.clone());
                for row in &mut self.rows {
                    row.push(Value::Null);
                }
            }
        }
        let row = self
            .columns
            .iter()
            .map(|c| record.get(c).cloned().unwrap_or_default())
            .collect();
        self.rows.push(row);
    }

    /// Numeric values of `column`, and whether every non-null value is an integer.
    fn numbers(&self, column: &str) -> ScriptResult<(Vec<f64>, bool)> {
        let values = self.column(column)?;
        let integral = values.iter().all(is_integral);
        Ok((values.iter().filter_map(Value::as_f64).collect(), integral))
    }

    /// Aggregate numeric values of `column`: sum, mean, min, max or count.
    pub fn aggregate(&self, column: &str, op: &str) -> ScriptResult<Value> {
        let (values, integral) = self.numbers(column)?;
        aggregate(&values, op, integral)
    }

    /// Group rows by `key` and aggregate `value` per group, in first-seen order.
    pub fn group_by(&self, key: &str, value: &str, op: &str) -> ScriptResult<Frame> {
        let key_idx = self.column_index(key)?;
        let value_idx = self.column_index(value)?;
        let integral = self.rows.iter().all(|row| is_integral(&row[value_idx]));
        let mut groups: indexmap::IndexMap<String, (Value, Vec<f64>)> = indexmap::IndexMap::new();
        for row in &self.rows {
            let entry = groups
                .entry(row[key_idx].to_string())
                .or_insert_with(|| (row[key_idx].clone(), Vec::new()));
            if let Some(v) = row[value_idx].as_f64() {
                entry.1.push(v);
            } else if op == "count" && !row[value_idx].is_null() {
                entry.1.push(0.0);
            }
        }
        let mut rows = Vec::with_capacity(groups.len());
        for (_, (key_value, values)) in groups {
            rows.push(vec![key_value, aggregate(&values, op, integral)?]);
        }
        Ok(Frame::new(vec![key.to_string(), value.to_string()], rows))
    }

    /// Count occurrences of each distinct value in `column`, most frequent first.
    pub fn value_counts(&self, column: &str) -> ScriptResult<Frame> {
        let idx = self.column_index(column)?;
        let mut counts: indexmap::IndexMap<String, (Value, i64)> = indexmap::IndexMap::new();
        for row in &self.rows {
            counts
                .entry(row[idx].to_string())
                .or_insert_with(|| (row[idx].clone(), 0))
                .1 += 1;
        }
        let mut rows: Vec<Vec<Value>> = counts
            .into_values()
            .map(|(v, n)| vec![v, Value::Integer(n)])
            .collect();
        rows.sort_by(|a, b| b[1].sort_cmp(&a[1]));
        Ok(Frame::new(vec![column.to_string(), "count".to_string()], rows))
    }

    fn row_map(&self, idx: usize) -> Map {
        self.columns
            .iter()
            .zip(&self.rows[idx])
            .map(|(c, v)| (c.as_str().into(), to_dynamic(v)))
            .collect()
    }
}

fn is_integral(value: &Value) -> bool {
    matches!(value, Value::Integer(_) | Value::Null)
}

/// `integral` keeps sum, min and max of integer columns integer.
fn aggregate(values: &[f64], op: &str, integral: bool) -> ScriptResult<Value> {
    let out = match op {
        "count" => Value::Integer(values.len() as i64),
        "sum" => Value::Float(values.iter().sum()),
        "mean" if values.is_empty() => Value::Null,
        "mean" => Value::Float(values.iter().sum::<f64>() / values.len() as f64),
        "min" => values
            .iter()
            .copied()
            .reduce(f64::min)
            .map(Value::Float)
            .unwrap_or_default(),
        "max" => values
            .iter()
            .copied()
            .reduce(f64::max)
            .map(Value::Float)
            .unwrap_or_default(),
        other => {
            return Err(script_error(format!(
                "unknown aggregation '{}' (expected sum, mean, count, min or max)",
                other
            )));
        }
    };
    Ok(match out {
        Value::Float(f) if integral && op != "mean" => Value::Integer(f as i64),
        other => other,
    })
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: Vec<Vec<String>> = self
            .rows
            .iter()
            .take(DISPLAY_ROWS)
            .map(|row| row.iter().map(Value::to_string).collect())
            .collect();
        let widths: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                shown
                    .iter()
                    .map(|r| r[i].len())
                    .chain(std::iter::once(c.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let line = |cells: &[String]| -> String {
            cells
                .iter()
                .zip(&widths)
                .map(|(c, w)| format!("{:<width$}", c, width = w))
                .collect::<Vec<_>>()
                .join(" | ")
        };
        writeln!(f, "{}", line(&self.columns))?;
        writeln!(
            f,
            "{}",
            widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-")
        )?;
        for row in &shown {
            writeln!(f, "{}", line(row))?;
        }
        if self.rows.len() > DISPLAY_ROWS {
            writeln!(f, "... {} more rows", self.rows.len() - DISPLAY_ROWS)?;
        }
        write!(f, "[{} rows x {} columns]", self.rows.len(), self.columns.len())
    }
}

pub(crate) fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Integer(i) => Dynamic::from_int(*i),
        Value::Float(f) => Dynamic::from_float(*f),
        Value::Text(s) => Dynamic::from(s.clone()),
    }
}

pub(crate) fn from_dynamic(value: &Dynamic) -> Value {
    if value.is_unit() {
        Value::Null
    } else if let Ok(b) = value.as_bool() {
        Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        Value::Integer(i)
    } else if let Ok(f) = value.as_float() {
        Value::Float(f)
    } else {
        Value::Text(value.to_string())
    }
}

fn record_from_map(map: &Map) -> Record {
    map.iter()
        .map(|(k, v)| (k.to_string(), from_dynamic(v)))
        .collect()
}

fn frame_from_array(rows: Array) -> ScriptResult<Frame> {
    let mut frame = Frame::default();
    for (i, row) in rows.into_iter().enumerate() {
        let map = row
            .try_cast::<Map>()
            .ok_or_else(|| script_error(format!("frame(): row {} is not an object map", i)))?;
        frame.push_record(record_from_map(&map));
    }
    Ok(frame)
}

fn to_count(n: INT) -> usize {
    usize::try_from(n).unwrap_or(0)
}

/// Register the `DataFrame` type and its operations.
pub fn register(engine: &mut Engine) {
    engine.register_type_with_name::<Frame>("DataFrame");

    engine.register_fn("frame", Frame::default);
    engine.register_fn("frame", frame_from_array);

    engine.register_get("columns", |df: &mut Frame| -> Array {
        df.columns.iter().map(|c| Dynamic::from(c.clone())).collect()
    });
    engine.register_fn("len", |df: &mut Frame| df.len() as INT);
    engine.register_fn("is_empty", |df: &mut Frame| df.is_empty());
    engine.register_fn("head", |df: &mut Frame, n: INT| df.head(to_count(n)));
    engine.register_fn("tail", |df: &mut Frame, n: INT| df.tail(to_count(n)));
    engine.register_fn("select", |df: &mut Frame, names: Array| -> ScriptResult<Frame> {
        let names: Vec<String> = names.iter().map(|d| d.to_string()).collect();
        df.select(&names)
    });
    engine.register_fn("drop", |df: &mut Frame, name: &str| df.drop_column(name));
    engine.register_fn("rename", |df: &mut Frame, from: &str, to: &str| df.rename(from, to));
    engine.register_fn("sort_by", |df: &mut Frame, col: &str| df.sort_by(col, true));
    engine.register_fn("sort_by", |df: &mut Frame, col: &str, asc: bool| {
        df.sort_by(col, asc)
    });
    engine.register_fn("col", |df: &mut Frame, name: &str| -> ScriptResult<Array> {
        Ok(df.column(name)?.iter().map(to_dynamic).collect())
    });
    engine.register_fn("rows", |df: &mut Frame| -> Array {
        (0..df.len()).map(|i| Dynamic::from_map(df.row_map(i))).collect()
    });
    engine.register_fn("push", |df: &mut Frame, row: Map| {
        df.push_record(record_from_map(&row))
    });
    for op in ["sum", "mean", "min", "max"] {
        engine.register_fn(op, move |df: &mut Frame, col: &str| -> ScriptResult<Dynamic> {
            Ok(to_dynamic(&df.aggregate(col, op)?))
        });
    }
    engine.register_fn("group_by", |df: &mut Frame, key: &str, value: &str, op: &str| {
        df.group_by(key, value, op)
    });
    engine.register_fn("value_counts", |df: &mut Frame, col: &str| df.value_counts(col));

    engine.register_fn(
        "filter",
        |ctx: NativeCallContext, df: &mut Frame, predicate: FnPtr| -> ScriptResult<Frame> {
            let mut rows = Vec::new();
            for i in 0..df.len() {
                if predicate.call_within_context::<bool>(&ctx, (df.row_map(i),))? {
                    rows.push(df.rows[i].clone());
                }
            }
            Ok(Frame::new(df.columns.clone(), rows))
        },
    );
    engine.register_fn(
        "with_column",
        |ctx: NativeCallContext, df: &mut Frame, name: &str, f: FnPtr| -> ScriptResult<Frame> {
            let mut values = Vec::with_capacity(df.len());
            for i in 0..df.len() {
                let v = f.call_within_context::<Dynamic>(&ctx, (df.row_map(i),))?;
                values.push(from_dynamic(&v));
            }
            let mut out = df.clone();
            let idx = match out.columns.iter().position(|c| c == name) {
                Some(idx) => idx,
                None => {
                    out.columns.push(name.to_string());
                    for row in &mut out.rows {
                        row.push(Value::Null);
                    }
                    out.columns.len() - 1
                }
            };
            for (row, value) in out.rows.iter_mut().zip(values) {
                row[idx] = value;
            }
            Ok(out)
        },
    );

    engine.register_indexer_get(|df: &mut Frame, idx: INT| -> ScriptResult<Map> {
        let len = df.len();
        let i = if idx < 0 { len as INT + idx } else { idx };
        if i < 0 || i as usize >= len {
            return Err(script_error(format!(
                "row index {} out of bounds for DataFrame with {} rows",
                idx, len
            )));
        }
        Ok(df.row_map(i as usize))
    });

    engine.register_fn("to_string", |df: &mut Frame| df.to_string());
    engine.register_fn("to_debug", |df: &mut Frame| df.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record;

    fn sample() -> Frame {
        Frame::from_records(&[
            record([("region", Value::from("north")), ("units", Value::from(3i64))]),
            record([("region", Value::from("south")), ("units", Value::from(5i64))]),
            record([("region", Value::from("north")), ("units", Value::from(4i64))]),
        ])
    }

    #[test]
    fn test_from_and_to_records() {
        let frame = sample();
        assert_eq!(frame.columns(), &["region".to_string(), "units".to_string()]);
        let records = frame.to_records(2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["units"], Value::Integer(5));
    }

    #[test]
    fn test_non_finite_normalized_for_transport() {
        let frame = Frame::new(vec!["x".into()], vec![vec![Value::Float(f64::NAN)]]);
        assert_eq!(frame.to_records(10)[0]["x"], Value::Null);
    }

    #[test]
    fn test_group_by_and_value_counts() {
        let frame = sample();
        let grouped = frame.group_by("region", "units", "sum").unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped.rows[0], vec![Value::from("north"), Value::Integer(7)]);

        let counts = frame.value_counts("region").unwrap();
        assert_eq!(counts.rows[0], vec![Value::from("north"), Value::Integer(2)]);
    }

    #[test]
    fn test_unknown_column_is_an_error() {
        let err = sample().select(&["nope".to_string()]).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_push_record_adds_columns() {
        let mut frame = sample();
        frame.push_record(record([("region", Value::from("west")), ("note", Value::from("new"))]));
        assert_eq!(frame.columns().len(), 3);
        assert_eq!(frame.rows[0][2], Value::Null);
        assert_eq!(frame.rows[3][1], Value::Null);
    }

    #[test]
    fn test_fingerprint_changes_on_mutation() {
        let frame = sample();
        let sorted = frame.sort_by("units", false).unwrap();
        assert_ne!(frame.fingerprint(), sorted.fingerprint());
        assert_eq!(sorted.rows[0][1], Value::Integer(5));
    }

    #[test]
    fn test_display_elides_rows() {
        let rows = (0..12).map(|i| vec![Value::Integer(i)]).collect();
        let text = Frame::new(vec!["i".into()], rows).to_string();
        assert!(text.contains("... 2 more rows"));
        assert!(text.ends_with("[12 rows x 1 columns]"));
    }

    #[test]
    fn test_registered_library_in_engine() {
        let mut engine = Engine::new();
        register(&mut engine);
        let mut scope = rhai::Scope::new();
        scope.push("df", sample());

        let total: Dynamic = engine
            .eval_with_scope(&mut scope, r#"df.filter(|r| r.region == "north").sum("units")"#)
            .unwrap();
        assert_eq!(total.as_int().unwrap(), 7);

        let len: INT = engine
            .eval_with_scope(&mut scope, r#"let t = df.with_column("double", |r| r.units * 2); t[0].double"#)
            .unwrap();
        assert_eq!(len, 6);

        engine
            .run_with_scope(&mut scope, "df.push(#{ region: \"east\", units: 1 });")
            .unwrap();
        let df = scope.get_value::<Frame>("df").unwrap();
        assert_eq!(df.len(), 4);
    }
}
