//! Tabular store: the relational engine side of a session.
//!
//! Wraps one in-memory SQLite connection. Tables are identified by name and
//! replaced wholesale (drop then create). Storage types for mirrored tables
//! are inferred from the first row: numbers become `REAL`, everything else
//! `TEXT`. Scenario tables can instead be created from their declared schema.
//!
//! The store also keeps a fingerprint per table of the contents it last
//! exchanged with the script runtime, so that only tables actually changed by
//! a SQL statement are mirrored back.

use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Batch, Connection, ToSql, params_from_iter};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::model::{Record, Table, TableSet, Value, fingerprint};

/// Rows produced by the last result-returning statement of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
}

/// What a SQL batch did.
#[derive(Debug)]
pub struct QueryOutcome {
    /// Last result set, if any statement returned columns, or the error
    /// that aborted the batch.
    pub result: Result<Option<ResultSet>>,
    /// Whether any statement that ran could have written to the database.
    /// Set even when a later statement failed.
    pub mutated: bool,
}

/// Outcome of replacing one table in either engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Zero rows were supplied; the existing table was left untouched.
    Skipped,
    /// The table now holds this many rows.
    Replaced(usize),
    /// The replacement failed and was logged.
    Failed(String),
}

impl ReplaceOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ReplaceOutcome::Failed(_))
    }
}

struct Inner {
    conn: Connection,
    /// Fingerprint of each table as last exchanged with the other engine.
    synced: FxHashMap<String, u64>,
}

/// In-memory relational store.
pub struct TabularStore {
    inner: Mutex<Inner>,
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) if f.is_finite() => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Float(_) => ToSqlOutput::Owned(SqlValue::Null),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Text(format!("<blob {} bytes>", b.len())),
    }
}

/// Quote an identifier for interpolation into SQL text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn infer_storage_type(value: &Value) -> &'static str {
    if value.is_numeric() { "REAL" } else { "TEXT" }
}

impl TabularStore {
    /// Open an empty in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                synced: FxHashMap::default(),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| Error::Poisoned("tabular store"))
    }

    /// Replace `name` with `rows`, inferring the column list and storage
    /// types from the first row.
    ///
    /// Empty `rows` is a no-op. Failures are logged and reported in the
    /// outcome, never raised.
    pub fn replace_table(&self, name: &str, rows: &[Record]) -> ReplaceOutcome {
        let Some(first) = rows.first() else {
            tracing::debug!("Skipping empty replacement for table {}", name);
            return ReplaceOutcome::Skipped;
        };
        let columns: Vec<(String, &'static str)> = first
            .iter()
            .map(|(k, v)| (k.clone(), infer_storage_type(v)))
            .collect();

        let result = self
            .lock()
            .and_then(|mut inner| inner.write_table(name, &columns, rows));
        match result {
            Ok(count) => {
                tracing::debug!("Replaced table {} ({} rows)", name, count);
                ReplaceOutcome::Replaced(count)
            }
            Err(e) => {
                tracing::warn!("Failed to replace table {} in SQL store: {}", name, e);
                ReplaceOutcome::Failed(e.to_string())
            }
        }
    }

    /// Create a scenario table.
    ///
    /// With `honor_declared_types` the declared schema decides column order
    /// and affinity; otherwise this behaves like [`replace_table`](Self::replace_table).
    /// Unlike `replace_table`, failures are returned to the caller.
    pub fn create_table(&self, table: &Table, honor_declared_types: bool) -> Result<usize> {
        if table.data.is_empty() {
            return Ok(0);
        }
        let columns: Vec<(String, &'static str)> =
            if honor_declared_types && !table.schema.is_empty() {
                table
                    .schema
                    .iter()
                    .map(|c| (c.name.clone(), c.declared_type.sql_affinity()))
                    .collect()
            } else {
                table.data[0]
                    .iter()
                    .map(|(k, v)| (k.clone(), infer_storage_type(v)))
                    .collect()
            };
        let mut inner = self.lock()?;
        inner.write_table(&table.name, &columns, &table.data)
    }

    /// Execute arbitrary SQL text (one or more statements).
    ///
    /// Returns the rows of the last statement that produced a result set.
    /// A failing statement aborts the batch; earlier statements stay applied
    /// and are reflected in [`QueryOutcome::mutated`].
    pub fn query(&self, sql: &str) -> QueryOutcome {
        let mut mutated = false;
        let result = self
            .lock()
            .and_then(|inner| inner.run_batch(sql, &mut mutated));
        QueryOutcome { result, mutated }
    }

    /// Column names of every user table, in catalog order.
    pub fn introspect(&self) -> Result<IndexMap<String, Vec<String>>> {
        let inner = self.lock()?;
        let mut out = IndexMap::new();
        for name in inner.table_names()? {
            let columns = inner.columns(&name)?;
            out.insert(name, columns);
        }
        Ok(out)
    }

    /// Every user table with its full row set.
    pub fn list_all_tables(&self) -> Result<TableSet> {
        let inner = self.lock()?;
        let mut out = TableSet::new();
        for name in inner.table_names()? {
            let (_, rows) = inner.read_table(&name, None)?;
            out.insert(name, rows);
        }
        Ok(out)
    }

    /// Tables whose contents differ from what was last exchanged with the
    /// script runtime, each capped to `cap` rows. Marks them as exchanged.
    pub fn changed_tables(&self, cap: usize) -> Result<TableSet> {
        let mut inner = self.lock()?;
        let mut out = TableSet::new();
        for name in inner.table_names()? {
            let (print, rows) = inner.read_table(&name, Some(cap))?;
            if inner.synced.get(&name) == Some(&print) {
                continue;
            }
            inner.synced.insert(name.clone(), print);
            out.insert(name, rows);
        }
        Ok(out)
    }

    /// Names of every user table.
    pub fn table_names(&self) -> Result<Vec<String>> {
        self.lock()?.table_names()
    }

    /// Number of rows in `name`.
    pub fn row_count(&self, name: &str) -> Result<usize> {
        let inner = self.lock()?;
        let count: i64 = inner.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Drop every user table.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        for name in inner.table_names()? {
            inner
                .conn
                .execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&name)))?;
        }
        inner.synced.clear();
        Ok(())
    }
}

impl Inner {
    fn run_batch(&self, sql: &str, mutated: &mut bool) -> Result<Option<ResultSet>> {
        let mut batch = Batch::new(&self.conn, sql);
        let mut last = None;

        while let Some(mut stmt) = batch.next()? {
            *mutated |= !stmt.readonly();

            if stmt.column_count() == 0 {
                stmt.execute([])?;
                continue;
            }

            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = Vec::new();
            let mut cursor = stmt.query([])?;
            while let Some(row) = cursor.next()? {
                let mut record = Record::with_capacity(columns.len());
                for (idx, column) in columns.iter().enumerate() {
                    record.insert(column.clone(), from_sql(row.get_ref(idx)?));
                }
                rows.push(record);
            }
            last = Some(ResultSet { columns, rows });
        }

        Ok(last)
    }

    fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY rowid",
        )?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for name in names {
            out.push(name?);
        }
        Ok(out)
    }

    fn columns(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let cols = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let mut out = Vec::new();
        for col in cols {
            out.push(col?);
        }
        Ok(out)
    }

    /// Read a table, returning the fingerprint of its full contents and up
    /// to `cap` rows.
    fn read_table(&self, name: &str, cap: Option<usize>) -> Result<(u64, Vec<Record>)> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {}", quote_ident(name)))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut values: Vec<Vec<Value>> = Vec::new();
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let mut out = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                out.push(from_sql(row.get_ref(idx)?));
            }
            values.push(out);
        }

        let print = fingerprint(columns.iter().map(String::as_str), values.iter());
        let limit = cap.unwrap_or(values.len());
        let rows = values
            .into_iter()
            .take(limit)
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect();
        Ok((print, rows))
    }

    /// Drop and recreate `name` with `columns`, then insert `rows` matched to
    /// the columns by key. Runs in one transaction.
    fn write_table(
        &mut self,
        name: &str,
        columns: &[(String, &'static str)],
        rows: &[Record],
    ) -> Result<usize> {
        let table = quote_ident(name);
        let column_sql = columns
            .iter()
            .map(|(col, ty)| format!("{} {}", quote_ident(col), ty))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");

        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({column_sql});"
        ))?;
        {
            let mut insert = tx.prepare(&format!("INSERT INTO {table} VALUES ({placeholders})"))?;
            for row in rows {
                let values = columns
                    .iter()
                    .map(|(col, _)| row.get(col).unwrap_or(&Value::Null));
                insert.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        let (print, _) = self.read_table(name, Some(0))?;
        self.synced.insert(name.to_string(), print);
        Ok(rows.len())
    }
}
