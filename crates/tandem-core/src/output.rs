//! Output envelopes handed to the notebook UI.
//!
//! Everything here serializes to the JSON shapes the frontend consumes:
//!
//! ```text
//! ExecutionResult  { type: "table"|"text"|"chart"|"error", data: ..., logs?: string }
//!                  tables add { columns: [..], totalRows: n }; data is the row array
//! SymbolInfo       { dataframes: {name: [columns]} } | { tables: {name: [columns]} }
//! EngineStatus     { status: "idle"|"loading"|"ready"|"error", error?: string }
//! ```

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::model::Record;

/// Target engine of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Sql,
    #[serde(alias = "interpreted", alias = "rhai")]
    Script,
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sql" => Ok(Language::Sql),
            "script" | "rhai" | "interpreted" => Ok(Language::Script),
            other => Err(format!("unknown language: {}", other)),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Sql => write!(f, "sql"),
            Language::Script => write!(f, "script"),
        }
    }
}

/// Plot styling hint. Has no effect on data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl std::str::FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            other => Err(format!("unknown theme: {}", other)),
        }
    }
}

/// A capped preview of a tabular result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePreview {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
    /// Row count before the preview cap was applied.
    pub total_rows: usize,
}

impl TablePreview {
    pub fn new(columns: Vec<String>, rows: Vec<Record>) -> Self {
        let total_rows = rows.len();
        Self {
            columns,
            rows,
            total_rows,
        }
    }

    /// Keep at most `cap` rows. `total_rows` is preserved.
    pub fn truncated(mut self, cap: usize) -> Self {
        self.rows.truncate(cap);
        self
    }

    pub fn is_truncated(&self) -> bool {
        self.rows.len() < self.total_rows
    }
}

/// Result payload of one execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Table(TablePreview),
    Text(String),
    /// `data:image/png;base64,...` URI.
    Chart(String),
    Error(String),
}

/// Uniform envelope returned by [`Dispatcher::run`](crate::Dispatcher::run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Envelope", try_from = "Envelope")]
pub struct ExecutionResult {
    pub output: Output,
    /// Text printed by the cell.
    pub logs: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Kind {
    Table,
    Text,
    Chart,
    Error,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Payload {
    Rows(Vec<Record>),
    Text(String),
}

/// Wire form of [`ExecutionResult`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type")]
    kind: Kind,
    data: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    columns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    logs: Option<String>,
}

impl From<ExecutionResult> for Envelope {
    fn from(result: ExecutionResult) -> Self {
        let (kind, data, columns, total_rows) = match result.output {
            Output::Table(preview) => (
                Kind::Table,
                Payload::Rows(preview.rows),
                Some(preview.columns),
                Some(preview.total_rows),
            ),
            Output::Text(text) => (Kind::Text, Payload::Text(text), None, None),
            Output::Chart(uri) => (Kind::Chart, Payload::Text(uri), None, None),
            Output::Error(message) => (Kind::Error, Payload::Text(message), None, None),
        };
        Self {
            kind,
            data,
            columns,
            total_rows,
            logs: result.logs,
        }
    }
}

impl TryFrom<Envelope> for ExecutionResult {
    type Error = String;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let output = match (envelope.kind, envelope.data) {
            (Kind::Table, Payload::Rows(rows)) => {
                let columns = envelope
                    .columns
                    .or_else(|| rows.first().map(|r| r.keys().cloned().collect()))
                    .unwrap_or_default();
                let total_rows = envelope.total_rows.unwrap_or(rows.len());
                Output::Table(TablePreview {
                    columns,
                    rows,
                    total_rows,
                })
            }
            (Kind::Text, Payload::Text(text)) => Output::Text(text),
            (Kind::Chart, Payload::Text(uri)) => Output::Chart(uri),
            (Kind::Error, Payload::Text(message)) => Output::Error(message),
            (kind, _) => return Err(format!("unexpected data for {:?} result", kind)),
        };
        Ok(Self {
            output,
            logs: envelope.logs,
        })
    }
}

/// Message shown for a successful execution that produced no value.
pub const NO_VALUE_MESSAGE: &str = "Code executed successfully.";

/// Message shown for a SQL batch that produced no result set.
pub const NO_ROWS_MESSAGE: &str = "Query executed successfully. No rows returned.";

impl ExecutionResult {
    pub fn new(output: Output) -> Self {
        Self { output, logs: None }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Output::Text(text.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Output::Error(message.into()))
    }

    pub fn with_logs(mut self, logs: Option<String>) -> Self {
        self.logs = logs.filter(|l| !l.is_empty());
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.output, Output::Error(_))
    }

    pub fn kind(&self) -> &'static str {
        match self.output {
            Output::Table(_) => "table",
            Output::Text(_) => "text",
            Output::Chart(_) => "chart",
            Output::Error(_) => "error",
        }
    }
}

/// Column listing per table, for editor autocompletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SymbolInfo {
    Script {
        dataframes: IndexMap<String, Vec<String>>,
    },
    Sql {
        tables: IndexMap<String, Vec<String>>,
    },
}

impl SymbolInfo {
    pub fn empty(language: Language) -> Self {
        match language {
            Language::Sql => SymbolInfo::Sql {
                tables: IndexMap::new(),
            },
            Language::Script => SymbolInfo::Script {
                dataframes: IndexMap::new(),
            },
        }
    }

    pub fn entries(&self) -> &IndexMap<String, Vec<String>> {
        match self {
            SymbolInfo::Script { dataframes } => dataframes,
            SymbolInfo::Sql { tables } => tables,
        }
    }
}

/// Lifecycle state of the script runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    #[default]
    Idle,
    Loading,
    Ready,
    Error,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Loading => "loading",
            EngineState::Ready => "ready",
            EngineState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Observable script runtime status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    pub status: EngineState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineStatus {
    pub fn new(status: EngineState) -> Self {
        Self {
            status,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: EngineState::Error,
            error: Some(message.into()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == EngineState::Ready
    }
}
