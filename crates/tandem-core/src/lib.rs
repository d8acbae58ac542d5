//! Core engine for the Tandem dual-engine notebook.
//!
//! A session hosts two engines over the same scenario data:
//! - an in-memory SQL store (SQLite)
//! - an embedded script runtime (rhai) with a `DataFrame` type and a
//!   `plt` plotting module
//!
//! Tables changed by a cell in one engine are mirrored into the other
//! before the cell's result is returned.

pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod output;
pub mod runtime;
pub mod session;
pub mod store;
pub mod sync;

pub use bootstrap::{BootPhase, EngineBootstrapper, LoadOutcome};
pub use config::SessionConfig;
pub use dispatch::Dispatcher;
pub use error::{Error, Result};
pub use model::{ColumnDef, DeclaredType, Record, Scenario, Table, TableSet, Value};
pub use output::{
    EngineState, EngineStatus, ExecutionResult, Language, Output, SymbolInfo, TablePreview, Theme,
};
pub use runtime::{ScriptOutcome, ScriptRuntime, ScriptValue};
pub use session::Session;
pub use store::{ReplaceOutcome, TabularStore};
pub use sync::SyncReport;
