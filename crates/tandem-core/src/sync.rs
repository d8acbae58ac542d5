//! Cross-engine table mirroring.
//!
//! After a cell mutates tables in one engine, the changed tables are pushed
//! into the other engine by full replacement. Mirroring is best-effort: a
//! table that fails to load is logged and skipped, and the remaining tables
//! are still mirrored. Tables dropped in one engine are not dropped in the
//! other.

use crate::model::TableSet;
use crate::output::EngineState;
use crate::runtime::ScriptRuntime;
use crate::store::{ReplaceOutcome, TabularStore};

/// Direction of a mirroring pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToStore,
    ToRuntime,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToStore => write!(f, "script -> sql"),
            Direction::ToRuntime => write!(f, "sql -> script"),
        }
    }
}

/// Per-table results of one mirroring pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub direction: Direction,
    /// Tables replaced, with their row counts.
    pub replaced: Vec<(String, usize)>,
    /// Tables left untouched because no rows were supplied.
    pub skipped: Vec<String>,
    /// Tables that failed to load, with the reason.
    pub failed: Vec<(String, String)>,
}

impl SyncReport {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            replaced: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn record(&mut self, table: String, outcome: ReplaceOutcome) {
        match outcome {
            ReplaceOutcome::Replaced(rows) => self.replaced.push((table, rows)),
            ReplaceOutcome::Skipped => self.skipped.push(table),
            ReplaceOutcome::Failed(reason) => self.failed.push((table, reason)),
        }
    }

    /// Whether every table loaded.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn log(&self) {
        if self.replaced.is_empty() && self.failed.is_empty() {
            return;
        }
        tracing::debug!(
            "Mirrored {} table(s) {} ({} skipped, {} failed)",
            self.replaced.len(),
            self.direction,
            self.skipped.len(),
            self.failed.len()
        );
        for (table, reason) in &self.failed {
            tracing::warn!("Could not mirror table {} ({}): {}", table, self.direction, reason);
        }
    }
}

/// Replace each table of `tables` in the SQL store.
pub fn push_to_store(store: &TabularStore, tables: TableSet) -> SyncReport {
    let mut report = SyncReport::new(Direction::ToStore);
    for (name, rows) in tables {
        let outcome = store.replace_table(&name, &rows);
        report.record(name, outcome);
    }
    report.log();
    report
}

/// Bind each table of `tables` in the script runtime.
///
/// When the runtime is not ready nothing is mirrored; the tables are
/// reported as failed.
pub async fn push_to_runtime(runtime: &ScriptRuntime, tables: TableSet) -> SyncReport {
    let mut report = SyncReport::new(Direction::ToRuntime);
    let status = runtime.status();
    if status.status != EngineState::Ready {
        if !tables.is_empty() {
            tracing::info!(
                "Script runtime is {}; not mirroring {} table(s)",
                status.status,
                tables.len()
            );
        }
        for name in tables.into_keys() {
            report.record(name, ReplaceOutcome::Failed(format!("script runtime is {}", status.status)));
        }
        return report;
    }

    for (name, rows) in tables {
        let outcome = runtime.load_table(&name, &rows).await;
        report.record(name, outcome);
        tokio::task::yield_now().await;
    }
    report.log();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::model::{Value, record};
    use crate::runtime::RuntimeConfig;

    fn tables() -> TableSet {
        let mut set = TableSet::new();
        set.insert(
            "orders".to_string(),
            vec![record([("id", Value::from(1i64)), ("total", Value::from(9.5))])],
        );
        set.insert("empty".to_string(), Vec::new());
        set
    }

    #[test]
    fn test_push_to_store_replaces_and_skips() {
        let store = TabularStore::open_in_memory().unwrap();
        let report = push_to_store(&store, tables());
        assert!(report.is_clean());
        assert_eq!(report.replaced, vec![("orders".to_string(), 1)]);
        assert_eq!(report.skipped, vec!["empty".to_string()]);
        assert_eq!(store.table_names().unwrap(), vec!["orders"]);
    }

    #[tokio::test]
    async fn test_push_to_unready_runtime_reports_failure() {
        let runtime = ScriptRuntime::new(RuntimeConfig::from(&SessionConfig::default()));
        let report = push_to_runtime(&runtime, tables()).await;
        assert_eq!(report.failed.len(), 2);
        assert!(report.replaced.is_empty());
    }

    #[tokio::test]
    async fn test_push_to_runtime_binds_frames() {
        let runtime = ScriptRuntime::new(RuntimeConfig::from(&SessionConfig::default()));
        runtime.bootstrap(&[]).await.unwrap();
        let report = push_to_runtime(&runtime, tables()).await;
        assert!(report.is_clean());
        assert_eq!(report.replaced, vec![("orders".to_string(), 1)]);
        assert_eq!(runtime.introspect().await["orders"], vec!["id", "total"]);
    }
}
