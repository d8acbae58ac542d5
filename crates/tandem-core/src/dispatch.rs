//! Execution dispatch: one entry point for running a cell in either engine.
//!
//! Every call returns an [`ExecutionResult`]; failures are reported as
//! [`Output::Error`] rather than raised. The tables a cell changed are
//! mirrored into the other engine before the result is returned, so the next
//! cell observes them regardless of language. SQL changes made while the
//! script runtime was not ready are mirrored before the next script cell.

use std::sync::Arc;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::output::{
    ExecutionResult, Language, NO_ROWS_MESSAGE, NO_VALUE_MESSAGE, Output, SymbolInfo,
    TablePreview, Theme,
};
use crate::runtime::{ScriptRuntime, ScriptValue};
use crate::store::TabularStore;
use crate::sync;

/// Routes cells to the engine for their language.
pub struct Dispatcher {
    store: Arc<TabularStore>,
    runtime: Arc<ScriptRuntime>,
    config: SessionConfig,
    /// Serializes executions across both engines.
    turn: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    pub fn new(store: Arc<TabularStore>, runtime: Arc<ScriptRuntime>, config: SessionConfig) -> Self {
        Self {
            store,
            runtime,
            config,
            turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Run `code` in the engine for `language`.
    ///
    /// A call made while another is running waits for it to finish.
    pub async fn run(&self, language: Language, code: &str, theme: Theme) -> ExecutionResult {
        let _turn = self.turn.lock().await;
        tracing::debug!("Running {} cell ({} bytes)", language, code.len());

        let result = match language {
            Language::Sql => self.run_sql(code).await,
            Language::Script => self.run_script(code, theme).await,
        };
        result.unwrap_or_else(|e| {
            tracing::debug!("{} cell failed: {}", language, e);
            ExecutionResult::error(e.to_string())
        })
    }

    async fn run_sql(&self, code: &str) -> Result<ExecutionResult> {
        let outcome = self.store.query(code);
        // statements before a failing one stay applied and are mirrored too
        if outcome.mutated {
            self.mirror_store_changes().await;
        }

        let output = match outcome.result? {
            Some(set) if !set.rows.is_empty() => Output::Table(
                TablePreview::new(set.columns, set.rows).truncated(self.config.preview_rows),
            ),
            _ => Output::Text(NO_ROWS_MESSAGE.to_string()),
        };
        Ok(ExecutionResult::new(output))
    }

    /// Push SQL tables changed since the last exchange into the runtime.
    ///
    /// While the runtime is not ready the changes stay unmarked, so they are
    /// picked up by the first call once it is.
    async fn mirror_store_changes(&self) {
        if !self.runtime.status().is_ready() {
            return;
        }
        match self.store.changed_tables(self.config.sync_row_cap) {
            Ok(changed) if changed.is_empty() => {}
            Ok(changed) => {
                sync::push_to_runtime(&self.runtime, changed).await;
            }
            Err(e) => tracing::warn!("Could not read changed SQL tables: {}", e),
        }
    }

    async fn run_script(&self, code: &str, theme: Theme) -> Result<ExecutionResult> {
        self.runtime.await_ready(self.config.runtime_ready_wait).await?;
        // SQL writes made before the runtime was ready
        self.mirror_store_changes().await;

        let outcome = self
            .runtime
            .execute(code, theme, self.config.sync_row_cap)
            .await?;

        if self.runtime.status().is_ready() {
            sync::push_to_store(&self.store, outcome.changed);
        } else {
            // a scenario load started while the cell ran; its frames are stale
            tracing::debug!("Not mirroring {} frames from a reloading runtime", outcome.changed.len());
        }

        let output = match outcome.value {
            ScriptValue::Tabular(preview) => {
                Output::Table(preview.truncated(self.config.preview_rows))
            }
            ScriptValue::Image(uri) => Output::Chart(uri),
            ScriptValue::Scalar(text) => Output::Text(text),
            ScriptValue::Void => Output::Text(NO_VALUE_MESSAGE.to_string()),
        };
        Ok(ExecutionResult::new(output).with_logs(outcome.logs))
    }

    /// Column listing of every table visible to `language`.
    ///
    /// Returns an empty listing when the engine cannot be introspected.
    pub async fn symbols(&self, language: Language) -> SymbolInfo {
        match language {
            Language::Sql => match self.store.introspect() {
                Ok(tables) => SymbolInfo::Sql { tables },
                Err(e) => {
                    tracing::warn!("SQL introspection failed: {}", e);
                    SymbolInfo::empty(language)
                }
            },
            Language::Script => {
                let _turn = self.turn.lock().await;
                self.mirror_store_changes().await;
                SymbolInfo::Script {
                    dataframes: self.runtime.introspect().await,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{Table, Value, record};
    use crate::output::EngineState;
    use crate::runtime::RuntimeConfig;

    async fn ready_dispatcher(config: SessionConfig) -> Dispatcher {
        let store = Arc::new(TabularStore::open_in_memory().unwrap());
        let runtime = Arc::new(ScriptRuntime::new(RuntimeConfig::from(&config)));
        let seed = Table::new(
            "items",
            Vec::new(),
            (1..=5)
                .map(|i| record([("id", Value::from(i as i64)), ("price", Value::from(i as f64 * 2.5))]))
                .collect(),
        );
        store.create_table(&seed, true).unwrap();
        runtime.bootstrap(&[seed]).await.unwrap();
        Dispatcher::new(store, runtime, config)
    }

    #[tokio::test]
    async fn test_sql_select_is_table() {
        let dispatcher = ready_dispatcher(SessionConfig::default()).await;
        let result = dispatcher
            .run(Language::Sql, "SELECT id FROM items WHERE id > 3", Theme::Dark)
            .await;
        match result.output {
            Output::Table(preview) => {
                assert_eq!(preview.columns, vec!["id"]);
                assert_eq!(preview.rows.len(), 2);
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sql_without_rows_is_message() {
        let dispatcher = ready_dispatcher(SessionConfig::default()).await;
        let result = dispatcher
            .run(Language::Sql, "DELETE FROM items WHERE id = 1", Theme::Dark)
            .await;
        assert_eq!(result.output, Output::Text(NO_ROWS_MESSAGE.to_string()));
    }

    #[tokio::test]
    async fn test_sql_error_is_error_result() {
        let dispatcher = ready_dispatcher(SessionConfig::default()).await;
        let result = dispatcher
            .run(Language::Sql, "SELECT * FROM nowhere", Theme::Dark)
            .await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn test_preview_cap_applies() {
        let dispatcher = ready_dispatcher(SessionConfig::default().with_preview_rows(2)).await;
        let result = dispatcher.run(Language::Sql, "SELECT * FROM items", Theme::Dark).await;
        match result.output {
            Output::Table(preview) => {
                assert_eq!(preview.rows.len(), 2);
                assert_eq!(preview.total_rows, 5);
            }
            other => panic!("expected table, got {other:?}"),
        }
        let result = dispatcher.run(Language::Script, "items", Theme::Dark).await;
        match result.output {
            Output::Table(preview) => assert_eq!(preview.rows.len(), 2),
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_script_void_and_logs() {
        let dispatcher = ready_dispatcher(SessionConfig::default()).await;
        let result = dispatcher
            .run(Language::Script, "print(\"hi\");\nlet x = 1;", Theme::Dark)
            .await;
        assert_eq!(result.output, Output::Text(NO_VALUE_MESSAGE.to_string()));
        assert_eq!(result.logs.as_deref(), Some("hi\n"));
    }

    #[tokio::test]
    async fn test_script_before_ready_fails_fast() {
        let config = SessionConfig::default();
        let store = Arc::new(TabularStore::open_in_memory().unwrap());
        let runtime = Arc::new(ScriptRuntime::new(RuntimeConfig::from(&config)));
        let dispatcher = Dispatcher::new(store, Arc::clone(&runtime), config);

        let result = dispatcher.run(Language::Script, "1 + 1", Theme::Dark).await;
        assert!(result.is_error());
        assert_eq!(runtime.status().status, EngineState::Idle);

        // SQL stays usable
        let result = dispatcher.run(Language::Sql, "SELECT 1 AS one", Theme::Dark).await;
        assert_eq!(result.kind(), "table");
    }

    #[tokio::test]
    async fn test_script_waits_when_configured() {
        let config = SessionConfig::default().with_runtime_ready_wait(Duration::from_secs(5));
        let store = Arc::new(TabularStore::open_in_memory().unwrap());
        let runtime = Arc::new(ScriptRuntime::new(RuntimeConfig::from(&config)));
        let dispatcher = Dispatcher::new(store, Arc::clone(&runtime), config);

        let booting = Arc::clone(&runtime);
        tokio::spawn(async move { booting.bootstrap(&[]).await });
        let result = dispatcher.run(Language::Script, "1 + 1", Theme::Dark).await;
        assert_eq!(result.output, Output::Text("2".to_string()));
    }

    #[tokio::test]
    async fn test_overlapping_runs_are_serialized() {
        let dispatcher = ready_dispatcher(SessionConfig::default()).await;
        let (script, sql) = tokio::join!(
            dispatcher.run(
                Language::Script,
                "items.push(#{ id: 6, price: 1.0 });",
                Theme::Dark
            ),
            dispatcher.run(Language::Sql, "INSERT INTO items VALUES (7, 2.0)", Theme::Dark),
        );
        assert!(!script.is_error() && !sql.is_error());

        // neither write was lost in either engine
        let result = dispatcher.run(Language::Sql, "SELECT COUNT(*) AS n FROM items", Theme::Dark).await;
        match result.output {
            Output::Table(preview) => assert_eq!(preview.rows[0]["n"], Value::Integer(7)),
            other => panic!("expected table, got {other:?}"),
        }
        let result = dispatcher.run(Language::Script, "items.len()", Theme::Dark).await;
        assert_eq!(result.output, Output::Text("7".to_string()));
    }

    #[tokio::test]
    async fn test_failed_batch_still_mirrors_applied_statements() {
        let dispatcher = ready_dispatcher(SessionConfig::default()).await;
        let result = dispatcher
            .run(
                Language::Sql,
                "DELETE FROM items WHERE id = 1; SELECT * FROM nowhere",
                Theme::Dark,
            )
            .await;
        assert!(result.is_error());
        let result = dispatcher.run(Language::Script, "items.len()", Theme::Dark).await;
        assert_eq!(result.output, Output::Text("4".to_string()));
    }

    #[tokio::test]
    async fn test_sql_written_before_ready_reaches_script() {
        let config = SessionConfig::default();
        let store = Arc::new(TabularStore::open_in_memory().unwrap());
        let runtime = Arc::new(ScriptRuntime::new(RuntimeConfig::from(&config)));
        let seed = Table::new("items", Vec::new(), vec![record([("id", Value::from(1i64))])]);
        store.create_table(&seed, true).unwrap();
        let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::clone(&runtime), config);

        let result = dispatcher.run(Language::Sql, "UPDATE items SET id = 42", Theme::Dark).await;
        assert!(!result.is_error());
        runtime.bootstrap(&[seed]).await.unwrap();

        let result = dispatcher.run(Language::Script, "items[0].id", Theme::Dark).await;
        assert_eq!(result.output, Output::Text("42.0".to_string()));
    }

    #[tokio::test]
    async fn test_symbols_per_language() {
        let dispatcher = ready_dispatcher(SessionConfig::default()).await;
        let sql = dispatcher.symbols(Language::Sql).await;
        assert_eq!(sql.entries()["items"], vec!["id", "price"]);
        let script = dispatcher.symbols(Language::Script).await;
        assert!(matches!(script, SymbolInfo::Script { .. }));
        assert_eq!(script.entries()["items"], vec!["id", "price"]);
    }
}
