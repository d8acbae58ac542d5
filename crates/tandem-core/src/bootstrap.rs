//! Scenario loading for both engines.
//!
//! The SQL store is populated synchronously, so SQL cells are usable as soon
//! as [`EngineBootstrapper::load`] returns. The script runtime loads in a
//! background task; its progress is observable through
//! [`ScriptRuntime::status`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::model::{Scenario, Table};
use crate::output::{EngineState, EngineStatus};
use crate::runtime::{RuntimeConfig, ScriptRuntime};
use crate::store::TabularStore;

/// What a call to [`EngineBootstrapper::load`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The scenario was already loaded; nothing changed.
    Unchanged,
    /// The SQL store was rebuilt from the scenario.
    Loaded {
        /// Tables created in the SQL store.
        tables: Vec<String>,
        /// Tables skipped because they had no rows.
        skipped: Vec<String>,
    },
}

/// Progress of scenario loading across both engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootPhase {
    /// No scenario loaded.
    Uninitialized,
    /// The SQL store is being populated.
    Booting,
    /// SQL cells can run; the script runtime is in the given state.
    SqlReady(EngineState),
}

#[derive(Default)]
struct Loaded {
    scenario_id: Option<String>,
    seed: Arc<Vec<Table>>,
    task: Option<JoinHandle<()>>,
}

/// Owns both engines and loads scenarios into them.
pub struct EngineBootstrapper {
    config: SessionConfig,
    store: Arc<TabularStore>,
    runtime: Arc<ScriptRuntime>,
    loaded: Mutex<Loaded>,
    booting: AtomicBool,
}

impl EngineBootstrapper {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let store = Arc::new(TabularStore::open_in_memory()?);
        let runtime = Arc::new(ScriptRuntime::new(RuntimeConfig::from(&config)));
        Ok(Self {
            config,
            store,
            runtime,
            loaded: Mutex::new(Loaded::default()),
            booting: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<TabularStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<ScriptRuntime> {
        &self.runtime
    }

    fn loaded(&self) -> Result<MutexGuard<'_, Loaded>> {
        self.loaded.lock().map_err(|_| Error::Poisoned("bootstrapper"))
    }

    /// Id of the scenario currently loaded, if any.
    pub fn scenario_id(&self) -> Option<String> {
        self.loaded().ok().and_then(|l| l.scenario_id.clone())
    }

    pub fn phase(&self) -> BootPhase {
        if self.booting.load(Ordering::SeqCst) {
            return BootPhase::Booting;
        }
        match self.scenario_id() {
            Some(_) => BootPhase::SqlReady(self.runtime.status().status),
            None => BootPhase::Uninitialized,
        }
    }

    /// Load `scenario` into both engines.
    ///
    /// Loading the scenario that is already loaded is a no-op. A different
    /// scenario replaces every SQL table and rebinds the script runtime.
    /// The script runtime is loaded in the background; this returns once
    /// the SQL store is ready. Must be called within a tokio runtime.
    pub fn load(&self, scenario: &Scenario) -> Result<LoadOutcome> {
        let mut loaded = self.loaded()?;
        if loaded.scenario_id.as_deref() == Some(scenario.id.as_str()) {
            tracing::debug!("Scenario {} already loaded", scenario.id);
            return Ok(LoadOutcome::Unchanged);
        }
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Bootstrap(format!("no async runtime to load into: {}", e)))?;

        tracing::info!(
            "Loading scenario {} ({} tables)",
            scenario.id,
            scenario.tables.len()
        );

        // no cell may run against the outgoing bindings while SQL is rebuilt
        let reloading = self.runtime.begin_reload();
        self.booting.store(true, Ordering::SeqCst);
        let populated = self.populate(scenario);
        self.booting.store(false, Ordering::SeqCst);
        let (tables, skipped, seed) = match populated {
            Ok(populated) => populated,
            Err(e) => {
                loaded.scenario_id = None;
                if reloading {
                    let runtime = Arc::clone(&self.runtime);
                    handle.spawn(async move { runtime.abandon_reload().await });
                }
                return Err(e);
            }
        };

        let seed = Arc::new(seed);
        loaded.scenario_id = Some(scenario.id.clone());
        loaded.seed = Arc::clone(&seed);
        let previous = loaded.task.take();
        loaded.task = Some(self.spawn_runtime_load(&handle, seed, previous));

        Ok(LoadOutcome::Loaded { tables, skipped })
    }

    /// Rebuild the SQL store from `scenario`. Returns the created and skipped
    /// table names, plus the tables to bind in the script runtime.
    fn populate(&self, scenario: &Scenario) -> Result<(Vec<String>, Vec<String>, Vec<Table>)> {
        self.store.clear()?;
        let mut tables = Vec::new();
        let mut skipped = Vec::new();
        let mut seed = Vec::new();
        for table in &scenario.tables {
            if table.data.is_empty() {
                tracing::warn!("Table {} has no rows; skipping", table.name);
                skipped.push(table.name.clone());
                continue;
            }
            for defect in table.validate() {
                tracing::warn!("Table {}: {}", table.name, defect);
            }
            let rows = self
                .store
                .create_table(table, self.config.honor_declared_types)?;
            tracing::debug!("Created table {} ({} rows)", table.name, rows);
            tables.push(table.name.clone());
            seed.push(table.clone());
        }
        Ok((tables, skipped, seed))
    }

    fn spawn_runtime_load(
        &self,
        handle: &tokio::runtime::Handle,
        seed: Arc<Vec<Table>>,
        previous: Option<JoinHandle<()>>,
    ) -> JoinHandle<()> {
        let runtime = Arc::clone(&self.runtime);
        handle.spawn(async move {
            // loads apply in scenario order
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            let result = match runtime.status().status {
                EngineState::Idle => runtime.bootstrap(&seed).await,
                EngineState::Loading | EngineState::Ready => runtime.rebind(&seed).await,
                EngineState::Error => {
                    tracing::info!("Script runtime is in error; retry to load the new scenario");
                    return;
                }
            };
            if let Err(e) = result {
                tracing::warn!("Script runtime did not load: {}", e);
            }
        })
    }

    /// Current script runtime status.
    pub fn runtime_status(&self) -> EngineStatus {
        self.runtime.status()
    }

    /// Reset a failed script runtime and load it again with the current
    /// scenario's tables. Waits for the attempt to finish.
    pub async fn retry_runtime(&self) -> Result<()> {
        let seed = {
            let mut loaded = self.loaded()?;
            if let Some(task) = loaded.task.take() {
                task.abort();
            }
            Arc::clone(&loaded.seed)
        };
        tracing::info!("Retrying script runtime load");
        self.runtime.reset().await;
        self.runtime.bootstrap(&seed).await
    }

    /// Drop all tables and unload the script runtime.
    pub async fn teardown(&self) -> Result<()> {
        {
            let mut loaded = self.loaded()?;
            if let Some(task) = loaded.task.take() {
                task.abort();
            }
            *loaded = Loaded::default();
        }
        self.store.clear()?;
        self.runtime.reset().await;
        tracing::info!("Session engines torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{Value, record};

    fn scenario(id: &str, table: &str) -> Scenario {
        Scenario::new(
            id,
            vec![
                Table::new(table, Vec::new(), vec![record([("n", Value::from(1i64))])]),
                Table::new("blank", Vec::new(), Vec::new()),
            ],
        )
    }

    #[tokio::test]
    async fn test_load_populates_sql_synchronously() {
        let boot = EngineBootstrapper::new(SessionConfig::default()).unwrap();
        let outcome = boot.load(&scenario("a", "alpha")).unwrap();
        assert_eq!(
            outcome,
            LoadOutcome::Loaded {
                tables: vec!["alpha".to_string()],
                skipped: vec!["blank".to_string()],
            }
        );
        assert_eq!(boot.store().table_names().unwrap(), vec!["alpha"]);
        assert_eq!(boot.scenario_id().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_phase_tracks_both_engines() {
        let boot = EngineBootstrapper::new(SessionConfig::default()).unwrap();
        assert_eq!(boot.phase(), BootPhase::Uninitialized);
        boot.load(&scenario("a", "alpha")).unwrap();
        assert!(matches!(boot.phase(), BootPhase::SqlReady(_)));
        boot.runtime().await_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(boot.phase(), BootPhase::SqlReady(EngineState::Ready));
    }

    #[tokio::test]
    async fn test_same_scenario_is_noop() {
        let boot = EngineBootstrapper::new(SessionConfig::default()).unwrap();
        boot.load(&scenario("a", "alpha")).unwrap();
        assert_eq!(boot.load(&scenario("a", "other")).unwrap(), LoadOutcome::Unchanged);
        assert_eq!(boot.store().table_names().unwrap(), vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_new_scenario_replaces_tables() {
        let boot = EngineBootstrapper::new(SessionConfig::default()).unwrap();
        boot.load(&scenario("a", "alpha")).unwrap();
        boot.runtime().await_ready(Duration::from_secs(5)).await.unwrap();

        boot.load(&scenario("b", "beta")).unwrap();
        assert_eq!(boot.store().table_names().unwrap(), vec!["beta"]);
        // cells are refused until the rebind lands
        assert_eq!(boot.runtime_status().status, EngineState::Loading);

        boot.runtime().await_ready(Duration::from_secs(5)).await.unwrap();
        let frames = boot.runtime().introspect().await;
        assert!(frames.contains_key("beta"));
        assert!(!frames.contains_key("alpha"));
    }

    #[test]
    fn test_load_outside_async_runtime_fails() {
        let boot = EngineBootstrapper::new(SessionConfig::default()).unwrap();
        let err = boot.load(&scenario("a", "alpha")).unwrap_err();
        assert!(matches!(err, Error::Bootstrap(_)));
    }

    #[tokio::test]
    async fn test_retry_after_failed_prelude() {
        let config = SessionConfig::default().with_prelude("let = ;");
        let boot = EngineBootstrapper::new(config).unwrap();
        boot.load(&scenario("a", "alpha")).unwrap();
        assert!(boot.runtime().await_ready(Duration::from_secs(5)).await.is_err());
        assert_eq!(boot.runtime_status().status, EngineState::Error);
        // still failing: the prelude is part of the configuration
        assert!(boot.retry_runtime().await.is_err());
        assert_eq!(boot.store().table_names().unwrap(), vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_teardown_clears_everything() {
        let boot = EngineBootstrapper::new(SessionConfig::default()).unwrap();
        boot.load(&scenario("a", "alpha")).unwrap();
        boot.teardown().await.unwrap();
        assert!(boot.store().table_names().unwrap().is_empty());
        assert_eq!(boot.scenario_id(), None);
        assert_eq!(boot.runtime_status().status, EngineState::Idle);
    }
}
