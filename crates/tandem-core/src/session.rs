//! Notebook session: both engines plus the dispatcher, behind one handle.

use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::bootstrap::{BootPhase, EngineBootstrapper, LoadOutcome};
use crate::config::SessionConfig;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::model::Scenario;
use crate::output::{EngineStatus, ExecutionResult, Language, SymbolInfo, Theme};

/// One notebook session.
pub struct Session {
    id: Uuid,
    engines: EngineBootstrapper,
    dispatcher: Dispatcher,
}

impl Session {
    pub fn new(config: SessionConfig) -> Result<Self> {
        let engines = EngineBootstrapper::new(config.clone())?;
        let dispatcher = Dispatcher::new(
            engines.store().clone(),
            engines.runtime().clone(),
            config,
        );
        let id = Uuid::new_v4();
        tracing::debug!("Created session {}", id);
        Ok(Self {
            id,
            engines,
            dispatcher,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Load `scenario` into both engines. See [`EngineBootstrapper::load`].
    pub fn load(&self, scenario: &Scenario) -> Result<LoadOutcome> {
        self.engines.load(scenario)
    }

    pub fn scenario_id(&self) -> Option<String> {
        self.engines.scenario_id()
    }

    /// Run one cell. Never fails; errors come back as an error result.
    pub async fn run(&self, language: Language, code: &str, theme: Theme) -> ExecutionResult {
        self.dispatcher.run(language, code, theme).await
    }

    pub async fn symbols(&self, language: Language) -> SymbolInfo {
        self.dispatcher.symbols(language).await
    }

    pub fn phase(&self) -> BootPhase {
        self.engines.phase()
    }

    pub fn runtime_status(&self) -> EngineStatus {
        self.engines.runtime_status()
    }

    /// Observe script runtime status changes.
    pub fn subscribe(&self) -> watch::Receiver<EngineStatus> {
        self.engines.runtime().subscribe()
    }

    /// Wait up to `wait` for the script runtime to become ready.
    pub async fn await_runtime(&self, wait: Duration) -> Result<()> {
        self.engines.runtime().await_ready(wait).await
    }

    pub async fn retry_runtime(&self) -> Result<()> {
        self.engines.retry_runtime().await
    }

    /// Unload both engines.
    pub async fn close(&self) -> Result<()> {
        tracing::debug!("Closing session {}", self.id);
        self.engines.teardown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Table, Value, record};
    use crate::output::{EngineState, Output};

    fn scenario() -> Scenario {
        Scenario::new(
            "s1",
            vec![Table::new(
                "people",
                Vec::new(),
                vec![
                    record([("name", Value::from("ada")), ("age", Value::from(36i64))]),
                    record([("name", Value::from("alan")), ("age", Value::from(41i64))]),
                ],
            )],
        )
    }

    #[tokio::test]
    async fn test_session_runs_both_languages() {
        let session = Session::new(SessionConfig::default()).unwrap();
        session.load(&scenario()).unwrap();
        session.await_runtime(Duration::from_secs(5)).await.unwrap();

        let sql = session
            .run(Language::Sql, "SELECT COUNT(*) AS n FROM people", Theme::Dark)
            .await;
        assert_eq!(sql.kind(), "table");

        let script = session.run(Language::Script, "people.len()", Theme::Dark).await;
        assert_eq!(script.output, Output::Text("2".to_string()));
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let a = Session::new(SessionConfig::default()).unwrap();
        let b = Session::new(SessionConfig::default()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_close_returns_runtime_to_idle() {
        let session = Session::new(SessionConfig::default()).unwrap();
        session.load(&scenario()).unwrap();
        session.await_runtime(Duration::from_secs(5)).await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.runtime_status().status, EngineState::Idle);
        assert_eq!(session.scenario_id(), None);
    }
}
