//! Error types for tandem-core.

use std::time::Duration;

use thiserror::Error;

use crate::output::EngineState;

/// Result type for tandem-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tandem-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The script runtime failed to load.
    #[error("script runtime failed to load: {0}")]
    Bootstrap(String),

    /// The script runtime did not finish loading in time.
    #[error("script runtime bootstrap timed out after {}s", .0.as_secs())]
    BootstrapTimeout(Duration),

    /// Script execution was requested while the runtime is not usable.
    #[error("script runtime is not ready (status: {state}){}", message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
    RuntimeUnavailable {
        state: EngineState,
        message: Option<String>,
    },

    /// User script raised during evaluation.
    #[error("{}", line.map(|l| format!("Error on line {}: {}", l, message)).unwrap_or_else(|| message.clone()))]
    Script {
        message: String,
        line: Option<usize>,
    },

    /// SQL engine error.
    #[error("{0}")]
    Sql(#[from] rusqlite::Error),

    /// Scenario payload could not be used.
    #[error("malformed scenario data: {0}")]
    MalformedScenario(String),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Chart rendering failed.
    #[error("chart rendering failed: {0}")]
    Render(String),

    /// A lock guarding engine state was poisoned by a panic.
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

impl Error {
    /// Recovery hint for errors the caller can act on.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Error::RuntimeUnavailable {
                state: EngineState::Loading,
                ..
            } => Some("the script runtime is still loading; SQL cells can run in the meantime"),
            Error::RuntimeUnavailable {
                state: EngineState::Error,
                ..
            }
            | Error::Bootstrap(_)
            | Error::BootstrapTimeout(_) => {
                Some("retry the script runtime bootstrap; SQL cells remain usable")
            }
            Error::RuntimeUnavailable {
                state: EngineState::Idle,
                ..
            } => Some("bootstrap a scenario before running script cells"),
            Error::MalformedScenario(_) => Some("check the scenario JSON shape"),
            _ => None,
        }
    }

    /// Error message followed by its recovery hint, if any.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }

    pub(crate) fn unavailable(state: EngineState, message: Option<String>) -> Self {
        Error::RuntimeUnavailable { state, message }
    }
}
