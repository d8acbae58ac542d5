//! Session configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default number of rows returned to the UI for a tabular result.
pub const DEFAULT_PREVIEW_ROWS: usize = 50;

/// Default number of rows mirrored per table into the other engine.
pub const DEFAULT_SYNC_ROW_CAP: usize = 1000;

/// Default time allowed for the script runtime to load.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for one notebook session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct SessionConfig {
    /// Presentation-level row cap applied by the dispatcher.
    pub preview_rows: usize,

    /// Row cap for tables mirrored between engines. Larger tables are
    /// mirrored lossily.
    pub sync_row_cap: usize,

    /// Time allowed for the script runtime bootstrap before it is marked failed.
    #[serde(with = "duration_secs")]
    pub bootstrap_timeout: Duration,

    /// How long a script cell waits for a loading runtime before failing.
    /// Zero fails fast.
    #[serde(with = "duration_secs")]
    pub runtime_ready_wait: Duration,

    /// Create scenario tables with their declared column types instead of
    /// inferring storage types from the first row.
    pub honor_declared_types: bool,

    /// Script evaluated once when the runtime loads, before tables are bound.
    pub prelude: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preview_rows: DEFAULT_PREVIEW_ROWS,
            sync_row_cap: DEFAULT_SYNC_ROW_CAP,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            runtime_ready_wait: Duration::ZERO,
            honor_declared_types: true,
            prelude: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::Error::Config(format!(
                "cannot read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn with_preview_rows(mut self, rows: usize) -> Self {
        self.preview_rows = rows;
        self
    }

    pub fn with_sync_row_cap(mut self, rows: usize) -> Self {
        self.sync_row_cap = rows;
        self
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn with_runtime_ready_wait(mut self, wait: Duration) -> Self {
        self.runtime_ready_wait = wait;
        self
    }

    pub fn with_prelude(mut self, prelude: impl Into<String>) -> Self {
        self.prelude = Some(prelude.into());
        self
    }

    pub fn with_declared_types(mut self, honor: bool) -> Self {
        self.honor_declared_types = honor;
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
