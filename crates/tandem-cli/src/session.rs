//! Session setup shared by all commands.

use std::path::Path;

use anyhow::Context;
use tandem_core::{LoadOutcome, Scenario, Session, SessionConfig};

/// Read the configuration (or defaults) and load `scenario` into a new session.
pub fn open(scenario: &Path, config: Option<&Path>) -> anyhow::Result<(Session, SessionConfig)> {
    let config = match config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };

    let text = std::fs::read_to_string(scenario)
        .with_context(|| format!("cannot read scenario {}", scenario.display()))?;
    let scenario = Scenario::from_json(&text)?;

    let session = Session::new(config.clone())?;
    if let LoadOutcome::Loaded { tables, skipped } = session.load(&scenario)? {
        tracing::info!(
            "Loaded scenario {} into session {} ({} tables, {} skipped)",
            scenario.id,
            session.id(),
            tables.len(),
            skipped.len()
        );
    }
    Ok((session, config))
}
