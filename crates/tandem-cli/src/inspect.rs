//! `symbols` and `status` command implementations.

use std::path::Path;

use tandem_core::Language;

use crate::session;

/// Print the tables visible to `language`.
pub async fn symbols(scenario: &Path, config: Option<&Path>, language: Language) -> anyhow::Result<()> {
    let (session, config) = session::open(scenario, config)?;
    if language == Language::Script {
        session.await_runtime(config.bootstrap_timeout).await?;
    }
    let symbols = session.symbols(language).await;
    println!("{}", serde_json::to_string_pretty(&symbols)?);
    Ok(())
}

/// Print the script runtime status once bootstrap has settled.
pub async fn status(scenario: &Path, config: Option<&Path>) -> anyhow::Result<()> {
    let (session, config) = session::open(scenario, config)?;
    if let Err(e) = session.await_runtime(config.bootstrap_timeout).await {
        tracing::debug!("Runtime not ready: {}", e);
    }
    println!("{}", serde_json::to_string_pretty(&session.runtime_status())?);
    Ok(())
}
