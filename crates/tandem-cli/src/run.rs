//! Run command implementation for Tandem CLI.
//!
//! Loads a scenario, waits for the script runtime when any script cell is
//! given, then runs every cell in order and prints one JSON result per cell.

use std::path::Path;
use std::time::Instant;

use tandem_core::{Language, Theme};

use crate::cell::CellArg;
use crate::session;

/// Execute cells against a scenario.
pub async fn execute(
    scenario: &Path,
    config: Option<&Path>,
    cells: &[CellArg],
    theme: Theme,
    pretty: bool,
) -> anyhow::Result<()> {
    let start = Instant::now();
    let (session, config) = session::open(scenario, config)?;

    if cells.iter().any(|c| c.language == Language::Script) {
        // failures surface as error results on the script cells
        if let Err(e) = session.await_runtime(config.bootstrap_timeout).await {
            tracing::warn!("{}", e.with_hint());
        }
    }

    let mut failed = 0;
    for cell in cells {
        let result = session.run(cell.language, &cell.code, theme).await;
        if result.is_error() {
            failed += 1;
        }
        let json = if pretty {
            serde_json::to_string_pretty(&result)?
        } else {
            serde_json::to_string(&result)?
        };
        println!("{}", json);
    }

    tracing::info!(
        "Ran {} cells in {:.2}s",
        cells.len(),
        start.elapsed().as_secs_f64()
    );

    if failed > 0 {
        anyhow::bail!("{} of {} cells failed", failed, cells.len());
    }
    Ok(())
}
