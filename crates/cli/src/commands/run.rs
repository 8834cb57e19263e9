//! `run` command implementation.

use anyhow::{Context, Result};
use contracts::{BridgeBlueprint, Predicate};
use std::time::Duration;
use tracing::info;

use super::{load_blueprint, shutdown_signal};
use crate::cli::RunArgs;
use crate::session::{SessionConfig, SessionRunner};

pub async fn run_bridge(args: &RunArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration");

    let mut blueprint = load_blueprint(&args.config)?;
    apply_overrides(&mut blueprint, args)?;

    info!(
        signal = %blueprint.signal.query,
        markers = %blueprint.markers.query,
        outlet = %blueprint.marker_outlet.name,
        calibration = blueprint.calibration.enabled,
        "Configuration loaded"
    );

    if args.tick_ms == 0 {
        anyhow::bail!("--tick-ms must be at least 1");
    }

    let runner = SessionRunner::new(SessionConfig {
        blueprint,
        tick: Duration::from_millis(args.tick_ms),
        duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
        metrics_port: (args.metrics_port > 0).then_some(args.metrics_port),
    });

    let stats = runner
        .run(shutdown_signal())
        .await
        .context("Bridge session failed")?;

    info!(
        ticks = stats.metrics.total_ticks,
        duration_secs = stats.duration.as_secs_f64(),
        final_state = %stats.final_state,
        "Bridge session finished"
    );
    stats.print_summary();

    Ok(())
}

/// CLI flags win over file values; the result is validated again
fn apply_overrides(blueprint: &mut BridgeBlueprint, args: &RunArgs) -> Result<()> {
    if let Some(ref query) = args.signal_query {
        info!(query = %query, "Overriding signal query from CLI");
        blueprint.signal.query = Predicate::parse(query).context("Invalid --signal-query")?;
    }
    if let Some(ref query) = args.marker_query {
        info!(query = %query, "Overriding marker query from CLI");
        blueprint.markers.query = Predicate::parse(query).context("Invalid --marker-query")?;
    }
    if args.calibration {
        blueprint.calibration.enabled = true;
    }
    config_loader::ConfigLoader::validate(blueprint).context("Invalid configuration after overrides")?;
    Ok(())
}
