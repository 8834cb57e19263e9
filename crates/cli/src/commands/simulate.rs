//! `simulate` command implementation.
//!
//! Publishes a synthetic classifier stream and a scripted marker stream that
//! the configured bridge queries pick up, so the game can be exercised
//! without EEG hardware.

use std::time::Duration;

use anyhow::{Context, Result};
use contracts::{
    ChannelFormat, ChannelSpec, CompareOp, Expr, OutletConfig, Predicate, StreamDescriptor,
    IRREGULAR_RATE,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use transport::{StreamContext, StreamOutlet};

use super::{load_blueprint, shutdown_signal};
use crate::cli::SimulateArgs;
use crate::error::CliError;

/// Period of the synthetic classifier confidence (seconds)
const SIGNAL_PERIOD: f64 = 10.0;

pub async fn run_simulate(args: &SimulateArgs) -> Result<()> {
    check_args(args)?;
    let blueprint = load_blueprint(&args.config)?;
    let ctx = StreamContext::new(blueprint.network.clone()).context("Invalid network settings")?;

    let channels = blueprint.signal.channel + 1;
    let signal_desc = simulated_descriptor(
        &blueprint.signal.query,
        ("MIBridgeSimSignal", "MI", "mibridge-sim-signal"),
        channels,
        args.rate,
        ChannelFormat::Float32,
    )?;
    let marker_desc = simulated_descriptor(
        &blueprint.markers.query,
        ("MIBridgeSimMarkers", "Markers", "mibridge-sim-markers"),
        1,
        IRREGULAR_RATE,
        ChannelFormat::Int32,
    )?;

    let signal = StreamOutlet::new(&ctx, signal_desc, OutletConfig::default())
        .await
        .context("Failed to publish simulated signal")?;
    let markers = StreamOutlet::new(&ctx, marker_desc, OutletConfig::default())
        .await
        .context("Failed to publish simulated markers")?;

    info!(
        signal = %signal.info().name(),
        markers = %markers.info().name(),
        rate = args.rate,
        script = ?args.script,
        "Simulation started"
    );

    tokio::select! {
        result = simulate(&ctx, &signal, &markers, args, blueprint.signal.channel) => result?,
        _ = shutdown_signal() => info!("Received shutdown signal, stopping simulation"),
    }

    let pushed = markers.metrics().samples_pushed;
    info!(
        signal_samples = signal.metrics().samples_pushed,
        markers = pushed,
        "Simulation finished"
    );
    Ok(())
}

fn check_args(args: &SimulateArgs) -> Result<(), CliError> {
    if !(args.rate.is_finite() && args.rate > 0.0) {
        return Err(CliError::simulation(format!("rate must be positive, got {}", args.rate)));
    }
    if !(args.interval.is_finite() && args.interval > 0.0) {
        return Err(CliError::simulation(format!(
            "interval must be positive, got {}",
            args.interval
        )));
    }
    if args.script.is_empty() {
        return Err(CliError::simulation("marker script is empty"));
    }
    Ok(())
}

/// Run the signal and the marker script together until the script is done
async fn simulate(
    ctx: &StreamContext,
    signal: &StreamOutlet,
    markers: &StreamOutlet,
    args: &SimulateArgs,
    channel: usize,
) -> Result<()> {
    let mut sample_clock = tokio::time::interval(Duration::from_secs_f64(1.0 / args.rate));
    sample_clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut marker_clock = tokio::time::interval(Duration::from_secs_f64(args.interval));
    // first tick fires at once; markers start one interval in
    marker_clock.tick().await;

    let start = ctx.now();
    let mut row = vec![0.0f32; channel + 1];
    let mut script = args.script.iter().copied().cycle().take(if args.repeat {
        usize::MAX
    } else {
        args.script.len()
    });
    let mut script_done = false;

    loop {
        tokio::select! {
            _ = sample_clock.tick() => {
                row[channel] = confidence(ctx.now() - start) as f32;
                signal.push_sample(&row, None, false)?;
            }
            _ = marker_clock.tick() => {
                if script_done {
                    return Ok(());
                }
                match script.next() {
                    Some(code) => {
                        markers.push_sample(&[code], None, true)?;
                        info!(code, "Marker sent");
                    }
                    None => {
                        debug!("Script finished, draining for one interval");
                        script_done = true;
                    }
                }
            }
        }
    }
}

/// Classifier confidence in [0, 1]
fn confidence(t: f64) -> f64 {
    0.5 + 0.5 * (2.0 * std::f64::consts::PI * t / SIGNAL_PERIOD).sin()
}

/// Descriptor that the given query accepts.
///
/// Name, type and source id come from `prop='value'` terms of the query
/// when present, else from `defaults`.
fn simulated_descriptor(
    query: &Predicate,
    defaults: (&str, &str, &str),
    channels: usize,
    rate: f64,
    format: ChannelFormat,
) -> Result<StreamDescriptor> {
    let pick = |property: &str, fallback: &str| {
        query
            .expr()
            .and_then(|expr| required_value(expr, property))
            .unwrap_or_else(|| fallback.to_string())
    };
    let name = pick("name", defaults.0);
    let content_type = pick("type", defaults.1);
    let source_id = pick("source_id", defaults.2);

    let channel_count = u32::try_from(channels)
        .map_err(|_| CliError::simulation(format!("too many channels: {channels}")))?;
    let mut descriptor =
        StreamDescriptor::new(name, content_type, channel_count, rate, format, source_id)?;
    let specs: Vec<ChannelSpec> = (0..channels)
        .map(|i| ChannelSpec::new(format!("ch{i}"), "a.u.", descriptor.content_type().to_string()))
        .collect();
    descriptor.desc_mut().append_channels(&specs)?;

    if !descriptor.matches_query(query) {
        return Err(CliError::query_mismatch(descriptor.name(), query.as_str()).into());
    }
    Ok(descriptor)
}

/// Value an `and`-chain of the predicate requires for `property`
fn required_value(expr: &Expr, property: &str) -> Option<String> {
    match expr {
        Expr::Compare {
            property: p,
            op: CompareOp::Eq,
            literal,
        } if p == property => Some(literal.clone()),
        Expr::And(a, b) => required_value(a, property).or_else(|| required_value(b, property)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_follows_query() {
        let query = Predicate::parse("type='Markers' and name='KartCues'").unwrap();
        let d = simulated_descriptor(
            &query,
            ("Sim", "Sim", "sim"),
            1,
            IRREGULAR_RATE,
            ChannelFormat::Int32,
        )
        .unwrap();
        assert_eq!(d.name(), "KartCues");
        assert_eq!(d.content_type(), "Markers");
        assert_eq!(d.source_id(), "sim");
        assert!(d.matches_query(&query));
    }

    #[test]
    fn test_descriptor_defaults_for_open_query() {
        let query = Predicate::parse("channel_count>=1").unwrap();
        let d = simulated_descriptor(&query, ("Sim", "MI", "sim"), 2, 128.0, ChannelFormat::Float32)
            .unwrap();
        assert_eq!(d.name(), "Sim");
        assert_eq!(d.channel_count(), 2);
    }

    #[test]
    fn test_unsatisfiable_query_rejected() {
        let query = Predicate::parse("channel_count>4").unwrap();
        let err = simulated_descriptor(&query, ("Sim", "MI", "sim"), 1, 128.0, ChannelFormat::Float32)
            .unwrap_err();
        assert!(err.to_string().contains("does not match query"), "got: {err}");
    }

    #[test]
    fn test_confidence_range() {
        for i in 0..100 {
            let c = confidence(f64::from(i) * 0.37);
            assert!((0.0..=1.0).contains(&c));
        }
        assert!((confidence(0.0) - 0.5).abs() < 1e-12);
    }
}
