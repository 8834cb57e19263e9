//! `info` command implementation.

use anyhow::{Context, Result};
use contracts::BridgeBlueprint;
use serde::Serialize;
use tracing::info;

use super::load_blueprint;
use crate::cli::InfoArgs;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    network: NetworkInfo,
    streams: Vec<SelectorInfo>,
    codes: Vec<CodeInfo>,
    start_code: i32,
    marker_outlet: OutletInfo,
    calibration: CalibrationInfo,
}

#[derive(Serialize)]
struct NetworkInfo {
    ports: String,
    known_peers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    multicast_group: Option<String>,
    resolver_probe_ms: u64,
    resolver_forget_secs: f64,
}

#[derive(Serialize)]
struct SelectorInfo {
    role: &'static str,
    query: String,
    channel: usize,
    recover: bool,
    max_buffered_secs: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    postprocessing: Vec<&'static str>,
}

#[derive(Serialize)]
struct CodeInfo {
    code: i32,
    class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cue_code: Option<i32>,
}

#[derive(Serialize)]
struct OutletInfo {
    name: String,
    content_type: String,
    source_id: String,
    session_start_code: i32,
    trial_start_code: i32,
    session_end_code: i32,
}

#[derive(Serialize)]
struct CalibrationInfo {
    enabled: bool,
    baseline_delay_secs: f64,
}

pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    let blueprint = load_blueprint(&args.config)?;

    if args.json {
        let info = build_config_info(&blueprint);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&blueprint);
    }

    Ok(())
}

fn build_config_info(blueprint: &BridgeBlueprint) -> ConfigInfo {
    let network = &blueprint.network;
    let selector = |role, s: &contracts::StreamSelector| SelectorInfo {
        role,
        query: s.query.to_string(),
        channel: s.channel,
        recover: s.inlet.recover,
        max_buffered_secs: s.inlet.max_buffered,
        postprocessing: s.inlet.postproc.names(),
    };
    let outlet = &blueprint.marker_outlet;

    ConfigInfo {
        version: format!("{:?}", blueprint.version),
        network: NetworkInfo {
            ports: format!(
                "{}..{}",
                network.base_port,
                u32::from(network.base_port) + u32::from(network.port_range)
            ),
            known_peers: network.known_peers.iter().map(|p| p.to_string()).collect(),
            multicast_group: network.multicast_group.map(|g| g.to_string()),
            resolver_probe_ms: blueprint.resolver.probe_interval_ms,
            resolver_forget_secs: blueprint.resolver.forget_after_secs,
        },
        streams: vec![
            selector("signal", &blueprint.signal),
            selector("markers", &blueprint.markers),
        ],
        codes: blueprint
            .codes
            .classes
            .iter()
            .map(|c| CodeInfo {
                code: c.code,
                class: c.class.to_string(),
                cue_code: outlet.cue_code(c.class, &blueprint.codes),
            })
            .collect(),
        start_code: blueprint.codes.start_code,
        marker_outlet: OutletInfo {
            name: outlet.name.clone(),
            content_type: outlet.content_type.clone(),
            source_id: outlet.source_id.clone(),
            session_start_code: outlet.session_start_code,
            trial_start_code: outlet.trial_start_code,
            session_end_code: outlet.session_end_code,
        },
        calibration: CalibrationInfo {
            enabled: blueprint.calibration.enabled,
            baseline_delay_secs: blueprint.calibration.baseline_delay_secs,
        },
    }
}

fn print_config_info(blueprint: &BridgeBlueprint) {
    let info = build_config_info(blueprint);

    println!("=== mibridge configuration ===\n");

    println!("Network");
    println!("   ├─ Version: {}", info.version);
    println!("   ├─ Service ports: {}", info.network.ports);
    println!("   ├─ Known peers: {}", info.network.known_peers.join(", "));
    match &info.network.multicast_group {
        Some(group) => println!("   ├─ Multicast: {}", group),
        None => println!("   ├─ Multicast: disabled"),
    }
    println!(
        "   └─ Resolver: probe every {} ms, forget after {} s",
        info.network.resolver_probe_ms, info.network.resolver_forget_secs
    );

    println!("\nStreams");
    for (i, s) in info.streams.iter().enumerate() {
        let prefix = if i == info.streams.len() - 1 { "└─" } else { "├─" };
        println!(
            "   {} {}: {} (channel {}, recover {}, buffer {} s)",
            prefix, s.role, s.query, s.channel, s.recover, s.max_buffered_secs
        );
    }

    println!("\nMarker codes (start = {})", info.start_code);
    for (i, c) in info.codes.iter().enumerate() {
        let prefix = if i == info.codes.len() - 1 { "└─" } else { "├─" };
        match c.cue_code {
            Some(cue) if cue != c.code => {
                println!("   {} {} -> {} (cue {})", prefix, c.code, c.class, cue)
            }
            _ => println!("   {} {} -> {}", prefix, c.code, c.class),
        }
    }

    let outlet = &info.marker_outlet;
    println!("\nMarker outlet");
    println!("   ├─ {} ({}) source '{}'", outlet.name, outlet.content_type, outlet.source_id);
    println!(
        "   └─ codes: start {}, trial {}, end {}",
        outlet.session_start_code, outlet.trial_start_code, outlet.session_end_code
    );

    println!("\nCalibration");
    if info.calibration.enabled {
        println!("   └─ enabled, baseline delay {} s", info.calibration.baseline_delay_secs);
    } else {
        println!("   └─ disabled");
    }

    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{ClassCode, Predicate, SteeringClass};

    #[test]
    fn test_info_lists_codes_and_cues() {
        let mut bp = BridgeBlueprint::new(
            Predicate::parse("type='MI'").unwrap(),
            Predicate::parse("type='Markers'").unwrap(),
        );
        bp.marker_outlet.cue_codes = vec![ClassCode::new(21, SteeringClass::HoldRight)];

        let info = build_config_info(&bp);
        assert_eq!(info.streams.len(), 2);
        assert_eq!(info.streams[1].role, "markers");
        let right = info.codes.iter().find(|c| c.class == "hold_right").unwrap();
        assert_eq!(right.code, 11);
        assert_eq!(right.cue_code, Some(21));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["marker_outlet"]["session_end_code"], 99);
    }
}
