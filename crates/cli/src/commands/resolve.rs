//! `resolve` command implementation.

use std::time::Duration;

use anyhow::{Context, Result};
use contracts::{NetworkConfig, ResolverConfig, StreamDescriptor};
use discovery::{resolve_all, resolve_bypred, ContinuousResolver, DiscoveryEvent};
use serde::Serialize;
use tracing::info;
use transport::StreamContext;

use super::{load_blueprint, shutdown_signal};
use crate::cli::ResolveArgs;

/// One stream for JSON output
#[derive(Debug, Serialize)]
struct StreamSummary {
    name: String,
    #[serde(rename = "type")]
    content_type: String,
    channel_count: usize,
    nominal_srate: f64,
    channel_format: String,
    source_id: String,
    uid: String,
    hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
}

impl From<&StreamDescriptor> for StreamSummary {
    fn from(d: &StreamDescriptor) -> Self {
        Self {
            name: d.name().to_string(),
            content_type: d.content_type().to_string(),
            channel_count: d.channel_count(),
            nominal_srate: d.nominal_srate(),
            channel_format: d.channel_format().as_str().to_string(),
            source_id: d.source_id().to_string(),
            uid: d.uid().to_string(),
            hostname: d.hostname().to_string(),
            address: d.data_endpoint().map(|a| a.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct WatchLine<'a> {
    event: &'a str,
    #[serde(flatten)]
    stream: StreamSummary,
}

pub async fn run_resolve(args: &ResolveArgs) -> Result<()> {
    let (network, resolver) = match &args.config {
        Some(path) => {
            let blueprint = load_blueprint(path)?;
            (blueprint.network, blueprint.resolver)
        }
        None => (NetworkConfig::default(), ResolverConfig::default()),
    };
    let ctx = StreamContext::new(network).context("Invalid network settings")?;

    if args.watch {
        return watch(&ctx, args, resolver).await;
    }

    if !(args.wait.is_finite() && args.wait >= 0.0) {
        anyhow::bail!("--wait must be a non-negative number of seconds");
    }
    let wait = Duration::from_secs_f64(args.wait);
    let mut streams = match &args.predicate {
        Some(predicate) => resolve_bypred(&ctx, predicate, 0, wait)
            .await
            .context("Invalid --predicate")?,
        None => resolve_all(&ctx, wait).await?,
    };
    streams.sort_by(|a, b| a.key().cmp(&b.key()));

    if args.json {
        let summaries: Vec<StreamSummary> = streams.iter().map(StreamSummary::from).collect();
        let json = serde_json::to_string_pretty(&summaries)
            .context("Failed to serialize stream list")?;
        println!("{}", json);
    } else {
        print_streams(&streams);
    }
    Ok(())
}

async fn watch(ctx: &StreamContext, args: &ResolveArgs, config: ResolverConfig) -> Result<()> {
    let query = args.predicate.clone().unwrap_or_default();
    let resolver = ContinuousResolver::new(ctx, &query, config)
        .await
        .context("Failed to start resolver")?;

    let json = args.json;
    resolver.subscribe(move |event| print_event(event, json));
    info!(query = %resolver.query(), "Watching for streams, Ctrl+C to stop");

    shutdown_signal().await;
    info!(known = resolver.results().len(), "Stopped watching");
    Ok(())
}

fn print_event(event: &DiscoveryEvent, json: bool) {
    let (tag, label) = match event {
        DiscoveryEvent::Found(_) => ("+", "found"),
        DiscoveryEvent::Lost(_) => ("-", "lost"),
    };
    let descriptor = event.descriptor();
    if json {
        let line = WatchLine {
            event: label,
            stream: StreamSummary::from(descriptor),
        };
        if let Ok(text) = serde_json::to_string(&line) {
            println!("{}", text);
        }
    } else {
        println!("{} {}", tag, describe(descriptor));
    }
}

fn print_streams(streams: &[StreamDescriptor]) {
    if streams.is_empty() {
        println!("No streams found");
        return;
    }
    println!("Streams ({})", streams.len());
    for (i, stream) in streams.iter().enumerate() {
        let prefix = if i == streams.len() - 1 { "└─" } else { "├─" };
        println!("   {} {}", prefix, describe(stream));
    }
}

fn describe(d: &StreamDescriptor) -> String {
    let rate = if d.is_irregular() {
        "irregular".to_string()
    } else {
        format!("{} Hz", d.nominal_srate())
    };
    format!(
        "{} ({}) {}ch {} {} on {} [{}]",
        d.name(),
        d.content_type(),
        d.channel_count(),
        d.channel_format().as_str(),
        rate,
        d.hostname(),
        d.uid()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{ChannelFormat, IRREGULAR_RATE};

    #[test]
    fn test_summary_fields() {
        let d = StreamDescriptor::new("KartCues", "Markers", 1, IRREGULAR_RATE, ChannelFormat::Int32, "cues")
            .unwrap();
        let json = serde_json::to_value(StreamSummary::from(&d)).unwrap();
        assert_eq!(json["name"], "KartCues");
        assert_eq!(json["type"], "Markers");
        assert_eq!(json["channel_format"], "int32");
        assert!(json.get("address").is_none());
    }

    #[test]
    fn test_describe_irregular() {
        let d = StreamDescriptor::new("KartCues", "Markers", 1, IRREGULAR_RATE, ChannelFormat::Int32, "cues")
            .unwrap();
        let text = describe(&d);
        assert!(text.starts_with("KartCues (Markers) 1ch int32 irregular"), "got: {text}");
    }
}
