//! Bridge session metrics
//!
//! Records per-tick and per-event metrics of an `ExperimentBridge` and keeps
//! an in-memory aggregate for the end-of-session summary.

use std::collections::BTreeMap;

use bridge::{SessionEvent, TickReport};
use metrics::{counter, gauge, histogram};
use transport::OutletMetricsSnapshot;

/// Record the outcome of one bridge tick
///
/// # Example
///
/// ```ignore
/// use observability::metrics::record_tick;
///
/// let started = std::time::Instant::now();
/// let report = bridge.tick().await?;
/// record_tick(&report, started.elapsed().as_secs_f64() * 1000.0);
/// ```
pub fn record_tick(report: &TickReport, duration_ms: f64) {
    counter!("mibridge_ticks_total").increment(1);
    histogram!("mibridge_tick_duration_ms").record(duration_ms);

    gauge!("mibridge_bridge_connected").set(if report.connected { 1.0 } else { 0.0 });

    if report.markers_processed > 0 {
        counter!("mibridge_markers_processed_total").increment(report.markers_processed as u64);
    }
    if report.signal_samples > 0 {
        counter!("mibridge_signal_samples_total").increment(report.signal_samples as u64);
    }
}

/// Record a session event published by the bridge
pub fn record_session_event(event: &SessionEvent) {
    counter!(
        "mibridge_session_events_total",
        "event" => event.kind()
    )
    .increment(1);

    if let SessionEvent::Cue(class) = event {
        counter!(
            "mibridge_cues_total",
            "class" => class.as_str()
        )
        .increment(1);
    }
}

/// Export an outlet's counters as gauges labelled by stream name
pub fn record_outlet_snapshot(stream: &str, snapshot: &OutletMetricsSnapshot) {
    gauge!(
        "mibridge_outlet_consumers",
        "stream" => stream.to_string()
    )
    .set(snapshot.consumers as f64);
    gauge!(
        "mibridge_outlet_chunks_sent",
        "stream" => stream.to_string()
    )
    .set(snapshot.chunks_sent as f64);
}

/// Session metrics aggregator
///
/// Aggregates ticks and events in memory for a printed summary.
#[derive(Debug, Clone, Default)]
pub struct SessionMetricsAggregator {
    pub total_ticks: u64,

    /// Ticks in which either inlet delivered a sample
    pub connected_ticks: u64,

    pub total_markers: u64,

    pub total_signal_samples: u64,

    /// Steering values observed while connected
    pub steering_stats: RunningStats,

    pub tick_duration_stats: RunningStats,

    /// Event counts keyed by event kind
    pub event_counts: BTreeMap<&'static str, u64>,
}

impl SessionMetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, report: &TickReport, duration_ms: f64) {
        self.total_ticks += 1;
        self.total_markers += report.markers_processed as u64;
        self.total_signal_samples += report.signal_samples as u64;
        self.tick_duration_stats.push(duration_ms);

        if report.connected {
            self.connected_ticks += 1;
            self.steering_stats.push(report.steering);
        }
    }

    pub fn record_event(&mut self, event: &SessionEvent) {
        *self.event_counts.entry(event.kind()).or_insert(0) += 1;
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            total_ticks: self.total_ticks,
            connected_ticks: self.connected_ticks,
            connected_rate: if self.total_ticks > 0 {
                self.connected_ticks as f64 / self.total_ticks as f64 * 100.0
            } else {
                0.0
            },
            total_markers: self.total_markers,
            total_signal_samples: self.total_signal_samples,
            steering: StatsSummary::from(&self.steering_stats),
            tick_duration_ms: StatsSummary::from(&self.tick_duration_stats),
            event_counts: self.event_counts.clone(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Summary of one bridge session
#[derive(Debug, Clone, Default)]
pub struct MetricsSummary {
    pub total_ticks: u64,
    pub connected_ticks: u64,
    pub connected_rate: f64,
    pub total_markers: u64,
    pub total_signal_samples: u64,
    pub steering: StatsSummary,
    pub tick_duration_ms: StatsSummary,
    pub event_counts: BTreeMap<&'static str, u64>,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Session Metrics Summary ===")?;
        writeln!(f, "Total ticks: {}", self.total_ticks)?;
        writeln!(
            f,
            "Connected ticks: {} ({:.2}%)",
            self.connected_ticks, self.connected_rate
        )?;
        writeln!(f, "Markers processed: {}", self.total_markers)?;
        writeln!(f, "Signal samples: {}", self.total_signal_samples)?;
        writeln!(f, "Steering: {}", self.steering)?;
        writeln!(f, "Tick duration (ms): {}", self.tick_duration_ms)?;

        if !self.event_counts.is_empty() {
            writeln!(f, "Session events:")?;
            for (event, count) in &self.event_counts {
                writeln!(f, "  {}: {}", event, count)?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// Online statistics (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (value - self.mean);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge::SessionState;
    use contracts::SteeringClass;

    fn report(connected: bool, steering: f64, markers: usize, samples: usize) -> TickReport {
        TickReport {
            state: SessionState::Running,
            connected,
            steering,
            markers_processed: markers,
            signal_samples: samples,
        }
    }

    #[test]
    fn test_running_stats() {
        let mut stats = RunningStats::default();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            stats.push(v);
        }

        assert_eq!(stats.count(), 5);
        assert!((stats.mean() - 3.0).abs() < 1e-10);
        assert!((stats.min() - 1.0).abs() < 1e-10);
        assert!((stats.max() - 5.0).abs() < 1e-10);
        assert!((stats.variance() - 2.5).abs() < 1e-10);
    }

    #[test]
    fn test_aggregator_update() {
        let mut aggregator = SessionMetricsAggregator::new();
        aggregator.update(&report(true, 0.6, 1, 4), 0.4);
        aggregator.update(&report(false, 0.6, 0, 0), 0.2);
        aggregator.update(&report(true, -0.2, 2, 3), 0.3);
        aggregator.record_event(&SessionEvent::Started);
        aggregator.record_event(&SessionEvent::Cue(SteeringClass::HoldLeft));
        aggregator.record_event(&SessionEvent::Cue(SteeringClass::Rest));

        assert_eq!(aggregator.total_ticks, 3);
        assert_eq!(aggregator.connected_ticks, 2);
        assert_eq!(aggregator.total_markers, 3);
        assert_eq!(aggregator.total_signal_samples, 7);
        assert_eq!(aggregator.steering_stats.count(), 2);
        assert!((aggregator.steering_stats.mean() - 0.2).abs() < 1e-10);
        assert_eq!(aggregator.event_counts.get("cue"), Some(&2));
        assert_eq!(aggregator.event_counts.get("started"), Some(&1));

        aggregator.reset();
        assert_eq!(aggregator.total_ticks, 0);
    }

    #[test]
    fn test_summary_display() {
        let mut aggregator = SessionMetricsAggregator::new();
        for _ in 0..3 {
            aggregator.update(&report(true, 1.0, 0, 1), 1.0);
        }
        aggregator.update(&report(false, 0.0, 0, 0), 1.0);
        aggregator.record_event(&SessionEvent::Ended);

        let output = format!("{}", aggregator.summary());
        assert!(output.contains("Total ticks: 4"));
        assert!(output.contains("75.00%"));
        assert!(output.contains("ended: 1"));
    }

    #[test]
    fn test_empty_stats_display() {
        assert_eq!(StatsSummary::default().to_string(), "N/A");
    }
}
