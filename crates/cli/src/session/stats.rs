//! Session statistics.

use std::time::Duration;

use bridge::SessionState;
use observability::SessionMetricsAggregator;
use transport::OutletMetricsSnapshot;

/// Statistics from one bridge session
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub duration: Duration,

    pub final_state: SessionState,

    /// Counters of the bridge's marker outlet at shutdown
    pub marker_outlet: Option<OutletMetricsSnapshot>,

    pub metrics: SessionMetricsAggregator,
}

impl SessionStats {
    /// Ticks per second actually achieved
    pub fn tick_rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.metrics.total_ticks as f64 / secs
        } else {
            0.0
        }
    }

    pub fn print_summary(&self) {
        let summary = self.metrics.summary();

        println!("\n=== Bridge Session Statistics ===\n");
        println!("Overview");
        println!("   ├─ Duration: {:.2}s", self.duration.as_secs_f64());
        println!("   ├─ Final state: {}", self.final_state);
        println!("   ├─ Ticks: {} ({:.1}/s)", summary.total_ticks, self.tick_rate());
        println!(
            "   └─ Connected ticks: {} ({:.2}%)",
            summary.connected_ticks, summary.connected_rate
        );

        println!("\nStreams");
        println!("   ├─ Markers processed: {}", summary.total_markers);
        println!("   ├─ Signal samples: {}", summary.total_signal_samples);
        println!("   ├─ Steering: {}", summary.steering);
        println!("   └─ Tick duration (ms): {}", summary.tick_duration_ms);

        if let Some(outlet) = &self.marker_outlet {
            println!("\nMarker outlet");
            println!("   ├─ Markers pushed: {}", outlet.samples_pushed);
            println!("   ├─ Consumers: {} (total {})", outlet.consumers, outlet.consumers_total);
            println!("   └─ Dropped: {}", outlet.samples_dropped);
        }

        if !summary.event_counts.is_empty() {
            println!("\nSession events");
            for (event, count) in &summary.event_counts {
                println!("   ├─ {}: {}", event, count);
            }
        }

        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_rate() {
        let mut stats = SessionStats {
            duration: Duration::from_secs(2),
            ..Default::default()
        };
        stats.metrics.total_ticks = 120;
        assert!((stats.tick_rate() - 60.0).abs() < 1e-9);

        stats.duration = Duration::ZERO;
        assert_eq!(stats.tick_rate(), 0.0);
    }
}
