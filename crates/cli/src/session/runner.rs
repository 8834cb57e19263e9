//! Session runner - drives one `ExperimentBridge` until it ends.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bridge::{ExperimentBridge, SessionEvent, SessionState};
use contracts::BridgeBlueprint;
use observability::{record_outlet_snapshot, record_session_event, record_tick};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use transport::StreamContext;

use super::SessionStats;

/// Interval between steering status lines
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub blueprint: BridgeBlueprint,

    pub tick: Duration,

    /// Stop after this long (None = until the session ends or a signal arrives)
    pub duration: Option<Duration>,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

pub struct SessionRunner {
    config: SessionConfig,
}

impl SessionRunner {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// Tick the bridge until the session ends, `duration` elapses or
    /// `shutdown` resolves, then end the session.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<SessionStats> {
        let started = Instant::now();
        let blueprint = &self.config.blueprint;

        if let Some(port) = self.config.metrics_port {
            observability::init_metrics_only(port)?;
        }

        let ctx = StreamContext::new(blueprint.network.clone())
            .context("Invalid network settings")?;
        let mut bridge = ExperimentBridge::new(&ctx, blueprint.to_bridge_config())
            .await
            .context("Failed to start the experiment bridge")?;

        let (event_tx, mut events) = mpsc::unbounded_channel();
        bridge.subscribe(move |event| {
            let _ = event_tx.send(*event);
        });
        let mut checkpoints = spawn_checkpoint_reader(blueprint.calibration.enabled);

        let mut stats = SessionStats::default();
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = self.config.duration.map(|d| started + d);
        let mut last_status = Instant::now();

        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            duration = ?self.config.duration,
            outlet = %bridge.marker_outlet_info().name(),
            "Session runner started"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    warn!("Received shutdown signal, ending session...");
                    break;
                }
                Some(()) = checkpoints.recv() => {
                    if bridge.checkpoint_reached().context("Checkpoint failed")? {
                        info!("Baseline checkpoint reached");
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            let tick_started = Instant::now();
            let report = bridge.tick().await.context("Bridge tick failed")?;
            let tick_ms = tick_started.elapsed().as_secs_f64() * 1000.0;

            record_tick(&report, tick_ms);
            stats.metrics.update(&report, tick_ms);
            drain_events(&mut events, &mut stats);

            if last_status.elapsed() >= STATUS_INTERVAL {
                last_status = Instant::now();
                debug!(
                    state = %report.state,
                    connected = report.connected,
                    steering = report.steering,
                    "Bridge status"
                );
            }

            if report.state == SessionState::Ended {
                info!("Session ended by the marker stream");
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("Session duration reached");
                break;
            }
        }

        bridge.end_session().context("Failed to end session")?;
        drain_events(&mut events, &mut stats);

        let outlet_metrics = bridge.marker_outlet_metrics();
        record_outlet_snapshot(bridge.marker_outlet_info().name(), &outlet_metrics);

        stats.duration = started.elapsed();
        stats.final_state = bridge.state();
        stats.marker_outlet = Some(outlet_metrics);
        Ok(stats)
    }
}

fn drain_events(events: &mut mpsc::UnboundedReceiver<SessionEvent>, stats: &mut SessionStats) {
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Cue(class) => info!(class = %class, "Cue"),
            other => info!(event = other.kind(), "Session event"),
        }
        record_session_event(&event);
        stats.metrics.record_event(&event);
    }
}

/// With calibration enabled, every line on stdin marks a baseline checkpoint.
/// Without it the returned channel never yields.
fn spawn_checkpoint_reader(enabled: bool) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    if enabled {
        info!("Calibration enabled: press Enter to mark a baseline checkpoint");
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{NetworkConfig, Predicate};

    #[tokio::test]
    async fn test_runs_for_duration_and_ends() {
        let mut blueprint = BridgeBlueprint::new(
            Predicate::parse("type='MI' and name='NoSuchClassifier'").unwrap(),
            Predicate::parse("name='NoSuchMarkers'").unwrap(),
        );
        blueprint.network = NetworkConfig::loopback(41000, 8);

        let runner = SessionRunner::new(SessionConfig {
            blueprint,
            tick: Duration::from_millis(10),
            duration: Some(Duration::from_millis(200)),
            metrics_port: None,
        });
        let stats = runner.run(std::future::pending()).await.unwrap();

        assert_eq!(stats.final_state, SessionState::Ended);
        assert!(stats.metrics.total_ticks > 0);
        assert_eq!(stats.metrics.connected_ticks, 0);
        assert_eq!(stats.metrics.event_counts.get("ended"), Some(&1));
        // end marker pushed on the bridge's own outlet
        assert_eq!(stats.marker_outlet.map(|m| m.samples_pushed), Some(1));
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_runner() {
        let mut blueprint = BridgeBlueprint::new(
            Predicate::parse("name='Absent'").unwrap(),
            Predicate::parse("name='AlsoAbsent'").unwrap(),
        );
        blueprint.network = NetworkConfig::loopback(41020, 8);

        let runner = SessionRunner::new(SessionConfig {
            blueprint,
            tick: Duration::from_millis(10),
            duration: None,
            metrics_port: None,
        });
        let stats = runner
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(stats.final_state, SessionState::Ended);
    }
}
