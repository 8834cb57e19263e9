//! # Integration Tests
//!
//! Cross-crate end-to-end tests on loopback sockets.
//!
//! Covers:
//! - stream round trips through discovery, outlet and inlet
//! - loss detection and partial chunk reads
//! - bridge sessions built from a loaded configuration file

#[cfg(test)]
mod stream_tests {
    use std::time::Duration;

    use contracts::{
        ChannelFormat, InletConfig, NetworkConfig, OutletConfig, SampleValue, StreamDescriptor,
        IRREGULAR_RATE,
    };
    use discovery::{resolve_byprop, resolve_bypred};
    use transport::{StreamContext, StreamInlet, StreamOutlet};

    const WAIT: Duration = Duration::from_secs(2);

    fn context(base_port: u16) -> StreamContext {
        StreamContext::new(NetworkConfig::loopback(base_port, 8)).unwrap()
    }

    async fn resolve_one(ctx: &StreamContext, name: &str) -> StreamDescriptor {
        let mut found = resolve_byprop(ctx, "name", name, 1, WAIT).await.unwrap();
        assert_eq!(found.len(), 1, "expected exactly one '{name}'");
        found.remove(0)
    }

    /// Marker codes arrive in push order, one pull each
    #[tokio::test]
    async fn test_marker_codes_in_order() {
        let ctx = context(42000);
        let desc =
            StreamDescriptor::new("KartCues", "Markers", 1, IRREGULAR_RATE, ChannelFormat::Int32, "cues-01")
                .unwrap();
        let outlet = StreamOutlet::new(&ctx, desc, OutletConfig::default())
            .await
            .unwrap();

        let target = resolve_one(&ctx, "KartCues").await;
        let inlet = StreamInlet::new(&ctx, target, InletConfig::default()).unwrap();
        inlet.open_stream(WAIT).await.unwrap();
        assert!(outlet.wait_for_consumers(WAIT).await);

        let codes = [10i32, 0, 11, 99];
        for (i, code) in codes.iter().enumerate() {
            outlet
                .push_sample(&[*code], Some(100.0 + i as f64), true)
                .unwrap();
        }

        let mut received = Vec::new();
        let mut stamps = Vec::new();
        let mut buf = [0i32];
        for _ in 0..codes.len() {
            let ts = inlet.pull_sample(&mut buf, Duration::from_secs(1)).await.unwrap();
            received.push(buf[0]);
            stamps.push(ts);
        }
        assert_eq!(received, codes);
        assert!(stamps.windows(2).all(|w| w[0] < w[1]), "{stamps:?}");

        // nothing beyond the four
        assert_eq!(inlet.pull_sample(&mut buf, Duration::ZERO).await.unwrap(), 0.0);
    }

    /// A source without a source id cannot be recovered: the pull fails
    /// instead of waiting out its timeout
    #[tokio::test]
    async fn test_destroyed_source_is_lost() {
        let ctx = context(42010);
        let desc = StreamDescriptor::new("Transient", "MI", 1, 0.0, ChannelFormat::Float32, "").unwrap();
        let outlet = StreamOutlet::new(&ctx, desc, OutletConfig::default())
            .await
            .unwrap();

        let target = resolve_one(&ctx, "Transient").await;
        let config = InletConfig {
            recover: false,
            ..InletConfig::default()
        };
        let inlet = StreamInlet::new(&ctx, target, config).unwrap();
        inlet.open_stream(WAIT).await.unwrap();
        assert!(outlet.wait_for_consumers(WAIT).await);

        drop(outlet);

        let mut buf = [0.0f32];
        let started = std::time::Instant::now();
        let err = inlet
            .pull_sample(&mut buf, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_lost(), "got {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Without a source id even `recover = true` cannot re-resolve
    #[tokio::test]
    async fn test_no_source_id_defeats_recover() {
        let ctx = context(42020);
        let desc = StreamDescriptor::new("Anonymous", "MI", 1, 0.0, ChannelFormat::Float32, "").unwrap();
        let outlet = StreamOutlet::new(&ctx, desc, OutletConfig::default())
            .await
            .unwrap();

        let target = resolve_one(&ctx, "Anonymous").await;
        let inlet = StreamInlet::new(&ctx, target, InletConfig::default()).unwrap();
        inlet.open_stream(WAIT).await.unwrap();
        assert!(outlet.wait_for_consumers(WAIT).await);
        drop(outlet);

        let mut buf = [0.0f32];
        let err = inlet.pull_sample(&mut buf, WAIT).await.unwrap_err();
        assert!(err.is_lost(), "got {err}");
    }

    /// A zero-timeout chunk pull returns what is there and leaves the rest
    /// of the caller's buffer untouched
    #[tokio::test]
    async fn test_partial_chunk_without_waiting() {
        let ctx = context(42030);
        let desc = StreamDescriptor::new("Chunky", "MI", 1, 100.0, ChannelFormat::Double64, "chunky")
            .unwrap();
        let outlet = StreamOutlet::new(&ctx, desc, OutletConfig::default())
            .await
            .unwrap();

        let target = resolve_one(&ctx, "Chunky").await;
        let inlet = StreamInlet::new(&ctx, target, InletConfig::default()).unwrap();
        inlet.open_stream(WAIT).await.unwrap();
        assert!(outlet.wait_for_consumers(WAIT).await);

        for v in [1.0f64, 2.0, 3.0] {
            outlet.push_sample(&[v], None, true).unwrap();
        }
        for _ in 0..100 {
            if inlet.samples_available() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(inlet.samples_available(), 3);

        let mut data = [-7.0f64; 10];
        let mut stamps = [-7.0f64; 10];
        let n = inlet
            .pull_chunk(&mut data, &mut stamps, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(&data[..3], &[1.0, 2.0, 3.0]);
        assert!(data[3..].iter().all(|v| *v == -7.0));
        assert!(stamps[3..].iter().all(|v| *v == -7.0));
    }

    /// Predicate queries see published streams and ignore others
    #[tokio::test]
    async fn test_predicate_resolution() {
        let ctx = context(42040);
        let eeg = StreamDescriptor::new("Cap", "EEG", 8, 256.0, ChannelFormat::Float32, "cap").unwrap();
        let mi = StreamDescriptor::new("Classifier", "MI", 1, 16.0, ChannelFormat::Float32, "clf").unwrap();
        let _eeg = StreamOutlet::new(&ctx, eeg, OutletConfig::default()).await.unwrap();
        let _mi = StreamOutlet::new(&ctx, mi, OutletConfig::default()).await.unwrap();

        let found = resolve_bypred(&ctx, "type='EEG' and nominal_srate>100", 1, WAIT)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name(), "Cap");
        assert_eq!(found[0].channel_count(), 8);

        assert!(resolve_bypred(&ctx, "type=", 1, WAIT).await.is_err());
    }

    /// Push `rows` through a fresh outlet and inlet in the native encoding
    async fn carried<T>(ctx: &StreamContext, name: &str, rows: &[Vec<T>]) -> Vec<Vec<T>>
    where
        T: SampleValue + Default,
    {
        let channels = rows[0].len() as u32;
        let desc = StreamDescriptor::new(name, "Test", channels, IRREGULAR_RATE, T::FORMAT, name)
            .unwrap();
        let outlet = StreamOutlet::new(ctx, desc, OutletConfig::default())
            .await
            .unwrap();
        let inlet = StreamInlet::new(ctx, resolve_one(ctx, name).await, InletConfig::default())
            .unwrap();
        inlet.open_stream(WAIT).await.unwrap();
        assert!(outlet.wait_for_consumers(WAIT).await);

        for row in rows {
            outlet.push_sample(row, None, true).unwrap();
        }
        let mut received = Vec::new();
        for _ in rows {
            let (values, _) = inlet.pull_sample_owned::<T>(WAIT).await.unwrap().unwrap();
            received.push(values);
        }
        received
    }

    /// Integer and string encodings arrive bit-exact
    #[tokio::test]
    async fn test_exact_encodings_over_the_wire() {
        let ctx = context(42050);

        let big = vec![
            vec![(1i64 << 53) + 1, i64::MIN],
            vec![i64::MAX, -((1i64 << 53) + 3)],
        ];
        assert_eq!(carried(&ctx, "Wide", &big).await, big);

        let labels = vec![
            vec!["hold_left".to_string(), String::new()],
            vec!["größe, ✓".to_string(), "a\nb".to_string()],
        ];
        assert_eq!(carried(&ctx, "Labels", &labels).await, labels);

        let short = vec![vec![i16::MIN, i16::MAX, 0]];
        assert_eq!(carried(&ctx, "Short", &short).await, short);

        let tiny = vec![vec![i8::MIN], vec![i8::MAX]];
        assert_eq!(carried(&ctx, "Tiny", &tiny).await, tiny);
    }
}

#[cfg(test)]
mod bridge_tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bridge::{ExperimentBridge, SessionEvent, SessionState};
    use config_loader::ConfigLoader;
    use contracts::{
        BridgeBlueprint, ChannelFormat, InletConfig, OutletConfig, SteeringClass, StreamDescriptor,
        IRREGULAR_RATE,
    };
    use discovery::resolve_byprop;
    use observability::SessionMetricsAggregator;
    use transport::{StreamContext, StreamInlet, StreamOutlet};

    const WAIT: Duration = Duration::from_secs(2);

    fn lab_config(base_port: u16) -> String {
        format!(
            r#"
[network]
base_port = {base_port}
port_range = 8
known_peers = ["127.0.0.1"]
listen_address = "127.0.0.1"

[resolver]
probe_interval_ms = 20
forget_after_secs = 1.0

[signal]
query = "type='MI' and name='MIClassifier'"

[markers]
query = "type='Markers' and name='KartCues'"

[marker_outlet]
name = "KartEvents"
cue_codes = [{{ code = 21, class = "hold_right" }}]

[calibration]
enabled = true
baseline_delay_secs = 0.1
"#
        )
    }

    /// Blueprint loaded from a file on disk, as the binary does
    fn load(base_port: u16) -> BridgeBlueprint {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(lab_config(base_port).as_bytes()).unwrap();
        ConfigLoader::load_from_path(file.path()).unwrap()
    }

    struct Lab {
        ctx: StreamContext,
        signal: StreamOutlet,
        markers: StreamOutlet,
        bridge: ExperimentBridge,
        events: Arc<Mutex<Vec<SessionEvent>>>,
    }

    impl Lab {
        async fn new(base_port: u16) -> Self {
            let blueprint = load(base_port);
            let ctx = StreamContext::new(blueprint.network.clone()).unwrap();
            let signal = StreamDescriptor::new("MIClassifier", "MI", 1, 0.0, ChannelFormat::Float32, "clf")
                .unwrap();
            let markers =
                StreamDescriptor::new("KartCues", "Markers", 1, IRREGULAR_RATE, ChannelFormat::Int32, "cues")
                    .unwrap();
            let signal = StreamOutlet::new(&ctx, signal, OutletConfig::default())
                .await
                .unwrap();
            let markers = StreamOutlet::new(&ctx, markers, OutletConfig::default())
                .await
                .unwrap();

            let bridge = ExperimentBridge::new(&ctx, blueprint.to_bridge_config())
                .await
                .unwrap();
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            bridge.subscribe(move |event| sink.lock().unwrap().push(*event));

            Self {
                ctx,
                signal,
                markers,
                bridge,
                events,
            }
        }

        async fn tick_until(&mut self, done: impl Fn(&ExperimentBridge) -> bool) {
            for _ in 0..300 {
                self.bridge.tick().await.unwrap();
                if done(&self.bridge) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("condition not reached, state {}", self.bridge.state());
        }

        async fn start(&mut self) {
            self.tick_until(|b| b.state() == SessionState::AwaitingStart).await;
            assert!(self.markers.wait_for_consumers(WAIT).await);
            assert!(self.signal.wait_for_consumers(WAIT).await);
            self.markers.push_sample(&[1i32], None, true).unwrap();
            self.tick_until(|b| b.state() == SessionState::Running).await;
        }

        fn count(&self, event: SessionEvent) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| **e == event)
                .count()
        }
    }

    /// The start code moves an awaiting bridge to running, once
    #[tokio::test]
    async fn test_start_code_starts_once() {
        let mut lab = Lab::new(42100).await;
        assert_eq!(lab.bridge.state(), SessionState::Disconnected);

        lab.start().await;
        lab.markers.push_sample(&[1i32], None, true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        lab.bridge.tick().await.unwrap();

        assert_eq!(lab.count(SessionEvent::Started), 1);
        assert_eq!(lab.bridge.state(), SessionState::Running);
    }

    /// Steering is the signal value times (class index - 1)
    #[tokio::test]
    async fn test_steering_follows_class() {
        let mut lab = Lab::new(42120).await;
        lab.start().await;

        lab.markers.push_sample(&[11i32], None, true).unwrap();
        lab.signal.push_sample(&[0.6f32], None, true).unwrap();
        lab.tick_until(|b| {
            b.current_class() == Some(SteeringClass::HoldRight) && b.last_value().is_some()
        })
        .await;
        assert!((lab.bridge.steering() - 0.6).abs() < 1e-6);

        lab.markers.push_sample(&[10i32], None, true).unwrap();
        lab.tick_until(|b| b.current_class() == Some(SteeringClass::HoldLeft)).await;
        assert!((lab.bridge.steering() + 0.6).abs() < 1e-6);

        lab.markers.push_sample(&[0i32], None, true).unwrap();
        lab.tick_until(|b| b.current_class() == Some(SteeringClass::Rest)).await;
        assert_eq!(lab.bridge.steering(), 0.0);
    }

    /// Session markers are republished on the bridge's own outlet, stamped
    /// with seconds since session start
    #[tokio::test]
    async fn test_markers_republished() {
        let mut lab = Lab::new(42140).await;

        let mut found = resolve_byprop(&lab.ctx, "name", "KartEvents", 1, WAIT)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let listener = StreamInlet::new(&lab.ctx, found.remove(0), InletConfig::default()).unwrap();
        listener.open_stream(WAIT).await.unwrap();

        lab.start().await;
        lab.markers.push_sample(&[11i32], None, true).unwrap();
        lab.tick_until(|b| b.current_class() == Some(SteeringClass::HoldRight)).await;
        lab.markers.push_sample(&[99i32], None, true).unwrap();
        lab.tick_until(|b| b.state() == SessionState::Ended).await;

        let mut code = [0i32];
        let mut codes = Vec::new();
        let mut stamps = Vec::new();
        while let Some(ts) = listener.pull_sample_into(&mut code, WAIT).await.unwrap() {
            codes.push(code[0]);
            stamps.push(ts);
            if codes.len() == 3 {
                break;
            }
        }
        // start, cue (mapped to 21), end
        assert_eq!(codes, vec![1, 21, 99]);
        assert!(stamps[0] < 0.5, "{stamps:?}");
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "{stamps:?}");
    }

    /// End-of-trial code ends the session and drops every observer
    #[tokio::test]
    async fn test_end_code_ends_session() {
        let mut lab = Lab::new(42160).await;
        lab.start().await;

        lab.markers.push_sample(&[99i32], None, true).unwrap();
        lab.tick_until(|b| b.state() == SessionState::Ended).await;

        assert_eq!(lab.count(SessionEvent::Ended), 1);
        assert_eq!(lab.bridge.observer_count(), 0);

        // idempotent
        lab.bridge.end_session().unwrap();
        assert_eq!(lab.count(SessionEvent::Ended), 1);
        let report = lab.bridge.tick().await.unwrap();
        assert_eq!(report.state, SessionState::Ended);
        assert!(!report.connected);
    }

    /// Calibration checkpoint halts and a later tick resumes
    #[tokio::test]
    async fn test_calibration_checkpoint_resumes() {
        let mut lab = Lab::new(42180).await;
        lab.start().await;

        assert!(lab.bridge.checkpoint_reached().unwrap());
        assert_eq!(lab.count(SessionEvent::BaselineCheckpoint), 1);
        assert_eq!(lab.count(SessionEvent::BaselineAfter), 0);

        let events = Arc::clone(&lab.events);
        lab.tick_until(move |_| events.lock().unwrap().contains(&SessionEvent::BaselineAfter))
            .await;
        assert_eq!(lab.count(SessionEvent::BaselineAfter), 1);
    }

    /// Tick reports feed the session aggregator
    #[tokio::test]
    async fn test_session_metrics_from_ticks() {
        let mut lab = Lab::new(42200).await;
        lab.start().await;

        let mut aggregator = SessionMetricsAggregator::new();
        lab.markers.push_sample(&[10i32], None, true).unwrap();
        lab.signal.push_sample(&[0.5f32], None, true).unwrap();
        for _ in 0..100 {
            let report = lab.bridge.tick().await.unwrap();
            aggregator.update(&report, 0.1);
            if aggregator.total_markers >= 1 && aggregator.total_signal_samples >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(aggregator.total_markers, 1);
        assert_eq!(aggregator.total_signal_samples, 1);
        assert!(aggregator.connected_ticks >= 1);

        for event in lab.events.lock().unwrap().iter() {
            aggregator.record_event(event);
        }
        assert_eq!(aggregator.event_counts.get("started"), Some(&1));
        assert_eq!(aggregator.event_counts.get("cue"), Some(&1));
    }
}
