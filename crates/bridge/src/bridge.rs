//! ExperimentBridge - per-tick glue between the lab streams and the game
//!
//! Each `tick()` fires due scheduled actions, binds missing inlets from the
//! resolver snapshot, drains the marker inlet (each marker handled once) and
//! the signal inlet (newest value wins), then recomputes steering and the
//! connectivity flag.

use std::time::Duration;

use contracts::{
    BridgeConfig, ChannelSpec, InletConfig, ObserverRegistry, Predicate, SteeringClass,
    StreamDescriptor, StreamError, SubscriptionId,
};
use discovery::ContinuousResolver;
use tracing::{debug, error, info, instrument, warn};
use transport::{OutletMetricsSnapshot, StreamContext, StreamInlet, StreamOutlet};

use crate::error::BridgeError;
use crate::scheduler::{ScheduledAction, Scheduler};
use crate::session::{SessionEvent, SessionState, TickReport};

/// Time a tick may spend connecting a newly resolved stream
pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Signal,
    Markers,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Signal => "signal",
            Role::Markers => "markers",
        }
    }
}

pub struct ExperimentBridge {
    ctx: StreamContext,
    config: BridgeConfig,
    resolver: ContinuousResolver,
    signal: Option<StreamInlet>,
    markers: Option<StreamInlet>,
    outlet: StreamOutlet,
    observers: ObserverRegistry<SessionEvent>,
    scheduler: Scheduler,
    bind_timeout: Duration,

    state: SessionState,
    current_class: Option<SteeringClass>,
    last_value: Option<f64>,
    steering: f64,
    connected: bool,
    /// Clock time the start code arrived
    session_start: Option<f64>,
}

impl ExperimentBridge {
    /// Start discovery and publish the outgoing marker stream.
    ///
    /// # Errors
    /// Invalid resolver or outlet settings, or sockets that cannot be bound.
    #[instrument(name = "bridge_new", skip_all)]
    pub async fn new(ctx: &StreamContext, config: BridgeConfig) -> Result<Self, BridgeError> {
        let query = combined_query(&config.signal.query, &config.markers.query);
        let resolver = ContinuousResolver::new(ctx, &query, config.resolver.clone()).await?;

        let mut descriptor = config.marker_outlet.descriptor()?;
        descriptor
            .desc_mut()
            .append_channels(&[ChannelSpec::new("marker", "code", "Marker")])?;
        let outlet = StreamOutlet::new(ctx, descriptor, config.marker_outlet.outlet.clone()).await?;

        info!(
            query = %query,
            outlet = %config.marker_outlet.name,
            calibration = config.calibration.enabled,
            "Experiment bridge ready"
        );

        Ok(Self {
            ctx: ctx.clone(),
            config,
            resolver,
            signal: None,
            markers: None,
            outlet,
            observers: ObserverRegistry::new(),
            scheduler: Scheduler::new(),
            bind_timeout: DEFAULT_BIND_TIMEOUT,
            state: SessionState::Disconnected,
            current_class: None,
            last_value: None,
            steering: 0.0,
            connected: false,
            session_start: None,
        })
    }

    pub fn set_bind_timeout(&mut self, timeout: Duration) {
        self.bind_timeout = timeout;
    }

    // ========== Read accessors ==========

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Scaled steering value; not clamped
    pub fn steering(&self) -> f64 {
        self.steering
    }

    /// True iff a fresh sample arrived on the latest tick
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn current_class(&self) -> Option<SteeringClass> {
        self.current_class
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }

    /// Seconds since the start code arrived, 0 before that
    pub fn session_elapsed(&self) -> f64 {
        self.session_start
            .map(|start| (self.ctx.now() - start).max(0.0))
            .unwrap_or(0.0)
    }

    pub fn is_bound(&self) -> bool {
        self.signal.is_some() && self.markers.is_some()
    }

    /// Descriptor of the outgoing marker stream
    pub fn marker_outlet_info(&self) -> StreamDescriptor {
        self.outlet.info()
    }

    pub fn marker_outlet_metrics(&self) -> OutletMetricsSnapshot {
        self.outlet.metrics()
    }

    // ========== Observers ==========

    pub fn subscribe(
        &self,
        callback: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    // ========== Tick ==========

    /// One poll step.
    ///
    /// Timeouts and lost streams are absorbed here; only programming defects
    /// (buffer or channel mismatches) are returned.
    pub async fn tick(&mut self) -> Result<TickReport, BridgeError> {
        let mut report = TickReport {
            state: self.state,
            ..TickReport::default()
        };
        if self.state == SessionState::Ended {
            self.connected = false;
            report.steering = self.steering;
            return Ok(report);
        }

        for action in self.scheduler.take_due(self.ctx.now()) {
            self.fire(action);
        }

        self.bind_inlets().await?;

        report.markers_processed = self.drain_markers().await?;
        if self.state != SessionState::Ended {
            report.signal_samples = self.drain_signal().await?;
        }

        self.connected = report.markers_processed > 0 || report.signal_samples > 0;
        self.steering = self.compute_steering();
        metrics::gauge!("mibridge_bridge_steering").set(self.steering);

        report.state = self.state;
        report.connected = self.connected;
        report.steering = self.steering;
        Ok(report)
    }

    fn compute_steering(&self) -> f64 {
        let value = self.last_value.unwrap_or(0.0);
        match self.current_class {
            Some(class) => value * class.steering_factor(),
            None => value,
        }
    }

    async fn bind_inlets(&mut self) -> Result<(), BridgeError> {
        if self.is_bound() {
            return Ok(());
        }
        let own_uid = self.outlet.info().uid().clone();
        let streams: Vec<StreamDescriptor> = self
            .resolver
            .results()
            .into_iter()
            .filter(|d| *d.uid() != own_uid)
            .collect();

        if self.signal.is_none() {
            let selector = self.config.signal.clone();
            if let Some(found) = pick(&streams, &selector.query) {
                if selector.channel >= found.channel_count() {
                    return Err(BridgeError::ChannelOutOfRange {
                        stream: found.name().to_string(),
                        channel: selector.channel,
                        channels: found.channel_count(),
                    });
                }
                self.signal = self.open_inlet(Role::Signal, found, &selector.inlet).await?;
            }
        }
        if self.markers.is_none() {
            let selector = self.config.markers.clone();
            if let Some(found) = pick(&streams, &selector.query) {
                self.markers = self.open_inlet(Role::Markers, found, &selector.inlet).await?;
            }
        }

        if self.is_bound() && self.state == SessionState::Disconnected {
            self.state = SessionState::AwaitingStart;
            info!("Both streams bound, awaiting start code");
        }
        Ok(())
    }

    #[instrument(
        name = "bridge_open_inlet",
        skip(self, descriptor, config),
        fields(role = role.as_str(), stream = %descriptor.name())
    )]
    async fn open_inlet(
        &self,
        role: Role,
        descriptor: StreamDescriptor,
        config: &InletConfig,
    ) -> Result<Option<StreamInlet>, BridgeError> {
        let inlet = StreamInlet::new(&self.ctx, descriptor, config.clone())?;
        match inlet.open_stream(self.bind_timeout).await {
            Ok(()) => {
                info!("Inlet bound");
                Ok(Some(inlet))
            }
            Err(e) if e.is_recoverable() => {
                debug!(error = %e, "Stream not reachable yet");
                Ok(None)
            }
            Err(e @ StreamError::Argument { .. }) => Err(e.into()),
            Err(e) => {
                error!(error = %e, "Opening inlet failed");
                Ok(None)
            }
        }
    }

    async fn drain_markers(&mut self) -> Result<usize, BridgeError> {
        // markers stay buffered until both streams are bound
        if self.state == SessionState::Disconnected {
            return Ok(0);
        }
        let Some(inlet) = &self.markers else {
            return Ok(0);
        };

        let mut codes = Vec::new();
        let mut failure = None;
        let mut code = [0i32];
        loop {
            match inlet.pull_sample_into(&mut code, Duration::ZERO).await {
                Ok(Some(_)) => codes.push(code[0]),
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        for &code in &codes {
            self.handle_marker(code)?;
            if self.state == SessionState::Ended {
                break;
            }
        }
        if let Some(e) = failure {
            self.handle_inlet_error(Role::Markers, e)?;
        }
        Ok(codes.len())
    }

    async fn drain_signal(&mut self) -> Result<usize, BridgeError> {
        let Some(inlet) = &self.signal else {
            return Ok(0);
        };
        let channel = self.config.signal.channel;
        let mut buf = vec![0.0f64; inlet.channel_count()];

        let mut received = 0;
        let mut newest = None;
        let mut failure = None;
        loop {
            match inlet.pull_sample_into(&mut buf, Duration::ZERO).await {
                Ok(Some(_)) => {
                    received += 1;
                    newest = Some(buf[channel]);
                }
                Ok(None) => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if newest.is_some() {
            self.last_value = newest;
        }
        if let Some(e) = failure {
            self.handle_inlet_error(Role::Signal, e)?;
        }
        Ok(received)
    }

    fn handle_marker(&mut self, code: i32) -> Result<(), BridgeError> {
        match self.state {
            SessionState::AwaitingStart if code == self.config.codes.start_code => {
                self.start_session()
            }
            SessionState::AwaitingStart => {
                debug!(code, "Marker ignored before session start");
                Ok(())
            }
            SessionState::Running => match self.config.codes.class_for(code) {
                Some(SteeringClass::EndOfTrial) => self.end_session(),
                Some(class) => self.cue(class),
                None => {
                    debug!(code, "Unmapped marker code");
                    Ok(())
                }
            },
            SessionState::Disconnected | SessionState::Ended => Ok(()),
        }
    }

    fn start_session(&mut self) -> Result<(), BridgeError> {
        self.session_start = Some(self.ctx.now());
        self.state = SessionState::Running;
        self.push_marker(self.config.marker_outlet.session_start_code)?;
        metrics::counter!("mibridge_bridge_sessions_total").increment(1);
        info!("Session started");
        self.observers.notify(&SessionEvent::Started);
        Ok(())
    }

    fn cue(&mut self, class: SteeringClass) -> Result<(), BridgeError> {
        self.current_class = Some(class);
        if let Some(code) = self
            .config
            .marker_outlet
            .cue_code(class, &self.config.codes)
        {
            self.push_marker(code)?;
        }
        debug!(class = %class, "Cue");
        self.observers.notify(&SessionEvent::Cue(class));
        Ok(())
    }

    /// End the session: push the end marker, notify, drop every observer.
    ///
    /// Repeated calls do nothing.
    pub fn end_session(&mut self) -> Result<(), BridgeError> {
        if self.state == SessionState::Ended {
            return Ok(());
        }
        self.push_marker(self.config.marker_outlet.session_end_code)?;
        self.state = SessionState::Ended;
        self.scheduler.cancel_all();
        self.connected = false;
        info!(elapsed = self.session_elapsed(), "Session ended");
        self.observers.notify(&SessionEvent::Ended);
        self.observers.clear();
        Ok(())
    }

    /// Calibration checkpoint: halt, mark the trial start and schedule the
    /// resume event.
    ///
    /// Returns `false` when calibration is disabled or no session is running.
    pub fn checkpoint_reached(&mut self) -> Result<bool, BridgeError> {
        if !self.config.calibration.enabled || self.state != SessionState::Running {
            return Ok(false);
        }
        self.observers.notify(&SessionEvent::BaselineCheckpoint);
        self.push_marker(self.config.marker_outlet.trial_start_code)?;
        let deadline = self.ctx.now() + self.config.calibration.baseline_delay_secs;
        self.scheduler
            .schedule(deadline, ScheduledAction::BaselineAfter);
        debug!(deadline, "Baseline checkpoint");
        Ok(true)
    }

    fn fire(&mut self, action: ScheduledAction) {
        match action {
            ScheduledAction::BaselineAfter => {
                debug!("Baseline window over");
                self.observers.notify(&SessionEvent::BaselineAfter);
            }
        }
    }

    fn push_marker(&self, code: i32) -> Result<(), BridgeError> {
        self.outlet
            .push_sample(&[code], Some(self.session_elapsed()), true)?;
        Ok(())
    }

    fn handle_inlet_error(&mut self, role: Role, e: StreamError) -> Result<(), BridgeError> {
        match e {
            StreamError::Timeout { .. } => return Ok(()),
            StreamError::Lost { .. } => {
                warn!(role = role.as_str(), error = %e, "Stream lost, unbinding");
            }
            StreamError::Internal { .. } | StreamError::Codec(_) | StreamError::Io(_) => {
                error!(role = role.as_str(), error = %e, "Stream failed, unbinding");
            }
            other => return Err(other.into()),
        }
        match role {
            Role::Signal => self.signal = None,
            Role::Markers => self.markers = None,
        }
        if self.state == SessionState::AwaitingStart {
            self.state = SessionState::Disconnected;
        }
        Ok(())
    }
}

/// Resolver query covering both selectors
fn combined_query(signal: &Predicate, markers: &Predicate) -> String {
    if signal.as_str().is_empty() || markers.as_str().is_empty() {
        String::new()
    } else {
        format!("({signal}) or ({markers})")
    }
}

/// First stream matching `query`, by (name, type)
fn pick(streams: &[StreamDescriptor], query: &Predicate) -> Option<StreamDescriptor> {
    streams.iter().find(|d| d.matches_query(query)).cloned()
}
