//! StreamInlet - receives samples of one resolved stream
//!
//! A reader task moves frames from the data connection into a local
//! drop-oldest buffer; pulls pop from that buffer. While the stream is open a
//! second task refreshes the clock offset every `time_update_interval`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use contracts::{
    read_frame, write_frame, InletConfig, PostProcessing, Predicate, Result, Sample, SampleValue,
    StreamDescriptor, StreamError, WireMessage, MAX_DATAGRAM_LEN,
};
use timesync::{best_of_wave, OffsetMeasurement, OffsetTracker, ProbeSample, TimestampPostProcessor};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::queue::{CloseReason, Pop, SampleQueue};
use crate::query::query_streams;
use crate::StreamContext;

/// How long one recovery query waits for the source to reappear
const RECOVERY_QUERY_WINDOW: Duration = Duration::from_secs(1);

/// Pause between failed reconnect attempts
const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);

/// Bound on the implicit first clock-offset wave of a CLOCKSYNC pull
const IMPLICIT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

struct InletShared {
    ctx: StreamContext,
    config: InletConfig,
    /// Latest known instance of the stream (address and uid move on recovery)
    descriptor: Mutex<StreamDescriptor>,
    /// Descriptor with `desc`, as sent by the outlet on connect
    full_info: Mutex<Option<StreamDescriptor>>,
    buffer: SampleQueue<Sample>,
    offset: Mutex<OffsetTracker>,
    /// Set by the reader after a silent reconnect
    reconnected: AtomicBool,
}

impl InletShared {
    fn descriptor(&self) -> StreamDescriptor {
        lock(&self.descriptor).clone()
    }

    fn name(&self) -> String {
        lock(&self.descriptor).name().to_string()
    }

    fn can_recover(&self) -> bool {
        self.config.recover && lock(&self.descriptor).has_source_id()
    }

    fn accept(&self, full: StreamDescriptor) {
        let mut descriptor = lock(&self.descriptor);
        let mut full = full;
        if let Some(address) = descriptor.v4address() {
            full.set_v4address(address);
        }
        *descriptor = full.without_desc();
        *lock(&self.full_info) = Some(full);
    }

    fn mark_lost(&self, why: &str) {
        let name = self.name();
        warn!(stream = %name, reason = why, "Stream lost");
        metrics::counter!("mibridge_inlet_lost_total").increment(1);
        self.buffer.close(CloseReason::Lost(name));
    }

    fn record_offset(&self, measurement: OffsetMeasurement) -> f64 {
        let correction = lock(&self.offset).update(measurement);
        metrics::gauge!("mibridge_time_correction_ms").set(correction * 1000.0);
        correction
    }

    /// Query for the same source and adopt the first instance that answers
    async fn re_resolve(&self) -> Result<()> {
        let current = self.descriptor();
        let predicate = Predicate::equals("source_id", current.source_id())?
            .and(&Predicate::equals("name", current.name())?)
            .and(&Predicate::equals("type", current.content_type())?);
        loop {
            let found = query_streams(&self.ctx, predicate.clone(), 1, RECOVERY_QUERY_WINDOW).await?;
            if let Some(next) = found.into_iter().next() {
                debug!(stream = %next.name(), uid = %next.uid(), "Source reappeared");
                *lock(&self.descriptor) = next;
                return Ok(());
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct InletTasks {
    reader: JoinHandle<()>,
    time_sync: JoinHandle<()>,
}

impl InletTasks {
    fn abort(&self) {
        self.reader.abort();
        self.time_sync.abort();
    }
}

/// Consumer-side handle of a stream
pub struct StreamInlet {
    shared: Arc<InletShared>,
    postproc: Mutex<TimestampPostProcessor>,
    tasks: Mutex<Option<InletTasks>>,
    /// Serializes opens
    open_lock: tokio::sync::Mutex<()>,
    /// Held for a whole pull when THREADSAFE is set
    pull_lock: tokio::sync::Mutex<()>,
}

impl StreamInlet {
    /// Inlet for a resolved stream; connects lazily.
    ///
    /// # Errors
    /// `ConfigValidation` for an invalid `config`.
    pub fn new(ctx: &StreamContext, descriptor: StreamDescriptor, config: InletConfig) -> Result<Self> {
        config.validate()?;
        let capacity = descriptor.buffer_capacity(config.max_buffered);
        let postproc = TimestampPostProcessor::new(config.postproc, descriptor.nominal_srate());
        Ok(Self {
            shared: Arc::new(InletShared {
                ctx: ctx.clone(),
                config,
                descriptor: Mutex::new(descriptor),
                full_info: Mutex::new(None),
                buffer: SampleQueue::new(capacity),
                offset: Mutex::new(OffsetTracker::new()),
                reconnected: AtomicBool::new(false),
            }),
            postproc: Mutex::new(postproc),
            tasks: Mutex::new(None),
            open_lock: tokio::sync::Mutex::new(()),
            pull_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Connect and subscribe; a no-op when already open.
    ///
    /// # Errors
    /// `Timeout` when the outlet does not answer in time, `Lost` when the
    /// stream is gone and cannot be recovered.
    #[instrument(
        name = "inlet_open_stream",
        skip(self),
        fields(stream = %self.shared.name())
    )]
    pub async fn open_stream(&self, timeout: Duration) -> Result<()> {
        let _open = self.open_lock.lock().await;
        if self.is_open() {
            return Ok(());
        }
        if let Some(CloseReason::Lost(stream)) = self.shared.buffer.close_reason() {
            return Err(StreamError::lost(stream));
        }
        if let Some(CloseReason::Internal(message)) = self.shared.buffer.close_reason() {
            return Err(StreamError::internal(message));
        }

        let deadline = deadline_after(timeout);
        let stream = establish(&self.shared, deadline, timeout).await?;

        self.shared.buffer.reset();
        lock(&self.postproc).reset();
        let reader = tokio::spawn(read_loop(Arc::clone(&self.shared), stream));
        let time_sync = tokio::spawn(time_sync_loop(Arc::clone(&self.shared)));
        if let Some(previous) = lock(&self.tasks).replace(InletTasks { reader, time_sync }) {
            previous.abort();
        }
        info!(uid = %self.shared.descriptor().uid(), "Inlet opened");
        Ok(())
    }

    /// Disconnect and drop buffered samples; idempotent
    pub fn close_stream(&self) {
        if let Some(tasks) = lock(&self.tasks).take() {
            tasks.abort();
            debug!(stream = %self.shared.name(), "Inlet closed");
        }
        self.shared.buffer.reset();
    }

    pub fn is_open(&self) -> bool {
        let tasks = lock(&self.tasks);
        match tasks.as_ref() {
            Some(tasks) => !tasks.reader.is_finished() && self.shared.buffer.close_reason().is_none(),
            None => false,
        }
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.shared.descriptor).channel_count()
    }

    /// Samples buffered locally
    pub fn samples_available(&self) -> usize {
        self.shared.buffer.len()
    }

    /// Full descriptor including `desc`, opening the stream if needed
    pub async fn info(&self, timeout: Duration) -> Result<StreamDescriptor> {
        if let Some(full) = lock(&self.shared.full_info).clone() {
            return Ok(full);
        }
        self.open_stream(timeout).await?;
        lock(&self.shared.full_info)
            .clone()
            .ok_or_else(|| StreamError::internal("stream opened without descriptor"))
    }

    /// Seconds to add to remote timestamps to express them in the local clock.
    ///
    /// The first call measures a probe wave; later calls return the filtered
    /// estimate maintained in the background.
    ///
    /// # Errors
    /// `Timeout` when no probe is answered within `timeout`.
    #[instrument(name = "inlet_time_correction", skip(self))]
    pub async fn time_correction(&self, timeout: Duration) -> Result<f64> {
        if let Some(correction) = lock(&self.shared.offset).correction() {
            return Ok(correction);
        }
        let endpoint = self
            .shared
            .descriptor()
            .service_endpoint()
            .ok_or_else(|| StreamError::lost("stream has no service endpoint"))?;
        let measurement = probe_wave(&self.shared.ctx, endpoint, timeout).await?;
        Ok(self.shared.record_offset(measurement))
    }

    /// Replace post-processing flags; filter state restarts
    pub fn set_postprocessing(&self, flags: PostProcessing) {
        lock(&self.postproc).set_flags(flags);
    }

    pub fn postprocessing(&self) -> PostProcessing {
        lock(&self.postproc).flags()
    }

    /// Pull one sample into `buf`.
    ///
    /// Returns the sample's timestamp, or `0.0` if nothing arrived within
    /// `timeout`.
    ///
    /// # Errors
    /// `Argument` on a buffer of the wrong length, `Lost` once the stream is
    /// gone and the buffer drained, `Internal` after a protocol error.
    pub async fn pull_sample<T: SampleValue>(&self, buf: &mut [T], timeout: Duration) -> Result<f64> {
        Ok(self.pull_sample_into(buf, timeout).await?.unwrap_or(0.0))
    }

    /// Like [`pull_sample`](Self::pull_sample), with `None` instead of the
    /// `0.0` sentinel so a sample stamped exactly zero stays visible.
    pub async fn pull_sample_into<T: SampleValue>(
        &self,
        buf: &mut [T],
        timeout: Duration,
    ) -> Result<Option<f64>> {
        self.check_len(buf.len())?;
        let deadline = deadline_after(timeout);
        let _serial = self.serialize_pull().await;
        let Some(sample) = self.next_sample(timeout).await? else {
            return Ok(None);
        };
        sample.data.decode_into(buf)?;
        Ok(Some(self.stamp(sample.timestamp, probe_budget(deadline)).await))
    }

    /// Pull one sample into a fresh vector
    pub async fn pull_sample_owned<T: SampleValue + Default>(
        &self,
        timeout: Duration,
    ) -> Result<Option<(Vec<T>, f64)>> {
        let mut buf = vec![T::default(); self.shared.descriptor().channel_count()];
        let timestamp = self.pull_sample_into(&mut buf, timeout).await?;
        Ok(timestamp.map(|ts| (buf, ts)))
    }

    /// Pull as many whole samples as fit, channel-interleaved into `data`.
    ///
    /// Waits up to `timeout` for the first sample, then takes what is
    /// buffered. Slots past the returned count are left untouched.
    pub async fn pull_chunk<T: SampleValue>(
        &self,
        data: &mut [T],
        timestamps: &mut [f64],
        timeout: Duration,
    ) -> Result<usize> {
        let channels = self.shared.descriptor().channel_count();
        let mut capacity = (data.len() / channels).min(timestamps.len());
        if self.shared.config.max_chunk_len > 0 {
            capacity = capacity.min(self.shared.config.max_chunk_len);
        }
        if capacity == 0 {
            return Ok(0);
        }

        let deadline = deadline_after(timeout);
        let _serial = self.serialize_pull().await;
        let mut filled = 0;
        while filled < capacity {
            let wait = if filled == 0 { timeout } else { Duration::ZERO };
            let sample = match self.next_sample(wait).await {
                Ok(Some(sample)) => sample,
                Ok(None) => break,
                Err(e) if filled > 0 && e.is_lost() => break,
                Err(e) => return Err(e),
            };
            let slot = &mut data[filled * channels..(filled + 1) * channels];
            sample.data.decode_into(slot)?;
            // only the first sample of a chunk may wait for an offset probe
            let budget = if filled == 0 { probe_budget(deadline) } else { Duration::ZERO };
            timestamps[filled] = self.stamp(sample.timestamp, budget).await;
            filled += 1;
        }
        Ok(filled)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        self.shared.descriptor().check_channel_count(len)
    }

    async fn serialize_pull(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if self.postprocessing().contains(PostProcessing::THREADSAFE) {
            Some(self.pull_lock.lock().await)
        } else {
            None
        }
    }

    async fn next_sample(&self, timeout: Duration) -> Result<Option<Sample>> {
        if !self.is_open() && self.shared.buffer.is_empty() {
            self.open_stream(timeout).await?;
        }
        match self.shared.buffer.pop_timeout(timeout).await {
            Pop::Item(sample) => {
                metrics::counter!("mibridge_samples_pulled_total").increment(1);
                Ok(Some(sample))
            }
            Pop::Empty => Ok(None),
            Pop::Closed(CloseReason::Lost(stream)) => Err(StreamError::lost(stream)),
            Pop::Closed(CloseReason::Internal(message)) => Err(StreamError::internal(message)),
            Pop::Closed(CloseReason::Shutdown) => Ok(None),
        }
    }

    /// Post-process a remote timestamp. Without a cached clock offset,
    /// CLOCKSYNC probes the outlet for at most `budget`.
    async fn stamp(&self, timestamp: f64, budget: Duration) -> f64 {
        let flags = self.postprocessing();
        let mut correction = None;
        if flags.contains(PostProcessing::CLOCKSYNC) {
            correction = lock(&self.shared.offset).correction();
            if correction.is_none() && !budget.is_zero() {
                correction = self.time_correction(budget).await.ok();
            }
        }
        let mut postproc = lock(&self.postproc);
        if self.shared.reconnected.swap(false, Ordering::AcqRel) {
            postproc.reset();
        }
        postproc.process(timestamp, correction)
    }
}

impl Drop for StreamInlet {
    fn drop(&mut self) {
        if let Some(tasks) = lock(&self.tasks).take() {
            tasks.abort();
        }
    }
}

/// Time left for an implicit offset probe before the pull's deadline
fn probe_budget(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .min(IMPLICIT_PROBE_TIMEOUT)
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + contracts::FOREVER)
}

/// Connect and subscribe, re-resolving the source when allowed
async fn establish(shared: &InletShared, deadline: Instant, timeout: Duration) -> Result<TcpStream> {
    loop {
        let target = shared.descriptor();
        let attempt =
            tokio::time::timeout_at(deadline, subscribe(&target, shared.config.max_buffered)).await;
        match attempt {
            Err(_) => return Err(StreamError::timeout("inlet_open_stream", timeout)),
            Ok(Ok((stream, full))) => {
                shared.accept(full);
                return Ok(stream);
            }
            Ok(Err(e)) if e.is_lost() && shared.can_recover() => {
                debug!(error = %e, "Subscribe failed, re-resolving source");
                match tokio::time::timeout_at(deadline, shared.re_resolve()).await {
                    Err(_) => return Err(StreamError::timeout("inlet_open_stream", timeout)),
                    Ok(result) => result?,
                }
            }
            Ok(Err(e)) => return Err(e),
        }
    }
}

/// One subscription handshake against the instance in `target`
async fn subscribe(target: &StreamDescriptor, max_buffered: f64) -> Result<(TcpStream, StreamDescriptor)> {
    let endpoint = target
        .data_endpoint()
        .ok_or_else(|| StreamError::lost(format!("stream '{}' has no data endpoint", target.name())))?;
    let mut stream = TcpStream::connect(endpoint)
        .await
        .map_err(|e| StreamError::lost(format!("{} at {endpoint}: {e}", target.name())))?;
    let _ = stream.set_nodelay(true);

    write_frame(
        &mut stream,
        &WireMessage::Subscribe {
            uid: target.uid().clone(),
            max_buffered,
        },
    )
    .await?;

    match read_frame(&mut stream).await {
        Ok(Some(WireMessage::Accepted { descriptor })) => Ok((stream, descriptor)),
        Ok(Some(WireMessage::Rejected { reason })) => Err(StreamError::lost(reason)),
        Ok(Some(other)) => Err(StreamError::internal(format!(
            "expected accepted, got {}",
            other.kind()
        ))),
        Ok(None) | Err(StreamError::Io(_)) => Err(StreamError::lost(format!(
            "{} closed during handshake",
            target.name()
        ))),
        Err(e) => Err(e),
    }
}

#[instrument(name = "inlet_reader", skip_all, fields(stream = %shared.name()))]
async fn read_loop(shared: Arc<InletShared>, mut stream: TcpStream) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Some(WireMessage::Samples(samples))) => {
                let dropped = shared.buffer.extend(samples);
                if dropped > 0 {
                    debug!(dropped, "Inlet buffer full, oldest samples dropped");
                }
            }
            Ok(Some(other)) => {
                error!(kind = other.kind(), "Unexpected message on data connection");
                shared
                    .buffer
                    .close(CloseReason::Internal(format!("unexpected {}", other.kind())));
                return;
            }
            Ok(None) | Err(StreamError::Io(_)) => {
                if !shared.can_recover() {
                    shared.mark_lost("connection closed");
                    return;
                }
                match reconnect(&shared).await {
                    Ok(next) => stream = next,
                    Err(e) => {
                        shared.mark_lost(&e.to_string());
                        return;
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Corrupt data on stream, closing inlet");
                shared.buffer.close(CloseReason::Internal(e.to_string()));
                return;
            }
        }
    }
}

/// Re-resolve and subscribe until the source is back
async fn reconnect(shared: &InletShared) -> Result<TcpStream> {
    info!("Connection dropped, waiting for the source to come back");
    loop {
        shared.re_resolve().await?;
        let target = shared.descriptor();
        match subscribe(&target, shared.config.max_buffered).await {
            Ok((stream, full)) => {
                shared.accept(full);
                *lock(&shared.offset) = OffsetTracker::new();
                shared.reconnected.store(true, Ordering::Release);
                info!(uid = %target.uid(), "Stream recovered");
                return Ok(stream);
            }
            Err(e) if e.is_lost() => {
                trace!(error = %e, "Reconnect attempt failed");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn time_sync_loop(shared: Arc<InletShared>) {
    let period = shared.ctx.network().time_update_interval();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(endpoint) = shared.descriptor().service_endpoint() else {
            continue;
        };
        match probe_wave(&shared.ctx, endpoint, period).await {
            Ok(measurement) => {
                shared.record_offset(measurement);
            }
            Err(e) => trace!(error = %e, "Time probe wave unanswered"),
        }
    }
}

/// Send a burst of time probes and keep the best answer
async fn probe_wave(ctx: &StreamContext, endpoint: SocketAddr, timeout: Duration) -> Result<OffsetMeasurement> {
    let local = match endpoint.ip() {
        IpAddr::V4(ip) if ip.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
    let count = ctx.network().time_probe_count.max(1);

    for probe_id in 0..count as u64 {
        let probe = WireMessage::TimeProbe {
            probe_id,
            t0: ctx.now(),
        };
        if let Err(e) = socket.send_to(&probe.to_datagram()?, endpoint).await {
            trace!(error = %e, "Time probe send failed");
        }
    }

    let deadline = deadline_after(timeout);
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let mut samples = Vec::with_capacity(count);
    while samples.len() < count {
        let (len, _) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Err(e)) => {
                trace!(error = %e, "Time probe recv failed");
                continue;
            }
            Ok(Ok(received)) => received,
        };
        let t3 = ctx.now();
        if let Ok(WireMessage::TimeReply { t0, t1, t2, .. }) = WireMessage::from_datagram(&buf[..len]) {
            samples.push(ProbeSample { t0, t1, t2, t3 });
        }
    }

    best_of_wave(&samples).ok_or_else(|| StreamError::timeout("time_probe_wave", timeout))
}
