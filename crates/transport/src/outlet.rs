//! StreamOutlet - publishes samples under a descriptor
//!
//! Every consumer connection gets its own session: a drop-oldest backlog and a
//! worker task writing frames to the socket. Pushing never waits on a
//! consumer; a slow consumer only loses its own oldest samples.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use contracts::{
    read_frame, write_frame, OutletConfig, Result, Sample, SampleData, SampleValue,
    StreamDescriptor, StreamError, StreamUid, WireMessage,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::metrics::{OutletMetrics, OutletMetricsSnapshot};
use crate::queue::{CloseReason, SampleQueue};
use crate::{service, StreamContext};

/// Deadline for a new connection to send its subscription
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Most samples written in one frame
const MAX_FRAME_SAMPLES: usize = 1024;

/// Timestamps of a pushed chunk
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkTimestamps {
    /// Stamp with the current clock reading, as a single timestamp
    Now,
    /// Timestamp of the last sample; earlier ones are deduced from the rate
    Single(f64),
    /// One timestamp per sample
    PerSample(Vec<f64>),
}

struct Session {
    peer: SocketAddr,
    queue: Arc<SampleQueue<Sample>>,
}

struct OutletShared {
    descriptor: Arc<StreamDescriptor>,
    max_buffered: f64,
    sessions: Mutex<HashMap<u64, Session>>,
    /// Connection tasks, aborted on teardown
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_session: AtomicU64,
    consumers: watch::Sender<usize>,
    metrics: OutletMetrics,
}

impl OutletShared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_session(&self, id: u64, session: Session) {
        let count = {
            let mut sessions = self.sessions();
            sessions.insert(id, session);
            sessions.len()
        };
        self.metrics.consumer_connected();
        self.consumers.send_replace(count);
    }

    fn remove_session(&self, id: u64) {
        let removed = {
            let mut sessions = self.sessions();
            sessions.remove(&id).map(|s| (s, sessions.len()))
        };
        if let Some((session, count)) = removed {
            session.queue.close(CloseReason::Shutdown);
            self.metrics.consumer_disconnected();
            self.consumers.send_replace(count);
            debug!(peer = %session.peer, consumers = count, "Consumer detached");
        }
        self.tasks().remove(&id);
    }

    fn broadcast(&self, samples: &[Sample]) {
        let sessions = self.sessions();
        for session in sessions.values() {
            let dropped = session.queue.extend(samples.iter().cloned());
            if dropped > 0 {
                self.metrics.add_dropped(dropped);
                warn!(peer = %session.peer, dropped, "Consumer backlog full, oldest samples dropped");
            }
        }
    }
}

/// Producer-side handle of a stream
pub struct StreamOutlet {
    ctx: StreamContext,
    config: OutletConfig,
    shared: Arc<OutletShared>,
    pending: Mutex<Vec<Sample>>,
    service_task: JoinHandle<()>,
    accept_task: JoinHandle<()>,
}

impl StreamOutlet {
    /// Publish a stream.
    ///
    /// # Errors
    /// `ConfigValidation` for an invalid `config`, `Internal` / `Io` when
    /// sockets cannot be bound.
    #[instrument(
        name = "outlet_new",
        skip(ctx, descriptor, config),
        fields(stream = %descriptor.name())
    )]
    pub async fn new(
        ctx: &StreamContext,
        descriptor: StreamDescriptor,
        config: OutletConfig,
    ) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(SocketAddr::new(ctx.network().listen_address, 0)).await?;
        let service_socket = service::bind_service_socket(ctx).await?;

        let mut descriptor = descriptor;
        descriptor.publish_as(
            StreamUid::generate(),
            ctx.hostname(),
            ctx.now(),
            listener.local_addr()?.port(),
            service_socket.local_addr()?.port(),
        );
        let listen_address = ctx.network().listen_address;
        if !listen_address.is_unspecified() {
            descriptor.set_v4address(listen_address);
        }
        let descriptor = Arc::new(descriptor);

        let (consumers, _) = watch::channel(0usize);
        let shared = Arc::new(OutletShared {
            descriptor: Arc::clone(&descriptor),
            max_buffered: config.max_buffered,
            sessions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            consumers,
            metrics: OutletMetrics::new(),
        });

        let service_task = tokio::spawn(service::serve(
            ctx.clone(),
            service_socket,
            Arc::clone(&descriptor),
        ));
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));

        info!(
            stream = %descriptor.name(),
            uid = %descriptor.uid(),
            data_port = descriptor.data_port(),
            service_port = descriptor.service_port(),
            "Outlet published"
        );

        Ok(Self {
            ctx: ctx.clone(),
            config,
            shared,
            pending: Mutex::new(Vec::new()),
            service_task,
            accept_task,
        })
    }

    /// Descriptor as published (uid, ports and hostname filled in)
    pub fn info(&self) -> StreamDescriptor {
        (*self.shared.descriptor).clone()
    }

    fn descriptor(&self) -> &StreamDescriptor {
        &self.shared.descriptor
    }

    pub fn metrics(&self) -> OutletMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn have_consumers(&self) -> bool {
        *self.shared.consumers.borrow() > 0
    }

    /// Wait until at least one consumer is attached; `false` on timeout
    pub async fn wait_for_consumers(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.consumers.subscribe();
        let attached = tokio::time::timeout(timeout, rx.wait_for(|n| *n > 0))
            .await
            .is_ok_and(|waited| waited.is_ok());
        attached
    }

    /// Push one sample.
    ///
    /// `timestamp` defaults to the context clock. With `pushthrough` the
    /// sample is sent at once; otherwise it may wait until `chunk_size`
    /// samples are pending.
    ///
    /// # Errors
    /// `Argument` if `values.len()` differs from the channel count or the
    /// value type cannot be converted to the stream's format.
    pub fn push_sample<T: SampleValue>(
        &self,
        values: &[T],
        timestamp: Option<f64>,
        pushthrough: bool,
    ) -> Result<()> {
        let sample = self.encode(values, timestamp.unwrap_or_else(|| self.ctx.now()))?;
        self.enqueue(vec![sample], pushthrough);
        Ok(())
    }

    /// Push several samples, one row per sample.
    ///
    /// All rows are checked before anything is queued.
    #[instrument(name = "outlet_push_chunk", skip_all, fields(rows = rows.len()))]
    pub fn push_chunk<T: SampleValue>(
        &self,
        rows: &[Vec<T>],
        timestamps: ChunkTimestamps,
        pushthrough: bool,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let stamps = self.chunk_timestamps(rows.len(), timestamps)?;
        let samples = rows
            .iter()
            .zip(stamps)
            .map(|(row, ts)| self.encode(row, ts))
            .collect::<Result<Vec<_>>>()?;
        self.enqueue(samples, pushthrough);
        Ok(())
    }

    /// Push a flat channel-interleaved buffer
    pub fn push_chunk_multiplexed<T: SampleValue>(
        &self,
        data: &[T],
        timestamps: ChunkTimestamps,
        pushthrough: bool,
    ) -> Result<()> {
        let channels = self.descriptor().channel_count();
        if data.len() % channels != 0 {
            return Err(StreamError::argument(format!(
                "buffer of {} values is not a multiple of {channels} channels",
                data.len()
            )));
        }
        let rows: Vec<Vec<T>> = data.chunks(channels).map(<[T]>::to_vec).collect();
        self.push_chunk(&rows, timestamps, pushthrough)
    }

    /// Send whatever is pending
    pub fn flush(&self) {
        self.enqueue(Vec::new(), true);
    }

    fn encode<T: SampleValue>(&self, values: &[T], timestamp: f64) -> Result<Sample> {
        let descriptor = self.descriptor();
        descriptor.check_channel_count(values.len())?;
        Ok(Sample {
            timestamp,
            data: SampleData::encode(values, descriptor.channel_format())?,
        })
    }

    fn chunk_timestamps(&self, n: usize, timestamps: ChunkTimestamps) -> Result<Vec<f64>> {
        let last = match timestamps {
            ChunkTimestamps::PerSample(stamps) => {
                if stamps.len() != n {
                    return Err(StreamError::argument(format!(
                        "{} timestamps given for {n} samples",
                        stamps.len()
                    )));
                }
                return Ok(stamps);
            }
            ChunkTimestamps::Single(t) => t,
            ChunkTimestamps::Now => self.ctx.now(),
        };
        Ok(deduce_timestamps(last, n, self.descriptor().sample_interval()))
    }

    fn enqueue(&self, samples: Vec<Sample>, pushthrough: bool) {
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let count = samples.len() as u64;
            pending.extend(samples);
            self.shared.metrics.add_pushed(count);
            if pending.is_empty()
                || !(pushthrough || pending.len() >= self.config.chunk_size.max(1))
            {
                return;
            }
            std::mem::take(&mut *pending)
        };
        self.shared.broadcast(&batch);
    }
}

/// Timestamps for `n` samples whose last one is stamped `last`.
///
/// Irregular streams share the timestamp; regular ones step back one period
/// per sample.
pub fn deduce_timestamps(last: f64, n: usize, interval: Option<f64>) -> Vec<f64> {
    match interval {
        None => vec![last; n],
        Some(period) => (0..n)
            .map(|i| last - (n - 1 - i) as f64 * period)
            .collect(),
    }
}

impl Drop for StreamOutlet {
    fn drop(&mut self) {
        self.service_task.abort();
        self.accept_task.abort();
        for (_, task) in self.shared.tasks().drain() {
            task.abort();
        }
        for (_, session) in self.shared.sessions().drain() {
            session.queue.close(CloseReason::Shutdown);
        }
        debug!(stream = %self.shared.descriptor.name(), "Outlet torn down");
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<OutletShared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let id = shared.next_session.fetch_add(1, Ordering::Relaxed);
        let mut tasks = shared.tasks();
        let task = tokio::spawn(serve_consumer(stream, peer, id, Arc::clone(&shared)));
        tasks.insert(id, task);
    }
}

/// Handshake, then stream samples until the consumer goes away
#[instrument(
    name = "outlet_consumer_session",
    skip(stream, shared),
    fields(stream = %shared.descriptor.name(), peer = %peer)
)]
async fn serve_consumer(mut stream: TcpStream, peer: SocketAddr, id: u64, shared: Arc<OutletShared>) {
    let _ = stream.set_nodelay(true);
    let queue = match handshake(&mut stream, &shared).await {
        Ok(queue) => queue,
        Err(e) => {
            debug!(error = %e, "Handshake failed");
            shared.tasks().remove(&id);
            return;
        }
    };

    shared.add_session(
        id,
        Session {
            peer,
            queue: Arc::clone(&queue),
        },
    );
    debug!("Consumer attached");

    while let Some(batch) = queue.recv_batch(MAX_FRAME_SAMPLES).await {
        if let Err(e) = write_frame(&mut stream, &WireMessage::Samples(batch)).await {
            shared.metrics.inc_send_failures();
            debug!(error = %e, "Consumer write failed");
            break;
        }
        shared.metrics.inc_chunks_sent();
    }

    shared.remove_session(id);
}

async fn handshake(stream: &mut TcpStream, shared: &OutletShared) -> Result<Arc<SampleQueue<Sample>>> {
    let request = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| StreamError::timeout("outlet_handshake", HANDSHAKE_TIMEOUT))??;

    let descriptor = &shared.descriptor;
    let max_buffered = match request {
        Some(WireMessage::Subscribe { uid, max_buffered }) => {
            if !uid.is_unset() && uid != *descriptor.uid() {
                let reason = format!("stream instance {uid} is gone, now serving {}", descriptor.uid());
                write_frame(stream, &WireMessage::Rejected { reason: reason.clone() }).await?;
                return Err(StreamError::lost(reason));
            }
            max_buffered
        }
        Some(other) => {
            return Err(StreamError::internal(format!(
                "expected subscribe, got {}",
                other.kind()
            )))
        }
        None => return Err(StreamError::lost("consumer closed before subscribing")),
    };

    let seconds = if max_buffered.is_finite() && max_buffered > 0.0 {
        max_buffered.min(shared.max_buffered)
    } else {
        shared.max_buffered
    };
    let queue = Arc::new(SampleQueue::new(descriptor.buffer_capacity(seconds)));

    write_frame(
        stream,
        &WireMessage::Accepted {
            descriptor: (**descriptor).clone(),
        },
    )
    .await?;
    Ok(queue)
}
