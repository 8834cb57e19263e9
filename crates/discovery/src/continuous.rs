//! ContinuousResolver - background discovery with a found/lost cache
//!
//! A background task sends one query wave per `probe_interval` and collects
//! announcements until the next tick. Entries are keyed by (name, type);
//! an entry that has not been re-sighted for `forget_after` is pruned.
//! Observers hear `Found` when a key enters the cache and `Lost` when it is
//! pruned, exactly once per transition.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use contracts::{
    ObserverRegistry, Predicate, ResolverConfig, Result, StreamDescriptor, SubscriptionId,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};
use transport::{QuerySocket, StreamContext};

/// Cache key: (name, type)
pub type CacheKey = (String, String);

#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Found(StreamDescriptor),
    Lost(StreamDescriptor),
}

impl DiscoveryEvent {
    pub fn descriptor(&self) -> &StreamDescriptor {
        match self {
            DiscoveryEvent::Found(d) | DiscoveryEvent::Lost(d) => d,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryCacheEntry {
    pub descriptor: StreamDescriptor,
    /// Context clock time of the latest announcement
    pub last_seen: f64,
}

struct ResolverShared {
    ctx: StreamContext,
    config: ResolverConfig,
    cache: Mutex<HashMap<CacheKey, DiscoveryCacheEntry>>,
    observers: ObserverRegistry<DiscoveryEvent>,
}

impl ResolverShared {
    fn cache(&self) -> MutexGuard<'_, HashMap<CacheKey, DiscoveryCacheEntry>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or refresh; observers hear about new keys only
    fn record(&self, descriptor: StreamDescriptor) {
        let now = self.ctx.now();
        let found = {
            let mut cache = self.cache();
            let found = match cache.entry(descriptor.key()) {
                Entry::Occupied(mut slot) => {
                    let entry = slot.get_mut();
                    entry.descriptor = descriptor;
                    entry.last_seen = now;
                    None
                }
                Entry::Vacant(slot) => {
                    slot.insert(DiscoveryCacheEntry {
                        descriptor: descriptor.clone(),
                        last_seen: now,
                    });
                    Some(descriptor)
                }
            };
            metrics::gauge!("mibridge_resolver_streams").set(cache.len() as f64);
            found
        };
        if let Some(descriptor) = found {
            info!(stream = %descriptor.name(), kind = %descriptor.content_type(), "Stream found");
            self.observers.notify(&DiscoveryEvent::Found(descriptor));
        }
    }

    /// Drop stale entries, notifying `Lost` for each
    fn prune(&self) {
        let horizon = self.ctx.now() - self.config.forget_after_secs;
        let lost: Vec<StreamDescriptor> = {
            let mut cache = self.cache();
            let stale: Vec<CacheKey> = cache
                .iter()
                .filter(|(_, entry)| entry.last_seen < horizon)
                .map(|(key, _)| key.clone())
                .collect();
            let lost = stale
                .iter()
                .filter_map(|key| cache.remove(key))
                .map(|entry| entry.descriptor)
                .collect();
            metrics::gauge!("mibridge_resolver_streams").set(cache.len() as f64);
            lost
        };
        for descriptor in lost {
            info!(stream = %descriptor.name(), kind = %descriptor.content_type(), "Stream lost");
            self.observers.notify(&DiscoveryEvent::Lost(descriptor));
        }
    }
}

/// Keeps an up-to-date view of the streams matching a query
pub struct ContinuousResolver {
    shared: Arc<ResolverShared>,
    predicate: Predicate,
    task: JoinHandle<()>,
}

impl ContinuousResolver {
    /// Start resolving streams matching `query` (empty query = every stream).
    ///
    /// # Errors
    /// `Argument` for a malformed query, `ConfigValidation` for an invalid
    /// `config`, `Io` when the query socket cannot be bound.
    #[instrument(name = "continuous_resolver_new", skip(ctx, config))]
    pub async fn new(ctx: &StreamContext, query: &str, config: ResolverConfig) -> Result<Self> {
        config.validate()?;
        let predicate = Predicate::parse(query)?;
        let socket = QuerySocket::bind(ctx, predicate.clone()).await?;
        let shared = Arc::new(ResolverShared {
            ctx: ctx.clone(),
            config,
            cache: Mutex::new(HashMap::new()),
            observers: ObserverRegistry::new(),
        });
        let task = tokio::spawn(resolve_loop(Arc::clone(&shared), socket));
        debug!(query = %predicate, "Continuous resolver started");
        Ok(Self {
            shared,
            predicate,
            task,
        })
    }

    pub fn query(&self) -> &Predicate {
        &self.predicate
    }

    /// Snapshot of the live streams, stale entries pruned first
    pub fn results(&self) -> Vec<StreamDescriptor> {
        self.entries().into_iter().map(|e| e.descriptor).collect()
    }

    /// Snapshot of the cache entries, ordered by key
    pub fn entries(&self) -> Vec<DiscoveryCacheEntry> {
        self.shared.prune();
        let cache = self.shared.cache();
        let mut entries: Vec<(CacheKey, DiscoveryCacheEntry)> = cache
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Callback for found/lost transitions, run on the resolver task
    pub fn subscribe(
        &self,
        callback: impl Fn(&DiscoveryEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.observers.unsubscribe(id)
    }
}

impl Drop for ContinuousResolver {
    fn drop(&mut self) {
        self.task.abort();
        self.shared.observers.clear();
    }
}

/// One pass per tick: send a wave, collect until the next tick, prune.
///
/// Passes run back to back on this task, so a slow pass delays the next
/// tick instead of overlapping it; skipped ticks are not replayed.
async fn resolve_loop(shared: Arc<ResolverShared>, mut socket: QuerySocket) {
    let period = shared.config.probe_interval();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let tick = interval.tick().await;
        if let Err(e) = socket.send_wave().await {
            warn!(error = %e, "Query wave failed");
        }
        let window_end = tick + period;
        while let Some(descriptor) = socket.recv_until(window_end).await {
            shared.record(descriptor);
        }
        shared.prune();
    }
}
