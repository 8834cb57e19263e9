//! Query waves: the client side of discovery
//!
//! A wave is one `Query` datagram to every service port of every known peer,
//! plus the multicast group when configured. Answers arrive on the same
//! socket and are stamped with the address they came from.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use contracts::{
    Predicate, Result, StreamDescriptor, StreamUid, WireMessage, MAX_DATAGRAM_LEN,
};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

use crate::StreamContext;

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Socket sending query waves and collecting announcements
pub struct QuerySocket {
    ctx: StreamContext,
    socket: UdpSocket,
    query_id: u64,
    predicate: Predicate,
    buf: Vec<u8>,
}

impl QuerySocket {
    pub async fn bind(ctx: &StreamContext, predicate: Predicate) -> Result<Self> {
        let local = match ctx.network().listen_address {
            IpAddr::V4(addr) if addr.is_loopback() => IpAddr::V4(addr),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let socket = UdpSocket::bind(SocketAddr::new(local, 0)).await?;
        if ctx.network().multicast_group.is_some() {
            let _ = socket.set_multicast_loop_v4(true);
        }
        Ok(Self {
            ctx: ctx.clone(),
            socket,
            query_id: NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed),
            predicate,
            buf: vec![0u8; MAX_DATAGRAM_LEN],
        })
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Send one wave; unreachable targets are skipped
    pub async fn send_wave(&self) -> Result<()> {
        let query = WireMessage::Query {
            query_id: self.query_id,
            predicate: self.predicate.as_str().to_string(),
        }
        .to_datagram()?;

        let network = self.ctx.network();
        let multicast = network.multicast_group.map(IpAddr::V4);
        let hosts = network.known_peers.iter().copied().chain(multicast);
        for host in hosts {
            for port in network.service_ports() {
                if let Err(e) = self.socket.send_to(&query, SocketAddr::new(host, port)).await {
                    trace!(host = %host, port, error = %e, "Query send failed");
                }
            }
        }
        Ok(())
    }

    /// Next matching announcement, `None` once `deadline` passes
    pub async fn recv_until(&mut self, deadline: Instant) -> Option<StreamDescriptor> {
        loop {
            let received =
                tokio::time::timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await;
            let (len, peer) = match received {
                Err(_) => return None,
                Ok(Err(e)) => {
                    trace!(error = %e, "Query recv failed");
                    if Instant::now() >= deadline {
                        return None;
                    }
                    continue;
                }
                Ok(Ok(received)) => received,
            };
            match WireMessage::from_datagram(&self.buf[..len]) {
                Ok(WireMessage::Announce {
                    query_id,
                    mut descriptor,
                }) if query_id == self.query_id => {
                    if !descriptor.matches_query(&self.predicate) {
                        continue;
                    }
                    descriptor.set_v4address(peer.ip());
                    return Some(descriptor);
                }
                Ok(other) => trace!(peer = %peer, kind = other.kind(), "Ignoring datagram"),
                Err(e) => debug!(peer = %peer, error = %e, "Undecodable announcement"),
            }
        }
    }
}

/// Collect distinct streams (by uid) matching `predicate`.
///
/// Waves repeat every `wave_interval` until `minimum` streams answered (when
/// `minimum > 0`) or `timeout` elapsed; `minimum == 0` always waits the full
/// `timeout`.
#[instrument(name = "query_streams", skip(ctx, predicate), fields(predicate = %predicate))]
pub async fn query_streams(
    ctx: &StreamContext,
    predicate: Predicate,
    minimum: usize,
    timeout: Duration,
) -> Result<Vec<StreamDescriptor>> {
    let mut socket = QuerySocket::bind(ctx, predicate).await?;
    let started = Instant::now();
    let deadline = started.checked_add(timeout).unwrap_or_else(far_future);
    let wave_interval = ctx.network().wave_interval();

    let mut seen: HashSet<StreamUid> = HashSet::new();
    let mut found = Vec::new();
    let mut next_wave = started;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if now >= next_wave {
            socket.send_wave().await?;
            next_wave = now + wave_interval;
        }
        match socket.recv_until(next_wave.min(deadline)).await {
            Some(descriptor) => {
                if seen.insert(descriptor.uid().clone()) {
                    debug!(stream = %descriptor.name(), uid = %descriptor.uid(), "Stream answered");
                    found.push(descriptor);
                    if minimum > 0 && found.len() >= minimum {
                        break;
                    }
                }
            }
            None => continue,
        }
    }
    Ok(found)
}

fn far_future() -> Instant {
    Instant::now() + contracts::FOREVER
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamOutlet;
    use contracts::{ChannelFormat, NetworkConfig, OutletConfig};

    #[tokio::test]
    async fn test_query_finds_outlet_and_stamps_address() {
        let ctx = StreamContext::new(NetworkConfig::loopback(40400, 4)).unwrap();
        let desc =
            StreamDescriptor::new("q-eeg", "EEG", 4, 128.0, ChannelFormat::Float32, "q1").unwrap();
        let outlet = StreamOutlet::new(&ctx, desc, OutletConfig::default())
            .await
            .unwrap();

        let found = query_streams(
            &ctx,
            Predicate::equals("name", "q-eeg").unwrap(),
            1,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uid(), outlet.info().uid());
        assert_eq!(
            found[0].v4address(),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert!(found[0].data_endpoint().is_some());
    }

    #[tokio::test]
    async fn test_query_without_match_waits_out_timeout() {
        let ctx = StreamContext::new(NetworkConfig::loopback(40410, 2)).unwrap();
        let start = Instant::now();
        let found = query_streams(
            &ctx,
            Predicate::equals("type", "Nothing").unwrap(),
            1,
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert!(found.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
