//! Outlet service socket: answers discovery queries and time probes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use contracts::{Predicate, Result, StreamDescriptor, StreamError, WireMessage, MAX_DATAGRAM_LEN};
use tokio::net::UdpSocket;
use tracing::{debug, instrument, trace, warn};

use crate::StreamContext;

/// Bind the first free port of the configured service range.
///
/// # Errors
/// `Internal` when every port of the range is taken.
pub(crate) async fn bind_service_socket(ctx: &StreamContext) -> Result<UdpSocket> {
    let network = ctx.network();
    for port in network.service_ports() {
        match UdpSocket::bind(SocketAddr::new(network.listen_address, port)).await {
            Ok(socket) => {
                join_multicast(ctx, &socket);
                return Ok(socket);
            }
            Err(e) => trace!(port, error = %e, "Service port unavailable"),
        }
    }
    Err(StreamError::internal(format!(
        "no free service port in {}..{}",
        network.base_port,
        u32::from(network.base_port) + u32::from(network.port_range)
    )))
}

fn join_multicast(ctx: &StreamContext, socket: &UdpSocket) {
    let Some(group) = ctx.network().multicast_group else {
        return;
    };
    let interface = match ctx.network().listen_address {
        IpAddr::V4(addr) => addr,
        IpAddr::V6(_) => return,
    };
    let interface = if interface.is_loopback() {
        interface
    } else {
        Ipv4Addr::UNSPECIFIED
    };
    if let Err(e) = socket.join_multicast_v4(group, interface) {
        // unicast discovery keeps working without the group
        debug!(group = %group, error = %e, "Multicast join failed");
    }
}

/// Serve queries and time probes until the task is aborted
#[instrument(
    name = "outlet_service_loop",
    skip(ctx, socket, descriptor),
    fields(stream = %descriptor.name(), uid = %descriptor.uid())
)]
pub(crate) async fn serve(ctx: StreamContext, socket: UdpSocket, descriptor: Arc<StreamDescriptor>) {
    let announcement = descriptor.without_desc();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP port-unreachable from an earlier reply surfaces here on some platforms
                trace!(error = %e, "Service recv failed");
                continue;
            }
        };
        let t1 = ctx.now();

        let message = match WireMessage::from_datagram(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Ignoring undecodable datagram");
                continue;
            }
        };

        let reply = match message {
            WireMessage::Query {
                query_id,
                predicate,
            } => answer_query(&announcement, query_id, &predicate),
            WireMessage::TimeProbe { probe_id, t0 } => Some(WireMessage::TimeReply {
                probe_id,
                t0,
                t1,
                t2: ctx.now(),
            }),
            other => {
                debug!(peer = %peer, kind = other.kind(), "Unexpected message on service port");
                None
            }
        };

        if let Some(reply) = reply {
            send_reply(&socket, &reply, peer).await;
        }
    }
}

fn answer_query(
    announcement: &StreamDescriptor,
    query_id: u64,
    predicate: &str,
) -> Option<WireMessage> {
    let predicate = match Predicate::parse(predicate) {
        Ok(predicate) => predicate,
        Err(e) => {
            debug!(error = %e, "Ignoring query with malformed predicate");
            return None;
        }
    };
    announcement
        .matches_query(&predicate)
        .then(|| WireMessage::Announce {
            query_id,
            descriptor: announcement.clone(),
        })
}

async fn send_reply(socket: &UdpSocket, reply: &WireMessage, peer: SocketAddr) {
    let bytes = match reply.to_datagram() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Cannot encode service reply");
            return;
        }
    };
    if let Err(e) = socket.send_to(&bytes, peer).await {
        // best-effort: the peer retries with its next wave
        trace!(peer = %peer, error = %e, "Service reply failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{ChannelFormat, NetworkConfig, StreamUid};
    use std::time::Duration;

    fn descriptor() -> StreamDescriptor {
        let mut desc =
            StreamDescriptor::new("svc", "Markers", 1, 0.0, ChannelFormat::Int32, "").unwrap();
        desc.publish_as(StreamUid::generate(), "host", 0.0, 1, 1);
        desc
    }

    #[test]
    fn test_answer_query_filters() {
        let desc = descriptor();
        assert!(answer_query(&desc, 1, "type='Markers'").is_some());
        assert!(answer_query(&desc, 1, "type='EEG'").is_none());
        assert!(answer_query(&desc, 1, "type=").is_none());
    }

    #[tokio::test]
    async fn test_time_probe_round_trip() {
        let ctx = StreamContext::new(NetworkConfig::loopback(40210, 4)).unwrap();
        let socket = bind_service_socket(&ctx).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let task = tokio::spawn(serve(ctx.clone(), socket, Arc::new(descriptor())));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let probe = WireMessage::TimeProbe { probe_id: 3, t0: 1.0 };
        client
            .send_to(&probe.to_datagram().unwrap(), addr)
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match WireMessage::from_datagram(&buf[..len]).unwrap() {
            WireMessage::TimeReply { probe_id, t0, t1, t2 } => {
                assert_eq!(probe_id, 3);
                assert_eq!(t0, 1.0);
                assert!(t2 >= t1);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        task.abort();
    }

    #[tokio::test]
    async fn test_service_ports_are_exclusive() {
        let ctx = StreamContext::new(NetworkConfig::loopback(40220, 2)).unwrap();
        let a = bind_service_socket(&ctx).await.unwrap();
        let b = bind_service_socket(&ctx).await.unwrap();
        assert_ne!(a.local_addr().unwrap(), b.local_addr().unwrap());
        assert!(bind_service_socket(&ctx).await.is_err());
    }
}
