//! UDP transport.
//!
//! Three background tasks share one socket:
//!
//! - **receiver**: maps each source address to a connection id (announcing new
//!   ones to triage), measures round trips from probe acks and submits every
//!   datagram to [`InboundTriage`]
//! - **sender**: drains the outbound queue filled by [`Transport::send`]
//! - **prober**: periodically sends a `TransportProbe` to every endpoint
//!
//! One datagram carries exactly one frame.

use crate::transport::{ConnectionId, Transport};
use crate::triage::InboundTriage;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use shared::{decode_frame, decode_payload, encode_frame, Opcode, TransportProbe};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Largest datagram the receiver accepts.
pub const MAX_DATAGRAM: usize = 2048;

/// Milliseconds since the Unix epoch, as carried in probe and ping timestamps.
pub fn now_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    millis.min(u64::MAX as u128) as u64
}

#[derive(Debug, Clone, Copy)]
struct Endpoint {
    addr: SocketAddr,
    rtt_ms: Option<u32>,
}

#[derive(Default)]
struct Peers {
    by_addr: DashMap<SocketAddr, ConnectionId>,
    endpoints: DashMap<ConnectionId, Endpoint>,
    next_id: AtomicU64,
}

impl Peers {
    /// Connection id for `addr`, and whether it was just created.
    fn resolve(&self, addr: SocketAddr) -> (ConnectionId, bool) {
        if let Some(id) = self.by_addr.get(&addr) {
            return (*id, false);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.by_addr.insert(addr, id);
        self.endpoints.insert(id, Endpoint { addr, rtt_ms: None });
        (id, true)
    }

    fn remove(&self, id: ConnectionId) -> Option<SocketAddr> {
        let (_, endpoint) = self.endpoints.remove(&id)?;
        self.by_addr.remove(&endpoint.addr);
        Some(endpoint.addr)
    }

    /// Folds a round-trip sample into the smoothed estimate.
    fn record_rtt(&self, id: ConnectionId, sample: u32) {
        if let Some(mut endpoint) = self.endpoints.get_mut(&id) {
            endpoint.rtt_ms = Some(match endpoint.rtt_ms {
                Some(previous) => (previous * 7 + sample) / 8,
                None => sample,
            });
        }
    }
}

struct OutboundFrame {
    addr: SocketAddr,
    frame: Vec<u8>,
}

pub struct UdpTransport {
    local_addr: SocketAddr,
    peers: Arc<Peers>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl UdpTransport {
    /// Binds the socket and spawns the receiver, sender and prober tasks.
    pub async fn bind(
        addr: &str,
        triage: InboundTriage,
        probe_interval: Duration,
    ) -> io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("Server listening on {}", local_addr);

        let peers = Arc::new(Peers::default());
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            local_addr,
            peers: Arc::clone(&peers),
            outbound,
        });

        Self::spawn_receiver(Arc::clone(&socket), Arc::clone(&peers), triage);
        Self::spawn_sender(socket, outbound_rx);
        if !probe_interval.is_zero() {
            Self::spawn_prober(Arc::downgrade(&transport), probe_interval);
        }
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn spawn_receiver(socket: Arc<UdpSocket>, peers: Arc<Peers>, triage: InboundTriage) {
        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM];

            loop {
                let (len, addr) = match socket.recv_from(&mut buffer).await {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };
                if triage.is_closed() {
                    info!("Main loop gone, receiver stopping");
                    break;
                }

                let frame = &buffer[..len];
                let (id, new) = peers.resolve(addr);
                if new {
                    triage.connected(id, addr.to_string());
                }
                if let Ok((Opcode::TransportProbeAck, payload)) = decode_frame(frame) {
                    if let Ok(probe) = decode_payload::<TransportProbe>(payload) {
                        let sample = now_millis().saturating_sub(probe.timestamp);
                        peers.record_rtt(id, sample.min(u32::MAX as u64) as u32);
                    }
                }
                triage.submit(id, frame);
            }
        });
    }

    fn spawn_sender(socket: Arc<UdpSocket>, mut outbound: mpsc::UnboundedReceiver<OutboundFrame>) {
        tokio::spawn(async move {
            while let Some(OutboundFrame { addr, frame }) = outbound.recv().await {
                if let Err(e) = socket.send_to(&frame, addr).await {
                    warn!("Failed to send to {}: {}", addr, e);
                }
            }
            debug!("Outbound queue closed, sender stopping");
        });
    }

    fn spawn_prober(transport: std::sync::Weak<Self>, every: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let Some(transport) = transport.upgrade() else {
                    break;
                };
                let probe = TransportProbe {
                    timestamp: now_millis(),
                };
                let frame = match encode_frame(Opcode::TransportProbe, &probe) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Failed to encode transport probe: {}", e);
                        break;
                    }
                };
                for id in transport.open_connections() {
                    transport.send(id, &frame);
                }
            }
        });
    }
}

impl Transport for UdpTransport {
    fn send(&self, connection: ConnectionId, frame: &[u8]) {
        let Some(addr) = self.peers.endpoints.get(&connection).map(|e| e.addr) else {
            debug!("Dropping frame for closed connection {}", connection);
            return;
        };
        let _ = self.outbound.send(OutboundFrame {
            addr,
            frame: frame.to_vec(),
        });
    }

    fn force_disconnect(&self, connection: ConnectionId, reason: &str) {
        if let Some(addr) = self.peers.remove(connection) {
            debug!("Closed connection {} ({}): {}", connection, addr, reason);
        }
    }

    fn round_trip_ms(&self, connection: ConnectionId) -> Option<u32> {
        self.peers.endpoints.get(&connection)?.rtt_ms
    }

    fn open_connections(&self) -> Vec<ConnectionId> {
        self.peers.endpoints.iter().map(|entry| *entry.key()).collect()
    }
}
