//! Inbound triage.
//!
//! Receive tasks call [`InboundTriage::submit`] for every frame. Triage reads
//! the opcode, refuses traffic the connection is not allowed to send yet,
//! checks the frame into the envelope pool and routes it into one of three
//! stores according to its [`TrafficClass`]:
//!
//! - priority events go on an unbounded channel that the main loop drains in
//!   full each tick, together with connect, disconnect and console events
//! - bulk envelopes go on a second channel drained within the network budget
//! - coalescing envelopes go into a map keyed by (connection, slot, opcode)
//!   where a newer message replaces an older undispatched one
//!
//! Triage never touches the connection table; the only session state it reads
//! is the fully-connected gate.

use crate::connection::{ConnectedGate, KickReason};
use crate::envelope::{EnvelopePool, PacketEnvelope};
use crate::registry::{Counter, MessageTypeRegistry, TrafficClass};
use crate::transport::ConnectionId;
use log::{debug, warn};
use parking_lot::Mutex;
use shared::{split_frame, Opcode, MAX_PLAYERS_PER_CONNECTION};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

/// Messages from network and console tasks to the main loop.
#[derive(Debug)]
pub enum InboundEvent {
    Connected {
        connection: ConnectionId,
        peer: String,
    },
    Packet(PacketEnvelope),
    Disconnected {
        connection: ConnectionId,
        reason: String,
    },
    Kick {
        connection: ConnectionId,
        reason: KickReason,
    },
    Console {
        command: String,
        reply: Option<oneshot::Sender<String>>,
    },
}

/// Where a submitted frame ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Triaged {
    Priority,
    Bulk,
    Coalesced {
        /// An older message with the same key was discarded
        replaced: bool,
    },
    /// Frame refused; a kick for the connection has been queued
    Rejected(KickReason),
    /// Frame lost to pool exhaustion or a closed main loop
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CoalesceKey {
    connection: ConnectionId,
    slot: u8,
    opcode: Opcode,
}

type CoalesceMap = Arc<Mutex<HashMap<CoalesceKey, PacketEnvelope>>>;

#[derive(Debug, Default)]
pub struct TriageStats {
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
    pub dropped: AtomicU64,
    pub superseded: AtomicU64,
}

/// Producer side, cloned into every receive task.
#[derive(Clone)]
pub struct InboundTriage {
    high: mpsc::UnboundedSender<InboundEvent>,
    bulk: mpsc::UnboundedSender<PacketEnvelope>,
    coalescing: CoalesceMap,
    high_depth: Arc<AtomicUsize>,
    bulk_depth: Arc<AtomicUsize>,
    registry: Arc<MessageTypeRegistry>,
    pool: EnvelopePool,
    gate: ConnectedGate,
    stats: Arc<TriageStats>,
}

/// Consumer side, owned by the main loop.
pub struct TriageReceiver {
    high: mpsc::UnboundedReceiver<InboundEvent>,
    bulk: mpsc::UnboundedReceiver<PacketEnvelope>,
    coalescing: CoalesceMap,
    high_depth: Arc<AtomicUsize>,
    bulk_depth: Arc<AtomicUsize>,
}

pub fn channel(
    registry: Arc<MessageTypeRegistry>,
    pool: EnvelopePool,
    gate: ConnectedGate,
) -> (InboundTriage, TriageReceiver) {
    let (high_tx, high_rx) = mpsc::unbounded_channel();
    let (bulk_tx, bulk_rx) = mpsc::unbounded_channel();
    let coalescing: CoalesceMap = Arc::new(Mutex::new(HashMap::new()));
    let high_depth = Arc::new(AtomicUsize::new(0));
    let bulk_depth = Arc::new(AtomicUsize::new(0));

    let triage = InboundTriage {
        high: high_tx,
        bulk: bulk_tx,
        coalescing: Arc::clone(&coalescing),
        high_depth: Arc::clone(&high_depth),
        bulk_depth: Arc::clone(&bulk_depth),
        registry,
        pool,
        gate,
        stats: Arc::new(TriageStats::default()),
    };
    let receiver = TriageReceiver {
        high: high_rx,
        bulk: bulk_rx,
        coalescing,
        high_depth,
        bulk_depth,
    };
    (triage, receiver)
}

impl InboundTriage {
    pub fn submit(&self, connection: ConnectionId, frame: &[u8]) -> Triaged {
        self.submit_at(connection, frame, Instant::now())
    }

    pub fn submit_at(&self, connection: ConnectionId, frame: &[u8], arrival: Instant) -> Triaged {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let (raw, payload) = match split_frame(frame) {
            Ok(parts) => parts,
            Err(e) => return self.reject(connection, e.to_string()),
        };
        let Some(kind) = self.registry.lookup(raw).copied() else {
            return self.reject(connection, format!("unknown message type {}", raw));
        };
        let opcode = kind.opcode;

        if !kind.pre_login && !self.gate.contains(&connection) {
            self.registry.record(opcode, Counter::Rejected);
            return self.reject(
                connection,
                format!("{} before login completed", opcode),
            );
        }

        // Coalescing keys need the slot, which is the first payload byte
        let slot = if kind.class == TrafficClass::Coalesce {
            match payload.first() {
                Some(&slot) if (slot as usize) < MAX_PLAYERS_PER_CONNECTION => Some(slot),
                _ => {
                    self.registry.record(opcode, Counter::Rejected);
                    return self.reject(connection, format!("{} without a valid slot", opcode));
                }
            }
        } else {
            None
        };

        let envelope = match self.pool.checkout(opcode, connection, payload, arrival) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.registry.record(opcode, Counter::Dropped);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping {} from connection {}: {}", opcode, connection, e);
                return Triaged::Dropped;
            }
        };
        self.registry.record(opcode, Counter::Received);

        match (kind.class, slot) {
            (TrafficClass::Coalesce, Some(slot)) => {
                let key = CoalesceKey {
                    connection,
                    slot,
                    opcode,
                };
                // The superseded envelope returns to the pool when dropped here
                let replaced = self.coalescing.lock().insert(key, envelope).is_some();
                if replaced {
                    self.registry.record(opcode, Counter::Coalesced);
                    self.stats.superseded.fetch_add(1, Ordering::Relaxed);
                }
                Triaged::Coalesced { replaced }
            }
            (TrafficClass::Bulk, _) => {
                self.bulk_depth.fetch_add(1, Ordering::AcqRel);
                if self.bulk.send(envelope).is_err() {
                    self.bulk_depth.fetch_sub(1, Ordering::AcqRel);
                    return Triaged::Dropped;
                }
                Triaged::Bulk
            }
            _ => {
                if self.push(InboundEvent::Packet(envelope)) {
                    Triaged::Priority
                } else {
                    Triaged::Dropped
                }
            }
        }
    }

    pub fn connected(&self, connection: ConnectionId, peer: String) {
        self.push(InboundEvent::Connected { connection, peer });
    }

    pub fn disconnected(&self, connection: ConnectionId, reason: impl Into<String>) {
        self.push(InboundEvent::Disconnected {
            connection,
            reason: reason.into(),
        });
    }

    pub fn request_kick(&self, connection: ConnectionId, reason: KickReason) {
        self.push(InboundEvent::Kick { connection, reason });
    }

    /// Queues a console command; the reply is sent on `reply` once executed.
    pub fn console(&self, command: impl Into<String>, reply: Option<oneshot::Sender<String>>) {
        self.push(InboundEvent::Console {
            command: command.into(),
            reply,
        });
    }

    pub fn stats(&self) -> &TriageStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.high.is_closed()
    }

    fn reject(&self, connection: ConnectionId, detail: String) -> Triaged {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        debug!("Rejecting frame from connection {}: {}", connection, detail);
        let reason = KickReason::ProtocolViolation(detail);
        self.request_kick(connection, reason.clone());
        Triaged::Rejected(reason)
    }

    fn push(&self, event: InboundEvent) -> bool {
        self.high_depth.fetch_add(1, Ordering::AcqRel);
        if self.high.send(event).is_err() {
            self.high_depth.fetch_sub(1, Ordering::AcqRel);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }
}

impl TriageReceiver {
    /// Events queued right now. Draining exactly this many keeps a flood that
    /// arrives mid-drain from stretching the current tick.
    pub fn priority_depth(&self) -> usize {
        self.high_depth.load(Ordering::Acquire)
    }

    pub fn bulk_depth(&self) -> usize {
        self.bulk_depth.load(Ordering::Acquire)
    }

    pub fn coalesced_depth(&self) -> usize {
        self.coalescing.lock().len()
    }

    pub fn try_next_priority(&mut self) -> Option<InboundEvent> {
        let event = self.high.try_recv().ok()?;
        self.high_depth.fetch_sub(1, Ordering::AcqRel);
        Some(event)
    }

    pub fn try_next_bulk(&mut self) -> Option<PacketEnvelope> {
        let envelope = self.bulk.try_recv().ok()?;
        self.bulk_depth.fetch_sub(1, Ordering::AcqRel);
        Some(envelope)
    }

    /// Takes every coalesced envelope, leaving the map empty for the next tick.
    pub fn take_coalesced(&self) -> Vec<PacketEnvelope> {
        let drained = std::mem::take(&mut *self.coalescing.lock());
        let mut envelopes: Vec<_> = drained.into_values().collect();
        envelopes.sort_by_key(|envelope| envelope.arrival());
        envelopes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use dashmap::DashSet;
    use shared::{encode_frame, LoginRequest, Ping, PlayerUpdate, Position, VehiclePhysics};

    fn setup(max_envelopes: usize) -> (InboundTriage, TriageReceiver, EnvelopePool, ConnectedGate) {
        let pool = EnvelopePool::new(&PoolConfig {
            max_envelopes,
            buffer_capacity: 64,
            preallocate: 0,
        });
        let gate: ConnectedGate = Arc::new(DashSet::new());
        let registry = Arc::new(MessageTypeRegistry::with_builtin_handlers());
        let (triage, receiver) = channel(registry, pool.clone(), Arc::clone(&gate));
        (triage, receiver, pool, gate)
    }

    fn update(slot: u8, x: f32) -> Vec<u8> {
        encode_frame(
            Opcode::PlayerUpdate,
            &PlayerUpdate {
                slot,
                position: Position::new(x, 0.0, 0.0),
                direction: 0.0,
                moving: true,
            },
        )
        .unwrap()
    }

    fn login() -> Vec<u8> {
        encode_frame(
            Opcode::Login,
            &LoginRequest {
                slot: 0,
                username: "alice".into(),
                password: String::new(),
                client_version: "1.4.2".into(),
                platform_id: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_login_allowed_before_gate() {
        let (triage, mut rx, _, _) = setup(16);
        assert_eq!(triage.submit(1, &login()), Triaged::Priority);

        assert_eq!(rx.priority_depth(), 1);
        match rx.try_next_priority() {
            Some(InboundEvent::Packet(envelope)) => {
                assert_eq!(envelope.opcode(), Opcode::Login);
                assert_eq!(envelope.connection(), 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(rx.priority_depth(), 0);
    }

    #[test]
    fn test_gameplay_before_login_is_rejected() {
        let (triage, mut rx, pool, _) = setup(16);

        let result = triage.submit(1, &update(0, 1.0));

        assert!(matches!(result, Triaged::Rejected(KickReason::ProtocolViolation(_))));
        assert_eq!(rx.coalesced_depth(), 0);
        assert_eq!(pool.outstanding(), 0);
        match rx.try_next_priority() {
            Some(InboundEvent::Kick { connection, .. }) => assert_eq!(connection, 1),
            other => panic!("expected a kick, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        let (triage, mut rx, _, gate) = setup(16);
        gate.insert(1);

        let result = triage.submit(1, &[0xBE, 0xEF, 1, 2, 3]);

        assert!(matches!(result, Triaged::Rejected(_)));
        assert!(matches!(
            rx.try_next_priority(),
            Some(InboundEvent::Kick { connection: 1, .. })
        ));
    }

    #[test]
    fn test_short_frame_is_rejected() {
        let (triage, _, _, _) = setup(16);
        assert!(matches!(triage.submit(1, &[7]), Triaged::Rejected(_)));
    }

    #[test]
    fn test_coalescing_keeps_newest_per_slot() {
        let (triage, rx, pool, gate) = setup(16);
        gate.insert(1);

        assert_eq!(
            triage.submit(1, &update(0, 1.0)),
            Triaged::Coalesced { replaced: false }
        );
        assert_eq!(
            triage.submit(1, &update(0, 2.0)),
            Triaged::Coalesced { replaced: true }
        );
        assert_eq!(
            triage.submit(1, &update(0, 3.0)),
            Triaged::Coalesced { replaced: true }
        );
        assert_eq!(
            triage.submit(1, &update(1, 9.0)),
            Triaged::Coalesced { replaced: false }
        );
        // superseded envelopes went straight back to the pool
        assert_eq!(pool.outstanding(), 2);

        let drained = rx.take_coalesced();
        assert_eq!(drained.len(), 2);
        let latest: PlayerUpdate = drained
            .iter()
            .find(|e| e.payload()[0] == 0)
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(latest.position.x, 3.0);
        assert_eq!(rx.coalesced_depth(), 0);
    }

    #[test]
    fn test_coalescing_is_per_connection() {
        let (triage, rx, _, gate) = setup(16);
        gate.insert(1);
        gate.insert(2);

        triage.submit(1, &update(0, 1.0));
        triage.submit(2, &update(0, 2.0));

        assert_eq!(rx.take_coalesced().len(), 2);
    }

    #[test]
    fn test_coalescing_requires_slot_byte() {
        let (triage, _, _, gate) = setup(16);
        gate.insert(1);

        let mut frame = Opcode::PlayerUpdate.as_u16().to_be_bytes().to_vec();
        assert!(matches!(triage.submit(1, &frame), Triaged::Rejected(_)));

        frame.push(9);
        assert!(matches!(triage.submit(1, &frame), Triaged::Rejected(_)));
    }

    #[test]
    fn test_bulk_queue() {
        let (triage, mut rx, _, gate) = setup(16);
        gate.insert(1);
        let frame = encode_frame(
            Opcode::VehiclePhysics,
            &VehiclePhysics {
                vehicle_id: 4,
                position: Position::default(),
                data: vec![1, 2, 3],
            },
        )
        .unwrap();

        assert_eq!(triage.submit(1, &frame), Triaged::Bulk);
        assert_eq!(triage.submit(1, &frame), Triaged::Bulk);

        assert_eq!(rx.bulk_depth(), 2);
        assert!(rx.try_next_bulk().is_some());
        assert_eq!(rx.bulk_depth(), 1);
        assert_eq!(rx.priority_depth(), 0);
    }

    #[test]
    fn test_pool_exhaustion_drops_message() {
        let (triage, mut rx, _, _) = setup(1);
        let ping = encode_frame(Opcode::Ping, &Ping { timestamp: 1 }).unwrap();

        assert_eq!(triage.submit(1, &ping), Triaged::Priority);
        assert_eq!(triage.submit(1, &ping), Triaged::Dropped);
        assert_eq!(triage.stats().dropped.load(Ordering::Relaxed), 1);

        drop(rx.try_next_priority());
        assert_eq!(triage.submit(1, &ping), Triaged::Priority);
    }

    #[test]
    fn test_console_event() {
        let (triage, mut rx, _, _) = setup(4);
        triage.console("status", None);

        match rx.try_next_priority() {
            Some(InboundEvent::Console { command, reply }) => {
                assert_eq!(command, "status");
                assert!(reply.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
