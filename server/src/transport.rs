//! Transport seam between the engine and whatever moves bytes.
//!
//! The engine never touches sockets. It hands complete frames to a
//! [`Transport`] and learns about connections through triage events. The UDP
//! implementation lives in [`crate::network`]; [`MemoryTransport`] records
//! everything in memory so sessions can be driven from tests.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use shared::{decode_frame, decode_payload, Opcode};
use std::collections::BTreeSet;

/// Transport-assigned identifier of one remote endpoint.
pub type ConnectionId = u64;

pub trait Transport: Send + Sync {
    /// Queues a complete frame (opcode + payload) for delivery.
    fn send(&self, connection: ConnectionId, frame: &[u8]);

    /// Drops the endpoint. Frames sent before this call are still delivered.
    fn force_disconnect(&self, connection: ConnectionId, reason: &str);

    /// Latest round-trip estimate, if the transport has measured one.
    fn round_trip_ms(&self, connection: ConnectionId) -> Option<u32>;

    fn open_connections(&self) -> Vec<ConnectionId>;
}

/// In-memory transport that records outbound frames.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(ConnectionId, Vec<u8>)>>,
    disconnects: Mutex<Vec<(ConnectionId, String)>>,
    open: Mutex<BTreeSet<ConnectionId>>,
    rtt: DashMap<ConnectionId, u32>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an endpoint as open. Tests call this alongside `triage.connected`.
    pub fn open(&self, connection: ConnectionId) {
        self.open.lock().insert(connection);
    }

    pub fn set_round_trip(&self, connection: ConnectionId, millis: u32) {
        self.rtt.insert(connection, millis);
    }

    pub fn is_open(&self, connection: ConnectionId) -> bool {
        self.open.lock().contains(&connection)
    }

    /// Removes and returns everything sent so far.
    pub fn take_sent(&self) -> Vec<(ConnectionId, Vec<u8>)> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Opcodes sent to one connection, in order.
    pub fn opcodes_for(&self, connection: ConnectionId) -> Vec<Opcode> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| *to == connection)
            .filter_map(|(_, frame)| decode_frame(frame).ok().map(|(opcode, _)| opcode))
            .collect()
    }

    /// Decoded payloads of every `opcode` frame sent to `connection`.
    pub fn messages_for<T: DeserializeOwned>(
        &self,
        connection: ConnectionId,
        opcode: Opcode,
    ) -> Vec<T> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| *to == connection)
            .filter_map(|(_, frame)| {
                let (op, payload) = decode_frame(frame).ok()?;
                if op != opcode {
                    return None;
                }
                decode_payload(payload).ok()
            })
            .collect()
    }

    pub fn disconnects(&self) -> Vec<(ConnectionId, String)> {
        self.disconnects.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
        self.disconnects.lock().clear();
    }
}

impl Transport for MemoryTransport {
    fn send(&self, connection: ConnectionId, frame: &[u8]) {
        self.sent.lock().push((connection, frame.to_vec()));
    }

    fn force_disconnect(&self, connection: ConnectionId, reason: &str) {
        self.open.lock().remove(&connection);
        self.rtt.remove(&connection);
        self.disconnects
            .lock()
            .push((connection, reason.to_string()));
    }

    fn round_trip_ms(&self, connection: ConnectionId) -> Option<u32> {
        self.rtt.get(&connection).map(|rtt| *rtt)
    }

    fn open_connections(&self) -> Vec<ConnectionId> {
        self.open.lock().iter().copied().collect()
    }
}
