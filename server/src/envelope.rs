//! Pooled packet envelopes.
//!
//! Every received frame is copied into a buffer checked out of the
//! [`EnvelopePool`]. The envelope owns that buffer until it is dropped, at
//! which point the buffer goes back on the free list. Because the return
//! happens in `Drop`, an envelope is discarded exactly once and cannot be
//! touched afterwards. The pool is bounded: once `max_envelopes` are checked
//! out, further checkouts fail and the caller drops the message.

use crate::config::PoolConfig;
use crate::error::PoolExhausted;
use crate::transport::ConnectionId;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use shared::{decode_payload, Opcode, ProtocolError};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Buffers that grew beyond this multiple of the nominal capacity are freed
/// instead of being kept on the free list.
const OVERSIZED_FACTOR: usize = 16;

struct PoolShared {
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
    capacity: usize,
    buffer_capacity: usize,
    allocated: AtomicU64,
    checked_out: AtomicU64,
    returned: AtomicU64,
    exhausted: AtomicU64,
}

impl PoolShared {
    fn recycle(&self, mut buf: Vec<u8>) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        if buf.capacity() <= self.buffer_capacity * OVERSIZED_FACTOR {
            buf.clear();
            let mut free = self.free.lock();
            if free.len() < self.capacity {
                free.push(buf);
            }
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub outstanding: usize,
    pub free: usize,
    pub allocated: u64,
    pub checked_out: u64,
    pub returned: u64,
    pub exhausted: u64,
}

#[derive(Clone)]
pub struct EnvelopePool {
    shared: Arc<PoolShared>,
}

impl EnvelopePool {
    pub fn new(config: &PoolConfig) -> Self {
        let preallocate = config.preallocate.min(config.max_envelopes);
        let free = (0..preallocate)
            .map(|_| Vec::with_capacity(config.buffer_capacity))
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                outstanding: AtomicUsize::new(0),
                capacity: config.max_envelopes,
                buffer_capacity: config.buffer_capacity,
                allocated: AtomicU64::new(preallocate as u64),
                checked_out: AtomicU64::new(0),
                returned: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Copies `payload` into a pooled envelope.
    pub fn checkout(
        &self,
        opcode: Opcode,
        connection: ConnectionId,
        payload: &[u8],
        arrival: Instant,
    ) -> Result<PacketEnvelope, PoolExhausted> {
        let shared = &self.shared;
        let reserved =
            shared
                .outstanding
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |outstanding| {
                    (outstanding < shared.capacity).then_some(outstanding + 1)
                });
        if let Err(outstanding) = reserved {
            shared.exhausted.fetch_add(1, Ordering::Relaxed);
            return Err(PoolExhausted {
                outstanding,
                capacity: shared.capacity,
            });
        }

        let recycled = shared.free.lock().pop();
        let mut buf = recycled.unwrap_or_else(|| {
            shared.allocated.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(shared.buffer_capacity)
        });
        buf.extend_from_slice(payload);
        shared.checked_out.fetch_add(1, Ordering::Relaxed);

        Ok(PacketEnvelope {
            opcode,
            connection,
            arrival,
            payload: buf,
            pool: Arc::clone(&self.shared),
        })
    }

    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            outstanding: self.outstanding(),
            free: self.shared.free.lock().len(),
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            checked_out: self.shared.checked_out.load(Ordering::Relaxed),
            returned: self.shared.returned.load(Ordering::Relaxed),
            exhausted: self.shared.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// One received message on its way to a handler.
pub struct PacketEnvelope {
    opcode: Opcode,
    connection: ConnectionId,
    arrival: Instant,
    payload: Vec<u8>,
    pool: Arc<PoolShared>,
}

impl PacketEnvelope {
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        decode_payload(&self.payload)
    }
}

impl Drop for PacketEnvelope {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.payload);
        self.pool.recycle(buf);
    }
}

impl fmt::Debug for PacketEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketEnvelope")
            .field("opcode", &self.opcode)
            .field("connection", &self.connection)
            .field("len", &self.payload.len())
            .finish()
    }
}
