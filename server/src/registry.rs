//! Message type registry.
//!
//! Maps each inbound opcode to its traffic class, pre-login allowance,
//! handler and counters. The registry is built before the engine
//! starts and then shared read-only between the receive tasks (which classify
//! with it) and the main loop (which dispatches through it). Counters are
//! atomics so both sides can record into them.

use crate::handlers::{self, Handler};
use shared::Opcode;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which inbound queue a message type is triaged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficClass {
    /// Processed in full every tick
    Priority,
    /// Drained while the network budget lasts
    Bulk,
    /// Only the newest message per (connection, slot, kind) is kept
    Coalesce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType {
    pub opcode: Opcode,
    pub class: TrafficClass,
    /// May arrive before the connection is fully connected
    pub pre_login: bool,
}

impl MessageType {
    pub fn priority(opcode: Opcode) -> Self {
        Self {
            opcode,
            class: TrafficClass::Priority,
            pre_login: false,
        }
    }

    pub fn with_class(mut self, class: TrafficClass) -> Self {
        self.class = class;
        self
    }

    pub fn allowed_before_login(mut self) -> Self {
        self.pre_login = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Received,
    Processed,
    Failed,
    /// Superseded in the coalescing map before being dispatched
    Coalesced,
    /// Lost to pool exhaustion
    Dropped,
    /// Refused by triage or a security check
    Rejected,
    /// Connection was gone by the time the message was dispatched
    Stale,
}

#[derive(Default)]
pub struct MessageCounters {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    coalesced: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    stale: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub coalesced: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub stale: u64,
}

impl MessageCounters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Received => &self.received,
            Counter::Processed => &self.processed,
            Counter::Failed => &self.failed,
            Counter::Coalesced => &self.coalesced,
            Counter::Dropped => &self.dropped,
            Counter::Rejected => &self.rejected,
            Counter::Stale => &self.stale,
        }
    }

    pub fn record(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

struct Entry {
    kind: MessageType,
    handler: Option<Box<dyn Handler>>,
    counters: MessageCounters,
}

pub struct MessageTypeRegistry {
    entries: HashMap<u16, Entry>,
}

impl MessageTypeRegistry {
    /// Registry with no message types at all.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Every inbound message type with the built-in handlers attached.
    pub fn with_builtin_handlers() -> Self {
        let mut registry = Self::empty();
        for kind in inbound_types() {
            registry.declare(kind);
        }
        handlers::register_builtin(&mut registry);
        registry
    }

    /// Adds or replaces a type's flags, keeping any handler already attached.
    pub fn declare(&mut self, kind: MessageType) {
        self.entries
            .entry(kind.opcode.as_u16())
            .and_modify(|entry| entry.kind = kind)
            .or_insert_with(|| Entry {
                kind,
                handler: None,
                counters: MessageCounters::default(),
            });
    }

    /// Attaches a handler. Undeclared opcodes are declared as priority traffic.
    pub fn register(&mut self, opcode: Opcode, handler: impl Handler + 'static) {
        let entry = self
            .entries
            .entry(opcode.as_u16())
            .or_insert_with(|| Entry {
                kind: MessageType::priority(opcode),
                handler: None,
                counters: MessageCounters::default(),
            });
        entry.handler = Some(Box::new(handler));
    }

    pub fn lookup(&self, raw: u16) -> Option<&MessageType> {
        self.entries.get(&raw).map(|entry| &entry.kind)
    }

    pub fn handler(&self, opcode: Opcode) -> Option<&dyn Handler> {
        self.entries
            .get(&opcode.as_u16())
            .and_then(|entry| entry.handler.as_deref())
    }

    pub fn record(&self, opcode: Opcode, counter: Counter) {
        if let Some(entry) = self.entries.get(&opcode.as_u16()) {
            entry.counters.record(counter);
        }
    }

    pub fn counters(&self, opcode: Opcode) -> CounterSnapshot {
        self.entries
            .get(&opcode.as_u16())
            .map(|entry| entry.counters.snapshot())
            .unwrap_or_default()
    }

    /// Counter snapshots for every declared type, ordered by opcode.
    pub fn snapshot(&self) -> Vec<(Opcode, CounterSnapshot)> {
        let mut all: Vec<_> = self
            .entries
            .values()
            .map(|entry| (entry.kind.opcode, entry.counters.snapshot()))
            .collect();
        all.sort_by_key(|(opcode, _)| *opcode);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MessageTypeRegistry {
    fn default() -> Self {
        Self::with_builtin_handlers()
    }
}

impl fmt::Debug for MessageTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTypeRegistry")
            .field("types", &self.entries.len())
            .finish()
    }
}

/// The inbound message types a client may send.
fn inbound_types() -> Vec<MessageType> {
    vec![
        MessageType::priority(Opcode::Login).allowed_before_login(),
        MessageType::priority(Opcode::Ping).allowed_before_login(),
        MessageType::priority(Opcode::ScoreboardProbe).allowed_before_login(),
        MessageType::priority(Opcode::TransportProbeAck).allowed_before_login(),
        MessageType::priority(Opcode::PlayerUpdate).with_class(TrafficClass::Coalesce),
        MessageType::priority(Opcode::VehiclePhysics).with_class(TrafficClass::Bulk),
        MessageType::priority(Opcode::PlayerDeath),
        MessageType::priority(Opcode::Checksum),
        MessageType::priority(Opcode::ChatMessage),
        MessageType::priority(Opcode::Teleport),
        MessageType::priority(Opcode::TreatPlayer),
        MessageType::priority(Opcode::HitCharacter),
        MessageType::priority(Opcode::WorldSound),
        MessageType::priority(Opcode::AdminCommand),
        MessageType::priority(Opcode::Quit),
    ]
}
