//! The main loop.
//!
//! [`Engine`] owns every piece of session state and is the only thing that
//! mutates it. Receive tasks hand frames to [`InboundTriage`]; once per tick
//! the engine drains what triage queued, in this order:
//!
//! 1. every priority event queued when the tick started
//! 2. the coalescing map, in arrival order
//! 3. bulk traffic, until the network budget is spent
//!
//! then services the admission queue, expires stale sessions, advances the
//! simulation, flushes the broadcast outbox and reports the tick to the
//! overload governor.

use crate::admin;
use crate::admission::{self, LoginAdmission};
use crate::broadcast::{Broadcast, RelevanceBroadcaster};
use crate::config::ServerConfig;
use crate::connection::{ChecksumState, ConnectedGate, ConnectionTable, KickReason, SessionState};
use crate::envelope::{EnvelopePool, PacketEnvelope};
use crate::error::HandlerError;
use crate::governor::{OverloadGovernor, Transition};
use crate::handlers::{EngineControl, HandlerContext};
use crate::hooks::HookManager;
use crate::registry::{Counter, MessageTypeRegistry};
use crate::security::{PacketChecker, Verdict};
use crate::simulation::Simulation;
use crate::transport::{ConnectionId, Transport};
use crate::triage::{self, InboundEvent, InboundTriage, TriageReceiver};
use dashmap::DashSet;
use log::{debug, info, warn};
use shared::{encode_frame, AccessDenied, DenyReason, Opcode, ServerBusy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};

/// Builds a [`HandlerContext`] from disjoint engine fields, leaving the
/// registry and the triage receiver free to borrow alongside it.
macro_rules! context {
    ($engine:expr, $now:expr) => {
        HandlerContext {
            config: &$engine.config,
            connections: &mut $engine.connections,
            admission: &mut $engine.admission,
            broadcaster: &$engine.broadcaster,
            world: &mut *$engine.world,
            security: &mut $engine.security,
            outbox: &mut $engine.outbox,
            control: &mut $engine.control,
            pool: &$engine.pool,
            overloaded: $engine.governor.is_degraded(),
            tick: $engine.tick,
            now: $now,
        }
    };
}

/// Registry, pool and triage queues. Created before the transport so that
/// receive tasks can be handed an [`InboundTriage`] before the engine exists.
pub struct Inbound {
    registry: Arc<MessageTypeRegistry>,
    pool: EnvelopePool,
    gate: ConnectedGate,
    triage: InboundTriage,
    receiver: TriageReceiver,
}

impl Inbound {
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_registry(config, MessageTypeRegistry::with_builtin_handlers())
    }

    pub fn with_registry(config: &ServerConfig, registry: MessageTypeRegistry) -> Self {
        let registry = Arc::new(registry);
        let pool = EnvelopePool::new(&config.pool);
        let gate: ConnectedGate = Arc::new(DashSet::new());
        let (triage, receiver) = triage::channel(Arc::clone(&registry), pool.clone(), Arc::clone(&gate));
        Self {
            registry,
            pool,
            gate,
            triage,
            receiver,
        }
    }

    pub fn triage(&self) -> InboundTriage {
        self.triage.clone()
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub events: usize,
    pub coalesced: usize,
    pub bulk: usize,
    /// Bulk messages left queued for the next tick
    pub bulk_deferred: usize,
    pub broadcasts: usize,
    pub overran: bool,
    pub elapsed: Duration,
    pub transition: Option<Transition>,
    /// Handler errors written to the log this tick
    pub errors_logged: u32,
    /// Handler errors past the per-tick log budget
    pub errors_suppressed: u32,
}

/// Caps how many handler errors are logged per tick.
#[derive(Debug)]
struct ErrorBudget {
    limit: u32,
    logged: u32,
    suppressed: u32,
}

impl ErrorBudget {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            logged: 0,
            suppressed: 0,
        }
    }

    fn record(&mut self, opcode: Opcode, from: ConnectionId, err: &HandlerError) {
        if self.logged >= self.limit {
            self.suppressed += 1;
            return;
        }
        self.logged += 1;
        match err {
            HandlerError::Rejected(_) | HandlerError::UnknownConnection(_) => {
                debug!("{} from connection {} failed: {}", opcode.name(), from, err)
            }
            _ => warn!("{} from connection {} failed: {}", opcode.name(), from, err),
        }
    }

    /// Resets the budget, returning the logged and suppressed counts.
    fn finish_tick(&mut self, tick: u64) -> (u32, u32) {
        let counts = (self.logged, self.suppressed);
        if self.suppressed > 0 {
            warn!(
                "Tick {}: {} further handler error(s) not logged",
                tick, self.suppressed
            );
        }
        self.logged = 0;
        self.suppressed = 0;
        counts
    }
}

pub struct Engine {
    config: ServerConfig,
    registry: Arc<MessageTypeRegistry>,
    triage: InboundTriage,
    inbox: TriageReceiver,
    pool: EnvelopePool,
    connections: ConnectionTable,
    admission: LoginAdmission,
    broadcaster: RelevanceBroadcaster,
    world: Box<dyn Simulation>,
    hooks: HookManager,
    security: PacketChecker,
    governor: OverloadGovernor,
    errors: ErrorBudget,
    outbox: Vec<Broadcast>,
    control: EngineControl,
    tick: u64,
}

impl Engine {
    pub fn new(
        config: ServerConfig,
        inbound: Inbound,
        transport: Arc<dyn Transport>,
        world: Box<dyn Simulation>,
        admission: LoginAdmission,
    ) -> Self {
        let Inbound {
            registry,
            pool,
            gate,
            triage,
            receiver,
        } = inbound;

        Self {
            connections: ConnectionTable::new(config.max_connections(), gate),
            security: PacketChecker::new(&config.security),
            governor: OverloadGovernor::new(&config.overload),
            errors: ErrorBudget::new(config.tick.max_error_logs_per_tick),
            broadcaster: RelevanceBroadcaster::new(transport),
            registry,
            triage,
            inbox: receiver,
            pool,
            admission,
            world,
            hooks: HookManager::new(),
            outbox: Vec::new(),
            control: EngineControl::default(),
            tick: 0,
            config,
        }
    }

    /// Producer handle for receive tasks and the console.
    pub fn triage(&self) -> InboundTriage {
        self.triage.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &MessageTypeRegistry {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn admission(&self) -> &LoginAdmission {
        &self.admission
    }

    pub fn pool(&self) -> &EnvelopePool {
        &self.pool
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    /// Hooks registered here start at the beginning of the next tick.
    pub fn hooks_mut(&mut self) -> &mut HookManager {
        &mut self.hooks
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn is_overloaded(&self) -> bool {
        self.governor.is_degraded()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.control.shutdown_requested
    }

    /// Config file that `reloadsecurity` re-reads.
    pub fn set_config_path(&mut self, path: PathBuf) {
        self.control.config_path = Some(path);
    }

    /// Runs ticks at the configured rate until a shutdown is requested.
    /// Late ticks are delayed, never run back to back to catch up.
    pub async fn run(&mut self) {
        let mut ticker = interval(self.config.tick.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stats_every = u64::from(self.config.tick.tick_rate) * 60;

        info!(
            "Main loop running at {} Hz ({} ms network budget)",
            self.config.tick.tick_rate, self.config.tick.network_budget_ms
        );

        loop {
            ticker.tick().await;
            let report = self.run_tick();

            if stats_every > 0 && report.tick % stats_every == 0 {
                self.log_stats(&report);
            }
            if self.control.shutdown_requested {
                info!("Shutdown requested");
                break;
            }
        }
    }

    pub fn run_tick(&mut self) -> TickReport {
        self.run_tick_at(Instant::now())
    }

    /// Runs one tick with `now` as the session clock. The network budget is
    /// always measured against the real clock.
    pub fn run_tick_at(&mut self, now: Instant) -> TickReport {
        let started = Instant::now();
        self.tick += 1;
        self.hooks.start();
        let mut report = TickReport {
            tick: self.tick,
            ..TickReport::default()
        };

        // Events that arrive while draining wait for the next tick
        let pending = self.inbox.priority_depth();
        for _ in 0..pending {
            let Some(event) = self.inbox.try_next_priority() else {
                break;
            };
            self.handle_event(event, now);
            report.events += 1;
        }

        for envelope in self.inbox.take_coalesced() {
            self.dispatch(envelope, now);
            report.coalesced += 1;
        }

        let budget = self.config.tick.network_budget();
        while self.inbox.bulk_depth() > 0 {
            if started.elapsed() >= budget {
                report.overran = true;
                break;
            }
            let Some(envelope) = self.inbox.try_next_bulk() else {
                break;
            };
            self.dispatch(envelope, now);
            report.bulk += 1;
        }
        report.bulk_deferred = self.inbox.bulk_depth();
        if report.overran {
            debug!(
                "Tick {}: network budget spent after {} bulk message(s), {} deferred",
                self.tick, report.bulk, report.bulk_deferred
            );
        }

        admission::service_queue(&mut context!(self, now));
        self.expire_sessions(now);
        self.world.tick(self.tick, &mut self.outbox);
        self.hooks.tick(now);

        let mut outbox = std::mem::take(&mut self.outbox);
        for broadcast in outbox.drain(..) {
            self.broadcaster.deliver(&mut self.connections, &broadcast);
            report.broadcasts += 1;
        }
        self.outbox = outbox;

        report.elapsed = started.elapsed();
        report.overran |= report.elapsed > self.config.tick.tick_interval();
        report.transition = self.governor.record_tick(report.overran);
        if let Some(transition) = report.transition {
            self.announce_busy(transition == Transition::EnteredDegraded);
        }
        (report.errors_logged, report.errors_suppressed) = self.errors.finish_tick(self.tick);
        report
    }

    fn handle_event(&mut self, event: InboundEvent, now: Instant) {
        match event {
            InboundEvent::Connected { connection, peer } => self.accept(connection, peer, now),
            InboundEvent::Packet(envelope) => self.dispatch(envelope, now),
            InboundEvent::Disconnected { connection, reason } => {
                context!(self, now).disconnect(connection, KickReason::TransportClosed(reason));
            }
            InboundEvent::Kick { connection, reason } => {
                context!(self, now).disconnect(connection, reason);
            }
            InboundEvent::Console { command, reply } => {
                let text = admin::execute(&mut context!(self, now), &command, "console");
                match reply {
                    Some(reply) => {
                        let _ = reply.send(text);
                    }
                    None => info!("{}", text),
                }
            }
        }
    }

    fn accept(&mut self, connection: ConnectionId, peer: String, now: Instant) {
        let grace = now + self.config.admission.login_grace();
        if self.connections.insert(connection, peer.clone(), now, grace).is_some() {
            info!("Connection {} opened from {}", connection, peer);
            return;
        }

        warn!(
            "Connection table full ({} entries), refusing {}",
            self.connections.capacity(),
            peer
        );
        let transport = self.broadcaster.transport();
        let denied = AccessDenied {
            slot: 0,
            reason: DenyReason::ServerFull.code(),
        };
        match encode_frame(Opcode::AccessDenied, &denied) {
            Ok(frame) => transport.send(connection, &frame),
            Err(e) => warn!("Failed to encode refusal for {}: {}", connection, e),
        }
        transport.force_disconnect(connection, &denied.reason);
    }

    fn dispatch(&mut self, envelope: PacketEnvelope, now: Instant) {
        let opcode = envelope.opcode();
        let from = envelope.connection();

        let Some(connection) = self.connections.get_mut(from) else {
            // Connection went away after triage accepted the frame
            self.registry.record(opcode, Counter::Stale);
            return;
        };
        connection.last_seen = now;
        let pre_login = self
            .registry
            .lookup(opcode as u16)
            .is_some_and(|kind| kind.pre_login);
        if !pre_login && !connection.is_fully_connected() {
            self.registry.record(opcode, Counter::Stale);
            return;
        }

        let verdict = match self.connections.get(from) {
            Some(connection) => self.security.inspect(
                connection,
                &self.connections,
                &envelope,
                self.config.session.pvp_enabled,
            ),
            None => Verdict::Pass,
        };
        match verdict {
            Verdict::Pass => {}
            Verdict::Ignore { notice, .. } => {
                self.registry.record(opcode, Counter::Rejected);
                if let Some(notice) = notice {
                    context!(self, now).notify_staff(&notice);
                }
                return;
            }
            Verdict::Kick {
                check,
                message,
                notice,
            } => {
                self.registry.record(opcode, Counter::Rejected);
                let mut ctx = context!(self, now);
                if let Some(notice) = notice {
                    ctx.notify_staff(&notice);
                }
                ctx.disconnect(
                    from,
                    KickReason::Security {
                        check: check.to_string(),
                        message,
                    },
                );
                return;
            }
        }

        let Some(handler) = self.registry.handler(opcode) else {
            self.registry.record(opcode, Counter::Dropped);
            debug!("No handler for {} from connection {}", opcode.name(), from);
            return;
        };
        let result = handler.handle(&mut context!(self, now), &envelope);

        match result {
            Ok(()) => self.registry.record(opcode, Counter::Processed),
            Err(err) => {
                self.registry.record(opcode, Counter::Failed);
                self.errors.record(opcode, from, &err);
                if err.is_protocol_violation() {
                    context!(self, now)
                        .disconnect(from, KickReason::ProtocolViolation(err.to_string()));
                }
            }
        }
    }

    /// Login grace for connections still logging in, keep-alive for everyone
    /// else, and the grace period for a mismatched content checksum.
    /// Queued connections are timed out by the admission queue instead.
    fn expire_sessions(&mut self, now: Instant) {
        let keepalive = self.config.session.keepalive_timeout();
        let checksum_grace = self.config.session.checksum_grace();

        let mut expired = Vec::new();
        for connection in self.connections.iter() {
            let reason = match (&connection.admission, connection.checksum) {
                (Some(_), _) if connection.state == SessionState::AdmissionQueued => None,
                (Some(record), _) if now >= record.grace_deadline => Some(KickReason::Denied {
                    slot: 0,
                    reason: DenyReason::LoginTimeout,
                }),
                (Some(_), _) => None,
                (None, _) if now.duration_since(connection.last_seen) >= keepalive => {
                    Some(KickReason::Timeout)
                }
                (None, ChecksumState::Different { since })
                    if now.duration_since(since) >= checksum_grace =>
                {
                    Some(KickReason::ChecksumMismatch)
                }
                _ => None,
            };
            if let Some(reason) = reason {
                expired.push((connection.id, reason));
            }
        }

        let mut ctx = context!(self, now);
        for (id, reason) in expired {
            ctx.disconnect(id, reason);
        }
    }

    fn announce_busy(&mut self, busy: bool) {
        match Broadcast::everyone(Opcode::ServerBusy, &ServerBusy { busy }) {
            Ok(broadcast) => {
                let told = self.broadcaster.deliver(&mut self.connections, &broadcast);
                debug!("Told {} connection(s) the server busy state is {}", told, busy);
            }
            Err(e) => warn!("Failed to encode busy notice: {}", e),
        }
    }

    fn log_stats(&self, report: &TickReport) {
        let pool = self.pool.stats();
        info!(
            "Tick {}: {} connection(s), {} player(s), {} queued, pool {}/{}, pressure {}",
            report.tick,
            self.connections.len(),
            self.connections.player_count(),
            self.admission.queue_len(),
            pool.outstanding,
            self.pool.capacity(),
            self.governor.pressure()
        );
        for (opcode, counters) in self.registry.snapshot() {
            if counters.received > 0 {
                debug!("  {:<18} {:?}", opcode.name(), counters);
            }
        }
    }

    /// Kicks every connection with `ServerShutdown`.
    pub fn shutdown(&mut self) {
        self.hooks.shutdown();
        let ids = self.connections.ids();
        let count = ids.len();
        let mut ctx = context!(self, Instant::now());
        for id in ids {
            ctx.disconnect(id, KickReason::ServerShutdown);
        }
        info!("Engine stopped after {} ticks, {} connection(s) closed", self.tick, count);
    }
}
